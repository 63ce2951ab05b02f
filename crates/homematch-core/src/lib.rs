//! Core domain model for the homematch search worker.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub const CRATE_NAME: &str = "homematch-core";

/// Separator between the profile id and the listing id in a [`MatchKey`].
pub const MATCH_KEY_SEPARATOR: char = '#';

/// Structured search criteria attached to a search profile.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchCriteria {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_price: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_price: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bedrooms: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bathrooms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub zip_codes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPreferences {
    pub email: bool,
    #[serde(default)]
    pub sms: bool,
    #[serde(default)]
    pub push: bool,
}

impl Default for NotificationPreferences {
    fn default() -> Self {
        Self {
            email: true,
            sms: false,
            push: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchProfile {
    pub profile_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub criteria: SearchCriteria,
    #[serde(default)]
    pub monitoring: bool,
    #[serde(default)]
    pub notification_preferences: NotificationPreferences,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// External site a user prefers for opening listings.
///
/// Values the worker does not know deserialize to [`PlatformPreference::Unrecognized`]
/// and are treated like an unset preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformPreference {
    Zillow,
    Redfin,
    Realtor,
    #[serde(other)]
    Unrecognized,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub user_id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default)]
    pub search_profiles: Vec<SearchProfile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listing_viewing_preference: Option<PlatformPreference>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserProfile {
    pub fn monitored_profiles(&self) -> impl Iterator<Item = &SearchProfile> {
        self.search_profiles.iter().filter(|p| p.monitoring)
    }

    pub fn search_profile(&self, profile_id: &str) -> Option<&SearchProfile> {
        self.search_profiles
            .iter()
            .find(|p| p.profile_id == profile_id)
    }

    /// Contact address, ignoring blank values.
    pub fn contact_email(&self) -> Option<&str> {
        self.email
            .as_deref()
            .map(str::trim)
            .filter(|email| !email.is_empty())
    }
}

/// Normalized provider listing. Fields the provider did not send stay `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Listing {
    pub listing_id: String,
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bedrooms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bathrooms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sqft: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listing_url: Option<String>,
    #[serde(default)]
    pub raw_data: JsonValue,
}

/// Deduplication identity of a match within one user: `profileId#listingId`.
///
/// Treated as an opaque, order-sensitive string once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatchKey(String);

impl MatchKey {
    pub fn new(profile_id: &str, listing_id: &str) -> Self {
        Self(format!("{profile_id}{MATCH_KEY_SEPARATOR}{listing_id}"))
    }

    /// Prefix shared by every key of one search profile.
    pub fn profile_prefix(profile_id: &str) -> String {
        format!("{profile_id}{MATCH_KEY_SEPARATOR}")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for MatchKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for MatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A listing recorded as a match for one user's search profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub user_id: String,
    #[serde(rename = "profileIdListingId")]
    pub match_key: MatchKey,
    pub profile_id: String,
    pub listing_id: String,
    pub listing_data: Listing,
    pub matched_at: DateTime<Utc>,
    pub notified: bool,
}

impl SearchResult {
    /// Fresh, not yet notified match for `listing`.
    pub fn new_match(
        user_id: &str,
        profile_id: &str,
        listing: Listing,
        matched_at: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: user_id.to_string(),
            match_key: MatchKey::new(profile_id, &listing.listing_id),
            profile_id: profile_id.to_string(),
            listing_id: listing.listing_id.clone(),
            listing_data: listing,
            matched_at,
            notified: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationType {
    NewListing,
    ViewingRequest,
    ViewingConfirmation,
    ViewingFeedbackRequest,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NewListing => "new_listing",
            Self::ViewingRequest => "viewing_request",
            Self::ViewingConfirmation => "viewing_confirmation",
            Self::ViewingFeedbackRequest => "viewing_feedback_request",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannel {
    Email,
    Sms,
    Push,
}

impl NotificationChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Sms => "sms",
            Self::Push => "push",
        }
    }
}

/// Audit record of one outbound message. Never updated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub user_id: String,
    pub notification_id: Uuid,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub channel: NotificationChannel,
    pub recipient_address: String,
    pub subject: String,
    pub sent_at: DateTime<Utc>,
    pub status: String,
}

impl Notification {
    pub fn sent(
        user_id: &str,
        kind: NotificationType,
        channel: NotificationChannel,
        recipient_address: &str,
        subject: &str,
        sent_at: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id: user_id.to_string(),
            notification_id: Uuid::new_v4(),
            kind,
            channel,
            recipient_address: recipient_address.to_string(),
            subject: subject.to_string(),
            sent_at,
            status: "sent".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewingStatus {
    Requested,
    Confirmed,
    Completed,
    Cancelled,
}

impl ViewingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::Confirmed => "confirmed",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewingFeedback {
    /// 1 (poor) to 5 (excellent).
    pub rating: u8,
    pub notes: String,
    pub would_make_offer: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Viewing {
    pub user_id: String,
    pub viewing_id: String,
    pub listing_id: String,
    pub profile_id: String,
    pub listing_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    pub requested_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proposed_date_time: Option<DateTime<Utc>>,
    pub status: ViewingStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<ViewingFeedback>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback_requested_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback_collected_at: Option<DateTime<Utc>>,
}

impl Viewing {
    /// Viewing took place before `now`, has no feedback and was never asked for it.
    pub fn awaits_feedback_request(&self, now: DateTime<Utc>) -> bool {
        self.feedback.is_none()
            && self.feedback_requested_at.is_none()
            && self.proposed_date_time.is_some_and(|at| at < now)
    }
}

/// Trigger for one worker run. Without a `user_id` the run is a full cron sweep.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profile_id: Option<String>,
}

impl WorkRequest {
    pub fn cron() -> Self {
        Self::default()
    }

    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            profile_id: None,
        }
    }

    pub fn for_profile(user_id: impl Into<String>, profile_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            profile_id: Some(profile_id.into()),
        }
    }

    pub fn is_targeted(&self) -> bool {
        self.user_id.as_deref().is_some_and(|id| !id.is_empty())
    }
}
