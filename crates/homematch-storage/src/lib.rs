//! Persistence contracts for profiles, matches, notifications and viewings.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use homematch_core::{MatchKey, Notification, SearchResult, UserProfile, Viewing};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const CRATE_NAME: &str = "homematch-storage";

/// Hard upper bound on records per batch write.
pub const MAX_BATCH_WRITE: usize = 25;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("batch of {size} records exceeds the write ceiling of {MAX_BATCH_WRITE}")]
    BatchTooLarge { size: usize },
    #[error("encoding record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("undecodable {kind} record {key}: {reason}")]
    Decode {
        kind: &'static str,
        key: String,
        reason: String,
    },
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// One page of a profile scan plus the key to continue from.
///
/// The continuation key follows the raw rows, so undecodable profiles are
/// counted in `skipped` without stalling the scan.
#[derive(Debug, Clone, Default)]
pub struct ProfilePage {
    pub profiles: Vec<UserProfile>,
    pub skipped: usize,
    pub next_start_after: Option<String>,
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>, StoreError>;

    /// Profiles ordered by user id, strictly after `start_after`.
    async fn scan_profiles(
        &self,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<ProfilePage, StoreError>;

    async fn contact_email(&self, user_id: &str) -> Result<Option<String>, StoreError>;
}

#[async_trait]
pub trait MatchStore: Send + Sync {
    /// Keys of every recorded match of `profile_id` for `user_id`.
    async fn existing_keys(
        &self,
        user_id: &str,
        profile_id: &str,
    ) -> Result<HashSet<MatchKey>, StoreError>;

    /// Write at most [`MAX_BATCH_WRITE`] results. Keys already present are left untouched.
    async fn put_batch(&self, results: &[SearchResult]) -> Result<(), StoreError>;

    /// Flip `notified` to true. Returns false when it already was.
    async fn mark_notified(&self, user_id: &str, key: &MatchKey) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait NotificationLog: Send + Sync {
    async fn append(&self, notification: &Notification) -> Result<(), StoreError>;
}

#[async_trait]
pub trait ViewingStore: Send + Sync {
    /// Viewings past their proposed time with neither feedback nor a prior request.
    async fn pending_feedback(&self, now: DateTime<Utc>) -> Result<Vec<Viewing>, StoreError>;

    /// Set `feedbackRequestedAt` unless already set. Returns whether it was written.
    async fn mark_feedback_requested(
        &self,
        user_id: &str,
        viewing_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;
}

/// Store handles shared by the worker, built once per process.
#[derive(Clone)]
pub struct Stores {
    pub profiles: Arc<dyn ProfileStore>,
    pub matches: Arc<dyn MatchStore>,
    pub notifications: Arc<dyn NotificationLog>,
    pub viewings: Arc<dyn ViewingStore>,
}

impl Stores {
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: ProfileStore + MatchStore + NotificationLog + ViewingStore + 'static,
    {
        Self {
            profiles: backend.clone(),
            matches: backend.clone(),
            notifications: backend.clone(),
            viewings: backend,
        }
    }
}

pub fn ensure_batch_ceiling(results: &[SearchResult]) -> Result<(), StoreError> {
    if results.len() > MAX_BATCH_WRITE {
        return Err(StoreError::BatchTooLarge {
            size: results.len(),
        });
    }
    Ok(())
}

/// Remove `null` members from objects, recursively.
pub fn strip_nulls(value: JsonValue) -> JsonValue {
    match value {
        JsonValue::Object(map) => JsonValue::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, strip_nulls(v)))
                .collect(),
        ),
        JsonValue::Array(items) => JsonValue::Array(items.into_iter().map(strip_nulls).collect()),
        other => other,
    }
}

/// Decode a stored JSON document of type `T`.
pub fn decode_document<T: DeserializeOwned>(
    kind: &'static str,
    key: &str,
    doc: JsonValue,
) -> Result<T, StoreError> {
    serde_json::from_value(doc).map_err(|e| StoreError::Decode {
        kind,
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Keep the records that decoded. Each failure is logged and counted.
pub fn keep_decoded<T>(
    rows: impl IntoIterator<Item = (String, Result<T, StoreError>)>,
) -> (Vec<T>, usize) {
    let mut kept = Vec::new();
    let mut skipped = 0usize;
    for (key, decoded) in rows {
        match decoded {
            Ok(record) => kept.push(record),
            Err(err) => {
                warn!(key = %key, error = %err, "skipping undecodable record");
                skipped += 1;
            }
        }
    }
    (kept, skipped)
}

/// Storage document for a search result with absent fields stripped.
pub fn encode_search_result(result: &SearchResult) -> Result<JsonValue, StoreError> {
    Ok(strip_nulls(serde_json::to_value(result)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use homematch_core::Listing;
    use serde_json::json;

    fn result(listing_id: &str) -> SearchResult {
        let listing = Listing {
            listing_id: listing_id.to_string(),
            address: "5 Elm St, Austin, TX".to_string(),
            price: None,
            bedrooms: Some(3.0),
            bathrooms: None,
            sqft: None,
            agent_name: None,
            agent_email: None,
            latitude: None,
            longitude: None,
            listing_url: None,
            raw_data: json!({"id": listing_id, "squareFootage": null, "hoa": {"fee": null}}),
        };
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().unwrap();
        SearchResult::new_match("U", "P", listing, at)
    }

    #[test]
    fn strip_nulls_recurses_into_objects_and_arrays() {
        let stripped = strip_nulls(json!({
            "a": null,
            "b": {"c": null, "d": 1},
            "e": [{"f": null}, 2],
        }));
        assert_eq!(stripped, json!({"b": {"d": 1}, "e": [{}, 2]}));
    }

    #[test]
    fn encoded_result_has_no_nulls() {
        let doc = encode_search_result(&result("L1")).unwrap();
        assert_eq!(doc["profileIdListingId"], "P#L1");
        assert_eq!(doc["notified"], false);
        assert!(doc["listingData"].get("price").is_none());
        assert!(doc["listingData"]["rawData"].get("squareFootage").is_none());
        assert_eq!(doc["listingData"]["rawData"]["hoa"], json!({}));
    }

    #[test]
    fn undecodable_records_are_skipped_not_fatal() {
        let good = json!({
            "userId": "u1",
            "createdAt": "2026-03-01T08:00:00Z",
            "updatedAt": "2026-03-01T08:00:00Z"
        });
        let fractional_bedrooms = json!({
            "userId": "u2",
            "searchProfiles": [{
                "profileId": "P",
                "name": "Lofts",
                "criteria": {"bedrooms": 2.5},
                "monitoring": true,
                "createdAt": "2026-03-01T08:00:00Z",
                "updatedAt": "2026-03-01T08:00:00Z"
            }],
            "createdAt": "2026-03-01T08:00:00Z",
            "updatedAt": "2026-03-01T08:00:00Z"
        });
        let rows = [("u1", good), ("u2", fractional_bedrooms)].map(|(key, doc)| {
            (
                key.to_string(),
                decode_document::<UserProfile>("profile", key, doc),
            )
        });

        let (kept, skipped) = keep_decoded(rows);
        assert_eq!(skipped, 1);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].user_id, "u1");
    }

    #[test]
    fn decode_errors_name_the_record() {
        let err = decode_document::<UserProfile>("profile", "u9", json!({"userId": "u9"}))
            .unwrap_err();
        assert!(matches!(
            &err,
            StoreError::Decode { kind: "profile", key, .. } if key == "u9"
        ));
        assert!(err.to_string().contains("createdAt"));
    }

    #[test]
    fn batch_ceiling_is_enforced() {
        let ok: Vec<_> = (0..MAX_BATCH_WRITE).map(|i| result(&format!("L{i}"))).collect();
        assert!(ensure_batch_ceiling(&ok).is_ok());

        let too_many: Vec<_> = (0..=MAX_BATCH_WRITE).map(|i| result(&format!("L{i}"))).collect();
        assert!(matches!(
            ensure_batch_ceiling(&too_many),
            Err(StoreError::BatchTooLarge { size: 26 })
        ));
    }
}
