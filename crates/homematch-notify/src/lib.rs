//! Notification rendering and delivery for match and feedback emails.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use askama::Template;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use homematch_core::{
    Listing, MatchKey, Notification, NotificationChannel, NotificationPreferences,
    NotificationType, SearchProfile, UserProfile, Viewing,
};
use homematch_storage::{MatchStore, NotificationLog, StoreError};
use reqwest::Url;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "homematch-notify";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("rendering template: {0}")]
    Render(#[from] askama::Error),
    #[error("invalid url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("email request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("email service returned http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedEmail {
    pub subject: String,
    pub html: String,
}

#[derive(Template)]
#[template(path = "new_listing.html")]
struct NewListingTemplate<'a> {
    profile_name: Option<&'a str>,
    address: &'a str,
    price: Option<String>,
    bedrooms: Option<String>,
    bathrooms: Option<String>,
    size: Option<String>,
    listing_url: Option<&'a str>,
    chat_url: &'a str,
}

#[derive(Template)]
#[template(path = "feedback_request.html")]
struct FeedbackRequestTemplate<'a> {
    address: &'a str,
    viewed_on: Option<String>,
    feedback_url: &'a str,
}

/// `$1,234,567` style dollar amount.
pub fn format_usd(amount: u64) -> String {
    let digits = amount.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3 + 1);
    out.push('$');
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}

pub fn render_new_listing(
    listing: &Listing,
    profile_name: Option<&str>,
    chat_url: &str,
) -> Result<RenderedEmail, NotifyError> {
    let price = listing.price.map(format_usd);
    let subject = match &price {
        Some(price) => format!("New match: {} - {price}", listing.address),
        None => format!("New match: {}", listing.address),
    };
    let html = NewListingTemplate {
        profile_name: profile_name.map(str::trim).filter(|n| !n.is_empty()),
        address: &listing.address,
        price,
        bedrooms: listing.bedrooms.map(|n| n.to_string()),
        bathrooms: listing.bathrooms.map(|n| n.to_string()),
        size: listing.sqft.map(|n| format_usd(n).trim_start_matches('$').to_string()),
        listing_url: listing.listing_url.as_deref(),
        chat_url,
    }
    .render()?;
    Ok(RenderedEmail { subject, html })
}

/// Chat link that opens the feedback flow for one viewing.
pub fn feedback_url(chat_url: &str, viewing_id: &str) -> Result<String, NotifyError> {
    let mut url = Url::parse(chat_url).map_err(|e| NotifyError::InvalidUrl {
        url: chat_url.to_string(),
        reason: e.to_string(),
    })?;
    url.query_pairs_mut().append_pair("feedback", viewing_id);
    Ok(url.into())
}

pub fn render_feedback_request(
    viewing: &Viewing,
    chat_url: &str,
) -> Result<RenderedEmail, NotifyError> {
    let feedback_url = feedback_url(chat_url, &viewing.viewing_id)?;
    let html = FeedbackRequestTemplate {
        address: &viewing.listing_address,
        viewed_on: viewing
            .proposed_date_time
            .map(|at| at.format("%B %-d, %Y").to_string()),
        feedback_url: &feedback_url,
    }
    .render()?;
    Ok(RenderedEmail {
        subject: format!("How was your viewing at {}?", viewing.listing_address),
        html,
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub html: String,
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, message: &EmailMessage) -> Result<(), NotifyError>;
}

#[derive(Debug, Clone)]
pub struct EmailServiceConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub from: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Serialize)]
struct EmailServiceRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    from: Option<&'a str>,
    to: &'a str,
    subject: &'a str,
    html: &'a str,
}

/// Posts `{from?, to, subject, html}` JSON to the email delivery service.
#[derive(Debug)]
pub struct HttpEmailSender {
    client: reqwest::Client,
    endpoint: Url,
    api_key: Option<String>,
    from: Option<String>,
}

impl HttpEmailSender {
    pub fn new(config: EmailServiceConfig) -> anyhow::Result<Self> {
        let endpoint = Url::parse(&config.endpoint)
            .with_context(|| format!("parsing email endpoint {}", config.endpoint))?;
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            endpoint,
            api_key: config.api_key,
            from: config.from,
        })
    }
}

#[async_trait]
impl EmailSender for HttpEmailSender {
    async fn send(&self, message: &EmailMessage) -> Result<(), NotifyError> {
        let body = EmailServiceRequest {
            from: self.from.as_deref(),
            to: &message.to,
            subject: &message.subject,
            html: &message.html,
        };
        let mut request = self.client.post(self.endpoint.clone()).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(NotifyError::HttpStatus {
                status: status.as_u16(),
                url: self.endpoint.to_string(),
            });
        }
        Ok(())
    }
}

/// Logs messages instead of delivering them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogEmailSender;

#[async_trait]
impl EmailSender for LogEmailSender {
    async fn send(&self, message: &EmailMessage) -> Result<(), NotifyError> {
        info!(to = %message.to, subject = %message.subject, "dry run: email not sent");
        Ok(())
    }
}

/// Email first, then sms, then push.
pub fn preferred_channel(prefs: &NotificationPreferences) -> Option<NotificationChannel> {
    if prefs.email {
        Some(NotificationChannel::Email)
    } else if prefs.sms {
        Some(NotificationChannel::Sms)
    } else if prefs.push {
        Some(NotificationChannel::Push)
    } else {
        None
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchReport {
    pub sent: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct Dispatcher {
    email: Arc<dyn EmailSender>,
    matches: Arc<dyn MatchStore>,
    log: Arc<dyn NotificationLog>,
    chat_url: String,
}

impl Dispatcher {
    pub fn new(
        email: Arc<dyn EmailSender>,
        matches: Arc<dyn MatchStore>,
        log: Arc<dyn NotificationLog>,
        chat_url: impl Into<String>,
    ) -> Self {
        Self {
            email,
            matches,
            log,
            chat_url: chat_url.into(),
        }
    }

    /// Notify `user` about each new listing independently.
    ///
    /// A listing whose delivery fails keeps `notified=false` and gets no audit record.
    pub async fn dispatch_matches(
        &self,
        user: &UserProfile,
        profile: &SearchProfile,
        listings: &[Listing],
        sent_at: DateTime<Utc>,
    ) -> DispatchReport {
        let mut report = DispatchReport::default();
        if listings.is_empty() {
            return report;
        }

        let channel = preferred_channel(&profile.notification_preferences);
        let recipient = match channel {
            Some(NotificationChannel::Email) => match user.contact_email() {
                Some(email) => email,
                None => {
                    info!(
                        user_id = %user.user_id,
                        profile_id = %profile.profile_id,
                        "no email address on file; skipping match notifications"
                    );
                    report.skipped = listings.len();
                    return report;
                }
            },
            Some(other) => {
                info!(
                    user_id = %user.user_id,
                    profile_id = %profile.profile_id,
                    channel = other.as_str(),
                    "channel not implemented; skipping match notifications"
                );
                report.skipped = listings.len();
                return report;
            }
            None => {
                debug!(
                    user_id = %user.user_id,
                    profile_id = %profile.profile_id,
                    "all notification channels disabled"
                );
                report.skipped = listings.len();
                return report;
            }
        };

        for listing in listings {
            let span = info_span!("notify_match", listing_id = %listing.listing_id);
            match self
                .notify_listing(user, profile, listing, recipient, sent_at)
                .instrument(span)
                .await
            {
                Ok(()) => report.sent += 1,
                Err(err) => {
                    warn!(
                        user_id = %user.user_id,
                        profile_id = %profile.profile_id,
                        listing_id = %listing.listing_id,
                        error = %err,
                        "match notification failed"
                    );
                    report.failed += 1;
                }
            }
        }
        report
    }

    async fn notify_listing(
        &self,
        user: &UserProfile,
        profile: &SearchProfile,
        listing: &Listing,
        recipient: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<(), NotifyError> {
        let rendered = render_new_listing(listing, Some(&profile.name), &self.chat_url)?;
        self.email
            .send(&EmailMessage {
                to: recipient.to_string(),
                subject: rendered.subject.clone(),
                html: rendered.html,
            })
            .await?;

        let key = MatchKey::new(&profile.profile_id, &listing.listing_id);
        if !self.matches.mark_notified(&user.user_id, &key).await? {
            debug!(match_key = %key, "match was already flagged as notified");
        }

        self.log
            .append(&Notification::sent(
                &user.user_id,
                NotificationType::NewListing,
                NotificationChannel::Email,
                recipient,
                &rendered.subject,
                sent_at,
            ))
            .await?;
        Ok(())
    }

    /// Email a feedback request for `viewing` and return its audit record, not yet appended.
    pub async fn send_feedback_request(
        &self,
        viewing: &Viewing,
        recipient: &str,
        sent_at: DateTime<Utc>,
    ) -> Result<Notification, NotifyError> {
        let rendered = render_feedback_request(viewing, &self.chat_url)?;
        self.email
            .send(&EmailMessage {
                to: recipient.to_string(),
                subject: rendered.subject.clone(),
                html: rendered.html,
            })
            .await?;
        Ok(Notification::sent(
            &viewing.user_id,
            NotificationType::ViewingFeedbackRequest,
            NotificationChannel::Email,
            recipient,
            &rendered.subject,
            sent_at,
        ))
    }

    pub async fn record(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.log.append(notification).await?;
        Ok(())
    }
}
