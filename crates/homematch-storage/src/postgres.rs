//! Postgres backend.

use std::collections::HashSet;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use homematch_core::{
    MatchKey, Notification, PlatformPreference, SearchProfile, SearchResult, UserProfile, Viewing,
    ViewingFeedback, ViewingStatus,
};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder, Row};
use tracing::debug;

use crate::{
    encode_search_result, ensure_batch_ceiling, keep_decoded, MatchStore, NotificationLog,
    ProfilePage, ProfileStore, StoreError, ViewingStore,
};

const PROFILE_COLUMNS: &str = "user_id, email, first_name, last_name, phone, \
     listing_viewing_preference, search_profiles, created_at, updated_at";

const VIEWING_COLUMNS: &str = "user_id, viewing_id, listing_id, profile_id, listing_address, \
     agent_email, agent_name, requested_at, proposed_date_time, status, feedback, \
     feedback_requested_at, feedback_collected_at";

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Decode a text column through the serde representation of `T`.
fn parse_text_enum<T: DeserializeOwned>(raw: &str) -> Result<T, StoreError> {
    Ok(serde_json::from_value(JsonValue::String(raw.to_string()))?)
}

fn profile_from_row(row: &PgRow) -> Result<UserProfile, StoreError> {
    let preference: Option<String> = row.try_get("listing_viewing_preference")?;
    let listing_viewing_preference = preference
        .as_deref()
        .map(parse_text_enum::<PlatformPreference>)
        .transpose()?;
    let Json(search_profiles): Json<Vec<SearchProfile>> = row.try_get("search_profiles")?;
    Ok(UserProfile {
        user_id: row.try_get("user_id")?,
        email: row.try_get("email")?,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        phone: row.try_get("phone")?,
        search_profiles,
        listing_viewing_preference,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn viewing_from_row(row: &PgRow) -> Result<Viewing, StoreError> {
    let status: String = row.try_get("status")?;
    let feedback: Option<Json<ViewingFeedback>> = row.try_get("feedback")?;
    Ok(Viewing {
        user_id: row.try_get("user_id")?,
        viewing_id: row.try_get("viewing_id")?,
        listing_id: row.try_get("listing_id")?,
        profile_id: row.try_get("profile_id")?,
        listing_address: row.try_get("listing_address")?,
        agent_email: row.try_get("agent_email")?,
        agent_name: row.try_get("agent_name")?,
        requested_at: row.try_get("requested_at")?,
        proposed_date_time: row.try_get("proposed_date_time")?,
        status: parse_text_enum::<ViewingStatus>(&status)?,
        feedback: feedback.map(|Json(f)| f),
        feedback_requested_at: row.try_get("feedback_requested_at")?,
        feedback_collected_at: row.try_get("feedback_collected_at")?,
    })
}

#[async_trait]
impl ProfileStore for PgStore {
    async fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {PROFILE_COLUMNS} FROM user_profiles WHERE user_id = $1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(profile_from_row).transpose()
    }

    async fn scan_profiles(
        &self,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<ProfilePage, StoreError> {
        let limit = limit.max(1);
        let rows = sqlx::query(&format!(
            r#"
            SELECT {PROFILE_COLUMNS}
              FROM user_profiles
             WHERE $1::text IS NULL OR user_id > $1
             ORDER BY user_id
             LIMIT $2
            "#
        ))
        .bind(start_after)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut decoded = Vec::with_capacity(rows.len());
        for row in &rows {
            let user_id: String = row.try_get("user_id")?;
            decoded.push((user_id, profile_from_row(row)));
        }
        let next_start_after = if decoded.len() == limit {
            decoded.last().map(|(user_id, _)| user_id.clone())
        } else {
            None
        };
        let (profiles, skipped) = keep_decoded(decoded);
        Ok(ProfilePage {
            profiles,
            skipped,
            next_start_after,
        })
    }

    async fn contact_email(&self, user_id: &str) -> Result<Option<String>, StoreError> {
        let email: Option<Option<String>> =
            sqlx::query_scalar("SELECT email FROM user_profiles WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(email
            .flatten()
            .map(|e| e.trim().to_string())
            .filter(|e| !e.is_empty()))
    }
}

#[async_trait]
impl MatchStore for PgStore {
    async fn existing_keys(
        &self,
        user_id: &str,
        profile_id: &str,
    ) -> Result<HashSet<MatchKey>, StoreError> {
        let keys: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT match_key
              FROM search_results
             WHERE user_id = $1
               AND starts_with(match_key, $2)
            "#,
        )
        .bind(user_id)
        .bind(MatchKey::profile_prefix(profile_id))
        .fetch_all(&self.pool)
        .await?;
        Ok(keys.into_iter().map(MatchKey::from).collect())
    }

    async fn put_batch(&self, results: &[SearchResult]) -> Result<(), StoreError> {
        ensure_batch_ceiling(results)?;
        if results.is_empty() {
            return Ok(());
        }
        let rows = results
            .iter()
            .map(|r| {
                let doc = encode_search_result(r)?;
                let listing_data = doc.get("listingData").cloned().unwrap_or(JsonValue::Null);
                Ok((r.clone(), listing_data))
            })
            .collect::<Result<Vec<_>, StoreError>>()?;

        let mut builder = QueryBuilder::<Postgres>::new(
            "INSERT INTO search_results \
             (user_id, match_key, profile_id, listing_id, listing_data, matched_at, notified) ",
        );
        builder.push_values(rows, |mut b, (result, listing_data)| {
            b.push_bind(result.user_id)
                .push_bind(result.match_key.as_str().to_string())
                .push_bind(result.profile_id)
                .push_bind(result.listing_id)
                .push_bind(Json(listing_data))
                .push_bind(result.matched_at)
                .push_bind(result.notified);
        });
        builder.push(" ON CONFLICT (user_id, match_key) DO NOTHING");

        let outcome = builder.build().execute(&self.pool).await?;
        debug!(
            requested = results.len(),
            inserted = outcome.rows_affected(),
            "search result batch written"
        );
        Ok(())
    }

    async fn mark_notified(&self, user_id: &str, key: &MatchKey) -> Result<bool, StoreError> {
        let outcome = sqlx::query(
            r#"
            UPDATE search_results
               SET notified = TRUE
             WHERE user_id = $1
               AND match_key = $2
               AND NOT notified
            "#,
        )
        .bind(user_id)
        .bind(key.as_str())
        .execute(&self.pool)
        .await?;
        Ok(outcome.rows_affected() == 1)
    }
}

#[async_trait]
impl NotificationLog for PgStore {
    async fn append(&self, notification: &Notification) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO notifications
                (notification_id, user_id, type, channel, recipient_address, subject, sent_at, status)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(notification.notification_id)
        .bind(&notification.user_id)
        .bind(notification.kind.as_str())
        .bind(notification.channel.as_str())
        .bind(&notification.recipient_address)
        .bind(&notification.subject)
        .bind(notification.sent_at)
        .bind(&notification.status)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ViewingStore for PgStore {
    async fn pending_feedback(&self, now: DateTime<Utc>) -> Result<Vec<Viewing>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {VIEWING_COLUMNS}
              FROM viewings
             WHERE feedback IS NULL
               AND feedback_requested_at IS NULL
               AND proposed_date_time < $1
             ORDER BY proposed_date_time
            "#
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        let (viewings, _) = keep_decoded(rows.iter().map(|row| {
            let user_id: String = row.try_get("user_id").unwrap_or_default();
            let viewing_id: String = row.try_get("viewing_id").unwrap_or_default();
            (format!("{user_id}/{viewing_id}"), viewing_from_row(row))
        }));
        Ok(viewings)
    }

    async fn mark_feedback_requested(
        &self,
        user_id: &str,
        viewing_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let outcome = sqlx::query(
            r#"
            UPDATE viewings
               SET feedback_requested_at = $3
             WHERE user_id = $1
               AND viewing_id = $2
               AND feedback_requested_at IS NULL
            "#,
        )
        .bind(user_id)
        .bind(viewing_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(outcome.rows_affected() == 1)
    }
}
