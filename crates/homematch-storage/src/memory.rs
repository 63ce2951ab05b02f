//! In-process backend with the same semantics as the Postgres store.

use std::collections::{BTreeMap, HashSet};
use std::ops::Bound;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use homematch_core::{MatchKey, Notification, SearchResult, UserProfile, Viewing};
use serde_json::Value as JsonValue;
use tokio::sync::Mutex;

use crate::{
    decode_document, encode_search_result, ensure_batch_ceiling, keep_decoded, MatchStore,
    NotificationLog, ProfilePage, ProfileStore, StoreError, ViewingStore,
};

/// Profiles and viewings are kept as documents, like the JSON columns they
/// mirror, and decoded on read.
#[derive(Debug, Default)]
struct MemoryState {
    profiles: BTreeMap<String, JsonValue>,
    results: BTreeMap<(String, MatchKey), JsonValue>,
    notifications: Vec<Notification>,
    viewings: BTreeMap<(String, String), JsonValue>,
    batch_sizes: Vec<usize>,
    fail_batches_after: Option<usize>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

fn viewing_key(user_id: &str, viewing_id: &str) -> String {
    format!("{user_id}/{viewing_id}")
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_profile(&self, profile: UserProfile) {
        let doc = serde_json::to_value(&profile).expect("profile serializes to json");
        self.insert_raw_profile(&profile.user_id, doc).await;
    }

    /// Store a profile document as-is, whether or not it decodes.
    pub async fn insert_raw_profile(&self, user_id: &str, doc: JsonValue) {
        let mut state = self.state.lock().await;
        state.profiles.insert(user_id.to_string(), doc);
    }

    pub async fn insert_viewing(&self, viewing: Viewing) {
        let doc = serde_json::to_value(&viewing).expect("viewing serializes to json");
        self.insert_raw_viewing(&viewing.user_id, &viewing.viewing_id, doc)
            .await;
    }

    /// Store a viewing document as-is, whether or not it decodes.
    pub async fn insert_raw_viewing(&self, user_id: &str, viewing_id: &str, doc: JsonValue) {
        let mut state = self.state.lock().await;
        state
            .viewings
            .insert((user_id.to_string(), viewing_id.to_string()), doc);
    }

    /// Seed a match directly, bypassing the batch ceiling.
    pub async fn insert_result(&self, result: &SearchResult) -> Result<(), StoreError> {
        let doc = encode_search_result(result)?;
        let mut state = self.state.lock().await;
        state
            .results
            .insert((result.user_id.clone(), result.match_key.clone()), doc);
        Ok(())
    }

    pub async fn search_results(&self, user_id: &str) -> Result<Vec<SearchResult>, StoreError> {
        let state = self.state.lock().await;
        state
            .results
            .iter()
            .filter(|((uid, _), _)| uid == user_id)
            .map(|(_, doc)| serde_json::from_value(doc.clone()).map_err(StoreError::from))
            .collect()
    }

    pub async fn notifications(&self) -> Vec<Notification> {
        self.state.lock().await.notifications.clone()
    }

    pub async fn viewing(&self, user_id: &str, viewing_id: &str) -> Option<Viewing> {
        let state = self.state.lock().await;
        let doc = state
            .viewings
            .get(&(user_id.to_string(), viewing_id.to_string()))?
            .clone();
        decode_document("viewing", &viewing_key(user_id, viewing_id), doc).ok()
    }

    /// Sizes of every accepted `put_batch` call, in order.
    pub async fn batch_sizes(&self) -> Vec<usize> {
        self.state.lock().await.batch_sizes.clone()
    }

    /// Make every batch write after the first `accepted` ones fail.
    pub async fn fail_batch_writes_after(&self, accepted: usize) {
        self.state.lock().await.fail_batches_after = Some(accepted);
    }
}

#[async_trait]
impl ProfileStore for MemoryStore {
    async fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>, StoreError> {
        let doc = self.state.lock().await.profiles.get(user_id).cloned();
        doc.map(|doc| decode_document("profile", user_id, doc))
            .transpose()
    }

    async fn scan_profiles(
        &self,
        start_after: Option<&str>,
        limit: usize,
    ) -> Result<ProfilePage, StoreError> {
        let state = self.state.lock().await;
        let lower = match start_after {
            Some(key) => Bound::Excluded(key.to_string()),
            None => Bound::Unbounded,
        };
        let mut remaining = state.profiles.range((lower, Bound::Unbounded));
        let raw: Vec<(String, JsonValue)> = remaining
            .by_ref()
            .take(limit.max(1))
            .map(|(key, doc)| (key.clone(), doc.clone()))
            .collect();
        let next_start_after = match remaining.next() {
            Some(_) => raw.last().map(|(key, _)| key.clone()),
            None => None,
        };

        let (profiles, skipped) = keep_decoded(raw.into_iter().map(|(key, doc)| {
            let decoded = decode_document("profile", &key, doc);
            (key, decoded)
        }));
        Ok(ProfilePage {
            profiles,
            skipped,
            next_start_after,
        })
    }

    async fn contact_email(&self, user_id: &str) -> Result<Option<String>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .profiles
            .get(user_id)
            .and_then(|doc| doc.get("email"))
            .and_then(JsonValue::as_str)
            .map(str::trim)
            .filter(|email| !email.is_empty())
            .map(str::to_string))
    }
}

#[async_trait]
impl MatchStore for MemoryStore {
    async fn existing_keys(
        &self,
        user_id: &str,
        profile_id: &str,
    ) -> Result<HashSet<MatchKey>, StoreError> {
        let prefix = MatchKey::profile_prefix(profile_id);
        let state = self.state.lock().await;
        Ok(state
            .results
            .keys()
            .filter(|(uid, key)| uid == user_id && key.as_str().starts_with(&prefix))
            .map(|(_, key)| key.clone())
            .collect())
    }

    async fn put_batch(&self, results: &[SearchResult]) -> Result<(), StoreError> {
        ensure_batch_ceiling(results)?;
        let docs = results
            .iter()
            .map(|r| encode_search_result(r).map(|doc| (r, doc)))
            .collect::<Result<Vec<_>, _>>()?;

        let mut state = self.state.lock().await;
        if let Some(accepted) = state.fail_batches_after {
            if state.batch_sizes.len() >= accepted {
                return Err(StoreError::Unavailable(
                    "batch write rejected by fault injection".to_string(),
                ));
            }
        }
        for (result, doc) in docs {
            state
                .results
                .entry((result.user_id.clone(), result.match_key.clone()))
                .or_insert(doc);
        }
        state.batch_sizes.push(results.len());
        Ok(())
    }

    async fn mark_notified(&self, user_id: &str, key: &MatchKey) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let Some(doc) = state.results.get_mut(&(user_id.to_string(), key.clone())) else {
            return Ok(false);
        };
        if doc.get("notified").and_then(JsonValue::as_bool) == Some(true) {
            return Ok(false);
        }
        doc["notified"] = JsonValue::Bool(true);
        Ok(true)
    }
}

#[async_trait]
impl NotificationLog for MemoryStore {
    async fn append(&self, notification: &Notification) -> Result<(), StoreError> {
        self.state
            .lock()
            .await
            .notifications
            .push(notification.clone());
        Ok(())
    }
}

#[async_trait]
impl ViewingStore for MemoryStore {
    async fn pending_feedback(&self, now: DateTime<Utc>) -> Result<Vec<Viewing>, StoreError> {
        let state = self.state.lock().await;
        let rows = state.viewings.iter().map(|((user_id, viewing_id), doc)| {
            let key = viewing_key(user_id, viewing_id);
            let decoded = decode_document::<Viewing>("viewing", &key, doc.clone());
            (key, decoded)
        });
        let (viewings, _) = keep_decoded(rows);
        Ok(viewings
            .into_iter()
            .filter(|v| v.awaits_feedback_request(now))
            .collect())
    }

    async fn mark_feedback_requested(
        &self,
        user_id: &str,
        viewing_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let Some(doc) = state
            .viewings
            .get_mut(&(user_id.to_string(), viewing_id.to_string()))
        else {
            return Ok(false);
        };
        if doc.get("feedbackRequestedAt").is_some_and(|v| !v.is_null()) {
            return Ok(false);
        }
        doc["feedbackRequestedAt"] = serde_json::to_value(at)?;
        Ok(true)
    }
}
