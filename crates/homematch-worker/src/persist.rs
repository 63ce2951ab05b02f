use chrono::{DateTime, Utc};
use homematch_core::{Listing, SearchResult};
use homematch_storage::{MatchStore, StoreError, MAX_BATCH_WRITE};
use tracing::debug;

/// How far a chunked write got.
#[derive(Debug)]
pub struct PersistOutcome {
    /// Leading listings whose batches were committed.
    pub committed: usize,
    /// The failure that stopped writing, if any.
    pub error: Option<StoreError>,
}

impl PersistOutcome {
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }
}

/// Write `listings` as fresh matches in batches of at most [`MAX_BATCH_WRITE`].
///
/// Stops at the first failed batch; earlier batches stay committed.
pub async fn persist_matches(
    store: &dyn MatchStore,
    user_id: &str,
    profile_id: &str,
    listings: &[Listing],
    matched_at: DateTime<Utc>,
) -> PersistOutcome {
    let mut committed = 0usize;
    for chunk in listings.chunks(MAX_BATCH_WRITE) {
        let batch: Vec<SearchResult> = chunk
            .iter()
            .map(|l| SearchResult::new_match(user_id, profile_id, l.clone(), matched_at))
            .collect();
        if let Err(err) = store.put_batch(&batch).await {
            return PersistOutcome {
                committed,
                error: Some(err),
            };
        }
        committed += chunk.len();
        debug!(user_id, profile_id, committed, "match batch committed");
    }
    PersistOutcome {
        committed,
        error: None,
    }
}
