//! Typed trigger channel between profile updates and the worker.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use homematch_core::{SearchProfile, WorkRequest};
use tokio::sync::mpsc;
use tracing::info;

#[async_trait]
pub trait WorkRequestSink: Send + Sync {
    async fn submit(&self, request: WorkRequest) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct WorkQueue {
    tx: mpsc::Sender<WorkRequest>,
}

pub fn work_queue(capacity: usize) -> (WorkQueue, mpsc::Receiver<WorkRequest>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (WorkQueue { tx }, rx)
}

#[async_trait]
impl WorkRequestSink for WorkQueue {
    async fn submit(&self, request: WorkRequest) -> Result<()> {
        self.tx
            .send(request)
            .await
            .map_err(|_| anyhow!("work queue is closed"))
    }
}

/// Monitoring was switched on by this update.
pub fn monitoring_enabled(previous: Option<&SearchProfile>, updated: &SearchProfile) -> bool {
    updated.monitoring && !previous.is_some_and(|p| p.monitoring)
}

/// Queue a targeted run for a profile whose monitoring was just enabled.
///
/// Returns whether a request was submitted.
pub async fn on_profile_updated(
    sink: &dyn WorkRequestSink,
    user_id: &str,
    previous: Option<&SearchProfile>,
    updated: &SearchProfile,
) -> Result<bool> {
    if !monitoring_enabled(previous, updated) {
        return Ok(false);
    }
    info!(user_id, profile_id = %updated.profile_id, "monitoring enabled; queueing targeted search");
    sink.submit(WorkRequest::for_profile(user_id, &updated.profile_id))
        .await?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use homematch_core::{NotificationPreferences, SearchCriteria};

    fn profile(monitoring: bool) -> SearchProfile {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().unwrap();
        SearchProfile {
            profile_id: "P".into(),
            name: "Downtown condos".into(),
            is_default: false,
            criteria: SearchCriteria::default(),
            monitoring,
            notification_preferences: NotificationPreferences::default(),
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn only_the_off_to_on_transition_triggers() {
        assert!(monitoring_enabled(None, &profile(true)));
        assert!(monitoring_enabled(Some(&profile(false)), &profile(true)));
        assert!(!monitoring_enabled(Some(&profile(true)), &profile(true)));
        assert!(!monitoring_enabled(Some(&profile(true)), &profile(false)));
        assert!(!monitoring_enabled(None, &profile(false)));
    }

    #[tokio::test]
    async fn enabling_monitoring_queues_a_targeted_request() {
        let (queue, mut rx) = work_queue(4);
        let queued = on_profile_updated(&queue, "U", Some(&profile(false)), &profile(true))
            .await
            .unwrap();
        assert!(queued);
        let request = rx.recv().await.unwrap();
        assert_eq!(request, WorkRequest::for_profile("U", "P"));
        assert!(request.is_targeted());

        let queued = on_profile_updated(&queue, "U", Some(&profile(true)), &profile(true))
            .await
            .unwrap();
        assert!(!queued);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn submitting_to_a_closed_queue_fails() {
        let (queue, rx) = work_queue(1);
        drop(rx);
        assert!(queue.submit(WorkRequest::cron()).await.is_err());
    }
}
