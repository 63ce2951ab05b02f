//! Search worker: discovers new listings per monitored profile, records them
//! once, notifies once, and sweeps finished viewings for feedback requests.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use homematch_adapters::{build_listing_url, ListingSource, RentcastSource};
use homematch_core::{SearchProfile, UserProfile, WorkRequest};
use homematch_notify::{
    DispatchReport, Dispatcher, EmailSender, HttpEmailSender, LogEmailSender,
};
use homematch_storage::Stores;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

mod config;
mod differ;
mod locks;
mod persist;
mod queue;

pub use config::WorkerConfig;
pub use differ::diff_new_listings;
pub use locks::ProfileLocks;
pub use persist::{persist_matches, PersistOutcome};
pub use queue::{monitoring_enabled, on_profile_updated, work_queue, WorkQueue, WorkRequestSink};

pub const CRATE_NAME: &str = "homematch-worker";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProfileStatus {
    NoNewListings,
    Completed,
    ProviderFailed { error: String },
    /// Some batches were written before a store failure; only those were notified.
    PartiallyPersisted { error: String },
    StoreFailed { error: String },
}

impl ProfileStatus {
    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::NoNewListings | Self::Completed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfileReport {
    pub user_id: String,
    pub profile_id: String,
    pub fetched: usize,
    pub new_matches: usize,
    pub notifications: DispatchReport,
    pub status: ProfileStatus,
}

impl ProfileReport {
    fn new(user_id: &str, profile_id: &str, status: ProfileStatus) -> Self {
        Self {
            user_id: user_id.to_string(),
            profile_id: profile_id.to_string(),
            fetched: 0,
            new_matches: 0,
            notifications: DispatchReport::default(),
            status,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub candidates: usize,
    pub requested: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Targeted,
    Cron,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub mode: RunMode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub users_processed: usize,
    pub users_failed: usize,
    pub profiles: Vec<ProfileReport>,
    pub feedback: Option<SweepReport>,
}

impl RunSummary {
    pub fn terminal_state(&self) -> &'static str {
        match self.mode {
            RunMode::Targeted => "completed (targeted)",
            RunMode::Cron => "completed",
        }
    }

    pub fn new_matches(&self) -> usize {
        self.profiles.iter().map(|p| p.new_matches).sum()
    }

    pub fn notifications_sent(&self) -> usize {
        self.profiles.iter().map(|p| p.notifications.sent).sum()
    }

    pub fn failed_profiles(&self) -> usize {
        self.profiles.iter().filter(|p| p.status.is_failure()).count()
    }
}

#[derive(Clone)]
pub struct SearchWorker {
    config: Arc<WorkerConfig>,
    source: Arc<dyn ListingSource>,
    stores: Stores,
    dispatcher: Arc<Dispatcher>,
    locks: ProfileLocks,
}

impl SearchWorker {
    pub fn new(
        config: WorkerConfig,
        source: Arc<dyn ListingSource>,
        stores: Stores,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            config: Arc::new(config),
            source,
            stores,
            dispatcher: Arc::new(dispatcher),
            locks: ProfileLocks::new(),
        }
    }

    /// Wire the Rentcast source and the configured email sender around `stores`.
    pub fn from_config(config: WorkerConfig, stores: Stores) -> Result<Self> {
        let source = RentcastSource::new(config.provider_config()?)
            .context("building listing source")?;
        let email: Arc<dyn EmailSender> = match config.email_config() {
            Some(email_config) => Arc::new(
                HttpEmailSender::new(email_config).context("building email sender")?,
            ),
            None => {
                warn!(dry_run = config.dry_run, "email delivery disabled; messages are only logged");
                Arc::new(LogEmailSender)
            }
        };
        let dispatcher = Dispatcher::new(
            email,
            stores.matches.clone(),
            stores.notifications.clone(),
            config.chat_url.clone(),
        );
        Ok(Self::new(config, Arc::new(source), stores, dispatcher))
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Run one trigger to completion. A request with a user id is targeted,
    /// anything else is a full cron sweep.
    pub async fn run(&self, request: WorkRequest) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        match request.user_id.as_deref().filter(|id| !id.is_empty()) {
            Some(user_id) => {
                let span = info_span!("targeted_run", %run_id, user_id);
                self.run_targeted(run_id, user_id, request.profile_id.as_deref())
                    .instrument(span)
                    .await
            }
            None => {
                let span = info_span!("cron_run", %run_id);
                self.run_cron(run_id).instrument(span).await
            }
        }
    }

    async fn run_targeted(
        &self,
        run_id: Uuid,
        user_id: &str,
        profile_id: Option<&str>,
    ) -> Result<RunSummary> {
        let started_at = Utc::now();
        let user = self
            .stores
            .profiles
            .get_profile(user_id)
            .await
            .with_context(|| format!("loading profile for user {user_id}"))?;

        let (users_processed, profiles) = match user {
            Some(user) => (1, self.process_user(&user, profile_id, started_at).await),
            None => {
                info!(user_id, "user not found; nothing to search");
                (0, Vec::new())
            }
        };

        let summary = RunSummary {
            run_id,
            mode: RunMode::Targeted,
            started_at,
            finished_at: Utc::now(),
            users_processed,
            users_failed: 0,
            profiles,
            feedback: None,
        };
        log_summary(&summary);
        Ok(summary)
    }

    async fn run_cron(&self, run_id: Uuid) -> Result<RunSummary> {
        let started_at = Utc::now();
        let mut summary = RunSummary {
            run_id,
            mode: RunMode::Cron,
            started_at,
            finished_at: started_at,
            users_processed: 0,
            users_failed: 0,
            profiles: Vec::new(),
            feedback: None,
        };

        let mut start_after: Option<String> = None;
        loop {
            let page = match self
                .stores
                .profiles
                .scan_profiles(start_after.as_deref(), self.config.page_size)
                .await
            {
                Ok(page) => page,
                Err(err) => {
                    error!(error = %err, start_after = ?start_after, "profile scan failed; ending sweep early");
                    break;
                }
            };
            debug!(users = page.profiles.len(), "processing profile page");
            if page.skipped > 0 {
                warn!(skipped = page.skipped, "undecodable profiles left out of this page");
                summary.users_failed += page.skipped;
            }

            let mut tasks = JoinSet::new();
            for user in page.profiles {
                let worker = self.clone();
                let span = info_span!("user", user_id = %user.user_id);
                tasks.spawn(
                    async move { worker.process_user(&user, None, started_at).await }
                        .instrument(span),
                );
            }
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(reports) => {
                        summary.users_processed += 1;
                        summary.profiles.extend(reports);
                    }
                    Err(err) => {
                        error!(error = %err, "user task aborted");
                        summary.users_failed += 1;
                    }
                }
            }

            match page.next_start_after {
                Some(next) => start_after = Some(next),
                None => break,
            }
        }

        summary.feedback = match self.run_feedback_sweep(Utc::now()).await {
            Ok(report) => Some(report),
            Err(err) => {
                error!(error = %err, "feedback sweep failed");
                None
            }
        };
        summary.finished_at = Utc::now();
        log_summary(&summary);
        Ok(summary)
    }

    /// Process `user`'s monitored profiles one after another, or just
    /// `profile_id` when given and monitored.
    pub async fn process_user(
        &self,
        user: &UserProfile,
        profile_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Vec<ProfileReport> {
        let selected: Vec<&SearchProfile> = match profile_id {
            Some(profile_id) => match user.search_profile(profile_id) {
                Some(profile) if profile.monitoring => vec![profile],
                Some(_) => {
                    info!(user_id = %user.user_id, profile_id, "monitoring disabled; skipping profile");
                    Vec::new()
                }
                None => {
                    info!(user_id = %user.user_id, profile_id, "search profile not found");
                    Vec::new()
                }
            },
            None => user.monitored_profiles().collect(),
        };

        let mut reports = Vec::with_capacity(selected.len());
        for profile in selected {
            let span = info_span!("profile", profile_id = %profile.profile_id);
            reports.push(
                self.process_search_profile(user, profile, now)
                    .instrument(span)
                    .await,
            );
        }
        reports
    }

    /// Fetch, diff, enrich, persist and notify for one profile.
    pub async fn process_search_profile(
        &self,
        user: &UserProfile,
        profile: &SearchProfile,
        now: DateTime<Utc>,
    ) -> ProfileReport {
        let user_id = user.user_id.as_str();
        let profile_id = profile.profile_id.as_str();
        let _permit = self.locks.acquire(user_id, profile_id).await;

        let fetched = match self.source.search_listings(&profile.criteria).await {
            Ok(listings) => listings,
            Err(err) => {
                warn!(
                    user_id,
                    profile_id,
                    source = self.source.source_id(),
                    error = %err,
                    "listing search failed"
                );
                return ProfileReport::new(
                    user_id,
                    profile_id,
                    ProfileStatus::ProviderFailed {
                        error: err.to_string(),
                    },
                );
            }
        };
        let fetched_count = fetched.len();

        let existing = match self.stores.matches.existing_keys(user_id, profile_id).await {
            Ok(keys) => keys,
            Err(err) => {
                error!(user_id, profile_id, error = %err, "reading existing matches failed");
                let mut report = ProfileReport::new(
                    user_id,
                    profile_id,
                    ProfileStatus::StoreFailed {
                        error: err.to_string(),
                    },
                );
                report.fetched = fetched_count;
                return report;
            }
        };

        let mut fresh = diff_new_listings(profile_id, fetched, &existing);
        let mut report = ProfileReport::new(user_id, profile_id, ProfileStatus::NoNewListings);
        report.fetched = fetched_count;
        if fresh.is_empty() {
            debug!(user_id, profile_id, fetched = fetched_count, "no new listings");
            return report;
        }

        for listing in &mut fresh {
            listing.listing_url = Some(build_listing_url(
                &listing.address,
                user.listing_viewing_preference,
            ));
        }

        let outcome = persist_matches(
            self.stores.matches.as_ref(),
            user_id,
            profile_id,
            &fresh,
            now,
        )
        .await;
        report.new_matches = outcome.committed;
        let status = match outcome.error {
            None => ProfileStatus::Completed,
            Some(err) if outcome.committed > 0 => {
                error!(
                    user_id,
                    profile_id,
                    committed = outcome.committed,
                    pending = fresh.len() - outcome.committed,
                    error = %err,
                    "match persistence stopped part way"
                );
                ProfileStatus::PartiallyPersisted {
                    error: err.to_string(),
                }
            }
            Some(err) => {
                error!(user_id, profile_id, error = %err, "match persistence failed");
                return ProfileReport {
                    status: ProfileStatus::StoreFailed {
                        error: err.to_string(),
                    },
                    ..report
                };
            }
        };
        report.status = status;

        report.notifications = self
            .dispatcher
            .dispatch_matches(user, profile, &fresh[..outcome.committed], now)
            .await;
        info!(
            user_id,
            profile_id,
            fetched = fetched_count,
            new_matches = report.new_matches,
            notified = report.notifications.sent,
            "profile processed"
        );
        report
    }

    /// Ask for feedback on every viewing that took place before `now` and was never asked.
    pub async fn run_feedback_sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let viewings = self
            .stores
            .viewings
            .pending_feedback(now)
            .await
            .context("listing viewings awaiting feedback")?;
        let mut report = SweepReport {
            candidates: viewings.len(),
            ..SweepReport::default()
        };

        for viewing in viewings {
            if !viewing.awaits_feedback_request(now) {
                continue;
            }
            let user_id = viewing.user_id.as_str();
            let viewing_id = viewing.viewing_id.as_str();

            let recipient = match self.stores.profiles.contact_email(user_id).await {
                Ok(Some(email)) => email,
                Ok(None) => {
                    info!(user_id, viewing_id, "no email address on file; skipping feedback request");
                    report.skipped += 1;
                    continue;
                }
                Err(err) => {
                    warn!(user_id, viewing_id, error = %err, "resolving contact email failed");
                    report.failed += 1;
                    continue;
                }
            };

            let notification = match self
                .dispatcher
                .send_feedback_request(&viewing, &recipient, now)
                .await
            {
                Ok(notification) => notification,
                Err(err) => {
                    warn!(user_id, viewing_id, error = %err, "feedback request failed");
                    report.failed += 1;
                    continue;
                }
            };

            match self
                .stores
                .viewings
                .mark_feedback_requested(user_id, viewing_id, now)
                .await
            {
                Ok(true) => {}
                Ok(false) => debug!(user_id, viewing_id, "feedback already requested elsewhere"),
                Err(err) => {
                    warn!(user_id, viewing_id, error = %err, "recording feedback request failed");
                    report.failed += 1;
                    continue;
                }
            }

            if let Err(err) = self.dispatcher.record(&notification).await {
                warn!(user_id, viewing_id, error = %err, "writing notification record failed");
            }
            report.requested += 1;
        }

        info!(
            candidates = report.candidates,
            requested = report.requested,
            skipped = report.skipped,
            failed = report.failed,
            "feedback sweep finished"
        );
        Ok(report)
    }

    /// Run queued requests until every sender is dropped.
    pub async fn serve(self, mut requests: mpsc::Receiver<WorkRequest>) {
        let mut runs = JoinSet::new();
        loop {
            tokio::select! {
                request = requests.recv() => {
                    let Some(request) = request else { break };
                    let worker = self.clone();
                    runs.spawn(async move {
                        if let Err(err) = worker.run(request).await {
                            error!(error = %format!("{err:#}"), "queued run failed");
                        }
                    });
                }
                Some(joined) = runs.join_next(), if !runs.is_empty() => {
                    if let Err(err) = joined {
                        error!(error = %err, "queued run aborted");
                    }
                }
            }
        }
        while let Some(joined) = runs.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "queued run aborted");
            }
        }
    }

    /// Scheduler with the daily cron sweep registered. Not started.
    pub async fn build_scheduler(&self) -> Result<JobScheduler> {
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.search_cron.clone();
        let worker = self.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let worker = worker.clone();
            Box::pin(async move {
                if let Err(err) = worker.run(WorkRequest::cron()).await {
                    error!(error = %format!("{err:#}"), "scheduled search failed");
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(sched)
    }
}

fn log_summary(summary: &RunSummary) {
    info!(
        run_id = %summary.run_id,
        state = summary.terminal_state(),
        users = summary.users_processed,
        users_failed = summary.users_failed,
        profiles = summary.profiles.len(),
        failed_profiles = summary.failed_profiles(),
        new_matches = summary.new_matches(),
        notifications = summary.notifications_sent(),
        feedback_requests = summary.feedback.map(|f| f.requested).unwrap_or(0),
        elapsed_ms = (summary.finished_at - summary.started_at).num_milliseconds(),
        "search run finished"
    );
}
