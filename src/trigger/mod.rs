//! Trigger decisions for episode fetches.
//!
//! Every inbound probe or fetch resolves to exactly one [`Decision`]. The
//! checks are split into two pure steps (request shape, then job state) and a
//! final store-backed step that creates the job atomically.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::auth::AuthOutcome;
use crate::config::TriggerConfig;
use crate::database::{
    CreateJobOutcome, Database, Episode, JobStatus, ProcessingJob, ProcessingStatistics, TokenScope,
    TriggerSource,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// HEAD: availability check only.
    Probe,
    Fetch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    NotFound,
    ProbeAck,
    ServeArtifact { path: PathBuf },
    Unauthorized,
    NotReadyNoTrigger { retry_after: u64, reason: NoTriggerReason },
    AlreadyInProgress { retry_after: u64, job_id: Option<String> },
    CooldownActive { retry_after: u64 },
    TriggerAccepted { retry_after: u64, job_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoTriggerReason {
    ReadOnlyToken,
    EpisodeDisabled,
}

impl Decision {
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Decision::NotReadyNoTrigger { retry_after, .. }
            | Decision::AlreadyInProgress { retry_after, .. }
            | Decision::CooldownActive { retry_after }
            | Decision::TriggerAccepted { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Machine-readable state reported to clients.
    pub fn state(&self) -> &'static str {
        match self {
            Decision::NotFound => "not_found",
            Decision::ProbeAck => "probe",
            Decision::ServeArtifact { .. } => "ready",
            Decision::Unauthorized => "unauthorized",
            Decision::NotReadyNoTrigger { .. } => "not_ready",
            Decision::AlreadyInProgress { .. } => "processing",
            Decision::CooldownActive { .. } => "cooldown",
            Decision::TriggerAccepted { .. } => "queued",
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            Decision::NotFound => "Episode not found",
            Decision::ProbeAck => "",
            Decision::ServeArtifact { .. } => "",
            Decision::Unauthorized => "Invalid or missing feed token",
            Decision::NotReadyNoTrigger {
                reason: NoTriggerReason::ReadOnlyToken,
                ..
            } => "Episode is not processed yet. This feed link is read-only and cannot start processing.",
            Decision::NotReadyNoTrigger {
                reason: NoTriggerReason::EpisodeDisabled,
                ..
            } => "Episode is not processed yet and processing is disabled for it.",
            Decision::AlreadyInProgress { .. } => "Episode is being processed. Try again shortly.",
            Decision::CooldownActive { .. } => {
                "Processing was requested recently. Try again after the retry interval."
            }
            Decision::TriggerAccepted { .. } => "Processing started. Try again shortly.",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TriggerPolicy {
    pub cooldown: chrono::Duration,
    pub accepted_retry: u64,
    pub in_progress_retry: u64,
    pub read_only_retry: u64,
}

impl From<&TriggerConfig> for TriggerPolicy {
    fn from(config: &TriggerConfig) -> Self {
        Self {
            cooldown: chrono::Duration::minutes(config.cooldown_minutes),
            accepted_retry: config.accepted_retry_seconds,
            in_progress_retry: config.in_progress_retry_seconds,
            read_only_retry: config.read_only_retry_seconds,
        }
    }
}

impl Default for TriggerPolicy {
    fn default() -> Self {
        Self::from(&TriggerConfig::default())
    }
}

/// Steps that depend only on the request: existence, probe, artifact,
/// credentials and scope. `None` means the job state must be consulted.
pub fn evaluate_request(
    kind: RequestKind,
    episode: Option<&Episode>,
    artifact: Option<&str>,
    auth: &AuthOutcome,
    policy: &TriggerPolicy,
) -> Option<Decision> {
    let Some(episode) = episode else {
        return Some(Decision::NotFound);
    };

    if kind == RequestKind::Probe {
        return Some(Decision::ProbeAck);
    }

    if let Some(path) = artifact {
        return Some(Decision::ServeArtifact {
            path: PathBuf::from(path),
        });
    }

    let ctx = match auth {
        AuthOutcome::Authorized(ctx) => ctx,
        AuthOutcome::Unauthorized => return Some(Decision::Unauthorized),
    };

    match ctx.scope {
        TokenScope::Combined => {
            return Some(Decision::NotReadyNoTrigger {
                retry_after: policy.read_only_retry,
                reason: NoTriggerReason::ReadOnlyToken,
            });
        }
        TokenScope::FeedScoped(feed_id) if feed_id != episode.feed_id => {
            return Some(Decision::Unauthorized);
        }
        TokenScope::FeedScoped(_) => {}
    }

    if !episode.enabled {
        return Some(Decision::NotReadyNoTrigger {
            retry_after: policy.read_only_retry,
            reason: NoTriggerReason::EpisodeDisabled,
        });
    }

    None
}

/// Steps that depend on stored job state: active job, then cooldown.
/// `None` means a new job may be created.
pub fn evaluate_job_state(
    active_job: Option<&ProcessingJob>,
    last_trigger_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    policy: &TriggerPolicy,
) -> Option<Decision> {
    if let Some(job) = active_job {
        return Some(Decision::AlreadyInProgress {
            retry_after: policy.in_progress_retry,
            job_id: Some(job.id.clone()),
        });
    }

    let last = last_trigger_at?;
    let elapsed = now - last;
    if elapsed < policy.cooldown {
        let remaining = (policy.cooldown - elapsed).min(policy.cooldown);
        return Some(Decision::CooldownActive {
            retry_after: retry_seconds(remaining),
        });
    }
    None
}

fn retry_seconds(remaining: chrono::Duration) -> u64 {
    let millis = remaining.num_milliseconds().max(0) as u64;
    millis.div_ceil(1000).max(1)
}

/// Wakes the pipeline worker when a job is queued.
#[derive(Clone)]
pub struct JobDispatcher {
    tx: mpsc::Sender<String>,
}

impl JobDispatcher {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Never blocks. A full or closed channel is fine: the worker's periodic
    /// poll still finds the pending row.
    pub fn dispatch(&self, job_id: &str) {
        match self.tx.try_send(job_id.to_string()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::debug!("Dispatch channel full, job {} left for the poller", job_id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::warn!("Pipeline worker not listening, job {} left pending", job_id);
            }
        }
    }
}

// ============================================================================
// Status and explicit requests
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeState {
    Ready,
    Processing,
    Queued,
    Failed,
    NotStarted,
}

#[derive(Debug, Clone, Serialize)]
pub struct EpisodeStatus {
    pub guid: String,
    pub state: EpisodeState,
    pub processed: bool,
    pub retry_after_seconds: Option<u64>,
    pub job: Option<ProcessingJob>,
    /// What the last successful run removed. Only set while processed.
    pub statistics: Option<ProcessingStatistics>,
}

#[derive(Debug, Clone)]
pub enum StatusOutcome {
    NotFound,
    Unauthorized,
    Status(EpisodeStatus),
}

/// Result of a manual or reprocess request.
#[derive(Debug, Clone)]
pub enum RequestOutcome {
    Queued {
        job: ProcessingJob,
        cancelled: usize,
    },
    AlreadyActive {
        job_id: Option<String>,
    },
    NotFound,
    Unauthorized,
    /// Authenticated, but the token cannot start work for this episode.
    Forbidden,
    Disabled,
}

pub struct TriggerEngine {
    db: Arc<Database>,
    policy: TriggerPolicy,
    dispatcher: JobDispatcher,
}

impl TriggerEngine {
    pub fn new(db: Arc<Database>, policy: TriggerPolicy, dispatcher: JobDispatcher) -> Self {
        Self {
            db,
            policy,
            dispatcher,
        }
    }

    pub fn policy(&self) -> &TriggerPolicy {
        &self.policy
    }

    pub fn decide(
        &self,
        kind: RequestKind,
        guid: &str,
        auth: &AuthOutcome,
        now: DateTime<Utc>,
    ) -> Result<Decision> {
        let episode = self.db.get_episode_by_guid(guid)?;
        let artifact = episode.as_ref().and_then(|e| e.processed_artifact());
        if let Some(decision) = evaluate_request(kind, episode.as_ref(), artifact, auth, &self.policy)
        {
            return Ok(decision);
        }
        // evaluate_request only falls through for an existing episode
        let Some(episode) = episode else {
            return Ok(Decision::NotFound);
        };

        let active = self.db.get_active_job(episode.id)?;
        let last = self.db.latest_job_created_at(episode.id)?;
        if let Some(decision) = evaluate_job_state(active.as_ref(), last, now, &self.policy) {
            log::debug!("Trigger for {} declined: {}", guid, decision.state());
            return Ok(decision);
        }

        let principal = auth.context().map(|ctx| ctx.principal);
        let outcome = self.db.try_create_job(
            episode.id,
            TriggerSource::OnDemandRequest,
            principal,
            now,
            Some(self.policy.cooldown),
        )?;

        let decision = match outcome {
            CreateJobOutcome::Created(job) => {
                log::info!(
                    "On-demand trigger accepted: episode={} job={} principal={:?}",
                    guid,
                    job.id,
                    principal
                );
                self.dispatcher.dispatch(&job.id);
                Decision::TriggerAccepted {
                    retry_after: self.policy.accepted_retry,
                    job_id: job.id,
                }
            }
            CreateJobOutcome::ActiveExists => Decision::AlreadyInProgress {
                retry_after: self.policy.in_progress_retry,
                job_id: None,
            },
            CreateJobOutcome::CoolingDown { remaining } => Decision::CooldownActive {
                retry_after: retry_seconds(remaining),
            },
        };
        Ok(decision)
    }

    /// Read-only processing state for an episode. Never creates work.
    pub fn status(&self, guid: &str, auth: &AuthOutcome) -> Result<StatusOutcome> {
        let Some(episode) = self.db.get_episode_by_guid(guid)? else {
            return Ok(StatusOutcome::NotFound);
        };
        match auth.context() {
            None => return Ok(StatusOutcome::Unauthorized),
            Some(ctx) => {
                if let TokenScope::FeedScoped(feed_id) = ctx.scope {
                    if feed_id != episode.feed_id {
                        return Ok(StatusOutcome::Unauthorized);
                    }
                }
            }
        }

        let processed = episode.processed_artifact().is_some();
        let job = self.db.get_latest_job(episode.id)?;
        let state = if processed {
            EpisodeState::Ready
        } else {
            match job.as_ref().map(|j| j.status) {
                Some(JobStatus::Running) => EpisodeState::Processing,
                Some(JobStatus::Pending) => EpisodeState::Queued,
                Some(JobStatus::Failed) => EpisodeState::Failed,
                _ => EpisodeState::NotStarted,
            }
        };
        let retry_after_seconds = match state {
            EpisodeState::Processing | EpisodeState::Queued => Some(self.policy.in_progress_retry),
            _ => None,
        };

        let statistics = if processed {
            self.db.get_statistics(episode.id)?
        } else {
            None
        };

        Ok(StatusOutcome::Status(EpisodeStatus {
            guid: episode.guid,
            state,
            processed,
            retry_after_seconds,
            job,
            statistics,
        }))
    }

    /// Queue a `manual` job. No cooldown applies.
    pub fn request_manual(
        &self,
        guid: &str,
        auth: &AuthOutcome,
        now: DateTime<Utc>,
    ) -> Result<RequestOutcome> {
        let (episode, principal) = match self.authorize_request(guid, auth)? {
            Ok(pair) => pair,
            Err(outcome) => return Ok(outcome),
        };

        match self
            .db
            .try_create_job(episode.id, TriggerSource::Manual, Some(principal), now, None)?
        {
            CreateJobOutcome::Created(job) => {
                log::info!("Manual job {} queued for episode {}", job.id, guid);
                self.dispatcher.dispatch(&job.id);
                Ok(RequestOutcome::Queued { job, cancelled: 0 })
            }
            CreateJobOutcome::ActiveExists | CreateJobOutcome::CoolingDown { .. } => {
                let active = self.db.get_active_job(episode.id)?;
                Ok(RequestOutcome::AlreadyActive {
                    job_id: active.map(|j| j.id),
                })
            }
        }
    }

    /// Cancel any active job and queue a `reprocess` job. The existing
    /// artifact keeps being served until the new job completes.
    pub fn request_reprocess(
        &self,
        guid: &str,
        auth: &AuthOutcome,
        now: DateTime<Utc>,
    ) -> Result<RequestOutcome> {
        let (episode, principal) = match self.authorize_request(guid, auth)? {
            Ok(pair) => pair,
            Err(outcome) => return Ok(outcome),
        };

        let (cancelled, job) = self
            .db
            .supersede_with_reprocess(episode.id, Some(principal), now)?;
        log::info!(
            "Reprocess job {} queued for episode {} ({} active job(s) cancelled)",
            job.id,
            guid,
            cancelled
        );
        self.dispatcher.dispatch(&job.id);
        Ok(RequestOutcome::Queued { job, cancelled })
    }

    pub fn cancel_job(&self, job_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let cancelled = self.db.cancel_job(job_id, now)?;
        if cancelled {
            log::info!("Job {} cancelled", job_id);
        }
        Ok(cancelled)
    }

    fn authorize_request(
        &self,
        guid: &str,
        auth: &AuthOutcome,
    ) -> Result<std::result::Result<(Episode, i64), RequestOutcome>> {
        let Some(episode) = self.db.get_episode_by_guid(guid)? else {
            return Ok(Err(RequestOutcome::NotFound));
        };
        let Some(ctx) = auth.context() else {
            return Ok(Err(RequestOutcome::Unauthorized));
        };
        if !ctx.can_trigger(episode.feed_id) {
            return Ok(Err(RequestOutcome::Forbidden));
        }
        if !episode.enabled {
            return Ok(Err(RequestOutcome::Disabled));
        }
        let principal = ctx.principal;
        Ok(Ok((episode, principal)))
    }
}
