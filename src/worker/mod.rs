pub mod classify;
pub mod cutter;
pub mod download;
pub mod merge;
pub mod stats;
pub mod sweep;
pub mod transcribe;

use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::{AppConfig, MergeConfig};
use crate::database::{Database, Episode, JobStatus, Label, ProcessingJob};
use crate::error::{PipelineError, SegmenterError};
use crate::ollama::{OllamaClassifier, OllamaClient};
use classify::{classify_batch_with_retry, BatchPolicy, Classifier};
use cutter::{CutPlan, Cutter};
use merge::MergeOptions;
use transcribe::{RetryPolicy, Segmenter};

/// Everything the executor needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub episodes_dir: PathBuf,
    pub processed_dir: PathBuf,
    pub merge: MergeConfig,
    pub batch: BatchPolicy,
    pub segment_retry: RetryPolicy,
    /// Fallback wake-up for jobs created by other processes.
    pub poll_interval: Duration,
    /// How often a running job re-reads its own status.
    pub cancel_check_interval: Duration,
}

impl WorkerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            episodes_dir: config.episodes_dir(),
            processed_dir: config.processed_dir(),
            merge: config.merge.clone(),
            batch: BatchPolicy {
                batch_size: config.classifier.batch_size.max(1),
                retry_budget: config.classifier.retry_budget,
                retry_delay: Duration::from_millis(config.classifier.retry_delay_ms),
            },
            segment_retry: RetryPolicy::from_config(&config.whisper),
            poll_interval: Duration::from_secs(config.worker_poll_seconds.max(1)),
            cancel_check_interval: Duration::from_secs(1),
        }
    }
}

/// Runs processing jobs one at a time, oldest first.
pub struct PipelineWorker {
    db: Arc<Database>,
    segmenter: Arc<dyn Segmenter>,
    classifier: Arc<dyn Classifier>,
    cutter: Arc<dyn Cutter>,
    settings: WorkerSettings,
}

impl PipelineWorker {
    pub fn new(
        db: Arc<Database>,
        segmenter: Arc<dyn Segmenter>,
        classifier: Arc<dyn Classifier>,
        cutter: Arc<dyn Cutter>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            db,
            segmenter,
            classifier,
            cutter,
            settings,
        }
    }

    /// Production collaborators: whisper-cli, Ollama and ffmpeg.
    pub fn from_config(config: &AppConfig, db: Arc<Database>) -> Self {
        Self::new(
            db,
            Arc::new(transcribe::WhisperSegmenter::new(&config.whisper)),
            Arc::new(OllamaClassifier::new(OllamaClient::new(&config.classifier))),
            Arc::new(cutter::FfmpegCutter::new(&config.cutter)),
            WorkerSettings::from_config(config),
        )
    }

    /// Worker loop. Woken by the dispatcher channel and by a periodic poll;
    /// stops when `shutdown` fires.
    pub async fn run(&self, mut wake: mpsc::Receiver<String>, shutdown: CancellationToken) {
        log::info!("Pipeline worker started");

        // Jobs left running by a previous process start over
        if let Err(e) = self.db.reset_stuck_jobs() {
            log::warn!("Failed to reset interrupted jobs: {}", e);
        }

        let mut wake_open = true;
        loop {
            while !shutdown.is_cancelled() {
                match self.run_next(&shutdown).await {
                    Ok(Some(_)) => continue,
                    Ok(None) => break,
                    Err(e) => {
                        log::error!("Failed to claim next job: {}", e);
                        break;
                    }
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                msg = wake.recv(), if wake_open => {
                    match msg {
                        Some(job_id) => log::debug!("Woken for job {}", job_id),
                        None => {
                            log::info!("Dispatcher closed, polling only");
                            wake_open = false;
                        }
                    }
                }
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }

        log::info!("Pipeline worker stopped");
    }

    /// Claim and run the oldest pending job. Returns the job id and the
    /// status it ended in, or `None` when the queue is empty.
    pub async fn run_next(
        &self,
        shutdown: &CancellationToken,
    ) -> anyhow::Result<Option<(String, JobStatus)>> {
        let Some(job) = self.db.claim_next_pending_job(Utc::now())? else {
            return Ok(None);
        };

        let Some(episode) = self.db.get_episode_by_id(job.episode_id)? else {
            self.db
                .fail_job(&job.id, "loading: episode no longer exists", Utc::now())?;
            return Ok(Some((job.id, JobStatus::Failed)));
        };

        let span = tracing::info_span!("job", job_id = %job.id, episode = %episode.guid);
        let status = self
            .process_job(&job, &episode, shutdown)
            .instrument(span)
            .await;
        Ok(Some((job.id, status)))
    }

    async fn process_job(
        &self,
        job: &ProcessingJob,
        episode: &Episode,
        shutdown: &CancellationToken,
    ) -> JobStatus {
        log::info!(
            "Processing episode {} ({}), trigger={}",
            episode.guid,
            episode.title,
            job.trigger_source.as_str()
        );
        let started = std::time::Instant::now();

        let cancel = shutdown.child_token();
        let watcher = self.spawn_cancel_watcher(job.id.clone(), cancel.clone());
        let result = self.execute(job, episode, &cancel).await;
        watcher.abort();

        match result {
            Ok(path) => {
                log::info!(
                    "Job completed in {:.1}s, artifact {:?}",
                    started.elapsed().as_secs_f64(),
                    path
                );
                JobStatus::Completed
            }
            Err(PipelineError::Cancelled(stage)) => {
                log::info!("Job stopped before {}", stage);
                // Shutdown leaves the row running for the next start to reset
                match self.db.job_status(&job.id) {
                    Ok(Some(status)) => status,
                    _ => JobStatus::Cancelled,
                }
            }
            Err(e) => {
                let detail = e.to_string();
                log::error!("Job failed: {}", detail);
                match self.db.fail_job(&job.id, &detail, Utc::now()) {
                    Ok(true) => JobStatus::Failed,
                    Ok(false) => self
                        .db
                        .job_status(&job.id)
                        .ok()
                        .flatten()
                        .unwrap_or(JobStatus::Cancelled),
                    Err(db_err) => {
                        log::error!("Failed to record job failure: {}", db_err);
                        JobStatus::Failed
                    }
                }
            }
        }
    }

    /// Cancels `cancel` as soon as the job leaves the running state.
    fn spawn_cancel_watcher(
        &self,
        job_id: String,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let db = self.db.clone();
        let interval = self.settings.cancel_check_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                match db.job_status(&job_id) {
                    Ok(Some(JobStatus::Running)) => {}
                    Ok(status) => {
                        log::info!("Job {} is now {:?}, cancelling", job_id, status);
                        cancel.cancel();
                        return;
                    }
                    Err(e) => log::warn!("Failed to read status of job {}: {}", job_id, e),
                }
            }
        })
    }

    /// Cancellation check plus stage bookkeeping at every stage boundary.
    fn enter_stage(
        &self,
        job_id: &str,
        stage: &'static str,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled(stage));
        }
        match self.db.job_status(job_id) {
            Ok(Some(JobStatus::Running)) => {}
            Ok(_) => return Err(PipelineError::Cancelled(stage)),
            Err(e) => return Err(PipelineError::stage(stage, e)),
        }
        self.db
            .set_job_stage(job_id, stage)
            .map_err(|e| PipelineError::stage(stage, e))?;
        log::info!("Stage: {}", stage);
        Ok(())
    }

    async fn execute(
        &self,
        job: &ProcessingJob,
        episode: &Episode,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, PipelineError> {
        self.enter_stage(&job.id, "downloading", cancel)?;
        let source =
            download::acquire_source(&self.db, episode, &self.settings.episodes_dir, cancel)
                .await
                .map_err(|e| {
                    if cancel.is_cancelled() {
                        PipelineError::Cancelled("downloading")
                    } else {
                        PipelineError::stage("downloading", e)
                    }
                })?;

        self.enter_stage(&job.id, "probing", cancel)?;
        let duration = self
            .cutter
            .probe_duration(&source)
            .await
            .map_err(|e| PipelineError::stage("probing", e))?;
        if duration <= 0.0 {
            return Err(PipelineError::stage(
                "probing",
                format!("source duration is {}", duration),
            ));
        }
        if let Err(e) = self.db.set_episode_duration(episode.id, duration) {
            log::warn!("Failed to store episode duration: {}", e);
        }

        self.enter_stage(&job.id, "transcribing", cancel)?;
        let drafts = transcribe::segment_with_retry(
            self.segmenter.as_ref(),
            &source,
            cancel,
            &self.settings.segment_retry,
        )
        .await
        .and_then(transcribe::validate_segments)
        .map_err(|e| match e {
            SegmenterError::Cancelled => PipelineError::Cancelled("transcribing"),
            other => PipelineError::stage("transcribing", other),
        })?;
        if drafts.is_empty() {
            return Err(PipelineError::stage("transcribing", "no speech segments"));
        }
        let segments = self
            .db
            .insert_segments(episode.id, &job.id, &drafts)
            .map_err(|e| PipelineError::stage("transcribing", e))?;

        self.enter_stage(&job.id, "classifying", cancel)?;
        let preset = self
            .db
            .get_active_preset()
            .map_err(|e| PipelineError::stage("classifying", e))?
            .ok_or_else(|| PipelineError::stage("classifying", "no active prompt preset"))?;
        let podcast_title = self
            .db
            .get_feed(episode.feed_id)
            .map_err(|e| PipelineError::stage("classifying", e))?
            .map(|f| f.title)
            .unwrap_or_default();

        let mut ad_count = 0;
        let batches = segments.chunks(self.settings.batch.batch_size.max(1));
        let batch_total = batches.len();
        for (i, batch) in batches.enumerate() {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled("classifying"));
            }
            let verdicts = classify_batch_with_retry(
                self.classifier.as_ref(),
                &preset,
                &podcast_title,
                batch,
                &self.settings.batch,
            )
            .await
            .map_err(|e| {
                PipelineError::stage(
                    "classifying",
                    format!("batch {}/{} exhausted retries: {}", i + 1, batch_total, e),
                )
            })?;
            ad_count += verdicts.iter().filter(|v| v.label == Label::Ad).count();
            self.db
                .insert_classifications(&job.id, &verdicts)
                .map_err(|e| PipelineError::stage("classifying", e))?;
        }

        self.enter_stage(&job.id, "merging", cancel)?;
        let classified = self
            .db
            .get_classified_segments(&job.id)
            .map_err(|e| PipelineError::stage("merging", e))?;
        let opts = MergeOptions::new(&self.settings.merge, preset.min_confidence, Some(duration));
        let removals = merge::removal_intervals(&classified, &opts);
        let plan = CutPlan::new(duration, &removals);
        log::info!(
            "{} ad verdicts merged into {} removal intervals ({:.1}s)",
            ad_count,
            plan.removals.len(),
            plan.removed_seconds()
        );

        self.enter_stage(&job.id, "cutting", cancel)?;
        tokio::fs::create_dir_all(&self.settings.processed_dir)
            .await
            .map_err(|e| PipelineError::stage("cutting", e))?;
        let final_path = artifact_path(&self.settings.processed_dir, &episode.guid, &job.id);
        let part_path = final_path.with_extension("mp3.part");
        let outcome = match self.cutter.cut(&source, &part_path, &plan).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let _ = tokio::fs::remove_file(&part_path).await;
                return Err(PipelineError::stage("cutting", e));
            }
        };

        if let Err(e) = self.enter_stage(&job.id, "finalizing", cancel) {
            let _ = tokio::fs::remove_file(&part_path).await;
            return Err(e);
        }
        let stats = stats::compute_statistics(
            episode.id,
            &job.id,
            &outcome,
            ad_count,
            Some(preset.id),
        );
        self.finalize(job, episode.id, &part_path, &final_path, &stats)
            .await?;
        Ok(final_path)
    }

    /// Move the cut into place and commit the job. The previous artifact is
    /// only removed once the new one is committed.
    async fn finalize(
        &self,
        job: &ProcessingJob,
        episode_id: i64,
        part_path: &Path,
        final_path: &Path,
        stats: &crate::database::ProcessingStatistics,
    ) -> Result<(), PipelineError> {
        let previous = self
            .db
            .get_episode_by_id(episode_id)
            .map_err(|e| PipelineError::stage("finalizing", e))?
            .and_then(|e| e.processed_audio_path);

        if let Err(e) = tokio::fs::rename(part_path, final_path).await {
            let _ = tokio::fs::remove_file(part_path).await;
            return Err(PipelineError::stage("finalizing", e));
        }

        let final_str = final_path.to_string_lossy();
        let committed = match self.db.complete_job(&job.id, &final_str, stats, Utc::now()) {
            Ok(committed) => committed,
            Err(e) => {
                let _ = tokio::fs::remove_file(final_path).await;
                return Err(PipelineError::stage("finalizing", e));
            }
        };
        if !committed {
            let _ = tokio::fs::remove_file(final_path).await;
            return Err(PipelineError::Cancelled("finalizing"));
        }

        if let Some(previous) = previous.filter(|p| p.as_str() != final_str) {
            if let Err(e) = tokio::fs::remove_file(&previous).await {
                log::warn!("Failed to remove previous artifact {}: {}", previous, e);
            }
        }

        log::info!(
            "Removed {} intervals ({:.1}s, {:.1}%) via {}",
            stats.intervals_removed,
            stats.seconds_removed,
            stats.percentage_removed,
            stats.strategy.as_str()
        );
        Ok(())
    }
}

/// Each job writes its own file so a running job never touches the artifact
/// currently being served.
fn artifact_path(processed_dir: &Path, guid: &str, job_id: &str) -> PathBuf {
    let short: String = job_id.chars().filter(|c| *c != '-').take(8).collect();
    processed_dir.join(format!("{}-{}.mp3", download::safe_file_stem(guid), short))
}
