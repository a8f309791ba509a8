//! Periodic refresh of auto-processing feeds.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::database::{CreateJobOutcome, Database, TriggerSource};
use crate::trigger::JobDispatcher;

const SWEEP_BATCH: i64 = 50;

/// Queue `scheduled_refresh` jobs for unprocessed episodes of
/// auto-processing feeds. Returns how many jobs were created.
pub fn sweep_once(
    db: &Database,
    cooldown: chrono::Duration,
    dispatcher: &JobDispatcher,
    now: DateTime<Utc>,
) -> anyhow::Result<usize> {
    let candidates = db.list_sweep_candidates(SWEEP_BATCH)?;
    let mut created = 0;

    for episode in candidates {
        match db.try_create_job(
            episode.id,
            TriggerSource::ScheduledRefresh,
            None,
            now,
            Some(cooldown),
        )? {
            CreateJobOutcome::Created(job) => {
                log::info!("Scheduled refresh queued job {} for {}", job.id, episode.guid);
                dispatcher.dispatch(&job.id);
                created += 1;
            }
            CreateJobOutcome::ActiveExists => {}
            CreateJobOutcome::CoolingDown { remaining } => {
                log::debug!(
                    "Skipping {}: cooling down for another {}s",
                    episode.guid,
                    remaining.num_seconds()
                );
            }
        }
    }

    Ok(created)
}

/// Run `sweep_once` every `interval` until `shutdown` fires.
pub async fn run_sweep(
    db: Arc<Database>,
    cooldown: chrono::Duration,
    dispatcher: JobDispatcher,
    interval: Duration,
    shutdown: CancellationToken,
) {
    log::info!("Scheduled sweep every {}s", interval.as_secs());
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        match sweep_once(&db, cooldown, &dispatcher, Utc::now()) {
            Ok(0) => {}
            Ok(n) => log::info!("Scheduled sweep queued {} jobs", n),
            Err(e) => log::error!("Scheduled sweep failed: {}", e),
        }
    }
    log::info!("Scheduled sweep stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::JobStatus;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Database) {
        let dir = TempDir::new().unwrap();
        let db = Database::new(&dir.path().join("test.db")).unwrap();
        (dir, db)
    }

    #[tokio::test]
    async fn test_sweep_only_picks_auto_feeds_and_respects_cooldown() {
        let (_dir, db) = setup();
        let auto = db.insert_feed("Auto", true).unwrap();
        let manual = db.insert_feed("Manual", false).unwrap();
        let a1 = db.insert_episode("a1", auto, "A1", "http://x/a1.mp3").unwrap();
        let a2 = db.insert_episode("a2", auto, "A2", "http://x/a2.mp3").unwrap();
        db.set_episode_enabled(a2, false).unwrap();
        db.insert_episode("m1", manual, "M1", "http://x/m1.mp3").unwrap();

        let (dispatcher, mut rx) = JobDispatcher::channel(8);
        let cooldown = chrono::Duration::minutes(10);
        let t0 = Utc::now();

        assert_eq!(sweep_once(&db, cooldown, &dispatcher, t0).unwrap(), 1);
        let job = db.get_active_job(a1).unwrap().unwrap();
        assert_eq!(rx.try_recv().unwrap(), job.id);

        // Active job blocks a second sweep
        assert_eq!(sweep_once(&db, cooldown, &dispatcher, t0).unwrap(), 0);

        // Failed job still holds the cooldown
        db.fail_job(&job.id, "transcribing: boom", t0).unwrap();
        let t5 = t0 + chrono::Duration::minutes(5);
        assert_eq!(sweep_once(&db, cooldown, &dispatcher, t5).unwrap(), 0);

        let t11 = t0 + chrono::Duration::minutes(11);
        assert_eq!(sweep_once(&db, cooldown, &dispatcher, t11).unwrap(), 1);
        assert_eq!(
            db.get_active_job(a1).unwrap().unwrap().status,
            JobStatus::Pending
        );
        assert_eq!(db.count_jobs_for_episode(a1).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_run_sweep_stops_on_shutdown() {
        let (_dir, db) = setup();
        let (dispatcher, _rx) = JobDispatcher::channel(1);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(run_sweep(
            Arc::new(db),
            chrono::Duration::minutes(10),
            dispatcher,
            Duration::from_secs(3600),
            shutdown.clone(),
        ));
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
