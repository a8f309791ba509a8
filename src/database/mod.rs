pub mod models;
mod presets;


use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

pub use models::*;
pub use presets::DEFAULT_USER_PROMPT_TEMPLATE;

const JOB_COLUMNS: &str = "id, episode_id, status, trigger_source, triggered_by, stage,
                           error_message, created_at, started_at, completed_at";

const EPISODE_COLUMNS: &str = "id, guid, feed_id, title, audio_url, source_audio_path,
                               processed_audio_path, duration, enabled, added_date";

pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        // WAL lets the HTTP side read while the worker writes
        conn.execute_batch(
            "
            PRAGMA busy_timeout=5000;
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA foreign_keys=ON;
        ",
        )?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection mutex poisoned"))
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                auto_process INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS episodes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                guid TEXT NOT NULL UNIQUE,
                feed_id INTEGER NOT NULL,
                title TEXT NOT NULL,
                audio_url TEXT NOT NULL,
                source_audio_path TEXT,
                processed_audio_path TEXT,
                duration REAL,
                enabled INTEGER NOT NULL DEFAULT 1,
                added_date TEXT NOT NULL DEFAULT (datetime('now')),
                FOREIGN KEY (feed_id) REFERENCES feeds(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_episodes_feed ON episodes(feed_id);

            CREATE TABLE IF NOT EXISTS processing_jobs (
                id TEXT PRIMARY KEY,
                episode_id INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                trigger_source TEXT NOT NULL,
                triggered_by INTEGER,
                stage TEXT,
                error_message TEXT,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                FOREIGN KEY (episode_id) REFERENCES episodes(id) ON DELETE CASCADE
            );

            -- At most one pending/running job per episode
            CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_one_active
                ON processing_jobs(episode_id) WHERE status IN ('pending', 'running');
            CREATE INDEX IF NOT EXISTS idx_jobs_episode_created
                ON processing_jobs(episode_id, created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_jobs_status
                ON processing_jobs(status, created_at);

            CREATE TABLE IF NOT EXISTS transcript_segments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                episode_id INTEGER NOT NULL,
                job_id TEXT NOT NULL,
                sequence_num INTEGER NOT NULL,
                start_time REAL NOT NULL,
                end_time REAL NOT NULL,
                text TEXT NOT NULL,
                FOREIGN KEY (episode_id) REFERENCES episodes(id) ON DELETE CASCADE,
                FOREIGN KEY (job_id) REFERENCES processing_jobs(id) ON DELETE CASCADE,
                UNIQUE(job_id, sequence_num)
            );

            CREATE TABLE IF NOT EXISTS classifications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                segment_id INTEGER NOT NULL,
                job_id TEXT NOT NULL,
                label TEXT NOT NULL CHECK (label IN ('ad', 'content')),
                confidence REAL NOT NULL CHECK (confidence >= 0.0 AND confidence <= 1.0),
                rationale TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                FOREIGN KEY (segment_id) REFERENCES transcript_segments(id) ON DELETE CASCADE,
                UNIQUE(segment_id, job_id)
            );

            CREATE INDEX IF NOT EXISTS idx_classifications_job ON classifications(job_id);

            CREATE TABLE IF NOT EXISTS capability_tokens (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                token_id TEXT NOT NULL UNIQUE,
                token_hash TEXT NOT NULL,
                principal INTEGER NOT NULL,
                feed_id INTEGER,            -- NULL = combined (read-only) scope
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                last_used_at TEXT,
                revoked INTEGER NOT NULL DEFAULT 0,
                FOREIGN KEY (feed_id) REFERENCES feeds(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_tokens_principal_feed
                ON capability_tokens(principal, feed_id);

            CREATE TABLE IF NOT EXISTS prompt_presets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                aggressiveness TEXT NOT NULL DEFAULT 'balanced',
                system_prompt TEXT NOT NULL,
                user_prompt_template TEXT NOT NULL,
                min_confidence REAL NOT NULL DEFAULT 0.7,
                is_active INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS processing_statistics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                episode_id INTEGER NOT NULL UNIQUE,
                job_id TEXT NOT NULL,
                intervals_removed INTEGER NOT NULL DEFAULT 0,
                seconds_removed REAL NOT NULL DEFAULT 0.0,
                original_duration REAL NOT NULL,
                processed_duration REAL NOT NULL,
                percentage_removed REAL NOT NULL DEFAULT 0.0,
                strategy TEXT NOT NULL,
                ad_classification_count INTEGER NOT NULL DEFAULT 0,
                preset_id INTEGER,
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                FOREIGN KEY (episode_id) REFERENCES episodes(id) ON DELETE CASCADE,
                FOREIGN KEY (preset_id) REFERENCES prompt_presets(id)
            );
        "#,
        )?;

        presets::seed_presets(&conn)?;

        Ok(())
    }

    // =========================================================================
    // Feeds and episodes
    // =========================================================================

    pub fn insert_feed(&self, title: &str, auto_process: bool) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO feeds (title, auto_process) VALUES (?, ?)",
            params![title, auto_process],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_feed(&self, feed_id: i64) -> Result<Option<Feed>> {
        let conn = self.conn()?;
        let feed = conn
            .query_row(
                "SELECT id, title, auto_process FROM feeds WHERE id = ?",
                params![feed_id],
                |row| {
                    Ok(Feed {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        auto_process: row.get::<_, i32>(2)? == 1,
                    })
                },
            )
            .optional()?;
        Ok(feed)
    }

    pub fn insert_episode(
        &self,
        guid: &str,
        feed_id: i64,
        title: &str,
        audio_url: &str,
    ) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO episodes (guid, feed_id, title, audio_url, added_date)
             VALUES (?, ?, ?, ?, ?)",
            params![guid, feed_id, title, audio_url, Utc::now().to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_episode_by_guid(&self, guid: &str) -> Result<Option<Episode>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM episodes WHERE guid = ?", EPISODE_COLUMNS);
        let episode = conn
            .query_row(&sql, params![guid], episode_from_row)
            .optional()?;
        Ok(episode)
    }

    pub fn get_episode_by_id(&self, id: i64) -> Result<Option<Episode>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM episodes WHERE id = ?", EPISODE_COLUMNS);
        let episode = conn
            .query_row(&sql, params![id], episode_from_row)
            .optional()?;
        Ok(episode)
    }

    pub fn set_episode_enabled(&self, episode_id: i64, enabled: bool) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE episodes SET enabled = ? WHERE id = ?",
            params![enabled, episode_id],
        )?;
        Ok(())
    }

    /// Record where the downloaded source audio lives
    pub fn mark_source_downloaded(&self, episode_id: i64, file_path: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE episodes SET source_audio_path = ? WHERE id = ?",
            params![file_path, episode_id],
        )?;
        Ok(())
    }

    pub fn set_episode_duration(&self, episode_id: i64, duration: f64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE episodes SET duration = ? WHERE id = ?",
            params![duration, episode_id],
        )?;
        Ok(())
    }

    /// Enabled, unprocessed episodes of auto-processing feeds with no active job
    pub fn list_sweep_candidates(&self, limit: i64) -> Result<Vec<Episode>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM episodes e
             WHERE e.enabled = 1
               AND e.processed_audio_path IS NULL
               AND EXISTS (SELECT 1 FROM feeds f WHERE f.id = e.feed_id AND f.auto_process = 1)
               AND NOT EXISTS (
                   SELECT 1 FROM processing_jobs j
                   WHERE j.episode_id = e.id AND j.status IN ('pending', 'running'))
             ORDER BY e.added_date DESC
             LIMIT ?",
            EPISODE_COLUMNS
                .split(',')
                .map(|c| format!("e.{}", c.trim()))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let mut stmt = conn.prepare(&sql)?;
        let episodes = stmt
            .query_map(params![limit], episode_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(episodes)
    }

    // =========================================================================
    // Processing jobs
    // =========================================================================

    /// Open a new pending job for an episode.
    ///
    /// Runs under an immediate transaction so the active-job check, the
    /// cooldown check (derived from the latest job's `created_at`) and the
    /// insert are one atomic step. A unique-index violation from a concurrent
    /// writer resolves to `ActiveExists`.
    pub fn try_create_job(
        &self,
        episode_id: i64,
        source: TriggerSource,
        triggered_by: Option<i64>,
        now: DateTime<Utc>,
        cooldown: Option<chrono::Duration>,
    ) -> Result<CreateJobOutcome> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let active: Option<String> = tx
            .query_row(
                "SELECT id FROM processing_jobs
                 WHERE episode_id = ? AND status IN ('pending', 'running') LIMIT 1",
                params![episode_id],
                |row| row.get(0),
            )
            .optional()?;
        if active.is_some() {
            return Ok(CreateJobOutcome::ActiveExists);
        }

        if let Some(window) = cooldown {
            let last: Option<DateTime<Utc>> = tx.query_row(
                "SELECT MAX(created_at) FROM processing_jobs WHERE episode_id = ?",
                params![episode_id],
                |row| row.get(0),
            )?;
            if let Some(last) = last {
                let elapsed = now - last;
                if elapsed < window {
                    let remaining = (window - elapsed).min(window);
                    return Ok(CreateJobOutcome::CoolingDown { remaining });
                }
            }
        }

        let job = match insert_pending_job(&tx, episode_id, source, triggered_by, now)? {
            Some(job) => job,
            None => return Ok(CreateJobOutcome::ActiveExists),
        };

        tx.commit()?;
        Ok(CreateJobOutcome::Created(job))
    }

    /// Cancel whatever job is active for the episode and open a `reprocess`
    /// job in its place, in one transaction. Returns the number of jobs
    /// cancelled alongside the new job.
    pub fn supersede_with_reprocess(
        &self,
        episode_id: i64,
        triggered_by: Option<i64>,
        now: DateTime<Utc>,
    ) -> Result<(usize, ProcessingJob)> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let cancelled = tx.execute(
            "UPDATE processing_jobs SET status = 'cancelled', completed_at = ?
             WHERE episode_id = ? AND status IN ('pending', 'running')",
            params![now, episode_id],
        )?;

        let job = insert_pending_job(&tx, episode_id, TriggerSource::Reprocess, triggered_by, now)?
            .ok_or_else(|| anyhow!("active job reappeared for episode {}", episode_id))?;

        tx.commit()?;
        Ok((cancelled, job))
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<ProcessingJob>> {
        let conn = self.conn()?;
        query_job(&conn, job_id)
    }

    pub fn get_active_job(&self, episode_id: i64) -> Result<Option<ProcessingJob>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM processing_jobs
             WHERE episode_id = ? AND status IN ('pending', 'running') LIMIT 1",
            JOB_COLUMNS
        );
        let job = conn.query_row(&sql, params![episode_id], job_from_row).optional()?;
        Ok(job)
    }

    pub fn get_latest_job(&self, episode_id: i64) -> Result<Option<ProcessingJob>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM processing_jobs
             WHERE episode_id = ? ORDER BY created_at DESC LIMIT 1",
            JOB_COLUMNS
        );
        let job = conn.query_row(&sql, params![episode_id], job_from_row).optional()?;
        Ok(job)
    }

    /// Last trigger time for an episode; this is the durable cooldown record.
    pub fn latest_job_created_at(&self, episode_id: i64) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn()?;
        let last = conn.query_row(
            "SELECT MAX(created_at) FROM processing_jobs WHERE episode_id = ?",
            params![episode_id],
            |row| row.get(0),
        )?;
        Ok(last)
    }

    pub fn list_active_jobs(&self, limit: i64) -> Result<Vec<ProcessingJob>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM processing_jobs
             WHERE status IN ('pending', 'running')
             ORDER BY created_at ASC LIMIT ?",
            JOB_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let jobs = stmt
            .query_map(params![limit], job_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    /// Job history, newest first, optionally narrowed to one status.
    pub fn list_jobs(&self, limit: i64, status: Option<JobStatus>) -> Result<Vec<ProcessingJob>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM processing_jobs
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY created_at DESC LIMIT ?2",
            JOB_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let jobs = stmt
            .query_map(params![status.map(|s| s.as_str()), limit], job_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    pub fn count_jobs_for_episode(&self, episode_id: i64) -> Result<i64> {
        let conn = self.conn()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM processing_jobs WHERE episode_id = ?",
            params![episode_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Move the oldest pending job to running and return it.
    pub fn claim_next_pending_job(&self, now: DateTime<Utc>) -> Result<Option<ProcessingJob>> {
        let conn = self.conn()?;
        let next: Option<String> = conn
            .query_row(
                "SELECT id FROM processing_jobs WHERE status = 'pending'
                 ORDER BY created_at ASC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        let Some(job_id) = next else {
            return Ok(None);
        };

        // Another process may have claimed it between the two statements
        let claimed = conn.execute(
            "UPDATE processing_jobs SET status = 'running', started_at = ?, stage = 'starting'
             WHERE id = ? AND status = 'pending'",
            params![now, job_id],
        )?;
        if claimed == 0 {
            return Ok(None);
        }

        query_job(&conn, &job_id)
    }

    pub fn job_status(&self, job_id: &str) -> Result<Option<JobStatus>> {
        let conn = self.conn()?;
        let status = conn
            .query_row(
                "SELECT status FROM processing_jobs WHERE id = ?",
                params![job_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(status.map(JobStatus::from))
    }

    pub fn set_job_stage(&self, job_id: &str, stage: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE processing_jobs SET stage = ? WHERE id = ? AND status = 'running'",
            params![stage, job_id],
        )?;
        Ok(())
    }

    /// Returns false if the job had already left the active states.
    pub fn fail_job(&self, job_id: &str, error: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE processing_jobs SET status = 'failed', error_message = ?, completed_at = ?
             WHERE id = ? AND status IN ('pending', 'running')",
            params![error, now, job_id],
        )?;
        Ok(updated > 0)
    }

    pub fn cancel_job(&self, job_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE processing_jobs SET status = 'cancelled', completed_at = ?
             WHERE id = ? AND status IN ('pending', 'running')",
            params![now, job_id],
        )?;
        Ok(updated > 0)
    }

    /// Finish a job: the status flip, the episode's processed path and the
    /// statistics row are written together, and only if the job is still
    /// running. Returns false when the job was cancelled in the meantime.
    pub fn complete_job(
        &self,
        job_id: &str,
        processed_path: &str,
        stats: &ProcessingStatistics,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let updated = tx.execute(
            "UPDATE processing_jobs SET status = 'completed', stage = 'done', completed_at = ?
             WHERE id = ? AND status = 'running'",
            params![now, job_id],
        )?;
        if updated == 0 {
            return Ok(false);
        }

        tx.execute(
            "UPDATE episodes SET processed_audio_path = ?, duration = ? WHERE id = ?",
            params![processed_path, stats.original_duration, stats.episode_id],
        )?;

        tx.execute(
            "INSERT INTO processing_statistics
                (episode_id, job_id, intervals_removed, seconds_removed, original_duration,
                 processed_duration, percentage_removed, strategy, ad_classification_count,
                 preset_id, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))
             ON CONFLICT(episode_id) DO UPDATE SET
                job_id = excluded.job_id,
                intervals_removed = excluded.intervals_removed,
                seconds_removed = excluded.seconds_removed,
                original_duration = excluded.original_duration,
                processed_duration = excluded.processed_duration,
                percentage_removed = excluded.percentage_removed,
                strategy = excluded.strategy,
                ad_classification_count = excluded.ad_classification_count,
                preset_id = excluded.preset_id,
                updated_at = excluded.updated_at",
            params![
                stats.episode_id,
                stats.job_id,
                stats.intervals_removed,
                stats.seconds_removed,
                stats.original_duration,
                stats.processed_duration,
                stats.percentage_removed,
                stats.strategy.as_str(),
                stats.ad_classification_count,
                stats.preset_id,
            ],
        )?;

        tx.commit()?;
        Ok(true)
    }

    /// Reset jobs left running by a previous process (recovery after crash).
    /// They rerun from the first stage.
    pub fn reset_stuck_jobs(&self) -> Result<usize> {
        let conn = self.conn()?;
        let count = conn.execute(
            "UPDATE processing_jobs SET status = 'pending', started_at = NULL, stage = NULL
             WHERE status = 'running'",
            [],
        )?;
        if count > 0 {
            log::info!("Reset {} interrupted jobs to pending", count);
        }
        Ok(count)
    }

    // =========================================================================
    // Transcript segments and classifications
    // =========================================================================

    pub fn insert_segments(
        &self,
        episode_id: i64,
        job_id: &str,
        segments: &[SegmentDraft],
    ) -> Result<Vec<TranscriptSegment>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut stored = Vec::with_capacity(segments.len());
        {
            let mut stmt = tx.prepare(
                "INSERT INTO transcript_segments
                    (episode_id, job_id, sequence_num, start_time, end_time, text)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )?;
            for seg in segments {
                stmt.execute(params![
                    episode_id,
                    job_id,
                    seg.sequence_num,
                    seg.start_time,
                    seg.end_time,
                    seg.text
                ])?;
                stored.push(TranscriptSegment {
                    id: tx.last_insert_rowid(),
                    episode_id,
                    job_id: job_id.to_string(),
                    sequence_num: seg.sequence_num,
                    start_time: seg.start_time,
                    end_time: seg.end_time,
                    text: seg.text.clone(),
                });
            }
        }
        tx.commit()?;
        Ok(stored)
    }

    pub fn get_segments_for_job(&self, job_id: &str) -> Result<Vec<TranscriptSegment>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, episode_id, job_id, sequence_num, start_time, end_time, text
             FROM transcript_segments WHERE job_id = ? ORDER BY sequence_num",
        )?;
        let segments = stmt
            .query_map(params![job_id], |row| {
                Ok(TranscriptSegment {
                    id: row.get(0)?,
                    episode_id: row.get(1)?,
                    job_id: row.get(2)?,
                    sequence_num: row.get(3)?,
                    start_time: row.get(4)?,
                    end_time: row.get(5)?,
                    text: row.get(6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(segments)
    }

    /// Store a batch of verdicts, keyed by the segment's sequence number within the job
    pub fn insert_classifications(
        &self,
        job_id: &str,
        classifications: &[ClassificationDraft],
    ) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO classifications (segment_id, job_id, label, confidence, rationale)
                 SELECT id, job_id, ?, ?, ? FROM transcript_segments
                 WHERE job_id = ? AND sequence_num = ?",
            )?;
            for c in classifications {
                inserted += stmt.execute(params![
                    c.label.as_str(),
                    c.confidence,
                    c.rationale,
                    job_id,
                    c.sequence_num
                ])?;
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    pub fn get_classified_segments(&self, job_id: &str) -> Result<Vec<ClassifiedSegment>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT s.id, s.sequence_num, s.start_time, s.end_time, c.label, c.confidence
             FROM classifications c
             JOIN transcript_segments s ON s.id = c.segment_id
             WHERE c.job_id = ?
             ORDER BY s.sequence_num",
        )?;
        let rows = stmt
            .query_map(params![job_id], |row| {
                Ok(ClassifiedSegment {
                    segment_id: row.get(0)?,
                    sequence_num: row.get(1)?,
                    start_time: row.get(2)?,
                    end_time: row.get(3)?,
                    label: row.get::<_, String>(4)?.into(),
                    confidence: row.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // =========================================================================
    // Capability tokens
    // =========================================================================

    /// Store a token hash for (principal, feed). An existing live token for the
    /// same pair is rotated in place, so each pair owns at most one row.
    /// Returns the token id now associated with the pair.
    pub fn upsert_token(
        &self,
        principal: i64,
        feed_id: Option<i64>,
        token_id: &str,
        token_hash: &str,
    ) -> Result<String> {
        let conn = self.conn()?;
        let existing: Option<String> = conn
            .query_row(
                "SELECT token_id FROM capability_tokens
                 WHERE principal = ? AND feed_id IS ? AND revoked = 0 LIMIT 1",
                params![principal, feed_id],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(existing_id) => {
                conn.execute(
                    "UPDATE capability_tokens SET token_hash = ? WHERE token_id = ?",
                    params![token_hash, existing_id],
                )?;
                Ok(existing_id)
            }
            None => {
                conn.execute(
                    "INSERT INTO capability_tokens (token_id, token_hash, principal, feed_id)
                     VALUES (?, ?, ?, ?)",
                    params![token_id, token_hash, principal, feed_id],
                )?;
                Ok(token_id.to_string())
            }
        }
    }

    pub fn get_token(&self, token_id: &str) -> Result<Option<CapabilityToken>> {
        let conn = self.conn()?;
        let token = conn
            .query_row(
                "SELECT id, token_id, token_hash, principal, feed_id, created_at, last_used_at, revoked
                 FROM capability_tokens WHERE token_id = ?",
                params![token_id],
                |row| {
                    Ok(CapabilityToken {
                        id: row.get(0)?,
                        token_id: row.get(1)?,
                        token_hash: row.get(2)?,
                        principal: row.get(3)?,
                        scope: TokenScope::from_feed_id(row.get(4)?),
                        created_at: row.get(5)?,
                        last_used_at: row.get(6)?,
                        revoked: row.get::<_, i32>(7)? == 1,
                    })
                },
            )
            .optional()?;
        Ok(token)
    }

    pub fn touch_token(&self, token_id: &str, now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE capability_tokens SET last_used_at = ? WHERE token_id = ?",
            params![now.to_rfc3339(), token_id],
        )?;
        Ok(())
    }

    pub fn revoke_token(&self, token_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE capability_tokens SET revoked = 1 WHERE token_id = ? AND revoked = 0",
            params![token_id],
        )?;
        Ok(updated > 0)
    }

    // =========================================================================
    // Presets and statistics
    // =========================================================================

    pub fn get_active_preset(&self) -> Result<Option<PromptPreset>> {
        let conn = self.conn()?;
        let preset = conn
            .query_row(
                "SELECT id, name, aggressiveness, system_prompt, user_prompt_template,
                        min_confidence, is_active
                 FROM prompt_presets WHERE is_active = 1 ORDER BY id LIMIT 1",
                [],
                preset_from_row,
            )
            .optional()?;
        Ok(preset)
    }

    pub fn list_presets(&self) -> Result<Vec<PromptPreset>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, aggressiveness, system_prompt, user_prompt_template,
                    min_confidence, is_active
             FROM prompt_presets ORDER BY id",
        )?;
        let presets = stmt
            .query_map([], preset_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(presets)
    }

    /// Make the named preset the only active one. Returns false if no preset has that name.
    pub fn set_active_preset(&self, name: &str) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let exists: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM prompt_presets WHERE name = ?)",
            params![name],
            |row| row.get(0),
        )?;
        if !exists {
            return Ok(false);
        }
        tx.execute("UPDATE prompt_presets SET is_active = 0", [])?;
        tx.execute(
            "UPDATE prompt_presets SET is_active = 1 WHERE name = ?",
            params![name],
        )?;
        tx.commit()?;
        Ok(true)
    }

    pub fn get_statistics(&self, episode_id: i64) -> Result<Option<ProcessingStatistics>> {
        let conn = self.conn()?;
        let stats = conn
            .query_row(
                "SELECT episode_id, job_id, intervals_removed, seconds_removed, original_duration,
                        processed_duration, percentage_removed, strategy,
                        ad_classification_count, preset_id
                 FROM processing_statistics WHERE episode_id = ?",
                params![episode_id],
                |row| {
                    Ok(ProcessingStatistics {
                        episode_id: row.get(0)?,
                        job_id: row.get(1)?,
                        intervals_removed: row.get(2)?,
                        seconds_removed: row.get(3)?,
                        original_duration: row.get(4)?,
                        processed_duration: row.get(5)?,
                        percentage_removed: row.get(6)?,
                        strategy: row.get::<_, String>(7)?.into(),
                        ad_classification_count: row.get(8)?,
                        preset_id: row.get(9)?,
                    })
                },
            )
            .optional()?;
        Ok(stats)
    }
}

/// Insert a pending job. `None` means the one-active-job index rejected it.
fn insert_pending_job(
    conn: &Connection,
    episode_id: i64,
    source: TriggerSource,
    triggered_by: Option<i64>,
    now: DateTime<Utc>,
) -> Result<Option<ProcessingJob>> {
    let job = ProcessingJob {
        id: Uuid::new_v4().to_string(),
        episode_id,
        status: JobStatus::Pending,
        trigger_source: source,
        triggered_by,
        stage: None,
        error_message: None,
        created_at: now,
        started_at: None,
        completed_at: None,
    };

    let inserted = conn.execute(
        "INSERT INTO processing_jobs (id, episode_id, status, trigger_source, triggered_by, created_at)
         VALUES (?, ?, 'pending', ?, ?, ?)",
        params![job.id, episode_id, source.as_str(), triggered_by, now],
    );
    match inserted {
        Ok(_) => Ok(Some(job)),
        Err(rusqlite::Error::SqliteFailure(err, _))
            if err.code == ErrorCode::ConstraintViolation
                && err.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

fn query_job(conn: &Connection, job_id: &str) -> Result<Option<ProcessingJob>> {
    let sql = format!("SELECT {} FROM processing_jobs WHERE id = ?", JOB_COLUMNS);
    let job = conn.query_row(&sql, params![job_id], job_from_row).optional()?;
    Ok(job)
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<ProcessingJob> {
    Ok(ProcessingJob {
        id: row.get(0)?,
        episode_id: row.get(1)?,
        status: row.get::<_, String>(2)?.into(),
        trigger_source: row.get::<_, String>(3)?.into(),
        triggered_by: row.get(4)?,
        stage: row.get(5)?,
        error_message: row.get(6)?,
        created_at: row.get(7)?,
        started_at: row.get(8)?,
        completed_at: row.get(9)?,
    })
}

fn episode_from_row(row: &Row<'_>) -> rusqlite::Result<Episode> {
    Ok(Episode {
        id: row.get(0)?,
        guid: row.get(1)?,
        feed_id: row.get(2)?,
        title: row.get(3)?,
        audio_url: row.get(4)?,
        source_audio_path: row.get(5)?,
        processed_audio_path: row.get(6)?,
        duration: row.get(7)?,
        enabled: row.get::<_, i32>(8)? == 1,
        added_date: row.get(9)?,
    })
}

fn preset_from_row(row: &Row<'_>) -> rusqlite::Result<PromptPreset> {
    Ok(PromptPreset {
        id: row.get(0)?,
        name: row.get(1)?,
        aggressiveness: row.get(2)?,
        system_prompt: row.get(3)?,
        user_prompt_template: row.get(4)?,
        min_confidence: row.get(5)?,
        is_active: row.get::<_, i32>(6)? == 1,
    })
}
