use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Processing jobs
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Pending and running jobs hold the episode's single active slot.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for JobStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "pending" => Self::Pending,
            "running" => Self::Running,
            "completed" => Self::Completed,
            "cancelled" => Self::Cancelled,
            // Unknown values are treated as terminal so they never block an episode
            _ => Self::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Manual,
    Reprocess,
    OnDemandRequest,
    ScheduledRefresh,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Reprocess => "reprocess",
            Self::OnDemandRequest => "on_demand_request",
            Self::ScheduledRefresh => "scheduled_refresh",
        }
    }
}

impl std::fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for TriggerSource {
    fn from(s: String) -> Self {
        match s.as_str() {
            "reprocess" => Self::Reprocess,
            "on_demand_request" => Self::OnDemandRequest,
            "scheduled_refresh" => Self::ScheduledRefresh,
            _ => Self::Manual,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingJob {
    pub id: String,
    pub episode_id: i64,
    pub status: JobStatus,
    pub trigger_source: TriggerSource,
    pub triggered_by: Option<i64>,
    pub stage: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Result of an attempt to open a new job for an episode.
#[derive(Debug, Clone)]
pub enum CreateJobOutcome {
    Created(ProcessingJob),
    /// Another pending/running job holds the slot (including a lost insert race).
    ActiveExists,
    /// The latest job for the episode is younger than the cooldown window.
    CoolingDown { remaining: chrono::Duration },
}

// ============================================================================
// Feeds and episodes
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feed {
    pub id: i64,
    pub title: String,
    pub auto_process: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub id: i64,
    pub guid: String,
    pub feed_id: i64,
    pub title: String,
    pub audio_url: String,
    pub source_audio_path: Option<String>,
    pub processed_audio_path: Option<String>,
    pub duration: Option<f64>,
    pub enabled: bool,
    pub added_date: String,
}

impl Episode {
    /// The processed artifact is only servable if the file is still on disk.
    pub fn processed_artifact(&self) -> Option<&str> {
        self.processed_audio_path
            .as_deref()
            .filter(|p| std::path::Path::new(p).exists())
    }

    pub fn source_audio(&self) -> Option<&str> {
        self.source_audio_path
            .as_deref()
            .filter(|p| std::path::Path::new(p).exists())
    }
}

// ============================================================================
// Transcripts and classifications
// ============================================================================

/// A segment as produced by the segmenter, before it is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentDraft {
    pub sequence_num: i64,
    pub start_time: f64,
    pub end_time: f64,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub id: i64,
    pub episode_id: i64,
    pub job_id: String,
    pub sequence_num: i64,
    pub start_time: f64,
    pub end_time: f64,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Label {
    Ad,
    Content,
}

impl Label {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ad => "ad",
            Self::Content => "content",
        }
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for Label {
    fn from(s: String) -> Self {
        match s.as_str() {
            "ad" => Self::Ad,
            _ => Self::Content,
        }
    }
}

/// A validated classifier verdict for one segment of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationDraft {
    pub sequence_num: i64,
    pub label: Label,
    pub confidence: f64,
    pub rationale: Option<String>,
}

/// A stored classification joined with the segment it labels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifiedSegment {
    pub segment_id: i64,
    pub sequence_num: i64,
    pub start_time: f64,
    pub end_time: f64,
    pub label: Label,
    pub confidence: f64,
}

// ============================================================================
// Capability tokens
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "feed_id")]
pub enum TokenScope {
    FeedScoped(i64),
    /// Read-only access across every feed the principal can see.
    Combined,
}

impl TokenScope {
    pub fn from_feed_id(feed_id: Option<i64>) -> Self {
        match feed_id {
            Some(id) => Self::FeedScoped(id),
            None => Self::Combined,
        }
    }

    pub fn feed_id(&self) -> Option<i64> {
        match self {
            Self::FeedScoped(id) => Some(*id),
            Self::Combined => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CapabilityToken {
    pub id: i64,
    pub token_id: String,
    pub token_hash: String,
    pub principal: i64,
    pub scope: TokenScope,
    pub created_at: String,
    pub last_used_at: Option<String>,
    pub revoked: bool,
}

// ============================================================================
// Presets and statistics
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptPreset {
    pub id: i64,
    pub name: String,
    pub aggressiveness: String,
    pub system_prompt: String,
    pub user_prompt_template: String,
    pub min_confidence: f64,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CutStrategy {
    Passthrough,
    Filtergraph,
    Concat,
}

impl CutStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Passthrough => "passthrough",
            Self::Filtergraph => "filtergraph",
            Self::Concat => "concat",
        }
    }
}

impl From<String> for CutStrategy {
    fn from(s: String) -> Self {
        match s.as_str() {
            "filtergraph" => Self::Filtergraph,
            "concat" => Self::Concat,
            _ => Self::Passthrough,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingStatistics {
    pub episode_id: i64,
    pub job_id: String,
    pub intervals_removed: i64,
    pub seconds_removed: f64,
    pub original_duration: f64,
    pub processed_duration: f64,
    pub percentage_removed: f64,
    pub strategy: CutStrategy,
    pub ad_classification_count: i64,
    pub preset_id: Option<i64>,
}
