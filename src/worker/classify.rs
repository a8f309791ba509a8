//! Batched segment classification with bounded retry.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

use crate::database::{ClassificationDraft, Label, PromptPreset, TranscriptSegment};
use crate::error::ClassifierError;

#[async_trait]
pub trait Classifier: Send + Sync {
    /// Classify one batch. Segments missing from the result are content.
    async fn classify(
        &self,
        preset: &PromptPreset,
        podcast_title: &str,
        batch: &[TranscriptSegment],
    ) -> Result<Vec<ClassificationDraft>, ClassifierError>;
}

#[derive(Debug, Clone)]
pub struct BatchPolicy {
    pub batch_size: usize,
    /// Retries after the first attempt.
    pub retry_budget: u32,
    pub retry_delay: Duration,
}

/// Wire format expected from the model.
#[derive(Debug, Deserialize)]
pub struct ClassificationResponse {
    pub classifications: Vec<RawClassification>,
}

#[derive(Debug, Deserialize)]
pub struct RawClassification {
    pub sequence_num: i64,
    pub label: String,
    pub confidence: f64,
    #[serde(default)]
    pub rationale: Option<String>,
}

/// Check a parsed response against the batch it answers.
pub fn validate_response(
    response: ClassificationResponse,
    batch: &[TranscriptSegment],
) -> Result<Vec<ClassificationDraft>, ClassifierError> {
    let expected: HashSet<i64> = batch.iter().map(|s| s.sequence_num).collect();
    let mut seen = HashSet::new();
    let mut drafts = Vec::with_capacity(response.classifications.len());

    for raw in response.classifications {
        let label = match raw.label.trim().to_ascii_lowercase().as_str() {
            "ad" => Label::Ad,
            "content" => Label::Content,
            other => {
                return Err(ClassifierError::Invalid(format!(
                    "segment {} has unknown label {:?}",
                    raw.sequence_num, other
                )))
            }
        };
        if !raw.confidence.is_finite() || !(0.0..=1.0).contains(&raw.confidence) {
            return Err(ClassifierError::Invalid(format!(
                "segment {} has confidence {} outside [0, 1]",
                raw.sequence_num, raw.confidence
            )));
        }
        if !expected.contains(&raw.sequence_num) {
            return Err(ClassifierError::Invalid(format!(
                "sequence number {} is not in this batch",
                raw.sequence_num
            )));
        }
        if !seen.insert(raw.sequence_num) {
            return Err(ClassifierError::Invalid(format!(
                "segment {} classified twice",
                raw.sequence_num
            )));
        }
        drafts.push(ClassificationDraft {
            sequence_num: raw.sequence_num,
            label,
            confidence: raw.confidence,
            rationale: raw.rationale.filter(|r| !r.trim().is_empty()),
        });
    }

    drafts.sort_by_key(|d| d.sequence_num);
    Ok(drafts)
}

/// `[seq] [start-end] text`, one line per segment.
pub fn render_transcript(batch: &[TranscriptSegment]) -> String {
    batch
        .iter()
        .map(|s| {
            format!(
                "[{}] [{:.1}-{:.1}] {}",
                s.sequence_num, s.start_time, s.end_time, s.text
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn render_user_prompt(template: &str, podcast_title: &str, batch: &[TranscriptSegment]) -> String {
    template
        .replace("{{podcast_title}}", podcast_title)
        .replace("{{transcript}}", &render_transcript(batch))
}

/// Classify one batch, retrying up to `retry_budget` times.
pub async fn classify_batch_with_retry(
    classifier: &dyn Classifier,
    preset: &PromptPreset,
    podcast_title: &str,
    batch: &[TranscriptSegment],
    policy: &BatchPolicy,
) -> Result<Vec<ClassificationDraft>, ClassifierError> {
    let attempts = policy.retry_budget + 1;
    let mut attempt = 1;
    loop {
        match classifier.classify(preset, podcast_title, batch).await {
            Ok(drafts) => return Ok(drafts),
            Err(e) if attempt < attempts => {
                log::warn!(
                    "Classifier attempt {}/{} failed for segments {}-{}: {}",
                    attempt,
                    attempts,
                    batch.first().map(|s| s.sequence_num).unwrap_or_default(),
                    batch.last().map(|s| s.sequence_num).unwrap_or_default(),
                    e
                );
                attempt += 1;
                if !policy.retry_delay.is_zero() {
                    tokio::time::sleep(policy.retry_delay * attempt).await;
                }
            }
            Err(e) => return Err(e),
        }
    }
}
