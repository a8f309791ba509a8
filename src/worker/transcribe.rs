use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::WhisperConfig;
use crate::database::SegmentDraft;
use crate::error::SegmenterError;

/// Splits source audio into timed text segments.
#[async_trait]
pub trait Segmenter: Send + Sync {
    async fn segment(
        &self,
        audio_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<Vec<SegmentDraft>, SegmenterError>;
}

/// Bounded reruns of the segmenter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub retry_budget: u32,
    pub retry_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &WhisperConfig) -> Self {
        Self {
            retry_budget: config.retry_budget,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        }
    }
}

/// A missing model or audio file will still be missing on a rerun.
fn is_retryable(error: &SegmenterError) -> bool {
    matches!(
        error,
        SegmenterError::Spawn(_)
            | SegmenterError::Failed(_)
            | SegmenterError::Parse(_)
            | SegmenterError::Io(_)
    )
}

/// Run the segmenter, retrying transient failures up to the budget.
/// Cancellation is never retried and cuts a backoff short.
pub async fn segment_with_retry(
    segmenter: &dyn Segmenter,
    audio_path: &Path,
    cancel: &CancellationToken,
    policy: &RetryPolicy,
) -> Result<Vec<SegmentDraft>, SegmenterError> {
    let attempts = policy.retry_budget.saturating_add(1);
    let mut attempt = 1;
    loop {
        match segmenter.segment(audio_path, cancel).await {
            Ok(segments) => return Ok(segments),
            Err(e) if attempt < attempts && is_retryable(&e) && !cancel.is_cancelled() => {
                log::warn!("Segmenter attempt {}/{} failed: {}", attempt, attempts, e);
                tokio::select! {
                    _ = cancel.cancelled() => return Err(SegmenterError::Cancelled),
                    _ = tokio::time::sleep(policy.retry_delay * attempt) => {}
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Runs whisper.cpp's `whisper-cli` and reads its JSON output.
pub struct WhisperSegmenter {
    cli_path: PathBuf,
    model_path: PathBuf,
}

impl WhisperSegmenter {
    pub fn new(config: &WhisperConfig) -> Self {
        Self {
            cli_path: config.cli_path.clone(),
            model_path: config.model_path.clone(),
        }
    }
}

#[async_trait]
impl Segmenter for WhisperSegmenter {
    async fn segment(
        &self,
        audio_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<Vec<SegmentDraft>, SegmenterError> {
        if !audio_path.exists() {
            return Err(SegmenterError::AudioMissing(audio_path.display().to_string()));
        }
        if !self.model_path.exists() {
            return Err(SegmenterError::ModelMissing(
                self.model_path.display().to_string(),
            ));
        }
        if cancel.is_cancelled() {
            return Err(SegmenterError::Cancelled);
        }

        let workdir = tempfile::tempdir()?;
        let output_base = workdir.path().join("transcript");

        log::info!("Running whisper-cli with progress tracking: {:?}", audio_path);

        let mut child = Command::new(&self.cli_path)
            .arg("-m")
            .arg(&self.model_path)
            .arg("-f")
            .arg(audio_path)
            .arg("-oj")
            .arg("-of")
            .arg(&output_base)
            .arg("-pp")
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(SegmenterError::Spawn)?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| SegmenterError::Failed("stderr not captured".to_string()))?;
        let mut reader = BufReader::new(stderr).lines();

        let start_time = chrono::Utc::now();
        let mut last_reported = -1;
        let mut tail: Vec<String> = Vec::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("Killing transcription subprocess");
                    let _ = child.kill().await;
                    return Err(SegmenterError::Cancelled);
                }
                line = reader.next_line() => {
                    match line {
                        Ok(Some(line)) => {
                            if let Some(progress) = parse_progress(&line) {
                                // whisper prints every percent; log in steps of ten
                                if progress / 10 > last_reported / 10 {
                                    last_reported = progress;
                                    let elapsed = chrono::Utc::now()
                                        .signed_duration_since(start_time)
                                        .num_seconds();
                                    let remaining = if progress > 0 {
                                        ((elapsed as f64 / progress as f64 * 100.0) as i64 - elapsed).max(0)
                                    } else {
                                        0
                                    };
                                    log::info!("Transcribing: {}% (about {}s left)", progress, remaining);
                                }
                            } else {
                                if tail.len() == 5 {
                                    tail.remove(0);
                                }
                                tail.push(line);
                            }
                        }
                        Ok(None) => break, // EOF
                        Err(_) => break,
                    }
                }
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(SegmenterError::Failed(format!("{} ({})", status, tail.join(" | "))));
        }

        let json_path = output_base.with_extension("json");
        let raw = tokio::fs::read_to_string(&json_path).await?;
        let segments = validate_segments(parse_whisper_json(&raw)?)?;
        log::info!("Transcription produced {} segments", segments.len());
        Ok(segments)
    }
}

#[derive(Debug, Deserialize)]
struct WhisperOutput {
    transcription: Vec<WhisperEntry>,
}

#[derive(Debug, Deserialize)]
struct WhisperEntry {
    offsets: WhisperOffsets,
    text: String,
}

#[derive(Debug, Deserialize)]
struct WhisperOffsets {
    from: i64,
    to: i64,
}

/// Parse whisper-cli `-oj` output. Offsets are milliseconds.
pub fn parse_whisper_json(raw: &str) -> Result<Vec<SegmentDraft>, SegmenterError> {
    let output: WhisperOutput =
        serde_json::from_str(raw).map_err(|e| SegmenterError::Parse(e.to_string()))?;

    Ok(output
        .transcription
        .into_iter()
        .enumerate()
        .map(|(i, entry)| SegmentDraft {
            sequence_num: i as i64,
            start_time: entry.offsets.from as f64 / 1000.0,
            end_time: entry.offsets.to as f64 / 1000.0,
            text: entry.text,
        })
        .collect())
}

/// Trim text, drop empty segments, and reject out-of-order or negative
/// timings.
pub fn validate_segments(segments: Vec<SegmentDraft>) -> Result<Vec<SegmentDraft>, SegmenterError> {
    let mut out = Vec::with_capacity(segments.len());
    let mut prev_seq: Option<i64> = None;

    for mut segment in segments {
        let seq = segment.sequence_num;
        if let Some(prev) = prev_seq {
            if seq <= prev {
                return Err(SegmenterError::Invalid {
                    sequence_num: seq,
                    reason: format!("follows sequence number {}", prev),
                });
            }
        }
        prev_seq = Some(seq);

        if !segment.start_time.is_finite() || segment.start_time < 0.0 {
            return Err(SegmenterError::Invalid {
                sequence_num: seq,
                reason: format!("start time {} is negative", segment.start_time),
            });
        }
        if !segment.end_time.is_finite() || segment.end_time < segment.start_time {
            return Err(SegmenterError::Invalid {
                sequence_num: seq,
                reason: format!(
                    "end time {} precedes start time {}",
                    segment.end_time, segment.start_time
                ),
            });
        }

        let trimmed = segment.text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.len() != segment.text.len() {
            segment.text = trimmed.to_string();
        }
        out.push(segment);
    }

    Ok(out)
}

/// Parse progress percentage from whisper-cli output
fn parse_progress(line: &str) -> Option<i32> {
    if line.contains("progress") {
        for part in line.split_whitespace() {
            if let Some(num_str) = part.strip_suffix('%') {
                if let Ok(num) = num_str.parse::<i32>() {
                    return Some(num.clamp(0, 100));
                }
            }
            if let Ok(num) = part.parse::<i32>() {
                if (0..=100).contains(&num) {
                    return Some(num);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(seq: i64, start: f64, end: f64, text: &str) -> SegmentDraft {
        SegmentDraft {
            sequence_num: seq,
            start_time: start,
            end_time: end,
            text: text.to_string(),
        }
    }

    #[test]
    fn test_parse_progress() {
        assert_eq!(
            parse_progress("whisper_print_progress_callback: progress =  45%"),
            Some(45)
        );
        assert_eq!(parse_progress("progress = 120%"), Some(100));
        assert_eq!(parse_progress("system_info: n_threads = 4"), None);
    }

    #[test]
    fn test_parse_whisper_json() {
        let raw = r#"{
            "systeminfo": "AVX = 1",
            "transcription": [
                {"timestamps": {"from": "00:00:00,000", "to": "00:00:04,500"},
                 "offsets": {"from": 0, "to": 4500}, "text": " Welcome back to the show."},
                {"timestamps": {"from": "00:00:04,500", "to": "00:00:10,000"},
                 "offsets": {"from": 4500, "to": 10000}, "text": " Today's sponsor is Acme."}
            ]
        }"#;
        let segments = parse_whisper_json(raw).unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[1].sequence_num, 1);
        assert!((segments[0].end_time - 4.5).abs() < 1e-9);
        assert!((segments[1].end_time - 10.0).abs() < 1e-9);

        assert!(matches!(
            parse_whisper_json(r#"{"result": []}"#),
            Err(SegmenterError::Parse(_))
        ));
    }

    #[test]
    fn test_validate_trims_and_drops_empty() {
        let segments = validate_segments(vec![
            draft(0, 0.0, 2.0, "  Hello there. "),
            draft(1, 2.0, 3.0, "   "),
            draft(2, 3.0, 3.0, "[BLANK_AUDIO]"),
        ])
        .unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(segments[0].text, "Hello there.");
        assert_eq!(segments[1].sequence_num, 2);
    }

    #[test]
    fn test_validate_rejects_bad_order_and_timing() {
        let out_of_order = validate_segments(vec![
            draft(1, 0.0, 2.0, "a"),
            draft(1, 2.0, 4.0, "b"),
        ]);
        assert!(matches!(
            out_of_order,
            Err(SegmenterError::Invalid { sequence_num: 1, .. })
        ));

        let negative = validate_segments(vec![draft(0, -0.5, 2.0, "a")]);
        assert!(matches!(negative, Err(SegmenterError::Invalid { .. })));

        let backwards = validate_segments(vec![draft(0, 5.0, 4.0, "a")]);
        assert!(matches!(backwards, Err(SegmenterError::Invalid { .. })));
    }

    #[tokio::test]
    async fn test_missing_audio_is_reported_before_spawn() {
        let segmenter = WhisperSegmenter {
            cli_path: PathBuf::from("/nonexistent/whisper-cli"),
            model_path: PathBuf::from("/nonexistent/model.bin"),
        };
        let result = segmenter
            .segment(Path::new("/nonexistent/audio.mp3"), &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(SegmenterError::AudioMissing(_))));
    }

    /// Fails `failures` times with `error`, then returns one segment.
    struct FlakySegmenter {
        failures: u32,
        error: fn() -> SegmenterError,
        calls: std::sync::atomic::AtomicU32,
    }

    impl FlakySegmenter {
        fn new(failures: u32, error: fn() -> SegmenterError) -> Self {
            Self {
                failures,
                error,
                calls: std::sync::atomic::AtomicU32::new(0),
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(std::sync::atomic::Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Segmenter for FlakySegmenter {
        async fn segment(
            &self,
            _audio_path: &Path,
            _cancel: &CancellationToken,
        ) -> Result<Vec<SegmentDraft>, SegmenterError> {
            let call = self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if call < self.failures {
                return Err((self.error)());
            }
            Ok(vec![draft(0, 0.0, 1.0, "hello")])
        }
    }

    fn retries(retry_budget: u32) -> RetryPolicy {
        RetryPolicy {
            retry_budget,
            retry_delay: Duration::ZERO,
        }
    }

    fn transient() -> SegmenterError {
        SegmenterError::Failed("exit status: 1".to_string())
    }

    #[tokio::test]
    async fn test_segment_retries_transient_failures() {
        let segmenter = FlakySegmenter::new(1, transient);
        let cancel = CancellationToken::new();
        let out = segment_with_retry(&segmenter, Path::new("a.mp3"), &cancel, &retries(1))
            .await
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(segmenter.calls(), 2);
    }

    #[tokio::test]
    async fn test_segment_gives_up_after_budget() {
        let segmenter = FlakySegmenter::new(3, transient);
        let result =
            segment_with_retry(&segmenter, Path::new("a.mp3"), &CancellationToken::new(), &retries(2))
                .await;
        assert!(matches!(result, Err(SegmenterError::Failed(_))));
        assert_eq!(segmenter.calls(), 3);
    }

    #[tokio::test]
    async fn test_segment_does_not_retry_permanent_errors() {
        let missing = FlakySegmenter::new(1, || SegmenterError::ModelMissing("ggml.bin".to_string()));
        let result =
            segment_with_retry(&missing, Path::new("a.mp3"), &CancellationToken::new(), &retries(3))
                .await;
        assert!(matches!(result, Err(SegmenterError::ModelMissing(_))));
        assert_eq!(missing.calls(), 1);

        let cancelled = FlakySegmenter::new(1, || SegmenterError::Cancelled);
        let result =
            segment_with_retry(&cancelled, Path::new("a.mp3"), &CancellationToken::new(), &retries(3))
                .await;
        assert!(matches!(result, Err(SegmenterError::Cancelled)));
        assert_eq!(cancelled.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancel_cuts_retry_backoff_short() {
        let segmenter = FlakySegmenter::new(1, transient);
        let cancel = CancellationToken::new();
        let policy = RetryPolicy {
            retry_budget: 1,
            retry_delay: Duration::from_secs(60),
        };
        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                cancel.cancel();
            })
        };
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            segment_with_retry(&segmenter, Path::new("a.mp3"), &cancel, &policy),
        )
        .await
        .expect("backoff ignored cancellation");
        canceller.await.unwrap();
        assert!(matches!(result, Err(SegmenterError::Cancelled)));
        assert_eq!(segmenter.calls(), 1);
    }
}
