//! Apply removal intervals to source audio with ffmpeg.
//!
//! The primary strategy renders every keep interval through a single
//! filtergraph with short fades at each cut. If that fails, or the plan has
//! too many intervals for one graph, each keep interval is extracted to its
//! own file and the files are joined with the concat demuxer.

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

use super::merge::{merge_intervals, Interval};
use crate::config::CutterConfig;
use crate::database::CutStrategy;
use crate::error::CutError;

/// Removal intervals and their complement over `[0, duration]`.
#[derive(Debug, Clone, PartialEq)]
pub struct CutPlan {
    pub duration: f64,
    pub removals: Vec<Interval>,
    pub keeps: Vec<Interval>,
}

impl CutPlan {
    pub fn new(duration: f64, removals: &[Interval]) -> Self {
        let clamped = removals
            .iter()
            .map(|r| Interval::new(r.start.clamp(0.0, duration), r.end.clamp(0.0, duration)))
            .collect();
        let removals = merge_intervals(clamped, 0.0);

        let mut keeps = Vec::with_capacity(removals.len() + 1);
        let mut cursor = 0.0;
        for r in &removals {
            if r.start > cursor {
                keeps.push(Interval::new(cursor, r.start));
            }
            cursor = r.end;
        }
        if duration > cursor {
            keeps.push(Interval::new(cursor, duration));
        }

        Self {
            duration,
            removals,
            keeps,
        }
    }

    pub fn removed_seconds(&self) -> f64 {
        self.removals.iter().map(Interval::len).sum()
    }

    pub fn kept_seconds(&self) -> f64 {
        self.keeps.iter().map(Interval::len).sum()
    }

    /// Drop keep intervals shorter than `min_keep`, widening the removals
    /// around them.
    pub fn fold_short_keeps(&self, min_keep: f64) -> CutPlan {
        if self.keeps.iter().all(|k| k.len() >= min_keep) {
            return self.clone();
        }
        let mut removals = self.removals.clone();
        removals.extend(self.keeps.iter().filter(|k| k.len() < min_keep).copied());
        CutPlan::new(self.duration, &removals)
    }
}

/// What was actually written: the strategy that succeeded and the plan it applied.
#[derive(Debug, Clone)]
pub struct CutOutcome {
    pub strategy: CutStrategy,
    pub plan: CutPlan,
}

#[async_trait]
pub trait Cutter: Send + Sync {
    async fn probe_duration(&self, source: &Path) -> Result<f64, CutError>;

    async fn cut(&self, source: &Path, output: &Path, plan: &CutPlan)
        -> Result<CutOutcome, CutError>;
}

pub struct FfmpegCutter {
    ffmpeg: String,
    ffprobe: String,
    fade_seconds: f64,
    max_filtergraph_intervals: usize,
    min_keep_seconds: f64,
}

impl FfmpegCutter {
    pub fn new(config: &CutterConfig) -> Self {
        Self {
            ffmpeg: config.ffmpeg_path.clone(),
            ffprobe: config.ffprobe_path.clone(),
            fade_seconds: config.fade_seconds.max(0.0),
            max_filtergraph_intervals: config.max_filtergraph_intervals,
            min_keep_seconds: config.min_keep_seconds.max(0.0),
        }
    }

    async fn cut_filtergraph(
        &self,
        source: &Path,
        output: &Path,
        plan: &CutPlan,
    ) -> Result<(), CutError> {
        let graph = build_filtergraph(plan, self.fade_seconds);
        log::debug!("Filtergraph: {}", graph);
        let args: Vec<String> = vec![
            "-y".into(),
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-i".into(),
            source.to_string_lossy().into_owned(),
            "-filter_complex".into(),
            graph,
            "-map".into(),
            "[out]".into(),
            "-vn".into(),
            "-c:a".into(),
            "libmp3lame".into(),
            "-q:a".into(),
            "2".into(),
            output.to_string_lossy().into_owned(),
        ];
        run_tool(&self.ffmpeg, &args).await.map(|_| ())
    }

    async fn cut_concat(
        &self,
        source: &Path,
        output: &Path,
        plan: &CutPlan,
    ) -> Result<(), CutError> {
        let scratch = tempfile::Builder::new().prefix("adstrip-cut").tempdir()?;
        let mut list = String::new();

        for (i, keep) in plan.keeps.iter().enumerate() {
            let part = scratch.path().join(format!("part_{:04}.mp3", i));
            let args: Vec<String> = vec![
                "-y".into(),
                "-hide_banner".into(),
                "-loglevel".into(),
                "error".into(),
                "-ss".into(),
                format!("{:.3}", keep.start),
                "-t".into(),
                format!("{:.3}", keep.len()),
                "-i".into(),
                source.to_string_lossy().into_owned(),
                "-vn".into(),
                "-c:a".into(),
                "libmp3lame".into(),
                "-q:a".into(),
                "2".into(),
                part.to_string_lossy().into_owned(),
            ];
            run_tool(&self.ffmpeg, &args).await?;
            list.push_str(&concat_list_entry(&part));
        }

        let list_path = scratch.path().join("parts.txt");
        tokio::fs::write(&list_path, list).await?;

        let args: Vec<String> = vec![
            "-y".into(),
            "-hide_banner".into(),
            "-loglevel".into(),
            "error".into(),
            "-f".into(),
            "concat".into(),
            "-safe".into(),
            "0".into(),
            "-i".into(),
            list_path.to_string_lossy().into_owned(),
            "-c".into(),
            "copy".into(),
            output.to_string_lossy().into_owned(),
        ];
        run_tool(&self.ffmpeg, &args).await.map(|_| ())
    }

    async fn fallback(
        &self,
        source: &Path,
        output: &Path,
        plan: &CutPlan,
    ) -> Result<CutOutcome, CutError> {
        let applied = plan.fold_short_keeps(self.min_keep_seconds);
        if applied.keeps.is_empty() {
            return Err(CutError::NoKeepIntervals {
                duration: applied.duration,
                removed: applied.removed_seconds(),
            });
        }
        self.cut_concat(source, output, &applied).await?;
        Ok(CutOutcome {
            strategy: CutStrategy::Concat,
            plan: applied,
        })
    }
}

#[async_trait]
impl Cutter for FfmpegCutter {
    async fn probe_duration(&self, source: &Path) -> Result<f64, CutError> {
        let args: Vec<String> = vec![
            "-v".into(),
            "error".into(),
            "-show_entries".into(),
            "format=duration".into(),
            "-of".into(),
            "default=noprint_wrappers=1:nokey=1".into(),
            source.to_string_lossy().into_owned(),
        ];
        let stdout = run_tool(&self.ffprobe, &args).await?;
        stdout.trim().parse::<f64>().map_err(|_| CutError::Ffmpeg {
            status: "ok".to_string(),
            stderr: format!("ffprobe returned no duration: {:?}", stdout.trim()),
        })
    }

    async fn cut(
        &self,
        source: &Path,
        output: &Path,
        plan: &CutPlan,
    ) -> Result<CutOutcome, CutError> {
        if plan.removals.is_empty() {
            tokio::fs::copy(source, output).await?;
            return Ok(CutOutcome {
                strategy: CutStrategy::Passthrough,
                plan: plan.clone(),
            });
        }
        if plan.keeps.is_empty() {
            return Err(CutError::NoKeepIntervals {
                duration: plan.duration,
                removed: plan.removed_seconds(),
            });
        }

        if plan.keeps.len() > self.max_filtergraph_intervals {
            log::info!(
                "{} keep intervals exceed the filtergraph limit of {}, using concat",
                plan.keeps.len(),
                self.max_filtergraph_intervals
            );
            return self.fallback(source, output, plan).await;
        }

        match self.cut_filtergraph(source, output, plan).await {
            Ok(()) => Ok(CutOutcome {
                strategy: CutStrategy::Filtergraph,
                plan: plan.clone(),
            }),
            Err(primary) => {
                log::warn!("Filtergraph cut failed, falling back to concat: {}", primary);
                let _ = tokio::fs::remove_file(output).await;
                match self.fallback(source, output, plan).await {
                    Ok(outcome) => Ok(outcome),
                    Err(fallback) => Err(CutError::BothStrategiesFailed {
                        primary: primary.to_string(),
                        fallback: fallback.to_string(),
                    }),
                }
            }
        }
    }
}

/// One `atrim` chain per keep interval, fades at every cut, then `concat`.
pub fn build_filtergraph(plan: &CutPlan, fade_seconds: f64) -> String {
    let mut chains = Vec::with_capacity(plan.keeps.len() + 1);
    let mut labels = String::new();

    for (i, keep) in plan.keeps.iter().enumerate() {
        let mut chain = format!(
            "[0:a]atrim=start={:.3}:end={:.3},asetpts=PTS-STARTPTS",
            keep.start, keep.end
        );
        let fade = fade_seconds.min(keep.len() / 2.0);
        if fade > 0.0 {
            if keep.start > 0.0 {
                chain.push_str(&format!(",afade=t=in:st=0:d={:.3}", fade));
            }
            if keep.end < plan.duration {
                chain.push_str(&format!(
                    ",afade=t=out:st={:.3}:d={:.3}",
                    keep.len() - fade,
                    fade
                ));
            }
        }
        chain.push_str(&format!("[k{}]", i));
        chains.push(chain);
        labels.push_str(&format!("[k{}]", i));
    }

    chains.push(format!(
        "{}concat=n={}:v=0:a=1[out]",
        labels,
        plan.keeps.len()
    ));
    chains.join(";")
}

fn concat_list_entry(path: &Path) -> String {
    // concat demuxer quoting: close the quote, escape, reopen
    let escaped = path.to_string_lossy().replace('\'', "'\\''");
    format!("file '{}'\n", escaped)
}

async fn run_tool(program: &str, args: &[String]) -> Result<String, CutError> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|source| CutError::Spawn {
            program: program.to_string(),
            source,
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: String = stderr
            .lines()
            .rev()
            .take(5)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<Vec<_>>()
            .join(" | ");
        return Err(CutError::Ffmpeg {
            status: output.status.to_string(),
            stderr: tail,
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
