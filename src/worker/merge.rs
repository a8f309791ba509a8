//! Turn per-segment classifications into removal intervals.

use serde::Serialize;

use crate::config::MergeConfig;
use crate::database::{ClassifiedSegment, Label};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Interval {
    pub start: f64,
    pub end: f64,
}

impl Interval {
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> f64 {
        (self.end - self.start).max(0.0)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

#[derive(Debug, Clone)]
pub struct MergeOptions {
    pub min_confidence: f64,
    pub gap_epsilon: f64,
    /// 0 disables the filter.
    pub min_ad_segment_seconds: f64,
    /// Source duration, when known.
    pub duration: Option<f64>,
}

impl MergeOptions {
    pub fn new(config: &MergeConfig, min_confidence: f64, duration: Option<f64>) -> Self {
        Self {
            min_confidence,
            gap_epsilon: config.gap_epsilon_seconds.max(0.0),
            min_ad_segment_seconds: config.min_ad_segment_seconds.max(0.0),
            duration,
        }
    }
}

/// Sort and merge intervals whose gap is at most `gap_epsilon`.
pub fn merge_intervals(mut intervals: Vec<Interval>, gap_epsilon: f64) -> Vec<Interval> {
    intervals.retain(|i| !i.is_empty());
    intervals.sort_by(|a, b| a.start.total_cmp(&b.start).then(a.end.total_cmp(&b.end)));

    let mut merged: Vec<Interval> = Vec::with_capacity(intervals.len());
    for next in intervals {
        match merged.last_mut() {
            Some(prev) if next.start - prev.end <= gap_epsilon => {
                prev.end = prev.end.max(next.end);
            }
            _ => merged.push(next),
        }
    }
    merged
}

/// Ad segments at or above the confidence threshold, as raw intervals.
pub fn select_ads(classified: &[ClassifiedSegment], min_confidence: f64) -> Vec<Interval> {
    classified
        .iter()
        .filter(|c| c.label == Label::Ad && c.confidence >= min_confidence)
        .map(|c| Interval::new(c.start_time, c.end_time))
        .collect()
}

pub fn removal_intervals(classified: &[ClassifiedSegment], opts: &MergeOptions) -> Vec<Interval> {
    let mut selected = select_ads(classified, opts.min_confidence);

    if let Some(duration) = opts.duration {
        for interval in &mut selected {
            interval.start = interval.start.clamp(0.0, duration);
            interval.end = interval.end.clamp(0.0, duration);
        }
    }

    let mut merged = merge_intervals(selected, opts.gap_epsilon);

    let Some(duration) = opts.duration else {
        if opts.min_ad_segment_seconds > 0.0 {
            merged.retain(|i| i.len() >= opts.min_ad_segment_seconds);
        }
        return merged;
    };

    // An ad running into the outro takes the last few seconds with it
    if let Some(last) = merged.last_mut() {
        if duration - last.end <= opts.gap_epsilon {
            last.end = duration;
        }
    }

    if opts.min_ad_segment_seconds > 0.0 {
        merged.retain(|i| i.len() >= opts.min_ad_segment_seconds || i.end >= duration);
    }
    merged
}
