use super::cutter::CutOutcome;
use crate::database::ProcessingStatistics;

/// Statistics for a finished cut, taken from the intervals the cutter
/// actually applied. `ad_classification_count` is the raw number of ad
/// verdicts, kept for diagnostics only.
pub fn compute_statistics(
    episode_id: i64,
    job_id: &str,
    outcome: &CutOutcome,
    ad_classification_count: usize,
    preset_id: Option<i64>,
) -> ProcessingStatistics {
    let plan = &outcome.plan;
    let seconds_removed = plan.removed_seconds();
    let processed_duration = (plan.duration - seconds_removed).max(0.0);
    let percentage_removed = if plan.duration > 0.0 {
        seconds_removed / plan.duration * 100.0
    } else {
        0.0
    };

    ProcessingStatistics {
        episode_id,
        job_id: job_id.to_string(),
        intervals_removed: plan.removals.len() as i64,
        seconds_removed,
        original_duration: plan.duration,
        processed_duration,
        percentage_removed,
        strategy: outcome.strategy,
        ad_classification_count: ad_classification_count as i64,
        preset_id,
    }
}
