//! Importance ranking and confidence arithmetic.
//!
//! `importance = recency × frequency × richness`:
//! - recency halves every [`HALF_LIFE_DAYS`] of age,
//! - frequency is `log2(access_count + 1) + 1`,
//! - richness rewards turns that called tools (+0.5) or touched files (+0.3).
//!
//! The SQLite backend registers [`importance`] as a SQL function, so ranked
//! queries and in-process ranking share one implementation.

use chrono::{DateTime, Utc};

use super::types::MemoryEntry;

pub const INITIAL_CONFIDENCE: f64 = 0.8;
pub const CONFIDENCE_FLOOR: f64 = 0.1;
pub const CONFIDENCE_CEILING: f64 = 1.0;
pub const ACCESS_BOOST: f64 = 0.03;
pub const HALF_LIFE_DAYS: f64 = 7.0;

const MS_PER_DAY: f64 = 86_400_000.0;

/// Importance from raw columns. Ages in the future count as zero.
pub fn importance(
    created_at_ms: i64,
    access_count: u32,
    tool_count: usize,
    file_count: usize,
    now_ms: i64,
) -> f64 {
    let age_days = ((now_ms - created_at_ms) as f64 / MS_PER_DAY).max(0.0);
    let recency = (-std::f64::consts::LN_2 * age_days / HALF_LIFE_DAYS).exp();
    let frequency = (f64::from(access_count) + 1.0).log2() + 1.0;
    let mut richness = 1.0;
    if tool_count > 0 {
        richness += 0.5;
    }
    if file_count > 0 {
        richness += 0.3;
    }
    recency * frequency * richness
}

pub fn entry_importance(entry: &MemoryEntry, now: DateTime<Utc>) -> f64 {
    importance(
        entry.created_at.timestamp_millis(),
        entry.access_count,
        entry.metadata.tool_names.len(),
        entry.metadata.file_paths.len(),
        now.timestamp_millis(),
    )
}

/// Score and sort by descending importance. The sort is stable, so ties keep
/// the incoming (recency) order.
pub fn rank_by_importance(entries: Vec<MemoryEntry>, now: DateTime<Utc>) -> Vec<(MemoryEntry, f64)> {
    let mut scored: Vec<(MemoryEntry, f64)> = entries
        .into_iter()
        .map(|e| {
            let score = entry_importance(&e, now);
            (e, score)
        })
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored
}

/// Confidence after `hours` of decay at `rate` per hour, floor-clamped.
pub fn decayed(confidence: f64, rate: f64, hours: f64) -> f64 {
    (confidence - rate * hours.max(0.0)).clamp(CONFIDENCE_FLOOR, CONFIDENCE_CEILING)
}

/// Confidence after one access, ceiling-clamped.
pub fn boosted(confidence: f64) -> f64 {
    (confidence + ACCESS_BOOST).clamp(CONFIDENCE_FLOOR, CONFIDENCE_CEILING)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: i64 = 86_400_000;

    #[test]
    fn fresh_plain_turn_scores_one() {
        assert!((importance(1000, 0, 0, 0, 1000) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn recency_halves_each_week() {
        let now = 100 * DAY;
        let week_old = importance(now - 7 * DAY, 0, 0, 0, now);
        assert!((week_old - 0.5).abs() < 1e-9);
        let very_old = importance(0, 0, 0, 0, now);
        assert!(very_old > 0.0 && very_old < 1e-3);
    }

    #[test]
    fn frequency_and_richness_multiply() {
        // one access: log2(2) + 1 = 2; tools and files: 1.8
        let score = importance(0, 1, 3, 2, 0);
        assert!((score - 3.6).abs() < 1e-9);
        assert!((importance(0, 0, 1, 0, 0) - 1.5).abs() < 1e-9);
    }

    #[test]
    fn future_timestamps_do_not_inflate_scores() {
        assert!((importance(10 * DAY, 0, 0, 0, 0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn confidence_stays_in_bounds_under_any_sequence() {
        let mut c = INITIAL_CONFIDENCE;
        for step in 0..500 {
            c = if step % 7 == 0 { boosted(c) } else { decayed(c, 0.005, step as f64) };
            assert!((CONFIDENCE_FLOOR..=CONFIDENCE_CEILING).contains(&c), "out of bounds: {c}");
        }
        let mut high = 0.99;
        for _ in 0..10 {
            high = boosted(high);
        }
        assert_eq!(high, CONFIDENCE_CEILING);
        assert_eq!(decayed(0.2, 0.005, 1_000.0), CONFIDENCE_FLOOR);
    }
}
