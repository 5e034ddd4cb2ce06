// SPDX-License-Identifier: MIT OR Apache-2.0
//! Deterministic 0-100 importance scoring over an [`Observation`].
//!
//! Pure function of its inputs (including the caller-supplied `now`, so the
//! same observation always scores the same at a fixed instant) — used both
//! at ingest time (score stored) and query time (recency re-evaluated).

#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use ocmem_core::{ImportanceTier, Observation, ObservationType};

fn type_points(ty: ObservationType) -> u32 {
    match ty {
        ObservationType::Decision => 30,
        ObservationType::Bugfix => 25,
        ObservationType::Feature => 20,
        ObservationType::Refactor => 15,
        ObservationType::Change => 12,
        ObservationType::Discovery => 10,
        ObservationType::Summary => 10,
    }
}

fn content_points(obs: &Observation) -> u32 {
    let narrative_len = obs.narrative.chars().count();
    let narrative_points = if narrative_len > 500 {
        10
    } else if narrative_len > 200 {
        5
    } else if narrative_len > 50 {
        2
    } else {
        0
    };

    let facts_points = match obs.facts.len() {
        n if n >= 5 => 10,
        n if n >= 3 => 5,
        n if n >= 1 => 3,
        _ => 0,
    };

    let concepts_points = match obs.concepts.len() {
        n if n >= 8 => 10,
        n if n >= 5 => 5,
        n if n >= 3 => 3,
        _ => 0,
    };

    narrative_points + facts_points + concepts_points
}

fn recency_points(created_at: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    let age_days = (now - created_at).num_seconds() as f64 / 86_400.0;
    let age_days = age_days.max(0.0);
    20.0 * (-age_days / 30.0).exp()
}

fn roi_points(discovery_tokens: Option<i64>) -> f64 {
    let tokens = discovery_tokens.unwrap_or(0).max(0) as f64;
    10.0 * (tokens / 5000.0).min(1.0)
}

fn reference_points(reference_count: u32) -> u32 {
    (2 * reference_count).min(10)
}

/// Compute the 0-100 importance score for `obs` as of `now`.
///
/// `reference_count` is the number of relationships that reference this
/// observation; `discovery_tokens` is the optional token-investment figure
/// recorded for the work that produced it (see [`ocmem_core::SessionSummary::token_investment`]
/// for the analogous session-level field).
#[must_use]
pub fn score(
    obs: &Observation,
    now: DateTime<Utc>,
    reference_count: u32,
    discovery_tokens: Option<i64>,
) -> u8 {
    let total = type_points(obs.ty) as f64
        + content_points(obs) as f64
        + recency_points(obs.created_at, now)
        + roi_points(discovery_tokens)
        + reference_points(reference_count) as f64;
    total.round().clamp(0.0, 100.0) as u8
}

/// Classify a 0-100 score into its coarse tier. Delegates to
/// [`ImportanceTier::from_score`] so the thresholds live in one place.
#[must_use]
pub fn tier(score: u8) -> ImportanceTier {
    ImportanceTier::from_score(score)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use ocmem_core::ObservationBuilder;

    fn sample(ty: ObservationType, narrative: &str, facts: usize, concepts: usize) -> Observation {
        ObservationBuilder::new(
            "sess-1".to_string(),
            "proj".to_string(),
            "claude-code".to_string(),
            "tool".to_string(),
            ty,
            "Title".to_string(),
            narrative.to_string(),
        )
        .facts((0..facts).map(|i| format!("fact-{i}")).collect())
        .concepts((0..concepts).map(|i| format!("concept-{i}")).collect())
        .build()
    }

    #[test]
    fn score_is_deterministic_for_identical_inputs() {
        let obs = sample(ObservationType::Decision, &"x".repeat(600), 5, 8);
        let now = Utc::now();
        assert_eq!(score(&obs, now, 2, Some(5000)), score(&obs, now, 2, Some(5000)));
    }

    #[test]
    fn score_is_clamped_to_0_100() {
        let obs = sample(ObservationType::Decision, &"x".repeat(600), 20, 20);
        let now = obs.created_at;
        let s = score(&obs, now, 1000, Some(50_000));
        assert!(s <= 100);
    }

    #[test]
    fn fresh_high_value_observation_scores_critical() {
        let obs = sample(ObservationType::Decision, &"x".repeat(600), 6, 9);
        let now = obs.created_at;
        let s = score(&obs, now, 5, Some(5000));
        assert_eq!(tier(s), ImportanceTier::Critical);
    }

    #[test]
    fn stale_low_value_observation_scores_low() {
        let obs = sample(ObservationType::Discovery, "short", 0, 0);
        let now = obs.created_at + Duration::days(400);
        let s = score(&obs, now, 0, None);
        assert_eq!(tier(s), ImportanceTier::Low);
    }

    #[test]
    fn recency_decays_toward_zero() {
        let obs = sample(ObservationType::Change, "body", 0, 0);
        let fresh = score(&obs, obs.created_at, 0, None);
        let stale = score(&obs, obs.created_at + Duration::days(90), 0, None);
        assert!(fresh >= stale);
    }

    #[test]
    fn references_cap_at_ten_points() {
        let obs = sample(ObservationType::Change, "body", 0, 0);
        let now = obs.created_at;
        let capped = score(&obs, now, 10, None);
        let over_capped = score(&obs, now, 50, None);
        assert_eq!(capped, over_capped);
    }

    #[test]
    fn negative_discovery_tokens_clamp_to_zero_roi() {
        assert_eq!(roi_points(Some(-100)), 0.0);
        assert_eq!(roi_points(None), 0.0);
    }

    #[test]
    fn tier_thresholds_match_spec_boundaries() {
        assert_eq!(tier(90), ImportanceTier::Critical);
        assert_eq!(tier(70), ImportanceTier::High);
        assert_eq!(tier(40), ImportanceTier::Medium);
        assert_eq!(tier(39), ImportanceTier::Low);
    }
}
