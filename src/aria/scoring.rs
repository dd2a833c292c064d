//! Scoring core: the three pure functions behind routing decisions.
//!
//! No I/O, no state. [`specialty_match`] measures how well a message fits an
//! agent's focus keywords, [`load_score`] discounts agents that are busy or
//! failing, and [`pheromone_score`] folds a ring of performance records into
//! a single time-decayed number. The router combines all three with the
//! recency signal it derives itself.

use chrono::{DateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;

use crate::aria::types::{AgentStatus, FocusType, PerformanceRecord};

/// Per-record exponential decay base. 0.95^13 ≈ 0.51, so a record loses
/// half its weight in roughly thirteen days.
pub const PHEROMONE_DECAY: f64 = 0.95;

/// Score handed to generalists and unknown focus types.
const GENERALIST_SCORE: f64 = 0.3;

lazy_static! {
    static ref SOCIAL_KEYWORDS: Vec<Regex> = compile(&[
        r"\bsocial", r"\bpost", r"\btweet", r"\bcommunit", r"\bengag", r"\bshar", r"\bcontent",
    ]);
    static ref ANALYSIS_KEYWORDS: Vec<Regex> = compile(&[
        r"\banaly", r"\bmetric", r"\bdata\b", r"\breport", r"\breview", r"\binsight", r"\btrend",
        r"\bstat",
    ]);
    static ref DEVOPS_KEYWORDS: Vec<Regex> = compile(&[
        r"\bdeploy", r"\bdocker", r"\bserver", r"\bci\b", r"\bcd\b", r"\bbuild", r"\btest",
        r"\binfra", r"\bmonitor", r"\bdebug",
    ]);
    static ref CREATIVE_KEYWORDS: Vec<Regex> = compile(&[
        r"\bcreat", r"\bwrite", r"\bart\b", r"\bstory", r"\bdesign", r"\bbrand", r"\bvisual",
        r"\bblog",
    ]);
    static ref RESEARCH_KEYWORDS: Vec<Regex> = compile(&[
        r"\bresearch", r"\bpaper", r"\bstudy", r"\blearn", r"\bexplor", r"\binvestigat",
        r"\bknowledge",
    ]);
}

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(&format!("(?i){}", p)).expect("static keyword pattern"))
        .collect()
}

fn keyword_set(focus: FocusType) -> &'static [Regex] {
    match focus {
        FocusType::Social => &SOCIAL_KEYWORDS,
        FocusType::Analysis => &ANALYSIS_KEYWORDS,
        FocusType::Devops => &DEVOPS_KEYWORDS,
        FocusType::Creative => &CREATIVE_KEYWORDS,
        FocusType::Research => &RESEARCH_KEYWORDS,
    }
}

/// How well a message matches an agent's specialty, in [0, 1].
///
/// Counts how many distinct keywords from the focus set appear in the
/// message: 0 → 0.1, 1 → 0.6, 2 → 0.8, 3+ → 1.0. Generalists (`None`)
/// always score 0.3 so they stay routable without beating a real match.
pub fn specialty_match(message: &str, focus: Option<FocusType>) -> f64 {
    let Some(focus) = focus else {
        return GENERALIST_SCORE;
    };
    let hits = keyword_set(focus)
        .iter()
        .filter(|re| re.is_match(message))
        .count();
    match hits {
        0 => 0.1,
        1 => 0.6,
        2 => 0.8,
        _ => 1.0,
    }
}

/// Availability of an agent given its status and failure streak, in [0, 1].
pub fn load_score(status: AgentStatus, consecutive_failures: u32) -> f64 {
    match status {
        AgentStatus::Disabled | AgentStatus::Terminated => 0.0,
        AgentStatus::Error => 0.1,
        AgentStatus::Busy => 0.3,
        AgentStatus::Idle => (1.0 - 0.1 * f64::from(consecutive_failures)).max(0.2),
    }
}

/// Time-decayed weighted mean of performance records, in [0, 1].
///
/// Each record scores `0.6·success + 0.3·speed + 0.1·cost` and is weighted
/// by `0.95^age_days`. An empty ring returns the neutral cold-start value
/// 0.5 — untested agents are not penalized.
pub fn pheromone_score(records: &[PerformanceRecord], now: DateTime<Utc>) -> f64 {
    if records.is_empty() {
        return 0.5;
    }

    let mut weighted_sum = 0.0;
    let mut weight_total = 0.0;
    for record in records {
        let age_days = (now - record.created_at).num_days().max(0);
        let weight = PHEROMONE_DECAY.powi(age_days as i32);
        let success = if record.success { 1.0 } else { 0.0 };
        let score = 0.6 * success + 0.3 * record.speed_score + 0.1 * record.cost_score;
        weighted_sum += score * weight;
        weight_total += weight;
    }

    if weight_total <= 0.0 {
        0.5
    } else {
        weighted_sum / weight_total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(success: bool, speed: f64, cost: f64, age_days: i64) -> PerformanceRecord {
        PerformanceRecord {
            success,
            speed_score: speed,
            cost_score: cost,
            duration_ms: 1000,
            created_at: Utc::now() - Duration::days(age_days),
            task_type: None,
        }
    }

    #[test]
    fn specialty_tiers_by_keyword_count() {
        assert_eq!(
            specialty_match("hello there", Some(FocusType::Devops)),
            0.1
        );
        assert_eq!(
            specialty_match("deploy it", Some(FocusType::Devops)),
            0.6
        );
        assert_eq!(
            specialty_match("deploy the docker image", Some(FocusType::Devops)),
            0.8
        );
        assert_eq!(
            specialty_match(
                "Deploy the Docker container and monitor the CI build",
                Some(FocusType::Devops)
            ),
            1.0
        );
    }

    #[test]
    fn specialty_is_case_insensitive() {
        assert_eq!(
            specialty_match("RESEARCH the PAPERS on KNOWLEDGE", Some(FocusType::Research)),
            1.0
        );
    }

    #[test]
    fn generalists_score_a_flat_neutral() {
        assert_eq!(specialty_match("deploy docker ci build", None), 0.3);
    }

    #[test]
    fn short_keywords_respect_word_boundaries() {
        // "city" and "cod" must not trip the ci/cd patterns.
        assert_eq!(
            specialty_match("the city coder said hi", Some(FocusType::Devops)),
            0.1
        );
    }

    #[test]
    fn load_score_tiers() {
        assert_eq!(load_score(AgentStatus::Disabled, 0), 0.0);
        assert_eq!(load_score(AgentStatus::Error, 0), 0.1);
        assert_eq!(load_score(AgentStatus::Busy, 0), 0.3);
        assert_eq!(load_score(AgentStatus::Idle, 0), 1.0);
        assert_eq!(load_score(AgentStatus::Idle, 3), 0.7);
        // Floors at 0.2 no matter how long the failure streak.
        assert_eq!(load_score(AgentStatus::Idle, 20), 0.2);
    }

    #[test]
    fn cold_start_is_neutral() {
        assert_eq!(pheromone_score(&[], Utc::now()), 0.5);
    }

    #[test]
    fn perfect_recent_records_score_high() {
        let now = Utc::now();
        let records = vec![
            record(true, 1.0, 1.0, 0),
            record(true, 1.0, 1.0, 0),
            record(true, 1.0, 1.0, 0),
        ];
        assert!(pheromone_score(&records, now) > 0.9);
    }

    #[test]
    fn failures_drag_the_score_down() {
        let now = Utc::now();
        let mut records = vec![
            record(true, 1.0, 1.0, 0),
            record(true, 1.0, 1.0, 0),
            record(true, 1.0, 1.0, 0),
        ];
        let before = pheromone_score(&records, now);
        records.extend([
            record(false, 0.0, 0.0, 0),
            record(false, 0.0, 0.0, 0),
            record(false, 0.0, 0.0, 0),
        ]);
        let after = pheromone_score(&records, now);
        assert!(after < before);
    }

    #[test]
    fn old_records_carry_less_weight() {
        let now = Utc::now();
        // A fresh failure against an old success: the failure dominates.
        let fresh_failure = vec![record(true, 1.0, 1.0, 365), record(false, 0.0, 0.0, 0)];
        // A fresh success against an old failure: the success dominates.
        let fresh_success = vec![record(false, 0.0, 0.0, 365), record(true, 1.0, 1.0, 0)];
        assert!(
            pheromone_score(&fresh_failure, now) < pheromone_score(&fresh_success, now)
        );
    }

    #[test]
    fn score_stays_in_unit_interval() {
        let now = Utc::now();
        let records: Vec<_> = (0..50)
            .map(|i| record(i % 2 == 0, 1.0, 1.0, i % 30))
            .collect();
        let score = pheromone_score(&records, now);
        assert!((0.0..=1.0).contains(&score));
    }
}
