use hive_core::Task;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::reasoner::Reasoner;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimateSource {
    Reasoner,
    Heuristic,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ComplexityEstimate {
    /// 1 (trivial) to 10 (very complex).
    pub score: u8,
    pub estimated_turns: u32,
    pub confidence: Confidence,
    pub risk_factors: Vec<String>,
    pub source: EstimateSource,
}

/// Scoring buckets shared by the reasoner prompt and the heuristic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ComplexityBucket {
    Trivial,
    Simple,
    Moderate,
    Complex,
    VeryComplex,
}

impl ComplexityBucket {
    pub fn of(score: u8) -> Self {
        match score {
            0..=2 => ComplexityBucket::Trivial,
            3..=4 => ComplexityBucket::Simple,
            5..=6 => ComplexityBucket::Moderate,
            7..=8 => ComplexityBucket::Complex,
            _ => ComplexityBucket::VeryComplex,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            ComplexityBucket::Trivial => "trivial",
            ComplexityBucket::Simple => "simple",
            ComplexityBucket::Moderate => "moderate",
            ComplexityBucket::Complex => "complex",
            ComplexityBucket::VeryComplex => "very complex",
        }
    }
}

pub fn turns_for_score(score: u8) -> u32 {
    match ComplexityBucket::of(score) {
        ComplexityBucket::Trivial => 3,
        ComplexityBucket::Simple => 6,
        ComplexityBucket::Moderate => 12,
        ComplexityBucket::Complex => 20,
        ComplexityBucket::VeryComplex => 30,
    }
}

const HARD_MARKERS: &[&str] = &[
    "refactor",
    "migrate",
    "migration",
    "architecture",
    "redesign",
    "rewrite",
    "integrate",
    "integration",
    "authentication",
    "authorization",
    "database",
    "schema",
    "concurrency",
    "performance",
    "security",
    "end-to-end",
    "across",
    "entire",
    "multiple",
];

const EASY_MARKERS: &[&str] = &["typo", "rename", "comment", "readme", "bump", "wording", "log message"];

/// Deterministic fallback used when no reasoner is available or it misbehaves.
pub fn heuristic_estimate(title: &str, description: &str) -> ComplexityEstimate {
    let text = format!("{title}\n{description}").to_lowercase();
    let words = text.split_whitespace().count();

    let mut score: i32 = match words {
        0..=29 => 1,
        30..=79 => 2,
        80..=199 => 3,
        200..=399 => 4,
        _ => 5,
    };

    let risk_factors: Vec<String> =
        HARD_MARKERS.iter().filter(|m| text.contains(*m)).map(|m| m.to_string()).collect();
    score += risk_factors.len().min(4) as i32;
    score -= EASY_MARKERS.iter().filter(|m| text.contains(*m)).count().min(2) as i32;

    let list_items = description
        .lines()
        .map(str::trim_start)
        .filter(|l| l.starts_with("- ") || l.starts_with("* ") || l.split_once(". ").is_some_and(|(n, _)| n.parse::<u32>().is_ok()))
        .count();
    score += match list_items {
        0..=2 => 0,
        3..=4 => 1,
        _ => 2,
    };

    let score = score.clamp(1, 10) as u8;
    ComplexityEstimate {
        score,
        estimated_turns: turns_for_score(score),
        confidence: Confidence::Low,
        risk_factors,
        source: EstimateSource::Heuristic,
    }
}

pub fn complexity_prompt(task: &Task, context: &str) -> String {
    let mut p = String::new();
    p.push_str("Estimate the implementation complexity of this task for an autonomous coding agent.\n\n");
    p.push_str(&format!("Title: {}\n", task.title));
    if !task.description.trim().is_empty() {
        p.push_str(&format!("Description:\n{}\n", task.description.trim()));
    }
    if !context.trim().is_empty() {
        p.push_str(&format!("\nContext:\n{}\n", context.trim()));
    }
    p.push_str(
        "\nScore on 1-10: 1-2 trivial, 3-4 simple, 5-6 moderate, 7-8 complex, 9-10 very complex.\n\
         Reply with a single JSON object and nothing else:\n\
         {\"score\": <1-10>, \"estimated_turns\": <int>, \"confidence\": \"low|medium|high\", \"risk_factors\": [\"...\"]}\n",
    );
    p
}

#[derive(Deserialize)]
struct RawEstimate {
    score: f64,
    #[serde(default)]
    estimated_turns: Option<u32>,
    #[serde(default)]
    confidence: Option<Confidence>,
    #[serde(default)]
    risk_factors: Vec<String>,
}

/// Reads the JSON object between the first `{` and the last `}` of a reply.
pub fn parse_estimate(response: &str) -> Option<ComplexityEstimate> {
    let start = response.find('{')?;
    let end = response.rfind('}')?;
    if end <= start {
        return None;
    }
    let raw: RawEstimate = serde_json::from_str(&response[start..=end]).ok()?;
    if !raw.score.is_finite() {
        return None;
    }
    let score = raw.score.round().clamp(1.0, 10.0) as u8;
    Some(ComplexityEstimate {
        score,
        estimated_turns: raw.estimated_turns.filter(|t| *t > 0).unwrap_or_else(|| turns_for_score(score)),
        confidence: raw.confidence.unwrap_or(Confidence::Medium),
        risk_factors: raw.risk_factors,
        source: EstimateSource::Reasoner,
    })
}

/// Ask the reasoner when there is one; fall back to the heuristic on any failure.
pub fn estimate_complexity(task: &Task, context: &str, reasoner: Option<&dyn Reasoner>) -> ComplexityEstimate {
    if let Some(r) = reasoner {
        match r.reason(&complexity_prompt(task, context)) {
            Ok(reply) => match parse_estimate(&reply) {
                Some(est) => {
                    debug!(task = %task.id, score = est.score, "reasoned complexity");
                    return est;
                }
                None => warn!(task = %task.id, "complexity reply unparseable, using heuristic"),
            },
            Err(e) => warn!(task = %task.id, error = %e, "complexity reasoner failed, using heuristic"),
        }
    }
    heuristic_estimate(&task.title, &task.description)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_wrapped_in_prose() {
        let est = parse_estimate("Sure! Here you go:\n{\"score\": 8, \"confidence\": \"high\", \"risk_factors\": [\"schema\"]}\nThanks")
            .unwrap();
        assert_eq!(est.score, 8);
        assert_eq!(est.estimated_turns, 20);
        assert_eq!(est.confidence, Confidence::High);
        assert_eq!(est.source, EstimateSource::Reasoner);
    }

    #[test]
    fn out_of_range_scores_are_clamped_and_garbage_rejected() {
        assert_eq!(parse_estimate("{\"score\": 42}").unwrap().score, 10);
        assert_eq!(parse_estimate("{\"score\": 0}").unwrap().score, 1);
        assert!(parse_estimate("no json here").is_none());
        assert!(parse_estimate("} {").is_none());
        assert!(parse_estimate("{\"turns\": 3}").is_none());
    }

    #[test]
    fn heuristic_separates_trivial_from_sweeping_work() {
        let small = heuristic_estimate("Fix typo in README", "");
        assert_eq!(ComplexityBucket::of(small.score), ComplexityBucket::Trivial);
        assert_eq!(small.confidence, Confidence::Low);

        let big = heuristic_estimate(
            "Migrate authentication to the new database schema",
            "Refactor the session layer across the entire app.\n- users\n- sessions\n- tokens\n- audit log\n- admin",
        );
        assert!(big.score >= 7, "score was {}", big.score);
        assert!(big.risk_factors.contains(&"migrate".to_string()));
    }

    #[test]
    fn bucket_labels() {
        assert_eq!(ComplexityBucket::of(1).label(), "trivial");
        assert_eq!(ComplexityBucket::of(6).label(), "moderate");
        assert_eq!(ComplexityBucket::of(10).label(), "very complex");
        assert_eq!(turns_for_score(9), 30);
    }
}
