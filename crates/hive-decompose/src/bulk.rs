use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::complexity::Confidence;

const COLLECTION_NOUNS: &str = "files?|items?|pages?|components?|endpoints?|routes?|tests?|modules?|records?|tables?|\
     screens?|services?|functions?|class(?:es)?|entr(?:y|ies)|documents?|posts?|products?|users?";

fn prefilter() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(
            r"(?i)\b(all|every|each)\s+(of\s+the\s+)?\w+|\b\d+\s+({COLLECTION_NOUNS})\b|\b(bulk|batch|mass)\b|\bfor\s+each\b"
        ))
        .expect("valid regex")
    })
}

fn counted_collection() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(&format!(r"(?i)\b(\d+)\s+({COLLECTION_NOUNS})\b")).expect("valid regex"))
}

fn quantified_collection() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(&format!(
            r"(?i)\b(all|every|each)\s+(of\s+the\s+)?(\w+\s+)?({COLLECTION_NOUNS})\b(\s+(pass|passes|passing|succeed|succeeds|are\s+green))?"
        ))
        .expect("valid regex")
    })
}

fn bulk_keyword() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(bulk|batch|mass)\b|\bfor\s+each\b").expect("valid regex"))
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BulkDetection {
    pub is_bulk: bool,
    pub confidence: Confidence,
    pub item_count: Option<u32>,
    pub signals: Vec<String>,
}

impl BulkDetection {
    fn none() -> Self {
        Self { is_bulk: false, confidence: Confidence::Low, item_count: None, signals: vec![] }
    }

    /// Positive and not low-confidence: enough to force decomposition.
    pub fn forces_decomposition(&self) -> bool {
        self.is_bulk && self.confidence > Confidence::Low
    }
}

/// Cheap gate evaluated for every new task.
pub fn looks_like_bulk(text: &str) -> bool {
    prefilter().is_match(text)
}

/// Full detector. Only runs its rules when the prefilter matched.
pub fn detect_bulk_operation(title: &str, description: &str) -> BulkDetection {
    let text = format!("{title}\n{description}");
    if !looks_like_bulk(&text) {
        return BulkDetection::none();
    }

    let mut strong = 0;
    let mut weak = 0;
    let mut signals = vec![];
    let mut item_count = None;

    for cap in counted_collection().captures_iter(&text) {
        let n: u32 = cap[1].parse().unwrap_or(0);
        if n >= 5 {
            strong += 1;
            item_count = Some(item_count.map_or(n, |c: u32| c.max(n)));
            signals.push(format!("{n} {}", &cap[2]));
        }
    }
    for cap in quantified_collection().captures_iter(&text) {
        // "all tests pass" states a success criterion, not a workload.
        if cap.get(5).is_some() {
            continue;
        }
        weak += 1;
        signals.push(cap[0].trim().to_lowercase());
    }
    for cap in bulk_keyword().captures_iter(&text) {
        weak += 1;
        signals.push(cap[0].to_lowercase());
    }
    let listed = description
        .lines()
        .map(str::trim_start)
        .filter(|l| l.starts_with("- ") || l.starts_with("* "))
        .count();
    if listed >= 5 {
        strong += 1;
        item_count = item_count.or(Some(listed as u32));
        signals.push(format!("{listed} listed items"));
    }

    let confidence = if strong > 0 || weak >= 2 {
        Confidence::High
    } else if weak == 1 {
        Confidence::Medium
    } else {
        Confidence::Low
    };
    BulkDetection { is_bulk: strong + weak > 0, confidence, item_count, signals }
}
