use serde::{Deserialize, Serialize};

/// Outcome intent document. Structured when it parses as a known version,
/// otherwise kept verbatim.
#[derive(Clone, Debug, PartialEq)]
pub enum Intent {
    V1(IntentDoc),
    Legacy(String),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IntentDoc {
    pub version: u32,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub items: Vec<IntentItem>,
    #[serde(default)]
    pub success_criteria: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IntentItem {
    #[serde(default)]
    pub id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
}

impl Intent {
    /// Never fails: unknown versions and non-JSON input become `Legacy`.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Intent::Legacy(String::new());
        }
        match serde_json::from_str::<IntentDoc>(trimmed) {
            Ok(doc) if doc.version == 1 => Intent::V1(doc),
            _ => Intent::Legacy(raw.to_string()),
        }
    }

    /// Text stored in the database.
    pub fn to_raw(&self) -> String {
        match self {
            Intent::V1(doc) => serde_json::to_string(doc).unwrap_or_default(),
            Intent::Legacy(raw) => raw.clone(),
        }
    }

    /// Short human summary for worker instructions.
    pub fn summary(&self) -> String {
        match self {
            Intent::V1(doc) => {
                let mut s = doc.summary.clone();
                for item in &doc.items {
                    s.push_str(&format!("\n- {}", item.title));
                }
                if !doc.success_criteria.is_empty() {
                    s.push_str("\n\nSuccess criteria:");
                    for c in &doc.success_criteria {
                        s.push_str(&format!("\n- {c}"));
                    }
                }
                s
            }
            Intent::Legacy(raw) => raw.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_v1_documents() {
        let raw = r#"{"version":1,"summary":"ship it","items":[{"title":"api"}],"success_criteria":["green"]}"#;
        let Intent::V1(doc) = Intent::parse(raw) else { panic!("expected v1") };
        assert_eq!(doc.items[0].title, "api");
        assert!(Intent::parse(raw).summary().contains("- api"));
    }

    #[test]
    fn unknown_versions_and_prose_fall_back_to_legacy() {
        assert!(matches!(Intent::parse(r#"{"version":7}"#), Intent::Legacy(_)));
        assert_eq!(Intent::parse("build a todo app"), Intent::Legacy("build a todo app".into()));
    }
}
