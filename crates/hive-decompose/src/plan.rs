use hive_core::{SubtaskDraft, SubtaskIndex, Task};
use tracing::warn;

use crate::error::DecomposeError;

pub fn decomposition_prompt(task: &Task, max_subtasks: usize, context: &str) -> String {
    let mut p = format!(
        "Split the following task into between 2 and {max_subtasks} smaller subtasks that an autonomous \
         coding agent can each finish in a few turns.\n\nTitle: {}\n",
        task.title
    );
    if !task.description.trim().is_empty() {
        p.push_str(&format!("Description:\n{}\n", task.description.trim()));
    }
    if !context.trim().is_empty() {
        p.push_str(&format!("\nContext:\n{}\n", context.trim()));
    }
    p.push_str(
        "\nNumber subtasks from 0. A subtask may only depend on subtasks with a lower number.\n\
         Use exactly this format for every subtask:\n\n\
         SUBTASK 0: <short title>\n\
         DESCRIPTION: <what to do and how to verify it>\n\
         DEPENDS_ON: none\n\
         ESTIMATED_TURNS: <int>\n\n\
         SUBTASK 1: <short title>\n\
         DESCRIPTION: ...\n\
         DEPENDS_ON: 0\n\
         ESTIMATED_TURNS: <int>\n",
    );
    p
}

#[derive(Default)]
struct Partial {
    title: String,
    description: Vec<String>,
    depends_on: Vec<usize>,
    estimated_turns: Option<u32>,
}

impl Partial {
    fn finish(self) -> SubtaskDraft {
        SubtaskDraft {
            title: self.title,
            description: self.description.join("\n").trim().to_string(),
            depends_on: self.depends_on.into_iter().map(SubtaskIndex).collect(),
            estimated_turns: self.estimated_turns,
        }
    }
}

#[derive(PartialEq)]
enum Field {
    Other,
    Description,
}

fn key_value<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let (k, v) = line.split_once(':')?;
    k.trim().eq_ignore_ascii_case(key).then_some(v.trim())
}

fn parse_depends(value: &str, subtask: usize) -> Result<Vec<usize>, DecomposeError> {
    let v = value.trim().trim_start_matches('[').trim_end_matches(']').trim();
    if v.is_empty() || v.eq_ignore_ascii_case("none") || v == "-" {
        return Ok(vec![]);
    }
    v.split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.trim_start_matches('#').parse::<usize>().map_err(|_| {
                DecomposeError::InvalidResponse(format!("subtask {subtask}: bad DEPENDS_ON entry {s:?}"))
            })
        })
        .collect()
}

/// Parse `SUBTASK n:` blocks. Subtasks are indexed by position; the printed number is ignored.
pub fn parse_decomposition(response: &str) -> Result<Vec<SubtaskDraft>, DecomposeError> {
    let mut out = vec![];
    let mut current: Option<Partial> = None;
    let mut field = Field::Other;

    for raw in response.lines() {
        let line = raw.trim();
        let header = line
            .split_once(':')
            .filter(|(k, _)| {
                let mut words = k.split_whitespace();
                words.next().is_some_and(|w| w.eq_ignore_ascii_case("subtask"))
                    && words.next().is_some_and(|n| n.trim_start_matches('#').parse::<usize>().is_ok())
                    && words.next().is_none()
            })
            .map(|(_, title)| title.trim().to_string());
        if let Some(title) = header {
            if let Some(done) = current.take() {
                out.push(done.finish());
            }
            current = Some(Partial { title, ..Default::default() });
            field = Field::Other;
            continue;
        }
        let Some(cur) = current.as_mut() else {
            continue;
        };
        let index = out.len();
        if let Some(v) = key_value(line, "DESCRIPTION") {
            cur.description.push(v.to_string());
            field = Field::Description;
        } else if let Some(v) = key_value(line, "DEPENDS_ON") {
            cur.depends_on = parse_depends(v, index)?;
            field = Field::Other;
        } else if let Some(v) = key_value(line, "ESTIMATED_TURNS") {
            cur.estimated_turns = v.split_whitespace().next().and_then(|n| n.parse().ok());
            field = Field::Other;
        } else if field == Field::Description {
            cur.description.push(raw.trim_end().to_string());
        }
    }
    if let Some(done) = current.take() {
        out.push(done.finish());
    }

    if let Some((i, _)) = out.iter().enumerate().find(|(_, d)| d.title.is_empty()) {
        return Err(DecomposeError::InvalidResponse(format!("subtask {i} has no title")));
    }
    Ok(out)
}

/// Enforce the plan rules before anything is persisted: at least two subtasks,
/// dependencies only on strictly lower indices, at most `max_subtasks` kept.
pub fn validate_plan(mut drafts: Vec<SubtaskDraft>, max_subtasks: usize) -> Result<Vec<SubtaskDraft>, DecomposeError> {
    if drafts.len() < 2 {
        return Err(DecomposeError::TooFewSubtasks(drafts.len()));
    }
    for (i, d) in drafts.iter().enumerate() {
        if let Some(bad) = d.depends_on.iter().find(|dep| dep.0 >= i) {
            return Err(DecomposeError::ForwardDependency { subtask: i, dependency: bad.0 });
        }
    }
    // Dependencies only point backwards, so truncation cannot orphan an edge.
    let cap = max_subtasks.max(2);
    if drafts.len() > cap {
        warn!(proposed = drafts.len(), kept = cap, dropped = drafts.len() - cap, "plan exceeds subtask cap, dropping the tail");
        drafts.truncate(cap);
    }
    Ok(drafts)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPLY: &str = "Here is the plan.\n\n\
        SUBTASK 0: Add schema\n\
        DESCRIPTION: Create the tables.\n\
        Include indexes for lookups.\n\
        DEPENDS_ON: none\n\
        ESTIMATED_TURNS: 4\n\n\
        SUBTASK 1: Write queries\n\
        DESCRIPTION: CRUD helpers.\n\
        DEPENDS_ON: 0\n\
        ESTIMATED_TURNS: 6 turns\n\n\
        SUBTASK 2: Wire the API\n\
        DESCRIPTION: Expose endpoints.\n\
        DEPENDS_ON: [0, 1]\n";

    #[test]
    fn parses_blocks_by_position() {
        let drafts = parse_decomposition(REPLY).unwrap();
        assert_eq!(drafts.len(), 3);
        assert_eq!(drafts[0].title, "Add schema");
        assert_eq!(drafts[0].description, "Create the tables.\nInclude indexes for lookups.");
        assert!(drafts[0].depends_on.is_empty());
        assert_eq!(drafts[0].estimated_turns, Some(4));
        assert_eq!(drafts[1].estimated_turns, Some(6));
        assert_eq!(drafts[2].depends_on, vec![SubtaskIndex(0), SubtaskIndex(1)]);
        assert_eq!(drafts[2].estimated_turns, None);
        assert!(validate_plan(drafts, 6).is_ok());
    }

    #[test]
    fn self_reference_fails_validation() {
        let reply = "SUBTASK 0: a\nDEPENDS_ON: none\nSUBTASK 1: b\nDEPENDS_ON: 0\nSUBTASK 2: c\nDEPENDS_ON: 2\n";
        let drafts = parse_decomposition(reply).unwrap();
        let err = validate_plan(drafts, 6).unwrap_err();
        assert!(matches!(err, DecomposeError::ForwardDependency { subtask: 2, dependency: 2 }));
    }

    #[test]
    fn too_few_or_garbled() {
        assert!(matches!(
            validate_plan(parse_decomposition("SUBTASK 0: only one").unwrap(), 6),
            Err(DecomposeError::TooFewSubtasks(1))
        ));
        assert!(matches!(validate_plan(parse_decomposition("I can't do that").unwrap(), 6), Err(DecomposeError::TooFewSubtasks(0))));
        assert!(matches!(
            parse_decomposition("SUBTASK 0: a\nDEPENDS_ON: first"),
            Err(DecomposeError::InvalidResponse(_))
        ));
    }

    #[test]
    fn truncates_to_cap() {
        let reply: String = (0..9).map(|i| format!("SUBTASK {i}: step {i}\nDEPENDS_ON: none\n")).collect();
        let drafts = validate_plan(parse_decomposition(&reply).unwrap(), 6).unwrap();
        assert_eq!(drafts.len(), 6);
        assert_eq!(drafts[5].title, "step 5");
    }

    #[test]
    fn truncated_chain_only_references_kept_subtasks() {
        let reply: String = (0..8)
            .map(|i| {
                let deps = if i == 0 { "none".to_string() } else { (i - 1).to_string() };
                format!("SUBTASK {i}: step {i}\nDEPENDS_ON: {deps}\n")
            })
            .collect();
        let drafts = validate_plan(parse_decomposition(&reply).unwrap(), 3).unwrap();
        assert_eq!(drafts.len(), 3);
        assert!(drafts.iter().flat_map(|d| &d.depends_on).all(|dep| dep.0 < 3));
        assert_eq!(drafts[2].depends_on, vec![SubtaskIndex(1)]);
    }
}
