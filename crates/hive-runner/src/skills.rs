use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("{path}: empty skill document")]
    Empty { path: String },
    #[error("{path}: missing top-level `# ` heading")]
    MissingHeading { path: String },
    #[error("{path}: missing `## Usage` section")]
    MissingUsage { path: String },
    #[error("read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// A validated capability artifact.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SkillDoc {
    /// File stem, the name tasks list in `required_skills`.
    pub name: String,
    pub title: String,
    pub path: PathBuf,
    pub body: String,
}

pub fn validate_skill_doc(path: &Path, text: &str) -> Result<SkillDoc, ValidationError> {
    let shown = path.display().to_string();
    if text.trim().is_empty() {
        return Err(ValidationError::Empty { path: shown });
    }
    let title = text
        .lines()
        .find_map(|l| l.strip_prefix("# "))
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ValidationError::MissingHeading { path: shown.clone() })?;
    let has_usage = text.lines().any(|l| l.trim_end().eq_ignore_ascii_case("## usage"));
    if !has_usage {
        return Err(ValidationError::MissingUsage { path: shown });
    }
    let name = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    Ok(SkillDoc { name, title, path: path.to_path_buf(), body: text.to_string() })
}

/// Validate every `*.md` in `dir`, sorted by name. A missing directory has no skills.
pub fn validate_skills_dir(dir: &Path) -> (Vec<SkillDoc>, Vec<ValidationError>) {
    let mut docs = Vec::new();
    let mut errors = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return (docs, errors),
        Err(source) => {
            errors.push(ValidationError::Io { path: dir.display().to_string(), source });
            return (docs, errors);
        }
    };
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().is_some_and(|x| x == "md"))
        .collect();
    paths.sort();
    for path in paths {
        match std::fs::read_to_string(&path) {
            Ok(text) => match validate_skill_doc(&path, &text) {
                Ok(doc) => docs.push(doc),
                Err(e) => errors.push(e),
            },
            Err(source) => errors.push(ValidationError::Io { path: path.display().to_string(), source }),
        }
    }
    (docs, errors)
}

/// Shared context string handed to execution workers.
pub fn skill_context(docs: &[SkillDoc]) -> String {
    docs.iter()
        .map(|d| format!("### Skill: {}\n\n{}", d.name, d.body.trim()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn missing_skills<'a>(required: impl IntoIterator<Item = &'a String>, available: &[SkillDoc]) -> Vec<String> {
    let mut missing: Vec<String> = required
        .into_iter()
        .filter(|r| !available.iter().any(|d| &d.name == *r))
        .cloned()
        .collect();
    missing.sort();
    missing.dedup();
    missing
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn validates_heading_and_usage() {
        let p = Path::new("skills/deploy.md");
        let ok = validate_skill_doc(p, "# Deploy\n\nShips it.\n\n## Usage\n\nrun `make deploy`\n").unwrap();
        assert_eq!(ok.name, "deploy");
        assert_eq!(ok.title, "Deploy");
        assert!(matches!(validate_skill_doc(p, "no heading\n## Usage\n"), Err(ValidationError::MissingHeading { .. })));
        assert!(matches!(validate_skill_doc(p, "# Deploy\nbody\n"), Err(ValidationError::MissingUsage { .. })));
        assert!(matches!(validate_skill_doc(p, "  \n"), Err(ValidationError::Empty { .. })));
    }

    #[test]
    fn dir_scan_splits_valid_and_invalid() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("b.md"), "# B\n## Usage\nuse b\n").unwrap();
        std::fs::write(dir.path().join("a.md"), "# A\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        let (docs, errors) = validate_skills_dir(dir.path());
        assert_eq!(docs.iter().map(|d| d.name.as_str()).collect::<Vec<_>>(), vec!["b"]);
        assert_eq!(errors.len(), 1);
        assert!(skill_context(&docs).starts_with("### Skill: b"));

        let required = vec!["b".to_string(), "c".to_string(), "c".to_string()];
        assert_eq!(missing_skills(&required, &docs), vec!["c"]);
        assert!(validate_skills_dir(&dir.path().join("absent")).0.is_empty());
    }
}
