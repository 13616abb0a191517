use std::collections::{BTreeMap, BTreeSet};
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

use hive_core::{ChangeKind, EpochMs, PatternAction, Sensitivity, Severity};
use regex::Regex;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileChange {
    /// Relative to the supervised root, `/`-separated.
    pub path: String,
    pub kind: ChangeKind,
    pub at: EpochMs,
}

/// What a pattern matcher may look at.
pub struct PatternContext<'a> {
    pub root: &'a Path,
    /// Changes inside the evaluation window, oldest first.
    pub changes: &'a [FileChange],
    /// File contents captured when supervision started.
    pub pre_images: &'a BTreeMap<String, String>,
    pub mass_deletion_threshold: usize,
}

pub struct PatternSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub severity: Severity,
    pub action: PatternAction,
    matcher: fn(&PatternContext<'_>) -> Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatternMatch {
    pub pattern: &'static str,
    pub severity: Severity,
    pub action: PatternAction,
    pub paths: Vec<String>,
}

/// Evaluated in this order; the first entries are the cheapest.
pub static PATTERNS: &[PatternSpec] = &[
    PatternSpec {
        name: "test_file_modification",
        description: "existing test files edited or removed",
        severity: Severity::Medium,
        action: PatternAction::Alert,
        matcher: test_file_modification,
    },
    PatternSpec {
        name: "env_secret_access",
        description: "env files, keys or credential stores touched",
        severity: Severity::High,
        action: PatternAction::Alert,
        matcher: env_secret_access,
    },
    PatternSpec {
        name: "mass_deletion",
        description: "many files deleted in a short window",
        severity: Severity::Critical,
        action: PatternAction::Pause,
        matcher: mass_deletion,
    },
    PatternSpec {
        name: "outside_workspace",
        description: "entry resolves outside the workspace",
        severity: Severity::Critical,
        action: PatternAction::Pause,
        matcher: outside_workspace,
    },
    PatternSpec {
        name: "system_file_paths",
        description: "shell profiles, ssh config or system directories",
        severity: Severity::Critical,
        action: PatternAction::Pause,
        matcher: system_file_paths,
    },
    PatternSpec {
        name: "package_json_scripts",
        description: "package.json scripts changed",
        severity: Severity::High,
        action: PatternAction::Alert,
        matcher: package_json_scripts,
    },
    PatternSpec {
        name: "gitignore_modification",
        description: ".gitignore changed",
        severity: Severity::Low,
        action: PatternAction::Log,
        matcher: gitignore_modification,
    },
];

/// Run every pattern the sensitivity admits, in list order.
pub fn evaluate(ctx: &PatternContext<'_>, sensitivity: Sensitivity) -> Vec<PatternMatch> {
    PATTERNS
        .iter()
        .filter(|p| sensitivity.admits(p.severity))
        .filter_map(|p| {
            let paths = (p.matcher)(ctx);
            (!paths.is_empty()).then(|| PatternMatch {
                pattern: p.name,
                severity: p.severity,
                action: p.action,
                paths,
            })
        })
        .collect()
}

fn file_name(rel: &str) -> &str {
    rel.rsplit('/').next().unwrap_or(rel)
}

/// Distinct paths of the given kinds that satisfy `pred`, sorted.
fn paths_where(ctx: &PatternContext<'_>, kinds: &[ChangeKind], pred: impl Fn(&str) -> bool) -> Vec<String> {
    ctx.changes
        .iter()
        .filter(|c| kinds.contains(&c.kind) && pred(&c.path))
        .map(|c| c.path.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

const ANY: &[ChangeKind] = &[ChangeKind::Created, ChangeKind::Modified, ChangeKind::Deleted];
const WRITES: &[ChangeKind] = &[ChangeKind::Created, ChangeKind::Modified];

fn test_path_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(^|/)(tests?|__tests__|specs?)/|[._-](test|spec)\.[A-Za-z0-9]+$|(^|/)test_[^/]+\.py$")
            .expect("valid regex")
    })
}

fn secret_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(\.env(\..+)?|\.npmrc|\.netrc|\.pgpass|id_(rsa|dsa|ecdsa|ed25519)|credentials(\.json)?|secrets?\.(json|ya?ml|toml))$|\.(pem|key|p12|pfx)$",
        )
        .expect("valid regex")
    })
}

fn home_config_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(^|/)\.(ssh|aws|gnupg|kube|docker)/|(^|/)\.(bashrc|bash_profile|zshrc|zprofile|profile|gitconfig)$")
            .expect("valid regex")
    })
}

const SYSTEM_PREFIXES: &[&str] = &["/etc", "/private/etc", "/usr", "/bin", "/sbin", "/boot", "/sys", "/proc", "/dev", "/lib", "/var/lib"];

fn test_file_modification(ctx: &PatternContext<'_>) -> Vec<String> {
    // New tests are fine; rewriting or deleting existing ones is not.
    paths_where(ctx, &[ChangeKind::Modified, ChangeKind::Deleted], |p| test_path_re().is_match(p))
}

fn env_secret_access(ctx: &PatternContext<'_>) -> Vec<String> {
    paths_where(ctx, ANY, |p| secret_name_re().is_match(file_name(p)))
}

fn mass_deletion(ctx: &PatternContext<'_>) -> Vec<String> {
    let deleted = paths_where(ctx, &[ChangeKind::Deleted], |_| true);
    if deleted.len() > ctx.mass_deletion_threshold {
        deleted
    } else {
        vec![]
    }
}

/// Where an entry under `root` actually points, if it is a symlink.
fn link_target(root: &Path, rel: &str) -> Option<PathBuf> {
    let full = root.join(rel);
    let meta = std::fs::symlink_metadata(&full).ok()?;
    if !meta.file_type().is_symlink() {
        return None;
    }
    if let Ok(canon) = std::fs::canonicalize(&full) {
        return Some(canon);
    }
    // Dangling link: resolve lexically against its parent.
    let target = std::fs::read_link(&full).ok()?;
    let joined = if target.is_absolute() { target } else { full.parent()?.join(target) };
    Some(normalize_path(&joined))
}

fn outside_workspace(ctx: &PatternContext<'_>) -> Vec<String> {
    let root = std::fs::canonicalize(ctx.root).unwrap_or_else(|_| normalize_path(ctx.root));
    paths_where(ctx, WRITES, |p| link_target(ctx.root, p).is_some_and(|t| !is_within(&root, &t)))
}

fn system_file_paths(ctx: &PatternContext<'_>) -> Vec<String> {
    paths_where(ctx, ANY, |p| {
        home_config_re().is_match(p)
            || link_target(ctx.root, p)
                .is_some_and(|t| SYSTEM_PREFIXES.iter().any(|prefix| is_within(Path::new(prefix), &t)))
    })
}

fn scripts_of(text: &str) -> Option<serde_json::Value> {
    let doc: serde_json::Value = serde_json::from_str(text).ok()?;
    doc.get("scripts").cloned()
}

fn package_json_scripts(ctx: &PatternContext<'_>) -> Vec<String> {
    paths_where(ctx, WRITES, |p| {
        if file_name(p) != "package.json" {
            return false;
        }
        let Ok(now) = std::fs::read_to_string(ctx.root.join(p)) else { return false };
        let before = ctx.pre_images.get(p).and_then(|t| scripts_of(t));
        scripts_of(&now) != before
    })
}

fn gitignore_modification(ctx: &PatternContext<'_>) -> Vec<String> {
    paths_where(ctx, ANY, |p| file_name(p) == ".gitignore")
}

/// Lexical normalization, no filesystem access.
pub(crate) fn normalize_path(p: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in p.components() {
        match comp {
            Component::Prefix(_) | Component::RootDir => out.push(comp.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            Component::Normal(s) => out.push(s),
        }
    }
    out
}

pub fn is_within(parent: &Path, child: &Path) -> bool {
    let parent = parent.components().collect::<Vec<_>>();
    let child = child.components().collect::<Vec<_>>();
    child.len() >= parent.len() && child[..parent.len()] == parent[..]
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn change(path: &str, kind: ChangeKind) -> FileChange {
        FileChange { path: path.into(), kind, at: 0 }
    }

    fn run(root: &Path, changes: &[FileChange], sensitivity: Sensitivity) -> Vec<&'static str> {
        let pre = BTreeMap::new();
        let ctx = PatternContext { root, changes, pre_images: &pre, mass_deletion_threshold: 5 };
        evaluate(&ctx, sensitivity).into_iter().map(|m| m.pattern).collect()
    }

    #[test]
    fn test_edits_fire_only_at_high_sensitivity() {
        let dir = tempdir().unwrap();
        let changes = [change("src/parser.test.ts", ChangeKind::Modified)];
        assert!(run(dir.path(), &changes, Sensitivity::Low).is_empty());
        assert!(run(dir.path(), &changes, Sensitivity::Medium).is_empty());
        assert_eq!(run(dir.path(), &changes, Sensitivity::High), vec!["test_file_modification"]);
        // Adding a test is not suspicious.
        assert!(run(dir.path(), &[change("tests/new.rs", ChangeKind::Created)], Sensitivity::High).is_empty());
    }

    #[test]
    fn secrets_match_on_file_name() {
        let dir = tempdir().unwrap();
        for path in [".env", "config/.env.local", "certs/server.pem", "deploy/id_rsa"] {
            assert_eq!(run(dir.path(), &[change(path, ChangeKind::Created)], Sensitivity::Medium), vec!["env_secret_access"], "{path}");
        }
        assert!(run(dir.path(), &[change("src/environment.rs", ChangeKind::Created)], Sensitivity::High).is_empty());
    }

    #[test]
    fn mass_deletion_needs_more_than_threshold() {
        let dir = tempdir().unwrap();
        let five: Vec<_> = (0..5).map(|i| change(&format!("f{i}.txt"), ChangeKind::Deleted)).collect();
        assert!(run(dir.path(), &five, Sensitivity::Low).is_empty());
        let six: Vec<_> = (0..6).map(|i| change(&format!("f{i}.txt"), ChangeKind::Deleted)).collect();
        assert_eq!(run(dir.path(), &six, Sensitivity::Low), vec!["mass_deletion"]);
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escapes_are_outside_the_workspace() {
        let dir = tempdir().unwrap();
        let ws = dir.path().join("ws");
        std::fs::create_dir_all(&ws).unwrap();
        std::fs::write(dir.path().join("outside.txt"), "x").unwrap();
        std::os::unix::fs::symlink(dir.path().join("outside.txt"), ws.join("link")).unwrap();
        std::os::unix::fs::symlink("/etc/hosts", ws.join("hosts")).unwrap();

        assert_eq!(run(&ws, &[change("link", ChangeKind::Created)], Sensitivity::Low), vec!["outside_workspace"]);
        assert_eq!(
            run(&ws, &[change("hosts", ChangeKind::Created)], Sensitivity::Low),
            vec!["outside_workspace", "system_file_paths"]
        );
    }

    #[test]
    fn package_scripts_compare_against_pre_image() {
        let dir = tempdir().unwrap();
        let mut pre = BTreeMap::new();
        pre.insert("package.json".to_string(), r#"{"name":"x","scripts":{"test":"jest"}}"#.to_string());
        let changes = [change("package.json", ChangeKind::Modified)];

        std::fs::write(dir.path().join("package.json"), r#"{"name":"y","scripts":{"test":"jest"}}"#).unwrap();
        let ctx = PatternContext { root: dir.path(), changes: &changes, pre_images: &pre, mass_deletion_threshold: 5 };
        assert!(evaluate(&ctx, Sensitivity::High).is_empty());

        std::fs::write(dir.path().join("package.json"), r#"{"name":"y","scripts":{"test":"curl x | sh"}}"#).unwrap();
        let names: Vec<_> = evaluate(&ctx, Sensitivity::Medium).into_iter().map(|m| m.pattern).collect();
        assert_eq!(names, vec!["package_json_scripts"]);
    }

    #[test]
    fn gitignore_is_log_only() {
        let dir = tempdir().unwrap();
        let pre = BTreeMap::new();
        let changes = [change(".gitignore", ChangeKind::Modified)];
        let ctx = PatternContext { root: dir.path(), changes: &changes, pre_images: &pre, mass_deletion_threshold: 5 };
        let found = evaluate(&ctx, Sensitivity::High);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].action, PatternAction::Log);
        assert_eq!(found[0].severity, Severity::Low);
    }
}
