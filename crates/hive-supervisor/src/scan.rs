use std::collections::BTreeMap;
use std::path::Path;
use std::time::SystemTime;

use anyhow::{Context, Result};
use hive_core::ChangeKind;
use sha2::{Digest, Sha256};
use tracing::debug;
use walkdir::WalkDir;

const SKIP_DIRS: &[&str] = &[".git", "node_modules", "target"];

/// Content fingerprint of one entry. Symlinks are fingerprinted by their target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileState {
    pub hash: String,
    pub len: u64,
    pub symlink: bool,
    modified: Option<SystemTime>,
}

fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn rel_string(rel: &Path) -> String {
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Walk `root` and fingerprint every file. Hashes from `prev` are reused when
/// size and mtime are unchanged.
pub fn scan_tree(root: &Path, prev: &BTreeMap<String, FileState>) -> Result<BTreeMap<String, FileState>> {
    let mut out = BTreeMap::new();
    let walker = WalkDir::new(root).follow_links(false).into_iter().filter_entry(|e| {
        let name = e.file_name().to_str();
        // A worktree's `.git` is a file pointing back at the main repository.
        e.depth() == 0
            || !(name == Some(".git") || (e.file_type().is_dir() && name.is_some_and(|n| SKIP_DIRS.contains(&n))))
    });

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) if e.depth() == 0 => {
                return Err(e).with_context(|| format!("scan {}", root.display()));
            }
            Err(e) => {
                debug!(error = %e, "skipping unreadable entry");
                continue;
            }
        };
        let ft = entry.file_type();
        if ft.is_dir() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(root) else { continue };
        let rel = rel_string(rel);

        if ft.is_symlink() {
            let Ok(target) = std::fs::read_link(entry.path()) else { continue };
            let hash = digest(target.to_string_lossy().as_bytes());
            out.insert(rel, FileState { hash, len: 0, symlink: true, modified: None });
            continue;
        }

        // Files can vanish between listing and reading.
        let Ok(meta) = entry.metadata() else { continue };
        let modified = meta.modified().ok();
        if let Some(old) = prev.get(&rel) {
            if !old.symlink && old.len == meta.len() && modified.is_some() && old.modified == modified {
                out.insert(rel, old.clone());
                continue;
            }
        }
        let Ok(bytes) = std::fs::read(entry.path()) else { continue };
        out.insert(rel, FileState { hash: digest(&bytes), len: bytes.len() as u64, symlink: false, modified });
    }
    Ok(out)
}

/// Paths that differ between two scans, in path order.
pub fn diff_states(
    before: &BTreeMap<String, FileState>,
    after: &BTreeMap<String, FileState>,
) -> Vec<(String, ChangeKind)> {
    let mut changes = Vec::new();
    for (path, state) in after {
        match before.get(path) {
            None => changes.push((path.clone(), ChangeKind::Created)),
            Some(old) if old.hash != state.hash || old.symlink != state.symlink => {
                changes.push((path.clone(), ChangeKind::Modified))
            }
            Some(_) => {}
        }
    }
    for path in before.keys() {
        if !after.contains_key(path) {
            changes.push((path.clone(), ChangeKind::Deleted));
        }
    }
    changes.sort_by(|a, b| a.0.cmp(&b.0));
    changes
}

/// Content of every small UTF-8 file in a scan, for later rollback.
pub(crate) fn read_text_baseline(
    root: &Path,
    states: &BTreeMap<String, FileState>,
    max_bytes: u64,
) -> BTreeMap<String, String> {
    states
        .iter()
        .filter(|(_, s)| !s.symlink && s.len < max_bytes)
        .filter_map(|(rel, _)| {
            let text = std::fs::read_to_string(root.join(rel)).ok()?;
            Some((rel.clone(), text))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn skips_vendor_dirs_and_reports_changes() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("src")).unwrap();
        std::fs::create_dir_all(root.join("node_modules/x")).unwrap();
        std::fs::write(root.join("src/a.rs"), "fn a() {}").unwrap();
        std::fs::write(root.join("gone.txt"), "bye").unwrap();
        std::fs::write(root.join("node_modules/x/index.js"), "x").unwrap();

        let before = scan_tree(root, &BTreeMap::new()).unwrap();
        assert_eq!(before.keys().collect::<Vec<_>>(), vec!["gone.txt", "src/a.rs"]);

        std::fs::write(root.join("src/a.rs"), "fn a() { todo!() }").unwrap();
        std::fs::remove_file(root.join("gone.txt")).unwrap();
        std::fs::write(root.join("new.txt"), "hi").unwrap();
        let after = scan_tree(root, &before).unwrap();

        assert_eq!(
            diff_states(&before, &after),
            vec![
                ("gone.txt".to_string(), ChangeKind::Deleted),
                ("new.txt".to_string(), ChangeKind::Created),
                ("src/a.rs".to_string(), ChangeKind::Modified),
            ]
        );
    }

    #[test]
    fn baseline_skips_large_and_binary_files() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("small.txt"), "ok").unwrap();
        std::fs::write(dir.path().join("big.txt"), "x".repeat(64)).unwrap();
        std::fs::write(dir.path().join("bin.dat"), [0xffu8, 0xfe, 0x00]).unwrap();
        let states = scan_tree(dir.path(), &BTreeMap::new()).unwrap();
        let baseline = read_text_baseline(dir.path(), &states, 32);
        assert_eq!(baseline.keys().collect::<Vec<_>>(), vec!["small.txt"]);
    }
}
