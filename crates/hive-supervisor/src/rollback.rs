use std::path::Path;

use anyhow::{Context, Result};
use hive_core::ChangeSnapshot;
use tracing::{info, warn};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RollbackReport {
    pub restored: Vec<String>,
    pub removed: Vec<String>,
    /// Modified or deleted paths without a captured pre-image.
    pub skipped: Vec<String>,
}

/// Undo a supervised session: rewrite pre-images and delete created files.
pub fn rollback(snapshot: &ChangeSnapshot) -> Result<RollbackReport> {
    let root = Path::new(&snapshot.root);
    let mut report = RollbackReport::default();

    for rel in snapshot.modified.iter().chain(&snapshot.deleted) {
        let Some(text) = snapshot.pre_images.get(rel) else {
            report.skipped.push(rel.clone());
            continue;
        };
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        std::fs::write(&path, text).with_context(|| format!("restore {}", path.display()))?;
        report.restored.push(rel.clone());
    }

    for rel in &snapshot.created {
        let path = root.join(rel);
        match std::fs::remove_file(&path) {
            Ok(()) => report.removed.push(rel.clone()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e).with_context(|| format!("remove {}", path.display())),
        }
    }

    if !report.skipped.is_empty() {
        warn!(snapshot = %snapshot.id, skipped = ?report.skipped, "no pre-image for some paths");
    }
    info!(snapshot = %snapshot.id, restored = report.restored.len(), removed = report.removed.len(), "rolled back");
    Ok(report)
}
