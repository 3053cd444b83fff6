//! Workspace Layout (C3): creates `<session-root>/` with one numbered
//! subdirectory per case and a single staged copy of the application tree.
//! Resource acquisition is scoped — on failure, partially created
//! directories are removed (teacher pattern: atomic-with-rollback file
//! operations, `sx9-smart-crate-orchestrator/src/lib.rs` module docs).

use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::UkError;
use crate::matrix::TargetCase;

pub struct Workspace {
    pub root: PathBuf,
    pub app_staging: PathBuf,
}

impl Workspace {
    pub fn case_dir(&self, index: usize) -> PathBuf {
        self.root.join(index.to_string())
    }

    pub fn summary_path(&self) -> PathBuf {
        self.root.join("summary")
    }

    pub fn common_sh_path(&self) -> PathBuf {
        self.root.join("common.sh")
    }
}

fn rollback(root: &Path) {
    if root.exists() {
        if let Err(e) = std::fs::remove_dir_all(root) {
            warn!(path = %root.display(), error = %e, "failed to roll back partial workspace");
        }
    }
}

fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(std::io::Error::other)?;
        let rel = entry.path().strip_prefix(src).expect("walked under src");
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Creates `<tests_dir>/<session_name>/`, one subdirectory per case, and a
/// single staged copy of `app_source` at `<session-root>/<app_dir_name>/`.
pub fn create(
    tests_dir: &Path,
    session_name: &str,
    app_source: &Path,
    app_dir_name: &str,
    cases: &[TargetCase],
) -> Result<Workspace, UkError> {
    let root = tests_dir.join(session_name);
    let build = || -> Result<Workspace, UkError> {
        std::fs::create_dir_all(&root)
            .map_err(|e| UkError::Layout(format!("creating session root {}: {e}", root.display())))?;

        for case in cases {
            let dir = root.join(case.index.to_string());
            std::fs::create_dir_all(&dir).map_err(|e| {
                UkError::Layout(format!("creating case directory {}: {e}", dir.display()))
            })?;
        }

        let app_staging = root.join(app_dir_name);
        copy_tree(app_source, &app_staging).map_err(|e| {
            UkError::Layout(format!(
                "staging application tree from {} to {}: {e}",
                app_source.display(),
                app_staging.display()
            ))
        })?;

        debug!(root = %root.display(), cases = cases.len(), "workspace created");
        Ok(Workspace { root: root.clone(), app_staging })
    };

    build().map_err(|e| {
        rollback(&root);
        e
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppType;
    use indexmap::IndexMap;
    use tempfile::tempdir;

    fn case(index: usize) -> TargetCase {
        TargetCase {
            index,
            id: format!("case-{index}"),
            assignment: IndexMap::new(),
        }
    }

    #[test]
    fn creates_numbered_dirs_and_stages_app() {
        let tests_dir = tempdir().unwrap();
        let app_source = tempdir().unwrap();
        std::fs::write(app_source.path().join("Makefile"), b"all:\n").unwrap();

        let cases = vec![case(1), case(2), case(3)];
        let ws = create(tests_dir.path(), "session", app_source.path(), "app", &cases).unwrap();

        for c in &cases {
            assert!(ws.case_dir(c.index).is_dir());
        }
        assert!(ws.app_staging.join("Makefile").is_file());
        let _ = AppType::KernelImage;
    }

    #[test]
    fn rolls_back_on_failure() {
        let tests_dir = tempdir().unwrap();
        // Nonexistent app source makes the staging copy fail.
        let missing = tests_dir.path().join("does-not-exist");
        let cases = vec![case(1)];
        let result = create(tests_dir.path(), "session", &missing, "app", &cases);
        assert!(result.is_err());
        assert!(!tests_dir.path().join("session").exists());
    }
}
