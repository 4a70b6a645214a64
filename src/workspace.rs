//! Disposable per-run copy of the target repository.

use crate::error::WorkspaceError;
use std::path::Path;
use tempfile::TempDir;
use walkdir::WalkDir;

const WORKSPACE_PREFIX: &str = "opsguard-ws-";

/// Directory names never copied into a workspace or sandbox staging area.
const SKIP_DIRS: &[&str] = &[".git", "__pycache__", ".venv", "node_modules", ".pytest_cache"];

/// Owning handle to the run's workspace directory.
///
/// `destroy` consumes the handle, so a workspace can only be torn down once.
/// If a run unwinds without calling it, dropping the inner `TempDir` removes
/// the directory.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    pub fn create(repo: &Path) -> Result<Self, WorkspaceError> {
        if !repo.is_dir() {
            return Err(WorkspaceError::RepoMissing(repo.to_path_buf()));
        }
        let dir = tempfile::Builder::new()
            .prefix(WORKSPACE_PREFIX)
            .tempdir()?;
        let copied = copy_tree(repo, dir.path())?;
        tracing::debug!(
            source = %repo.display(),
            workspace = %dir.path().display(),
            files = copied,
            "Workspace created"
        );
        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn destroy(self) -> Result<(), WorkspaceError> {
        let path = self.dir.path().to_path_buf();
        self.dir.close()?;
        tracing::debug!(workspace = %path.display(), "Workspace destroyed");
        Ok(())
    }
}

fn is_skipped(entry: &walkdir::DirEntry) -> bool {
    entry.file_type().is_dir()
        && entry
            .file_name()
            .to_str()
            .map(|name| SKIP_DIRS.contains(&name))
            .unwrap_or(false)
}

/// Copy regular files and directories from `src` into `dst`. Symlinks are
/// not followed and not copied. Returns the number of files copied.
pub(crate) fn copy_tree(src: &Path, dst: &Path) -> Result<usize, WorkspaceError> {
    let mut copied = 0usize;
    let walker = WalkDir::new(src)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_skipped(entry));

    for entry in walker {
        let entry = entry.map_err(|e| WorkspaceError::Copy(e.to_string()))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| WorkspaceError::Copy(e.to_string()))?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let target = dst.join(relative);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if file_type.is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target).map_err(|e| {
                WorkspaceError::Copy(format!("{}: {}", entry.path().display(), e))
            })?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_repo() -> TempDir {
        let repo = TempDir::new().unwrap();
        std::fs::write(repo.path().join("app.py"), "print('hi')\n").unwrap();
        std::fs::create_dir_all(repo.path().join("tests")).unwrap();
        std::fs::write(repo.path().join("tests/test_app.py"), "def test_ok():\n    pass\n").unwrap();
        std::fs::create_dir_all(repo.path().join(".git/objects")).unwrap();
        std::fs::write(repo.path().join(".git/HEAD"), "ref: refs/heads/main\n").unwrap();
        std::fs::create_dir_all(repo.path().join("__pycache__")).unwrap();
        std::fs::write(repo.path().join("__pycache__/app.cpython-311.pyc"), [0u8, 1, 2]).unwrap();
        repo
    }

    #[test]
    fn test_create_copies_sources_and_skips_noise() {
        let repo = sample_repo();
        let workspace = Workspace::create(repo.path()).unwrap();

        assert!(workspace.path().join("app.py").is_file());
        assert!(workspace.path().join("tests/test_app.py").is_file());
        assert!(!workspace.path().join(".git").exists());
        assert!(!workspace.path().join("__pycache__").exists());
        assert_ne!(workspace.path(), repo.path());
    }

    #[test]
    fn test_workspace_edits_do_not_touch_source() {
        let repo = sample_repo();
        let workspace = Workspace::create(repo.path()).unwrap();
        std::fs::write(workspace.path().join("app.py"), "print('changed')\n").unwrap();
        assert_eq!(
            std::fs::read_to_string(repo.path().join("app.py")).unwrap(),
            "print('hi')\n"
        );
    }

    #[test]
    fn test_destroy_removes_directory() {
        let repo = sample_repo();
        let workspace = Workspace::create(repo.path()).unwrap();
        let path = workspace.path().to_path_buf();
        workspace.destroy().unwrap();
        assert!(!path.exists());
        assert!(repo.path().join("app.py").exists());
    }

    #[test]
    fn test_drop_removes_directory() {
        let repo = sample_repo();
        let path = {
            let workspace = Workspace::create(repo.path()).unwrap();
            workspace.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_missing_repo_is_rejected() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        assert!(matches!(
            Workspace::create(&missing),
            Err(WorkspaceError::RepoMissing(_))
        ));
    }
}
