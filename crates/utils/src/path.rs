use std::path::{Path, PathBuf};

/// Directories never worth watching or walking.
pub const ALWAYS_SKIP_DIRS: &[&str] = &[".git", "node_modules", "target", ".venv", "__pycache__"];

/// Name of the per-project data directory holding the tracked state.
pub const DATA_DIR_NAME: &str = ".sudocode";

pub fn canonicalize_lossy(path: &Path) -> PathBuf {
    dunce::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// Layout of the on-disk state under a base directory.
///
/// ```text
/// <base>/
///   specs.jsonl
///   issues.jsonl
///   specs/<slug>[_<id>].md
///   issues/<slug>[_<id>].md
///   worktrees/<execution_id>/
///   db.sqlite
///   config.json
///   meta.json
/// ```
#[derive(Debug, Clone)]
pub struct DataLayout {
    base: PathBuf,
}

impl DataLayout {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn specs_jsonl(&self) -> PathBuf {
        self.base.join("specs.jsonl")
    }

    pub fn issues_jsonl(&self) -> PathBuf {
        self.base.join("issues.jsonl")
    }

    pub fn specs_dir(&self) -> PathBuf {
        self.base.join("specs")
    }

    pub fn issues_dir(&self) -> PathBuf {
        self.base.join("issues")
    }

    pub fn worktrees_dir(&self) -> PathBuf {
        self.base.join("worktrees")
    }

    pub fn worktree_path(&self, execution_id: &uuid::Uuid) -> PathBuf {
        self.worktrees_dir().join(execution_id.to_string())
    }

    pub fn db_file(&self) -> PathBuf {
        self.base.join("db.sqlite")
    }

    pub fn config_file(&self) -> PathBuf {
        self.base.join("config.json")
    }

    pub fn meta_file(&self) -> PathBuf {
        self.base.join("meta.json")
    }

    /// Ensure the directory skeleton exists.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base)?;
        std::fs::create_dir_all(self.specs_dir())?;
        std::fs::create_dir_all(self.issues_dir())?;
        std::fs::create_dir_all(self.worktrees_dir())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths() {
        let layout = DataLayout::new("/tmp/proj/.sudocode");
        assert!(layout.specs_jsonl().ends_with("specs.jsonl"));
        assert!(layout.issues_dir().ends_with("issues"));
        assert!(layout.meta_file().ends_with("meta.json"));
    }
}
