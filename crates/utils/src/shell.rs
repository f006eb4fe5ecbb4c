//! Cross-platform executable resolution.

use std::path::{Path, PathBuf};

/// Resolve an executable by name.
///
/// Explicit paths (absolute) are taken as-is when they exist; everything
/// else goes through a PATH lookup off the async runtime.
pub async fn resolve_executable_path(executable: &str) -> Option<PathBuf> {
    if executable.trim().is_empty() {
        return None;
    }

    let path = Path::new(executable);
    if path.is_absolute() && path.is_file() {
        return Some(path.to_path_buf());
    }

    let executable = executable.to_string();
    tokio::task::spawn_blocking(move || which::which(executable))
        .await
        .ok()
        .and_then(|result| result.ok())
}
