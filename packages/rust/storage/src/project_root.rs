//! Project root discovery and root-relative path references.

use std::path::{Component, Path, PathBuf};

/// Absolute form of `path` with `.` and `..` folded away lexically.
pub fn normalize(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(out.components().next_back(), Some(Component::Normal(_))) {
                    out.pop();
                } else if !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Walk up from `start` and return the first directory containing any of
/// `markers`. Falls back to `start` itself, normalized.
pub fn discover_project_root(start: &Path, markers: &[String]) -> PathBuf {
    let start = normalize(start);

    for dir in start.ancestors() {
        if markers.iter().any(|m| dir.join(m).exists()) {
            tracing::debug!(root = %dir.display(), "discovered project root");
            return dir.to_path_buf();
        }
    }

    tracing::debug!(root = %start.display(), "no root marker found, using progress dir");
    start
}

/// Express `path` relative to `root` with forward slashes. Paths outside the
/// root keep their full normalized form.
pub fn relative_ref(root: &Path, path: &Path) -> String {
    let absolute = normalize(path);
    let root = normalize(root);
    match absolute.strip_prefix(&root) {
        Ok(rel) => rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/"),
        Err(_) => absolute.to_string_lossy().into_owned(),
    }
}

/// Turn a stored reference back into a path.
pub fn resolve_ref(root: &Path, reference: &str) -> PathBuf {
    let path = Path::new(reference);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}
