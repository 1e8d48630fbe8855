use qsr_core::paths;
use std::path::{Path, PathBuf};

/// Resolve the project root.
///
/// `--root` / `QSR_ROOT` wins; otherwise walk upward from the current
/// directory looking for `.qsr/`, falling back to the current directory.
pub fn resolve_root(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    find_upward(&cwd).unwrap_or(cwd)
}

fn find_upward(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(paths::QSR_DIR).is_dir())
        .map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn explicit_root_wins() {
        let dir = TempDir::new().unwrap();
        assert_eq!(resolve_root(Some(dir.path())), dir.path());
    }

    #[test]
    fn finds_qsr_dir_above() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(".qsr")).unwrap();
        let deep = dir.path().join("a/b");
        std::fs::create_dir_all(&deep).unwrap();
        assert_eq!(find_upward(&deep).unwrap(), dir.path());
    }

    #[test]
    fn no_marker_finds_nothing() {
        let dir = TempDir::new().unwrap();
        let deep = dir.path().join("x");
        std::fs::create_dir_all(&deep).unwrap();
        // Only guaranteed when no ancestor of the temp dir carries .qsr/.
        if find_upward(dir.path().parent().unwrap()).is_none() {
            assert!(find_upward(&deep).is_none());
        }
    }
}
