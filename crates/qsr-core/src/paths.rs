use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const QSR_DIR: &str = ".qsr";
pub const CONFIG_FILE: &str = ".qsr/config.yaml";
pub const DLQ_DIR: &str = ".qsr/dlq";

pub const DLQ_FAILED: &str = "failed";
pub const DLQ_MANUAL_REVIEW: &str = "manual_review";
pub const DLQ_RESOLVED: &str = "resolved";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn qsr_dir(root: &Path) -> PathBuf {
    root.join(QSR_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn dlq_dir(root: &Path) -> PathBuf {
    root.join(DLQ_DIR)
}

pub fn dlq_failed_dir(dlq_root: &Path) -> PathBuf {
    dlq_root.join(DLQ_FAILED)
}

pub fn dlq_manual_dir(dlq_root: &Path) -> PathBuf {
    dlq_root.join(DLQ_MANUAL_REVIEW)
}

pub fn dlq_resolved_dir(dlq_root: &Path) -> PathBuf {
    dlq_root.join(DLQ_RESOLVED)
}

pub fn dlq_entry_file(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{id}.json"))
}
