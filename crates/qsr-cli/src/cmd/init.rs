use anyhow::Context;
use qsr_core::{config::Config, io, paths};
use std::path::Path;

pub fn run(root: &Path) -> anyhow::Result<()> {
    println!("Initializing QSR core in: {}", root.display());

    let dlq = paths::dlq_dir(root);
    let dirs = [
        paths::qsr_dir(root),
        paths::dlq_failed_dir(&dlq),
        paths::dlq_manual_dir(&dlq),
        paths::dlq_resolved_dir(&dlq),
    ];
    for dir in &dirs {
        io::ensure_dir(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    }

    let config_path = paths::config_path(root);
    if config_path.exists() {
        println!("  exists:  {}", paths::CONFIG_FILE);
    } else {
        Config::new()
            .save(root)
            .context("failed to write config.yaml")?;
        println!("  created: {}", paths::CONFIG_FILE);
    }
    tracing::info!(root = %root.display(), "project initialized");
    Ok(())
}
