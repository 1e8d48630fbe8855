use crate::output::{print_json, print_table, truncate};
use anyhow::Context;
use clap::Subcommand;
use qsr_core::config::Config;
use qsr_core::dlq::{DeadLetterQueue, FailedOperation};
use qsr_core::paths;
use std::path::Path;

// ---------------------------------------------------------------------------
// Subcommand tree
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum DlqSubcommand {
    /// Show queue sizes
    Status,

    /// List entries awaiting retry (or manual review with --manual)
    List {
        /// List the manual review queue instead
        #[arg(long)]
        manual: bool,
    },

    /// Show one entry in full
    Show {
        /// Operation ID
        id: String,
    },

    /// Resolve a manual review entry with a note
    Resolve {
        /// Operation ID
        id: String,

        /// What was done to fix it
        note: String,
    },
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(root: &Path, subcommand: DlqSubcommand, json: bool) -> anyhow::Result<()> {
    let config = Config::load(root).context("failed to load config")?;
    let dlq = DeadLetterQueue::open(paths::dlq_dir(root), config.dlq)
        .context("failed to open dead letter queue")?;

    match subcommand {
        DlqSubcommand::Status => {
            let status = dlq.get_queue_status();
            if json {
                // Processor and pause state belong to the serving process, not this one.
                print_json(&serde_json::json!({
                    "failed_operations": status.failed_operations,
                    "manual_review_queue": status.manual_review_queue,
                }))?;
            } else {
                println!("awaiting retry:  {}", status.failed_operations);
                println!("manual review:   {}", status.manual_review_queue);
            }
            Ok(())
        }

        DlqSubcommand::List { manual } => {
            let entries = if manual {
                dlq.list_manual_review()
            } else {
                dlq.list_failed()
            };
            if json {
                return print_json(&entries);
            }
            if entries.is_empty() {
                let which = if manual { "manual review" } else { "retry" };
                println!("no entries awaiting {which}");
                return Ok(());
            }
            print_table(
                &["ID", "TYPE", "ERROR", "RETRIES", "NEXT ATTEMPT", "MESSAGE"],
                entries.iter().map(row).collect(),
            );
            Ok(())
        }

        DlqSubcommand::Show { id } => {
            let entry = dlq.get(&id)?;
            if json {
                return print_json(&entry);
            }
            println!("ID:        {}", entry.operation_id);
            println!("Type:      {}", entry.operation_type);
            println!("Error:     {} ({})", entry.error_message, entry.error_type);
            println!("Strategy:  {}", entry.retry_strategy);
            println!("Retries:   {}/{}", entry.retry_count, entry.max_retries);
            println!(
                "Queue:     {}",
                if entry.manual_review { "manual review" } else { "retry" }
            );
            println!("Created:   {}", entry.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
            if let Some(t) = entry.last_attempt_at {
                println!("Last try:  {}", t.format("%Y-%m-%d %H:%M:%S UTC"));
            }
            if let Some(t) = entry.next_attempt_at {
                println!("Next try:  {}", t.format("%Y-%m-%d %H:%M:%S UTC"));
            }
            println!("Payload:");
            println!("{}", serde_json::to_string_pretty(&entry.payload)?);
            Ok(())
        }

        DlqSubcommand::Resolve { id, note } => {
            if !dlq.resolve_manual_operation(&id, note.as_str())? {
                anyhow::bail!("'{id}' is not in the manual review queue");
            }
            if json {
                print_json(&serde_json::json!({ "operation_id": id, "resolved": true }))?;
            } else {
                println!("resolved {id}");
            }
            Ok(())
        }
    }
}

fn row(e: &FailedOperation) -> Vec<String> {
    vec![
        e.operation_id.clone(),
        e.operation_type.clone(),
        e.error_type.to_string(),
        format!("{}/{}", e.retry_count, e.max_retries),
        e.next_attempt_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string()),
        truncate(&e.error_message, 50),
    ]
}
