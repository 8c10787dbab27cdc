//! driftsync CLI
//!
//! Operator tools for a persisted driftsync store.
//!
//! # Commands
//!
//! - `status` - Summarize records, outbox, retry tickets and the cursor
//! - `outbox` - List queued and settled changes
//! - `abandoned` - List changes whose retry budget ran out
//! - `audit` - Dump the audit log
//! - `retry` - Force an immediate retry of a change
//! - `discard` - Give up on a change
//! - `purge-tombstones` - Physically remove old, fully synced tombstones
//! - `prune-outbox` - Remove acknowledged outbox rows past retention

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// driftsync operator tools.
#[derive(Parser)]
#[command(name = "driftsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the store snapshot file
    #[arg(global = true, short, long)]
    store: Option<PathBuf>,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Summarize the store
    Status {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List outbox rows in enqueue order
    Outbox {
        /// Only rows with this status (pending, in_flight, applied, conflict,
        /// dependency_conflict, failed)
        #[arg(long)]
        status: Option<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List abandoned changes
    Abandoned {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Dump the audit log
    Audit {
        /// Maximum number of entries, newest last
        #[arg(short, long)]
        limit: Option<usize>,

        /// Only entries of this kind (e.g. conflict_remote_wins)
        #[arg(short, long)]
        kind: Option<String>,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Reset a change's retry ticket so it is sent in the next cycle
    Retry {
        /// Record type
        record_type: String,
        /// Record id
        id: String,
    },

    /// Give up on a change: destroy its ticket and mark it failed
    Discard {
        /// Record type
        record_type: String,
        /// Record id
        id: String,
    },

    /// Remove tombstones older than the given age once they are synced
    PurgeTombstones {
        /// Minimum tombstone age in hours
        #[arg(long, default_value = "720")]
        older_than_hours: u64,

        /// Dry run - show what would be removed
        #[arg(short, long)]
        dry_run: bool,
    },

    /// Remove acknowledged outbox rows past the retention window
    PruneOutbox {
        /// Retention in hours
        #[arg(long, default_value = "24")]
        retention_hours: u64,
    },

    /// Drop old audit entries
    PruneAudit {
        /// Retention in hours
        #[arg(long, default_value = "720")]
        retention_hours: u64,
        /// Entries to keep at most
        #[arg(long, default_value = "10000")]
        keep_last: usize,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Commands::Version = cli.command {
        println!("driftsync CLI v{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let path = cli.store.ok_or("Store path required (--store)")?;
    let store = commands::open(&path)?;

    match cli.command {
        Commands::Status { format } => commands::status::run(&store, &path, &format)?,
        Commands::Outbox { status, format } => {
            commands::outbox::run(&store, status.as_deref(), &format)?
        }
        Commands::Abandoned { format } => commands::retry::list(&store, &format)?,
        Commands::Audit {
            limit,
            kind,
            format,
        } => commands::audit::run(&store, limit, kind.as_deref(), &format)?,
        Commands::Retry { record_type, id } => {
            commands::retry::force(store, &record_type, &id)?
        }
        Commands::Discard { record_type, id } => {
            commands::retry::discard(store, &record_type, &id)?
        }
        Commands::PurgeTombstones {
            older_than_hours,
            dry_run,
        } => commands::purge::tombstones(store, older_than_hours, dry_run)?,
        Commands::PruneOutbox { retention_hours } => {
            commands::purge::outbox(store, retention_hours)?
        }
        Commands::PruneAudit {
            retention_hours,
            keep_last,
        } => {
            commands::purge::audit(store, retention_hours, keep_last)?;
        }
        Commands::Version => {}
    }

    Ok(())
}
