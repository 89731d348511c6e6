//! Chronoshift CLI
//!
//! Offline tools for inspecting an event store and its transformations.
//!
//! # Commands
//!
//! - `segments` - List segment files and their versions
//! - `verify` - Verify segment data, indexes and bloom filters
//! - `transformations` - List transformation records of a context
//! - `entries` - Dump the pending edits of a transformation

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Chronoshift command-line event store tools.
#[derive(Parser)]
#[command(name = "chronoshift")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Root directory of the event store
    #[arg(global = true, short, long)]
    path: Option<PathBuf>,

    /// Context to operate on
    #[arg(global = true, short, long, default_value = "default")]
    context: String,

    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List segment files and their versions
    Segments {
        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Verify segment data, indexes and bloom filters
    Verify {
        /// Also check superseded versions kept for rollback
        #[arg(short, long)]
        all_versions: bool,
    },

    /// List transformation records
    Transformations {
        /// Directory of the transformation records
        #[arg(short, long)]
        state: PathBuf,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Dump the pending edits of a transformation
    Entries {
        /// Transformation identifier
        id: String,

        /// Start from this entry
        #[arg(short, long, default_value = "0")]
        from: u64,

        /// Maximum number of entries to dump
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Show version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Segments { format } => {
            let path = cli.path.ok_or("Store path required for segments")?;
            commands::segments::run(&path, &cli.context, &format)?;
        }
        Commands::Verify { all_versions } => {
            let path = cli.path.ok_or("Store path required for verify")?;
            commands::verify::run(&path, &cli.context, all_versions)?;
        }
        Commands::Transformations { state, format } => {
            commands::transformations::run(&state, &cli.context, &format)?;
        }
        Commands::Entries { id, from, limit } => {
            let path = cli.path.ok_or("Store path required for entries")?;
            commands::entries::run(&path, &cli.context, &id, from, limit)?;
        }
        Commands::Version => {
            println!("Chronoshift CLI v{}", env!("CARGO_PKG_VERSION"));
        }
    }

    Ok(())
}
