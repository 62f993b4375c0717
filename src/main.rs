// ABOUTME: CLI entry point for database-reconciler
// ABOUTME: Parses commands and routes to appropriate handlers

use clap::{Parser, Subcommand};
use database_reconciler::commands;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "database-reconciler")]
#[command(about = "Scan, sync and replicate tables between two databases", long_about = None)]
#[command(version)]
struct Cli {
    /// Set the log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compare tables and report rows that differ
    Scan {
        /// Path to the reconciler TOML configuration
        #[arg(long, env = "RECONCILER_CONFIG")]
        config: PathBuf,
        /// Print every difference as JSON
        #[arg(long)]
        details: bool,
        /// Left table names (default: all configured tables)
        tables: Vec<String>,
    },
    /// Make tables identical according to the record and conflict handling options
    Sync {
        #[arg(long, env = "RECONCILER_CONFIG")]
        config: PathBuf,
        /// Left table names (default: all configured tables)
        tables: Vec<String>,
    },
    /// Replicate logged changes between both databases
    Replicate {
        #[arg(long, env = "RECONCILER_CONFIG")]
        config: PathBuf,
        /// Run a single pass and exit (don't run continuously)
        #[arg(long)]
        once: bool,
    },
    /// Create the change log and event log tables on both databases
    Install {
        #[arg(long, env = "RECONCILER_CONFIG")]
        config: PathBuf,
    },
}

// Not async: the PostgreSQL adapter drives its own runtime behind a
// blocking interface.
fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    // 1. RUST_LOG environment variable has highest precedence
    // 2. --log flag is used if RUST_LOG is not set
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(cli.log.clone()));

    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    match cli.command {
        Commands::Scan {
            config,
            details,
            tables,
        } => commands::scan(&config, details, &tables),
        Commands::Sync { config, tables } => commands::sync(&config, &tables),
        Commands::Replicate { config, once } => commands::replicate(&config, once),
        Commands::Install { config } => commands::install(&config),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_scan_with_tables() {
        let cli = Cli::try_parse_from([
            "database-reconciler",
            "scan",
            "--config",
            "reconcile.toml",
            "--details",
            "users",
            "orders",
        ])
        .unwrap();
        match cli.command {
            Commands::Scan {
                config,
                details,
                tables,
            } => {
                assert_eq!(config, PathBuf::from("reconcile.toml"));
                assert!(details);
                assert_eq!(tables, vec!["users", "orders"]);
            }
            _ => panic!("expected scan"),
        }
        assert_eq!(cli.log, "info");
    }

    #[test]
    fn test_parses_replicate_once_with_global_log() {
        let cli = Cli::try_parse_from([
            "database-reconciler",
            "replicate",
            "--config",
            "reconcile.toml",
            "--once",
            "--log",
            "debug",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Replicate { once: true, .. }));
        assert_eq!(cli.log, "debug");
    }
}
