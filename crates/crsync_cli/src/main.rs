//! crsync CLI
//!
//! Runs the sync server and inspects room logs.
//!
//! # Commands
//!
//! - `serve` - Run the WebSocket sync server until Ctrl-C
//! - `inspect` - Summarize a room log

mod commands;

use clap::{Parser, Subcommand};
use commands::serve::ServeArgs;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// crsync replication server and tools.
#[derive(Parser)]
#[command(name = "crsync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sync server
    Serve(ServeArgs),

    /// Summarize a room log
    Inspect {
        /// Directory holding room logs
        #[arg(short, long)]
        data_dir: PathBuf,

        /// Room to inspect
        room: String,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // RUST_LOG wins over -v
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Serve(args) => commands::serve::run(&args)?,
        Commands::Inspect {
            data_dir,
            room,
            format,
        } => commands::inspect::run(&data_dir, &room, &format)?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_serve() {
        let cli = Cli::try_parse_from([
            "crsync",
            "serve",
            "--bind",
            "0.0.0.0:9000",
            "--data-dir",
            "rooms",
            "--cache-ttl-secs",
            "30",
            "-v",
        ])
        .unwrap();
        assert!(cli.verbose);
        let Commands::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.bind, Some("0.0.0.0:9000".parse().unwrap()));
        assert_eq!(args.data_dir, Some(PathBuf::from("rooms")));
        assert_eq!(args.cache_ttl_secs, Some(30));
        assert!(!args.memory);
    }

    #[test]
    fn data_dir_conflicts_with_memory() {
        let parsed = Cli::try_parse_from(["crsync", "serve", "--memory", "--data-dir", "rooms"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn parse_inspect() {
        let cli =
            Cli::try_parse_from(["crsync", "inspect", "--data-dir", "rooms", "notes", "-f", "json"])
                .unwrap();
        let Commands::Inspect {
            data_dir,
            room,
            format,
        } = cli.command
        else {
            panic!("expected inspect");
        };
        assert_eq!(data_dir, PathBuf::from("rooms"));
        assert_eq!(room, "notes");
        assert_eq!(format, "json");
    }
}
