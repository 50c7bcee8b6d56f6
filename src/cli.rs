//! CLI command definitions using clap.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Switchboard - agent routing and resilience
#[derive(Parser, Debug)]
#[command(name = "switchboard")]
#[command(version)]
#[command(about = "In-process agent routing with circuit breaking and automatic recovery")]
#[command(
    long_about = "Switchboard routes requests between agents by capability, balances load, isolates failing agents behind circuit breakers and recovers from classified failures."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the mesh until Ctrl+C
    Run {
        /// Configuration file (TOML); defaults apply when omitted
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Snapshot directory, overriding the configuration
        #[arg(long)]
        snapshot_dir: Option<PathBuf>,

        /// Skip restoring from existing snapshots
        #[arg(long, default_value_t = false)]
        no_restore: bool,
    },

    /// Validate a configuration file
    CheckConfig {
        /// Configuration file (TOML)
        #[arg(short, long)]
        config: PathBuf,

        /// Print the effective configuration, defaults included
        #[arg(short, long, default_value_t = false)]
        print: bool,
    },

    /// Print the default configuration
    DefaultConfig,

    /// List the available load balancing strategies
    Strategies,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_run_parses_overrides() {
        let cli = Cli::try_parse_from([
            "switchboard",
            "run",
            "--config",
            "mesh.toml",
            "--snapshot-dir",
            "/tmp/snapshots",
            "--no-restore",
        ])
        .unwrap();

        match cli.command {
            Commands::Run {
                config,
                snapshot_dir,
                no_restore,
            } => {
                assert_eq!(config, Some(PathBuf::from("mesh.toml")));
                assert_eq!(snapshot_dir, Some(PathBuf::from("/tmp/snapshots")));
                assert!(no_restore);
            }
            other => unreachable!("parsed {other:?}"),
        }
    }

    #[test]
    fn test_check_config_requires_path() {
        assert!(Cli::try_parse_from(["switchboard", "check-config"]).is_err());
    }
}
