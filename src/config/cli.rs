//! CLI argument parsing using clap

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Optimisation direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Optimize {
    /// Higher fitness is better
    Max,
    /// Lower fitness is better
    Min,
}

/// Log verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// GASwarm - coordinator for distributed genetic-algorithm workers
#[derive(Parser, Debug)]
#[command(name = "gaswarm")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// TOML configuration file
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    // === Network Options ===
    /// Address to bind the worker and observer servers to
    #[arg(long, env = "GASWARM_BIND")]
    pub bind: Option<String>,

    /// Port workers connect to
    #[arg(long, env = "GASWARM_WORKER_PORT")]
    pub worker_port: Option<u16>,

    /// Port observers connect to (WebSocket)
    #[arg(long, env = "GASWARM_OBSERVER_PORT")]
    pub observer_port: Option<u16>,

    // === Elitism Options ===
    /// Number of elites kept in the global set (0 disables elitism)
    #[arg(long)]
    pub elitism_top: Option<usize>,

    /// Worker submissions collected before each elite merge (0 disables elitism)
    #[arg(long)]
    pub elitism_every: Option<usize>,

    /// Optimisation direction
    #[arg(long, value_enum)]
    pub optimize: Option<Optimize>,

    /// Default file for save_e / restore_e
    #[arg(long)]
    pub elites_file: Option<PathBuf>,

    // === Runtime Options ===
    /// How long exit waits for workers before forcing (e.g., 300s, 5m)
    #[arg(long)]
    pub shutdown_timeout: Option<String>,

    /// Do not read commands from stdin
    #[arg(long)]
    pub no_operator_input: bool,

    /// Log level (RUST_LOG is used when not given)
    #[arg(long, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    pub dump_config: bool,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_flags() {
        let cli = Cli::try_parse_from([
            "gaswarm",
            "--worker-port",
            "7000",
            "--elitism-top",
            "4",
            "--elitism-every",
            "2",
            "--optimize",
            "min",
            "--no-operator-input",
        ])
        .unwrap();

        assert_eq!(cli.worker_port, Some(7000));
        assert_eq!(cli.elitism_top, Some(4));
        assert_eq!(cli.elitism_every, Some(2));
        assert_eq!(cli.optimize, Some(Optimize::Min));
        assert!(cli.no_operator_input);
        assert!(cli.config.is_none());
    }
}
