//! TOML configuration file parsing

use super::*;
use crate::config::cli::{Cli, Optimize};
use crate::elite::OptimizeDirection;
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

/// Parse TOML configuration file
pub fn parse_toml_file(path: &Path) -> Result<CoordinatorConfig> {
    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_toml_string(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Parse TOML configuration from string
pub fn parse_toml_string(contents: &str) -> Result<CoordinatorConfig> {
    let config: CoordinatorConfig = ::toml::from_str(contents)
        .context("Failed to parse TOML configuration")?;

    Ok(config)
}

/// Render a configuration as TOML
pub fn to_toml_string(config: &CoordinatorConfig) -> Result<String> {
    ::toml::to_string_pretty(config).context("Failed to render configuration as TOML")
}

/// Build the effective configuration from CLI arguments
///
/// Loads the `--config` file when given, otherwise starts from defaults.
pub fn build_config(cli: &Cli) -> Result<CoordinatorConfig> {
    let config = match &cli.config {
        Some(path) => parse_toml_file(path)?,
        None => CoordinatorConfig::default(),
    };
    merge_cli_with_config(cli, config)
}

/// Merge CLI arguments with TOML configuration (CLI takes precedence)
pub fn merge_cli_with_config(cli: &Cli, mut config: CoordinatorConfig) -> Result<CoordinatorConfig> {
    // Override network settings
    if let Some(bind) = &cli.bind {
        config.network.bind_address = bind.clone();
    }
    if let Some(port) = cli.worker_port {
        config.network.worker_port = port;
    }
    if let Some(port) = cli.observer_port {
        config.network.observer_port = port;
    }

    // Override elitism settings
    if let Some(top) = cli.elitism_top {
        config.aggregation.top = top;
    }
    if let Some(every) = cli.elitism_every {
        config.aggregation.every = every;
    }
    if let Some(optimize) = cli.optimize {
        config.aggregation.optimize = match optimize {
            Optimize::Max => OptimizeDirection::Max,
            Optimize::Min => OptimizeDirection::Min,
        };
    }
    if let Some(path) = &cli.elites_file {
        config.persistence.elites_file = path.clone();
    }

    // Override runtime settings
    if let Some(timeout) = &cli.shutdown_timeout {
        config.runtime.shutdown_timeout_secs = parse_duration(timeout)?;
    }
    if cli.no_operator_input {
        config.runtime.operator_input = false;
    }

    Ok(config)
}

/// Parse duration string to seconds (e.g., "300", "60s", "5m", "1h")
fn parse_duration(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        anyhow::bail!("Empty duration string");
    }

    // Bare numbers are seconds
    if let Ok(seconds) = s.parse::<u64>() {
        return Ok(seconds);
    }

    let (num_str, unit) = if let Some(num) = s.strip_suffix("ms") {
        (num, "ms")
    } else {
        // Last character is the unit; it may be more than one byte
        let (unit_start, _) = s
            .char_indices()
            .last()
            .context("Empty duration string")?;
        (&s[..unit_start], &s[unit_start..])
    };

    let num: u64 = num_str.parse()
        .with_context(|| format!("Invalid number in duration: {}", num_str))?;

    let seconds = match unit {
        "s" => Some(num),
        "m" => num.checked_mul(60),
        "h" => num.checked_mul(3600),
        "ms" => {
            if num < 1000 {
                Some(1) // Round up to 1 second
            } else {
                Some(num / 1000)
            }
        }
        _ => anyhow::bail!("Invalid duration unit: {}. Use s, m, h, or ms", unit),
    };

    seconds.with_context(|| format!("Duration too large: {}", s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("300").unwrap(), 300);
        assert_eq!(parse_duration("60s").unwrap(), 60);
        assert_eq!(parse_duration("5m").unwrap(), 300);
        assert_eq!(parse_duration("1h").unwrap(), 3600);
        assert_eq!(parse_duration("500ms").unwrap(), 1); // Rounds up
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5x").is_err());
    }

    #[test]
    fn test_parse_duration_rejects_odd_units_and_overflow() {
        assert!(parse_duration("5é").is_err());
        assert!(parse_duration("é").is_err());
        assert!(parse_duration(&format!("{}h", u64::MAX)).is_err());
        assert_eq!(parse_duration("2h").unwrap(), 7200);
    }

    #[test]
    fn test_parse_full_config() {
        let config = parse_toml_string(
            r#"
            [network]
            bind_address = "127.0.0.1"
            worker_port = 7000
            observer_port = 7001

            [aggregation]
            top = 8
            every = 4
            optimize = "min"

            [persistence]
            elites_file = "tsp.elites"

            [runtime]
            shutdown_timeout_secs = 30
            operator_input = false

            [ga]
            generations = 200
            prob_mutation = 0.1

            [ga.chromosome]
            genes = 368
            "#,
        )
        .unwrap();

        assert_eq!(config.network.worker_listen_addr(), "127.0.0.1:7000");
        assert_eq!(config.aggregation.top, 8);
        assert_eq!(config.aggregation.every, 4);
        assert_eq!(config.aggregation.optimize, OptimizeDirection::Min);
        assert_eq!(config.persistence.elites_file, PathBuf::from("tsp.elites"));
        assert_eq!(config.runtime.shutdown_timeout_secs, 30);
        assert!(!config.runtime.operator_input);
        assert_eq!(config.ga["generations"], json!(200));
        assert_eq!(config.ga["chromosome"]["genes"], json!(368));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config = parse_toml_string("[aggregation]\ntop = 2\n").unwrap();
        assert_eq!(config.aggregation.top, 2);
        assert_eq!(config.aggregation.every, 0);
        assert_eq!(config.network, NetworkConfig::default());
        assert_eq!(config.runtime, RuntimeConfig::default());
    }

    #[test]
    fn test_unknown_direction_is_rejected() {
        assert!(parse_toml_string("[aggregation]\noptimize = \"sideways\"\n").is_err());
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[network]\nworker_port = 7000\nobserver_port = 7001").unwrap();
        writeln!(file, "[aggregation]\ntop = 8\nevery = 4").unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let cli = Cli::try_parse_from([
            "gaswarm",
            "--config",
            path.as_str(),
            "--worker-port",
            "9000",
            "--elitism-every",
            "1",
            "--shutdown-timeout",
            "2m",
        ])
        .unwrap();

        let config = build_config(&cli).unwrap();
        assert_eq!(config.network.worker_port, 9000);
        assert_eq!(config.network.observer_port, 7001);
        assert_eq!(config.aggregation.top, 8);
        assert_eq!(config.aggregation.every, 1);
        assert_eq!(config.runtime.shutdown_timeout_secs, 120);
    }

    #[test]
    fn test_dump_and_reparse() {
        let mut config = CoordinatorConfig::default();
        config.aggregation.top = 3;
        config.ga.insert("generations".to_string(), json!(50));

        let text = to_toml_string(&config).unwrap();
        assert_eq!(parse_toml_string(&text).unwrap(), config);
    }
}
