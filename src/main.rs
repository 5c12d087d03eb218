//! GASwarm CLI entry point

use anyhow::{Context, Result};
use gaswarm::config::cli::{Cli, LogLevel};
use gaswarm::config::{toml, validator, CoordinatorConfig};
use gaswarm::Coordinator;

fn main() -> Result<()> {
    let cli = Cli::parse_args();
    setup_logging(cli.log_level);

    let config = toml::build_config(&cli)?;
    validator::validate_config(&config).context("Configuration validation failed")?;

    if cli.dump_config {
        print!("{}", toml::to_toml_string(&config)?);
        return Ok(());
    }

    println!("GASwarm v{}", env!("CARGO_PKG_VERSION"));
    println!("Coordinator for distributed genetic-algorithm workers");
    println!();
    print_configuration(&config);
    if config.runtime.operator_input {
        println!();
        print_command_help();
    }
    println!();

    let runtime = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
    runtime.block_on(Coordinator::new(config).run())
}

fn setup_logging(level: Option<LogLevel>) {
    let mut builder = match level {
        Some(level) => {
            let filter = match level {
                LogLevel::Trace => log::LevelFilter::Trace,
                LogLevel::Debug => log::LevelFilter::Debug,
                LogLevel::Info => log::LevelFilter::Info,
                LogLevel::Warn => log::LevelFilter::Warn,
                LogLevel::Error => log::LevelFilter::Error,
            };
            let mut builder = env_logger::Builder::new();
            builder.filter_level(filter);
            builder
        }
        None => env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")),
    };
    builder.format_timestamp_millis().init();
}

fn print_configuration(config: &CoordinatorConfig) {
    println!("Configuration:");
    println!("  Workers:   {}", config.network.worker_listen_addr());
    println!("  Observers: ws://{}", config.network.observer_listen_addr());
    if config.aggregation.is_enabled() {
        println!(
            "  Elitism:   top {} every {} submissions ({})",
            config.aggregation.top,
            config.aggregation.every,
            config.aggregation.optimize.as_option()
        );
    } else {
        println!("  Elitism:   disabled");
    }
    println!("  Elites file: {}", config.persistence.elites_file.display());
    println!("  Shutdown timeout: {}s", config.runtime.shutdown_timeout_secs);
    if !config.ga.is_empty() {
        println!("  GA options: {}", config.ga.len());
    }
}

fn print_command_help() {
    println!("Commands:");
    println!("  prepare            Send the GA options to every worker");
    println!("  run                Start or resume evolution");
    println!("  pause              Pause evolution");
    println!("  stop               Stop evolution");
    println!("  save [file]        Ask workers to save their run state");
    println!("  restore [file]     Ask workers to restore their run state");
    println!("  get_st             Request statistics");
    println!("  get_best           Request the best individual");
    println!("  save_e [file]      Save the global elite list");
    println!("  restore_e [file]   Restore the global elite list");
    println!("  exit               Stop workers and shut down (also Ctrl-C)");
}
