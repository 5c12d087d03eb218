//! Configuration validation

use super::*;
use anyhow::Result;

/// Validate complete configuration
pub fn validate_config(config: &CoordinatorConfig) -> Result<()> {
    validate_network(&config.network)?;
    validate_aggregation(&config.aggregation)?;
    validate_persistence(&config.persistence)?;
    validate_runtime(&config.runtime)?;
    validate_ga_options(&config.ga)?;

    Ok(())
}

/// Validate listening addresses
pub fn validate_network(network: &NetworkConfig) -> Result<()> {
    if network.bind_address.trim().is_empty() {
        anyhow::bail!("bind_address must not be empty");
    }

    // Port 0 would bind an ephemeral port nobody knows about
    if network.worker_port == 0 {
        anyhow::bail!("worker_port must be non-zero");
    }
    if network.observer_port == 0 {
        anyhow::bail!("observer_port must be non-zero");
    }

    if network.worker_port == network.observer_port {
        anyhow::bail!(
            "worker_port and observer_port must differ (both are {})",
            network.worker_port
        );
    }

    Ok(())
}

/// Validate elitism settings
///
/// Setting only one of `top`/`every` is legal (elitism stays off) but is
/// almost always a mistake, so it is reported.
pub fn validate_aggregation(aggregation: &AggregationConfig) -> Result<()> {
    if !aggregation.is_enabled() && (aggregation.top > 0 || aggregation.every > 0) {
        log::warn!(
            "Elitism disabled: top({}) and every({}) must both be non-zero",
            aggregation.top,
            aggregation.every
        );
    }
    Ok(())
}

/// Validate persistence settings
pub fn validate_persistence(persistence: &PersistenceConfig) -> Result<()> {
    if persistence.elites_file.as_os_str().is_empty() {
        anyhow::bail!("elites_file must not be empty");
    }
    Ok(())
}

/// Validate runtime settings
pub fn validate_runtime(runtime: &RuntimeConfig) -> Result<()> {
    if runtime.shutdown_timeout_secs == 0 {
        anyhow::bail!("shutdown_timeout_secs must be at least 1");
    }
    Ok(())
}

/// Validate GA options
///
/// Elitism and direction are owned by `[aggregation]`; setting them in `[ga]`
/// too would be silently overwritten.
pub fn validate_ga_options(ga: &Map<String, Value>) -> Result<()> {
    for key in ["elitism_mode", "opt_for_max"] {
        if ga.contains_key(key) {
            anyhow::bail!("[ga].{} is set from [aggregation]; remove it from [ga]", key);
        }
    }
    Ok(())
}
