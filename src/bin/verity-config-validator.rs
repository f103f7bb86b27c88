//! # Verity Configuration Validator
//!
//! Loads the layered configuration for an environment and reports whether it
//! validates, before any orchestrator or worker is started against it.
//!
//! ```text
//! verity-config-validator [ENVIRONMENT] [CONFIG_DIR]
//! ```

use std::path::PathBuf;
use std::process;

use anyhow::Context;
use tracing::{error, info};
use verity_core::config::ConfigManager;
use verity_core::logging;

fn main() {
    logging::init_structured_logging();

    match run() {
        Ok(()) => {
            info!("Configuration validation completed successfully");
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "Configuration validation failed");
            process::exit(1);
        }
    }
}

fn run() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let environment = args.next().unwrap_or_else(ConfigManager::detect_environment);
    let config_dir = args.next().map(PathBuf::from);

    let manager = ConfigManager::load_from_directory_with_env(config_dir, &environment)
        .with_context(|| format!("loading configuration for environment '{environment}'"))?;
    let config = manager.config();

    println!("Environment:        {}", manager.environment());
    println!("Config directory:   {}", manager.config_directory().display());
    println!(
        "Database:           {}",
        if config.database.url.is_some() { "configured" } else { "not configured (in-memory store)" }
    );
    println!("Circuit breakers:   {}", if config.circuit_breakers.enabled { "enabled" } else { "disabled" });
    println!(
        "Default breaker:    threshold={} timeout={}s",
        config.circuit_breakers.default.failure_threshold, config.circuit_breakers.default.timeout_seconds
    );
    for (name, component) in &config.circuit_breakers.components {
        println!(
            "  {name}: threshold={} timeout={}s",
            component.failure_threshold, component.timeout_seconds
        );
    }
    println!(
        "Rate limiter:       capacity={} max_wait={}s expiry={}s release_attempts={} alert_threshold={}",
        config.rate_limiter.default_capacity,
        config.rate_limiter.default_max_wait_seconds,
        config.rate_limiter.default_expiry_seconds,
        config.rate_limiter.release_retry.max_attempts,
        config.rate_limiter.alert_threshold
    );
    println!(
        "Orchestration:      batch_size={} receive_timeout={}s permit_template={}",
        config.orchestration.batch_size,
        config.orchestration.signal_receive_timeout_seconds,
        config.orchestration.permit_template
    );
    println!(
        "Stuck detection:    stall_threshold={}s",
        config.stuck_detection.stall_threshold_seconds
    );

    Ok(())
}
