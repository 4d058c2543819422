//! Volume Orchestrator daemon
//!
//! Loads the configuration, activates the configured drivers, and runs the
//! module supervisor (with the admin HTTP module) until interrupted.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use volume_orchestrator::drivers::register_builtin;
use volume_orchestrator::module::admin;
use volume_orchestrator::{
    DriverRegistry, ModuleSupervisor, Orchestrator, OrchestratorConfig, Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Volume Orchestrator - pluggable OS, volume and storage driver engine
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(short, long, env = "VOLUME_ORCHESTRATOR_CONFIG")]
    config: Option<PathBuf>,

    /// Admin module address (tcp://host:port)
    #[arg(long, env = "ADMIN_ADDR")]
    admin_addr: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting Volume Orchestrator");
    info!("  Version: {}", volume_orchestrator::VERSION);

    let config = match &args.config {
        Some(path) => {
            info!("  Config: {}", path.display());
            OrchestratorConfig::load(path)?
        }
        None => {
            warn!("no configuration file given, no drivers will be active");
            OrchestratorConfig::default()
        }
    };
    let extra_modules = config.modules.clone();
    let start_timeout = config.module_start_timeout();

    let registry = DriverRegistry::new();
    register_builtin(&registry);
    let registered: Vec<String> = registry.driver_names().collect();
    info!(drivers = ?registered, "Driver registry initialized");

    let mut orchestrator = Orchestrator::new(config, Arc::new(registry))?;
    orchestrator.init_drivers().await?;
    let orchestrator = Arc::new(orchestrator);
    info!(status = ?orchestrator.status(), "Orchestrator initialized");

    let supervisor = Arc::new(
        ModuleSupervisor::new(start_timeout).with_metrics(orchestrator.metrics().clone()),
    );
    admin::register(&supervisor, orchestrator.clone(), args.admin_addr.as_deref());

    supervisor.initialize_default_modules()?;
    for spec in extra_modules {
        supervisor.initialize_module_by_name(
            &spec.module_type,
            &spec.address,
            spec.config,
            spec.description,
        )?;
    }
    supervisor.start_default_modules().await?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl-C, shutting down");
    }

    info!("Shutdown signal received");
    supervisor.stop().await;
    orchestrator.shutdown();

    info!("Volume Orchestrator shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "tower_http=info", "axum=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
