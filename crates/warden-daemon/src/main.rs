//! The Warden daemon.
//!
//! Startup order matters: configuration and secrets resolve first,
//! the hardening gate runs before any listener opens, and only then
//! is the gateway assembled and served. Exit codes: 0 for a clean
//! shutdown, 1 for a gate failure, fatal config error, or unhandled
//! fault.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use warden_config::{Overrides, SecretResolver, evaluate_hardening};
use warden_gateway::{EchoProvider, Gateway, GatewayServer};

#[derive(Debug, Parser)]
#[command(name = "wardend", about = "Warden agent control-plane daemon", version)]
struct Cli {
    /// Config file (YAML or JSON).
    #[arg(long, env = "WARDEN_CONFIG")]
    config: Option<PathBuf>,

    /// Bind host override.
    #[arg(long)]
    host: Option<String>,

    /// Bind port override.
    #[arg(long)]
    port: Option<u16>,

    /// Policy rule-set file override.
    #[arg(long)]
    rules: Option<PathBuf>,

    /// Log level override.
    #[arg(long)]
    log_level: Option<String>,

    /// Deployment environment label override.
    #[arg(long)]
    environment: Option<String>,

    /// Evaluate the hardening gate and config, then exit.
    #[arg(long)]
    check: bool,
}

fn init_tracing(level: &str, format: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    if format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            return ExitCode::FAILURE;
        },
    };
    runtime.block_on(run(cli))
}

async fn run(cli: Cli) -> ExitCode {
    let overrides = Overrides {
        host: cli.host.clone(),
        port: cli.port,
        rules_file: cli.rules.clone(),
        log_level: cli.log_level.clone(),
        environment: cli.environment.clone(),
    };
    let resolver = SecretResolver::new();
    let config = match warden_config::load(cli.config.as_deref(), &overrides, &resolver) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("fatal config error: {e}");
            return ExitCode::FAILURE;
        },
    };

    init_tracing(&config.logging.level, &config.logging.format);

    // The gate runs before any listener is opened.
    if config.hardening_enforced() {
        let report = evaluate_hardening(&config);
        for warning in &report.warnings {
            warn!(check = warning.name, "{}", warning.message);
        }
        if !report.ok() {
            for failure in &report.failures {
                error!(check = failure.name, "{}", failure.message);
            }
            error!(
                failed = report.failures.len(),
                "production hardening gate failed; refusing to start"
            );
            return ExitCode::FAILURE;
        }
        info!("production hardening gate passed");
    }

    // Provider adapters live outside the core; the daemon wires in the
    // echo provider until one is configured at the seam.
    let gateway = match Gateway::build(config, Arc::new(EchoProvider::new())).await {
        Ok(gateway) => gateway,
        Err(e) => {
            error!(error = %e, "failed to assemble gateway");
            return ExitCode::FAILURE;
        },
    };

    if cli.check {
        info!("configuration ok");
        return ExitCode::SUCCESS;
    }

    let server = match GatewayServer::start(gateway).await {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "failed to start server");
            return ExitCode::FAILURE;
        },
    };
    info!(addr = %server.addr(), "warden daemon ready");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "signal handler failed");
        server.shutdown().await;
        return ExitCode::FAILURE;
    }
    info!("shutdown signal received");
    server.shutdown().await;
    ExitCode::SUCCESS
}
