use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use cfy_bootstrap::service::stop_service;
use cfy_bootstrap::{
    BootstrapConfig, Coordinator, Error, RestGatewayProbe, Result, TracingListener,
};
use cfy_infra::DriverRegistry;
use cfy_installer::validation::{ValidationPlan, ValidationTarget, default_validators, run_validators};
use cfy_installer::{AgentlessInstaller, DefaultConnector};
use cfy_usm::{OsProcessControl, ProcessKiller};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit status of a failed machine validation.
const VALIDATION_FAILED: u8 = 130;

#[derive(Parser, Debug)]
#[command(version, about = "Bring up and tear down a Cloudify management tier")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the management machines and install Cloudify on them.
    Bootstrap,
    /// Stop every management machine.
    Teardown {
        /// Release the driver even if stopping the machines fails.
        #[arg(long)]
        force: bool,
    },
    /// Check that this machine can join the grid.
    Validate {
        /// Which validators to run: pre, post or all.
        #[arg(long, default_value = "all")]
        plan: ValidationPlan,
    },
    /// Kill the service whose PID is recorded in a file.
    StopService {
        #[arg(long)]
        pid_file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match run(cli.command).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "cfy-bootstrap failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command) -> Result<ExitCode> {
    match command {
        Command::Bootstrap => {
            let config = BootstrapConfig::from_env()?;
            let template = config.installation_template()?;
            let outcome = coordinator(&config)
                .await?
                .bootstrap(&template, config.bootstrap_timeout)
                .await?;
            for report in &outcome.installs {
                info!(
                    host = %report.host,
                    files = report.files_uploaded,
                    elapsed = ?report.elapsed,
                    "management machine ready"
                );
            }
        }
        Command::Teardown { force } => {
            let config = BootstrapConfig::from_env()?;
            coordinator(&config)
                .await?
                .teardown(config.teardown_timeout, force)
                .await?;
        }
        Command::Validate { plan } => {
            let target = ValidationTarget::from_env()?;
            let validators = default_validators(&target);
            let report = run_validators(&validators, plan, &TracingListener).await;
            match report.into_result() {
                Ok(report) if report.has_warnings() => {
                    warn!("machine validation passed with warnings")
                }
                Ok(_) => info!("machine validation passed"),
                Err(e) => {
                    error!(error = %e, "machine validation failed");
                    return Ok(ExitCode::from(VALIDATION_FAILED));
                }
            }
        }
        Command::StopService { pid_file } => {
            stop_service(&pid_file, Arc::new(OsProcessControl), &ProcessKiller::os()).await?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn coordinator(config: &BootstrapConfig) -> Result<Coordinator> {
    let registry = DriverRegistry::from_env().await?;
    info!(providers = ?registry.available(), "provisioning drivers ready");
    let driver = registry.get(config.provider).cloned().ok_or_else(|| {
        Error::Config(format!("the {} driver is not configured", config.provider))
    })?;
    driver.add_listener(Arc::new(TracingListener));

    let installer = AgentlessInstaller::new(Arc::new(DefaultConnector::new()));
    installer.add_listener(Arc::new(TracingListener));

    Ok(Coordinator::new(
        driver,
        installer,
        Arc::new(RestGatewayProbe::new(config.rest_port)),
    )
    .with_rollback_timeout(config.teardown_timeout))
}
