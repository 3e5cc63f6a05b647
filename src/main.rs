use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use env_logger::{Builder, Env, Target};
use log::{debug, error, info, warn};
use ota_ui::{
    Completion, OtaWorkflow,
    config::AppConfig,
    console::{TerminalDialog, TerminalPresenter},
    device_client::OtaDeviceClient,
};
use std::{io::Write, path::PathBuf};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "ota-ui", version)]
#[command(about = "Firmware update client for devices with an OTA web API", long_about = None)]
struct Cli {
    /// Device base URL, overrides OTA_DEVICE_URL
    #[arg(short, long, value_name = "URL")]
    device: Option<String>,

    /// Accept all confirmations without asking
    #[arg(short, long)]
    yes: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show the firmware running on the device
    Info,
    /// Upload a firmware image and wait for the device to restart
    Update {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Revert to the previous firmware and wait for the device to restart
    Rollback,
}

type TerminalWorkflow = OtaWorkflow<OtaDeviceClient, TerminalDialog, TerminalPresenter>;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    initialize();

    if let Err(e) = run(cli).await {
        error!("application error: {e:#}");
        std::process::exit(1);
    }
}

fn initialize() {
    log_panics::init();

    let mut builder = if cfg!(debug_assertions) {
        Builder::from_env(Env::default().default_filter_or("debug"))
    } else {
        Builder::from_env(Env::default().default_filter_or("warn"))
    };

    builder.format(|f, record| match record.level() {
        log::Level::Error => {
            eprintln!("{}", record.args());
            Ok(())
        }
        _ => {
            writeln!(f, "{}", record.args())
        }
    });

    builder.target(Target::Stdout).init();

    debug!("ota-ui version: {}", env!("CARGO_PKG_VERSION"));
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = AppConfig::load().context("failed to load configuration")?;
    if let Some(device) = cli.device {
        config.device.set_url(device).context("invalid --device")?;
    }
    info!("using device at {}", config.device.url);

    let client = OtaDeviceClient::new(
        &config.device.url,
        config.device.connect_timeout,
        config.reconnect.per_attempt_timeout,
    )?;
    let workflow = OtaWorkflow::from_config(
        client,
        TerminalDialog::new(cli.yes),
        TerminalPresenter::new(),
        &config,
    );

    let cancel = CancellationToken::new();
    spawn_ctrl_c_handler(cancel.clone());

    match cli.command {
        Command::Info => {
            workflow.load_info().await?;
        }
        Command::Update { file } => {
            let completion = workflow.update(&file, &cancel).await?;
            finish(&workflow, completion).await?;
        }
        Command::Rollback => {
            let completion = workflow.rollback(&cancel).await?;
            finish(&workflow, completion).await?;
        }
    }

    Ok(())
}

/// Reload the device state once it is back, like the page reload of a browser UI
async fn finish(workflow: &TerminalWorkflow, completion: Completion) -> Result<()> {
    match completion {
        Completion::Declined => println!("Cancelled, nothing was changed on the device."),
        Completion::Reachable { .. } => {
            workflow.load_info().await?;
        }
        Completion::ReloadManually { attempts } => {
            warn!("device still unreachable after {attempts} attempts");
        }
    }
    Ok(())
}

/// First Ctrl-C cancels the running operation, the second one quits
fn spawn_ctrl_c_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        loop {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("failed to install Ctrl-C handler: {e}");
                return;
            }
            if cancel.is_cancelled() {
                std::process::exit(130);
            }
            cancel.cancel();
            warn!("interrupted, cancelling (press Ctrl-C again to quit)");
        }
    });
}
