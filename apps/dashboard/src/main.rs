use std::{path::PathBuf, time::Duration};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    config::{load_settings_from, normalize_server_url},
    load_settings, CommitEvent, DeviceSession, TelemetrySnapshot, TelemetryStatus,
};
use shared::domain::{DeviceId, OutputId, Pin, SensorId};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "dashboard", about = "Live telemetry and sensor configuration for a device")]
struct Args {
    /// Overrides `server_url` from the settings file and environment.
    #[arg(long, global = true)]
    server_url: Option<String>,
    #[arg(long, global = true)]
    device_id: Option<String>,
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Stream readings until ctrl-c or the server closes the socket.
    Live {
        #[arg(long, default_value_t = 2)]
        refresh_secs: u64,
    },
    /// Print the device's sensor configuration as JSON.
    Sensors,
    /// Edit the configuration and commit it, waiting for the device to apply it.
    Commit {
        /// `SENSOR=PIN`, e.g. `3=A0` or `1=4`.
        #[arg(long = "set-pin", value_parser = parse_pin_edit)]
        set_pin: Vec<(SensorId, Pin)>,
        /// `SENSOR:OUTPUT`
        #[arg(long, value_parser = parse_output_toggle)]
        toggle: Vec<(SensorId, OutputId)>,
        #[arg(long)]
        remove: Vec<i64>,
    },
}

fn parse_pin_edit(raw: &str) -> Result<(SensorId, Pin), String> {
    let (sensor, pin) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected SENSOR=PIN, got `{raw}`"))?;
    let sensor = sensor
        .trim()
        .parse::<i64>()
        .map_err(|err| format!("bad sensor id `{sensor}`: {err}"))?;
    let pin = pin.trim();
    if pin.is_empty() {
        return Err("pin must not be empty".to_string());
    }
    let pin = match pin.parse::<u32>() {
        Ok(index) => Pin::Index(index),
        Err(_) => Pin::from(pin),
    };
    Ok((SensorId(sensor), pin))
}

fn parse_output_toggle(raw: &str) -> Result<(SensorId, OutputId), String> {
    let (sensor, output) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected SENSOR:OUTPUT, got `{raw}`"))?;
    let sensor = sensor
        .trim()
        .parse::<i64>()
        .map_err(|err| format!("bad sensor id `{sensor}`: {err}"))?;
    let output = output
        .trim()
        .parse::<i64>()
        .map_err(|err| format!("bad output id `{output}`: {err}"))?;
    Ok((SensorId(sensor), OutputId(output)))
}

fn print_snapshot(snapshot: &TelemetrySnapshot) {
    for row in snapshot.rows() {
        let label = match &row.label.output {
            Some(output) => format!("{} / {}", row.label.sensor, output),
            None => row.label.sensor.clone(),
        };
        println!("{label:<32} {:>12} {:>8}", row.value.to_string(), row.count);
    }
    println!("{:<32} {:>12} {:>8}", "total", "", snapshot.total());
}

async fn run_live(session: &DeviceSession, refresh: Duration) -> Result<()> {
    let baseline = session
        .open_live()
        .await
        .context("failed to open live telemetry")?;
    print_snapshot(&baseline);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut ticker = tokio::time::interval(refresh);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            _ = ticker.tick() => {
                let snapshot = session.telemetry.snapshot();
                print_snapshot(&snapshot);
                match snapshot.status {
                    TelemetryStatus::Closed => {
                        info!("server closed the telemetry stream");
                        break;
                    }
                    TelemetryStatus::Failed(reason) => {
                        warn!(%reason, "telemetry stream failed");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }
    Ok(())
}

async fn run_commit(
    session: &DeviceSession,
    set_pin: Vec<(SensorId, Pin)>,
    toggle: Vec<(SensorId, OutputId)>,
    remove: Vec<i64>,
) -> Result<()> {
    let commits = &session.commits;
    commits
        .load()
        .await
        .context("failed to load sensor configuration")?;

    for (sensor_id, pin) in set_pin {
        commits
            .set_pin(sensor_id, pin.clone())
            .with_context(|| format!("cannot set pin {pin} on sensor {sensor_id}"))?;
    }
    for (sensor_id, output_id) in toggle {
        let enabled = commits
            .toggle_output(sensor_id, output_id)
            .with_context(|| format!("cannot toggle output {output_id} on sensor {sensor_id}"))?;
        info!(%sensor_id, %output_id, enabled, "output toggled");
    }
    for sensor_id in remove.into_iter().map(SensorId) {
        commits
            .remove_sensor(sensor_id)
            .with_context(|| format!("cannot remove sensor {sensor_id}"))?;
    }

    let mut events = commits.subscribe_events();
    commits
        .commit()
        .await
        .context("failed to submit sensor configuration")?;

    loop {
        match events.recv().await {
            Ok(CommitEvent::StatusChanged(status)) => info!(?status, "commit status"),
            Ok(CommitEvent::ReloadRequested) => {
                commits
                    .reload()
                    .await
                    .context("commit applied but reload failed")?;
                break;
            }
            Ok(CommitEvent::Failed(err)) => {
                return Err(anyhow::Error::new(err).context("device rejected the configuration"))
            }
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "commit events lagged"),
            Err(RecvError::Closed) => bail!("commit controller went away"),
        }
    }

    println!(
        "{}",
        serde_json::to_string_pretty(commits.draft().sensors())?
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut settings = match &args.config {
        Some(path) => load_settings_from(path),
        None => load_settings(),
    };
    if let Some(server_url) = &args.server_url {
        settings.server_url = normalize_server_url(server_url);
    }
    let device_id = args
        .device_id
        .map(DeviceId::new)
        .context("--device-id is required")?;
    info!(server_url = %settings.server_url, %device_id, "dashboard starting");

    let session = DeviceSession::new(&settings, device_id);
    let result = match args.command {
        Command::Live { refresh_secs } => {
            run_live(&session, Duration::from_secs(refresh_secs.max(1))).await
        }
        Command::Sensors => match session.commits.load().await {
            Ok(()) => serde_json::to_string_pretty(session.commits.draft().sensors())
                .map(|json| println!("{json}"))
                .map_err(Into::into),
            Err(err) => Err(anyhow::Error::new(err).context("failed to load sensors")),
        },
        Command::Commit {
            set_pin,
            toggle,
            remove,
        } => run_commit(&session, set_pin, toggle, remove).await,
    };
    session.close().await;
    result
}
