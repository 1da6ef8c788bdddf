use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use companion_core::{check_policy, heartbeat_source, DroneStateMachine, MachineDeps, PolicyConfig};
use companion_fc::autodetect::{autodetect_fc, default_candidate_bauds, default_candidate_devs};
use companion_fc::{build_driver, DriverKind, FcConfig, TelemetryCache};
use companion_nav::doctor as nav_doctor;
use companion_nav::ItemParams;
use companion_proto::Position;
use companion_uplink::doctor as uplink_doctor;
use companion_uplink::{build_connector, ConnectionAgent, Mailbox, Outbox, UplinkConfig};
use companion_vision::{build_detector, LandingConfig};

#[derive(Parser, Debug)]
#[command(name = "companion", version, about = "Drone companion computer agent")]
struct Cli {
    #[arg(long, default_value = "config/companion.toml")]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate the configuration without touching hardware
    Doctor,
    /// Run the agent until Ctrl-C
    Run,
    /// Flight controller helpers
    Fc {
        #[command(subcommand)]
        cmd: FcCmd,
    },
}

#[derive(Subcommand, Debug)]
enum FcCmd {
    /// Scan serial ports for an autopilot heartbeat
    Autodetect,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct Config {
    uplink: UplinkConfig,
    fc: FcConfig,
    telemetry: TelemetryCfg,
    landing: LandingConfig,
    policy: PolicyConfig,
    mission: ItemParams,
    logging: LoggingCfg,
}

#[derive(Debug, serde::Deserialize)]
#[serde(default)]
struct TelemetryCfg {
    stale_after_s: f64,
}

impl Default for TelemetryCfg {
    fn default() -> Self {
        Self { stale_after_s: 10.0 }
    }
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct LoggingCfg {
    /// Daily-rolling log files go here when set.
    dir: Option<PathBuf>,
}

fn load_config(path: &str) -> Result<Config> {
    let s = std::fs::read_to_string(path).with_context(|| format!("read config {}", path))?;
    toml::from_str(&s).context("parse config toml")
}

fn init_logging(cfg: &LoggingCfg) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (file_layer, guard) = match &cfg.dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "companion.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
        }
        None => (None, None),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();
    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = load_config(&cli.config)?;
    // flushes the file log when main returns
    let _log_guard = init_logging(&cfg.logging);

    match cli.cmd {
        Command::Doctor => doctor(&cfg)?,
        Command::Run => run(&cfg).await?,
        Command::Fc { cmd } => fc_cmd(&cfg, cmd).await?,
    }
    Ok(())
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");

    check_policy(&cfg.policy)?;
    nav_doctor::check_item_params(&cfg.mission)?;
    uplink_doctor::check_config(&cfg.uplink)?;
    companion_vision::check_config(&cfg.landing)?;
    check_fc(&cfg.fc)?;
    anyhow::ensure!(cfg.telemetry.stale_after_s > 0.0, "telemetry.stale_after_s must be > 0");

    info!("doctor: OK");
    Ok(())
}

fn check_fc(fc: &FcConfig) -> Result<()> {
    match fc.driver {
        DriverKind::Sim => {
            anyhow::ensure!(fc.sim_speed_mps > 0.0, "fc.sim_speed_mps must be > 0");
        }
        DriverKind::Mavlink => {
            if fc.autodetect {
                info!("doctor: fc autodetect enabled (OK)");
            } else {
                anyhow::ensure!(
                    fc.url.as_ref().map(|u| !u.trim().is_empty()).unwrap_or(false),
                    "fc.url missing (autodetect=false)"
                );
            }
            anyhow::ensure!(fc.upload_timeout_s > 0.0, "fc.upload_timeout_s must be > 0");
        }
    }
    Ok(())
}

async fn fc_cmd(cfg: &Config, cmd: FcCmd) -> Result<()> {
    match cmd {
        FcCmd::Autodetect => {
            let devs = cfg.fc.candidate_devs.clone().unwrap_or_else(default_candidate_devs);
            let bauds = cfg.fc.candidate_bauds.clone().unwrap_or_else(default_candidate_bauds);
            let timeout = Duration::from_millis(cfg.fc.heartbeat_timeout_ms);
            let res = tokio::task::spawn_blocking(move || autodetect_fc(&devs, &bauds, timeout))
                .await
                .context("fc autodetect task")??;
            match res.chosen {
                Some(url) => println!("CHOSEN: {}", url),
                None => println!("CHOSEN: none"),
            }
            for p in res.attempts {
                println!("tried url={} hb={} {}ms note={}", p.url, p.hb_seen, p.elapsed_ms, p.note);
            }
            Ok(())
        }
    }
}

async fn run(cfg: &Config) -> Result<()> {
    info!("run: starting");
    let cancel = CancellationToken::new();

    let connector = build_connector(&cfg.uplink).context("uplink transport")?;

    let driver = build_driver(&cfg.fc);
    driver.connect().await.context("fc connect")?;

    let stale_after = Duration::from_secs_f64(cfg.telemetry.stale_after_s.max(0.1));
    let (position, position_task): (TelemetryCache<Position>, _) =
        TelemetryCache::spawn("position", stale_after, driver.telemetry_position(), cancel.clone());
    let (battery, battery_task) =
        TelemetryCache::spawn("battery", stale_after, driver.telemetry_battery(), cancel.clone());

    let outbox = Arc::new(Outbox::new(cfg.uplink.outbox_capacity));
    let mailbox = Arc::new(Mailbox::new());

    let (machine, machine_task) = DroneStateMachine::spawn(
        MachineDeps {
            driver,
            landing: build_detector(&cfg.landing),
            outbox: outbox.clone(),
            position: position.clone(),
            battery: battery.clone(),
            policy: cfg.policy.clone(),
            items: cfg.mission,
        },
        cancel.clone(),
    );

    let agent = ConnectionAgent::new(
        &cfg.uplink,
        connector,
        outbox,
        mailbox.clone(),
        heartbeat_source(position.clone(), battery),
    );
    let agent_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { agent.run(cancel).await })
    };
    let inbound_task = {
        let machine = machine.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { machine.run_inbound(mailbox, cancel).await })
    };

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("run: shutting down in state {}", machine.state());
    let last_fix = position.snapshot();
    match (last_fix.value, last_fix.updated_at) {
        (Some(pos), Some(at)) => info!("run: last position {:.6},{:.6} at {}", pos.lat, pos.lon, at),
        _ => info!("run: no position received"),
    }
    cancel.cancel();

    for (name, task) in [
        ("agent", agent_task),
        ("inbound", inbound_task),
        ("state machine", machine_task),
        ("position listener", position_task),
        ("battery listener", battery_task),
    ] {
        if let Err(e) = task.await {
            warn!("run: {} task failed: {}", name, e);
        }
    }
    info!("run: stopped");
    Ok(())
}
