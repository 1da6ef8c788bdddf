pub mod autodetect;
pub mod mav;
pub mod sim;
pub mod value;

use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use companion_nav::MissionItem;
use companion_proto::Position;
use serde::Deserialize;
use tokio_stream::Stream;

pub use value::{TelemetryCache, TelemetryValue};

pub type TelemetryStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

/// Vehicle control as seen by the state machine. Implementations own the
/// autopilot link; callers only care whether each call succeeded.
#[async_trait]
pub trait FlightDriver: Send + Sync {
    async fn connect(&self) -> Result<()>;

    fn telemetry_position(&self) -> TelemetryStream<Position>;

    /// Remaining charge, 0..1
    fn telemetry_battery(&self) -> TelemetryStream<f64>;

    /// Uploads, arms, starts and resolves once the final item is reached.
    /// Dropping the future abandons the wait; the vehicle keeps flying.
    async fn execute_mission(&self, items: Vec<MissionItem>) -> Result<()>;

    async fn land(&self) -> Result<()>;

    async fn arm(&self) -> Result<()>;

    async fn disarm(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    Mavlink,
    Sim,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FcConfig {
    pub driver: DriverKind,

    /// mavlink connection url, e.g. "serial:/dev/ttyAMA0:57600" or "udpin:0.0.0.0:14540".
    /// Ignored when `autodetect` is set.
    pub url: Option<String>,

    /// Try candidate serial ports/bauds and use the first that yields an
    /// autopilot HEARTBEAT.
    pub autodetect: bool,
    pub candidate_devs: Option<Vec<String>>,
    pub candidate_bauds: Option<Vec<u32>>,
    pub heartbeat_timeout_ms: u64,

    /// MAVLink ids we use (companion side)
    pub sys_id: u8,
    pub comp_id: u8,

    /// target system/component (FC side). 1/1 is common for ArduPilot and PX4.
    pub target_sys: u8,
    pub target_comp: u8,

    /// Per-step timeout for upload handshakes and command acks.
    pub upload_timeout_s: f64,

    pub sim_start: [f64; 2],
    pub sim_speed_mps: f64,
    /// Battery fraction drained per flown kilometre.
    pub sim_drain_per_km: f64,
}

impl Default for FcConfig {
    fn default() -> Self {
        Self {
            driver: DriverKind::Mavlink,
            url: None,
            autodetect: false,
            candidate_devs: None,
            candidate_bauds: None,
            heartbeat_timeout_ms: 1500,
            sys_id: 1,
            comp_id: 191,
            target_sys: 1,
            target_comp: 1,
            upload_timeout_s: 5.0,
            sim_start: [51.72437634851853, 14.33875342899223],
            sim_speed_mps: 40.0,
            sim_drain_per_km: 0.02,
        }
    }
}

pub fn build_driver(cfg: &FcConfig) -> Arc<dyn FlightDriver> {
    match cfg.driver {
        DriverKind::Mavlink => Arc::new(mav::MavlinkDriver::new(cfg.clone())),
        DriverKind::Sim => Arc::new(sim::SimDriver::from_config(cfg)),
    }
}
