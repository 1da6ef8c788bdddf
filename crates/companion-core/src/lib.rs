pub mod config;
pub mod machine;
pub mod state;

use std::sync::Arc;

use companion_fc::TelemetryCache;
use companion_proto::{Heartbeat, Position};
use companion_uplink::HeartbeatSource;
use tracing::debug;

pub use config::{check_policy, PolicyConfig};
pub use machine::{DroneStateMachine, MachineDeps};
pub use state::DroneState;

/// Heartbeats from the telemetry caches; nothing until both have a value.
pub fn heartbeat_source(position: TelemetryCache<Position>, battery: TelemetryCache<f64>) -> HeartbeatSource {
    Arc::new(move || {
        let hb = Heartbeat {
            pos: position.latest()?,
            battery: battery.latest()?,
        };
        if position.is_stale() || battery.is_stale() {
            debug!("heartbeat: telemetry is stale, sending last known values");
        }
        Some(hb)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn heartbeat_needs_both_values() {
        let position = TelemetryCache::new("position", Duration::from_secs(10));
        let battery = TelemetryCache::new("battery", Duration::from_secs(10));
        let hb = heartbeat_source(position.clone(), battery.clone());
        assert!(hb().is_none());
        position.update(Position::new(51.0, 14.0));
        assert!(hb().is_none());
        battery.update(0.5);
        assert_eq!(hb(), Some(Heartbeat { pos: Position::new(51.0, 14.0), battery: 0.5 }));
    }
}
