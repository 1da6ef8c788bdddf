use anyhow::Result;
use serde::Deserialize;

/// Acceptance and recovery thresholds of the state machine.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Maximum distance between the vehicle and the mission start.
    pub max_start_dist_km: f64,
    /// Minimum battery fraction to accept a mission.
    pub min_battery: f64,
    /// Safety factor on the battery consumed so far when deciding on a return flight.
    pub drain_multiplier: f64,
    /// Land command attempts in EmergencyLanding.
    pub land_retries: u32,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_start_dist_km: 0.05,
            min_battery: 0.2,
            drain_multiplier: 1.1,
            land_retries: 3,
        }
    }
}

pub fn check_policy(p: &PolicyConfig) -> Result<()> {
    anyhow::ensure!(p.max_start_dist_km > 0.0, "policy.max_start_dist_km must be > 0");
    anyhow::ensure!((0.0..=1.0).contains(&p.min_battery), "policy.min_battery must be within 0..1");
    anyhow::ensure!(p.drain_multiplier >= 1.0, "policy.drain_multiplier must be >= 1");
    anyhow::ensure!(p.land_retries >= 1, "policy.land_retries must be >= 1");
    Ok(())
}
