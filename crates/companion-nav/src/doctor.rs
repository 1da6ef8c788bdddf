use anyhow::Result;
use companion_proto::MissionPlan;

use crate::mission::ItemParams;

/// Upper bound on intermediate waypoints; autopilots store a few hundred items at most.
pub const MAX_WAYPOINTS: usize = 500;

pub fn check_item_params(p: &ItemParams) -> Result<()> {
    anyhow::ensure!(p.altitude_m > 2.0 && p.altitude_m <= 120.0, "mission.altitude_m should be 2..120");
    anyhow::ensure!(p.speed_mps > 0.0 && p.speed_mps <= 30.0, "mission.speed_mps should be 0..30");
    anyhow::ensure!(p.acceptance_radius_m > 0.0, "mission.acceptance_radius_m must be > 0");
    Ok(())
}

/// Rejects payloads no flight controller would accept.
pub fn check_plan(plan: &MissionPlan) -> Result<()> {
    let valid = |lat: f64, lon: f64| lat.abs() <= 90.0 && lon.abs() <= 180.0 && lat.is_finite() && lon.is_finite();
    anyhow::ensure!(valid(plan.start.pos.lat, plan.start.pos.lon), "start coordinates invalid");
    anyhow::ensure!(valid(plan.goal.pos.lat, plan.goal.pos.lon), "goal coordinates invalid");
    anyhow::ensure!(
        plan.waypoints.len() <= MAX_WAYPOINTS,
        "too many waypoints: {} (max {})",
        plan.waypoints.len(),
        MAX_WAYPOINTS
    );
    for (i, wp) in plan.waypoints.iter().enumerate() {
        anyhow::ensure!(valid(wp.lat, wp.lon), "waypoint {} coordinates invalid", i);
    }
    anyhow::ensure!(!plan.goal.id.is_empty(), "goal facility id missing");
    Ok(())
}
