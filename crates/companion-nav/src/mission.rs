use companion_proto::{MissionPlan, Position};
use serde::Deserialize;

use crate::geo::haversine_m;

/// A takeoff or landing site.
#[derive(Debug, Clone, PartialEq)]
pub struct Facility {
    pub id: String,
    pub position: Position,
}

/// One flight from `start` to `goal` via `waypoints`.
///
/// The only mutation a mission undergoes is reversal for a return flight, which
/// swaps the endpoints and the waypoint order together.
#[derive(Debug, Clone, PartialEq)]
pub struct Mission {
    pub id: String,
    pub start: Facility,
    pub goal: Facility,
    pub waypoints: Vec<Position>,
    /// Battery fraction when the mission was accepted.
    pub battery_at_start: f64,
    pub cancelled: bool,
}

impl Mission {
    pub fn from_plan(plan: MissionPlan, battery_at_start: f64) -> Self {
        let id = plan
            .id
            .unwrap_or_else(|| format!("{}->{}", plan.start.id, plan.goal.id));
        Self {
            id,
            start: Facility { id: plan.start.id, position: plan.start.pos },
            goal: Facility { id: plan.goal.id, position: plan.goal.pos },
            waypoints: plan.waypoints,
            battery_at_start,
            cancelled: false,
        }
    }

    pub fn reverse(&mut self) {
        std::mem::swap(&mut self.start, &mut self.goal);
        self.waypoints.reverse();
    }

    pub fn reversed(&self) -> Self {
        let mut m = self.clone();
        m.reverse();
        m
    }

    /// Whether the remaining charge covers flying back the way we came.
    pub fn return_feasible(&self, battery_now: f64, drain_multiplier: f64) -> bool {
        let consumed = (self.battery_at_start - battery_now).max(0.0);
        consumed * drain_multiplier <= battery_now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct ItemParams {
    /// Relative to home
    pub altitude_m: f32,
    pub speed_mps: f32,
    pub acceptance_radius_m: f32,
}

impl Default for ItemParams {
    fn default() -> Self {
        Self { altitude_m: 30.0, speed_mps: 10.0, acceptance_radius_m: 2.0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MissionItem {
    pub position: Position,
    pub altitude_m: f32,
    pub speed_mps: f32,
    pub fly_through: bool,
    pub acceptance_radius_m: f32,
}

/// Waypoints flown through at cruise speed, then the goal as a full stop.
pub fn build_items(mission: &Mission, params: &ItemParams, reverse: bool) -> Vec<MissionItem> {
    let owned;
    let mission = if reverse {
        owned = mission.reversed();
        &owned
    } else {
        mission
    };

    let mut items: Vec<MissionItem> = mission
        .waypoints
        .iter()
        .map(|&position| MissionItem {
            position,
            altitude_m: params.altitude_m,
            speed_mps: params.speed_mps,
            fly_through: true,
            acceptance_radius_m: params.acceptance_radius_m,
        })
        .collect();

    items.push(MissionItem {
        position: mission.goal.position,
        altitude_m: params.altitude_m,
        speed_mps: 0.0,
        fly_through: false,
        acceptance_radius_m: params.acceptance_radius_m,
    });
    items
}

/// Drops every item before the one closest to `current`. Ties go to the earliest.
pub fn resume_from(items: &[MissionItem], current: Position) -> Vec<MissionItem> {
    let mut best: Option<(usize, f64)> = None;
    for (i, item) in items.iter().enumerate() {
        let d = haversine_m(item.position, current);
        match best {
            Some((_, bd)) if d >= bd => {}
            _ => best = Some((i, d)),
        }
    }
    match best {
        Some((i, _)) => items[i..].to_vec(),
        None => Vec::new(),
    }
}
