use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use companion_nav::geo::{haversine_m, lerp};
use companion_nav::MissionItem;
use companion_proto::Position;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;
use tracing::info;

use crate::{FcConfig, FlightDriver, TelemetryStream};

#[derive(Debug, Clone, PartialEq)]
pub enum SimEvent {
    Connected,
    Armed,
    Disarmed,
    MissionStarted(usize),
    MissionCompleted,
    MissionFailed,
    /// The caller dropped `execute_mission` before completion.
    MissionAbandoned,
    Landed,
    LandFailed,
}

#[derive(Debug, Default)]
struct Script {
    fail_missions: u32,
    fail_lands: u32,
    fail_disarms: u32,
    hold_missions: bool,
}

/// Kinematic stand-in for the autopilot: flies each item in a straight line at
/// a fixed ground speed in one-second steps and drains battery with distance.
#[derive(Debug)]
pub struct SimDriver {
    speed_mps: f64,
    drain_per_km: f64,
    step: Duration,
    position: watch::Sender<Option<Position>>,
    battery: watch::Sender<Option<f64>>,
    script: Mutex<Script>,
    events: Mutex<Vec<SimEvent>>,
}

impl SimDriver {
    pub fn new(start: Position, speed_mps: f64, drain_per_km: f64) -> Self {
        let (position, _) = watch::channel(Some(start));
        let (battery, _) = watch::channel(Some(1.0));
        Self {
            speed_mps,
            drain_per_km,
            step: Duration::from_secs(1),
            position,
            battery,
            script: Mutex::new(Script::default()),
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn from_config(cfg: &FcConfig) -> Self {
        Self::new(Position::from(cfg.sim_start), cfg.sim_speed_mps, cfg.sim_drain_per_km)
    }

    pub fn set_position(&self, p: Position) {
        self.position.send_replace(Some(p));
    }

    pub fn set_battery(&self, fraction: f64) {
        self.battery.send_replace(Some(fraction));
    }

    pub fn position(&self) -> Option<Position> {
        *self.position.borrow()
    }

    pub fn battery(&self) -> Option<f64> {
        *self.battery.borrow()
    }

    pub fn fail_next_missions(&self, n: u32) {
        self.script.lock().unwrap().fail_missions = n;
    }

    pub fn fail_next_lands(&self, n: u32) {
        self.script.lock().unwrap().fail_lands = n;
    }

    pub fn fail_next_disarms(&self, n: u32) {
        self.script.lock().unwrap().fail_disarms = n;
    }

    /// While set, missions start but never reach their final item.
    pub fn hold_missions(&self, hold: bool) {
        self.script.lock().unwrap().hold_missions = hold;
    }

    pub fn events(&self) -> Vec<SimEvent> {
        self.events.lock().unwrap().clone()
    }

    fn record(&self, ev: SimEvent) {
        self.events.lock().unwrap().push(ev);
    }

    async fn fly_to(&self, target: Position, tolerance_m: f64) {
        loop {
            let Some(cur) = self.position() else { return };
            let d = haversine_m(cur, target);
            if d <= tolerance_m.max(0.5) {
                self.set_position(target);
                return;
            }
            let step_m = self.speed_mps * self.step.as_secs_f64();
            let next = lerp(cur, target, step_m / d);
            let flown_km = haversine_m(cur, next) / 1000.0;
            self.set_position(next);
            let charge = self.battery().unwrap_or(0.0);
            self.set_battery((charge - flown_km * self.drain_per_km).max(0.0));
            tokio::time::sleep(self.step).await;
        }
    }
}

/// Records `MissionAbandoned` if the mission future is dropped mid-flight.
struct FlightGuard<'a> {
    sim: &'a SimDriver,
    done: bool,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.sim.record(SimEvent::MissionAbandoned);
        }
    }
}

#[async_trait]
impl FlightDriver for SimDriver {
    async fn connect(&self) -> Result<()> {
        self.record(SimEvent::Connected);
        info!("fc(sim): connected at {:?}", self.position());
        Ok(())
    }

    fn telemetry_position(&self) -> TelemetryStream<Position> {
        Box::pin(WatchStream::new(self.position.subscribe()).filter_map(|v| v))
    }

    fn telemetry_battery(&self) -> TelemetryStream<f64> {
        Box::pin(WatchStream::new(self.battery.subscribe()).filter_map(|v| v))
    }

    async fn execute_mission(&self, items: Vec<MissionItem>) -> Result<()> {
        let (fail, hold) = {
            let mut s = self.script.lock().unwrap();
            let fail = s.fail_missions > 0;
            if fail {
                s.fail_missions -= 1;
            }
            (fail, s.hold_missions)
        };
        if fail {
            self.record(SimEvent::MissionFailed);
            anyhow::bail!("simulated mission upload failure");
        }

        self.record(SimEvent::Armed);
        self.record(SimEvent::MissionStarted(items.len()));
        let mut guard = FlightGuard { sim: self, done: false };
        if hold {
            std::future::pending::<()>().await;
        }
        for (i, item) in items.iter().enumerate() {
            info!("fc(sim): item {:02}/{:02}", i + 1, items.len());
            self.fly_to(item.position, item.acceptance_radius_m as f64).await;
        }
        guard.done = true;
        self.record(SimEvent::MissionCompleted);
        Ok(())
    }

    async fn land(&self) -> Result<()> {
        let fail = {
            let mut s = self.script.lock().unwrap();
            let fail = s.fail_lands > 0;
            if fail {
                s.fail_lands -= 1;
            }
            fail
        };
        if fail {
            self.record(SimEvent::LandFailed);
            anyhow::bail!("simulated land command rejected");
        }
        info!("fc(sim): landing");
        self.record(SimEvent::Landed);
        Ok(())
    }

    async fn arm(&self) -> Result<()> {
        self.record(SimEvent::Armed);
        Ok(())
    }

    async fn disarm(&self) -> Result<()> {
        {
            let mut s = self.script.lock().unwrap();
            if s.fail_disarms > 0 {
                s.fail_disarms -= 1;
                anyhow::bail!("simulated disarm rejected");
            }
        }
        info!("fc(sim): disarmed");
        self.record(SimEvent::Disarmed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use companion_nav::ItemParams;

    fn item(p: Position) -> MissionItem {
        let params = ItemParams::default();
        MissionItem {
            position: p,
            altitude_m: params.altitude_m,
            speed_mps: params.speed_mps,
            fly_through: true,
            acceptance_radius_m: params.acceptance_radius_m,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn flies_items_and_drains_battery() {
        let sim = SimDriver::new(Position::new(51.0, 14.0), 40.0, 0.02);
        let target = Position::new(51.0, 14.01); // ~700 m east
        sim.execute_mission(vec![item(target)]).await.unwrap();
        assert_eq!(sim.position(), Some(target));
        let b = sim.battery().unwrap();
        assert!(b < 1.0 && b > 0.98, "battery {}", b);
        assert_eq!(
            sim.events(),
            vec![SimEvent::Armed, SimEvent::MissionStarted(1), SimEvent::MissionCompleted]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn scripted_failures_are_consumed() {
        let sim = SimDriver::new(Position::new(0.0, 0.0), 40.0, 0.02);
        sim.fail_next_missions(1);
        assert!(sim.execute_mission(vec![item(Position::new(0.0, 0.0))]).await.is_err());
        assert!(sim.execute_mission(vec![item(Position::new(0.0, 0.0))]).await.is_ok());

        sim.fail_next_lands(1);
        assert!(sim.land().await.is_err());
        assert!(sim.land().await.is_ok());

        sim.fail_next_disarms(1);
        assert!(sim.disarm().await.is_err());
        assert!(sim.disarm().await.is_ok());
        assert_eq!(sim.events().last(), Some(&SimEvent::Disarmed));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_mission_is_recorded() {
        let sim = SimDriver::new(Position::new(0.0, 0.0), 40.0, 0.02);
        sim.hold_missions(true);
        let res = tokio::time::timeout(
            Duration::from_secs(5),
            sim.execute_mission(vec![item(Position::new(0.0, 1.0))]),
        )
        .await;
        assert!(res.is_err());
        assert_eq!(sim.events().last(), Some(&SimEvent::MissionAbandoned));
    }

    #[tokio::test]
    async fn telemetry_streams_start_with_current_value() {
        let sim = SimDriver::new(Position::new(1.0, 2.0), 40.0, 0.02);
        let mut pos = sim.telemetry_position();
        assert_eq!(pos.next().await, Some(Position::new(1.0, 2.0)));
        let mut bat = sim.telemetry_battery();
        assert_eq!(bat.next().await, Some(1.0));
    }
}
