use std::sync::Arc;
use std::time::Duration;

use companion_core::{DroneState, DroneStateMachine, MachineDeps, PolicyConfig};
use companion_fc::sim::{SimDriver, SimEvent};
use companion_fc::{FlightDriver, TelemetryCache};
use companion_nav::ItemParams;
use companion_proto::{
    FacilityRef, InboundMessage, MissionAction, MissionPlan, OutboundKind, OutboundPayload, Position,
};
use companion_uplink::{Mailbox, Outbox};
use companion_vision::ScriptedLandingDetector;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use DroneState::*;

const A: Position = Position::new(51.0, 14.0);
const WP: Position = Position::new(51.0, 14.005);
const B: Position = Position::new(51.0, 14.01);

fn plan() -> MissionPlan {
    MissionPlan {
        id: None,
        start: FacilityRef { id: "A".into(), pos: A },
        waypoints: vec![WP],
        goal: FacilityRef { id: "B".into(), pos: B },
    }
}

struct Rig {
    sim: Arc<SimDriver>,
    landing: Arc<ScriptedLandingDetector>,
    outbox: Arc<Outbox>,
    machine: DroneStateMachine,
    transitions: broadcast::Receiver<(DroneState, DroneState)>,
    cancel: CancellationToken,
    supervisor: JoinHandle<()>,
}

async fn rig(start: Position, drain_per_km: f64, landings: Vec<bool>) -> Rig {
    let sim = Arc::new(SimDriver::new(start, 40.0, drain_per_km));
    let cancel = CancellationToken::new();
    let stale = Duration::from_secs(10);
    let (position, _) = TelemetryCache::spawn("position", stale, sim.telemetry_position(), cancel.clone());
    let (battery, _) = TelemetryCache::spawn("battery", stale, sim.telemetry_battery(), cancel.clone());
    let landing = Arc::new(ScriptedLandingDetector::new(landings, true));
    let outbox = Arc::new(Outbox::new(64));

    let deps = MachineDeps {
        driver: sim.clone(),
        landing: landing.clone(),
        outbox: outbox.clone(),
        position,
        battery,
        policy: PolicyConfig::default(),
        items: ItemParams::default(),
    };
    let (machine, supervisor) = DroneStateMachine::spawn(deps, cancel.clone());
    let transitions = machine.transitions();
    // first telemetry values
    tokio::time::sleep(Duration::from_millis(10)).await;
    Rig { sim, landing, outbox, machine, transitions, cancel, supervisor }
}

impl Rig {
    async fn wait_for(&mut self, target: DroneState) -> Vec<(DroneState, DroneState)> {
        let mut seen = Vec::new();
        tokio::time::timeout(Duration::from_secs(600), async {
            loop {
                let t = self.transitions.recv().await.expect("transition stream closed");
                seen.push(t);
                if t.1 == target {
                    break;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("never reached {}", target));
        seen
    }

    async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    async fn stop(self) {
        self.cancel.cancel();
        self.supervisor.await.unwrap();
    }
}

fn pos_of(events: &[SimEvent], ev: &SimEvent) -> usize {
    events
        .iter()
        .position(|e| e == ev)
        .unwrap_or_else(|| panic!("{:?} not in {:?}", ev, events))
}

#[tokio::test(start_paused = true)]
async fn mission_too_far_from_start_is_rejected() {
    // ~0.2 km north of A
    let mut rig = rig(Position::new(51.0018, 14.0), 0.02, vec![]).await;
    rig.machine.handle_inbound(InboundMessage::Update(plan())).await;

    assert_eq!(rig.wait_for(Idle).await, vec![(Idle, Updating), (Updating, Idle)]);
    assert_eq!(rig.machine.mission().await, None);
    assert_eq!(rig.outbox.last_sequence(OutboundKind::MissionUpdate), 1);

    let msg = rig.outbox.try_pop().unwrap();
    let OutboundPayload::MissionUpdate(report) = msg.payload else {
        panic!("expected mission_update, got {:?}", msg.payload);
    };
    assert_eq!(report.action, MissionAction::Rejected);
    assert_eq!(report.report.state, "idle");
    assert_eq!(report.report.goal_facility_id.as_deref(), Some("B"));
    assert!(!rig.sim.events().contains(&SimEvent::Armed));
    rig.stop().await;
}

#[tokio::test(start_paused = true)]
async fn accepted_mission_flies_and_lands() {
    let mut rig = rig(A, 0.02, vec![true]).await;
    rig.machine.handle_inbound(InboundMessage::Update(plan())).await;

    assert_eq!(
        rig.wait_for(Idle).await,
        vec![(Idle, Updating), (Updating, EnRoute), (EnRoute, Landing), (Landing, Idle)]
    );
    rig.settle().await;

    assert_eq!(rig.sim.position(), Some(B));
    assert_eq!(rig.machine.latest_facility().await.as_deref(), Some("B"));
    assert_eq!(rig.machine.mission().await, None);
    assert_eq!(rig.landing.attempts(), 1);

    // one message per transition
    assert_eq!(rig.outbox.last_sequence(OutboundKind::StateUpdate), 3);
    assert_eq!(rig.outbox.last_sequence(OutboundKind::MissionUpdate), 1);

    let newest = rig.outbox.try_pop().unwrap();
    let OutboundPayload::StateUpdate(report) = newest.payload else { panic!("expected state_update") };
    assert_eq!(newest.sequence_number, 3);
    assert_eq!(report.state, "idle");
    assert_eq!(report.latest_facility_id.as_deref(), Some("B"));

    let accepted = rig.outbox.try_pop().unwrap();
    let OutboundPayload::MissionUpdate(report) = accepted.payload else { panic!("expected mission_update") };
    assert_eq!(report.action, MissionAction::Accepted);
    assert_eq!(report.report.state, "en_route");
    assert_eq!(report.report.goal_facility_id.as_deref(), Some("B"));
    assert!(rig.outbox.try_pop().is_none());

    let events = rig.sim.events();
    assert!(events.contains(&SimEvent::MissionStarted(2)));
    assert_eq!(events.last(), Some(&SimEvent::Disarmed));
    rig.stop().await;
}

#[tokio::test(start_paused = true)]
async fn failed_pad_landing_returns_to_start() {
    let mut rig = rig(A, 0.02, vec![false, true]).await;
    rig.machine.handle_inbound(InboundMessage::Update(plan())).await;

    assert_eq!(
        rig.wait_for(Idle).await,
        vec![
            (Idle, Updating),
            (Updating, EnRoute),
            (EnRoute, Landing),
            (Landing, EmergencyReturning),
            (EmergencyReturning, ReturnLanding),
            (ReturnLanding, Idle),
        ]
    );
    assert_eq!(rig.sim.position(), Some(A));
    assert_eq!(rig.machine.latest_facility().await.as_deref(), Some("A"));

    // back along the waypoint, starting from the one closest to B
    let started: Vec<_> = rig
        .sim
        .events()
        .into_iter()
        .filter(|e| matches!(e, SimEvent::MissionStarted(_)))
        .collect();
    assert_eq!(started, vec![SimEvent::MissionStarted(2), SimEvent::MissionStarted(2)]);
    rig.stop().await;
}

#[tokio::test(start_paused = true)]
async fn second_landing_failure_ends_in_crashed() {
    let mut rig = rig(A, 0.02, vec![false, false]).await;
    rig.machine.handle_inbound(InboundMessage::Update(plan())).await;

    let seen = rig.wait_for(Crashed).await;
    assert_eq!(
        &seen[3..],
        &[
            (Landing, EmergencyReturning),
            (EmergencyReturning, ReturnLanding),
            (ReturnLanding, EmergencyLanding),
            (EmergencyLanding, Crashed),
        ]
    );
    rig.settle().await;

    assert!(rig.sim.events().contains(&SimEvent::Landed));
    assert_eq!(rig.sim.events().last(), Some(&SimEvent::Disarmed));
    assert_eq!(rig.machine.mission().await, None);
    assert!(!rig.machine.request_transition(Idle).await);
    assert_eq!(rig.machine.state(), Crashed);
    rig.stop().await;
}

#[tokio::test(start_paused = true)]
async fn low_battery_skips_the_return_flight() {
    // ~0.7 km out drains ~0.56: 0.56 * 1.1 > 0.44 left
    let mut rig = rig(A, 0.8, vec![false]).await;
    rig.machine.handle_inbound(InboundMessage::Update(plan())).await;

    let seen = rig.wait_for(Crashed).await;
    assert_eq!(
        &seen[3..],
        &[(Landing, EmergencyReturning), (EmergencyReturning, EmergencyLanding), (EmergencyLanding, Crashed)]
    );
    let flights = rig.sim.events().iter().filter(|e| matches!(e, SimEvent::MissionStarted(_))).count();
    assert_eq!(flights, 1);
    rig.stop().await;
}

#[tokio::test(start_paused = true)]
async fn emergency_land_stops_the_flight_before_landing() {
    let mut rig = rig(A, 0.02, vec![]).await;
    let mailbox = Arc::new(Mailbox::new());
    let inbound = {
        let machine = rig.machine.clone();
        let mailbox = mailbox.clone();
        let cancel = rig.cancel.clone();
        tokio::spawn(async move { machine.run_inbound(mailbox, cancel).await })
    };

    rig.sim.hold_missions(true);
    mailbox.put(InboundMessage::Update(plan()));
    rig.wait_for(EnRoute).await;

    mailbox.put(InboundMessage::EmergencyLand);
    assert_eq!(rig.wait_for(Crashed).await, vec![(EnRoute, EmergencyLanding), (EmergencyLanding, Crashed)]);

    let events = rig.sim.events();
    assert!(pos_of(&events, &SimEvent::MissionAbandoned) < pos_of(&events, &SimEvent::Landed));
    rig.cancel.cancel();
    inbound.await.unwrap();
    rig.stop().await;
}

#[tokio::test(start_paused = true)]
async fn return_command_mid_flight() {
    let mut rig = rig(A, 0.02, vec![true]).await;
    rig.sim.hold_missions(true);
    rig.machine.handle_inbound(InboundMessage::Update(plan())).await;
    rig.wait_for(EnRoute).await;

    rig.sim.hold_missions(false);
    rig.machine.handle_inbound(InboundMessage::Return).await;
    assert_eq!(
        rig.wait_for(Idle).await,
        vec![(EnRoute, EmergencyReturning), (EmergencyReturning, ReturnLanding), (ReturnLanding, Idle)]
    );

    let events = rig.sim.events();
    assert!(events.contains(&SimEvent::MissionAbandoned));
    // still at A, so only A itself is left of the reversed route
    assert!(events.contains(&SimEvent::MissionStarted(1)));
    assert_eq!(rig.machine.latest_facility().await.as_deref(), Some("A"));
    rig.stop().await;
}

#[tokio::test(start_paused = true)]
async fn update_while_flying_is_rejected() {
    let mut rig = rig(A, 0.02, vec![]).await;
    rig.sim.hold_missions(true);
    rig.machine.handle_inbound(InboundMessage::Update(plan())).await;
    rig.wait_for(EnRoute).await;

    let mut other = plan();
    other.goal.id = "C".into();
    rig.machine.handle_inbound(InboundMessage::Update(other)).await;

    assert_eq!(rig.machine.state(), EnRoute);
    assert_eq!(rig.outbox.last_sequence(OutboundKind::MissionUpdate), 2);
    let msg = rig.outbox.try_pop().unwrap();
    let OutboundPayload::MissionUpdate(report) = msg.payload else { panic!("expected mission_update") };
    assert_eq!(report.action, MissionAction::Rejected);
    assert_eq!(report.report.state, "en_route");
    assert_eq!(report.report.goal_facility_id.as_deref(), Some("C"));
    assert_eq!(rig.machine.mission().await.unwrap().goal.id, "B");
    rig.stop().await;
}

#[tokio::test(start_paused = true)]
async fn invalid_requests_change_nothing() {
    let rig = rig(A, 0.02, vec![]).await;
    for to in DroneState::ALL {
        if to == Updating {
            continue;
        }
        assert!(!rig.machine.request_transition(to).await, "idle -> {}", to);
        assert_eq!(rig.machine.state(), Idle);
    }
    rig.machine.handle_inbound(InboundMessage::Return).await;
    assert_eq!(rig.machine.state(), Idle);
    assert_eq!(rig.outbox.last_sequence(OutboundKind::StateUpdate), 0);
    assert_eq!(rig.outbox.last_sequence(OutboundKind::MissionUpdate), 0);
    rig.stop().await;
}

#[tokio::test(start_paused = true)]
async fn mission_failure_escalates_to_emergency_landing() {
    let mut rig = rig(A, 0.02, vec![]).await;
    rig.sim.fail_next_missions(1);
    rig.sim.fail_next_lands(2);
    rig.machine.handle_inbound(InboundMessage::Update(plan())).await;

    let seen = rig.wait_for(Crashed).await;
    assert_eq!(&seen[2..], &[(EnRoute, EmergencyLanding), (EmergencyLanding, Crashed)]);

    let lands: Vec<_> = rig
        .sim
        .events()
        .into_iter()
        .filter(|e| matches!(e, SimEvent::Landed | SimEvent::LandFailed))
        .collect();
    assert_eq!(lands, vec![SimEvent::LandFailed, SimEvent::LandFailed, SimEvent::Landed]);
    rig.stop().await;
}
