use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use companion_fc::{FlightDriver, TelemetryCache};
use companion_nav::doctor::check_plan;
use companion_nav::geo::haversine_km;
use companion_nav::{build_items, resume_from, ItemParams, Mission};
use companion_proto::{
    InboundMessage, MissionAction, MissionPlan, MissionReport, OutboundPayload, Position, StateReport,
};
use companion_uplink::{Mailbox, Outbox};
use companion_vision::LandingDetector;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PolicyConfig;
use crate::state::DroneState;

/// Everything the state handlers act on.
pub struct MachineDeps {
    pub driver: Arc<dyn FlightDriver>,
    pub landing: Arc<dyn LandingDetector>,
    pub outbox: Arc<Outbox>,
    pub position: TelemetryCache<Position>,
    pub battery: TelemetryCache<f64>,
    pub policy: PolicyConfig,
    pub items: ItemParams,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    External,
    /// Raised by the handler started at this epoch.
    Task(u64),
}

struct TransitionRequest {
    to: DroneState,
    origin: Origin,
    mission: Option<Mission>,
    reply: Option<oneshot::Sender<bool>>,
}

struct StateTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Control {
    state: DroneState,
    epoch: u64,
    task: Option<StateTask>,
    /// Mission being flown. Replaced wholesale, never mutated in place.
    mission: Option<Arc<Mission>>,
    /// Mission under evaluation in Updating.
    pending: Option<Arc<Mission>>,
    latest_facility: Option<String>,
}

struct Shared {
    deps: MachineDeps,
    control: Mutex<Control>,
    requests: mpsc::UnboundedSender<TransitionRequest>,
    state_tx: watch::Sender<DroneState>,
    transitions: broadcast::Sender<(DroneState, DroneState)>,
}

/// Flight lifecycle state machine.
///
/// Transition requests from the outside and from state handlers are applied
/// one at a time by a supervisor task: validate against the table, stop the
/// running handler and wait for it, update state and mission, start the next
/// handler, queue exactly one outbound message. A handler's own request is
/// dropped if its state was left in the meantime.
#[derive(Clone)]
pub struct DroneStateMachine {
    shared: Arc<Shared>,
}

impl DroneStateMachine {
    /// Starts in Idle with the Idle handler running. The returned handle
    /// resolves after `cancel` fires and the last handler has stopped.
    pub fn spawn(deps: MachineDeps, cancel: CancellationToken) -> (Self, JoinHandle<()>) {
        let (requests, mut rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(DroneState::Idle);
        let (transitions, _) = broadcast::channel(64);
        let shared = Arc::new(Shared {
            deps,
            control: Mutex::new(Control {
                state: DroneState::Idle,
                epoch: 0,
                task: None,
                mission: None,
                pending: None,
                latest_facility: None,
            }),
            requests,
            state_tx,
            transitions,
        });

        let supervisor = {
            let shared = shared.clone();
            tokio::spawn(async move {
                {
                    let mut ctl = shared.control.lock().await;
                    ctl.task = Some(shared.start_handler(DroneState::Idle, 0));
                }
                info!("state: started in {}", DroneState::Idle);
                loop {
                    let req = tokio::select! {
                        _ = cancel.cancelled() => break,
                        req = rx.recv() => match req {
                            Some(req) => req,
                            None => break,
                        },
                    };
                    let ok = shared.apply(req.to, req.origin, req.mission).await;
                    if let Some(reply) = req.reply {
                        let _ = reply.send(ok);
                    }
                }
                let mut ctl = shared.control.lock().await;
                if let Some(task) = ctl.task.take() {
                    task.cancel.cancel();
                    let _ = task.handle.await;
                }
                info!("state: stopped in {}", ctl.state);
            })
        };
        (Self { shared }, supervisor)
    }

    /// Returns whether the transition was taken. Invalid edges are logged and
    /// leave the machine unchanged.
    pub async fn request_transition(&self, to: DroneState) -> bool {
        self.request(to, None).await
    }

    async fn request(&self, to: DroneState, mission: Option<Mission>) -> bool {
        let (reply, rx) = oneshot::channel();
        let req = TransitionRequest { to, origin: Origin::External, mission, reply: Some(reply) };
        if self.shared.requests.send(req).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub fn state(&self) -> DroneState {
        *self.shared.state_tx.borrow()
    }

    /// Every successful transition as (from, to).
    pub fn transitions(&self) -> broadcast::Receiver<(DroneState, DroneState)> {
        self.shared.transitions.subscribe()
    }

    pub async fn mission(&self) -> Option<Arc<Mission>> {
        self.shared.control.lock().await.mission.clone()
    }

    pub async fn latest_facility(&self) -> Option<String> {
        self.shared.control.lock().await.latest_facility.clone()
    }

    pub async fn handle_inbound(&self, msg: InboundMessage) {
        info!("state: inbound {} while {}", msg.kind(), self.state());
        match msg {
            InboundMessage::EmergencyLand => {
                self.request_transition(DroneState::EmergencyLanding).await;
            }
            InboundMessage::Return => {
                self.request_transition(DroneState::EmergencyReturning).await;
            }
            InboundMessage::Update(plan) => self.handle_update(plan).await,
        }
    }

    async fn handle_update(&self, plan: MissionPlan) {
        let goal = plan.goal.id.clone();
        if let Err(e) = check_plan(&plan) {
            warn!("state: rejecting malformed mission: {:#}", e);
            self.reject_update(goal).await;
            return;
        }
        let state = self.state();
        if state != DroneState::Idle {
            warn!("state: rejecting mission update while {}", state);
            self.reject_update(goal).await;
            return;
        }
        let battery = self.shared.deps.battery.latest().unwrap_or(0.0);
        let mission = Mission::from_plan(plan, battery);
        if !self.request(DroneState::Updating, Some(mission)).await {
            self.reject_update(goal).await;
        }
    }

    async fn reject_update(&self, goal: String) {
        let report = {
            let ctl = self.shared.control.lock().await;
            StateReport {
                state: ctl.state.wire_name().to_string(),
                latest_facility_id: ctl.latest_facility.clone(),
                goal_facility_id: Some(goal),
            }
        };
        self.shared.deps.outbox.push(OutboundPayload::MissionUpdate(MissionReport {
            action: MissionAction::Rejected,
            report,
        }));
    }

    /// Feeds mailbox commands into `handle_inbound` until cancelled.
    pub async fn run_inbound(&self, mailbox: Arc<Mailbox>, cancel: CancellationToken) {
        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => break,
                msg = mailbox.take() => msg,
            };
            self.handle_inbound(msg).await;
        }
        debug!("state: inbound loop stopped");
    }
}

impl Shared {
    async fn apply(self: &Arc<Self>, to: DroneState, origin: Origin, mission: Option<Mission>) -> bool {
        let mut ctl = self.control.lock().await;
        if let Origin::Task(epoch) = origin {
            if epoch != ctl.epoch {
                debug!("state: dropping request for {} from superseded handler", to);
                return false;
            }
        }
        let from = ctl.state;
        if !from.can_transition(to) {
            warn!("state: rejected transition {} -> {}", from, to);
            return false;
        }

        if let Some(task) = ctl.task.take() {
            task.cancel.cancel();
            if let Err(e) = task.handle.await {
                error!("state: {} handler ended abnormally: {}", from, e);
            }
        }

        if to == DroneState::Updating {
            ctl.pending = mission.map(Arc::new);
        }
        let mut action = None;
        match (from, to) {
            (DroneState::Updating, DroneState::EnRoute) => {
                ctl.mission = ctl.pending.take();
                action = Some(MissionAction::Accepted);
            }
            (DroneState::Updating, DroneState::Idle) => action = Some(MissionAction::Rejected),
            (DroneState::Landing | DroneState::ReturnLanding, DroneState::Idle) => {
                ctl.latest_facility = ctl.mission.as_ref().map(|m| m.goal.id.clone());
            }
            _ => {}
        }

        let report = StateReport {
            state: to.wire_name().to_string(),
            latest_facility_id: ctl.latest_facility.clone(),
            goal_facility_id: ctl.mission.as_ref().or(ctl.pending.as_ref()).map(|m| m.goal.id.clone()),
        };
        let payload = match action {
            Some(action) => OutboundPayload::MissionUpdate(MissionReport { action, report }),
            None => OutboundPayload::StateUpdate(report),
        };

        if matches!(to, DroneState::Idle | DroneState::Crashed) {
            if let Some(m) = ctl.mission.take() {
                debug!("state: mission {} concluded", m.id);
            }
            ctl.pending = None;
        }

        ctl.state = to;
        ctl.epoch += 1;
        self.outbox().push(payload);
        ctl.task = Some(self.start_handler(to, ctl.epoch));
        self.state_tx.send_replace(to);
        let _ = self.transitions.send((from, to));
        info!("state: {} -> {}", from, to);
        true
    }

    fn outbox(&self) -> &Outbox {
        &self.deps.outbox
    }

    fn start_handler(self: &Arc<Self>, state: DroneState, epoch: u64) -> StateTask {
        let cancel = CancellationToken::new();
        let shared = self.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let next = shared.run_state(state, &token).await;
            if token.is_cancelled() {
                debug!("state: {} handler cancelled", state);
                return;
            }
            if let Some(to) = next {
                let req = TransitionRequest { to, origin: Origin::Task(epoch), mission: None, reply: None };
                let _ = shared.requests.send(req);
            }
        });
        StateTask { cancel, handle }
    }

    async fn run_state(&self, state: DroneState, cancel: &CancellationToken) -> Option<DroneState> {
        match state {
            DroneState::Idle => self.idle(cancel).await,
            DroneState::Updating => self.updating(cancel).await,
            DroneState::EnRoute => self.en_route(cancel).await,
            DroneState::Landing => self.pad_landing(cancel, DroneState::EmergencyReturning).await,
            DroneState::ReturnLanding => self.pad_landing(cancel, DroneState::EmergencyLanding).await,
            DroneState::EmergencyReturning => self.emergency_returning(cancel).await,
            DroneState::EmergencyLanding => self.emergency_landing(cancel).await,
            DroneState::Crashed => self.crashed(cancel).await,
        }
    }

    /// Takes the control lock unless cancelled first. The supervisor holds the
    /// lock while it waits for a cancelled handler to finish.
    async fn lock_control(&self, cancel: &CancellationToken) -> Option<MutexGuard<'_, Control>> {
        let ctl = until_cancelled(cancel, self.control.lock()).await?;
        (!cancel.is_cancelled()).then_some(ctl)
    }

    async fn idle(&self, cancel: &CancellationToken) -> Option<DroneState> {
        if let Err(e) = until_cancelled(cancel, self.deps.driver.disarm()).await? {
            warn!("state: disarm failed: {:#}", e);
        }
        None
    }

    async fn updating(&self, cancel: &CancellationToken) -> Option<DroneState> {
        let pending = self.lock_control(cancel).await?.pending.clone();
        let Some(mission) = pending else {
            warn!("state: no mission to evaluate");
            return Some(DroneState::Idle);
        };
        let policy = &self.deps.policy;

        let (Some(pos), Some(battery)) = (self.deps.position.latest(), self.deps.battery.latest()) else {
            warn!("state: rejecting mission {}: no position/battery telemetry yet", mission.id);
            return Some(DroneState::Idle);
        };
        let dist_km = haversine_km(pos, mission.start.position);
        if dist_km > policy.max_start_dist_km {
            warn!(
                "state: rejecting mission {}: {:.3} km from start {} (max {:.3})",
                mission.id, dist_km, mission.start.id, policy.max_start_dist_km
            );
            return Some(DroneState::Idle);
        }
        if battery < policy.min_battery {
            warn!(
                "state: rejecting mission {}: battery {:.0}% below {:.0}%",
                mission.id,
                battery * 100.0,
                policy.min_battery * 100.0
            );
            return Some(DroneState::Idle);
        }
        info!("state: accepting mission {} ({} -> {})", mission.id, mission.start.id, mission.goal.id);
        Some(DroneState::EnRoute)
    }

    async fn en_route(&self, cancel: &CancellationToken) -> Option<DroneState> {
        let current = self.lock_control(cancel).await?.mission.clone();
        let Some(mission) = current else {
            error!("state: en route without a mission");
            return Some(DroneState::EmergencyLanding);
        };
        let items = build_items(&mission, &self.deps.items, false);
        info!("state: flying mission {} ({} items)", mission.id, items.len());
        match until_cancelled(cancel, self.deps.driver.execute_mission(items)).await? {
            Ok(()) => Some(DroneState::Landing),
            Err(e) => {
                error!("state: mission {} failed: {:#}", mission.id, e);
                Some(DroneState::EmergencyLanding)
            }
        }
    }

    async fn pad_landing(&self, cancel: &CancellationToken, on_failure: DroneState) -> Option<DroneState> {
        match until_cancelled(cancel, self.deps.landing.try_landing()).await? {
            Ok(true) => Some(DroneState::Idle),
            Ok(false) => {
                warn!("state: pad landing failed");
                Some(on_failure)
            }
            Err(e) => {
                warn!("state: pad landing error: {:#}", e);
                Some(on_failure)
            }
        }
    }

    async fn emergency_returning(&self, cancel: &CancellationToken) -> Option<DroneState> {
        let policy = &self.deps.policy;
        let reversed = {
            let mut ctl = self.lock_control(cancel).await?;
            let Some(mission) = ctl.mission.clone() else {
                warn!("state: no mission to return along");
                return Some(DroneState::EmergencyLanding);
            };
            let Some(battery) = self.deps.battery.latest() else {
                warn!("state: battery unknown, not attempting return");
                return Some(DroneState::EmergencyLanding);
            };
            if !mission.return_feasible(battery, policy.drain_multiplier) {
                warn!(
                    "state: battery {:.0}% insufficient for return (started at {:.0}%, x{:.2})",
                    battery * 100.0,
                    mission.battery_at_start * 100.0,
                    policy.drain_multiplier
                );
                return Some(DroneState::EmergencyLanding);
            }
            let mut reversed = mission.reversed();
            reversed.cancelled = true;
            let reversed = Arc::new(reversed);
            ctl.mission = Some(reversed.clone());
            reversed
        };

        let items = build_items(&reversed, &self.deps.items, false);
        let items = match self.deps.position.latest() {
            Some(pos) => resume_from(&items, pos),
            None => items,
        };
        info!("state: returning to {} ({} items)", reversed.goal.id, items.len());
        match until_cancelled(cancel, self.deps.driver.execute_mission(items)).await? {
            Ok(()) => Some(DroneState::ReturnLanding),
            Err(e) => {
                error!("state: return flight failed: {:#}", e);
                Some(DroneState::EmergencyLanding)
            }
        }
    }

    async fn emergency_landing(&self, cancel: &CancellationToken) -> Option<DroneState> {
        let attempts = self.deps.policy.land_retries.max(1);
        for attempt in 1..=attempts {
            match until_cancelled(cancel, self.deps.driver.land()).await? {
                Ok(()) => {
                    info!("state: emergency land commanded");
                    break;
                }
                Err(e) => {
                    warn!("state: land attempt {}/{} failed: {:#}", attempt, attempts, e);
                    if attempt < attempts {
                        until_cancelled(cancel, tokio::time::sleep(Duration::from_secs(1))).await?;
                    }
                }
            }
        }
        Some(DroneState::Crashed)
    }

    async fn crashed(&self, cancel: &CancellationToken) -> Option<DroneState> {
        error!("state: crashed, waiting for operator intervention");
        if let Err(e) = until_cancelled(cancel, self.deps.driver.disarm()).await? {
            warn!("state: disarm failed: {:#}", e);
        }
        None
    }
}

/// `None` if `cancel` fires before `fut` completes.
async fn until_cancelled<F: Future>(cancel: &CancellationToken, fut: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        out = fut => Some(out),
    }
}
