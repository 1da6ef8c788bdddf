use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
}

/// WGS84 position in degrees. On the wire: `[lat, lon]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct Position {
    pub lat: f64,
    pub lon: f64,
}

impl Position {
    pub const fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

impl From<[f64; 2]> for Position {
    fn from(v: [f64; 2]) -> Self {
        Self { lat: v[0], lon: v[1] }
    }
}

impl From<Position> for [f64; 2] {
    fn from(p: Position) -> Self {
        [p.lat, p.lon]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FacilityRef {
    pub id: String,
    pub pos: Position,
}

/// Body of an inbound `update` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionPlan {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub start: FacilityRef,
    #[serde(default)]
    pub waypoints: Vec<Position>,
    pub goal: FacilityRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    Update(MissionPlan),
    Return,
    EmergencyLand,
}

impl InboundMessage {
    pub fn decode(frame: &[u8]) -> Result<Self, ProtoError> {
        Ok(serde_json::from_slice(frame)?)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InboundMessage::Update(_) => "update",
            InboundMessage::Return => "return",
            InboundMessage::EmergencyLand => "emergency_land",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundKind {
    Heartbeat,
    StateUpdate,
    MissionUpdate,
}

impl OutboundKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OutboundKind::Heartbeat => "heartbeat",
            OutboundKind::StateUpdate => "state_update",
            OutboundKind::MissionUpdate => "mission_update",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub pos: Position,
    /// Remaining charge, 0..1
    pub battery: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateReport {
    pub state: String,
    pub latest_facility_id: Option<String>,
    pub goal_facility_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionAction {
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionReport {
    pub action: MissionAction,
    #[serde(flatten)]
    pub report: StateReport,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OutboundPayload {
    Heartbeat(Heartbeat),
    StateUpdate(StateReport),
    MissionUpdate(MissionReport),
}

impl OutboundPayload {
    pub fn kind(&self) -> OutboundKind {
        match self {
            OutboundPayload::Heartbeat(_) => OutboundKind::Heartbeat,
            OutboundPayload::StateUpdate(_) => OutboundKind::StateUpdate,
            OutboundPayload::MissionUpdate(_) => OutboundKind::MissionUpdate,
        }
    }
}

/// A queued outbound message. `sequence_number` is per kind, assigned at enqueue.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub kind: OutboundKind,
    pub sequence_number: u64,
    pub payload: OutboundPayload,
}

#[derive(Serialize)]
struct Frame<'a> {
    #[serde(rename = "type")]
    kind: OutboundKind,
    #[serde(rename = "sequenceNumber", skip_serializing_if = "Option::is_none")]
    sequence_number: Option<u64>,
    #[serde(flatten)]
    payload: &'a OutboundPayload,
}

impl OutboundMessage {
    pub fn new(sequence_number: u64, payload: OutboundPayload) -> Self {
        Self { kind: payload.kind(), sequence_number, payload }
    }

    /// Heartbeats go out without a sequence number.
    pub fn heartbeat(hb: Heartbeat) -> Self {
        Self::new(0, OutboundPayload::Heartbeat(hb))
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtoError> {
        let sequence_number = match self.kind {
            OutboundKind::Heartbeat => None,
            _ => Some(self.sequence_number),
        };
        let frame = Frame { kind: self.kind, sequence_number, payload: &self.payload };
        Ok(serde_json::to_vec(&frame)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn report() -> StateReport {
        StateReport {
            state: "en_route".into(),
            latest_facility_id: None,
            goal_facility_id: Some("B".into()),
        }
    }

    #[test]
    fn heartbeat_has_no_sequence_number() {
        let msg = OutboundMessage::heartbeat(Heartbeat { pos: Position::new(51.5, 14.25), battery: 0.75 });
        let v: Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(v, json!({"type": "heartbeat", "pos": [51.5, 14.25], "battery": 0.75}));
    }

    #[test]
    fn state_update_frame_layout() {
        let msg = OutboundMessage::new(3, OutboundPayload::StateUpdate(report()));
        let v: Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            v,
            json!({
                "type": "state_update",
                "sequenceNumber": 3,
                "state": "en_route",
                "latest_facility_id": null,
                "goal_facility_id": "B"
            })
        );
    }

    #[test]
    fn mission_update_carries_action() {
        let msg = OutboundMessage::new(
            1,
            OutboundPayload::MissionUpdate(MissionReport { action: MissionAction::Rejected, report: report() }),
        );
        let v: Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(v["type"], "mission_update");
        assert_eq!(v["action"], "rejected");
        assert_eq!(v["state"], "en_route");
        assert_eq!(v["sequenceNumber"], 1);
    }

    #[test]
    fn decode_update() {
        let raw = br#"{
            "type": "update",
            "start": {"id": "A", "pos": [51.766174, 14.323152]},
            "waypoints": [[51.765625, 14.3125], [51.75, 14.5]],
            "goal": {"id": "B", "pos": [51.125, 14.0625]}
        }"#;
        let InboundMessage::Update(plan) = InboundMessage::decode(raw).unwrap() else {
            panic!("expected update");
        };
        assert_eq!(plan.id, None);
        assert_eq!(plan.start.id, "A");
        assert_eq!(plan.waypoints.len(), 2);
        assert_eq!(plan.waypoints[1], Position::new(51.75, 14.5));
        assert_eq!(plan.goal.pos, Position::new(51.125, 14.0625));
    }

    #[test]
    fn decode_commands() {
        assert_eq!(InboundMessage::decode(br#"{"type":"return"}"#).unwrap(), InboundMessage::Return);
        assert_eq!(
            InboundMessage::decode(br#"{"type":"emergency_land"}"#).unwrap(),
            InboundMessage::EmergencyLand
        );
    }

    #[test]
    fn decode_rejects_unknown_type() {
        assert!(InboundMessage::decode(br#"{"type":"none"}"#).is_err());
        assert!(InboundMessage::decode(b"not json").is_err());
    }
}
