pub mod message;

pub use message::{
    FacilityRef, Heartbeat, InboundMessage, MissionAction, MissionPlan, MissionReport,
    OutboundKind, OutboundMessage, OutboundPayload, Position, ProtoError, StateReport,
};
