pub mod doctor;
pub mod geo;
pub mod mission;

pub use mission::{build_items, resume_from, Facility, ItemParams, Mission, MissionItem};
