use std::fmt;

/// Flight lifecycle of the vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DroneState {
    Idle,
    Updating,
    EnRoute,
    Landing,
    ReturnLanding,
    EmergencyReturning,
    EmergencyLanding,
    Crashed,
}

impl DroneState {
    pub const ALL: [DroneState; 8] = [
        DroneState::Idle,
        DroneState::Updating,
        DroneState::EnRoute,
        DroneState::Landing,
        DroneState::ReturnLanding,
        DroneState::EmergencyReturning,
        DroneState::EmergencyLanding,
        DroneState::Crashed,
    ];

    /// Name reported to the server.
    pub fn wire_name(self) -> &'static str {
        match self {
            DroneState::Idle => "idle",
            DroneState::Updating => "updating",
            DroneState::EnRoute => "en_route",
            DroneState::Landing => "landing",
            DroneState::ReturnLanding => "return_landing",
            DroneState::EmergencyReturning => "emergency_returning",
            DroneState::EmergencyLanding => "emergency_landing",
            DroneState::Crashed => "crashed",
        }
    }

    /// ReturnLanding never leads back to EmergencyReturning: one return per mission.
    pub fn can_transition(self, to: DroneState) -> bool {
        use DroneState::*;
        matches!(
            (self, to),
            (Idle, Updating)
                | (Updating, Idle)
                | (Updating, EnRoute)
                | (EnRoute, Landing)
                | (Landing, Idle)
                | (EnRoute | Landing, EmergencyReturning)
                | (EmergencyReturning, ReturnLanding)
                | (ReturnLanding, Idle)
                | (EnRoute | Landing | EmergencyReturning | ReturnLanding, EmergencyLanding)
                | (EmergencyLanding, Crashed)
        )
    }
}

impl fmt::Display for DroneState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}
