//! Session lifecycle status and state machine.
//!
//! An owner with no row in the registry is idle. A row moves through:
//!
//! ```text
//! create()  → Provisioning (slot + owner reserved, processes starting)
//!           → Running      (processes launched, row finalized)
//! destroy() → Terminating  (signals sent, row about to be deleted)
//! ```

use buffet_shared::errors::{BuffetError, BuffetResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Reservation held while the hypervisor and proxy start.
    Provisioning,

    /// Both processes launched; visible to `get` and `count`.
    Running,

    /// Teardown in progress.
    Terminating,
}

impl SessionStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, SessionStatus::Running)
    }

    /// Check if transition to target state is valid.
    pub fn can_transition_to(&self, target: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, target),
            (Provisioning, Running)
                // Failed launch cleanup, or a reservation no create owns any more
                | (Provisioning, Terminating)
                | (Running, Terminating)
                // Repeated destroy or sweep over a half-finished teardown
                | (Terminating, Terminating)
        )
    }

    /// Validate a transition, returning `InvalidState` when it is not allowed.
    pub fn transition_to(self, target: SessionStatus) -> BuffetResult<SessionStatus> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(BuffetError::InvalidState(format!(
                "Cannot transition from {} to {}",
                self, target
            )))
        }
    }

    /// Convert to string for database storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Provisioning => "provisioning",
            SessionStatus::Running => "running",
            SessionStatus::Terminating => "terminating",
        }
    }
}

impl std::str::FromStr for SessionStatus {
    type Err = BuffetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "provisioning" => Ok(SessionStatus::Provisioning),
            "running" => Ok(SessionStatus::Running),
            "terminating" => Ok(SessionStatus::Terminating),
            other => Err(BuffetError::Database(format!(
                "unknown session status '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
