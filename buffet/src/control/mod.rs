//! Hypervisor control channel.
//!
//! After the hypervisor starts, the runtime connects to its QMP socket and
//! sets a fresh VNC password. The password is kept with the session record
//! for its owner and never written to the logs.

mod credential;
mod qmp;

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use buffet_shared::errors::BuffetResult;

pub use credential::generate_credential;
pub use qmp::QmpControlChannel;

/// A display password. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct DisplayCredential(String);

impl DisplayCredential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// The secret itself, for handing to the session owner.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Debug for DisplayCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DisplayCredential(<redacted>)")
    }
}

#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Generate a credential and install it on the hypervisor behind `socket`.
    async fn set_display_credential(&self, socket: &Path) -> BuffetResult<DisplayCredential>;
}
