//! Process supervision for session backends.
//!
//! Every session runs two host processes: a QEMU hypervisor serving VNC on
//! a local display port, and a websockify proxy exposing that display to
//! browsers on the session's public port. The [`ProcessSupervisor`] trait
//! is the seam the runtime drives; [`HostSupervisor`] is the implementation
//! that actually forks.

mod handle;
pub mod host_check;
pub mod qemu;
mod spawn;
pub mod websockify;

use std::path::PathBuf;

use async_trait::async_trait;
use buffet_shared::errors::BuffetResult;

use crate::catalogue::ImageEntry;
use crate::runtime::types::{OwnerId, SessionId};
use crate::slots::SlotPorts;

pub use handle::{ManagedProcess, ProcessKind};
pub use host_check::{Accelerator, HostPlatform};
pub use spawn::HostSupervisor;

pub use crate::util::process::SignalOutcome;

/// Everything needed to boot one session's hypervisor.
#[derive(Debug, Clone)]
pub struct HypervisorLaunch {
    pub session_id: SessionId,
    pub owner: OwnerId,
    pub image: ImageEntry,
    pub ports: SlotPorts,
    /// QMP socket the control channel connects to.
    pub control_socket: PathBuf,
    /// Packet capture destination for the guest NIC.
    pub traffic_log: PathBuf,
}

/// Everything needed to start one session's display proxy.
#[derive(Debug, Clone)]
pub struct ProxyLaunch {
    pub session_id: SessionId,
    pub ports: SlotPorts,
}

/// What the launched hypervisor can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HypervisorCapabilities {
    /// VNC password authentication is available.
    pub display_credential: bool,
    pub accelerator: Accelerator,
}

#[derive(Debug)]
pub struct LaunchedHypervisor {
    pub process: ManagedProcess,
    pub capabilities: HypervisorCapabilities,
}

/// Launches and stops the processes backing a session.
///
/// Both start methods return only once the process has been observed
/// running; a process that dies during startup is a `LaunchFailed` error.
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    async fn start_hypervisor(&self, launch: &HypervisorLaunch)
    -> BuffetResult<LaunchedHypervisor>;

    async fn start_proxy(&self, launch: &ProxyLaunch) -> BuffetResult<ManagedProcess>;

    /// Ask a process to exit. Does not wait for it.
    ///
    /// A process that is already gone yields [`SignalOutcome::AlreadyGone`].
    async fn terminate(&self, process: ManagedProcess) -> BuffetResult<SignalOutcome>;
}
