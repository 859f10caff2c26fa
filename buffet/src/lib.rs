//! Buffet: one disposable virtual machine per user, on demand.
//!
//! The runtime allocates a display slot, launches QEMU and a websockify
//! proxy for it, sets a per-session VNC password over QMP and records the
//! session in a SQLite registry. Teardown and the crash-recovery sweep
//! reclaim slots even when the recorded processes are already gone.

pub mod catalogue;
pub mod control;
pub mod registry;
pub mod runtime;
pub mod slots;
pub mod supervisor;
pub mod util;

use std::sync::OnceLock;

pub use buffet_shared::{BuffetError, BuffetResult};
pub use catalogue::{AcceleratorHint, CatalogueMetadata, ImageCatalogue, ImageEntry, ImageListing};
pub use control::{ControlChannel, DisplayCredential};
pub use registry::{SessionRecord, SessionRegistry};
pub use runtime::BuffetRuntime;
pub use runtime::options::BuffetOptions;
pub use runtime::types::{
    DegradedReason, OwnerId, Provisioned, ProvisioningOutcome, Requester, Role, SessionId,
    SessionStatus, SessionSummary, SessionView,
};
pub use supervisor::{
    HypervisorCapabilities, HypervisorLaunch, LaunchedHypervisor, ManagedProcess, ProcessKind,
    ProcessSupervisor, ProxyLaunch, SignalOutcome,
};

use runtime::constants::filenames;
use runtime::layout::FilesystemLayout;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

static LOGGING_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Route `tracing` output to `<home>/logs/buffet.log`.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_logging_for(layout: &FilesystemLayout) -> BuffetResult<()> {
    let logs_dir = layout.logs_dir();
    std::fs::create_dir_all(&logs_dir).map_err(|e| {
        BuffetError::Storage(format!(
            "failed to create logs dir {}: {}",
            logs_dir.display(),
            e
        ))
    })?;

    LOGGING_GUARD.get_or_init(|| {
        let file_appender = tracing_appender::rolling::daily(&logs_dir, filenames::RUNTIME_LOG);
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        util::register_to_tracing(non_blocking, env_filter);
        guard
    });

    Ok(())
}
