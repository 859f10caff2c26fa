//! Test doubles and fixtures for exercising `BuffetRuntime` without QEMU.
//!
//! [`FakeSupervisor`] hands out synthetic pids and remembers which ones are
//! "alive"; [`FakeControlChannel`] answers credential requests without a
//! socket. [`TestRuntime`] wires both into a runtime rooted in a temp dir.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use buffet::control::generate_credential;
use buffet::supervisor::{Accelerator, HypervisorCapabilities};
use buffet::{
    BuffetError, BuffetOptions, BuffetResult, BuffetRuntime, ControlChannel, DisplayCredential,
    HypervisorLaunch, LaunchedHypervisor, ManagedProcess, OwnerId, ProcessKind, ProcessSupervisor,
    ProxyLaunch, SignalOutcome,
};
use parking_lot::Mutex;
use tempfile::TempDir;

/// Image present in every test catalogue.
pub const UBUNTU: &str = "ubuntu-24.04.iso";

/// Second image, marked as needing software emulation.
pub const DEBIAN: &str = "debian-12-arm64.iso";

pub const CATALOGUE: &str = r#"[
    {
        "iso": "ubuntu-24.04.iso",
        "name": "Ubuntu",
        "version": "24.04",
        "desktop": "GNOME",
        "homepage": "https://ubuntu.com",
        "logo": "ubuntu.png"
    },
    {
        "iso": "debian-12-arm64.iso",
        "name": "Debian",
        "version": 12,
        "architecture": "aarch64",
        "accelerator": "software"
    }
]"#;

const FIRST_FAKE_PID: u32 = 10_000;

pub fn owner(id: &str) -> OwnerId {
    OwnerId::new(id).expect("valid owner id")
}

// ============================================================================
// FAKE SUPERVISOR
// ============================================================================

#[derive(Debug, Default)]
struct SupervisorState {
    fail_hypervisor: bool,
    fail_proxy: bool,
    no_display_credential: bool,
    launch_delay: Option<Duration>,
    alive: BTreeSet<u32>,
    hypervisor_launches: Vec<HypervisorLaunch>,
    proxy_launches: Vec<ProxyLaunch>,
    terminated: Vec<(u32, ProcessKind)>,
}

/// Supervisor that only pretends to start processes.
#[derive(Debug)]
pub struct FakeSupervisor {
    state: Mutex<SupervisorState>,
    next_pid: AtomicU32,
}

impl Default for FakeSupervisor {
    fn default() -> Self {
        Self {
            state: Mutex::new(SupervisorState::default()),
            next_pid: AtomicU32::new(FIRST_FAKE_PID),
        }
    }
}

impl FakeSupervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_hypervisor(&self, fail: bool) {
        self.state.lock().fail_hypervisor = fail;
    }

    pub fn fail_proxy(&self, fail: bool) {
        self.state.lock().fail_proxy = fail;
    }

    /// Report hypervisors as unable to take a display password.
    pub fn without_display_credential(&self) {
        self.state.lock().no_display_credential = true;
    }

    /// Delay every start, to widen race windows in concurrency tests.
    pub fn set_launch_delay(&self, delay: Duration) {
        self.state.lock().launch_delay = Some(delay);
    }

    /// Pids started and not yet terminated.
    pub fn alive(&self) -> Vec<u32> {
        self.state.lock().alive.iter().copied().collect()
    }

    /// Forget a process as if it crashed on its own.
    pub fn crash(&self, pid: u32) {
        self.state.lock().alive.remove(&pid);
    }

    pub fn hypervisor_launches(&self) -> Vec<HypervisorLaunch> {
        self.state.lock().hypervisor_launches.clone()
    }

    pub fn proxy_launches(&self) -> Vec<ProxyLaunch> {
        self.state.lock().proxy_launches.clone()
    }

    pub fn terminated(&self) -> Vec<(u32, ProcessKind)> {
        self.state.lock().terminated.clone()
    }

    fn spawn_pid(&self) -> u32 {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.state.lock().alive.insert(pid);
        pid
    }

    async fn delay(&self) {
        let delay = self.state.lock().launch_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl ProcessSupervisor for FakeSupervisor {
    async fn start_hypervisor(
        &self,
        launch: &HypervisorLaunch,
    ) -> BuffetResult<LaunchedHypervisor> {
        self.delay().await;
        let display_credential = {
            let mut state = self.state.lock();
            state.hypervisor_launches.push(launch.clone());
            if state.fail_hypervisor {
                return Err(BuffetError::LaunchFailed(
                    "qemu-system-x86_64: simulated failure".into(),
                ));
            }
            !state.no_display_credential
        };

        Ok(LaunchedHypervisor {
            process: ManagedProcess::from_pid(self.spawn_pid(), ProcessKind::Hypervisor),
            capabilities: HypervisorCapabilities {
                display_credential,
                accelerator: Accelerator::Tcg,
            },
        })
    }

    async fn start_proxy(&self, launch: &ProxyLaunch) -> BuffetResult<ManagedProcess> {
        self.delay().await;
        {
            let mut state = self.state.lock();
            state.proxy_launches.push(launch.clone());
            if state.fail_proxy {
                return Err(BuffetError::LaunchFailed(
                    "websockify: simulated failure".into(),
                ));
            }
        }
        Ok(ManagedProcess::from_pid(self.spawn_pid(), ProcessKind::Proxy))
    }

    async fn terminate(&self, process: ManagedProcess) -> BuffetResult<SignalOutcome> {
        let mut state = self.state.lock();
        state.terminated.push((process.pid(), process.kind()));
        if state.alive.remove(&process.pid()) {
            Ok(SignalOutcome::Signalled)
        } else {
            Ok(SignalOutcome::AlreadyGone)
        }
    }
}

// ============================================================================
// FAKE CONTROL CHANNEL
// ============================================================================

#[derive(Debug, Default)]
pub struct FakeControlChannel {
    fail: Mutex<bool>,
    sockets: Mutex<Vec<std::path::PathBuf>>,
}

impl FakeControlChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every credential request fail as if QMP never came up.
    pub fn fail(&self, fail: bool) {
        *self.fail.lock() = fail;
    }

    pub fn sockets(&self) -> Vec<std::path::PathBuf> {
        self.sockets.lock().clone()
    }
}

#[async_trait]
impl ControlChannel for FakeControlChannel {
    async fn set_display_credential(&self, socket: &Path) -> BuffetResult<DisplayCredential> {
        self.sockets.lock().push(socket.to_path_buf());
        if *self.fail.lock() {
            return Err(BuffetError::ControlChannel(format!(
                "cannot connect to {}: connection refused",
                socket.display()
            )));
        }
        Ok(generate_credential())
    }
}

// ============================================================================
// RUNTIME FIXTURE
// ============================================================================

/// A runtime over fakes, rooted in its own temp dir.
pub struct TestRuntime {
    pub runtime: BuffetRuntime,
    pub supervisor: Arc<FakeSupervisor>,
    pub control: Arc<FakeControlChannel>,
    pub options: BuffetOptions,
    pub home: TempDir,
}

impl TestRuntime {
    pub fn new() -> Self {
        Self::with_options(|_| {})
    }

    /// Adjust the default options before the runtime starts.
    pub fn with_options(configure: impl FnOnce(&mut BuffetOptions)) -> Self {
        let home = TempDir::new().expect("Failed to create temp dir");
        let mut options = BuffetOptions::with_home(home.path());
        configure(&mut options);

        seed_catalogue(&options);

        let supervisor = FakeSupervisor::new();
        let control = FakeControlChannel::new();
        let runtime = BuffetRuntime::with_supervisor(
            options.clone(),
            supervisor.clone(),
            control.clone(),
        )
        .expect("Failed to create runtime");

        Self {
            runtime,
            supervisor,
            control,
            options,
            home,
        }
    }

    /// Drop the runtime and start a new one over the same home.
    ///
    /// Fake processes stay "alive" across the restart, the way real ones
    /// outlive a crashed service.
    pub fn restart(self) -> Self {
        let Self {
            runtime,
            supervisor,
            control,
            options,
            home,
        } = self;
        drop(runtime);

        let runtime = BuffetRuntime::with_supervisor(
            options.clone(),
            supervisor.clone(),
            control.clone(),
        )
        .expect("Failed to restart runtime");

        Self {
            runtime,
            supervisor,
            control,
            options,
            home,
        }
    }
}

impl Default for TestRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Write the test catalogue into the images dir the options point at.
pub fn seed_catalogue(options: &BuffetOptions) {
    let layout = options.layout();
    std::fs::create_dir_all(layout.images_dir()).expect("create images dir");
    std::fs::write(layout.catalogue_path(), CATALOGUE).expect("write catalogue");
}
