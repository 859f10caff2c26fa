//! Configuration for buffet.

use crate::runtime::constants::{envs as const_envs, hypervisor, ports, session};
use crate::runtime::layout::{FilesystemLayout, dirs as const_dirs};
use buffet_shared::errors::{BuffetError, BuffetResult};
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ============================================================================
// TLS Options
// ============================================================================

/// Certificate material handed to the proxy.
///
/// When set, the proxy only accepts TLS connections.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsOptions {
    pub cert: PathBuf,
    pub key: PathBuf,
}

// ============================================================================
// Control Channel Options
// ============================================================================

/// Retry policy for the QMP handshake.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlOptions {
    /// Total time allowed for the socket to appear and accept a connection.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// First retry delay; doubles after every failed attempt.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Upper bound on a single retry delay.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Bound on each read or write once connected.
    #[serde(default = "default_io_timeout_ms")]
    pub io_timeout_ms: u64,
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_initial_backoff_ms() -> u64 {
    50
}

fn default_max_backoff_ms() -> u64 {
    500
}

fn default_io_timeout_ms() -> u64 {
    2000
}

impl ControlOptions {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }
}

impl Default for ControlOptions {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            io_timeout_ms: default_io_timeout_ms(),
        }
    }
}

// ============================================================================
// Runtime Options
// ============================================================================

/// Configuration options for BuffetRuntime.
///
/// Every field has a default, so a TOML file only needs the values it
/// changes:
///
/// ```toml
/// max_sessions = 12
/// hardware_acceleration = false
///
/// [tls]
/// cert = "/etc/buffet/cert.pem"
/// key = "/etc/buffet/key.pem"
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuffetOptions {
    #[serde(default = "default_home_dir")]
    pub home_dir: PathBuf,

    /// Boot images and `index.json`. Defaults to `<home>/iso`.
    #[serde(default)]
    pub images_dir: Option<PathBuf>,

    /// Root for traffic captures and runtime logs. Defaults to `<home>/logs`.
    #[serde(default)]
    pub log_dir: Option<PathBuf>,

    #[serde(default = "default_max_sessions")]
    pub max_sessions: u16,

    #[serde(default = "default_vm_port_base")]
    pub vm_port_base: u16,

    #[serde(default = "default_proxy_port_base")]
    pub proxy_port_base: u16,

    #[serde(default = "default_memory_mib")]
    pub memory_mib: u32,

    #[serde(default = "default_cpus")]
    pub cpus: u8,

    /// Use KVM/HVF when the host supports it.
    #[serde(default = "default_hardware_acceleration")]
    pub hardware_acceleration: bool,

    #[serde(default)]
    pub tls: Option<TlsOptions>,

    /// Address the proxy listens on for browsers.
    #[serde(default = "default_proxy_listen_address")]
    pub proxy_listen_address: String,

    /// Address the hypervisor's VNC server binds and the proxy dials.
    #[serde(default = "default_display_address")]
    pub display_address: String,

    /// Hypervisor binary is `<prefix><architecture>`.
    #[serde(default = "default_hypervisor_binary_prefix")]
    pub hypervisor_binary_prefix: String,

    #[serde(default = "default_proxy_binary")]
    pub proxy_binary: String,

    #[serde(default)]
    pub control: ControlOptions,

    /// How long a freshly spawned process must survive to count as started.
    #[serde(default = "default_launch_settle_ms")]
    pub launch_settle_ms: u64,
}

fn default_home_dir() -> PathBuf {
    std::env::var(const_envs::BUFFET_HOME)
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let mut path = home_dir().unwrap_or_else(|| PathBuf::from("."));
            path.push(const_dirs::BUFFET_DIR);
            path
        })
}

fn default_max_sessions() -> u16 {
    session::DEFAULT_MAX_SESSIONS
}

fn default_vm_port_base() -> u16 {
    ports::DEFAULT_VM_PORT_BASE
}

fn default_proxy_port_base() -> u16 {
    ports::DEFAULT_PROXY_PORT_BASE
}

fn default_memory_mib() -> u32 {
    session::DEFAULT_MEMORY_MIB
}

fn default_cpus() -> u8 {
    session::DEFAULT_CPUS
}

fn default_hardware_acceleration() -> bool {
    true
}

fn default_proxy_listen_address() -> String {
    "0.0.0.0".to_string()
}

fn default_display_address() -> String {
    "127.0.0.1".to_string()
}

fn default_hypervisor_binary_prefix() -> String {
    "qemu-system-".to_string()
}

fn default_proxy_binary() -> String {
    "websockify".to_string()
}

fn default_launch_settle_ms() -> u64 {
    200
}

impl Default for BuffetOptions {
    fn default() -> Self {
        Self {
            home_dir: default_home_dir(),
            images_dir: None,
            log_dir: None,
            max_sessions: default_max_sessions(),
            vm_port_base: default_vm_port_base(),
            proxy_port_base: default_proxy_port_base(),
            memory_mib: default_memory_mib(),
            cpus: default_cpus(),
            hardware_acceleration: default_hardware_acceleration(),
            tls: None,
            proxy_listen_address: default_proxy_listen_address(),
            display_address: default_display_address(),
            hypervisor_binary_prefix: default_hypervisor_binary_prefix(),
            proxy_binary: default_proxy_binary(),
            control: ControlOptions::default(),
            launch_settle_ms: default_launch_settle_ms(),
        }
    }
}

impl BuffetOptions {
    /// Options rooted at `home_dir`, everything else default.
    pub fn with_home(home_dir: impl Into<PathBuf>) -> Self {
        Self {
            home_dir: home_dir.into(),
            ..Default::default()
        }
    }

    /// Load options from a TOML file.
    pub fn from_toml_file(path: &Path) -> BuffetResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            BuffetError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&raw)
            .map_err(|e| BuffetError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn from_toml_str(raw: &str) -> BuffetResult<Self> {
        toml::from_str(raw).map_err(|e| BuffetError::Config(e.to_string()))
    }

    /// Directory layout implied by these options.
    pub fn layout(&self) -> FilesystemLayout {
        let mut layout = FilesystemLayout::new(self.home_dir.clone());
        if let Some(images_dir) = &self.images_dir {
            layout = layout.with_images_dir(images_dir.clone());
        }
        if let Some(log_dir) = &self.log_dir {
            layout = layout.with_logs_dir(log_dir.clone());
        }
        layout
    }

    pub fn launch_settle(&self) -> Duration {
        Duration::from_millis(self.launch_settle_ms)
    }

    /// Reject option combinations the runtime cannot honour.
    pub fn validate(&self) -> BuffetResult<()> {
        if !self.home_dir.is_absolute() {
            return Err(BuffetError::Config(format!(
                "home_dir must be absolute path, got: {}",
                self.home_dir.display()
            )));
        }

        if self.max_sessions == 0 {
            return Err(BuffetError::Config(
                "max_sessions must be at least 1".into(),
            ));
        }

        if self.cpus == 0 || self.memory_mib == 0 {
            return Err(BuffetError::Config(
                "cpus and memory_mib must be non-zero".into(),
            ));
        }

        if self.vm_port_base < ports::VNC_DISPLAY_BASE {
            return Err(BuffetError::Config(format!(
                "vm_port_base {} is below the first VNC display port {}",
                self.vm_port_base,
                ports::VNC_DISPLAY_BASE
            )));
        }

        let vm_range = port_range(self.vm_port_base, self.max_sessions, "vm_port_base")?;
        let proxy_range = port_range(self.proxy_port_base, self.max_sessions, "proxy_port_base")?;
        if vm_range.0 <= proxy_range.1 && proxy_range.0 <= vm_range.1 {
            return Err(BuffetError::Config(format!(
                "display ports {}-{} overlap proxy ports {}-{}",
                vm_range.0, vm_range.1, proxy_range.0, proxy_range.1
            )));
        }

        // The highest slot has the longest socket name
        let socket = self.layout().control_socket(self.max_sessions - 1);
        if socket.as_os_str().len() > hypervisor::SOCKET_PATH_MAX {
            return Err(BuffetError::Config(format!(
                "control socket path {} exceeds {} bytes; use a shorter home_dir",
                socket.display(),
                hypervisor::SOCKET_PATH_MAX
            )));
        }

        if let Some(tls) = &self.tls {
            for path in [&tls.cert, &tls.key] {
                if !path.exists() {
                    return Err(BuffetError::Config(format!(
                        "TLS material not found: {}",
                        path.display()
                    )));
                }
            }
        }

        if self.control.initial_backoff_ms == 0 || self.control.connect_timeout_ms == 0 {
            return Err(BuffetError::Config(
                "control timeouts must be non-zero".into(),
            ));
        }

        Ok(())
    }
}

/// Inclusive port range for `count` slots starting at `base`.
fn port_range(base: u16, count: u16, name: &str) -> BuffetResult<(u16, u16)> {
    let last = u32::from(base) + u32::from(count) - 1;
    u16::try_from(last)
        .map(|last| (base, last))
        .map_err(|_| BuffetError::Config(format!("{} {} + max_sessions exceeds 65535", name, base)))
}
