//! Host process supervisor: forks QEMU and websockify.

use std::fs::File;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use buffet_shared::errors::{BuffetError, BuffetResult};

use super::handle::{ManagedProcess, ProcessKind};
use super::host_check::HostPlatform;
use super::qemu::{QemuArgs, hypervisor_binary};
use super::websockify::ProxyArgs;
use super::{
    HypervisorCapabilities, HypervisorLaunch, LaunchedHypervisor, ProcessSupervisor, ProxyLaunch,
};
use crate::runtime::layout::FilesystemLayout;
use crate::runtime::options::BuffetOptions;
use crate::runtime::types::SessionId;
use crate::util::find_binary;
use crate::util::process::{SignalOutcome, is_same_process, terminate_process};

/// Lines of process output quoted in a startup failure.
const FAILURE_LOG_TAIL: usize = 20;

/// Supervisor that runs real processes on this host.
#[derive(Debug, Clone)]
pub struct HostSupervisor {
    options: BuffetOptions,
    layout: FilesystemLayout,
    host: HostPlatform,
}

impl HostSupervisor {
    pub fn new(options: &BuffetOptions) -> Self {
        Self::with_host(options, HostPlatform::detect())
    }

    pub fn with_host(options: &BuffetOptions, host: HostPlatform) -> Self {
        Self {
            options: options.clone(),
            layout: options.layout(),
            host,
        }
    }

    pub fn host(&self) -> &HostPlatform {
        &self.host
    }

    /// Name fragment expected in the command line of a process of `kind`.
    fn process_marker(&self, kind: ProcessKind) -> String {
        let configured = match kind {
            ProcessKind::Hypervisor => &self.options.hypervisor_binary_prefix,
            ProcessKind::Proxy => &self.options.proxy_binary,
        };
        Path::new(configured)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| configured.clone())
    }

    async fn spawn(
        &self,
        kind: ProcessKind,
        session_id: &SessionId,
        binary_name: &str,
        args: Vec<String>,
    ) -> BuffetResult<ManagedProcess> {
        let binary = find_binary(binary_name)?;
        let log_path = self.layout.process_log(session_id.as_str(), kind.as_str());
        let (stdout, stderr) = open_process_log(&log_path)?;

        tracing::debug!(
            session_id = %session_id,
            kind = %kind,
            binary = %binary.display(),
            args = ?args,
            "Spawning process"
        );

        let mut child = tokio::process::Command::new(&binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            // Own process group, so the session outlives a CLI interrupted with Ctrl-C
            .process_group(0)
            .spawn()
            .map_err(|e| {
                BuffetError::LaunchFailed(format!(
                    "failed to spawn {} {}: {}",
                    kind,
                    binary.display(),
                    e
                ))
            })?;

        settle(&mut child, kind, self.options.launch_settle(), &log_path).await?;

        let process = ManagedProcess::from_child(child, kind).ok_or_else(|| {
            BuffetError::LaunchFailed(format!("{} exited before reporting a pid", kind))
        })?;

        tracing::info!(
            session_id = %session_id,
            kind = %kind,
            pid = process.pid(),
            "Process started"
        );
        Ok(process)
    }
}

#[async_trait]
impl ProcessSupervisor for HostSupervisor {
    async fn start_hypervisor(
        &self,
        launch: &HypervisorLaunch,
    ) -> BuffetResult<LaunchedHypervisor> {
        let image = &launch.image;
        let image_path = self.layout.image_path(image.image_ref());
        if !image_path.is_file() {
            return Err(BuffetError::LaunchFailed(format!(
                "boot image not found: {}",
                image_path.display()
            )));
        }

        let accelerator = self.host.select_accelerator(
            &image.architecture,
            image.accelerator,
            self.options.hardware_acceleration,
        )?;

        if let Some(parent) = launch.traffic_log.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                BuffetError::Storage(format!(
                    "failed to create capture dir {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }
        remove_stale_socket(&launch.control_socket)?;

        let args = QemuArgs {
            architecture: &image.architecture,
            memory_mib: self.options.memory_mib,
            cpus: self.options.cpus,
            accelerator,
            image_path: &image_path,
            display_address: &self.options.display_address,
            display_number: launch.ports.display_number,
            display_password: self.host.display_credential,
            control_socket: &launch.control_socket,
            traffic_log: &launch.traffic_log,
        }
        .build();

        let binary = hypervisor_binary(&self.options.hypervisor_binary_prefix, &image.architecture);
        let process = self
            .spawn(ProcessKind::Hypervisor, &launch.session_id, &binary, args)
            .await?;

        Ok(LaunchedHypervisor {
            process,
            capabilities: HypervisorCapabilities {
                display_credential: self.host.display_credential,
                accelerator,
            },
        })
    }

    async fn start_proxy(&self, launch: &ProxyLaunch) -> BuffetResult<ManagedProcess> {
        let args = ProxyArgs {
            listen_address: &self.options.proxy_listen_address,
            public_port: launch.ports.public_port,
            display_address: &self.options.display_address,
            display_port: launch.ports.display_port,
            tls: self.options.tls.as_ref(),
        }
        .build();

        self.spawn(
            ProcessKind::Proxy,
            &launch.session_id,
            &self.options.proxy_binary,
            args,
        )
        .await
    }

    async fn terminate(&self, mut process: ManagedProcess) -> BuffetResult<SignalOutcome> {
        let pid = process.pid();
        let kind = process.kind();

        let outcome = match process.take_child() {
            Some(mut child) => {
                if let Ok(Some(status)) = child.try_wait() {
                    tracing::debug!(pid, kind = %kind, %status, "Process already exited");
                    return Ok(SignalOutcome::AlreadyGone);
                }
                let outcome = terminate_process(pid)?;
                // Reap in the background so the caller never waits on the guest
                tokio::spawn(async move {
                    match child.wait().await {
                        Ok(status) => tracing::debug!(pid, %status, "Process reaped"),
                        Err(e) => tracing::warn!(pid, "Failed to reap process: {}", e),
                    }
                });
                outcome
            }
            None => {
                let marker = self.process_marker(kind);
                if !is_same_process(pid, &marker) {
                    tracing::debug!(
                        pid,
                        kind = %kind,
                        "Recorded pid no longer runs {}, skipping signal",
                        marker
                    );
                    return Ok(SignalOutcome::AlreadyGone);
                }
                terminate_process(pid)?
            }
        };

        tracing::info!(pid, kind = %kind, outcome = ?outcome, "Process terminated");
        Ok(outcome)
    }
}

fn open_process_log(path: &Path) -> BuffetResult<(File, File)> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let stdout = File::create(path).map_err(|e| {
        BuffetError::Storage(format!(
            "failed to create process log {}: {}",
            path.display(),
            e
        ))
    })?;
    let stderr = stdout.try_clone()?;
    Ok((stdout, stderr))
}

/// A UNIX socket left behind by a crashed hypervisor blocks the new bind.
fn remove_stale_socket(path: &Path) -> BuffetResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            tracing::debug!(socket = %path.display(), "Removed stale control socket");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(BuffetError::Storage(format!(
            "failed to remove stale socket {}: {}",
            path.display(),
            e
        ))),
    }
}

/// Fail when the child exits within the settle window.
async fn settle(
    child: &mut tokio::process::Child,
    kind: ProcessKind,
    window: Duration,
    log_path: &Path,
) -> BuffetResult<()> {
    tokio::time::sleep(window).await;
    match child.try_wait() {
        Ok(None) => Ok(()),
        Ok(Some(status)) => Err(BuffetError::LaunchFailed(format!(
            "{} exited during startup ({})\n{}",
            kind,
            status,
            log_tail(log_path)
        ))),
        Err(e) => Err(BuffetError::LaunchFailed(format!(
            "failed to poll {}: {}",
            kind, e
        ))),
    }
}

fn log_tail(path: &Path) -> String {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return format!("(no output captured in {})", path.display());
    };
    let lines: Vec<&str> = contents.lines().collect();
    let start = lines.len().saturating_sub(FAILURE_LOG_TAIL);
    lines[start..].join("\n")
}
