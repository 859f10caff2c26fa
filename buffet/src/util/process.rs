//! Process signalling and PID verification.

use buffet_shared::errors::{BuffetError, BuffetResult};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

/// What a termination signal actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    /// SIGTERM was delivered.
    Signalled,
    /// No such process; nothing to do.
    AlreadyGone,
}

/// Convert a stored PID into a signal target.
///
/// PID 0 and values above `i32::MAX` would address process groups in
/// `kill(2)`, so they are rejected outright.
fn signal_target(pid: u32) -> BuffetResult<Pid> {
    if pid == 0 || pid > i32::MAX as u32 {
        return Err(BuffetError::InvalidArgument(format!(
            "refusing to signal pid {}",
            pid
        )));
    }
    Ok(Pid::from_raw(pid as i32))
}

/// Send SIGTERM without waiting for the process to exit.
///
/// A process that no longer exists is reported as [`SignalOutcome::AlreadyGone`],
/// not as an error.
pub fn terminate_process(pid: u32) -> BuffetResult<SignalOutcome> {
    let target = signal_target(pid)?;
    match kill(target, Signal::SIGTERM) {
        Ok(()) => Ok(SignalOutcome::Signalled),
        Err(Errno::ESRCH) => Ok(SignalOutcome::AlreadyGone),
        Err(errno) => Err(BuffetError::Internal(format!(
            "failed to signal pid {}: {}",
            pid, errno
        ))),
    }
}

/// Check if a process with the given PID exists.
///
/// Uses a null signal, so no process is disturbed.
pub fn is_process_alive(pid: u32) -> bool {
    match signal_target(pid) {
        Ok(target) => kill(target, None).is_ok(),
        Err(_) => false,
    }
}

/// Verify that `pid` still runs a binary whose name contains `marker`.
///
/// Guards pid-only termination against the kernel recycling a PID for an
/// unrelated process after a restart.
///
/// * **Linux**: inspect `argv[0]` and `argv[1]` from `/proc/{pid}/cmdline`
/// * **macOS**: use `sysinfo` to read the process name
pub fn is_same_process(pid: u32, marker: &str) -> bool {
    #[cfg(target_os = "linux")]
    {
        is_same_process_linux(pid, marker)
    }

    #[cfg(target_os = "macos")]
    {
        is_same_process_macos(pid, marker)
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        let _ = marker;
        is_process_alive(pid)
    }
}

#[cfg(target_os = "linux")]
fn is_same_process_linux(pid: u32, marker: &str) -> bool {
    let cmdline_path = format!("/proc/{}/cmdline", pid);

    match std::fs::read_to_string(&cmdline_path) {
        // argv[1] covers scripts run through an interpreter (python3 websockify ...)
        Ok(cmdline) => cmdline.split('\0').take(2).any(|arg| {
            std::path::Path::new(arg)
                .file_name()
                .map(|name| name.to_string_lossy().contains(marker))
                .unwrap_or(false)
        }),
        Err(_) => false,
    }
}

#[cfg(target_os = "macos")]
fn is_same_process_macos(pid: u32, marker: &str) -> bool {
    use sysinfo::{Pid as SysPid, System};

    let mut sys = System::new();
    let pid_obj = SysPid::from_u32(pid);
    sys.refresh_process(pid_obj);

    sys.process(pid_obj)
        .map(|process| process.name().contains(marker))
        .unwrap_or(false)
}
