//! Host capability detection for hypervisor launches.
//!
//! Decides which QEMU accelerator an image gets on this host (KVM on Linux,
//! Hypervisor.framework on macOS, TCG everywhere) and whether the VNC
//! server can be password protected.

use buffet_shared::errors::{BuffetError, BuffetResult};
use serde::{Deserialize, Serialize};

use crate::catalogue::AcceleratorHint;

/// QEMU accelerator backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Accelerator {
    Kvm,
    Hvf,
    /// Software emulation.
    Tcg,
}

impl Accelerator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Accelerator::Kvm => "kvm",
            Accelerator::Hvf => "hvf",
            Accelerator::Tcg => "tcg",
        }
    }

    pub fn is_hardware(&self) -> bool {
        !matches!(self, Accelerator::Tcg)
    }
}

impl std::fmt::Display for Accelerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the host offers a new hypervisor process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPlatform {
    /// `std::env::consts::ARCH` of the host.
    pub arch: String,
    /// Usable hardware accelerator, if any.
    pub hardware_accelerator: Option<Accelerator>,
    /// Whether QEMU's VNC server will accept a password on this host.
    pub display_credential: bool,
}

impl HostPlatform {
    /// Inspect the running host.
    pub fn detect() -> Self {
        let hardware_accelerator = match check_hardware_accelerator() {
            Ok(accel) => Some(accel),
            Err(e) => {
                tracing::info!("Hardware acceleration unavailable, using TCG: {}", e);
                None
            }
        };

        let display_credential = !fips_mode_enabled();
        if !display_credential {
            tracing::warn!("FIPS mode is enabled; VNC sessions will run without a password");
        }

        Self {
            arch: std::env::consts::ARCH.to_string(),
            hardware_accelerator,
            display_credential,
        }
    }

    /// Pick the accelerator for a guest of `guest_arch`.
    ///
    /// Hardware acceleration applies only when it is enabled, available,
    /// and the guest architecture matches the host. An image marked
    /// [`AcceleratorHint::Native`] fails rather than falling back to TCG.
    pub fn select_accelerator(
        &self,
        guest_arch: &str,
        hint: AcceleratorHint,
        hardware_enabled: bool,
    ) -> BuffetResult<Accelerator> {
        let native = match (hardware_enabled, self.hardware_accelerator) {
            (true, Some(accel)) if guest_arch == self.arch => Some(accel),
            _ => None,
        };

        match (hint, native) {
            (AcceleratorHint::Software, _) => Ok(Accelerator::Tcg),
            (AcceleratorHint::Auto, Some(accel)) => Ok(accel),
            (AcceleratorHint::Auto, None) => Ok(Accelerator::Tcg),
            (AcceleratorHint::Native, Some(accel)) => Ok(accel),
            (AcceleratorHint::Native, None) => Err(BuffetError::LaunchFailed(format!(
                "image requires hardware acceleration for {} guests, unavailable on this {} host",
                guest_arch, self.arch
            ))),
        }
    }
}

/// Detect the hardware accelerator QEMU can use on this host.
pub fn check_hardware_accelerator() -> BuffetResult<Accelerator> {
    #[cfg(target_os = "linux")]
    {
        check_linux_kvm()
    }

    #[cfg(target_os = "macos")]
    {
        check_macos_hvf()
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        Err(BuffetError::Unsupported(
            "hardware acceleration is only detected on Linux and macOS".into(),
        ))
    }
}

/// `/dev/kvm` must exist and be openable read-write by this user.
#[cfg(target_os = "linux")]
fn check_linux_kvm() -> BuffetResult<Accelerator> {
    const KVM_DEVICE: &str = "/dev/kvm";

    match std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(KVM_DEVICE)
    {
        Ok(_) => Ok(Accelerator::Kvm),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(BuffetError::Unsupported(format!(
                "{} does not exist\n\n\
                 Suggestions:\n\
                 - Enable VT-x/AMD-V in your BIOS/UEFI settings\n\
                 - Check if kvm module is loaded: lsmod | grep kvm",
                KVM_DEVICE
            )))
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            Err(BuffetError::Unsupported(format!(
                "{} exists but access denied (permissions)\n\n\
                 Suggestions:\n\
                 - Add the service user to the kvm group: sudo usermod -aG kvm $USER",
                KVM_DEVICE
            )))
        }
        Err(e) => Err(BuffetError::Unsupported(format!(
            "{} exists but couldn't be accessed: {}",
            KVM_DEVICE, e
        ))),
    }
}

/// Query Hypervisor.framework availability via `sysctl kern.hv_support`.
#[cfg(target_os = "macos")]
fn check_macos_hvf() -> BuffetResult<Accelerator> {
    let output = std::process::Command::new("sysctl")
        .arg("kern.hv_support")
        .output()
        .map_err(|e| {
            BuffetError::Unsupported(format!(
                "Failed to check Hypervisor.framework support: {}",
                e
            ))
        })?;

    // "kern.hv_support: 1" or "kern.hv_support: 0"
    let stdout = String::from_utf8_lossy(&output.stdout);
    let value = stdout.split(':').nth(1).map(|s| s.trim()).unwrap_or("0");

    if output.status.success() && value == "1" {
        Ok(Accelerator::Hvf)
    } else {
        Err(BuffetError::Unsupported(
            "Hypervisor.framework is not available".to_string(),
        ))
    }
}

/// QEMU disables VNC password authentication in FIPS mode.
fn fips_mode_enabled() -> bool {
    #[cfg(target_os = "linux")]
    {
        std::fs::read_to_string("/proc/sys/crypto/fips_enabled")
            .map(|v| v.trim() == "1")
            .unwrap_or(false)
    }

    #[cfg(not(target_os = "linux"))]
    {
        false
    }
}
