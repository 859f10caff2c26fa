//! QEMU command line construction.

use std::path::Path;

use super::host_check::Accelerator;
use crate::runtime::constants::hypervisor::{CAPTURE_FILTER_ID, NETDEV_ID};

/// Binary name for a guest architecture, e.g. `qemu-system-x86_64`.
pub fn hypervisor_binary(prefix: &str, architecture: &str) -> String {
    format!("{}{}", prefix, architecture)
}

/// Inputs for one hypervisor command line.
#[derive(Debug, Clone)]
pub struct QemuArgs<'a> {
    pub architecture: &'a str,
    pub memory_mib: u32,
    pub cpus: u8,
    pub accelerator: Accelerator,
    pub image_path: &'a Path,
    /// Address the VNC server binds.
    pub display_address: &'a str,
    /// VNC display number, port minus 5900.
    pub display_number: u16,
    /// Require a VNC password, set later over QMP.
    pub display_password: bool,
    pub control_socket: &'a Path,
    pub traffic_log: &'a Path,
}

impl QemuArgs<'_> {
    pub fn build(&self) -> Vec<String> {
        let mut args: Vec<String> = Vec::with_capacity(32);
        let mut push = |flag: &str, value: String| {
            args.push(flag.to_string());
            args.push(value);
        };

        if !is_pc_architecture(self.architecture) {
            push("-machine", "virt".into());
        }
        push("-m", format!("{}M", self.memory_mib));
        push("-accel", self.accelerator.as_str().into());
        // "host" passthrough needs a hardware accelerator
        let cpu = if self.accelerator.is_hardware() {
            "host"
        } else {
            "max"
        };
        push("-cpu", cpu.into());
        push("-smp", self.cpus.to_string());
        push("-device", "virtio-balloon".into());
        push("-cdrom", self.image_path.to_string_lossy().into_owned());

        if is_pc_architecture(self.architecture) {
            push("-vga", "virtio".into());
        } else {
            push("-device", "virtio-gpu-pci".into());
        }

        push("-netdev", format!("user,id={}", NETDEV_ID));
        push("-device", format!("virtio-net,netdev={}", NETDEV_ID));
        push(
            "-object",
            format!(
                "filter-dump,id={},netdev={},file={}",
                CAPTURE_FILTER_ID,
                NETDEV_ID,
                escape_option_value(self.traffic_log)
            ),
        );

        let mut vnc = format!("{}:{}", self.display_address, self.display_number);
        if self.display_password {
            vnc.push_str(",password=on");
        }
        push("-vnc", vnc);
        push(
            "-qmp",
            format!(
                "unix:{},server=on,wait=off",
                escape_option_value(self.control_socket)
            ),
        );

        args
    }
}

fn is_pc_architecture(architecture: &str) -> bool {
    matches!(architecture, "x86_64" | "i386")
}

/// QEMU option values separate keys with commas; a literal comma is doubled.
fn escape_option_value(path: &Path) -> String {
    path.to_string_lossy().replace(',', ",,")
}
