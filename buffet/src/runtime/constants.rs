//! Constants for the buffet runtime
//!
//! Centralized location for file names and defaults that are not user
//! configurable.

pub use buffet_shared::constants::{envs, ports, session};

/// File naming patterns
pub mod filenames {
    /// Lock file name
    pub const LOCK_FILE: &str = ".lock";

    /// SQLite database holding the session registry
    pub const DB_FILE: &str = "buffet.db";

    /// Image catalogue inside the images directory
    pub const CATALOGUE_INDEX: &str = "index.json";

    /// Logo used when an image has none of its own
    pub const UNKNOWN_LOGO: &str = "unknown.png";

    /// Runtime log file prefix (daily rotation appends the date)
    pub const RUNTIME_LOG: &str = "buffet.log";

    /// QMP control socket for the hypervisor holding a slot.
    pub fn control_socket(slot: u16) -> String {
        format!("qmp-{}.sock", slot)
    }
}

/// Hypervisor defaults that are not exposed as options
pub mod hypervisor {
    /// Network device id shared by `-netdev` and the capture filter
    pub const NETDEV_ID: &str = "net0";

    /// Capture filter id
    pub const CAPTURE_FILTER_ID: &str = "f1";

    /// Longest unix socket path QEMU can bind (`sun_path` minus the NUL)
    pub const SOCKET_PATH_MAX: usize = 107;
}
