//! Shared constants between the runtime, CLI and tests.
//!
//! Defaults here back `BuffetOptions`; the CLI reads the env var names.

/// Port layout constants
pub mod ports {
    /// First hypervisor display port. VNC display `:N` listens on `5900 + N`.
    pub const VNC_DISPLAY_BASE: u16 = 5900;

    /// Default base for hypervisor display ports (slot 0 = 5900).
    pub const DEFAULT_VM_PORT_BASE: u16 = 5900;

    /// Default base for public proxy ports (slot 0 = 5700).
    pub const DEFAULT_PROXY_PORT_BASE: u16 = 5700;
}

/// Session defaults
pub mod session {
    /// Default size of the slot pool.
    pub const DEFAULT_MAX_SESSIONS: u16 = 6;

    /// Default guest memory in MiB.
    pub const DEFAULT_MEMORY_MIB: u32 = 2048;

    /// Default guest vCPU count.
    pub const DEFAULT_CPUS: u8 = 2;

    /// Length of the generated display credential.
    pub const CREDENTIAL_LENGTH: usize = 16;

    /// Alphabet the display credential is drawn from.
    pub const CREDENTIAL_ALPHABET: &[u8] =
        b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789!@#$%^&*()";
}

/// Environment variables
pub mod envs {
    /// Overrides the default home directory (`~/.buffet`).
    pub const BUFFET_HOME: &str = "BUFFET_HOME";

    /// Path to a TOML options file.
    pub const BUFFET_CONFIG: &str = "BUFFET_CONFIG";
}
