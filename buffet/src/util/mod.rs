pub mod process;

use std::path::PathBuf;

use buffet_shared::errors::{BuffetError, BuffetResult};
use tracing_appender::non_blocking::NonBlocking;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Resolve an external binary (e.g., "qemu-system-x86_64" or "websockify").
///
/// Bare names are looked up on `PATH`; names with a path separator are
/// checked as given. Either way the result must be an executable file.
pub fn find_binary(binary_name: &str) -> BuffetResult<PathBuf> {
    let found = which::which(binary_name).map_err(|e| {
        BuffetError::LaunchFailed(format!("binary '{}' not found: {}", binary_name, e))
    })?;
    tracing::debug!(binary = %found.display(), "Found binary");
    Ok(found)
}

pub fn register_to_tracing(non_blocking: NonBlocking, env_filter: EnvFilter) {
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(false),
        )
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_binary_on_path() {
        // `sh` exists on every unix host the runtime supports
        let found = find_binary("sh").unwrap();
        assert!(found.ends_with("sh"));
    }

    #[test]
    fn test_find_binary_missing_names_the_binary() {
        let err = find_binary("buffet-no-such-binary").unwrap_err();
        assert!(matches!(err, BuffetError::LaunchFailed(_)));
        assert!(err.to_string().contains("buffet-no-such-binary"));
    }

    #[test]
    fn test_find_binary_explicit_path() {
        assert!(find_binary("/bin/sh").is_ok());
        assert!(matches!(
            find_binary("/nonexistent/qemu-system-x86_64"),
            Err(BuffetError::LaunchFailed(_))
        ));
    }

    #[test]
    fn test_find_binary_requires_executable_bit() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let script = dir.path().join("websockify");
        std::fs::write(&script, "#!/bin/sh\nexit 0\n").unwrap();

        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o644)).unwrap();
        assert!(matches!(
            find_binary(script.to_str().unwrap()),
            Err(BuffetError::LaunchFailed(_))
        ));

        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert_eq!(find_binary(script.to_str().unwrap()).unwrap(), script);
    }
}
