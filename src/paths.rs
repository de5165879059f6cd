//! Runtime path resolution for sockets, pid files and service logs.
//!
//! Follows FHS/XDG conventions based on execution context:
//! - Root/system service: `/run/tradewire/`
//! - User service: `$XDG_RUNTIME_DIR/tradewire/`
//! - Fallback: `/tmp/tradewire-<uid>/`
//!
//! Socket endpoints are named deterministically from the service name so any
//! peer can derive them without a discovery step.

use std::path::{Path, PathBuf};

/// Environment variable overriding the runtime directory (used by tests and
/// by the supervisor to isolate fleets).
pub const RUNTIME_DIR_ENV: &str = "TRADEWIRE_RUNTIME_DIR";

/// Get the runtime directory for the current execution context.
pub fn runtime_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(RUNTIME_DIR_ENV) {
        PathBuf::from(dir)
    } else if nix::unistd::geteuid().is_root() {
        PathBuf::from("/run/tradewire")
    } else if let Ok(xdg) = std::env::var("XDG_RUNTIME_DIR") {
        PathBuf::from(xdg).join("tradewire")
    } else {
        PathBuf::from(format!("/tmp/tradewire-{}", nix::unistd::getuid()))
    }
}

/// RPC socket for a named service: `<runtime_dir>/<name>.sock`.
pub fn service_socket(name: &str) -> PathBuf {
    runtime_dir().join(format!("{name}.sock"))
}

/// Event bus broker socket.
pub fn events_socket() -> PathBuf {
    runtime_dir().join("events.sock")
}

/// PID file for a named service.
pub fn service_pid_file(name: &str) -> PathBuf {
    runtime_dir().join(format!("{name}.pid"))
}

/// Directory holding captured stdout/stderr of supervised services.
pub fn logs_dir() -> PathBuf {
    runtime_dir().join("logs")
}

/// Log file for a named service.
pub fn service_log_file(name: &str) -> PathBuf {
    logs_dir().join(format!("{name}.log"))
}

/// Restrict a path to its owner.
///
/// Runtime directories get 0700, sockets 0600; only the owning OS principal
/// may connect.
#[cfg(unix)]
pub fn restrict_to_owner(path: &Path, is_dir: bool) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mode = if is_dir { 0o700 } else { 0o600 };
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

/// Ensure the runtime directory exists with owner-only permissions.
pub fn ensure_runtime_dir() -> std::io::Result<PathBuf> {
    let dir = runtime_dir();
    std::fs::create_dir_all(&dir)?;
    #[cfg(unix)]
    restrict_to_owner(&dir, true)?;
    Ok(dir)
}

/// Ensure the logs directory exists.
pub fn ensure_logs_dir() -> std::io::Result<PathBuf> {
    ensure_runtime_dir()?;
    let dir = logs_dir();
    std::fs::create_dir_all(&dir)?;
    #[cfg(unix)]
    restrict_to_owner(&dir, true)?;
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_paths_are_deterministic() {
        assert_eq!(service_socket("market-data"), service_socket("market-data"));
        assert!(service_socket("sentiment")
            .to_string_lossy()
            .ends_with("sentiment.sock"));
    }

    #[test]
    fn runtime_dir_mentions_crate() {
        // Only meaningful when the override env var is unset.
        if std::env::var(RUNTIME_DIR_ENV).is_err() {
            assert!(runtime_dir().to_string_lossy().contains("tradewire"));
        }
    }
}
