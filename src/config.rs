//! Layered settings for the supervisor binary.
//!
//! Resolution order: built-in defaults, then an optional `tradewire.toml`,
//! then `TRADEWIRE_*` environment variables. Fleet contents themselves live
//! in the fleet file ([`crate::supervisor::FleetConfig`]); this layer only
//! locates it and carries process-level knobs.

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Default settings file name, looked up in the working directory.
pub const SETTINGS_FILE: &str = "tradewire.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Path to the fleet declaration file.
    pub fleet: PathBuf,

    /// Override for the runtime directory (sockets, pid files, logs).
    /// Defaults to the FHS/XDG resolution in [`crate::paths`].
    #[serde(default)]
    pub runtime_dir: Option<PathBuf>,

    /// Default tracing filter when `RUST_LOG` is unset.
    pub log_filter: String,
}

impl Settings {
    /// Load settings, layering the given (or default) TOML file and the
    /// `TRADEWIRE_` environment over the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("fleet", "fleet.toml")?
            .set_default("log_filter", "info")?;

        builder = match path {
            Some(path) => builder.add_source(File::from(path)),
            None => builder.add_source(
                File::new(SETTINGS_FILE, FileFormat::Toml).required(false),
            ),
        };

        builder
            .add_source(Environment::with_prefix("TRADEWIRE"))
            .build()?
            .try_deserialize()
    }

    /// Export the runtime-dir override so every path computation in this
    /// process and its children agrees.
    pub fn apply_runtime_dir(&self) {
        if let Some(dir) = &self.runtime_dir {
            std::env::set_var(crate::paths::RUNTIME_DIR_ENV, dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_apply_without_a_file() {
        let settings = Settings::load(Some(Path::new("/nonexistent/none.toml")));
        // A named-but-missing file is an error; the default lookup is not.
        assert!(settings.is_err());

        let settings = Settings::load(None).unwrap();
        assert_eq!(settings.fleet, PathBuf::from("fleet.toml"));
        assert_eq!(settings.log_filter, "info");
        assert!(settings.runtime_dir.is_none());
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "fleet = \"/etc/tradewire/fleet.toml\"").unwrap();
        writeln!(file, "log_filter = \"debug\"").unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.fleet, PathBuf::from("/etc/tradewire/fleet.toml"));
        assert_eq!(settings.log_filter, "debug");
    }
}
