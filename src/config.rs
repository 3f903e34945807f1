//! Layered settings: built-in defaults, then an optional TOML file, then
//! `VANTAGE__SECTION__KEY` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::Result;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub session: SessionConfig,
    pub store: StoreConfig,
    pub server: ServerConfig,
}

/// Identity and round-trip behaviour of a publishing session.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub program_name: String,
    pub program_version: String,
    pub title: String,
    pub node_id: String,
    pub timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            program_name: env!("CARGO_PKG_NAME").to_string(),
            program_version: env!("CARGO_PKG_VERSION").to_string(),
            title: String::new(),
            node_id: std::env::var("HOSTNAME")
                .ok()
                .filter(|h| !h.is_empty())
                .unwrap_or_else(|| "localhost".to_string()),
            timeout_ms: 5000,
        }
    }
}

impl SessionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Where the observation store lives; no path keeps it in memory.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { bind: "127.0.0.1:7650".to_string() }
    }
}

impl Settings {
    pub fn load(path: Option<&Path>) -> Result<Settings> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                Environment::with_prefix("VANTAGE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_without_sources() {
        let settings = Settings::default();
        assert_eq!(settings.session.timeout(), Duration::from_millis(5000));
        assert!(settings.store.path.is_none());
        assert_eq!(settings.server.bind, "127.0.0.1:7650");
        assert!(!settings.session.node_id.is_empty());
    }

    #[test]
    fn file_overrides_defaults() {
        let path = std::env::temp_dir().join(format!("vantage-settings-{}.toml", std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "[session]\ntitle = \"bench rig\"\ntimeout_ms = 250\n\n[store]\npath = \"obs.db\"\n"
        )
        .unwrap();
        drop(file);
        let settings = Settings::load(Some(&path)).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(settings.session.title, "bench rig");
        assert_eq!(settings.session.timeout_ms, 250);
        assert_eq!(settings.store.path, Some(PathBuf::from("obs.db")));
        // untouched sections keep their defaults
        assert_eq!(settings.server.bind, "127.0.0.1:7650");
    }

    #[test]
    fn missing_file_is_an_error() {
        let path = Path::new("/definitely/not/here/vantage.toml");
        assert!(matches!(
            Settings::load(Some(path)),
            Err(crate::error::VantageError::Config(_))
        ));
    }
}
