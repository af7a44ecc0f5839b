//! Settings file for the binary: logging, engine defaults, transport
//! listen address and the macro directory. Everything has a default so an
//! absent file is not an error for commands that can run without one.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::{ConfigError, Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub engine: EngineSettings,
    pub transport: TransportSettings,
    pub macros: MacroSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub format: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Macro-level timeout applied when a macro declares none.
    pub macro_timeout_secs: u64,
    /// Per-step timeout applied when a step carries no override.
    pub step_timeout_secs: u64,
    /// Polling interval for find/wait retries.
    pub retry_interval_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            macro_timeout_secs: crate::engine::DEFAULT_MACRO_TIMEOUT.as_secs(),
            step_timeout_secs: crate::engine::DEFAULT_STEP_TIMEOUT.as_secs(),
            retry_interval_ms: crate::engine::DEFAULT_RETRY_INTERVAL.as_millis() as u64,
        }
    }
}

impl EngineSettings {
    /// The executor-facing form of this section.
    pub fn defaults(&self) -> crate::engine::EngineDefaults {
        crate::engine::EngineDefaults {
            macro_timeout: Duration::from_secs(self.macro_timeout_secs),
            step_timeout: Duration::from_secs(self.step_timeout_secs),
            retry_interval: Duration::from_millis(self.retry_interval_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Listen address for `serve` (format: "host:port").
    pub listen: String,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:9170".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MacroSettings {
    /// Root directory scanned recursively for macro documents.
    pub directory: PathBuf,
}

impl Default for MacroSettings {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("macros"),
        }
    }
}

impl Settings {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::Config(ConfigError::FileNotFound {
                path: path.display().to_string(),
            }));
        }
        let content = std::fs::read_to_string(path)?;
        let settings: Settings =
            toml::from_str(&content).map_err(ConfigError::ParseError)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        validate_listen_address(&self.transport.listen)?;
        validate_positive(self.engine.macro_timeout_secs, "engine.macro_timeout_secs")?;
        validate_positive(self.engine.step_timeout_secs, "engine.step_timeout_secs")?;
        validate_positive(self.engine.retry_interval_ms, "engine.retry_interval_ms")?;
        validate_log_level(&self.logging.level)?;
        validate_log_format(&self.logging.format)?;
        Ok(())
    }
}

fn invalid(field: &str, message: String) -> Error {
    Error::Config(ConfigError::Invalid {
        field: field.to_string(),
        message,
    })
}

fn validate_listen_address(addr: &str) -> Result<()> {
    addr.parse::<SocketAddr>().map_err(|_| {
        invalid(
            "transport.listen",
            format!(
                "invalid listen address '{}'. Expected 'host:port' (e.g. '127.0.0.1:9170')",
                addr
            ),
        )
    })?;
    Ok(())
}

fn validate_positive(value: u64, field: &str) -> Result<()> {
    if value == 0 {
        return Err(invalid(field, "must be greater than zero".to_string()));
    }
    Ok(())
}

fn validate_log_level(level: &str) -> Result<()> {
    match level {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        other => Err(invalid(
            "logging.level",
            format!("unknown level '{}' (valid: trace, debug, info, warn, error)", other),
        )),
    }
}

fn validate_log_format(format: &str) -> Result<()> {
    match format {
        "json" | "pretty" => Ok(()),
        other => Err(invalid(
            "logging.format",
            format!("unknown format '{}' (valid: json, pretty)", other),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn create_temp_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_settings_complete() {
        let settings_toml = r#"
[logging]
level = "debug"
format = "json"

[engine]
macro_timeout_secs = 300
step_timeout_secs = 30
retry_interval_ms = 250

[transport]
listen = "0.0.0.0:4100"

[macros]
directory = "/opt/flows"
        "#;

        let settings: Settings = toml::from_str(settings_toml).unwrap();
        assert_eq!(settings.logging.level, "debug");
        assert_eq!(settings.logging.format, "json");
        assert_eq!(settings.engine.macro_timeout_secs, 300);
        assert_eq!(settings.engine.step_timeout_secs, 30);
        assert_eq!(settings.engine.retry_interval_ms, 250);
        assert_eq!(settings.transport.listen, "0.0.0.0:4100");
        assert_eq!(settings.macros.directory, PathBuf::from("/opt/flows"));
        settings.validate().unwrap();
    }

    #[test]
    fn test_settings_minimal_uses_defaults() {
        let settings: Settings = toml::from_str("").unwrap();
        assert_eq!(settings.logging.level, "info");
        assert_eq!(settings.logging.format, "pretty");
        assert_eq!(settings.engine.macro_timeout_secs, 120);
        assert_eq!(settings.engine.step_timeout_secs, 15);
        assert_eq!(settings.engine.retry_interval_ms, 500);
        assert_eq!(settings.transport.listen, "127.0.0.1:9170");
        settings.validate().unwrap();
    }

    #[test]
    fn test_engine_section_maps_to_executor_defaults() {
        let settings: Settings = toml::from_str(
            "[engine]\nmacro_timeout_secs = 300\nstep_timeout_secs = 30\nretry_interval_ms = 250\n",
        )
        .unwrap();
        let defaults = settings.engine.defaults();
        assert_eq!(defaults.macro_timeout, Duration::from_secs(300));
        assert_eq!(defaults.step_timeout, Duration::from_secs(30));
        assert_eq!(defaults.retry_interval, Duration::from_millis(250));
    }

    #[test]
    fn test_load_from_file() {
        let file = create_temp_file("[transport]\nlisten = \"127.0.0.1:4200\"\n");
        let settings = Settings::load_from_file(file.path()).unwrap();
        assert_eq!(settings.transport.listen, "127.0.0.1:4200");
    }

    #[test]
    fn test_missing_file_is_not_found() {
        let err = Settings::load_from_file(Path::new("/nonexistent/macroflow.toml")).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_bad_listen_address_rejected() {
        let settings: Settings =
            toml::from_str("[transport]\nlisten = \"not-an-address\"\n").unwrap();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("transport.listen"));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let settings: Settings =
            toml::from_str("[engine]\nstep_timeout_secs = 0\n").unwrap();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("engine.step_timeout_secs"));
    }

    #[test]
    fn test_unknown_log_level_rejected() {
        let settings: Settings = toml::from_str("[logging]\nlevel = \"loud\"\n").unwrap();
        let err = settings.validate().unwrap_err();
        assert!(err.to_string().contains("logging.level"));
    }
}
