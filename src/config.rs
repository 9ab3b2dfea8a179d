//! Configuration management module
//!
//! Settings are read from a TOML file at:
//! - macOS/Linux: ~/.config/hexpat/config.toml
//! - Windows: %APPDATA%\hexpat\config.toml
//!
//! Every section is optional; missing keys take their defaults.

use anyhow::{Context, Result};
use pattern_lang::OrchestratorConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// `tracing` filter directive, used when `RUST_LOG` is not set
    pub filter: String,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            filter: "warn".to_string(),
        }
    }
}

/// Host settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub log: LogSettings,
    /// Worker pool, debounce and the limits every run starts from
    pub orchestrator: OrchestratorConfig,
}

impl Settings {
    /// Get the configuration file path
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("hexpat").join("config.toml"))
    }

    /// Load the default settings file. A missing file yields the defaults;
    /// an unreadable or malformed one is an error the caller may recover from.
    pub fn load() -> Result<Self> {
        match Self::config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut settings: Settings = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        settings.validate();
        Ok(settings)
    }

    /// Validate and fix invalid setting values
    fn validate(&mut self) {
        let defaults = OrchestratorConfig::default();
        let orchestrator = &mut self.orchestrator;

        // Zero or out-of-range limits fall back to the defaults
        orchestrator.validate();

        // Quiet period: at most one minute
        if orchestrator.debounce_ms > 60_000 {
            orchestrator.debounce_ms = defaults.debounce_ms;
        }

        // Worker pool: 1-64 threads
        if orchestrator.worker_threads > 64 {
            orchestrator.worker_threads = defaults.worker_threads;
        }

        if self.log.filter.trim().is_empty() {
            self.log.filter = LogSettings::default().filter;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pattern_lang::DangerousPolicy;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn parse(text: &str) -> Settings {
        let mut settings: Settings = toml::from_str(text).unwrap();
        settings.validate();
        settings
    }

    #[test]
    fn test_empty_file_gives_defaults() {
        let settings = parse("");
        assert_eq!(settings.log.filter, "warn");
        assert_eq!(settings.orchestrator, OrchestratorConfig::default());
    }

    #[test]
    fn test_nested_sections() {
        let settings = parse(
            r#"
            [log]
            filter = "pattern_lang=debug"

            [orchestrator]
            auto_evaluate = true
            worker_threads = 4

            [orchestrator.runtime]
            pattern_limit = 100000
            dangerous_functions = "deny"
            include_paths = ["/usr/share/hexpat/includes"]
            "#,
        );
        assert_eq!(settings.log.filter, "pattern_lang=debug");
        assert!(settings.orchestrator.auto_evaluate);
        assert_eq!(settings.orchestrator.worker_threads, 4);
        assert_eq!(settings.orchestrator.debounce_ms, 1000);
        let runtime = &settings.orchestrator.runtime;
        assert_eq!(runtime.pattern_limit, 100_000);
        assert_eq!(runtime.dangerous_functions, DangerousPolicy::Deny);
        assert_eq!(runtime.include_paths.len(), 1);
        assert_eq!(runtime.loop_limit, 0x1000);
    }

    #[test]
    fn test_out_of_range_values_are_clamped() {
        let settings = parse(
            r#"
            [log]
            filter = "  "

            [orchestrator]
            worker_threads = 0
            debounce_ms = 999999

            [orchestrator.runtime]
            eval_depth = 0
            pattern_limit = 99999999999
            "#,
        );
        assert_eq!(settings.log.filter, "warn");
        assert_eq!(settings.orchestrator.worker_threads, 1);
        assert_eq!(settings.orchestrator.debounce_ms, 1000);
        assert_eq!(settings.orchestrator.runtime.eval_depth, 32);
        assert_eq!(settings.orchestrator.runtime.pattern_limit, 0x2000);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "[orchestrator\nworker_threads = ").unwrap();
        assert!(Settings::load_from(file.path()).is_err());
    }
}
