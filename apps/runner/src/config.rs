// SPDX-FileCopyrightText: © 2025 BatchKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

use batchkit_core::FrameParameters;
use batchkit_engine::EngineConfig;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::Level;

/// Log level for filtering messages.
#[derive(Deserialize, Serialize, Debug, Clone, Default, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

/// Log file format options.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration for console and file output.
///
/// Console logs go to stderr; stdout carries the sink output.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct LogConfig {
    #[serde(default)]
    pub console_enable: bool,
    #[serde(default)]
    pub file_enable: bool,
    #[serde(default)]
    pub console_level: LogLevel,
    #[serde(default)]
    pub file_level: LogLevel,
    #[serde(default)]
    pub file_path: String,
    #[serde(default)]
    pub file_format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            console_enable: true,
            file_enable: false,
            console_level: LogLevel::default(),
            file_level: LogLevel::Info,
            file_path: "./bkit.log".to_string(),
            file_format: LogFormat::default(),
        }
    }
}

/// Synthetic workload fed through the engine by `bkit run`.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct SimulationConfig {
    /// Number of streams to admit. May exceed the engine's stream limit;
    /// the excess waits for slots.
    pub streams: usize,
    pub frames_per_stream: u64,
    pub objects_per_frame: usize,
    pub source_width: u32,
    pub source_height: u32,
    /// Incarnations per stream id. Later incarnations re-attach under the
    /// same id once the previous one has ended.
    pub rounds: u32,
    /// Delay between batches.
    pub batch_interval_ms: u64,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            streams: 4,
            frames_per_stream: 30,
            objects_per_frame: 2,
            source_width: 1920,
            source_height: 1080,
            rounds: 2,
            batch_interval_ms: 33,
        }
    }
}

/// Root configuration for the runner.
#[derive(Deserialize, Serialize, Debug, Clone, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub log: LogConfig,

    pub engine: EngineConfig,

    #[serde(default)]
    pub simulation: SimulationConfig,
}

impl Default for Config {
    fn default() -> Self {
        let mut engine = EngineConfig::new(FrameParameters::new(1280, 720), 4);
        engine.max_parallel_streams = 4;
        Self { log: LogConfig::default(), engine, simulation: SimulationConfig::default() }
    }
}

#[derive(Debug)]
pub struct ConfigLoadResult {
    pub config: Config,
    pub file_missing: Option<String>,
}

/// Loads the configuration from defaults, a TOML file, and `BK_` environment
/// variables (nested keys separated by `__`, e.g. `BK_ENGINE__BATCH_SIZE`).
///
/// # Errors
///
/// Returns an error if the file or the environment contains values that do
/// not deserialize into [`Config`].
pub fn load(config_path: &str) -> Result<ConfigLoadResult, Box<figment::Error>> {
    let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

    let mut file_missing = None;
    if std::path::Path::new(config_path).exists() {
        figment = figment.merge(Toml::file(config_path));
    } else {
        file_missing = Some(config_path.to_string());
    }

    let config: Config =
        figment.merge(Env::prefixed("BK_").split("__")).extract().map_err(Box::new)?;
    Ok(ConfigLoadResult { config, file_missing })
}

/// Generates the default configuration as a pretty-printed TOML string.
///
/// # Errors
///
/// Returns an error if the default configuration cannot be serialized to TOML.
pub fn generate_default() -> Result<String, toml::ser::Error> {
    toml::to_string_pretty(&Config::default())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_round_trips_through_toml() {
        let text = generate_default().unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.engine, Config::default().engine);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[engine]\nbatch_size = 8\nmax_parallel_streams = 8\n\n[engine.frame]\nwidth = 640\nheight = 360\n\n[engine.output_frame]\ncodec = \"png\""
        )
        .unwrap();

        let result = load(file.path().to_str().unwrap()).unwrap();
        assert!(result.file_missing.is_none());
        let engine = result.config.engine;
        assert_eq!(engine.batch_size, 8);
        assert_eq!(engine.frame.width, 640);
        assert_eq!(engine.output_frame.unwrap().codec, "png");
        assert_eq!(result.config.simulation.streams, 4);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let result = load("/nonexistent/bkit.toml").unwrap();
        assert_eq!(result.file_missing.as_deref(), Some("/nonexistent/bkit.toml"));
        assert_eq!(result.config.engine.batch_size, 4);
    }
}
