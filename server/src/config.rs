//! Server settings loaded from a line-oriented `key=value` file
//!
//! The file is read once at startup. A missing file is created with the
//! defaults so operators have something to edit. Blank lines and lines
//! starting with `#` are skipped; keys the relay does not use (webhook
//! settings, for instance) are ignored.

use log::{debug, info};
use shared::{DEFAULT_PASSWORD, DEFAULT_PORT};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "settings.cfg";

/// Errors raised while loading settings
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("line {line}: expected key=value")]
    MissingSeparator { line: usize },
    #[error("line {line}: invalid value {value:?} for {key}")]
    InvalidValue {
        line: usize,
        key: String,
        value: String,
    },
    #[error("outer_player_transmit_cutoff ({outer}) must be greater than player_transmit_cutoff ({inner})")]
    CutoffOrder { inner: f32, outer: f32 },
    #[error("{key} ({value} ms) is not a usable interval")]
    IntervalOutOfRange { key: &'static str, value: f64 },
}

/// Runtime settings of the relay
#[derive(Debug, Clone, PartialEq)]
pub struct ServerSettings {
    pub port: u16,
    /// Shared secret; [`DEFAULT_PASSWORD`] means no password
    pub password: String,
    /// Peers further apart than this get throttled pose updates
    pub player_transmit_cutoff: f32,
    /// Distance at which throttling reaches its floor
    pub outer_player_transmit_cutoff: f32,
    /// Milliseconds between culling passes
    pub static_update_rate: f64,
    pub max_bandwidth_kbps: f64,
    pub telemetry_enabled: bool,
    /// Milliseconds between telemetry reports
    pub telemetry_update_interval: f64,
    pub voice_chat_enabled: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            password: DEFAULT_PASSWORD.to_string(),
            player_transmit_cutoff: 10.0,
            outer_player_transmit_cutoff: 500.0,
            static_update_rate: 1000.0,
            max_bandwidth_kbps: 512.0,
            telemetry_enabled: false,
            telemetry_update_interval: 5000.0,
            voice_chat_enabled: true,
        }
    }
}

impl ServerSettings {
    /// Reads settings from `path`, writing a default file first if none exists.
    pub fn load_or_create(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            fs::write(path, Self::default_file_contents()).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
            info!("No {} file found, created a default one", path.display());
            return Ok(Self::default());
        }

        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut settings = Self::default();

        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let (key, value) = trimmed
                .split_once('=')
                .ok_or(ConfigError::MissingSeparator { line })?;
            let key = key.trim();
            let value = value.trim();

            match key {
                "port" => {
                    settings.port = parse_value(line, key, value)?;
                    if settings.port == 0 {
                        return Err(invalid(line, key, value));
                    }
                }
                "password" => {
                    // An empty password keeps the "no password" sentinel
                    if !value.is_empty() {
                        settings.password = value.to_string();
                    }
                }
                "player_transmit_cutoff" => {
                    settings.player_transmit_cutoff = parse_positive(line, key, value)?;
                }
                "outer_player_transmit_cutoff" => {
                    settings.outer_player_transmit_cutoff = parse_positive(line, key, value)?;
                }
                "static_update_rate" => {
                    settings.static_update_rate = parse_positive(line, key, value)?;
                }
                "max_bandwidth_kbps" => {
                    settings.max_bandwidth_kbps = parse_positive(line, key, value)?;
                }
                "telemetry_enabled" => {
                    settings.telemetry_enabled = parse_bool(line, key, value)?;
                }
                "telemetry_update_interval" => {
                    settings.telemetry_update_interval = parse_positive(line, key, value)?;
                }
                "voice_chat_enabled" => {
                    settings.voice_chat_enabled = parse_bool(line, key, value)?;
                }
                other => debug!("Ignoring unknown setting {:?} on line {}", other, line),
            }
        }

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.outer_player_transmit_cutoff <= self.player_transmit_cutoff {
            return Err(ConfigError::CutoffOrder {
                inner: self.player_transmit_cutoff,
                outer: self.outer_player_transmit_cutoff,
            });
        }
        interval_from_ms("static_update_rate", self.static_update_rate)?;
        interval_from_ms("telemetry_update_interval", self.telemetry_update_interval)?;
        Ok(())
    }

    pub fn has_password(&self) -> bool {
        self.password != DEFAULT_PASSWORD
    }

    /// Culling period; settings that skipped [`validate`](Self::validate)
    /// with an unusable rate never cull.
    pub fn static_update_interval(&self) -> Duration {
        interval_from_ms("static_update_rate", self.static_update_rate).unwrap_or(Duration::MAX)
    }

    pub fn telemetry_interval(&self) -> Duration {
        interval_from_ms("telemetry_update_interval", self.telemetry_update_interval)
            .unwrap_or(Duration::MAX)
    }

    pub fn default_file_contents() -> String {
        [
            "port=7777",
            "password=",
            "player_transmit_cutoff=10",
            "outer_player_transmit_cutoff=500",
            "static_update_rate=1000",
            "max_bandwidth_kbps=512",
            "telemetry_enabled=false",
            "telemetry_update_interval=5000",
            "voice_chat_enabled=true",
            "",
        ]
        .join("\n")
    }
}

fn invalid(line: usize, key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        line,
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse_value<T: FromStr>(line: usize, key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| invalid(line, key, value))
}

/// Parses a finite number greater than zero.
fn parse_positive<T>(line: usize, key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr + Copy + Into<f64>,
{
    let parsed: T = parse_value(line, key, value)?;
    let number: f64 = parsed.into();
    if number.is_finite() && number > 0.0 {
        Ok(parsed)
    } else {
        Err(invalid(line, key, value))
    }
}

fn interval_from_ms(key: &'static str, ms: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(ms / 1000.0)
        .ok()
        .filter(|interval| !interval.is_zero())
        .ok_or(ConfigError::IntervalOutOfRange { key, value: ms })
}

fn parse_bool(line: usize, key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(invalid(line, key, value)),
    }
}
