use std::path::{Path, PathBuf};
use std::time::Duration;

use obd_stream::{SessionConfig, StaticToken, TimingConfig, TokenFile};
use serde::Deserialize;

use crate::error::{MonitorError, MonitorResult};

#[derive(Debug, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitorConfig {
    /// HTTP(S) origin of the telemetry API, or a ready WS(S) endpoint base.
    pub origin: Option<String>,
    pub token: Option<String>,
    pub token_file: Option<PathBuf>,
    pub vehicles: Vec<String>,
    pub all: bool,
    pub resubscribe: bool,
    pub timing: TimingSection,
}

/// Timing knobs as they appear in YAML (plain integers).
#[derive(Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimingSection {
    pub heartbeat_secs: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub max_reconnect_attempts: u32,
    pub connect_timeout_secs: u64,
}

impl Default for TimingSection {
    fn default() -> Self {
        let t = TimingConfig::default();
        Self {
            heartbeat_secs: t.heartbeat_interval.as_secs(),
            reconnect_base_ms: duration_ms(t.reconnect_base_delay),
            reconnect_max_ms: duration_ms(t.reconnect_max_delay),
            max_reconnect_attempts: t.max_reconnect_attempts,
            connect_timeout_secs: t.connect_timeout.as_secs(),
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl TimingSection {
    fn to_timing(&self) -> MonitorResult<TimingConfig> {
        if self.heartbeat_secs == 0 {
            return Err(MonitorError::Config("timing.heartbeat_secs must be > 0".into()));
        }
        if self.connect_timeout_secs == 0 {
            return Err(MonitorError::Config(
                "timing.connect_timeout_secs must be > 0".into(),
            ));
        }
        if self.reconnect_base_ms > self.reconnect_max_ms {
            return Err(MonitorError::Config(format!(
                "timing.reconnect_base_ms ({}) exceeds timing.reconnect_max_ms ({})",
                self.reconnect_base_ms, self.reconnect_max_ms
            )));
        }
        Ok(TimingConfig {
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
            reconnect_base_delay: Duration::from_millis(self.reconnect_base_ms),
            reconnect_max_delay: Duration::from_millis(self.reconnect_max_ms),
            max_reconnect_attempts: self.max_reconnect_attempts,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
        })
    }
}

/// Values given on the command line or through the environment.
#[derive(Debug, Default)]
pub struct Overrides {
    pub origin: Option<String>,
    pub token: Option<String>,
    pub token_file: Option<PathBuf>,
    pub vehicles: Vec<String>,
    pub all: bool,
}

/// Load a monitor config from a YAML file. Relative `token_file` paths are
/// resolved against the config file's directory.
pub async fn load(path: &Path) -> MonitorResult<MonitorConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| MonitorError::Config(format!("read {}: {e}", path.display())))?;
    let mut config: MonitorConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| MonitorError::Config(format!("parse {}: {e}", path.display())))?;
    if let (Some(dir), Some(token_file)) = (path.parent(), config.token_file.as_mut())
        && token_file.is_relative()
    {
        *token_file = dir.join(&*token_file);
    }
    Ok(config)
}

impl MonitorConfig {
    /// Overlay command-line values. A token given on the command line replaces
    /// a token file from the config file and vice versa.
    pub fn apply(&mut self, overrides: Overrides) {
        if let Some(origin) = overrides.origin {
            self.origin = Some(origin);
        }
        if let Some(token) = overrides.token {
            self.token = Some(token);
            self.token_file = None;
        }
        if let Some(token_file) = overrides.token_file {
            self.token_file = Some(token_file);
            self.token = None;
        }
        if !overrides.vehicles.is_empty() {
            self.vehicles = overrides.vehicles;
        }
        self.all |= overrides.all;
    }

    pub fn validate(&self) -> MonitorResult<()> {
        if let Some(origin) = &self.origin {
            let parsed = url::Url::parse(origin)?;
            if !matches!(parsed.scheme(), "http" | "https" | "ws" | "wss") {
                return Err(MonitorError::Config(format!(
                    "origin must be http(s) or ws(s), got {}",
                    parsed.scheme()
                )));
            }
        }
        match (&self.token, &self.token_file) {
            (Some(_), Some(_)) => {
                return Err(MonitorError::Config(
                    "token and token_file are mutually exclusive".into(),
                ));
            }
            (None, None) => {
                return Err(MonitorError::Config(
                    "a token is required (set token / token_file in config, \
                     or use --token / OBD_TOKEN or --token-file / OBD_TOKEN_FILE)"
                        .into(),
                ));
            }
            _ => {}
        }
        if self.vehicles.is_empty() && !self.all {
            return Err(MonitorError::Config(
                "nothing to watch: give at least one --vehicle or --all".into(),
            ));
        }
        self.timing.to_timing().map(|_| ())
    }

    /// Validate and build the library session config.
    pub fn session_config(&self) -> MonitorResult<SessionConfig> {
        self.validate()?;
        let mut config = match (&self.token, &self.token_file) {
            (_, Some(path)) => SessionConfig::new(TokenFile { path: path.clone() }),
            (Some(token), None) => SessionConfig::new(StaticToken(token.clone())),
            (None, None) => return Err(MonitorError::Config("a token is required".into())),
        };
        config.origin = self.origin.clone();
        config.timing = self.timing.to_timing()?;
        config.resubscribe_on_auth = self.resubscribe;
        Ok(config)
    }
}
