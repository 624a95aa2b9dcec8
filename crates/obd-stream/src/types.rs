//! Public types for the obd-stream crate.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite;

use crate::credentials::CredentialSource;
use crate::lenient;

/// Lifecycle of the single telemetry channel owned by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Authenticated,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Authenticated => "authenticated",
            ConnectionStatus::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Static vehicle metadata pushed by the server alongside lifecycle notices.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct VehicleDescriptor {
    #[serde(deserialize_with = "lenient::text_or_empty")]
    pub make: String,
    #[serde(deserialize_with = "lenient::text_or_empty")]
    pub model: String,
    #[serde(deserialize_with = "lenient::int")]
    pub year: Option<i32>,
    #[serde(deserialize_with = "lenient::text", skip_serializing_if = "Option::is_none")]
    pub license_plate: Option<String>,
}

/// One OBD-II sample as reported by a vehicle.
///
/// Every field is optional: adapters report whatever PIDs the ECU supports.
/// Unknown fields are ignored on decode, and a field that cannot be read as
/// its type decodes as `None` without affecting the rest of the sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TelemetrySample {
    #[serde(deserialize_with = "lenient::float", skip_serializing_if = "Option::is_none")]
    pub rpm: Option<f64>,
    #[serde(deserialize_with = "lenient::float", skip_serializing_if = "Option::is_none")]
    pub engine_load: Option<f64>,
    #[serde(deserialize_with = "lenient::float", skip_serializing_if = "Option::is_none")]
    pub coolant_temp: Option<f64>,
    #[serde(deserialize_with = "lenient::float", skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(deserialize_with = "lenient::float", skip_serializing_if = "Option::is_none")]
    pub throttle_position: Option<f64>,
    #[serde(deserialize_with = "lenient::float", skip_serializing_if = "Option::is_none")]
    pub fuel_level: Option<f64>,
    #[serde(deserialize_with = "lenient::float", skip_serializing_if = "Option::is_none")]
    pub short_term_fuel_trim: Option<f64>,
    #[serde(deserialize_with = "lenient::float", skip_serializing_if = "Option::is_none")]
    pub long_term_fuel_trim: Option<f64>,
    #[serde(deserialize_with = "lenient::float", skip_serializing_if = "Option::is_none")]
    pub intake_air_temp: Option<f64>,
    #[serde(deserialize_with = "lenient::float", skip_serializing_if = "Option::is_none")]
    pub maf_air_flow: Option<f64>,
    #[serde(deserialize_with = "lenient::float", skip_serializing_if = "Option::is_none")]
    pub manifold_pressure: Option<f64>,
    #[serde(deserialize_with = "lenient::float", skip_serializing_if = "Option::is_none")]
    pub timing_advance: Option<f64>,
    #[serde(deserialize_with = "lenient::float", skip_serializing_if = "Option::is_none")]
    pub barometric_pressure: Option<f64>,
    #[serde(deserialize_with = "lenient::float", skip_serializing_if = "Option::is_none")]
    pub ambient_air_temp: Option<f64>,
    #[serde(deserialize_with = "lenient::float", skip_serializing_if = "Option::is_none")]
    pub catalyst_temp: Option<f64>,
    #[serde(deserialize_with = "lenient::float", skip_serializing_if = "Option::is_none")]
    pub battery_voltage: Option<f64>,
    #[serde(deserialize_with = "lenient::float", skip_serializing_if = "Option::is_none")]
    pub control_module_voltage: Option<f64>,
    /// Malfunction indicator lamp ("check engine").
    #[serde(deserialize_with = "lenient::any", skip_serializing_if = "Option::is_none")]
    pub mil_status: Option<bool>,
    #[serde(deserialize_with = "lenient::int", skip_serializing_if = "Option::is_none")]
    pub dtc_count: Option<u32>,
    #[serde(
        rename = "activeDTCs",
        deserialize_with = "lenient::any",
        skip_serializing_if = "Option::is_none"
    )]
    pub active_dtcs: Option<Vec<String>>,
    #[serde(deserialize_with = "lenient::float", skip_serializing_if = "Option::is_none")]
    pub boost_pressure: Option<f64>,
    /// Adapter-side sample time, verbatim.
    #[serde(deserialize_with = "lenient::text", skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// Accumulated state for one vehicle seen on the channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEntry {
    pub vehicle_id: String,
    pub vehicle: Option<VehicleDescriptor>,
    pub latest_telemetry: Option<TelemetrySample>,
    pub is_live: bool,
    pub last_update_at: Option<DateTime<Utc>>,
}

impl StreamEntry {
    pub(crate) fn new(vehicle_id: &str) -> Self {
        Self {
            vehicle_id: vehicle_id.to_string(),
            vehicle: None,
            latest_telemetry: None,
            is_live: false,
            last_update_at: None,
        }
    }
}

/// Point-in-time view of a session, published on every observable change.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub status: ConnectionStatus,
    pub error: Option<String>,
    pub streams: HashMap<String, StreamEntry>,
    /// Successful authentications so far. Lets a watcher that only sees the
    /// latest snapshot notice a re-authentication it did not observe.
    pub authentications: u64,
}

impl SessionSnapshot {
    /// True once the server has accepted the credential.
    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Authenticated
    }

    /// Number of vehicles currently streaming. Derived on each call.
    pub fn active_stream_count(&self) -> usize {
        self.streams.values().filter(|e| e.is_live).count()
    }

    pub fn stream(&self, vehicle_id: &str) -> Option<&StreamEntry> {
        self.streams.get(vehicle_id)
    }
}

/// Timing knobs for heartbeat, reconnection, and channel open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingConfig {
    pub heartbeat_interval: Duration,
    pub reconnect_base_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub connect_timeout: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(25),
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            max_reconnect_attempts: 5,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Configuration for [`Session::start`](crate::Session::start).
pub struct SessionConfig {
    /// HTTP(S) origin of the API. Defaults to [`DEFAULT_API_ORIGIN`](crate::DEFAULT_API_ORIGIN).
    pub origin: Option<String>,
    /// Where the bearer token is read from at the start of every connect attempt.
    pub credentials: Box<dyn CredentialSource>,
    pub timing: TimingConfig,
    /// Replay the previous channel's subscription requests after each successful
    /// authentication.
    pub resubscribe_on_auth: bool,
}

impl SessionConfig {
    pub fn new(credentials: impl CredentialSource + 'static) -> Self {
        Self {
            origin: None,
            credentials: Box::new(credentials),
            timing: TimingConfig::default(),
            resubscribe_on_auth: false,
        }
    }
}

impl fmt::Debug for SessionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionConfig")
            .field("origin", &self.origin)
            .field("timing", &self.timing)
            .field("resubscribe_on_auth", &self.resubscribe_on_auth)
            .finish_non_exhaustive()
    }
}

/// Errors returned by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("channel open timed out after {0:?}")]
    OpenTimeout(Duration),
}

impl From<tungstenite::Error> for Error {
    fn from(e: tungstenite::Error) -> Self {
        Error::WebSocket(Box::new(e))
    }
}
