//! Wire protocol types and JSON encode/decode.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;
use crate::lenient;
use crate::types::{TelemetrySample, VehicleDescriptor};

// ---------------------------------------------------------------------------
// Frame discriminants
// ---------------------------------------------------------------------------

pub mod frame_type {
    pub const CONNECTED: &str = "connected";
    pub const AUTH_SUCCESS: &str = "auth_success";
    pub const AUTH_ERROR: &str = "auth_error";
    pub const SUBSCRIBED: &str = "subscribed";
    pub const SUBSCRIBED_ALL: &str = "subscribed_all";
    pub const UNSUBSCRIBED: &str = "unsubscribed";
    pub const VEHICLE_STREAMING: &str = "vehicle_streaming";
    pub const VEHICLE_STREAM_ENDED: &str = "vehicle_stream_ended";
    pub const OBD_UPDATE: &str = "obd_update";
    pub const PONG: &str = "pong";
    pub const ERROR: &str = "error";

    pub const KNOWN: &[&str] = &[
        CONNECTED,
        AUTH_SUCCESS,
        AUTH_ERROR,
        SUBSCRIBED,
        SUBSCRIBED_ALL,
        UNSUBSCRIBED,
        VEHICLE_STREAMING,
        VEHICLE_STREAM_ENDED,
        OBD_UPDATE,
        PONG,
        ERROR,
    ];
}

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Auth {
        token: String,
    },
    SubscribeVehicle {
        #[serde(rename = "vehicleId")]
        vehicle_id: String,
    },
    UnsubscribeVehicle {
        #[serde(rename = "vehicleId")]
        vehicle_id: String,
    },
    SubscribeAllVehicles,
    Ping,
}

impl ClientFrame {
    /// Discriminant, for logging without echoing the token.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientFrame::Auth { .. } => "auth",
            ClientFrame::SubscribeVehicle { .. } => "subscribe_vehicle",
            ClientFrame::UnsubscribeVehicle { .. } => "unsubscribe_vehicle",
            ClientFrame::SubscribeAllVehicles => "subscribe_all_vehicles",
            ClientFrame::Ping => "ping",
        }
    }
}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

// Unit-like variants are written as empty struct variants so that extra
// payload fields sent by the server are ignored rather than rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Connected {
        #[serde(default)]
        message: Option<String>,
    },
    AuthSuccess {},
    AuthError {
        #[serde(default)]
        message: Option<String>,
    },
    Subscribed {
        #[serde(rename = "vehicleId")]
        vehicle_id: String,
        #[serde(rename = "isStreaming", default)]
        is_streaming: bool,
    },
    SubscribedAll {
        #[serde(rename = "activeStreams", default)]
        active_streams: Option<serde_json::Value>,
    },
    Unsubscribed {
        #[serde(rename = "vehicleId")]
        vehicle_id: String,
    },
    VehicleStreaming {
        #[serde(rename = "vehicleId")]
        vehicle_id: String,
        #[serde(default, deserialize_with = "lenient::any")]
        vehicle: Option<VehicleDescriptor>,
        #[serde(default, deserialize_with = "lenient::any")]
        timestamp: Option<FrameTimestamp>,
    },
    VehicleStreamEnded {
        #[serde(rename = "vehicleId")]
        vehicle_id: String,
        #[serde(default, deserialize_with = "lenient::any")]
        timestamp: Option<FrameTimestamp>,
    },
    ObdUpdate {
        #[serde(rename = "vehicleId")]
        vehicle_id: String,
        #[serde(default, deserialize_with = "lenient::any")]
        vehicle: Option<VehicleDescriptor>,
        #[serde(default, deserialize_with = "lenient::any")]
        data: Option<TelemetrySample>,
        #[serde(default, deserialize_with = "lenient::any")]
        timestamp: Option<FrameTimestamp>,
    },
    Pong {},
    Error {
        #[serde(default)]
        message: Option<String>,
    },
}

/// Event time as sent by the server: RFC 3339 text or epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FrameTimestamp {
    Text(String),
    EpochMillis(f64),
}

impl FrameTimestamp {
    /// `None` when the value is not a usable instant.
    pub fn to_utc(&self) -> Option<DateTime<Utc>> {
        match self {
            FrameTimestamp::Text(s) => {
                let s = s.trim();
                DateTime::parse_from_rfc3339(s)
                    .map(|t| t.with_timezone(&Utc))
                    .ok()
                    .or_else(|| s.parse::<i64>().ok().and_then(DateTime::from_timestamp_millis))
            }
            FrameTimestamp::EpochMillis(ms) if ms.is_finite() => {
                DateTime::from_timestamp_millis(*ms as i64)
            }
            FrameTimestamp::EpochMillis(_) => None,
        }
    }
}

/// Result of classifying one inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Frame(ServerFrame),
    /// Well-formed frame with a discriminant this client does not know.
    Unknown(String),
}

// ---------------------------------------------------------------------------
// Encode / decode helpers
// ---------------------------------------------------------------------------

pub fn encode_frame(frame: &ClientFrame) -> Result<String, Error> {
    Ok(serde_json::to_string(frame)?)
}

pub fn decode_frame(text: &str) -> Result<Inbound, Error> {
    // Two-step decode: text -> serde_json::Value -> ServerFrame. Peeking at the
    // discriminant first separates "unknown type" (forward compatible, not an
    // error) from "known type with a bad payload" (malformed).
    let value: serde_json::Value = serde_json::from_str(text)?;
    let kind = value
        .get("type")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| Error::MalformedFrame("missing \"type\" discriminant".to_string()))?;
    if !frame_type::KNOWN.contains(&kind) {
        return Ok(Inbound::Unknown(kind.to_string()));
    }
    let kind = kind.to_string();
    serde_json::from_value(value)
        .map(Inbound::Frame)
        .map_err(|e| Error::MalformedFrame(format!("{kind}: {e}")))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
