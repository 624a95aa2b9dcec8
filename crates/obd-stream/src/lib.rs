//! Live OBD telemetry stream client.
//!
//! Maintains one WebSocket channel to the telemetry API, authenticates it
//! with a bearer token, multiplexes per-vehicle streams over it, and keeps a
//! registry of the latest sample and liveness of every vehicle seen.
//!
//! # Features
//! - Two-phase handshake: open, then `auth` frame with the current token
//! - Keep-alive `ping` every 25 seconds while the channel is open
//! - Capped exponential backoff reconnection (2s, 4s, 8s, 16s, 30s, then stop)
//! - Registry snapshots published through a `tokio::sync::watch` channel
//!
//! # Example
//! ```no_run
//! # async fn example() {
//! use obd_stream::{ConnectionStatus, Session, SessionConfig, StaticToken};
//!
//! let mut config = SessionConfig::new(StaticToken("my-token".to_string()));
//! config.origin = Some("https://api.example.com".to_string());
//!
//! let session = Session::start(config);
//! session.connect();
//!
//! let mut state = session.watch();
//! while state.changed().await.is_ok() {
//!     let snapshot = state.borrow_and_update().clone();
//!     if snapshot.status == ConnectionStatus::Authenticated {
//!         session.ensure_subscribed("vehicle-42");
//!     }
//!     if let Some(entry) = snapshot.stream("vehicle-42") {
//!         println!("live={} rpm={:?}", entry.is_live,
//!             entry.latest_telemetry.as_ref().and_then(|t| t.rpm));
//!     }
//! }
//! # }
//! ```

mod backoff;
mod client;
mod connection;
pub mod credentials;
mod endpoint;
mod heartbeat;
mod lenient;
pub mod protocol;
mod registry;
mod session;
mod types;

pub use client::Session;
pub use credentials::{CredentialSource, EnvToken, StaticToken, TokenFile};
pub use endpoint::{DEFAULT_API_ORIGIN, STREAM_PATH, resolve_endpoint};
pub use types::{
    ConnectionStatus, Error, SessionConfig, SessionSnapshot, StreamEntry, TelemetrySample,
    TimingConfig, VehicleDescriptor,
};
