//! Streaming endpoint resolution.

/// Origin used when none is configured.
pub const DEFAULT_API_ORIGIN: &str = "http://localhost:3000";

/// Path of the telemetry channel on the API origin.
pub const STREAM_PATH: &str = "/ws";

/// Derive the WebSocket URL of the telemetry channel from an HTTP(S) origin.
///
/// `https://` becomes `wss://` and `http://` becomes `ws://`. Origins that do
/// not start with `http` are assumed to already carry a WebSocket scheme and
/// are kept as they are.
pub fn resolve_endpoint(origin: Option<&str>) -> String {
    let origin = origin
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .unwrap_or(DEFAULT_API_ORIGIN);
    let origin = origin.strip_suffix('/').unwrap_or(origin);
    let base = match origin.strip_prefix("http") {
        Some(rest) => format!("ws{rest}"),
        None => origin.to_string(),
    };
    format!("{base}{STREAM_PATH}")
}
