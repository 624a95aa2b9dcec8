//! Session state machine.
//!
//! [`SessionMachine::step`] is the single place where session state changes.
//! It consumes one [`Input`] at a time and returns the [`Effect`]s the I/O
//! driver must perform (open or close the channel, send frames, arm or cancel
//! timers). Keeping I/O out of here makes every transition testable without a
//! socket.

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::backoff::ReconnectPolicy;
use crate::protocol::{ClientFrame, FrameTimestamp, Inbound, ServerFrame, decode_frame};
use crate::registry::SubscriptionRegistry;
use crate::types::{ConnectionStatus, SessionSnapshot, TimingConfig};

pub(crate) const NOT_AUTHENTICATED: &str = "Not authenticated";
pub(crate) const CLOSE_NORMAL: u16 = 1000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Input {
    /// Connect requested, with the token read for this attempt.
    Connect { token: Option<String> },
    ChannelOpened,
    /// Open failure, read error, or failed send.
    ChannelFailed { reason: String },
    /// Close frame received or stream ended.
    ChannelClosed { code: Option<u16>, reason: String },
    Text(String),
    HeartbeatDue,
    Subscribe(String),
    EnsureSubscribed(String),
    Unsubscribe(String),
    SubscribeAll,
    DismissError,
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Effect {
    OpenChannel,
    Send(ClientFrame),
    StartHeartbeat,
    StopHeartbeat,
    CloseChannel { code: u16, reason: &'static str },
    ScheduleReconnect(Duration),
    CancelReconnect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Channel {
    Closed,
    Opening,
    Open,
}

/// Subscription requests issued on one channel.
#[derive(Debug, Default)]
struct Requested {
    vehicles: BTreeSet<String>,
    all: bool,
}

impl Requested {
    fn merge(&mut self, other: Requested) {
        self.vehicles.extend(other.vehicles);
        self.all |= other.all;
    }
}

#[derive(Debug)]
pub(crate) struct SessionMachine {
    status: ConnectionStatus,
    error: Option<String>,
    registry: SubscriptionRegistry,
    policy: ReconnectPolicy,
    channel: Channel,
    pending_token: Option<String>,
    reconnect_pending: bool,
    requested: Requested,
    previous: Requested,
    resubscribe_on_auth: bool,
    authentications: u64,
}

impl SessionMachine {
    pub(crate) fn new(timing: &TimingConfig, resubscribe_on_auth: bool) -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            error: None,
            registry: SubscriptionRegistry::new(),
            policy: ReconnectPolicy::new(timing),
            channel: Channel::Closed,
            pending_token: None,
            reconnect_pending: false,
            requested: Requested::default(),
            previous: Requested::default(),
            resubscribe_on_auth,
            authentications: 0,
        }
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            status: self.status,
            error: self.error.clone(),
            streams: self.registry.snapshot(),
            authentications: self.authentications,
        }
    }

    pub(crate) fn step(&mut self, input: Input) -> Vec<Effect> {
        match input {
            Input::Connect { token } => self.on_connect(token),
            Input::ChannelOpened => self.on_opened(),
            Input::ChannelFailed { reason } => {
                tracing::warn!("Channel failed: {reason}");
                self.on_channel_lost(Some(reason))
            }
            Input::ChannelClosed { code, reason } => {
                tracing::info!(?code, reason = %reason, "Channel closed");
                self.on_channel_lost(None)
            }
            Input::Text(text) => self.on_text(&text),
            Input::HeartbeatDue => {
                if self.channel == Channel::Open {
                    tracing::trace!("Sending heartbeat");
                    vec![Effect::Send(ClientFrame::Ping)]
                } else {
                    Vec::new()
                }
            }
            Input::Subscribe(vehicle_id) => self.on_subscribe(vehicle_id, false),
            Input::EnsureSubscribed(vehicle_id) => self.on_subscribe(vehicle_id, true),
            Input::Unsubscribe(vehicle_id) => {
                if !self.can_send_requests("unsubscribe_vehicle") {
                    return Vec::new();
                }
                self.requested.vehicles.remove(&vehicle_id);
                vec![Effect::Send(ClientFrame::UnsubscribeVehicle { vehicle_id })]
            }
            Input::SubscribeAll => {
                if !self.can_send_requests("subscribe_all_vehicles") {
                    return Vec::new();
                }
                self.requested.all = true;
                vec![Effect::Send(ClientFrame::SubscribeAllVehicles)]
            }
            Input::DismissError => {
                self.error = None;
                Vec::new()
            }
            Input::Disconnect => self.on_disconnect(),
        }
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    fn on_connect(&mut self, token: Option<String>) -> Vec<Effect> {
        if matches!(
            self.status,
            ConnectionStatus::Connecting | ConnectionStatus::Connected | ConnectionStatus::Authenticated
        ) {
            tracing::debug!(status = %self.status, "Connect ignored, channel already active");
            return Vec::new();
        }

        let mut effects = Vec::new();
        if self.reconnect_pending {
            self.reconnect_pending = false;
            effects.push(Effect::CancelReconnect);
        }

        let Some(token) = token.filter(|t| !t.is_empty()) else {
            tracing::warn!("No credential available, not connecting");
            self.status = ConnectionStatus::Error;
            self.error = Some(NOT_AUTHENTICATED.to_string());
            return effects;
        };

        // A channel can still be open after an auth rejection. Replace it.
        if self.channel != Channel::Closed {
            effects.push(Effect::StopHeartbeat);
            effects.push(Effect::CloseChannel {
                code: CLOSE_NORMAL,
                reason: "Reconnecting",
            });
            self.retire_channel();
        }

        self.status = ConnectionStatus::Connecting;
        self.error = None;
        self.pending_token = Some(token);
        self.channel = Channel::Opening;
        effects.push(Effect::OpenChannel);
        effects
    }

    fn on_opened(&mut self) -> Vec<Effect> {
        if self.channel != Channel::Opening {
            tracing::debug!("Ignoring open for a channel that is no longer wanted");
            return Vec::new();
        }
        self.channel = Channel::Open;
        self.status = ConnectionStatus::Connected;
        self.error = None;
        tracing::info!("Channel open, authenticating");

        let mut effects = vec![Effect::StartHeartbeat];
        if let Some(token) = self.pending_token.take() {
            effects.push(Effect::Send(ClientFrame::Auth { token }));
        }
        effects
    }

    fn on_channel_lost(&mut self, error: Option<String>) -> Vec<Effect> {
        if self.channel == Channel::Closed {
            return Vec::new();
        }
        self.retire_channel();
        self.status = ConnectionStatus::Disconnected;
        if error.is_some() {
            self.error = error;
        }

        let mut effects = vec![Effect::StopHeartbeat];
        match self.policy.next_delay() {
            Some(delay) => {
                tracing::info!(
                    attempt = self.policy.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling reconnect"
                );
                self.reconnect_pending = true;
                effects.push(Effect::ScheduleReconnect(delay));
            }
            None => {
                tracing::warn!(
                    attempts = self.policy.attempts(),
                    "Reconnect attempts exhausted, staying disconnected"
                );
            }
        }
        effects
    }

    fn on_disconnect(&mut self) -> Vec<Effect> {
        let mut effects = vec![Effect::CancelReconnect, Effect::StopHeartbeat];
        if self.channel != Channel::Closed {
            effects.push(Effect::CloseChannel {
                code: CLOSE_NORMAL,
                reason: "Client disconnecting",
            });
        }
        self.channel = Channel::Closed;
        self.pending_token = None;
        self.reconnect_pending = false;
        self.requested = Requested::default();
        self.previous = Requested::default();
        self.registry.clear();
        self.policy.reset();
        self.status = ConnectionStatus::Disconnected;
        tracing::info!("Session disconnected by client");
        effects
    }

    /// Forget the current channel. Requests made on it are kept for replay.
    fn retire_channel(&mut self) {
        self.channel = Channel::Closed;
        self.pending_token = None;
        let requested = std::mem::take(&mut self.requested);
        self.previous.merge(requested);
    }

    // -----------------------------------------------------------------------
    // Subscriptions
    // -----------------------------------------------------------------------

    fn can_send_requests(&self, kind: &str) -> bool {
        if self.status == ConnectionStatus::Authenticated {
            true
        } else {
            tracing::debug!(status = %self.status, frame_type = kind, "Dropping request, not authenticated");
            false
        }
    }

    fn on_subscribe(&mut self, vehicle_id: String, only_if_new: bool) -> Vec<Effect> {
        if !self.can_send_requests("subscribe_vehicle") {
            return Vec::new();
        }
        let is_new = self.requested.vehicles.insert(vehicle_id.clone());
        if only_if_new && !is_new {
            tracing::trace!(vehicle_id = %vehicle_id, "Already subscribed on this channel");
            return Vec::new();
        }
        vec![Effect::Send(ClientFrame::SubscribeVehicle { vehicle_id })]
    }

    fn replay_subscriptions(&mut self) -> Vec<Effect> {
        let previous = std::mem::take(&mut self.previous);
        if !self.resubscribe_on_auth {
            return Vec::new();
        }
        let mut effects = Vec::new();
        if previous.all {
            self.requested.all = true;
            effects.push(Effect::Send(ClientFrame::SubscribeAllVehicles));
        }
        for vehicle_id in previous.vehicles {
            if self.requested.vehicles.insert(vehicle_id.clone()) {
                effects.push(Effect::Send(ClientFrame::SubscribeVehicle { vehicle_id }));
            }
        }
        if !effects.is_empty() {
            tracing::info!(requests = effects.len(), "Replaying subscriptions");
        }
        effects
    }

    // -----------------------------------------------------------------------
    // Inbound frames
    // -----------------------------------------------------------------------

    fn on_text(&mut self, text: &str) -> Vec<Effect> {
        match decode_frame(text) {
            Ok(Inbound::Frame(frame)) => self.on_frame(frame),
            Ok(Inbound::Unknown(kind)) => {
                tracing::debug!(frame_type = %kind, "Ignoring unknown frame type");
                Vec::new()
            }
            Err(e) => {
                tracing::warn!("Dropping malformed frame: {e}");
                Vec::new()
            }
        }
    }

    fn on_frame(&mut self, frame: ServerFrame) -> Vec<Effect> {
        match frame {
            ServerFrame::Connected { message } => {
                tracing::debug!(message = message.as_deref().unwrap_or("-"), "Server greeting");
            }
            ServerFrame::AuthSuccess {} => {
                tracing::info!("Authenticated");
                self.status = ConnectionStatus::Authenticated;
                self.error = None;
                self.authentications += 1;
                self.policy.reset();
                return self.replay_subscriptions();
            }
            ServerFrame::AuthError { message } => {
                let message = message.unwrap_or_else(|| "Authentication failed".to_string());
                tracing::warn!("Authentication rejected: {message}");
                self.status = ConnectionStatus::Error;
                self.error = Some(message);
            }
            ServerFrame::Subscribed {
                vehicle_id,
                is_streaming,
            } => {
                tracing::debug!(vehicle_id = %vehicle_id, is_streaming, "Subscribed");
                self.registry.mark_subscribed(&vehicle_id, is_streaming);
            }
            ServerFrame::SubscribedAll { active_streams } => {
                tracing::debug!(active_streams = ?active_streams, "Subscribed to all vehicles");
            }
            ServerFrame::Unsubscribed { vehicle_id } => {
                tracing::debug!(vehicle_id = %vehicle_id, "Unsubscribed");
                self.requested.vehicles.remove(&vehicle_id);
                self.registry.remove(&vehicle_id);
            }
            ServerFrame::VehicleStreaming {
                vehicle_id,
                vehicle,
                timestamp,
            } => {
                tracing::info!(vehicle_id = %vehicle_id, "Vehicle started streaming");
                let at = event_time(timestamp.as_ref());
                self.registry.mark_streaming(&vehicle_id, vehicle, at);
            }
            ServerFrame::VehicleStreamEnded {
                vehicle_id,
                timestamp,
            } => {
                tracing::info!(vehicle_id = %vehicle_id, "Vehicle stopped streaming");
                let at = event_time(timestamp.as_ref());
                self.registry.mark_stream_ended(&vehicle_id, at);
            }
            ServerFrame::ObdUpdate {
                vehicle_id,
                vehicle,
                data,
                timestamp,
            } => {
                let at = event_time(timestamp.as_ref());
                self.registry.apply_sample(&vehicle_id, vehicle, data, at);
            }
            ServerFrame::Pong {} => {
                tracing::trace!("Heartbeat acknowledged");
            }
            ServerFrame::Error { message } => {
                let message = message.unwrap_or_else(|| "Server error".to_string());
                tracing::warn!("Server error: {message}");
                self.error = Some(message);
            }
        }
        Vec::new()
    }
}

/// Time reported by the server for an event, falling back to receipt time
/// when the frame carries none or it does not parse.
fn event_time(timestamp: Option<&FrameTimestamp>) -> DateTime<Utc> {
    match timestamp.map(|t| (t, t.to_utc())) {
        Some((_, Some(t))) => t,
        Some((raw, None)) => {
            tracing::debug!(timestamp = ?raw, "Unparseable frame timestamp, using receipt time");
            Utc::now()
        }
        None => Utc::now(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn machine() -> SessionMachine {
        SessionMachine::new(&TimingConfig::default(), false)
    }

    fn frame(value: serde_json::Value) -> Input {
        Input::Text(value.to_string())
    }

    fn connect(m: &mut SessionMachine) -> Vec<Effect> {
        m.step(Input::Connect {
            token: Some("tok".into()),
        })
    }

    fn authenticate(m: &mut SessionMachine) {
        connect(m);
        m.step(Input::ChannelOpened);
        m.step(frame(serde_json::json!({"type": "auth_success"})));
        assert_eq!(m.status(), ConnectionStatus::Authenticated);
    }

    fn authenticated() -> SessionMachine {
        let mut m = machine();
        authenticate(&mut m);
        m
    }

    fn scheduled_delay(effects: &[Effect]) -> Option<Duration> {
        effects.iter().find_map(|e| match e {
            Effect::ScheduleReconnect(d) => Some(*d),
            _ => None,
        })
    }

    #[test]
    fn connect_then_open_sends_auth_and_starts_heartbeat() {
        let mut m = machine();
        assert_eq!(connect(&mut m), vec![Effect::OpenChannel]);
        assert_eq!(m.status(), ConnectionStatus::Connecting);

        let effects = m.step(Input::ChannelOpened);
        assert_eq!(
            effects,
            vec![
                Effect::StartHeartbeat,
                Effect::Send(ClientFrame::Auth {
                    token: "tok".into()
                }),
            ]
        );
        assert_eq!(m.status(), ConnectionStatus::Connected);
    }

    #[test]
    fn connect_is_idempotent_while_active() {
        let mut m = machine();
        connect(&mut m);
        assert!(connect(&mut m).is_empty(), "second connect while connecting");

        m.step(Input::ChannelOpened);
        assert!(connect(&mut m).is_empty(), "connect while connected");

        m.step(frame(serde_json::json!({"type": "auth_success"})));
        assert!(connect(&mut m).is_empty(), "connect while authenticated");
        assert_eq!(m.status(), ConnectionStatus::Authenticated);
    }

    #[test]
    fn connect_without_token_fails_without_opening() {
        let mut m = machine();
        let effects = m.step(Input::Connect { token: None });
        assert!(effects.is_empty());
        let snap = m.snapshot();
        assert_eq!(snap.status, ConnectionStatus::Error);
        assert_eq!(snap.error.as_deref(), Some(NOT_AUTHENTICATED));

        let effects = m.step(Input::Connect {
            token: Some(String::new()),
        });
        assert!(effects.is_empty());
        assert_eq!(m.status(), ConnectionStatus::Error);
    }

    #[test]
    fn backoff_schedule_across_failed_attempts() {
        let mut m = authenticated();
        let mut delays = Vec::new();

        let effects = m.step(Input::ChannelClosed {
            code: Some(1006),
            reason: String::new(),
        });
        assert!(effects.contains(&Effect::StopHeartbeat));
        delays.extend(scheduled_delay(&effects));

        loop {
            let effects = connect(&mut m);
            assert!(effects.contains(&Effect::OpenChannel));
            let effects = m.step(Input::ChannelFailed {
                reason: "connection refused".into(),
            });
            match scheduled_delay(&effects) {
                Some(d) => delays.push(d),
                None => break,
            }
        }

        let millis: Vec<u128> = delays.iter().map(Duration::as_millis).collect();
        assert_eq!(millis, vec![2_000, 4_000, 8_000, 16_000, 30_000]);
        assert_eq!(m.status(), ConnectionStatus::Disconnected);
        assert_eq!(m.snapshot().error.as_deref(), Some("connection refused"));
    }

    #[test]
    fn successful_auth_resets_backoff() {
        let mut m = authenticated();
        m.step(Input::ChannelClosed {
            code: None,
            reason: String::new(),
        });
        connect(&mut m);
        m.step(Input::ChannelFailed {
            reason: "refused".into(),
        });

        authenticate(&mut m);
        let effects = m.step(Input::ChannelClosed {
            code: Some(1001),
            reason: "going away".into(),
        });
        assert_eq!(scheduled_delay(&effects), Some(Duration::from_secs(2)));
    }

    #[test]
    fn socket_open_alone_does_not_reset_backoff() {
        let mut m = authenticated();
        m.step(Input::ChannelClosed {
            code: None,
            reason: String::new(),
        });
        connect(&mut m);
        m.step(Input::ChannelOpened);
        let effects = m.step(Input::ChannelClosed {
            code: None,
            reason: String::new(),
        });
        assert_eq!(scheduled_delay(&effects), Some(Duration::from_secs(4)));
    }

    #[test]
    fn manual_connect_cancels_pending_reconnect() {
        let mut m = authenticated();
        m.step(Input::ChannelClosed {
            code: None,
            reason: String::new(),
        });
        let effects = connect(&mut m);
        assert_eq!(effects, vec![Effect::CancelReconnect, Effect::OpenChannel]);
    }

    #[test]
    fn each_authentication_is_counted() {
        let mut m = authenticated();
        assert_eq!(m.snapshot().authentications, 1);
        m.step(Input::ChannelClosed {
            code: None,
            reason: String::new(),
        });
        authenticate(&mut m);
        assert_eq!(m.snapshot().authentications, 2);
        m.step(Input::Disconnect);
        assert_eq!(m.snapshot().authentications, 2);
    }

    #[test]
    fn telemetry_replaces_previous_sample() {
        let mut m = authenticated();
        m.step(frame(serde_json::json!({
            "type": "obd_update", "vehicleId": "v1",
            "data": {"rpm": 2000, "speed": 60},
            "timestamp": "2024-01-01T00:00:00Z"
        })));
        m.step(frame(serde_json::json!({
            "type": "obd_update", "vehicleId": "v1",
            "data": {"rpm": 2200},
            "timestamp": "2024-01-01T00:00:01Z"
        })));
        let snap = m.snapshot();
        let data = snap.stream("v1").unwrap().latest_telemetry.clone().unwrap();
        assert_eq!(data.rpm, Some(2200.0));
        assert_eq!(data.speed, None);
    }

    #[test]
    fn epoch_millis_timestamp_is_applied() {
        let mut m = authenticated();
        m.step(frame(serde_json::json!({
            "type": "obd_update", "vehicleId": "v1",
            "data": {"rpm": 800}, "timestamp": 1_704_067_200_000_i64
        })));
        let snap = m.snapshot();
        let entry = snap.stream("v1").unwrap();
        assert_eq!(entry.latest_telemetry.as_ref().unwrap().rpm, Some(800.0));
        assert_eq!(
            entry.last_update_at.unwrap().to_rfc3339(),
            "2024-01-01T00:00:00+00:00"
        );
    }

    #[test]
    fn float_dtc_count_keeps_sample() {
        let mut m = authenticated();
        m.step(frame(serde_json::json!({
            "type": "obd_update", "vehicleId": "v1",
            "data": {"rpm": 1200, "dtcCount": 2.0}
        })));
        let snap = m.snapshot();
        let data = snap.stream("v1").unwrap().latest_telemetry.clone().unwrap();
        assert_eq!(data.dtc_count, Some(2));
        assert_eq!(data.rpm, Some(1200.0));
    }

    #[test]
    fn loosely_typed_descriptor_still_marks_live() {
        let mut m = authenticated();
        m.step(frame(serde_json::json!({
            "type": "vehicle_streaming", "vehicleId": "v1",
            "vehicle": {"make": "Honda", "model": "Civic", "year": "2020"}
        })));
        m.step(frame(serde_json::json!({
            "type": "vehicle_streaming", "vehicleId": "v2",
            "vehicle": {"make": null, "model": "Model 3"}
        })));
        let snap = m.snapshot();
        let v1 = snap.stream("v1").unwrap();
        assert!(v1.is_live);
        assert_eq!(v1.vehicle.as_ref().unwrap().year, Some(2020));
        let v2 = snap.stream("v2").unwrap();
        assert!(v2.is_live);
        assert_eq!(v2.vehicle.as_ref().unwrap().make, "");
        assert_eq!(v2.vehicle.as_ref().unwrap().model, "Model 3");
    }

    #[test]
    fn unsubscribe_ack_removes_entry() {
        let mut m = authenticated();
        assert_eq!(
            m.step(Input::Subscribe("v1".into())),
            vec![Effect::Send(ClientFrame::SubscribeVehicle {
                vehicle_id: "v1".into()
            })]
        );
        m.step(frame(serde_json::json!({
            "type": "obd_update", "vehicleId": "v1",
            "data": {"rpm": 900}, "timestamp": "2024-01-01T00:00:00Z"
        })));
        assert!(m.snapshot().stream("v1").is_some());

        assert_eq!(
            m.step(Input::Unsubscribe("v1".into())),
            vec![Effect::Send(ClientFrame::UnsubscribeVehicle {
                vehicle_id: "v1".into()
            })]
        );
        // Not removed until the server acknowledges.
        assert!(m.snapshot().stream("v1").is_some());

        m.step(frame(serde_json::json!({"type": "unsubscribed", "vehicleId": "v1"})));
        assert!(m.snapshot().stream("v1").is_none());
    }

    #[test]
    fn disconnect_clears_registry_and_cancels_reconnect() {
        let mut m = authenticated();
        for id in ["a", "b", "c"] {
            m.step(frame(serde_json::json!({
                "type": "vehicle_streaming", "vehicleId": id
            })));
        }
        assert_eq!(m.snapshot().active_stream_count(), 3);

        let effects = m.step(Input::ChannelClosed {
            code: Some(1006),
            reason: String::new(),
        });
        assert!(scheduled_delay(&effects).is_some());

        let effects = m.step(Input::Disconnect);
        assert!(effects.contains(&Effect::CancelReconnect));
        assert!(effects.contains(&Effect::StopHeartbeat));
        let snap = m.snapshot();
        assert_eq!(snap.status, ConnectionStatus::Disconnected);
        assert!(snap.streams.is_empty());

        // A late close event for the torn-down channel changes nothing.
        let effects = m.step(Input::ChannelClosed {
            code: Some(1006),
            reason: String::new(),
        });
        assert!(effects.is_empty());
    }

    #[test]
    fn disconnect_closes_open_channel_normally() {
        let mut m = authenticated();
        let effects = m.step(Input::Disconnect);
        assert_eq!(
            effects,
            vec![
                Effect::CancelReconnect,
                Effect::StopHeartbeat,
                Effect::CloseChannel {
                    code: CLOSE_NORMAL,
                    reason: "Client disconnecting"
                },
            ]
        );
    }

    #[test]
    fn malformed_frames_change_nothing() {
        let mut m = authenticated();
        m.step(frame(serde_json::json!({
            "type": "vehicle_streaming", "vehicleId": "v1"
        })));
        let before = m.snapshot();

        for bad in [
            "not json at all",
            "{\"type\":",
            "[1,2,3]",
            r#"{"vehicleId":"v1"}"#,
            r#"{"type":"obd_update","data":{"rpm":1}}"#,
            r#"{"type":"obd_update","vehicleId":"v1","data":{"rpm":"fast"}}"#,
        ] {
            assert!(m.step(Input::Text(bad.to_string())).is_empty());
            assert_eq!(m.snapshot(), before, "{bad}");
        }
    }

    #[test]
    fn unknown_frame_type_is_ignored() {
        let mut m = authenticated();
        let before = m.snapshot();
        assert!(m.step(frame(serde_json::json!({"type": "fleet_summary"}))).is_empty());
        assert_eq!(m.snapshot(), before);
    }

    #[test]
    fn vehicle_streaming_then_update() {
        let mut m = authenticated();
        m.step(Input::Subscribe("v42".into()));
        m.step(frame(serde_json::json!({
            "type": "vehicle_streaming", "vehicleId": "v42",
            "vehicle": {"make": "Honda", "model": "Civic", "year": 2020}
        })));
        let snap = m.snapshot();
        let entry = snap.stream("v42").unwrap();
        assert!(entry.is_live);
        assert_eq!(entry.vehicle.as_ref().unwrap().make, "Honda");
        assert!(entry.latest_telemetry.is_none());

        m.step(frame(serde_json::json!({
            "type": "obd_update", "vehicleId": "v42",
            "data": {"rpm": 3000}, "timestamp": "2024-01-01T00:00:00Z"
        })));
        let snap = m.snapshot();
        let entry = snap.stream("v42").unwrap();
        assert_eq!(entry.latest_telemetry.as_ref().unwrap().rpm, Some(3000.0));
        assert!(entry.is_live);
        assert_eq!(
            entry.last_update_at.unwrap().to_rfc3339(),
            "2024-01-01T00:00:00+00:00"
        );
        assert_eq!(entry.vehicle.as_ref().unwrap().model, "Civic");
    }

    #[test]
    fn stream_ended_keeps_entry_offline() {
        let mut m = authenticated();
        m.step(frame(serde_json::json!({"type": "subscribed", "vehicleId": "v1", "isStreaming": true})));
        m.step(frame(serde_json::json!({"type": "vehicle_stream_ended", "vehicleId": "v1"})));
        let snap = m.snapshot();
        assert!(!snap.stream("v1").unwrap().is_live);
        assert_eq!(snap.active_stream_count(), 0);
    }

    #[test]
    fn auth_error_records_message() {
        let mut m = machine();
        connect(&mut m);
        m.step(Input::ChannelOpened);
        m.step(frame(serde_json::json!({"type": "auth_error", "message": "Invalid token"})));
        let snap = m.snapshot();
        assert_eq!(snap.status, ConnectionStatus::Error);
        assert_eq!(snap.error.as_deref(), Some("Invalid token"));
    }

    #[test]
    fn connect_after_auth_error_replaces_stale_channel() {
        let mut m = machine();
        connect(&mut m);
        m.step(Input::ChannelOpened);
        m.step(frame(serde_json::json!({"type": "auth_error", "message": "Invalid token"})));

        let effects = connect(&mut m);
        assert_eq!(
            effects,
            vec![
                Effect::StopHeartbeat,
                Effect::CloseChannel {
                    code: CLOSE_NORMAL,
                    reason: "Reconnecting"
                },
                Effect::OpenChannel,
            ]
        );
        assert_eq!(m.status(), ConnectionStatus::Connecting);
        assert_eq!(m.snapshot().error, None);
    }

    #[test]
    fn server_error_keeps_status() {
        let mut m = authenticated();
        m.step(frame(serde_json::json!({"type": "error", "message": "Vehicle not found"})));
        let snap = m.snapshot();
        assert_eq!(snap.status, ConnectionStatus::Authenticated);
        assert_eq!(snap.error.as_deref(), Some("Vehicle not found"));

        m.step(Input::DismissError);
        assert_eq!(m.snapshot().error, None);
    }

    #[test]
    fn requests_dropped_until_authenticated() {
        let mut m = machine();
        assert!(m.step(Input::Subscribe("v1".into())).is_empty());
        connect(&mut m);
        m.step(Input::ChannelOpened);
        assert!(m.step(Input::Subscribe("v1".into())).is_empty());
        assert!(m.step(Input::Unsubscribe("v1".into())).is_empty());
        assert!(m.step(Input::SubscribeAll).is_empty());
    }

    #[test]
    fn ensure_subscribed_sends_once_per_channel() {
        let mut m = authenticated();
        assert_eq!(m.step(Input::EnsureSubscribed("v1".into())).len(), 1);
        assert!(m.step(Input::EnsureSubscribed("v1".into())).is_empty());

        // New channel, new server-side subscription state.
        m.step(Input::ChannelClosed {
            code: None,
            reason: String::new(),
        });
        authenticate(&mut m);
        assert_eq!(m.step(Input::EnsureSubscribed("v1".into())).len(), 1);
    }

    #[test]
    fn resubscribe_on_auth_replays_previous_requests() {
        let mut m = SessionMachine::new(&TimingConfig::default(), true);
        authenticate(&mut m);
        m.step(Input::Subscribe("v2".into()));
        m.step(Input::Subscribe("v1".into()));
        m.step(Input::SubscribeAll);
        m.step(Input::ChannelClosed {
            code: None,
            reason: String::new(),
        });

        connect(&mut m);
        m.step(Input::ChannelOpened);
        let effects = m.step(frame(serde_json::json!({"type": "auth_success"})));
        assert_eq!(
            effects,
            vec![
                Effect::Send(ClientFrame::SubscribeAllVehicles),
                Effect::Send(ClientFrame::SubscribeVehicle {
                    vehicle_id: "v1".into()
                }),
                Effect::Send(ClientFrame::SubscribeVehicle {
                    vehicle_id: "v2".into()
                }),
            ]
        );
    }

    #[test]
    fn entries_survive_reconnect() {
        let mut m = authenticated();
        m.step(frame(serde_json::json!({"type": "vehicle_streaming", "vehicleId": "v1"})));
        m.step(Input::ChannelClosed {
            code: None,
            reason: String::new(),
        });
        assert!(m.snapshot().stream("v1").is_some());
    }

    #[test]
    fn heartbeat_only_while_open() {
        let mut m = machine();
        assert!(m.step(Input::HeartbeatDue).is_empty());
        connect(&mut m);
        assert!(m.step(Input::HeartbeatDue).is_empty());
        m.step(Input::ChannelOpened);
        assert_eq!(
            m.step(Input::HeartbeatDue),
            vec![Effect::Send(ClientFrame::Ping)]
        );
    }
}
