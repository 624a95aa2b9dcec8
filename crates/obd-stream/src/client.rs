//! Public entry point: [`Session`].

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::connection::{Command, EventLoopState, run_event_loop};
use crate::endpoint::resolve_endpoint;
use crate::session::SessionMachine;
use crate::types::{ConnectionStatus, SessionConfig, SessionSnapshot, StreamEntry};

/// Handle to a telemetry session.
///
/// All operations are fire-and-forget requests to the session's background
/// task: their outcome shows up later in the published [`SessionSnapshot`].
/// None of them fail; transport and protocol problems surface through
/// [`status`](Session::status) and [`error`](Session::error).
///
/// Dropping the handle tears the session down exactly like
/// [`disconnect`](Session::disconnect) and stops the background task.
pub struct Session {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionSnapshot>,
    task: JoinHandle<()>,
}

impl Session {
    /// Create a session and spawn its background task. Does not connect.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: SessionConfig) -> Self {
        let endpoint = resolve_endpoint(config.origin.as_deref());
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(SessionSnapshot::default());
        let machine = SessionMachine::new(&config.timing, config.resubscribe_on_auth);

        let task = tokio::spawn(run_event_loop(
            EventLoopState::new(
                endpoint,
                config.credentials,
                config.timing,
                machine,
                state_tx,
            ),
            commands_rx,
        ));

        Session {
            commands,
            state,
            task,
        }
    }

    fn send(&self, command: Command) {
        if let Err(e) = self.commands.send(command) {
            tracing::warn!(command = ?e.0, "Session task is gone, command dropped");
        }
    }

    /// Open the channel and authenticate. No-op while connecting or connected.
    ///
    /// The request is queued to the session task, so the outcome is not
    /// visible on return. Without a credential the task moves straight to
    /// `Error` ("Not authenticated") in one step, never passing through
    /// `Connecting`; observe it through [`watch`](Session::watch).
    pub fn connect(&self) {
        self.send(Command::Connect);
    }

    /// Close the channel, cancel any pending reconnect, and clear all streams.
    pub fn disconnect(&self) {
        self.send(Command::Disconnect);
    }

    /// Ask the server for one vehicle's stream. Dropped unless authenticated.
    pub fn subscribe_to_vehicle(&self, vehicle_id: impl Into<String>) {
        self.send(Command::Subscribe(vehicle_id.into()));
    }

    /// Like [`subscribe_to_vehicle`](Session::subscribe_to_vehicle), but only
    /// sends a request if none was sent for this vehicle on the current channel.
    pub fn ensure_subscribed(&self, vehicle_id: impl Into<String>) {
        self.send(Command::EnsureSubscribed(vehicle_id.into()));
    }

    /// The entry is removed once the server acknowledges.
    pub fn unsubscribe_from_vehicle(&self, vehicle_id: impl Into<String>) {
        self.send(Command::Unsubscribe(vehicle_id.into()));
    }

    pub fn subscribe_to_all(&self) {
        self.send(Command::SubscribeAll);
    }

    pub fn dismiss_error(&self) {
        self.send(Command::DismissError);
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.borrow().status
    }

    pub fn error(&self) -> Option<String> {
        self.state.borrow().error.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.borrow().is_connected()
    }

    pub fn active_stream_count(&self) -> usize {
        self.state.borrow().active_stream_count()
    }

    pub fn stream(&self, vehicle_id: &str) -> Option<StreamEntry> {
        self.state.borrow().stream(vehicle_id).cloned()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    /// Receiver notified on every status, error, or stream change.
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.clone()
    }

    /// Tear the session down and wait for the background task to exit.
    pub async fn shutdown(self) {
        let Session {
            commands,
            state: _,
            task,
        } = self;
        drop(commands);
        if let Err(e) = task.await {
            tracing::warn!("Session task ended abnormally: {e}");
        }
    }
}
