//! Connection management: the background event loop that drives a
//! [`SessionMachine`] over a real WebSocket.
//!
//! Everything that can wake the session (a command from the handle, an
//! inbound frame, a channel open completing, a heartbeat tick, a reconnect
//! deadline) is a branch of one `select!`, so inputs are handled strictly one
//! at a time. The channel halves, the in-flight open, and both timers are
//! plain fields of [`EventLoopState`]: tearing down means dropping them.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

use crate::Error;
use crate::credentials::CredentialSource;
use crate::heartbeat::Heartbeat;
use crate::protocol::{ClientFrame, encode_frame};
use crate::session::{Effect, Input, SessionMachine};
use crate::types::{SessionSnapshot, TimingConfig};

// ---------------------------------------------------------------------------
// Type aliases for WebSocket split halves
// ---------------------------------------------------------------------------

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

pub(crate) type WsRead = SplitStream<WsStream>;
pub(crate) type WsWrite = SplitSink<WsStream, tungstenite::Message>;

type OpenFuture = Pin<Box<dyn Future<Output = Result<WsStream, Error>> + Send>>;

// ---------------------------------------------------------------------------
// Commands from the handle
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub(crate) enum Command {
    Connect,
    Disconnect,
    Subscribe(String),
    EnsureSubscribed(String),
    Unsubscribe(String),
    SubscribeAll,
    DismissError,
}

// ---------------------------------------------------------------------------
// Background event loop
// ---------------------------------------------------------------------------

pub(crate) struct EventLoopState {
    pub endpoint: String,
    pub credentials: Box<dyn CredentialSource>,
    pub timing: TimingConfig,
    pub machine: SessionMachine,
    pub state_tx: watch::Sender<SessionSnapshot>,
    pub ws_read: Option<WsRead>,
    pub ws_write: Option<WsWrite>,
    pub opening: Option<OpenFuture>,
    pub heartbeat: Heartbeat,
    pub reconnect_at: Option<Instant>,
}

impl EventLoopState {
    pub(crate) fn new(
        endpoint: String,
        credentials: Box<dyn CredentialSource>,
        timing: TimingConfig,
        machine: SessionMachine,
        state_tx: watch::Sender<SessionSnapshot>,
    ) -> Self {
        Self {
            endpoint,
            credentials,
            heartbeat: Heartbeat::new(timing.heartbeat_interval),
            timing,
            machine,
            state_tx,
            ws_read: None,
            ws_write: None,
            opening: None,
            reconnect_at: None,
        }
    }
}

pub(crate) async fn run_event_loop(
    mut p: EventLoopState,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(command) => handle_command(&mut p, command).await,
                    None => {
                        tracing::debug!("Session handle dropped, tearing down");
                        dispatch(&mut p, Input::Disconnect).await;
                        return;
                    }
                }
            }

            result = poll_open(&mut p.opening) => {
                p.opening = None;
                match result {
                    Ok(ws) => {
                        let (ws_write, ws_read) = ws.split();
                        p.ws_write = Some(ws_write);
                        p.ws_read = Some(ws_read);
                        dispatch(&mut p, Input::ChannelOpened).await;
                    }
                    Err(e) => {
                        dispatch(&mut p, Input::ChannelFailed { reason: e.to_string() }).await;
                    }
                }
            }

            frame = next_frame(&mut p.ws_read) => {
                handle_frame(&mut p, frame).await;
            }

            () = p.heartbeat.tick() => {
                dispatch(&mut p, Input::HeartbeatDue).await;
            }

            () = sleep_until(p.reconnect_at) => {
                p.reconnect_at = None;
                tracing::info!("Reconnecting");
                let token = p.credentials.bearer_token();
                dispatch(&mut p, Input::Connect { token }).await;
            }
        }
    }
}

async fn poll_open(opening: &mut Option<OpenFuture>) -> Result<WsStream, Error> {
    match opening.as_mut() {
        Some(fut) => fut.as_mut().await,
        None => std::future::pending().await,
    }
}

async fn next_frame(
    ws_read: &mut Option<WsRead>,
) -> Option<Result<tungstenite::Message, tungstenite::Error>> {
    match ws_read.as_mut() {
        Some(read) => read.next().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn handle_command(p: &mut EventLoopState, command: Command) {
    tracing::debug!(?command, status = %p.machine.status(), "Handling command");
    let input = match command {
        Command::Connect => Input::Connect {
            token: p.credentials.bearer_token(),
        },
        Command::Disconnect => Input::Disconnect,
        Command::Subscribe(vehicle_id) => Input::Subscribe(vehicle_id),
        Command::EnsureSubscribed(vehicle_id) => Input::EnsureSubscribed(vehicle_id),
        Command::Unsubscribe(vehicle_id) => Input::Unsubscribe(vehicle_id),
        Command::SubscribeAll => Input::SubscribeAll,
        Command::DismissError => Input::DismissError,
    };
    dispatch(p, input).await;
}

async fn handle_frame(
    p: &mut EventLoopState,
    frame: Option<Result<tungstenite::Message, tungstenite::Error>>,
) {
    match frame {
        Some(Ok(tungstenite::Message::Text(text))) => {
            dispatch(p, Input::Text(text.as_str().to_owned())).await;
        }
        Some(Ok(tungstenite::Message::Close(close))) => {
            // tungstenite queued the close reply on receipt; flush it so the
            // server sees a finished handshake rather than a dropped socket.
            if let Some(mut ws_write) = p.ws_write.take()
                && let Err(e) = ws_write.close().await
            {
                tracing::debug!("Close reply not delivered: {e}");
            }
            drop_channel(p);
            let (code, reason) = match close {
                Some(f) => (Some(u16::from(f.code)), f.reason.as_str().to_owned()),
                None => (None, String::new()),
            };
            dispatch(p, Input::ChannelClosed { code, reason }).await;
        }
        Some(Ok(_)) => {
            // Ignore binary, ping, pong frames
        }
        Some(Err(e)) => {
            drop_channel(p);
            dispatch(
                p,
                Input::ChannelFailed {
                    reason: format!("Connection error: {e}"),
                },
            )
            .await;
        }
        None => {
            drop_channel(p);
            dispatch(
                p,
                Input::ChannelClosed {
                    code: None,
                    reason: "stream ended".to_string(),
                },
            )
            .await;
        }
    }
}

/// Feed one input to the machine, publish the new state, then carry out the
/// resulting effects. An effect that fails (a send on a dead socket) is
/// turned into a follow-up input and handled in the same call.
async fn dispatch(p: &mut EventLoopState, input: Input) {
    let mut pending = VecDeque::from([input]);
    while let Some(input) = pending.pop_front() {
        let effects = p.machine.step(input);
        publish(p);
        for effect in effects {
            if let Some(follow_up) = apply_effect(p, effect).await {
                pending.push_back(follow_up);
            }
        }
    }
}

fn publish(p: &EventLoopState) {
    let next = p.machine.snapshot();
    p.state_tx.send_if_modified(|current| {
        if *current == next {
            false
        } else {
            if current.status != next.status {
                tracing::debug!(from = %current.status, to = %next.status, "Status changed");
            }
            *current = next;
            true
        }
    });
}

async fn apply_effect(p: &mut EventLoopState, effect: Effect) -> Option<Input> {
    match effect {
        Effect::OpenChannel => {
            drop_channel(p);
            tracing::info!(endpoint = %p.endpoint, "Opening channel");
            p.opening = Some(open_channel(p.endpoint.clone(), p.timing));
        }
        Effect::Send(frame) => return send_frame(p, &frame).await,
        Effect::StartHeartbeat => p.heartbeat.start(),
        Effect::StopHeartbeat => p.heartbeat.stop(),
        Effect::CloseChannel { code, reason } => {
            p.opening = None;
            p.ws_read = None;
            if let Some(mut ws_write) = p.ws_write.take() {
                let close = tungstenite::Message::Close(Some(CloseFrame {
                    code: CloseCode::from(code),
                    reason: reason.into(),
                }));
                if let Err(e) = ws_write.send(close).await {
                    tracing::debug!("Close frame not delivered: {e}");
                }
            }
        }
        Effect::ScheduleReconnect(delay) => {
            p.reconnect_at = Some(Instant::now() + delay);
        }
        Effect::CancelReconnect => {
            p.reconnect_at = None;
        }
    }
    None
}

fn open_channel(url: String, timing: TimingConfig) -> OpenFuture {
    Box::pin(async move {
        match tokio::time::timeout(timing.connect_timeout, tokio_tungstenite::connect_async(url))
            .await
        {
            Ok(Ok((ws, _resp))) => Ok(ws),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(Error::OpenTimeout(timing.connect_timeout)),
        }
    })
}

async fn send_frame(p: &mut EventLoopState, frame: &ClientFrame) -> Option<Input> {
    let Some(ws_write) = p.ws_write.as_mut() else {
        tracing::debug!(frame_type = frame.kind(), "No open channel, frame dropped");
        return None;
    };
    let text = match encode_frame(frame) {
        Ok(text) => text,
        Err(e) => {
            tracing::warn!(frame_type = frame.kind(), "Failed to encode frame: {e}");
            return None;
        }
    };
    match ws_write.send(tungstenite::Message::Text(text.into())).await {
        Ok(()) => {
            tracing::trace!(frame_type = frame.kind(), "Frame sent");
            None
        }
        Err(e) => {
            drop_channel(p);
            Some(Input::ChannelFailed {
                reason: format!("Send failed: {e}"),
            })
        }
    }
}

fn drop_channel(p: &mut EventLoopState) {
    p.opening = None;
    p.ws_read = None;
    p.ws_write = None;
}
