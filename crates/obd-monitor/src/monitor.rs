//! Turns published session snapshots into JSON lines on stdout.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;

use chrono::{DateTime, Utc};
use obd_stream::{
    ConnectionStatus, Session, SessionSnapshot, StreamEntry, TelemetrySample, VehicleDescriptor,
};
use serde::Serialize;
use tracing::info;

use crate::config::MonitorConfig;
use crate::error::{MonitorError, MonitorResult};

/// One output line.
#[derive(Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event<'a> {
    Status {
        status: ConnectionStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<&'a str>,
    },
    Liveness {
        vehicle_id: &'a str,
        is_live: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        vehicle: Option<&'a VehicleDescriptor>,
    },
    Telemetry {
        vehicle_id: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        at: Option<DateTime<Utc>>,
        data: &'a TelemetrySample,
    },
    Removed {
        vehicle_id: String,
    },
}

#[derive(Debug, PartialEq)]
struct Seen {
    is_live: bool,
    telemetry: Option<TelemetrySample>,
}

impl From<&StreamEntry> for Seen {
    fn from(entry: &StreamEntry) -> Self {
        Self {
            is_live: entry.is_live,
            telemetry: entry.latest_telemetry.clone(),
        }
    }
}

/// Remembers what has already been printed so each snapshot only yields the
/// changes since the previous one. Identical consecutive samples print once.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    status: Option<(ConnectionStatus, Option<String>)>,
    streams: HashMap<String, Seen>,
}

impl ChangeTracker {
    pub fn diff<'a>(&mut self, snapshot: &'a SessionSnapshot) -> Vec<Event<'a>> {
        let mut events = Vec::new();

        let status = (snapshot.status, snapshot.error.clone());
        if self.status.as_ref() != Some(&status) {
            events.push(Event::Status {
                status: snapshot.status,
                error: snapshot.error.as_deref(),
            });
            self.status = Some(status);
        }

        let mut removed: Vec<String> = self
            .streams
            .keys()
            .filter(|id| !snapshot.streams.contains_key(*id))
            .cloned()
            .collect();
        removed.sort();
        events.extend(
            removed
                .into_iter()
                .map(|vehicle_id| Event::Removed { vehicle_id }),
        );

        // Stable output order.
        let ordered: BTreeMap<&String, &StreamEntry> = snapshot.streams.iter().collect();
        for (id, entry) in ordered {
            let prev = self.streams.get(id);
            if prev.map(|p| p.is_live) != Some(entry.is_live) {
                events.push(Event::Liveness {
                    vehicle_id: id,
                    is_live: entry.is_live,
                    vehicle: entry.vehicle.as_ref(),
                });
            }
            if let Some(data) = &entry.latest_telemetry
                && prev.and_then(|p| p.telemetry.as_ref()) != Some(data)
            {
                events.push(Event::Telemetry {
                    vehicle_id: id,
                    at: entry.last_update_at,
                    data,
                });
            }
        }

        self.streams = snapshot
            .streams
            .iter()
            .map(|(id, entry)| (id.clone(), Seen::from(entry)))
            .collect();
        events
    }
}

/// Detects each new successful authentication, including ones that happened
/// between two snapshots this watcher saw.
#[derive(Debug, Default)]
pub struct AuthWatch {
    handled: u64,
}

impl AuthWatch {
    pub fn newly_authenticated(&mut self, snapshot: &SessionSnapshot) -> bool {
        if snapshot.is_connected() && snapshot.authentications != self.handled {
            self.handled = snapshot.authentications;
            true
        } else {
            false
        }
    }
}

/// What to ask the server for after every successful authentication.
#[derive(Debug, Clone, PartialEq)]
pub enum Targets {
    All,
    Vehicles(Vec<String>),
}

impl Targets {
    pub fn from_config(config: &MonitorConfig) -> Self {
        if config.all {
            Targets::All
        } else {
            Targets::Vehicles(config.vehicles.clone())
        }
    }

    fn request(&self, session: &Session) {
        match self {
            Targets::All => session.subscribe_to_all(),
            Targets::Vehicles(ids) => {
                for id in ids {
                    session.ensure_subscribed(id.as_str());
                }
            }
        }
    }
}

fn write_events(out: &mut impl Write, events: &[Event<'_>]) -> MonitorResult<()> {
    for event in events {
        serde_json::to_writer(&mut *out, event)?;
        writeln!(out)?;
    }
    out.flush()?;
    Ok(())
}

/// Run until Ctrl-C or until the session task goes away.
pub async fn run(config: MonitorConfig, out: &mut impl Write) -> MonitorResult<()> {
    let targets = Targets::from_config(&config);
    let session = Session::start(config.session_config()?);
    session.connect();

    let mut state = session.watch();
    let mut tracker = ChangeTracker::default();
    let mut auth = AuthWatch::default();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    let result = loop {
        let snapshot = state.borrow_and_update().clone();

        if auth.newly_authenticated(&snapshot) {
            info!(?targets, "Authenticated, requesting streams");
            targets.request(&session);
        }

        if let Err(e) = write_events(out, &tracker.diff(&snapshot)) {
            break Err(e);
        }

        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    break Ok(());
                }
            }
            signal = &mut ctrl_c => {
                info!("Interrupted, disconnecting");
                break signal.map_err(MonitorError::from);
            }
        }
    };

    session.shutdown().await;
    result
}
