//! Per-vehicle stream state.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::types::{StreamEntry, TelemetrySample, VehicleDescriptor};

/// Keyed map of vehicle id to [`StreamEntry`].
///
/// Only the session's frame dispatcher writes to it; everybody else reads
/// cloned snapshots.
#[derive(Debug, Clone, Default)]
pub(crate) struct SubscriptionRegistry {
    entries: HashMap<String, StreamEntry>,
}

impl SubscriptionRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn get(&self, vehicle_id: &str) -> Option<&StreamEntry> {
        self.entries.get(vehicle_id)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn live_count(&self) -> usize {
        self.entries.values().filter(|e| e.is_live).count()
    }

    pub(crate) fn snapshot(&self) -> HashMap<String, StreamEntry> {
        self.entries.clone()
    }

    fn entry(&mut self, vehicle_id: &str) -> &mut StreamEntry {
        self.entries
            .entry(vehicle_id.to_string())
            .or_insert_with(|| StreamEntry::new(vehicle_id))
    }

    /// Subscribe acknowledgment: liveness as reported by the server.
    pub(crate) fn mark_subscribed(&mut self, vehicle_id: &str, is_streaming: bool) {
        self.entry(vehicle_id).is_live = is_streaming;
    }

    pub(crate) fn mark_streaming(
        &mut self,
        vehicle_id: &str,
        vehicle: Option<VehicleDescriptor>,
        at: DateTime<Utc>,
    ) {
        let entry = self.entry(vehicle_id);
        if vehicle.is_some() {
            entry.vehicle = vehicle;
        }
        entry.is_live = true;
        entry.last_update_at = Some(at);
    }

    pub(crate) fn mark_stream_ended(&mut self, vehicle_id: &str, at: DateTime<Utc>) {
        let entry = self.entry(vehicle_id);
        entry.is_live = false;
        entry.last_update_at = Some(at);
    }

    /// Apply a telemetry sample. The previous sample is replaced, not merged.
    pub(crate) fn apply_sample(
        &mut self,
        vehicle_id: &str,
        vehicle: Option<VehicleDescriptor>,
        sample: Option<TelemetrySample>,
        at: DateTime<Utc>,
    ) {
        let entry = self.entry(vehicle_id);
        if vehicle.is_some() {
            entry.vehicle = vehicle;
        }
        entry.latest_telemetry = sample;
        entry.is_live = true;
        entry.last_update_at = Some(at);
    }

    /// Unsubscribe acknowledgment: the entry is dropped entirely.
    pub(crate) fn remove(&mut self, vehicle_id: &str) -> Option<StreamEntry> {
        self.entries.remove(vehicle_id)
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}
