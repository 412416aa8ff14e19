mod blackout;
mod conflict;
mod error;
mod grid;
mod mutations;
mod occupancy;
mod queries;
mod reschedule;
mod store;

pub use blackout::{apply_blackouts, merge_overlapping};
pub use error::EngineError;
pub use grid::{generate_slots, SlotGrid};
pub use occupancy::{annotate, occupied_count};
pub use store::{EventLog, MemoryLog, WalLog};

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, error};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability::{COMMIT_CONFLICTS_TOTAL, RESERVATIONS_COMMITTED_TOTAL, RESERVATION_REJECTIONS_TOTAL};

pub type SharedResourceState = Arc<RwLock<ResourceState>>;

pub struct Engine {
    pub(super) state: DashMap<Ulid, SharedResourceState>,
    /// Reverse lookup: blackout/reservation id → resource id.
    pub(super) entity_to_resource: Arc<DashMap<Ulid, Ulid>>,
    pub(super) log: Arc<dyn EventLog>,
    pub notify: Arc<NotifyHub>,
    /// Serializes resource creation against itself and against compaction.
    pub(super) create_lock: Mutex<()>,
}

/// Apply an event to a ResourceState. Caller holds the lock.
fn apply_to_resource(rs: &mut ResourceState, event: &Event, entity_map: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ResourceUpdated { resource } => {
            rs.resource = resource.clone();
            rs.revision += 1;
        }
        Event::BlackoutAdded { blackout } => {
            entity_map.insert(blackout.id, blackout.resource_id);
            rs.insert_blackout(blackout.clone());
            rs.revision += 1;
        }
        Event::BlackoutRemoved { id, .. } => {
            rs.remove_blackout(*id);
            entity_map.remove(id);
            rs.revision += 1;
        }
        Event::ReservationPlaced { reservation } => {
            entity_map.insert(reservation.id, reservation.resource_id);
            rs.remove_reservation(reservation.id);
            rs.insert_reservation(reservation.clone());
        }
        Event::ReservationConfirmed { id, at, .. } => {
            if let Some(r) = rs.reservation_mut(*id) {
                r.status = ReservationStatus::Confirmed;
                r.version += 1;
                r.updated_at = *at;
            }
        }
        Event::ReservationRescheduled { id, span, at, .. } => {
            // Re-insert to keep the timeline sorted by start.
            if let Some(mut r) = rs.remove_reservation(*id) {
                r.span = *span;
                r.version += 1;
                r.updated_at = *at;
                rs.insert_reservation(r);
            }
        }
        Event::ReservationCancelled { id, at, .. } => {
            if let Some(r) = rs.reservation_mut(*id) {
                r.status = ReservationStatus::Cancelled;
                r.version += 1;
                r.updated_at = *at;
            }
        }
        // Handled at the DashMap level, not here
        Event::ResourceCreated { .. } => {}
    }
}

impl Engine {
    /// Open the write-ahead log at `path`, replay it and start serving.
    /// Must be called inside a tokio runtime (spawns the log writer).
    pub fn new(wal_path: &Path, notify: Arc<NotifyHub>) -> io::Result<Self> {
        let (log, events) = WalLog::open(wal_path)?;
        Ok(Self::with_log(Arc::new(log), events, notify))
    }

    /// Engine backed by an in-process log. Nothing survives a restart.
    pub fn in_memory(notify: Arc<NotifyHub>) -> Self {
        Self::with_log(Arc::new(MemoryLog::new()), Vec::new(), notify)
    }

    /// Build the in-memory projection of `events`, then append new events to `log`.
    pub fn with_log(log: Arc<dyn EventLog>, events: Vec<Event>, notify: Arc<NotifyHub>) -> Self {
        let entity_to_resource = Arc::new(DashMap::new());
        let mut resources: HashMap<Ulid, ResourceState> = HashMap::new();

        for event in &events {
            match event {
                Event::ResourceCreated { resource } => {
                    resources.insert(resource.id, ResourceState::new(resource.clone()));
                }
                other => match resources.get_mut(&other.resource_id()) {
                    Some(rs) => apply_to_resource(rs, other, &entity_to_resource),
                    None => debug!(kind = other.kind(), "replay: event for unknown resource skipped"),
                },
            }
        }

        let state = DashMap::new();
        for (id, rs) in resources {
            state.insert(id, Arc::new(RwLock::new(rs)));
        }

        Self {
            state,
            entity_to_resource,
            log,
            notify,
            create_lock: Mutex::new(()),
        }
    }

    pub fn get_resource(&self, id: &Ulid) -> Option<SharedResourceState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_resource_for_entity(&self, entity_id: &Ulid) -> Option<Ulid> {
        self.entity_to_resource.get(entity_id).map(|e| *e.value())
    }

    pub fn resource_count(&self) -> usize {
        self.state.len()
    }

    /// Lookup entity → resource, get resource, acquire write lock.
    pub(super) async fn resolve_entity_write(
        &self,
        entity_id: &Ulid,
    ) -> Option<(Ulid, OwnedRwLockWriteGuard<ResourceState>)> {
        let resource_id = self.get_resource_for_entity(entity_id)?;
        let rs = self.get_resource(&resource_id)?;
        let guard = rs.write_owned().await;
        Some((resource_id, guard))
    }

    /// Log-append + apply + notify under the held write lock.
    ///
    /// Runs in its own task: once started, the commit finishes even if the
    /// caller's future is dropped, so the log and the in-memory state never
    /// disagree.
    pub(super) async fn commit(
        &self,
        guard: OwnedRwLockWriteGuard<ResourceState>,
        event: Event,
    ) -> Result<(), EngineError> {
        let log = self.log.clone();
        let notify = self.notify.clone();
        let entity_map = self.entity_to_resource.clone();
        let task = tokio::spawn(async move {
            let mut guard = guard;
            log.append(&event).await?;
            apply_to_resource(&mut guard, &event, &entity_map);
            drop(guard);
            notify.send(event.resource_id(), &event);
            Ok::<(), EngineError>(())
        });
        task.await
            .map_err(|e| EngineError::Storage(format!("commit task failed: {e}")))?
    }
}

/// Run `op`, and run it once more if it lost a race with a concurrent commit.
pub async fn retry_once<T, F, Fut>(mut op: F) -> Result<T, EngineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, EngineError>>,
{
    match op().await {
        Err(e) if e.is_retryable() => {
            debug!("retrying after {e}");
            op().await
        }
        other => other,
    }
}

/// Count and log the outcome of a reservation mutation.
pub(super) fn observe<T>(op: &'static str, result: &Result<T, EngineError>) {
    match result {
        Ok(_) => {
            metrics::counter!(RESERVATIONS_COMMITTED_TOTAL, "op" => op).increment(1);
        }
        Err(e) if e.is_booking_rejection() => {
            metrics::counter!(RESERVATION_REJECTIONS_TOTAL, "reason" => e.reason()).increment(1);
            debug!(op, "rejected: {e}");
        }
        Err(e) if e.is_retryable() => {
            metrics::counter!(COMMIT_CONFLICTS_TOTAL, "op" => op).increment(1);
            debug!(op, "{e}");
        }
        Err(e @ (EngineError::InvalidResourceConfig(_) | EngineError::Storage(_))) => {
            error!(op, "{e}");
        }
        Err(e) => debug!(op, "{e}"),
    }
}
