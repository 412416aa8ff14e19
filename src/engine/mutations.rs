use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{error, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::RESOURCES_ACTIVE;

use super::conflict::{candidate_slots, check_capacity, requested_span, validate_span};
use super::{observe, Engine, EngineError};

fn validate_resource_fields(resource: &Resource) -> Result<(), EngineError> {
    if resource.name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("resource name too long"));
    }
    if resource.category.len() > MAX_CATEGORY_LEN {
        return Err(EngineError::LimitExceeded("category too long"));
    }
    if resource.timezone.len() > MAX_TIMEZONE_LEN {
        return Err(EngineError::LimitExceeded("timezone name too long"));
    }
    resource.validate().inspect_err(|e| {
        error!(resource = %resource.id, "rejected resource config: {e}");
    })
}

impl Engine {
    pub async fn create_resource(&self, resource: Resource) -> Result<Resource, EngineError> {
        validate_resource_fields(&resource)?;

        let _create = self.create_lock.lock().await;
        if self.state.len() >= MAX_RESOURCES {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        if self.state.contains_key(&resource.id) {
            return Err(EngineError::AlreadyExists(resource.id));
        }

        let event = Event::ResourceCreated { resource: resource.clone() };
        self.log.append(&event).await?;
        let rs = ResourceState::new(resource.clone());
        self.state.insert(resource.id, Arc::new(RwLock::new(rs)));
        metrics::gauge!(RESOURCES_ACTIVE).set(self.state.len() as f64);
        self.notify.send(resource.id, &event);
        info!(resource = %resource.id, name = %resource.name, "resource created");
        Ok(resource)
    }

    /// Replace a resource's configuration. Existing reservations stay as they
    /// are; only new bookings and moves see the new grid.
    pub async fn update_resource(&self, resource: Resource) -> Result<Resource, EngineError> {
        validate_resource_fields(&resource)?;
        let rs = self
            .get_resource(&resource.id)
            .ok_or(EngineError::ResourceNotFound(resource.id))?;
        let guard = rs.write_owned().await;
        self.commit(guard, Event::ResourceUpdated { resource: resource.clone() })
            .await?;
        info!(resource = %resource.id, "resource updated");
        Ok(resource)
    }

    pub async fn create_blackout(
        &self,
        id: Ulid,
        resource_id: Ulid,
        span: Span,
        reason: Option<String>,
    ) -> Result<Blackout, EngineError> {
        validate_span(&span)?;
        if span.duration_ms() > MAX_BLACKOUT_MS {
            return Err(EngineError::LimitExceeded("blackout too long"));
        }
        if let Some(ref r) = reason
            && r.len() > MAX_REASON_LEN
        {
            return Err(EngineError::LimitExceeded("reason too long"));
        }
        if self.entity_to_resource.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::ResourceNotFound(resource_id))?;
        let guard = rs.write_owned().await;
        if guard.interval_count() >= MAX_INTERVALS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many intervals on resource"));
        }

        let blackout = Blackout { id, resource_id, span, reason };
        self.commit(guard, Event::BlackoutAdded { blackout: blackout.clone() })
            .await?;
        info!(blackout = %id, resource = %resource_id, "blackout added");
        Ok(blackout)
    }

    pub async fn delete_blackout(&self, id: Ulid) -> Result<Blackout, EngineError> {
        let (resource_id, guard) = self
            .resolve_entity_write(&id)
            .await
            .ok_or(EngineError::BlackoutNotFound(id))?;
        let blackout = guard
            .blackouts
            .iter()
            .find(|b| b.id == id)
            .cloned()
            .ok_or(EngineError::BlackoutNotFound(id))?;
        self.commit(guard, Event::BlackoutRemoved { id, resource_id })
            .await?;
        info!(blackout = %id, resource = %resource_id, "blackout removed");
        Ok(blackout)
    }

    /// Book `slot_count` consecutive slots starting at `start`.
    pub async fn create_reservation(
        &self,
        id: Ulid,
        resource_id: Ulid,
        requester_id: String,
        start: Ms,
        slot_count: u32,
    ) -> Result<Reservation, EngineError> {
        let result = self
            .place_reservation(id, resource_id, requester_id, start, slot_count, ReservationStatus::Confirmed)
            .await;
        observe("create", &result);
        result
    }

    /// Like `create_reservation`, but the booking lapses at `expires_at`
    /// unless confirmed first.
    pub async fn hold_reservation(
        &self,
        id: Ulid,
        resource_id: Ulid,
        requester_id: String,
        start: Ms,
        slot_count: u32,
        expires_at: Ms,
    ) -> Result<Reservation, EngineError> {
        let result = if expires_at <= now_ms() {
            Err(EngineError::LimitExceeded("hold expiry is in the past"))
        } else {
            let status = ReservationStatus::Pending { expires_at };
            self.place_reservation(id, resource_id, requester_id, start, slot_count, status)
                .await
        };
        observe("hold", &result);
        result
    }

    async fn place_reservation(
        &self,
        id: Ulid,
        resource_id: Ulid,
        requester_id: String,
        start: Ms,
        slot_count: u32,
        status: ReservationStatus,
    ) -> Result<Reservation, EngineError> {
        if requester_id.len() > MAX_REQUESTER_LEN {
            return Err(EngineError::LimitExceeded("requester id too long"));
        }
        if self.entity_to_resource.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::ResourceNotFound(resource_id))?;

        // Read phase: snapshot under the shared lock, validate outside it.
        let (resource, revision, span, blackouts) = {
            let guard = rs.read().await;
            let span = requested_span(&guard.resource, start, slot_count)?;
            let blackouts: Vec<Blackout> = guard.blackouts_overlapping(&span).cloned().collect();
            (guard.resource.clone(), guard.revision, span, blackouts)
        };
        let slots = candidate_slots(&resource, &blackouts, &span)?;

        // Commit phase: recount and write under the exclusive lock.
        let guard = rs.write_owned().await;
        if guard.revision != revision {
            return Err(EngineError::ConcurrentModificationConflict(resource_id));
        }
        if guard.interval_count() >= MAX_INTERVALS_PER_RESOURCE {
            return Err(EngineError::LimitExceeded("too many intervals on resource"));
        }
        if self.entity_to_resource.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        let now = now_ms();
        check_capacity(&guard, &slots, None, now)?;

        let reservation = Reservation {
            id,
            resource_id,
            requester_id,
            span,
            status,
            version: 0,
            created_at: now,
            updated_at: now,
        };
        self.commit(guard, Event::ReservationPlaced { reservation: reservation.clone() })
            .await?;
        info!(
            reservation = %id,
            resource = %resource_id,
            start = span.start,
            status = status.label(),
            "reservation placed"
        );
        Ok(reservation)
    }

    /// Turn a live pending hold into a confirmed reservation.
    pub async fn confirm_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let result = self.confirm_inner(id).await;
        observe("confirm", &result);
        result
    }

    async fn confirm_inner(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let (resource_id, guard) = self
            .resolve_entity_write(&id)
            .await
            .ok_or(EngineError::ReservationNotFound(id))?;
        let mut reservation = guard
            .reservation(id)
            .cloned()
            .ok_or(EngineError::ReservationNotFound(id))?;
        let now = now_ms();
        match reservation.status {
            ReservationStatus::Pending { expires_at } if expires_at > now => {}
            ReservationStatus::Pending { .. } => {
                return Err(EngineError::InvalidTransition { id, status: "expired" });
            }
            other => {
                return Err(EngineError::InvalidTransition { id, status: other.label() });
            }
        }

        self.commit(guard, Event::ReservationConfirmed { id, resource_id, at: now })
            .await?;
        reservation.status = ReservationStatus::Confirmed;
        reservation.version += 1;
        reservation.updated_at = now;
        Ok(reservation)
    }

    /// Cancel a pending or confirmed reservation. The record is kept.
    pub async fn cancel_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let result = self.cancel_inner(id).await;
        observe("cancel", &result);
        result
    }

    async fn cancel_inner(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let (resource_id, guard) = self
            .resolve_entity_write(&id)
            .await
            .ok_or(EngineError::ReservationNotFound(id))?;
        let mut reservation = guard
            .reservation(id)
            .cloned()
            .ok_or(EngineError::ReservationNotFound(id))?;
        if reservation.is_cancelled() {
            return Err(EngineError::InvalidTransition { id, status: "cancelled" });
        }

        let now = now_ms();
        self.commit(guard, Event::ReservationCancelled { id, resource_id, at: now })
            .await?;
        reservation.status = ReservationStatus::Cancelled;
        reservation.version += 1;
        reservation.updated_at = now;
        Ok(reservation)
    }

    /// Pending holds whose expiry is at or before `now`, as (reservation, resource).
    /// Resources that are locked right now are skipped until the next sweep.
    pub fn collect_expired_holds(&self, now: Ms) -> Vec<(Ulid, Ulid)> {
        let mut expired = Vec::new();
        for entry in self.state.iter() {
            let rs = entry.value().clone();
            if let Ok(guard) = rs.try_read() {
                for r in &guard.reservations {
                    if let ReservationStatus::Pending { expires_at } = r.status
                        && expires_at <= now
                    {
                        expired.push((r.id, guard.resource.id));
                    }
                }
            }
        }
        expired
    }

    /// Cancel a hold that has lapsed. Returns false if it was confirmed,
    /// cancelled or extended in the meantime.
    pub async fn expire_hold(&self, id: Ulid, now: Ms) -> Result<bool, EngineError> {
        let (resource_id, guard) = self
            .resolve_entity_write(&id)
            .await
            .ok_or(EngineError::ReservationNotFound(id))?;
        let lapsed = matches!(
            guard.reservation(id).map(|r| r.status),
            Some(ReservationStatus::Pending { expires_at }) if expires_at <= now
        );
        if !lapsed {
            return Ok(false);
        }
        self.commit(guard, Event::ReservationCancelled { id, resource_id, at: now })
            .await?;
        Ok(true)
    }

    /// Rewrite the event log with only the events needed to recreate the current state.
    pub async fn compact_log(&self) -> Result<(), EngineError> {
        // Holding every read lock (and the create lock) keeps commits out
        // until the rewritten log is in place.
        let _create = self.create_lock.lock().await;
        let mut shared: Vec<(Ulid, super::SharedResourceState)> = self
            .state
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        shared.sort_by_key(|(id, _)| *id);

        let mut guards = Vec::with_capacity(shared.len());
        for (_, rs) in shared {
            guards.push(rs.read_owned().await);
        }

        let mut events = Vec::new();
        for guard in &guards {
            events.push(Event::ResourceCreated { resource: guard.resource.clone() });
            for blackout in &guard.blackouts {
                events.push(Event::BlackoutAdded { blackout: blackout.clone() });
            }
            for reservation in &guard.reservations {
                events.push(Event::ReservationPlaced { reservation: reservation.clone() });
            }
        }

        let count = events.len();
        self.log.compact(events).await?;
        info!(events = count, resources = guards.len(), "event log compacted");
        Ok(())
    }

    pub async fn log_appends_since_compact(&self) -> u64 {
        self.log.appends_since_compact().await
    }
}
