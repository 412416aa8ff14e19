use tracing::info;
use ulid::Ulid;

use crate::model::*;

use super::conflict::{candidate_slots, check_capacity, validate_span};
use super::{observe, Engine, EngineError};

impl Engine {
    /// Move a reservation to `new_start`, keeping its id and duration.
    ///
    /// The target is validated exactly like a fresh booking, except the
    /// reservation being moved does not count against the target's capacity.
    /// On any failure the reservation is left untouched.
    pub async fn reschedule_reservation(&self, id: Ulid, new_start: Ms) -> Result<Reservation, EngineError> {
        let result = self.reschedule_inner(id, new_start).await;
        observe("reschedule", &result);
        result
    }

    async fn reschedule_inner(&self, id: Ulid, new_start: Ms) -> Result<Reservation, EngineError> {
        let resource_id = self
            .get_resource_for_entity(&id)
            .ok_or(EngineError::ReservationNotFound(id))?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::ResourceNotFound(resource_id))?;

        let (resource, revision, current, target, blackouts) = {
            let guard = rs.read().await;
            let current = guard
                .reservation(id)
                .cloned()
                .ok_or(EngineError::ReservationNotFound(id))?;
            ensure_movable(&current, now_ms())?;
            let end = new_start
                .checked_add(current.span.duration_ms())
                .ok_or(EngineError::LimitExceeded("timestamp out of range"))?;
            let target = Span { start: new_start, end };
            validate_span(&target)?;
            let blackouts: Vec<Blackout> = guard.blackouts_overlapping(&target).cloned().collect();
            (guard.resource.clone(), guard.revision, current, target, blackouts)
        };
        let slots = candidate_slots(&resource, &blackouts, &target)?;

        let guard = rs.write_owned().await;
        if guard.revision != revision {
            return Err(EngineError::ConcurrentModificationConflict(resource_id));
        }
        let live_version = guard.reservation(id).map(|r| r.version);
        if live_version != Some(current.version) {
            return Err(EngineError::ConcurrentModificationConflict(id));
        }
        let now = now_ms();
        // Only a pending hold can change state by time alone.
        ensure_movable(&current, now)?;
        check_capacity(&guard, &slots, Some(id), now)?;

        self.commit(
            guard,
            Event::ReservationRescheduled { id, resource_id, span: target, at: now },
        )
        .await?;

        info!(
            reservation = %id,
            resource = %resource_id,
            from = current.span.start,
            to = target.start,
            "reservation rescheduled"
        );
        let mut moved = current;
        moved.span = target;
        moved.version += 1;
        moved.updated_at = now;
        Ok(moved)
    }
}

fn ensure_movable(reservation: &Reservation, now: Ms) -> Result<(), EngineError> {
    match reservation.status {
        ReservationStatus::Confirmed => Ok(()),
        ReservationStatus::Pending { expires_at } if expires_at > now => Ok(()),
        ReservationStatus::Pending { .. } => Err(EngineError::InvalidTransition {
            id: reservation.id,
            status: "expired",
        }),
        ReservationStatus::Cancelled => Err(EngineError::InvalidTransition {
            id: reservation.id,
            status: "cancelled",
        }),
    }
}
