use ulid::Ulid;

use crate::model::*;

use super::blackout::apply_blackouts;
use super::conflict::validate_window;
use super::grid::generate_slots;
use super::occupancy::annotate;
use super::{Engine, EngineError};

impl Engine {
    /// Every open, non-blacked-out slot in `[from, to)` with its occupancy,
    /// full ones included.
    pub async fn list_slots(&self, resource_id: Ulid, from: Ms, to: Ms) -> Result<Vec<Slot>, EngineError> {
        validate_window(from, to)?;
        if from >= to {
            return Ok(Vec::new());
        }
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::ResourceNotFound(resource_id))?;

        // Copy what the window needs, then compute without holding the lock.
        let window = Span::new(from, to);
        let (resource, blackouts, reservations) = {
            let guard = rs.read().await;
            (
                guard.resource.clone(),
                guard.blackouts_overlapping(&window).cloned().collect::<Vec<_>>(),
                guard.reservations_overlapping(&window).cloned().collect::<Vec<_>>(),
            )
        };

        let grid = generate_slots(&resource, from, to)?;
        let open = apply_blackouts(grid, &blackouts);
        Ok(annotate(open, &reservations, resource.max_concurrent, now_ms(), None).collect())
    }

    /// Slots in `[from, to)` that can still take a booking.
    pub async fn list_available_slots(
        &self,
        resource_id: Ulid,
        from: Ms,
        to: Ms,
    ) -> Result<Vec<Slot>, EngineError> {
        let mut slots = self.list_slots(resource_id, from, to).await?;
        slots.retain(|s| s.available);
        Ok(slots)
    }

    /// Blackouts overlapping `[from, to)`, in start order.
    pub async fn list_blackouts(&self, resource_id: Ulid, from: Ms, to: Ms) -> Result<Vec<Blackout>, EngineError> {
        validate_window(from, to)?;
        if from >= to {
            return Ok(Vec::new());
        }
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::ResourceNotFound(resource_id))?;
        let guard = rs.read().await;
        Ok(guard
            .blackouts_overlapping(&Span::new(from, to))
            .cloned()
            .collect())
    }

    /// Reservations on a resource in start order, cancelled ones included.
    /// With a window, only those overlapping it.
    pub async fn list_reservations(
        &self,
        resource_id: Ulid,
        window: Option<(Ms, Ms)>,
    ) -> Result<Vec<Reservation>, EngineError> {
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::ResourceNotFound(resource_id))?;
        let guard = rs.read().await;
        match window {
            None => Ok(guard.reservations.clone()),
            Some((from, to)) => {
                validate_window(from, to)?;
                if from >= to {
                    return Ok(Vec::new());
                }
                Ok(guard
                    .reservations_overlapping(&Span::new(from, to))
                    .cloned()
                    .collect())
            }
        }
    }

    pub async fn get_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        let resource_id = self
            .get_resource_for_entity(&id)
            .ok_or(EngineError::ReservationNotFound(id))?;
        let rs = self
            .get_resource(&resource_id)
            .ok_or(EngineError::ReservationNotFound(id))?;
        let guard = rs.read().await;
        guard
            .reservation(id)
            .cloned()
            .ok_or(EngineError::ReservationNotFound(id))
    }

    pub async fn get_resource_config(&self, id: Ulid) -> Result<Resource, EngineError> {
        let rs = self
            .get_resource(&id)
            .ok_or(EngineError::ResourceNotFound(id))?;
        let guard = rs.read().await;
        Ok(guard.resource.clone())
    }

    /// All resources, ordered by id.
    pub async fn list_resources(&self) -> Vec<Resource> {
        let shared: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::with_capacity(shared.len());
        for rs in shared {
            out.push(rs.read().await.resource.clone());
        }
        out.sort_by_key(|r| r.id);
        out
    }
}
