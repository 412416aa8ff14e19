use thiserror::Error;
use ulid::Ulid;

use crate::model::{Ms, Span};

/// Shared by every engine operation, so reservation and reschedule callers
/// handle the same kinds.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed open hours, slot duration, capacity or timezone.
    #[error("invalid resource config: {0}")]
    InvalidResourceConfig(String),

    #[error("slot not open: [{}, {}) is outside open hours or off the slot grid", .0.start, .0.end)]
    SlotNotOpen(Span),

    #[error("slot blacked out by {0}")]
    SlotBlackedOut(Ulid),

    #[error("slot full: capacity {capacity} reached at {at}")]
    SlotFull { capacity: u32, at: Ms },

    #[error("reservation not found: {0}")]
    ReservationNotFound(Ulid),

    #[error("resource not found: {0}")]
    ResourceNotFound(Ulid),

    #[error("blackout not found: {0}")]
    BlackoutNotFound(Ulid),

    /// State moved between validation and commit. Safe to retry once with fresh data.
    #[error("concurrent modification of {0}, retry")]
    ConcurrentModificationConflict(Ulid),

    #[error("already exists: {0}")]
    AlreadyExists(Ulid),

    #[error("reservation {id} is {status}")]
    InvalidTransition { id: Ulid, status: &'static str },

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    #[error("storage error: {0}")]
    Storage(String),
}

impl EngineError {
    /// Expected outcomes that the caller should answer with "pick another time".
    pub fn is_booking_rejection(&self) -> bool {
        matches!(
            self,
            EngineError::SlotNotOpen(_) | EngineError::SlotBlackedOut(_) | EngineError::SlotFull { .. }
        )
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::ConcurrentModificationConflict(_))
    }

    /// Label used for the rejection metric.
    pub fn reason(&self) -> &'static str {
        match self {
            EngineError::InvalidResourceConfig(_) => "invalid_resource_config",
            EngineError::SlotNotOpen(_) => "slot_not_open",
            EngineError::SlotBlackedOut(_) => "slot_blacked_out",
            EngineError::SlotFull { .. } => "slot_full",
            EngineError::ReservationNotFound(_) => "reservation_not_found",
            EngineError::ResourceNotFound(_) => "resource_not_found",
            EngineError::BlackoutNotFound(_) => "blackout_not_found",
            EngineError::ConcurrentModificationConflict(_) => "conflict",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::Storage(_) => "storage",
        }
    }
}
