use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::blackout::first_overlapping;
use super::grid::generate_slots;
use super::occupancy::occupied_count;
use super::EngineError;

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.start >= span.end {
        return Err(EngineError::LimitExceeded("interval must end after it starts"));
    }
    Ok(())
}

pub(crate) fn validate_window(from: Ms, to: Ms) -> Result<(), EngineError> {
    if from < MIN_VALID_TIMESTAMP_MS || to > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if to - from > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(())
}

/// Span covered by `slot_count` slots of `resource` starting at `start`.
pub(crate) fn requested_span(resource: &Resource, start: Ms, slot_count: u32) -> Result<Span, EngineError> {
    if slot_count == 0 || slot_count > MAX_SLOTS_PER_RESERVATION {
        return Err(EngineError::LimitExceeded("slot count out of range"));
    }
    let end = resource
        .slot_ms()
        .checked_mul(i64::from(slot_count))
        .and_then(|d| start.checked_add(d))
        .ok_or(EngineError::LimitExceeded("timestamp out of range"))?;
    if end <= start {
        return Err(EngineError::InvalidResourceConfig(format!(
            "slot duration must be positive, got {} minutes",
            resource.slot_minutes
        )));
    }
    let span = Span::new(start, end);
    validate_span(&span)?;
    Ok(span)
}

/// Read-phase check, run without exclusive access.
///
/// Re-derives the grid slots that make up `span` and rejects the request if
/// they do not tile it exactly or if any blackout touches it. Returns the
/// covered slots for the commit-phase capacity recount.
pub(crate) fn candidate_slots(
    resource: &Resource,
    blackouts: &[Blackout],
    span: &Span,
) -> Result<Vec<Span>, EngineError> {
    let slots: Vec<Span> = generate_slots(resource, span.start, span.end)?.collect();
    let tiles = slots.first().is_some_and(|s| s.start == span.start)
        && slots.last().is_some_and(|s| s.end == span.end)
        && slots.windows(2).all(|pair| pair[0].end == pair[1].start);
    if !tiles {
        return Err(EngineError::SlotNotOpen(*span));
    }
    if let Some(b) = first_overlapping(blackouts, span) {
        return Err(EngineError::SlotBlackedOut(b.id));
    }
    Ok(slots)
}

/// Commit-phase check, run under the resource's write lock.
pub(crate) fn check_capacity(
    rs: &ResourceState,
    slots: &[Span],
    exclude: Option<Ulid>,
    now: Ms,
) -> Result<(), EngineError> {
    let capacity = rs.resource.max_concurrent;
    for slot in slots {
        if occupied_count(&rs.reservations, slot, now, exclude) >= capacity {
            return Err(EngineError::SlotFull { capacity, at: slot.start });
        }
    }
    Ok(())
}
