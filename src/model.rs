use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::engine::EngineError;
use crate::hours::OpenHours;

/// Unix milliseconds. The only time type that crosses the API boundary.
pub type Ms = i64;

pub const MINUTE_MS: Ms = 60_000;

/// Wall clock as `Ms`.
pub fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// A bookable court or gym session source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub id: Ulid,
    pub name: String,
    /// Sport or session type, e.g. "tennis", "spin".
    pub category: String,
    /// IANA timezone name used to resolve open hours.
    pub timezone: String,
    pub slot_minutes: i64,
    pub max_concurrent: u32,
    pub open_hours: OpenHours,
}

impl Resource {
    pub fn slot_ms(&self) -> Ms {
        self.slot_minutes * MINUTE_MS
    }

    pub fn tz(&self) -> Result<Tz, EngineError> {
        self.timezone
            .parse::<Tz>()
            .map_err(|_| EngineError::InvalidResourceConfig(format!("unknown timezone {:?}", self.timezone)))
    }

    /// Checks everything the time grid relies on.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.slot_minutes <= 0 || self.slot_minutes > i64::from(crate::hours::MINUTES_PER_DAY) {
            return Err(EngineError::InvalidResourceConfig(format!(
                "slot duration must be 1..=1440 minutes, got {}",
                self.slot_minutes
            )));
        }
        if self.max_concurrent == 0 {
            return Err(EngineError::InvalidResourceConfig(
                "max_concurrent must be at least 1".into(),
            ));
        }
        self.tz()?;
        self.open_hours.validate()
    }
}

/// An exclusion window on one resource. Blackouts may overlap each other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blackout {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub span: Span,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    /// Holds capacity until `expires_at`, then lapses unless confirmed.
    Pending { expires_at: Ms },
    Confirmed,
    /// Terminal. Cancelled reservations are kept for audit.
    Cancelled,
}

impl ReservationStatus {
    pub fn label(&self) -> &'static str {
        match self {
            ReservationStatus::Pending { .. } => "pending",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub resource_id: Ulid,
    pub requester_id: String,
    pub span: Span,
    pub status: ReservationStatus,
    /// Bumped on every confirm/reschedule/cancel.
    pub version: u32,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Reservation {
    /// Whether this reservation takes up capacity at `now`.
    pub fn occupies(&self, now: Ms) -> bool {
        match self.status {
            ReservationStatus::Confirmed => true,
            ReservationStatus::Pending { expires_at } => expires_at > now,
            ReservationStatus::Cancelled => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == ReservationStatus::Cancelled
    }
}

/// A candidate booking interval annotated with its current occupancy.
/// Derived on every query, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Slot {
    pub span: Span,
    pub occupied: u32,
    pub available: bool,
}

/// Anything stored on a resource timeline that can be range-queried.
pub trait Timed {
    fn span(&self) -> Span;
}

impl Timed for Blackout {
    fn span(&self) -> Span {
        self.span
    }
}

impl Timed for Reservation {
    fn span(&self) -> Span {
        self.span
    }
}

/// Insert keeping the vector sorted by `span.start`.
fn insert_sorted<T: Timed>(items: &mut Vec<T>, item: T) {
    let pos = items
        .binary_search_by_key(&item.span().start, |i| i.span().start)
        .unwrap_or_else(|e| e);
    items.insert(pos, item);
}

/// Items whose span overlaps `query`, in start order.
/// Binary search skips everything starting at or after `query.end`.
pub fn overlapping<'a, T: Timed>(items: &'a [T], query: &Span) -> impl Iterator<Item = &'a T> {
    let right_bound = items.partition_point(|i| i.span().start < query.end);
    let query = *query;
    items[..right_bound]
        .iter()
        .filter(move |i| i.span().end > query.start)
}

/// Everything the engine knows about one resource.
#[derive(Debug, Clone)]
pub struct ResourceState {
    pub resource: Resource,
    /// Bumped whenever the config or blackout set changes. Commits compare it
    /// against the value seen during validation.
    pub revision: u64,
    /// Sorted by `span.start`.
    pub blackouts: Vec<Blackout>,
    /// Sorted by `span.start`. Includes cancelled reservations.
    pub reservations: Vec<Reservation>,
}

impl ResourceState {
    pub fn new(resource: Resource) -> Self {
        Self {
            resource,
            revision: 0,
            blackouts: Vec::new(),
            reservations: Vec::new(),
        }
    }

    pub fn interval_count(&self) -> usize {
        self.blackouts.len() + self.reservations.len()
    }

    pub fn insert_blackout(&mut self, blackout: Blackout) {
        insert_sorted(&mut self.blackouts, blackout);
    }

    pub fn remove_blackout(&mut self, id: Ulid) -> Option<Blackout> {
        let pos = self.blackouts.iter().position(|b| b.id == id)?;
        Some(self.blackouts.remove(pos))
    }

    pub fn insert_reservation(&mut self, reservation: Reservation) {
        insert_sorted(&mut self.reservations, reservation);
    }

    pub fn remove_reservation(&mut self, id: Ulid) -> Option<Reservation> {
        let pos = self.reservations.iter().position(|r| r.id == id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn reservation(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    pub fn reservation_mut(&mut self, id: Ulid) -> Option<&mut Reservation> {
        self.reservations.iter_mut().find(|r| r.id == id)
    }

    pub fn blackouts_overlapping(&self, query: &Span) -> impl Iterator<Item = &Blackout> {
        overlapping(&self.blackouts, query)
    }

    pub fn reservations_overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        overlapping(&self.reservations, query)
    }
}

/// The event types. Flat, no nesting beyond the records themselves.
/// This is the event-log record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ResourceCreated {
        resource: Resource,
    },
    ResourceUpdated {
        resource: Resource,
    },
    BlackoutAdded {
        blackout: Blackout,
    },
    BlackoutRemoved {
        id: Ulid,
        resource_id: Ulid,
    },
    /// New reservation (pending or confirmed). Also used by compaction to
    /// restore a reservation in whatever state it had reached.
    ReservationPlaced {
        reservation: Reservation,
    },
    ReservationConfirmed {
        id: Ulid,
        resource_id: Ulid,
        at: Ms,
    },
    ReservationRescheduled {
        id: Ulid,
        resource_id: Ulid,
        span: Span,
        at: Ms,
    },
    ReservationCancelled {
        id: Ulid,
        resource_id: Ulid,
        at: Ms,
    },
}

impl Event {
    pub fn resource_id(&self) -> Ulid {
        match self {
            Event::ResourceCreated { resource } | Event::ResourceUpdated { resource } => resource.id,
            Event::BlackoutAdded { blackout } => blackout.resource_id,
            Event::ReservationPlaced { reservation } => reservation.resource_id,
            Event::BlackoutRemoved { resource_id, .. }
            | Event::ReservationConfirmed { resource_id, .. }
            | Event::ReservationRescheduled { resource_id, .. }
            | Event::ReservationCancelled { resource_id, .. } => *resource_id,
        }
    }

    /// Short name used in logs and notification payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::ResourceCreated { .. } => "resource_created",
            Event::ResourceUpdated { .. } => "resource_updated",
            Event::BlackoutAdded { .. } => "blackout_added",
            Event::BlackoutRemoved { .. } => "blackout_removed",
            Event::ReservationPlaced { .. } => "reservation_placed",
            Event::ReservationConfirmed { .. } => "reservation_confirmed",
            Event::ReservationRescheduled { .. } => "reservation_rescheduled",
            Event::ReservationCancelled { .. } => "reservation_cancelled",
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn span_basics() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn span_contains_span() {
        let outer = Span::new(100, 400);
        let inner = Span::new(150, 300);
        let partial = Span::new(50, 200);
        assert!(outer.contains_span(&inner));
        assert!(outer.contains_span(&outer));
        assert!(!outer.contains_span(&partial));
    }

    #[test]
    fn resource_validation() {
        assert!(court_a().validate().is_ok());

        let mut zero_slot = court_a();
        zero_slot.slot_minutes = 0;
        assert!(matches!(zero_slot.validate(), Err(EngineError::InvalidResourceConfig(_))));

        let mut negative_slot = court_a();
        negative_slot.slot_minutes = -15;
        assert!(negative_slot.validate().is_err());

        let mut no_capacity = court_a();
        no_capacity.max_concurrent = 0;
        assert!(no_capacity.validate().is_err());

        let mut bad_tz = court_a();
        bad_tz.timezone = "Mars/Olympus_Mons".into();
        assert!(bad_tz.validate().is_err());
    }

    #[test]
    fn reservation_occupancy_by_status() {
        let rid = Ulid::new();
        let span = Span::new(0, 100);
        assert!(reservation(rid, span, ReservationStatus::Confirmed).occupies(50));
        assert!(!reservation(rid, span, ReservationStatus::Cancelled).occupies(50));

        let pending = reservation(rid, span, ReservationStatus::Pending { expires_at: 1000 });
        assert!(pending.occupies(999));
        assert!(!pending.occupies(1000));
    }

    #[test]
    fn reservations_kept_sorted() {
        let mut rs = ResourceState::new(court_a());
        let rid = rs.resource.id;
        for start in [300, 100, 200] {
            rs.insert_reservation(reservation(rid, Span::new(start, start + 50), ReservationStatus::Confirmed));
        }
        let starts: Vec<Ms> = rs.reservations.iter().map(|r| r.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn overlapping_skips_past_and_future() {
        let mut rs = ResourceState::new(court_a());
        let rid = rs.resource.id;
        rs.insert_reservation(reservation(rid, Span::new(100, 200), ReservationStatus::Confirmed));
        rs.insert_reservation(reservation(rid, Span::new(450, 600), ReservationStatus::Confirmed));
        rs.insert_reservation(reservation(rid, Span::new(1000, 1100), ReservationStatus::Confirmed));

        let hits: Vec<_> = rs.reservations_overlapping(&Span::new(500, 800)).collect();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].span, Span::new(450, 600));
    }

    #[test]
    fn overlapping_adjacent_not_included() {
        let mut rs = ResourceState::new(court_a());
        let rid = rs.resource.id;
        rs.insert_blackout(Blackout {
            id: Ulid::new(),
            resource_id: rid,
            span: Span::new(100, 200),
            reason: None,
        });
        assert_eq!(rs.blackouts_overlapping(&Span::new(200, 300)).count(), 0);
        assert_eq!(rs.blackouts_overlapping(&Span::new(199, 300)).count(), 1);
    }

    #[test]
    fn remove_nonexistent_returns_none() {
        let mut rs = ResourceState::new(court_a());
        let rid = rs.resource.id;
        rs.insert_reservation(reservation(rid, Span::new(100, 200), ReservationStatus::Confirmed));
        assert!(rs.remove_reservation(Ulid::new()).is_none());
        assert!(rs.remove_blackout(Ulid::new()).is_none());
        assert_eq!(rs.reservations.len(), 1);
    }

    #[test]
    fn event_serialization_roundtrip() {
        let resource = court_a();
        let event = Event::ReservationPlaced {
            reservation: reservation(resource.id, Span::new(0, 60), ReservationStatus::Pending { expires_at: 5 }),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
        assert_eq!(decoded.resource_id(), resource.id);
    }
}
