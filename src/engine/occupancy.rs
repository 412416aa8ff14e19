use ulid::Ulid;

use crate::model::*;

/// Pair each slot with the number of live reservations intersecting it.
///
/// `reservations` must be sorted by start (as `ResourceState` keeps them).
/// Confirmed reservations always count; pending ones count until they
/// expire; cancelled ones never do. `exclude` leaves one reservation out of
/// every count, which lets a booking move within a full resource.
pub fn annotate<'a, I>(
    slots: I,
    reservations: &'a [Reservation],
    capacity: u32,
    now: Ms,
    exclude: Option<Ulid>,
) -> impl Iterator<Item = Slot> + 'a
where
    I: IntoIterator<Item = Span>,
    I::IntoIter: 'a,
{
    slots.into_iter().map(move |span| {
        let occupied = occupied_count(reservations, &span, now, exclude);
        Slot {
            span,
            occupied,
            available: occupied < capacity,
        }
    })
}

/// Live reservations intersecting `span`.
pub fn occupied_count(reservations: &[Reservation], span: &Span, now: Ms, exclude: Option<Ulid>) -> u32 {
    let count = overlapping(reservations, span)
        .filter(|r| Some(r.id) != exclude && r.occupies(now))
        .count();
    u32::try_from(count).unwrap_or(u32::MAX)
}
