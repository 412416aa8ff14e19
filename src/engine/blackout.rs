use crate::model::*;

/// Drop every slot that overlaps any blackout, even by a single millisecond.
///
/// Blackouts are merged into a disjoint union first, so the input order and
/// any overlap between blackouts make no difference to the result.
pub fn apply_blackouts<I>(slots: I, blackouts: &[Blackout]) -> impl Iterator<Item = Span> + use<I>
where
    I: IntoIterator<Item = Span>,
{
    let mut spans: Vec<Span> = blackouts.iter().map(|b| b.span).collect();
    spans.sort_by_key(|s| s.start);
    let blocked = merge_overlapping(&spans);
    slots
        .into_iter()
        .filter(move |slot| !intersects_any(&blocked, slot))
}

/// First blackout (in start order) that overlaps `span`.
/// `blackouts` must be sorted by start, as `ResourceState` keeps them.
pub fn first_overlapping<'a>(blackouts: &'a [Blackout], span: &Span) -> Option<&'a Blackout> {
    overlapping(blackouts, span).next()
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// `blocked` is sorted and disjoint, so ends are sorted too.
fn intersects_any(blocked: &[Span], slot: &Span) -> bool {
    let idx = blocked.partition_point(|b| b.end <= slot.start);
    blocked.get(idx).is_some_and(|b| b.start < slot.end)
}
