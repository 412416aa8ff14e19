//! Time grid: expands a resource's weekly open hours into concrete slot
//! spans for a window of absolute time.
//!
//! Each open range is resolved to instants on its own calendar day in the
//! resource's timezone, then cut into `slot_duration` pieces in absolute
//! time. A trailing remainder shorter than one slot is dropped. Wall-clock
//! endpoints that fall in a DST gap move to the first valid minute after
//! it; endpoints that occur twice (fall-back) take the earlier instant.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;

use crate::hours::OpenHours;
use crate::model::*;

use super::EngineError;

/// Lazy, restartable (`Clone`) iterator over grid slots in start order.
#[derive(Debug, Clone)]
pub struct SlotGrid<'a> {
    hours: &'a OpenHours,
    tz: Tz,
    slot_ms: Ms,
    window: Span,
    day: NaiveDate,
    last_day: NaiveDate,
    range_idx: usize,
    /// (next slot start, end of the current open range)
    cursor: Option<(Ms, Ms)>,
    done: bool,
}

/// Slots of `resource` lying entirely inside `[from, to)`.
pub fn generate_slots(resource: &Resource, from: Ms, to: Ms) -> Result<SlotGrid<'_>, EngineError> {
    resource.validate()?;
    let tz = resource.tz()?;
    let done = from >= to;
    let first_day = local_date(&tz, from)?;
    let last_day = local_date(&tz, to.max(from))?;
    Ok(SlotGrid {
        hours: &resource.open_hours,
        tz,
        slot_ms: resource.slot_ms(),
        window: Span { start: from, end: to },
        // A range on the previous local day can end at midnight, after `from`
        // in some zones; starting one day early costs nothing.
        day: first_day.pred_opt().unwrap_or(first_day),
        last_day,
        range_idx: 0,
        cursor: None,
        done,
    })
}

impl Iterator for SlotGrid<'_> {
    type Item = Span;

    fn next(&mut self) -> Option<Span> {
        while !self.done {
            if let Some((start, range_end)) = self.cursor {
                let end = start + self.slot_ms;
                if end > range_end {
                    self.cursor = None;
                    continue;
                }
                self.cursor = Some((end, range_end));
                if start >= self.window.end {
                    self.done = true;
                    return None;
                }
                let slot = Span::new(start, end);
                if self.window.contains_span(&slot) {
                    return Some(slot);
                }
                continue;
            }

            if self.day > self.last_day {
                self.done = true;
                return None;
            }
            let ranges = self.hours.ranges(self.day.weekday());
            if let Some(range) = ranges.get(self.range_idx) {
                self.range_idx += 1;
                let start = wall_to_ms(&self.tz, self.day, range.start);
                let end = wall_to_ms(&self.tz, self.day, range.end);
                if start < end {
                    self.cursor = Some((start, end));
                }
                continue;
            }

            self.range_idx = 0;
            match self.day.succ_opt() {
                Some(next) => self.day = next,
                None => self.done = true,
            }
        }
        None
    }
}

fn local_date(tz: &Tz, at: Ms) -> Result<NaiveDate, EngineError> {
    let utc = DateTime::<Utc>::from_timestamp_millis(at)
        .ok_or(EngineError::LimitExceeded("timestamp out of range"))?;
    Ok(utc.with_timezone(tz).date_naive())
}

/// Resolve `minutes` past local midnight of `day` to an absolute instant.
pub(crate) fn wall_to_ms(tz: &Tz, day: NaiveDate, minutes: u16) -> Ms {
    let naive = day.and_time(NaiveTime::MIN) + Duration::minutes(i64::from(minutes));
    resolve_local(tz, naive).timestamp_millis()
}

fn resolve_local(tz: &Tz, naive: NaiveDateTime) -> DateTime<Tz> {
    if let Some(dt) = tz.from_local_datetime(&naive).earliest() {
        return dt;
    }
    // Inside a spring-forward gap: walk forward to the first local minute that exists.
    let mut shifted = naive;
    for _ in 0..24 * 60 {
        shifted += Duration::minutes(1);
        if let Some(dt) = tz.from_local_datetime(&shifted).earliest() {
            return dt;
        }
    }
    // No zone has a day-long gap; treat the wall time as UTC as a last resort.
    tz.from_utc_datetime(&naive)
}

#[cfg(test)]
mod tests {
    use chrono::Weekday;
    use proptest::prelude::*;

    use super::*;
    use crate::hours::WallRange;
    use crate::model::fixtures::court_a;

    const H: Ms = 3_600_000;
    const M: Ms = 60_000;

    /// 2024-01-01 is a Monday.
    fn monday_utc() -> Ms {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_time(NaiveTime::MIN)
            .and_utc()
            .timestamp_millis()
    }

    #[test]
    fn court_a_monday_has_two_slots() {
        let court = court_a();
        let day = monday_utc();
        let slots: Vec<Span> = generate_slots(&court, day, day + 24 * H).unwrap().collect();
        assert_eq!(
            slots,
            vec![
                Span::new(day + 8 * H, day + 9 * H),
                Span::new(day + 9 * H, day + 10 * H),
            ]
        );
    }

    #[test]
    fn partial_trailing_slot_dropped() {
        let mut court = court_a();
        court.open_hours = OpenHours::new().with_day(Weekday::Mon, vec![WallRange::new(480, 630)]);
        let day = monday_utc();
        let slots: Vec<Span> = generate_slots(&court, day, day + 24 * H).unwrap().collect();
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[1].end, day + 10 * H);
    }

    #[test]
    fn window_clips_to_whole_slots() {
        let court = court_a();
        let day = monday_utc();
        // Window starts mid-slot: the 08:00 slot is excluded, 09:00 kept.
        let slots: Vec<Span> = generate_slots(&court, day + 8 * H + 30 * M, day + 24 * H)
            .unwrap()
            .collect();
        assert_eq!(slots, vec![Span::new(day + 9 * H, day + 10 * H)]);
    }

    #[test]
    fn empty_window_yields_nothing() {
        let court = court_a();
        let day = monday_utc();
        assert_eq!(generate_slots(&court, day, day).unwrap().count(), 0);
        assert_eq!(generate_slots(&court, day + H, day).unwrap().count(), 0);
    }

    #[test]
    fn grid_is_restartable() {
        let court = court_a();
        let day = monday_utc();
        let grid = generate_slots(&court, day, day + 7 * 24 * H).unwrap();
        let first: Vec<Span> = grid.clone().collect();
        let second: Vec<Span> = grid.collect();
        assert_eq!(first, second);
    }

    #[test]
    fn invalid_config_rejected() {
        let mut court = court_a();
        court.slot_minutes = 0;
        assert!(matches!(
            generate_slots(&court, 0, H),
            Err(EngineError::InvalidResourceConfig(_))
        ));

        let mut court = court_a();
        court.open_hours = OpenHours::new().with_day(Weekday::Mon, vec![WallRange::new(600, 480)]);
        assert!(matches!(
            generate_slots(&court, 0, H),
            Err(EngineError::InvalidResourceConfig(_))
        ));
    }

    #[test]
    fn timezone_offsets_applied() {
        let mut court = court_a();
        court.timezone = "America/New_York".into();
        let day = monday_utc();
        // 08:00 EST on 2024-01-01 is 13:00 UTC.
        let slots: Vec<Span> = generate_slots(&court, day, day + 2 * 24 * H).unwrap().collect();
        assert_eq!(slots[0], Span::new(day + 13 * H, day + 14 * H));
        assert_eq!(slots.len(), 2);
    }

    #[test]
    fn spring_forward_keeps_wall_clock_hours() {
        // US DST starts Sunday 2024-03-10. Open 08:00-10:00 on Sundays.
        let mut court = court_a();
        court.timezone = "America/New_York".into();
        court.open_hours = OpenHours::new().with_day(Weekday::Sun, vec![WallRange::new(480, 600)]);

        let tz: Tz = "America/New_York".parse().unwrap();
        let from = tz.with_ymd_and_hms(2024, 3, 3, 0, 0, 0).unwrap().timestamp_millis();
        let to = tz.with_ymd_and_hms(2024, 3, 11, 0, 0, 0).unwrap().timestamp_millis();
        let slots: Vec<Span> = generate_slots(&court, from, to).unwrap().collect();
        assert_eq!(slots.len(), 4);

        let before = tz.with_ymd_and_hms(2024, 3, 3, 8, 0, 0).unwrap().timestamp_millis();
        let after = tz.with_ymd_and_hms(2024, 3, 10, 8, 0, 0).unwrap().timestamp_millis();
        assert_eq!(slots[0].start, before);
        assert_eq!(slots[2].start, after);
        // One week minus the lost hour apart.
        assert_eq!(after - before, 7 * 24 * H - H);
    }

    #[test]
    fn range_across_dst_gap_is_shorter() {
        // 01:00-04:00 local on the spring-forward night is only two real hours.
        let mut court = court_a();
        court.timezone = "America/New_York".into();
        court.open_hours = OpenHours::new().with_day(Weekday::Sun, vec![WallRange::new(60, 240)]);

        let tz: Tz = "America/New_York".parse().unwrap();
        let from = tz.with_ymd_and_hms(2024, 3, 10, 0, 0, 0).unwrap().timestamp_millis();
        let slots: Vec<Span> = generate_slots(&court, from, from + 24 * H).unwrap().collect();
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[0].end, slots[1].start);
    }

    #[test]
    fn fall_back_range_is_longer() {
        // US DST ends Sunday 2024-11-03; 00:00-03:00 local spans four real hours.
        let mut court = court_a();
        court.timezone = "America/New_York".into();
        court.open_hours = OpenHours::new().with_day(Weekday::Sun, vec![WallRange::new(0, 180)]);

        let tz: Tz = "America/New_York".parse().unwrap();
        let from = tz.with_ymd_and_hms(2024, 11, 3, 0, 0, 0).unwrap().timestamp_millis();
        let slots: Vec<Span> = generate_slots(&court, from, from + 24 * H).unwrap().collect();
        assert_eq!(slots.len(), 4);
    }

    #[test]
    fn gap_minute_moves_forward() {
        let tz: Tz = "America/New_York".parse().unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 3, 10).unwrap();
        let three = tz.with_ymd_and_hms(2024, 3, 10, 3, 0, 0).unwrap().timestamp_millis();
        assert_eq!(wall_to_ms(&tz, day, 150), three); // 02:30 does not exist
    }

    #[test]
    fn midnight_end_resolves_to_next_day() {
        let mut court = court_a();
        court.open_hours = OpenHours::new().with_day(Weekday::Mon, vec![WallRange::new(1320, 1440)]);
        let day = monday_utc();
        let slots: Vec<Span> = generate_slots(&court, day, day + 2 * 24 * H).unwrap().collect();
        assert_eq!(slots.last().unwrap().end, day + 24 * H);
    }

    fn arb_day() -> impl Strategy<Value = Vec<WallRange>> {
        // Up to three non-overlapping ranges built from sorted, distinct quarter-hour cut points.
        proptest::collection::btree_set(0u16..=96, 0..=6).prop_map(|cuts| {
            let cuts: Vec<u16> = cuts.into_iter().map(|q| q * 15).collect();
            cuts.chunks_exact(2)
                .map(|pair| WallRange::new(pair[0], pair[1]))
                .collect()
        })
    }

    proptest! {
        #[test]
        fn week_slot_count_matches_open_minutes(
            days in proptest::collection::vec(arb_day(), 7),
        ) {
            let mut court = court_a();
            court.slot_minutes = 15;
            let week = [
                Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu,
                Weekday::Fri, Weekday::Sat, Weekday::Sun,
            ];
            let mut hours = OpenHours::new();
            for (day, ranges) in week.iter().zip(days) {
                hours.set_day(*day, ranges);
            }
            court.open_hours = hours;

            let start = monday_utc();
            let slots: Vec<Span> = generate_slots(&court, start, start + 7 * 24 * H).unwrap().collect();
            let expected = court.open_hours.weekly_minutes() as usize / 15;
            prop_assert_eq!(slots.len(), expected);
            for pair in slots.windows(2) {
                prop_assert!(pair[0].end <= pair[1].start);
            }
            for s in &slots {
                prop_assert_eq!(s.duration_ms(), 15 * M);
            }
        }
    }
}
