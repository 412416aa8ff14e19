use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;

use chrono::Weekday;
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

use crate::engine::EngineError;
use crate::limits::MAX_RANGES_PER_DAY;

pub const MINUTES_PER_DAY: u16 = 1440;

const WEEK: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

/// Wall-clock range `[start, end)` in minutes past local midnight.
/// `end == 1440` means "until midnight".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WallRange {
    pub start: u16,
    pub end: u16,
}

impl WallRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// Parse a pair of `HH:MM` clock strings.
    pub fn parse(start: &str, end: &str) -> Result<Self, EngineError> {
        Ok(Self::new(parse_clock(start)?, parse_clock(end)?))
    }

    pub fn minutes(&self) -> u16 {
        self.end.saturating_sub(self.start)
    }
}

impl fmt::Display for WallRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", clock(self.start), clock(self.end))
    }
}

fn clock(minutes: u16) -> String {
    format!("{:02}:{:02}", minutes / 60, minutes % 60)
}

fn parse_clock(s: &str) -> Result<u16, EngineError> {
    let bad = || EngineError::InvalidResourceConfig(format!("bad wall-clock time {s:?}, expected HH:MM"));
    let (h, m) = s.trim().split_once(':').ok_or_else(bad)?;
    let h: u16 = h.parse().map_err(|_| bad())?;
    let m: u16 = m.parse().map_err(|_| bad())?;
    if m >= 60 || h > 24 || (h == 24 && m != 0) {
        return Err(bad());
    }
    Ok(h * 60 + m)
}

/// Weekly opening table, indexed by `Weekday::num_days_from_monday()`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenHours {
    days: [Vec<WallRange>; 7],
}

impl OpenHours {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ranges(&self, day: Weekday) -> &[WallRange] {
        &self.days[day.num_days_from_monday() as usize]
    }

    /// Replace one weekday's ranges. Ranges are kept sorted by start.
    pub fn set_day(&mut self, day: Weekday, mut ranges: Vec<WallRange>) {
        ranges.sort();
        self.days[day.num_days_from_monday() as usize] = ranges;
    }

    pub fn with_day(mut self, day: Weekday, ranges: Vec<WallRange>) -> Self {
        self.set_day(day, ranges);
        self
    }

    /// Total open minutes across the week.
    pub fn weekly_minutes(&self) -> u32 {
        self.days
            .iter()
            .flatten()
            .map(|r| u32::from(r.minutes()))
            .sum()
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        for day in WEEK {
            let ranges = self.ranges(day);
            if ranges.len() > MAX_RANGES_PER_DAY {
                return Err(EngineError::InvalidResourceConfig(format!(
                    "{day}: more than {MAX_RANGES_PER_DAY} open ranges"
                )));
            }
            for r in ranges {
                if r.start >= r.end || r.end > MINUTES_PER_DAY {
                    return Err(EngineError::InvalidResourceConfig(format!(
                        "{day}: malformed open range {r}"
                    )));
                }
            }
            for pair in ranges.windows(2) {
                if pair[0].end > pair[1].start {
                    return Err(EngineError::InvalidResourceConfig(format!(
                        "{day}: open ranges {} and {} overlap",
                        pair[0], pair[1]
                    )));
                }
            }
        }
        Ok(())
    }

    /// Parse the JSON input format:
    /// `{"mon": [{"start": "08:00", "end": "10:00"}], "sat": [...]}`.
    /// Weekday keys accept short or long names in any case.
    pub fn from_legacy_json(input: &str) -> Result<Self, EngineError> {
        #[derive(Deserialize)]
        struct LegacyRange {
            start: String,
            end: String,
        }

        let Entries(raw) = serde_json::from_str::<Entries<Vec<LegacyRange>>>(input)
            .map_err(|e| EngineError::InvalidResourceConfig(format!("open hours JSON: {e}")))?;

        let mut hours = Self::new();
        let mut seen = [false; 7];
        for (key, ranges) in raw {
            let day = Weekday::from_str(key.trim())
                .map_err(|_| EngineError::InvalidResourceConfig(format!("unknown weekday {key:?}")))?;
            let idx = day.num_days_from_monday() as usize;
            if std::mem::replace(&mut seen[idx], true) {
                return Err(EngineError::InvalidResourceConfig(format!(
                    "{} given more than once",
                    day_key(day)
                )));
            }
            let parsed = ranges
                .iter()
                .map(|r| WallRange::parse(&r.start, &r.end))
                .collect::<Result<Vec<_>, _>>()?;
            hours.set_day(day, parsed);
        }
        hours.validate()?;
        Ok(hours)
    }

    /// Render in the same JSON shape `from_legacy_json` reads (closed days omitted).
    pub fn to_json(&self) -> String {
        let mut out = serde_json::Map::new();
        for day in WEEK {
            let ranges = self.ranges(day);
            if ranges.is_empty() {
                continue;
            }
            let items = ranges
                .iter()
                .map(|r| serde_json::json!({ "start": clock(r.start), "end": clock(r.end) }))
                .collect();
            out.insert(day_key(day).to_string(), serde_json::Value::Array(items));
        }
        serde_json::Value::Object(out).to_string()
    }
}

/// Object entries in document order, repeated keys included.
struct Entries<V>(Vec<(String, V)>);

impl<'de, V: Deserialize<'de>> Deserialize<'de> for Entries<V> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EntriesVisitor<V>(PhantomData<V>);

        impl<'de, V: Deserialize<'de>> Visitor<'de> for EntriesVisitor<V> {
            type Value = Entries<V>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an object keyed by weekday")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::new();
                while let Some(entry) = map.next_entry()? {
                    entries.push(entry);
                }
                Ok(Entries(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor(PhantomData))
    }
}

fn day_key(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "mon",
        Weekday::Tue => "tue",
        Weekday::Wed => "wed",
        Weekday::Thu => "thu",
        Weekday::Fri => "fri",
        Weekday::Sat => "sat",
        Weekday::Sun => "sun",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_clock_bounds() {
        assert_eq!(parse_clock("00:00").unwrap(), 0);
        assert_eq!(parse_clock("08:30").unwrap(), 510);
        assert_eq!(parse_clock("24:00").unwrap(), 1440);
        assert!(parse_clock("24:01").is_err());
        assert!(parse_clock("12:60").is_err());
        assert!(parse_clock("noon").is_err());
    }

    #[test]
    fn set_day_sorts_ranges() {
        let hours = OpenHours::new().with_day(
            Weekday::Mon,
            vec![WallRange::new(600, 720), WallRange::new(480, 540)],
        );
        assert_eq!(
            hours.ranges(Weekday::Mon),
            &[WallRange::new(480, 540), WallRange::new(600, 720)]
        );
        assert!(hours.ranges(Weekday::Tue).is_empty());
    }

    #[test]
    fn validate_rejects_inverted_range() {
        let hours = OpenHours::new().with_day(Weekday::Wed, vec![WallRange::new(600, 600)]);
        assert!(matches!(hours.validate(), Err(EngineError::InvalidResourceConfig(_))));
    }

    #[test]
    fn validate_rejects_overlap_but_allows_touching() {
        let touching = OpenHours::new().with_day(
            Weekday::Fri,
            vec![WallRange::new(480, 600), WallRange::new(600, 720)],
        );
        assert!(touching.validate().is_ok());

        let overlapping = OpenHours::new().with_day(
            Weekday::Fri,
            vec![WallRange::new(480, 601), WallRange::new(600, 720)],
        );
        assert!(overlapping.validate().is_err());
    }

    #[test]
    fn validate_rejects_past_midnight() {
        let hours = OpenHours::new().with_day(Weekday::Sat, vec![WallRange::new(1380, 1441)]);
        assert!(hours.validate().is_err());
    }

    #[test]
    fn legacy_json_parses_short_and_long_names() {
        let hours = OpenHours::from_legacy_json(
            r#"{"Monday": [{"start": "08:00", "end": "10:00"}], "sat": [{"start": "09:00", "end": "24:00"}]}"#,
        )
        .unwrap();
        assert_eq!(hours.ranges(Weekday::Mon), &[WallRange::new(480, 600)]);
        assert_eq!(hours.ranges(Weekday::Sat), &[WallRange::new(540, 1440)]);
        assert_eq!(hours.weekly_minutes(), 120 + 900);
    }

    #[test]
    fn legacy_json_rejects_unknown_day_and_overlap() {
        assert!(OpenHours::from_legacy_json(r#"{"funday": []}"#).is_err());
        assert!(
            OpenHours::from_legacy_json(
                r#"{"tue": [{"start": "08:00", "end": "10:00"}, {"start": "09:00", "end": "11:00"}]}"#
            )
            .is_err()
        );
        assert!(OpenHours::from_legacy_json("not json").is_err());
    }

    #[test]
    fn legacy_json_rejects_repeated_day() {
        let aliases = r#"{"mon": [{"start": "08:00", "end": "10:00"}], "Monday": [{"start": "12:00", "end": "14:00"}]}"#;
        assert!(matches!(
            OpenHours::from_legacy_json(aliases),
            Err(EngineError::InvalidResourceConfig(_))
        ));
        let repeated = r#"{"sat": [], "sat": [{"start": "09:00", "end": "12:00"}]}"#;
        assert!(matches!(
            OpenHours::from_legacy_json(repeated),
            Err(EngineError::InvalidResourceConfig(_))
        ));
    }

    #[test]
    fn json_output_reads_back() {
        let hours = OpenHours::new()
            .with_day(Weekday::Mon, vec![WallRange::new(480, 600)])
            .with_day(Weekday::Sun, vec![WallRange::new(0, 1440)]);
        let back = OpenHours::from_legacy_json(&hours.to_json()).unwrap();
        assert_eq!(back, hours);
    }
}
