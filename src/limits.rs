//! Hard bounds on inputs accepted by the engine and the wire surface.

use crate::model::Ms;

pub const MAX_RESOURCES: usize = 10_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_CATEGORY_LEN: usize = 64;
pub const MAX_REQUESTER_LEN: usize = 256;
pub const MAX_REASON_LEN: usize = 1024;
pub const MAX_TIMEZONE_LEN: usize = 64;

/// Blackouts + reservations kept on one resource (cancelled ones included).
pub const MAX_INTERVALS_PER_RESOURCE: usize = 200_000;

/// Open-hour ranges per weekday.
pub const MAX_RANGES_PER_DAY: usize = 48;

/// Consecutive slots one reservation may span.
pub const MAX_SLOTS_PER_RESERVATION: u32 = 24;

/// Widest window accepted by slot/blackout/reservation listings (62 days).
pub const MAX_QUERY_WINDOW_MS: Ms = 62 * 24 * 3_600_000;

/// Widest single blackout (one year).
pub const MAX_BLACKOUT_MS: Ms = 366 * 24 * 3_600_000;

/// 1970-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;

/// Largest encoded event the log writes or reads back.
pub const MAX_EVENT_BYTES: usize = 1 << 20;
