use crate::model::Ms;

pub const MAX_SPACES: usize = 10_000;
pub const MAX_USERS: usize = 1_000_000;
pub const MAX_RESERVATIONS_PER_SPACE: usize = 100_000;

pub const MAX_NAME_LEN: usize = 255;
pub const MAX_DESCRIPTION_LEN: usize = 10_000;
pub const MAX_NOTES_LEN: usize = 4_096;
pub const MAX_EMAIL_LEN: usize = 254;
pub const MAX_URL_LEN: usize = 2_048;
pub const MAX_AMENITIES: usize = 64;
pub const MAX_PASSWORD_LEN: usize = 1_024;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2200-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 7_258_118_400_000;
/// A single reservation may not exceed 366 days.
pub const MAX_SPAN_DURATION_MS: Ms = 366 * 24 * 3_600_000;
/// Availability and calendar queries may not exceed 366 days.
pub const MAX_QUERY_WINDOW_MS: Ms = 366 * 24 * 3_600_000;
