use std::time::Duration;

use crate::model::Ms;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A single booking or walk-in never spans more than two days.
pub const MAX_WINDOW_DURATION_MS: Ms = 2 * 24 * 3_600_000;

pub const MAX_NAME_LEN: usize = 128;
pub const MAX_NOTE_LEN: usize = 1024;
pub const MAX_CONTACT_LEN: usize = 256;
pub const MAX_PRINCIPAL_LEN: usize = 128;

pub const MAX_ROOMS_PER_BOOKING: u32 = 8;
pub const MAX_VIRTUAL_ROOMS: usize = 512;
pub const MAX_SCHEDULES_PER_ROOM: usize = 100_000;

/// Longest accepted API request line, in bytes.
pub const MAX_REQUEST_LINE: usize = 64 * 1024;

/// Longest a commit waits for its WAL record to be acknowledged.
pub const DEFAULT_COMMIT_TIMEOUT: Duration = Duration::from_secs(5);
