use crate::model::Ms;

/// Earliest accepted timestamp (Unix epoch).
pub const MIN_VALID_TIMESTAMP_MS: Ms = 0;
/// Latest accepted timestamp (9999-12-31T23:59:59.999Z).
pub const MAX_VALID_TIMESTAMP_MS: Ms = 253_402_300_799_999;

pub const MAX_TITLE_LEN: usize = 255;
pub const MAX_DESCRIPTION_LEN: usize = 4096;
pub const MAX_NOTES_LEN: usize = 2048;

/// Upper bound on `max_participants` for a single slot.
pub const MAX_PARTICIPANTS: u32 = 100;

pub const MAX_SLOTS: usize = 1_000_000;
/// Booking rows kept per slot, cancelled ones included.
pub const MAX_BOOKING_ROWS_PER_SLOT: usize = 10_000;

pub const DEFAULT_PAGE_SIZE: usize = 100;
pub const MAX_PAGE_SIZE: usize = 100;
