//! Hard limits. Oversized input is rejected (or counted as malformed), never
//! truncated.

/// Longest stay the engine will accept, in nights.
pub const MAX_STAY_NIGHTS: i64 = 366;

/// Reservation boundaries must fall inside this window.
pub const MIN_VALID_YEAR: i32 = 2000;
pub const MAX_VALID_YEAR: i32 = 2100;

pub const MAX_UID_LEN: usize = 512;
pub const MAX_SUMMARY_LEN: usize = 1024;
pub const MAX_CONTACT_FIELD_LEN: usize = 256;

pub const MAX_RESERVATIONS_PER_PROPERTY: usize = 100_000;
pub const MAX_INBOX_PER_PROPERTY: usize = 10_000;

/// A feed document larger than this is a whole-feed error.
pub const MAX_FEED_BYTES: usize = 8 * 1024 * 1024;

/// Events past this count in one document are a whole-feed error.
pub const MAX_EVENTS_PER_FEED: usize = 20_000;
