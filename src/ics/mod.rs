mod emit;
mod parse;

pub use emit::{category_calendar, room_calendar};
pub use parse::{ParsedFeed, parse_calendar};

use crate::model::DatePart;

/// One normalized event out of an inbound calendar document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedEvent {
    pub uid: Option<String>,
    pub summary: Option<String>,
    pub start: DatePart,
    pub end: Option<DatePart>,
}

/// Whole-feed failures. Per-event problems are skipped and counted instead —
/// a feed that fails here is retried next cycle and is never treated as
/// "zero events".
#[derive(Debug)]
pub enum FeedError {
    NotACalendar,
    TooLarge(usize),
    TooManyEvents(usize),
    Http(String),
    Timeout,
}

impl std::fmt::Display for FeedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeedError::NotACalendar => write!(f, "document is not a calendar"),
            FeedError::TooLarge(bytes) => write!(f, "feed too large: {bytes} bytes"),
            FeedError::TooManyEvents(n) => write!(f, "feed has too many events: {n}"),
            FeedError::Http(e) => write!(f, "fetch failed: {e}"),
            FeedError::Timeout => write!(f, "fetch timed out"),
        }
    }
}

impl std::error::Error for FeedError {}
