use chrono::{NaiveDate, NaiveDateTime};

use crate::limits::*;
use crate::model::DatePart;

use super::{FeedError, FeedEvent};

/// Result of parsing one inbound calendar document. `skipped` counts the
/// events dropped as malformed; they never fail the batch.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ParsedFeed {
    pub events: Vec<FeedEvent>,
    pub skipped: usize,
}

/// Parse an iCalendar-shaped document.
///
/// Tolerates vendor quirks: folded lines (a continuation line beginning with
/// whitespace extends the previous logical line), CRLF or LF endings, unknown
/// properties, and nested sub-components (alarms) inside events. A document
/// with no `BEGIN:VCALENDAR` at all is a whole-feed error.
pub fn parse_calendar(text: &str) -> Result<ParsedFeed, FeedError> {
    if text.len() > MAX_FEED_BYTES {
        return Err(FeedError::TooLarge(text.len()));
    }

    let lines = unfold(text);
    if !lines
        .iter()
        .any(|l| l.eq_ignore_ascii_case("BEGIN:VCALENDAR"))
    {
        return Err(FeedError::NotACalendar);
    }

    let mut feed = ParsedFeed::default();
    let mut current: Option<PartialEvent> = None;
    let mut sub_depth = 0usize;

    for line in &lines {
        let upper = line.to_ascii_uppercase();

        if current.is_some() {
            // Inside a VEVENT. Sub-components (VALARM etc.) are skipped whole.
            if let Some(name) = upper.strip_prefix("BEGIN:") {
                if name != "VEVENT" {
                    sub_depth += 1;
                }
                continue;
            }
            if upper.starts_with("END:") {
                if sub_depth > 0 {
                    sub_depth -= 1;
                    continue;
                }
                if upper == "END:VEVENT" {
                    let partial = current.take().unwrap();
                    match partial.finish() {
                        Some(event) => {
                            if feed.events.len() >= MAX_EVENTS_PER_FEED {
                                return Err(FeedError::TooManyEvents(feed.events.len() + 1));
                            }
                            feed.events.push(event);
                        }
                        None => feed.skipped += 1,
                    }
                    continue;
                }
                // Stray END inside an event: drop the event as malformed.
                current = None;
                feed.skipped += 1;
                continue;
            }
            if sub_depth == 0
                && let Some(event) = current.as_mut()
            {
                event.absorb(line);
            }
        } else if upper == "BEGIN:VEVENT" {
            current = Some(PartialEvent::default());
            sub_depth = 0;
        }
    }

    // Unterminated trailing event (truncated feed)
    if current.is_some() {
        feed.skipped += 1;
    }

    Ok(feed)
}

/// Undo RFC 5545 line folding and drop blank lines.
fn unfold(text: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for raw in text.split('\n') {
        let raw = raw.strip_suffix('\r').unwrap_or(raw);
        if let Some(rest) = raw.strip_prefix(' ').or_else(|| raw.strip_prefix('\t')) {
            if let Some(last) = lines.last_mut() {
                last.push_str(rest);
            }
            // A continuation with nothing to continue is dropped.
        } else if !raw.is_empty() {
            lines.push(raw.to_string());
        }
    }
    lines
}

#[derive(Debug, Default)]
struct PartialEvent {
    uid: Option<String>,
    summary: Option<String>,
    start: Option<DatePart>,
    end: Option<DatePart>,
    malformed: bool,
}

impl PartialEvent {
    /// Take one content line. Unknown properties are ignored; a property we
    /// do care about that fails to parse poisons the event.
    fn absorb(&mut self, line: &str) {
        let Some((head, value)) = line.split_once(':') else {
            return;
        };
        let mut params = head.split(';');
        let name = params.next().unwrap_or("").to_ascii_uppercase();
        let params: Vec<String> = params.map(|p| p.to_ascii_uppercase()).collect();

        match name.as_str() {
            "UID" => {
                if value.len() > MAX_UID_LEN {
                    self.malformed = true;
                } else {
                    self.uid = Some(value.to_string());
                }
            }
            "SUMMARY" => {
                if value.len() > MAX_SUMMARY_LEN {
                    self.malformed = true;
                } else {
                    self.summary = Some(unescape(value));
                }
            }
            "DTSTART" => match parse_date_part(&params, value) {
                Some(part) => self.start = Some(part),
                None => self.malformed = true,
            },
            "DTEND" => match parse_date_part(&params, value) {
                Some(part) => self.end = Some(part),
                None => self.malformed = true,
            },
            _ => {}
        }
    }

    fn finish(self) -> Option<FeedEvent> {
        if self.malformed {
            return None;
        }
        Some(FeedEvent {
            uid: self.uid,
            summary: self.summary,
            start: self.start?,
            end: self.end,
        })
    }
}

/// A date boundary is either a whole-day value (`VALUE=DATE` or a bare
/// `YYYYMMDD`), a UTC-anchored timestamp (`...Z`), or a floating timestamp
/// with no declared offset. `TZID`-tagged values carry an offset we cannot
/// resolve without a tz database, so they are treated as floating in the
/// property's timezone.
fn parse_date_part(params: &[String], value: &str) -> Option<DatePart> {
    let is_date = params.iter().any(|p| p == "VALUE=DATE")
        || (value.len() == 8 && value.bytes().all(|b| b.is_ascii_digit()));
    if is_date {
        let date = NaiveDate::parse_from_str(value, "%Y%m%d").ok()?;
        return Some(DatePart::AllDay(date));
    }
    if let Some(stripped) = value.strip_suffix('Z') {
        let dt = NaiveDateTime::parse_from_str(stripped, "%Y%m%dT%H%M%S").ok()?;
        return Some(DatePart::TimestampUtc(dt.and_utc()));
    }
    let dt = NaiveDateTime::parse_from_str(value, "%Y%m%dT%H%M%S").ok()?;
    Some(DatePart::TimestampFloating(dt.date(), dt.time()))
}

/// Minimal RFC 5545 text unescaping for SUMMARY values.
fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') | Some('N') => out.push(' '),
                Some(escaped) => out.push(escaped),
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}
