use chrono::NaiveDate;

use crate::model::{CategoryId, DateSpan, Reservation};

const PRODID: &str = "-//roomsync//reconciler//EN";

/// Outbound per-room calendar: every reservation currently occupying the room
/// as a whole-day event. Event UIDs derive from the reservation's own key plus
/// its date range, so regenerating the document yields identical identifiers.
pub fn room_calendar(room_name: &str, reservations: &[Reservation]) -> String {
    let mut doc = CalendarDoc::new(&format!("roomsync {room_name}"));
    for r in reservations {
        doc.event(
            &format!("{}-{}-{}@roomsync", r.id, compact(r.span.start), compact(r.span.end)),
            &r.span,
            "Reserved",
        );
    }
    doc.finish()
}

/// Outbound per-category calendar: the inferred fully-booked date ranges.
pub fn category_calendar(
    category_name: &str,
    category_id: CategoryId,
    busy: &[DateSpan],
) -> String {
    let mut doc = CalendarDoc::new(&format!("roomsync {category_name}"));
    for span in busy {
        doc.event(
            &format!("{category_id}-{}-{}@roomsync", compact(span.start), compact(span.end)),
            span,
            "Fully booked",
        );
    }
    doc.finish()
}

fn compact(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

struct CalendarDoc {
    out: String,
}

impl CalendarDoc {
    fn new(name: &str) -> Self {
        let mut doc = Self { out: String::new() };
        doc.line("BEGIN:VCALENDAR");
        doc.line("VERSION:2.0");
        doc.line(&format!("PRODID:{PRODID}"));
        doc.line("CALSCALE:GREGORIAN");
        doc.line(&format!("X-WR-CALNAME:{}", escape(name)));
        doc
    }

    fn event(&mut self, uid: &str, span: &DateSpan, summary: &str) {
        self.line("BEGIN:VEVENT");
        self.line(&format!("UID:{uid}"));
        self.line(&format!("DTSTART;VALUE=DATE:{}", compact(span.start)));
        self.line(&format!("DTEND;VALUE=DATE:{}", compact(span.end)));
        self.line(&format!("SUMMARY:{}", escape(summary)));
        self.line("END:VEVENT");
    }

    /// Write one content line, folded at 75 octets per RFC 5545.
    fn line(&mut self, content: &str) {
        let mut remaining = content;
        let mut first = true;
        while !remaining.is_empty() {
            let width = if first { 75 } else { 74 };
            let take = floor_char_boundary(remaining, width.min(remaining.len()));
            if !first {
                self.out.push(' ');
            }
            self.out.push_str(&remaining[..take]);
            self.out.push_str("\r\n");
            remaining = &remaining[take..];
            first = false;
        }
        if content.is_empty() {
            self.out.push_str("\r\n");
        }
    }

    fn finish(mut self) -> String {
        self.line("END:VCALENDAR");
        self.out
    }
}

fn floor_char_boundary(s: &str, index: usize) -> usize {
    let mut i = index.min(s.len());
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    if i == 0 {
        // Never emit an empty segment: take at least the first character.
        s.chars().next().map_or(0, |c| c.len_utf8())
    } else {
        i
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ',' => out.push_str("\\,"),
            ';' => out.push_str("\\;"),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ics::parse_calendar;
    use crate::model::*;
    use ulid::Ulid;

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn reservation(span: DateSpan) -> Reservation {
        Reservation {
            id: Ulid::new(),
            property_id: Ulid::new(),
            room_id: Some(Ulid::new()),
            category_id: None,
            span,
            arrival_time: None,
            departure_time: None,
            status: ReservationStatus::Confirmed,
            provenance: Provenance::Manual,
            channel: None,
            guest: GuestContact::default(),
            guest_locked: false,
            hold: None,
        }
    }

    #[test]
    fn room_calendar_round_trips_through_parser() {
        let r = reservation(DateSpan::new(d("2025-03-10"), d("2025-03-14")));
        let doc = room_calendar("101", &[r.clone()]);
        let feed = parse_calendar(&doc).unwrap();
        assert_eq!(feed.skipped, 0);
        assert_eq!(feed.events.len(), 1);
        assert_eq!(feed.events[0].start, DatePart::AllDay(d("2025-03-10")));
        assert_eq!(feed.events[0].end, Some(DatePart::AllDay(d("2025-03-14"))));
    }

    #[test]
    fn uids_are_stable_across_regeneration() {
        let r = reservation(DateSpan::new(d("2025-03-10"), d("2025-03-14")));
        let a = room_calendar("101", &[r.clone()]);
        let b = room_calendar("101", &[r]);
        assert_eq!(a, b);
    }

    #[test]
    fn uid_encodes_reservation_key_and_dates() {
        let r = reservation(DateSpan::new(d("2025-03-10"), d("2025-03-14")));
        let doc = room_calendar("101", &[r.clone()]);
        let feed = parse_calendar(&doc).unwrap();
        let uid = feed.events[0].uid.clone().unwrap();
        assert_eq!(uid, format!("{}-20250310-20250314@roomsync", r.id));
    }

    #[test]
    fn category_calendar_lists_busy_ranges() {
        let cid = Ulid::new();
        let busy = vec![
            DateSpan::new(d("2025-04-01"), d("2025-04-03")),
            DateSpan::new(d("2025-04-10"), d("2025-04-11")),
        ];
        let doc = category_calendar("Deluxe", cid, &busy);
        let feed = parse_calendar(&doc).unwrap();
        assert_eq!(feed.events.len(), 2);
        assert_eq!(feed.events[0].start, DatePart::AllDay(d("2025-04-01")));
    }

    #[test]
    fn long_lines_are_folded_and_unfold_back() {
        let long_name = "a".repeat(200);
        let doc = category_calendar(&long_name, Ulid::new(), &[]);
        assert!(doc.lines().all(|l| l.len() <= 75));
        // The parser unfolds what the emitter folded.
        parse_calendar(&doc).unwrap();
    }
}
