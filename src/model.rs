use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

pub type PropertyId = Ulid;
pub type RoomId = Ulid;
pub type CategoryId = Ulid;
pub type ReservationId = Ulid;
pub type IntegrationId = Ulid;

/// Half-open date range `[start, end)` — `end` is the checkout day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateSpan {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateSpan {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        debug_assert!(start < end, "DateSpan start must be before end");
        Self { start, end }
    }

    pub fn nights(&self) -> i64 {
        (self.end - self.start).num_days()
    }

    /// Date-level overlap. Back-to-back stays sharing a turnover day do not overlap.
    pub fn overlaps(&self, other: &DateSpan) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Iterate the occupied nights: every date in `[start, end)`.
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + use<> {
        let end = self.end;
        self.start.iter_days().take_while(move |d| *d < end)
    }
}

/// A start/end boundary as parsed from a feed, before timezone resolution.
///
/// Floating timestamps carry no offset and are interpreted in the property's
/// timezone only at the point of conflict checking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatePart {
    AllDay(NaiveDate),
    TimestampUtc(DateTime<Utc>),
    TimestampFloating(NaiveDate, NaiveTime),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationStatus {
    Confirmed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HoldStatus {
    Pending,
    Promoted,
    Expired,
    Cancelled,
}

impl HoldStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, HoldStatus::Pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Provenance {
    Manual,
    GuestForm,
    ChannelFeed,
}

/// Linkage back to the external channel event a reservation was matched to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelLink {
    pub uid: String,
    pub integration_id: IntegrationId,
    pub channel: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuestContact {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

impl GuestContact {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.email.is_none() && self.phone.is_none()
    }
}

/// Guest-initiated placeholder state riding on a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SoftHold {
    pub status: HoldStatus,
    pub expires_at: DateTime<Utc>,
}

/// A contiguous stay assigned (or assignable) to a room.
///
/// Never physically deleted — retired via `status = Cancelled`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub property_id: PropertyId,
    pub room_id: Option<RoomId>,
    pub category_id: Option<CategoryId>,
    pub span: DateSpan,
    /// Explicit arrival/departure times; property check-in/check-out fill the gaps.
    pub arrival_time: Option<NaiveTime>,
    pub departure_time: Option<NaiveTime>,
    pub status: ReservationStatus,
    pub provenance: Provenance,
    pub channel: Option<ChannelLink>,
    pub guest: GuestContact,
    /// Guest fields came from a form submission; a merge must not overwrite them.
    pub guest_locked: bool,
    pub hold: Option<SoftHold>,
}

impl Reservation {
    /// Whether this reservation occupies capacity at instant `now`.
    ///
    /// A pending hold past its deadline stops blocking even before the sweep
    /// flips it to `Expired`.
    pub fn blocks_at(&self, now: DateTime<Utc>) -> bool {
        if self.status != ReservationStatus::Confirmed {
            return false;
        }
        match &self.hold {
            None => true,
            Some(h) => match h.status {
                HoldStatus::Promoted => true,
                HoldStatus::Pending => h.expires_at > now,
                HoldStatus::Expired | HoldStatus::Cancelled => false,
            },
        }
    }

    pub fn is_pending_hold(&self) -> bool {
        self.status == ReservationStatus::Confirmed
            && self.hold.is_some_and(|h| h.status == HoldStatus::Pending)
    }
}

/// Identity Map entry: durable association from a channel UID to the internal
/// reservation it was last matched to. The idempotency anchor for ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UidEntry {
    pub uid: String,
    pub reservation_id: ReservationId,
    pub last_span: DateSpan,
    pub last_room: Option<RoomId>,
    pub integration_id: IntegrationId,
    pub synced_at: DateTime<Utc>,
}

/// Why a parsed event could not be auto-matched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InboxReason {
    AmbiguousMatch {
        candidates: Vec<ReservationId>,
    },
    DateConflict {
        with: ReservationId,
    },
    AmbiguousMerge {
        placeholders: Vec<ReservationId>,
        target: ReservationId,
    },
    UnknownRoom,
}

/// A parsed channel event awaiting manual (or later automatic) resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxEntry {
    pub id: Ulid,
    pub property_id: PropertyId,
    pub uid: Option<String>,
    pub summary: Option<String>,
    pub span: DateSpan,
    pub room_hint: Option<RoomId>,
    pub category_hint: Option<CategoryId>,
    /// Absent for entries raised by the sweep rather than a feed pass.
    pub integration_id: Option<IntegrationId>,
    pub reason: InboxReason,
    pub resolved: bool,
}

/// The journal record format. Replay rebuilds all board state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ReservationCreated {
        reservation: Reservation,
    },
    /// Identity Resolver refresh of an already-linked reservation.
    ChannelRefreshed {
        id: ReservationId,
        property_id: PropertyId,
        span: DateSpan,
        room_id: Option<RoomId>,
        uid: String,
        integration_id: IntegrationId,
        channel: Option<String>,
    },
    RoomAssigned {
        id: ReservationId,
        property_id: PropertyId,
        room_id: RoomId,
    },
    ReservationCancelled {
        id: ReservationId,
        property_id: PropertyId,
    },
    HoldPromoted {
        id: ReservationId,
        property_id: PropertyId,
        uid: Option<String>,
        integration_id: Option<IntegrationId>,
        channel: Option<String>,
    },
    HoldExpired {
        id: ReservationId,
        property_id: PropertyId,
    },
    /// Merge Operator: copy empty guest fields from placeholder to target,
    /// then retire the placeholder.
    GuestMerged {
        placeholder_id: ReservationId,
        target_id: ReservationId,
        property_id: PropertyId,
    },
    /// Identity Map upsert.
    UidBound {
        property_id: PropertyId,
        uid: String,
        reservation_id: ReservationId,
        span: DateSpan,
        room_id: Option<RoomId>,
        integration_id: IntegrationId,
        synced_at: DateTime<Utc>,
    },
    InboxAdded {
        entry: InboxEntry,
    },
    InboxResolved {
        id: Ulid,
        property_id: PropertyId,
        reservation_id: Option<ReservationId>,
    },
}

impl Event {
    /// The property a journal event belongs to, for board routing.
    pub fn property_id(&self) -> PropertyId {
        match self {
            Event::ReservationCreated { reservation } => reservation.property_id,
            Event::ChannelRefreshed { property_id, .. }
            | Event::RoomAssigned { property_id, .. }
            | Event::ReservationCancelled { property_id, .. }
            | Event::HoldPromoted { property_id, .. }
            | Event::HoldExpired { property_id, .. }
            | Event::GuestMerged { property_id, .. }
            | Event::UidBound { property_id, .. }
            | Event::InboxResolved { property_id, .. } => *property_id,
            Event::InboxAdded { entry } => entry.property_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[test]
    fn span_nights_and_overlap() {
        let a = DateSpan::new(d("2025-03-10"), d("2025-03-14"));
        assert_eq!(a.nights(), 4);

        let b = DateSpan::new(d("2025-03-13"), d("2025-03-16"));
        assert!(a.overlaps(&b));

        // Turnover day is shared, not overlapping
        let c = DateSpan::new(d("2025-03-14"), d("2025-03-16"));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn span_days_half_open() {
        let a = DateSpan::new(d("2025-05-01"), d("2025-05-03"));
        let days: Vec<NaiveDate> = a.days().collect();
        assert_eq!(days, vec![d("2025-05-01"), d("2025-05-02")]);
    }

    #[test]
    fn pending_hold_blocks_until_deadline() {
        let now: DateTime<Utc> = "2025-04-01T12:00:00Z".parse().unwrap();
        let mut r = Reservation {
            id: Ulid::new(),
            property_id: Ulid::new(),
            room_id: None,
            category_id: None,
            span: DateSpan::new(d("2025-04-10"), d("2025-04-12")),
            arrival_time: None,
            departure_time: None,
            status: ReservationStatus::Confirmed,
            provenance: Provenance::GuestForm,
            channel: None,
            guest: GuestContact::default(),
            guest_locked: true,
            hold: Some(SoftHold {
                status: HoldStatus::Pending,
                expires_at: "2025-04-02T12:00:00Z".parse().unwrap(),
            }),
        };
        assert!(r.blocks_at(now));

        // Past deadline the hold stops blocking even before a sweep runs
        let later: DateTime<Utc> = "2025-04-03T00:00:00Z".parse().unwrap();
        assert!(!r.blocks_at(later));

        r.hold = Some(SoftHold {
            status: HoldStatus::Promoted,
            expires_at: "2025-04-02T12:00:00Z".parse().unwrap(),
        });
        assert!(r.blocks_at(later));

        r.status = ReservationStatus::Cancelled;
        assert!(!r.blocks_at(now));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::UidBound {
            property_id: Ulid::new(),
            uid: "abc123@channel".into(),
            reservation_id: Ulid::new(),
            span: DateSpan::new(d("2025-06-01"), d("2025-06-05")),
            room_id: Some(Ulid::new()),
            integration_id: Ulid::new(),
            synced_at: Utc::now(),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
