//! End-to-end reconciliation scenarios: feed documents in, consistent
//! non-overlapping room assignments out.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ulid::Ulid;

use roomsync::clock::{Clock, FixedClock};
use roomsync::config::{CategorySpec, IntegrationSpec, PropertySpec, Registry, RoomSpec};
use roomsync::documents::MemoryDocumentStore;
use roomsync::engine::Engine;
use roomsync::ics::FeedError;
use roomsync::model::*;
use roomsync::notify::NotifyHub;
use roomsync::sweep::sweep_once;
use roomsync::sync::{FeedOutcome, FeedSource, sync_once};

fn ts(s: &str) -> DateTime<Utc> {
    s.parse().unwrap()
}

fn test_journal_path(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("roomsync_test_reconcile");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    let _ = std::fs::remove_file(&path);
    path
}

/// Canned feed documents keyed by URL; unknown URLs fail like a dead host.
#[derive(Default)]
struct CannedFeeds {
    documents: Mutex<HashMap<String, String>>,
}

impl CannedFeeds {
    fn set(&self, url: &str, body: &str) {
        self.documents
            .lock()
            .unwrap()
            .insert(url.to_string(), body.to_string());
    }
}

#[async_trait]
impl FeedSource for CannedFeeds {
    async fn fetch(&self, url: &str) -> Result<String, FeedError> {
        self.documents
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| FeedError::Http("connection refused".into()))
    }
}

struct World {
    registry: Arc<Registry>,
    property: PropertyId,
    room101: RoomId,
    room102: RoomId,
    deluxe: CategoryId,
    feed_room101: IntegrationSpec,
    feed_deluxe: IntegrationSpec,
}

fn world() -> World {
    let property = Ulid::new();
    let room101 = Ulid::new();
    let room102 = Ulid::new();
    let deluxe = Ulid::new();

    let feed_room101 = IntegrationSpec {
        id: Ulid::new(),
        property_id: property,
        url: "https://channel.example/room101.ics".into(),
        channel: Some("channelco".into()),
        room_id: Some(room101),
        category_id: None,
    };
    let feed_deluxe = IntegrationSpec {
        id: Ulid::new(),
        property_id: property,
        url: "https://channel.example/deluxe.ics".into(),
        channel: Some("channelco".into()),
        room_id: None,
        category_id: Some(deluxe),
    };

    let registry = Registry {
        properties: vec![PropertySpec {
            id: property,
            name: "Seaside".into(),
            utc_offset_minutes: Some(60),
            check_in: Some("15:00:00".parse().unwrap()),
            check_out: Some("11:00:00".parse().unwrap()),
            rooms: vec![
                RoomSpec {
                    id: room101,
                    name: "101".into(),
                    category_id: Some(deluxe),
                },
                RoomSpec {
                    id: room102,
                    name: "102".into(),
                    category_id: Some(deluxe),
                },
            ],
            categories: vec![CategorySpec {
                id: deluxe,
                name: "Deluxe".into(),
            }],
        }],
        integrations: vec![feed_room101.clone(), feed_deluxe.clone()],
    };

    World {
        registry: Arc::new(registry),
        property,
        room101,
        room102,
        deluxe,
        feed_room101,
        feed_deluxe,
    }
}

fn engine_for(w: &World, name: &str) -> Arc<Engine> {
    let notify = Arc::new(NotifyHub::new());
    Arc::new(Engine::new(w.registry.clone(), test_journal_path(name), notify).unwrap())
}

/// No live reservations on the same room may overlap — checked over every
/// room after each scenario step.
async fn assert_no_double_booking(engine: &Engine, w: &World, now: DateTime<Utc>) {
    for room in [w.room101, w.room102] {
        let occupancy = engine.room_occupancy(w.property, room, now).await.unwrap();
        for (i, a) in occupancy.iter().enumerate() {
            for b in &occupancy[i + 1..] {
                assert!(
                    !a.span.overlaps(&b.span),
                    "room {room} double-booked: {:?} vs {:?}",
                    a.span,
                    b.span
                );
            }
        }
    }
}

#[tokio::test]
async fn feed_sync_is_idempotent_end_to_end() {
    let w = world();
    let engine = engine_for(&w, "sync_idempotent.journal");
    let clock = FixedClock::at(ts("2025-03-01T00:00:00Z"));
    let feeds = CannedFeeds::default();

    // Two good events and one malformed one; a folded SUMMARY line.
    feeds.set(
        &w.feed_room101.url,
        "BEGIN:VCALENDAR\r\n\
         BEGIN:VEVENT\r\n\
         UID:bk-1001@channelco\r\n\
         DTSTART;VALUE=DATE:20250310\r\n\
         DTEND;VALUE=DATE:20250314\r\n\
         SUMMARY:Reserved -\r\n\
         \x20imported stay\r\n\
         END:VEVENT\r\n\
         BEGIN:VEVENT\r\n\
         UID:bk-broken@channelco\r\n\
         DTSTART:not-a-date\r\n\
         END:VEVENT\r\n\
         BEGIN:VEVENT\r\n\
         UID:bk-1002@channelco\r\n\
         DTSTART;VALUE=DATE:20250320\r\n\
         DTEND;VALUE=DATE:20250322\r\n\
         END:VEVENT\r\n\
         END:VCALENDAR\r\n",
    );
    feeds.set(&w.feed_deluxe.url, "BEGIN:VCALENDAR\r\nEND:VCALENDAR\r\n");

    let reports = sync_once(&engine, &feeds, &clock).await;
    assert_eq!(reports.len(), 2);
    let room_report = reports
        .iter()
        .find(|r| r.integration_id == w.feed_room101.id)
        .unwrap();
    match &room_report.outcome {
        FeedOutcome::Ingested(stats) => {
            assert_eq!(stats.parsed, 2);
            assert_eq!(stats.skipped, 1);
            assert_eq!(stats.created, 2);
            assert_eq!(stats.errors, 0);
        }
        other => panic!("expected Ingested, got {other:?}"),
    }

    // Running the same unchanged feed again creates nothing.
    let reports = sync_once(&engine, &feeds, &clock).await;
    let room_report = reports
        .iter()
        .find(|r| r.integration_id == w.feed_room101.id)
        .unwrap();
    match &room_report.outcome {
        FeedOutcome::Ingested(stats) => {
            assert_eq!(stats.created, 0);
            assert_eq!(stats.unchanged, 2);
        }
        other => panic!("expected Ingested, got {other:?}"),
    }

    assert_eq!(engine.list_reservations(w.property).await.unwrap().len(), 2);
    assert_eq!(engine.uid_entry_count(w.property).await.unwrap(), 2);
    assert_no_double_booking(&engine, &w, clock.now()).await;
}

#[tokio::test]
async fn unreachable_feed_is_not_mass_cancellation() {
    let w = world();
    let engine = engine_for(&w, "sync_unreachable.journal");
    let clock = FixedClock::at(ts("2025-03-01T00:00:00Z"));
    let feeds = CannedFeeds::default();

    feeds.set(
        &w.feed_room101.url,
        "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:bk-2001\r\nDTSTART;VALUE=DATE:20250401\r\nDTEND;VALUE=DATE:20250403\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n",
    );
    feeds.set(&w.feed_deluxe.url, "BEGIN:VCALENDAR\r\nEND:VCALENDAR\r\n");
    sync_once(&engine, &feeds, &clock).await;
    assert_eq!(engine.list_reservations(w.property).await.unwrap().len(), 1);

    // The channel goes dark; one feed fails, the other keeps working, and
    // nothing is cancelled.
    feeds.documents.lock().unwrap().remove(&w.feed_room101.url);
    let reports = sync_once(&engine, &feeds, &clock).await;
    let room_report = reports
        .iter()
        .find(|r| r.integration_id == w.feed_room101.id)
        .unwrap();
    assert!(matches!(room_report.outcome, FeedOutcome::Failed(_)));
    let deluxe_report = reports
        .iter()
        .find(|r| r.integration_id == w.feed_deluxe.id)
        .unwrap();
    assert!(matches!(deluxe_report.outcome, FeedOutcome::Ingested(_)));

    let reservations = engine.list_reservations(w.property).await.unwrap();
    assert_eq!(reservations.len(), 1);
    assert_eq!(reservations[0].status, ReservationStatus::Confirmed);
}

#[tokio::test]
async fn placeholder_promotes_when_channel_confirms() {
    let w = world();
    let engine = engine_for(&w, "sync_promote.journal");
    let clock = FixedClock::at(ts("2025-03-28T00:00:00Z"));
    let feeds = CannedFeeds::default();

    // Guest self-submits a Deluxe stay before any channel knows about it.
    let hold_id = Ulid::new();
    engine
        .create_guest_hold(
            hold_id,
            w.property,
            None,
            Some(w.deluxe),
            DateSpan::new("2025-04-01".parse().unwrap(), "2025-04-03".parse().unwrap()),
            GuestContact {
                name: Some("Ada Guest".into()),
                email: Some("ada@example.com".into()),
                phone: None,
            },
            ts("2025-04-05T00:00:00Z"),
            clock.now(),
        )
        .await
        .unwrap();

    // Three days later the channel publishes the same category/dates.
    clock.advance_to(ts("2025-03-31T00:00:00Z"));
    feeds.set(
        &w.feed_deluxe.url,
        "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:bk-3001@channelco\r\nDTSTART;VALUE=DATE:20250401\r\nDTEND;VALUE=DATE:20250403\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n",
    );
    feeds.set(&w.feed_room101.url, "BEGIN:VCALENDAR\r\nEND:VCALENDAR\r\n");
    sync_once(&engine, &feeds, &clock).await;

    let reservations = engine.list_reservations(w.property).await.unwrap();
    assert_eq!(reservations.len(), 1, "no new capacity consumed");
    let r = &reservations[0];
    assert_eq!(r.id, hold_id);
    assert_eq!(r.hold.unwrap().status, HoldStatus::Promoted);
    assert_eq!(r.channel.as_ref().unwrap().uid, "bk-3001@channelco");
    assert_eq!(r.guest.name.as_deref(), Some("Ada Guest"));
}

#[tokio::test]
async fn sweep_expires_overdue_holds_exactly_once() {
    let w = world();
    let engine = engine_for(&w, "sweep_expiry.journal");
    let clock = FixedClock::at(ts("2025-04-28T00:00:00Z"));
    let documents = MemoryDocumentStore::new();

    let hold_id = Ulid::new();
    engine
        .create_guest_hold(
            hold_id,
            w.property,
            Some(w.room101),
            None,
            DateSpan::new("2025-05-01".parse().unwrap(), "2025-05-02".parse().unwrap()),
            GuestContact::default(),
            ts("2025-04-30T00:00:00Z"),
            clock.now(),
        )
        .await
        .unwrap();

    // Before the deadline the sweep does nothing.
    let report = sweep_once(&engine, &documents, &clock).await;
    assert_eq!(report.expired, 0);

    clock.advance_to(ts("2025-04-30T06:00:00Z"));
    let report = sweep_once(&engine, &documents, &clock).await;
    assert_eq!(report.expired, 1);

    // A second pass is a no-op.
    let report = sweep_once(&engine, &documents, &clock).await;
    assert_eq!(report.expired, 0);

    // Capacity was released: staff can book the room for the same night.
    engine
        .create_manual_reservation(
            Ulid::new(),
            w.property,
            w.room101,
            DateSpan::new("2025-05-01".parse().unwrap(), "2025-05-02".parse().unwrap()),
            None,
            None,
            GuestContact::default(),
            clock.now(),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn sweep_merges_placeholder_and_moves_documents() {
    let w = world();
    let engine = engine_for(&w, "sweep_merge.journal");
    let clock = FixedClock::at(ts("2025-08-20T00:00:00Z"));
    let documents = MemoryDocumentStore::new();
    let feeds = CannedFeeds::default();

    // Guest placeholder with contact data and an uploaded document.
    let hold_id = Ulid::new();
    engine
        .create_guest_hold(
            hold_id,
            w.property,
            None,
            Some(w.deluxe),
            DateSpan::new("2025-09-01".parse().unwrap(), "2025-09-04".parse().unwrap()),
            GuestContact {
                name: Some("Grace Guest".into()),
                email: Some("grace@example.com".into()),
                phone: None,
            },
            ts("2025-09-10T00:00:00Z"),
            clock.now(),
        )
        .await
        .unwrap();
    let passport_scan = Ulid::new();
    documents.attach(passport_scan, hold_id);

    // Staff had already keyed the same stay in manually on room 101; the
    // channel event links to that record, leaving the placeholder behind.
    let target = Ulid::new();
    engine
        .create_manual_reservation(
            target,
            w.property,
            w.room101,
            DateSpan::new("2025-09-01".parse().unwrap(), "2025-09-04".parse().unwrap()),
            None,
            None,
            GuestContact::default(),
            clock.now(),
        )
        .await
        .unwrap();
    feeds.set(
        &w.feed_room101.url,
        "BEGIN:VCALENDAR\r\nBEGIN:VEVENT\r\nUID:bk-4001@channelco\r\nDTSTART;VALUE=DATE:20250901\r\nDTEND;VALUE=DATE:20250904\r\nEND:VEVENT\r\nEND:VCALENDAR\r\n",
    );
    feeds.set(&w.feed_deluxe.url, "BEGIN:VCALENDAR\r\nEND:VCALENDAR\r\n");
    sync_once(&engine, &feeds, &clock).await;

    // The room-scoped hint linked the channel event to the manual stay, not
    // the placeholder.
    let t = engine.reservation(w.property, target).await.unwrap().unwrap();
    assert_eq!(t.channel.as_ref().unwrap().uid, "bk-4001@channelco");

    let report = sweep_once(&engine, &documents, &clock).await;
    assert_eq!(report.merged, 1);

    let t = engine.reservation(w.property, target).await.unwrap().unwrap();
    assert_eq!(t.guest.name.as_deref(), Some("Grace Guest"));
    assert_eq!(t.guest.email.as_deref(), Some("grace@example.com"));

    let p = engine.reservation(w.property, hold_id).await.unwrap().unwrap();
    assert_eq!(p.status, ReservationStatus::Cancelled);

    // The document followed the guest onto the surviving reservation.
    assert_eq!(documents.owner(&passport_scan), Some(target));
    assert_no_double_booking(&engine, &w, clock.now()).await;
}

#[tokio::test]
async fn exported_calendars_reflect_engine_state() {
    let w = world();
    let engine = engine_for(&w, "export.journal");
    let clock = FixedClock::at(ts("2025-03-01T00:00:00Z"));

    engine
        .create_manual_reservation(
            Ulid::new(),
            w.property,
            w.room101,
            DateSpan::new("2025-03-10".parse().unwrap(), "2025-03-14".parse().unwrap()),
            None,
            None,
            GuestContact::default(),
            clock.now(),
        )
        .await
        .unwrap();

    let dir = std::env::temp_dir()
        .join("roomsync_test_reconcile")
        .join(format!("export-{}", Ulid::new()));
    roomsync::sync::export_calendars(&engine, &clock, &dir)
        .await
        .unwrap();

    let room_doc = std::fs::read_to_string(
        dir.join(w.property.to_string())
            .join(format!("room-{}.ics", w.room101)),
    )
    .unwrap();
    let parsed = roomsync::ics::parse_calendar(&room_doc).unwrap();
    assert_eq!(parsed.events.len(), 1);
    assert_eq!(
        parsed.events[0].start,
        DatePart::AllDay("2025-03-10".parse().unwrap())
    );

    // Empty room exports an empty (but valid) calendar.
    let other_doc = std::fs::read_to_string(
        dir.join(w.property.to_string())
            .join(format!("room-{}.ics", w.room102)),
    )
    .unwrap();
    assert!(roomsync::ics::parse_calendar(&other_doc).unwrap().events.is_empty());

    let _ = std::fs::remove_dir_all(&dir);
}
