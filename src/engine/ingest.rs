use chrono::{DateTime, Days, NaiveTime, Utc};
use tracing::debug;
use ulid::Ulid;

use crate::config::{IntegrationSpec, PropertySpec};
use crate::ics::FeedEvent;
use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, validate_span};
use super::store::PropertyBoard;
use super::{Engine, EngineError};

/// A parsed feed event normalized against its property: concrete date span,
/// optional times of day, and the room/category hints inherited from the
/// integration scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEvent {
    pub uid: Option<String>,
    pub summary: Option<String>,
    pub span: DateSpan,
    pub arrival_time: Option<NaiveTime>,
    pub departure_time: Option<NaiveTime>,
    pub room_hint: Option<RoomId>,
    pub category_hint: Option<CategoryId>,
}

/// What happened to one channel event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Known UID, nothing changed since last sync.
    Unchanged(ReservationId),
    /// Known UID, stored dates/room/metadata refreshed.
    Refreshed(ReservationId),
    /// Matched an existing reservation and linked to it.
    Matched(ReservationId),
    /// Matched a pending placeholder, which is now promoted.
    Promoted(ReservationId),
    /// No candidate existed; a new reservation was created.
    Created(ReservationId),
    /// Routed to the unassigned inbox.
    Inboxed(Ulid),
}

/// Resolve a `DatePart` boundary to the property-local calendar date.
/// Only UTC-anchored timestamps need the property offset.
fn local_date(
    spec: &PropertySpec,
    part: &DatePart,
) -> Result<chrono::NaiveDate, EngineError> {
    match part {
        DatePart::AllDay(d) => Ok(*d),
        DatePart::TimestampFloating(d, _) => Ok(*d),
        DatePart::TimestampUtc(ts) => {
            let minutes = spec.utc_offset_minutes.ok_or(EngineError::ConfigGap {
                property_id: spec.id,
                what: "timezone offset",
            })?;
            let offset =
                chrono::FixedOffset::east_opt(minutes * 60).ok_or(EngineError::ConfigGap {
                    property_id: spec.id,
                    what: "timezone offset",
                })?;
            Ok(ts.with_timezone(&offset).date_naive())
        }
    }
}

fn local_time(spec: &PropertySpec, part: &DatePart) -> Option<NaiveTime> {
    match part {
        DatePart::AllDay(_) => None,
        DatePart::TimestampFloating(_, t) => Some(*t),
        DatePart::TimestampUtc(ts) => {
            let minutes = spec.utc_offset_minutes?;
            let offset = chrono::FixedOffset::east_opt(minutes * 60)?;
            Some(ts.with_timezone(&offset).time())
        }
    }
}

/// Normalize one parsed feed event against the property and integration scope.
///
/// An absent end boundary means a one-day event; a vendor writing
/// `DTEND == DTSTART` means the same.
pub fn normalize_event(
    spec: &PropertySpec,
    integration: &IntegrationSpec,
    event: &FeedEvent,
) -> Result<ChannelEvent, EngineError> {
    let start = local_date(spec, &event.start)?;
    let end = match &event.end {
        Some(part) => local_date(spec, part)?,
        None => start
            .checked_add_days(Days::new(1))
            .ok_or(EngineError::InvalidSpan("date out of range"))?,
    };
    let end = if end == start {
        start
            .checked_add_days(Days::new(1))
            .ok_or(EngineError::InvalidSpan("date out of range"))?
    } else {
        end
    };
    if end < start {
        return Err(EngineError::InvalidSpan("end before start"));
    }
    let span = DateSpan::new(start, end);
    validate_span(&span)?;

    if event.uid.as_ref().is_some_and(|u| u.len() > MAX_UID_LEN) {
        return Err(EngineError::LimitExceeded("uid too long"));
    }

    Ok(ChannelEvent {
        uid: event.uid.clone(),
        summary: event.summary.clone(),
        span,
        arrival_time: local_time(spec, &event.start),
        departure_time: event.end.as_ref().and_then(|p| local_time(spec, p)),
        room_hint: integration.room_id,
        category_hint: integration.category_id,
    })
}

enum MatchResolution {
    Unique(ReservationId),
    NoMatch,
    Ambiguous(Vec<ReservationId>),
}

/// The Allocation Matcher's ordered strategies: exact-date candidates, then
/// room-hint narrowing, then category-hint narrowing. Ambiguity is returned,
/// never guessed away.
fn match_candidates(
    board: &PropertyBoard,
    spec: &PropertySpec,
    ev: &ChannelEvent,
    now: DateTime<Utc>,
) -> MatchResolution {
    let candidates = board.exact_span_candidates(&ev.span, now);
    match candidates.len() {
        0 => MatchResolution::NoMatch,
        1 => MatchResolution::Unique(candidates[0].id),
        _ => {
            if let Some(room) = ev.room_hint {
                let narrowed: Vec<&&Reservation> = candidates
                    .iter()
                    .filter(|r| r.room_id == Some(room))
                    .collect();
                if narrowed.len() == 1 {
                    return MatchResolution::Unique(narrowed[0].id);
                }
            }
            if let Some(cat) = ev.category_hint {
                let narrowed: Vec<&&Reservation> = candidates
                    .iter()
                    .filter(|r| spec.category_of(r) == Some(cat))
                    .collect();
                if narrowed.len() == 1 {
                    return MatchResolution::Unique(narrowed[0].id);
                }
            }
            MatchResolution::Ambiguous(candidates.iter().map(|r| r.id).collect())
        }
    }
}

impl Engine {
    /// Reconcile one normalized channel event. The UID lookup, candidate
    /// selection, conflict check, and commit all run under one board write
    /// lock, so overlapping sync runs serialize per property.
    pub async fn ingest_channel_event(
        &self,
        integration: &IntegrationSpec,
        ev: ChannelEvent,
        now: DateTime<Utc>,
    ) -> Result<IngestOutcome, EngineError> {
        let property_id = integration.property_id;
        let spec = self.property_spec(&property_id)?;
        validate_span(&ev.span)?;

        let board = self.board_or_err(&property_id)?;
        let mut guard = board.write().await;

        // Identity Resolver: a known UID is an update, not a new stay.
        if let Some(uid) = ev.uid.clone()
            && let Some(entry) = guard.uid_map.get(&uid)
        {
            let rid = entry.reservation_id;
            let live = guard
                .reservation(&rid)
                .is_some_and(|r| r.status != ReservationStatus::Cancelled);
            if live {
                return self
                    .refresh_linked(&mut guard, spec, integration, rid, &uid, &ev, now)
                    .await;
            }
            // The linked reservation was cancelled; the event re-enters
            // matching as a new candidate.
            debug!("uid {uid} points at cancelled reservation {rid}; rematching");
        }

        match match_candidates(&guard, spec, &ev, now) {
            MatchResolution::Unique(rid) => {
                self.adopt_candidate(&mut guard, integration, rid, &ev, now)
                    .await
            }
            MatchResolution::NoMatch => {
                self.create_from_event(&mut guard, spec, integration, &ev, now)
                    .await
            }
            MatchResolution::Ambiguous(candidates) => {
                let entry_id = self
                    .push_inbox(
                        &mut guard,
                        &ev,
                        Some(integration.id),
                        InboxReason::AmbiguousMatch { candidates },
                    )
                    .await?;
                Ok(IngestOutcome::Inboxed(entry_id))
            }
        }
    }

    /// Later matcher pass over unresolved inbox entries: resolve the ones
    /// whose ambiguity (or conflict) has cleared. Entries that still cannot
    /// be placed stay put — no duplicates are added.
    pub async fn retry_inbox(
        &self,
        property_id: PropertyId,
        now: DateTime<Utc>,
    ) -> Result<Vec<(Ulid, IngestOutcome)>, EngineError> {
        let spec = self.property_spec(&property_id)?;
        let board = self.board_or_err(&property_id)?;
        let mut guard = board.write().await;

        let entries: Vec<InboxEntry> = guard
            .unresolved_inbox()
            .into_iter()
            .filter(|e| !matches!(e.reason, InboxReason::AmbiguousMerge { .. }))
            .cloned()
            .collect();

        let mut resolutions = Vec::new();
        for entry in entries {
            let ev = ChannelEvent {
                uid: entry.uid.clone(),
                summary: entry.summary.clone(),
                span: entry.span,
                arrival_time: None,
                departure_time: None,
                room_hint: entry.room_hint,
                category_hint: entry.category_hint,
            };
            let integration = entry
                .integration_id
                .and_then(|id| self.registry.integrations.iter().find(|i| i.id == id));

            let outcome = match match_candidates(&guard, spec, &ev, now) {
                MatchResolution::Unique(rid) => match integration {
                    Some(integration) => {
                        Some(self.adopt_candidate(&mut guard, integration, rid, &ev, now).await?)
                    }
                    None => None,
                },
                MatchResolution::NoMatch => match integration {
                    Some(integration) => {
                        match self
                            .try_create(&mut guard, spec, integration, &ev, now)
                            .await?
                        {
                            Ok(outcome) => Some(outcome),
                            Err(_) => None, // still unplaceable; keep the original entry
                        }
                    }
                    None => None,
                },
                MatchResolution::Ambiguous(_) => None,
            };

            if let Some(outcome) = outcome {
                self.persist_and_apply(
                    &mut guard,
                    &Event::InboxResolved {
                        id: entry.id,
                        property_id,
                        reservation_id: match outcome {
                            IngestOutcome::Matched(id)
                            | IngestOutcome::Promoted(id)
                            | IngestOutcome::Created(id)
                            | IngestOutcome::Refreshed(id)
                            | IngestOutcome::Unchanged(id) => Some(id),
                            IngestOutcome::Inboxed(_) => None,
                        },
                    },
                )
                .await?;
                resolutions.push((entry.id, outcome));
            }
        }
        Ok(resolutions)
    }

    /// Identity-map hit: refresh the linked reservation's stored dates, room
    /// and channel metadata. A date/room change that would now collide goes to
    /// the inbox instead of moving the stay.
    async fn refresh_linked(
        &self,
        guard: &mut PropertyBoard,
        spec: &PropertySpec,
        integration: &IntegrationSpec,
        rid: ReservationId,
        uid: &str,
        ev: &ChannelEvent,
        now: DateTime<Utc>,
    ) -> Result<IngestOutcome, EngineError> {
        let r = guard.reservation(&rid).ok_or(EngineError::NotFound(rid))?;
        let new_room = ev.room_hint.or(r.room_id);
        let dates_changed = r.span != ev.span || r.room_id != new_room;
        let link_changed = match &r.channel {
            Some(link) => link.uid != uid || link.integration_id != integration.id,
            None => true,
        };
        let pending = r.is_pending_hold();
        let arrival = r.arrival_time;
        let departure = r.departure_time;

        if dates_changed && let Some(room) = new_room {
            if spec.room(room).is_none() {
                let entry_id = self
                    .push_inbox(guard, ev, Some(integration.id), InboxReason::UnknownRoom)
                    .await?;
                return Ok(IngestOutcome::Inboxed(entry_id));
            }
            if let Err(EngineError::Conflict { with, .. }) = check_no_conflict(
                guard,
                spec,
                room,
                &ev.span,
                arrival,
                departure,
                Some(rid),
                now,
            ) {
                let entry_id = self
                    .push_inbox(
                        guard,
                        ev,
                        Some(integration.id),
                        InboxReason::DateConflict { with },
                    )
                    .await?;
                return Ok(IngestOutcome::Inboxed(entry_id));
            }
        }

        if dates_changed || link_changed {
            self.persist_and_apply(
                guard,
                &Event::ChannelRefreshed {
                    id: rid,
                    property_id: guard.id,
                    span: ev.span,
                    room_id: new_room,
                    uid: uid.to_string(),
                    integration_id: integration.id,
                    channel: integration.channel.clone(),
                },
            )
            .await?;
            self.bind_uid(guard, integration, uid, rid, &ev.span, new_room, now)
                .await?;
        }

        if pending {
            self.persist_and_apply(
                guard,
                &Event::HoldPromoted {
                    id: rid,
                    property_id: guard.id,
                    uid: Some(uid.to_string()),
                    integration_id: Some(integration.id),
                    channel: integration.channel.clone(),
                },
            )
            .await?;
            return Ok(IngestOutcome::Promoted(rid));
        }

        if dates_changed || link_changed {
            Ok(IngestOutcome::Refreshed(rid))
        } else {
            Ok(IngestOutcome::Unchanged(rid))
        }
    }

    /// The matcher picked a unique existing reservation: link the UID to it
    /// and promote it if it is a pending placeholder.
    async fn adopt_candidate(
        &self,
        guard: &mut PropertyBoard,
        integration: &IntegrationSpec,
        rid: ReservationId,
        ev: &ChannelEvent,
        now: DateTime<Utc>,
    ) -> Result<IngestOutcome, EngineError> {
        let r = guard.reservation(&rid).ok_or(EngineError::NotFound(rid))?;
        let room = r.room_id;
        let pending = r.is_pending_hold();

        if let Some(uid) = &ev.uid {
            self.persist_and_apply(
                guard,
                &Event::ChannelRefreshed {
                    id: rid,
                    property_id: guard.id,
                    span: ev.span,
                    room_id: room,
                    uid: uid.clone(),
                    integration_id: integration.id,
                    channel: integration.channel.clone(),
                },
            )
            .await?;
            self.bind_uid(guard, integration, uid, rid, &ev.span, room, now)
                .await?;
        }

        if pending {
            self.persist_and_apply(
                guard,
                &Event::HoldPromoted {
                    id: rid,
                    property_id: guard.id,
                    uid: ev.uid.clone(),
                    integration_id: Some(integration.id),
                    channel: integration.channel.clone(),
                },
            )
            .await?;
            return Ok(IngestOutcome::Promoted(rid));
        }
        Ok(IngestOutcome::Matched(rid))
    }

    /// Zero candidates: create a new confirmed reservation from the event, or
    /// route to the inbox when the room is unknown or the dates collide.
    async fn create_from_event(
        &self,
        guard: &mut PropertyBoard,
        spec: &PropertySpec,
        integration: &IntegrationSpec,
        ev: &ChannelEvent,
        now: DateTime<Utc>,
    ) -> Result<IngestOutcome, EngineError> {
        match self.try_create(guard, spec, integration, ev, now).await? {
            Ok(outcome) => Ok(outcome),
            Err(reason) => {
                let entry_id = self
                    .push_inbox(guard, ev, Some(integration.id), reason)
                    .await?;
                Ok(IngestOutcome::Inboxed(entry_id))
            }
        }
    }

    /// Attempt the create; the inner `Err` carries the inbox reason when the
    /// event cannot be placed.
    async fn try_create(
        &self,
        guard: &mut PropertyBoard,
        spec: &PropertySpec,
        integration: &IntegrationSpec,
        ev: &ChannelEvent,
        now: DateTime<Utc>,
    ) -> Result<Result<IngestOutcome, InboxReason>, EngineError> {
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_PROPERTY {
            return Err(EngineError::LimitExceeded("too many reservations on property"));
        }
        if let Some(room) = ev.room_hint {
            if spec.room(room).is_none() {
                return Ok(Err(InboxReason::UnknownRoom));
            }
            match check_no_conflict(
                guard,
                spec,
                room,
                &ev.span,
                ev.arrival_time,
                ev.departure_time,
                None,
                now,
            ) {
                Ok(()) => {}
                Err(EngineError::Conflict { with, .. }) => {
                    return Ok(Err(InboxReason::DateConflict { with }));
                }
                Err(e) => return Err(e),
            }
        }

        let reservation = Reservation {
            id: Ulid::new(),
            property_id: guard.id,
            room_id: ev.room_hint,
            category_id: ev
                .category_hint
                .or_else(|| ev.room_hint.and_then(|rid| spec.room(rid)).and_then(|r| r.category_id)),
            span: ev.span,
            arrival_time: ev.arrival_time,
            departure_time: ev.departure_time,
            status: ReservationStatus::Confirmed,
            provenance: Provenance::ChannelFeed,
            channel: ev.uid.clone().map(|uid| ChannelLink {
                uid,
                integration_id: integration.id,
                channel: integration.channel.clone(),
            }),
            guest: GuestContact::default(),
            guest_locked: false,
            hold: None,
        };
        let rid = reservation.id;
        self.persist_and_apply(guard, &Event::ReservationCreated { reservation })
            .await?;
        if let Some(uid) = &ev.uid {
            self.bind_uid(guard, integration, uid, rid, &ev.span, ev.room_hint, now)
                .await?;
        }
        Ok(Ok(IngestOutcome::Created(rid)))
    }

    async fn bind_uid(
        &self,
        guard: &mut PropertyBoard,
        integration: &IntegrationSpec,
        uid: &str,
        reservation_id: ReservationId,
        span: &DateSpan,
        room_id: Option<RoomId>,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        self.persist_and_apply(
            guard,
            &Event::UidBound {
                property_id: guard.id,
                uid: uid.to_string(),
                reservation_id,
                span: *span,
                room_id,
                integration_id: integration.id,
                synced_at: now,
            },
        )
        .await
    }

    /// Add an inbox entry unless an equivalent unresolved one already exists
    /// (repeated sync passes over the same stuck event must not pile up).
    async fn push_inbox(
        &self,
        guard: &mut PropertyBoard,
        ev: &ChannelEvent,
        integration_id: Option<IntegrationId>,
        reason: InboxReason,
    ) -> Result<Ulid, EngineError> {
        let duplicate = guard.inbox.values().find(|e| {
            !e.resolved
                && e.span == ev.span
                && e.uid == ev.uid
                && e.room_hint == ev.room_hint
                && e.category_hint == ev.category_hint
                && std::mem::discriminant(&e.reason) == std::mem::discriminant(&reason)
        });
        if let Some(existing) = duplicate {
            return Ok(existing.id);
        }
        if guard.inbox.len() >= MAX_INBOX_PER_PROPERTY {
            return Err(EngineError::LimitExceeded("inbox full"));
        }
        let entry = InboxEntry {
            id: Ulid::new(),
            property_id: guard.id,
            uid: ev.uid.clone(),
            summary: ev.summary.clone(),
            span: ev.span,
            room_hint: ev.room_hint,
            category_hint: ev.category_hint,
            integration_id,
            reason,
            resolved: false,
        };
        let id = entry.id;
        self.persist_and_apply(guard, &Event::InboxAdded { entry })
            .await?;
        Ok(id)
    }
}
