use chrono::{DateTime, NaiveTime, Utc};
use tracing::{debug, warn};
use ulid::Ulid;

use crate::config::PropertySpec;
use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, validate_span};
use super::{Engine, EngineError};

/// Outcome of one auto-merge pass over a property.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct MergeScanReport {
    /// `(placeholder, target)` pairs merged this pass.
    pub merged: Vec<(ReservationId, ReservationId)>,
    /// Targets with more than one qualifying placeholder, surfaced to the inbox.
    pub ambiguous: usize,
    /// Targets skipped because their guest data is locked.
    pub skipped_locked: usize,
}

/// Same-stay test for the Merge Operator: exact date range plus the same room
/// or the same category.
fn same_stay(spec: &PropertySpec, placeholder: &Reservation, target: &Reservation) -> bool {
    if placeholder.span != target.span {
        return false;
    }
    if let (Some(a), Some(b)) = (placeholder.room_id, target.room_id)
        && a == b
    {
        return true;
    }
    matches!(
        (spec.category_of(placeholder), spec.category_of(target)),
        (Some(a), Some(b)) if a == b
    )
}

fn validate_contact(guest: &GuestContact) -> Result<(), EngineError> {
    for field in [&guest.name, &guest.email, &guest.phone].into_iter().flatten() {
        if field.len() > MAX_CONTACT_FIELD_LEN {
            return Err(EngineError::LimitExceeded("contact field too long"));
        }
    }
    Ok(())
}

impl Engine {
    /// Staff entry: a confirmed reservation on a specific room.
    pub async fn create_manual_reservation(
        &self,
        id: ReservationId,
        property_id: PropertyId,
        room_id: RoomId,
        span: DateSpan,
        arrival_time: Option<NaiveTime>,
        departure_time: Option<NaiveTime>,
        guest: GuestContact,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        validate_span(&span)?;
        validate_contact(&guest)?;
        let spec = self.property_spec(&property_id)?;
        if spec.room(room_id).is_none() {
            return Err(EngineError::RoomNotFound(room_id));
        }
        let board = self.board_or_err(&property_id)?;
        let mut guard = board.write().await;
        if guard.reservations.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_PROPERTY {
            return Err(EngineError::LimitExceeded("too many reservations on property"));
        }

        check_no_conflict(&guard, spec, room_id, &span, arrival_time, departure_time, None, now)?;

        let reservation = Reservation {
            id,
            property_id,
            room_id: Some(room_id),
            category_id: spec.room(room_id).and_then(|r| r.category_id),
            span,
            arrival_time,
            departure_time,
            status: ReservationStatus::Confirmed,
            provenance: Provenance::Manual,
            channel: None,
            guest,
            guest_locked: false,
            hold: None,
        };
        self.persist_and_apply(&mut guard, &Event::ReservationCreated { reservation })
            .await
    }

    /// Guest self-submission: a pending placeholder that occupies capacity
    /// until promoted, expired, or cancelled. Guest fields are locked against
    /// later merges into this record.
    pub async fn create_guest_hold(
        &self,
        id: ReservationId,
        property_id: PropertyId,
        room_id: Option<RoomId>,
        category_id: Option<CategoryId>,
        span: DateSpan,
        guest: GuestContact,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        validate_span(&span)?;
        validate_contact(&guest)?;
        let spec = self.property_spec(&property_id)?;
        if let Some(rid) = room_id
            && spec.room(rid).is_none()
        {
            return Err(EngineError::RoomNotFound(rid));
        }
        if let Some(cid) = category_id
            && spec.category(cid).is_none()
        {
            return Err(EngineError::NotFound(cid));
        }
        let board = self.board_or_err(&property_id)?;
        let mut guard = board.write().await;
        if guard.reservations.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }
        if guard.reservations.len() >= MAX_RESERVATIONS_PER_PROPERTY {
            return Err(EngineError::LimitExceeded("too many reservations on property"));
        }

        // A placeholder passes the guard at creation like any reservation.
        if let Some(rid) = room_id {
            check_no_conflict(&guard, spec, rid, &span, None, None, None, now)?;
        }

        let reservation = Reservation {
            id,
            property_id,
            room_id,
            category_id,
            span,
            arrival_time: None,
            departure_time: None,
            status: ReservationStatus::Confirmed,
            provenance: Provenance::GuestForm,
            channel: None,
            guest,
            guest_locked: true,
            hold: Some(SoftHold {
                status: HoldStatus::Pending,
                expires_at,
            }),
        };
        self.persist_and_apply(&mut guard, &Event::ReservationCreated { reservation })
            .await
    }

    /// Retire a reservation. Cancelling an already-cancelled record is a no-op.
    pub async fn cancel_reservation(
        &self,
        property_id: PropertyId,
        id: ReservationId,
    ) -> Result<(), EngineError> {
        let board = self.board_or_err(&property_id)?;
        let mut guard = board.write().await;
        match guard.reservation(&id) {
            None => return Err(EngineError::NotFound(id)),
            Some(r) if r.status == ReservationStatus::Cancelled => return Ok(()),
            Some(_) => {}
        }
        self.persist_and_apply(&mut guard, &Event::ReservationCancelled { id, property_id })
            .await
    }

    /// Operator room (re)assignment, conflict-guarded.
    pub async fn assign_room(
        &self,
        property_id: PropertyId,
        id: ReservationId,
        room_id: RoomId,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let spec = self.property_spec(&property_id)?;
        if spec.room(room_id).is_none() {
            return Err(EngineError::RoomNotFound(room_id));
        }
        let board = self.board_or_err(&property_id)?;
        let mut guard = board.write().await;
        let r = guard.reservation(&id).ok_or(EngineError::NotFound(id))?;
        if r.status == ReservationStatus::Cancelled {
            return Err(EngineError::NotFound(id));
        }
        check_no_conflict(
            &guard,
            spec,
            room_id,
            &r.span,
            r.arrival_time,
            r.departure_time,
            Some(id),
            now,
        )?;
        self.persist_and_apply(&mut guard, &Event::RoomAssigned { id, property_id, room_id })
            .await
    }

    /// Flip an overdue pending hold to `Expired`. Returns `true` if this call
    /// released the capacity; `false` if the hold was not due or already
    /// terminal (so any sweep frequency is safe).
    pub async fn expire_hold(
        &self,
        property_id: PropertyId,
        id: ReservationId,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let board = self.board_or_err(&property_id)?;
        let mut guard = board.write().await;
        let r = guard.reservation(&id).ok_or(EngineError::NotFound(id))?;
        let Some(hold) = r.hold else {
            return Err(EngineError::NotAPlaceholder(id));
        };
        if hold.status.is_terminal() || hold.expires_at > now {
            return Ok(false);
        }
        self.persist_and_apply(&mut guard, &Event::HoldExpired { id, property_id })
            .await?;
        Ok(true)
    }

    /// Promote a pending placeholder once a channel confirms the stay.
    /// Permanent; terminal holds are rejected.
    pub async fn promote_hold(
        &self,
        property_id: PropertyId,
        id: ReservationId,
        link: Option<ChannelLink>,
    ) -> Result<(), EngineError> {
        let board = self.board_or_err(&property_id)?;
        let mut guard = board.write().await;
        let r = guard.reservation(&id).ok_or(EngineError::NotFound(id))?;
        let Some(hold) = r.hold else {
            return Err(EngineError::NotAPlaceholder(id));
        };
        if hold.status.is_terminal() {
            return Err(EngineError::HoldFinal {
                id,
                status: hold.status,
            });
        }
        let event = Event::HoldPromoted {
            id,
            property_id,
            uid: link.as_ref().map(|l| l.uid.clone()),
            integration_id: link.as_ref().map(|l| l.integration_id),
            channel: link.and_then(|l| l.channel),
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Merge Operator: fold a pending placeholder into the confirmed
    /// reservation representing the same stay. Guest fields are copied only
    /// into empty target fields; the placeholder is retired. Targets with
    /// locked guest data refuse the merge.
    pub async fn merge_placeholder(
        &self,
        property_id: PropertyId,
        placeholder_id: ReservationId,
        target_id: ReservationId,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        if placeholder_id == target_id {
            return Err(EngineError::MergeMismatch("placeholder and target are the same record"));
        }
        let spec = self.property_spec(&property_id)?;
        let board = self.board_or_err(&property_id)?;
        let mut guard = board.write().await;

        let placeholder = guard
            .reservation(&placeholder_id)
            .ok_or(EngineError::NotFound(placeholder_id))?;
        let target = guard
            .reservation(&target_id)
            .ok_or(EngineError::NotFound(target_id))?;

        if !placeholder.is_pending_hold() {
            return Err(EngineError::NotAPlaceholder(placeholder_id));
        }
        if target.is_pending_hold() || !target.blocks_at(now) {
            return Err(EngineError::MergeMismatch("target is not a confirmed stay"));
        }
        if !same_stay(spec, placeholder, target) {
            return Err(EngineError::MergeMismatch("not the same stay"));
        }
        if target.guest_locked {
            return Err(EngineError::GuestLocked(target_id));
        }

        self.persist_and_apply(
            &mut guard,
            &Event::GuestMerged {
                placeholder_id,
                target_id,
                property_id,
            },
        )
        .await
    }

    /// Sweep support: find (placeholder, confirmed) pairs representing the
    /// same stay and merge the unambiguous ones. A target claimed by two or
    /// more placeholders is surfaced to the inbox instead of guessed at; a
    /// placeholder qualifying for two or more targets is left alone.
    pub async fn auto_merge_scan(
        &self,
        property_id: PropertyId,
        now: DateTime<Utc>,
    ) -> Result<MergeScanReport, EngineError> {
        let spec = self.property_spec(&property_id)?;
        let board = self.board_or_err(&property_id)?;
        let mut guard = board.write().await;
        let mut report = MergeScanReport::default();

        // Snapshot the bipartite candidate sets before mutating anything.
        let mut targets: Vec<ReservationId> = guard
            .reservations
            .values()
            .filter(|r| {
                r.blocks_at(now)
                    && !r.is_pending_hold()
                    && (r.channel.is_some() || r.provenance == Provenance::ChannelFeed)
            })
            .map(|r| r.id)
            .collect();
        targets.sort();

        let mut pairs: Vec<(ReservationId, Vec<ReservationId>)> = Vec::new();
        for tid in targets {
            let target = &guard.reservations[&tid];
            let mut placeholders: Vec<ReservationId> = guard
                .pending_holds()
                .filter(|p| same_stay(spec, p, target))
                .map(|p| p.id)
                .collect();
            placeholders.sort();
            if !placeholders.is_empty() {
                pairs.push((tid, placeholders));
            }
        }

        // A placeholder claimed by several targets is ambiguous from the
        // placeholder's side; merging it anywhere risks moving the wrong
        // guest's data.
        let mut claim_counts: std::collections::HashMap<ReservationId, usize> =
            std::collections::HashMap::new();
        for (_, placeholders) in &pairs {
            for p in placeholders {
                *claim_counts.entry(*p).or_default() += 1;
            }
        }

        for (target_id, mut placeholders) in pairs {
            placeholders.retain(|p| {
                if claim_counts[p] > 1 {
                    warn!("placeholder {p} matches several confirmed stays; leaving for manual resolution");
                    false
                } else {
                    true
                }
            });
            match placeholders.len() {
                0 => {}
                1 => {
                    let placeholder_id = placeholders[0];
                    let target = &guard.reservations[&target_id];
                    if target.guest_locked {
                        debug!("merge skip: target {target_id} guest data is locked");
                        report.skipped_locked += 1;
                        continue;
                    }
                    self.persist_and_apply(
                        &mut guard,
                        &Event::GuestMerged {
                            placeholder_id,
                            target_id,
                            property_id,
                        },
                    )
                    .await?;
                    report.merged.push((placeholder_id, target_id));
                }
                _ => {
                    let already_surfaced = guard.inbox.values().any(|e| {
                        !e.resolved
                            && matches!(&e.reason,
                                InboxReason::AmbiguousMerge { target, .. } if *target == target_id)
                    });
                    if !already_surfaced {
                        let target = &guard.reservations[&target_id];
                        let entry = InboxEntry {
                            id: Ulid::new(),
                            property_id,
                            uid: target.channel.as_ref().map(|l| l.uid.clone()),
                            summary: None,
                            span: target.span,
                            room_hint: target.room_id,
                            category_hint: target.category_id,
                            integration_id: target.channel.as_ref().map(|l| l.integration_id),
                            reason: InboxReason::AmbiguousMerge {
                                placeholders: placeholders.clone(),
                                target: target_id,
                            },
                            resolved: false,
                        };
                        self.persist_and_apply(&mut guard, &Event::InboxAdded { entry })
                            .await?;
                    }
                    report.ambiguous += 1;
                }
            }
        }

        Ok(report)
    }

    /// Overdue pending holds across all boards. Boards busy under a writer
    /// are picked up on the next sweep.
    pub fn collect_expired_holds(&self, now: DateTime<Utc>) -> Vec<(PropertyId, ReservationId)> {
        let mut expired = Vec::new();
        for entry in self.boards.iter() {
            let board = entry.value().clone();
            if let Ok(guard) = board.try_read() {
                for r in guard.reservations.values() {
                    if let Some(h) = r.hold
                        && h.status == HoldStatus::Pending
                        && h.expires_at <= now
                    {
                        expired.push((guard.id, r.id));
                    }
                }
            }
        }
        expired
    }

    /// Operator resolution of an inbox entry: assign a room, create the
    /// reservation, bind the UID, mark the entry resolved.
    pub async fn resolve_inbox(
        &self,
        property_id: PropertyId,
        entry_id: Ulid,
        room_id: RoomId,
        now: DateTime<Utc>,
    ) -> Result<ReservationId, EngineError> {
        let spec = self.property_spec(&property_id)?;
        if spec.room(room_id).is_none() {
            return Err(EngineError::RoomNotFound(room_id));
        }
        let board = self.board_or_err(&property_id)?;
        let mut guard = board.write().await;
        let entry = guard
            .inbox
            .get(&entry_id)
            .ok_or(EngineError::NotFound(entry_id))?
            .clone();
        if entry.resolved {
            return Err(EngineError::AlreadyExists(entry_id));
        }

        check_no_conflict(&guard, spec, room_id, &entry.span, None, None, None, now)?;

        let reservation = Reservation {
            id: Ulid::new(),
            property_id,
            room_id: Some(room_id),
            category_id: spec.room(room_id).and_then(|r| r.category_id),
            span: entry.span,
            arrival_time: None,
            departure_time: None,
            status: ReservationStatus::Confirmed,
            provenance: Provenance::ChannelFeed,
            channel: entry.uid.clone().and_then(|uid| {
                entry.integration_id.map(|integration_id| ChannelLink {
                    uid,
                    integration_id,
                    channel: None,
                })
            }),
            guest: GuestContact::default(),
            guest_locked: false,
            hold: None,
        };
        let new_id = reservation.id;

        self.persist_and_apply(&mut guard, &Event::ReservationCreated { reservation })
            .await?;
        if let (Some(uid), Some(integration_id)) = (entry.uid.clone(), entry.integration_id) {
            self.persist_and_apply(
                &mut guard,
                &Event::UidBound {
                    property_id,
                    uid,
                    reservation_id: new_id,
                    span: entry.span,
                    room_id: Some(room_id),
                    integration_id,
                    synced_at: now,
                },
            )
            .await?;
        }
        self.persist_and_apply(
            &mut guard,
            &Event::InboxResolved {
                id: entry_id,
                property_id,
                reservation_id: Some(new_id),
            },
        )
        .await?;
        Ok(new_id)
    }

    /// Rewrite the journal with the minimal event set recreating current
    /// state. Reservation records embed their full state, so one
    /// `ReservationCreated` per record suffices.
    pub async fn compact_journal(&self) -> Result<(), EngineError> {
        let mut events = Vec::new();
        let board_ids: Vec<PropertyId> = self.boards.iter().map(|e| *e.key()).collect();
        for id in board_ids {
            let Some(board) = self.board(&id) else { continue };
            let guard = board.read().await;
            let mut reservations: Vec<&Reservation> = guard.reservations.values().collect();
            reservations.sort_by_key(|r| r.id);
            for r in reservations {
                events.push(Event::ReservationCreated {
                    reservation: r.clone(),
                });
            }
            let mut uids: Vec<&UidEntry> = guard.uid_map.values().collect();
            uids.sort_by_key(|u| u.uid.clone());
            for u in uids {
                events.push(Event::UidBound {
                    property_id: guard.id,
                    uid: u.uid.clone(),
                    reservation_id: u.reservation_id,
                    span: u.last_span,
                    room_id: u.last_room,
                    integration_id: u.integration_id,
                    synced_at: u.synced_at,
                });
            }
            let mut entries: Vec<&InboxEntry> = guard.inbox.values().collect();
            entries.sort_by_key(|e| e.id);
            for e in entries {
                events.push(Event::InboxAdded { entry: e.clone() });
            }
        }
        self.journal_compact(events).await
    }
}
