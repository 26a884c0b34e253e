use std::collections::HashMap;

use chrono::{DateTime, Utc};
use ulid::Ulid;

use crate::model::*;

/// All reconciliation state for one property. The board lives behind one
/// `RwLock`; holding its write guard is the serialization point for the
/// lookup-match-check-commit sequence.
#[derive(Debug)]
pub struct PropertyBoard {
    pub id: PropertyId,
    pub reservations: HashMap<ReservationId, Reservation>,
    /// Identity Map, keyed by the channel UID (already scoped per property).
    pub uid_map: HashMap<String, UidEntry>,
    pub inbox: HashMap<Ulid, InboxEntry>,
}

impl PropertyBoard {
    pub fn new(id: PropertyId) -> Self {
        Self {
            id,
            reservations: HashMap::new(),
            uid_map: HashMap::new(),
            inbox: HashMap::new(),
        }
    }

    pub fn reservation(&self, id: &ReservationId) -> Option<&Reservation> {
        self.reservations.get(id)
    }

    /// Reservations occupying the given room at instant `now`.
    pub fn blocking_on_room(
        &self,
        room_id: RoomId,
        now: DateTime<Utc>,
    ) -> impl Iterator<Item = &Reservation> {
        self.reservations
            .values()
            .filter(move |r| r.room_id == Some(room_id) && r.blocks_at(now))
    }

    /// Exact-date match candidates: live reservations with the same `[start, end)`.
    ///
    /// Exact matching (not overlap matching) keeps two back-to-back stays that
    /// share a turnover day apart.
    pub fn exact_span_candidates(&self, span: &DateSpan, now: DateTime<Utc>) -> Vec<&Reservation> {
        let mut candidates: Vec<&Reservation> = self
            .reservations
            .values()
            .filter(|r| r.span == *span && r.blocks_at(now))
            .collect();
        candidates.sort_by_key(|r| r.id);
        candidates
    }

    pub fn pending_holds(&self) -> impl Iterator<Item = &Reservation> {
        self.reservations.values().filter(|r| r.is_pending_hold())
    }

    pub fn unresolved_inbox(&self) -> Vec<&InboxEntry> {
        let mut entries: Vec<&InboxEntry> =
            self.inbox.values().filter(|e| !e.resolved).collect();
        entries.sort_by_key(|e| e.id);
        entries
    }

    /// Deterministic state transition for a journalled event. Called both on
    /// the live path (after the journal append) and during replay.
    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::ReservationCreated { reservation } => {
                self.reservations
                    .insert(reservation.id, reservation.clone());
            }
            Event::ChannelRefreshed {
                id,
                span,
                room_id,
                uid,
                integration_id,
                channel,
                ..
            } => {
                if let Some(r) = self.reservations.get_mut(id) {
                    r.span = *span;
                    r.room_id = *room_id;
                    r.channel = Some(ChannelLink {
                        uid: uid.clone(),
                        integration_id: *integration_id,
                        channel: channel.clone(),
                    });
                }
            }
            Event::RoomAssigned { id, room_id, .. } => {
                if let Some(r) = self.reservations.get_mut(id) {
                    r.room_id = Some(*room_id);
                }
            }
            Event::ReservationCancelled { id, .. } => {
                if let Some(r) = self.reservations.get_mut(id) {
                    r.status = ReservationStatus::Cancelled;
                    if let Some(h) = r.hold.as_mut()
                        && h.status != HoldStatus::Expired
                    {
                        h.status = HoldStatus::Cancelled;
                    }
                }
            }
            Event::HoldPromoted {
                id,
                uid,
                integration_id,
                channel,
                ..
            } => {
                if let Some(r) = self.reservations.get_mut(id) {
                    if let Some(h) = r.hold.as_mut()
                        && h.status == HoldStatus::Pending
                    {
                        h.status = HoldStatus::Promoted;
                    }
                    if let (Some(uid), Some(integration_id)) = (uid, integration_id) {
                        r.channel = Some(ChannelLink {
                            uid: uid.clone(),
                            integration_id: *integration_id,
                            channel: channel.clone(),
                        });
                    }
                }
            }
            Event::HoldExpired { id, .. } => {
                if let Some(r) = self.reservations.get_mut(id)
                    && let Some(h) = r.hold.as_mut()
                    && h.status == HoldStatus::Pending
                {
                    h.status = HoldStatus::Expired;
                }
            }
            Event::GuestMerged {
                placeholder_id,
                target_id,
                ..
            } => self.apply_merge(placeholder_id, target_id),
            Event::UidBound {
                uid,
                reservation_id,
                span,
                room_id,
                integration_id,
                synced_at,
                ..
            } => {
                self.uid_map.insert(
                    uid.clone(),
                    UidEntry {
                        uid: uid.clone(),
                        reservation_id: *reservation_id,
                        last_span: *span,
                        last_room: *room_id,
                        integration_id: *integration_id,
                        synced_at: *synced_at,
                    },
                );
            }
            Event::InboxAdded { entry } => {
                self.inbox.insert(entry.id, entry.clone());
            }
            Event::InboxResolved { id, .. } => {
                if let Some(e) = self.inbox.get_mut(id) {
                    e.resolved = true;
                }
            }
        }
    }

    /// Copy guest fields placeholder → target where the target's are empty,
    /// then retire the placeholder.
    fn apply_merge(&mut self, placeholder_id: &ReservationId, target_id: &ReservationId) {
        let Some(placeholder) = self.reservations.get(placeholder_id).cloned() else {
            return;
        };
        if let Some(target) = self.reservations.get_mut(target_id) {
            if target.guest.name.is_none() {
                target.guest.name = placeholder.guest.name.clone();
            }
            if target.guest.email.is_none() {
                target.guest.email = placeholder.guest.email.clone();
            }
            if target.guest.phone.is_none() {
                target.guest.phone = placeholder.guest.phone.clone();
            }
        }
        if let Some(p) = self.reservations.get_mut(placeholder_id) {
            p.status = ReservationStatus::Cancelled;
            if let Some(h) = p.hold.as_mut() {
                h.status = HoldStatus::Cancelled;
            }
        }
    }
}
