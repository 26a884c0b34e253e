use chrono::{DateTime, NaiveDate, Utc};

use crate::model::*;

use super::{Engine, EngineError};

/// Day-level sweep line: date ranges where at least `capacity` of the given
/// spans overlap. With `capacity` equal to the number of rooms in a category
/// this yields the fully-booked ranges for the outbound category feed.
pub fn saturated_date_spans(spans: &[DateSpan], capacity: usize) -> Vec<DateSpan> {
    if spans.is_empty() || capacity == 0 {
        return Vec::new();
    }

    let mut events: Vec<(NaiveDate, i32)> = Vec::with_capacity(spans.len() * 2);
    for s in spans {
        events.push((s.start, 1));
        events.push((s.end, -1));
    }
    events.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    let mut result = Vec::new();
    let mut count: i32 = 0;
    let threshold = capacity as i32;
    let mut saturated_start: Option<NaiveDate> = None;

    for (date, delta) in &events {
        let prev = count;
        count += delta;
        if prev < threshold && count >= threshold {
            saturated_start = Some(*date);
        } else if prev >= threshold
            && count < threshold
            && let Some(start) = saturated_start.take()
            && *date > start
        {
            result.push(DateSpan::new(start, *date));
        }
    }

    result
}

impl Engine {
    pub async fn reservation(
        &self,
        property_id: PropertyId,
        id: ReservationId,
    ) -> Result<Option<Reservation>, EngineError> {
        let board = self.board_or_err(&property_id)?;
        let guard = board.read().await;
        Ok(guard.reservation(&id).cloned())
    }

    pub async fn list_reservations(
        &self,
        property_id: PropertyId,
    ) -> Result<Vec<Reservation>, EngineError> {
        let board = self.board_or_err(&property_id)?;
        let guard = board.read().await;
        let mut out: Vec<Reservation> = guard.reservations.values().cloned().collect();
        out.sort_by_key(|r| r.id);
        Ok(out)
    }

    pub async fn uid_entry(
        &self,
        property_id: PropertyId,
        uid: &str,
    ) -> Result<Option<UidEntry>, EngineError> {
        let board = self.board_or_err(&property_id)?;
        let guard = board.read().await;
        Ok(guard.uid_map.get(uid).cloned())
    }

    pub async fn uid_entry_count(&self, property_id: PropertyId) -> Result<usize, EngineError> {
        let board = self.board_or_err(&property_id)?;
        let guard = board.read().await;
        Ok(guard.uid_map.len())
    }

    pub async fn unresolved_inbox_entries(
        &self,
        property_id: PropertyId,
    ) -> Result<Vec<InboxEntry>, EngineError> {
        let board = self.board_or_err(&property_id)?;
        let guard = board.read().await;
        Ok(guard.unresolved_inbox().into_iter().cloned().collect())
    }

    /// Reservations occupying a room at `now`, ordered by arrival date.
    /// The outbound per-room feed lists exactly these.
    pub async fn room_occupancy(
        &self,
        property_id: PropertyId,
        room_id: RoomId,
        now: DateTime<Utc>,
    ) -> Result<Vec<Reservation>, EngineError> {
        let board = self.board_or_err(&property_id)?;
        let guard = board.read().await;
        let mut out: Vec<Reservation> = guard
            .blocking_on_room(room_id, now)
            .cloned()
            .collect();
        out.sort_by_key(|r| (r.span.start, r.id));
        Ok(out)
    }

    /// Fully-booked date ranges for a category: every room of the category
    /// occupied. Room-less category stays (e.g. pending category holds) count
    /// against the category's capacity too.
    pub async fn category_saturated_spans(
        &self,
        property_id: PropertyId,
        category_id: CategoryId,
        now: DateTime<Utc>,
    ) -> Result<Vec<DateSpan>, EngineError> {
        let spec = self.property_spec(&property_id)?;
        let rooms = spec.rooms_in_category(category_id);
        if rooms.is_empty() {
            return Ok(Vec::new());
        }
        let room_ids: Vec<RoomId> = rooms.iter().map(|r| r.id).collect();
        let capacity = room_ids.len();

        let board = self.board_or_err(&property_id)?;
        let guard = board.read().await;
        let spans: Vec<DateSpan> = guard
            .reservations
            .values()
            .filter(|r| r.blocks_at(now))
            .filter(|r| match r.room_id {
                Some(rid) => room_ids.contains(&rid),
                None => r.category_id == Some(category_id),
            })
            .map(|r| r.span)
            .collect();

        Ok(saturated_date_spans(&spans, capacity))
    }
}
