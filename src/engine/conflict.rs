use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, Utc};

use crate::config::PropertySpec;
use crate::limits::*;
use crate::model::*;

use super::store::PropertyBoard;
use super::EngineError;

/// Half-open overlap over absolute instants. A checkout at 11:00 and a
/// check-in at 11:00 the same day do not collide.
pub fn overlaps(
    a_start: DateTime<Utc>,
    a_end: DateTime<Utc>,
    b_start: DateTime<Utc>,
    b_end: DateTime<Utc>,
) -> bool {
    a_start < b_end && b_start < a_end
}

pub(crate) fn validate_span(span: &DateSpan) -> Result<(), EngineError> {
    if span.start >= span.end {
        return Err(EngineError::InvalidSpan("start must be before end"));
    }
    if span.start.year() < MIN_VALID_YEAR || span.end.year() > MAX_VALID_YEAR {
        return Err(EngineError::InvalidSpan("date out of range"));
    }
    if span.nights() > MAX_STAY_NIGHTS {
        return Err(EngineError::InvalidSpan("stay too long"));
    }
    Ok(())
}

fn property_offset(spec: &PropertySpec) -> Result<FixedOffset, EngineError> {
    let minutes = spec.utc_offset_minutes.ok_or(EngineError::ConfigGap {
        property_id: spec.id,
        what: "timezone offset",
    })?;
    FixedOffset::east_opt(minutes * 60).ok_or(EngineError::ConfigGap {
        property_id: spec.id,
        what: "timezone offset",
    })
}

/// Resolve a reservation's `[start, end)` window to absolute instants:
/// date + explicit time-of-day (falling back to the property check-in /
/// check-out), interpreted at the property's UTC offset. Missing
/// configuration fails closed.
pub(crate) fn resolve_window(
    spec: &PropertySpec,
    span: &DateSpan,
    arrival_time: Option<NaiveTime>,
    departure_time: Option<NaiveTime>,
) -> Result<(DateTime<Utc>, DateTime<Utc>), EngineError> {
    let offset = property_offset(spec)?;

    let arrival = match arrival_time.or(spec.check_in) {
        Some(t) => t,
        None => {
            return Err(EngineError::ConfigGap {
                property_id: spec.id,
                what: "check-in time",
            });
        }
    };
    let departure = match departure_time.or(spec.check_out) {
        Some(t) => t,
        None => {
            return Err(EngineError::ConfigGap {
                property_id: spec.id,
                what: "check-out time",
            });
        }
    };

    let start = span
        .start
        .and_time(arrival)
        .and_local_timezone(offset)
        .single()
        .ok_or(EngineError::InvalidSpan("unrepresentable start instant"))?
        .with_timezone(&Utc);
    let end = span
        .end
        .and_time(departure)
        .and_local_timezone(offset)
        .single()
        .ok_or(EngineError::InvalidSpan("unrepresentable end instant"))?
        .with_timezone(&Utc);

    if start >= end {
        return Err(EngineError::InvalidSpan("window collapses to nothing"));
    }
    Ok((start, end))
}

/// The Conflict Guard. Rejects the candidate window if any other reservation
/// occupying the same room at `now` overlaps it in absolute time. Runs inside
/// the board write lock, immediately before the journal append.
pub(crate) fn check_no_conflict(
    board: &PropertyBoard,
    spec: &PropertySpec,
    room_id: RoomId,
    span: &DateSpan,
    arrival_time: Option<NaiveTime>,
    departure_time: Option<NaiveTime>,
    exclude: Option<ReservationId>,
    now: DateTime<Utc>,
) -> Result<(), EngineError> {
    let (start, end) = resolve_window(spec, span, arrival_time, departure_time)?;

    for other in board.blocking_on_room(room_id, now) {
        if exclude == Some(other.id) {
            continue;
        }
        // Cheap date-level reject. Spans that share a turnover day still get
        // the full time check: explicit times can cross within that day.
        if span.end < other.span.start || other.span.end < span.start {
            continue;
        }
        let (o_start, o_end) =
            resolve_window(spec, &other.span, other.arrival_time, other.departure_time)?;
        if overlaps(start, end, o_start, o_end) {
            return Err(EngineError::Conflict {
                room_id,
                span: *span,
                with: other.id,
            });
        }
    }
    Ok(())
}
