use ulid::Ulid;

use crate::model::{DateSpan, HoldStatus, PropertyId, ReservationId, RoomId};

#[derive(Debug)]
pub enum EngineError {
    PropertyNotFound(PropertyId),
    NotFound(Ulid),
    AlreadyExists(Ulid),
    RoomNotFound(RoomId),
    /// Conflict Guard trip: the write would overlap a live reservation.
    Conflict {
        room_id: RoomId,
        span: DateSpan,
        with: ReservationId,
    },
    /// Attempted transition out of a terminal hold state.
    HoldFinal {
        id: ReservationId,
        status: HoldStatus,
    },
    NotAPlaceholder(ReservationId),
    /// Merge target already carries form-submitted guest data.
    GuestLocked(ReservationId),
    MergeMismatch(&'static str),
    /// Missing property timezone or check-in/check-out default. The dependent
    /// operation fails closed rather than assuming a default.
    ConfigGap {
        property_id: PropertyId,
        what: &'static str,
    },
    InvalidSpan(&'static str),
    LimitExceeded(&'static str),
    JournalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::PropertyNotFound(id) => write!(f, "property not found: {id}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::RoomNotFound(id) => write!(f, "room not in registry: {id}"),
            EngineError::Conflict { room_id, span, with } => write!(
                f,
                "room {room_id} already booked over [{}, {}) by {with}",
                span.start, span.end
            ),
            EngineError::HoldFinal { id, status } => {
                write!(f, "hold {id} is final ({status:?})")
            }
            EngineError::NotAPlaceholder(id) => {
                write!(f, "reservation {id} carries no soft hold")
            }
            EngineError::GuestLocked(id) => {
                write!(f, "reservation {id} has locked guest data; refusing merge")
            }
            EngineError::MergeMismatch(msg) => write!(f, "merge refused: {msg}"),
            EngineError::ConfigGap { property_id, what } => {
                write!(f, "property {property_id} configuration missing {what}")
            }
            EngineError::InvalidSpan(msg) => write!(f, "invalid date span: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::JournalError(e) => write!(f, "journal error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
