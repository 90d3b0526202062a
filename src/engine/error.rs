use ulid::Ulid;

use crate::model::{BookingStatus, RoomId, RoomSize, ScheduleStatus, VirtualRoomId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Malformed request: bad window, unknown size, oversized field.
    Validation(String),
    NotFound(Ulid),
    RoomNotFound(RoomId),
    VirtualRoomNotFound(VirtualRoomId),
    AlreadyExists(Ulid),
    /// No room in the requested size class or any larger one is free.
    NoRoomAvailable { size: RoomSize },
    /// A commit lost the race to a concurrent writer on this room.
    ConflictRace(RoomId),
    /// Direct conflict with a specific schedule (walk-ins, end changes).
    Conflict(Ulid),
    InvalidTransition {
        id: Ulid,
        from: ScheduleStatus,
        to: ScheduleStatus,
    },
    InvalidBookingState {
        id: Ulid,
        status: BookingStatus,
        action: &'static str,
    },
    /// The booking was cancelled while its schedules were being committed.
    BookingCancelled(Ulid),
    /// Could not acquire a serialization point in time.
    Busy(String),
    /// Directory change would break the priority-band invariant.
    Config(String),
    LimitExceeded(&'static str),
    /// The principal's role does not allow the operation.
    Forbidden(&'static str),
    StoreUnavailable(String),
}

impl EngineError {
    /// Whether retrying the same request later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::ConflictRace(_) | EngineError::Busy(_) | EngineError::NoRoomAvailable { .. }
        )
    }

    /// Stable machine-readable code for the API boundary.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::NotFound(_)
            | EngineError::RoomNotFound(_)
            | EngineError::VirtualRoomNotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::NoRoomAvailable { .. } => "no_room_available",
            EngineError::ConflictRace(_) => "conflict_race",
            EngineError::Conflict(_) => "conflict",
            EngineError::InvalidTransition { .. } | EngineError::InvalidBookingState { .. } => {
                "invalid_transition"
            }
            EngineError::BookingCancelled(_) => "booking_cancelled",
            EngineError::Busy(_) => "busy",
            EngineError::Config(_) => "config",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::StoreUnavailable(_) => "store_unavailable",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::RoomNotFound(id) => write!(f, "physical room not found: {id}"),
            EngineError::VirtualRoomNotFound(id) => write!(f, "virtual room not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::NoRoomAvailable { size } => {
                write!(f, "no {size} room (or larger) available for the requested window")
            }
            EngineError::ConflictRace(room) => {
                write!(f, "room {room} was taken by a concurrent booking")
            }
            EngineError::Conflict(id) => write!(f, "conflict with schedule: {id}"),
            EngineError::InvalidTransition { id, from, to } => {
                write!(f, "schedule {id} cannot go from {from} to {to}")
            }
            EngineError::InvalidBookingState { id, status, action } => {
                write!(f, "booking {id} is {status}; cannot {action}")
            }
            EngineError::BookingCancelled(id) => {
                write!(f, "booking {id} was cancelled during conversion")
            }
            EngineError::Busy(what) => write!(f, "busy: timed out waiting for {what}"),
            EngineError::Config(msg) => write!(f, "configuration error: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Forbidden(what) => write!(f, "not permitted: {what}"),
            EngineError::StoreUnavailable(e) => write!(f, "store unavailable: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
