use ulid::Ulid;

use crate::model::ReservationStatus;

/// Outcome category reported to the caller; the wire layer maps these to
/// SQLSTATE codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    NotFound,
    Invalid,
    Forbidden,
    Conflict,
    Internal,
}

#[derive(Debug)]
pub enum EngineError {
    NotFound(Ulid),
    AlreadyExists(Ulid),
    EmailTaken(String),
    SpaceInactive(Ulid),
    InvalidInterval,
    StartNotInFuture,
    InvalidAttendees(u32),
    CapacityExceeded { capacity: u32 },
    /// Overlaps the given existing reservation.
    Conflict(Ulid),
    Forbidden(&'static str),
    UnknownStatus(String),
    InvalidTransition {
        from: ReservationStatus,
        to: ReservationStatus,
    },
    CannotCancelPast(Ulid),
    NotesLocked(ReservationStatus),
    WrongPassword,
    InvalidInput(String),
    LimitExceeded(&'static str),
    HashError(String),
    WalError(String),
}

impl EngineError {
    pub fn outcome(&self) -> Outcome {
        match self {
            EngineError::NotFound(_) => Outcome::NotFound,
            EngineError::AlreadyExists(_)
            | EngineError::EmailTaken(_)
            | EngineError::Conflict(_) => Outcome::Conflict,
            EngineError::Forbidden(_) => Outcome::Forbidden,
            EngineError::SpaceInactive(_)
            | EngineError::InvalidInterval
            | EngineError::StartNotInFuture
            | EngineError::InvalidAttendees(_)
            | EngineError::CapacityExceeded { .. }
            | EngineError::UnknownStatus(_)
            | EngineError::InvalidTransition { .. }
            | EngineError::CannotCancelPast(_)
            | EngineError::NotesLocked(_)
            | EngineError::WrongPassword
            | EngineError::InvalidInput(_)
            | EngineError::LimitExceeded(_) => Outcome::Invalid,
            EngineError::HashError(_) | EngineError::WalError(_) => Outcome::Internal,
        }
    }

    /// Structured extra for the caller, when there is one.
    pub fn detail(&self) -> Option<String> {
        match self {
            EngineError::CapacityExceeded { capacity } => Some(format!("capacity={capacity}")),
            EngineError::Conflict(id) => Some(format!("conflicting_reservation={id}")),
            _ => None,
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::EmailTaken(email) => write!(f, "a user with email {email} already exists"),
            EngineError::SpaceInactive(id) => write!(f, "space {id} is not available for booking"),
            EngineError::InvalidInterval => write!(f, "start time must be before end time"),
            EngineError::StartNotInFuture => write!(f, "reservation must start in the future"),
            EngineError::InvalidAttendees(n) => write!(f, "attendees must be at least 1, got {n}"),
            EngineError::CapacityExceeded { capacity } => {
                write!(f, "attendees exceed space capacity (capacity: {capacity})")
            }
            EngineError::Conflict(id) => {
                write!(f, "space is not available in the requested interval (conflicts with reservation {id})")
            }
            EngineError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            EngineError::UnknownStatus(s) => write!(f, "unknown reservation status: {s}"),
            EngineError::InvalidTransition { from, to } => {
                write!(f, "invalid status transition: {from} -> {to}")
            }
            EngineError::CannotCancelPast(id) => {
                write!(f, "cannot cancel reservation {id}: it has already started")
            }
            EngineError::NotesLocked(status) => {
                write!(f, "notes can only be changed while pending (status: {status})")
            }
            EngineError::WrongPassword => write!(f, "current password is incorrect"),
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::HashError(e) => write!(f, "password hashing failed: {e}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
