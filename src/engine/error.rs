use ulid::Ulid;

use crate::model::Ms;

#[derive(Debug)]
pub enum EngineError {
    InvalidTimeRange { start: Ms, end: Ms },
    InvalidCapacity(u32),
    CapacityBelowParticipants { requested: u32, current: u32 },
    InvalidPage(&'static str),
    /// The candidate range overlaps this slot of the same owner.
    SlotConflict(Ulid),
    SlotUnavailable(Ulid),
    DuplicateBooking { slot_id: Ulid, user_id: Ulid },
    AlreadyCancelled(Ulid),
    AlreadyExists(Ulid),
    SlotNotFound(Ulid),
    BookingNotFound(Ulid),
    Forbidden(&'static str),
    InactiveAccount(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// SQLSTATE reported to wire clients. Every kind has its own code.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidTimeRange { .. } => "SL001",
            EngineError::InvalidCapacity(_) => "SL002",
            EngineError::CapacityBelowParticipants { .. } => "SL003",
            EngineError::InvalidPage(_) => "SL004",
            EngineError::SlotConflict(_) => "SL010",
            EngineError::SlotUnavailable(_) => "SL011",
            EngineError::DuplicateBooking { .. } => "SL012",
            EngineError::AlreadyCancelled(_) => "SL013",
            EngineError::AlreadyExists(_) => "SL014",
            EngineError::SlotNotFound(_) => "SL020",
            EngineError::BookingNotFound(_) => "SL021",
            EngineError::Forbidden(_) => "42501",
            EngineError::InactiveAccount(_) => "28000",
            EngineError::LimitExceeded(_) => "54000",
            EngineError::WalError(_) => "58030",
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidTimeRange { .. } => "invalid_time_range",
            EngineError::InvalidCapacity(_) => "invalid_capacity",
            EngineError::CapacityBelowParticipants { .. } => "capacity_below_participants",
            EngineError::InvalidPage(_) => "invalid_page",
            EngineError::SlotConflict(_) => "slot_conflict",
            EngineError::SlotUnavailable(_) => "slot_unavailable",
            EngineError::DuplicateBooking { .. } => "duplicate_booking",
            EngineError::AlreadyCancelled(_) => "already_cancelled",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::SlotNotFound(_) => "slot_not_found",
            EngineError::BookingNotFound(_) => "booking_not_found",
            EngineError::Forbidden(_) => "forbidden",
            EngineError::InactiveAccount(_) => "inactive_account",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidTimeRange { start, end } => {
                write!(f, "invalid time range: end {end} must be after start {start}")
            }
            EngineError::InvalidCapacity(max) => {
                write!(f, "invalid capacity {max}: max_participants must be between 1 and {}",
                    crate::limits::MAX_PARTICIPANTS)
            }
            EngineError::CapacityBelowParticipants { requested, current } => write!(
                f,
                "max_participants {requested} is below the {current} current participants"
            ),
            EngineError::InvalidPage(msg) => write!(f, "invalid page: {msg}"),
            EngineError::SlotConflict(id) => {
                write!(f, "time slot conflicts with existing slot {id}")
            }
            EngineError::SlotUnavailable(id) => write!(f, "slot {id} is not available"),
            EngineError::DuplicateBooking { slot_id, user_id } => {
                write!(f, "user {user_id} already has a booking for slot {slot_id}")
            }
            EngineError::AlreadyCancelled(id) => write!(f, "booking {id} is already cancelled"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::SlotNotFound(id) => write!(f, "slot not found: {id}"),
            EngineError::BookingNotFound(id) => write!(f, "booking not found: {id}"),
            EngineError::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            EngineError::InactiveAccount(id) => write!(f, "account {id} is inactive"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
