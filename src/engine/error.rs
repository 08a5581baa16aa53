use chrono::NaiveDateTime;
use thiserror::Error;
use ulid::Ulid;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("professional {0} is not accepting bookings")]
    ProfessionalNotBookable(Ulid),
    #[error("slot unavailable: {at} for professional {professional_id}")]
    SlotUnavailable {
        professional_id: Ulid,
        at: NaiveDateTime,
    },
    #[error("invalid status: {0}")]
    InvalidStatus(String),
    #[error("appointment {0} is cancelled; no further transitions allowed")]
    TerminalStateViolation(Ulid),
    #[error("unauthorized: {0}")]
    Unauthorized(&'static str),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    /// Stable machine-readable code, used on the wire and as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::ProfessionalNotBookable(_) => "professional_not_bookable",
            EngineError::SlotUnavailable { .. } => "slot_unavailable",
            EngineError::InvalidStatus(_) => "invalid_status",
            EngineError::TerminalStateViolation(_) => "terminal_state_violation",
            EngineError::Unauthorized(_) => "unauthorized",
            EngineError::InvalidInput(_) => "invalid_input",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "wal_error",
        }
    }
}
