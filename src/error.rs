use ulid::Ulid;

use crate::model::{BookingStatus, Ms, Span};
use crate::payment::GatewayError;
use crate::store::StoreError;

#[derive(Debug)]
pub enum ReservationError {
    InvalidInput(String),
    Unauthorized,
    Forbidden,
    NotFound(Ulid),
    /// Payment proof failed verification. Never retried.
    SignatureMismatch,
    /// Lost the race for an overlapping range. Carries the ranges already taken.
    SlotConflict(Vec<Span>),
    PolicyViolation { starts_at: Ms, cutoff_ms: Ms },
    InvalidState(BookingStatus),
    GatewayError(String),
    InternalError(String),
}

impl ReservationError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        ReservationError::InvalidInput(msg.into())
    }

    /// Short machine-readable kind, used for metrics labels and API bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            ReservationError::InvalidInput(_) => "invalid_input",
            ReservationError::Unauthorized => "unauthorized",
            ReservationError::Forbidden => "forbidden",
            ReservationError::NotFound(_) => "not_found",
            ReservationError::SignatureMismatch => "signature_mismatch",
            ReservationError::SlotConflict(_) => "slot_conflict",
            ReservationError::PolicyViolation { .. } => "policy_violation",
            ReservationError::InvalidState(_) => "invalid_state",
            ReservationError::GatewayError(_) => "gateway_error",
            ReservationError::InternalError(_) => "internal_error",
        }
    }
}

impl std::fmt::Display for ReservationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReservationError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            ReservationError::Unauthorized => write!(f, "unauthorized"),
            ReservationError::Forbidden => write!(f, "forbidden"),
            ReservationError::NotFound(id) => write!(f, "booking not found: {id}"),
            ReservationError::SignatureMismatch => write!(f, "invalid payment signature"),
            ReservationError::SlotConflict(taken) => {
                write!(f, "slot already booked")?;
                if !taken.is_empty() {
                    let ranges: Vec<String> = taken
                        .iter()
                        .map(|s| format!("[{}, {})", s.start, s.end))
                        .collect();
                    write!(f, ": {}", ranges.join(", "))?;
                }
                Ok(())
            }
            ReservationError::PolicyViolation { cutoff_ms, .. } => write!(
                f,
                "cannot cancel booking less than {} minutes before start time",
                cutoff_ms / 60_000
            ),
            ReservationError::InvalidState(status) => {
                write!(f, "booking cannot be cancelled in status {}", status.as_str())
            }
            ReservationError::GatewayError(msg) => write!(f, "payment gateway error: {msg}"),
            ReservationError::InternalError(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl std::error::Error for ReservationError {}

impl From<StoreError> for ReservationError {
    fn from(e: StoreError) -> Self {
        ReservationError::InternalError(e.to_string())
    }
}

impl From<GatewayError> for ReservationError {
    fn from(e: GatewayError) -> Self {
        ReservationError::GatewayError(e.to_string())
    }
}
