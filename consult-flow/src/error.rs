use std::time::Duration;

use thiserror::Error;

use crate::transcript::SessionStatus;

/// Failure of a call to one of the external services (AI inference or persistence).
///
/// Always recoverable: the session never terminates because of one.
#[derive(Error, Debug, Clone)]
pub enum ServiceError {
    #[error("Request failed: {0}")]
    Transport(String),

    #[error("Service responded with status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("No response within {0:?}")]
    Timeout(Duration),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Local input problem. Never involves the network.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Treatment plan summary is required")]
    MissingTreatmentPlan,

    #[error("Medication name is required")]
    MissingMedicationName,

    #[error("Medication dosage is required")]
    MissingMedicationDosage,

    #[error("Lifestyle recommendation cannot be empty")]
    BlankLifestyleChange,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Message cannot be empty")]
    EmptyMessage,

    #[error("Waiting for a pending response")]
    Busy,

    #[error("Operation not allowed while session is {0}")]
    InvalidState(SessionStatus),

    #[error("Session is closed")]
    Closed,

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl SessionError {
    /// True when repeating the same operation later may succeed without any input change.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SessionError::Busy | SessionError::Service(_))
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
