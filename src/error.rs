use crate::domain::payment::{Amount, Balance};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, FlowError>;

/// Errors surfaced by the backend and payment processor ports.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApiError {
    /// The write may or may not have been applied (duplicate/conflict).
    #[error("conflicting write, outcome unknown")]
    Conflict { code: Option<String> },
    /// The backend clearly rejected the request.
    #[error("rejected: {0}")]
    Rejected(String),
    /// Transport-level failure, safe to retry.
    #[error("network: {0}")]
    Network(String),
}

impl ApiError {
    /// Whether this error leaves the write outcome ambiguous.
    ///
    /// The structured `Conflict` variant is authoritative. Duplicate wording
    /// in rejection text is matched as a fallback for backends that do not
    /// send a conflict code yet.
    pub fn is_ambiguous(&self) -> bool {
        match self {
            ApiError::Conflict { .. } => true,
            ApiError::Rejected(msg) => {
                let msg = msg.to_ascii_lowercase();
                msg.contains("already") || msg.contains("duplicate") || msg.contains("exists")
            }
            ApiError::Network(_) => false,
        }
    }
}

/// Recoverable challenge errors shown inline next to the OTP input.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OtpError {
    #[error("phone number failed format validation")]
    InvalidPhone,
    #[error("operator prefix {0} is not supported")]
    UnsupportedOperator(String),
    #[error("incorrect code, {remaining} attempt(s) remaining")]
    IncorrectCode { remaining: u8 },
    #[error("code expired, request a new one")]
    Expired,
    #[error("too many incorrect attempts, request a new code")]
    TooManyAttempts,
    #[error("no challenge in progress")]
    NotIssued,
}

#[derive(Error, Debug, PartialEq)]
pub enum FlowError {
    #[error("insufficient balance: available {available}, required {required}")]
    InsufficientBalance { available: Balance, required: Amount },
    #[error("a payment for this resource is already in progress")]
    AlreadyInProgress,
    #[error("cancellation refused: payment already submitted")]
    CancellationRefused,
    #[error("operation not valid: {0}")]
    InvalidState(&'static str),
    #[error(transparent)]
    Otp(#[from] OtpError),
    #[error("payment failed: {0}")]
    Payment(String),
    #[error("network failure: {0}")]
    Network(String),
}
