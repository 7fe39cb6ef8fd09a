//! Payment confirmation and entitlement reconciliation for gated resources.
//!
//! Drives the wallet and mobile-money (OTP) authorization flows, polls the
//! payment processor for settlement, and resolves ambiguous registration
//! outcomes against the backend's authoritative listing.

pub mod application;
pub mod domain;
pub mod error;
pub mod infrastructure;

pub use application::flow::{FlowSnapshot, FlowStep, PaymentFlowController, SettledOutcome};
pub use application::otp::OtpChallenge;
pub use application::poller::{DeliveryAck, PaymentStatusPoller, PollOutcome, PollerConfig};
pub use application::reconciler::EntitlementReconciler;
pub use domain::payment::{Amount, Balance, PaymentMethod, PaymentStatus};
pub use error::{ApiError, FlowError, OtpError, Result};
pub use infrastructure::in_memory::LocalEntitlementStore;
