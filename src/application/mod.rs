//! Application layer orchestrating the checkout.
//!
//! The `PaymentFlowController` is the entry point; it composes the OTP
//! challenge, the status poller, and the entitlement reconciler over the
//! domain ports.

pub mod flow;
pub mod otp;
pub mod poller;
pub mod reconciler;
