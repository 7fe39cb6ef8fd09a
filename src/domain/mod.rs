//! Core domain types: money values, payment sessions, OTP challenge state,
//! entitlement records, and the ports the application layer depends on.

pub mod entitlement;
pub mod otp;
pub mod payment;
pub mod ports;
