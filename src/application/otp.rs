use crate::domain::otp::{self, MAX_OTP_ATTEMPTS, OtpChallengeState, OtpStatus};
use crate::domain::ports::RemoteApi;
use crate::error::{ApiError, FlowError, OtpError};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info};

/// Drives one phone-validation / OTP verification challenge.
///
/// Validation and operator lookup happen before any network call; the code
/// check itself is delegated to the backend. Expiry and the attempt cap are
/// evaluated against explicit deadlines, never timers.
pub struct OtpChallenge {
    api: Arc<dyn RemoteApi>,
    state: Option<OtpChallengeState>,
}

impl OtpChallenge {
    pub fn new(api: Arc<dyn RemoteApi>) -> Self {
        Self { api, state: None }
    }

    pub fn state(&self) -> Option<&OtpChallengeState> {
        self.state.as_ref()
    }

    pub fn is_verified(&self) -> bool {
        self.state
            .as_ref()
            .is_some_and(|s| s.status == OtpStatus::Verified)
    }

    pub fn attempts_used(&self) -> u8 {
        self.state.as_ref().map_or(0, |s| s.attempts_used)
    }

    /// Seconds left in the current window, for UI display.
    pub fn remaining_secs(&self) -> u64 {
        self.state
            .as_ref()
            .map_or(0, |s| s.remaining(Instant::now()).as_secs())
    }

    /// Validates the number, dispatches a code, and arms the expiry window.
    /// Format and operator failures are caught before any network call.
    pub async fn request(&mut self, phone: &str) -> Result<(), FlowError> {
        if !otp::is_valid_phone(phone) {
            return Err(OtpError::InvalidPhone.into());
        }
        let normalized = otp::normalize_phone(phone);
        let operator = otp::operator_for(&normalized).ok_or_else(|| {
            let prefix = normalized
                .strip_prefix("+256")
                .and_then(|rest| rest.get(..2))
                .unwrap_or(normalized.as_str());
            OtpError::UnsupportedOperator(prefix.to_string())
        })?;

        self.api
            .dispatch_otp(&normalized)
            .await
            .map_err(network)?;
        info!(phone = %normalized, ?operator, "otp dispatched");
        self.state = Some(OtpChallengeState::issue(normalized, operator, Instant::now()));
        Ok(())
    }

    /// Checks the entered code against the server-issued one.
    ///
    /// Expiry and the attempt cap are checked before the code itself, so a
    /// correct code cannot rescue an expired or exhausted challenge.
    pub async fn verify(&mut self, code: &str) -> Result<(), FlowError> {
        let api = Arc::clone(&self.api);
        let state = self.state.as_mut().ok_or(OtpError::NotIssued)?;
        let now = Instant::now();

        if state.is_expired(now) {
            return Err(OtpError::Expired.into());
        }
        if state.attempts_exhausted() {
            return Err(OtpError::TooManyAttempts.into());
        }

        let matched = api
            .verify_otp(&state.phone_number, code)
            .await
            .map_err(network)?;
        if matched {
            state.status = OtpStatus::Verified;
            info!(phone = %state.phone_number, "otp verified");
            Ok(())
        } else {
            state.attempts_used += 1;
            let remaining = MAX_OTP_ATTEMPTS.saturating_sub(state.attempts_used);
            debug!(attempts = state.attempts_used, "otp mismatch");
            Err(OtpError::IncorrectCode { remaining }.into())
        }
    }

    /// Reissues a code with a fresh window and a cleared attempt counter.
    /// This is the only recovery from `Expired` and `TooManyAttempts`.
    pub async fn resend(&mut self) -> Result<(), FlowError> {
        let api = Arc::clone(&self.api);
        let state = self.state.as_mut().ok_or(OtpError::NotIssued)?;
        api.dispatch_otp(&state.phone_number).await.map_err(network)?;
        state.reissue(Instant::now());
        info!(phone = %state.phone_number, "otp resent");
        Ok(())
    }

    /// Discards any challenge in progress, e.g. on payment method switch.
    pub fn reset(&mut self) {
        self.state = None;
    }
}

fn network(err: ApiError) -> FlowError {
    FlowError::Network(err.to_string())
}
