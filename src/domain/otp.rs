use serde::{Deserialize, Serialize};
use tokio::time::{Duration, Instant};

/// How long an issued code stays valid.
pub const OTP_TTL: Duration = Duration::from_secs(2 * 60);

/// Incorrect entries allowed before the challenge locks.
pub const MAX_OTP_ATTEMPTS: u8 = 3;

/// Mobile-money operators the processor can debit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Mtn,
    Airtel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtpStatus {
    Issued,
    Verified,
}

/// State of one OTP challenge.
///
/// Deadlines are explicit instants compared against the runtime clock, so
/// tests can advance virtual time instead of sleeping.
#[derive(Debug, Clone)]
pub struct OtpChallengeState {
    pub phone_number: String,
    pub operator: Operator,
    pub attempts_used: u8,
    pub issued_at: Instant,
    pub expires_at: Instant,
    pub status: OtpStatus,
}

impl OtpChallengeState {
    pub fn issue(phone_number: String, operator: Operator, now: Instant) -> Self {
        Self {
            phone_number,
            operator,
            attempts_used: 0,
            issued_at: now,
            expires_at: now + OTP_TTL,
            status: OtpStatus::Issued,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts_used >= MAX_OTP_ATTEMPTS
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }

    /// Re-arms the challenge: fresh deadline, attempt counter cleared.
    pub fn reissue(&mut self, now: Instant) {
        self.attempts_used = 0;
        self.issued_at = now;
        self.expires_at = now + OTP_TTL;
        self.status = OtpStatus::Issued;
    }
}

/// Accepts E.164 (`+` then 2 to 15 digits, no leading zero) or a local
/// ten-digit number starting with `0`.
pub fn is_valid_phone(value: &str) -> bool {
    let cleaned: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    if let Some(rest) = cleaned.strip_prefix('+') {
        rest.len() >= 2
            && rest.len() <= 15
            && !rest.starts_with('0')
            && rest.chars().all(|c| c.is_ascii_digit())
    } else if cleaned.starts_with('0') {
        cleaned.len() == 10 && cleaned.chars().all(|c| c.is_ascii_digit())
    } else {
        false
    }
}

/// Normalizes a local `07...` number to international `+2567...` form.
pub fn normalize_phone(value: &str) -> String {
    let cleaned: String = value.chars().filter(|c| !c.is_whitespace()).collect();
    match cleaned.strip_prefix('0') {
        Some(rest) if rest.len() == 9 => format!("+256{rest}"),
        _ => cleaned,
    }
}

/// Carrier lookup on the Ugandan prefix table. `None` means the number is
/// valid but no supported operator can debit it.
pub fn operator_for(phone: &str) -> Option<Operator> {
    let rest = phone.strip_prefix("+256")?;
    match rest.get(..2)? {
        "70" | "75" | "74" | "20" => Some(Operator::Airtel),
        "78" | "77" | "76" | "39" | "31" => Some(Operator::Mtn),
        _ => None,
    }
}
