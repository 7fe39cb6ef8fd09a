use super::entitlement::ResourceStanding;
use super::payment::{Amount, Balance, PaymentMethod, PaymentStatus};
use crate::error::ApiError;
use async_trait::async_trait;

/// Logical operations of the remote backend and payment processor.
///
/// The wire format is out of scope; implementations translate transport
/// failures into `ApiError::Network` and duplicate/conflict responses into
/// `ApiError::Conflict` so callers can reconcile instead of guessing.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    async fn register_for_resource(
        &self,
        resource_id: &str,
        user_id: &str,
        method: PaymentMethod,
        phone: Option<&str>,
    ) -> Result<(), ApiError>;

    async fn unregister_from_resource(
        &self,
        resource_id: &str,
        user_id: &str,
    ) -> Result<(), ApiError>;

    /// The authoritative listing of resources the user holds.
    async fn fetch_my_resources(&self, user_id: &str) -> Result<Vec<ResourceStanding>, ApiError>;

    async fn dispatch_otp(&self, phone: &str) -> Result<(), ApiError>;

    /// Server-authoritative code check. `Ok(false)` is a mismatch, not an
    /// error; the caller owns the attempt accounting.
    async fn verify_otp(&self, phone: &str, code: &str) -> Result<bool, ApiError>;

    async fn check_payment_status(&self, reference: &str) -> Result<PaymentStatus, ApiError>;

    async fn wallet_balance(&self, user_id: &str) -> Result<Balance, ApiError>;

    async fn debit_wallet(
        &self,
        user_id: &str,
        amount: Amount,
        reference: &str,
    ) -> Result<(), ApiError>;
}

/// Local notification fallback for results that arrive after the
/// originating screen is gone.
pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, body: &str);
}
