use crate::domain::entitlement::{ResourceStanding, ResourceStatus};
use crate::domain::payment::{Amount, Balance, PaymentMethod, PaymentStatus};
use crate::domain::ports::{Notifier, RemoteApi};
use crate::error::ApiError;
use async_trait::async_trait;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// What the stub backend answers to the next registration writes.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistrationScript {
    Accept,
    /// Duplicate/conflict response; the write outcome stays ambiguous.
    Conflict,
    Reject(String),
    NetworkDown,
}

#[derive(Debug, Clone)]
enum StatusStep {
    Status(PaymentStatus),
    NetworkError,
}

#[derive(Default)]
struct StubState {
    registration: Option<RegistrationScript>,
    listing: HashMap<String, Vec<ResourceStanding>>,
    listing_down: bool,
    statuses: HashMap<String, VecDeque<StatusStep>>,
    codes: HashMap<String, String>,
    balances: HashMap<String, Balance>,
    register_calls: u32,
    debit_calls: u32,
    otp_dispatches: u32,
}

/// Scriptable in-memory stand-in for the remote backend and payment
/// processor. Used by tests and local demos; behavior is set per scenario
/// through the `script_*`/`queue_*` methods.
#[derive(Default, Clone)]
pub struct InMemoryRemoteApi {
    state: Arc<RwLock<StubState>>,
}

impl InMemoryRemoteApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn script_registration(&self, script: RegistrationScript) {
        self.state.write().await.registration = Some(script);
    }

    /// Places a resource in the user's authoritative listing.
    pub async fn grant(&self, user_id: &str, resource_id: &str, status: ResourceStatus) {
        let mut state = self.state.write().await;
        let entries = state.listing.entry(user_id.to_string()).or_default();
        entries.retain(|r| r.resource_id != resource_id);
        entries.push(ResourceStanding {
            resource_id: resource_id.to_string(),
            status,
        });
    }

    /// Makes `fetch_my_resources` fail until called with `false`.
    pub async fn fail_listing(&self, down: bool) {
        self.state.write().await.listing_down = down;
    }

    /// Queues the answer for an upcoming status check on `reference`.
    /// An empty queue reads as `Pending`.
    pub async fn queue_status(&self, reference: &str, status: PaymentStatus) {
        let mut state = self.state.write().await;
        state
            .statuses
            .entry(reference.to_string())
            .or_default()
            .push_back(StatusStep::Status(status));
    }

    /// Queues one transient network failure for a status check.
    pub async fn queue_status_error(&self, reference: &str) {
        let mut state = self.state.write().await;
        state
            .statuses
            .entry(reference.to_string())
            .or_default()
            .push_back(StatusStep::NetworkError);
    }

    pub async fn set_balance(&self, user_id: &str, balance: Balance) {
        self.state.write().await.balances.insert(user_id.to_string(), balance);
    }

    /// The code most recently dispatched to `phone`.
    pub async fn last_code(&self, phone: &str) -> Option<String> {
        self.state.read().await.codes.get(phone).cloned()
    }

    pub async fn register_calls(&self) -> u32 {
        self.state.read().await.register_calls
    }

    pub async fn debit_calls(&self) -> u32 {
        self.state.read().await.debit_calls
    }

    pub async fn otp_dispatches(&self) -> u32 {
        self.state.read().await.otp_dispatches
    }
}

#[async_trait]
impl RemoteApi for InMemoryRemoteApi {
    async fn register_for_resource(
        &self,
        resource_id: &str,
        user_id: &str,
        _method: PaymentMethod,
        _phone: Option<&str>,
    ) -> Result<(), ApiError> {
        let mut state = self.state.write().await;
        state.register_calls += 1;
        let script = state
            .registration
            .clone()
            .unwrap_or(RegistrationScript::Accept);
        match script {
            RegistrationScript::Accept => {
                let entries = state.listing.entry(user_id.to_string()).or_default();
                entries.retain(|r| r.resource_id != resource_id);
                entries.push(ResourceStanding {
                    resource_id: resource_id.to_string(),
                    status: ResourceStatus::Active,
                });
                Ok(())
            }
            RegistrationScript::Conflict => Err(ApiError::Conflict {
                code: Some("DUPLICATE_REGISTRATION".to_string()),
            }),
            RegistrationScript::Reject(msg) => Err(ApiError::Rejected(msg)),
            RegistrationScript::NetworkDown => {
                Err(ApiError::Network("backend unreachable".to_string()))
            }
        }
    }

    async fn unregister_from_resource(
        &self,
        resource_id: &str,
        user_id: &str,
    ) -> Result<(), ApiError> {
        let mut state = self.state.write().await;
        if let Some(entries) = state.listing.get_mut(user_id) {
            for entry in entries.iter_mut() {
                if entry.resource_id == resource_id {
                    entry.status = ResourceStatus::Cancelled;
                }
            }
        }
        Ok(())
    }

    async fn fetch_my_resources(&self, user_id: &str) -> Result<Vec<ResourceStanding>, ApiError> {
        let state = self.state.read().await;
        if state.listing_down {
            return Err(ApiError::Network("listing unavailable".to_string()));
        }
        Ok(state.listing.get(user_id).cloned().unwrap_or_default())
    }

    async fn dispatch_otp(&self, phone: &str) -> Result<(), ApiError> {
        let code = format!("{:06}", rand::thread_rng().gen_range(0..1_000_000));
        let mut state = self.state.write().await;
        state.otp_dispatches += 1;
        state.codes.insert(phone.to_string(), code);
        Ok(())
    }

    async fn verify_otp(&self, phone: &str, code: &str) -> Result<bool, ApiError> {
        let state = self.state.read().await;
        Ok(state.codes.get(phone).is_some_and(|c| c == code))
    }

    async fn check_payment_status(&self, reference: &str) -> Result<PaymentStatus, ApiError> {
        let mut state = self.state.write().await;
        match state
            .statuses
            .get_mut(reference)
            .and_then(VecDeque::pop_front)
        {
            Some(StatusStep::Status(status)) => Ok(status),
            Some(StatusStep::NetworkError) => {
                Err(ApiError::Network("status check failed".to_string()))
            }
            None => Ok(PaymentStatus::Pending),
        }
    }

    async fn wallet_balance(&self, user_id: &str) -> Result<Balance, ApiError> {
        let state = self.state.read().await;
        Ok(state.balances.get(user_id).copied().unwrap_or_default())
    }

    async fn debit_wallet(
        &self,
        user_id: &str,
        amount: Amount,
        _reference: &str,
    ) -> Result<(), ApiError> {
        let mut state = self.state.write().await;
        state.debit_calls += 1;
        let balance = state.balances.get(user_id).copied().unwrap_or_default();
        if !balance.covers(amount) {
            return Err(ApiError::Rejected("insufficient wallet funds".to_string()));
        }
        state
            .balances
            .insert(user_id.to_string(), balance - Balance::from(amount));
        Ok(())
    }
}

/// Writes notifications to the log; a real app plugs the platform's local
/// notification service in here.
#[derive(Default, Clone)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, title: &str, body: &str) {
        info!(title, body, "local notification");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_otp_dispatch_and_verify() {
        let api = InMemoryRemoteApi::new();
        api.dispatch_otp("+256772123456").await.unwrap();
        let code = api.last_code("+256772123456").await.unwrap();
        assert_eq!(code.len(), 6);

        assert!(api.verify_otp("+256772123456", &code).await.unwrap());
        assert!(!api.verify_otp("+256772123456", "000000").await.unwrap()
            || code == "000000");
        assert_eq!(api.otp_dispatches().await, 1);
    }

    #[tokio::test]
    async fn test_status_queue_drains_to_pending() {
        let api = InMemoryRemoteApi::new();
        api.queue_status("pay_x", PaymentStatus::Confirmed).await;

        assert_eq!(
            api.check_payment_status("pay_x").await.unwrap(),
            PaymentStatus::Confirmed
        );
        assert_eq!(
            api.check_payment_status("pay_x").await.unwrap(),
            PaymentStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_debit_checks_funds() {
        let api = InMemoryRemoteApi::new();
        api.set_balance("user-1", Balance::new(100.into())).await;

        let amount = Amount::new(60.into()).unwrap();
        api.debit_wallet("user-1", amount, "pay_1").await.unwrap();
        assert!(api.debit_wallet("user-1", amount, "pay_2").await.is_err());
        assert_eq!(api.debit_calls().await, 2);
    }

    #[tokio::test]
    async fn test_unregister_marks_cancelled() {
        let api = InMemoryRemoteApi::new();
        api.grant("user-1", "res-1", ResourceStatus::Active).await;
        api.unregister_from_resource("res-1", "user-1").await.unwrap();

        let listing = api.fetch_my_resources("user-1").await.unwrap();
        assert_eq!(listing[0].status, ResourceStatus::Cancelled);
    }
}
