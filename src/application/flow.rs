use crate::application::otp::OtpChallenge;
use crate::application::poller::{
    DeliveryAck, PaymentStatusPoller, PollOutcome, PollerConfig, TerminalCallback,
};
use crate::application::reconciler::EntitlementReconciler;
use crate::domain::entitlement::{EntitlementRecord, IntentOutcome};
use crate::domain::payment::{
    Amount, Balance, PaymentMethod, PaymentSession, PaymentStatus, SessionState,
};
use crate::domain::ports::{Notifier, RemoteApi};
use crate::error::{ApiError, FlowError};
use crate::infrastructure::in_memory::LocalEntitlementStore;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tracing::{info, warn};

const CURRENCY: &str = "UGX";

/// Where the checkout currently stands. Each step maps to one screen or
/// modal pane; `confirm` advances, `cancel` unwinds while still allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStep {
    Idle,
    MethodSelected,
    WalletConfirm,
    Phone,
    OtpIssued,
    Processing,
    Settled,
}

/// How a settled flow ended. `Unconfirmed` means the money side succeeded
/// but the registration could not be verified yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SettledOutcome {
    Success,
    Failure,
    Unconfirmed,
}

/// Immutable view of the flow published to subscribers after every change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FlowSnapshot {
    pub step: FlowStep,
    pub method: Option<PaymentMethod>,
    /// Reference of the session being processed, for receipts and
    /// out-of-band resolution.
    pub payment_reference: Option<String>,
    pub remaining_otp_secs: u64,
    pub otp_attempts: u8,
    pub last_error: Option<String>,
    pub settled: Option<SettledOutcome>,
}

struct FlowInner {
    step: FlowStep,
    resource_id: Option<String>,
    amount: Option<Amount>,
    method: Option<PaymentMethod>,
    session: Option<PaymentSession>,
    otp: OtpChallenge,
    phone_input: String,
    otp_input: String,
    wallet_balance: Balance,
    last_error: Option<String>,
    settled: Option<SettledOutcome>,
}

struct FlowShared {
    api: Arc<dyn RemoteApi>,
    store: LocalEntitlementStore,
    reconciler: EntitlementReconciler,
    poller: Arc<PaymentStatusPoller>,
    user_id: String,
    inner: Mutex<FlowInner>,
    updates: watch::Sender<FlowSnapshot>,
}

/// Drives one checkout at a time for a user, from method selection through
/// settlement.
///
/// All state lives behind one lock and every change is published on a watch
/// channel, so screens render from snapshots instead of poking at the flow.
/// The poller outlives any subscriber; terminal results that arrive after
/// the last receiver is gone fall back to a local notification.
#[derive(Clone)]
pub struct PaymentFlowController {
    shared: Arc<FlowShared>,
}

impl PaymentFlowController {
    pub fn new(
        api: Arc<dyn RemoteApi>,
        store: LocalEntitlementStore,
        notifier: Arc<dyn Notifier>,
        user_id: &str,
    ) -> Self {
        Self::with_poller_config(api, store, notifier, user_id, PollerConfig::default())
    }

    pub fn with_poller_config(
        api: Arc<dyn RemoteApi>,
        store: LocalEntitlementStore,
        notifier: Arc<dyn Notifier>,
        user_id: &str,
        poller_config: PollerConfig,
    ) -> Self {
        let reconciler = EntitlementReconciler::new(Arc::clone(&api), store.clone());
        let poller = Arc::new(PaymentStatusPoller::with_config(
            Arc::clone(&api),
            notifier,
            poller_config,
        ));
        let inner = FlowInner {
            step: FlowStep::Idle,
            resource_id: None,
            amount: None,
            method: None,
            session: None,
            otp: OtpChallenge::new(Arc::clone(&api)),
            phone_input: String::new(),
            otp_input: String::new(),
            wallet_balance: Balance::ZERO,
            last_error: None,
            settled: None,
        };
        let (updates, initial_rx) = watch::channel(snapshot_of(&inner));
        // Receiver count should reflect actual subscribers only
        drop(initial_rx);
        Self {
            shared: Arc::new(FlowShared {
                api,
                store,
                reconciler,
                poller,
                user_id: user_id.to_string(),
                inner: Mutex::new(inner),
                updates,
            }),
        }
    }

    /// Subscribes to flow snapshots. While at least one receiver is alive,
    /// terminal payment results are considered handled in-app.
    pub fn subscribe(&self) -> watch::Receiver<FlowSnapshot> {
        self.shared.updates.subscribe()
    }

    pub fn snapshot(&self) -> FlowSnapshot {
        self.shared.updates.borrow().clone()
    }

    /// Opens a checkout for `resource_id`. At most one flow per
    /// `(resource, user)` key may be in progress, across all controllers
    /// sharing the entitlement store.
    pub async fn start(&self, resource_id: &str, amount: Amount) -> Result<(), FlowError> {
        let mut inner = self.shared.inner.lock().await;
        if inner.step != FlowStep::Idle {
            return Err(FlowError::InvalidState("a checkout is already open"));
        }
        if !self.shared.store.try_begin(resource_id, &self.shared.user_id).await {
            return Err(FlowError::AlreadyInProgress);
        }
        inner.resource_id = Some(resource_id.to_string());
        inner.amount = Some(amount);
        inner.step = FlowStep::MethodSelected;
        inner.last_error = None;
        inner.settled = None;
        info!(resource_id, %amount, "checkout opened");
        self.shared.publish(&inner);
        Ok(())
    }

    /// Picks (or switches) the payment method. Switching discards any OTP
    /// challenge in progress and returns to the method screen.
    pub async fn select_method(&self, method: PaymentMethod) -> Result<(), FlowError> {
        let mut inner = self.shared.inner.lock().await;
        match inner.step {
            FlowStep::MethodSelected
            | FlowStep::WalletConfirm
            | FlowStep::Phone
            | FlowStep::OtpIssued => {
                inner.method = Some(method);
                inner.otp.reset();
                inner.otp_input.clear();
                inner.step = FlowStep::MethodSelected;
                inner.last_error = None;
                self.shared.publish(&inner);
                Ok(())
            }
            _ => Err(FlowError::InvalidState("no checkout open for method selection")),
        }
    }

    pub async fn set_phone(&self, phone: &str) {
        let mut inner = self.shared.inner.lock().await;
        inner.phone_input = phone.to_string();
    }

    pub async fn set_otp(&self, code: &str) {
        let mut inner = self.shared.inner.lock().await;
        inner.otp_input = code.to_string();
    }

    /// Advances the flow one step. What "confirm" means depends on where
    /// the flow stands: entering the chosen method, approving the wallet
    /// charge, requesting an OTP, or submitting the entered code.
    pub async fn confirm(&self) -> Result<(), FlowError> {
        let mut inner = self.shared.inner.lock().await;
        match inner.step {
            FlowStep::MethodSelected => match inner.method {
                Some(PaymentMethod::Wallet) => {
                    self.refresh_balance_locked(&mut inner).await;
                    inner.step = FlowStep::WalletConfirm;
                    inner.last_error = None;
                    self.shared.publish(&inner);
                    Ok(())
                }
                Some(PaymentMethod::MobileMoney) => {
                    inner.step = FlowStep::Phone;
                    inner.last_error = None;
                    self.shared.publish(&inner);
                    Ok(())
                }
                None => Err(FlowError::InvalidState("no payment method selected")),
            },
            FlowStep::WalletConfirm => self.confirm_wallet(&mut inner).await,
            FlowStep::Phone => {
                let phone = inner.phone_input.clone();
                match inner.otp.request(&phone).await {
                    Ok(()) => {
                        inner.step = FlowStep::OtpIssued;
                        inner.last_error = None;
                        self.shared.publish(&inner);
                        Ok(())
                    }
                    Err(err) => Err(self.shared.reject(&mut inner, err)),
                }
            }
            FlowStep::OtpIssued => {
                let code = inner.otp_input.clone();
                match inner.otp.verify(&code).await {
                    Ok(()) => self.enter_processing(&mut inner).await,
                    Err(err) => Err(self.shared.reject(&mut inner, err)),
                }
            }
            FlowStep::Idle | FlowStep::Processing | FlowStep::Settled => {
                Err(FlowError::InvalidState("nothing to confirm at this step"))
            }
        }
    }

    /// Reissues the OTP code with a fresh window.
    pub async fn resend_otp(&self) -> Result<(), FlowError> {
        let mut inner = self.shared.inner.lock().await;
        if inner.step != FlowStep::OtpIssued {
            return Err(FlowError::InvalidState("no code to resend"));
        }
        match inner.otp.resend().await {
            Ok(()) => {
                inner.last_error = None;
                self.shared.publish(&inner);
                Ok(())
            }
            Err(err) => Err(self.shared.reject(&mut inner, err)),
        }
    }

    /// Abandons the checkout. Allowed until the payment is submitted;
    /// once processing, the money may already be moving and the flow must
    /// run to a terminal state instead.
    pub async fn cancel(&self) -> Result<(), FlowError> {
        let mut inner = self.shared.inner.lock().await;
        match inner.step {
            FlowStep::MethodSelected
            | FlowStep::WalletConfirm
            | FlowStep::Phone
            | FlowStep::OtpIssued => {
                if let Some(resource_id) = inner.resource_id.clone() {
                    self.shared.store.finish(&resource_id, &self.shared.user_id).await;
                }
                info!("checkout cancelled");
                reset(&mut inner);
                self.shared.publish(&inner);
                Ok(())
            }
            FlowStep::Processing => Err(FlowError::CancellationRefused),
            FlowStep::Idle | FlowStep::Settled => {
                Err(FlowError::InvalidState("no checkout to cancel"))
            }
        }
    }

    /// Dismisses a settled flow and returns to idle.
    pub async fn acknowledge(&self) -> Result<(), FlowError> {
        let mut inner = self.shared.inner.lock().await;
        if inner.step != FlowStep::Settled {
            return Err(FlowError::InvalidState("flow is not settled"));
        }
        reset(&mut inner);
        self.shared.publish(&inner);
        Ok(())
    }

    /// Re-reads the wallet balance. A failed read keeps the last known
    /// value rather than zeroing the display.
    pub async fn refresh_balance(&self) -> Balance {
        let mut inner = self.shared.inner.lock().await;
        self.refresh_balance_locked(&mut inner).await;
        self.shared.publish(&inner);
        inner.wallet_balance
    }

    /// Settles an in-flight payment from an out-of-band signal, e.g. a
    /// push notification carrying the processor's verdict.
    pub async fn resolve_payment(&self, reference: &str, status: PaymentStatus) {
        self.shared.poller.resolve(reference, status).await;
    }

    async fn refresh_balance_locked(&self, inner: &mut FlowInner) {
        match self.shared.api.wallet_balance(&self.shared.user_id).await {
            Ok(balance) => inner.wallet_balance = balance,
            Err(err) => {
                warn!(%err, "balance refresh failed, keeping last known value");
            }
        }
    }

    async fn confirm_wallet(&self, inner: &mut FlowInner) -> Result<(), FlowError> {
        let (resource_id, amount) = checkout_context(inner)?;
        let balance = inner.wallet_balance;
        // Decided locally; an uncoverable price never reaches the network
        if !balance.covers(amount) {
            return Err(self.shared.reject(
                inner,
                FlowError::InsufficientBalance {
                    available: balance,
                    required: amount,
                },
            ));
        }

        let session = PaymentSession::new(
            &resource_id,
            &self.shared.user_id,
            PaymentMethod::Wallet,
            amount,
            CURRENCY,
        );
        let reference = session.reference.clone();
        inner.session = Some(session);
        inner.step = FlowStep::Processing;
        inner.last_error = None;
        self.shared.publish(inner);

        self.shared
            .store
            .apply(EntitlementRecord::optimistic(&resource_id, &self.shared.user_id))
            .await;

        if let Err(err) = self
            .shared
            .api
            .debit_wallet(&self.shared.user_id, amount, &reference)
            .await
        {
            warn!(%err, "wallet debit failed");
            self.shared
                .store
                .rollback_optimistic(&resource_id, &self.shared.user_id)
                .await;
            inner.last_error = Some(err.to_string());
            self.shared.settle(inner, SettledOutcome::Failure).await;
            return Ok(());
        }
        inner.wallet_balance -= Balance::from(amount);

        let intent = self
            .shared
            .reconciler
            .register_or_reconcile(
                &resource_id,
                &self.shared.user_id,
                PaymentMethod::Wallet,
                None,
                Some(&reference),
            )
            .await;
        let outcome = match intent.outcome {
            IntentOutcome::Confirmed => SettledOutcome::Success,
            IntentOutcome::Unknown => SettledOutcome::Unconfirmed,
            IntentOutcome::Failed | IntentOutcome::Pending => {
                self.shared
                    .store
                    .rollback_optimistic(&resource_id, &self.shared.user_id)
                    .await;
                SettledOutcome::Failure
            }
        };
        self.shared.settle(inner, outcome).await;
        Ok(())
    }

    async fn enter_processing(&self, inner: &mut FlowInner) -> Result<(), FlowError> {
        let (resource_id, amount) = checkout_context(inner)?;
        let phone = inner
            .otp
            .state()
            .map(|s| s.phone_number.clone())
            .ok_or(FlowError::InvalidState("no verified phone number"))?;

        match self
            .shared
            .api
            .register_for_resource(
                &resource_id,
                &self.shared.user_id,
                PaymentMethod::MobileMoney,
                Some(&phone),
            )
            .await
        {
            Ok(()) => {}
            // A duplicate write is settled by reconciliation on the
            // terminal result, not guessed at here
            Err(err) if err.is_ambiguous() => {
                info!(%err, "ambiguous charge initiation, deferring to reconciliation");
            }
            Err(err) => return Err(self.shared.reject(inner, api_error(err))),
        }

        let session = PaymentSession::new(
            &resource_id,
            &self.shared.user_id,
            PaymentMethod::MobileMoney,
            amount,
            CURRENCY,
        );
        let reference = session.reference.clone();
        self.shared
            .store
            .apply(EntitlementRecord::optimistic(&resource_id, &self.shared.user_id))
            .await;
        inner.session = Some(session.clone());
        inner.step = FlowStep::Processing;
        inner.last_error = None;
        info!(reference = %reference, "mobile money charge submitted");
        self.shared.publish(inner);

        let shared = Arc::clone(&self.shared);
        let on_terminal: TerminalCallback = Box::new(move |outcome| {
            Box::pin(FlowShared::settle_from_poll(shared, session, outcome))
        });
        self.shared.poller.start(&reference, on_terminal).await
    }
}

impl FlowShared {
    fn publish(&self, inner: &FlowInner) {
        self.updates.send_replace(snapshot_of(inner));
    }

    /// Records the error in the snapshot and hands it back to the caller.
    fn reject(&self, inner: &mut FlowInner, err: FlowError) -> FlowError {
        inner.last_error = Some(err.to_string());
        self.publish(inner);
        err
    }

    async fn settle(&self, inner: &mut FlowInner, outcome: SettledOutcome) {
        if let Some(session) = inner.session.as_mut() {
            session.state = SessionState::Settled;
        }
        inner.step = FlowStep::Settled;
        inner.settled = Some(outcome);
        if let Some(resource_id) = inner.resource_id.clone() {
            self.store.finish(&resource_id, &self.user_id).await;
        }
        info!(?outcome, "checkout settled");
        self.publish(inner);
    }

    async fn settle_from_poll(
        shared: Arc<FlowShared>,
        session: PaymentSession,
        outcome: PollOutcome,
    ) -> DeliveryAck {
        let settled = match outcome {
            PollOutcome::Confirmed => {
                match shared
                    .reconciler
                    .reconcile(&session.resource_id, &session.user_id)
                    .await
                {
                    IntentOutcome::Confirmed => SettledOutcome::Success,
                    IntentOutcome::Unknown => SettledOutcome::Unconfirmed,
                    IntentOutcome::Failed | IntentOutcome::Pending => SettledOutcome::Failure,
                }
            }
            PollOutcome::Failed | PollOutcome::TimedOut => {
                shared
                    .store
                    .rollback_optimistic(&session.resource_id, &session.user_id)
                    .await;
                SettledOutcome::Failure
            }
        };

        let mut inner = shared.inner.lock().await;
        let current = inner
            .session
            .as_ref()
            .is_some_and(|s| s.reference == session.reference);
        if current {
            if outcome == PollOutcome::TimedOut {
                inner.last_error = Some("payment confirmation timed out".to_string());
            }
            shared.settle(&mut inner, settled).await;
        } else {
            // Stale delivery; release the key without touching the flow
            shared.store.finish(&session.resource_id, &session.user_id).await;
        }

        if current && shared.updates.receiver_count() > 0 {
            DeliveryAck::HandledInApp
        } else {
            DeliveryAck::DeferToPassiveSync
        }
    }
}

fn checkout_context(inner: &FlowInner) -> Result<(String, Amount), FlowError> {
    match (inner.resource_id.clone(), inner.amount) {
        (Some(resource_id), Some(amount)) => Ok((resource_id, amount)),
        _ => Err(FlowError::InvalidState("no checkout open")),
    }
}

fn snapshot_of(inner: &FlowInner) -> FlowSnapshot {
    FlowSnapshot {
        step: inner.step,
        method: inner.method,
        payment_reference: inner.session.as_ref().map(|s| s.reference.clone()),
        remaining_otp_secs: inner.otp.remaining_secs(),
        otp_attempts: inner.otp.attempts_used(),
        last_error: inner.last_error.clone(),
        settled: inner.settled,
    }
}

fn reset(inner: &mut FlowInner) {
    inner.step = FlowStep::Idle;
    inner.resource_id = None;
    inner.amount = None;
    inner.method = None;
    inner.session = None;
    inner.otp.reset();
    inner.phone_input.clear();
    inner.otp_input.clear();
    inner.last_error = None;
    inner.settled = None;
}

fn api_error(err: ApiError) -> FlowError {
    match err {
        ApiError::Network(msg) => FlowError::Network(msg),
        other => FlowError::Payment(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::stub::{InMemoryRemoteApi, LogNotifier};
    use rust_decimal_macros::dec;

    fn controller(api: &InMemoryRemoteApi, store: &LocalEntitlementStore) -> PaymentFlowController {
        PaymentFlowController::new(
            Arc::new(api.clone()),
            store.clone(),
            Arc::new(LogNotifier),
            "user-1",
        )
    }

    fn price() -> Amount {
        Amount::new(dec!(50_000)).unwrap()
    }

    #[tokio::test]
    async fn test_one_flow_per_resource_across_controllers() {
        let api = InMemoryRemoteApi::new();
        let store = LocalEntitlementStore::new();
        let first = controller(&api, &store);
        let second = controller(&api, &store);

        first.start("res-1", price()).await.unwrap();
        let err = second.start("res-1", price()).await.unwrap_err();
        assert_eq!(err, FlowError::AlreadyInProgress);

        // A different resource is fine
        second.start("res-2", price()).await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_releases_the_key() {
        let api = InMemoryRemoteApi::new();
        let store = LocalEntitlementStore::new();
        let first = controller(&api, &store);
        let second = controller(&api, &store);

        first.start("res-1", price()).await.unwrap();
        first.cancel().await.unwrap();
        assert_eq!(first.snapshot().step, FlowStep::Idle);

        second.start("res-1", price()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_method_switch_discards_otp_challenge() {
        let api = InMemoryRemoteApi::new();
        let store = LocalEntitlementStore::new();
        let flow = controller(&api, &store);

        flow.start("res-1", price()).await.unwrap();
        flow.select_method(PaymentMethod::MobileMoney).await.unwrap();
        flow.confirm().await.unwrap();
        flow.set_phone("+256772123456").await;
        flow.confirm().await.unwrap();
        assert_eq!(flow.snapshot().step, FlowStep::OtpIssued);
        assert_eq!(flow.snapshot().remaining_otp_secs, 120);

        flow.select_method(PaymentMethod::Wallet).await.unwrap();
        let snapshot = flow.snapshot();
        assert_eq!(snapshot.step, FlowStep::MethodSelected);
        assert_eq!(snapshot.remaining_otp_secs, 0);
        assert_eq!(snapshot.otp_attempts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_refused_once_processing() {
        let api = InMemoryRemoteApi::new();
        let store = LocalEntitlementStore::new();
        let flow = controller(&api, &store);

        flow.start("res-1", price()).await.unwrap();
        flow.select_method(PaymentMethod::MobileMoney).await.unwrap();
        flow.confirm().await.unwrap();
        flow.set_phone("0772123456").await;
        flow.confirm().await.unwrap();
        let code = api.last_code("+256772123456").await.unwrap();
        flow.set_otp(&code).await;
        flow.confirm().await.unwrap();

        assert_eq!(flow.snapshot().step, FlowStep::Processing);
        let err = flow.cancel().await.unwrap_err();
        assert_eq!(err, FlowError::CancellationRefused);
    }

    #[tokio::test]
    async fn test_cancel_without_checkout_is_invalid() {
        let api = InMemoryRemoteApi::new();
        let store = LocalEntitlementStore::new();
        let flow = controller(&api, &store);
        assert!(matches!(
            flow.cancel().await.unwrap_err(),
            FlowError::InvalidState(_)
        ));
    }

    #[tokio::test]
    async fn test_confirm_requires_a_method() {
        let api = InMemoryRemoteApi::new();
        let store = LocalEntitlementStore::new();
        let flow = controller(&api, &store);
        flow.start("res-1", price()).await.unwrap();

        assert!(matches!(
            flow.confirm().await.unwrap_err(),
            FlowError::InvalidState(_)
        ));
    }

    #[tokio::test]
    async fn test_snapshot_serializes_for_ui() {
        let api = InMemoryRemoteApi::new();
        let store = LocalEntitlementStore::new();
        let flow = controller(&api, &store);
        flow.start("res-1", price()).await.unwrap();
        flow.select_method(PaymentMethod::Wallet).await.unwrap();

        let json = serde_json::to_value(flow.snapshot()).unwrap();
        assert_eq!(json["step"], "method_selected");
        assert_eq!(json["method"], "wallet");
        assert_eq!(json["settled"], serde_json::Value::Null);
    }
}
