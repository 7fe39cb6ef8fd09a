use crate::domain::payment::PaymentStatus;
use crate::domain::ports::{Notifier, RemoteApi};
use crate::error::FlowError;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant};
use tracing::{debug, info, warn};

/// Whether the subscriber consumed a terminal result in-app. When the
/// originating screen is gone the poller hands off to a local notification
/// and the result is picked up passively on next load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryAck {
    HandledInApp,
    DeferToPassiveSync,
}

/// Terminal resolution of a watched payment reference. A poll that exceeds
/// its overall deadline resolves as `TimedOut` and is treated as a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Confirmed,
    Failed,
    TimedOut,
}

pub type TerminalFuture = Pin<Box<dyn Future<Output = DeliveryAck> + Send>>;
pub type TerminalCallback = Box<dyn FnOnce(PollOutcome) -> TerminalFuture + Send>;

#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Cadence of status checks.
    pub interval: Duration,
    /// Shorter cadence while retrying a transient network failure.
    pub retry_interval: Duration,
    /// Overall deadline; reaching it resolves the poll as `TimedOut`.
    pub max_elapsed: Duration,
    /// Consecutive transient failures retried on the short cadence before
    /// falling back to the normal one.
    pub max_transient_retries: u32,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            retry_interval: Duration::from_millis(500),
            max_elapsed: Duration::from_secs(120),
            max_transient_retries: 3,
        }
    }
}

struct ActivePoll {
    callback: Arc<Mutex<Option<TerminalCallback>>>,
    task: Option<JoinHandle<()>>,
}

type Registry = Arc<Mutex<HashMap<String, ActivePoll>>>;

/// Watches payment references until the processor reports a terminal
/// status.
///
/// Polls run as detached tasks, deliberately not tied to any screen's
/// lifetime. The terminal callback fires exactly once per reference: it
/// lives in an `Option` behind a lock, and whoever takes it delivers.
/// That is the poll loop, an out-of-band `resolve`, or nobody after
/// `cancel`.
pub struct PaymentStatusPoller {
    api: Arc<dyn RemoteApi>,
    notifier: Arc<dyn Notifier>,
    config: PollerConfig,
    active: Registry,
}

impl PaymentStatusPoller {
    pub fn new(api: Arc<dyn RemoteApi>, notifier: Arc<dyn Notifier>) -> Self {
        Self::with_config(api, notifier, PollerConfig::default())
    }

    pub fn with_config(
        api: Arc<dyn RemoteApi>,
        notifier: Arc<dyn Notifier>,
        config: PollerConfig,
    ) -> Self {
        Self {
            api,
            notifier,
            config,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Begins watching `reference`. Fails with `AlreadyInProgress` while a
    /// poll for the same reference is in flight.
    pub async fn start(
        &self,
        reference: &str,
        on_terminal: TerminalCallback,
    ) -> Result<(), FlowError> {
        let mut active = self.active.lock().await;
        if active.contains_key(reference) {
            return Err(FlowError::AlreadyInProgress);
        }

        let callback = Arc::new(Mutex::new(Some(on_terminal)));
        let task = tokio::spawn(run_poll(
            Arc::clone(&self.api),
            Arc::clone(&self.notifier),
            self.config.clone(),
            reference.to_string(),
            Arc::clone(&callback),
            Arc::clone(&self.active),
        ));
        active.insert(
            reference.to_string(),
            ActivePoll {
                callback,
                task: Some(task),
            },
        );
        debug!(reference, "payment status poll started");
        Ok(())
    }

    /// Stops watching `reference`. Afterwards the terminal callback is
    /// guaranteed never to fire. Returns `false` if no poll was active.
    pub async fn cancel(&self, reference: &str) -> bool {
        let mut active = self.active.lock().await;
        let Some(mut entry) = active.remove(reference) else {
            return false;
        };
        entry.callback.lock().await.take();
        if let Some(task) = entry.task.take() {
            task.abort();
        }
        debug!(reference, "payment status poll cancelled");
        true
    }

    /// Settles a reference from an out-of-band source (push notification,
    /// deep link). Funnels through the same exactly-once guard as the poll
    /// loop, so duplicate resolutions deliver at most one callback.
    pub async fn resolve(&self, reference: &str, status: PaymentStatus) {
        let outcome = match status {
            PaymentStatus::Confirmed => PollOutcome::Confirmed,
            PaymentStatus::Failed => PollOutcome::Failed,
            PaymentStatus::Pending => {
                // Not terminal; the in-flight poll keeps going
                debug!(reference, "out-of-band status still pending");
                return;
            }
        };
        let entry = self.active.lock().await.remove(reference);
        let Some(mut entry) = entry else { return };
        if let Some(task) = entry.task.take() {
            task.abort();
        }
        info!(reference, ?outcome, "payment resolved out of band");
        deliver(&self.notifier, reference, outcome, &entry.callback).await;
    }

    /// Whether a poll for `reference` is currently in flight.
    pub async fn is_active(&self, reference: &str) -> bool {
        self.active.lock().await.contains_key(reference)
    }
}

async fn run_poll(
    api: Arc<dyn RemoteApi>,
    notifier: Arc<dyn Notifier>,
    config: PollerConfig,
    reference: String,
    callback: Arc<Mutex<Option<TerminalCallback>>>,
    active: Registry,
) {
    let started = Instant::now();
    let mut transient_failures: u32 = 0;

    let outcome = loop {
        let wait = if transient_failures > 0 && transient_failures <= config.max_transient_retries
        {
            config.retry_interval
        } else {
            config.interval
        };
        time::sleep(wait).await;

        if started.elapsed() >= config.max_elapsed {
            warn!(reference = %reference, "payment status poll timed out");
            break PollOutcome::TimedOut;
        }

        match api.check_payment_status(&reference).await {
            Ok(PaymentStatus::Pending) => {
                transient_failures = 0;
            }
            Ok(PaymentStatus::Confirmed) => break PollOutcome::Confirmed,
            Ok(PaymentStatus::Failed) => break PollOutcome::Failed,
            Err(err) => {
                // Transient by definition: only a terminal status or the
                // overall deadline ends the poll.
                transient_failures += 1;
                debug!(
                    reference = %reference,
                    %err,
                    transient_failures,
                    "status check failed, will retry"
                );
            }
        }
    };

    // Drop our registry entry before delivering so a late cancel cannot
    // abort a callback that is already running.
    active.lock().await.remove(&reference);
    deliver(&notifier, &reference, outcome, &callback).await;
}

async fn deliver(
    notifier: &Arc<dyn Notifier>,
    reference: &str,
    outcome: PollOutcome,
    callback: &Arc<Mutex<Option<TerminalCallback>>>,
) {
    let taken = callback.lock().await.take();
    let Some(on_terminal) = taken else {
        // Cancelled (or already delivered) in the meantime.
        return;
    };
    match on_terminal(outcome).await {
        DeliveryAck::HandledInApp => {
            debug!(reference, ?outcome, "terminal result handled in app");
        }
        DeliveryAck::DeferToPassiveSync => {
            info!(reference, ?outcome, "subscriber gone, deferring to passive sync");
            match outcome {
                PollOutcome::Confirmed => notifier.notify(
                    "Payment successful",
                    "Your registration has been completed.",
                ),
                PollOutcome::Failed | PollOutcome::TimedOut => notifier.notify(
                    "Payment update",
                    "We could not confirm your payment. Please check back.",
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::stub::{InMemoryRemoteApi, LogNotifier};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    fn poller(api: &InMemoryRemoteApi) -> PaymentStatusPoller {
        PaymentStatusPoller::new(Arc::new(api.clone()), Arc::new(LogNotifier))
    }

    fn counting_callback(
        count: Arc<AtomicUsize>,
        done: oneshot::Sender<PollOutcome>,
    ) -> TerminalCallback {
        Box::new(move |outcome| {
            Box::pin(async move {
                count.fetch_add(1, Ordering::SeqCst);
                let _ = done.send(outcome);
                DeliveryAck::HandledInApp
            })
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirmed_status_delivers_once() {
        let api = InMemoryRemoteApi::new();
        let poller = poller(&api);
        api.queue_status("pay_1", PaymentStatus::Confirmed).await;

        let count = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();
        poller
            .start("pay_1", counting_callback(Arc::clone(&count), tx))
            .await
            .unwrap();

        assert_eq!(rx.await.unwrap(), PollOutcome::Confirmed);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // A duplicate out-of-band resolution finds nothing to deliver
        poller.resolve("pay_1", PaymentStatus::Confirmed).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!poller.is_active("pay_1").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_start_is_refused() {
        let api = InMemoryRemoteApi::new();
        let poller = poller(&api);

        let count = Arc::new(AtomicUsize::new(0));
        let (tx, _rx) = oneshot::channel();
        poller
            .start("pay_1", counting_callback(Arc::clone(&count), tx))
            .await
            .unwrap();

        let (tx2, _rx2) = oneshot::channel();
        let err = poller
            .start("pay_1", counting_callback(Arc::clone(&count), tx2))
            .await
            .unwrap_err();
        assert_eq!(err, FlowError::AlreadyInProgress);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_suppresses_callback() {
        let api = InMemoryRemoteApi::new();
        let poller = poller(&api);
        // No status queued: the processor stays pending forever

        let count = Arc::new(AtomicUsize::new(0));
        let (tx, _rx) = oneshot::channel();
        poller
            .start("pay_1", counting_callback(Arc::clone(&count), tx))
            .await
            .unwrap();

        assert!(poller.cancel("pay_1").await);
        assert!(!poller.is_active("pay_1").await);

        // Even after the original deadline has long passed
        time::sleep(Duration::from_secs(300)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_band_resolution_wins_the_race() {
        let api = InMemoryRemoteApi::new();
        let poller = poller(&api);

        let count = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();
        poller
            .start("pay_1", counting_callback(Arc::clone(&count), tx))
            .await
            .unwrap();

        poller.resolve("pay_1", PaymentStatus::Confirmed).await;
        poller.resolve("pay_1", PaymentStatus::Confirmed).await;

        assert_eq!(rx.await.unwrap(), PollOutcome::Confirmed);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_resolution_leaves_the_poll_running() {
        let api = InMemoryRemoteApi::new();
        let poller = poller(&api);

        let count = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();
        poller
            .start("pay_1", counting_callback(Arc::clone(&count), tx))
            .await
            .unwrap();

        // A push that merely echoes the current status must not settle
        poller.resolve("pay_1", PaymentStatus::Pending).await;
        assert!(poller.is_active("pay_1").await);
        assert_eq!(count.load(Ordering::SeqCst), 0);

        // The poll still reaches its own terminal status afterwards
        api.queue_status("pay_1", PaymentStatus::Confirmed).await;
        assert_eq!(rx.await.unwrap(), PollOutcome::Confirmed);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_do_not_terminate_the_poll() {
        let api = InMemoryRemoteApi::new();
        let poller = poller(&api);
        api.queue_status_error("pay_1").await;
        api.queue_status_error("pay_1").await;
        api.queue_status("pay_1", PaymentStatus::Confirmed).await;

        let count = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();
        poller
            .start("pay_1", counting_callback(Arc::clone(&count), tx))
            .await
            .unwrap();

        assert_eq!(rx.await.unwrap(), PollOutcome::Confirmed);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_resolves_as_timeout() {
        let api = InMemoryRemoteApi::new();
        let config = PollerConfig {
            interval: Duration::from_secs(1),
            max_elapsed: Duration::from_secs(5),
            ..PollerConfig::default()
        };
        let poller = PaymentStatusPoller::with_config(
            Arc::new(api.clone()),
            Arc::new(LogNotifier),
            config,
        );

        let count = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel();
        poller
            .start("pay_1", counting_callback(Arc::clone(&count), tx))
            .await
            .unwrap();

        assert_eq!(rx.await.unwrap(), PollOutcome::TimedOut);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!poller.is_active("pay_1").await);
    }
}
