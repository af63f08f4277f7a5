//! Status propagation for one payment session.
//!
//! Two independent delivery paths feed a single reducer task:
//!
//! - **push**: the server's WebSocket status stream, reconnected with
//!   capped exponential backoff until too many consecutive attempts fail;
//! - **poll**: a fixed-interval status read that keeps running whether or
//!   not push is healthy.
//!
//! Both paths only send snapshots into an mpsc channel. The reducer task
//! owns the [`PaymentStateMachine`], publishes every change on a `watch`
//! channel, runs the success callback through the [`EntitlementLedger`],
//! and tears everything down when a terminal state is entered.

use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::ClientError;
use crate::checkout::{DisplayState, EntitlementLedger, PaymentStateMachine};
use crate::objects::payment::PaymentSessionResponse;

/// Snapshots pushed by the server for one session.
pub type StatusStream =
    Pin<Box<dyn Stream<Item = Result<PaymentSessionResponse, ClientError>> + Send>>;

/// Where session snapshots come from.
#[async_trait]
pub trait StatusSource: Send + Sync + 'static {
    /// Read the current snapshot (poll path).
    async fn fetch(&self, id: Uuid) -> Result<PaymentSessionResponse, ClientError>;

    /// Open a change stream for the session (push path).
    async fn subscribe(&self, id: Uuid) -> Result<StatusStream, ClientError>;
}

/// Backoff for re-opening a dropped push stream.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fractional jitter applied in both directions, e.g. `0.2` for ±20 %.
    pub jitter: f64,
    /// Consecutive failed subscription attempts before push is abandoned.
    pub max_failures: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: 0.2,
            max_failures: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Un-jittered delay before reconnect attempt number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// [`delay`](Self::delay) with random jitter applied.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay(attempt);
        if self.jitter <= 0.0 {
            return delay;
        }
        let spread = rand::rng().random_range(-self.jitter..=self.jitter);
        delay.mul_f64((1.0 + spread).max(0.0))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WatcherConfig {
    pub poll_interval: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(12),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// What the consumer renders.
#[derive(Debug, Clone, PartialEq)]
pub struct WatcherSnapshot {
    pub state: DisplayState,
    pub session: PaymentSessionResponse,
}

#[derive(Debug)]
enum Delivery {
    Push(PaymentSessionResponse),
    Poll(PaymentSessionResponse),
}

/// Live view of one payment session.
///
/// Dropping the watcher tears it down. [`teardown`](Self::teardown) may be
/// called any number of times.
pub struct PaymentWatcher {
    session_id: Uuid,
    snapshot_rx: watch::Receiver<WatcherSnapshot>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PaymentWatcher {
    /// Start watching `initial`, normally the session creation response.
    ///
    /// `on_success` runs at most once per session id across every watcher
    /// sharing `ledger`, and only for `finished` with `is_processed`.
    pub fn spawn<S, F>(
        source: Arc<S>,
        initial: PaymentSessionResponse,
        config: WatcherConfig,
        ledger: Arc<EntitlementLedger>,
        on_success: F,
    ) -> Self
    where
        S: StatusSource + ?Sized,
        F: Fn(&PaymentSessionResponse) + Send + Sync + 'static,
    {
        let session_id = initial.id;
        let mut machine = PaymentStateMachine::new(session_id);
        let step = machine.apply(&initial);
        if step.fire_success {
            ledger.grant_once(session_id, || on_success(&initial));
        }

        let (snapshot_tx, snapshot_rx) = watch::channel(WatcherSnapshot {
            state: step.state.clone(),
            session: initial,
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shutdown_tx = Arc::new(shutdown_tx);

        let watcher = Self {
            session_id,
            snapshot_rx,
            shutdown_tx: shutdown_tx.clone(),
            tasks: Mutex::new(Vec::new()),
        };
        if machine.is_locked() {
            watcher.teardown();
            return watcher;
        }

        let (delivery_tx, delivery_rx) = mpsc::channel(32);
        let reducer = tokio::spawn(run_reducer(
            machine,
            delivery_rx,
            snapshot_tx,
            shutdown_tx,
            shutdown_rx.clone(),
            ledger,
            on_success,
        ));
        let push = tokio::spawn(run_push(
            source.clone(),
            session_id,
            config.reconnect,
            delivery_tx.clone(),
            shutdown_rx.clone(),
        ));
        let poll = tokio::spawn(run_poll(
            source,
            session_id,
            config.poll_interval,
            delivery_tx,
            shutdown_rx,
        ));
        watcher.lock_tasks().extend([reducer, push, poll]);
        watcher
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// The latest published snapshot.
    pub fn current(&self) -> WatcherSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    /// A receiver notified on every display change.
    pub fn subscribe(&self) -> watch::Receiver<WatcherSnapshot> {
        self.snapshot_rx.clone()
    }

    /// Whether the delivery paths are still live.
    pub fn is_running(&self) -> bool {
        !*self.shutdown_tx.borrow()
    }

    /// Wait until a terminal state is displayed. Returns `None` if the
    /// watcher was torn down first.
    pub async fn wait_terminal(&self) -> Option<WatcherSnapshot> {
        let mut rx = self.snapshot_rx.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::select! {
            biased;
            snapshot = rx.wait_for(|s| s.state.is_terminal()) => {
                snapshot.ok().map(|s| s.clone())
            }
            _ = shutdown.wait_for(|stop| *stop) => {
                let snapshot = self.current();
                snapshot.state.is_terminal().then_some(snapshot)
            }
        }
    }

    /// Stop both delivery paths and the reducer.
    pub fn teardown(&self) {
        self.shutdown_tx.send_replace(true);
        for handle in self.lock_tasks().drain(..) {
            handle.abort();
        }
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl Drop for PaymentWatcher {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Resolves once shutdown is requested or the sender is gone.
async fn stopped(shutdown_rx: &mut watch::Receiver<bool>) {
    let _ = shutdown_rx.wait_for(|stop| *stop).await;
}

async fn run_reducer<F>(
    mut machine: PaymentStateMachine,
    mut delivery_rx: mpsc::Receiver<Delivery>,
    snapshot_tx: watch::Sender<WatcherSnapshot>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    mut shutdown_rx: watch::Receiver<bool>,
    ledger: Arc<EntitlementLedger>,
    on_success: F,
) where
    F: Fn(&PaymentSessionResponse) + Send + Sync + 'static,
{
    let session_id = machine.session_id();
    loop {
        let delivery = tokio::select! {
            biased;
            _ = stopped(&mut shutdown_rx) => break,
            delivery = delivery_rx.recv() => match delivery {
                Some(delivery) => delivery,
                None => break,
            },
        };
        let (path, session) = match delivery {
            Delivery::Push(s) => ("push", s),
            Delivery::Poll(s) => ("poll", s),
        };

        let step = machine.apply(&session);
        if !step.changed {
            continue;
        }
        debug!(%session_id, path, status = %session.status, "Payment display state changed");
        snapshot_tx.send_replace(WatcherSnapshot {
            state: step.state.clone(),
            session: session.clone(),
        });
        if step.fire_success {
            ledger.grant_once(session_id, || on_success(&session));
        }
        if step.entered_terminal {
            info!(%session_id, status = %session.status, "Payment reached a terminal state");
            shutdown_tx.send_replace(true);
            break;
        }
    }
}

async fn run_push<S: StatusSource + ?Sized>(
    source: Arc<S>,
    session_id: Uuid,
    policy: ReconnectPolicy,
    delivery_tx: mpsc::Sender<Delivery>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut failures: u32 = 0;
    loop {
        let subscribed = tokio::select! {
            biased;
            _ = stopped(&mut shutdown_rx) => return,
            subscribed = source.subscribe(session_id) => subscribed,
        };

        match subscribed {
            Ok(mut stream) => {
                failures = 0;
                loop {
                    let item = tokio::select! {
                        biased;
                        _ = stopped(&mut shutdown_rx) => return,
                        item = stream.next() => item,
                    };
                    match item {
                        Some(Ok(session)) => {
                            if delivery_tx.send(Delivery::Push(session)).await.is_err() {
                                return;
                            }
                        }
                        Some(Err(e)) => {
                            debug!(%session_id, error = %e, "Status stream error");
                            break;
                        }
                        None => break,
                    }
                }
            }
            Err(e) => {
                failures += 1;
                if failures >= policy.max_failures {
                    warn!(
                        %session_id,
                        error = %e,
                        attempts = failures,
                        "Giving up on status stream, relying on polling"
                    );
                    return;
                }
                debug!(%session_id, error = %e, attempt = failures, "Status stream subscribe failed");
            }
        }

        let delay = policy.jittered_delay(failures.saturating_sub(1));
        tokio::select! {
            biased;
            _ = stopped(&mut shutdown_rx) => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn run_poll<S: StatusSource + ?Sized>(
    source: Arc<S>,
    session_id: Uuid,
    interval: Duration,
    delivery_tx: mpsc::Sender<Delivery>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = stopped(&mut shutdown_rx) => return,
            _ = ticker.tick() => {}
        }
        match source.fetch(session_id).await {
            Ok(session) => {
                if delivery_tx.send(Delivery::Poll(session)).await.is_err() {
                    return;
                }
            }
            // Retried on the next tick.
            Err(e) => debug!(%session_id, error = %e, "Status poll failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::currency::CryptoCurrency;
    use crate::objects::payment::{PaymentStatus, PaymentType};
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn session(id: Uuid, status: PaymentStatus, is_processed: bool) -> PaymentSessionResponse {
        PaymentSessionResponse {
            id,
            pay_address: Some("0xpay".to_owned()),
            pay_amount: Some(Decimal::new(1, 2)),
            pay_currency: CryptoCurrency::Eth,
            usd_amount: Decimal::new(25, 0),
            status,
            payment_type: PaymentType::Tip,
            created_at: 0,
            expires_at: 1800,
            tx_hash: None,
            is_processed,
        }
    }

    /// Scripted source: `fetch` returns `current`, `subscribe` hands out a
    /// channel-backed stream while `push_ok` is set.
    struct FakeSource {
        current: Mutex<PaymentSessionResponse>,
        push_ok: bool,
        fetches: AtomicUsize,
        subscribes: AtomicUsize,
        push_tx: Mutex<Vec<mpsc::UnboundedSender<PaymentSessionResponse>>>,
    }

    impl FakeSource {
        fn new(initial: PaymentSessionResponse, push_ok: bool) -> Arc<Self> {
            Arc::new(Self {
                current: Mutex::new(initial),
                push_ok,
                fetches: AtomicUsize::new(0),
                subscribes: AtomicUsize::new(0),
                push_tx: Mutex::new(Vec::new()),
            })
        }

        fn set(&self, status: PaymentStatus, is_processed: bool) {
            let mut current = self.current.lock().unwrap();
            current.status = status;
            current.is_processed = is_processed;
        }

        fn push(&self, status: PaymentStatus, is_processed: bool) {
            self.set(status, is_processed);
            let snapshot = self.current.lock().unwrap().clone();
            for tx in self.push_tx.lock().unwrap().iter() {
                let _ = tx.send(snapshot.clone());
            }
        }
    }

    #[async_trait]
    impl StatusSource for FakeSource {
        async fn fetch(&self, _id: Uuid) -> Result<PaymentSessionResponse, ClientError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.current.lock().unwrap().clone())
        }

        async fn subscribe(&self, _id: Uuid) -> Result<StatusStream, ClientError> {
            self.subscribes.fetch_add(1, Ordering::SeqCst);
            if !self.push_ok {
                return Err(ClientError::Stream {
                    code: 1011,
                    reason: "unavailable".to_owned(),
                });
            }
            let (tx, rx) = mpsc::unbounded_channel();
            self.push_tx.lock().unwrap().push(tx);
            let stream = futures_util::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|s| (Ok(s), rx))
            });
            Ok(Box::pin(stream))
        }
    }

    fn counter() -> (Arc<AtomicUsize>, impl Fn(&PaymentSessionResponse) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = count.clone();
        (count, move |_: &PaymentSessionResponse| {
            inner.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn reconnect_delays_double_and_cap() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(500));
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(3), Duration::from_secs(4));
        assert_eq!(policy.delay(10), Duration::from_secs(30));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(30));
        for attempt in 0..8 {
            let jittered = policy.jittered_delay(attempt);
            let base = policy.delay(attempt);
            assert!(jittered >= base.mul_f64(0.8) && jittered <= base.mul_f64(1.2));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn push_and_poll_duplicates_fire_success_once() {
        let id = Uuid::new_v4();
        let source = FakeSource::new(session(id, PaymentStatus::Waiting, false), true);
        let (count, on_success) = counter();
        let watcher = PaymentWatcher::spawn(
            source.clone(),
            session(id, PaymentStatus::Waiting, false),
            WatcherConfig::default(),
            Arc::new(EntitlementLedger::new()),
            on_success,
        );

        // Let the push task subscribe.
        tokio::time::sleep(Duration::from_millis(10)).await;
        source.push(PaymentStatus::Confirming, false);
        source.push(PaymentStatus::Finished, true);
        source.push(PaymentStatus::Finished, true);

        let done = tokio::time::timeout(Duration::from_secs(2), watcher.wait_terminal())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.state, DisplayState::Finished);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(!watcher.is_running());

        // The poll path would deliver the same snapshot; nothing is listening.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(source.fetches.load(Ordering::SeqCst), 0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_converges_when_push_never_connects() {
        let id = Uuid::new_v4();
        let source = FakeSource::new(session(id, PaymentStatus::Waiting, false), false);
        let (count, on_success) = counter();
        let watcher = PaymentWatcher::spawn(
            source.clone(),
            session(id, PaymentStatus::Waiting, false),
            WatcherConfig::default(),
            Arc::new(EntitlementLedger::new()),
            on_success,
        );

        source.set(PaymentStatus::Finished, true);
        let done = tokio::time::timeout(Duration::from_secs(13), watcher.wait_terminal())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.state, DisplayState::Finished);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(source.subscribes.load(Ordering::SeqCst), 5);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_is_idempotent_and_stops_polling() {
        let id = Uuid::new_v4();
        let source = FakeSource::new(session(id, PaymentStatus::Waiting, false), false);
        let (count, on_success) = counter();
        let watcher = PaymentWatcher::spawn(
            source.clone(),
            session(id, PaymentStatus::Waiting, false),
            WatcherConfig::default(),
            Arc::new(EntitlementLedger::new()),
            on_success,
        );

        tokio::time::sleep(Duration::from_secs(13)).await;
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);

        watcher.teardown();
        watcher.teardown();
        assert!(!watcher.is_running());

        source.set(PaymentStatus::Finished, true);
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(watcher.current().state, DisplayState::Waiting);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert!(watcher.wait_terminal().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_countdown_alone_does_not_end_the_watch() {
        let id = Uuid::new_v4();
        let source = FakeSource::new(session(id, PaymentStatus::Waiting, false), false);
        let (_, on_success) = counter();
        let watcher = PaymentWatcher::spawn(
            source.clone(),
            session(id, PaymentStatus::Waiting, false),
            WatcherConfig::default(),
            Arc::new(EntitlementLedger::new()),
            on_success,
        );

        // Well past `expires_at` with the server still reporting `waiting`.
        tokio::time::sleep(Duration::from_secs(1900)).await;
        assert_eq!(watcher.current().state, DisplayState::Waiting);
        assert!(watcher.is_running());

        source.set(PaymentStatus::Expired, false);
        let done = tokio::time::timeout(Duration::from_secs(13), watcher.wait_terminal())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.state, DisplayState::Expired);
    }

    #[tokio::test]
    async fn dropping_the_watcher_stops_it() {
        let id = Uuid::new_v4();
        let source = FakeSource::new(session(id, PaymentStatus::Waiting, false), true);
        let (_, on_success) = counter();
        let watcher = PaymentWatcher::spawn(
            source.clone(),
            session(id, PaymentStatus::Waiting, false),
            WatcherConfig::default(),
            Arc::new(EntitlementLedger::new()),
            on_success,
        );
        let mut updates = watcher.subscribe();
        drop(watcher);
        // The reducer owned the only sender; it is gone once aborted.
        assert!(updates.changed().await.is_err());
    }
}
