//! Live Query Subscriptions
//!
//! Turns a read plus a set of notifier topics into a stream of fresh results.
//! A worker task owns the query: it runs it once for the initial result, then
//! again after every notification on any of the topics. There is no polling.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::notifier::{ChangeNotifier, SubscriptionHandle, Topic};

/// Lifecycle of a live query. There is no way out of `Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveState {
    Initializing,
    Active,
    Cancelled,
}

impl LiveState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LiveState::Initializing,
            1 => LiveState::Active,
            _ => LiveState::Cancelled,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiveOptions {
    /// Skip a re-execution whose result equals the last one emitted.
    pub suppress_duplicates: bool,
}

impl Default for LiveOptions {
    fn default() -> Self {
        Self {
            suppress_duplicates: true,
        }
    }
}

impl From<&StoreConfig> for LiveOptions {
    fn from(config: &StoreConfig) -> Self {
        Self {
            suppress_duplicates: config.suppress_duplicates,
        }
    }
}

/// State shared between the worker and the consumer's handle.
struct LiveControl {
    state: AtomicU8,
    cancel: CancellationToken,
    subscriptions: Mutex<Vec<SubscriptionHandle>>,
}

impl LiveControl {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(LiveState::Initializing as u8),
            cancel: CancellationToken::new(),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    fn state(&self) -> LiveState {
        LiveState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Initializing → Active. Fails if the query was cancelled meanwhile.
    fn activate(&self) -> bool {
        self.state
            .compare_exchange(
                LiveState::Initializing as u8,
                LiveState::Active as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Move to Cancelled, stop the worker and drop notifier registrations.
    fn cancel(&self) {
        let previous = self
            .state
            .swap(LiveState::Cancelled as u8, Ordering::AcqRel);
        self.cancel.cancel();
        let handles: Vec<SubscriptionHandle> = self
            .subscriptions
            .lock()
            .map(|mut subs| subs.drain(..).collect())
            .unwrap_or_default();
        for handle in &handles {
            handle.cancel();
        }
        if LiveState::from_u8(previous) != LiveState::Cancelled {
            debug!("Live query cancelled");
        }
    }
}

/// A live query that has been started but may not have produced its
/// initial result yet.
pub struct LiveQuery<T> {
    initial: oneshot::Receiver<StoreResult<T>>,
    updates: LiveUpdates<T>,
}

impl<T> LiveQuery<T>
where
    T: Clone + PartialEq + Send + 'static,
{
    /// Subscribe to `topics` and spawn the worker. The initial execution runs
    /// in the background; await it with [`LiveQuery::initial`].
    pub fn start<F, Fut>(
        notifier: &ChangeNotifier,
        topics: &[Topic],
        options: LiveOptions,
        query: F,
    ) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = StoreResult<T>> + Send + 'static,
    {
        let control = Arc::new(LiveControl::new());
        let (wake_tx, wake_rx) = mpsc::unbounded_channel::<Topic>();
        let (updates_tx, updates_rx) = mpsc::unbounded_channel::<StoreResult<T>>();
        let (initial_tx, initial_rx) = oneshot::channel();

        // Subscribed before the initial read so a write that lands in between
        // still triggers a re-read.
        let handles: Vec<SubscriptionHandle> = topics
            .iter()
            .map(|topic| {
                let wake_tx = wake_tx.clone();
                notifier.subscribe(*topic, move |topic| {
                    let _ = wake_tx.send(topic);
                })
            })
            .collect();
        drop(wake_tx);
        if let Ok(mut subs) = control.subscriptions.lock() {
            subs.extend(handles);
        }

        tokio::spawn(run_live_query(
            query,
            options,
            control.clone(),
            wake_rx,
            initial_tx,
            updates_tx,
        ));

        Self {
            initial: initial_rx,
            updates: LiveUpdates {
                rx: updates_rx,
                control,
            },
        }
    }

    /// Wait for the initial result. On success the query is `Active`.
    pub async fn initial(self) -> StoreResult<(T, LiveUpdates<T>)> {
        let Self { initial, updates } = self;
        match initial.await {
            Ok(Ok(value)) => Ok((value, updates)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(StoreError::Subscription {
                message: "live query cancelled before its first result".to_string(),
            }),
        }
    }

    pub fn state(&self) -> LiveState {
        self.updates.state()
    }

    /// Cancel before (or after) the initial result. An in-flight execution's
    /// result is discarded.
    pub fn cancel(&self) {
        self.updates.cancel();
    }
}

/// Run `query` once, then again on every notification for `topics`.
///
/// Returns the initial result together with the stream of later results.
pub async fn observe<T, F, Fut>(
    notifier: &ChangeNotifier,
    topics: &[Topic],
    options: LiveOptions,
    query: F,
) -> StoreResult<(T, LiveUpdates<T>)>
where
    T: Clone + PartialEq + Send + 'static,
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = StoreResult<T>> + Send + 'static,
{
    LiveQuery::start(notifier, topics, options, query)
        .initial()
        .await
}

async fn run_live_query<T, F, Fut>(
    query: F,
    options: LiveOptions,
    control: Arc<LiveControl>,
    mut wake_rx: mpsc::UnboundedReceiver<Topic>,
    initial_tx: oneshot::Sender<StoreResult<T>>,
    updates_tx: mpsc::UnboundedSender<StoreResult<T>>,
) where
    T: Clone + PartialEq + Send + 'static,
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = StoreResult<T>> + Send + 'static,
{
    let cancel = control.cancel.clone();

    let first = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            control.cancel();
            return;
        }
        result = query() => result,
    };

    let mut last = match first {
        Ok(value) => {
            if !control.activate() {
                return;
            }
            let _ = initial_tx.send(Ok(value.clone()));
            value
        }
        Err(e) => {
            control.cancel();
            let _ = initial_tx.send(Err(e));
            return;
        }
    };

    loop {
        let topic = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            topic = wake_rx.recv() => match topic {
                Some(topic) => topic,
                // Every notifier registration is gone: store teardown.
                None => break,
            },
        };
        trace!(topic = %topic, "Re-running live query");

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = query() => result,
        };
        if cancel.is_cancelled() {
            break;
        }

        let event = match result {
            Ok(value) => {
                if options.suppress_duplicates && value == last {
                    trace!("Live query result unchanged, suppressed");
                    continue;
                }
                last = value.clone();
                Ok(value)
            }
            Err(e) => {
                warn!(error = %e, "Live query re-execution failed");
                Err(StoreError::subscription(&e))
            }
        };

        if updates_tx.send(event).is_err() {
            break;
        }
    }

    control.cancel();
}

/// Stream of re-executed results. Ends once the query is cancelled or the
/// store is torn down. Dropping it cancels the query.
pub struct LiveUpdates<T> {
    rx: mpsc::UnboundedReceiver<StoreResult<T>>,
    control: Arc<LiveControl>,
}

impl<T> LiveUpdates<T> {
    /// Next result, or `None` once cancelled. Failed re-executions arrive as
    /// `Err(StoreError::Subscription { .. })` and the stream keeps going.
    pub async fn next(&mut self) -> Option<StoreResult<T>> {
        self.rx.recv().await
    }

    pub fn state(&self) -> LiveState {
        self.control.state()
    }

    /// Stop re-executing and deregister from the notifier. Idempotent.
    pub fn cancel(&self) {
        self.control.cancel();
    }
}

impl<T> futures::Stream for LiveUpdates<T> {
    type Item = StoreResult<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl<T> Drop for LiveUpdates<T> {
    fn drop(&mut self) {
        self.control.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::time::timeout;

    fn counter_query(
        counter: Arc<AtomicUsize>,
    ) -> impl Fn() -> futures::future::Ready<StoreResult<usize>> + Send + 'static {
        move || futures::future::ready(Ok(counter.load(Ordering::SeqCst)))
    }

    async fn next_within<T>(updates: &mut LiveUpdates<T>) -> Option<StoreResult<T>> {
        timeout(Duration::from_millis(200), updates.next())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn initial_result_then_updates_on_publish() {
        let notifier = ChangeNotifier::new();
        let counter = Arc::new(AtomicUsize::new(1));

        let (initial, mut updates) = observe(
            &notifier,
            &[Topic::ItemsChanged],
            LiveOptions::default(),
            counter_query(counter.clone()),
        )
        .await
        .unwrap();
        assert_eq!(initial, 1);
        assert_eq!(updates.state(), LiveState::Active);

        counter.store(2, Ordering::SeqCst);
        notifier.publish(Topic::ItemsChanged);
        assert_eq!(next_within(&mut updates).await.unwrap().unwrap(), 2);
    }

    #[tokio::test]
    async fn identical_results_are_suppressed() {
        let notifier = ChangeNotifier::new();
        let counter = Arc::new(AtomicUsize::new(1));
        let (_, mut updates) = observe(
            &notifier,
            &[Topic::ItemsChanged],
            LiveOptions::default(),
            counter_query(counter.clone()),
        )
        .await
        .unwrap();

        notifier.publish(Topic::ItemsChanged);
        assert!(next_within(&mut updates).await.is_none());
        assert_eq!(updates.state(), LiveState::Active);
    }

    #[tokio::test]
    async fn identical_results_emitted_without_suppression() {
        let notifier = ChangeNotifier::new();
        let counter = Arc::new(AtomicUsize::new(1));
        let options = LiveOptions {
            suppress_duplicates: false,
        };
        let (_, mut updates) =
            observe(&notifier, &[Topic::ItemsChanged], options, counter_query(counter))
                .await
                .unwrap();

        notifier.publish(Topic::ItemsChanged);
        assert_eq!(next_within(&mut updates).await.unwrap().unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_reexecution_is_an_event_not_a_crash() {
        let notifier = ChangeNotifier::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let query_calls = calls.clone();
        let (initial, mut failing) = observe(
            &notifier,
            &[Topic::ItemsChanged],
            LiveOptions::default(),
            move || {
                let call = query_calls.fetch_add(1, Ordering::SeqCst);
                futures::future::ready(if call == 1 {
                    Err(StoreError::Closed)
                } else {
                    Ok(call)
                })
            },
        )
        .await
        .unwrap();
        assert_eq!(initial, 0);

        let counter = Arc::new(AtomicUsize::new(10));
        let (_, mut healthy) = observe(
            &notifier,
            &[Topic::ItemsChanged],
            LiveOptions::default(),
            counter_query(counter.clone()),
        )
        .await
        .unwrap();

        counter.store(11, Ordering::SeqCst);
        notifier.publish(Topic::ItemsChanged);

        let err = next_within(&mut failing).await.unwrap().unwrap_err();
        assert!(matches!(err, StoreError::Subscription { .. }));
        assert_eq!(next_within(&mut healthy).await.unwrap().unwrap(), 11);

        // The failing subscription keeps working afterwards.
        notifier.publish(Topic::ItemsChanged);
        assert_eq!(next_within(&mut failing).await.unwrap().unwrap(), 2);
    }

    #[tokio::test]
    async fn cancel_stops_updates_and_deregisters() {
        let notifier = ChangeNotifier::new();
        let counter = Arc::new(AtomicUsize::new(1));
        let (_, mut updates) = observe(
            &notifier,
            &[Topic::ItemsChanged],
            LiveOptions::default(),
            counter_query(counter.clone()),
        )
        .await
        .unwrap();
        assert_eq!(notifier.subscriber_count(Topic::ItemsChanged), 1);

        updates.cancel();
        updates.cancel();
        assert_eq!(updates.state(), LiveState::Cancelled);
        assert_eq!(notifier.subscriber_count(Topic::ItemsChanged), 0);

        counter.store(2, Ordering::SeqCst);
        notifier.publish(Topic::ItemsChanged);
        assert!(updates.next().await.is_none());
    }

    #[tokio::test]
    async fn dropping_updates_cancels() {
        let notifier = ChangeNotifier::new();
        let counter = Arc::new(AtomicUsize::new(1));
        let (_, updates) = observe(
            &notifier,
            &[Topic::ItemsChanged],
            LiveOptions::default(),
            counter_query(counter),
        )
        .await
        .unwrap();

        drop(updates);
        assert_eq!(notifier.subscriber_count(Topic::ItemsChanged), 0);
    }

    #[tokio::test]
    async fn cancel_before_first_result_discards_it() {
        let notifier = ChangeNotifier::new();
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let release_rx = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));

        let live = LiveQuery::start(
            &notifier,
            &[Topic::ItemsChanged],
            LiveOptions::default(),
            move || {
                let release_rx = release_rx.clone();
                async move {
                    if let Some(rx) = release_rx.lock().await.take() {
                        let _ = rx.await;
                    }
                    Ok(1usize)
                }
            },
        );
        assert_eq!(live.state(), LiveState::Initializing);

        live.cancel();
        let _ = release_tx.send(());

        assert_eq!(live.state(), LiveState::Cancelled);
        let err = live.initial().await.err().unwrap();
        assert!(matches!(err, StoreError::Subscription { .. }));
        assert_eq!(notifier.subscriber_count(Topic::ItemsChanged), 0);
    }

    #[tokio::test]
    async fn failed_initial_query_is_returned_directly() {
        let notifier = ChangeNotifier::new();
        let result = observe::<usize, _, _>(
            &notifier,
            &[Topic::ItemsChanged],
            LiveOptions::default(),
            || futures::future::ready(Err(StoreError::Closed)),
        )
        .await;

        assert!(matches!(result, Err(StoreError::Closed)));
        assert_eq!(notifier.subscriber_count(Topic::ItemsChanged), 0);
    }

    #[tokio::test]
    async fn notifier_shutdown_ends_the_stream() {
        let notifier = ChangeNotifier::new();
        let counter = Arc::new(AtomicUsize::new(1));
        let (_, mut updates) = observe(
            &notifier,
            &[Topic::ItemsChanged],
            LiveOptions::default(),
            counter_query(counter),
        )
        .await
        .unwrap();

        notifier.shutdown();
        assert!(updates.next().await.is_none());
        assert_eq!(updates.state(), LiveState::Cancelled);
    }
}
