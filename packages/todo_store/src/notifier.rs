//! Change Notifier
//!
//! In-process topic publish/subscribe. Each subscription owns an unbounded
//! queue drained by its own task, so `publish` never waits on handler work and
//! every subscriber sees notifications in publish order.

use std::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Change classes published by the store.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub enum Topic {
    ItemsChanged,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::ItemsChanged => "items-changed",
        }
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct SubscriptionId(pub u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

thread_local! {
    /// Set while a handler runs on this thread.
    static IN_HANDLER: Cell<bool> = const { Cell::new(false) };
}

struct HandlerScope;

impl HandlerScope {
    fn enter() -> Self {
        IN_HANDLER.with(|flag| flag.set(true));
        HandlerScope
    }
}

impl Drop for HandlerScope {
    fn drop(&mut self) {
        IN_HANDLER.with(|flag| flag.set(false));
    }
}

/// Per-subscription switch. The dispatch task holds `running` while it checks
/// `active` and calls the handler, so once `close` returns the handler will
/// not run again.
struct Gate {
    active: AtomicBool,
    running: Mutex<()>,
}

impl Gate {
    fn open() -> Self {
        Self {
            active: AtomicBool::new(true),
            running: Mutex::new(()),
        }
    }

    fn is_open(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn run(&self) -> Option<MutexGuard<'_, ()>> {
        let guard = self
            .running
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        self.is_open().then_some(guard)
    }

    /// Returns false if already closed.
    fn close(&self) -> bool {
        if !self.active.swap(false, Ordering::AcqRel) {
            return false;
        }
        // From inside a handler the in-flight call may be our own; waiting
        // would deadlock.
        if !IN_HANDLER.with(Cell::get) {
            drop(
                self.running
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
            );
        }
        true
    }
}

struct Registration {
    topic: Topic,
    tx: mpsc::UnboundedSender<Topic>,
    gate: Arc<Gate>,
}

#[derive(Default)]
struct Registry {
    subscriptions: Mutex<HashMap<SubscriptionId, Registration>>,
    next_id: AtomicU64,
}

impl Registry {
    fn lock(&self) -> MutexGuard<'_, HashMap<SubscriptionId, Registration>> {
        // Handlers never run under this lock, so a poisoned guard still holds
        // a consistent map.
        self.subscriptions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remove(&self, id: SubscriptionId) -> bool {
        self.lock().remove(&id).is_some()
    }
}

/// Topic-based notifier shared by the store and its live queries.
#[derive(Clone, Default)]
pub struct ChangeNotifier {
    registry: Arc<Registry>,
}

impl ChangeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `topic`.
    ///
    /// The handler runs on a dedicated task, once per publish, in publish
    /// order. Must be called from within a tokio runtime.
    pub fn subscribe<F>(&self, topic: Topic, mut handler: F) -> SubscriptionHandle
    where
        F: FnMut(Topic) + Send + 'static,
    {
        let id = SubscriptionId(self.registry.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, mut rx) = mpsc::unbounded_channel::<Topic>();
        let gate = Arc::new(Gate::open());

        let dispatch_gate = gate.clone();
        tokio::spawn(async move {
            while let Some(topic) = rx.recv().await {
                // Notifications queued before a cancel are dropped, not delivered.
                let Some(_running) = dispatch_gate.run() else {
                    break;
                };
                let _scope = HandlerScope::enter();
                handler(topic);
            }
            trace!("Dispatch task for {} finished", id);
        });

        self.registry.lock().insert(
            id,
            Registration {
                topic,
                tx,
                gate: gate.clone(),
            },
        );
        debug!(subscription = %id, topic = %topic, "Subscribed");

        SubscriptionHandle {
            id,
            topic,
            gate,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Queue a notification for every handler currently registered on
    /// `topic`. Returns the number of handlers notified.
    pub fn publish(&self, topic: Topic) -> usize {
        let subscriptions = self.registry.lock();
        let delivered = subscriptions
            .values()
            .filter(|reg| reg.topic == topic && reg.gate.is_open())
            .filter(|reg| reg.tx.send(topic).is_ok())
            .count();
        trace!(topic = %topic, delivered, "Published");
        delivered
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.registry
            .lock()
            .values()
            .filter(|reg| reg.topic == topic)
            .count()
    }

    /// Deregister every subscription. Used on store teardown.
    pub fn shutdown(&self) -> usize {
        let drained: Vec<Registration> = self
            .registry
            .lock()
            .drain()
            .map(|(_, reg)| reg)
            .collect();
        for reg in &drained {
            reg.gate.close();
        }
        debug!("Notifier shut down, dropped {} subscriptions", drained.len());
        drained.len()
    }
}

/// Handle returned by `ChangeNotifier::subscribe`. Dropping it leaves the
/// subscription registered; call `cancel` to deregister.
pub struct SubscriptionHandle {
    id: SubscriptionId,
    topic: Topic,
    gate: Arc<Gate>,
    registry: Weak<Registry>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    pub fn is_active(&self) -> bool {
        self.gate.is_open()
    }

    /// Deregister the handler. Idempotent.
    ///
    /// Once this returns the handler never runs again. A call already in
    /// progress on another thread is waited for; cancelling from inside a
    /// handler does not wait.
    pub fn cancel(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
        if !self.gate.close() {
            return;
        }
        debug!(subscription = %self.id, topic = %self.topic, "Unsubscribed");
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("topic", &self.topic)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn channel_handler(tx: mpsc::UnboundedSender<(u32, Topic)>, tag: u32) -> impl FnMut(Topic) {
        move |topic| {
            let _ = tx.send((tag, topic));
        }
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<(u32, Topic)>) -> Option<(u32, Topic)> {
        timeout(Duration::from_millis(200), rx.recv()).await.ok().flatten()
    }

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let notifier = ChangeNotifier::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _a = notifier.subscribe(Topic::ItemsChanged, channel_handler(tx.clone(), 1));
        let _b = notifier.subscribe(Topic::ItemsChanged, channel_handler(tx, 2));

        assert_eq!(notifier.publish(Topic::ItemsChanged), 2);

        let mut tags = vec![recv(&mut rx).await.unwrap().0, recv(&mut rx).await.unwrap().0];
        tags.sort();
        assert_eq!(tags, vec![1, 2]);
    }

    #[tokio::test]
    async fn per_subscriber_delivery_is_fifo() {
        let notifier = ChangeNotifier::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut seen = 0u32;
        let _sub = notifier.subscribe(Topic::ItemsChanged, move |_| {
            seen += 1;
            let _ = tx.send((seen, Topic::ItemsChanged));
        });

        for _ in 0..5 {
            notifier.publish(Topic::ItemsChanged);
        }

        for expected in 1..=5 {
            assert_eq!(recv(&mut rx).await.unwrap().0, expected);
        }
    }

    #[tokio::test]
    async fn cancelled_handler_never_fires() {
        let notifier = ChangeNotifier::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = notifier.subscribe(Topic::ItemsChanged, channel_handler(tx, 1));

        // Queued but not yet dispatched when cancel lands.
        notifier.publish(Topic::ItemsChanged);
        sub.cancel();
        notifier.publish(Topic::ItemsChanged);

        assert!(recv(&mut rx).await.is_none());
        assert_eq!(notifier.subscriber_count(Topic::ItemsChanged), 0);
        assert!(!sub.is_active());
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let notifier = ChangeNotifier::new();
        let sub = notifier.subscribe(Topic::ItemsChanged, |_| {});
        sub.cancel();
        sub.cancel();
        assert_eq!(notifier.publish(Topic::ItemsChanged), 0);
    }

    #[tokio::test]
    async fn cancelling_from_a_handler_does_not_skip_others() {
        let notifier = ChangeNotifier::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let victim = Arc::new(Mutex::new(None::<SubscriptionHandle>));
        let victim_slot = victim.clone();
        let tx_first = tx.clone();
        let _first = notifier.subscribe(Topic::ItemsChanged, move |topic| {
            if let Some(handle) = victim_slot.lock().unwrap().as_ref() {
                handle.cancel();
            }
            let _ = tx_first.send((1, topic));
        });
        let _second = notifier.subscribe(Topic::ItemsChanged, channel_handler(tx.clone(), 2));
        *victim.lock().unwrap() =
            Some(notifier.subscribe(Topic::ItemsChanged, channel_handler(tx, 3)));

        assert_eq!(notifier.publish(Topic::ItemsChanged), 3);

        let mut tags = Vec::new();
        while let Some((tag, _)) = recv(&mut rx).await {
            tags.push(tag);
        }
        tags.sort();
        // 1 and 2 always fire; 3 fires only if its dispatch won the race.
        assert!(tags.starts_with(&[1, 2]));
        assert!(tags.len() <= 3);
    }

    #[tokio::test]
    async fn shutdown_drops_all_subscriptions() {
        let notifier = ChangeNotifier::new();
        let a = notifier.subscribe(Topic::ItemsChanged, |_| {});
        let _b = notifier.subscribe(Topic::ItemsChanged, |_| {});

        assert_eq!(notifier.shutdown(), 2);
        assert!(!a.is_active());
        assert_eq!(notifier.publish(Topic::ItemsChanged), 0);
        a.cancel();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_waits_for_a_running_handler() {
        let notifier = ChangeNotifier::new();
        let (entered_tx, mut entered_rx) = mpsc::unbounded_channel::<()>();
        let calls = Arc::new(AtomicU64::new(0));
        let finished = Arc::new(AtomicBool::new(false));

        let handler_calls = calls.clone();
        let handler_finished = finished.clone();
        let sub = notifier.subscribe(Topic::ItemsChanged, move |_| {
            handler_calls.fetch_add(1, Ordering::SeqCst);
            let _ = entered_tx.send(());
            std::thread::sleep(Duration::from_millis(50));
            handler_finished.store(true, Ordering::SeqCst);
        });

        notifier.publish(Topic::ItemsChanged);
        timeout(Duration::from_millis(500), entered_rx.recv())
            .await
            .unwrap()
            .unwrap();

        sub.cancel();
        assert!(finished.load(Ordering::SeqCst));

        notifier.publish(Topic::ItemsChanged);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn handler_can_cancel_itself() {
        let notifier = ChangeNotifier::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let own = Arc::new(Mutex::new(None::<SubscriptionHandle>));
        let own_slot = own.clone();
        let sub_tx = tx.clone();
        let handle = notifier.subscribe(Topic::ItemsChanged, move |topic| {
            if let Some(handle) = own_slot.lock().unwrap().as_ref() {
                handle.cancel();
            }
            let _ = sub_tx.send((1, topic));
        });
        *own.lock().unwrap() = Some(handle);

        notifier.publish(Topic::ItemsChanged);
        notifier.publish(Topic::ItemsChanged);

        assert_eq!(recv(&mut rx).await.map(|(tag, _)| tag), Some(1));
        assert!(recv(&mut rx).await.is_none());
        assert_eq!(notifier.subscriber_count(Topic::ItemsChanged), 0);
    }

    #[test]
    fn topic_names() {
        assert_eq!(Topic::ItemsChanged.to_string(), "items-changed");
    }
}
