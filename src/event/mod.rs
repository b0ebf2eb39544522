//! Timer-driven batching of asynchronous results.
//!
//! Producers call [`BatchQueue::data_arrived`] from any task or thread. A
//! periodic flush hands everything accumulated since the last tick to every
//! subscriber as one batch, in arrival order. The flush timer runs only while
//! at least one subscriber is registered.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::error::{Error, Result};
use crate::log;

/// Default delay before the first flush after the first subscription.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(250);

/// Default period between flushes.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Flush cadence of a [`BatchQueue`].
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Delay before the first flush.
    pub initial_delay: Duration,
    /// Period between flushes.
    pub interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            initial_delay: DEFAULT_INITIAL_DELAY,
            interval: DEFAULT_INTERVAL,
        }
    }
}

impl QueueConfig {
    /// Sets the delay before the first flush.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the flush period.
    #[must_use]
    pub const fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

/// An item waiting for the next flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Queued<T> {
    /// The queued payload.
    pub item: T,
    /// When [`BatchQueue::data_arrived`] accepted it.
    pub arrived_at: Instant,
}

/// Identifies one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Effect of a subscription change on the flush timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// The first subscriber arrived; the timer must start.
    Start,
    /// The last subscriber left; the timer must stop.
    Stop,
    /// The timer keeps its current state.
    Unchanged,
}

/// Subscriber bookkeeping, independent of any timer.
#[derive(Debug)]
pub struct Subscribers<H> {
    next_id: u64,
    entries: Vec<(SubscriptionId, H)>,
}

impl<H> Default for Subscribers<H> {
    fn default() -> Self {
        Self {
            next_id: 1,
            entries: Vec::new(),
        }
    }
}

impl<H> Subscribers<H> {
    /// Creates an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler`.
    pub fn add(&mut self, handler: H) -> (SubscriptionId, Transition) {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, handler));
        let transition = if self.entries.len() == 1 {
            Transition::Start
        } else {
            Transition::Unchanged
        };
        (id, transition)
    }

    /// Deregisters `id`. Returns `None` if it was not registered.
    pub fn remove(&mut self, id: SubscriptionId) -> Option<Transition> {
        let index = self.entries.iter().position(|(entry, _)| *entry == id)?;
        self.entries.remove(index);
        Some(if self.entries.is_empty() {
            Transition::Stop
        } else {
            Transition::Unchanged
        })
    }

    /// Removes every handler.
    pub fn clear(&mut self) -> Transition {
        if self.entries.is_empty() {
            Transition::Unchanged
        } else {
            self.entries.clear();
            Transition::Stop
        }
    }

    /// Returns the number of handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no handler is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates the handlers in registration order.
    pub fn handlers(&self) -> impl Iterator<Item = &H> {
        self.entries.iter().map(|(_, handler)| handler)
    }
}

/// What a call to [`BatchQueue::flush`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushResult {
    /// A batch of this many items went to every subscriber.
    Delivered(usize),
    /// Nothing was buffered, or nobody is subscribed.
    Empty,
    /// Another flush was in flight.
    Skipped,
}

type Handler<T> = Arc<dyn Fn(&[Queued<T>]) + Send + Sync>;

struct Buffer<T> {
    accepting: bool,
    items: Vec<Queued<T>>,
}

struct Control<T> {
    subscribers: Subscribers<Handler<T>>,
    timer: Option<JoinHandle<()>>,
    generation: u64,
    shut_down: bool,
}

struct Shared<T> {
    name: String,
    config: QueueConfig,
    trace: bool,
    buffer: Mutex<Buffer<T>>,
    control: Mutex<Control<T>>,
    flushing: AtomicBool,
}

impl<T> Shared<T> {
    fn buffer(&self) -> MutexGuard<'_, Buffer<T>> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn control(&self) -> MutexGuard<'_, Control<T>> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn flush(&self, generation: Option<u64>) -> FlushResult {
        if self.flushing.swap(true, Ordering::AcqRel) {
            return FlushResult::Skipped;
        }
        let _flushing = FlushingFlag(&self.flushing);

        // Handlers and batch are taken under one control lock, so a batch
        // always goes to the subscribers it was buffered for.
        let (handlers, batch): (Vec<Handler<T>>, _) = {
            let control = self.control();
            let stale = generation.is_some_and(|g| g != control.generation);
            if control.shut_down || stale || control.subscribers.is_empty() {
                return FlushResult::Empty;
            }
            let batch = std::mem::take(&mut self.buffer().items);
            if batch.is_empty() {
                return FlushResult::Empty;
            }
            (control.subscribers.handlers().cloned().collect(), batch)
        };

        if self.trace {
            tracing::trace!(
                target: log::APP,
                queue = %self.name,
                items = batch.len(),
                handlers = handlers.len(),
                "delivering batch"
            );
        }
        for handler in &handlers {
            handler(&batch);
        }
        FlushResult::Delivered(batch.len())
    }
}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        if let Some(timer) = self.control().timer.take() {
            timer.abort();
        }
    }
}

/// Clears the in-flight flag when a flush ends, however it ends.
struct FlushingFlag<'a>(&'a AtomicBool);

impl Drop for FlushingFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Thread-safe batching queue with a periodic flush.
///
/// Cloning yields another handle to the same queue.
pub struct BatchQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for BatchQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + Sync + 'static> BatchQueue<T> {
    /// Creates an idle queue with no subscribers.
    #[must_use]
    pub fn new(name: impl Into<String>, config: QueueConfig) -> Self {
        Self::with_tracing(name, config, false)
    }

    /// Creates a queue that traces every delivered batch.
    #[must_use]
    pub fn with_tracing(name: impl Into<String>, config: QueueConfig, trace: bool) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                config,
                trace,
                buffer: Mutex::new(Buffer {
                    accepting: false,
                    items: Vec::new(),
                }),
                control: Mutex::new(Control {
                    subscribers: Subscribers::new(),
                    timer: None,
                    generation: 0,
                    shut_down: false,
                }),
                flushing: AtomicBool::new(false),
            }),
        }
    }

    /// Queues `item` for the next flush.
    ///
    /// Dropped unless at least one subscriber is registered. Never blocks on
    /// a flush in progress.
    pub fn data_arrived(&self, item: T) {
        let mut buffer = self.shared.buffer();
        if buffer.accepting {
            buffer.items.push(Queued {
                item,
                arrived_at: Instant::now(),
            });
        }
    }

    /// Registers `handler` and starts the flush timer if it is the first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ShutDown`] after [`BatchQueue::shutdown`] and
    /// [`Error::NoRuntime`] outside of a Tokio runtime.
    pub fn subscribe<F>(&self, handler: F) -> Result<SubscriptionId>
    where
        F: Fn(&[Queued<T>]) + Send + Sync + 'static,
    {
        let mut control = self.shared.control();
        if control.shut_down {
            return Err(Error::ShutDown);
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;

        let (id, transition) = control.subscribers.add(Arc::new(handler));
        if transition == Transition::Start {
            control.generation += 1;
            self.shared.buffer().accepting = true;
            control.timer = Some(runtime.spawn(run_timer(
                Arc::downgrade(&self.shared),
                control.generation,
                self.shared.config.clone(),
            )));
            tracing::debug!(target: log::APP, queue = %self.shared.name, "flush timer started");
        }
        Ok(id)
    }

    /// Deregisters a handler. Removing the last one stops the timer and
    /// discards everything buffered.
    ///
    /// Returns false if `id` was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut control = self.shared.control();
        match control.subscribers.remove(id) {
            Some(Transition::Stop) => {
                let discarded = Self::stop(&self.shared, &mut control);
                tracing::debug!(
                    target: log::APP,
                    queue = %self.shared.name,
                    discarded,
                    "flush timer stopped"
                );
                true
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Delivers everything buffered now, unless a flush is already running.
    pub fn flush(&self) -> FlushResult {
        self.shared.flush(None)
    }

    /// Stops the timer and clears all state. Later arrivals are ignored and
    /// later subscriptions fail.
    pub fn shutdown(&self) {
        let mut control = self.shared.control();
        if control.shut_down {
            return;
        }
        control.shut_down = true;
        control.subscribers.clear();
        Self::stop(&self.shared, &mut control);
        tracing::debug!(target: log::APP, queue = %self.shared.name, "queue shut down");
    }

    /// Returns the number of items waiting for the next flush.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.buffer().items.len()
    }

    /// Returns the number of registered handlers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.shared.control().subscribers.len()
    }

    /// Returns true while the flush timer is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.control().timer.is_some()
    }

    /// Returns true after [`BatchQueue::shutdown`].
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shared.control().shut_down
    }

    fn stop(shared: &Shared<T>, control: &mut Control<T>) -> usize {
        control.generation += 1;
        if let Some(timer) = control.timer.take() {
            timer.abort();
        }
        let mut buffer = shared.buffer();
        buffer.accepting = false;
        let discarded = buffer.items.len();
        buffer.items.clear();
        discarded
    }
}

async fn run_timer<T>(queue: Weak<Shared<T>>, generation: u64, config: QueueConfig) {
    let start = Instant::now() + config.initial_delay;
    let mut ticker = tokio::time::interval_at(start, config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let Some(shared) = queue.upgrade() else {
            break;
        };
        if shared.flush(Some(generation)) == FlushResult::Skipped {
            tracing::trace!(target: log::APP, queue = %shared.name, "flush in progress, tick skipped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Batches = Arc<Mutex<Vec<Vec<u32>>>>;

    fn config() -> QueueConfig {
        QueueConfig::default()
            .initial_delay(Duration::from_millis(50))
            .interval(Duration::from_millis(200))
    }

    fn recorder(batches: &Batches) -> impl Fn(&[Queued<u32>]) + Send + Sync + 'static {
        let batches = Arc::clone(batches);
        move |batch: &[Queued<u32>]| {
            batches
                .lock()
                .unwrap()
                .push(batch.iter().map(|q| q.item).collect());
        }
    }

    #[test]
    fn test_subscriber_transitions() {
        let mut subscribers = Subscribers::new();
        let (a, first) = subscribers.add("a");
        let (b, second) = subscribers.add("b");
        assert_eq!(first, Transition::Start);
        assert_eq!(second, Transition::Unchanged);
        assert_ne!(a, b);

        assert_eq!(subscribers.remove(a), Some(Transition::Unchanged));
        assert_eq!(subscribers.remove(a), None);
        assert_eq!(subscribers.remove(b), Some(Transition::Stop));
        assert!(subscribers.is_empty());

        let (_, again) = subscribers.add("c");
        assert_eq!(again, Transition::Start);
        assert_eq!(subscribers.clear(), Transition::Stop);
        assert_eq!(subscribers.clear(), Transition::Unchanged);
    }

    #[tokio::test(start_paused = true)]
    async fn test_five_arrivals_make_one_batch() {
        let queue = BatchQueue::new("test", config());
        let batches = Batches::default();
        queue.subscribe(recorder(&batches)).unwrap();

        for n in 1..=5 {
            queue.data_arrived(n);
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(*batches.lock().unwrap(), vec![vec![1, 2, 3, 4, 5]]);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(batches.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batches_follow_the_interval() {
        let queue = BatchQueue::new("test", config());
        let batches = Batches::default();
        queue.subscribe(recorder(&batches)).unwrap();

        queue.data_arrived(1);
        tokio::time::sleep(Duration::from_millis(60)).await;
        queue.data_arrived(2);
        queue.data_arrived(3);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(batches.lock().unwrap().len(), 1);

        tokio::time::sleep(Duration::from_millis(110)).await;
        assert_eq!(*batches.lock().unwrap(), vec![vec![1], vec![2, 3]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_discards_gap_items() {
        let queue = BatchQueue::new("test", config());
        let first = Batches::default();
        let id = queue.subscribe(recorder(&first)).unwrap();
        queue.data_arrived(1);
        queue.data_arrived(2);
        assert!(queue.unsubscribe(id));
        assert!(!queue.is_running());
        assert_eq!(queue.pending(), 0);

        queue.data_arrived(3);

        let second = Batches::default();
        queue.subscribe(recorder(&second)).unwrap();
        queue.data_arrived(4);
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(first.lock().unwrap().is_empty());
        assert_eq!(*second.lock().unwrap(), vec![vec![4]]);
    }

    #[tokio::test]
    async fn test_no_buffering_without_subscribers() {
        let queue = BatchQueue::new("test", config());
        queue.data_arrived(1u32);
        assert_eq!(queue.pending(), 0);
        assert_eq!(queue.flush(), FlushResult::Empty);
    }

    #[tokio::test]
    async fn test_every_handler_gets_the_same_batch() {
        let queue = BatchQueue::new("test", QueueConfig::default());
        let a = Batches::default();
        let b = Batches::default();
        queue.subscribe(recorder(&a)).unwrap();
        queue.subscribe(recorder(&b)).unwrap();
        assert_eq!(queue.subscriber_count(), 2);

        queue.data_arrived(7);
        queue.data_arrived(8);
        assert_eq!(queue.flush(), FlushResult::Delivered(2));
        assert_eq!(*a.lock().unwrap(), vec![vec![7, 8]]);
        assert_eq!(*b.lock().unwrap(), vec![vec![7, 8]]);
        assert_eq!(queue.flush(), FlushResult::Empty);
    }

    #[tokio::test]
    async fn test_flush_during_flush_is_skipped() {
        let queue = BatchQueue::new("test", QueueConfig::default());
        let nested = Arc::new(Mutex::new(Vec::new()));
        {
            let inner = queue.clone();
            let nested = Arc::clone(&nested);
            queue
                .subscribe(move |_batch: &[Queued<u32>]| {
                    inner.data_arrived(99);
                    nested.lock().unwrap().push(inner.flush());
                })
                .unwrap();
        }

        queue.data_arrived(1);
        assert_eq!(queue.flush(), FlushResult::Delivered(1));
        assert_eq!(*nested.lock().unwrap(), [FlushResult::Skipped]);
        // The item that arrived mid-flush waits for the next batch.
        assert_eq!(queue.pending(), 1);
        queue.shutdown();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_resubscribe_under_concurrent_flush_keeps_batches_with_their_subscriber() {
        let queue = BatchQueue::new("test", QueueConfig::default().initial_delay(Duration::from_secs(60)));
        let seen = Arc::new(Mutex::new(Vec::<(u32, u32)>::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let flusher = {
            let queue = queue.clone();
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    queue.flush();
                }
            })
        };

        for round in 0..500u32 {
            let seen = Arc::clone(&seen);
            let id = queue
                .subscribe(move |batch: &[Queued<u32>]| {
                    let mut seen = seen.lock().unwrap();
                    seen.extend(batch.iter().map(|q| (round, q.item)));
                })
                .unwrap();
            queue.data_arrived(round);
            while queue.pending() > 0 {
                queue.flush();
            }
            assert!(queue.unsubscribe(id));
        }
        stop.store(true, Ordering::Relaxed);
        flusher.join().unwrap();

        let mut seen = seen.lock().unwrap().clone();
        seen.sort_unstable();
        assert_eq!(seen, (0..500).map(|n| (n, n)).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_shutdown_rejects_further_use() {
        let queue = BatchQueue::new("test", config());
        let batches = Batches::default();
        queue.subscribe(recorder(&batches)).unwrap();
        queue.data_arrived(1);

        queue.shutdown();
        assert!(queue.is_shut_down());
        assert!(!queue.is_running());
        queue.data_arrived(2);
        assert_eq!(queue.pending(), 0);
        assert!(matches!(
            queue.subscribe(recorder(&batches)),
            Err(Error::ShutDown)
        ));
        assert_eq!(queue.flush(), FlushResult::Empty);
        queue.shutdown();
    }

    #[test]
    fn test_subscribe_outside_runtime() {
        let queue = BatchQueue::<u32>::new("test", config());
        assert!(matches!(
            queue.subscribe(|_: &[Queued<u32>]| {}),
            Err(Error::NoRuntime)
        ));
        assert_eq!(queue.subscriber_count(), 0);
    }
}
