use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use cordwire_models::gateway::Ready;
use cordwire_models::voice::{VoiceServerUpdate, VoiceState};
use cordwire_models::{Dispatch, Event};
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;

/// Default per-subscriber queue capacity.
pub const DEFAULT_CAPACITY: usize = 256;

/// Types a subscriber can receive. Returning `None` means "not for me".
pub trait FromDispatch: Sized + Send + 'static {
    fn from_dispatch(dispatch: &Dispatch) -> Option<Self>;
}

impl FromDispatch for Dispatch {
    fn from_dispatch(dispatch: &Dispatch) -> Option<Self> {
        Some(dispatch.clone())
    }
}

impl FromDispatch for Event {
    fn from_dispatch(dispatch: &Dispatch) -> Option<Self> {
        Some(dispatch.event.clone())
    }
}

impl FromDispatch for Ready {
    fn from_dispatch(dispatch: &Dispatch) -> Option<Self> {
        match &dispatch.event {
            Event::Ready(ready) => Some(ready.as_ref().clone()),
            _ => None,
        }
    }
}

impl FromDispatch for VoiceState {
    fn from_dispatch(dispatch: &Dispatch) -> Option<Self> {
        match &dispatch.event {
            Event::VoiceStateUpdate(state) => Some(state.clone()),
            _ => None,
        }
    }
}

impl FromDispatch for VoiceServerUpdate {
    fn from_dispatch(dispatch: &Dispatch) -> Option<Self> {
        match &dispatch.event {
            Event::VoiceServerUpdate(update) => Some(update.clone()),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("timed out waiting for event")]
    Timeout,
    #[error("dispatcher closed")]
    Closed,
}

enum Delivery {
    Delivered,
    Filtered,
    Full,
    Closed,
}

type DeliverFn = dyn Fn(&Dispatch) -> Delivery + Send + Sync;

struct Subscriber {
    id: u64,
    deliver: Box<DeliverFn>,
    dropped: Arc<AtomicU64>,
}

struct Shared {
    subscribers: Mutex<Vec<Arc<Subscriber>>>,
    next_id: AtomicU64,
    capacity: usize,
    dropped: AtomicU64,
}

impl Shared {
    fn subscribers(&self) -> MutexGuard<'_, Vec<Arc<Subscriber>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn remove(&self, ids: &[u64]) {
        self.subscribers().retain(|sub| !ids.contains(&sub.id));
    }
}

/// Typed fan-out of gateway dispatches.
///
/// Every subscriber owns a bounded queue. A full queue drops the event for
/// that subscriber only and bumps its drop counter; `dispatch` never waits.
/// The subscriber list lock is held just long enough to snapshot it.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                capacity: capacity.max(1),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    pub fn subscribe<T: FromDispatch>(&self) -> Subscription<T> {
        self.subscribe_filtered(|_: &T| true)
    }

    pub fn subscribe_filtered<T, F>(&self, filter: F) -> Subscription<T>
    where
        T: FromDispatch,
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.register(self.shared.capacity, filter)
    }

    /// Subscribe to dispatches carrying one event name, e.g. `MESSAGE_CREATE`.
    pub fn subscribe_event(&self, name: impl Into<String>) -> Subscription<Dispatch> {
        let name = name.into();
        self.subscribe_filtered(move |dispatch: &Dispatch| dispatch.name() == name)
    }

    /// Wait for the first matching event.
    ///
    /// The subscription is registered when this is called, not when the
    /// returned future is first polled, so events dispatched in between are
    /// not missed. It is removed once the future resolves or is dropped.
    pub fn wait_for<T, F>(
        &self,
        filter: F,
        timeout: Duration,
    ) -> impl Future<Output = Result<T, DispatchError>> + Send + 'static
    where
        T: FromDispatch,
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let mut subscription = self.register(1, filter);
        async move {
            match tokio::time::timeout(timeout, subscription.recv()).await {
                Ok(Some(value)) => Ok(value),
                Ok(None) => Err(DispatchError::Closed),
                Err(_) => Err(DispatchError::Timeout),
            }
        }
    }

    fn register<T, F>(&self, capacity: usize, filter: F) -> Subscription<T>
    where
        T: FromDispatch,
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity);
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let dropped = Arc::new(AtomicU64::new(0));

        let deliver = move |dispatch: &Dispatch| {
            let Some(value) = T::from_dispatch(dispatch) else {
                return Delivery::Filtered;
            };
            if !filter(&value) {
                return Delivery::Filtered;
            }
            match tx.try_send(value) {
                Ok(()) => Delivery::Delivered,
                Err(TrySendError::Full(_)) => Delivery::Full,
                Err(TrySendError::Closed(_)) => Delivery::Closed,
            }
        };

        self.shared.subscribers().push(Arc::new(Subscriber {
            id,
            deliver: Box::new(deliver),
            dropped: dropped.clone(),
        }));
        tracing::debug!(subscriber = id, "subscribed");

        Subscription {
            rx,
            dropped,
            guard: Unsubscribe {
                shared: Arc::downgrade(&self.shared),
                id,
                done: AtomicBool::new(false),
            },
        }
    }

    /// Fan a dispatch out to every subscriber in subscription order.
    /// Returns how many subscribers accepted it.
    pub fn dispatch(&self, dispatch: &Dispatch) -> usize {
        let snapshot: Vec<Arc<Subscriber>> = self.shared.subscribers().clone();

        let mut delivered = 0;
        let mut closed = Vec::new();
        for sub in &snapshot {
            match (sub.deliver)(dispatch) {
                Delivery::Delivered => delivered += 1,
                Delivery::Filtered => {}
                Delivery::Full => {
                    let dropped = sub.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        subscriber = sub.id,
                        event_name = dispatch.name(),
                        sequence = dispatch.sequence,
                        dropped,
                        "subscriber queue full, dropping event"
                    );
                }
                Delivery::Closed => closed.push(sub.id),
            }
        }

        if !closed.is_empty() {
            self.shared.remove(&closed);
        }
        delivered
    }

    /// Run `handler` for every event of type `T` on its own task.
    ///
    /// The handler keeps running until [`HandlerHandle::remove`] is called or
    /// the dispatcher is closed; dropping the handle detaches it.
    pub fn add_handler<T, F, Fut>(&self, handler: F) -> HandlerHandle
    where
        T: FromDispatch,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut subscription = self.subscribe::<T>();
        let task = tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                handler(event).await;
            }
        });
        HandlerHandle { task }
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers().len()
    }

    /// Events dropped across all subscribers because their queue was full.
    pub fn dropped_total(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Remove every subscriber. Pending receivers drain and then see `None`.
    pub fn close(&self) {
        self.shared.subscribers().clear();
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("subscribers", &self.subscriber_count())
            .field("dropped", &self.dropped_total())
            .finish()
    }
}

struct Unsubscribe {
    shared: Weak<Shared>,
    id: u64,
    done: AtomicBool,
}

impl Unsubscribe {
    fn run(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(shared) = self.shared.upgrade() {
            shared.remove(&[self.id]);
            tracing::debug!(subscriber = self.id, "unsubscribed");
        }
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        self.run();
    }
}

/// Receiving end of a subscription. Dropping it unsubscribes.
pub struct Subscription<T> {
    rx: mpsc::Receiver<T>,
    dropped: Arc<AtomicU64>,
    guard: Unsubscribe,
}

impl<T> Subscription<T> {
    /// Cancel-safe: a dropped `recv` future loses no events.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Events this subscriber missed because its queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stop receiving new events. Safe to call more than once.
    pub fn unsubscribe(&self) {
        self.guard.run();
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.guard.id)
            .field("dropped", &self.dropped())
            .finish()
    }
}

#[derive(Debug)]
pub struct HandlerHandle {
    task: JoinHandle<()>,
}

impl HandlerHandle {
    pub fn remove(self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}
