//! Lifecycle event dispatcher.
//!
//! Listeners run inline, in registration order, before `dispatch` returns.
//! Afterwards every live [`Subscription`] receives a copy of the event on its
//! own channel. A listener must not fail the caller; it logs its own errors.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

/// An observer that runs inline with the dispatching code.
#[async_trait]
pub trait Listener<M>: Send + Sync {
    async fn handle(&self, event: &M);
}

/// Broadcast copy of every event dispatched after the subscription was made.
///
/// Suited to observers on other threads (log shippers, test assertions).
/// Dropping the subscription unregisters it on the next dispatch.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    /// Block for up to `timeout` waiting for the next event.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Everything received so far, without blocking.
    pub fn drain(&self) -> Vec<M> {
        self.receiver.try_iter().collect()
    }
}

/// Fan-out point for one event type.
pub struct EventDispatcher<M> {
    listeners: RwLock<Vec<Arc<dyn Listener<M>>>>,
    subscribers: Mutex<Vec<Sender<M>>>,
}

impl<M> EventDispatcher<M>
where
    M: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register an inline listener.
    pub fn listen(&self, listener: impl Listener<M> + 'static) {
        match self.listeners.write() {
            Ok(mut listeners) => listeners.push(Arc::new(listener)),
            Err(_) => warn!("event dispatcher lock poisoned; listener dropped"),
        }
    }

    /// Subscribe to a broadcast copy of every event.
    pub fn subscribe(&self) -> Subscription<M> {
        let (tx, rx) = mpsc::channel();
        match self.subscribers.lock() {
            Ok(mut subscribers) => subscribers.push(tx),
            Err(_) => warn!("event dispatcher lock poisoned; subscription will stay empty"),
        }
        Subscription { receiver: rx }
    }

    pub async fn dispatch(&self, event: M) {
        let listeners: Vec<Arc<dyn Listener<M>>> = match self.listeners.read() {
            Ok(listeners) => listeners.clone(),
            Err(_) => Vec::new(),
        };

        for listener in listeners {
            listener.handle(&event).await;
        }

        self.broadcast(event);
    }

    fn broadcast(&self, event: M) {
        match self.subscribers.lock() {
            Ok(mut subscribers) => subscribers.retain(|tx| tx.send(event.clone()).is_ok()),
            Err(_) => warn!("event dispatcher lock poisoned; event not broadcast"),
        }
    }

    fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|subs| subs.len()).unwrap_or(0)
    }
}

impl<M> Default for EventDispatcher<M> {
    fn default() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl<M> core::fmt::Debug for EventDispatcher<M>
where
    M: Clone + Send + Sync + 'static,
{
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let listeners = self.listeners.read().map(|l| l.len()).unwrap_or(0);
        f.debug_struct("EventDispatcher")
            .field("listeners", &listeners)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Record(Arc<Mutex<Vec<u32>>>);

    #[async_trait]
    impl Listener<u32> for Record {
        async fn handle(&self, event: &u32) {
            self.0.lock().unwrap().push(*event);
        }
    }

    #[tokio::test]
    async fn listeners_run_before_dispatch_returns() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let dispatcher = EventDispatcher::new();
        dispatcher.listen(Record(seen.clone()));

        dispatcher.dispatch(1).await;
        dispatcher.dispatch(2).await;

        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn every_subscriber_gets_a_copy() {
        let dispatcher = EventDispatcher::new();
        let a = dispatcher.subscribe();
        let b = dispatcher.subscribe();

        dispatcher.dispatch(9u32).await;

        assert_eq!(a.drain(), vec![9]);
        assert_eq!(b.drain(), vec![9]);
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let dispatcher = EventDispatcher::new();
        let kept = dispatcher.subscribe();
        drop(dispatcher.subscribe());

        dispatcher.dispatch("x".to_string()).await;

        assert_eq!(dispatcher.subscriber_count(), 1);
        assert_eq!(kept.drain(), vec!["x".to_string()]);
    }
}
