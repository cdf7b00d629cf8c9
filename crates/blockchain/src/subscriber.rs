//! Stop-once notification fan-out.
//!
//! Handlers run on the general pool, never on the organizer thread, and a
//! notification mutex keeps relays in commit order. On stop every handler
//! receives the stop payload exactly once and is dropped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use keeld_primitives::{Block, Transaction};

use crate::dispatch::Dispatcher;
use crate::error::Error;

pub type Handler<P> = Arc<dyn Fn(P) + Send + Sync>;

/// Ticket gate: delivery jobs run one at a time, in ticket order, even when
/// the general pool schedules them onto different workers.
struct OrderGate {
    serving: Mutex<u64>,
    turned: Condvar,
}

impl OrderGate {
    fn new() -> Self {
        Self {
            serving: Mutex::new(0),
            turned: Condvar::new(),
        }
    }

    fn wait_for(&self, ticket: u64) {
        let Ok(mut serving) = self.serving.lock() else {
            return;
        };
        while *serving != ticket {
            match self.turned.wait(serving) {
                Ok(guard) => serving = guard,
                Err(_) => return,
            }
        }
    }

    fn advance(&self) {
        if let Ok(mut serving) = self.serving.lock() {
            *serving += 1;
        }
        self.turned.notify_all();
    }
}

pub struct Subscriber<P: Clone + Send + Sync + 'static> {
    dispatch: Arc<Dispatcher>,
    handlers: Mutex<Vec<Handler<P>>>,
    gate: Arc<OrderGate>,
    tickets: AtomicU64,
    stopped: AtomicBool,
}

impl<P: Clone + Send + Sync + 'static> Subscriber<P> {
    pub fn new(dispatch: Arc<Dispatcher>) -> Self {
        Self {
            dispatch,
            handlers: Mutex::new(Vec::new()),
            gate: Arc::new(OrderGate::new()),
            tickets: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    /// Register a handler. Returns false once the subscriber has stopped.
    pub fn subscribe(&self, handler: impl Fn(P) + Send + Sync + 'static) -> bool {
        if self.stopped.load(Ordering::Acquire) {
            return false;
        }
        match self.handlers.lock() {
            Ok(mut handlers) => {
                handlers.push(Arc::new(handler));
                true
            }
            Err(_) => false,
        }
    }

    /// Deliver `payload` to every registered handler, in relay order.
    pub fn relay(&self, payload: P) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        let handlers: Vec<Handler<P>> = match self.handlers.lock() {
            Ok(handlers) => handlers.clone(),
            Err(_) => return,
        };
        self.deliver(handlers, payload);
    }

    /// Deliver `payload` once to every handler, then drop them. Idempotent.
    pub fn stop(&self, payload: P) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let handlers = match self.handlers.lock() {
            Ok(mut handlers) => std::mem::take(&mut *handlers),
            Err(_) => return,
        };
        self.deliver(handlers, payload);
    }

    fn deliver(&self, handlers: Vec<Handler<P>>, payload: P) {
        let ticket = self.tickets.fetch_add(1, Ordering::AcqRel);
        let gate = Arc::clone(&self.gate);
        // After pool shutdown the spawn fails; later deliveries fail the
        // same way, so an unserved ticket blocks nothing.
        let _ = self.dispatch.spawn_general(move || {
            gate.wait_for(ticket);
            for handler in &handlers {
                handler(payload.clone());
            }
            gate.advance();
        });
    }
}

/// Reorganization notification: fork height plus the swapped block lists.
#[derive(Clone)]
pub struct ReorganizePayload {
    /// `None` on success; `Some(ServiceStopped)` on shutdown.
    pub code: Option<Error>,
    pub branch_height: u32,
    pub incoming: Arc<Vec<Arc<Block>>>,
    pub outgoing: Arc<Vec<Arc<Block>>>,
}

impl ReorganizePayload {
    pub fn stopped() -> Self {
        Self {
            code: Some(Error::ServiceStopped),
            branch_height: 0,
            incoming: Arc::new(Vec::new()),
            outgoing: Arc::new(Vec::new()),
        }
    }
}

/// Transaction admission notification.
#[derive(Clone)]
pub struct TransactionPayload {
    pub code: Option<Error>,
    pub transaction: Option<Arc<Transaction>>,
}

impl TransactionPayload {
    pub fn stopped() -> Self {
        Self {
            code: Some(Error::ServiceStopped),
            transaction: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;
    use crossbeam_channel::unbounded;

    fn dispatcher() -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(&Settings::default()).expect("dispatcher"))
    }

    #[test]
    fn relay_reaches_every_handler() {
        let dispatch = dispatcher();
        let subscriber: Subscriber<u32> = Subscriber::new(Arc::clone(&dispatch));
        let (sender, receiver) = unbounded();

        for _ in 0..3 {
            let sender = sender.clone();
            assert!(subscriber.subscribe(move |value| {
                let _ = sender.send(value);
            }));
        }

        subscriber.relay(7);
        let mut received = Vec::new();
        for _ in 0..3 {
            received.push(receiver.recv().expect("notification"));
        }
        assert_eq!(received, vec![7, 7, 7]);
        dispatch.close();
    }

    #[test]
    fn stop_fires_exactly_once_and_drops_handlers() {
        let dispatch = dispatcher();
        let subscriber: Subscriber<u32> = Subscriber::new(Arc::clone(&dispatch));
        let (sender, receiver) = unbounded();

        let tap = sender.clone();
        subscriber.subscribe(move |value| {
            let _ = tap.send(value);
        });

        subscriber.stop(0);
        subscriber.stop(0);
        subscriber.relay(5);
        assert!(!subscriber.subscribe(move |value| {
            let _ = sender.send(value);
        }));

        dispatch.close();
        // Exactly one delivery: the stop payload.
        assert_eq!(receiver.try_iter().collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn relays_preserve_order() {
        let dispatch = dispatcher();
        let subscriber: Subscriber<u32> = Subscriber::new(Arc::clone(&dispatch));
        let (sender, receiver) = unbounded();
        subscriber.subscribe(move |value| {
            let _ = sender.send(value);
        });

        for value in 0..32 {
            subscriber.relay(value);
        }
        dispatch.close();
        let received: Vec<u32> = receiver.try_iter().collect();
        assert_eq!(received, (0..32).collect::<Vec<_>>());
    }
}
