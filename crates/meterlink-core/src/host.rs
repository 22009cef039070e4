//! Single-threaded host execution context.
//!
//! The [`EventLoop`] lives on the host thread and owns the callback
//! registry (meter id → user callback). Other threads only hold a
//! [`LoopHandle`], which posts events without blocking. Callbacks run only
//! inside [`EventLoop::run_pending`] / [`EventLoop::run_for`], i.e. on the
//! thread that drives the loop.

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::delivery::{Deliverer, DeliverySlot};
use crate::levels::MeterLevels;
use crate::protocol::MeterId;

/// Callback invoked on the host thread with each delivered reading.
pub type MeterCallback = Box<dyn FnMut(MeterLevels)>;

/// Events posted to the host loop from other threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    /// A reading is waiting in the delivery slot of `id`.
    Deliver { id: MeterId, generation: u64 },
    /// Drop the subscription of `id` if it is still `generation`.
    Unsubscribe { id: MeterId, generation: u64 },
}

/// Thread-safe handle for posting events to the host loop.
#[derive(Clone)]
pub struct LoopHandle {
    tx: Sender<HostEvent>,
}

impl LoopHandle {
    /// Post an event. Returns `false` if the loop has been torn down.
    pub fn post(&self, event: HostEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

struct Subscriber {
    generation: u64,
    slot: DeliverySlot,
    callback: Option<MeterCallback>,
}

/// The host's cooperative event loop.
pub struct EventLoop {
    tx: Sender<HostEvent>,
    rx: Receiver<HostEvent>,
    subscribers: RefCell<HashMap<MeterId, Subscriber>>,
    next_generation: Cell<u64>,
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl EventLoop {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self {
            tx,
            rx,
            subscribers: RefCell::new(HashMap::new()),
            next_generation: Cell::new(1),
        }
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            tx: self.tx.clone(),
        }
    }

    /// Register `callback` for readings of `id`, replacing any previous one.
    ///
    /// Returns the worker-side end of the new delivery path. Deliveries made
    /// through an older [`Deliverer`] for the same id are ignored.
    pub fn subscribe<F>(&self, id: MeterId, callback: F) -> Deliverer
    where
        F: FnMut(MeterLevels) + 'static,
    {
        let generation = self.next_generation.get();
        self.next_generation.set(generation + 1);

        let slot = DeliverySlot::new();
        self.subscribers.borrow_mut().insert(
            id,
            Subscriber {
                generation,
                slot: slot.clone(),
                callback: Some(Box::new(callback)),
            },
        );
        Deliverer::new(id, generation, slot, self.handle())
    }

    /// Remove the callback for `id`. Undelivered readings are discarded.
    pub fn unsubscribe(&self, id: MeterId) -> bool {
        match self.subscribers.borrow_mut().remove(&id) {
            Some(sub) => {
                sub.slot.take();
                true
            }
            None => false,
        }
    }

    pub fn is_subscribed(&self, id: MeterId) -> bool {
        self.subscribers.borrow().contains_key(&id)
    }

    /// Handle every event already queued without blocking.
    ///
    /// Returns the number of callbacks run.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while let Ok(event) = self.rx.try_recv() {
            if self.dispatch(event) {
                ran += 1;
            }
        }
        ran
    }

    /// Handle events as they arrive until `duration` elapses.
    pub fn run_for(&self, duration: Duration) -> usize {
        let deadline = Instant::now() + duration;
        let mut ran = 0;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match self.rx.recv_timeout(deadline - now) {
                Ok(event) => {
                    if self.dispatch(event) {
                        ran += 1;
                    }
                }
                Err(RecvTimeoutError::Timeout) => break,
                // We hold a sender, so the channel never disconnects.
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        ran
    }

    fn dispatch(&self, event: HostEvent) -> bool {
        match event {
            HostEvent::Deliver { id, generation } => self.deliver(id, generation),
            HostEvent::Unsubscribe { id, generation } => {
                let mut subs = self.subscribers.borrow_mut();
                if subs.get(&id).is_some_and(|sub| sub.generation == generation) {
                    if let Some(sub) = subs.remove(&id) {
                        sub.slot.take();
                    }
                }
                false
            }
        }
    }

    fn deliver(&self, id: MeterId, generation: u64) -> bool {
        // Take the callback out so it may re-enter the loop (e.g. unsubscribe).
        let (levels, callback) = {
            let mut subs = self.subscribers.borrow_mut();
            let Some(sub) = subs.get_mut(&id) else {
                return false;
            };
            if sub.generation != generation {
                return false;
            }
            let Some(levels) = sub.slot.take() else {
                return false;
            };
            (levels, sub.callback.take())
        };

        let Some(mut callback) = callback else {
            return false;
        };
        callback(levels);

        let mut subs = self.subscribers.borrow_mut();
        if let Some(sub) = subs.get_mut(&id) {
            if sub.generation == generation && sub.callback.is_none() {
                sub.callback = Some(callback);
            }
        }
        true
    }
}
