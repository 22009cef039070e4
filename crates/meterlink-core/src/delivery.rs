//! Single-slot handoff of meter readings from a worker to the host thread.
//!
//! The worker never blocks on the host. Each meter has one [`DeliverySlot`]
//! holding at most one undelivered reading. A new reading either fills an
//! empty slot (and posts one notification to the host loop) or replaces the
//! reading already waiting there (the outstanding notification picks up the
//! newer one). A notification is outstanding exactly while the slot is full,
//! so the backlog is bounded at one reading per meter.

use std::sync::{Arc, Mutex};

use crate::host::{HostEvent, LoopHandle};
use crate::levels::MeterLevels;
use crate::protocol::MeterId;

/// Holds the newest undelivered reading of one meter.
#[derive(Clone, Default)]
pub struct DeliverySlot {
    pending: Arc<Mutex<Option<MeterLevels>>>,
}

impl DeliverySlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a reading. Returns `true` if the slot was empty.
    pub fn put(&self, levels: MeterLevels) -> bool {
        let mut pending = self.pending.lock().expect("Delivery slot lock poisoned");
        pending.replace(levels).is_none()
    }

    /// Take the waiting reading, leaving the slot empty.
    pub fn take(&self) -> Option<MeterLevels> {
        self.pending
            .lock()
            .expect("Delivery slot lock poisoned")
            .take()
    }
}

/// What happened to a reading handed to [`Deliverer::deliver`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The slot was empty; the host was notified.
    Queued,
    /// An undelivered reading was replaced by this one.
    Replaced,
    /// The host loop is gone; the reading was discarded.
    Dropped,
}

/// Worker-side end of a meter's delivery path.
#[derive(Clone)]
pub struct Deliverer {
    id: MeterId,
    generation: u64,
    slot: DeliverySlot,
    host: LoopHandle,
}

impl Deliverer {
    pub(crate) fn new(id: MeterId, generation: u64, slot: DeliverySlot, host: LoopHandle) -> Self {
        Self {
            id,
            generation,
            slot,
            host,
        }
    }

    /// Token of the subscription this path belongs to.
    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Hand a reading to the host thread without blocking.
    pub fn deliver(&self, levels: MeterLevels) -> Delivery {
        if !self.slot.put(levels) {
            return Delivery::Replaced;
        }
        let posted = self.host.post(HostEvent::Deliver {
            id: self.id,
            generation: self.generation,
        });
        if posted {
            Delivery::Queued
        } else {
            self.slot.take();
            Delivery::Dropped
        }
    }
}
