use std::collections::{HashMap, VecDeque};

use crate::broker::peer::PeerId;
use crate::wire::QueueDescriptor;

/// A message at rest in a queue or parked unacknowledged at a consumer.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub payload: Vec<u8>,
    /// Completed delivery attempts (incremented when dispatched).
    pub attempt: u32,
    pub redelivered: bool,
    /// Original enqueue time (epoch millis); survives requeues, so it
    /// measures total queue latency.
    pub enqueued_at: i64,
}

/// One registered consumer channel on a queue. Delivery tags are issued
/// by the engine per (peer, channel), so a channel consuming several
/// queues never sees a tag twice.
#[derive(Debug)]
pub struct ConsumerSlot {
    pub peer: PeerId,
    pub channel: u16,
    /// Unacknowledged-delivery ceiling; 0 means unlimited.
    pub prefetch: u32,
    /// Deliveries awaiting acknowledgment, by delivery tag.
    pub unacked: HashMap<u64, StoredMessage>,
}

impl ConsumerSlot {
    pub fn new(peer: PeerId, channel: u16, prefetch: u32) -> Self {
        Self {
            peer,
            channel,
            prefetch,
            unacked: HashMap::new(),
        }
    }

    /// Whether the broker may push another delivery without overrunning
    /// this consumer's prefetch credit.
    pub fn has_capacity(&self) -> bool {
        self.prefetch == 0 || (self.unacked.len() as u32) < self.prefetch
    }
}

/// A named queue: FIFO ready list plus the consumers attached to it.
#[derive(Debug)]
pub struct Queue {
    pub descriptor: QueueDescriptor,
    pub ready: VecDeque<StoredMessage>,
    pub consumers: Vec<ConsumerSlot>,
    /// Consumers that cancelled but still hold unacknowledged deliveries;
    /// they receive nothing new, but their acks are still honored.
    pub cancelled: Vec<ConsumerSlot>,
    /// Round-robin cursor over `consumers`.
    pub(super) rr_next: usize,
}

impl Queue {
    pub fn new(descriptor: QueueDescriptor) -> Self {
        Self {
            descriptor,
            ready: VecDeque::new(),
            consumers: Vec::new(),
            cancelled: Vec::new(),
            rr_next: 0,
        }
    }

    pub fn depth(&self) -> usize {
        self.ready.len()
    }

    pub fn unacked(&self) -> usize {
        self.consumers
            .iter()
            .chain(self.cancelled.iter())
            .map(|slot| slot.unacked.len())
            .sum()
    }
}
