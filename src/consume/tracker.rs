use std::collections::HashMap;

use crate::utils::error::UnknownTagError;

/// Acknowledgment state of one in-flight delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckState {
    /// Delivered, handler outcome not yet known.
    Pending,
    /// An acknowledgment (positive or negative) is being sent.
    Acking,
}

/// Correlates in-flight deliveries with their acknowledgment state.
///
/// Invariants enforced here:
/// - at most one acknowledgment is ever sent per delivery tag, and
/// - a tag from a stale channel (pre-recovery) is never acknowledged on
///   the new channel: [`DeliveryTracker::discard_all`] wipes the books
///   when the channel epoch moves on, because the broker has already
///   redelivered those messages under the new epoch.
#[derive(Debug)]
pub struct DeliveryTracker {
    epoch: u64,
    tags: HashMap<u64, AckState>,
}

impl DeliveryTracker {
    pub fn new(epoch: u64) -> Self {
        Self {
            epoch,
            tags: HashMap::new(),
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Number of deliveries awaiting resolution.
    pub fn pending(&self) -> usize {
        self.tags.len()
    }

    /// Registers a fresh delivery and returns the epoch it belongs to,
    /// which the worker must present when acknowledging.
    pub fn track(&mut self, tag: u64) -> u64 {
        self.tags.insert(tag, AckState::Pending);
        self.epoch
    }

    /// Claims the right to acknowledge `tag`. Fails if the tag was already
    /// resolved, was never tracked, or belongs to an earlier epoch — the
    /// caller must then drop the acknowledgment, not send it.
    pub fn begin_ack(&mut self, tag: u64, epoch: u64) -> Result<(), UnknownTagError> {
        if epoch != self.epoch {
            return Err(UnknownTagError { tag, epoch });
        }
        match self.tags.get_mut(&tag) {
            Some(state @ AckState::Pending) => {
                *state = AckState::Acking;
                Ok(())
            }
            _ => Err(UnknownTagError { tag, epoch }),
        }
    }

    /// Marks the acknowledgment as sent and forgets the tag.
    pub fn complete_ack(&mut self, tag: u64) {
        self.tags.remove(&tag);
    }

    /// Drops all bookkeeping and moves to a new channel epoch. Called on
    /// recovery: the old channel's unacknowledged deliveries are the
    /// broker's to redeliver, not ours to acknowledge.
    pub fn discard_all(&mut self, epoch: u64) {
        self.tags.clear();
        self.epoch = epoch;
    }
}
