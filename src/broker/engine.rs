//! Broker engine
//!
//! The in-memory queueing core behind the embedded broker:
//! - idempotent declaration of named queues,
//! - FIFO dispatch to consumers, bounded by each consumer's prefetch,
//! - delivery-tag bookkeeping for ack/nack,
//! - requeueing of unacknowledged deliveries when a channel or a whole
//!   connection goes away.
//!
//! The public API is synchronous and meant to be held behind a lock
//! (`Arc<Mutex<Engine>>`) by the transport layer. All sends to peers go
//! through unbounded queues, so no network I/O happens under the lock.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::broker::peer::{Peer, PeerId};
use crate::broker::queue::{ConsumerSlot, Queue, StoredMessage};
use crate::wire::{Frame, QueueDescriptor};

#[derive(Debug, Default)]
pub struct Engine {
    queues: HashMap<String, Queue>,
    peers: HashMap<PeerId, Peer>,
    /// Prefetch set per (peer, channel) ahead of consumer registration.
    prefetch: HashMap<(PeerId, u16), u32>,
    /// Delivery-tag counters per (peer, channel). One counter per channel
    /// keeps tags unique across every queue the channel consumes.
    next_tags: HashMap<(PeerId, u16), u64>,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_peer(&mut self, peer: Peer) {
        self.peers.insert(peer.id.clone(), peer);
    }

    /// Tears down everything a disconnected peer left behind: its
    /// consumer slots are removed and their unacknowledged deliveries go
    /// back to the front of their queues, marked redelivered.
    pub fn cleanup_peer(&mut self, peer_id: &PeerId) {
        self.peers.remove(peer_id);
        self.prefetch.retain(|(peer, _), _| peer != peer_id);
        self.next_tags.retain(|(peer, _), _| peer != peer_id);

        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            let released = self.release_slots(&name, |slot| slot.peer == *peer_id);
            if released {
                self.dispatch(&name);
            }
        }
        info!(peer = %peer_id, "cleaned up peer");
    }

    /// Idempotent queue declaration. Matching properties are a no-op;
    /// mismatched properties close the declaring channel — the channel's
    /// state is torn down broker-side too, so its unacknowledged
    /// deliveries go straight back to their queues.
    pub fn declare(&mut self, peer_id: &PeerId, channel: u16, descriptor: QueueDescriptor) {
        let existing = self.queues.get(&descriptor.name).map(|q| q.descriptor.clone());
        let reply = match existing {
            Some(existing) if existing == descriptor => Frame::DeclareOk {
                channel,
                queue: descriptor.name,
            },
            Some(existing) => {
                warn!(queue = %descriptor.name, "declare with mismatched properties");
                self.close_channel(peer_id, channel);
                Frame::ChannelClosed {
                    channel,
                    reason: format!(
                        "queue '{}' exists with durable={}, declared with durable={}",
                        descriptor.name, existing.durable, descriptor.durable
                    ),
                }
            }
            None => {
                info!(queue = %descriptor.name, durable = descriptor.durable, "queue declared");
                let name = descriptor.name.clone();
                self.queues.insert(name.clone(), Queue::new(descriptor));
                Frame::DeclareOk {
                    channel,
                    queue: name,
                }
            }
        };
        self.send_to(peer_id, reply);
    }

    /// Applies to consumers registered on this channel afterwards, and to
    /// one already present.
    pub fn set_prefetch(&mut self, peer_id: &PeerId, channel: u16, count: u32) {
        self.prefetch.insert((peer_id.clone(), channel), count);
        let mut affected = Vec::new();
        for (name, queue) in self.queues.iter_mut() {
            for slot in queue.consumers.iter_mut() {
                if slot.peer == *peer_id && slot.channel == channel {
                    slot.prefetch = count;
                    affected.push(name.clone());
                }
            }
        }
        for name in affected {
            self.dispatch(&name);
        }
    }

    pub fn consume(&mut self, peer_id: &PeerId, channel: u16, queue_name: &str) {
        if !self.queues.contains_key(queue_name) {
            self.close_channel(peer_id, channel);
            self.send_to(
                peer_id,
                Frame::ChannelClosed {
                    channel,
                    reason: format!("cannot consume from unknown queue '{queue_name}'"),
                },
            );
            return;
        }
        let prefetch = self
            .prefetch
            .get(&(peer_id.clone(), channel))
            .copied()
            .unwrap_or(0);
        if let Some(queue) = self.queues.get_mut(queue_name) {
            queue
                .consumers
                .push(ConsumerSlot::new(peer_id.clone(), channel, prefetch));
        }
        debug!(peer = %peer_id, channel, queue = queue_name, prefetch, "consumer registered");
        self.send_to(peer_id, Frame::ConsumeOk { channel });
        self.dispatch(queue_name);
    }

    /// Stops deliveries to this channel. Unacknowledged messages stay out
    /// until acked, nacked, or the channel closes.
    pub fn cancel_consume(&mut self, peer_id: &PeerId, channel: u16) {
        for queue in self.queues.values_mut() {
            let mut i = 0;
            while i < queue.consumers.len() {
                if queue.consumers[i].peer == *peer_id && queue.consumers[i].channel == channel {
                    let slot = queue.consumers.remove(i);
                    queue.rr_next = 0;
                    queue.cancelled.push(slot);
                } else {
                    i += 1;
                }
            }
        }
    }

    /// Channel teardown: like cancel, but everything still unacknowledged
    /// is requeued for redelivery.
    pub fn close_channel(&mut self, peer_id: &PeerId, channel: u16) {
        self.prefetch.remove(&(peer_id.clone(), channel));
        self.next_tags.remove(&(peer_id.clone(), channel));
        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            let released =
                self.release_slots(&name, |slot| slot.peer == *peer_id && slot.channel == channel);
            if released {
                self.dispatch(&name);
            }
        }
    }

    pub fn publish(
        &mut self,
        peer_id: &PeerId,
        channel: u16,
        queue_name: &str,
        payload: Vec<u8>,
        publish_id: String,
        confirm: bool,
    ) {
        match self.queues.get_mut(queue_name) {
            Some(queue) => {
                queue.ready.push_back(StoredMessage {
                    payload,
                    attempt: 0,
                    redelivered: false,
                    enqueued_at: chrono::Utc::now().timestamp_millis(),
                });
            }
            None => {
                warn!(queue = queue_name, "publish to unknown queue dropped");
                return;
            }
        }
        if confirm {
            self.send_to(peer_id, Frame::PublishOk { channel, publish_id });
        }
        self.dispatch(queue_name);
    }

    /// Settles one delivery. The tag identifies the message uniquely
    /// within its channel, whichever queue it was delivered from. An
    /// unknown tag (already settled, or from a channel that no longer
    /// exists) is logged and ignored.
    pub fn ack(&mut self, peer_id: &PeerId, channel: u16, delivery_tag: u64) {
        let mut affected = None;
        for (name, queue) in self.queues.iter_mut() {
            let Some(slot) = find_slot(queue, peer_id, channel) else {
                continue;
            };
            if slot.unacked.remove(&delivery_tag).is_some() {
                affected = Some(name.clone());
                break;
            }
        }
        match affected {
            Some(name) => self.dispatch(&name),
            None => {
                warn!(peer = %peer_id, tag = delivery_tag, "ack for unknown delivery tag ignored");
            }
        }
    }

    /// Negative acknowledgment. With `requeue` the message returns to the
    /// front of the queue, marked redelivered; without, it is dropped.
    pub fn nack(&mut self, peer_id: &PeerId, channel: u16, delivery_tag: u64, requeue: bool) {
        let mut affected = None;
        for (name, queue) in self.queues.iter_mut() {
            let removed = match find_slot(queue, peer_id, channel) {
                Some(slot) => slot.unacked.remove(&delivery_tag),
                None => continue,
            };
            if let Some(mut msg) = removed {
                if requeue {
                    msg.redelivered = true;
                    queue.ready.push_front(msg);
                } else {
                    debug!(tag = delivery_tag, "message dropped by nack");
                }
                affected = Some(name.clone());
                break;
            }
        }
        match affected {
            Some(name) => self.dispatch(&name),
            None => {
                warn!(peer = %peer_id, tag = delivery_tag, "nack for unknown delivery tag ignored");
            }
        }
    }

    /// Messages at rest in the queue (excludes unacknowledged deliveries).
    pub fn queue_depth(&self, name: &str) -> usize {
        self.queues.get(name).map(Queue::depth).unwrap_or(0)
    }

    /// Deliveries currently parked at consumers awaiting acknowledgment.
    pub fn unacked_count(&self, name: &str) -> usize {
        self.queues.get(name).map(Queue::unacked).unwrap_or(0)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Asks every connected peer's writer to send a connection close and
    /// drop the socket. Peer cleanup then runs through the normal
    /// disconnect path.
    pub fn disconnect_all_peers(&mut self) {
        for peer in self.peers.values() {
            let _ = peer.send(Frame::Close {
                reason: "connection closed by broker".to_string(),
            });
        }
    }

    /// Removes matching slots from a queue and requeues their
    /// unacknowledged deliveries. Returns whether anything matched.
    fn release_slots<F>(&mut self, queue_name: &str, pred: F) -> bool
    where
        F: Fn(&ConsumerSlot) -> bool,
    {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return false;
        };
        let mut released = Vec::new();
        for list in [&mut queue.consumers, &mut queue.cancelled] {
            let mut i = 0;
            while i < list.len() {
                if pred(&list[i]) {
                    released.push(list.remove(i));
                } else {
                    i += 1;
                }
            }
        }
        if released.is_empty() {
            return false;
        }
        queue.rr_next = 0;

        // Requeue in tag order at the front so the overall order stays
        // roughly FIFO.
        let mut messages: Vec<(u64, StoredMessage)> = Vec::new();
        for slot in released {
            messages.extend(slot.unacked);
        }
        messages.sort_by_key(|(tag, _)| *tag);
        for (_, mut msg) in messages.into_iter().rev() {
            msg.redelivered = true;
            queue.ready.push_front(msg);
        }
        true
    }

    /// Pushes ready messages to consumers with spare prefetch credit,
    /// round-robin, until the queue drains or every consumer is full.
    fn dispatch(&mut self, queue_name: &str) {
        loop {
            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            if queue.ready.is_empty() || queue.consumers.is_empty() {
                return;
            }

            let n = queue.consumers.len();
            let mut picked = None;
            for i in 0..n {
                let idx = (queue.rr_next + i) % n;
                if queue.consumers[idx].has_capacity() {
                    picked = Some(idx);
                    break;
                }
            }
            // Every consumer is at its prefetch limit: the broker holds
            // the rest until an acknowledgment frees a slot.
            let Some(idx) = picked else {
                return;
            };
            queue.rr_next = (idx + 1) % n;

            let (peer_id, channel) = {
                let slot = &queue.consumers[idx];
                (slot.peer.clone(), slot.channel)
            };
            let Some(mut msg) = queue.ready.pop_front() else {
                return;
            };
            msg.attempt += 1;

            // Tags are unique per (peer, channel) for the channel's whole
            // lifetime, across every queue it consumes.
            let counter = self
                .next_tags
                .entry((peer_id.clone(), channel))
                .or_insert(0);
            *counter += 1;
            let tag = *counter;

            let waited_ms = chrono::Utc::now().timestamp_millis() - msg.enqueued_at;
            debug!(peer = %peer_id, channel, tag, waited_ms, "message dispatched");

            let frame = Frame::Deliver {
                channel,
                delivery_tag: tag,
                queue: queue_name.to_string(),
                payload: msg.payload.clone(),
                redelivered: msg.redelivered,
                attempt: msg.attempt,
            };
            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            queue.consumers[idx].unacked.insert(tag, msg);

            let sent = match self.peers.get(&peer_id) {
                Some(peer) => peer.send(frame).is_ok(),
                None => false,
            };
            if !sent {
                warn!(peer = %peer_id, queue = queue_name, "consumer unreachable, releasing its slot");
                self.release_slots(queue_name, |slot| {
                    slot.peer == peer_id && slot.channel == channel
                });
            }
        }
    }

    fn send_to(&self, peer_id: &PeerId, frame: Frame) {
        match self.peers.get(peer_id) {
            Some(peer) => {
                if peer.send(frame).is_err() {
                    warn!(peer = %peer_id, "failed to send to peer");
                }
            }
            None => warn!(peer = %peer_id, "no peer registered"),
        }
    }
}

/// Finds the consumer slot for (peer, channel), looking through live and
/// cancelled consumers — acks from a cancelled consumer are still valid.
fn find_slot<'a>(
    queue: &'a mut Queue,
    peer_id: &PeerId,
    channel: u16,
) -> Option<&'a mut ConsumerSlot> {
    if let Some(i) = queue
        .consumers
        .iter()
        .position(|s| s.peer == *peer_id && s.channel == channel)
    {
        return Some(&mut queue.consumers[i]);
    }
    if let Some(i) = queue
        .cancelled
        .iter()
        .position(|s| s.peer == *peer_id && s.channel == channel)
    {
        return Some(&mut queue.cancelled[i]);
    }
    None
}
