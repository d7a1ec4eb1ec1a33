use serde::{Deserialize, Serialize};

/// A single protocol frame.
///
/// The first frame on a fresh connection must be [`Frame::Hello`]; the
/// broker answers [`Frame::HelloOk`] or [`Frame::Close`]. Every other frame
/// carries a `channel` id. Channels are a client-side construct: the broker
/// creates per-channel state lazily when it first sees a frame for an
/// unknown channel, and tears it down on [`Frame::CloseChannel`] or when
/// the connection drops.
///
/// Payloads are opaque bytes; no schema is imposed here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// Credential handshake, sent once per connection.
    Hello {
        vhost: String,
        username: String,
        password: String,
    },
    /// Handshake accepted.
    HelloOk {},

    /// Declare a queue. Idempotent: redeclaring with identical properties
    /// is a no-op, a property mismatch closes the channel.
    Declare {
        channel: u16,
        queue: String,
        durable: bool,
    },
    DeclareOk { channel: u16, queue: String },

    /// Bound the number of unacknowledged deliveries the broker will push
    /// on this channel before pausing. No reply; ordering on the socket
    /// guarantees it applies before a subsequent `Consume`.
    Prefetch { channel: u16, count: u32 },

    /// Publish a message to a named queue. When `confirm` is set the
    /// broker answers with a `PublishOk` carrying the same `publish_id`
    /// once the message is enqueued.
    Publish {
        channel: u16,
        queue: String,
        payload: Vec<u8>,
        persistent: bool,
        publish_id: String,
        confirm: bool,
    },
    PublishOk { channel: u16, publish_id: String },

    /// Register this channel as a consumer of a queue.
    Consume { channel: u16, queue: String },
    ConsumeOk { channel: u16 },
    /// Stop deliveries on this channel; unacknowledged messages stay out
    /// until acked, nacked, or the channel closes.
    CancelConsume { channel: u16 },

    /// A message pushed to a consumer. `delivery_tag` is unique for the
    /// lifetime of the channel; `attempt` counts delivery attempts of this
    /// message including the current one.
    Deliver {
        channel: u16,
        delivery_tag: u64,
        queue: String,
        payload: Vec<u8>,
        redelivered: bool,
        attempt: u32,
    },
    Ack { channel: u16, delivery_tag: u64 },
    Nack {
        channel: u16,
        delivery_tag: u64,
        requeue: bool,
    },

    /// Client-side channel teardown; the broker requeues anything still
    /// unacknowledged on it.
    CloseChannel { channel: u16 },
    /// Broker-side channel invalidation after a protocol error. Only the
    /// channel dies, not the connection.
    ChannelClosed { channel: u16, reason: String },

    /// Connection-level close.
    Close { reason: String },
}

impl Frame {
    /// The channel id this frame is scoped to, if any. Handshake and
    /// connection-level frames return `None`.
    pub fn channel_id(&self) -> Option<u16> {
        match self {
            Frame::Hello { .. } | Frame::HelloOk {} | Frame::Close { .. } => None,
            Frame::Declare { channel, .. }
            | Frame::DeclareOk { channel, .. }
            | Frame::Prefetch { channel, .. }
            | Frame::Publish { channel, .. }
            | Frame::PublishOk { channel, .. }
            | Frame::Consume { channel, .. }
            | Frame::ConsumeOk { channel }
            | Frame::CancelConsume { channel }
            | Frame::Deliver { channel, .. }
            | Frame::Ack { channel, .. }
            | Frame::Nack { channel, .. }
            | Frame::CloseChannel { channel }
            | Frame::ChannelClosed { channel, .. } => Some(*channel),
        }
    }
}
