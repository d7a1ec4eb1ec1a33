use tokio::sync::mpsc;
use tracing::debug;

use crate::transport::Session;
use crate::utils::error::ChannelError;
use crate::wire::{Frame, QueueDescriptor};

/// A multiplexed sub-connection on a [`Session`].
///
/// All frames a channel sends travel the session's single send path; all
/// frames the broker addresses to it arrive on its own inbound queue. A
/// channel captures the connection epoch it was opened under — after a
/// recovery it turns stale and refuses further work, and the owner opens a
/// fresh one.
///
/// A channel-level protocol error (a [`Frame::ChannelClosed`] from the
/// broker) invalidates only this channel, never the connection.
pub struct Channel {
    session: Session,
    id: u16,
    epoch: u64,
    inbound: mpsc::UnboundedReceiver<Frame>,
}

impl Channel {
    pub(crate) fn new(
        session: Session,
        id: u16,
        epoch: u64,
        inbound: mpsc::UnboundedReceiver<Frame>,
    ) -> Self {
        Self {
            session,
            id,
            epoch,
            inbound,
        }
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    /// The connection epoch this channel belongs to.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Whether the session has recovered since this channel was opened.
    /// Stale channels must be reopened, not reused: their delivery tags
    /// belong to a connection that no longer exists.
    pub fn is_stale(&self) -> bool {
        self.epoch != self.session.epoch()
    }

    /// Declares a queue. Idempotent: declaring an existing queue with
    /// matching properties is a no-op; a property mismatch is a fatal
    /// configuration error that closes this channel.
    pub async fn declare_queue(&mut self, queue: &QueueDescriptor) -> Result<(), ChannelError> {
        self.send(Frame::Declare {
            channel: self.id,
            queue: queue.name.clone(),
            durable: queue.durable,
        })?;
        let name = queue.name.clone();
        self.wait_for(|frame| matches!(frame, Frame::DeclareOk { queue, .. } if *queue == name))
            .await?;
        Ok(())
    }

    /// Bounds the number of unacknowledged deliveries the broker pushes on
    /// this channel before pausing — the backpressure mechanism. Takes
    /// effect before any subsequent `Consume` thanks to socket ordering.
    pub fn set_prefetch(&self, count: u32) -> Result<(), ChannelError> {
        self.send(Frame::Prefetch {
            channel: self.id,
            count,
        })
    }

    /// Next frame addressed to this channel. `None` means the channel's
    /// connection went away (the session is recovering or closed).
    pub async fn recv(&mut self) -> Option<Frame> {
        self.inbound.recv().await
    }

    pub(crate) fn send(&self, frame: Frame) -> Result<(), ChannelError> {
        if self.is_stale() {
            return Err(ChannelError::Stale);
        }
        self.session.send_frame(frame)
    }

    /// Reads frames until `pred` matches. A broker-side channel close or a
    /// dropped connection surfaces as the corresponding error; unrelated
    /// frames are logged and skipped.
    pub(crate) async fn wait_for<F>(&mut self, pred: F) -> Result<Frame, ChannelError>
    where
        F: Fn(&Frame) -> bool,
    {
        while let Some(frame) = self.inbound.recv().await {
            if pred(&frame) {
                return Ok(frame);
            }
            match frame {
                Frame::ChannelClosed { reason, .. } => return Err(ChannelError::Closed(reason)),
                other => debug!(channel = self.id, frame = ?other, "skipping unexpected frame"),
            }
        }
        if self.is_stale() {
            Err(ChannelError::Stale)
        } else {
            Err(ChannelError::Disconnected)
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.session.deregister_channel(self.id);
        // Tell the broker only if this channel still belongs to the live
        // connection; after a recovery it has nothing to tear down.
        if !self.is_stale() {
            let _ = self.session.send_frame(Frame::CloseChannel { channel: self.id });
        }
    }
}
