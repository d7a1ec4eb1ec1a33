use tracing::{debug, warn};
use uuid::Uuid;

use crate::channel::Channel;
use crate::transport::Session;
use crate::utils::error::PublishError;
use crate::wire::{Frame, QueueDescriptor};

/// Proof that a publish was handed off. `confirmed` is set only by
/// [`Publisher::publish_confirmed`], after the broker acknowledged
/// persistence.
#[derive(Debug, Clone)]
pub struct PublishReceipt {
    pub publish_id: String,
    pub confirmed: bool,
}

/// Publishes persistent messages onto one durable queue.
///
/// Every message is marked persistent and the target queue is declared
/// durable at bind time. Publishes are fire-and-forget by default;
/// [`Publisher::publish_confirmed`] returns only once the broker has
/// acknowledged the message, resending across reconnects until it does —
/// at-least-once semantics, so duplicates are possible and must be
/// tolerated downstream.
pub struct Publisher {
    session: Session,
    queue: QueueDescriptor,
    channel: Channel,
}

impl Publisher {
    /// Opens a channel and declares the target queue.
    pub async fn bind(session: &Session, queue: QueueDescriptor) -> Result<Self, PublishError> {
        let mut channel = session.open_channel()?;
        channel.declare_queue(&queue).await?;
        Ok(Self {
            session: session.clone(),
            queue,
            channel,
        })
    }

    /// Fire-and-forget publish. The frame is queued onto the session's
    /// send path; while the connection is down it queues locally (unless
    /// the session is configured to fail fast) and flushes on recovery.
    pub async fn publish(&mut self, payload: &[u8]) -> Result<PublishReceipt, PublishError> {
        self.ensure_channel().await?;
        let publish_id = Uuid::new_v4().to_string();
        self.channel.send(self.publish_frame(payload, &publish_id, false))?;
        Ok(PublishReceipt {
            publish_id,
            confirmed: false,
        })
    }

    /// Publish and wait for the broker's confirmation.
    ///
    /// If the connection drops before the confirm arrives, the publisher
    /// waits for the session to recover, reopens its channel and resends
    /// the same message — no caller intervention. It gives up only when
    /// the session itself is permanently closed.
    pub async fn publish_confirmed(
        &mut self,
        payload: &[u8],
    ) -> Result<PublishReceipt, PublishError> {
        let publish_id = Uuid::new_v4().to_string();
        loop {
            self.ensure_channel().await?;
            if let Err(e) = self
                .channel
                .send(self.publish_frame(payload, &publish_id, true))
            {
                debug!(error = %e, "publish send failed, awaiting recovery");
                self.session.wait_connected().await?;
                continue;
            }

            let wanted = publish_id.clone();
            match self
                .channel
                .wait_for(|frame| {
                    matches!(frame, Frame::PublishOk { publish_id, .. } if *publish_id == wanted)
                })
                .await
            {
                Ok(_) => {
                    return Ok(PublishReceipt {
                        publish_id,
                        confirmed: true,
                    });
                }
                Err(crate::utils::error::ChannelError::Closed(reason)) => {
                    // Channel-level protocol error; not a transport blip,
                    // so the publish itself is at fault.
                    return Err(PublishError::Rejected(reason));
                }
                Err(e) => {
                    warn!(error = %e, publish_id = %publish_id, "confirm interrupted, resending after recovery");
                    self.session.wait_connected().await?;
                }
            }
        }
    }

    fn publish_frame(&self, payload: &[u8], publish_id: &str, confirm: bool) -> Frame {
        Frame::Publish {
            channel: self.channel.id(),
            queue: self.queue.name.clone(),
            payload: payload.to_vec(),
            persistent: true,
            publish_id: publish_id.to_string(),
            confirm,
        }
    }

    /// Reopens the channel (and redeclares the queue) if a recovery has
    /// invalidated it since the last publish.
    async fn ensure_channel(&mut self) -> Result<(), PublishError> {
        if !self.channel.is_stale() {
            return Ok(());
        }
        self.session.wait_connected().await?;
        let mut channel = self.session.open_channel()?;
        channel.declare_queue(&self.queue).await?;
        self.channel = channel;
        Ok(())
    }
}
