use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::mpsc::error::SendError;
use uuid::Uuid;

use crate::wire::Frame;

pub type PeerId = String;

/// One authenticated client connection as the broker sees it. Frames
/// queued here are serialized onto the socket by the connection's writer
/// task.
#[derive(Debug)]
pub struct Peer {
    pub id: PeerId,
    pub sender: UnboundedSender<Frame>,
}

impl Peer {
    pub fn new(sender: UnboundedSender<Frame>) -> Self {
        Self {
            id: format!("peer-{}", Uuid::new_v4()),
            sender,
        }
    }

    pub fn send(&self, frame: Frame) -> Result<(), SendError<Frame>> {
        self.sender.send(frame)
    }
}
