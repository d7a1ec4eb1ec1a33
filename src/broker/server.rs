//! Broker WebSocket server
//!
//! Accepts client connections, enforces a hello-first handshake against
//! the configured credentials, and translates protocol frames into engine
//! operations. Each connection gets a writer task that serializes frames
//! queued by the engine onto the socket, so the engine never blocks on
//! network I/O.

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::spawn;
use tokio::sync::mpsc;
use tokio_tungstenite::{WebSocketStream, accept_async};
use tracing::{debug, error, info, warn};
use tungstenite::protocol::Message as WsMessage;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::broker::engine::Engine;
use crate::broker::peer::{Peer, PeerId};
use crate::config::BrokerSettings;
use crate::wire::{Frame, QueueDescriptor};

pub async fn start_broker_server(addr: String, engine: Arc<Mutex<Engine>>, settings: BrokerSettings) {
    let listener = TcpListener::bind(addr.clone()).await.expect("Can't bind");

    info!("broker listening on ws://{addr}");

    while let Ok((stream, _)) = listener.accept().await {
        let engine = engine.clone();
        let settings = settings.clone();

        tokio::spawn(async move {
            handle_connection(stream, engine, settings).await;
        });
    }
}

async fn handle_connection(stream: TcpStream, engine: Arc<Mutex<Engine>>, settings: BrokerSettings) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake error: {e}");
            return;
        }
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let peer = Peer::new(tx.clone());
    let peer_id = peer.id.clone();

    let cleanup_called = Arc::new(AtomicBool::new(false));
    let do_cleanup = {
        let engine = engine.clone();
        let peer_id = peer_id.clone();
        let cleanup_called = cleanup_called.clone();

        move || {
            if !cleanup_called.swap(true, Ordering::SeqCst) {
                let mut engine = engine.lock().unwrap();
                engine.cleanup_peer(&peer_id);
            }
        }
    };

    // Writer: drains the peer's frame queue onto the socket. A `Close`
    // frame is sent and then terminates the connection.
    {
        let peer_id = peer_id.clone();
        let do_cleanup = do_cleanup.clone();

        spawn(async move {
            while let Some(frame) = rx.recv().await {
                let closing = matches!(frame, Frame::Close { .. });
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        error!("failed to serialize frame for {peer_id}: {e}");
                        continue;
                    }
                };
                if let Err(e) = ws_sender.send(WsMessage::Text(text.into())).await {
                    warn!("failed to send frame to {peer_id}: {e}");
                    break;
                }
                if closing {
                    let _ = ws_sender.close().await;
                    break;
                }
            }

            do_cleanup();
            debug!("send loop closed for {peer_id}");
        });
    }

    match authenticate(&mut ws_receiver, &settings).await {
        Ok(()) => {
            let _ = tx.send(Frame::HelloOk {});
            let mut engine = engine.lock().unwrap();
            engine.register_peer(peer);
            info!("{peer_id} connected");
        }
        Err(reason) => {
            warn!("{peer_id} rejected: {reason}");
            let _ = tx.send(Frame::Close { reason });
            return;
        }
    }

    while let Some(Ok(msg)) = ws_receiver.next().await {
        if !msg.is_text() {
            continue;
        }
        let text = match msg.to_text() {
            Ok(text) => text,
            Err(_) => continue,
        };
        let frame = match serde_json::from_str::<Frame>(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(
                    "invalid frame from {peer_id}: {err} | {}",
                    &text.chars().take(100).collect::<String>()
                );
                continue;
            }
        };
        if let Frame::Close { reason } = frame {
            debug!("{peer_id} closing: {reason}");
            break;
        }
        let mut engine = engine.lock().unwrap();
        handle_frame(&mut engine, &peer_id, frame);
    }

    info!("{peer_id} disconnected");
    do_cleanup();
}

/// The first frame on a connection must be a `hello` carrying the
/// configured vhost and credentials.
async fn authenticate(
    receiver: &mut SplitStream<WebSocketStream<TcpStream>>,
    settings: &BrokerSettings,
) -> Result<(), String> {
    while let Some(Ok(msg)) = receiver.next().await {
        if !msg.is_text() {
            continue;
        }
        let text = msg.to_text().map_err(|_| "invalid utf-8".to_string())?;
        return match serde_json::from_str::<Frame>(text) {
            Ok(Frame::Hello {
                vhost,
                username,
                password,
            }) => {
                if vhost != settings.vhost {
                    Err(format!("unknown vhost '{vhost}'"))
                } else if username != settings.username || password != settings.password {
                    Err("invalid credentials".to_string())
                } else {
                    Ok(())
                }
            }
            Ok(_) => Err("expected hello as first frame".to_string()),
            Err(err) => Err(format!("invalid hello frame: {err}")),
        };
    }
    Err("connection closed before hello".to_string())
}

fn handle_frame(engine: &mut Engine, peer_id: &PeerId, frame: Frame) {
    match frame {
        Frame::Declare {
            channel,
            queue,
            durable,
        } => {
            engine.declare(
                peer_id,
                channel,
                QueueDescriptor {
                    name: queue,
                    durable,
                },
            );
        }
        Frame::Prefetch { channel, count } => {
            engine.set_prefetch(peer_id, channel, count);
        }
        Frame::Publish {
            channel,
            queue,
            payload,
            publish_id,
            confirm,
            // In-memory broker: every message is held the same way, so the
            // persistence flag carries no extra meaning here.
            persistent: _,
        } => {
            engine.publish(peer_id, channel, &queue, payload, publish_id, confirm);
        }
        Frame::Consume { channel, queue } => {
            engine.consume(peer_id, channel, &queue);
        }
        Frame::CancelConsume { channel } => {
            engine.cancel_consume(peer_id, channel);
        }
        Frame::Ack {
            channel,
            delivery_tag,
        } => {
            engine.ack(peer_id, channel, delivery_tag);
        }
        Frame::Nack {
            channel,
            delivery_tag,
            requeue,
        } => {
            engine.nack(peer_id, channel, delivery_tag, requeue);
        }
        Frame::CloseChannel { channel } => {
            engine.close_channel(peer_id, channel);
        }
        other => {
            warn!("unexpected frame from {peer_id}: {other:?}");
        }
    }
}
