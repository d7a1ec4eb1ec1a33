use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::channel::Channel;
use crate::config::ConsumerSettings;
use crate::consume::tracker::DeliveryTracker;
use crate::transport::Session;
use crate::utils::error::{ChannelError, HandlerError};
use crate::wire::{Frame, QueueDescriptor};

/// One message as handed to a consumer handler. Immutable once received.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Opaque byte payload; no schema is imposed by this core.
    pub payload: Vec<u8>,
    /// Set when the broker has delivered this message before.
    pub redelivered: bool,
    /// Delivery attempts including this one.
    pub attempt: u32,
    /// Broker-assigned tag, unique per channel lifetime.
    pub delivery_tag: u64,
}

/// Tunables of the worker pool.
#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    /// Handler invocations in flight at once; also the channel prefetch,
    /// so the broker holds back anything beyond it.
    pub concurrency: u32,
    /// Redeliveries a message gets after a failed attempt before it is
    /// dead-lettered instead of requeued.
    pub max_retries: u32,
    /// Grace period for in-flight handlers when the subscription is
    /// cancelled.
    pub drain_timeout: Duration,
}

impl Default for ConsumeOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            max_retries: 3,
            drain_timeout: Duration::from_secs(5),
        }
    }
}

impl ConsumeOptions {
    pub fn from_settings(settings: &ConsumerSettings) -> Self {
        Self {
            concurrency: settings.concurrency,
            max_retries: settings.max_retries,
            drain_timeout: Duration::from_millis(settings.drain_timeout_ms),
        }
    }
}

/// Lifecycle of one worker slot, for the logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Idle,
    Dispatched,
    Processing,
    Acking,
    Done,
}

type HandlerFn = Arc<dyn Fn(Delivery) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// Handle on a running consumer. Dropping it without calling
/// [`Subscription::cancel`] leaves the pool running for the life of the
/// session.
pub struct Subscription {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
    in_flight: Arc<AtomicUsize>,
}

impl Subscription {
    /// Handlers currently running (the Processing slots).
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Stops new deliveries, waits up to the drain timeout for Processing
    /// slots to finish, then closes the channel. Messages still running at
    /// the deadline are released unacknowledged and will be redelivered.
    pub async fn cancel(self) {
        let _ = self.cancel.send(true);
        let _ = self.task.await;
    }
}

struct PoolContext {
    session: Session,
    queue: QueueDescriptor,
    dlq: QueueDescriptor,
    handler: HandlerFn,
    tracker: Arc<Mutex<DeliveryTracker>>,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<AtomicUsize>,
    options: ConsumeOptions,
}

/// Starts consuming `queue` with at most `options.concurrency` concurrent
/// handler invocations.
///
/// The pool declares the queue and its dead-letter sibling, sets the
/// channel prefetch to the concurrency, and dispatches each delivery to
/// its own task. Handler success acknowledges the message exactly once;
/// handler failure requeues it, or dead-letters it once its attempts
/// exceed `options.max_retries`. Handler errors never crash the pool.
pub async fn consume<F, Fut>(
    session: &Session,
    queue: QueueDescriptor,
    handler: F,
    options: ConsumeOptions,
) -> Result<Subscription, ChannelError>
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    let handler: HandlerFn = Arc::new(move |delivery| Box::pin(handler(delivery)));
    let dlq = queue.dead_letter();
    let channel = establish(session, &queue, &dlq, options.concurrency).await?;

    let ctx = PoolContext {
        session: session.clone(),
        queue,
        dlq,
        handler,
        tracker: Arc::new(Mutex::new(DeliveryTracker::new(channel.epoch()))),
        semaphore: Arc::new(Semaphore::new(options.concurrency as usize)),
        in_flight: Arc::new(AtomicUsize::new(0)),
        options,
    };
    let in_flight = ctx.in_flight.clone();
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let task = tokio::spawn(run_pool(ctx, channel, cancel_rx));

    Ok(Subscription {
        cancel: cancel_tx,
        task,
        in_flight,
    })
}

/// Opens a channel, declares both queues, applies prefetch and registers
/// the consumer.
async fn establish(
    session: &Session,
    queue: &QueueDescriptor,
    dlq: &QueueDescriptor,
    concurrency: u32,
) -> Result<Channel, ChannelError> {
    let mut channel = session.open_channel()?;
    channel.declare_queue(queue).await?;
    channel.declare_queue(dlq).await?;
    channel.set_prefetch(concurrency)?;
    channel.send(Frame::Consume {
        channel: channel.id(),
        queue: queue.name.clone(),
    })?;
    channel
        .wait_for(|frame| matches!(frame, Frame::ConsumeOk { .. }))
        .await?;
    Ok(channel)
}

async fn run_pool(ctx: PoolContext, mut channel: Channel, mut cancel: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    drain(&ctx, channel).await;
                    return;
                }
            }
            frame = channel.recv() => match frame {
                Some(Frame::Deliver { delivery_tag, payload, redelivered, attempt, .. }) => {
                    dispatch(&ctx, &channel, delivery_tag, payload, redelivered, attempt);
                }
                Some(Frame::ChannelClosed { reason, .. }) => {
                    warn!(%reason, "consumer channel closed by broker, reopening");
                    match rebuild(&ctx, &mut cancel).await {
                        Some(fresh) => channel = fresh,
                        None => return,
                    }
                }
                Some(other) => debug!(frame = ?other, "ignoring frame"),
                None => {
                    // Connection lost. The broker redelivers whatever was
                    // unacknowledged once it notices; our bookkeeping for
                    // the dead channel is discarded, not carried over.
                    match rebuild(&ctx, &mut cancel).await {
                        Some(fresh) => channel = fresh,
                        None => return,
                    }
                }
            },
        }
    }
}

/// Waits for the session to be connected again, wipes the tracker for the
/// new epoch and re-registers the consumer. `None` means the subscription
/// was cancelled or the session is permanently closed.
async fn rebuild(ctx: &PoolContext, cancel: &mut watch::Receiver<bool>) -> Option<Channel> {
    loop {
        if *cancel.borrow() {
            return None;
        }
        tokio::select! {
            connected = ctx.session.wait_connected() => {
                if let Err(e) = connected {
                    info!(error = %e, "session closed, consumer stops");
                    return None;
                }
            }
            _ = cancel.changed() => continue,
        }

        ctx.tracker
            .lock()
            .unwrap()
            .discard_all(ctx.session.epoch());

        match establish(&ctx.session, &ctx.queue, &ctx.dlq, ctx.options.concurrency).await {
            Ok(channel) => {
                info!(queue = %ctx.queue.name, epoch = channel.epoch(), "consumer re-established");
                return Some(channel);
            }
            Err(e) => {
                warn!(error = %e, "failed to re-establish consumer, retrying");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

fn dispatch(
    ctx: &PoolContext,
    channel: &Channel,
    delivery_tag: u64,
    payload: Vec<u8>,
    redelivered: bool,
    attempt: u32,
) {
    let epoch = ctx.tracker.lock().unwrap().track(delivery_tag);
    debug!(tag = delivery_tag, state = ?SlotState::Dispatched, "delivery dispatched");

    let worker = Worker {
        session: ctx.session.clone(),
        channel_id: channel.id(),
        epoch,
        tracker: ctx.tracker.clone(),
        handler: ctx.handler.clone(),
        dlq: ctx.dlq.name.clone(),
        max_retries: ctx.options.max_retries,
        in_flight: ctx.in_flight.clone(),
    };
    let semaphore = ctx.semaphore.clone();
    let delivery = Delivery {
        payload,
        redelivered,
        attempt,
        delivery_tag,
    };
    tokio::spawn(async move {
        let Ok(permit) = semaphore.acquire_owned().await else {
            return;
        };
        worker.run(delivery).await;
        drop(permit);
        debug!(state = ?SlotState::Idle, "slot free");
    });
}

/// How a worker settles its delivery. Each variant resolves the tag
/// exactly once.
enum Resolution {
    Ack,
    Requeue,
    DeadLetter(Vec<u8>),
}

struct Worker {
    session: Session,
    channel_id: u16,
    epoch: u64,
    tracker: Arc<Mutex<DeliveryTracker>>,
    handler: HandlerFn,
    dlq: String,
    max_retries: u32,
    in_flight: Arc<AtomicUsize>,
}

impl Worker {
    async fn run(self, delivery: Delivery) {
        let tag = delivery.delivery_tag;
        let attempt = delivery.attempt;
        let payload = delivery.payload.clone();

        let gauge = InFlightGuard::enter(self.in_flight.clone());
        debug!(tag, attempt, state = ?SlotState::Processing, "handler running");
        let result = (self.handler)(delivery).await;
        drop(gauge);

        match result {
            Ok(()) => {
                debug!(tag, state = ?SlotState::Acking, "acknowledging");
                self.resolve(tag, Resolution::Ack);
            }
            Err(e) => {
                // attempt counts the current delivery, so the message has
                // been redelivered (attempt - 1) times already.
                if attempt > self.max_retries {
                    error!(tag, attempt, error = %e, "handler failed terminally, dead-lettering");
                    self.resolve(tag, Resolution::DeadLetter(payload));
                } else {
                    warn!(tag, attempt, error = %e, "handler failed, requeueing");
                    self.resolve(tag, Resolution::Requeue);
                }
            }
        }
        debug!(tag, state = ?SlotState::Done, "delivery settled");
    }

    fn resolve(&self, tag: u64, resolution: Resolution) {
        if let Err(e) = self.tracker.lock().unwrap().begin_ack(tag, self.epoch) {
            // Stale or duplicate acknowledgment: the broker already owns
            // this message again. Logged, never sent.
            warn!(tag, error = %e, "acknowledgment dropped");
            return;
        }

        let frames = match resolution {
            Resolution::Ack => vec![Frame::Ack {
                channel: self.channel_id,
                delivery_tag: tag,
            }],
            Resolution::Requeue => vec![Frame::Nack {
                channel: self.channel_id,
                delivery_tag: tag,
                requeue: true,
            }],
            Resolution::DeadLetter(payload) => vec![
                Frame::Publish {
                    channel: self.channel_id,
                    queue: self.dlq.clone(),
                    payload,
                    persistent: true,
                    publish_id: Uuid::new_v4().to_string(),
                    confirm: false,
                },
                Frame::Ack {
                    channel: self.channel_id,
                    delivery_tag: tag,
                },
            ],
        };
        for frame in frames {
            if self.session.send_frame(frame).is_err() {
                warn!(tag, "connection lost before acknowledgment reached the broker");
                return;
            }
        }
        self.tracker.lock().unwrap().complete_ack(tag);
    }
}

/// Keeps the Processing gauge honest even if a handler panics.
struct InFlightGuard(Arc<AtomicUsize>);

impl InFlightGuard {
    fn enter(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Stops deliveries and gives running handlers until the drain timeout to
/// finish; whatever is still unacknowledged when the channel closes goes
/// back to the broker for redelivery.
async fn drain(ctx: &PoolContext, channel: Channel) {
    let _ = channel.send(Frame::CancelConsume {
        channel: channel.id(),
    });
    let all_slots = ctx
        .semaphore
        .clone()
        .acquire_many_owned(ctx.options.concurrency);
    match tokio::time::timeout(ctx.options.drain_timeout, all_slots).await {
        Ok(_) => info!(queue = %ctx.queue.name, "consumer drained cleanly"),
        Err(_) => warn!(
            queue = %ctx.queue.name,
            timeout_ms = ctx.options.drain_timeout.as_millis() as u64,
            "drain timed out, releasing unacknowledged deliveries"
        ),
    }
    drop(channel);
}
