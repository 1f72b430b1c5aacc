//! Shared consumer pool.
//!
//! A process-wide pool of log consumers multiplexes every partition
//! subscription in the process. Each subscription gets its own bounded
//! delivery queue; when a queue fills up, only that subscription is paused
//! while the consumer keeps serving its other subscriptions. One partition's
//! slow local commit never stalls another's delivery.
//!
//! The pool is a dispatcher actor plus `consumer_pool_size` consumer tasks.
//! Subscriptions are spread across consumers by id and served round-robin
//! within each consumer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lagoon_core::{Limits, Offset, PartitionId, TopicName};
use lagoon_log::{LogBroker, LogEntry};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument, warn};

use crate::config::IngestionConfig;
use crate::error::{IngestionError, IngestionResult};

/// Identifier of one pool subscription.
pub type SubscriptionId = u64;

/// A record delivered from a subscribed topic partition.
#[derive(Debug, Clone)]
pub struct DeliveredRecord {
    /// Topic the record came from.
    pub topic: TopicName,
    /// Partition the record came from.
    pub partition: PartitionId,
    /// The log entry.
    pub entry: LogEntry,
}

/// Commands understood by the pool.
enum PoolCommand {
    Subscribe {
        id: SubscriptionId,
        topic: TopicName,
        partition: PartitionId,
        start: Offset,
        tx: mpsc::Sender<DeliveredRecord>,
        reply: oneshot::Sender<()>,
    },
    Unsubscribe {
        id: SubscriptionId,
        reply: oneshot::Sender<()>,
    },
    Shutdown,
}

/// Handle for subscribing partitions onto the shared pool.
#[derive(Clone)]
pub struct ConsumerPoolHandle {
    workers: Vec<mpsc::Sender<PoolCommand>>,
    next_id: Arc<AtomicU64>,
    queue_capacity: usize,
}

impl ConsumerPoolHandle {
    /// Subscribes a topic partition starting at `start`.
    ///
    /// Returns the subscription id and the bounded delivery queue.
    ///
    /// # Errors
    /// Returns `PoolShutdown` if the pool is gone.
    pub async fn subscribe(
        &self,
        topic: TopicName,
        partition: PartitionId,
        start: Offset,
    ) -> IngestionResult<(SubscriptionId, mpsc::Receiver<DeliveredRecord>)> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let (reply_tx, reply_rx) = oneshot::channel();

        self.worker_for(id)
            .send(PoolCommand::Subscribe {
                id,
                topic,
                partition,
                start,
                tx,
                reply: reply_tx,
            })
            .await
            .map_err(|_| IngestionError::PoolShutdown)?;
        reply_rx.await.map_err(|_| IngestionError::PoolShutdown)?;
        Ok((id, rx))
    }

    /// Removes a subscription. Records still queued are not retracted; the
    /// caller discards them by dropping the receiver.
    ///
    /// # Errors
    /// Returns `PoolShutdown` if the pool is gone.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> IngestionResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.worker_for(id)
            .send(PoolCommand::Unsubscribe { id, reply: reply_tx })
            .await
            .map_err(|_| IngestionError::PoolShutdown)?;
        reply_rx.await.map_err(|_| IngestionError::PoolShutdown)
    }

    /// Shuts the pool down.
    pub async fn shutdown(&self) {
        for worker in &self.workers {
            let _ = worker.send(PoolCommand::Shutdown).await;
        }
    }

    fn worker_for(&self, id: SubscriptionId) -> &mpsc::Sender<PoolCommand> {
        let index = (id as usize) % self.workers.len();
        &self.workers[index]
    }
}

impl std::fmt::Debug for ConsumerPoolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerPoolHandle")
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}

/// Spawns the shared consumer pool.
#[must_use]
pub fn spawn_consumer_pool(
    broker: LogBroker,
    config: &IngestionConfig,
    limits: Limits,
) -> ConsumerPoolHandle {
    let pool_size = config.consumer_pool_size.max(1);
    let mut workers = Vec::with_capacity(pool_size);
    for index in 0..pool_size {
        let (tx, rx) = mpsc::channel(config.channel_buffer);
        let consumer = PoolConsumer {
            index,
            broker: broker.clone(),
            limits,
            poll_interval: config.poll_interval,
            cmd_rx: rx,
            subscriptions: HashMap::new(),
            order: Vec::new(),
            cursor: 0,
        };
        tokio::spawn(consumer.run());
        workers.push(tx);
    }
    info!(consumers = pool_size, "shared consumer pool started");
    ConsumerPoolHandle {
        workers,
        next_id: Arc::new(AtomicU64::new(0)),
        queue_capacity: limits.ingest_queue_records_max as usize,
    }
}

/// One subscription's delivery state.
struct Subscription {
    topic: TopicName,
    partition: PartitionId,
    /// Next offset to deliver.
    position: Offset,
    tx: mpsc::Sender<DeliveredRecord>,
    /// Set while the delivery queue is full.
    paused: bool,
}

/// One consumer task of the pool.
struct PoolConsumer {
    index: usize,
    broker: LogBroker,
    limits: Limits,
    poll_interval: std::time::Duration,
    cmd_rx: mpsc::Receiver<PoolCommand>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    /// Round-robin service order.
    order: Vec<SubscriptionId>,
    cursor: usize,
}

impl PoolConsumer {
    #[instrument(skip(self), fields(consumer = self.index))]
    async fn run(mut self) {
        debug!("pool consumer started");
        loop {
            // Drain pending commands without blocking.
            loop {
                match self.cmd_rx.try_recv() {
                    Ok(PoolCommand::Shutdown) => {
                        debug!("pool consumer shutting down");
                        return;
                    }
                    Ok(cmd) => self.handle_command(cmd),
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => return,
                }
            }

            let delivered = self.poll_once();
            if delivered == 0 {
                // Nothing to deliver: block on the next command or tick.
                tokio::select! {
                    cmd = self.cmd_rx.recv() => match cmd {
                        Some(PoolCommand::Shutdown) | None => {
                            debug!("pool consumer shutting down");
                            return;
                        }
                        Some(cmd) => self.handle_command(cmd),
                    },
                    () = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }
    }

    fn handle_command(&mut self, cmd: PoolCommand) {
        match cmd {
            PoolCommand::Subscribe {
                id,
                topic,
                partition,
                start,
                tx,
                reply,
            } => {
                debug!(id, topic = %topic, %partition, %start, "subscribing");
                self.subscriptions.insert(
                    id,
                    Subscription {
                        topic,
                        partition,
                        position: start,
                        tx,
                        paused: false,
                    },
                );
                self.order.push(id);
                let _ = reply.send(());
            }
            PoolCommand::Unsubscribe { id, reply } => {
                if self.subscriptions.remove(&id).is_some() {
                    self.order.retain(|&other| other != id);
                    debug!(id, "unsubscribed");
                }
                let _ = reply.send(());
            }
            PoolCommand::Shutdown => unreachable!("handled by caller"),
        }
    }

    /// Serves every subscription once, round-robin, delivering up to
    /// `pool_poll_records_max` records each. Returns the number delivered.
    fn poll_once(&mut self) -> usize {
        if self.order.is_empty() {
            return 0;
        }
        let mut delivered = 0;
        let mut dead = Vec::new();
        let count = self.order.len();

        for step in 0..count {
            let id = self.order[(self.cursor + step) % count];
            let Some(sub) = self.subscriptions.get_mut(&id) else {
                continue;
            };
            match Self::serve_subscription(&self.broker, &self.limits, id, sub) {
                Ok(n) => delivered += n,
                Err(()) => dead.push(id),
            }
        }
        self.cursor = (self.cursor + 1) % count;

        for id in dead {
            self.subscriptions.remove(&id);
            self.order.retain(|&other| other != id);
            debug!(id, "dropping subscription with closed queue");
        }
        delivered
    }

    /// Delivers available records for one subscription.
    ///
    /// Returns `Err(())` when the receiver side is gone.
    fn serve_subscription(
        broker: &LogBroker,
        limits: &Limits,
        id: SubscriptionId,
        sub: &mut Subscription,
    ) -> Result<usize, ()> {
        // A topic that is not registered yet is a transient condition: the
        // subscription simply has nothing to deliver.
        let Some(topic) = broker.get(&sub.topic) else {
            return Ok(0);
        };
        let entries = match topic.read(sub.partition, sub.position, limits.pool_poll_records_max) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(id, topic = %sub.topic, partition = %sub.partition, %err, "read failed");
                return Ok(0);
            }
        };

        let mut delivered = 0;
        for entry in entries {
            match sub.tx.try_reserve() {
                Ok(permit) => {
                    let offset = entry.offset;
                    permit.send(DeliveredRecord {
                        topic: sub.topic.clone(),
                        partition: sub.partition,
                        entry,
                    });
                    sub.position = offset.next();
                    delivered += 1;
                    if sub.paused {
                        sub.paused = false;
                        debug!(id, "subscription resumed");
                    }
                }
                Err(mpsc::error::TrySendError::Full(())) => {
                    // Backpressure: pause this subscription, keep the rest
                    // of the pool flowing.
                    if !sub.paused {
                        sub.paused = true;
                        debug!(id, topic = %sub.topic, "subscription paused (queue full)");
                    }
                    break;
                }
                Err(mpsc::error::TrySendError::Closed(())) => return Err(()),
            }
        }
        Ok(delivered)
    }
}
