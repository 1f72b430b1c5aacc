//! The per-partition leader/follower ingestor.
//!
//! Each partition replica runs one drainer task with exclusive write access
//! to its partition column and DIV state — no locks guard that state,
//! ownership does. The task selects over three inputs: commands from the
//! service, role signals from the membership oracle, and records delivered
//! by the shared consumer pool.
//!
//! # State machine
//!
//! ```text
//!                 oracle: follower
//!   Bootstrap ───────────────────────► FollowerConsumingVt
//!       │                                   │         ▲
//!       │ oracle: leader                    │ promote │ demote
//!       ▼                                   ▼ (delay) │
//!   LeaderCatchupVt ◄───────────────────────┘         │
//!       │ caught up to promotion-time VT end          │
//!       ▼                                             │
//!   LeaderConsumingUpstream ──────────────────────────┘
//!       │ EndOfPush, batch-only store
//!       ▼
//!   CompletedBatch
//! ```
//!
//! A leader's upstream starts as the version topic itself (batch pass-
//! through) and is replaced by the directive of the most recent
//! `TopicSwitch`/`StartOfBufferReplay` observed in the version topic. When
//! several switch directives arrive back to back, only the last one
//! executes; records already delivered from a superseded upstream are
//! discarded because their source topic no longer matches.

use std::sync::Arc;

use bytes::Bytes;
use lagoon_core::{
    ControlMessage, LeaderFooter, Limits, MessageEnvelope, Offset, PartitionId, Payload, SchemaId,
    StoreVersionConfig, Timestamp, TopicName,
};
use lagoon_div::{DivConfig, DivOutcome, DivValidator};
use lagoon_log::LogBroker;
use lagoon_store::{PartitionStore, ReplicaCheckpoint, WriteBatch, WriteOp};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{debug, error, info, instrument, warn};

use crate::chunking::ChunkAssembler;
use crate::config::IngestionConfig;
use crate::control::{interpret, ControlDirective, SwitchDirective};
use crate::error::{IngestionError, IngestionResult};
use crate::oracle::ReplicaRole;
use crate::pool::{ConsumerPoolHandle, DeliveredRecord, SubscriptionId};
use crate::producer::VersionTopicProducer;
use crate::status::{IngestionCounters, PushStatusEvent, ReplicaStatus};

/// Commands accepted by a partition ingestor.
#[derive(Debug)]
pub enum IngestorCommand {
    /// Stop the ingestor.
    Stop {
        /// When true, block until in-flight work is committed; when false,
        /// abandon after the configured budget and replay on next start.
        drain: bool,
        /// Acknowledged once the ingestor has stopped.
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running partition ingestor.
#[derive(Debug, Clone)]
pub struct PartitionIngestorHandle {
    tx: mpsc::Sender<IngestorCommand>,
    partition: PartitionId,
    status_rx: watch::Receiver<ReplicaStatus>,
    push_tx: broadcast::Sender<PushStatusEvent>,
    counters: Arc<IngestionCounters>,
}

impl PartitionIngestorHandle {
    /// Returns the partition this handle serves.
    #[must_use]
    pub const fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Returns the current replica status.
    #[must_use]
    pub fn status(&self) -> ReplicaStatus {
        *self.status_rx.borrow()
    }

    /// Returns a watch receiver over the replica status.
    #[must_use]
    pub fn status_watch(&self) -> watch::Receiver<ReplicaStatus> {
        self.status_rx.clone()
    }

    /// Subscribes to the push status event stream.
    #[must_use]
    pub fn push_events(&self) -> broadcast::Receiver<PushStatusEvent> {
        self.push_tx.subscribe()
    }

    /// Returns the ingestion counters.
    #[must_use]
    pub fn counters(&self) -> Arc<IngestionCounters> {
        Arc::clone(&self.counters)
    }

    /// Stops the ingestor.
    ///
    /// # Errors
    /// Returns `IngestorShutdown` if it is already gone.
    pub async fn stop(&self, drain: bool) -> IngestionResult<()> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(IngestorCommand::Stop {
                drain,
                reply: reply_tx,
            })
            .await
            .map_err(|_| IngestionError::IngestorShutdown)?;
        reply_rx.await.map_err(|_| IngestionError::IngestorShutdown)
    }
}

/// Everything a partition ingestor needs to run.
pub struct IngestorContext {
    /// Store-version configuration.
    pub version: StoreVersionConfig,
    /// Leaf partition this ingestor serves.
    pub partition: PartitionId,
    /// Log transport handle.
    pub broker: LogBroker,
    /// This replica's partition column.
    pub store: PartitionStore,
    /// Shared consumer pool handle.
    pub pool: ConsumerPoolHandle,
    /// Role signal for this partition (keyed by user partition).
    pub role_rx: watch::Receiver<ReplicaRole>,
    /// Service configuration.
    pub config: IngestionConfig,
    /// System limits.
    pub limits: Limits,
}

/// Spawns a partition ingestor and returns its handle.
#[must_use]
pub fn spawn_partition_ingestor(ctx: IngestorContext) -> PartitionIngestorHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(ctx.config.channel_buffer);
    let (status_tx, status_rx) = watch::channel(ReplicaStatus::Bootstrapping);
    let (push_tx, _) = broadcast::channel(ctx.config.channel_buffer.max(16));
    let counters = Arc::new(IngestionCounters::new());
    let partition = ctx.partition;

    let vt = ctx.version.version_topic();
    let div_config = DivConfig {
        tolerate_gaps_after_end_of_push: ctx.version.is_hybrid(),
        verify_checksums: ctx.version.checksum_verification_enabled,
        segments_max: ctx.limits.div_segments_per_partition_max as usize,
    };
    let drainer = Drainer {
        version: ctx.version,
        partition,
        vt: vt.clone(),
        broker: ctx.broker,
        store: ctx.store,
        pool: ctx.pool,
        role_rx: ctx.role_rx,
        cmd_rx,
        data_rx: None,
        sub_id: None,
        config: ctx.config,
        limits: ctx.limits,
        state: IngestState::Bootstrap,
        role: ReplicaRole::Follower,
        role_closed: false,
        upstream: vt,
        upstream_offset: Offset::earliest(),
        local_vt_offset: Offset::earliest(),
        stream_upstream: None,
        div: DivValidator::new(div_config),
        div_config,
        producer: None,
        assembler: ChunkAssembler::new(ctx.limits.chunks_per_value_max),
        pending_switch: None,
        replay_armed: false,
        received_eop: false,
        topic_switches: 0,
        completed_labels: Vec::new(),
        current_label: None,
        counters: Arc::clone(&counters),
        status_tx,
        push_tx: push_tx.clone(),
    };
    tokio::spawn(drainer.run());

    PartitionIngestorHandle {
        tx: cmd_tx,
        partition,
        status_rx,
        push_tx,
        counters,
    }
}

/// The leader/follower state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum IngestState {
    /// Waiting for the first role signal.
    Bootstrap,
    /// Follower consuming the version topic.
    FollowerConsumingVt,
    /// Promoted leader replaying the version topic up to the end offset
    /// observed at promotion.
    LeaderCatchupVt {
        /// Version-topic end offset at promotion time.
        target: Offset,
    },
    /// Leader consuming its upstream (the version topic itself until a
    /// switch directive executes).
    LeaderConsumingUpstream,
    /// Batch push finished on a batch-only store.
    CompletedBatch,
    /// Fatal error; offline until restarted.
    Errored,
}

/// Data operations staged for one atomic commit.
#[derive(Debug, Default)]
struct StagedBatch {
    ops: Vec<WriteOp>,
}

impl StagedBatch {
    fn put(&mut self, key: Bytes, value: Bytes) {
        self.ops.push(WriteOp::Put { key, value });
    }

    fn delete(&mut self, key: Bytes) {
        self.ops.push(WriteOp::Delete { key });
    }

    fn len(&self) -> usize {
        self.ops.len()
    }
}

/// Receives from the delivery queue, or parks forever when unsubscribed.
async fn recv_record(rx: &mut Option<mpsc::Receiver<DeliveredRecord>>) -> Option<DeliveredRecord> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// The drainer task owning one partition replica.
struct Drainer {
    version: StoreVersionConfig,
    partition: PartitionId,
    vt: TopicName,
    broker: LogBroker,
    store: PartitionStore,
    pool: ConsumerPoolHandle,
    role_rx: watch::Receiver<ReplicaRole>,
    cmd_rx: mpsc::Receiver<IngestorCommand>,
    data_rx: Option<mpsc::Receiver<DeliveredRecord>>,
    sub_id: Option<SubscriptionId>,
    config: IngestionConfig,
    limits: Limits,
    state: IngestState,
    /// Last role this replica acted on.
    role: ReplicaRole,
    /// Set when the oracle's channel closed; the last role stays in force.
    role_closed: bool,
    /// Topic currently being consumed.
    upstream: TopicName,
    /// Next offset to consume when the upstream is not the version topic.
    upstream_offset: Offset,
    /// Next version-topic offset to apply locally.
    local_vt_offset: Offset,
    /// Stream resume point learned from leader footers or own streaming.
    stream_upstream: Option<(TopicName, Offset)>,
    div: DivValidator,
    div_config: DivConfig,
    producer: Option<VersionTopicProducer>,
    assembler: ChunkAssembler,
    /// Latest unexecuted switch directive. Overwritten by newer ones.
    pending_switch: Option<SwitchDirective>,
    /// Set once a switch directive exists or buffer replay was armed, so
    /// the replay is never armed twice.
    replay_armed: bool,
    received_eop: bool,
    topic_switches: u32,
    completed_labels: Vec<String>,
    current_label: Option<String>,
    counters: Arc<IngestionCounters>,
    status_tx: watch::Sender<ReplicaStatus>,
    push_tx: broadcast::Sender<PushStatusEvent>,
}

impl Drainer {
    #[instrument(skip(self), fields(topic = %self.vt, partition = %self.partition))]
    async fn run(mut self) {
        info!("partition ingestor started");
        match self.bootstrap().await {
            Ok(()) => {
                let _ = self.push_tx.send(PushStatusEvent::Started);
            }
            Err(err) => self.fail(err).await,
        }

        loop {
            tokio::select! {
                biased;
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(IngestorCommand::Stop { drain, reply }) => {
                        self.stop(drain).await;
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        self.stop(true).await;
                        break;
                    }
                },
                changed = self.role_rx.changed(), if !self.role_closed => {
                    match changed {
                        Ok(()) => {
                            if let Err(err) = self.handle_role_change().await {
                                self.fail(err).await;
                            }
                        }
                        Err(_) => self.role_closed = true,
                    }
                },
                record = recv_record(&mut self.data_rx) => {
                    match record {
                        Some(record) => {
                            if let Err(err) = self.on_delivery(record).await {
                                self.fail(err).await;
                            }
                        }
                        None => self.data_rx = None,
                    }
                },
            }
        }
        info!("partition ingestor stopped");
    }

    /// Seeds state from the last checkpoint and applies the initial role.
    async fn bootstrap(&mut self) -> IngestionResult<()> {
        if let Some(checkpoint) = self.store.checkpoint() {
            info!(
                local_vt_offset = %checkpoint.local_vt_offset,
                upstream = %checkpoint.upstream_topic,
                "resuming from checkpoint"
            );
            self.local_vt_offset = checkpoint.local_vt_offset;
            self.received_eop = checkpoint.received_end_of_push;
            self.topic_switches = checkpoint.topic_switches;
            self.completed_labels = checkpoint.completed_incremental_labels;
            if checkpoint.upstream_topic != self.vt {
                self.stream_upstream =
                    Some((checkpoint.upstream_topic, checkpoint.upstream_offset));
                self.replay_armed = true;
            }
            if !checkpoint.div_state.is_empty() {
                self.div = DivValidator::decode_state(self.div_config, &checkpoint.div_state)?;
            }
        }

        let role = *self.role_rx.borrow_and_update();
        match role {
            ReplicaRole::Follower => self.become_follower().await,
            ReplicaRole::Leader => {
                self.role = ReplicaRole::Leader;
                self.begin_promotion().await
            }
        }
    }

    async fn handle_role_change(&mut self) -> IngestionResult<()> {
        if self.state == IngestState::Errored {
            return Ok(());
        }
        let new_role = *self.role_rx.borrow_and_update();
        if new_role == self.role {
            return Ok(());
        }
        match new_role {
            ReplicaRole::Leader => {
                info!(
                    delay_ms = self.config.promotion_delay.as_millis() as u64,
                    "promotion signalled, waiting for prior leader to drain"
                );
                tokio::time::sleep(self.config.promotion_delay).await;
                // Transition storms collapse to the latest signal.
                if *self.role_rx.borrow_and_update() != ReplicaRole::Leader {
                    debug!("promotion superseded during delay");
                    return Ok(());
                }
                self.role = ReplicaRole::Leader;
                self.begin_promotion().await
            }
            ReplicaRole::Follower => {
                info!("demoted to follower");
                self.role = ReplicaRole::Follower;
                self.become_follower().await
            }
        }
    }

    /// Switches to follower mode: producing ceases immediately, the version
    /// topic becomes the only upstream.
    async fn become_follower(&mut self) -> IngestionResult<()> {
        // A demoted leader must not emit EndOfSegment: it has lost the
        // right to produce. Followers tolerate the unterminated segment.
        self.producer = None;
        self.resubscribe(self.vt.clone(), self.local_vt_offset).await?;
        self.state = IngestState::FollowerConsumingVt;
        self.publish_status();
        Ok(())
    }

    /// Starts leader catch-up: replay the version topic to the end offset
    /// observed now, then act on whichever phase directive applies.
    async fn begin_promotion(&mut self) -> IngestionResult<()> {
        let target = self.vt_end();
        info!(%target, "leader catch-up started");
        self.state = IngestState::LeaderCatchupVt { target };

        // Resume the stream exactly where the prior leader's footer trail
        // stopped, instead of rewinding by time. A pending directive naming
        // a different topic is newer information and wins.
        if let Some((topic, offset)) = self.stream_upstream.clone() {
            let superseded = self
                .pending_switch
                .as_ref()
                .is_some_and(|pending| pending.topic != topic);
            if !superseded {
                debug!(topic = %topic, %offset, "resuming stream from footer trail");
                self.pending_switch = Some(SwitchDirective {
                    topic,
                    resume_at: Some(offset),
                    start_offsets: None,
                    rewind_start: Timestamp::none(),
                });
                self.replay_armed = true;
            }
        }

        if self.sub_id.is_none() || self.upstream != self.vt {
            self.resubscribe(self.vt.clone(), self.local_vt_offset).await?;
        }
        self.after_batch().await
    }

    /// Processes one delivered record plus whatever is immediately queued,
    /// then commits the staged batch atomically with the checkpoint.
    async fn on_delivery(&mut self, first: DeliveredRecord) -> IngestionResult<()> {
        if self.state == IngestState::Errored {
            return Ok(());
        }
        let mut batch = StagedBatch::default();
        let mut boundary = self.process_record(&mut batch, first).await?;
        while !boundary && batch.len() < self.limits.commit_batch_records_max as usize {
            let Some(rx) = self.data_rx.as_mut() else { break };
            match rx.try_recv() {
                Ok(record) => boundary = self.process_record(&mut batch, record).await?,
                Err(_) => break,
            }
        }
        self.commit(batch)?;
        self.after_batch().await
    }

    /// Processes a single record. Returns true when the batch must close
    /// (a control message changed ingestor state).
    async fn process_record(
        &mut self,
        batch: &mut StagedBatch,
        record: DeliveredRecord,
    ) -> IngestionResult<bool> {
        if record.topic != self.upstream {
            // Stale delivery from a replaced subscription; a superseded
            // switch's records are discarded here.
            debug!(topic = %record.topic, "discarding record from stale upstream");
            return Ok(false);
        }
        self.counters.record_in();
        let entry = record.entry;
        let envelope = MessageEnvelope::decode(&mut entry.value.clone())?;

        match self.div.validate(&envelope)? {
            DivOutcome::Duplicate => {
                self.counters.duplicate_dropped();
                self.advance_position(entry.offset);
                return Ok(false);
            }
            DivOutcome::Accept => {}
        }

        if let Payload::Control(control) = &envelope.payload {
            let control = control.clone();
            self.advance_position(entry.offset);
            self.apply_control(&control).await?;
            return Ok(true);
        }

        self.apply_data(batch, &envelope, entry.offset).await?;
        Ok(false)
    }

    /// Applies a control message to ingestor state.
    async fn apply_control(&mut self, control: &ControlMessage) -> IngestionResult<()> {
        debug!(control = control.name(), "applying control message");
        match interpret(control) {
            ControlDirective::InitBatch { sorted, chunking, .. } => {
                debug!(sorted, chunking, "batch phase opened");
                if chunking {
                    self.version.chunking_enabled = true;
                }
            }
            ControlDirective::CloseBatch => {
                self.received_eop = true;
                self.div.set_end_of_push();
                let _ = self.push_tx.send(PushStatusEvent::EndOfPushReceived);
                if self.version.is_hybrid() {
                    info!("batch phase closed; awaiting stream phase");
                } else {
                    info!("batch phase closed; push complete");
                    let _ = self.push_tx.send(PushStatusEvent::Completed);
                    if self.role == ReplicaRole::Leader {
                        self.state = IngestState::CompletedBatch;
                    }
                }
                self.publish_status();
            }
            ControlDirective::SwitchUpstream(directive) => {
                // Last directive wins; an armed but unexecuted switch is
                // simply replaced.
                info!(topic = %directive.topic, "observed upstream switch directive");
                self.pending_switch = Some(directive);
                self.replay_armed = true;
                self.topic_switches += 1;
            }
            ControlDirective::BeginIncrementalPush { label } => {
                self.forward_if_streaming(control).await?;
                info!(label = %label, "incremental push started");
                self.current_label = Some(label.clone());
                let _ = self
                    .push_tx
                    .send(PushStatusEvent::StartOfIncrementalPushReceived { label });
            }
            ControlDirective::EndIncrementalPush { label } => {
                self.forward_if_streaming(control).await?;
                info!(label = %label, "incremental push completed");
                self.current_label = None;
                if !self.completed_labels.contains(&label) {
                    self.completed_labels.push(label.clone());
                }
                let _ = self
                    .push_tx
                    .send(PushStatusEvent::EndOfIncrementalPushReceived { label });
            }
            ControlDirective::SegmentBoundary => {
                // The validator already consumed it.
            }
        }
        Ok(())
    }

    /// Re-produces a control message into the version topic when this
    /// replica is a streaming leader, so followers observe it too.
    async fn forward_if_streaming(&mut self, control: &ControlMessage) -> IngestionResult<()> {
        if self.role != ReplicaRole::Leader || self.upstream == self.vt {
            return Ok(());
        }
        self.ensure_producer();
        if let Some(producer) = self.producer.as_mut() {
            producer.produce_control(control.clone()).await?;
        }
        Ok(())
    }

    /// Applies one data record: leaders re-produce first, everybody stages
    /// the local write.
    async fn apply_data(
        &mut self,
        batch: &mut StagedBatch,
        envelope: &MessageEnvelope,
        offset: Offset,
    ) -> IngestionResult<()> {
        if self.upstream == self.vt {
            // Version-topic consumption (follower, catch-up, or batch
            // pass-through). Remember the footer trail so a promotion can
            // resume the stream without rewinding.
            if let Some(LeaderFooter {
                upstream_offset,
                upstream_topic,
            }) = &envelope.leader_footer
            {
                self.stream_upstream = Some((upstream_topic.clone(), upstream_offset.next()));
            }
            self.local_vt_offset = offset.next();
        } else {
            // Streaming leader: the version-topic produce must be acked
            // before the upstream position advances.
            self.ensure_producer();
            let Some(producer) = self.producer.as_mut() else {
                return Ok(());
            };
            let footer = LeaderFooter {
                upstream_offset: offset,
                upstream_topic: self.upstream.clone(),
            };
            let produced = producer
                .produce_data(envelope.payload.clone(), envelope.producer.timestamp, footer)
                .await?;
            self.local_vt_offset = produced.next();
            self.upstream_offset = offset.next();
            self.stream_upstream = Some((self.upstream.clone(), self.upstream_offset));
        }
        self.stage_payload(batch, envelope.payload.clone(), envelope.producer.guid)
    }

    /// Stages a data payload into the batch.
    fn stage_payload(
        &mut self,
        batch: &mut StagedBatch,
        payload: Payload,
        guid: lagoon_core::ProducerGuid,
    ) -> IngestionResult<()> {
        match payload {
            Payload::Put {
                key,
                value,
                schema_id,
            } => {
                self.check_schema(schema_id)?;
                self.counters.record_persisted(value.len() as u64);
                batch.put(key, value);
            }
            Payload::Delete { key } => {
                self.counters.record_persisted(0);
                batch.delete(key);
            }
            Payload::Update {
                key,
                partial,
                schema_id,
            } => {
                self.check_schema(schema_id)?;
                // Field-level merge is schema-driven and outside the core;
                // the partial payload upserts the stored value.
                self.counters.record_persisted(partial.len() as u64);
                batch.put(key, partial);
            }
            Payload::Chunk {
                key,
                chunk_index,
                chunk_count,
                data,
            } => {
                self.assembler
                    .accept_chunk(guid, &key, chunk_index, chunk_count, data)?;
            }
            Payload::ChunkManifest {
                key,
                chunk_count,
                total_bytes,
                schema_id,
            } => {
                self.check_schema(schema_id)?;
                let value = self.assembler.complete(guid, &key, chunk_count, total_bytes)?;
                self.counters.record_persisted(value.len() as u64);
                batch.put(key, value);
            }
            Payload::Control(_) => debug_assert!(false, "controls are not staged"),
        }
        Ok(())
    }

    fn check_schema(&mut self, schema_id: SchemaId) -> IngestionResult<()> {
        if self.version.registered_schemas.contains(&schema_id) {
            return Ok(());
        }
        if self.version.auto_register_schemas_from_push {
            warn!(%schema_id, "auto-registering schema observed in push");
            self.version.registered_schemas.insert(schema_id);
            return Ok(());
        }
        Err(IngestionError::SchemaUnknown { schema_id })
    }

    /// Advances the consume position for records with no local write
    /// (controls, dropped duplicates).
    fn advance_position(&mut self, offset: Offset) {
        if self.upstream == self.vt {
            self.local_vt_offset = offset.next();
        } else {
            self.upstream_offset = offset.next();
            self.stream_upstream = Some((self.upstream.clone(), self.upstream_offset));
        }
    }

    /// Commits the staged batch atomically with the current checkpoint.
    fn commit(&mut self, batch: StagedBatch) -> IngestionResult<()> {
        let mut write = WriteBatch::new(self.current_checkpoint());
        write.ops = batch.ops;
        write.label.clone_from(&self.current_label);
        self.store.commit(write)?;
        Ok(())
    }

    fn current_checkpoint(&self) -> ReplicaCheckpoint {
        let (upstream_topic, upstream_offset) = if self.upstream == self.vt {
            self.stream_upstream
                .clone()
                .unwrap_or((self.vt.clone(), self.local_vt_offset))
        } else {
            (self.upstream.clone(), self.upstream_offset)
        };
        ReplicaCheckpoint {
            upstream_topic,
            upstream_offset,
            local_vt_offset: self.local_vt_offset,
            div_state: self.div.encode_state(),
            received_end_of_push: self.received_eop,
            topic_switches: self.topic_switches,
            completed_incremental_labels: self.completed_labels.clone(),
        }
    }

    /// Post-commit bookkeeping: catch-up completion, buffer-replay arming,
    /// and deferred switch execution.
    async fn after_batch(&mut self) -> IngestionResult<()> {
        if let IngestState::LeaderCatchupVt { target } = self.state {
            if self.local_vt_offset >= target {
                info!(%target, "leader caught up with version topic");
                self.state = IngestState::LeaderConsumingUpstream;
                self.publish_status();
            }
        }

        if self.state == IngestState::LeaderConsumingUpstream && self.upstream == self.vt {
            let vt_end = self.vt_end();
            if self.local_vt_offset >= vt_end {
                if self.pending_switch.is_some() {
                    self.execute_switch().await?;
                } else if self.received_eop && self.version.is_hybrid() && !self.replay_armed {
                    self.arm_buffer_replay().await?;
                }
            }
        }
        Ok(())
    }

    /// Produces the stream-phase `TopicSwitch` into the version topic so
    /// this leader and every follower act on the same directive.
    async fn arm_buffer_replay(&mut self) -> IngestionResult<()> {
        let Some(hybrid) = self.version.hybrid.clone() else {
            return Ok(());
        };
        let rewind_start = Timestamp::now().rewound_by_seconds(hybrid.rewind_seconds);
        let rt = self.version.real_time_topic();
        info!(topic = %rt, %rewind_start, "arming buffer replay");
        self.replay_armed = true;
        self.ensure_producer();
        if let Some(producer) = self.producer.as_mut() {
            producer
                .produce_control(ControlMessage::TopicSwitch {
                    source_clusters: Vec::new(),
                    new_topic: rt,
                    rewind_start,
                })
                .await?;
        }
        Ok(())
    }

    /// Executes the pending switch directive: re-subscribes the upstream at
    /// the resolved starting offset and persists the change.
    async fn execute_switch(&mut self) -> IngestionResult<()> {
        let Some(directive) = self.pending_switch.take() else {
            return Ok(());
        };
        let start = self.resolve_switch_start(&directive);
        info!(
            from = %self.upstream,
            to = %directive.topic,
            %start,
            "switching upstream"
        );
        self.resubscribe(directive.topic.clone(), start).await?;
        self.upstream_offset = start;
        self.stream_upstream = Some((directive.topic, start));
        self.ensure_producer();
        self.counters.rewind_triggered();
        self.commit(StagedBatch::default())?;
        Ok(())
    }

    fn resolve_switch_start(&self, directive: &SwitchDirective) -> Offset {
        if let Some(offset) = directive.resume_at {
            return offset;
        }
        if let Some(offsets) = &directive.start_offsets {
            return offsets
                .get(self.partition.get() as usize)
                .copied()
                .unwrap_or(Offset::earliest());
        }
        self.broker
            .get(&directive.topic)
            .and_then(|topic| {
                topic
                    .partition(self.partition)
                    .ok()
                    .map(|log| log.offset_for_timestamp(directive.rewind_start))
            })
            .unwrap_or(Offset::earliest())
    }

    fn ensure_producer(&mut self) {
        if self.producer.is_none() {
            self.producer = Some(VersionTopicProducer::new(
                self.broker.clone(),
                self.vt.clone(),
                self.partition,
                self.version.chunking_enabled,
                self.limits.max_user_payload_bytes as usize,
                &self.config,
            ));
        }
    }

    async fn resubscribe(&mut self, topic: TopicName, start: Offset) -> IngestionResult<()> {
        if let Some(id) = self.sub_id.take() {
            // Dropping the receiver discards records queued from the old
            // upstream before they were ever applied.
            self.data_rx = None;
            self.pool.unsubscribe(id).await?;
        }
        let (id, rx) = self.pool.subscribe(topic.clone(), self.partition, start).await?;
        self.sub_id = Some(id);
        self.data_rx = Some(rx);
        self.upstream = topic;
        Ok(())
    }

    fn vt_end(&self) -> Offset {
        self.broker
            .get(&self.vt)
            .and_then(|topic| topic.end_offset(self.partition).ok())
            .unwrap_or(Offset::earliest())
    }

    fn publish_status(&self) {
        let status = match self.state {
            IngestState::Errored => ReplicaStatus::Error,
            _ if self.received_eop && !self.version.is_hybrid() => ReplicaStatus::Completed,
            _ if self.received_eop => ReplicaStatus::Online,
            _ => ReplicaStatus::Bootstrapping,
        };
        self.status_tx.send_replace(status);
    }

    async fn fail(&mut self, err: IngestionError) {
        if !err.is_fatal() {
            warn!(%err, "transient ingestion error");
            return;
        }
        error!(%err, "fatal ingestion error, taking partition offline");
        self.state = IngestState::Errored;
        self.status_tx.send_replace(ReplicaStatus::Error);
        let _ = self.push_tx.send(PushStatusEvent::Error {
            message: err.to_string(),
        });
        self.data_rx = None;
        if let Some(id) = self.sub_id.take() {
            let _ = self.pool.unsubscribe(id).await;
        }
        self.producer = None;
    }

    /// Stops the ingestor. Resource release order: producer, then the pool
    /// subscription, then (implicitly, on drop) the store handle.
    async fn stop(&mut self, drain: bool) {
        info!(drain, "stopping partition ingestor");
        if let Some(producer) = self.producer.as_mut() {
            if drain {
                if let Err(err) = producer.finish().await {
                    warn!(%err, "failed to close producer segment on drain");
                }
            } else {
                // Budgeted stop: skip waiting on produce acks; the next
                // start replays from the committed checkpoint.
                let _ = tokio::time::timeout(self.config.drain_abort_budget, producer.finish())
                    .await;
            }
        }
        self.producer = None;
        self.data_rx = None;
        if let Some(id) = self.sub_id.take() {
            let _ = self.pool.unsubscribe(id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::{ManualMembership, MembershipOracle};
    use crate::pool::spawn_consumer_pool;
    use lagoon_core::{
        ChecksumKind, ProducerGuid, ProducerMetadata, SegmentNumber, SequenceNumber,
        StoreVersionNumber,
    };
    use lagoon_div::checksum_update;
    use lagoon_store::StorageEngine;
    use std::time::Duration;

    /// Minimal batch-push writer for exercising the drainer directly.
    ///
    /// Every record rides inside a producer segment: the first append opens
    /// one with `StartOfSegment`, like real writers do.
    struct TestWriter {
        broker: LogBroker,
        topic: TopicName,
        partition: PartitionId,
        guid: ProducerGuid,
        segment: SegmentNumber,
        next_sequence: SequenceNumber,
        checksum: u32,
        open: bool,
    }

    impl TestWriter {
        fn new(broker: &LogBroker, topic: TopicName, partition: PartitionId) -> Self {
            Self {
                broker: broker.clone(),
                topic,
                partition,
                guid: ProducerGuid::random(),
                segment: SegmentNumber::new(0),
                next_sequence: SequenceNumber::new(1),
                checksum: 0,
                open: false,
            }
        }

        fn append(&mut self, payload: Payload) {
            if !self.open {
                self.open = true;
                self.checksum = 0;
                self.raw_append(Payload::Control(ControlMessage::StartOfSegment {
                    checksum_kind: ChecksumKind::Crc32,
                }));
            }
            self.raw_append(payload);
        }

        fn raw_append(&mut self, payload: Payload) {
            self.checksum = checksum_update(self.checksum, &payload);
            let envelope = MessageEnvelope::new(
                ProducerMetadata {
                    guid: self.guid,
                    segment: self.segment,
                    sequence: self.next_sequence,
                    timestamp: Timestamp::now(),
                },
                payload,
            );
            self.next_sequence = self.next_sequence.next();
            let key = envelope.payload.key().cloned().unwrap_or_default();
            self.broker
                .require(&self.topic)
                .unwrap()
                .append(self.partition, Timestamp::now(), key, envelope.encode_to_bytes())
                .unwrap();
        }

        fn put(&mut self, key: &str, value: &str) {
            self.append(Payload::Put {
                key: Bytes::from(key.to_string()),
                value: Bytes::from(value.to_string()),
                schema_id: SchemaId::new(1),
            });
        }

        fn end_segment(&mut self) {
            if !self.open {
                return;
            }
            let checksum = self.checksum;
            self.raw_append(Payload::Control(ControlMessage::EndOfSegment {
                checksum,
                is_final: true,
            }));
            self.open = false;
            self.segment = self.segment.next();
            self.next_sequence = SequenceNumber::new(1);
        }

        fn control(&mut self, control: ControlMessage) {
            self.append(Payload::Control(control));
        }
    }

    struct TestRig {
        broker: LogBroker,
        engine: StorageEngine,
        oracle: ManualMembership,
        pool: ConsumerPoolHandle,
        config: IngestionConfig,
        version: StoreVersionConfig,
    }

    impl TestRig {
        fn new(version: StoreVersionConfig) -> Self {
            let broker = LogBroker::new();
            let config = IngestionConfig::fast_for_testing();
            broker
                .create_topic(version.version_topic(), version.leaf_partition_count())
                .unwrap();
            if version.is_hybrid() {
                broker
                    .create_topic(version.real_time_topic(), version.leaf_partition_count())
                    .unwrap();
            }
            let pool = spawn_consumer_pool(broker.clone(), &config, Limits::new());
            Self {
                broker,
                engine: StorageEngine::new(),
                oracle: ManualMembership::new(),
                pool,
                config,
                version,
            }
        }

        async fn spawn(&self, partition: PartitionId) -> PartitionIngestorHandle {
            let vt = self.version.version_topic();
            let role_rx = self.oracle.subscribe(&vt, partition).await;
            spawn_partition_ingestor(IngestorContext {
                version: self.version.clone(),
                partition,
                broker: self.broker.clone(),
                store: self.engine.open_partition(&vt, partition),
                pool: self.pool.clone(),
                role_rx,
                config: self.config.clone(),
                limits: Limits::new(),
            })
        }

        fn store(&self, partition: PartitionId) -> lagoon_store::PartitionStore {
            self.engine
                .open_partition(&self.version.version_topic(), partition)
        }
    }

    async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {what}");
    }

    fn batch_version() -> StoreVersionConfig {
        StoreVersionConfig::new("unit", StoreVersionNumber::new(1))
    }

    #[tokio::test]
    async fn test_follower_applies_batch_push() {
        let rig = TestRig::new(batch_version());
        let partition = PartitionId::new(0);
        let handle = rig.spawn(partition).await;

        let mut writer = TestWriter::new(&rig.broker, rig.version.version_topic(), partition);
        writer.control(ControlMessage::StartOfPush {
            sorted: false,
            chunking: false,
            compression: lagoon_core::Compression::None,
            dict: None,
        });
        writer.put("k1", "v1");
        writer.put("k2", "v2");
        writer.end_segment();
        writer.control(ControlMessage::EndOfPush);

        let store = rig.store(partition);
        wait_for("records applied", || store.get(b"k2").is_some()).await;
        assert_eq!(store.get(b"k1"), Some(Bytes::from("v1")));
        wait_for("completed status", || {
            handle.status() == ReplicaStatus::Completed
        })
        .await;

        // The checkpoint advanced past every consumed record: segment open,
        // push open, two puts, segment close, then a fresh segment carrying
        // the push close.
        let checkpoint = store.checkpoint().unwrap();
        assert_eq!(checkpoint.local_vt_offset, Offset::new(7));
        assert!(checkpoint.received_end_of_push);

        handle.stop(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_resumes_from_checkpoint() {
        let rig = TestRig::new(batch_version());
        let partition = PartitionId::new(0);
        let handle = rig.spawn(partition).await;

        let mut writer = TestWriter::new(&rig.broker, rig.version.version_topic(), partition);
        writer.put("k1", "v1");
        writer.end_segment();
        writer.control(ControlMessage::EndOfPush);

        let store = rig.store(partition);
        wait_for("first run applied", || store.get(b"k1").is_some()).await;
        let offset_before = store.local_vt_offset();
        handle.stop(true).await.unwrap();

        // Restart and verify the offset does not regress and data survives.
        let handle = rig.spawn(partition).await;
        wait_for("restart completed", || {
            handle.status() == ReplicaStatus::Completed
        })
        .await;
        assert!(store.local_vt_offset() >= offset_before);
        assert_eq!(store.get(b"k1"), Some(Bytes::from("v1")));
        handle.stop(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_segment_gap_errors_partition_before_eop() {
        let rig = TestRig::new(batch_version());
        let partition = PartitionId::new(0);
        let handle = rig.spawn(partition).await;

        let mut writer = TestWriter::new(&rig.broker, rig.version.version_topic(), partition);
        writer.put("k1", "v1");
        // Skip sequence 3 to force a gap.
        writer.next_sequence = SequenceNumber::new(5);
        writer.put("k2", "v2");

        wait_for("replica errored", || handle.status() == ReplicaStatus::Error).await;
        let store = rig.store(partition);
        assert_eq!(store.get(b"k2"), None);
        handle.stop(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_schema_is_fatal_without_auto_register() {
        let rig = TestRig::new(batch_version());
        let partition = PartitionId::new(0);
        let handle = rig.spawn(partition).await;

        let mut writer = TestWriter::new(&rig.broker, rig.version.version_topic(), partition);
        writer.append(Payload::Put {
            key: Bytes::from("k"),
            value: Bytes::from("v"),
            schema_id: SchemaId::new(99),
        });

        wait_for("replica errored", || handle.status() == ReplicaStatus::Error).await;
        handle.stop(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_counters_track_ingestion() {
        let rig = TestRig::new(batch_version());
        let partition = PartitionId::new(0);
        let handle = rig.spawn(partition).await;

        let mut writer = TestWriter::new(&rig.broker, rig.version.version_topic(), partition);
        writer.put("k1", "v1");
        writer.end_segment();
        writer.control(ControlMessage::EndOfPush);

        let store = rig.store(partition);
        wait_for("applied", || store.get(b"k1").is_some()).await;

        let snapshot = handle.counters().snapshot();
        assert!(snapshot.records_in >= 4);
        assert_eq!(snapshot.records_persisted, 1);
        assert_eq!(snapshot.bytes_persisted, 2);
        handle.stop(true).await.unwrap();
    }
}
