//! Connection supervisor
//!
//! [`ConnectionSupervisor`] drives one slot's pipeline end to end. It runs two
//! workers joined by a bounded queue:
//!
//! - the replication worker (this task) connects, reads COPY frames, decodes
//!   them and reassembles transactions;
//! - the delivery worker (a spawned task) hands each envelope to the
//!   [`ChangeConsumer`], checkpoints the acknowledged position and publishes
//!   the resulting [`DurableLsn`](crate::checkpoint::DurableLsn).
//!
//! The replication worker forwards every published durable position to the
//! server. Transient failures reconnect with backoff and resume from the
//! checkpoint; fatal failures stop the pipeline with a [`PipelineFailure`].

use crate::checkpoint::CheckpointStore;
use crate::codec;
use crate::config::PipelineConfig;
use crate::connection::{Connector, ReplicationConnection};
use crate::consumer::ChangeConsumer;
use crate::error::{ReplicationError, Result};
use crate::lsn::SharedLsnFeedback;
use crate::protocol::{parse_copy_frame, CopyFrame};
use crate::retry::ExponentialBackoff;
use crate::sequencer::ChangeSequencer;
use crate::slot::SlotManager;
use crate::types::{Lsn, TransactionEnvelope};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle of a supervised pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SupervisorState {
    Disconnected,
    Connecting,
    Streaming,
    /// Shut down on request
    Stopped,
    /// Stopped by a fatal error
    Failed,
}

impl SupervisorState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SupervisorState::Stopped | SupervisorState::Failed)
    }
}

impl fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SupervisorState::Disconnected => "disconnected",
            SupervisorState::Connecting => "connecting",
            SupervisorState::Streaming => "streaming",
            SupervisorState::Stopped => "stopped",
            SupervisorState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A fatal error, with what an operator needs to resynchronize
#[derive(Debug, Error)]
#[error("pipeline for slot {slot_name} stopped (last confirmed LSN {last_confirmed_lsn}): {error}")]
pub struct PipelineFailure {
    pub slot_name: String,
    /// Highest position durably checkpointed for the slot
    pub last_confirmed_lsn: Lsn,
    #[source]
    pub error: ReplicationError,
}

/// A streaming session still open when shutdown was requested
struct OpenSession<T> {
    conn: T,
    slot: SlotManager,
}

/// Runs one slot's pipeline, reconnecting on transient failures
///
/// # Example
///
/// ```no_run
/// use pg_walrelay::{
///     ConnectionSupervisor, FileCheckpointStore, JsonLinesConsumer, PgConnector, PipelineConfig,
/// };
/// use std::sync::Arc;
/// use tokio_util::sync::CancellationToken;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = PipelineConfig {
///     slot_name: "orders_cdc".to_string(),
///     database_connection_string: "postgresql://postgres@localhost/shop".to_string(),
///     ..Default::default()
/// };
/// let connector = PgConnector::new(config.replication_conninfo());
/// let store = Arc::new(FileCheckpointStore::open(&config.checkpoint_dir).await?);
///
/// let mut supervisor = ConnectionSupervisor::new(config, connector, store);
/// let cancel = CancellationToken::new();
/// supervisor
///     .run(JsonLinesConsumer::new(tokio::io::stdout()), cancel)
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct ConnectionSupervisor<C, S> {
    config: PipelineConfig,
    connector: C,
    store: Arc<S>,
    backoff: ExponentialBackoff,
    sequencer: ChangeSequencer,
    feedback: Arc<SharedLsnFeedback>,
    state: watch::Sender<SupervisorState>,
    last_confirmed_lsn: Lsn,
}

impl<C, S> ConnectionSupervisor<C, S>
where
    C: Connector,
    S: CheckpointStore + 'static,
{
    pub fn new(config: PipelineConfig, connector: C, store: Arc<S>) -> Self {
        let backoff = config.backoff().to_backoff();
        let sequencer =
            ChangeSequencer::new(Lsn::ZERO).with_max_transaction_changes(config.max_transaction_changes);
        let (state, _) = watch::channel(SupervisorState::Disconnected);
        Self {
            config,
            connector,
            store,
            backoff,
            sequencer,
            feedback: SharedLsnFeedback::new_shared(),
            state,
            last_confirmed_lsn: Lsn::ZERO,
        }
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    /// Received and durable positions, shared with the delivery worker
    pub fn feedback(&self) -> Arc<SharedLsnFeedback> {
        Arc::clone(&self.feedback)
    }

    pub fn slot_name(&self) -> &str {
        &self.config.slot_name
    }

    fn set_state(&self, next: SupervisorState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(
                "Slot {} supervisor: {} -> {}",
                self.config.slot_name, previous, next
            );
        }
    }

    fn fail(&self, error: ReplicationError) -> PipelineFailure {
        let failure = PipelineFailure {
            slot_name: self.config.slot_name.clone(),
            last_confirmed_lsn: self.last_confirmed_lsn.max(self.feedback.durable_lsn()),
            error,
        };
        error!("{}", failure);
        self.set_state(SupervisorState::Failed);
        failure
    }

    /// Run until `cancel` fires or a fatal error occurs
    ///
    /// On shutdown, envelopes already queued are still delivered, the final
    /// position is checkpointed, and the server is told about it if the
    /// connection is still open.
    pub async fn run<K>(
        &mut self,
        consumer: K,
        cancel: CancellationToken,
    ) -> std::result::Result<(), PipelineFailure>
    where
        K: ChangeConsumer + 'static,
    {
        if let Err(e) = self.config.validate() {
            return Err(self.fail(e));
        }

        let (tx, rx) = mpsc::channel(self.config.channel_capacity);
        let delivery_failed = CancellationToken::new();
        let delivery = tokio::spawn(deliver(
            consumer,
            rx,
            Arc::clone(&self.store),
            Arc::clone(&self.feedback),
            self.config.slot_name.clone(),
            self.config.ack_batch_size,
            delivery_failed.clone(),
        ));

        let outcome = self.replicate(&tx, &cancel, &delivery_failed).await;

        // Closing the queue lets the delivery worker drain and checkpoint
        drop(tx);
        let delivered = match delivery.await {
            Ok(result) => result,
            Err(e) => Err(ReplicationError::consumer(format!(
                "delivery worker did not finish: {e}"
            ))),
        };

        let open = match (outcome, delivered) {
            (_, Err(e)) => return Err(self.fail(e)),
            (Err(e), Ok(_)) => return Err(self.fail(e)),
            (Ok(open), Ok(count)) => {
                debug!("Delivery worker finished after {} transactions", count);
                open
            }
        };

        if let Some(OpenSession { mut conn, mut slot }) = open {
            if let Some(durable) = self.feedback.latest_durable() {
                match slot.acknowledge(&mut conn, &durable).await {
                    Ok(()) => info!(
                        "Confirmed {} for slot {} before shutdown",
                        durable.lsn(),
                        self.config.slot_name
                    ),
                    Err(e) => warn!("Final acknowledgement failed, the server will resend: {}", e),
                }
            }
        }

        self.last_confirmed_lsn = self.last_confirmed_lsn.max(self.feedback.durable_lsn());
        self.feedback.log_state("Supervisor stopped");
        self.set_state(SupervisorState::Stopped);
        Ok(())
    }

    /// Reconnect loop; returns the open session on shutdown, if any
    async fn replicate(
        &mut self,
        tx: &mpsc::Sender<TransactionEnvelope>,
        cancel: &CancellationToken,
        delivery_failed: &CancellationToken,
    ) -> Result<Option<OpenSession<C::Connection>>> {
        loop {
            if cancel.is_cancelled() || delivery_failed.is_cancelled() {
                return Ok(None);
            }

            self.set_state(SupervisorState::Connecting);
            let err = match self.session(tx, cancel, delivery_failed).await {
                Ok(open) => return Ok(open),
                Err(e) if e.is_transient() => e,
                Err(e) => return Err(e),
            };

            let discarded = self.sequencer.reset();
            self.set_state(SupervisorState::Disconnected);
            let delay = self.backoff.next_delay();
            warn!(
                "Slot {} disconnected ({}); {} buffered changes discarded, reconnecting in {:?} (attempt {})",
                self.config.slot_name,
                err,
                discarded,
                delay,
                self.backoff.attempt()
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                _ = delivery_failed.cancelled() => return Ok(None),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One connection from connect to disconnect
    async fn session(
        &mut self,
        tx: &mpsc::Sender<TransactionEnvelope>,
        cancel: &CancellationToken,
        delivery_failed: &CancellationToken,
    ) -> Result<Option<OpenSession<C::Connection>>> {
        let mut conn = self.connector.connect().await?;
        let identity = conn.identify_system().await?;
        debug!(
            "Connected to system {} (timeline {}, xlogpos {}, database {:?})",
            identity.system_id, identity.timeline, identity.xlogpos, identity.dbname
        );

        let mut slot = SlotManager::new(self.config.slot_name.clone(), self.config.plugin_options());
        slot.ensure_slot(&mut conn).await?;

        let checkpoint = self.store.load(&self.config.slot_name).await?;
        let from_lsn = checkpoint.map(|c| c.confirmed_lsn).unwrap_or(Lsn::ZERO);
        self.last_confirmed_lsn = self.last_confirmed_lsn.max(from_lsn);
        self.sequencer.restart(from_lsn);

        slot.start_streaming(&mut conn, from_lsn).await?;
        self.set_state(SupervisorState::Streaming);
        self.backoff.reset();

        if let Some(durable) = self.feedback.latest_durable() {
            slot.acknowledge(&mut conn, &durable).await?;
        }

        let feedback = Arc::clone(&self.feedback);
        let mut status_tick = tokio::time::interval(self.config.status_interval);
        status_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        status_tick.tick().await;

        loop {
            let data = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Shutdown requested, stopping slot {}", self.config.slot_name);
                    let discarded = self.sequencer.reset();
                    if discarded > 0 {
                        debug!("Dropped {} changes of an unfinished transaction", discarded);
                    }
                    return Ok(Some(OpenSession { conn, slot }));
                }
                _ = delivery_failed.cancelled() => return Ok(None),
                _ = feedback.notified() => {
                    if let Some(durable) = feedback.latest_durable() {
                        slot.acknowledge(&mut conn, &durable).await?;
                        self.last_confirmed_lsn = self.last_confirmed_lsn.max(durable.lsn());
                    }
                    continue;
                }
                _ = status_tick.tick() => {
                    slot.send_status(&mut conn, false).await?;
                    continue;
                }
                received = conn.recv_copy_data(cancel) => match received {
                    Err(e) if e.is_cancelled() => continue,
                    other => other?,
                },
            };

            let Some(data) = data else {
                if cancel.is_cancelled() {
                    continue;
                }
                return Err(ReplicationError::connection(
                    "replication stream closed by the server",
                ));
            };

            match parse_copy_frame(data)? {
                CopyFrame::XLogData(xlog) => {
                    slot.observe_received(xlog.wal_end);
                    feedback.update_received_lsn(xlog.wal_end);

                    let message = codec::decode_frame(&xlog.payload, Some(xlog.wal_start))?;
                    let Some(envelope) = self.sequencer.push(message)? else {
                        continue;
                    };
                    debug!(
                        "Transaction {} committed at {} with {} changes",
                        envelope.transaction_id,
                        envelope.commit_lsn,
                        envelope.len()
                    );

                    // A full queue holds decoding back, but the server still
                    // has to hear from us before wal_sender_timeout.
                    let reserve = tx.reserve();
                    tokio::pin!(reserve);
                    let permit = loop {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return Ok(Some(OpenSession { conn, slot })),
                            _ = delivery_failed.cancelled() => return Ok(None),
                            reserved = &mut reserve => match reserved {
                                Ok(permit) => break permit,
                                Err(_) => return Ok(None),
                            },
                            _ = feedback.notified() => {
                                if let Some(durable) = feedback.latest_durable() {
                                    slot.acknowledge(&mut conn, &durable).await?;
                                    self.last_confirmed_lsn = self.last_confirmed_lsn.max(durable.lsn());
                                }
                            }
                            _ = status_tick.tick() => {
                                debug!(
                                    "Delivery queue full at {}, sending status",
                                    envelope.commit_lsn
                                );
                                slot.send_status(&mut conn, false).await?;
                            }
                        }
                    };
                    permit.send(envelope);
                }
                CopyFrame::Keepalive(keepalive) => {
                    slot.observe_received(keepalive.wal_end);
                    feedback.update_received_lsn(keepalive.wal_end);
                    if keepalive.reply_requested {
                        slot.send_status(&mut conn, false).await?;
                    }
                }
                CopyFrame::Unknown(tag) => {
                    warn!("Ignoring unknown replication message type '{}'", tag as char);
                }
            }
        }
    }
}

/// Delivery worker: consumer, then checkpoint, then publish
///
/// Checkpoints after `ack_batch_size` acknowledged transactions, whenever the
/// queue runs empty, and once more when the queue is closed.
async fn deliver<K, S>(
    mut consumer: K,
    mut rx: mpsc::Receiver<TransactionEnvelope>,
    store: Arc<S>,
    feedback: Arc<SharedLsnFeedback>,
    slot_name: String,
    ack_batch_size: usize,
    failed: CancellationToken,
) -> Result<u64>
where
    K: ChangeConsumer,
    S: CheckpointStore + ?Sized,
{
    let mut batch = AckBatch::default();
    let mut delivered = 0u64;

    let result: Result<()> = async {
        loop {
            let envelope = match rx.try_recv() {
                Ok(envelope) => envelope,
                Err(TryRecvError::Empty) => {
                    batch.flush(store.as_ref(), &feedback, &slot_name).await?;
                    match rx.recv().await {
                        Some(envelope) => envelope,
                        None => break,
                    }
                }
                Err(TryRecvError::Disconnected) => break,
            };

            consumer.handle(&envelope).await.map_err(|e| match e {
                ReplicationError::Consumer(_) => e,
                other => ReplicationError::consumer(format!(
                    "transaction {} at {}: {other}",
                    envelope.transaction_id, envelope.commit_lsn
                )),
            })?;
            delivered += 1;
            batch.push(envelope.commit_lsn);

            if batch.len() >= ack_batch_size {
                batch.flush(store.as_ref(), &feedback, &slot_name).await?;
            }
        }
        batch.flush(store.as_ref(), &feedback, &slot_name).await
    }
    .await;

    if let Err(e) = result {
        error!("Delivery for slot {} stopped: {}", slot_name, e);
        failed.cancel();
        return Err(e);
    }
    Ok(delivered)
}

/// Acknowledged transactions not yet checkpointed
#[derive(Debug, Default)]
struct AckBatch {
    highest: Option<Lsn>,
    count: usize,
}

impl AckBatch {
    fn push(&mut self, commit_lsn: Lsn) {
        self.highest = Some(self.highest.map_or(commit_lsn, |h| h.max(commit_lsn)));
        self.count += 1;
    }

    fn len(&self) -> usize {
        self.count
    }

    async fn flush<S>(&mut self, store: &S, feedback: &SharedLsnFeedback, slot_name: &str) -> Result<()>
    where
        S: CheckpointStore + ?Sized,
    {
        let Some(lsn) = self.highest else {
            return Ok(());
        };
        let durable = store.save(slot_name, lsn).await.map_err(|e| match e {
            ReplicationError::Checkpoint(_) => e,
            other => ReplicationError::checkpoint(other.to_string()),
        })?;
        debug!("Checkpointed {} transactions up to {}", self.count, lsn);
        feedback.publish_durable(durable);
        *self = Self::default();
        Ok(())
    }
}
