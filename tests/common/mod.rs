//! Scripted in-memory replication server for pipeline tests
//!
//! [`ScriptedServer`] plays the walsender side: it keeps replication slots,
//! serves scripted wal2json transactions as XLogData frames and records every
//! standby status update it receives. Failures are injected per connection.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use pg_walrelay::protocol::{encode_keepalive, encode_xlog_data, parse_standby_status};
use pg_walrelay::{
    CancellationToken, ChangeConsumer, Connector, Lsn, PipelineConfig, ReplicationConnection,
    ReplicationError, ReplicationSlot, Result, SystemIdentity, TransactionEnvelope,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;

pub const SLOT: &str = "orders_cdc";
const COMMIT_TIME: &str = "2024-01-01 12:00:00.000000+00";

/// One transaction as wal2json would emit it
#[derive(Debug, Clone)]
pub struct ScriptedTransaction {
    pub xid: u32,
    pub begin: u64,
    pub commit: u64,
    rows: Vec<(u64, String)>,
}

impl ScriptedTransaction {
    pub fn begin(xid: u32, begin: u64) -> Self {
        Self {
            xid,
            begin,
            commit: 0,
            rows: Vec::new(),
        }
    }

    pub fn insert(self, lsn: u64, id: i64, status: &str) -> Self {
        let payload = format!(
            r#"{{"action":"I","xid":{},"schema":"public","table":"orders","lsn":"{}","columns":[{{"name":"id","type":"integer","value":{id}}},{{"name":"status","type":"text","value":"{status}"}}]}}"#,
            self.xid,
            Lsn::new(lsn)
        );
        self.raw(lsn, &payload)
    }

    pub fn update(self, lsn: u64, id: i64, status: &str) -> Self {
        let payload = format!(
            r#"{{"action":"U","xid":{},"schema":"public","table":"orders","lsn":"{}","columns":[{{"name":"id","type":"integer","value":{id}}},{{"name":"status","type":"text","value":"{status}"}}],"identity":[{{"name":"id","type":"integer","value":{id}}}]}}"#,
            self.xid,
            Lsn::new(lsn)
        );
        self.raw(lsn, &payload)
    }

    pub fn delete(self, lsn: u64, id: i64) -> Self {
        let payload = format!(
            r#"{{"action":"D","xid":{},"schema":"public","table":"orders","lsn":"{}","identity":[{{"name":"id","type":"integer","value":{id}}}]}}"#,
            self.xid,
            Lsn::new(lsn)
        );
        self.raw(lsn, &payload)
    }

    /// Append an arbitrary payload, malformed ones included
    pub fn raw(mut self, lsn: u64, payload: &str) -> Self {
        self.rows.push((lsn, payload.to_string()));
        self
    }

    pub fn commit(mut self, lsn: u64) -> Self {
        self.commit = lsn;
        self
    }

    fn frames(&self) -> Vec<Bytes> {
        let begin = format!(
            r#"{{"action":"B","xid":{},"lsn":"{}","timestamp":"{COMMIT_TIME}"}}"#,
            self.xid,
            Lsn::new(self.begin)
        );
        let commit = format!(
            r#"{{"action":"C","xid":{},"lsn":"{}","timestamp":"{COMMIT_TIME}"}}"#,
            self.xid,
            Lsn::new(self.commit)
        );

        let mut frames = vec![frame(self.begin, &begin)];
        frames.extend(self.rows.iter().map(|(lsn, payload)| frame(*lsn, payload)));
        frames.push(frame(self.commit, &commit));
        frames
    }
}

fn frame(lsn: u64, payload: &str) -> Bytes {
    encode_xlog_data(Lsn::new(lsn), Lsn::new(lsn), 0, payload.as_bytes())
}

/// Everything the scripted server knows and has observed
#[derive(Debug, Default)]
pub struct ServerState {
    pub slots: HashMap<String, ReplicationSlot>,
    pub transactions: Vec<ScriptedTransaction>,
    /// Connection attempts still to be refused
    pub connect_failures: usize,
    /// Frames the next streaming session serves before the server hangs up
    pub disconnect_after: Option<usize>,
    pub connects: usize,
    pub slots_created: usize,
    pub start_positions: Vec<Lsn>,
    /// `(write, flush)` of every standby status update
    pub status_updates: Vec<(Lsn, Lsn)>,
}

#[derive(Debug, Clone, Default)]
pub struct ScriptedServer {
    state: Arc<Mutex<ServerState>>,
}

impl ScriptedServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_slot(self, plugin: &str, confirmed: u64, wal_status: &str) -> Self {
        self.state().slots.insert(
            SLOT.to_string(),
            ReplicationSlot {
                slot_name: SLOT.to_string(),
                plugin_name: plugin.to_string(),
                restart_lsn: Lsn::new(confirmed),
                confirmed_flush_lsn: Lsn::new(confirmed),
                wal_status: Some(wal_status.to_string()),
            },
        );
        self
    }

    pub fn with_transaction(self, transaction: ScriptedTransaction) -> Self {
        self.state().transactions.push(transaction);
        self
    }

    pub fn fail_next_connects(&self, count: usize) {
        self.state().connect_failures = count;
    }

    pub fn disconnect_after_frames(&self, frames: usize) {
        self.state().disconnect_after = Some(frames);
    }

    pub fn state(&self) -> MutexGuard<'_, ServerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Position the server considers confirmed for the test slot
    pub fn confirmed_flush(&self) -> Option<Lsn> {
        self.state()
            .slots
            .get(SLOT)
            .map(|slot| slot.confirmed_flush_lsn)
    }

    pub fn connects(&self) -> usize {
        self.state().connects
    }
}

#[async_trait]
impl Connector for ScriptedServer {
    type Connection = ScriptedConnection;

    async fn connect(&self) -> Result<ScriptedConnection> {
        let mut state = self.state();
        state.connects += 1;
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(ReplicationError::connection("connection refused"));
        }
        Ok(ScriptedConnection {
            server: self.clone(),
            queue: VecDeque::new(),
            served: 0,
            hang_up_after: None,
        })
    }
}

/// One client connection to the scripted server
pub struct ScriptedConnection {
    server: ScriptedServer,
    queue: VecDeque<Bytes>,
    served: usize,
    hang_up_after: Option<usize>,
}

#[async_trait]
impl ReplicationConnection for ScriptedConnection {
    async fn identify_system(&mut self) -> Result<SystemIdentity> {
        let state = self.server.state();
        let xlogpos = state
            .transactions
            .iter()
            .map(|t| t.commit)
            .max()
            .unwrap_or(0);
        Ok(SystemIdentity {
            system_id: "7300000000000000001".to_string(),
            timeline: 1,
            xlogpos: Lsn::new(xlogpos),
            dbname: Some("shop".to_string()),
        })
    }

    async fn fetch_slot(&mut self, slot_name: &str) -> Result<Option<ReplicationSlot>> {
        Ok(self.server.state().slots.get(slot_name).cloned())
    }

    async fn create_logical_slot(&mut self, slot_name: &str, plugin: &str) -> Result<ReplicationSlot> {
        let mut state = self.server.state();
        if state.slots.contains_key(slot_name) {
            return Err(ReplicationError::slot_unavailable(format!(
                "replication slot \"{slot_name}\" already exists"
            )));
        }
        let slot = ReplicationSlot {
            slot_name: slot_name.to_string(),
            plugin_name: plugin.to_string(),
            restart_lsn: Lsn::new(10),
            confirmed_flush_lsn: Lsn::new(10),
            wal_status: Some("reserved".to_string()),
        };
        state.slots.insert(slot_name.to_string(), slot.clone());
        state.slots_created += 1;
        Ok(slot)
    }

    /// Serves every transaction committed at or after `start_lsn`, the way a
    /// walsender replays from the slot's restart position
    async fn start_logical_replication(
        &mut self,
        slot_name: &str,
        start_lsn: Lsn,
        _options: &[(String, String)],
    ) -> Result<()> {
        let mut state = self.server.state();
        if !state.slots.contains_key(slot_name) {
            return Err(ReplicationError::slot_unavailable(format!(
                "replication slot \"{slot_name}\" does not exist"
            )));
        }
        state.start_positions.push(start_lsn);
        self.hang_up_after = state.disconnect_after.take();

        let mut last = start_lsn;
        for transaction in state.transactions.iter().filter(|t| t.commit >= start_lsn.value()) {
            self.queue.extend(transaction.frames());
            last = last.max(Lsn::new(transaction.commit));
        }
        self.queue.push_back(encode_keepalive(last, 0, true));
        Ok(())
    }

    async fn recv_copy_data(&mut self, cancel: &CancellationToken) -> Result<Option<Bytes>> {
        if self.hang_up_after.is_some_and(|limit| self.served >= limit) {
            return Ok(None);
        }
        if let Some(frame) = self.queue.pop_front() {
            self.served += 1;
            return Ok(Some(frame));
        }
        cancel.cancelled().await;
        Err(ReplicationError::cancelled("receive cancelled"))
    }

    async fn send_copy_data(&mut self, data: Bytes) -> Result<()> {
        let status = parse_standby_status(&data)?;
        let mut state = self.server.state();
        state.status_updates.push((status.write, status.flush));
        for slot in state.slots.values_mut() {
            slot.confirmed_flush_lsn = slot.confirmed_flush_lsn.max(status.flush);
        }
        Ok(())
    }
}

/// Consumer that records envelopes and can refuse one commit position
#[derive(Debug, Clone, Default)]
pub struct RecordingConsumer {
    delivered: Arc<Mutex<Vec<TransactionEnvelope>>>,
    reject_commit: Option<Lsn>,
    /// When set, each envelope waits for a permit before it is handled
    gate: Option<Arc<Semaphore>>,
}

impl RecordingConsumer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting(commit: u64) -> Self {
        Self {
            reject_commit: Some(Lsn::new(commit)),
            ..Self::default()
        }
    }

    /// A consumer that blocks until the returned gate hands out permits
    pub fn gated() -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        let consumer = Self {
            gate: Some(Arc::clone(&gate)),
            ..Self::default()
        };
        (consumer, gate)
    }

    pub fn delivered(&self) -> Vec<TransactionEnvelope> {
        match self.delivered.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn commit_lsns(&self) -> Vec<u64> {
        self.delivered().iter().map(|e| e.commit_lsn.value()).collect()
    }
}

#[async_trait]
impl ChangeConsumer for RecordingConsumer {
    async fn handle(&mut self, envelope: &TransactionEnvelope) -> Result<()> {
        if let Some(gate) = &self.gate {
            gate.acquire()
                .await
                .map_err(|_| ReplicationError::consumer("gate closed"))?
                .forget();
        }
        if self.reject_commit == Some(envelope.commit_lsn) {
            return Err(ReplicationError::consumer(format!(
                "downstream rejected transaction {}",
                envelope.transaction_id
            )));
        }
        self.delivered
            .lock()
            .map_err(|_| ReplicationError::consumer("recording lock poisoned"))?
            .push(envelope.clone());
        Ok(())
    }
}

pub fn test_config() -> PipelineConfig {
    PipelineConfig {
        slot_name: SLOT.to_string(),
        database_connection_string: "host=scripted dbname=shop".to_string(),
        reconnect_backoff_min: Duration::from_millis(5),
        reconnect_backoff_max: Duration::from_millis(40),
        ack_batch_size: 1,
        status_interval: Duration::from_secs(5),
        channel_capacity: 4,
        ..PipelineConfig::default()
    }
}

/// Poll until `predicate` holds, failing the test after five seconds
pub async fn wait_until<F>(what: &str, predicate: F)
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while !predicate() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
