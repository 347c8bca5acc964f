//! Transaction reassembly
//!
//! [`ChangeSequencer`] buffers the rows of each open transaction and releases
//! them as a single [`TransactionEnvelope`] when the commit arrives. A
//! transaction is never released partially: rows buffered when the stream
//! breaks are dropped by [`ChangeSequencer::abort`] / [`ChangeSequencer::reset`]
//! and received again after the reconnect.
//!
//! Commits at or below the resume floor (the last durable checkpoint, or the
//! last envelope already handed downstream) are skipped so a resumed stream
//! does not hand the same transaction out twice.

use crate::codec::WalMessage;
use crate::error::{ReplicationError, Result};
use crate::types::{ChangeRecord, Lsn, TransactionEnvelope, Xid};
use std::collections::HashMap;
use tracing::{debug, trace, warn};

/// Default cap on buffered rows per transaction
pub const DEFAULT_MAX_TRANSACTION_CHANGES: usize = 1_000_000;

#[derive(Debug)]
struct PendingTransaction {
    begin_lsn: Lsn,
    last_lsn: Lsn,
    changes: Vec<ChangeRecord>,
}

/// Groups decoded messages into committed transactions
#[derive(Debug)]
pub struct ChangeSequencer {
    open: HashMap<Xid, PendingTransaction>,
    /// Most recently begun transaction still open; rows without an xid belong here
    current: Option<Xid>,
    resume_floor: Lsn,
    last_commit_lsn: Lsn,
    max_transaction_changes: usize,
    skipped: u64,
}

impl ChangeSequencer {
    /// Create a sequencer that skips commits at or below `resume_floor`
    pub fn new(resume_floor: Lsn) -> Self {
        Self {
            open: HashMap::new(),
            current: None,
            resume_floor,
            last_commit_lsn: Lsn::ZERO,
            max_transaction_changes: DEFAULT_MAX_TRANSACTION_CHANGES,
            skipped: 0,
        }
    }

    /// Cap buffered rows per transaction; 0 removes the cap
    pub fn with_max_transaction_changes(mut self, max: usize) -> Self {
        self.max_transaction_changes = if max == 0 { usize::MAX } else { max };
        self
    }

    /// Feed one decoded message; returns an envelope when a transaction commits
    pub fn push(&mut self, message: WalMessage) -> Result<Option<TransactionEnvelope>> {
        match message {
            WalMessage::Begin {
                xid,
                lsn,
                timestamp,
            } => {
                if self.open.contains_key(&xid) {
                    return Err(ReplicationError::protocol_violation(format!(
                        "transaction {xid} began at {lsn} while already open"
                    )));
                }
                if let Some(open) = self.current {
                    return Err(ReplicationError::protocol_violation(format!(
                        "transaction {xid} began at {lsn} while transaction {open} is still open"
                    )));
                }
                trace!("begin xid={} lsn={} timestamp={}", xid, lsn, timestamp);
                self.open.insert(
                    xid,
                    PendingTransaction {
                        begin_lsn: lsn,
                        last_lsn: lsn,
                        changes: Vec::new(),
                    },
                );
                self.current = Some(xid);
                Ok(None)
            }

            WalMessage::Change(record) => {
                let xid = match (record.transaction_id(), self.current) {
                    (0, Some(current)) => current,
                    (0, None) => {
                        return Err(ReplicationError::protocol_violation(format!(
                            "{} on {} at {} outside of any transaction",
                            record.kind(),
                            record.qualified_table(),
                            record.lsn()
                        )))
                    }
                    (xid, _) => xid,
                };
                let max = self.max_transaction_changes;
                let pending = self.open.get_mut(&xid).ok_or_else(|| {
                    ReplicationError::protocol_violation(format!(
                        "{} at {} belongs to transaction {xid}, which is not open",
                        record.kind(),
                        record.lsn()
                    ))
                })?;
                if record.lsn() < pending.last_lsn {
                    return Err(ReplicationError::protocol_violation(format!(
                        "LSN moved backwards inside transaction {xid}: {} after {}",
                        record.lsn(),
                        pending.last_lsn
                    )));
                }
                if pending.changes.len() >= max {
                    return Err(ReplicationError::protocol_violation(format!(
                        "transaction {xid} exceeds {max} buffered changes"
                    )));
                }
                pending.last_lsn = record.lsn();
                pending.changes.push(record.with_transaction_id(xid));
                Ok(None)
            }

            WalMessage::Commit {
                xid,
                lsn,
                timestamp,
            } => {
                let pending = self.open.remove(&xid).ok_or_else(|| {
                    ReplicationError::protocol_violation(format!(
                        "commit at {lsn} for transaction {xid}, which is not open"
                    ))
                })?;
                if self.current == Some(xid) {
                    self.current = None;
                }
                if lsn < pending.last_lsn {
                    return Err(ReplicationError::protocol_violation(format!(
                        "commit LSN {lsn} of transaction {xid} precedes its last change at {}",
                        pending.last_lsn
                    )));
                }

                if lsn <= self.resume_floor {
                    self.skipped += 1;
                    debug!(
                        "Skipping transaction {} committed at {} (resume floor {})",
                        xid, lsn, self.resume_floor
                    );
                    return Ok(None);
                }
                if lsn <= self.last_commit_lsn {
                    return Err(ReplicationError::protocol_violation(format!(
                        "commit LSN {lsn} of transaction {xid} does not follow previous commit {}",
                        self.last_commit_lsn
                    )));
                }

                self.last_commit_lsn = lsn;
                debug!(
                    "Transaction {} committed at {} with {} changes",
                    xid,
                    lsn,
                    pending.changes.len()
                );
                Ok(Some(TransactionEnvelope {
                    transaction_id: xid,
                    begin_lsn: pending.begin_lsn,
                    commit_lsn: lsn,
                    commit_timestamp: timestamp,
                    changes: pending.changes,
                }))
            }

            WalMessage::LogicalMessage {
                transactional,
                prefix,
                lsn,
                ..
            } => {
                debug!(
                    "Ignoring logical message prefix={} transactional={} lsn={}",
                    prefix, transactional, lsn
                );
                Ok(None)
            }
        }
    }

    /// Drop a partially received transaction; returns the number of rows discarded
    pub fn abort(&mut self, xid: Xid) -> usize {
        if self.current == Some(xid) {
            self.current = None;
        }
        match self.open.remove(&xid) {
            Some(pending) => {
                warn!(
                    "Discarding partial transaction {} ({} buffered changes)",
                    xid,
                    pending.changes.len()
                );
                pending.changes.len()
            }
            None => 0,
        }
    }

    /// Drop every open transaction; returns the number of rows discarded
    pub fn reset(&mut self) -> usize {
        let xids: Vec<Xid> = self.open.keys().copied().collect();
        xids.into_iter().map(|xid| self.abort(xid)).sum()
    }

    /// Prepare for a resumed stream: discard open transactions and raise the floor
    ///
    /// The floor never drops below the last commit already released.
    pub fn restart(&mut self, checkpoint: Lsn) -> usize {
        let discarded = self.reset();
        self.resume_floor = self.resume_floor.max(checkpoint).max(self.last_commit_lsn);
        discarded
    }

    pub fn has_open_transaction(&self) -> bool {
        !self.open.is_empty()
    }

    pub fn resume_floor(&self) -> Lsn {
        self.resume_floor
    }

    /// Commit LSN of the last envelope released
    pub fn last_commit_lsn(&self) -> Lsn {
        self.last_commit_lsn
    }

    /// Number of committed transactions skipped because they were at or below the floor
    pub fn skipped(&self) -> u64 {
        self.skipped
    }
}
