//! Replication slot lifecycle and server acknowledgement
//!
//! [`SlotManager`] owns one slot for the duration of a session. It makes sure
//! the slot exists with the wal2json plugin, decides where streaming starts,
//! and reports positions back to the server.
//!
//! The flush position sent to the server only ever comes from a
//! [`DurableLsn`], so PostgreSQL is never allowed to recycle WAL for a
//! transaction that has not been durably checkpointed.

use crate::checkpoint::DurableLsn;
use crate::connection::ReplicationConnection;
use crate::error::{ReplicationError, Result};
use crate::protocol::encode_standby_status;
use crate::types::{system_time_to_postgres_timestamp, Lsn, ReplicationSlot, WAL2JSON_PLUGIN};
use std::time::SystemTime;
use tracing::{debug, info, warn};

/// wal2json options sent with `START_REPLICATION`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Wal2JsonOptions {
    /// Only stream these tables (`schema.table`, `*` wildcards allowed)
    pub add_tables: Vec<String>,
    /// Never stream these tables
    pub filter_tables: Vec<String>,
}

impl Wal2JsonOptions {
    /// Plugin options in the order they are sent
    ///
    /// Truncate is left out of `actions`: it carries no rows and is not replicated.
    pub fn to_options(&self) -> Vec<(String, String)> {
        let mut options: Vec<(String, String)> = [
            ("format-version", "2"),
            ("include-xids", "1"),
            ("include-lsn", "1"),
            ("include-timestamp", "1"),
            ("include-types", "1"),
            ("include-type-oids", "0"),
            ("actions", "insert,update,delete"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        if !self.add_tables.is_empty() {
            options.push(("add-tables".to_string(), self.add_tables.join(",")));
        }
        if !self.filter_tables.is_empty() {
            options.push(("filter-tables".to_string(), self.filter_tables.join(",")));
        }
        options
    }
}

/// Manages one logical replication slot over one connection
#[derive(Debug)]
pub struct SlotManager {
    slot_name: String,
    options: Wal2JsonOptions,
    slot: Option<ReplicationSlot>,
    streaming: bool,
    received_lsn: Lsn,
    acknowledged_lsn: Lsn,
}

impl SlotManager {
    pub fn new(slot_name: impl Into<String>, options: Wal2JsonOptions) -> Self {
        Self {
            slot_name: slot_name.into(),
            options,
            slot: None,
            streaming: false,
            received_lsn: Lsn::ZERO,
            acknowledged_lsn: Lsn::ZERO,
        }
    }

    pub fn slot_name(&self) -> &str {
        &self.slot_name
    }

    /// The slot as last seen on the server
    pub fn slot(&self) -> Option<&ReplicationSlot> {
        self.slot.as_ref()
    }

    /// Make sure the slot exists and uses wal2json; idempotent
    ///
    /// Creates the slot when absent. A slot bound to another plugin is a
    /// [`ReplicationError::SlotConflict`] and is never dropped or altered.
    pub async fn ensure_slot<C>(&mut self, conn: &mut C) -> Result<ReplicationSlot>
    where
        C: ReplicationConnection + ?Sized,
    {
        let slot = match conn.fetch_slot(&self.slot_name).await? {
            Some(existing) => {
                debug!(
                    "Found replication slot {} (plugin={}, confirmed_flush_lsn={}, wal_status={:?})",
                    existing.slot_name,
                    existing.plugin_name,
                    existing.confirmed_flush_lsn,
                    existing.wal_status
                );
                existing
            }
            None => match conn.create_logical_slot(&self.slot_name, WAL2JSON_PLUGIN).await {
                Ok(created) => {
                    info!(
                        "Created replication slot {} at {}",
                        self.slot_name, created.confirmed_flush_lsn
                    );
                    created
                }
                Err(create_err) => {
                    // Someone else may have created it between our lookup and create
                    match conn.fetch_slot(&self.slot_name).await? {
                        Some(existing) => existing,
                        None => return Err(create_err),
                    }
                }
            },
        };

        if slot.plugin_name != WAL2JSON_PLUGIN {
            return Err(ReplicationError::SlotConflict {
                slot_name: self.slot_name.clone(),
                existing_plugin: slot.plugin_name.clone(),
                expected_plugin: WAL2JSON_PLUGIN.to_string(),
            });
        }

        self.slot = Some(slot.clone());
        Ok(slot)
    }

    /// Begin streaming changes committed after `from_lsn`
    ///
    /// `from_lsn` is the durable checkpoint, or zero when there is none. The
    /// stream starts at the later of `from_lsn` and the slot's confirmed
    /// position. Returns the position requested from the server.
    pub async fn start_streaming<C>(&mut self, conn: &mut C, from_lsn: Lsn) -> Result<Lsn>
    where
        C: ReplicationConnection + ?Sized,
    {
        if self.streaming {
            return Err(ReplicationError::protocol_violation(format!(
                "slot {} is already streaming",
                self.slot_name
            )));
        }
        let slot = self.slot.as_ref().ok_or_else(|| {
            ReplicationError::protocol_violation(format!(
                "start_streaming on slot {} before ensure_slot",
                self.slot_name
            ))
        })?;

        if slot.is_invalidated() {
            return Err(ReplicationError::LsnTooOld {
                slot_name: self.slot_name.clone(),
                requested: from_lsn,
                reason: "the slot has been invalidated (wal_status = lost)".to_string(),
            });
        }
        if !from_lsn.is_zero() && from_lsn < slot.confirmed_flush_lsn {
            return Err(ReplicationError::LsnTooOld {
                slot_name: self.slot_name.clone(),
                requested: from_lsn,
                reason: format!(
                    "the slot has already confirmed {}, changes after the checkpoint are gone",
                    slot.confirmed_flush_lsn
                ),
            });
        }

        let start = from_lsn.max(slot.confirmed_flush_lsn);
        conn.start_logical_replication(&self.slot_name, start, &self.options.to_options())
            .await?;

        self.streaming = true;
        self.received_lsn = start;
        info!(
            "Streaming slot {} from {} (checkpoint {}, slot confirmed {})",
            self.slot_name, start, from_lsn, slot.confirmed_flush_lsn
        );
        Ok(start)
    }

    /// Record the latest WAL position received from the server
    pub fn observe_received(&mut self, lsn: Lsn) {
        self.received_lsn = self.received_lsn.max(lsn);
    }

    /// Tell the server everything up to a durable checkpoint is consumed
    ///
    /// Never moves the acknowledged position backwards.
    pub async fn acknowledge<C>(&mut self, conn: &mut C, durable: &DurableLsn) -> Result<()>
    where
        C: ReplicationConnection + ?Sized,
    {
        if durable.slot_name() != self.slot_name {
            return Err(ReplicationError::protocol_violation(format!(
                "durable position for slot {} offered to slot {}",
                durable.slot_name(),
                self.slot_name
            )));
        }
        if durable.lsn() < self.acknowledged_lsn {
            warn!(
                "Ignoring acknowledgement of {} below already acknowledged {}",
                durable.lsn(),
                self.acknowledged_lsn
            );
            return Ok(());
        }

        self.acknowledged_lsn = durable.lsn();
        self.send_status(conn, false).await
    }

    /// Send a standby status update with the current positions
    ///
    /// Doubles as the keepalive reply. The flush position is the last
    /// acknowledged durable LSN (zero until the first acknowledgement).
    pub async fn send_status<C>(&mut self, conn: &mut C, reply_requested: bool) -> Result<()>
    where
        C: ReplicationConnection + ?Sized,
    {
        let write = self.received_lsn.max(self.acknowledged_lsn);
        let flush = self.acknowledged_lsn;
        let message = encode_standby_status(
            write,
            flush,
            flush,
            system_time_to_postgres_timestamp(SystemTime::now()),
            reply_requested,
        );
        conn.send_copy_data(message).await?;
        debug!(
            "Sent standby status update: write={}, flush={}, apply={}",
            write, flush, flush
        );
        Ok(())
    }

    pub fn acknowledged_lsn(&self) -> Lsn {
        self.acknowledged_lsn
    }

    pub fn received_lsn(&self) -> Lsn {
        self.received_lsn
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }
}
