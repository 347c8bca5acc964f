//! Thread-safe LSN tracking between the two pipeline workers
//!
//! The replication worker records how far it has received; the delivery worker
//! publishes each [`DurableLsn`] returned by the checkpoint store. The
//! replication worker is woken through [`SharedLsnFeedback::notified`] and
//! forwards the durable position to the server.
//!
//! PostgreSQL's standby status update carries three positions:
//! - `write_lsn`: data received from the stream
//! - `flush_lsn` / `apply_lsn`: data durably handled downstream
//!
//! Only the durable position may ever be reported as flushed or applied.

use crate::checkpoint::DurableLsn;
use crate::types::{CachePadded, Lsn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::{debug, info};

/// Shared tracker for received and durable positions
///
/// # Example
///
/// ```
/// use pg_walrelay::lsn::SharedLsnFeedback;
/// use pg_walrelay::Lsn;
///
/// let feedback = SharedLsnFeedback::new_shared();
/// feedback.update_received_lsn(Lsn::new(1000));
/// feedback.update_received_lsn(Lsn::new(500));
/// assert_eq!(feedback.received_lsn(), Lsn::new(1000));
/// assert!(feedback.latest_durable().is_none());
/// ```
#[derive(Debug)]
pub struct SharedLsnFeedback {
    /// Highest WAL position received from the server
    received_lsn: CachePadded<AtomicU64>,
    /// Highest position durably checkpointed
    durable_lsn: CachePadded<AtomicU64>,
    durable: Mutex<Option<DurableLsn>>,
    ack_ready: Notify,
}

impl SharedLsnFeedback {
    pub fn new() -> Self {
        Self {
            received_lsn: CachePadded::new(AtomicU64::new(0)),
            durable_lsn: CachePadded::new(AtomicU64::new(0)),
            durable: Mutex::new(None),
            ack_ready: Notify::new(),
        }
    }

    /// Create a new tracker wrapped in Arc for sharing between workers
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Advance the received position; smaller values are ignored
    #[inline(always)]
    pub fn update_received_lsn(&self, lsn: Lsn) {
        if lsn.is_zero() {
            return;
        }

        loop {
            let current = self.received_lsn.load(Ordering::Acquire);
            if lsn.value() <= current {
                return;
            }
            match self.received_lsn.compare_exchange_weak(
                current,
                lsn.value(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(_) => continue,
            }
        }
    }

    /// Publish a durable position and wake the replication worker
    ///
    /// Positions at or below the last published one are ignored.
    pub fn publish_durable(&self, durable: DurableLsn) {
        let lsn = durable.lsn();
        {
            let mut slot = match self.durable.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(existing) = slot.as_ref() {
                if existing.lsn() >= lsn {
                    return;
                }
            }
            *slot = Some(durable);
        }
        self.durable_lsn.store(lsn.value(), Ordering::Release);
        debug!("SharedLsnFeedback: durable LSN advanced to {}", lsn);
        self.ack_ready.notify_one();
    }

    #[inline(always)]
    pub fn received_lsn(&self) -> Lsn {
        Lsn::new(self.received_lsn.load(Ordering::Acquire))
    }

    #[inline(always)]
    pub fn durable_lsn(&self) -> Lsn {
        Lsn::new(self.durable_lsn.load(Ordering::Acquire))
    }

    /// The most recent durable position, if any has been published
    pub fn latest_durable(&self) -> Option<DurableLsn> {
        match self.durable.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Resolves after the next [`publish_durable`](Self::publish_durable)
    ///
    /// A publish that happens while nobody is waiting is remembered, so the
    /// next call resolves immediately.
    pub fn notified(&self) -> Notified<'_> {
        self.ack_ready.notified()
    }

    /// Log current LSN state (for debugging)
    pub fn log_state(&self, prefix: &str) {
        info!(
            "{}: received_lsn={}, durable_lsn={}",
            prefix,
            self.received_lsn(),
            self.durable_lsn()
        );
    }
}

impl Default for SharedLsnFeedback {
    fn default() -> Self {
        Self::new()
    }
}
