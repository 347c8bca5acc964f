//! Downstream delivery of committed transactions

use crate::error::{ReplicationError, Result};
use crate::types::TransactionEnvelope;
use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Receives committed transactions in commit order
///
/// Returning `Ok` acknowledges the envelope: its commit position becomes
/// eligible for the next checkpoint. Returning an error stops the pipeline
/// without advancing the checkpoint, so the envelope is delivered again after
/// a restart.
#[async_trait]
pub trait ChangeConsumer: Send {
    async fn handle(&mut self, envelope: &TransactionEnvelope) -> Result<()>;
}

/// Writes each envelope as a single JSON line
///
/// The writer is flushed before the envelope is acknowledged.
///
/// # Example
///
/// ```
/// use pg_walrelay::consumer::JsonLinesConsumer;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let consumer = JsonLinesConsumer::new(Vec::new());
/// assert_eq!(consumer.written(), 0);
/// let buffer: Vec<u8> = consumer.into_inner();
/// assert!(buffer.is_empty());
/// # }
/// ```
pub struct JsonLinesConsumer<W> {
    writer: W,
    written: u64,
}

impl<W> JsonLinesConsumer<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self { writer, written: 0 }
    }

    /// Number of envelopes written so far
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W> ChangeConsumer for JsonLinesConsumer<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn handle(&mut self, envelope: &TransactionEnvelope) -> Result<()> {
        let mut line = serde_json::to_vec(envelope).map_err(|e| {
            ReplicationError::consumer(format!(
                "failed to serialize transaction {}: {e}",
                envelope.transaction_id
            ))
        })?;
        line.push(b'\n');

        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        self.written += 1;

        debug!(
            "Wrote transaction {} ({} changes, commit {})",
            envelope.transaction_id,
            envelope.len(),
            envelope.commit_lsn
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ChangeKind, ChangeRecord, Column, ColumnValue, Lsn};
    use chrono::{TimeZone, Utc};

    fn envelope(xid: u32, commit: u64) -> TransactionEnvelope {
        let change = ChangeRecord::new(
            ChangeKind::Insert,
            "public",
            "orders",
            vec![
                Column::new("id", "integer", ColumnValue::Integer(7)),
                Column::new("note", "text", ColumnValue::Text("hi".to_string())),
            ],
            None,
            Lsn::new(commit - 1),
        )
        .with_transaction_id(xid);
        TransactionEnvelope {
            transaction_id: xid,
            begin_lsn: Lsn::new(commit - 2),
            commit_lsn: Lsn::new(commit),
            commit_timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap(),
            changes: vec![change],
        }
    }

    #[tokio::test]
    async fn test_writes_one_line_per_envelope() {
        let mut consumer = JsonLinesConsumer::new(Vec::new());
        consumer.handle(&envelope(5, 103)).await.unwrap();
        consumer.handle(&envelope(6, 203)).await.unwrap();
        assert_eq!(consumer.written(), 2);

        let output = String::from_utf8(consumer.into_inner()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["transaction_id"], 5);
        assert_eq!(first["commit_lsn"], 103);
        assert_eq!(first["changes"][0]["kind"], "insert");
        assert_eq!(first["changes"][0]["columns"][0]["value"], 7);
        assert_eq!(first["changes"][0]["columns"][1]["type"], "text");
    }
}
