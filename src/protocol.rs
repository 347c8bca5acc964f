//! Streaming replication sub-protocol framing
//!
//! Inside the COPY-both stream every server message starts with a one-byte tag:
//!
//! - `'w'` XLogData: `wal_start (u64) | wal_end (u64) | send_time (i64) | payload`
//! - `'k'` primary keepalive: `wal_end (u64) | send_time (i64) | reply_requested (u8)`
//!
//! The client answers with `'r'` standby status updates carrying the write,
//! flush and apply positions.

use crate::error::{ReplicationError, Result};
use crate::types::{Lsn, TimestampTz};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// XLogData tag
pub const XLOG_DATA_TAG: u8 = b'w';
/// Primary keepalive tag
pub const KEEPALIVE_TAG: u8 = b'k';
/// Standby status update tag
pub const STANDBY_STATUS_TAG: u8 = b'r';

const XLOG_DATA_HEADER_LEN: usize = 1 + 8 + 8 + 8;
const KEEPALIVE_LEN: usize = 1 + 8 + 8 + 1;
const STANDBY_STATUS_LEN: usize = 1 + 8 + 8 + 8 + 8 + 1;

/// One message received on the COPY-both stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyFrame {
    XLogData(XLogData),
    Keepalive(Keepalive),
    /// A tag this client does not understand; logged and skipped
    Unknown(u8),
}

/// A chunk of decoded WAL: for wal2json, exactly one JSON document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XLogData {
    pub wal_start: Lsn,
    pub wal_end: Lsn,
    pub send_time: TimestampTz,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Keepalive {
    pub wal_end: Lsn,
    pub send_time: TimestampTz,
    pub reply_requested: bool,
}

/// Parse a COPY data message received from the walsender
pub fn parse_copy_frame(mut data: Bytes) -> Result<CopyFrame> {
    if data.is_empty() {
        return Err(ReplicationError::protocol_violation(
            "empty replication message",
        ));
    }

    match data[0] {
        XLOG_DATA_TAG => {
            if data.len() < XLOG_DATA_HEADER_LEN {
                return Err(ReplicationError::protocol_violation(format!(
                    "XLogData message too short: {} bytes",
                    data.len()
                )));
            }
            data.advance(1);
            let wal_start = Lsn::new(data.get_u64());
            let wal_end = Lsn::new(data.get_u64());
            let send_time = data.get_i64();
            Ok(CopyFrame::XLogData(XLogData {
                wal_start,
                wal_end,
                send_time,
                payload: data,
            }))
        }
        KEEPALIVE_TAG => {
            if data.len() < KEEPALIVE_LEN {
                return Err(ReplicationError::protocol_violation(format!(
                    "keepalive message too short: {} bytes",
                    data.len()
                )));
            }
            data.advance(1);
            Ok(CopyFrame::Keepalive(Keepalive {
                wal_end: Lsn::new(data.get_u64()),
                send_time: data.get_i64(),
                reply_requested: data.get_u8() != 0,
            }))
        }
        other => Ok(CopyFrame::Unknown(other)),
    }
}

/// Build a standby status update
///
/// `write` is the last position received, `flush` and `apply` the last
/// position made durable downstream.
pub fn encode_standby_status(
    write: Lsn,
    flush: Lsn,
    apply: Lsn,
    client_time: TimestampTz,
    reply_requested: bool,
) -> Bytes {
    let mut buf = BytesMut::with_capacity(STANDBY_STATUS_LEN);
    buf.put_u8(STANDBY_STATUS_TAG);
    buf.put_u64(write.value());
    buf.put_u64(flush.value());
    buf.put_u64(apply.value());
    buf.put_i64(client_time);
    buf.put_u8(u8::from(reply_requested));
    buf.freeze()
}

/// Decoded form of a standby status update, used to inspect what was sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandbyStatus {
    pub write: Lsn,
    pub flush: Lsn,
    pub apply: Lsn,
    pub client_time: TimestampTz,
    pub reply_requested: bool,
}

/// Parse a standby status update previously built by [`encode_standby_status`]
pub fn parse_standby_status(mut data: &[u8]) -> Result<StandbyStatus> {
    if data.len() != STANDBY_STATUS_LEN || data[0] != STANDBY_STATUS_TAG {
        return Err(ReplicationError::protocol_violation(format!(
            "not a standby status update ({} bytes)",
            data.len()
        )));
    }
    data.advance(1);
    Ok(StandbyStatus {
        write: Lsn::new(data.get_u64()),
        flush: Lsn::new(data.get_u64()),
        apply: Lsn::new(data.get_u64()),
        client_time: data.get_i64(),
        reply_requested: data.get_u8() != 0,
    })
}

/// Build an XLogData frame, as the walsender would send it
pub fn encode_xlog_data(wal_start: Lsn, wal_end: Lsn, send_time: TimestampTz, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(XLOG_DATA_HEADER_LEN + payload.len());
    buf.put_u8(XLOG_DATA_TAG);
    buf.put_u64(wal_start.value());
    buf.put_u64(wal_end.value());
    buf.put_i64(send_time);
    buf.put_slice(payload);
    buf.freeze()
}

/// Build a primary keepalive frame, as the walsender would send it
pub fn encode_keepalive(wal_end: Lsn, send_time: TimestampTz, reply_requested: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(KEEPALIVE_LEN);
    buf.put_u8(KEEPALIVE_TAG);
    buf.put_u64(wal_end.value());
    buf.put_i64(send_time);
    buf.put_u8(u8::from(reply_requested));
    buf.freeze()
}
