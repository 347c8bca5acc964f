//! PostgreSQL type aliases, LSN helpers and the change data model
//!
//! This module provides the LSN newtype used throughout the crate, timestamp
//! conversion for the replication protocol, and the decoded change types
//! ([`ChangeRecord`], [`TransactionEnvelope`], [`ColumnValue`]) handed to
//! downstream consumers.

use crate::error::{ReplicationError, Result};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

// PostgreSQL constants
/// Seconds from Unix epoch (1970-01-01) to PostgreSQL epoch (2000-01-01)
pub const PG_EPOCH_OFFSET_SECS: i64 = 946_684_800;
/// Invalid/zero LSN pointer
pub const INVALID_XLOG_REC_PTR: u64 = 0;
/// The only output plugin this crate speaks
pub const WAL2JSON_PLUGIN: &str = "wal2json";

// Type aliases matching PostgreSQL types
/// Write-Ahead Log Record Pointer (64-bit LSN)
pub type XLogRecPtr = u64;
/// Transaction ID (32-bit)
pub type Xid = u32;
/// PostgreSQL Timestamp (microseconds since 2000-01-01)
pub type TimestampTz = i64;

/// Pads and aligns a value to the length of a cache line to reduce false sharing.
#[derive(Debug)]
#[cfg_attr(
    any(
        target_arch = "x86_64",
        target_arch = "aarch64",
        target_arch = "powerpc64",
    ),
    repr(align(128))
)]
#[cfg_attr(
    not(any(
        target_arch = "x86_64",
        target_arch = "aarch64",
        target_arch = "powerpc64",
    )),
    repr(align(64))
)]
pub struct CachePadded<T> {
    value: T,
}

impl<T> CachePadded<T> {
    #[inline]
    pub const fn new(value: T) -> Self {
        Self { value }
    }
}

impl<T> std::ops::Deref for CachePadded<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

/// Convert SystemTime to PostgreSQL timestamp format (microseconds since 2000-01-01)
///
/// Times before the Unix epoch clamp to the Unix epoch.
///
/// # Example
///
/// ```
/// use pg_walrelay::system_time_to_postgres_timestamp;
/// use std::time::{Duration, UNIX_EPOCH};
///
/// let y2k = UNIX_EPOCH + Duration::from_secs(946_684_800);
/// assert_eq!(system_time_to_postgres_timestamp(y2k), 0);
/// ```
pub fn system_time_to_postgres_timestamp(time: SystemTime) -> TimestampTz {
    let duration_since_unix = time.duration_since(UNIX_EPOCH).unwrap_or_default();

    let unix_secs = duration_since_unix.as_secs() as i64;
    let unix_micros = unix_secs * 1_000_000 + (duration_since_unix.subsec_micros() as i64);

    // Convert from Unix epoch to PostgreSQL epoch
    unix_micros - PG_EPOCH_OFFSET_SECS * 1_000_000
}

/// Parse an LSN from PostgreSQL's `high/low` hexadecimal text form
///
/// # Example
///
/// ```
/// use pg_walrelay::parse_lsn;
///
/// assert_eq!(parse_lsn("16/B374D848").unwrap(), 0x16_B374_D848);
/// assert!(parse_lsn("not-an-lsn").is_err());
/// ```
pub fn parse_lsn(lsn_str: &str) -> Result<XLogRecPtr> {
    let (high, low) = lsn_str.split_once('/').ok_or_else(|| {
        ReplicationError::protocol_violation(format!(
            "Invalid LSN format: {lsn_str}. Expected format: high/low"
        ))
    })?;

    let high = u64::from_str_radix(high, 16).map_err(|e| {
        ReplicationError::protocol_violation(format!("Invalid LSN high part: {e}"))
    })?;
    let low = u64::from_str_radix(low, 16).map_err(|e| {
        ReplicationError::protocol_violation(format!("Invalid LSN low part: {e}"))
    })?;
    if high > u32::MAX as u64 || low > u32::MAX as u64 {
        return Err(ReplicationError::protocol_violation(format!(
            "Invalid LSN format: {lsn_str}. Both halves must fit in 32 bits"
        )));
    }

    Ok((high << 32) | low)
}

/// Format an LSN the way PostgreSQL prints it
pub fn format_lsn(lsn: XLogRecPtr) -> String {
    format!("{:X}/{:X}", lsn >> 32, lsn & 0xFFFFFFFF)
}

/// Log sequence number: a totally ordered position in the WAL
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Lsn(pub u64);

impl Lsn {
    /// The invalid position, used as "nothing yet"
    pub const ZERO: Lsn = Lsn(INVALID_XLOG_REC_PTR);

    /// Create a new LSN from a u64 value
    ///
    /// # Example
    ///
    /// ```
    /// use pg_walrelay::Lsn;
    ///
    /// let lsn = Lsn::new(0x16B374D848);
    /// assert_eq!(lsn.value(), 0x16B374D848);
    /// assert_eq!(lsn.to_string(), "16/B374D848");
    /// ```
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Get the raw u64 value
    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == INVALID_XLOG_REC_PTR
    }
}

/// Parse LSN from PostgreSQL string format (e.g., "16/B374D848")
impl std::str::FromStr for Lsn {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self> {
        parse_lsn(s).map(Self)
    }
}

impl std::fmt::Display for Lsn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", format_lsn(self.0))
    }
}

impl From<u64> for Lsn {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Lsn> for u64 {
    fn from(lsn: Lsn) -> Self {
        lsn.0
    }
}

/// Row-level operation carried by a [`ChangeRecord`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    /// The single-letter action code wal2json uses for this kind
    pub fn action_code(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "I",
            ChangeKind::Update => "U",
            ChangeKind::Delete => "D",
        }
    }

    pub fn from_action_code(code: &str) -> Option<Self> {
        match code {
            "I" => Some(ChangeKind::Insert),
            "U" => Some(ChangeKind::Update),
            "D" => Some(ChangeKind::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// The typed shape a PostgreSQL column type decodes into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Boolean,
    Integer,
    Float,
    Numeric,
    Text,
    Date,
    Timestamp,
    TimestampTz,
    Json,
    Bytes,
}

/// A decoded column value
///
/// `Numeric` keeps the exact decimal text so no precision is lost.
/// Values PostgreSQL prints specially (`infinity` dates and timestamps)
/// decode as `Text`.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Numeric(String),
    Text(String),
    Date(NaiveDate),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<FixedOffset>),
    Json(serde_json::Value),
    Bytes(Vec<u8>),
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ColumnValue::Text(s) | ColumnValue::Numeric(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ColumnValue::Integer(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ColumnValue::Boolean(v) => Some(*v),
            _ => None,
        }
    }
}

/// Serializes to the natural JSON form: numbers and booleans stay native,
/// dates and timestamps become ISO-8601 strings, bytes become `\x`-prefixed hex.
impl Serialize for ColumnValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            ColumnValue::Null => serializer.serialize_none(),
            ColumnValue::Boolean(v) => serializer.serialize_bool(*v),
            ColumnValue::Integer(v) => serializer.serialize_i64(*v),
            ColumnValue::Float(v) if v.is_finite() => serializer.serialize_f64(*v),
            ColumnValue::Float(v) => serializer.collect_str(v),
            ColumnValue::Numeric(v) | ColumnValue::Text(v) => serializer.serialize_str(v),
            ColumnValue::Date(v) => serializer.collect_str(&v.format("%Y-%m-%d")),
            ColumnValue::Timestamp(v) => serializer.collect_str(&v.format("%Y-%m-%dT%H:%M:%S%.f")),
            ColumnValue::TimestampTz(v) => {
                serializer.serialize_str(&v.to_rfc3339_opts(SecondsFormat::AutoSi, false))
            }
            ColumnValue::Json(v) => v.serialize(serializer),
            ColumnValue::Bytes(v) => serializer.serialize_str(&encode_bytea_hex(v)),
        }
    }
}

/// Encode bytes in PostgreSQL's `bytea` hex output format
pub fn encode_bytea_hex(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("\\x");
    for b in bytes {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0x0f) as usize] as char);
    }
    out
}

/// A named, typed column
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    /// The PostgreSQL type name as reported by the plugin
    pub type_name: String,
    pub value: ColumnValue,
}

impl Column {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>, value: ColumnValue) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            value,
        }
    }
}

impl Serialize for Column {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(3))?;
        map.serialize_entry("name", &self.name)?;
        map.serialize_entry("type", &self.type_name)?;
        map.serialize_entry("value", &self.value)?;
        map.end()
    }
}

/// A single decoded row change
///
/// Immutable once decoded. The transaction id is stamped by the sequencer
/// when the row is attached to its open transaction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeRecord {
    kind: ChangeKind,
    schema: String,
    table: String,
    columns: Vec<Column>,
    #[serde(skip_serializing_if = "Option::is_none")]
    old_columns: Option<Vec<Column>>,
    lsn: Lsn,
    transaction_id: Xid,
}

impl ChangeRecord {
    pub fn new(
        kind: ChangeKind,
        schema: impl Into<String>,
        table: impl Into<String>,
        columns: Vec<Column>,
        old_columns: Option<Vec<Column>>,
        lsn: Lsn,
    ) -> Self {
        Self {
            kind,
            schema: schema.into(),
            table: table.into(),
            columns,
            old_columns,
            lsn,
            transaction_id: 0,
        }
    }

    pub(crate) fn with_transaction_id(mut self, xid: Xid) -> Self {
        self.transaction_id = xid;
        self
    }

    pub fn kind(&self) -> ChangeKind {
        self.kind
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// `schema.table`
    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    /// New row image for inserts and updates, empty for deletes
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Old key or full old row, when the table's replica identity provides one
    pub fn old_columns(&self) -> Option<&[Column]> {
        self.old_columns.as_deref()
    }

    pub fn lsn(&self) -> Lsn {
        self.lsn
    }

    /// Zero until the record has been attached to a transaction
    pub fn transaction_id(&self) -> Xid {
        self.transaction_id
    }

    /// Look up a column of the new row image by name
    pub fn column(&self, name: &str) -> Option<&ColumnValue> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .map(|c| &c.value)
    }

    /// Look up a column of the old row image by name
    pub fn old_column(&self, name: &str) -> Option<&ColumnValue> {
        self.old_columns
            .as_ref()?
            .iter()
            .find(|c| c.name == name)
            .map(|c| &c.value)
    }
}

/// A committed transaction, delivered downstream as one unit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionEnvelope {
    pub transaction_id: Xid,
    pub begin_lsn: Lsn,
    pub commit_lsn: Lsn,
    pub commit_timestamp: DateTime<Utc>,
    pub changes: Vec<ChangeRecord>,
}

impl TransactionEnvelope {
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Server-side state of a logical replication slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationSlot {
    pub slot_name: String,
    pub plugin_name: String,
    pub restart_lsn: Lsn,
    pub confirmed_flush_lsn: Lsn,
    /// `reserved`, `extended`, `unreserved` or `lost`; absent on servers that do not report it
    pub wal_status: Option<String>,
}

impl ReplicationSlot {
    /// True once the server has removed WAL the slot still needed
    pub fn is_invalidated(&self) -> bool {
        self.wal_status.as_deref() == Some("lost")
    }
}

/// Reply to `IDENTIFY_SYSTEM`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemIdentity {
    pub system_id: String,
    pub timeline: u32,
    pub xlogpos: Lsn,
    pub dbname: Option<String>,
}
