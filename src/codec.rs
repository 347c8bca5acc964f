//! wal2json (format-version 2) payload decoding
//!
//! Each XLogData payload holds one JSON document. [`decode`] turns it into a
//! [`WalMessage`] without consulting any state: transaction grouping is the
//! sequencer's job.
//!
//! Column values are typed by the declared PostgreSQL type (`include-types`).
//! The mapping table is [`value_kind_for`]; types it does not know, array types
//! and user-defined types decode as [`ColumnValue::Text`].

use crate::error::DecodeError;
use crate::types::{
    parse_lsn, ChangeKind, ChangeRecord, Column, ColumnValue, Lsn, ValueKind, Xid,
};
use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::value::RawValue;
use serde_json::Value;

/// One decoded wal2json document
#[derive(Debug, Clone, PartialEq)]
pub enum WalMessage {
    Begin {
        xid: Xid,
        lsn: Lsn,
        timestamp: DateTime<Utc>,
    },
    Commit {
        xid: Xid,
        lsn: Lsn,
        timestamp: DateTime<Utc>,
    },
    Change(ChangeRecord),
    /// `pg_logical_emit_message` output; passed through the sequencer untouched
    LogicalMessage {
        transactional: bool,
        prefix: String,
        content: String,
        lsn: Lsn,
    },
}

impl WalMessage {
    pub fn lsn(&self) -> Lsn {
        match self {
            WalMessage::Begin { lsn, .. }
            | WalMessage::Commit { lsn, .. }
            | WalMessage::LogicalMessage { lsn, .. } => *lsn,
            WalMessage::Change(record) => record.lsn(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    action: String,
    #[serde(default)]
    xid: Option<Xid>,
    #[serde(default)]
    lsn: Option<RawLsn>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    schema: Option<String>,
    #[serde(default)]
    table: Option<String>,
    #[serde(default)]
    columns: Option<Vec<RawColumn>>,
    #[serde(default)]
    identity: Option<Vec<RawColumn>>,
    #[serde(default)]
    transactional: Option<bool>,
    #[serde(default)]
    prefix: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawLsn {
    Text(String),
    Number(u64),
}

#[derive(Debug, Deserialize)]
struct RawColumn {
    name: String,
    #[serde(rename = "type")]
    type_name: Option<String>,
    #[serde(default)]
    value: Option<Box<RawValue>>,
}

/// Decode one wal2json document
///
/// # Example
///
/// ```
/// use pg_walrelay::{decode, WalMessage};
///
/// let msg = decode(br#"{"action":"B","xid":5,"lsn":"0/64","timestamp":"2024-01-01 00:00:00+00"}"#).unwrap();
/// assert!(matches!(msg, WalMessage::Begin { xid: 5, .. }));
/// ```
pub fn decode(raw: &[u8]) -> Result<WalMessage, DecodeError> {
    decode_frame(raw, None)
}

/// Decode one wal2json document carried by an XLogData frame
///
/// `wal_start` is used as the position of messages that carry no `lsn` of
/// their own (wal2json only emits it when `include-lsn` is set).
pub fn decode_frame(raw: &[u8], wal_start: Option<Lsn>) -> Result<WalMessage, DecodeError> {
    let msg: RawMessage = serde_json::from_slice(raw)
        .map_err(|e| DecodeError::new(format!("malformed wal2json document: {e}"), raw))?;

    let lsn = match msg.lsn {
        Some(RawLsn::Text(ref text)) => parse_lsn(text)
            .map(Lsn::new)
            .map_err(|_| DecodeError::new(format!("invalid lsn \"{text}\""), raw))?,
        Some(RawLsn::Number(n)) => Lsn::new(n),
        None => wal_start.ok_or_else(|| DecodeError::new("missing field `lsn`", raw))?,
    };

    match msg.action.as_str() {
        "B" | "C" => {
            let xid = msg
                .xid
                .ok_or_else(|| DecodeError::new("missing field `xid`", raw))?;
            let text = msg
                .timestamp
                .as_deref()
                .ok_or_else(|| DecodeError::new("missing field `timestamp`", raw))?;
            let timestamp = parse_commit_timestamp(text)
                .ok_or_else(|| DecodeError::new(format!("invalid timestamp \"{text}\""), raw))?;
            if msg.action == "B" {
                Ok(WalMessage::Begin {
                    xid,
                    lsn,
                    timestamp,
                })
            } else {
                Ok(WalMessage::Commit {
                    xid,
                    lsn,
                    timestamp,
                })
            }
        }
        "I" | "U" | "D" => {
            let kind = ChangeKind::from_action_code(&msg.action)
                .ok_or_else(|| DecodeError::new("unknown action", raw))?;
            decode_change(kind, msg, lsn, raw).map(WalMessage::Change)
        }
        "M" => Ok(WalMessage::LogicalMessage {
            transactional: msg.transactional.unwrap_or(false),
            prefix: msg.prefix.unwrap_or_default(),
            content: msg.content.unwrap_or_default(),
            lsn,
        }),
        "T" => Err(DecodeError::new(
            "unsupported action \"T\" (truncate is not replicated)",
            raw,
        )),
        other => Err(DecodeError::new(format!("unknown action \"{other}\""), raw)),
    }
}

fn decode_change(
    kind: ChangeKind,
    msg: RawMessage,
    lsn: Lsn,
    raw: &[u8],
) -> Result<ChangeRecord, DecodeError> {
    let xid = msg.xid;
    let schema = msg
        .schema
        .ok_or_else(|| DecodeError::new("missing field `schema`", raw))?;
    let table = msg
        .table
        .ok_or_else(|| DecodeError::new("missing field `table`", raw))?;

    let columns = match (kind, msg.columns) {
        (ChangeKind::Delete, columns) => decode_columns(columns.unwrap_or_default(), raw)?,
        (_, Some(columns)) => decode_columns(columns, raw)?,
        (_, None) => return Err(DecodeError::new("missing field `columns`", raw)),
    };

    let old_columns = match msg.identity {
        Some(identity) => Some(decode_columns(identity, raw)?),
        None if kind == ChangeKind::Delete => {
            return Err(DecodeError::new("missing field `identity` on delete", raw))
        }
        None => None,
    };

    let record = ChangeRecord::new(kind, schema, table, columns, old_columns, lsn);
    Ok(match xid {
        Some(xid) => record.with_transaction_id(xid),
        None => record,
    })
}

fn decode_columns(raw_columns: Vec<RawColumn>, raw: &[u8]) -> Result<Vec<Column>, DecodeError> {
    raw_columns
        .into_iter()
        .map(|col| {
            let type_name = col.type_name.ok_or_else(|| {
                DecodeError::new(format!("column \"{}\" has no `type`", col.name), raw)
            })?;
            let value = decode_value(&type_name, col.value.as_deref()).map_err(|reason| {
                DecodeError::new(
                    format!("column \"{}\" ({type_name}): {reason}", col.name),
                    raw,
                )
            })?;
            Ok(Column {
                name: col.name,
                type_name,
                value,
            })
        })
        .collect()
}

/// Map a PostgreSQL type name, as printed by `format_type`, to the value kind it decodes into
///
/// Type modifiers are ignored, so `character varying(20)` and `numeric(10,2)`
/// map like their bare names.
pub fn value_kind_for(type_name: &str) -> ValueKind {
    let base = strip_type_modifiers(type_name);
    if base.ends_with("[]") {
        return ValueKind::Text;
    }
    match base.as_str() {
        "boolean" | "bool" => ValueKind::Boolean,
        "smallint" | "integer" | "bigint" | "int2" | "int4" | "int8" | "oid" => {
            ValueKind::Integer
        }
        "real" | "double precision" | "float4" | "float8" => ValueKind::Float,
        "numeric" | "decimal" => ValueKind::Numeric,
        "date" => ValueKind::Date,
        "timestamp without time zone" | "timestamp" => ValueKind::Timestamp,
        "timestamp with time zone" | "timestamptz" => ValueKind::TimestampTz,
        "json" | "jsonb" => ValueKind::Json,
        "bytea" => ValueKind::Bytes,
        _ => ValueKind::Text,
    }
}

fn strip_type_modifiers(type_name: &str) -> String {
    let mut out = String::with_capacity(type_name.len());
    let mut depth = 0usize;
    for ch in type_name.chars() {
        match ch {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ if depth == 0 => out.push(ch.to_ascii_lowercase()),
            _ => {}
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn decode_value(type_name: &str, raw_value: Option<&RawValue>) -> Result<ColumnValue, String> {
    let Some(raw_value) = raw_value else {
        return Ok(ColumnValue::Null);
    };
    let kind = value_kind_for(type_name);

    // Unquoted numerics keep their exact source text
    if kind == ValueKind::Numeric {
        let text = raw_value.get().trim();
        if !text.starts_with('"') && text != "null" {
            return Ok(ColumnValue::Numeric(text.to_string()));
        }
    }

    let value: Value = serde_json::from_str(raw_value.get()).map_err(|e| e.to_string())?;
    if value.is_null() {
        return Ok(ColumnValue::Null);
    }

    match kind {
        ValueKind::Boolean => match value {
            Value::Bool(b) => Ok(ColumnValue::Boolean(b)),
            Value::String(s) => match s.as_str() {
                "t" | "true" => Ok(ColumnValue::Boolean(true)),
                "f" | "false" => Ok(ColumnValue::Boolean(false)),
                _ => Err(format!("invalid boolean \"{s}\"")),
            },
            other => Err(format!("expected boolean, got {other}")),
        },
        ValueKind::Integer => match value {
            Value::Number(n) => n
                .as_i64()
                .map(ColumnValue::Integer)
                .ok_or_else(|| format!("integer out of range: {n}")),
            Value::String(s) => s
                .parse::<i64>()
                .map(ColumnValue::Integer)
                .map_err(|e| format!("invalid integer \"{s}\": {e}")),
            other => Err(format!("expected integer, got {other}")),
        },
        ValueKind::Float => match value {
            Value::Number(n) => n
                .as_f64()
                .map(ColumnValue::Float)
                .ok_or_else(|| format!("invalid float {n}")),
            // NaN and the infinities are quoted by the plugin
            Value::String(s) => s
                .parse::<f64>()
                .map(ColumnValue::Float)
                .map_err(|e| format!("invalid float \"{s}\": {e}")),
            other => Err(format!("expected float, got {other}")),
        },
        ValueKind::Numeric => match value {
            Value::Number(n) => Ok(ColumnValue::Numeric(n.to_string())),
            Value::String(s) => Ok(ColumnValue::Numeric(s)),
            other => Err(format!("expected numeric, got {other}")),
        },
        ValueKind::Text => match value {
            Value::String(s) => Ok(ColumnValue::Text(s)),
            Value::Number(n) => Ok(ColumnValue::Text(n.to_string())),
            Value::Bool(b) => Ok(ColumnValue::Text(b.to_string())),
            other => Err(format!("expected text, got {other}")),
        },
        ValueKind::Date => {
            let s = expect_string(value)?;
            if is_special_datetime(&s) {
                return Ok(ColumnValue::Text(s));
            }
            NaiveDate::parse_from_str(&s, "%Y-%m-%d")
                .map(ColumnValue::Date)
                .map_err(|e| format!("invalid date \"{s}\": {e}"))
        }
        ValueKind::Timestamp => {
            let s = expect_string(value)?;
            if is_special_datetime(&s) {
                return Ok(ColumnValue::Text(s));
            }
            parse_naive_timestamp(&s)
                .map(ColumnValue::Timestamp)
                .ok_or_else(|| format!("invalid timestamp \"{s}\""))
        }
        ValueKind::TimestampTz => {
            let s = expect_string(value)?;
            if is_special_datetime(&s) {
                return Ok(ColumnValue::Text(s));
            }
            parse_timestamp_tz(&s)
                .map(ColumnValue::TimestampTz)
                .ok_or_else(|| format!("invalid timestamptz \"{s}\""))
        }
        ValueKind::Json => match value {
            Value::String(s) => Ok(ColumnValue::Json(
                serde_json::from_str(&s).unwrap_or(Value::String(s)),
            )),
            other => Ok(ColumnValue::Json(other)),
        },
        ValueKind::Bytes => {
            let s = expect_string(value)?;
            decode_bytea_hex(&s).map(ColumnValue::Bytes)
        }
    }
}

fn expect_string(value: Value) -> Result<String, String> {
    match value {
        Value::String(s) => Ok(s),
        other => Err(format!("expected string, got {other}")),
    }
}

fn is_special_datetime(s: &str) -> bool {
    matches!(s, "infinity" | "-infinity") || s.ends_with(" BC")
}

fn parse_naive_timestamp(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()
}

fn parse_timestamp_tz(s: &str) -> Option<DateTime<FixedOffset>> {
    // PostgreSQL prints offsets as +00, +05:30 or +05:30:00
    DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z")
        .or_else(|_| DateTime::parse_from_rfc3339(s))
        .ok()
}

fn parse_commit_timestamp(s: &str) -> Option<DateTime<Utc>> {
    parse_timestamp_tz(s).map(|ts| ts.with_timezone(&Utc))
}

/// Decode PostgreSQL's `bytea` hex output (`\x0a0b...`)
fn decode_bytea_hex(s: &str) -> Result<Vec<u8>, String> {
    let hex = s
        .strip_prefix("\\x")
        .ok_or_else(|| format!("bytea value is not in hex format: \"{s}\""))?;
    if hex.len() % 2 != 0 {
        return Err("bytea hex value has odd length".to_string());
    }
    hex.as_bytes()
        .chunks(2)
        .map(|pair| {
            let hi = hex_digit(pair[0]);
            let lo = hex_digit(pair[1]);
            match (hi, lo) {
                (Some(hi), Some(lo)) => Ok((hi << 4) | lo),
                _ => Err(format!("invalid hex digit in bytea value \"{s}\"")),
            }
        })
        .collect()
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
