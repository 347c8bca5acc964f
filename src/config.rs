//! Pipeline configuration
//!
//! A [`PipelineConfig`] can be built in code, read from a JSON file or taken
//! from the environment. It must pass [`PipelineConfig::validate`] before a
//! supervisor will run with it.

use crate::error::{ReplicationError, Result};
use crate::retry::BackoffConfig;
use crate::sequencer::DEFAULT_MAX_TRANSACTION_CHANGES;
use crate::slot::Wal2JsonOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Longest slot name PostgreSQL accepts (NAMEDATALEN - 1)
pub const MAX_SLOT_NAME_LEN: usize = 63;

/// Prefix of the environment variables read by [`PipelineConfig::from_env`]
pub const ENV_PREFIX: &str = "WALRELAY_";

/// Settings for one slot's pipeline
///
/// # Example
///
/// ```
/// use pg_walrelay::PipelineConfig;
///
/// let config = PipelineConfig {
///     slot_name: "orders_cdc".to_string(),
///     database_connection_string: "postgresql://postgres@localhost/shop".to_string(),
///     ..Default::default()
/// };
/// config.validate().unwrap();
/// assert_eq!(
///     config.replication_conninfo(),
///     "postgresql://postgres@localhost/shop?replication=database"
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Logical replication slot to create or reuse
    pub slot_name: String,
    /// libpq connection string or URI
    pub database_connection_string: String,
    /// First reconnect delay
    #[serde(rename = "reconnect_backoff_min_ms", with = "duration_ms")]
    pub reconnect_backoff_min: Duration,
    /// Reconnect delay cap
    #[serde(rename = "reconnect_backoff_max_ms", with = "duration_ms")]
    pub reconnect_backoff_max: Duration,
    /// Transactions acknowledged by the consumer before a checkpoint is forced
    pub ack_batch_size: usize,
    /// Directory holding one checkpoint file per slot
    pub checkpoint_dir: PathBuf,
    /// How often a standby status update is sent while streaming
    #[serde(rename = "status_interval_ms", with = "duration_ms")]
    pub status_interval: Duration,
    /// Capacity of the queue between the replication and delivery workers
    pub channel_capacity: usize,
    /// Largest transaction buffered in memory; 0 disables the limit
    pub max_transaction_changes: usize,
    /// wal2json `add-tables` filter
    pub add_tables: Vec<String>,
    /// wal2json `filter-tables` filter
    pub filter_tables: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            slot_name: "walrelay".to_string(),
            database_connection_string: String::new(),
            reconnect_backoff_min: Duration::from_millis(500),
            reconnect_backoff_max: Duration::from_secs(30),
            ack_batch_size: 100,
            checkpoint_dir: PathBuf::from("checkpoints"),
            status_interval: Duration::from_secs(10),
            channel_capacity: 256,
            max_transaction_changes: DEFAULT_MAX_TRANSACTION_CHANGES,
            add_tables: Vec::new(),
            filter_tables: Vec::new(),
        }
    }
}

impl PipelineConfig {
    /// Read a JSON configuration file; missing keys take their defaults
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ReplicationError::config(format!("cannot read {}: {e}", path.display()))
        })?;
        serde_json::from_str(&contents)
            .map_err(|e| ReplicationError::config(format!("invalid {}: {e}", path.display())))
    }

    /// Build from the process environment
    ///
    /// See [`from_env_with`](Self::from_env_with) for the variables read.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Build from an environment lookup, starting from the defaults
    pub fn from_env_with<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        Self::default().with_env_overrides(lookup)
    }

    /// Overlay the process environment on this configuration
    pub fn with_env(self) -> Result<Self> {
        self.with_env_overrides(|key| std::env::var(key).ok())
    }

    /// Overlay the variables `lookup` knows about; unset ones keep their value
    ///
    /// Reads `DATABASE_URL`, `WALRELAY_SLOT_NAME`, `WALRELAY_CHECKPOINT_DIR`,
    /// `WALRELAY_RECONNECT_BACKOFF_MIN_MS`, `WALRELAY_RECONNECT_BACKOFF_MAX_MS`,
    /// `WALRELAY_ACK_BATCH_SIZE`, `WALRELAY_STATUS_INTERVAL_MS`,
    /// `WALRELAY_CHANNEL_CAPACITY`, `WALRELAY_MAX_TRANSACTION_CHANGES`,
    /// `WALRELAY_ADD_TABLES` and `WALRELAY_FILTER_TABLES` (comma separated).
    pub fn with_env_overrides<F>(self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = self;
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(url) = lookup("DATABASE_URL") {
            config.database_connection_string = url;
        }
        if let Some(slot) = var("SLOT_NAME") {
            config.slot_name = slot;
        }
        if let Some(dir) = var("CHECKPOINT_DIR") {
            config.checkpoint_dir = PathBuf::from(dir);
        }
        if let Some(ms) = var("RECONNECT_BACKOFF_MIN_MS") {
            config.reconnect_backoff_min = Duration::from_millis(parse_number(&ms, "RECONNECT_BACKOFF_MIN_MS")?);
        }
        if let Some(ms) = var("RECONNECT_BACKOFF_MAX_MS") {
            config.reconnect_backoff_max = Duration::from_millis(parse_number(&ms, "RECONNECT_BACKOFF_MAX_MS")?);
        }
        if let Some(ms) = var("STATUS_INTERVAL_MS") {
            config.status_interval = Duration::from_millis(parse_number(&ms, "STATUS_INTERVAL_MS")?);
        }
        if let Some(n) = var("ACK_BATCH_SIZE") {
            config.ack_batch_size = parse_number(&n, "ACK_BATCH_SIZE")?;
        }
        if let Some(n) = var("CHANNEL_CAPACITY") {
            config.channel_capacity = parse_number(&n, "CHANNEL_CAPACITY")?;
        }
        if let Some(n) = var("MAX_TRANSACTION_CHANGES") {
            config.max_transaction_changes = parse_number(&n, "MAX_TRANSACTION_CHANGES")?;
        }
        if let Some(tables) = var("ADD_TABLES") {
            config.add_tables = split_list(&tables);
        }
        if let Some(tables) = var("FILTER_TABLES") {
            config.filter_tables = split_list(&tables);
        }
        Ok(config)
    }

    /// Check the configuration before any connection is attempted
    pub fn validate(&self) -> Result<()> {
        validate_slot_name(&self.slot_name)?;

        if self.database_connection_string.trim().is_empty() {
            return Err(ReplicationError::config(
                "database_connection_string is required",
            ));
        }
        if self.reconnect_backoff_min.is_zero() {
            return Err(ReplicationError::config(
                "reconnect_backoff_min must be greater than zero",
            ));
        }
        if self.reconnect_backoff_max < self.reconnect_backoff_min {
            return Err(ReplicationError::config(format!(
                "reconnect_backoff_max ({:?}) is below reconnect_backoff_min ({:?})",
                self.reconnect_backoff_max, self.reconnect_backoff_min
            )));
        }
        if self.ack_batch_size == 0 {
            return Err(ReplicationError::config("ack_batch_size must be at least 1"));
        }
        if self.channel_capacity == 0 {
            return Err(ReplicationError::config("channel_capacity must be at least 1"));
        }
        if self.status_interval.is_zero() {
            return Err(ReplicationError::config(
                "status_interval must be greater than zero",
            ));
        }
        if self.checkpoint_dir.as_os_str().is_empty() {
            return Err(ReplicationError::config("checkpoint_dir is required"));
        }
        Ok(())
    }

    /// Connection string with `replication=database` added when missing
    pub fn replication_conninfo(&self) -> String {
        let conninfo = self.database_connection_string.trim();
        if conninfo.contains("replication=") {
            return conninfo.to_string();
        }

        let is_uri = conninfo.starts_with("postgresql://") || conninfo.starts_with("postgres://");
        if is_uri {
            let separator = if conninfo.contains('?') { '&' } else { '?' };
            format!("{conninfo}{separator}replication=database")
        } else if conninfo.is_empty() {
            "replication=database".to_string()
        } else {
            format!("{conninfo} replication=database")
        }
    }

    /// Connection string safe to log
    pub fn redacted_connection_string(&self) -> String {
        mask_password(&self.database_connection_string)
    }

    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            min_delay: self.reconnect_backoff_min,
            max_delay: self.reconnect_backoff_max,
            ..BackoffConfig::default()
        }
    }

    pub fn plugin_options(&self) -> Wal2JsonOptions {
        Wal2JsonOptions {
            add_tables: self.add_tables.clone(),
            filter_tables: self.filter_tables.clone(),
        }
    }
}

/// Slot names are limited to lower case letters, digits and underscores
pub fn validate_slot_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_SLOT_NAME_LEN {
        return Err(ReplicationError::config(format!(
            "slot name must be 1 to {MAX_SLOT_NAME_LEN} characters, got {}",
            name.len()
        )));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || *c == '_'))
    {
        return Err(ReplicationError::config(format!(
            "slot name {name:?} contains {bad:?}; only a-z, 0-9 and _ are allowed"
        )));
    }
    Ok(())
}

fn parse_number<T: std::str::FromStr>(value: &str, name: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        ReplicationError::config(format!("{ENV_PREFIX}{name} must be a number, got {value:?}"))
    })
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Hide the password in both `key=value` and URI connection strings
fn mask_password(conn_str: &str) -> String {
    if let Some(pwd_start) = conn_str.find("password=") {
        let value_start = pwd_start + "password=".len();
        let mut masked = conn_str[..value_start].to_string();
        masked.push_str("****");
        if let Some(pwd_end) = conn_str[value_start..].find([' ', '&']) {
            masked.push_str(&conn_str[value_start + pwd_end..]);
        }
        return masked;
    }

    if let Some(scheme_end) = conn_str.find("://") {
        let rest = &conn_str[scheme_end + 3..];
        let authority_end = rest.find('/').unwrap_or(rest.len());
        if let Some(at) = rest[..authority_end].rfind('@') {
            if let Some(colon) = rest[..at].find(':') {
                return format!(
                    "{}{}:****{}",
                    &conn_str[..scheme_end + 3],
                    &rest[..colon],
                    &rest[at..]
                );
            }
        }
    }
    conn_str.to_string()
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn valid() -> PipelineConfig {
        PipelineConfig {
            slot_name: "orders_cdc".to_string(),
            database_connection_string: "host=localhost dbname=shop".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_validate_once_connection_is_set() {
        assert!(PipelineConfig::default().validate().is_err());
        valid().validate().unwrap();
    }

    #[test]
    fn test_slot_name_rules() {
        assert!(validate_slot_name("orders_cdc_01").is_ok());
        assert!(validate_slot_name("").is_err());
        assert!(validate_slot_name("Orders").is_err());
        assert!(validate_slot_name("orders-cdc").is_err());
        assert!(validate_slot_name(&"a".repeat(63)).is_ok());
        assert!(validate_slot_name(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = valid();
        config.reconnect_backoff_max = Duration::from_millis(10);
        assert!(matches!(config.validate(), Err(ReplicationError::Config(_))));

        let mut config = valid();
        config.ack_batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.channel_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.database_connection_string = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_replication_conninfo() {
        let mut config = valid();
        assert_eq!(
            config.replication_conninfo(),
            "host=localhost dbname=shop replication=database"
        );

        config.database_connection_string = "postgres://u@h/db?sslmode=disable".to_string();
        assert_eq!(
            config.replication_conninfo(),
            "postgres://u@h/db?sslmode=disable&replication=database"
        );

        config.database_connection_string = "postgres://u@h/db?replication=database".to_string();
        assert_eq!(
            config.replication_conninfo(),
            "postgres://u@h/db?replication=database"
        );
    }

    #[test]
    fn test_mask_password() {
        assert_eq!(
            mask_password("host=db password=secret user=app"),
            "host=db password=**** user=app"
        );
        assert_eq!(
            mask_password("postgresql://app:secret@db:5432/shop"),
            "postgresql://app:****@db:5432/shop"
        );
        assert_eq!(
            mask_password("postgresql://app@db/shop"),
            "postgresql://app@db/shop"
        );
        assert_eq!(
            mask_password("postgresql://db/shop?user=app&password=secret&sslmode=require"),
            "postgresql://db/shop?user=app&password=****&sslmode=require"
        );
    }

    #[test]
    fn test_from_env_with() {
        let vars: HashMap<&str, &str> = [
            ("DATABASE_URL", "postgresql://app@db/shop"),
            ("WALRELAY_SLOT_NAME", "shop_cdc"),
            ("WALRELAY_ACK_BATCH_SIZE", "10"),
            ("WALRELAY_RECONNECT_BACKOFF_MIN_MS", "250"),
            ("WALRELAY_ADD_TABLES", "public.orders, public.items"),
        ]
        .into_iter()
        .collect();

        let config =
            PipelineConfig::from_env_with(|key| vars.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(config.slot_name, "shop_cdc");
        assert_eq!(config.ack_batch_size, 10);
        assert_eq!(config.reconnect_backoff_min, Duration::from_millis(250));
        assert_eq!(config.add_tables, vec!["public.orders", "public.items"]);
        assert_eq!(config.channel_capacity, 256);
        config.validate().unwrap();
    }

    #[test]
    fn test_from_env_rejects_non_numbers() {
        let result = PipelineConfig::from_env_with(|key| {
            (key == "WALRELAY_ACK_BATCH_SIZE").then(|| "lots".to_string())
        });
        assert!(matches!(result, Err(ReplicationError::Config(_))));
    }

    #[test]
    fn test_from_file_with_partial_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"slot_name": "billing", "database_connection_string": "host=db", "reconnect_backoff_max_ms": 5000, "filter_tables": ["public.audit"]}}"#
        )
        .unwrap();

        let config = PipelineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.slot_name, "billing");
        assert_eq!(config.reconnect_backoff_max, Duration::from_secs(5));
        assert_eq!(config.reconnect_backoff_min, Duration::from_millis(500));
        assert_eq!(config.filter_tables, vec!["public.audit"]);
        assert_eq!(config.plugin_options().filter_tables, vec!["public.audit"]);
    }

    #[test]
    fn test_env_overrides_file_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"slot_name": "billing", "database_connection_string": "host=file", "ack_batch_size": 5, "channel_capacity": 32}}"#
        )
        .unwrap();
        let vars: HashMap<&str, &str> = [
            ("DATABASE_URL", "host=env dbname=shop"),
            ("WALRELAY_ACK_BATCH_SIZE", "50"),
        ]
        .into_iter()
        .collect();

        let config = PipelineConfig::from_file(file.path())
            .unwrap()
            .with_env_overrides(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.slot_name, "billing");
        assert_eq!(config.database_connection_string, "host=env dbname=shop");
        assert_eq!(config.ack_batch_size, 50);
        assert_eq!(config.channel_capacity, 32);
    }

    #[test]
    fn test_from_file_reports_invalid_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{not json").unwrap();
        assert!(matches!(
            PipelineConfig::from_file(file.path()),
            Err(ReplicationError::Config(_))
        ));
    }

    #[test]
    fn test_backoff_uses_configured_bounds() {
        let mut config = valid();
        config.reconnect_backoff_min = Duration::from_millis(100);
        config.reconnect_backoff_max = Duration::from_secs(2);
        let backoff = config.backoff();
        assert_eq!(backoff.min_delay, Duration::from_millis(100));
        assert_eq!(backoff.max_delay, Duration::from_secs(2));
        assert!(backoff.jitter);
    }
}
