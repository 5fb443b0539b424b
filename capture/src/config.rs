use crate::error::{CaptureError, CaptureResult};
use crate::event::key::Key;
use crate::event::table_id::TableId;
use crate::event::Row;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// A captured table and the columns forming its unique key.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct TableBinding {
    pub schema: String,
    pub table: String,
    pub key_columns: Vec<String>,
    /// Bumping this discards the table's progress and backfills it again.
    #[serde(default)]
    pub backfill: u32,
}

impl TableBinding {
    pub fn new(schema: &str, table: &str, key_columns: &[&str]) -> Self {
        TableBinding {
            schema: schema.to_string(),
            table: table.to_string(),
            key_columns: key_columns.iter().map(|c| c.to_string()).collect(),
            backfill: 0,
        }
    }

    pub fn with_backfill(mut self, backfill: u32) -> Self {
        self.backfill = backfill;
        self
    }

    pub fn table_id(&self) -> TableId {
        TableId::new(&self.schema, &self.table)
    }

    pub fn key_of(&self, row: &Row) -> CaptureResult<Key> {
        Key::from_row(&self.table_id(), row, &self.key_columns)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct BackfillConfig {
    pub chunk_size: usize,
    pub concurrency: usize,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        BackfillConfig {
            chunk_size: 1024,
            concurrency: 2,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub read_timeout_ms: u64,
    pub scan_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 8,
            initial_backoff_ms: 100,
            max_backoff_ms: 10_000,
            read_timeout_ms: 60_000,
            scan_timeout_ms: 60_000,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based), doubling up to the cap.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let delay = self
            .initial_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff_ms);
        Duration::from_millis(delay)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct BatchConfig {
    pub max_events: usize,
    pub flush_interval_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            max_events: 512,
            flush_interval_ms: 1000,
        }
    }
}

impl BatchConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }
}

fn default_slot_id() -> String {
    "capture".to_string()
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct CaptureConfig {
    pub name: String,
    #[serde(default = "default_slot_id")]
    pub slot_id: String,
    pub bindings: Vec<TableBinding>,
    #[serde(default)]
    pub backfill: BackfillConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub batch: BatchConfig,
}

impl CaptureConfig {
    pub fn new(name: &str, bindings: Vec<TableBinding>) -> Self {
        CaptureConfig {
            name: name.to_string(),
            slot_id: default_slot_id(),
            bindings,
            backfill: BackfillConfig::default(),
            retry: RetryConfig::default(),
            batch: BatchConfig::default(),
        }
    }

    pub fn validate(&self) -> CaptureResult<()> {
        if self.name.is_empty() {
            return Err(CaptureError::InvalidConfig("name must not be empty".into()));
        }
        if self.bindings.is_empty() {
            return Err(CaptureError::InvalidConfig(
                "at least one table binding is required".into(),
            ));
        }
        let mut seen = HashSet::new();
        for binding in &self.bindings {
            let table_id = binding.table_id();
            if binding.key_columns.is_empty() {
                return Err(CaptureError::InvalidConfig(format!(
                    "binding '{}' has no key columns",
                    table_id
                )));
            }
            if !seen.insert(table_id.clone()) {
                return Err(CaptureError::InvalidConfig(format!(
                    "table '{}' is bound more than once",
                    table_id
                )));
            }
        }
        if self.backfill.chunk_size == 0 {
            return Err(CaptureError::InvalidConfig(
                "backfill.chunk_size must be positive".into(),
            ));
        }
        if self.backfill.concurrency == 0 {
            return Err(CaptureError::InvalidConfig(
                "backfill.concurrency must be positive".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(CaptureError::InvalidConfig(
                "retry.max_attempts must be positive".into(),
            ));
        }
        if self.batch.max_events == 0 {
            return Err(CaptureError::InvalidConfig(
                "batch.max_events must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn binding(&self, table_id: &TableId) -> Option<&TableBinding> {
        self.bindings.iter().find(|b| &b.table_id() == table_id)
    }
}
