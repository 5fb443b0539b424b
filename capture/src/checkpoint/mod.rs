pub mod emitter;
pub mod file_store;
pub mod kafka_store;
pub mod store;

use crate::event::key::Key;
use crate::event::table_id::TableId;
use crate::position::LogPosition;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum_macros::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BackfillStatus {
    NotStarted,
    InProgress,
    Complete,
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableBackfillState {
    pub table_id: TableId,
    pub status: BackfillStatus,
    pub resume_key: Option<Key>,
    pub rows_emitted: u64,
    /// The binding's backfill counter this progress belongs to.
    #[serde(default)]
    pub backfill: u32,
}

impl TableBackfillState {
    pub fn new(table_id: TableId) -> Self {
        TableBackfillState {
            table_id,
            status: BackfillStatus::NotStarted,
            resume_key: None,
            rows_emitted: 0,
            backfill: 0,
        }
    }

    /// Whether the table still needs scanning.
    pub fn is_pending(&self) -> bool {
        matches!(
            self.status,
            BackfillStatus::NotStarted | BackfillStatus::InProgress
        )
    }
}

/// Everything needed to resume a capture: the last log position whose
/// effects were fully delivered, and each table's backfill progress.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub log_position: Option<LogPosition>,
    pub per_table: BTreeMap<TableId, TableBackfillState>,
}

impl Checkpoint {
    pub fn table(&self, table_id: &TableId) -> Option<&TableBackfillState> {
        self.per_table.get(table_id)
    }
}
