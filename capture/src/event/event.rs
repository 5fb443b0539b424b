use crate::event::key::Key;
use crate::event::operation::Operation;
use crate::event::table_id::TableId;
use crate::event::Row;
use crate::position::LogPosition;
use serde::{Deserialize, Serialize};

/// An immutable row-level change of one captured table.
///
/// Constructors enforce that inserts carry no before-image and deletes carry
/// no after-image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    table_id: TableId,
    operation: Operation,
    key: Key,
    before: Option<Row>,
    after: Option<Row>,
    log_position: LogPosition,
    source_timestamp: u64,
}

impl ChangeEvent {
    pub fn insert(
        table_id: TableId,
        key: Key,
        after: Row,
        log_position: LogPosition,
        source_timestamp: u64,
    ) -> Self {
        ChangeEvent {
            table_id,
            operation: Operation::Insert,
            key,
            before: None,
            after: Some(after),
            log_position,
            source_timestamp,
        }
    }

    pub fn update(
        table_id: TableId,
        key: Key,
        before: Option<Row>,
        after: Row,
        log_position: LogPosition,
        source_timestamp: u64,
    ) -> Self {
        ChangeEvent {
            table_id,
            operation: Operation::Update,
            key,
            before,
            after: Some(after),
            log_position,
            source_timestamp,
        }
    }

    pub fn delete(
        table_id: TableId,
        key: Key,
        before: Option<Row>,
        log_position: LogPosition,
        source_timestamp: u64,
    ) -> Self {
        ChangeEvent {
            table_id,
            operation: Operation::Delete,
            key,
            before,
            after: None,
            log_position,
            source_timestamp,
        }
    }

    pub fn table_id(&self) -> &TableId {
        &self.table_id
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn before(&self) -> Option<&Row> {
        self.before.as_ref()
    }

    pub fn after(&self) -> Option<&Row> {
        self.after.as_ref()
    }

    pub fn log_position(&self) -> &LogPosition {
        &self.log_position
    }

    pub fn source_timestamp(&self) -> u64 {
        self.source_timestamp
    }
}
