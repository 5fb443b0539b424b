use crate::event::event::ChangeEvent;
use crate::event::table_id::TableId;
use crate::position::LogPosition;

/// Every kind of entry a change log can yield.
///
/// Consumers match exhaustively, so a new entry kind has to be classified
/// explicitly instead of being dropped on the floor.
#[derive(Debug, Clone, PartialEq)]
pub enum LogEntry {
    Change(ChangeEvent),
    Watermark {
        slot_id: String,
        token: String,
        position: LogPosition,
    },
    SchemaChange {
        table_id: TableId,
        statement: String,
        destructive: bool,
        position: LogPosition,
    },
    Heartbeat {
        position: LogPosition,
    },
    Unhandled {
        description: String,
        position: LogPosition,
    },
}

impl LogEntry {
    pub fn position(&self) -> &LogPosition {
        match self {
            LogEntry::Change(event) => event.log_position(),
            LogEntry::Watermark { position, .. }
            | LogEntry::SchemaChange { position, .. }
            | LogEntry::Heartbeat { position }
            | LogEntry::Unhandled { position, .. } => position,
        }
    }
}
