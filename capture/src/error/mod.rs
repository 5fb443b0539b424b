use crate::event::table_id::TableId;
use crate::position::LogPosition;
use mysql_async::{DriverError, ServerError};
use rdkafka::error::KafkaError;
use sqlparser::parser::ParserError;
use std::fmt::{self, Display};

pub type CaptureResult<T> = Result<T, CaptureError>;

pub(crate) const ER_NO_SUCH_TABLE: u16 = 1146;
const ER_LOCK_WAIT_TIMEOUT: u16 = 1205;
const ER_LOCK_DEADLOCK: u16 = 1213;

#[derive(Debug)]
pub enum CaptureError {
    Transient(String),
    Timeout(String),
    RetentionExceeded {
        requested: LogPosition,
        oldest: Option<LogPosition>,
    },
    UnhandledLogEntry {
        description: String,
        position: LogPosition,
    },
    UnsupportedSchemaChange {
        table: TableId,
        statement: String,
        position: LogPosition,
    },
    MetadataCorruption {
        table: Option<TableId>,
        position: Option<LogPosition>,
        detail: String,
    },
    TableNotFound(TableId),
    BackfillAborted {
        table: TableId,
        reason: String,
    },
    CheckpointStoreUnavailable {
        attempts: u32,
        last_error: String,
    },
    SinkUnavailable {
        attempts: u32,
        last_error: String,
    },
    InvalidConfig(String),
    ChannelClosed(&'static str),
    StdIoError(std::io::Error),
    SerdeJsonError(serde_json::Error),
    Utf8Error(std::str::Utf8Error),
    MySQLError(mysql_async::Error),
    KafkaError(KafkaError),
    SqlParserError(ParserError),
}

impl CaptureError {
    /// Whether a retry layer may absorb this error.
    pub fn is_transient(&self) -> bool {
        match self {
            CaptureError::Transient(_) | CaptureError::Timeout(_) => true,
            CaptureError::StdIoError(_) | CaptureError::KafkaError(_) => true,
            CaptureError::MySQLError(err) => match err {
                mysql_async::Error::Io(_) => true,
                mysql_async::Error::Driver(DriverError::PoolDisconnected) => false,
                mysql_async::Error::Driver(_) => true,
                mysql_async::Error::Server(ServerError { code, .. }) => {
                    matches!(*code, ER_LOCK_WAIT_TIMEOUT | ER_LOCK_DEADLOCK)
                }
                _ => false,
            },
            _ => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CaptureError::Transient(_) => "transient",
            CaptureError::Timeout(_) => "timeout",
            CaptureError::RetentionExceeded { .. } => "retention_exceeded",
            CaptureError::UnhandledLogEntry { .. } => "unhandled_log_entry",
            CaptureError::UnsupportedSchemaChange { .. } => "unsupported_schema_change",
            CaptureError::MetadataCorruption { .. } => "metadata_corruption",
            CaptureError::TableNotFound(_) => "table_not_found",
            CaptureError::BackfillAborted { .. } => "backfill_aborted",
            CaptureError::CheckpointStoreUnavailable { .. } => "checkpoint_store_unavailable",
            CaptureError::SinkUnavailable { .. } => "sink_unavailable",
            CaptureError::InvalidConfig(_) => "invalid_config",
            CaptureError::ChannelClosed(_) => "channel_closed",
            CaptureError::StdIoError(_) => "io",
            CaptureError::SerdeJsonError(_) => "json",
            CaptureError::Utf8Error(_) => "utf8",
            CaptureError::MySQLError(_) => "mysql",
            CaptureError::KafkaError(_) => "kafka",
            CaptureError::SqlParserError(_) => "sql_parser",
        }
    }
}

impl std::error::Error for CaptureError {}

impl Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CaptureError::Transient(msg) => write!(f, "transient failure: {}", msg),
            CaptureError::Timeout(what) => write!(f, "timed out: {}", what),
            CaptureError::RetentionExceeded { requested, oldest } => match oldest {
                Some(oldest) => write!(
                    f,
                    "resume position {} is no longer retained by the source log (oldest retained: {}); the capture must be restarted with a fresh backfill",
                    requested, oldest
                ),
                None => write!(
                    f,
                    "resume position {} is no longer retained by the source log; the capture must be restarted with a fresh backfill",
                    requested
                ),
            },
            CaptureError::UnhandledLogEntry {
                description,
                position,
            } => write!(
                f,
                "unhandled change log entry at {}: {}",
                position, description
            ),
            CaptureError::UnsupportedSchemaChange {
                table,
                statement,
                position,
            } => write!(
                f,
                "unsupported schema change to table '{}' at {}: {}; remove the binding and recreate the capture",
                table, position, statement
            ),
            CaptureError::MetadataCorruption {
                table,
                position,
                detail,
            } => {
                write!(f, "metadata inconsistent with source")?;
                if let Some(table) = table {
                    write!(f, " for table '{}'", table)?;
                }
                if let Some(position) = position {
                    write!(f, " at {}", position)?;
                }
                write!(f, ": {}", detail)
            }
            CaptureError::TableNotFound(table) => write!(f, "table '{}' not found", table),
            CaptureError::BackfillAborted { table, reason } => {
                write!(f, "backfill of table '{}' aborted: {}", table, reason)
            }
            CaptureError::CheckpointStoreUnavailable {
                attempts,
                last_error,
            } => write!(
                f,
                "checkpoint store unavailable after {} attempts: {}",
                attempts, last_error
            ),
            CaptureError::SinkUnavailable {
                attempts,
                last_error,
            } => write!(
                f,
                "sink unavailable after {} attempts: {}",
                attempts, last_error
            ),
            CaptureError::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
            CaptureError::ChannelClosed(what) => write!(f, "channel closed: {}", what),
            CaptureError::StdIoError(err) => write!(f, "io error: {}", err),
            CaptureError::SerdeJsonError(err) => write!(f, "json error: {}", err),
            CaptureError::Utf8Error(err) => write!(f, "utf8 error: {}", err),
            CaptureError::MySQLError(err) => write!(f, "mysql error: {}", err),
            CaptureError::KafkaError(err) => write!(f, "kafka error: {}", err),
            CaptureError::SqlParserError(err) => write!(f, "sql parser error: {}", err),
        }
    }
}

impl From<std::io::Error> for CaptureError {
    fn from(error: std::io::Error) -> Self {
        CaptureError::StdIoError(error)
    }
}

impl From<serde_json::Error> for CaptureError {
    fn from(error: serde_json::Error) -> Self {
        CaptureError::SerdeJsonError(error)
    }
}

impl From<std::str::Utf8Error> for CaptureError {
    fn from(error: std::str::Utf8Error) -> Self {
        CaptureError::Utf8Error(error)
    }
}

impl From<mysql_async::Error> for CaptureError {
    fn from(error: mysql_async::Error) -> Self {
        CaptureError::MySQLError(error)
    }
}

impl From<KafkaError> for CaptureError {
    fn from(error: KafkaError) -> Self {
        CaptureError::KafkaError(error)
    }
}

impl From<ParserError> for CaptureError {
    fn from(error: ParserError) -> Self {
        CaptureError::SqlParserError(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(CaptureError::Transient("blip".into()).is_transient());
        assert!(CaptureError::Timeout("read".into()).is_transient());
        assert!(!CaptureError::TableNotFound(TableId::new("s", "t")).is_transient());
        assert!(!CaptureError::InvalidConfig("x".into()).is_transient());
        assert!(!CaptureError::RetentionExceeded {
            requested: LogPosition::sequence(1),
            oldest: None,
        }
        .is_transient());
    }

    #[test]
    fn test_fatal_errors_name_table_and_position() {
        let err = CaptureError::UnsupportedSchemaChange {
            table: TableId::new("shop", "orders"),
            statement: "DROP TABLE orders".into(),
            position: LogPosition::binlog("mysql-bin.000004", 120, 0),
        };
        let msg = err.to_string();
        assert!(msg.contains("shop.orders"));
        assert!(msg.contains("mysql-bin.000004:120"));
        assert_eq!(err.kind(), "unsupported_schema_change");

        let err = CaptureError::MetadataCorruption {
            table: Some(TableId::new("shop", "orders")),
            position: Some(LogPosition::sequence(7)),
            detail: "expected 3 columns, found 4".into(),
        };
        assert_eq!(
            err.to_string(),
            "metadata inconsistent with source for table 'shop.orders' at #7: expected 3 columns, found 4"
        );
    }
}
