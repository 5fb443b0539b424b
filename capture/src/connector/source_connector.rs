use crate::config::TableBinding;
use crate::error::CaptureResult;
use crate::event::key::Key;
use crate::event::log_entry::LogEntry;
use crate::event::Row;
use crate::position::LogPosition;
use async_trait::async_trait;
use futures::stream::BoxStream;

pub type LogStream = BoxStream<'static, CaptureResult<LogEntry>>;

/// An append-only change log that can be tailed from a resumable position.
#[async_trait]
pub trait ChangeLog: Send + Sync {
    /// Opens the log at `from` (inclusive). `None` starts at the current end
    /// of the log. A purged `from` fails with `RetentionExceeded`.
    async fn open(&self, from: Option<LogPosition>) -> CaptureResult<LogStream>;

    /// Position at which the next appended entry will appear.
    async fn current_position(&self) -> CaptureResult<Option<LogPosition>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScannedRow {
    pub key: Key,
    pub row: Row,
}

/// Key-ordered, chunked reads of a captured table.
#[async_trait]
pub trait TableScanner: Send + Sync {
    /// Up to `limit` rows with key strictly greater than `after`, ascending.
    async fn scan_chunk(
        &self,
        binding: &TableBinding,
        after: Option<&Key>,
        limit: usize,
    ) -> CaptureResult<Vec<ScannedRow>>;
}
