use crate::config::{RetryConfig, TableBinding};
use crate::connector::source_connector::{ScannedRow, TableScanner};
use crate::error::CaptureError;
use crate::event::key::Key;
use crate::event::table_id::TableId;
use crate::retry::{retry_if, with_timeout};
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRequest {
    pub after: Option<Key>,
    pub limit: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScanReport {
    Chunk {
        table_id: TableId,
        rows: Vec<ScannedRow>,
        complete: bool,
    },
    /// Permanent failure of this table alone.
    Aborted {
        table_id: TableId,
        reason: String,
    },
    /// Transient failures outlasted the retry budget.
    Failed {
        table_id: TableId,
        attempts: u32,
        last_error: String,
    },
}

impl ScanReport {
    pub fn table_id(&self) -> &TableId {
        match self {
            ScanReport::Chunk { table_id, .. }
            | ScanReport::Aborted { table_id, .. }
            | ScanReport::Failed { table_id, .. } => table_id,
        }
    }
}

enum ScanFailure {
    Permanent(CaptureError),
    Exhausted { attempts: u32, error: CaptureError },
}

/// Worker scanning one table, one chunk per request, until the table is
/// exhausted or fails permanently.
pub struct BackfillScanner {
    scanner: Arc<dyn TableScanner>,
    binding: TableBinding,
    retry: RetryConfig,
}

impl BackfillScanner {
    pub fn new(scanner: Arc<dyn TableScanner>, binding: TableBinding, retry: RetryConfig) -> Self {
        BackfillScanner {
            scanner,
            binding,
            retry,
        }
    }

    pub fn spawn(
        self,
        requests: mpsc::Receiver<ChunkRequest>,
        reports: mpsc::Sender<ScanReport>,
    ) -> JoinHandle<()> {
        tokio::spawn(self.run(requests, reports))
    }

    pub async fn run(
        self,
        mut requests: mpsc::Receiver<ChunkRequest>,
        reports: mpsc::Sender<ScanReport>,
    ) {
        let table_id = self.binding.table_id();
        info!("Backfill of {} started", table_id);
        while let Some(request) = requests.recv().await {
            let report = match self.scan(&request).await {
                Ok(rows) => {
                    let complete = rows.len() < request.limit;
                    debug!(
                        "Scanned {} rows of {} after {:?}",
                        rows.len(),
                        table_id,
                        request.after.as_ref().map(|k| k.to_string())
                    );
                    ScanReport::Chunk {
                        table_id: table_id.clone(),
                        rows,
                        complete,
                    }
                }
                Err(ScanFailure::Exhausted { attempts, error }) => {
                    warn!(
                        "Backfill of {} gave up after {} attempts: {}",
                        table_id, attempts, error
                    );
                    ScanReport::Failed {
                        table_id: table_id.clone(),
                        attempts,
                        last_error: error.to_string(),
                    }
                }
                Err(ScanFailure::Permanent(err)) => {
                    warn!("Backfill of {} aborted: {}", table_id, err);
                    ScanReport::Aborted {
                        table_id: table_id.clone(),
                        reason: err.to_string(),
                    }
                }
            };
            let done = !matches!(report, ScanReport::Chunk { complete: false, .. });
            if reports.send(report).await.is_err() || done {
                break;
            }
        }
        debug!("Backfill worker for {} exiting", table_id);
    }

    async fn scan(&self, request: &ChunkRequest) -> Result<Vec<ScannedRow>, ScanFailure> {
        let what = format!("scanning {}", self.binding.table_id());
        let what = what.as_str();
        let scanner = &self.scanner;
        let binding = &self.binding;
        let timeout = self.retry.scan_timeout();
        let rows = retry_if(&self.retry, what, CaptureError::is_transient, || {
            with_timeout(
                timeout,
                what,
                scanner.scan_chunk(binding, request.after.as_ref(), request.limit),
            )
        })
        .await
        .map_err(|failure| {
            if failure.error.is_transient() {
                ScanFailure::Exhausted {
                    attempts: failure.attempts,
                    error: failure.error,
                }
            } else {
                ScanFailure::Permanent(failure.error)
            }
        })?;
        self.check_order(request, &rows)
            .map_err(ScanFailure::Permanent)?;
        Ok(rows)
    }

    fn check_order(&self, request: &ChunkRequest, rows: &[ScannedRow]) -> Result<(), CaptureError> {
        if rows.len() > request.limit {
            return Err(CaptureError::MetadataCorruption {
                table: Some(self.binding.table_id()),
                position: None,
                detail: format!(
                    "scan returned {} rows for a chunk of {}",
                    rows.len(),
                    request.limit
                ),
            });
        }
        let mut previous = request.after.as_ref();
        for row in rows {
            if let Some(previous) = previous {
                if &row.key <= previous {
                    return Err(CaptureError::MetadataCorruption {
                        table: Some(self.binding.table_id()),
                        position: None,
                        detail: format!(
                            "scan returned key {} at or before {}; the source collation disagrees with key order",
                            row.key, previous
                        ),
                    });
                }
            }
            previous = Some(&row.key);
        }
        Ok(())
    }
}
