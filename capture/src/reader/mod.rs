use crate::config::RetryConfig;
use crate::connector::source_connector::{ChangeLog, LogStream};
use crate::error::{CaptureError, CaptureResult};
use crate::event::log_entry::LogEntry;
use crate::position::LogPosition;
use crate::retry::{retry, with_timeout};
use crate::shutdown::Shutdown;
use futures::StreamExt;
use log::{debug, info, warn};
use std::cmp::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Tails a [`ChangeLog`] and forwards its entries in log order.
///
/// Transient failures reconnect from the last forwarded position; entries at
/// or before that position are dropped when the log re-delivers them.
pub struct ChangeLogReader {
    log: Arc<dyn ChangeLog>,
    retry: RetryConfig,
    resume_from: Option<LogPosition>,
    skip_through: Option<LogPosition>,
    failures: u32,
}

enum ReadOutcome {
    Stopped,
    Reconnect(CaptureError),
    Idle,
}

impl ChangeLogReader {
    /// `from` is the last position whose effects were fully delivered, or
    /// `None` to start at the current end of the log.
    pub fn new(log: Arc<dyn ChangeLog>, retry: RetryConfig, from: Option<LogPosition>) -> Self {
        ChangeLogReader {
            log,
            retry,
            resume_from: from.clone(),
            skip_through: from,
            failures: 0,
        }
    }

    /// Starts reading at `position` (inclusive) with nothing delivered yet.
    pub fn starting_at(log: Arc<dyn ChangeLog>, retry: RetryConfig, position: LogPosition) -> Self {
        ChangeLogReader {
            log,
            retry,
            resume_from: Some(position),
            skip_through: None,
            failures: 0,
        }
    }

    pub fn spawn(
        self,
        entries: mpsc::Sender<LogEntry>,
        shutdown: Shutdown,
    ) -> JoinHandle<CaptureResult<()>> {
        tokio::spawn(self.run(entries, shutdown))
    }

    pub async fn run(
        mut self,
        entries: mpsc::Sender<LogEntry>,
        mut shutdown: Shutdown,
    ) -> CaptureResult<()> {
        if self.resume_from.is_none() {
            let log = &self.log;
            self.resume_from = retry(&self.retry, "change log position lookup", || {
                log.current_position()
            })
            .await?;
        }

        loop {
            if shutdown.is_signalled() {
                return Ok(());
            }
            let opened = tokio::select! {
                biased;
                _ = shutdown.wait() => return Ok(()),
                opened = self.open() => opened,
            };
            let stream = match opened {
                Ok(stream) => stream,
                Err(err) if err.is_transient() => {
                    if !self.back_off(err, &mut shutdown).await? {
                        return Ok(());
                    }
                    continue;
                }
                Err(err) => return Err(err),
            };

            match self.forward(stream, &entries, &mut shutdown).await? {
                ReadOutcome::Stopped => return Ok(()),
                ReadOutcome::Idle => {
                    debug!("No change log entry within read timeout, reconnecting");
                }
                ReadOutcome::Reconnect(err) => {
                    if !self.back_off(err, &mut shutdown).await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn open(&self) -> CaptureResult<LogStream> {
        match &self.resume_from {
            Some(position) => info!("Opening change log at {}", position),
            None => info!("Opening change log at its current end"),
        }
        with_timeout(
            self.retry.read_timeout(),
            "opening change log",
            self.log.open(self.resume_from.clone()),
        )
        .await
    }

    async fn forward(
        &mut self,
        mut stream: LogStream,
        entries: &mpsc::Sender<LogEntry>,
        shutdown: &mut Shutdown,
    ) -> CaptureResult<ReadOutcome> {
        let read_timeout = self.retry.read_timeout();
        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.wait() => return Ok(ReadOutcome::Stopped),
                next = tokio::time::timeout(read_timeout, stream.next()) => next,
            };

            let entry = match next {
                Err(_) => return Ok(ReadOutcome::Idle),
                Ok(None) => {
                    return Ok(ReadOutcome::Reconnect(CaptureError::Transient(
                        "change log stream ended".into(),
                    )))
                }
                Ok(Some(Err(err))) if err.is_transient() => {
                    return Ok(ReadOutcome::Reconnect(err));
                }
                Ok(Some(Err(err))) => return Err(err),
                Ok(Some(Ok(entry))) => entry,
            };

            self.failures = 0;
            let position = entry.position().clone();
            if self.already_forwarded(&position) {
                debug!("Skipping re-delivered change log entry at {}", position);
                continue;
            }
            if entries.send(entry).await.is_err() {
                return Ok(ReadOutcome::Stopped);
            }
            self.resume_from = Some(position.clone());
            self.skip_through = Some(position);
        }
    }

    fn already_forwarded(&self, position: &LogPosition) -> bool {
        match &self.skip_through {
            Some(last) => matches!(
                position.partial_cmp(last),
                Some(Ordering::Less | Ordering::Equal)
            ),
            None => false,
        }
    }

    /// Sleeps before the next reconnect. Returns `Ok(false)` if shutdown
    /// fired meanwhile, or the error once the attempt budget is spent.
    async fn back_off(&mut self, err: CaptureError, shutdown: &mut Shutdown) -> CaptureResult<bool> {
        self.failures += 1;
        if self.failures >= self.retry.max_attempts {
            warn!(
                "Change log reader giving up after {} consecutive failures",
                self.failures
            );
            return Err(err);
        }
        let delay = self.retry.backoff(self.failures);
        warn!(
            "Change log read failed (attempt {}/{}), reconnecting in {:?}: {}",
            self.failures, self.retry.max_attempts, delay, err
        );
        tokio::select! {
            biased;
            _ = shutdown.wait() => Ok(false),
            _ = tokio::time::sleep(delay) => Ok(true),
        }
    }
}
