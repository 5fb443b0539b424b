use crate::backfill::scanner::{BackfillScanner, ChunkRequest, ScanReport};
use crate::checkpoint::emitter::CheckpointEmitter;
use crate::checkpoint::store::CheckpointStore;
use crate::checkpoint::{BackfillStatus, Checkpoint, TableBackfillState};
use crate::config::CaptureConfig;
use crate::connector::source_connector::{ChangeLog, ScannedRow, TableScanner};
use crate::error::{CaptureError, CaptureResult};
use crate::event::event::ChangeEvent;
use crate::event::log_entry::LogEntry;
use crate::event::table_id::TableId;
use crate::position::LogPosition;
use crate::reader::ChangeLogReader;
use crate::reconcile::phase::SequencerPhase;
use crate::reconcile::table::TableReconciler;
use crate::retry::{retry, retry_if};
use crate::shutdown::Shutdown;
use crate::sink::Sink;
use crate::watermark::{Watermark, WatermarkStore};
use log::{debug, error, info, warn};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

struct Worker {
    requests: mpsc::Sender<ChunkRequest>,
    handle: JoinHandle<()>,
}

enum LoopExit {
    Shutdown,
    ReaderEnded,
}

/// Owns a capture run: tails the change log, drives table backfills under
/// the watermark protocol, batches output to the sink and commits
/// checkpoints after every delivered batch.
pub struct Sequencer {
    config: CaptureConfig,
    log: Arc<dyn ChangeLog>,
    scanner: Arc<dyn TableScanner>,
    watermarks: Arc<dyn WatermarkStore>,
    sink: Arc<dyn Sink>,
    checkpoints: CheckpointEmitter,
    phase: watch::Sender<SequencerPhase>,
    progress: watch::Sender<Checkpoint>,

    tables: BTreeMap<TableId, TableReconciler>,
    queue: VecDeque<TableId>,
    workers: HashMap<TableId, Worker>,
    batch: Vec<ChangeEvent>,
    last_position: Option<LogPosition>,
    dirty: bool,
}

impl Sequencer {
    pub fn new(
        config: CaptureConfig,
        log: Arc<dyn ChangeLog>,
        scanner: Arc<dyn TableScanner>,
        watermarks: Arc<dyn WatermarkStore>,
        sink: Arc<dyn Sink>,
        store: Arc<dyn CheckpointStore>,
    ) -> CaptureResult<Self> {
        config.validate()?;
        let (phase, _) = watch::channel(SequencerPhase::Idle);
        let (progress, _) = watch::channel(Checkpoint::default());
        let checkpoints = CheckpointEmitter::new(store, config.retry.clone());
        Ok(Sequencer {
            config,
            log,
            scanner,
            watermarks,
            sink,
            checkpoints,
            phase,
            progress,
            tables: BTreeMap::new(),
            queue: VecDeque::new(),
            workers: HashMap::new(),
            batch: vec![],
            last_position: None,
            dirty: false,
        })
    }

    pub fn phase(&self) -> watch::Receiver<SequencerPhase> {
        self.phase.subscribe()
    }

    /// Latest committed checkpoint.
    pub fn progress(&self) -> watch::Receiver<Checkpoint> {
        self.progress.subscribe()
    }

    /// Runs until shutdown is signalled or a fatal error occurs. Either way
    /// the pending batch is delivered and a final checkpoint committed first.
    pub async fn run(mut self, mut shutdown: Shutdown) -> CaptureResult<Checkpoint> {
        self.set_phase(SequencerPhase::Initializing);
        info!("Capture {} initializing", self.config.name);
        let checkpoint = match self.checkpoints.load().await {
            Ok(checkpoint) => checkpoint,
            Err(err) => {
                self.set_phase(SequencerPhase::Stopped);
                return Err(err);
            }
        };
        self.progress.send_replace(checkpoint.clone());
        let checkpoint = self.restore(checkpoint);

        let (entry_tx, mut entries) = mpsc::channel(self.config.batch.max_events.max(16));
        let (report_tx, mut reports) = mpsc::channel(self.config.backfill.concurrency + 1);
        let reader = match self.reader_for(&checkpoint).await {
            Ok(reader) => reader,
            Err(err) => {
                self.set_phase(SequencerPhase::Stopped);
                return Err(err);
            }
        };
        let mut reader = Some(reader.spawn(entry_tx, shutdown.clone()));

        let result = match self.start_workers(&report_tx).await {
            Ok(()) => {
                self.update_phase();
                self.event_loop(&mut entries, &mut reports, &report_tx, &mut shutdown)
                    .await
            }
            Err(err) => Err(err),
        };

        // A chunk still being scanned is dropped. Its resume_key was never
        // committed, so the next run scans it again.
        for (_, worker) in self.workers.drain() {
            worker.handle.abort();
        }
        drop(entries);

        let result = match result {
            Ok(LoopExit::Shutdown | LoopExit::ReaderEnded) => match reader.take() {
                Some(reader) => join_reader(reader).await,
                None => Ok(()),
            },
            Err(err) => {
                if let Some(reader) = reader.take() {
                    reader.abort();
                    let _ = reader.await;
                }
                Err(err)
            }
        };

        let result = match result {
            Ok(()) => self.flush().await,
            Err(err) => {
                let gave_up_on_io = matches!(
                    err,
                    CaptureError::SinkUnavailable { .. }
                        | CaptureError::CheckpointStoreUnavailable { .. }
                );
                if !gave_up_on_io {
                    if let Err(flush_err) = self.flush().await {
                        error!("Final flush failed: {}", flush_err);
                    }
                }
                Err(err)
            }
        };

        self.set_phase(SequencerPhase::Stopped);
        match result {
            Ok(()) => {
                info!("Capture {} stopped", self.config.name);
                Ok(self.checkpoints.committed().clone())
            }
            Err(err) => {
                error!("Capture {} failed ({}): {}", self.config.name, err.kind(), err);
                Err(err)
            }
        }
    }

    /// A resumed capture re-reads after its checkpoint. A fresh one pins the
    /// current end of the log before any watermark can be written, so the
    /// reader is guaranteed to observe every watermark.
    async fn reader_for(&self, checkpoint: &Checkpoint) -> CaptureResult<ChangeLogReader> {
        if let Some(position) = &checkpoint.log_position {
            return Ok(ChangeLogReader::new(
                self.log.clone(),
                self.config.retry.clone(),
                Some(position.clone()),
            ));
        }
        let log = &self.log;
        let start = retry(&self.config.retry, "change log position lookup", || {
            log.current_position()
        })
        .await?;
        Ok(match start {
            Some(position) => {
                info!("Capture {} starts at {}", self.config.name, position);
                ChangeLogReader::starting_at(self.log.clone(), self.config.retry.clone(), position)
            }
            None => ChangeLogReader::new(self.log.clone(), self.config.retry.clone(), None),
        })
    }

    /// Merges the checkpoint with the configured bindings and returns the
    /// checkpoint the run resumes from.
    ///
    /// A binding whose backfill counter changed, or whose backfill was
    /// aborted, starts over from an empty state. When every binding starts
    /// over the log position is discarded as well, which is how a capture
    /// whose position was purged from the source log recovers.
    fn restore(&mut self, mut checkpoint: Checkpoint) -> Checkpoint {
        let mut restarted = 0;
        for binding in &self.config.bindings {
            let table_id = binding.table_id();
            let mut fresh = TableBackfillState::new(table_id.clone());
            fresh.backfill = binding.backfill;
            let state = match checkpoint.table(&table_id) {
                Some(state) if state.backfill != binding.backfill => {
                    info!(
                        "Table {} backfill counter moved from {} to {}, backfilling again",
                        table_id, state.backfill, binding.backfill
                    );
                    restarted += 1;
                    fresh
                }
                Some(state) if state.status == BackfillStatus::Aborted => {
                    info!("Retrying aborted backfill of {} from the start", table_id);
                    fresh
                }
                Some(state) => state.clone(),
                None => fresh,
            };
            if state.is_pending() {
                self.queue.push_back(table_id.clone());
            }
            info!(
                "Table {} restored as {} ({} rows backfilled)",
                table_id, state.status, state.rows_emitted
            );
            checkpoint.per_table.insert(table_id.clone(), state.clone());
            self.tables
                .insert(table_id, TableReconciler::new(binding.clone(), state));
        }

        let unbound: Vec<TableId> = checkpoint
            .per_table
            .keys()
            .filter(|id| !self.tables.contains_key(*id))
            .cloned()
            .collect();
        for table_id in unbound {
            info!("Dropping checkpoint state of unbound table {}", table_id);
            checkpoint.per_table.remove(&table_id);
            self.dirty = true;
        }

        if restarted > 0 && restarted == self.config.bindings.len() {
            if let Some(position) = checkpoint.log_position.take() {
                info!(
                    "Every binding is backfilling again; discarding log position {}",
                    position
                );
            }
        }
        if restarted > 0 {
            self.dirty = true;
        }
        self.last_position = checkpoint.log_position.clone();
        checkpoint
    }

    async fn event_loop(
        &mut self,
        entries: &mut mpsc::Receiver<LogEntry>,
        reports: &mut mpsc::Receiver<ScanReport>,
        report_tx: &mpsc::Sender<ScanReport>,
        shutdown: &mut Shutdown,
    ) -> CaptureResult<LoopExit> {
        let mut ticker = tokio::time::interval(self.config.batch.flush_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => {
                    info!("Capture {} shutting down", self.config.name);
                    return Ok(LoopExit::Shutdown);
                }
                entry = entries.recv() => match entry {
                    Some(entry) => self.on_entry(entry, report_tx).await?,
                    None => return Ok(LoopExit::ReaderEnded),
                },
                Some(report) = reports.recv() => {
                    let mut ready = vec![report];
                    while let Ok(report) = reports.try_recv() {
                        ready.push(report);
                    }
                    self.on_reports(ready, report_tx).await?;
                }
                _ = ticker.tick() => {
                    if self.dirty {
                        self.flush().await?;
                    }
                }
            }
        }
    }

    async fn on_entry(
        &mut self,
        entry: LogEntry,
        report_tx: &mpsc::Sender<ScanReport>,
    ) -> CaptureResult<()> {
        let position = entry.position().clone();
        if let Some(last) = &self.last_position {
            if position.partial_cmp(last) != Some(Ordering::Greater) {
                return Err(CaptureError::MetadataCorruption {
                    table: None,
                    position: Some(position.clone()),
                    detail: format!("log position does not advance past {}", last),
                });
            }
        }

        let mut chunk_committed = false;
        match entry {
            LogEntry::Change(event) => {
                if let Some(table) = self.tables.get_mut(event.table_id()) {
                    if let Some(event) = table.on_change(event) {
                        self.batch.push(event);
                    }
                }
            }
            LogEntry::Watermark {
                slot_id,
                token,
                position,
            } => {
                if slot_id == self.config.slot_id {
                    chunk_committed = self.on_watermark(&token, &position, report_tx).await?;
                }
            }
            LogEntry::SchemaChange {
                table_id,
                statement,
                destructive,
                position,
            } => {
                let bound = self
                    .tables
                    .get(&table_id)
                    .map_or(false, |t| t.status() != BackfillStatus::Aborted);
                if destructive && bound {
                    return Err(CaptureError::UnsupportedSchemaChange {
                        table: table_id,
                        statement,
                        position,
                    });
                }
                debug!("Schema change on {} at {}: {}", table_id, position, statement);
            }
            LogEntry::Heartbeat { .. } => {}
            LogEntry::Unhandled {
                description,
                position,
            } => {
                return Err(CaptureError::UnhandledLogEntry {
                    description,
                    position,
                });
            }
        }

        self.last_position = Some(position);
        self.dirty = true;
        if chunk_committed || self.batch.len() >= self.config.batch.max_events {
            self.flush().await?;
        }
        Ok(())
    }

    /// Emits every chunk waiting for `token`. Returns whether any did.
    async fn on_watermark(
        &mut self,
        token: &str,
        position: &LogPosition,
        report_tx: &mpsc::Sender<ScanReport>,
    ) -> CaptureResult<bool> {
        let mut committed = vec![];
        for (table_id, table) in self.tables.iter_mut() {
            if let Some(events) = table.on_watermark(token, position) {
                debug!(
                    "Watermark {} at {} released {} rows of {}",
                    token,
                    position,
                    events.len(),
                    table_id
                );
                self.batch.extend(events);
                committed.push(table_id.clone());
            }
        }
        if committed.is_empty() {
            return Ok(false);
        }

        let chunk_size = self.config.backfill.chunk_size;
        for table_id in committed {
            let Some(table) = self.tables.get_mut(&table_id) else {
                continue;
            };
            if !table.state().is_pending() {
                self.workers.remove(&table_id);
                continue;
            }
            let request = table.next_chunk(chunk_size);
            let sent = match self.workers.get(&table_id) {
                Some(worker) => worker.requests.send(request).await.is_ok(),
                None => false,
            };
            if !sent {
                table.abort("backfill worker exited unexpectedly");
                self.workers.remove(&table_id);
            }
        }
        self.start_workers(report_tx).await?;
        self.update_phase();
        Ok(true)
    }

    async fn on_reports(
        &mut self,
        reports: Vec<ScanReport>,
        report_tx: &mpsc::Sender<ScanReport>,
    ) -> CaptureResult<()> {
        let mut ready: Vec<(TableId, Vec<ScannedRow>, bool)> = vec![];
        for report in reports {
            match report {
                ScanReport::Chunk {
                    table_id,
                    rows,
                    complete,
                } => ready.push((table_id, rows, complete)),
                ScanReport::Aborted { table_id, reason } => {
                    if let Some(table) = self.tables.get_mut(&table_id) {
                        table.abort(&reason);
                    }
                    self.workers.remove(&table_id);
                    self.dirty = true;
                }
                ScanReport::Failed {
                    table_id,
                    attempts,
                    last_error,
                } => {
                    return Err(CaptureError::BackfillAborted {
                        table: table_id,
                        reason: format!("gave up after {} attempts: {}", attempts, last_error),
                    });
                }
            }
        }

        if !ready.is_empty() {
            let watermark = Watermark::fresh(&self.config.slot_id);
            let watermarks = &self.watermarks;
            let pending = &watermark;
            retry(&self.config.retry, "writing watermark", || {
                watermarks.write(pending)
            })
            .await?;
            debug!(
                "Wrote watermark {} for {} chunks",
                watermark.token,
                ready.len()
            );
            for (table_id, rows, complete) in ready {
                if let Some(table) = self.tables.get_mut(&table_id) {
                    table.chunk_scanned(rows, complete, &watermark.token);
                }
            }
        }

        self.start_workers(report_tx).await?;
        self.update_phase();
        Ok(())
    }

    /// Starts queued backfills until the concurrency cap is reached.
    async fn start_workers(&mut self, report_tx: &mpsc::Sender<ScanReport>) -> CaptureResult<()> {
        while self.workers.len() < self.config.backfill.concurrency {
            let Some(table_id) = self.queue.pop_front() else {
                break;
            };
            let Some(table) = self.tables.get_mut(&table_id) else {
                continue;
            };
            if !table.state().is_pending() {
                continue;
            }
            let (requests, request_rx) = mpsc::channel(1);
            let handle = BackfillScanner::new(
                self.scanner.clone(),
                table.binding().clone(),
                self.config.retry.clone(),
            )
            .spawn(request_rx, report_tx.clone());
            requests
                .send(table.next_chunk(self.config.backfill.chunk_size))
                .await
                .map_err(|_| CaptureError::ChannelClosed("backfill worker requests"))?;
            self.workers.insert(table_id, Worker { requests, handle });
        }
        Ok(())
    }

    /// Delivers the pending batch, then commits a checkpoint covering it.
    async fn flush(&mut self) -> CaptureResult<()> {
        if !self.batch.is_empty() {
            let sink = &self.sink;
            let batch = self.batch.as_slice();
            retry_if(
                &self.config.retry,
                "delivering batch",
                CaptureError::is_transient,
                || sink.deliver(batch),
            )
            .await
            .map_err(|failure| {
                if failure.error.is_transient() {
                    CaptureError::SinkUnavailable {
                        attempts: failure.attempts,
                        last_error: failure.error.to_string(),
                    }
                } else {
                    failure.error
                }
            })?;
            debug!("Delivered batch of {} events", self.batch.len());
            self.batch.clear();
        }

        let per_table = self
            .tables
            .iter()
            .map(|(id, table)| (id.clone(), table.state().clone()))
            .collect();
        self.checkpoints
            .commit(self.last_position.clone(), per_table)
            .await?;
        self.progress
            .send_replace(self.checkpoints.committed().clone());
        self.dirty = false;
        Ok(())
    }

    fn update_phase(&self) {
        let backfilling = self.tables.values().any(|t| t.state().is_pending());
        let phase = if backfilling {
            SequencerPhase::Backfilling
        } else {
            SequencerPhase::Streaming
        };
        self.set_phase(phase);
    }

    fn set_phase(&self, phase: SequencerPhase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            info!("Capture {} is now {}", self.config.name, phase);
        }
    }
}

async fn join_reader(reader: JoinHandle<CaptureResult<()>>) -> CaptureResult<()> {
    match reader.await {
        Ok(result) => result,
        Err(err) if err.is_cancelled() => Ok(()),
        Err(err) => {
            warn!("Change log reader task failed: {}", err);
            Err(CaptureError::ChannelClosed("change log reader"))
        }
    }
}
