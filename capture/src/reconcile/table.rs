use crate::backfill::scanner::ChunkRequest;
use crate::checkpoint::{BackfillStatus, TableBackfillState};
use crate::config::TableBinding;
use crate::connector::source_connector::ScannedRow;
use crate::event::event::ChangeEvent;
use crate::event::key::Key;
use crate::event::operation::Operation;
use crate::event::Row;
use crate::position::LogPosition;
use chrono::Utc;
use log::{debug, info, warn};
use std::collections::BTreeMap;

enum ChunkPhase {
    /// No chunk in flight. Changes above the cursor are left to later scans.
    Idle,
    /// Chunk requested; changes above the cursor wait for the scan result.
    Scanning { buffered: Vec<ChangeEvent> },
    /// Scan done and watermark written; changes inside the chunk's range
    /// patch its rows until the watermark shows up in the log.
    AwaitingWatermark {
        token: String,
        rows: BTreeMap<Key, Row>,
        upper: Option<Key>,
        complete: bool,
    },
}

/// Merges one table's backfill chunks with its live changes.
///
/// The cursor (`resume_key`) is the largest key already emitted by the
/// backfill; live changes at or below it pass through untouched.
pub struct TableReconciler {
    binding: TableBinding,
    state: TableBackfillState,
    phase: ChunkPhase,
}

impl TableReconciler {
    pub fn new(binding: TableBinding, state: TableBackfillState) -> Self {
        TableReconciler {
            binding,
            state,
            phase: ChunkPhase::Idle,
        }
    }

    pub fn binding(&self) -> &TableBinding {
        &self.binding
    }

    pub fn state(&self) -> &TableBackfillState {
        &self.state
    }

    pub fn status(&self) -> BackfillStatus {
        self.state.status
    }

    pub fn cursor(&self) -> Option<&Key> {
        self.state.resume_key.as_ref()
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.phase, ChunkPhase::Idle)
    }

    pub fn awaiting_token(&self) -> Option<&str> {
        match &self.phase {
            ChunkPhase::AwaitingWatermark { token, .. } => Some(token),
            _ => None,
        }
    }

    pub fn next_chunk(&mut self, limit: usize) -> ChunkRequest {
        if self.state.status == BackfillStatus::NotStarted {
            info!("Backfill of {} in progress", self.state.table_id);
            self.state.status = BackfillStatus::InProgress;
        }
        self.phase = ChunkPhase::Scanning { buffered: vec![] };
        ChunkRequest {
            after: self.state.resume_key.clone(),
            limit,
        }
    }

    /// Installs a scanned chunk whose watermark `token` has been written,
    /// replaying the changes buffered while the scan ran.
    pub fn chunk_scanned(&mut self, rows: Vec<ScannedRow>, complete: bool, token: &str) {
        let buffered = match std::mem::replace(&mut self.phase, ChunkPhase::Idle) {
            ChunkPhase::Scanning { buffered } => buffered,
            ChunkPhase::Idle => vec![],
            ChunkPhase::AwaitingWatermark { .. } => {
                warn!(
                    "Chunk of {} arrived while another awaited its watermark",
                    self.state.table_id
                );
                vec![]
            }
        };
        let upper = if complete {
            None
        } else {
            rows.last().map(|r| r.key.clone())
        };
        let mut chunk: BTreeMap<Key, Row> =
            rows.into_iter().map(|r| (r.key, r.row)).collect();

        debug!(
            "Chunk of {} scanned ({} rows, {} buffered changes, final: {})",
            self.state.table_id,
            chunk.len(),
            buffered.len(),
            complete
        );
        for event in &buffered {
            if in_range(event.key(), self.state.resume_key.as_ref(), upper.as_ref(), complete) {
                patch(&mut chunk, event);
            }
        }
        self.phase = ChunkPhase::AwaitingWatermark {
            token: token.to_string(),
            rows: chunk,
            upper,
            complete,
        };
    }

    /// Classifies a live change. Returns the event if it must be emitted now.
    pub fn on_change(&mut self, event: ChangeEvent) -> Option<ChangeEvent> {
        match self.state.status {
            BackfillStatus::Complete => return Some(event),
            BackfillStatus::Aborted => return None,
            BackfillStatus::NotStarted | BackfillStatus::InProgress => {}
        }
        let cursor = self.state.resume_key.as_ref();
        if let Some(cursor) = cursor {
            if event.key() <= cursor {
                return Some(event);
            }
        }
        match &mut self.phase {
            ChunkPhase::Idle => None,
            ChunkPhase::Scanning { buffered } => {
                buffered.push(event);
                None
            }
            ChunkPhase::AwaitingWatermark {
                rows,
                upper,
                complete,
                ..
            } => {
                if in_range(event.key(), cursor, upper.as_ref(), *complete) {
                    patch(rows, &event);
                }
                None
            }
        }
    }

    /// Emits the chunk awaiting `token`, if any, as inserts stamped with the
    /// watermark's position, and advances the cursor.
    pub fn on_watermark(&mut self, token: &str, position: &LogPosition) -> Option<Vec<ChangeEvent>> {
        if self.awaiting_token() != Some(token) {
            return None;
        }
        let (rows, upper, complete) = match std::mem::replace(&mut self.phase, ChunkPhase::Idle) {
            ChunkPhase::AwaitingWatermark {
                rows,
                upper,
                complete,
                ..
            } => (rows, upper, complete),
            other => {
                self.phase = other;
                return None;
            }
        };

        let now = Utc::now().timestamp_millis().max(0) as u64;
        let table_id = self.state.table_id.clone();
        let last_key = rows.keys().next_back().cloned();
        let events: Vec<ChangeEvent> = rows
            .into_iter()
            .map(|(key, row)| ChangeEvent::insert(table_id.clone(), key, row, position.clone(), now))
            .collect();

        self.state.rows_emitted += events.len() as u64;
        if complete {
            if let Some(last_key) = last_key {
                if self.state.resume_key.as_ref().map_or(true, |c| &last_key > c) {
                    self.state.resume_key = Some(last_key);
                }
            }
            self.state.status = BackfillStatus::Complete;
            info!(
                "Backfill of {} complete ({} rows)",
                table_id, self.state.rows_emitted
            );
        } else if upper.is_some() {
            self.state.resume_key = upper;
        }
        Some(events)
    }

    pub fn abort(&mut self, reason: &str) {
        warn!("Backfill of {} aborted: {}", self.state.table_id, reason);
        self.state.status = BackfillStatus::Aborted;
        self.phase = ChunkPhase::Idle;
    }
}

fn in_range(key: &Key, lower: Option<&Key>, upper: Option<&Key>, complete: bool) -> bool {
    let above_lower = lower.map_or(true, |lower| key > lower);
    let below_upper = complete || upper.map_or(false, |upper| key <= upper);
    above_lower && below_upper
}

fn patch(rows: &mut BTreeMap<Key, Row>, event: &ChangeEvent) {
    match event.operation() {
        Operation::Insert | Operation::Update => {
            if let Some(after) = event.after() {
                rows.insert(event.key().clone(), after.clone());
            }
        }
        Operation::Delete => {
            rows.remove(event.key());
        }
    }
}
