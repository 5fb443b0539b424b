#![allow(dead_code)]

use capture::checkpoint::Checkpoint;
use capture::config::{CaptureConfig, TableBinding};
use capture::error::CaptureResult;
use capture::event::event::ChangeEvent;
use capture::event::key::Key;
use capture::event::operation::Operation;
use capture::event::table_id::TableId;
use capture::event::Row;
use capture::memory::{MemoryCheckpointStore, MemoryDatabase, MemorySink};
use capture::reconcile::phase::SequencerPhase;
use capture::reconcile::sequencer::Sequencer;
use capture::shutdown::{self, ShutdownHandle};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const WAIT: Duration = Duration::from_secs(10);

pub fn orders() -> TableId {
    TableId::new("shop", "orders")
}

pub fn customers() -> TableId {
    TableId::new("shop", "customers")
}

pub fn binding(table_id: &TableId) -> TableBinding {
    TableBinding::new(&table_id.schema, &table_id.table, &["id"])
}

pub fn row(id: i64, name: &str) -> Row {
    json!({"id": id, "name": name}).as_object().unwrap().clone()
}

pub fn key(id: i64) -> Key {
    Key::single("id", id)
}

/// Small chunks, fast flushes and short backoffs.
pub fn config(tables: &[TableId]) -> CaptureConfig {
    let mut config = CaptureConfig::new("test", tables.iter().map(binding).collect());
    config.backfill.chunk_size = 3;
    config.backfill.concurrency = 2;
    config.retry.max_attempts = 5;
    config.retry.initial_backoff_ms = 1;
    config.retry.max_backoff_ms = 20;
    config.retry.read_timeout_ms = 500;
    config.retry.scan_timeout_ms = 5_000;
    config.batch.max_events = 64;
    config.batch.flush_interval_ms = 10;
    config
}

pub fn seeded(table_id: &TableId, ids: impl IntoIterator<Item = i64>) -> MemoryDatabase {
    let db = MemoryDatabase::new();
    seed(&db, table_id, ids);
    db
}

pub fn seed(db: &MemoryDatabase, table_id: &TableId, ids: impl IntoIterator<Item = i64>) {
    db.create_table(table_id, &["id"]);
    for id in ids {
        db.upsert(table_id, row(id, &format!("row-{}", id))).unwrap();
    }
}

pub struct Running {
    handle: ShutdownHandle,
    task: JoinHandle<CaptureResult<Checkpoint>>,
    pub phase: watch::Receiver<SequencerPhase>,
    pub progress: watch::Receiver<Checkpoint>,
}

impl Running {
    pub async fn stop(self) -> CaptureResult<Checkpoint> {
        self.handle.signal();
        self.join().await
    }

    /// Waits for the capture to end by itself.
    pub async fn join(self) -> CaptureResult<Checkpoint> {
        tokio::time::timeout(WAIT, self.task)
            .await
            .expect("capture did not stop in time")
            .expect("capture task panicked")
    }

    pub fn phase(&self) -> SequencerPhase {
        *self.phase.borrow()
    }
}

pub fn start(
    config: CaptureConfig,
    db: &MemoryDatabase,
    sink: &MemorySink,
    store: &MemoryCheckpointStore,
) -> Running {
    let db = Arc::new(db.clone());
    let sequencer = Sequencer::new(
        config,
        db.clone(),
        db.clone(),
        db,
        Arc::new(sink.clone()),
        Arc::new(store.clone()),
    )
    .unwrap();
    let phase = sequencer.phase();
    let progress = sequencer.progress();
    let (handle, shutdown) = shutdown::channel();
    let task = tokio::spawn(sequencer.run(shutdown));
    Running {
        handle,
        task,
        phase,
        progress,
    }
}

pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting until {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Applies delivered events in order, the way a downstream table would.
pub fn materialize(events: &[ChangeEvent], table_id: &TableId) -> BTreeMap<Key, Row> {
    let mut state = BTreeMap::new();
    for event in events.iter().filter(|e| e.table_id() == table_id) {
        match event.operation() {
            Operation::Insert | Operation::Update => {
                state.insert(event.key().clone(), event.after().unwrap().clone());
            }
            Operation::Delete => {
                state.remove(event.key());
            }
        }
    }
    state
}

pub fn source_state(db: &MemoryDatabase, table_id: &TableId) -> BTreeMap<Key, Row> {
    let binding = binding(table_id);
    db.rows(table_id)
        .into_iter()
        .map(|r| (binding.key_of(&r).unwrap(), r))
        .collect()
}

pub async fn wait_converged(db: &MemoryDatabase, sink: &MemorySink, tables: &[TableId]) {
    wait_until("sink matches source", || {
        let events = sink.events();
        tables
            .iter()
            .all(|t| materialize(&events, t) == source_state(db, t))
    })
    .await;
}

pub fn events_for(sink: &MemorySink, table_id: &TableId, id: i64) -> Vec<ChangeEvent> {
    let key = key(id);
    sink.events()
        .into_iter()
        .filter(|e| e.table_id() == table_id && e.key() == &key)
        .collect()
}
