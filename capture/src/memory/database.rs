use crate::config::TableBinding;
use crate::connector::source_connector::{ChangeLog, LogStream, ScannedRow, TableScanner};
use crate::error::{CaptureError, CaptureResult};
use crate::event::event::ChangeEvent;
use crate::event::key::Key;
use crate::event::log_entry::LogEntry;
use crate::event::table_id::TableId;
use crate::event::Row;
use crate::position::LogPosition;
use crate::watermark::{Watermark, WatermarkStore};
use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

type Hook = Box<dyn FnOnce(&MemoryDatabase) + Send>;

struct MemoryTable {
    key_columns: Vec<String>,
    rows: BTreeMap<Key, Row>,
}

#[derive(Default)]
struct Inner {
    tables: HashMap<TableId, MemoryTable>,
    watermarks: BTreeMap<String, String>,
    log: VecDeque<(u64, LogEntry)>,
    next_seq: u64,
    purged_through: u64,
    scan_failures: u32,
    open_failures: u32,
    stream_faults: u32,
    broken_tables: HashSet<TableId>,
    scan_hooks: HashMap<TableId, Hook>,
    watermark_hooks: Vec<Hook>,
    scans: u64,
}

/// A simulated source database whose tables, change log and watermarks
/// table live in memory. Every write appends to the log under one lock, so
/// log order is commit order.
#[derive(Clone)]
pub struct MemoryDatabase {
    inner: Arc<Mutex<Inner>>,
    appended: Arc<watch::Sender<u64>>,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDatabase {
    pub fn new() -> Self {
        let (appended, _) = watch::channel(1);
        MemoryDatabase {
            inner: Arc::new(Mutex::new(Inner {
                next_seq: 1,
                ..Inner::default()
            })),
            appended: Arc::new(appended),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn append(&self, inner: &mut Inner, build: impl FnOnce(LogPosition) -> LogEntry) -> u64 {
        let seq = inner.next_seq;
        inner.log.push_back((seq, build(LogPosition::sequence(seq))));
        inner.next_seq += 1;
        self.appended.send_replace(inner.next_seq);
        seq
    }

    fn now() -> u64 {
        Utc::now().timestamp_millis().max(0) as u64
    }

    pub fn create_table(&self, table_id: &TableId, key_columns: &[&str]) {
        self.inner().tables.insert(
            table_id.clone(),
            MemoryTable {
                key_columns: key_columns.iter().map(|c| c.to_string()).collect(),
                rows: BTreeMap::new(),
            },
        );
    }

    fn key_for(inner: &Inner, table_id: &TableId, row: &Row) -> CaptureResult<Key> {
        let table = inner
            .tables
            .get(table_id)
            .ok_or_else(|| CaptureError::TableNotFound(table_id.clone()))?;
        Key::from_row(table_id, row, &table.key_columns)
    }

    /// Inserts or replaces a row, logging an insert or update accordingly.
    pub fn upsert(&self, table_id: &TableId, row: Row) -> CaptureResult<u64> {
        let mut inner = self.inner();
        let key = Self::key_for(&inner, table_id, &row)?;
        let before = inner
            .tables
            .get_mut(table_id)
            .and_then(|t| t.rows.insert(key.clone(), row.clone()));
        let ts = Self::now();
        let table_id = table_id.clone();
        Ok(self.append(&mut inner, move |position| {
            LogEntry::Change(match before {
                Some(before) => ChangeEvent::update(table_id, key, Some(before), row, position, ts),
                None => ChangeEvent::insert(table_id, key, row, position, ts),
            })
        }))
    }

    /// Deletes the row with `key`. Returns `None` if there was no such row.
    pub fn delete(&self, table_id: &TableId, key: &Key) -> CaptureResult<Option<u64>> {
        let mut inner = self.inner();
        let removed = inner
            .tables
            .get_mut(table_id)
            .ok_or_else(|| CaptureError::TableNotFound(table_id.clone()))?
            .rows
            .remove(key);
        let Some(before) = removed else {
            return Ok(None);
        };
        let ts = Self::now();
        let table_id = table_id.clone();
        let key = key.clone();
        Ok(Some(self.append(&mut inner, move |position| {
            LogEntry::Change(ChangeEvent::delete(table_id, key, Some(before), position, ts))
        })))
    }

    pub fn drop_table(&self, table_id: &TableId) -> u64 {
        let mut inner = self.inner();
        inner.tables.remove(table_id);
        let statement = format!("DROP TABLE {}", table_id);
        self.append_schema_change_locked(&mut inner, table_id, statement, true)
    }

    pub fn append_schema_change(&self, table_id: &TableId, statement: &str, destructive: bool) -> u64 {
        let mut inner = self.inner();
        self.append_schema_change_locked(&mut inner, table_id, statement.to_string(), destructive)
    }

    fn append_schema_change_locked(
        &self,
        inner: &mut Inner,
        table_id: &TableId,
        statement: String,
        destructive: bool,
    ) -> u64 {
        let table_id = table_id.clone();
        self.append(inner, move |position| LogEntry::SchemaChange {
            table_id,
            statement,
            destructive,
            position,
        })
    }

    pub fn append_heartbeat(&self) -> u64 {
        let mut inner = self.inner();
        self.append(&mut inner, |position| LogEntry::Heartbeat { position })
    }

    pub fn append_unhandled(&self, description: &str) -> u64 {
        let mut inner = self.inner();
        let description = description.to_string();
        self.append(&mut inner, move |position| LogEntry::Unhandled {
            description,
            position,
        })
    }

    /// Discards every log entry before `seq`.
    pub fn purge_before(&self, seq: u64) {
        let mut inner = self.inner();
        while inner.log.front().map_or(false, |(s, _)| *s < seq) {
            inner.log.pop_front();
        }
        inner.purged_through = inner.purged_through.max(seq.saturating_sub(1));
    }

    pub fn rows(&self, table_id: &TableId) -> Vec<Row> {
        self.inner()
            .tables
            .get(table_id)
            .map(|t| t.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn watermark(&self, slot_id: &str) -> Option<String> {
        self.inner().watermarks.get(slot_id).cloned()
    }

    pub fn scans(&self) -> u64 {
        self.inner().scans
    }

    pub fn fail_next_scans(&self, count: u32) {
        self.inner().scan_failures = count;
    }

    pub fn fail_next_opens(&self, count: u32) {
        self.inner().open_failures = count;
    }

    /// Makes open log streams fail `count` times on their next reads.
    pub fn interrupt_streams(&self, count: u32) {
        self.inner().stream_faults = count;
        self.appended.send_modify(|_| {});
    }

    /// Every further scan of `table_id` fails permanently.
    pub fn break_table(&self, table_id: &TableId) {
        self.inner().broken_tables.insert(table_id.clone());
    }

    pub fn repair_table(&self, table_id: &TableId) {
        self.inner().broken_tables.remove(table_id);
    }

    /// Runs `hook` right after the next scan of `table_id` has read its rows.
    pub fn on_next_scan(&self, table_id: &TableId, hook: impl FnOnce(&MemoryDatabase) + Send + 'static) {
        self.inner()
            .scan_hooks
            .insert(table_id.clone(), Box::new(hook));
    }

    /// Runs `hook` right after the next watermark write.
    pub fn on_next_watermark(&self, hook: impl FnOnce(&MemoryDatabase) + Send + 'static) {
        self.inner().watermark_hooks.push(Box::new(hook));
    }

    fn next_entry(&self, next: u64) -> Option<CaptureResult<LogEntry>> {
        let mut inner = self.inner();
        if inner.stream_faults > 0 {
            inner.stream_faults -= 1;
            return Some(Err(CaptureError::Transient("log stream interrupted".into())));
        }
        if next <= inner.purged_through {
            return Some(Err(CaptureError::RetentionExceeded {
                requested: LogPosition::sequence(next),
                oldest: Some(LogPosition::sequence(inner.purged_through + 1)),
            }));
        }
        let first = inner.log.front().map(|(seq, _)| *seq)?;
        let index = usize::try_from(next.checked_sub(first)?).ok()?;
        inner.log.get(index).map(|(_, entry)| Ok(entry.clone()))
    }
}

#[async_trait]
impl ChangeLog for MemoryDatabase {
    async fn open(&self, from: Option<LogPosition>) -> CaptureResult<LogStream> {
        let start = {
            let mut inner = self.inner();
            if inner.open_failures > 0 {
                inner.open_failures -= 1;
                return Err(CaptureError::Transient("connection refused".into()));
            }
            match from {
                None => inner.next_seq,
                Some(LogPosition::Sequence { seq }) => {
                    if seq <= inner.purged_through {
                        return Err(CaptureError::RetentionExceeded {
                            requested: LogPosition::sequence(seq),
                            oldest: Some(LogPosition::sequence(inner.purged_through + 1)),
                        });
                    }
                    seq
                }
                Some(other) => {
                    return Err(CaptureError::InvalidConfig(format!(
                        "in-memory log cannot resume from {}",
                        other
                    )))
                }
            }
        };

        let db = self.clone();
        let changes = self.appended.subscribe();
        let stream = stream::unfold(
            (db, changes, start, false),
            |(db, mut changes, next, failed)| async move {
                if failed {
                    return None;
                }
                loop {
                    changes.borrow_and_update();
                    match db.next_entry(next) {
                        Some(Ok(entry)) => return Some((Ok(entry), (db, changes, next + 1, false))),
                        Some(Err(err)) => return Some((Err(err), (db, changes, next, true))),
                        None => {
                            if changes.changed().await.is_err() {
                                return None;
                            }
                        }
                    }
                }
            },
        );
        Ok(stream.boxed())
    }

    async fn current_position(&self) -> CaptureResult<Option<LogPosition>> {
        Ok(Some(LogPosition::sequence(self.inner().next_seq)))
    }
}

#[async_trait]
impl TableScanner for MemoryDatabase {
    async fn scan_chunk(
        &self,
        binding: &TableBinding,
        after: Option<&Key>,
        limit: usize,
    ) -> CaptureResult<Vec<ScannedRow>> {
        let table_id = binding.table_id();
        let (rows, hook) = {
            let mut inner = self.inner();
            if inner.scan_failures > 0 {
                inner.scan_failures -= 1;
                return Err(CaptureError::Transient("lock wait timeout".into()));
            }
            if inner.broken_tables.contains(&table_id) {
                return Err(CaptureError::TableNotFound(table_id));
            }
            inner.scans += 1;
            let table = inner
                .tables
                .get(&table_id)
                .ok_or_else(|| CaptureError::TableNotFound(table_id.clone()))?;
            let rows: Vec<ScannedRow> = match after {
                Some(after) => table
                    .rows
                    .range((std::ops::Bound::Excluded(after.clone()), std::ops::Bound::Unbounded))
                    .take(limit)
                    .map(|(key, row)| ScannedRow {
                        key: key.clone(),
                        row: row.clone(),
                    })
                    .collect(),
                None => table
                    .rows
                    .iter()
                    .take(limit)
                    .map(|(key, row)| ScannedRow {
                        key: key.clone(),
                        row: row.clone(),
                    })
                    .collect(),
            };
            (rows, inner.scan_hooks.remove(&table_id))
        };
        if let Some(hook) = hook {
            hook(self);
        }
        Ok(rows)
    }
}

#[async_trait]
impl WatermarkStore for MemoryDatabase {
    async fn write(&self, watermark: &Watermark) -> CaptureResult<()> {
        let hooks = {
            let mut inner = self.inner();
            inner
                .watermarks
                .insert(watermark.slot_id.clone(), watermark.token.clone());
            let slot_id = watermark.slot_id.clone();
            let token = watermark.token.clone();
            self.append(&mut inner, move |position| LogEntry::Watermark {
                slot_id,
                token,
                position,
            });
            std::mem::take(&mut inner.watermark_hooks)
        };
        for hook in hooks {
            hook(self);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn row(id: i64, name: &str) -> Row {
        json!({"id": id, "name": name}).as_object().unwrap().clone()
    }

    fn orders() -> TableId {
        TableId::new("shop", "orders")
    }

    #[tokio::test]
    async fn test_writes_are_logged_in_order() {
        let db = MemoryDatabase::new();
        db.create_table(&orders(), &["id"]);
        let from = db.current_position().await.unwrap();
        db.upsert(&orders(), row(1, "a")).unwrap();
        db.upsert(&orders(), row(1, "b")).unwrap();
        db.delete(&orders(), &Key::single("id", 1i64)).unwrap();

        let mut stream = db.open(from).await.unwrap();
        let mut ops = vec![];
        for _ in 0..3 {
            match stream.next().await.unwrap().unwrap() {
                LogEntry::Change(event) => ops.push(event.operation()),
                other => panic!("unexpected entry {:?}", other),
            }
        }
        assert_eq!(
            ops,
            vec![
                crate::event::operation::Operation::Insert,
                crate::event::operation::Operation::Update,
                crate::event::operation::Operation::Delete
            ]
        );
        assert!(db.rows(&orders()).is_empty());
    }

    #[tokio::test]
    async fn test_idle_stream_wakes_on_append() {
        let db = MemoryDatabase::new();
        let mut stream = db.open(None).await.unwrap();
        let writer = db.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append_heartbeat();
        });
        let entry = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(entry.position(), &LogPosition::sequence(1));
    }

    #[tokio::test]
    async fn test_purged_position_is_rejected() {
        let db = MemoryDatabase::new();
        for _ in 0..5 {
            db.append_heartbeat();
        }
        db.purge_before(4);
        let err = db.open(Some(LogPosition::sequence(2))).await.err().unwrap();
        assert_eq!(err.kind(), "retention_exceeded");
        let mut stream = db.open(Some(LogPosition::sequence(4))).await.unwrap();
        assert_eq!(
            stream.next().await.unwrap().unwrap().position(),
            &LogPosition::sequence(4)
        );
    }

    #[tokio::test]
    async fn test_scan_is_key_ordered_and_runs_hook() {
        let db = MemoryDatabase::new();
        db.create_table(&orders(), &["id"]);
        for id in [3, 1, 2] {
            db.upsert(&orders(), row(id, "x")).unwrap();
        }
        db.on_next_scan(&orders(), |db| {
            db.upsert(&orders(), row(0, "late")).unwrap();
        });
        let binding = TableBinding::new("shop", "orders", &["id"]);
        let rows = db
            .scan_chunk(&binding, Some(&Key::single("id", 1i64)), 10)
            .await
            .unwrap();
        let keys: Vec<_> = rows.into_iter().map(|r| r.key).collect();
        assert_eq!(keys, vec![Key::single("id", 2i64), Key::single("id", 3i64)]);
        assert_eq!(db.rows(&orders()).len(), 4);
    }

    #[tokio::test]
    async fn test_watermark_write_is_replicated_through_the_log() {
        let db = MemoryDatabase::new();
        let from = db.current_position().await.unwrap();
        let watermark = Watermark::fresh("slot");
        db.write(&watermark).await.unwrap();
        assert_eq!(db.watermark("slot"), Some(watermark.token.clone()));
        let mut stream = db.open(from).await.unwrap();
        match stream.next().await.unwrap().unwrap() {
            LogEntry::Watermark { slot_id, token, .. } => {
                assert_eq!(slot_id, "slot");
                assert_eq!(token, watermark.token);
            }
            other => panic!("unexpected entry {:?}", other),
        }
    }
}
