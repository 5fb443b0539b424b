use crate::connector::mysql_source::ddl::{classify, QueryClass};
use crate::connector::mysql_source::decoding::binlog_row_to_json;
use crate::connector::source_connector::LogStream;
use crate::error::{CaptureError, CaptureResult};
use crate::event::event::ChangeEvent;
use crate::event::key::Key;
use crate::event::log_entry::LogEntry;
use crate::event::table_id::TableId;
use crate::event::Row;
use crate::position::LogPosition;
use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use mysql_async::binlog::events::{
    DeleteRowsEvent, Event, QueryEvent, RotateEvent, TableMapEvent, UpdateRowsEvent,
    WriteRowsEvent,
};
use mysql_async::binlog::row::BinlogRow;
use mysql_async::binlog::EventType;
use mysql_async::prelude::Queryable;
use mysql_async::{BinlogStream, Pool};
use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

enum RowsEvent<'a> {
    Write(WriteRowsEvent<'a>),
    Update(UpdateRowsEvent<'a>),
    Delete(DeleteRowsEvent<'a>),
}

type RowImages = Vec<(Option<BinlogRow>, Option<BinlogRow>)>;

/// Last offset known to start outside any transaction.
///
/// Opening the binlog there needs no earlier table map, so reconnects can
/// skip straight to it instead of replaying the file.
#[derive(Debug, Clone, Default)]
pub struct ResumeHint(Arc<Mutex<Option<(String, u64)>>>);

impl ResumeHint {
    pub fn record(&self, file: &str, offset: u64) {
        let mut hint = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        *hint = Some((file.to_string(), offset));
    }

    /// Where to start the dump so that every entry at or after
    /// `file:offset` is decoded.
    pub fn start_offset(&self, file: &str, offset: u64) -> u64 {
        let hint = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        match hint.as_ref() {
            Some((hint_file, hint_offset)) if hint_file == file && *hint_offset <= offset => {
                *hint_offset
            }
            _ => FIRST_EVENT_OFFSET,
        }
    }
}

/// Offset of the first event after the binlog magic header.
pub const FIRST_EVENT_OFFSET: u64 = 4;

/// Turns binlog events into log entries.
pub struct BinlogDecoder {
    database: String,
    watermarks: TableId,
    keys: HashMap<TableId, Vec<String>>,
    columns: HashMap<TableId, Vec<String>>,
    table_maps: HashMap<u64, TableMapEvent<'static>>,
    file: String,
}

impl BinlogDecoder {
    pub fn new(
        database: &str,
        watermarks_table: &str,
        keys: HashMap<TableId, Vec<String>>,
        file: &str,
    ) -> Self {
        BinlogDecoder {
            database: database.to_string(),
            watermarks: TableId::new(database, watermarks_table),
            keys,
            columns: HashMap::new(),
            table_maps: HashMap::new(),
            file: file.to_string(),
        }
    }

    fn is_tracked(&self, table: &TableId) -> bool {
        *table == self.watermarks || self.keys.contains_key(table)
    }

    pub fn set_columns(&mut self, table: TableId, columns: Vec<String>) {
        self.columns.insert(table, columns);
    }

    fn has_columns(&self, table: &TableId) -> bool {
        self.columns.contains_key(table)
    }

    /// Whether every row of an event at `offset` in the current file lies
    /// before `from`. Such events are only replayed for their table maps.
    pub fn precedes(&self, offset: u64, from: &LogPosition) -> bool {
        LogPosition::binlog(&self.file, offset, u32::MAX).partial_cmp(from) == Some(Ordering::Less)
    }

    fn on_rotate(&mut self, event: &RotateEvent) {
        let name = event.name();
        if name != self.file {
            info!("Binlog rotated from {} to {}", self.file, name);
            self.file = name.to_string();
        }
    }

    /// Remembers the table map; returns the table when its column names
    /// must be (re)loaded before the rows that follow can be decoded.
    fn on_table_map(&mut self, event: TableMapEvent<'_>) -> Option<TableId> {
        let table = TableId::new(&event.database_name(), &event.table_name());
        let count = event.columns_count() as usize;
        self.table_maps.insert(event.table_id(), event.into_owned());

        if !self.is_tracked(&table) {
            return None;
        }
        match self.columns.get(&table) {
            Some(columns) if columns.len() == count => None,
            _ => Some(table),
        }
    }

    fn on_query(&mut self, event: &QueryEvent, position: LogPosition) -> Vec<LogEntry> {
        let schema = event.schema();
        let schema: &str = if schema.is_empty() {
            &self.database
        } else {
            &schema
        };
        let query = event.query();

        match classify(schema, &query) {
            QueryClass::Transaction | QueryClass::Other => vec![LogEntry::Heartbeat { position }],
            QueryClass::SchemaChange(tables) => {
                let LogPosition::Binlog { file, offset, .. } = &position else {
                    return vec![];
                };
                let mut entries = vec![];
                for (index, (table_id, destructive)) in tables.into_iter().enumerate() {
                    debug!("Schema change on {}: {}", table_id, query);
                    self.columns.remove(&table_id);
                    entries.push(LogEntry::SchemaChange {
                        table_id,
                        statement: query.to_string(),
                        destructive,
                        position: LogPosition::binlog(file, *offset, index as u32),
                    });
                }
                entries
            }
            QueryClass::Unsupported(description) => {
                vec![LogEntry::Unhandled {
                    description,
                    position,
                }]
            }
        }
    }

    fn on_rows(&self, event: RowsEvent, offset: u64, ts: u64) -> CaptureResult<Vec<LogEntry>> {
        let table_id = match &event {
            RowsEvent::Write(e) => e.table_id(),
            RowsEvent::Update(e) => e.table_id(),
            RowsEvent::Delete(e) => e.table_id(),
        };
        let event_position = LogPosition::binlog(&self.file, offset, 0);
        let tme = self
            .table_maps
            .get(&table_id)
            .ok_or_else(|| CaptureError::MetadataCorruption {
                table: None,
                position: Some(event_position.clone()),
                detail: format!("rows event references unknown table map id {}", table_id),
            })?;

        let table = TableId::new(&tme.database_name(), &tme.table_name());
        if !self.is_tracked(&table) {
            return Ok(vec![]);
        }

        let columns = self.columns.get(&table).ok_or_else(|| CaptureError::MetadataCorruption {
            table: Some(table.clone()),
            position: Some(event_position.clone()),
            detail: "no column metadata for table".to_string(),
        })?;
        if columns.len() as u64 != tme.columns_count() {
            return Err(CaptureError::MetadataCorruption {
                table: Some(table),
                position: Some(event_position),
                detail: format!(
                    "binlog row has {} columns, information_schema lists {}",
                    tme.columns_count(),
                    columns.len()
                ),
            });
        }

        let rows: RowImages = match &event {
            RowsEvent::Write(e) => e.rows(tme).collect::<Result<_, _>>()?,
            RowsEvent::Update(e) => e.rows(tme).collect::<Result<_, _>>()?,
            RowsEvent::Delete(e) => e.rows(tme).collect::<Result<_, _>>()?,
        };

        let mut entries = Vec::with_capacity(rows.len());
        for (index, (before, after)) in rows.iter().enumerate() {
            let position = LogPosition::binlog(&self.file, offset, index as u32);
            let decode = |image: &Option<BinlogRow>| -> Result<Option<Row>, String> {
                image
                    .as_ref()
                    .map(|row| binlog_row_to_json(row, columns))
                    .transpose()
            };
            let (before, after) = match (decode(before), decode(after)) {
                (Ok(before), Ok(after)) => (before, after),
                (Err(description), _) | (_, Err(description)) => {
                    entries.push(LogEntry::Unhandled {
                        description: format!("{} in {}", description, table),
                        position,
                    });
                    return Ok(entries);
                }
            };

            if table == self.watermarks {
                if let Some(entry) = watermark_entry(after.as_ref(), position) {
                    entries.push(entry);
                }
                continue;
            }

            let key_columns = match self.keys.get(&table) {
                Some(key_columns) => key_columns,
                None => continue,
            };
            let event = match (before, after) {
                (None, Some(after)) => {
                    let key = key_for(&table, &after, key_columns, &position)?;
                    ChangeEvent::insert(table.clone(), key, after, position, ts)
                }
                (Some(before), Some(after)) => {
                    let key = key_for(&table, &after, key_columns, &position)?;
                    ChangeEvent::update(table.clone(), key, Some(before), after, position, ts)
                }
                (Some(before), None) => {
                    let key = key_for(&table, &before, key_columns, &position)?;
                    ChangeEvent::delete(table.clone(), key, Some(before), position, ts)
                }
                (None, None) => continue,
            };
            entries.push(LogEntry::Change(event));
        }
        Ok(entries)
    }
}

fn key_for(
    table: &TableId,
    row: &Row,
    key_columns: &[String],
    position: &LogPosition,
) -> CaptureResult<Key> {
    Key::from_row(table, row, key_columns).map_err(|e| match e {
        CaptureError::MetadataCorruption { table, detail, .. } => CaptureError::MetadataCorruption {
            table,
            position: Some(position.clone()),
            detail,
        },
        e => e,
    })
}

// Deletes on the watermarks table carry no token and are skipped.
fn watermark_entry(after: Option<&Row>, position: LogPosition) -> Option<LogEntry> {
    let after = after?;
    let slot_id = after.get("slot")?.as_str()?.to_string();
    let token = after.get("watermark")?.as_str()?.to_string();
    Some(LogEntry::Watermark {
        slot_id,
        token,
        position,
    })
}

/// An open binlog dump plus the decoding state needed to tail it.
pub(crate) struct BinlogTail {
    pub stream: BinlogStream,
    pub decoder: BinlogDecoder,
    pub pool: Pool,
    pub from: LogPosition,
    pub hint: ResumeHint,
    pending: VecDeque<LogEntry>,
    done: bool,
}

impl BinlogTail {
    pub fn new(
        stream: BinlogStream,
        decoder: BinlogDecoder,
        pool: Pool,
        from: LogPosition,
        hint: ResumeHint,
    ) -> Self {
        BinlogTail {
            stream,
            decoder,
            pool,
            from,
            hint,
            pending: VecDeque::new(),
            done: false,
        }
    }

    pub fn into_stream(self) -> LogStream {
        stream::unfold(self, |mut tail| async move {
            let item = tail.next_entry().await?;
            Some((item, tail))
        })
        .boxed()
    }

    async fn next_entry(&mut self) -> Option<CaptureResult<LogEntry>> {
        loop {
            if let Some(entry) = self.pending.pop_front() {
                // The dump may start before `from` to pick up table maps.
                if entry.position().partial_cmp(&self.from) == Some(Ordering::Less) {
                    continue;
                }
                return Some(Ok(entry));
            }
            if self.done {
                return None;
            }

            let event = match self.stream.next().await {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(e.into()));
                }
                None => return None,
            };
            match self.decode(event).await {
                Ok(entries) => self.pending.extend(entries),
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }

    async fn decode(&mut self, event: Event) -> CaptureResult<Vec<LogEntry>> {
        let header = event.header();
        let ts = 1000 * header.timestamp() as u64;
        let offset = (header.log_pos() as u64).saturating_sub(header.event_size() as u64);

        let event_type = match header.event_type() {
            Ok(event_type) => event_type,
            Err(unknown) => {
                return Ok(vec![LogEntry::Unhandled {
                    description: format!("unknown binlog event type {:?}", unknown),
                    position: LogPosition::binlog(&self.decoder.file, offset, 0),
                }])
            }
        };
        let position = LogPosition::binlog(&self.decoder.file, offset, 0);
        // Rows replayed ahead of `from` may predate later schema changes, so
        // they are neither decoded nor checked against current columns.
        let replayed = self.decoder.precedes(offset, &self.from);

        let entries = match event_type {
            EventType::ROTATE_EVENT => {
                let event = event.read_event::<RotateEvent>()?;
                self.decoder.on_rotate(&event);
                vec![]
            }
            EventType::TABLE_MAP_EVENT => {
                let event = event.read_event::<TableMapEvent>()?;
                let stale = self.decoder.on_table_map(event);
                if let Some(table) = stale.filter(|t| !replayed || !self.decoder.has_columns(t)) {
                    let columns = read_columns(&self.pool, &table).await?;
                    debug!("Loaded {} columns for {}", columns.len(), table);
                    self.decoder.set_columns(table, columns);
                }
                vec![]
            }
            EventType::WRITE_ROWS_EVENT if replayed => vec![],
            EventType::WRITE_ROWS_EVENT => {
                let event = event.read_event::<WriteRowsEvent>()?;
                self.decoder.on_rows(RowsEvent::Write(event), offset, ts)?
            }
            EventType::UPDATE_ROWS_EVENT if replayed => vec![],
            EventType::UPDATE_ROWS_EVENT => {
                let event = event.read_event::<UpdateRowsEvent>()?;
                self.decoder.on_rows(RowsEvent::Update(event), offset, ts)?
            }
            EventType::DELETE_ROWS_EVENT if replayed => vec![],
            EventType::DELETE_ROWS_EVENT => {
                let event = event.read_event::<DeleteRowsEvent>()?;
                self.decoder.on_rows(RowsEvent::Delete(event), offset, ts)?
            }
            EventType::QUERY_EVENT => {
                let event = event.read_event::<QueryEvent>()?;
                let entries = self.decoder.on_query(&event, position.clone());
                if matches!(entries.as_slice(), [LogEntry::Heartbeat { .. }]) {
                    self.hint.record(&self.decoder.file, offset);
                }
                entries
            }
            EventType::XID_EVENT => {
                self.hint.record(&self.decoder.file, offset);
                vec![LogEntry::Heartbeat { position }]
            }
            // Carry no row data; heartbeats repeat the last position.
            EventType::FORMAT_DESCRIPTION_EVENT
            | EventType::PREVIOUS_GTIDS_EVENT
            | EventType::GTID_EVENT
            | EventType::ANONYMOUS_GTID_EVENT
            | EventType::ROWS_QUERY_EVENT
            | EventType::HEARTBEAT_EVENT
            | EventType::STOP_EVENT => vec![],
            other => {
                warn!("Unhandled binlog event {:?} at {}", other, position);
                vec![LogEntry::Unhandled {
                    description: format!("binlog event {:?}", other),
                    position,
                }]
            }
        };
        Ok(entries)
    }
}

pub(crate) async fn read_columns(pool: &Pool, table: &TableId) -> CaptureResult<Vec<String>> {
    let query = r#"
        SELECT column_name
        FROM information_schema.columns
        WHERE table_schema = ? AND table_name = ?
        ORDER BY ordinal_position
    "#;
    let mut conn = pool.get_conn().await?;
    let columns: Vec<String> = conn
        .exec(query, (table.schema.as_str(), table.table.as_str()))
        .await?;
    if columns.is_empty() {
        return Err(CaptureError::TableNotFound(table.clone()));
    }
    Ok(columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: serde_json::Value) -> Row {
        value.as_object().unwrap().clone()
    }

    fn decoder_for(file: &str) -> BinlogDecoder {
        let mut keys = HashMap::new();
        keys.insert(TableId::new("shop", "orders"), vec!["id".to_string()]);
        BinlogDecoder::new("shop", "flow_watermarks", keys, file)
    }

    #[test]
    fn test_rows_before_resume_position_are_replayed_only() {
        let decoder = decoder_for("mysql-bin.000003");
        let from = LogPosition::binlog("mysql-bin.000003", 1200, 2);

        // An insert from before an ALTER TABLE earlier in the file.
        assert!(decoder.precedes(350, &from));
        // The event holding `from` still yields its later rows.
        assert!(!decoder.precedes(1200, &from));
        assert!(!decoder.precedes(1500, &from));

        let rotated = decoder_for("mysql-bin.000004");
        assert!(!rotated.precedes(4, &from));
        assert!(decoder_for("mysql-bin.000002").precedes(90_000, &from));
    }

    #[test]
    fn test_resume_hint() {
        let hint = ResumeHint::default();
        assert_eq!(hint.start_offset("mysql-bin.000002", 900), FIRST_EVENT_OFFSET);

        hint.record("mysql-bin.000002", 500);
        assert_eq!(hint.start_offset("mysql-bin.000002", 900), 500);
        assert_eq!(hint.start_offset("mysql-bin.000002", 500), 500);
        assert_eq!(hint.start_offset("mysql-bin.000002", 120), FIRST_EVENT_OFFSET);
        assert_eq!(hint.start_offset("mysql-bin.000003", 900), FIRST_EVENT_OFFSET);
    }

    #[test]
    fn test_watermark_entry() {
        let position = LogPosition::binlog("mysql-bin.000001", 300, 0);
        let after = row(json!({"slot": "capture", "watermark": "t-1"}));
        assert_eq!(
            watermark_entry(Some(&after), position.clone()),
            Some(LogEntry::Watermark {
                slot_id: "capture".into(),
                token: "t-1".into(),
                position: position.clone(),
            })
        );
        assert_eq!(watermark_entry(None, position), None);
    }

    #[test]
    fn test_key_errors_carry_position() {
        let table = TableId::new("shop", "orders");
        let position = LogPosition::binlog("mysql-bin.000001", 300, 2);
        let err = key_for(&table, &row(json!({"x": 1})), &["id".into()], &position).unwrap_err();
        match err {
            CaptureError::MetadataCorruption { position: p, .. } => assert_eq!(p, Some(position)),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_tracked_tables() {
        let mut keys = HashMap::new();
        keys.insert(TableId::new("shop", "orders"), vec!["id".to_string()]);
        let decoder = BinlogDecoder::new("shop", "flow_watermarks", keys, "mysql-bin.000001");
        assert!(decoder.is_tracked(&TableId::new("shop", "orders")));
        assert!(decoder.is_tracked(&TableId::new("shop", "flow_watermarks")));
        assert!(!decoder.is_tracked(&TableId::new("shop", "users")));
    }
}
