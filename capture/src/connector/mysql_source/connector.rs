use crate::config::TableBinding;
use crate::connector::mysql_source::binlog::{
    BinlogDecoder, BinlogTail, ResumeHint, FIRST_EVENT_OFFSET,
};
use crate::connector::mysql_source::config::MySQLSourceConfig;
use crate::connector::mysql_source::decoding::{key_value_to_sql, sql_row_to_json};
use crate::connector::source_connector::{ChangeLog, LogStream, ScannedRow, TableScanner};
use crate::error::{CaptureError, CaptureResult, ER_NO_SUCH_TABLE};
use crate::event::key::Key;
use crate::event::table_id::TableId;
use crate::position::LogPosition;
use crate::watermark::{Watermark, WatermarkStore};
use async_trait::async_trait;
use log::{debug, info};
use mysql_async::prelude::Queryable;
use mysql_async::{BinlogRequest, Pool, Row, ServerError, Value};
use std::collections::HashMap;

/// MySQL as a change log, table scanner and watermark store.
///
/// Requires `binlog_format=ROW` and a user with `REPLICATION SLAVE`,
/// `REPLICATION CLIENT` and `SELECT` on the captured tables.
pub struct MySQLSourceConnector {
    config: MySQLSourceConfig,
    pool: Pool,
    keys: HashMap<TableId, Vec<String>>,
    hint: ResumeHint,
}

/// Key types whose values reach the capture as text or floats, so their
/// order in the capture would not match the numeric order of the scan.
const UNORDERED_KEY_TYPES: [&str; 4] = ["decimal", "float", "double", "real"];

fn check_key_type(table: &TableId, column: &str, data_type: &str) -> CaptureResult<()> {
    if UNORDERED_KEY_TYPES.contains(&data_type.to_ascii_lowercase().as_str()) {
        return Err(CaptureError::InvalidConfig(format!(
            "key column {} of {} has type {}, which cannot be backfilled in key order",
            column, table, data_type
        )));
    }
    Ok(())
}

fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

fn quote_table(table: &TableId) -> String {
    format!("{}.{}", quote_ident(&table.schema), quote_ident(&table.table))
}

/// Keyset pagination over the binding's key columns.
pub(crate) fn scan_query(binding: &TableBinding, after: Option<&Key>, limit: usize) -> String {
    let keys = binding
        .key_columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let mut query = format!("SELECT * FROM {}", quote_table(&binding.table_id()));
    if after.is_some() {
        let placeholders = vec!["?"; binding.key_columns.len()].join(", ");
        query.push_str(&format!(" WHERE ({}) > ({})", keys, placeholders));
    }
    query.push_str(&format!(" ORDER BY {} LIMIT {}", keys, limit));
    query
}

impl MySQLSourceConnector {
    pub fn new(config: &MySQLSourceConfig, bindings: &[TableBinding]) -> CaptureResult<Self> {
        config.validate()?;
        let keys = bindings
            .iter()
            .map(|b| (b.table_id(), b.key_columns.clone()))
            .collect();
        Ok(MySQLSourceConnector {
            config: config.clone(),
            pool: Pool::new(config.opts()),
            keys,
            hint: ResumeHint::default(),
        })
    }

    fn watermarks_table(&self) -> TableId {
        TableId::new(&self.config.db, &self.config.watermarks_table)
    }

    pub async fn ensure_watermarks_table(&self) -> CaptureResult<()> {
        let query = format!(
            "CREATE TABLE IF NOT EXISTS {} (slot VARCHAR(255) NOT NULL PRIMARY KEY, watermark VARCHAR(64) NOT NULL)",
            quote_table(&self.watermarks_table())
        );
        let mut conn = self.pool.get_conn().await?;
        conn.query_drop(query).await?;
        Ok(())
    }

    /// Rejects bindings keyed on columns whose values do not sort numerically
    /// once decoded.
    pub async fn check_key_types(&self) -> CaptureResult<()> {
        let query = r#"
            SELECT column_name, data_type
            FROM information_schema.columns
            WHERE table_schema = ? AND table_name = ?
        "#;
        let mut conn = self.pool.get_conn().await?;
        for (table, key_columns) in &self.keys {
            let types: Vec<(String, String)> = conn
                .exec(query, (table.schema.as_str(), table.table.as_str()))
                .await?;
            for (column, data_type) in types {
                if key_columns.contains(&column) {
                    check_key_type(table, &column, &data_type)?;
                }
            }
        }
        Ok(())
    }

    pub async fn disconnect(self) -> CaptureResult<()> {
        self.pool.disconnect().await?;
        Ok(())
    }

    async fn binary_logs(&self) -> CaptureResult<Vec<String>> {
        let mut conn = self.pool.get_conn().await?;
        let rows: Vec<Row> = conn.query("SHOW BINARY LOGS").await?;
        Ok(rows.into_iter().filter_map(|r| r.get::<String, _>(0)).collect())
    }

    async fn check_retained(&self, from: &LogPosition, file: &str) -> CaptureResult<()> {
        let logs = self.binary_logs().await?;
        if logs.iter().any(|name| name == file) {
            return Ok(());
        }
        Err(CaptureError::RetentionExceeded {
            requested: from.clone(),
            oldest: logs
                .first()
                .map(|name| LogPosition::binlog(name, FIRST_EVENT_OFFSET, 0)),
        })
    }
}

#[async_trait]
impl ChangeLog for MySQLSourceConnector {
    async fn open(&self, from: Option<LogPosition>) -> CaptureResult<LogStream> {
        let from = match from {
            Some(from) => from,
            None => self.current_position().await?.ok_or_else(|| {
                CaptureError::InvalidConfig("binary logging is disabled on the source".into())
            })?,
        };
        let (file, offset) = match &from {
            LogPosition::Binlog { file, offset, .. } => (file.clone(), *offset),
            other => {
                return Err(CaptureError::MetadataCorruption {
                    table: None,
                    position: Some(other.clone()),
                    detail: "resume position is not a binlog position".to_string(),
                })
            }
        };
        self.check_retained(&from, &file).await?;

        let start = self.hint.start_offset(&file, offset);
        info!("Opening binlog {} at {} to resume from {}", file, start, from);

        let conn = self.pool.get_conn().await?;
        let request = BinlogRequest::new(self.config.server_id)
            .with_filename(file.as_bytes())
            .with_pos(start);
        let stream = conn.get_binlog_stream(request).await?;

        let decoder = BinlogDecoder::new(
            &self.config.db,
            &self.config.watermarks_table,
            self.keys.clone(),
            &file,
        );
        let tail = BinlogTail::new(stream, decoder, self.pool.clone(), from, self.hint.clone());
        Ok(tail.into_stream())
    }

    async fn current_position(&self) -> CaptureResult<Option<LogPosition>> {
        let mut conn = self.pool.get_conn().await?;
        let master_status: Vec<(String, u64, String, String, String)> =
            conn.query("SHOW MASTER STATUS").await?;
        let position = master_status.first().map(|(file, pos, ..)| {
            self.hint.record(file, *pos);
            LogPosition::binlog(file, *pos, 0)
        });
        Ok(position)
    }
}

#[async_trait]
impl TableScanner for MySQLSourceConnector {
    async fn scan_chunk(
        &self,
        binding: &TableBinding,
        after: Option<&Key>,
        limit: usize,
    ) -> CaptureResult<Vec<ScannedRow>> {
        let query = scan_query(binding, after, limit);
        let params: Vec<Value> = after
            .map(|key| key.values().map(key_value_to_sql).collect())
            .unwrap_or_default();
        debug!("Scanning {} after {:?}: {}", binding.table_id(), after, query);

        let mut conn = self.pool.get_conn().await?;
        let rows: Vec<Row> = match conn.exec(query, params).await {
            Ok(rows) => rows,
            Err(mysql_async::Error::Server(ServerError { code, .. }))
                if code == ER_NO_SUCH_TABLE =>
            {
                return Err(CaptureError::TableNotFound(binding.table_id()))
            }
            Err(e) => return Err(e.into()),
        };

        rows.iter()
            .map(|r| {
                let row = sql_row_to_json(r);
                let key = binding.key_of(&row)?;
                Ok(ScannedRow { key, row })
            })
            .collect()
    }
}

#[async_trait]
impl WatermarkStore for MySQLSourceConnector {
    async fn write(&self, watermark: &Watermark) -> CaptureResult<()> {
        let query = format!(
            "REPLACE INTO {} (slot, watermark) VALUES (?, ?)",
            quote_table(&self.watermarks_table())
        );
        let mut conn = self.pool.get_conn().await?;
        conn.exec_drop(query, (watermark.slot_id.as_str(), watermark.token.as_str()))
            .await?;
        Ok(())
    }
}
