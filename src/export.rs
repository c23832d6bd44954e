// Downstream export: load readings from a durable log (or dead-letter file)
// into a DuckDB table through an Arrow record batch and the DuckDB appender.
// Exports are incremental: entries whose sequence number is already in the
// table are skipped, so the same log can be exported repeatedly and the
// durable and dead-letter logs can share one table.
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Result};
use duckdb::arrow::array::{Float64Array, Int64Array, StringArray, TimestampMicrosecondArray};
use duckdb::arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use duckdb::arrow::record_batch::RecordBatch;
use duckdb::Connection;

use crate::log::read_log;
use crate::reading::ValidatedReading;

pub fn create_table(conn: &Connection, table: &str) -> Result<()> {
    check_table_name(table)?;
    let create_table_sql = format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            seq BIGINT,
            device_id VARCHAR,
            metric VARCHAR,
            value DOUBLE,
            unit VARCHAR,
            timestamp TIMESTAMP,
            received_at TIMESTAMP
        )"
    );
    conn.execute(&create_table_sql, [])?;
    Ok(())
}

/// Sequence numbers already present in `table`.
pub fn exported_seqs(conn: &Connection, table: &str) -> Result<HashSet<u64>> {
    check_table_name(table)?;
    let mut stmt = conn.prepare(&format!("SELECT seq FROM {table}"))?;
    let seqs = stmt
        .query_map([], |row| row.get::<_, i64>(0))?
        .map(|seq| seq.map(|s| s as u64))
        .collect::<duckdb::Result<HashSet<u64>>>()?;
    Ok(seqs)
}

/// Append the log's readings that are not in the table yet. Returns the
/// number of rows appended.
pub fn export_log(path: impl AsRef<Path>, conn: &Connection, table: &str) -> Result<usize> {
    create_table(conn, table)?;
    let exported = exported_seqs(conn, table)?;
    let fresh: Vec<ValidatedReading> = read_log(path)?
        .into_iter()
        .filter(|r| !exported.contains(&r.seq))
        .collect();
    if fresh.is_empty() {
        return Ok(0);
    }

    let batch = readings_to_record_batch(&fresh)?;
    let mut appender = conn.appender(table)?;
    appender.append_record_batch(batch)?;
    appender.flush()?;
    Ok(fresh.len())
}

pub fn readings_to_record_batch(rows: &[ValidatedReading]) -> Result<RecordBatch> {
    let seq_arr = Int64Array::from(rows.iter().map(|r| r.seq as i64).collect::<Vec<i64>>());
    let device_arr =
        StringArray::from(rows.iter().map(|r| r.device_id.clone()).collect::<Vec<String>>());
    let metric_arr =
        StringArray::from(rows.iter().map(|r| r.metric.clone()).collect::<Vec<String>>());
    let value_arr = Float64Array::from(rows.iter().map(|r| r.value).collect::<Vec<f64>>());
    let unit_arr =
        StringArray::from(rows.iter().map(|r| r.unit.clone()).collect::<Vec<Option<String>>>());
    let ts_arr = TimestampMicrosecondArray::from(
        rows.iter().map(|r| r.timestamp.timestamp_micros()).collect::<Vec<i64>>(),
    );
    let received_arr = TimestampMicrosecondArray::from(
        rows.iter().map(|r| r.received_at.timestamp_micros()).collect::<Vec<i64>>(),
    );

    let schema = Arc::new(Schema::new(vec![
        Field::new("seq", DataType::Int64, false),
        Field::new("device_id", DataType::Utf8, false),
        Field::new("metric", DataType::Utf8, false),
        Field::new("value", DataType::Float64, false),
        Field::new("unit", DataType::Utf8, true),
        Field::new("timestamp", DataType::Timestamp(TimeUnit::Microsecond, None), false),
        Field::new("received_at", DataType::Timestamp(TimeUnit::Microsecond, None), false),
    ]));

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(seq_arr),
            Arc::new(device_arr),
            Arc::new(metric_arr),
            Arc::new(value_arr),
            Arc::new(unit_arr),
            Arc::new(ts_arr),
            Arc::new(received_arr),
        ],
    )?;

    Ok(batch)
}

// Table names are interpolated into SQL.
fn check_table_name(table: &str) -> Result<()> {
    let mut chars = table.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        bail!("invalid table name {table:?}");
    }
    Ok(())
}
