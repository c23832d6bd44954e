// Load a durable log (or dead-letter file) into DuckDB for downstream
// analysis. Safe to run repeatedly against a growing log: only readings
// newer than the table's highest sequence number are appended.
use std::path::PathBuf;

use clap::Parser;
use duckdb::Connection;

use sensor_ingest::export;

#[derive(Debug, Parser)]
#[command(about = "Export sensor readings from a durable log into DuckDB")]
struct Args {
    /// Durable log or dead-letter file to read
    #[arg(long, default_value = "data/readings.log")]
    log: PathBuf,

    /// DuckDB database file (created if missing)
    #[arg(long, default_value = "readings.duckdb")]
    db: PathBuf,

    /// Target table
    #[arg(long, default_value = "readings")]
    table: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let conn = Connection::open(&args.db)?;
    let appended = export::export_log(&args.log, &conn, &args.table)?;
    conn.execute("CHECKPOINT", [])?;

    println!(
        "Appended {} readings from {} into {}:{}",
        appended,
        args.log.display(),
        args.db.display(),
        args.table
    );
    Ok(())
}
