//! Append-only durable log of accepted readings.
//!
//! The file starts with a version header line, followed by one entry per
//! line:
//!
//! ```text
//! #sensor-ingest-log v1
//! 1 8c3a9f01 {"seq":1,"device_id":"arduino-7","metric":"temperature","value":21.5,...}
//! 2 0b77e2d4 {"seq":2,...}
//! ```
//!
//! Each entry carries its sequence number twice (prefix and JSON body) and a
//! CRC32 of the JSON body, so a partially written entry is detectable on its
//! own. Only the tail of the file can be torn by a crash; recovery truncates
//! it. An invalid entry with valid entries after it is corruption and is
//! reported instead of repaired.
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher;
use tracing::{info, warn};

use crate::error::LogError;
use crate::reading::ValidatedReading;
use crate::writer::Sink;

const HEADER_PREFIX: &str = "#sensor-ingest-log ";
pub const FORMAT_VERSION: &str = "v1";

/// What `DurableLog::open` found in an existing file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recovery {
    pub entries: usize,
    /// Highest sequence number in the file, 0 when empty.
    pub last_seq: u64,
    /// Bytes dropped from a torn tail.
    pub truncated_bytes: u64,
}

pub struct DurableLog {
    path: PathBuf,
    file: File,
    /// Length of the file up to the end of the last fully appended batch.
    committed_len: u64,
    last_seq: u64,
}

impl DurableLog {
    /// Open or create a log, recovering it first when it already exists.
    pub fn open(path: impl AsRef<Path>) -> Result<(Self, Recovery), LogError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&path)?;

        let len = file.metadata()?.len();
        if len == 0 {
            let header = format!("{HEADER_PREFIX}{FORMAT_VERSION}\n");
            file.write_all(header.as_bytes())?;
            file.sync_all()?;
            info!(path = %path.display(), "created durable log");
            let log = Self {
                path,
                file,
                committed_len: header.len() as u64,
                last_seq: 0,
            };
            return Ok((log, Recovery::default()));
        }

        let bytes = fs::read(&path)?;
        let scan = scan(&path, &bytes)?;
        let mut recovery = Recovery {
            entries: scan.readings.len(),
            last_seq: scan.last_seq,
            truncated_bytes: 0,
        };

        if scan.valid_len < len {
            recovery.truncated_bytes = len - scan.valid_len;
            file.set_len(scan.valid_len)?;
            file.sync_all()?;
            warn!(
                path = %path.display(),
                truncated_bytes = recovery.truncated_bytes,
                "truncated torn tail of durable log"
            );
        }

        info!(
            path = %path.display(),
            entries = recovery.entries,
            last_seq = recovery.last_seq,
            "recovered durable log"
        );

        let log = Self {
            path,
            file,
            committed_len: scan.valid_len,
            last_seq: scan.last_seq,
        };
        Ok((log, recovery))
    }

    /// Append a batch and sync it to disk. On failure the file is cut back
    /// to its previous length, so the batch is either fully present or not
    /// at all.
    pub fn append_batch(&mut self, batch: &[ValidatedReading]) -> io::Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        // A previous failed append whose rollback also failed.
        if self.file.metadata()?.len() != self.committed_len {
            self.file.set_len(self.committed_len)?;
        }

        let mut buf = Vec::with_capacity(batch.len() * 160);
        for reading in batch {
            encode_entry(reading, &mut buf)?;
        }

        let written = self
            .file
            .write_all(&buf)
            .and_then(|_| self.file.sync_data());
        if let Err(e) = written {
            if let Err(rollback) = self.file.set_len(self.committed_len) {
                warn!(
                    path = %self.path.display(),
                    error = %rollback,
                    "failed to roll back partial batch"
                );
            }
            return Err(e);
        }

        self.committed_len += buf.len() as u64;
        if let Some(last) = batch.last() {
            self.last_seq = self.last_seq.max(last.seq);
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }
}

impl Sink for DurableLog {
    fn append(&mut self, batch: &[ValidatedReading]) -> io::Result<()> {
        self.append_batch(batch)
    }
}

/// Read every complete entry of a log without modifying it. A torn tail is
/// ignored, same as on recovery.
pub fn read_log(path: impl AsRef<Path>) -> Result<Vec<ValidatedReading>, LogError> {
    let path = path.as_ref();
    let bytes = fs::read(path)?;
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    Ok(scan(path, &bytes)?.readings)
}

pub fn encode_entry(reading: &ValidatedReading, out: &mut Vec<u8>) -> io::Result<()> {
    let json = serde_json::to_vec(reading)?;
    write!(out, "{} {:08x} ", reading.seq, checksum(&json))?;
    out.extend_from_slice(&json);
    out.push(b'\n');
    Ok(())
}

fn checksum(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

struct Scan {
    readings: Vec<ValidatedReading>,
    last_seq: u64,
    /// Offset just past the last valid entry.
    valid_len: u64,
}

fn scan(path: &Path, bytes: &[u8]) -> Result<Scan, LogError> {
    let header_end = bytes
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| LogError::NotALog {
            path: path.display().to_string(),
        })?;
    let header = std::str::from_utf8(&bytes[..header_end]).unwrap_or("");
    let version = header
        .strip_prefix(HEADER_PREFIX)
        .ok_or_else(|| LogError::NotALog {
            path: path.display().to_string(),
        })?;
    if version != FORMAT_VERSION {
        return Err(LogError::UnsupportedVersion(version.to_string()));
    }

    let mut scan = Scan {
        readings: Vec::new(),
        last_seq: 0,
        valid_len: (header_end + 1) as u64,
    };
    let mut offset = header_end + 1;
    let mut line_no = 1;

    while offset < bytes.len() {
        line_no += 1;
        let rest = &bytes[offset..];
        let Some(nl) = rest.iter().position(|&b| b == b'\n') else {
            // No newline: the last write never completed.
            break;
        };
        let line = &rest[..nl];
        let next = offset + nl + 1;

        match decode_entry(line) {
            Ok(reading) if reading.seq > scan.last_seq => {
                scan.last_seq = reading.seq;
                scan.readings.push(reading);
                scan.valid_len = next as u64;
            }
            Ok(reading) => {
                return Err(LogError::Corrupt {
                    line: line_no,
                    reason: format!(
                        "sequence {} does not follow {}",
                        reading.seq, scan.last_seq
                    ),
                });
            }
            // A bad final line is a torn write; anything after it means the
            // damage is not at the tail.
            Err(_) if next == bytes.len() => break,
            Err(reason) => return Err(LogError::Corrupt { line: line_no, reason }),
        }
        offset = next;
    }

    Ok(scan)
}

fn decode_entry(line: &[u8]) -> Result<ValidatedReading, String> {
    let mut parts = line.splitn(3, |&b| b == b' ');
    let (Some(seq), Some(crc), Some(json)) = (parts.next(), parts.next(), parts.next()) else {
        return Err("entry has fewer than three fields".to_string());
    };

    let seq: u64 = std::str::from_utf8(seq)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or("bad sequence prefix")?;
    let crc = std::str::from_utf8(crc)
        .ok()
        .and_then(|s| u32::from_str_radix(s, 16).ok())
        .ok_or("bad checksum field")?;

    if checksum(json) != crc {
        return Err(format!("checksum mismatch for sequence {seq}"));
    }
    let reading: ValidatedReading =
        serde_json::from_slice(json).map_err(|e| format!("bad entry body: {e}"))?;
    if reading.seq != seq {
        return Err(format!(
            "sequence prefix {seq} does not match body sequence {}",
            reading.seq
        ));
    }
    Ok(reading)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn reading(seq: u64) -> ValidatedReading {
        ValidatedReading {
            seq,
            device_id: format!("arduino-{}", seq % 3),
            metric: "temperature".into(),
            value: 20.0 + seq as f64 / 10.0,
            unit: if seq % 2 == 0 { Some("C".into()) } else { None },
            timestamp: Utc.with_ymd_and_hms(2025, 11, 29, 22, 0, 39).unwrap(),
            received_at: Utc::now(),
        }
    }

    fn batch(seqs: std::ops::RangeInclusive<u64>) -> Vec<ValidatedReading> {
        seqs.map(reading).collect()
    }

    #[test]
    fn test_new_log_has_version_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/readings.log");

        let (log, recovery) = DurableLog::open(&path).expect("open");
        assert_eq!(recovery, Recovery::default());
        assert_eq!(log.last_seq(), 0);

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text, "#sensor-ingest-log v1\n");
    }

    #[test]
    fn test_write_and_reload_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("readings.log");
        let written: Vec<ValidatedReading> = batch(1..=5).into_iter().chain(batch(6..=9)).collect();

        {
            let (mut log, _) = DurableLog::open(&path).unwrap();
            log.append_batch(&written[..5]).unwrap();
            log.append_batch(&written[5..]).unwrap();
            assert_eq!(log.last_seq(), 9);
        }

        assert_eq!(read_log(&path).unwrap(), written);

        let (log, recovery) = DurableLog::open(&path).unwrap();
        assert_eq!(recovery.entries, 9);
        assert_eq!(recovery.last_seq, 9);
        assert_eq!(recovery.truncated_bytes, 0);
        assert_eq!(log.last_seq(), 9);
    }

    #[test]
    fn test_torn_tail_is_truncated_and_appends_continue() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("readings.log");
        {
            let (mut log, _) = DurableLog::open(&path).unwrap();
            log.append_batch(&batch(1..=3)).unwrap();
        }

        // Simulate a crash halfway through writing entry 4.
        let mut torn = Vec::new();
        encode_entry(&reading(4), &mut torn).unwrap();
        let half = &torn[..torn.len() / 2];
        let clean_len = fs::metadata(&path).unwrap().len();
        OpenOptions::new().append(true).open(&path).unwrap().write_all(half).unwrap();

        // Readers skip the torn entry without touching the file.
        assert_eq!(read_log(&path).unwrap().len(), 3);

        let (mut log, recovery) = DurableLog::open(&path).unwrap();
        assert_eq!(recovery.entries, 3);
        assert_eq!(recovery.last_seq, 3);
        assert_eq!(recovery.truncated_bytes, half.len() as u64);
        assert_eq!(fs::metadata(&path).unwrap().len(), clean_len);

        log.append_batch(&batch(4..=5)).unwrap();
        let seqs: Vec<u64> = read_log(&path).unwrap().iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_append_cuts_back_leftovers_of_a_failed_batch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("readings.log");
        let (mut log, _) = DurableLog::open(&path).unwrap();
        log.append_batch(&batch(1..=3)).unwrap();
        let committed = fs::metadata(&path).unwrap().len();

        // A batch that died part way, with its rollback failing too: one
        // complete entry and half of the next are left past the commit point.
        let mut partial = Vec::new();
        for r in batch(4..=5) {
            encode_entry(&r, &mut partial).unwrap();
        }
        let first_len = partial.iter().position(|&b| b == b'\n').unwrap() + 1;
        partial.truncate(first_len + (partial.len() - first_len) / 2);
        OpenOptions::new().append(true).open(&path).unwrap().write_all(&partial).unwrap();
        assert!(fs::metadata(&path).unwrap().len() > committed);

        // The retry of the same batch must not leave a second copy of seq 4.
        log.append_batch(&batch(4..=5)).unwrap();
        let seqs: Vec<u64> = read_log(&path).unwrap().iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        assert_eq!(log.last_seq(), 5);

        let (_, recovery) = DurableLog::open(&path).unwrap();
        assert_eq!(recovery.entries, 5);
        assert_eq!(recovery.truncated_bytes, 0);
    }

    #[test]
    fn test_bad_checksum_on_last_line_counts_as_torn() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("readings.log");
        {
            let (mut log, _) = DurableLog::open(&path).unwrap();
            log.append_batch(&batch(1..=2)).unwrap();
        }
        let mut text = fs::read_to_string(&path).unwrap();
        text.push_str("3 00000000 {\"seq\":3}\n");
        fs::write(&path, text).unwrap();

        let (_, recovery) = DurableLog::open(&path).unwrap();
        assert_eq!(recovery.entries, 2);
        assert!(recovery.truncated_bytes > 0);
    }

    #[test]
    fn test_damage_before_valid_entries_is_corruption() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("readings.log");
        {
            let (mut log, _) = DurableLog::open(&path).unwrap();
            log.append_batch(&batch(1..=3)).unwrap();
        }
        let text = fs::read_to_string(&path).unwrap();
        let damaged = text.replacen("temperature", "temperaturX", 1);
        fs::write(&path, damaged).unwrap();

        match DurableLog::open(&path) {
            Err(LogError::Corrupt { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected corruption, got {:?}", other.map(|(_, r)| r)),
        }
    }

    #[test]
    fn test_foreign_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("notes.txt");
        fs::write(&path, "shopping list\nmilk\n").unwrap();
        assert!(matches!(DurableLog::open(&path), Err(LogError::NotALog { .. })));

        fs::write(&path, "#sensor-ingest-log v9\n").unwrap();
        assert!(matches!(
            DurableLog::open(&path),
            Err(LogError::UnsupportedVersion(v)) if v == "v9"
        ));
    }

    #[test]
    fn test_out_of_order_sequence_is_corruption() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("readings.log");
        {
            let (mut log, _) = DurableLog::open(&path).unwrap();
            log.append_batch(&[reading(5)]).unwrap();
            log.append_batch(&[reading(2)]).unwrap();
        }
        assert!(matches!(read_log(&path), Err(LogError::Corrupt { line: 3, .. })));
    }

    #[test]
    fn test_empty_batch_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("readings.log");
        let (mut log, _) = DurableLog::open(&path).unwrap();
        let before = fs::metadata(&path).unwrap().len();
        log.append_batch(&[]).unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), before);
    }
}
