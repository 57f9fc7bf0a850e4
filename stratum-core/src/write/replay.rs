//! Durable replay log for abandoned batches
//!
//! When splitting cannot shrink a rejected batch below the floor, its
//! mutations are appended here for offline replay instead of being lost
//! silently. Entries are length-prefixed bincode with a crc32 checksum;
//! the reader stops at the first truncated or corrupt entry, so a crash
//! mid-append loses only the torn tail.

use crate::store::{Mutation, Table};
use crate::{Result, StratumError};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

const LOG_FILE: &str = "replay.log";

#[derive(Serialize, Deserialize)]
struct ReplayMutation {
    table: Table,
    partition: Vec<u8>,
    column: Vec<u8>,
    value: Vec<u8>,
    ttl: Option<u32>,
}

impl From<&Mutation> for ReplayMutation {
    fn from(m: &Mutation) -> Self {
        Self {
            table: m.table,
            partition: m.partition.to_vec(),
            column: m.column.to_vec(),
            value: m.value.to_vec(),
            ttl: m.ttl,
        }
    }
}

impl From<ReplayMutation> for Mutation {
    fn from(m: ReplayMutation) -> Self {
        Self {
            table: m.table,
            partition: Bytes::from(m.partition),
            column: Bytes::from(m.column),
            value: Bytes::from(m.value),
            ttl: m.ttl,
        }
    }
}

/// Append-only log of abandoned mutation batches
pub struct ReplayLog {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl ReplayLog {
    /// Open (or create) the log under `dir`
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(LOG_FILE);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Append one abandoned batch and sync it to disk
    pub fn append(&self, mutations: &[Mutation]) -> Result<()> {
        let entry: Vec<ReplayMutation> = mutations.iter().map(ReplayMutation::from).collect();
        let payload = bincode::serialize(&entry)
            .map_err(|e| StratumError::Decode(format!("replay entry serialize: {e}")))?;
        let checksum = crc32fast::hash(&payload);

        let mut writer = self.writer.lock();
        writer.write_all(&(payload.len() as u32).to_be_bytes())?;
        writer.write_all(&checksum.to_be_bytes())?;
        writer.write_all(&payload)?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Read every intact batch back, in append order. A torn or corrupt
    /// tail ends the read with a warning rather than an error.
    pub fn read_all(&self) -> Result<Vec<Vec<Mutation>>> {
        let mut file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let mut batches = Vec::new();
        let mut pos = 0;
        while pos + 8 <= bytes.len() {
            let len = u32::from_be_bytes(bytes[pos..pos + 4].try_into().unwrap()) as usize;
            let checksum = u32::from_be_bytes(bytes[pos + 4..pos + 8].try_into().unwrap());
            let start = pos + 8;
            if start + len > bytes.len() {
                warn!("replay log ends mid-entry; dropping torn tail");
                break;
            }
            let payload = &bytes[start..start + len];
            if crc32fast::hash(payload) != checksum {
                warn!("replay log checksum mismatch; stopping read");
                break;
            }
            let entry: Vec<ReplayMutation> = bincode::deserialize(payload)
                .map_err(|e| StratumError::Decode(format!("replay entry deserialize: {e}")))?;
            batches.push(entry.into_iter().map(Mutation::from).collect());
            pos = start + len;
        }
        if pos < bytes.len() && pos + 8 > bytes.len() {
            warn!("replay log ends mid-header; dropping torn tail");
        }
        Ok(batches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn mutation(column: u8) -> Mutation {
        Mutation {
            table: Table::DataPoints,
            partition: Bytes::from_static(b"part"),
            column: Bytes::copy_from_slice(&[column]),
            value: Bytes::from_static(b"v"),
            ttl: Some(60),
        }
    }

    #[test]
    fn test_round_trip() {
        let dir = TempDir::new().unwrap();
        let log = ReplayLog::open(dir.path()).unwrap();

        log.append(&[mutation(1), mutation(2)]).unwrap();
        log.append(&[mutation(3)]).unwrap();

        let batches = log.read_all().unwrap();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0], vec![mutation(1), mutation(2)]);
        assert_eq!(batches[1], vec![mutation(3)]);
    }

    #[test]
    fn test_torn_tail_is_dropped() {
        let dir = TempDir::new().unwrap();
        {
            let log = ReplayLog::open(dir.path()).unwrap();
            log.append(&[mutation(1)]).unwrap();
        }
        // Simulate a crash mid-append
        let path = dir.path().join(LOG_FILE);
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0xDE, 0xAD, 0xBE]).unwrap();
        drop(file);

        let log = ReplayLog::open(dir.path()).unwrap();
        let batches = log.read_all().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0], vec![mutation(1)]);
    }

    #[test]
    fn test_empty_log() {
        let dir = TempDir::new().unwrap();
        let log = ReplayLog::open(dir.path()).unwrap();
        assert!(log.read_all().unwrap().is_empty());
    }
}
