//! File-backed run registry.
//!
//! Append-only JSONL log of run events:
//! - one JSON record per line,
//! - hash-chained records (a rewritten or dropped line breaks the chain),
//! - deterministic record hash domain separation.
//!
//! The log is replayed and verified on open; completion markers and run records are then
//! served from memory.

use crate::orchestrator::report::CommissionRun;
use crate::types::{ParticipantId, RunId};
use crate::{McreError, Result, RunKey, RunRegistry};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const RUN_LOG_RECORD_DOMAIN_V1: &[u8] = b"MCRE_RUN_LOG_RECORD_V1";

const GENESIS_HASH: [u8; 32] = [0u8; 32];

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunLogEvent {
    /// Completion marker: `participant` was credited for `key`.
    Processed {
        key: RunKey,
        participant: ParticipantId,
    },
    /// Final record of a run, failed runs included.
    Completed { run: CommissionRun },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunLogRecordV1 {
    pub record_version: u32,
    pub recorded_at: DateTime<Utc>,
    /// Hex-encoded SHA-256 of the previous record (zeros for the first).
    pub prev_record_hash: String,
    pub record_hash: String,
    pub event: RunLogEvent,
}

pub fn record_hash_v1(
    prev_record_hash: &[u8; 32],
    recorded_at: DateTime<Utc>,
    event: &RunLogEvent,
) -> Result<[u8; 32]> {
    let event_bytes = serde_json::to_vec(event)
        .map_err(|e| McreError::Storage(format!("failed to serialize run log event: {e}")))?;

    let mut bytes = Vec::with_capacity(64 + event_bytes.len());
    bytes.extend_from_slice(RUN_LOG_RECORD_DOMAIN_V1);
    bytes.extend_from_slice(&1u32.to_le_bytes());
    bytes.extend_from_slice(&recorded_at.timestamp_millis().to_le_bytes());
    bytes.extend_from_slice(prev_record_hash);
    bytes.extend_from_slice(&event_bytes);

    Ok(Sha256::digest(&bytes).into())
}

#[derive(Default)]
struct LogState {
    last_hash: [u8; 32],
    runs: Vec<CommissionRun>,
    processed: HashMap<RunKey, BTreeSet<ParticipantId>>,
    next_run_id: u64,
}

impl LogState {
    fn apply(&mut self, event: RunLogEvent) {
        match event {
            RunLogEvent::Processed { key, participant } => {
                self.processed.entry(key).or_default().insert(participant);
            }
            RunLogEvent::Completed { run } => {
                self.next_run_id = self.next_run_id.max(run.id.0);
                self.runs.push(run);
            }
        }
    }
}

/// Hash-chained JSONL implementation of [`RunRegistry`].
pub struct FileRunRegistry {
    path: PathBuf,
    state: Mutex<LogState>,
}

impl FileRunRegistry {
    /// Open (or create on first append) the log at `path`, verifying the whole chain.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let mut state = LogState {
            last_hash: GENESIS_HASH,
            ..Default::default()
        };

        if path.exists() {
            let file = File::open(&path)
                .map_err(|e| McreError::Storage(format!("failed to open run log: {e}")))?;
            for (n, line) in BufReader::new(file).lines().enumerate() {
                let line =
                    line.map_err(|e| McreError::Storage(format!("failed to read run log: {e}")))?;
                if line.trim().is_empty() {
                    continue;
                }
                let record: RunLogRecordV1 = serde_json::from_str(&line).map_err(|e| {
                    McreError::Storage(format!("run log line {}: invalid record: {e}", n + 1))
                })?;
                verify(&state.last_hash, &record)
                    .map_err(|msg| McreError::Storage(format!("run log line {}: {msg}", n + 1)))?;
                state.last_hash = decode_hash(&record.record_hash)
                    .map_err(|msg| McreError::Storage(format!("run log line {}: {msg}", n + 1)))?;
                state.apply(record.event);
            }
        }

        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn last_record_hash(&self) -> Result<String> {
        let state = self
            .state
            .lock()
            .map_err(|_| McreError::Storage("Run log lock poisoned".into()))?;
        Ok(hex::encode(state.last_hash))
    }

    fn append(&self, event: RunLogEvent) -> Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| McreError::Storage("Run log lock poisoned".into()))?;

        let recorded_at = Utc::now();
        let record_hash = record_hash_v1(&state.last_hash, recorded_at, &event)?;
        let record = RunLogRecordV1 {
            record_version: 1,
            recorded_at,
            prev_record_hash: hex::encode(state.last_hash),
            record_hash: hex::encode(record_hash),
            event,
        };

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| McreError::Storage(format!("failed to open run log: {e}")))?;
        let mut line = serde_json::to_vec(&record)
            .map_err(|e| McreError::Storage(format!("failed to serialize run log record: {e}")))?;
        line.push(b'\n');
        file.write_all(&line)
            .map_err(|e| McreError::Storage(format!("failed to write run log record: {e}")))?;
        file.sync_all()
            .map_err(|e| McreError::Storage(format!("failed to sync run log: {e}")))?;

        state.last_hash = record_hash;
        state.apply(record.event);
        Ok(())
    }
}

fn decode_hash(s: &str) -> std::result::Result<[u8; 32], String> {
    let bytes = hex::decode(s).map_err(|e| format!("bad hash encoding: {e}"))?;
    <[u8; 32]>::try_from(bytes.as_slice()).map_err(|_| "hash is not 32 bytes".to_string())
}

fn verify(prev: &[u8; 32], record: &RunLogRecordV1) -> std::result::Result<(), String> {
    if record.record_version != 1 {
        return Err(format!("unsupported record version {}", record.record_version));
    }
    if decode_hash(&record.prev_record_hash)? != *prev {
        return Err("previous hash does not match chain head".into());
    }
    let expected = record_hash_v1(prev, record.recorded_at, &record.event)
        .map_err(|e| e.to_string())?;
    if decode_hash(&record.record_hash)? != expected {
        return Err("record hash mismatch".into());
    }
    Ok(())
}

impl RunRegistry for FileRunRegistry {
    fn find_completed(&self, key: &RunKey) -> Result<Option<CommissionRun>> {
        let state = self
            .state
            .lock()
            .map_err(|_| McreError::Storage("Run log lock poisoned".into()))?;
        Ok(state
            .runs
            .iter()
            .rev()
            .find(|r| r.key == *key && r.status.is_success())
            .cloned())
    }

    fn processed(&self, key: &RunKey) -> Result<BTreeSet<ParticipantId>> {
        let state = self
            .state
            .lock()
            .map_err(|_| McreError::Storage("Run log lock poisoned".into()))?;
        Ok(state.processed.get(key).cloned().unwrap_or_default())
    }

    fn mark_processed(&self, key: &RunKey, participant: ParticipantId) -> Result<()> {
        self.append(RunLogEvent::Processed {
            key: *key,
            participant,
        })
    }

    fn persist(&self, run: &CommissionRun) -> Result<()> {
        self.append(RunLogEvent::Completed { run: run.clone() })
    }

    fn next_run_id(&self) -> Result<RunId> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| McreError::Storage("Run log lock poisoned".into()))?;
        state.next_run_id += 1;
        Ok(RunId(state.next_run_id))
    }
}
