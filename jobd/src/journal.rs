//! HMAC-chained audit journal for dispatch and handshake events.
//!
//! Each line is one JSON [`JEntry`]. The entry hash covers the previous
//! hash, so editing or dropping a line breaks verification of every line
//! after it.

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose, Engine as _};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

pub const EV_DISPATCH: &str = "DISPATCH";
pub const EV_LAUNCH_FAILED: &str = "LAUNCH_FAILED";
pub const EV_BOUND: &str = "BOUND";
pub const EV_REJECTED: &str = "REJECTED";
pub const EV_LOST: &str = "LOST";
pub const EV_ABORT: &str = "ABORT";

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct JEntry {
    pub seq: u64,
    pub ts: u64,
    pub ev: String,
    /// Job id, or empty for events not tied to a job (unknown codes).
    pub job: String,
    pub slot: Option<u64>,
    pub meta: serde_json::Value,
    pub prev: String,
    pub hash: String,
}

struct ChainState {
    file: File,
    seq: u64,
    last_hash: String,
}

pub struct Journal {
    key: Vec<u8>,
    state: Mutex<ChainState>,
}

impl Journal {
    /// Open or create the journal. An existing file is continued from its
    /// last entry.
    pub fn open(path: &Path, key: &[u8]) -> Result<Self> {
        let (seq, last_hash) = match File::open(path) {
            Ok(existing) => last_link(existing)?,
            Err(_) => (0, String::new()),
        };
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            key: key.to_vec(),
            state: Mutex::new(ChainState {
                file,
                seq,
                last_hash,
            }),
        })
    }

    pub fn append(
        &self,
        event: &str,
        job: &str,
        slot: Option<u64>,
        meta: serde_json::Value,
    ) -> Result<String> {
        let ts = now_ts();
        let mut state = self
            .state
            .lock()
            .map_err(|_| anyhow!("journal lock poisoned"))?;

        let seq = state.seq + 1;
        let prev = state.last_hash.clone();
        let hash = sign(&self.key, &prev, seq, ts, event, job, slot, &meta)?;

        let entry = JEntry {
            seq,
            ts,
            ev: event.to_string(),
            job: job.to_string(),
            slot,
            meta,
            prev,
            hash: hash.clone(),
        };

        let line = serde_json::to_string(&entry)? + "\n";
        state.file.write_all(line.as_bytes())?;
        state.file.sync_data()?;

        state.seq = seq;
        state.last_hash = hash.clone();
        Ok(hash)
    }

    pub fn current_seq(&self) -> u64 {
        self.state.lock().map(|state| state.seq).unwrap_or_default()
    }
}

pub struct JournalVerifier {
    key: Vec<u8>,
}

impl JournalVerifier {
    pub fn new(key: &[u8]) -> Self {
        Self { key: key.to_vec() }
    }

    /// False on the first line that is unparseable, out of sequence, or
    /// carries a hash that does not match.
    pub fn verify_file(&self, path: &Path) -> Result<bool> {
        let reader = BufReader::new(File::open(path)?);

        let mut prev_hash = String::new();
        let mut expected_seq = 1u64;

        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }

            let entry: JEntry = match serde_json::from_str(&line) {
                Ok(entry) => entry,
                Err(_) => return Ok(false),
            };
            if entry.seq != expected_seq || entry.prev != prev_hash {
                return Ok(false);
            }

            let expected_hash = sign(
                &self.key,
                &prev_hash,
                entry.seq,
                entry.ts,
                &entry.ev,
                &entry.job,
                entry.slot,
                &entry.meta,
            )?;
            if entry.hash != expected_hash {
                return Ok(false);
            }

            prev_hash = entry.hash;
            expected_seq += 1;
        }

        Ok(true)
    }
}

#[allow(clippy::too_many_arguments)]
fn sign(
    key: &[u8],
    prev: &str,
    seq: u64,
    ts: u64,
    event: &str,
    job: &str,
    slot: Option<u64>,
    meta: &serde_json::Value,
) -> Result<String> {
    let slot = slot.map(|s| s.to_string()).unwrap_or_default();
    let canonical = format!("{}|{}|{}|{}|{}", seq, ts, event, job, slot);

    let mut mac = HmacSha256::new_from_slice(key)?;
    mac.update(prev.as_bytes());
    mac.update(canonical.as_bytes());
    mac.update(serde_json::to_string(meta)?.as_bytes());
    Ok(general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}

fn last_link(file: File) -> Result<(u64, String)> {
    let mut last = None;
    for line in BufReader::new(file).lines() {
        let line = line?;
        if !line.trim().is_empty() {
            last = Some(line);
        }
    }
    match last {
        Some(line) => {
            let entry: JEntry = serde_json::from_str(&line)
                .map_err(|err| anyhow!("journal tail is not a valid entry: {}", err))?;
            Ok((entry.seq, entry.hash))
        }
        None => Ok((0, String::new())),
    }
}

fn now_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
