//! Route ledger - append-only JSONL log of completed routes
//!
//! One `RouteRecord` per line. The controller is the only writer; every
//! append is flushed and fsynced before the in-memory journey is dropped.

use crate::domain::journey::RouteRecord;
use crate::domain::types::RouteId;
use crate::error::{JourneyError, Result};
use serde::Deserialize;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Bytes read per step when scanning backwards for the final line
const TAIL_CHUNK: u64 = 512;

#[derive(Deserialize)]
struct RouteIdOnly {
    route_id: RouteId,
}

/// Append-only ledger of completed routes
#[derive(Debug, Clone)]
pub struct Ledger {
    path: PathBuf,
}

impl Ledger {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Route id of the final ledger line, `None` if the ledger is empty or absent.
    ///
    /// Only the final line is read.
    pub fn last_route_id(&self) -> Result<Option<RouteId>> {
        let line = read_last_line(&self.path).map_err(|e| self.io_error(e))?;
        match line {
            None => Ok(None),
            Some(line) => {
                let parsed: RouteIdOnly = serde_json::from_str(&line).map_err(|e| {
                    JourneyError::CorruptLedger {
                        path: self.path.clone(),
                        reason: format!("final line: {e}"),
                    }
                })?;
                Ok(Some(parsed.route_id))
            }
        }
    }

    /// Id for the next route: last route id + 1, or 1 for an empty ledger
    pub fn next_route_id(&self) -> Result<RouteId> {
        Ok(self.last_route_id()?.map_or(RouteId::FIRST, RouteId::next))
    }

    /// Whether a completed route with this id has been recorded
    pub fn contains(&self, route_id: RouteId) -> Result<bool> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(self.io_error(e)),
        };

        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| self.io_error(e))?;
            if line.trim().is_empty() {
                continue;
            }
            let parsed: RouteIdOnly =
                serde_json::from_str(&line).map_err(|e| JourneyError::CorruptLedger {
                    path: self.path.clone(),
                    reason: format!("line {}: {e}", idx + 1),
                })?;
            if parsed.route_id == route_id {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Append one record as a JSON line, then flush and fsync
    pub fn append(&self, record: &RouteRecord) -> Result<()> {
        let mut line = serde_json::to_string(record).map_err(|e| JourneyError::CorruptLedger {
            path: self.path.clone(),
            reason: format!("record not serializable: {e}"),
        })?;
        line.push('\n');

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| self.io_error(e))?;
        file.write_all(line.as_bytes()).map_err(|e| self.io_error(e))?;
        file.flush().map_err(|e| self.io_error(e))?;
        file.sync_all().map_err(|e| self.io_error(e))?;

        info!(
            route_id = %record.route_id,
            user_id = %record.user_id,
            distance_m = %record.distance,
            "route_recorded"
        );
        debug!(file = %self.path.display(), bytes = %line.len(), "ledger_written");
        Ok(())
    }

    /// All completed routes, oldest first. A missing ledger is empty.
    pub fn records(&self) -> Result<Vec<RouteRecord>> {
        self.raw_records()?
            .into_iter()
            .enumerate()
            .map(|(idx, value)| {
                serde_json::from_value(value).map_err(|e| JourneyError::CorruptLedger {
                    path: self.path.clone(),
                    reason: format!("record {}: {e}", idx + 1),
                })
            })
            .collect()
    }

    /// Records whose `field` equals `value`, compared as text
    /// (`route_id=3` and `user_id=780870559455` both match).
    pub fn query(&self, field: &str, value: &str) -> Result<Vec<serde_json::Value>> {
        Ok(self
            .raw_records()?
            .into_iter()
            .filter(|record| match record.get(field) {
                Some(serde_json::Value::String(s)) => s == value,
                Some(other) => other.to_string() == value,
                None => false,
            })
            .collect())
    }

    /// Every ledger line as untyped JSON
    pub fn raw_records(&self) -> Result<Vec<serde_json::Value>> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.io_error(e)),
        };

        let mut records = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(|e| self.io_error(e))?;
            if line.trim().is_empty() {
                continue;
            }
            let value = serde_json::from_str(&line).map_err(|e| JourneyError::CorruptLedger {
                path: self.path.clone(),
                reason: format!("line {}: {e}", idx + 1),
            })?;
            records.push(value);
        }
        Ok(records)
    }

    fn io_error(&self, source: io::Error) -> JourneyError {
        JourneyError::LedgerIo { path: self.path.clone(), source }
    }
}

/// Read the final non-blank line of a file by scanning backwards from EOF.
fn read_last_line(path: &Path) -> io::Result<Option<String>> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };

    let mut pos = file.metadata()?.len();
    let mut tail: Vec<u8> = Vec::new();

    while pos > 0 {
        let read_len = TAIL_CHUNK.min(pos);
        pos -= read_len;
        file.seek(SeekFrom::Start(pos))?;
        let mut chunk = vec![0u8; read_len as usize];
        file.read_exact(&mut chunk)?;
        chunk.extend_from_slice(&tail);
        tail = chunk;

        let content_end = trimmed_end(&tail);
        if content_end == 0 {
            continue;
        }
        if let Some(newline) = tail[..content_end].iter().rposition(|&b| b == b'\n') {
            return Ok(Some(decode_line(&tail[newline + 1..content_end])));
        }
    }

    let content_end = trimmed_end(&tail);
    if content_end == 0 {
        return Ok(None);
    }
    Ok(Some(decode_line(&tail[..content_end])))
}

fn trimmed_end(bytes: &[u8]) -> usize {
    bytes.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(0, |i| i + 1)
}

fn decode_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim().to_string()
}
