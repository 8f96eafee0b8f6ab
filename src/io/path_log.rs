//! Per-route path logs
//!
//! Every fix taken during an active route is appended to
//! `<routes_dir>/route_<route_id>_<user_id>.csv` and fsynced. A path log
//! whose route id has no ledger entry is the only trace an interrupted route
//! leaves behind, so this module also owns reading one back.

use crate::domain::journey::{PathLogEntry, RecoveredRoute};
use crate::domain::types::{CardId, RouteId};
use crate::error::{JourneyError, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const FILE_PREFIX: &str = "route_";
const FILE_SUFFIX: &str = ".csv";

/// File name for a route's path log
pub fn file_name(route_id: RouteId, user_id: &CardId) -> String {
    format!("{FILE_PREFIX}{route_id}_{user_id}{FILE_SUFFIX}")
}

/// Inverse of [`file_name`]
pub fn parse_file_name(name: &str) -> Result<(RouteId, CardId)> {
    let bad = || JourneyError::BadPathLogName { name: name.to_string() };

    let stem = name
        .strip_prefix(FILE_PREFIX)
        .and_then(|rest| rest.strip_suffix(FILE_SUFFIX))
        .ok_or_else(bad)?;
    let (route, user) = stem.split_once('_').ok_or_else(bad)?;
    if route.is_empty() || !route.bytes().all(|b| b.is_ascii_digit()) {
        return Err(bad());
    }
    let route_id = route.parse::<u64>().map(RouteId).map_err(|_| bad())?;
    // Ids are alphanumeric, so a further '_' is rejected here too
    let user_id = CardId::parse(user).filter(|id| id.as_str() == user).ok_or_else(bad)?;
    Ok((route_id, user_id))
}

/// Directory of per-route CSV logs
#[derive(Debug, Clone)]
pub struct PathLogStore {
    dir: PathBuf,
}

impl PathLogStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, route_id: RouteId, user_id: &CardId) -> PathBuf {
        self.dir.join(file_name(route_id, user_id))
    }

    /// Locate the path log for `route_id`, if one exists.
    ///
    /// Files that do not look like path logs are ignored; a `route_*.csv`
    /// name that does not decode, or two logs for the same route, are errors.
    pub fn find(&self, route_id: RouteId) -> Result<Option<PathBuf>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(&self.dir, e)),
        };

        let mut matches: Vec<(String, PathBuf)> = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| self.io_error(&self.dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(FILE_PREFIX) || !name.ends_with(FILE_SUFFIX) {
                debug!(name = %name, "path_log_scan_skipped");
                continue;
            }
            let (found_id, _) = parse_file_name(&name)?;
            if found_id == route_id {
                matches.push((name, entry.path()));
            }
        }

        match matches.len() {
            0 => Ok(None),
            1 => Ok(matches.pop().map(|(_, path)| path)),
            _ => Err(JourneyError::DuplicatePathLog {
                route_id,
                names: matches.into_iter().map(|(name, _)| name).collect(),
            }),
        }
    }

    /// Append one row, writing the header first if the file is new.
    /// The row is flushed and fsynced before returning.
    pub fn append(&self, route_id: RouteId, user_id: &CardId, entry: &PathLogEntry) -> Result<()> {
        let path = self.path_for(route_id, user_id);

        if !self.dir.exists() {
            fs::create_dir_all(&self.dir).map_err(|e| self.io_error(&self.dir, e))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| self.io_error(&path, e))?;
        let is_new = file.metadata().map_err(|e| self.io_error(&path, e))?.len() == 0;

        let mut buf = String::with_capacity(96);
        if is_new {
            buf.push_str(PathLogEntry::HEADER);
            buf.push('\n');
        }
        buf.push_str(&entry.to_csv_row());
        buf.push('\n');

        file.write_all(buf.as_bytes()).map_err(|e| self.io_error(&path, e))?;
        file.flush().map_err(|e| self.io_error(&path, e))?;
        file.sync_all().map_err(|e| self.io_error(&path, e))?;

        if is_new {
            self.sync_dir()?;
            info!(file = %path.display(), "path_log_created");
        }
        Ok(())
    }

    /// Rebuild the state of an interrupted route from its path log.
    ///
    /// The start fix comes from the first data row; the running total and the
    /// last known fix come from the final row. Nothing is inferred: a missing
    /// header, no data rows, an unterminated final row or an unparseable row
    /// all fail.
    pub fn load_recovery(&self, path: &Path) -> Result<RecoveredRoute> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| JourneyError::BadPathLogName { name: path.display().to_string() })?;
        let (route_id, user_id) = parse_file_name(&name)?;

        let content = fs::read_to_string(path).map_err(|e| self.io_error(path, e))?;
        let truncated = |reason: &str| JourneyError::TruncatedPathLog {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };

        if !content.ends_with('\n') {
            return Err(truncated("final row is not terminated"));
        }

        let mut lines = content.lines().enumerate().filter(|(_, l)| !l.trim().is_empty());
        match lines.next() {
            Some((_, header)) if header.trim_end_matches('\r') == PathLogEntry::HEADER => {}
            Some((idx, _)) => {
                return Err(JourneyError::MalformedPathLogRow {
                    path: path.to_path_buf(),
                    line: idx + 1,
                    reason: "missing header".to_string(),
                })
            }
            None => return Err(truncated("file is empty")),
        }

        let rows: Vec<(usize, &str)> = lines.collect();
        let (first, last) = match (rows.first(), rows.last()) {
            (Some(first), Some(last)) => (*first, *last),
            _ => return Err(truncated("no data rows")),
        };

        let parse = |(idx, row): (usize, &str)| {
            PathLogEntry::parse_csv_row(row).map_err(|reason| JourneyError::MalformedPathLogRow {
                path: path.to_path_buf(),
                line: idx + 1,
                reason,
            })
        };
        let first = parse(first)?;
        let last = parse(last)?;

        Ok(RecoveredRoute {
            route_id,
            user_id,
            start: first.sample,
            last: last.sample,
            total_distance: last.total_distance,
            rows: rows.len(),
        })
    }

    #[cfg(unix)]
    fn sync_dir(&self) -> Result<()> {
        File::open(&self.dir)
            .and_then(|dir| dir.sync_all())
            .map_err(|e| self.io_error(&self.dir, e))
    }

    #[cfg(not(unix))]
    fn sync_dir(&self) -> Result<()> {
        Ok(())
    }

    fn io_error(&self, path: &Path, source: io::Error) -> JourneyError {
        JourneyError::PathLogIo { path: path.to_path_buf(), source }
    }
}
