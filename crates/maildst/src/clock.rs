//! Virtual clock shared with the sandboxed services.
//!
//! The services run under a time-faking shim that reads the current
//! simulated time from a small text file. An empty or unparseable read makes
//! the shim fall back to the real wall clock, so the store must never be
//! observed empty or half written while the simulation updates it.
//!
//! Encoding: one timestamp per line, `%Y-%m-%d %H:%M:%S%.6f\n`. Readers take
//! the last complete (newline terminated) line.

use std::{
    fs::{self, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use parking_lot::Mutex;

use crate::rng::SimulationRng;

/// Simulated wall time, microsecond precision.
pub type Timestamp = NaiveDateTime;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

#[derive(Debug, thiserror::Error)]
pub enum ClockError {
    #[error("clock store {path:?} unavailable: {source}")]
    Unavailable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("clock store {path:?} holds no parseable timestamp: {content:?}")]
    Unparseable { path: PathBuf, content: String },
    #[error("failed writing clock store {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("simulated time overflow")]
    Overflow,
}

/// Durable single-writer, multi-reader cell holding the simulated time.
pub trait ClockStore: Send + Sync {
    fn read(&self) -> Result<Timestamp, ClockError>;

    /// Replaces the stored value. Concurrent readers must observe either the
    /// previous or the new value, never an empty or partial one.
    fn write(&self, ts: Timestamp) -> Result<(), ClockError>;

    /// Deletes the backing storage. Missing storage is not an error.
    fn remove(&self) -> Result<(), ClockError>;

    /// Human readable location, used in logs.
    fn location(&self) -> String;
}

pub fn encode(ts: &Timestamp) -> String {
    format!("{}\n", ts.format(TIMESTAMP_FORMAT))
}

/// Parses the store content, resolving to the last complete line.
///
/// Content without any newline is parsed as a whole so that hand-written
/// stores still work. A leading `@` (absolute start notation of the shim)
/// is accepted.
pub fn decode(content: &str) -> Option<Timestamp> {
    let line = match content.rfind('\n') {
        Some(end) => {
            let complete = &content[..end];
            complete.rsplit('\n').map(str::trim).find(|l| !l.is_empty())?
        }
        None => content.trim(),
    };
    let line = line.strip_prefix('@').unwrap_or(line);
    NaiveDateTime::parse_from_str(line, TIMESTAMP_FORMAT).ok()
}

/// File backed store read by the services' time shim.
#[derive(Debug)]
pub struct FileClockStore {
    path: PathBuf,
}

impl FileClockStore {
    /// Creates (or replaces) the store at `path` holding `initial`.
    pub fn create(path: impl Into<PathBuf>, initial: Timestamp) -> Result<Self, ClockError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| ClockError::Write {
                path: path.clone(),
                source,
            })?;
        }
        let store = Self { path };
        if store.path.exists() {
            store.write(initial)?;
        } else {
            let mut file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&store.path)
                .map_err(|source| store.write_err(source))?;
            file.write_all(encode(&initial).as_bytes())
                .and_then(|_| file.sync_all())
                .map_err(|source| store.write_err(source))?;
        }
        Ok(store)
    }

    /// Opens an existing store without modifying it.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_err(&self, source: io::Error) -> ClockError {
        ClockError::Write {
            path: self.path.clone(),
            source,
        }
    }
}

impl ClockStore for FileClockStore {
    fn read(&self) -> Result<Timestamp, ClockError> {
        let content = fs::read_to_string(&self.path).map_err(|source| ClockError::Unavailable {
            path: self.path.clone(),
            source,
        })?;
        decode(&content).ok_or_else(|| ClockError::Unparseable {
            path: self.path.clone(),
            content,
        })
    }

    fn write(&self, ts: Timestamp) -> Result<(), ClockError> {
        let line = encode(&ts);
        // no `create`: a store deleted behind our back is fatal, not recreated
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.path)
            .map_err(|source| ClockError::Unavailable {
                path: self.path.clone(),
                source,
            })?;

        // 1. append the new value after the old one, on a line of its own
        let appended_at = file
            .seek(SeekFrom::End(0))
            .and_then(|end| {
                let separate = end > 0 && !ends_with_newline(&mut file, end)?;
                if separate {
                    file.write_all(b"\n")?;
                }
                file.write_all(line.as_bytes())?;
                file.sync_all()?;
                Ok(end + u64::from(separate))
            })
            .map_err(|source| self.write_err(source))?;

        // 2. compact down to the new value. The head is overwritten first so
        // the appended copy stays the last complete line until the truncate.
        let new_len = line.len() as u64;
        if new_len > appended_at {
            // the head overlaps the appended copy, keep both lines for now
            return Ok(());
        }
        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.write_all(line.as_bytes()))
            .and_then(|_| file.set_len(new_len))
            .and_then(|_| file.sync_all())
            .map_err(|source| self.write_err(source))
    }

    fn remove(&self) -> Result<(), ClockError> {
        match fs::remove_file(&self.path) {
            Err(err) if err.kind() != io::ErrorKind::NotFound => Err(self.write_err(err)),
            _ => Ok(()),
        }
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

fn ends_with_newline(file: &mut fs::File, len: u64) -> io::Result<bool> {
    let mut last = [0u8];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    file.seek(SeekFrom::End(0))?;
    Ok(last[0] == b'\n')
}

/// In-process store, for runs that have no external time readers.
#[derive(Debug)]
pub struct MemoryClockStore {
    value: Mutex<Option<Timestamp>>,
}

impl MemoryClockStore {
    pub fn new(initial: Timestamp) -> Self {
        Self {
            value: Mutex::new(Some(initial)),
        }
    }
}

impl ClockStore for MemoryClockStore {
    fn read(&self) -> Result<Timestamp, ClockError> {
        (*self.value.lock()).ok_or_else(|| ClockError::Unavailable {
            path: PathBuf::from("<memory>"),
            source: io::Error::from(io::ErrorKind::NotFound),
        })
    }

    fn write(&self, ts: Timestamp) -> Result<(), ClockError> {
        *self.value.lock() = Some(ts);
        Ok(())
    }

    fn remove(&self) -> Result<(), ClockError> {
        *self.value.lock() = None;
        Ok(())
    }

    fn location(&self) -> String {
        "<memory>".to_owned()
    }
}

/// The single authoritative simulated timestamp of a run.
///
/// Every read and write goes through one mutex, so a read-modify-write such
/// as [`VirtualClock::advance`] never loses a concurrent update.
pub struct VirtualClock {
    store: Box<dyn ClockStore>,
    lock: Mutex<()>,
}

impl VirtualClock {
    pub fn new(store: impl ClockStore + 'static) -> Self {
        Self {
            store: Box::new(store),
            lock: Mutex::new(()),
        }
    }

    pub fn get(&self) -> Result<Timestamp, ClockError> {
        let _guard = self.lock.lock();
        self.store.read()
    }

    pub fn set(&self, ts: Timestamp) -> Result<(), ClockError> {
        let _guard = self.lock.lock();
        self.store.write(ts)?;
        tracing::debug!(time = %ts.format(TIMESTAMP_FORMAT), "Updated shared time");
        Ok(())
    }

    /// Moves the clock forward by `by` and returns the new time.
    pub fn advance(&self, by: Duration) -> Result<Timestamp, ClockError> {
        let by = TimeDelta::from_std(by).map_err(|_| ClockError::Overflow)?;
        let _guard = self.lock.lock();
        let next = self
            .store
            .read()?
            .checked_add_signed(by)
            .ok_or(ClockError::Overflow)?;
        self.store.write(next)?;
        tracing::debug!(time = %next.format(TIMESTAMP_FORMAT), "Advanced shared time");
        Ok(next)
    }

    /// Moves the clock to `target` unless it is already past it.
    pub fn advance_to(&self, target: Timestamp) -> Result<Timestamp, ClockError> {
        let _guard = self.lock.lock();
        let current = self.store.read()?;
        if target <= current {
            return Ok(current);
        }
        self.store.write(target)?;
        tracing::debug!(time = %target.format(TIMESTAMP_FORMAT), "Fast-forwarded shared time");
        Ok(target)
    }

    pub fn remove(&self) -> Result<(), ClockError> {
        let _guard = self.lock.lock();
        self.store.remove()
    }

    pub fn location(&self) -> String {
        self.store.location()
    }
}

impl std::fmt::Debug for VirtualClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualClock")
            .field("store", &self.store.location())
            .finish()
    }
}

/// Draws a start time: a uniform day in `[start_year-01-01, end_year-12-31]`
/// plus a uniform second of that day.
pub fn random_start(rng: &SimulationRng, start_year: i32, end_year: i32) -> Option<Timestamp> {
    let start = NaiveDate::from_ymd_opt(start_year, 1, 1)?;
    let end = NaiveDate::from_ymd_opt(end_year, 12, 31)?;
    let days = (end - start).num_days();
    if days < 0 {
        return None;
    }
    let day = rng.gen_range(0..=days);
    let second = rng.gen_range(0..24 * 60 * 60i64);
    start
        .and_hms_opt(0, 0, 0)?
        .checked_add_signed(TimeDelta::days(day) + TimeDelta::seconds(second))
}
