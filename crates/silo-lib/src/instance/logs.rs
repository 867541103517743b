//! Log subsystem: tail-follow with rotation detection, structured
//! line parsing and synchronous fan-out to subscribers.

use anyhow::{bail, Context, Result};
use chrono::NaiveDateTime;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio_util::sync::CancellationToken;

const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;
const DEFAULT_MAX_FILES: u32 = 5;
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub time: NaiveDateTime,
    pub level: LogLevel,
    pub message: String,
    pub raw: String,
}

pub type LogHandler = Arc<dyn Fn(&LogEntry) + Send + Sync>;

pub struct LogManager {
    base_dir: PathBuf,
    handlers: Arc<RwLock<HashMap<String, Vec<LogHandler>>>>,
    max_file_size: u64,
    max_files: u32,
}

impl LogManager {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            handlers: Arc::new(RwLock::new(HashMap::new())),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            max_files: DEFAULT_MAX_FILES,
        }
    }

    pub fn set_max_file_size(&mut self, size: u64) {
        self.max_file_size = size;
    }

    pub fn set_max_files(&mut self, count: u32) {
        self.max_files = count;
    }

    fn log_path(&self, instance_name: &str) -> PathBuf {
        self.base_dir
            .join("instances")
            .join(instance_name)
            .join("factorio.log")
    }

    /// Register a handler for an instance's log entries.
    pub fn subscribe(&self, instance_name: &str, handler: LogHandler) {
        let mut handlers = self.handlers.write().expect("handlers lock");
        handlers
            .entry(instance_name.to_string())
            .or_default()
            .push(handler);
    }

    /// Remove a previously registered handler (matched by identity).
    pub fn unsubscribe(&self, instance_name: &str, handler: &LogHandler) {
        let mut handlers = self.handlers.write().expect("handlers lock");
        if let Some(list) = handlers.get_mut(instance_name) {
            list.retain(|h| !Arc::ptr_eq(h, handler));
            if list.is_empty() {
                handlers.remove(instance_name);
            }
        }
    }

    fn deliver(&self, instance_name: &str, entry: &LogEntry) {
        deliver_to(&self.handlers, instance_name, entry);
    }

    /// Follow an instance's log from its current end, delivering each
    /// appended line to the subscribers in order. The spawned task
    /// polls for growth, reopens across rotation, and exits on
    /// cancellation.
    pub async fn stream_logs(
        &self,
        cancel: &CancellationToken,
        instance_name: &str,
    ) -> Result<tokio::task::JoinHandle<()>> {
        let path = self.log_path(instance_name);
        let mut file = tokio::fs::File::open(&path)
            .await
            .with_context(|| format!("opening log file {:?}", path))?;
        let mut pos = file
            .seek(std::io::SeekFrom::End(0))
            .await
            .context("seeking log file")?;
        let mut identity = file_identity(&file.metadata().await.context("statting log file")?);

        let handlers = Arc::clone(&self.handlers);
        let cancel = cancel.clone();
        let name = instance_name.to_string();

        let handle = tokio::spawn(async move {
            let mut reader = BufReader::new(file);
            let mut line = String::new();

            loop {
                let read = tokio::select! {
                    _ = cancel.cancelled() => return,
                    read = reader.read_line(&mut line) => read,
                };

                match read {
                    Ok(0) => {
                        // EOF: wait for growth or a replaced file.
                        let meta = match tokio::fs::metadata(&path).await {
                            Ok(meta) => meta,
                            Err(_) => {
                                tokio::select! {
                                    _ = cancel.cancelled() => return,
                                    _ = tokio::time::sleep(POLL_INTERVAL) => continue,
                                }
                            }
                        };

                        if file_identity(&meta) != identity {
                            // Rotated: reopen and continue from the top.
                            match tokio::fs::File::open(&path).await {
                                Ok(new_file) => {
                                    identity = match new_file.metadata().await {
                                        Ok(meta) => file_identity(&meta),
                                        Err(_) => identity,
                                    };
                                    reader = BufReader::new(new_file);
                                    pos = 0;
                                    line.clear();
                                    continue;
                                }
                                Err(_) => {
                                    tokio::select! {
                                        _ = cancel.cancelled() => return,
                                        _ = tokio::time::sleep(POLL_INTERVAL) => continue,
                                    }
                                }
                            }
                        }

                        if meta.len() > pos {
                            continue;
                        }
                        tokio::select! {
                            _ = cancel.cancelled() => return,
                            _ = tokio::time::sleep(POLL_INTERVAL) => {}
                        }
                    }
                    Ok(n) => {
                        pos += n as u64;
                        if !line.ends_with('\n') {
                            // Partial line; wait for the rest.
                            continue;
                        }
                        let raw = line.trim_end_matches(['\n', '\r']);
                        let entry = parse_line(raw);
                        deliver_to(&handlers, &name, &entry);
                        line.clear();
                    }
                    Err(err) => {
                        log::warn!("log stream error for '{name}': {err}");
                        return;
                    }
                }
            }
        });

        Ok(handle)
    }

    /// Rotate `factorio.log` when it exceeds the size limit:
    /// `log.N -> log.N+1` from the oldest down, current becomes
    /// `log.1`, and a fresh empty log is created.
    pub fn rotate_logs(&self, instance_name: &str) -> Result<()> {
        let log_path = self.log_path(instance_name);

        let meta = match std::fs::metadata(&log_path) {
            Ok(meta) => meta,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err).context("statting log file"),
        };
        if meta.len() <= self.max_file_size {
            return Ok(());
        }

        for i in (1..=self.max_files).rev() {
            let old = rotated_path(&log_path, i);
            if i == self.max_files {
                let _ = std::fs::remove_file(&old);
            } else {
                let _ = std::fs::rename(&old, rotated_path(&log_path, i + 1));
            }
        }

        std::fs::rename(&log_path, rotated_path(&log_path, 1)).context("rotating log file")?;
        std::fs::write(&log_path, b"").context("creating new log file")?;
        Ok(())
    }

    /// Parse the whole current log and return the trailing
    /// `max_lines` entries.
    pub fn log_history(&self, instance_name: &str, max_lines: usize) -> Result<Vec<LogEntry>> {
        let log_path = self.log_path(instance_name);
        let data = std::fs::read_to_string(&log_path)
            .with_context(|| format!("opening log file {:?}", log_path))?;

        let mut entries: Vec<LogEntry> = data.lines().map(parse_line).collect();
        if entries.len() > max_lines {
            entries.drain(..entries.len() - max_lines);
        }
        Ok(entries)
    }
}

/// Synchronous fan-out under a read lock; delivery order follows scan
/// order.
fn deliver_to(
    handlers: &Arc<RwLock<HashMap<String, Vec<LogHandler>>>>,
    instance_name: &str,
    entry: &LogEntry,
) {
    let handlers = handlers.read().expect("handlers lock");
    if let Some(list) = handlers.get(instance_name) {
        for handler in list {
            handler(entry);
        }
    }
}

fn rotated_path(log_path: &Path, index: u32) -> PathBuf {
    PathBuf::from(format!("{}.{index}", log_path.display()))
}

#[cfg(unix)]
fn file_identity(meta: &std::fs::Metadata) -> (u64, u64) {
    use std::os::unix::fs::MetadataExt;
    (meta.dev(), meta.ino())
}

#[cfg(not(unix))]
fn file_identity(meta: &std::fs::Metadata) -> (u64, u64) {
    // Creation time is the best stand-in for inode identity here.
    let created = meta
        .created()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    (created, 0)
}

/// Parse a `YYYY-MM-DD HH:MM:SS [LEVEL] message` line. Anything else
/// becomes an info entry timestamped now with the whole line as the
/// message.
pub fn parse_line(line: &str) -> LogEntry {
    let mut entry = LogEntry {
        time: chrono::Utc::now().naive_utc(),
        level: LogLevel::Info,
        message: line.to_string(),
        raw: line.to_string(),
    };
    if line.is_empty() {
        return entry;
    }

    let parts: Vec<&str> = line.splitn(4, ' ').collect();
    if parts.len() >= 4 && parts[0].len() == 10 && parts[1].len() == 8 {
        let stamp = format!("{} {}", parts[0], parts[1]);
        if let Ok(time) = NaiveDateTime::parse_from_str(&stamp, "%Y-%m-%d %H:%M:%S") {
            entry.time = time;
            entry.level = match parts[2]
                .trim_matches(['[', ']'])
                .to_ascii_uppercase()
                .as_str()
            {
                "DEBUG" => LogLevel::Debug,
                "WARNING" | "WARN" => LogLevel::Warning,
                "ERROR" => LogLevel::Error,
                _ => LogLevel::Info,
            };
            entry.message = parts[3].to_string();
        }
    }

    entry
}
