//! Append-only record files fed from the dispatcher.
//!
//! [`RecordLogger`] owns the files and does the writing; [`SinkHandle`] runs
//! it on a dedicated blocking worker so channel read loops only enqueue.

use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;

use super::formatters::{formatter_for, SampleFormatter};
use crate::config::{LogFormat, LoggingConfig};
use crate::devices::Sample;
use crate::services::dispatcher::{DeviceEvent, EventHandler};
use crate::utils::error::TelemetryError;

const COMBINED: &str = "_combined";

struct OpenLog {
    path: PathBuf,
    writer: BufWriter<File>,
    formatter: Box<dyn SampleFormatter>,
    opened_at: DateTime<Utc>,
    bytes_written: u64,
    has_header: bool,
}

/// Writes samples to one combined file or one file per device, rotating by
/// size and age.
pub struct RecordLogger {
    output_dir: PathBuf,
    format: LogFormat,
    separate_devices: bool,
    max_file_bytes: u64,
    rotate_interval: Option<chrono::Duration>,
    compress_rotated: bool,
    files: HashMap<String, OpenLog>,
    entry_count: u64,
    usable: bool,
}

impl RecordLogger {
    pub fn new(config: &LoggingConfig) -> Result<Self, TelemetryError> {
        std::fs::create_dir_all(&config.output_dir).map_err(|e| {
            TelemetryError::SinkIoError(format!(
                "Cannot create log directory {}: {}",
                config.output_dir.display(),
                e
            ))
        })?;

        let max_file_bytes = (config.max_file_size_mb.max(0.0) * 1024.0 * 1024.0) as u64;
        let rotate_interval = config
            .rotate_interval_hours
            .map(|hours| chrono::Duration::milliseconds((hours.max(0.0) * 3_600_000.0) as i64));

        info!(
            "📝 Logging {} records to {}{}",
            config.format.extension(),
            config.output_dir.display(),
            if config.separate_devices { " (one file per device)" } else { "" }
        );

        Ok(Self {
            output_dir: config.output_dir.clone(),
            format: config.format,
            separate_devices: config.separate_devices,
            max_file_bytes,
            rotate_interval,
            compress_rotated: config.compress_rotated,
            files: HashMap::new(),
            entry_count: 0,
            usable: true,
        })
    }

    /// Write one record.
    ///
    /// An encoding or write error affects this record only. Failing to open a
    /// file leaves the logger unusable.
    pub fn append(&mut self, sample: &Sample) -> Result<(), TelemetryError> {
        if !self.usable {
            return Err(TelemetryError::SinkIoError("Logger is closed".to_string()));
        }

        let key = if self.separate_devices {
            sample.device_id.clone()
        } else {
            COMBINED.to_string()
        };

        let now = Utc::now();
        let mut carried = Vec::new();
        if self.rotation_due(&key, now) {
            carried = self.rotate(&key);
        } else if let Some(log) = self.files.get(&key) {
            if log.has_header && !log.formatter.fits(sample) {
                info!("🧩 New fields from {}, starting a file with a wider header", sample.device_id);
                carried = self.rotate(&key);
            }
        }

        if !self.files.contains_key(&key) {
            match self.open(&key, now) {
                Ok(log) => {
                    log.formatter.seed_columns(carried);
                    self.files.insert(key.clone(), log);
                }
                Err(e) => {
                    self.usable = false;
                    error!("❌ {}", e);
                    return Err(e);
                }
            }
        }

        let Some(log) = self.files.get_mut(&key) else {
            return Err(TelemetryError::SinkIoError(format!("No open file for {}", key)));
        };

        let mut text = String::new();
        if !log.has_header {
            if let Some(header) = log.formatter.header(sample) {
                text.push_str(&header);
                text.push('\n');
            }
        }
        text.push_str(&log.formatter.format_record(sample)?);
        text.push('\n');

        if let Err(e) = log.writer.write_all(text.as_bytes()) {
            let path = log.path.clone();
            // A half-written file is abandoned; the next record starts a new one
            self.files.remove(&key);
            return Err(TelemetryError::SinkIoError(format!(
                "Write to {} failed: {}",
                path.display(),
                e
            )));
        }

        log.has_header = true;
        log.bytes_written += text.len() as u64;
        self.entry_count += 1;
        Ok(())
    }

    fn rotation_due(&self, key: &str, now: DateTime<Utc>) -> bool {
        let Some(log) = self.files.get(key) else {
            return false;
        };
        if self.max_file_bytes > 0 && log.bytes_written >= self.max_file_bytes {
            return true;
        }
        matches!(self.rotate_interval, Some(interval) if now - log.opened_at >= interval)
    }

    /// Close the file for `key`, compressing it when configured. Returns the
    /// columns its header declared.
    fn rotate(&mut self, key: &str) -> Vec<String> {
        let Some(log) = self.files.remove(key) else {
            return Vec::new();
        };
        let columns = log.formatter.columns();
        let OpenLog { path, writer, .. } = log;

        if let Err(e) = writer.into_inner() {
            warn!("⚠️ Flush of {} before rotation failed: {}", path.display(), e.error());
            return columns;
        }
        info!("🔄 Rotated {}", path.display());

        if self.compress_rotated {
            match compress(&path) {
                Ok(gz_path) => debug!("Compressed {}", gz_path.display()),
                Err(e) => warn!("⚠️ Compression of {} failed: {}", path.display(), e),
            }
        }
        columns
    }

    fn open(&self, key: &str, now: DateTime<Utc>) -> Result<OpenLog, TelemetryError> {
        let stem = if key == COMBINED {
            format!("telemetry_{}", now.format("%Y%m%d_%H%M%S"))
        } else {
            format!("telemetry_{}_{}", sanitize(key), now.format("%Y%m%d_%H%M%S"))
        };
        let extension = self.format.extension();

        // Rotating twice within a second must not clobber the earlier file
        let mut suffix = 0;
        loop {
            let name = if suffix == 0 {
                format!("{}.{}", stem, extension)
            } else {
                format!("{}-{}.{}", stem, suffix, extension)
            };
            let path = self.output_dir.join(name);
            if gz_path_for(&path).exists() {
                suffix += 1;
                continue;
            }
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => {
                    debug!("Opened log file {}", path.display());
                    return Ok(OpenLog {
                        path,
                        writer: BufWriter::new(file),
                        formatter: formatter_for(self.format),
                        opened_at: now,
                        bytes_written: 0,
                        has_header: false,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => suffix += 1,
                Err(e) => {
                    return Err(TelemetryError::SinkIoError(format!(
                        "Cannot create {}: {}",
                        path.display(),
                        e
                    )))
                }
            }
        }
    }

    pub fn flush(&mut self) -> Result<(), TelemetryError> {
        for log in self.files.values_mut() {
            log.writer.flush().map_err(|e| {
                TelemetryError::SinkIoError(format!("Flush of {} failed: {}", log.path.display(), e))
            })?;
        }
        Ok(())
    }

    pub fn close(&mut self) -> Result<(), TelemetryError> {
        let result = self.flush();
        self.files.clear();
        self.usable = false;
        result
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    pub fn is_usable(&self) -> bool {
        self.usable
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Files in the output directory with this logger's extension, compressed
    /// or not, in the order they were written.
    pub fn log_files(&self) -> Result<Vec<PathBuf>, TelemetryError> {
        list_log_files(&self.output_dir, self.format)
    }
}

impl Drop for RecordLogger {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            warn!("⚠️ {}", e);
        }
    }
}

pub fn list_log_files(dir: &Path, format: LogFormat) -> Result<Vec<PathBuf>, TelemetryError> {
    let plain = format!(".{}", format.extension());
    let compressed = format!(".{}.gz", format.extension());
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            let name = file_name(path);
            path.is_file() && (name.ends_with(&plain) || name.ends_with(&compressed))
        })
        .collect();
    files.sort_by_key(|path| sequence_key(path, format));
    Ok(files)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

// `telemetry_a_20240501_120000-2.csv.gz` -> ("telemetry_a_20240501_120000", 2)
fn sequence_key(path: &Path, format: LogFormat) -> (String, u32) {
    let name = file_name(path);
    let uncompressed = name.strip_suffix(".gz").unwrap_or(&name);
    let stem = uncompressed
        .strip_suffix(&format!(".{}", format.extension()))
        .unwrap_or(uncompressed);
    match stem.rsplit_once('-') {
        Some((base, n)) if !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()) => {
            (base.to_string(), n.parse().unwrap_or(u32::MAX))
        }
        _ => (stem.to_string(), 0),
    }
}

fn gz_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".gz");
    PathBuf::from(name)
}

/// Replace `path` with a gzip copy at `<path>.gz`.
fn compress(path: &Path) -> std::io::Result<PathBuf> {
    let gz_path = gz_path_for(path);
    let mut input = File::open(path)?;
    let output = OpenOptions::new().write(true).create_new(true).open(&gz_path)?;
    let mut encoder = GzEncoder::new(BufWriter::new(output), Compression::default());
    std::io::copy(&mut input, &mut encoder)?;
    encoder.finish()?.flush()?;
    std::fs::remove_file(path)?;
    Ok(gz_path)
}

fn sanitize(device_id: &str) -> String {
    device_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect()
}

enum SinkMessage {
    Record(Sample),
    Flush,
    Close,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SinkReport {
    pub entries: u64,
    pub failures: u64,
    pub files: Vec<PathBuf>,
}

/// A [`RecordLogger`] running on its own blocking worker.
pub struct SinkHandle {
    tx: UnboundedSender<SinkMessage>,
    worker: JoinHandle<SinkReport>,
    failures: Arc<AtomicU64>,
}

impl SinkHandle {
    pub fn spawn(mut logger: RecordLogger) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let failures = Arc::new(AtomicU64::new(0));
        let failed = Arc::clone(&failures);

        let worker = tokio::task::spawn_blocking(move || {
            while let Some(message) = rx.blocking_recv() {
                match message {
                    SinkMessage::Record(sample) => {
                        if let Err(e) = logger.append(&sample) {
                            failed.fetch_add(1, Ordering::Relaxed);
                            warn!("⚠️ Dropped record from {}: {}", sample.device_id, e);
                            if !logger.is_usable() {
                                error!("❌ Sink is unusable, discarding further records");
                                break;
                            }
                        }
                        if rx.is_empty() {
                            if let Err(e) = logger.flush() {
                                warn!("⚠️ {}", e);
                            }
                        }
                    }
                    SinkMessage::Flush => {
                        if let Err(e) = logger.flush() {
                            warn!("⚠️ {}", e);
                        }
                    }
                    SinkMessage::Close => break,
                }
            }

            if let Err(e) = logger.close() {
                warn!("⚠️ {}", e);
            }
            let files = logger.log_files().unwrap_or_default();
            info!("💾 Sink closed after {} records", logger.entry_count());
            SinkReport {
                entries: logger.entry_count(),
                failures: failed.load(Ordering::Relaxed),
                files,
            }
        });

        Self { tx, worker, failures }
    }

    pub fn append(&self, sample: Sample) -> Result<(), TelemetryError> {
        self.tx
            .send(SinkMessage::Record(sample))
            .map_err(|_| TelemetryError::SinkIoError("Sink worker has stopped".to_string()))
    }

    pub fn flush(&self) -> Result<(), TelemetryError> {
        self.tx
            .send(SinkMessage::Flush)
            .map_err(|_| TelemetryError::SinkIoError("Sink worker has stopped".to_string()))
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Dispatcher handler that enqueues every parsed sample.
    pub fn handler(&self) -> Arc<dyn EventHandler> {
        Arc::new(SinkHandler {
            tx: self.tx.clone(),
        })
    }

    /// Write everything queued so far, then close the files.
    pub async fn close(self) -> Result<SinkReport, TelemetryError> {
        let _ = self.tx.send(SinkMessage::Close);
        self.worker
            .await
            .map_err(|e| TelemetryError::SinkIoError(format!("Sink worker failed: {}", e)))
    }
}

struct SinkHandler {
    tx: UnboundedSender<SinkMessage>,
}

impl EventHandler for SinkHandler {
    fn name(&self) -> &str {
        "record-logger"
    }

    fn handle(&self, _device_id: &str, event: &DeviceEvent) -> Result<(), TelemetryError> {
        if let DeviceEvent::Line { outcome, .. } = event {
            if let Some(sample) = outcome.sample() {
                self.tx
                    .send(SinkMessage::Record(sample.clone()))
                    .map_err(|_| TelemetryError::SinkIoError("Sink worker has stopped".to_string()))?;
            }
        }
        Ok(())
    }
}
