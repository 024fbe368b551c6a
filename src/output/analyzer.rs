//! Replay persisted records and summarize them.

use chrono::{DateTime, Utc};
use flate2::read::MultiGzDecoder;
use log::{info, warn};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::str::FromStr;

use super::formatters::{csv_split, JsonRecord};
use crate::devices::{FieldValue, Sample, SampleFields};
use crate::utils::error::TelemetryError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldStats {
    pub count: usize,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub avg: Option<f64>,
    /// Sample standard deviation, present from two values on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spread: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub total_entries: usize,
    pub devices: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRange>,
    pub fields: BTreeMap<String, FieldStats>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisSummary {
    pub overall: Summary,
    pub per_device: BTreeMap<String, Summary>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Json,
    Text,
}

impl FromStr for ExportFormat {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ExportFormat::Json),
            "text" | "txt" => Ok(ExportFormat::Text),
            other => Err(TelemetryError::ConfigError(format!("Unknown export format: {}", other))),
        }
    }
}

/// Display unit for well-known fields.
pub fn unit_for(field: &str) -> Option<&'static str> {
    match field {
        "rssi" | "noise_floor" => Some("dBm"),
        "jitter" => Some("ms"),
        f if f.starts_with("latency") => Some("ms"),
        "packet_loss" => Some("%"),
        "tx_rate" | "rx_rate" => Some("Kbps"),
        "download_speed" | "upload_speed" | "link_speed" => Some("Mbps"),
        _ => None,
    }
}

fn is_gzip(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some("gz")
}

/// Load a record file, choosing the decoder from its extension. A trailing
/// `.gz` is decompressed transparently.
pub fn load<P: AsRef<Path>>(path: P) -> Result<Vec<Sample>, TelemetryError> {
    let path = path.as_ref();
    let inner = if is_gzip(path) {
        path.file_stem().map(Path::new)
    } else {
        Some(path)
    };
    match inner.and_then(Path::extension).and_then(|e| e.to_str()) {
        Some("jsonl") | Some("json") => load_jsonl(path),
        Some("csv") => load_csv(path),
        _ => Err(TelemetryError::InvalidRecord(format!(
            "Cannot load {}: only .jsonl and .csv records (optionally .gz) can be replayed",
            path.display()
        ))),
    }
}

fn open_records(path: &Path) -> Result<Box<dyn BufRead>, TelemetryError> {
    let file = File::open(path).map_err(|e| {
        TelemetryError::SinkIoError(format!("Cannot open {}: {}", path.display(), e))
    })?;
    if is_gzip(path) {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

pub fn load_jsonl<P: AsRef<Path>>(path: P) -> Result<Vec<Sample>, TelemetryError> {
    let path = path.as_ref();
    let samples = load_records(open_records(path)?)?;
    info!("📂 Loaded {} records from {}", samples.len(), path.display());
    Ok(samples)
}

/// Decode JSON Lines records. Blank lines are ignored and malformed lines are
/// skipped with a warning.
pub fn load_records<R: BufRead>(reader: R) -> Result<Vec<Sample>, TelemetryError> {
    let mut samples = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<JsonRecord>(line) {
            Ok(record) => samples.push(Sample::from(record)),
            Err(e) => warn!("⚠️ Skipping record on line {}: {}", index + 1, e),
        }
    }
    Ok(samples)
}

/// Load a CSV file written by the sink. Empty cells are absent fields; other
/// cells are coerced the same way the line parser coerces values.
pub fn load_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Sample>, TelemetryError> {
    let path = path.as_ref();
    let mut lines = open_records(path)?.lines();

    let header = match lines.next() {
        Some(line) => csv_split(line?.trim_end()),
        None => return Ok(Vec::new()),
    };
    let device_col = header.iter().position(|c| c == "device_id");
    let time_col = header.iter().position(|c| c == "timestamp");
    let (Some(device_col), Some(time_col)) = (device_col, time_col) else {
        return Err(TelemetryError::InvalidRecord(format!(
            "{}: header lacks device_id/timestamp columns",
            path.display()
        )));
    };

    let mut samples = Vec::new();
    for (index, line) in lines.enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let cells = csv_split(line.trim_end_matches(['\r', '\n']));

        let timestamp = match cells
            .get(time_col)
            .map(|t| DateTime::parse_from_rfc3339(t))
        {
            Some(Ok(t)) => t.with_timezone(&Utc),
            _ => {
                warn!("⚠️ Skipping CSV row {}: bad timestamp", index + 2);
                continue;
            }
        };
        let device_id = cells.get(device_col).cloned().unwrap_or_default();

        let fields: SampleFields = header
            .iter()
            .zip(cells.iter())
            .enumerate()
            .filter(|(i, (_, cell))| *i != device_col && *i != time_col && !cell.is_empty())
            .map(|(_, (column, cell))| (column.clone(), FieldValue::coerce(cell)))
            .collect();

        samples.push(Sample::new(device_id, timestamp, fields));
    }

    info!("📂 Loaded {} CSV rows from {}", samples.len(), path.display());
    Ok(samples)
}

fn stats_of(values: impl Iterator<Item = f64>) -> FieldStats {
    let values: Vec<f64> = values.collect();
    let count = values.len();
    if count == 0 {
        return FieldStats {
            count,
            min: None,
            max: None,
            avg: None,
            spread: None,
        };
    }

    let sum: f64 = values.iter().sum();
    let avg = sum / count as f64;
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let spread = (count >= 2).then(|| {
        let variance = values.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / (count - 1) as f64;
        variance.sqrt()
    });

    FieldStats {
        count,
        min: Some(min),
        max: Some(max),
        avg: Some(avg),
        spread,
    }
}

/// Statistics of one numeric field, over one device or all of them.
///
/// Samples without the field, or with a non-numeric value for it, are not
/// counted.
pub fn statistics(samples: &[Sample], field: &str, device_id: Option<&str>) -> FieldStats {
    stats_of(
        samples
            .iter()
            .filter(|s| device_id.map_or(true, |id| s.device_id == id))
            .filter_map(|s| s.numeric(field)),
    )
}

fn summary_of<'a>(samples: impl Iterator<Item = &'a Sample> + Clone) -> Summary {
    let devices: BTreeSet<&str> = samples.clone().map(|s| s.device_id.as_str()).collect();
    let numeric_fields: BTreeSet<&str> = samples
        .clone()
        .flat_map(|s| s.fields.iter())
        .filter(|(_, v)| v.is_numeric())
        .map(|(k, _)| k.as_str())
        .collect();

    let fields = numeric_fields
        .into_iter()
        .map(|field| {
            let stats = stats_of(samples.clone().filter_map(|s| s.numeric(field)));
            (field.to_string(), stats)
        })
        .collect();

    let start = samples.clone().map(|s| s.timestamp).min();
    let end = samples.clone().map(|s| s.timestamp).max();
    let time_range = start.zip(end).map(|(start, end)| TimeRange {
        start,
        end,
        duration_seconds: (end - start).num_milliseconds() as f64 / 1000.0,
    });

    Summary {
        total_entries: samples.count(),
        devices: devices.into_iter().map(str::to_string).collect(),
        time_range,
        fields,
    }
}

pub fn summarize(samples: &[Sample]) -> AnalysisSummary {
    let device_ids: BTreeSet<&str> = samples.iter().map(|s| s.device_id.as_str()).collect();
    let per_device = device_ids
        .into_iter()
        .map(|id| {
            let summary = summary_of(samples.iter().filter(move |s| s.device_id == id));
            (id.to_string(), summary)
        })
        .collect();

    AnalysisSummary {
        overall: summary_of(samples.iter()),
        per_device,
    }
}

fn format_value(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{:.2}", v))
}

fn write_summary_text(out: &mut String, title: &str, summary: &Summary) {
    let _ = writeln!(out, "{}", title);
    let _ = writeln!(out, "{}", "-".repeat(title.len()));
    let _ = writeln!(out, "Entries: {}", summary.total_entries);
    let _ = writeln!(out, "Devices: {}", summary.devices.join(", "));
    if let Some(range) = &summary.time_range {
        let _ = writeln!(
            out,
            "Time range: {} .. {} ({:.1}s)",
            range.start.format("%Y-%m-%d %H:%M:%S"),
            range.end.format("%Y-%m-%d %H:%M:%S"),
            range.duration_seconds
        );
    }
    for (field, stats) in &summary.fields {
        let unit = unit_for(field).map(|u| format!(" {}", u)).unwrap_or_default();
        let _ = write!(
            out,
            "  {}: min {}{}, avg {}{}, max {}{} ({} samples",
            field,
            format_value(stats.min),
            unit,
            format_value(stats.avg),
            unit,
            format_value(stats.max),
            unit,
            stats.count
        );
        if let Some(spread) = stats.spread {
            let _ = write!(out, ", spread {:.2}{}", spread, unit);
        }
        let _ = writeln!(out, ")");
    }
    out.push('\n');
}

pub fn render_text(summary: &AnalysisSummary) -> String {
    let mut out = String::new();
    write_summary_text(&mut out, "All devices", &summary.overall);
    for (device_id, device_summary) in &summary.per_device {
        write_summary_text(&mut out, &format!("Device {}", device_id), device_summary);
    }
    out
}

pub fn export_summary<P: AsRef<Path>>(
    summary: &AnalysisSummary,
    path: P,
    format: ExportFormat,
) -> Result<(), TelemetryError> {
    let path = path.as_ref();
    let content = match format {
        ExportFormat::Json => serde_json::to_string_pretty(summary)?,
        ExportFormat::Text => render_text(summary),
    };
    std::fs::write(path, content).map_err(|e| {
        TelemetryError::SinkIoError(format!("Cannot write {}: {}", path.display(), e))
    })?;
    info!("📊 Summary exported to {}", path.display());
    Ok(())
}
