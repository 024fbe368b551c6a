use serde::{Deserialize, Serialize};

use crate::config::LogFormat;
use crate::devices::sample::{signal_quality, FieldValue, Sample, SampleFields};
use crate::utils::error::TelemetryError;

/// Encodes samples as persisted records, one per line.
pub trait SampleFormatter: Send + Sync {
    /// Header line written once at the top of a fresh file, shaped by the
    /// first record that goes into it.
    fn header(&self, _first: &Sample) -> Option<String> {
        None
    }

    /// False when the header already written has no place for some of
    /// `sample`'s fields, so the record needs a fresh file.
    fn fits(&self, _sample: &Sample) -> bool {
        true
    }

    /// Field columns declared by the header so far.
    fn columns(&self) -> Vec<String> {
        Vec::new()
    }

    /// Carry columns over from the previous file of the same stream.
    fn seed_columns(&self, _columns: Vec<String>) {}

    fn format_record(&self, sample: &Sample) -> Result<String, TelemetryError>;

    fn format_type(&self) -> LogFormat;
}

pub fn formatter_for(format: LogFormat) -> Box<dyn SampleFormatter> {
    match format {
        LogFormat::Jsonl => Box::new(JsonLinesFormatter),
        LogFormat::Csv => Box::new(CsvFormatter::default()),
        LogFormat::Log => Box::new(TextFormatter),
    }
}

/// On-disk shape of a JSON Lines record. Fields stay nested so a field named
/// `device_id` or `timestamp` cannot collide with the envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct JsonRecord {
    pub device_id: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub fields: SampleFields,
}

impl From<JsonRecord> for Sample {
    fn from(record: JsonRecord) -> Self {
        Sample::new(record.device_id, record.timestamp, record.fields)
    }
}

pub struct JsonLinesFormatter;

impl SampleFormatter for JsonLinesFormatter {
    fn format_record(&self, sample: &Sample) -> Result<String, TelemetryError> {
        Ok(serde_json::to_string(sample)?)
    }

    fn format_type(&self) -> LogFormat {
        LogFormat::Jsonl
    }
}

/// Columns are `device_id,timestamp` followed by any seeded columns, then the
/// first record's new field names. Later records fill missing columns with
/// empty cells. A record with fields the header lacks does not [`fits`], and
/// the sink moves it to a new file with a widened header.
///
/// [`fits`]: SampleFormatter::fits
#[derive(Default)]
pub struct CsvFormatter {
    columns: std::sync::RwLock<Vec<String>>,
}

pub fn csv_escape(cell: &str) -> String {
    if cell.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", cell.replace('"', "\"\""))
    } else {
        cell.to_string()
    }
}

/// Split one CSV line into cells, honouring double-quoted cells.
pub fn csv_split(line: &str) -> Vec<String> {
    let mut cells = Vec::new();
    let mut cell = String::new();
    let mut quoted = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        match (c, quoted) {
            ('"', true) if chars.peek() == Some(&'"') => {
                cell.push('"');
                chars.next();
            }
            ('"', true) => quoted = false,
            ('"', false) if cell.is_empty() => quoted = true,
            (',', false) => cells.push(std::mem::take(&mut cell)),
            (c, _) => cell.push(c),
        }
    }
    cells.push(cell);
    cells
}

impl SampleFormatter for CsvFormatter {
    fn header(&self, first: &Sample) -> Option<String> {
        let mut columns = crate::utils::write(&self.columns);
        for key in first.fields.keys() {
            if !columns.contains(key) {
                columns.push(key.clone());
            }
        }
        let mut header = vec!["device_id".to_string(), "timestamp".to_string()];
        header.extend(columns.iter().map(|c| csv_escape(c)));
        Some(header.join(","))
    }

    fn fits(&self, sample: &Sample) -> bool {
        let columns = crate::utils::read(&self.columns);
        sample.fields.keys().all(|key| columns.contains(key))
    }

    fn columns(&self) -> Vec<String> {
        crate::utils::read(&self.columns).clone()
    }

    fn seed_columns(&self, columns: Vec<String>) {
        *crate::utils::write(&self.columns) = columns;
    }

    fn format_record(&self, sample: &Sample) -> Result<String, TelemetryError> {
        let mut row = vec![
            csv_escape(&sample.device_id),
            sample.timestamp.to_rfc3339(),
        ];
        for column in self.columns() {
            let cell = match sample.get(&column) {
                // keep the decimal point so 10.0 reads back as a float
                Some(FieldValue::Float(f)) => format!("{:?}", f),
                Some(value) => csv_escape(&value.to_string()),
                None => String::new(),
            };
            row.push(cell);
        }
        Ok(row.join(","))
    }

    fn format_type(&self) -> LogFormat {
        LogFormat::Csv
    }
}

/// Human-readable line: `2024-05-01 12:00:00 [dev] RSSI:-52dBm (Good) | ssid:Net`.
pub struct TextFormatter;

impl TextFormatter {
    pub fn format_fields(sample: &Sample) -> String {
        let mut parts = Vec::with_capacity(sample.fields.len());
        if let Some(rssi) = sample.numeric("rssi") {
            parts.push(format!("RSSI:{}dBm ({})", rssi, signal_quality(rssi)));
        }
        for (key, value) in &sample.fields {
            if key == "rssi" {
                continue;
            }
            let rendered = match value {
                FieldValue::Float(f) => format!("{}:{:.2}", key, f),
                other => format!("{}:{}", key, other),
            };
            parts.push(rendered);
        }
        parts.join(" | ")
    }
}

impl SampleFormatter for TextFormatter {
    fn format_record(&self, sample: &Sample) -> Result<String, TelemetryError> {
        Ok(format!(
            "{} [{}] {}",
            sample.timestamp.format("%Y-%m-%d %H:%M:%S"),
            sample.device_id,
            Self::format_fields(sample)
        ))
    }

    fn format_type(&self) -> LogFormat {
        LogFormat::Log
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn sample(fields: &[(&str, FieldValue)]) -> Sample {
        Sample::new(
            "esp-1",
            Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            fields.iter().map(|(k, v)| (k.to_string(), v.clone())).collect(),
        )
    }

    #[test]
    fn test_jsonl_keeps_fields_nested() {
        let s = sample(&[("rssi", FieldValue::Integer(-52)), ("device_id", "shadow".into())]);
        let line = JsonLinesFormatter.format_record(&s).unwrap();
        let record: JsonRecord = serde_json::from_str(&line).unwrap();
        assert_eq!(record.device_id, "esp-1");
        assert_eq!(Sample::from(record), s);
    }

    #[test]
    fn test_csv_header_from_first_record() {
        let formatter = CsvFormatter::default();
        let first = sample(&[("rssi", FieldValue::Integer(-52)), ("ssid", "Net, 5G".into())]);
        assert_eq!(formatter.header(&first).unwrap(), "device_id,timestamp,rssi,ssid");
        assert_eq!(
            formatter.format_record(&first).unwrap(),
            "esp-1,2024-05-01T12:00:00+00:00,-52,\"Net, 5G\""
        );

        let partial = sample(&[("ssid", "Lab".into())]);
        assert!(formatter.fits(&partial));
        assert_eq!(
            formatter.format_record(&partial).unwrap(),
            "esp-1,2024-05-01T12:00:00+00:00,,Lab"
        );

        let wider = sample(&[("ssid", "Lab".into()), ("extra", FieldValue::Integer(1))]);
        assert!(!formatter.fits(&wider));
    }

    #[test]
    fn test_csv_seeded_header_widens() {
        let previous = CsvFormatter::default();
        previous.header(&sample(&[("rssi", FieldValue::Integer(-52)), ("ssid", "Net".into())]));

        let next = CsvFormatter::default();
        next.seed_columns(previous.columns());
        let wider = sample(&[("download_speed", FieldValue::Float(42.5)), ("rssi", FieldValue::Integer(-60))]);
        assert_eq!(
            next.header(&wider).unwrap(),
            "device_id,timestamp,rssi,ssid,download_speed"
        );
        assert!(next.fits(&wider));
        assert_eq!(
            next.format_record(&wider).unwrap(),
            "esp-1,2024-05-01T12:00:00+00:00,-60,,42.5"
        );
    }

    #[test]
    fn test_csv_split_inverts_escape() {
        let cells = ["plain", "with, comma", "say \"hi\"", ""];
        let line = cells.iter().map(|c| csv_escape(c)).collect::<Vec<_>>().join(",");
        assert_eq!(csv_split(&line), cells);
    }

    #[test]
    fn test_text_line() {
        let s = sample(&[
            ("rssi", FieldValue::Integer(-52)),
            ("latency_avg", FieldValue::Float(12.5)),
            ("ssid", "Net".into()),
        ]);
        assert_eq!(
            TextFormatter.format_record(&s).unwrap(),
            "2024-05-01 12:00:00 [esp-1] RSSI:-52dBm (Good) | latency_avg:12.50 | ssid:Net"
        );
    }
}
