//! Multi-format line parser.
//!
//! Devices report telemetry as one text line per record, in whichever of these
//! encodings their firmware happens to use:
//!
//! 1. a JSON object: `{"rssi":-52,"ssid":"Net","latency_avg":12.5}`
//! 2. delimiter-segmented pairs: `rssi:-52|ssid:Net|latency:12.5` or
//!    `rssi=-52, ssid=Net`, optionally tagged (`PERF|rssi:-52|...`)
//!
//! Formats are tried in that order and the first success wins. Parsing never
//! fails with an error: every input maps to a [`ParseOutcome`].
//!
//! Firmware builds disagree on key names (`latency`, `ping`, `rtt`), so keys are
//! looked up lowercased in a [`FieldAliases`] table and stored under their
//! canonical name. Keys the table does not know are kept verbatim.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

use super::sample::{FieldValue, Sample, SampleFields};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParseFailure {
    Empty,
    Truncated,
    Unparseable,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    Parsed(Sample),
    Failed { reason: ParseFailure, line: String },
}

impl ParseFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParseFailure::Empty => "empty",
            ParseFailure::Truncated => "truncated",
            ParseFailure::Unparseable => "unparseable",
        }
    }
}

impl fmt::Display for ParseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ParseOutcome {
    pub fn sample(&self) -> Option<&Sample> {
        match self {
            ParseOutcome::Parsed(sample) => Some(sample),
            ParseOutcome::Failed { .. } => None,
        }
    }

    pub fn is_parsed(&self) -> bool {
        matches!(self, ParseOutcome::Parsed(_))
    }
}

// alias -> canonical name
const DEFAULT_FIELD_ALIASES: &[(&str, &str)] = &[
    ("signal", "rssi"),
    ("signal_strength", "rssi"),
    ("wifi_rssi", "rssi"),
    ("network", "ssid"),
    ("wifi_ssid", "ssid"),
    ("chan", "channel"),
    ("ch", "channel"),
    ("mac", "bssid"),
    ("ap_mac", "bssid"),
    ("txrate", "tx_rate"),
    ("tx_speed", "tx_rate"),
    ("rxrate", "rx_rate"),
    ("rx_speed", "rx_rate"),
    ("linkspeed", "link_speed"),
    ("speed", "link_speed"),
    ("txpkt", "tx_packets"),
    ("rxpkt", "rx_packets"),
    ("txbytes", "tx_bytes"),
    ("rxbytes", "rx_bytes"),
    ("txerr", "tx_errors"),
    ("rxerr", "rx_errors"),
    ("retries", "tx_retries"),
    ("loss", "packet_loss"),
    ("ploss", "packet_loss"),
    ("latency", "latency_avg"),
    ("ping", "latency_avg"),
    ("rtt", "latency_avg"),
    ("ping_min", "latency_min"),
    ("ping_max", "latency_max"),
    ("download", "download_speed"),
    ("dl_speed", "download_speed"),
    ("upload", "upload_speed"),
    ("ul_speed", "upload_speed"),
    ("heap", "free_heap"),
    ("freemem", "free_heap"),
    ("freq", "cpu_freq"),
    ("noise", "noise_floor"),
];

/// Maps the key names devices use onto canonical field names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldAliases {
    aliases: HashMap<String, String>,
}

impl Default for FieldAliases {
    fn default() -> Self {
        Self {
            aliases: DEFAULT_FIELD_ALIASES
                .iter()
                .map(|(alias, canonical)| (alias.to_string(), canonical.to_string()))
                .collect(),
        }
    }
}

impl FieldAliases {
    /// An empty table: every key is kept as received.
    pub fn none() -> Self {
        Self {
            aliases: HashMap::new(),
        }
    }

    /// The default table extended, and where keys collide replaced, by `overrides`.
    pub fn with_overrides(overrides: &HashMap<String, String>) -> Self {
        let mut table = Self::default();
        for (alias, canonical) in overrides {
            table.insert(alias, canonical);
        }
        table
    }

    pub fn insert(&mut self, alias: &str, canonical: &str) {
        self.aliases
            .insert(alias.trim().to_lowercase(), canonical.trim().to_string());
    }

    pub fn len(&self) -> usize {
        self.aliases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.aliases.is_empty()
    }

    /// Canonical name for `key`. Unknown keys come back unchanged.
    pub fn canonical(&self, key: &str) -> String {
        match self.aliases.get(&key.to_lowercase()) {
            Some(canonical) => canonical.clone(),
            None => key.to_string(),
        }
    }
}

fn default_aliases() -> &'static FieldAliases {
    static DEFAULT: OnceLock<FieldAliases> = OnceLock::new();
    DEFAULT.get_or_init(FieldAliases::default)
}

/// Parse one raw line into a Sample attributed to `device_id`, using the
/// default alias table.
pub fn parse(device_id: &str, raw_line: &str, timestamp: DateTime<Utc>) -> ParseOutcome {
    parse_with(default_aliases(), device_id, raw_line, timestamp)
}

pub fn parse_with(
    aliases: &FieldAliases,
    device_id: &str,
    raw_line: &str,
    timestamp: DateTime<Utc>,
) -> ParseOutcome {
    match parse_fields_with(aliases, raw_line) {
        Ok(fields) => ParseOutcome::Parsed(Sample::new(device_id, timestamp, fields)),
        Err(reason) => ParseOutcome::Failed {
            reason,
            line: raw_line.to_string(),
        },
    }
}

/// Decode the key/value content of a line without attributing it.
pub fn parse_fields(raw_line: &str) -> Result<SampleFields, ParseFailure> {
    parse_fields_with(default_aliases(), raw_line)
}

pub fn parse_fields_with(aliases: &FieldAliases, raw_line: &str) -> Result<SampleFields, ParseFailure> {
    let line = raw_line.trim();
    if line.is_empty() {
        return Err(ParseFailure::Empty);
    }

    if line.starts_with('{') {
        return parse_json_object(aliases, line);
    }

    parse_delimited(aliases, line)
}

fn parse_json_object(aliases: &FieldAliases, line: &str) -> Result<SampleFields, ParseFailure> {
    let map = match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(map)) => map,
        Ok(_) => return Err(ParseFailure::Unparseable),
        Err(e) if e.is_eof() => return Err(ParseFailure::Truncated),
        Err(_) => return Err(ParseFailure::Unparseable),
    };

    let mut fields = SampleFields::new();
    for (key, value) in map {
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        if let Some(value) = json_field_value(value) {
            fields.insert(aliases.canonical(key), value);
        }
    }

    if fields.is_empty() {
        return Err(ParseFailure::Unparseable);
    }
    Ok(fields)
}

fn json_field_value(value: Value) -> Option<FieldValue> {
    match value {
        Value::Null => None,
        Value::Number(n) => match n.as_i64() {
            Some(i) => Some(FieldValue::Integer(i)),
            None => n.as_f64().map(FieldValue::Float),
        },
        Value::String(s) => Some(FieldValue::Text(s)),
        Value::Bool(b) => Some(FieldValue::Text(b.to_string())),
        nested @ (Value::Array(_) | Value::Object(_)) => Some(FieldValue::Text(nested.to_string())),
    }
}

fn parse_delimited(aliases: &FieldAliases, line: &str) -> Result<SampleFields, ParseFailure> {
    let delimiter = if line.contains('|') { '|' } else { ',' };

    let mut fields = SampleFields::new();
    for segment in line.split(delimiter) {
        // Segments without a separator are tags such as the PERF prefix
        let Some(split_at) = segment.find([':', '=']) else {
            continue;
        };
        let key = segment[..split_at].trim();
        let value = segment[split_at + 1..].trim();
        if key.is_empty() {
            continue;
        }
        fields.insert(aliases.canonical(key), FieldValue::coerce(value));
    }

    if fields.is_empty() {
        return Err(ParseFailure::Unparseable);
    }
    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(line: &str) -> SampleFields {
        parse_fields(line).unwrap()
    }

    #[test]
    fn test_json_line() {
        let parsed = fields(r#"{"rssi":-52,"ssid":"Net","latency_avg":12.5}"#);
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed["rssi"], FieldValue::Integer(-52));
        assert_eq!(parsed["ssid"], FieldValue::Text("Net".to_string()));
        assert_eq!(parsed["latency_avg"], FieldValue::Float(12.5));
    }

    #[test]
    fn test_pipe_delimited_line() {
        let parsed = fields("rssi:-52|ssid:Net|latency:12.5");
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed["rssi"], FieldValue::Integer(-52));
        assert_eq!(parsed["ssid"], FieldValue::Text("Net".to_string()));
        assert_eq!(parsed["latency_avg"], FieldValue::Float(12.5));
    }

    #[test]
    fn test_both_encodings_yield_same_fields() {
        let json = fields(r#"{"rssi":-52,"ssid":"Net","latency_avg":12.5}"#);
        let delimited = fields("rssi:-52|ssid:Net|latency:12.5");
        assert_eq!(json, delimited);
    }

    #[test]
    fn test_aliases_are_case_insensitive() {
        let parsed = fields(r#"{"Signal":-48,"PING":7,"Download":42.5}"#);
        assert_eq!(parsed["rssi"], FieldValue::Integer(-48));
        assert_eq!(parsed["latency_avg"], FieldValue::Integer(7));
        assert_eq!(parsed["download_speed"], FieldValue::Float(42.5));

        // Unknown keys keep their original spelling
        let parsed = fields("Fw_Build=2026.10");
        assert!(parsed.contains_key("Fw_Build"));
    }

    #[test]
    fn test_alias_overrides() {
        let mut overrides = HashMap::new();
        overrides.insert("Temp".to_string(), "temperature".to_string());
        overrides.insert("latency".to_string(), "latency_raw".to_string());
        let aliases = FieldAliases::with_overrides(&overrides);

        let parsed = parse_fields_with(&aliases, "temp:41.5|latency:3|ping:4").unwrap();
        assert_eq!(parsed["temperature"], FieldValue::Float(41.5));
        assert_eq!(parsed["latency_raw"], FieldValue::Integer(3));
        assert_eq!(parsed["latency_avg"], FieldValue::Integer(4));

        let verbatim = parse_fields_with(&FieldAliases::none(), "latency:3").unwrap();
        assert!(verbatim.contains_key("latency"));
    }

    #[test]
    fn test_perf_tagged_line() {
        let parsed = fields("PERF|rssi:-61|channel:6|bssid:aa:bb:cc:dd:ee:ff");
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed["channel"], FieldValue::Integer(6));
        // split once, on the first separator only
        assert_eq!(parsed["bssid"], FieldValue::Text("aa:bb:cc:dd:ee:ff".to_string()));
    }

    #[test]
    fn test_comma_equals_line() {
        let parsed = fields("  rssi = -70 , ssid=Home Net,  loss=0.5 ");
        assert_eq!(parsed["rssi"], FieldValue::Integer(-70));
        assert_eq!(parsed["ssid"], FieldValue::Text("Home Net".to_string()));
        assert_eq!(parsed["packet_loss"], FieldValue::Float(0.5));
    }

    #[test]
    fn test_duplicate_keys_last_wins() {
        assert_eq!(fields("rssi:-50|rssi:-60")["rssi"], FieldValue::Integer(-60));
        assert_eq!(fields(r#"{"rssi":-50,"rssi":-60}"#)["rssi"], FieldValue::Integer(-60));
    }

    #[test]
    fn test_unknown_keys_are_retained() {
        let parsed = fields(r#"{"rssi":-40,"fw_build":"2026.10","temp_c":41.5}"#);
        assert!(parsed.contains_key("fw_build"));
        assert_eq!(parsed["temp_c"], FieldValue::Float(41.5));
    }

    #[test]
    fn test_json_takes_precedence() {
        // Also looks like key:value text once split on commas
        let parsed = fields(r#"{"a":1,"b":"x:y"}"#);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed["a"], FieldValue::Integer(1));
        assert_eq!(parsed["b"], FieldValue::Text("x:y".to_string()));
    }

    #[test]
    fn test_json_non_scalar_values() {
        let parsed = fields(r#"{"ok":true,"aps":[1,2],"gone":null}"#);
        assert_eq!(parsed["ok"], FieldValue::Text("true".to_string()));
        assert_eq!(parsed["aps"], FieldValue::Text("[1,2]".to_string()));
        assert!(!parsed.contains_key("gone"));
    }

    #[test]
    fn test_failures_never_panic() {
        assert_eq!(parse_fields(""), Err(ParseFailure::Empty));
        assert_eq!(parse_fields(" \t\r "), Err(ParseFailure::Empty));
        assert_eq!(parse_fields(r#"{"rssi":-52,"ss"#), Err(ParseFailure::Truncated));
        assert_eq!(parse_fields("{not json}"), Err(ParseFailure::Unparseable));
        assert_eq!(parse_fields("{}"), Err(ParseFailure::Unparseable));
        assert_eq!(parse_fields("WiFi connected"), Err(ParseFailure::Unparseable));
        assert_eq!(parse_fields(":::|==="), Err(ParseFailure::Unparseable));
        assert_eq!(parse_fields("\u{fffd}\u{fffd}"), Err(ParseFailure::Unparseable));
    }

    #[test]
    fn test_parse_attributes_sample() {
        let now = Utc::now();
        match parse("ttyUSB0", "rssi:-52", now) {
            ParseOutcome::Parsed(sample) => {
                assert_eq!(sample.device_id, "ttyUSB0");
                assert_eq!(sample.timestamp, now);
                assert_eq!(sample.numeric("rssi"), Some(-52.0));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        match parse("ttyUSB0", "boot ok", now) {
            ParseOutcome::Failed { reason, line } => {
                assert_eq!(reason, ParseFailure::Unparseable);
                assert_eq!(line, "boot ok");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}
