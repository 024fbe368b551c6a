use std::fmt;
use std::str::FromStr;

use crate::utils::error::TelemetryError;

/// Commands understood by the device firmware.
///
/// On the wire each command is an uppercase token, some followed by a
/// `:`-delimited argument, terminated by a newline the channel appends. Raw
/// arguments are sent as typed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    PerfReport,
    SpeedTest,
    SetInterval { millis: u64 },
    Continuous(bool),
    Raw(String),
}

impl DeviceCommand {
    pub fn to_wire(&self) -> String {
        match self {
            DeviceCommand::PerfReport => "PERF_REPORT".to_string(),
            DeviceCommand::SpeedTest => "SPEED_TEST".to_string(),
            DeviceCommand::SetInterval { millis } => format!("SET_INTERVAL:{}", millis),
            DeviceCommand::Continuous(true) => "CONTINUOUS:ON".to_string(),
            DeviceCommand::Continuous(false) => "CONTINUOUS:OFF".to_string(),
            DeviceCommand::Raw(token) => token.clone(),
        }
    }
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

impl FromStr for DeviceCommand {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.trim();
        if token.is_empty() || token.contains(['\n', '\r']) {
            return Err(TelemetryError::InvalidRecord(format!("Invalid command: {:?}", s)));
        }

        let (name, arg) = match token.split_once(':') {
            Some((name, arg)) => (name.trim().to_ascii_uppercase(), Some(arg.trim())),
            None => (token.to_ascii_uppercase(), None),
        };
        let switch = arg.map(str::to_ascii_uppercase);

        let command = match (name.as_str(), arg, switch.as_deref()) {
            ("PERF_REPORT", None, _) => DeviceCommand::PerfReport,
            ("SPEED_TEST", None, _) => DeviceCommand::SpeedTest,
            ("SET_INTERVAL", Some(ms), _) => {
                let millis = ms.parse::<u64>().map_err(|_| {
                    TelemetryError::InvalidRecord(format!("Invalid interval: {}", ms))
                })?;
                DeviceCommand::SetInterval { millis }
            }
            ("CONTINUOUS", _, Some("ON")) => DeviceCommand::Continuous(true),
            ("CONTINUOUS", _, Some("OFF")) => DeviceCommand::Continuous(false),
            (_, Some(arg), _) => DeviceCommand::Raw(format!("{}:{}", name, arg)),
            (_, None, _) => DeviceCommand::Raw(name.clone()),
        };
        Ok(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format() {
        assert_eq!(DeviceCommand::PerfReport.to_wire(), "PERF_REPORT");
        assert_eq!(DeviceCommand::SetInterval { millis: 500 }.to_wire(), "SET_INTERVAL:500");
        assert_eq!(DeviceCommand::Continuous(false).to_wire(), "CONTINUOUS:OFF");
    }

    #[test]
    fn test_parse_known_and_raw() {
        assert_eq!("speed_test".parse::<DeviceCommand>().unwrap(), DeviceCommand::SpeedTest);
        assert_eq!(
            "SET_INTERVAL:2000".parse::<DeviceCommand>().unwrap(),
            DeviceCommand::SetInterval { millis: 2000 }
        );
        assert_eq!(
            "continuous:on".parse::<DeviceCommand>().unwrap(),
            DeviceCommand::Continuous(true)
        );
        assert_eq!(
            "reboot".parse::<DeviceCommand>().unwrap(),
            DeviceCommand::Raw("REBOOT".to_string())
        );
    }

    #[test]
    fn test_raw_argument_is_kept_verbatim() {
        assert_eq!(
            "set_ssid:Home Net".parse::<DeviceCommand>().unwrap(),
            DeviceCommand::Raw("SET_SSID:Home Net".to_string())
        );
        assert_eq!(
            "ota:http://host/fw.bin".parse::<DeviceCommand>().unwrap().to_wire(),
            "OTA:http://host/fw.bin"
        );
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!("".parse::<DeviceCommand>().is_err());
        assert!("SET_INTERVAL:fast".parse::<DeviceCommand>().is_err());
        assert!("A\nB".parse::<DeviceCommand>().is_err());
    }
}
