use std::io::{self, Write};
use std::sync::Mutex;

use super::formatters::TextFormatter;
use crate::services::dispatcher::{DeviceEvent, EventHandler};
use crate::utils::error::TelemetryError;
use crate::utils::lock;

/// Prints one line per sample, plus state changes and faults.
pub struct ConsoleDisplay {
    out: Mutex<Box<dyn Write + Send>>,
    show_unparsed: bool,
}

impl ConsoleDisplay {
    pub fn stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }

    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            out: Mutex::new(out),
            show_unparsed: false,
        }
    }

    /// Also echo lines the parser could not decode.
    pub fn with_unparsed(mut self, show: bool) -> Self {
        self.show_unparsed = show;
        self
    }

    fn render(&self, device_id: &str, event: &DeviceEvent) -> Option<String> {
        match event {
            DeviceEvent::Line { raw, outcome } => match outcome.sample() {
                Some(sample) => Some(format!(
                    "{} [{}] {}",
                    sample.timestamp.with_timezone(&chrono::Local).format("%H:%M:%S"),
                    device_id,
                    TextFormatter::format_fields(sample)
                )),
                None if self.show_unparsed => Some(format!("[{}] {}", device_id, raw)),
                None => None,
            },
            DeviceEvent::StateChanged { from, to } => {
                Some(format!("🔀 [{}] {} -> {}", device_id, from, to))
            }
            DeviceEvent::Fault(message) => Some(format!("⚠️ [{}] {}", device_id, message)),
        }
    }
}

impl EventHandler for ConsoleDisplay {
    fn name(&self) -> &str {
        "console"
    }

    fn handle(&self, device_id: &str, event: &DeviceEvent) -> Result<(), TelemetryError> {
        if let Some(line) = self.render(device_id, event) {
            let mut out = lock(&self.out);
            writeln!(out, "{}", line)?;
            out.flush()?;
        }
        Ok(())
    }
}
