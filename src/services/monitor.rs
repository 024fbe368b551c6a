use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use super::dispatcher::{DeviceEvent, EventHandler};
use crate::devices::Sample;
use crate::output::analyzer::{self, FieldStats};
use crate::utils::error::TelemetryError;
use crate::utils::{read, write};

/// Keeps the latest sample and a bounded history per device.
pub struct HistoryMonitor {
    history_size: usize,
    history: RwLock<HashMap<String, VecDeque<Sample>>>,
}

impl HistoryMonitor {
    pub fn new(history_size: usize) -> Self {
        Self {
            history_size: history_size.max(1),
            history: RwLock::new(HashMap::new()),
        }
    }

    pub fn record(&self, sample: Sample) {
        let mut history = write(&self.history);
        let entries = history.entry(sample.device_id.clone()).or_default();
        if entries.len() >= self.history_size {
            entries.pop_front();
        }
        entries.push_back(sample);
    }

    pub fn latest(&self, device_id: &str) -> Option<Sample> {
        read(&self.history)
            .get(device_id)
            .and_then(|entries| entries.back().cloned())
    }

    pub fn latest_all(&self) -> HashMap<String, Sample> {
        read(&self.history)
            .iter()
            .filter_map(|(id, entries)| entries.back().map(|s| (id.clone(), s.clone())))
            .collect()
    }

    /// Oldest first; `limit` keeps only the most recent entries.
    pub fn history(&self, device_id: &str, limit: Option<usize>) -> Vec<Sample> {
        let history = read(&self.history);
        let Some(entries) = history.get(device_id) else {
            return Vec::new();
        };
        let skip = limit.map_or(0, |limit| entries.len().saturating_sub(limit));
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn statistics(&self, device_id: &str, field: &str) -> FieldStats {
        let samples = self.history(device_id, None);
        analyzer::statistics(&samples, field, Some(device_id))
    }

    /// Forget one device, or every device when `device_id` is `None`.
    pub fn clear_history(&self, device_id: Option<&str>) {
        let mut history = write(&self.history);
        match device_id {
            Some(id) => {
                history.remove(id);
            }
            None => history.clear(),
        }
    }
}

impl EventHandler for HistoryMonitor {
    fn name(&self) -> &str {
        "history"
    }

    fn handle(&self, _device_id: &str, event: &DeviceEvent) -> Result<(), TelemetryError> {
        if let DeviceEvent::Line { outcome, .. } = event {
            if let Some(sample) = outcome.sample() {
                self.record(sample.clone());
            }
        }
        Ok(())
    }
}
