use log::{info, warn};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};

use super::dispatcher::{Dispatcher, EventHandler, HandlerId};
use crate::config::Config;
use crate::devices::descriptor::{self, IdentityTable, PortEnumerator, SystemPortEnumerator};
use crate::devices::{
    ChannelSettings, ChannelSnapshot, ChannelState, Clock, Connector, DeviceChannel, DeviceCommand,
    DeviceDescriptor, SerialPortConnector, SystemClock,
};
use crate::utils::error::TelemetryError;
use crate::utils::lock;

pub type BroadcastResults = BTreeMap<String, Result<(), TelemetryError>>;

struct ManagedChannel {
    channel: Arc<DeviceChannel>,
    task: Option<JoinHandle<()>>,
}

/// Outcome of [`DeviceManager::stop_all`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StopReport {
    /// Channels whose read loop exited on its own.
    pub stopped: Vec<String>,
    /// Channels closed after the shutdown timeout elapsed.
    pub forced: Vec<String>,
}

/// Supervises the set of device channels.
///
/// Channels are keyed by device id. The manager only requests state changes;
/// each channel performs its own transitions.
pub struct DeviceManager {
    config: Arc<Config>,
    identity: IdentityTable,
    enumerator: Arc<dyn PortEnumerator>,
    connector: Arc<dyn Connector>,
    clock: Arc<dyn Clock>,
    dispatcher: Arc<Dispatcher>,
    channels: Mutex<BTreeMap<String, ManagedChannel>>,
    runtime: Mutex<Option<Handle>>,
}

impl DeviceManager {
    pub fn new(config: Arc<Config>) -> Self {
        let connector = Arc::new(SerialPortConnector::from_config(&config));
        Self::with_parts(config, Arc::new(SystemPortEnumerator), connector, Arc::new(SystemClock))
    }

    pub fn with_parts(
        config: Arc<Config>,
        enumerator: Arc<dyn PortEnumerator>,
        connector: Arc<dyn Connector>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            identity: IdentityTable::from_config(&config),
            config,
            enumerator,
            connector,
            clock,
            dispatcher: Arc::new(Dispatcher::new()),
            channels: Mutex::new(BTreeMap::new()),
            runtime: Mutex::new(None),
        }
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        Arc::clone(&self.dispatcher)
    }

    /// Explicitly configured ports followed by matched enumerated ports.
    pub fn discover(&self) -> Vec<DeviceDescriptor> {
        let mut descriptors: Vec<DeviceDescriptor> = self
            .config
            .ports
            .iter()
            .map(|port| DeviceDescriptor::for_port(&port.port_path, port.device_id.as_deref()))
            .collect();

        if !self.identity.is_empty() {
            let mut seen: HashSet<String> = descriptors.iter().map(|d| d.port_path.clone()).collect();
            for found in descriptor::discover(self.enumerator.as_ref(), &self.identity, &self.config) {
                if seen.insert(found.port_path.clone()) {
                    descriptors.push(found);
                }
            }
        }
        descriptors
    }

    /// Create a channel for every discovered device not already connected.
    ///
    /// Returns the ids of the newly added devices. Finding nothing is not an
    /// error.
    pub fn discover_and_connect(&self) -> Vec<String> {
        let added: Vec<String> = self
            .discover()
            .into_iter()
            .filter_map(|descriptor| {
                let device_id = descriptor.device_id.clone();
                self.add_device(descriptor).then_some(device_id)
            })
            .collect();

        if added.is_empty() {
            info!("🔍 No new devices to connect");
        } else {
            info!("🔗 Added {} device channels: {}", added.len(), added.join(", "));
        }
        added
    }

    /// Add a channel for `descriptor`. Returns false if a live channel already
    /// serves the same device id or port. A closed channel is replaced.
    ///
    /// If the manager is running the new channel starts immediately.
    pub fn add_device(&self, descriptor: DeviceDescriptor) -> bool {
        let mut channels = lock(&self.channels);

        let conflict = channels.values().any(|managed| {
            let existing = managed.channel.descriptor();
            managed.channel.state() != ChannelState::Closed
                && (existing.device_id == descriptor.device_id
                    || existing.port_path == descriptor.port_path)
        });
        if conflict {
            return false;
        }

        let stale: Vec<String> = channels
            .iter()
            .filter(|(_, managed)| managed.channel.descriptor().port_path == descriptor.port_path)
            .map(|(id, _)| id.clone())
            .collect();
        for id in stale {
            channels.remove(&id);
        }

        let device_id = descriptor.device_id.clone();
        info!("📋 Registered {} on {}", device_id, descriptor.port_path);
        let channel = Arc::new(DeviceChannel::with_clock(
            descriptor,
            ChannelSettings::from_config(&self.config),
            Arc::clone(&self.connector),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.clock),
        ));

        let task = lock(&self.runtime).as_ref().map(|runtime| channel.spawn(runtime));
        channels.insert(device_id, ManagedChannel { channel, task });
        true
    }

    /// Stop and forget one device.
    pub async fn remove_device(&self, device_id: &str) -> Result<(), TelemetryError> {
        let managed = lock(&self.channels)
            .remove(device_id)
            .ok_or_else(|| TelemetryError::DeviceNotFound(device_id.to_string()))?;

        managed.channel.request_stop();
        if let Some(task) = managed.task {
            let deadline = Instant::now() + self.config.shutdown_timeout();
            if timeout_at(deadline, task).await.is_err() {
                warn!("⚠️ {} did not stop in time, forcing close", device_id);
            }
        }
        managed.channel.force_close();
        info!("🗑️ Removed {}", device_id);
        Ok(())
    }

    /// Start every channel that is not running yet. Must be called from
    /// within a tokio runtime.
    pub fn start_all(&self) -> Result<usize, TelemetryError> {
        let runtime = Handle::try_current()
            .map_err(|e| TelemetryError::ConnectionError(format!("No async runtime: {}", e)))?;

        let mut channels = lock(&self.channels);
        if channels.is_empty() {
            return Err(TelemetryError::NoChannels);
        }

        let mut started = 0;
        for managed in channels.values_mut() {
            if managed.task.is_none() && managed.channel.state() != ChannelState::Closed {
                managed.task = Some(managed.channel.spawn(&runtime));
                started += 1;
            }
        }
        *lock(&self.runtime) = Some(runtime);

        info!("🚀 Started {} device channels", started);
        Ok(started)
    }

    /// Stop every channel, waiting at most the configured shutdown timeout.
    pub async fn stop_all(&self) -> StopReport {
        self.stop_all_within(self.config.shutdown_timeout()).await
    }

    pub async fn stop_all_within(&self, limit: Duration) -> StopReport {
        lock(&self.runtime).take();

        let pending: Vec<(String, Arc<DeviceChannel>, Option<JoinHandle<()>>)> = {
            let mut channels = lock(&self.channels);
            channels
                .iter_mut()
                .map(|(id, managed)| {
                    managed.channel.request_stop();
                    (id.clone(), Arc::clone(&managed.channel), managed.task.take())
                })
                .collect()
        };

        let deadline = Instant::now() + limit;
        let mut report = StopReport::default();
        for (device_id, channel, task) in pending {
            let finished = match task {
                Some(task) => timeout_at(deadline, task).await.is_ok(),
                None => true,
            };

            if finished {
                channel.force_close();
                report.stopped.push(device_id);
            } else {
                warn!(
                    "⚠️ {} still running after {:.1}s, forcing close",
                    device_id,
                    limit.as_secs_f64()
                );
                channel.force_close();
                report.forced.push(device_id);
            }
        }

        info!(
            "✅ Stopped {} channels ({} forced)",
            report.stopped.len() + report.forced.len(),
            report.forced.len()
        );
        report
    }

    pub fn send(&self, device_id: &str, command: &str) -> Result<(), TelemetryError> {
        let channel = self
            .channel(device_id)
            .ok_or_else(|| TelemetryError::DeviceNotFound(device_id.to_string()))?;
        channel.send(command)
    }

    /// Send `command` to every channel.
    ///
    /// Every device gets an entry; channels that are not open report
    /// `ChannelUnavailable` without a write being attempted.
    pub fn broadcast(&self, command: &str) -> BroadcastResults {
        let channels: Vec<Arc<DeviceChannel>> = lock(&self.channels)
            .values()
            .map(|managed| Arc::clone(&managed.channel))
            .collect();

        let results: BroadcastResults = channels
            .iter()
            .map(|channel| (channel.device_id().to_string(), channel.send(command)))
            .collect();

        let ok = results.values().filter(|r| r.is_ok()).count();
        info!("📢 Broadcast {} -> {}/{} devices", command, ok, results.len());
        results
    }

    pub fn broadcast_command(&self, command: &DeviceCommand) -> BroadcastResults {
        self.broadcast(&command.to_wire())
    }

    pub fn request_perf_report(&self) -> BroadcastResults {
        self.broadcast_command(&DeviceCommand::PerfReport)
    }

    pub fn start_speed_test(&self) -> BroadcastResults {
        self.broadcast_command(&DeviceCommand::SpeedTest)
    }

    pub fn set_interval(&self, millis: u64) -> BroadcastResults {
        self.broadcast_command(&DeviceCommand::SetInterval { millis })
    }

    pub fn set_continuous(&self, enabled: bool) -> BroadcastResults {
        self.broadcast_command(&DeviceCommand::Continuous(enabled))
    }

    pub fn register_callback(&self, handler: Arc<dyn EventHandler>, device_id: Option<&str>) -> HandlerId {
        self.dispatcher.register(handler, device_id)
    }

    pub fn unregister_callback(&self, id: HandlerId) -> bool {
        self.dispatcher.unregister(id)
    }

    pub fn channel(&self, device_id: &str) -> Option<Arc<DeviceChannel>> {
        lock(&self.channels)
            .get(device_id)
            .map(|managed| Arc::clone(&managed.channel))
    }

    pub fn device_ids(&self) -> Vec<String> {
        lock(&self.channels).keys().cloned().collect()
    }

    pub fn snapshots(&self) -> Vec<ChannelSnapshot> {
        lock(&self.channels)
            .values()
            .map(|managed| managed.channel.snapshot())
            .collect()
    }

    pub fn state(&self, device_id: &str) -> Option<ChannelState> {
        self.channel(device_id).map(|channel| channel.state())
    }

    pub fn open_count(&self) -> usize {
        self.snapshots()
            .iter()
            .filter(|s| s.state == ChannelState::Open)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PortConfig, ReconnectConfig};
    use crate::devices::mock::{MockConnector, MockEnumerator};
    use crate::devices::{FieldValue, ManualClock};
    use crate::services::dispatcher::{handler_fn, DeviceEvent};
    use std::time::Instant as StdInstant;

    fn test_config(initial_delay_ms: u64, max_retries: u32) -> Config {
        Config {
            read_timeout_ms: 20,
            shutdown_timeout_ms: 2000,
            reconnect: ReconnectConfig {
                initial_delay_ms,
                max_delay_ms: initial_delay_ms,
                multiplier: 2.0,
                jitter: 0.0,
                max_retries,
            },
            ..Config::default()
        }
    }

    async fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let deadline = StdInstant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(StdInstant::now() < deadline, "timed out waiting for {}", what);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn test_discovery_is_idempotent() {
        let enumerator = Arc::new(MockEnumerator::new(vec![
            MockEnumerator::usb_port("/dev/ttyUSB0", 0x10C4, 0xEA60),
            MockEnumerator::usb_port("/dev/ttyS0", 0x1234, 0x5678),
            MockEnumerator::usb_port("/dev/ttyACM0", 0x303A, 0x1001),
        ]));
        let mut config = test_config(500, 3);
        config.ports.push(PortConfig {
            port_path: "/dev/ttyUSB0".to_string(),
            device_id: Some("bench".to_string()),
        });
        let manager = DeviceManager::with_parts(
            Arc::new(config),
            enumerator.clone(),
            Arc::new(MockConnector::new()),
            Arc::new(ManualClock::new()),
        );

        let added = manager.discover_and_connect();
        assert_eq!(added, vec!["bench".to_string(), "ttyACM0".to_string()]);
        assert!(manager.discover_and_connect().is_empty());

        enumerator.set_ports(vec![MockEnumerator::usb_port("/dev/ttyACM1", 0x1A86, 0x7523)]);
        assert_eq!(manager.discover_and_connect(), vec!["ttyACM1".to_string()]);
        assert_eq!(manager.device_ids(), vec!["bench", "ttyACM0", "ttyACM1"]);
    }

    #[test]
    fn test_closed_channel_is_replaced_on_rediscovery() {
        let manager = DeviceManager::with_parts(
            Arc::new(test_config(500, 3)),
            Arc::new(MockEnumerator::default()),
            Arc::new(MockConnector::new()),
            Arc::new(ManualClock::new()),
        );
        assert!(manager.add_device(DeviceDescriptor::for_port("/dev/ttyUSB0", None)));
        assert!(!manager.add_device(DeviceDescriptor::for_port("/dev/ttyUSB0", Some("other"))));

        manager.channel("ttyUSB0").unwrap().force_close();
        assert!(manager.add_device(DeviceDescriptor::for_port("/dev/ttyUSB0", None)));
        assert_eq!(manager.state("ttyUSB0"), Some(ChannelState::Connecting));
    }

    #[test]
    fn test_start_all_without_channels_is_an_error() {
        let runtime = tokio::runtime::Builder::new_multi_thread().build().unwrap();
        let manager = DeviceManager::with_parts(
            Arc::new(test_config(500, 3)),
            Arc::new(MockEnumerator::default()),
            Arc::new(MockConnector::new()),
            Arc::new(ManualClock::new()),
        );
        let result = runtime.block_on(async { manager.start_all() });
        assert!(matches!(result, Err(TelemetryError::NoChannels)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_broadcast_reports_each_channel() {
        let connector = Arc::new(MockConnector::new());
        let devices: Vec<_> = ["/dev/ttyUSB0", "/dev/ttyUSB1", "/dev/ttyUSB2"]
            .iter()
            .map(|port| connector.add(port))
            .collect();
        let mut config = test_config(60_000, 3);
        for port in ["/dev/ttyUSB0", "/dev/ttyUSB1", "/dev/ttyUSB2"] {
            config.ports.push(PortConfig {
                port_path: port.to_string(),
                device_id: None,
            });
        }
        config.known_devices.clear();

        let manager = DeviceManager::with_parts(
            Arc::new(config),
            Arc::new(MockEnumerator::default()),
            connector,
            Arc::new(SystemClock),
        );
        manager.discover_and_connect();
        assert_eq!(manager.start_all().unwrap(), 3);
        wait_until("all open", || manager.open_count() == 3).await;

        devices[2].unplug();
        wait_until("degraded", || manager.state("ttyUSB2") == Some(ChannelState::Degraded)).await;

        let results = manager.request_perf_report();
        assert_eq!(results.len(), 3);
        assert!(results["ttyUSB0"].is_ok());
        assert!(results["ttyUSB1"].is_ok());
        assert!(matches!(
            results["ttyUSB2"],
            Err(TelemetryError::ChannelUnavailable { state: ChannelState::Degraded, .. })
        ));
        assert_eq!(devices[0].written(), "PERF_REPORT\n");

        let report = manager.stop_all().await;
        assert_eq!(report.stopped.len(), 3);
        assert!(report.forced.is_empty());
        assert!(manager.snapshots().iter().all(|s| s.state == ChannelState::Closed));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unplugged_device_does_not_disturb_others() {
        let connector = Arc::new(MockConnector::new());
        let alpha = connector.add("/dev/ttyUSB0");
        let beta = connector.add("/dev/ttyUSB1");
        let mut config = test_config(60_000, 3);
        config.known_devices.clear();
        config.ports = vec![
            PortConfig { port_path: "/dev/ttyUSB0".to_string(), device_id: Some("alpha".to_string()) },
            PortConfig { port_path: "/dev/ttyUSB1".to_string(), device_id: Some("beta".to_string()) },
        ];

        let manager = DeviceManager::with_parts(
            Arc::new(config),
            Arc::new(MockEnumerator::default()),
            connector,
            Arc::new(SystemClock),
        );

        let received: Arc<Mutex<BTreeMap<String, Vec<i64>>>> = Arc::default();
        let sink = Arc::clone(&received);
        manager.register_callback(
            handler_fn("sequence", move |device_id, event| {
                if let DeviceEvent::Line { outcome, .. } = event {
                    if let Some(FieldValue::Integer(seq)) = outcome.sample().and_then(|s| s.get("seq")) {
                        lock(&sink).entry(device_id.to_string()).or_default().push(*seq);
                    }
                }
                Ok(())
            }),
            None,
        );

        manager.discover_and_connect();
        manager.start_all().unwrap();
        wait_until("both open", || manager.open_count() == 2).await;

        for seq in 0..200 {
            beta.push_line(&format!("seq:{}|rssi:-60", seq));
            if seq < 50 {
                alpha.push_line(&format!("{{\"seq\":{}}}", seq));
            }
            if seq == 50 {
                alpha.unplug();
            }
        }

        wait_until("beta drained", || {
            lock(&received).get("beta").map_or(0, Vec::len) == 200
        })
        .await;

        let received = lock(&received).clone();
        assert_eq!(received["beta"], (0..200).collect::<Vec<_>>());
        let alpha_seqs = received.get("alpha").cloned().unwrap_or_default();
        assert!(alpha_seqs.windows(2).all(|w| w[0] < w[1]));
        assert_ne!(manager.state("alpha"), Some(ChannelState::Open));
        assert_eq!(manager.state("beta"), Some(ChannelState::Open));

        manager.stop_all().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_remove_device_and_send() {
        let connector = Arc::new(MockConnector::new());
        let device = connector.add("/dev/ttyUSB0");
        let manager = DeviceManager::with_parts(
            Arc::new(test_config(60_000, 3)),
            Arc::new(MockEnumerator::default()),
            connector,
            Arc::new(SystemClock),
        );
        manager.add_device(DeviceDescriptor::for_port("/dev/ttyUSB0", Some("esp")));
        manager.start_all().unwrap();
        wait_until("open", || manager.open_count() == 1).await;

        manager.send("esp", "SET_INTERVAL:250").unwrap();
        assert_eq!(device.written(), "SET_INTERVAL:250\n");
        assert!(matches!(
            manager.send("nope", "PERF_REPORT"),
            Err(TelemetryError::DeviceNotFound(_))
        ));

        manager.remove_device("esp").await.unwrap();
        assert!(manager.device_ids().is_empty());
        assert!(manager.remove_device("esp").await.is_err());
    }
}
