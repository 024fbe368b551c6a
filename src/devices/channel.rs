//! One device connection: read loop, line framing, reconnect policy and
//! command writes.
//!
//! ```text
//!  Connecting ──open ok──▶ Open ──read/write error──▶ Degraded
//!      ▲  │                                              │
//!      │  └──retries exhausted──▶ Closed ◀──stop──────────┤
//!      └───────────────backoff elapsed───────────────────┘
//! ```
//!
//! A stop request moves any state to `Closed` and wins over reconnects.
//! `Closed` is terminal.

use bytes::{Buf, BytesMut};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use super::backoff::{Backoff, Clock, ReconnectPolicy, SystemClock};
use super::descriptor::DeviceDescriptor;
use super::parser::{self, FieldAliases, ParseFailure, ParseOutcome};
use super::transport::{Connector, LinkReader, LinkWriter};
use crate::config::Config;
use crate::services::dispatcher::{DeviceEvent, Dispatcher};
use crate::utils::error::TelemetryError;
use crate::utils::lock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ChannelState {
    Connecting,
    Open,
    Degraded,
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Connecting => "connecting",
            ChannelState::Open => "open",
            ChannelState::Degraded => "degraded",
            ChannelState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Per-channel counters. Only the owning channel mutates them.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChannelStats {
    pub bytes_received: u64,
    pub lines_received: u64,
    pub samples_parsed: u64,
    pub empty_lines: u64,
    pub truncated_lines: u64,
    pub unparseable_lines: u64,
    pub buffer_overflows: u64,
    pub reconnects: u64,
    pub commands_sent: u64,
    pub write_failures: u64,
    pub last_data_at: Option<DateTime<Utc>>,
}

impl ChannelStats {
    pub fn parse_failures(&self) -> u64 {
        self.empty_lines + self.truncated_lines + self.unparseable_lines
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelSnapshot {
    pub device_id: String,
    pub port_path: String,
    pub state: ChannelState,
    pub stats: ChannelStats,
}

#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub read_chunk_bytes: usize,
    pub max_line_bytes: usize,
    pub stop_poll: Duration,
    pub policy: ReconnectPolicy,
    pub aliases: Arc<FieldAliases>,
}

impl ChannelSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            read_chunk_bytes: config.read_chunk_bytes,
            max_line_bytes: config.max_line_bytes,
            stop_poll: config.read_timeout(),
            policy: ReconnectPolicy::from(&config.reconnect),
            aliases: Arc::new(FieldAliases::with_overrides(&config.field_aliases)),
        }
    }
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Accumulates raw bytes and splits them into lines on `\n` or `\r`.
pub struct LineBuffer {
    buf: BytesMut,
    max_line_bytes: usize,
}

#[derive(Debug, Default)]
pub struct Extracted {
    pub lines: Vec<String>,
    pub overflowed: bool,
}

impl LineBuffer {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(max_line_bytes.min(4096)),
            max_line_bytes,
        }
    }

    /// Append `data` and take every complete, non-blank line.
    ///
    /// A partial line longer than the limit is discarded and reported through
    /// `overflowed`.
    pub fn extend(&mut self, data: &[u8]) -> Extracted {
        self.buf.extend_from_slice(data);

        let mut out = Extracted::default();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n' || *b == b'\r') {
            let raw = self.buf.split_to(pos);
            self.buf.advance(1);
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim();
            if !line.is_empty() {
                out.lines.push(line.to_string());
            }
        }

        if self.buf.len() > self.max_line_bytes {
            self.buf.clear();
            out.overflowed = true;
        }
        out
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}

pub struct DeviceChannel {
    descriptor: DeviceDescriptor,
    settings: ChannelSettings,
    connector: Arc<dyn Connector>,
    clock: Arc<dyn Clock>,
    dispatcher: Arc<Dispatcher>,
    state: Mutex<ChannelState>,
    stats: Mutex<ChannelStats>,
    writer: Mutex<Option<Box<dyn LinkWriter>>>,
    stop_requested: AtomicBool,
    started: AtomicBool,
}

impl DeviceChannel {
    pub fn new(
        descriptor: DeviceDescriptor,
        settings: ChannelSettings,
        connector: Arc<dyn Connector>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self::with_clock(descriptor, settings, connector, dispatcher, Arc::new(SystemClock))
    }

    pub fn with_clock(
        descriptor: DeviceDescriptor,
        settings: ChannelSettings,
        connector: Arc<dyn Connector>,
        dispatcher: Arc<Dispatcher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            descriptor,
            settings,
            connector,
            clock,
            dispatcher,
            state: Mutex::new(ChannelState::Connecting),
            stats: Mutex::new(ChannelStats::default()),
            writer: Mutex::new(None),
            stop_requested: AtomicBool::new(false),
            started: AtomicBool::new(false),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.descriptor.device_id
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.descriptor
    }

    pub fn state(&self) -> ChannelState {
        *lock(&self.state)
    }

    pub fn stats(&self) -> ChannelStats {
        lock(&self.stats).clone()
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        ChannelSnapshot {
            device_id: self.descriptor.device_id.clone(),
            port_path: self.descriptor.port_path.clone(),
            state: self.state(),
            stats: self.stats(),
        }
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Ask the read loop to finish. Observed within one read timeout.
    pub fn request_stop(&self) {
        if !self.stop_requested.swap(true, Ordering::SeqCst) {
            info!("🛑 Stop requested for {}", self.descriptor.device_id);
        }
    }

    fn stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Close a channel whose read loop never started or did not exit in time.
    pub fn force_close(&self) {
        self.request_stop();
        lock(&self.writer).take();
        self.transition(ChannelState::Closed);
    }

    /// Run the read loop on a blocking task of `runtime`.
    pub fn spawn(self: &Arc<Self>, runtime: &Handle) -> JoinHandle<()> {
        let channel = Arc::clone(self);
        runtime.spawn_blocking(move || channel.run())
    }

    /// Write `command` followed by a newline.
    ///
    /// A failed write degrades the channel so the read loop reconnects.
    pub fn send(&self, command: &str) -> Result<(), TelemetryError> {
        let state = self.state();
        if state != ChannelState::Open {
            return Err(TelemetryError::ChannelUnavailable {
                device_id: self.descriptor.device_id.clone(),
                state,
            });
        }

        let mut line = command.trim_end_matches(['\r', '\n']).to_string();
        line.push('\n');

        let result = match lock(&self.writer).as_mut() {
            Some(writer) => writer.write_all(line.as_bytes()),
            None => Err(std::io::Error::new(std::io::ErrorKind::NotConnected, "no open link")),
        };

        match result {
            Ok(()) => {
                lock(&self.stats).commands_sent += 1;
                info!("📤 {} <- {}", self.descriptor.device_id, line.trim_end());
                Ok(())
            }
            Err(e) => {
                lock(&self.stats).write_failures += 1;
                warn!("⚠️ Write to {} failed: {}", self.descriptor.device_id, e);
                self.transition(ChannelState::Degraded);
                Err(TelemetryError::CommunicationError(format!(
                    "Write to {} failed: {}",
                    self.descriptor.device_id, e
                )))
            }
        }
    }

    /// Blocking read/reconnect loop. Returns once the channel is `Closed`.
    pub fn run(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("⚠️ Read loop for {} already started", self.descriptor.device_id);
            return;
        }

        let device_id = self.descriptor.device_id.clone();
        info!("📡 Starting read loop for {} on {}", device_id, self.descriptor.port_path);

        let mut backoff = Backoff::new(self.settings.policy.clone());
        let mut buffer = LineBuffer::new(self.settings.max_line_bytes);

        while !self.stop_requested() {
            match self.connector.open(&self.descriptor) {
                Ok(link) => {
                    *lock(&self.writer) = Some(link.writer);
                    if !self.transition(ChannelState::Open) {
                        break;
                    }
                    backoff.reset();

                    let result = self.read_until_failure(link.reader, &mut buffer);
                    lock(&self.writer).take();
                    buffer.clear();

                    match result {
                        Ok(()) => break,
                        Err(e) => {
                            warn!("⚠️ {}", e);
                            self.fault(&e);
                            self.transition(ChannelState::Degraded);
                        }
                    }
                }
                Err(e) => {
                    warn!("⚠️ {}: {}", device_id, e);
                    self.fault(&e);
                }
            }

            let Some(delay) = backoff.next_delay() else {
                error!(
                    "❌ Giving up on {} after {} reconnect attempts",
                    device_id,
                    backoff.attempts()
                );
                self.fault(&TelemetryError::ConnectionError(format!(
                    "{}: reconnect attempts exhausted",
                    device_id
                )));
                break;
            };

            info!(
                "🔄 Reconnecting {} in {:.1}s (attempt {}/{})",
                device_id,
                delay.as_secs_f64(),
                backoff.attempts(),
                self.settings.policy.max_retries
            );
            if !self.wait(delay) || !self.transition(ChannelState::Connecting) {
                break;
            }
            lock(&self.stats).reconnects += 1;
        }

        lock(&self.writer).take();
        self.transition(ChannelState::Closed);
        info!("✅ Read loop for {} finished", device_id);
    }

    // Ok(()) when stopped on request, Err when the link failed
    fn read_until_failure(
        &self,
        mut reader: Box<dyn LinkReader>,
        buffer: &mut LineBuffer,
    ) -> Result<(), TelemetryError> {
        let mut chunk = vec![0u8; self.settings.read_chunk_bytes];

        loop {
            if self.stop_requested() {
                return Ok(());
            }
            if self.state() != ChannelState::Open {
                return Err(TelemetryError::CommunicationError(format!(
                    "{}: link degraded by a failed write",
                    self.descriptor.device_id
                )));
            }

            let n = reader.read(&mut chunk).map_err(|e| {
                TelemetryError::CommunicationError(format!(
                    "Read from {} failed: {}",
                    self.descriptor.port_path, e
                ))
            })?;
            if n == 0 {
                continue;
            }

            {
                let mut stats = lock(&self.stats);
                stats.bytes_received += n as u64;
                stats.last_data_at = Some(Utc::now());
            }

            let extracted = buffer.extend(&chunk[..n]);
            for line in extracted.lines {
                self.handle_line(line);
            }

            if extracted.overflowed {
                lock(&self.stats).buffer_overflows += 1;
                let err = TelemetryError::BufferOverflow {
                    device_id: self.descriptor.device_id.clone(),
                    limit: self.settings.max_line_bytes,
                };
                warn!("⚠️ {}", err);
                self.fault(&err);
            }
        }
    }

    fn handle_line(&self, line: String) {
        debug!("📥 {}: {}", self.descriptor.device_id, line);

        let outcome = parser::parse_with(
            &self.settings.aliases,
            &self.descriptor.device_id,
            &line,
            Utc::now(),
        );
        {
            let mut stats = lock(&self.stats);
            stats.lines_received += 1;
            match &outcome {
                ParseOutcome::Parsed(_) => stats.samples_parsed += 1,
                ParseOutcome::Failed { reason, .. } => {
                    debug!("Unparsed line from {} ({})", self.descriptor.device_id, reason);
                    match reason {
                        ParseFailure::Empty => stats.empty_lines += 1,
                        ParseFailure::Truncated => stats.truncated_lines += 1,
                        ParseFailure::Unparseable => stats.unparseable_lines += 1,
                    }
                }
            }
        }

        self.dispatcher
            .dispatch(&self.descriptor.device_id, &DeviceEvent::Line { raw: line, outcome });
    }

    fn fault(&self, err: &TelemetryError) {
        self.dispatcher
            .dispatch(&self.descriptor.device_id, &DeviceEvent::Fault(err.to_string()));
    }

    /// Move to `to`. Returns false when the move is refused: the channel is
    /// already closed, or a stop is pending and `to` is not `Closed`.
    fn transition(&self, to: ChannelState) -> bool {
        let from = {
            let mut state = lock(&self.state);
            if *state == ChannelState::Closed {
                return false;
            }
            if to != ChannelState::Closed && self.stop_requested() {
                return false;
            }
            if *state == to {
                return true;
            }
            std::mem::replace(&mut *state, to)
        };

        info!("🔀 {}: {} -> {}", self.descriptor.device_id, from, to);
        self.dispatcher
            .dispatch(&self.descriptor.device_id, &DeviceEvent::StateChanged { from, to });
        true
    }

    // false if a stop was requested before the delay elapsed
    fn wait(&self, delay: Duration) -> bool {
        let deadline = self.clock.now() + delay;
        loop {
            if self.stop_requested() {
                return false;
            }
            let now = self.clock.now();
            if now >= deadline {
                return true;
            }
            self.clock.sleep((deadline - now).min(self.settings.stop_poll));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::backoff::ManualClock;
    use crate::devices::mock::{MockConnector, MockDevice};
    use crate::devices::sample::FieldValue;
    use crate::services::dispatcher::{handler_fn, DeviceEvent};
    use std::time::Instant;

    fn settings(max_retries: u32) -> ChannelSettings {
        ChannelSettings {
            read_chunk_bytes: 64,
            max_line_bytes: 256,
            stop_poll: Duration::from_millis(20),
            policy: ReconnectPolicy {
                initial_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(5),
                multiplier: 2.0,
                jitter: 0.2,
                max_retries,
            },
            aliases: Arc::default(),
        }
    }

    struct Rig {
        channel: Arc<DeviceChannel>,
        device: MockDevice,
        events: Arc<Mutex<Vec<DeviceEvent>>>,
    }

    fn rig(max_retries: u32) -> Rig {
        let connector = Arc::new(MockConnector::new());
        let device = connector.add("/dev/ttyUSB0");
        let dispatcher = Arc::new(Dispatcher::new());
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        dispatcher.register(
            handler_fn("recorder", move |_id: &str, event: &DeviceEvent| {
                lock(&sink).push(event.clone());
                Ok(())
            }),
            None,
        );

        let channel = Arc::new(DeviceChannel::with_clock(
            DeviceDescriptor::for_port("/dev/ttyUSB0", None),
            settings(max_retries),
            connector,
            dispatcher,
            Arc::new(ManualClock::new()),
        ));
        Rig { channel, device, events }
    }

    fn wait_until(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    fn samples(events: &Mutex<Vec<DeviceEvent>>) -> Vec<crate::devices::Sample> {
        lock(events)
            .iter()
            .filter_map(|e| match e {
                DeviceEvent::Line { outcome, .. } => outcome.sample().cloned(),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_line_buffer_keeps_partial_lines() {
        let mut buffer = LineBuffer::new(64);
        let first = buffer.extend(b"rssi:-5");
        assert!(first.lines.is_empty());
        assert_eq!(buffer.pending(), 7);

        let second = buffer.extend(b"2|ssid:Net\r\nlatency:1");
        assert_eq!(second.lines, vec!["rssi:-52|ssid:Net".to_string()]);

        let third = buffer.extend(b"2.5\r");
        assert_eq!(third.lines, vec!["latency:12.5".to_string()]);
        assert_eq!(buffer.pending(), 0);
    }

    #[test]
    fn test_line_buffer_overflow_is_bounded() {
        let mut buffer = LineBuffer::new(16);
        let mut overflows = 0;
        for _ in 0..100 {
            let extracted = buffer.extend(b"0123456789");
            assert!(extracted.lines.is_empty());
            if extracted.overflowed {
                overflows += 1;
            }
            assert!(buffer.pending() <= 16);
        }
        assert!(overflows > 0);

        // framing recovers once a terminator shows up
        buffer.clear();
        assert_eq!(buffer.extend(b"a:1\n").lines, vec!["a:1".to_string()]);
    }

    #[test]
    fn test_lines_parsed_and_dispatched_in_order() {
        let rig = rig(3);
        rig.device.set_max_read(5);
        let handle = {
            let channel = Arc::clone(&rig.channel);
            std::thread::spawn(move || channel.run())
        };

        wait_until("open", || rig.channel.state() == ChannelState::Open);
        for i in 0..20 {
            rig.device.push_line(&format!("seq:{}|rssi:-5{}", i, i % 10));
        }
        rig.device.push_line("booting...");

        wait_until("all lines", || rig.channel.stats().lines_received == 21);
        let seqs: Vec<_> = samples(&rig.events)
            .iter()
            .map(|s| s.get("seq").cloned())
            .collect();
        assert_eq!(seqs, (0..20).map(|i| Some(FieldValue::Integer(i))).collect::<Vec<_>>());

        let stats = rig.channel.stats();
        assert_eq!(stats.samples_parsed, 20);
        assert_eq!(stats.unparseable_lines, 1);

        rig.channel.request_stop();
        handle.join().unwrap();
        assert_eq!(rig.channel.state(), ChannelState::Closed);
    }

    #[test]
    fn test_runaway_line_reports_overflow() {
        let rig = rig(3);
        let handle = {
            let channel = Arc::clone(&rig.channel);
            std::thread::spawn(move || channel.run())
        };
        wait_until("open", || rig.channel.state() == ChannelState::Open);

        rig.device.push(&[b'x'; 2000]);
        wait_until("overflow", || rig.channel.stats().buffer_overflows > 0);
        assert!(lock(&rig.events)
            .iter()
            .any(|e| matches!(e, DeviceEvent::Fault(msg) if msg.contains("overflow"))));

        // still alive and framing again
        rig.device.push_line("\nrssi:-40");
        wait_until("recovered", || rig.channel.stats().samples_parsed == 1);
        assert_eq!(rig.channel.state(), ChannelState::Open);

        rig.channel.request_stop();
        handle.join().unwrap();
    }

    #[test]
    fn test_reconnects_after_unplug() {
        let rig = rig(100_000);
        let handle = {
            let channel = Arc::clone(&rig.channel);
            std::thread::spawn(move || channel.run())
        };
        wait_until("open", || rig.channel.state() == ChannelState::Open);

        rig.device.unplug();
        wait_until("degraded", || {
            lock(&rig.events).iter().any(|e| {
                matches!(e, DeviceEvent::StateChanged { to: ChannelState::Degraded, .. })
            })
        });
        rig.device.plug_in();

        wait_until("reopened", || rig.device.open_count() == 2);
        wait_until("open again", || rig.channel.state() == ChannelState::Open);
        rig.device.push_line(r#"{"rssi":-48}"#);
        wait_until("sample", || rig.channel.stats().samples_parsed == 1);
        assert!(rig.channel.stats().reconnects >= 1);

        rig.channel.request_stop();
        handle.join().unwrap();
    }

    #[test]
    fn test_retry_exhaustion_closes_channel() {
        let rig = rig(3);
        rig.device.unplug();
        rig.channel.run();

        assert_eq!(rig.channel.state(), ChannelState::Closed);
        assert_eq!(rig.device.open_count(), 0);
        assert_eq!(rig.channel.stats().reconnects, 3);
        assert!(lock(&rig.events)
            .iter()
            .any(|e| matches!(e, DeviceEvent::Fault(msg) if msg.contains("exhausted"))));
    }

    #[test]
    fn test_send_appends_terminator() {
        let rig = rig(3);
        let handle = {
            let channel = Arc::clone(&rig.channel);
            std::thread::spawn(move || channel.run())
        };
        wait_until("open", || rig.channel.state() == ChannelState::Open);

        rig.channel.send("PERF_REPORT").unwrap();
        rig.channel.send("SET_INTERVAL:1000\n").unwrap();
        assert_eq!(rig.device.written(), "PERF_REPORT\nSET_INTERVAL:1000\n");
        assert_eq!(rig.channel.stats().commands_sent, 2);

        rig.channel.request_stop();
        handle.join().unwrap();
    }

    #[test]
    fn test_write_failure_degrades_instead_of_raising() {
        let rig = rig(5);
        let handle = {
            let channel = Arc::clone(&rig.channel);
            std::thread::spawn(move || channel.run())
        };
        wait_until("open", || rig.channel.state() == ChannelState::Open);

        rig.device.set_fail_writes(true);
        assert!(rig.channel.send("SPEED_TEST").is_err());
        assert_eq!(rig.channel.stats().write_failures, 1);
        assert!(lock(&rig.events).iter().any(|e| {
            matches!(e, DeviceEvent::StateChanged { to: ChannelState::Degraded, .. })
        }));

        rig.device.set_fail_writes(false);
        wait_until("reopened", || rig.device.open_count() >= 2);
        wait_until("open again", || rig.channel.state() == ChannelState::Open);
        rig.channel.send("SPEED_TEST").unwrap();

        rig.channel.request_stop();
        handle.join().unwrap();
    }

    #[test]
    fn test_stop_wins_over_reconnect() {
        let rig = rig(100_000);
        rig.device.unplug();
        let handle = {
            let channel = Arc::clone(&rig.channel);
            std::thread::spawn(move || channel.run())
        };

        wait_until("retrying", || rig.channel.stats().reconnects >= 2);
        rig.channel.request_stop();
        handle.join().unwrap();
        assert_eq!(rig.channel.state(), ChannelState::Closed);

        let err = rig.channel.send("PERF_REPORT").unwrap_err();
        assert!(matches!(
            err,
            TelemetryError::ChannelUnavailable { state: ChannelState::Closed, .. }
        ));
    }

    #[test]
    fn test_force_close_before_start() {
        let rig = rig(3);
        rig.channel.force_close();
        assert_eq!(rig.channel.state(), ChannelState::Closed);
        // a closed channel's loop exits immediately
        rig.channel.run();
        assert_eq!(rig.device.open_count(), 0);
    }
}
