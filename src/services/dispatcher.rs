use log::{debug, error, warn};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::devices::parser::ParseOutcome;
use crate::devices::ChannelState;
use crate::utils::error::TelemetryError;
use crate::utils::{read, write};

/// Everything a channel reports to its consumers.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// One framed line and what the parser made of it.
    Line { raw: String, outcome: ParseOutcome },
    StateChanged { from: ChannelState, to: ChannelState },
    Fault(String),
}

impl DeviceEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            DeviceEvent::Line { .. } => "line",
            DeviceEvent::StateChanged { .. } => "state",
            DeviceEvent::Fault(_) => "fault",
        }
    }
}

/// Consumer of device events.
///
/// Handlers are invoked on the channel's reader thread and must not block for
/// long. An `Err` or a panic is logged and counted, never propagated.
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str;
    fn handle(&self, device_id: &str, event: &DeviceEvent) -> Result<(), TelemetryError>;
}

/// Adapts a closure to [`EventHandler`].
pub struct FnHandler<F> {
    name: String,
    func: F,
}

impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&str, &DeviceEvent) -> Result<(), TelemetryError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn handle(&self, device_id: &str, event: &DeviceEvent) -> Result<(), TelemetryError> {
        (self.func)(device_id, event)
    }
}

pub fn handler_fn<F>(name: &str, func: F) -> Arc<dyn EventHandler>
where
    F: Fn(&str, &DeviceEvent) -> Result<(), TelemetryError> + Send + Sync + 'static,
{
    Arc::new(FnHandler {
        name: name.to_string(),
        func,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

#[derive(Default)]
struct Registry {
    global: Vec<(HandlerId, Arc<dyn EventHandler>)>,
    per_device: HashMap<String, Vec<(HandlerId, Arc<dyn EventHandler>)>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub delivered: u64,
    pub failures: u64,
}

/// Fans device events out to global and per-device handlers.
///
/// Global handlers run before per-device ones, each group in registration
/// order. Registration may happen while events are flowing; a dispatch uses
/// the handler set as it was when the dispatch began.
#[derive(Default)]
pub struct Dispatcher {
    registry: RwLock<Registry>,
    next_id: AtomicU64,
    delivered: AtomicU64,
    failures: AtomicU64,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for every device, or for `device_id` only.
    pub fn register(&self, handler: Arc<dyn EventHandler>, device_id: Option<&str>) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut registry = write(&self.registry);
        match device_id {
            Some(device_id) => {
                debug!("Registered handler '{}' for {}", handler.name(), device_id);
                registry
                    .per_device
                    .entry(device_id.to_string())
                    .or_default()
                    .push((id, handler));
            }
            None => {
                debug!("Registered global handler '{}'", handler.name());
                registry.global.push((id, handler));
            }
        }
        id
    }

    /// Returns false if `id` was not registered.
    pub fn unregister(&self, id: HandlerId) -> bool {
        let mut registry = write(&self.registry);
        let before = registry.global.len();
        registry.global.retain(|(h, _)| *h != id);
        if registry.global.len() != before {
            return true;
        }

        let mut removed = false;
        registry.per_device.retain(|_, handlers| {
            let before = handlers.len();
            handlers.retain(|(h, _)| *h != id);
            removed |= handlers.len() != before;
            !handlers.is_empty()
        });
        removed
    }

    pub fn handler_count(&self) -> usize {
        let registry = read(&self.registry);
        registry.global.len() + registry.per_device.values().map(Vec::len).sum::<usize>()
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    pub fn dispatch(&self, device_id: &str, event: &DeviceEvent) {
        let handlers: Vec<Arc<dyn EventHandler>> = {
            let registry = read(&self.registry);
            registry
                .global
                .iter()
                .chain(registry.per_device.get(device_id).into_iter().flatten())
                .map(|(_, handler)| Arc::clone(handler))
                .collect()
        };

        for handler in handlers {
            let result = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(device_id, event)));
            match result {
                Ok(Ok(())) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                }
                Ok(Err(e)) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "⚠️ Handler '{}' failed on {} event from {}: {}",
                        handler.name(),
                        event.kind(),
                        device_id,
                        e
                    );
                }
                Err(_) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    error!(
                        "❌ Handler '{}' panicked on {} event from {}",
                        handler.name(),
                        event.kind(),
                        device_id
                    );
                }
            }
        }
    }
}
