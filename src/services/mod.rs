pub mod dispatcher;
pub mod manager;
pub mod monitor;

pub use dispatcher::{handler_fn, DeviceEvent, Dispatcher, EventHandler, HandlerId};
pub use manager::{BroadcastResults, DeviceManager, StopReport};
pub use monitor::HistoryMonitor;
