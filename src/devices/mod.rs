pub mod backoff;
pub mod channel;
pub mod commands;
pub mod descriptor;
pub mod parser;
pub mod sample;
pub mod transport;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use backoff::{Backoff, Clock, ManualClock, ReconnectPolicy, SystemClock};
pub use channel::{ChannelSettings, ChannelSnapshot, ChannelState, ChannelStats, DeviceChannel};
pub use commands::DeviceCommand;
pub use descriptor::{DeviceDescriptor, EnumeratedPort, IdentityTable, PortEnumerator, SystemPortEnumerator};
pub use parser::{FieldAliases, ParseFailure, ParseOutcome};
pub use sample::{FieldValue, Sample, SampleFields};
pub use transport::{Connector, Link, SerialPortConnector};
