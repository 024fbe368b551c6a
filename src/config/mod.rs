pub mod settings;

pub use settings::{
    Config,
    KnownDevice,
    LogFormat,
    LoggingConfig,
    PortConfig,
    ReconnectConfig,
};
