//! Configuration Module
//!
//! Configuration loading for the bridge process.

mod settings;

pub use settings::{
    BridgeConfig, ConfigError, DEFAULT_INSTRUMENT, DeribitSettings, ENV_FILE_NAME, EnvSource,
    ListenSettings, RequestSettings, ServerSettings,
};
