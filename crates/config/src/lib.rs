//! Node configuration: TOML file, env-var overrides on top.

mod config;

pub use config::{
    ClientConfig, Config, ConfigError, FeaturesConfig, P2pConfig, SteemConfig, WitnessConfig,
};
