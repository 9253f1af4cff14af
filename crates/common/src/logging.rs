use tracing::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

pub struct LoggerConfig {
    whoami: String,
}

impl LoggerConfig {
    pub fn with_base_name(whoami: &str) -> Self {
        Self {
            whoami: whoami.to_owned(),
        }
    }
}

/// Initializes the logging subsystem with the provided config.
pub fn init(config: LoggerConfig) {
    let filt = tracing_subscriber::EnvFilter::from_default_env();

    // Stdout logging.
    let stdout_sub = tracing_subscriber::fmt::layer().compact().with_filter(filt);

    tracing_subscriber::registry().with(stdout_sub).init();

    info!(whoami = %config.whoami, "logging started");
}

/// Shuts down the logging subsystem, flushing as needed.
pub fn finalize() {
    info!("shutting down logging");
}
