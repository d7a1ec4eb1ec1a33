mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

pub use settings::{
    BrokerSettings, ConnectionSettings, ConsumerSettings, QueueSettings, Settings,
};

/// Loads the configuration from the default file and environment variables
/// (e.g. `BROKER__HOST`, `CONSUMER__MAX_RETRIES`), merging whatever is
/// present with the built-in defaults. Returns a fully-populated `Settings`.
///
/// The section/field separator in environment keys is a double underscore,
/// so multi-word field names like `max_retries` keep their own single
/// underscores.
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(Environment::default().separator("__"));

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;

    // Merge with defaults
    let default = Settings::default();

    Ok(Settings {
        broker: BrokerSettings {
            host: partial
                .broker
                .as_ref()
                .and_then(|b| b.host.clone())
                .unwrap_or(default.broker.host),
            port: partial
                .broker
                .as_ref()
                .and_then(|b| b.port)
                .unwrap_or(default.broker.port),
            vhost: partial
                .broker
                .as_ref()
                .and_then(|b| b.vhost.clone())
                .unwrap_or(default.broker.vhost),
            username: partial
                .broker
                .as_ref()
                .and_then(|b| b.username.clone())
                .unwrap_or(default.broker.username),
            password: partial
                .broker
                .as_ref()
                .and_then(|b| b.password.clone())
                .unwrap_or(default.broker.password),
        },
        queue: QueueSettings {
            name: partial
                .queue
                .as_ref()
                .and_then(|q| q.name.clone())
                .unwrap_or(default.queue.name),
            durable: partial
                .queue
                .as_ref()
                .and_then(|q| q.durable)
                .unwrap_or(default.queue.durable),
        },
        consumer: ConsumerSettings {
            concurrency: partial
                .consumer
                .as_ref()
                .and_then(|c| c.concurrency)
                .unwrap_or(default.consumer.concurrency),
            max_retries: partial
                .consumer
                .as_ref()
                .and_then(|c| c.max_retries)
                .unwrap_or(default.consumer.max_retries),
            drain_timeout_ms: partial
                .consumer
                .as_ref()
                .and_then(|c| c.drain_timeout_ms)
                .unwrap_or(default.consumer.drain_timeout_ms),
        },
        connection: ConnectionSettings {
            retry_base_ms: partial
                .connection
                .as_ref()
                .and_then(|c| c.retry_base_ms)
                .unwrap_or(default.connection.retry_base_ms),
            retry_cap_ms: partial
                .connection
                .as_ref()
                .and_then(|c| c.retry_cap_ms)
                .unwrap_or(default.connection.retry_cap_ms),
            max_reconnect_attempts: partial
                .connection
                .as_ref()
                .and_then(|c| c.max_reconnect_attempts)
                .or(default.connection.max_reconnect_attempts),
            fail_fast: partial
                .connection
                .as_ref()
                .and_then(|c| c.fail_fast)
                .unwrap_or(default.connection.fail_fast),
        },
    })
}

#[cfg(test)]
mod tests;
