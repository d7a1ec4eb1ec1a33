use serde::Deserialize;

/// Top-level configuration for both roles.
///
/// Covers the broker endpoint, the queue both roles declare, the consumer
/// worker pool, and the connection retry behavior.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub broker: BrokerSettings,
    pub queue: QueueSettings,
    pub consumer: ConsumerSettings,
    pub connection: ConnectionSettings,
}

/// Where the broker lives and how to authenticate against it.
#[derive(Debug, Deserialize, Clone)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub vhost: String,
    pub username: String,
    pub password: String,
}

/// The single named queue this core works against.
#[derive(Debug, Deserialize, Clone)]
pub struct QueueSettings {
    pub name: String,
    pub durable: bool,
}

/// Worker pool parameters for the consumer role.
#[derive(Debug, Deserialize, Clone)]
pub struct ConsumerSettings {
    /// Maximum handler invocations in flight; also the channel prefetch.
    pub concurrency: u32,
    /// Redeliveries allowed before a message is dead-lettered.
    pub max_retries: u32,
    /// Grace period for draining in-flight handlers on cancellation.
    pub drain_timeout_ms: u64,
}

/// Reconnect behavior of the transport session.
#[derive(Debug, Deserialize, Clone)]
pub struct ConnectionSettings {
    pub retry_base_ms: u64,
    pub retry_cap_ms: u64,
    /// `None` retries forever.
    pub max_reconnect_attempts: Option<u32>,
    /// When set, operations fail immediately while the connection is down
    /// instead of queueing locally until recovery.
    pub fail_fast: bool,
}

/// Partial configuration loaded from files or environment.
///
/// Allows partial specification of settings. Missing values are filled
/// from [`Settings::default`].
#[derive(Debug, Deserialize)]
pub struct PartialSettings {
    pub broker: Option<PartialBrokerSettings>,
    pub queue: Option<PartialQueueSettings>,
    pub consumer: Option<PartialConsumerSettings>,
    pub connection: Option<PartialConnectionSettings>,
}

#[derive(Debug, Deserialize)]
pub struct PartialBrokerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub vhost: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PartialQueueSettings {
    pub name: Option<String>,
    pub durable: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct PartialConsumerSettings {
    pub concurrency: Option<u32>,
    pub max_retries: Option<u32>,
    pub drain_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PartialConnectionSettings {
    pub retry_base_ms: Option<u64>,
    pub retry_cap_ms: Option<u64>,
    pub max_reconnect_attempts: Option<u32>,
    pub fail_fast: Option<bool>,
}

/// Defaults mirror the classic single-queue tutorial setup: a local broker
/// on the standard port, guest credentials, one durable queue, prefetch 1.
impl Default for Settings {
    fn default() -> Self {
        Self {
            broker: BrokerSettings::default(),
            queue: QueueSettings {
                name: "my-queue".to_string(),
                durable: true,
            },
            consumer: ConsumerSettings {
                concurrency: 1,
                max_retries: 3,
                drain_timeout_ms: 5000,
            },
            connection: ConnectionSettings {
                retry_base_ms: 1000,
                retry_cap_ms: 30_000,
                max_reconnect_attempts: None,
                fail_fast: false,
            },
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            vhost: "/".to_string(),
            username: "guest".to_string(),
            password: "guest".to_string(),
        }
    }
}
