//! Configuration schema definitions.
//!
//! This module defines the configuration structure for the router and the
//! worker process. All types derive Serde traits for deserialization from
//! config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the edge router.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RouterConfig {
    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// Worker pool sizing and selection.
    pub pool: PoolConfig,

    /// Worker idle/lifetime timers.
    pub lifecycle: LifecycleConfig,

    /// Cold start invocation settings.
    pub bootstrap: BootstrapConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Registry persistence.
    pub storage: StorageConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    #[serde(default)]
    pub admin: AdminConfig,

    #[serde(default)]
    pub limits: LimitsConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Worker selection strategy.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionStrategy {
    /// First qualifying worker, ordered by worker id.
    #[default]
    FirstAvailable,
    /// Qualifying worker with the fewest active connections.
    LeastConnections,
}

/// Worker pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum concurrent requests multiplexed onto one worker.
    pub max_connections_per_worker: u32,

    /// How a ready worker is chosen for a new request.
    pub policy: SelectionStrategy,

    /// Body chunks buffered per request before the request is aborted.
    pub max_buffered_chunks: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_worker: 5,
            policy: SelectionStrategy::default(),
            max_buffered_chunks: 1024,
        }
    }
}

/// Worker lifetime timers.
///
/// Shared by the router and worker configs so both sides read the same values.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Grace period after the last open stream before the worker closes.
    pub idle_grace_ms: u64,

    /// Hard ceiling on a worker connection's lifetime.
    pub hard_lifetime_ms: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            idle_grace_ms: 5_000,
            hard_lifetime_ms: 600_000,
        }
    }
}

/// Cold start invocation configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// URL receiving the `initial` payload (e.g., "http://127.0.0.1:9000/invoke").
    pub invoke_url: String,

    /// Host workers dial back to. Falls back to the request's Host header.
    pub public_host: Option<String>,

    /// Upper bound on one invocation, which lasts as long as the worker.
    pub timeout_secs: u64,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            invoke_url: "http://127.0.0.1:9000/invoke".to_string(),
            public_host: None,
            timeout_secs: 900,
        }
    }
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Time to wait for a worker to answer with headers, in seconds.
    pub admit_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { admit_secs: 30 }
    }
}

/// Registry persistence configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct StorageConfig {
    /// JSON file holding worker records. In-memory when unset.
    pub path: Option<String>,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable admin routes.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
        }
    }
}

/// Request limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum client request body forwarded to a worker, in bytes.
    pub max_body_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_body_size: 2 * 1024 * 1024, // 2MB
        }
    }
}

/// Configuration for the backend worker process.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Address the invocation endpoint listens on.
    pub bind_address: String,

    /// Attempts to open the duplex connection before giving up.
    pub connect_attempts: u32,

    /// Base delay for connect backoff in milliseconds.
    pub connect_base_delay_ms: u64,

    /// Maximum delay for connect backoff in milliseconds.
    pub connect_max_delay_ms: u64,

    pub lifecycle: LifecycleConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:9000".to_string(),
            connect_attempts: 3,
            connect_base_delay_ms: 100,
            connect_max_delay_ms: 2_000,
            lifecycle: LifecycleConfig::default(),
        }
    }
}
