//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → RouterConfig / WorkerConfig (validated, immutable)
//!     → shared by value or Arc with all subsystems
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded
//! - All fields have defaults to allow minimal configs
//! - Worker timers live in one `LifecycleConfig` used by both binaries

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, load_worker_config, ConfigError};
pub use schema::{
    AdminConfig, BootstrapConfig, LifecycleConfig, LimitsConfig, ListenerConfig,
    ObservabilityConfig, PoolConfig, RouterConfig, SelectionStrategy, StorageConfig,
    TimeoutConfig, WorkerConfig,
};
