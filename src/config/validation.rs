//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (capacities > 0, timers ordered)
//! - Validate addresses and URLs before anything binds or dials
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is a pure function over the loaded config

use std::net::SocketAddr;

use crate::config::schema::{LifecycleConfig, RouterConfig, WorkerConfig};

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn check_lifecycle(lifecycle: &LifecycleConfig, errors: &mut Vec<ValidationError>) {
    if lifecycle.idle_grace_ms == 0 {
        errors.push(ValidationError::new("lifecycle.idle_grace_ms", "must be greater than 0"));
    }
    if lifecycle.hard_lifetime_ms < lifecycle.idle_grace_ms {
        errors.push(ValidationError::new(
            "lifecycle.hard_lifetime_ms",
            "must not be shorter than idle_grace_ms",
        ));
    }
}

fn check_addr(field: &'static str, value: &str, errors: &mut Vec<ValidationError>) {
    if value.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(field, format!("invalid socket address '{}'", value)));
    }
}

/// Validate a router configuration.
pub fn validate_router_config(config: &RouterConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_addr("listener.bind_address", &config.listener.bind_address, &mut errors);

    if config.pool.max_connections_per_worker == 0 {
        errors.push(ValidationError::new(
            "pool.max_connections_per_worker",
            "must be greater than 0",
        ));
    }
    if config.pool.max_buffered_chunks == 0 {
        errors.push(ValidationError::new("pool.max_buffered_chunks", "must be greater than 0"));
    }

    check_lifecycle(&config.lifecycle, &mut errors);

    if url::Url::parse(&config.bootstrap.invoke_url).is_err() {
        errors.push(ValidationError::new(
            "bootstrap.invoke_url",
            format!("invalid URL '{}'", config.bootstrap.invoke_url),
        ));
    }
    // Skipped when the lifecycle itself is invalid.
    if config.lifecycle.hard_lifetime_ms >= config.lifecycle.idle_grace_ms
        && config.bootstrap.timeout_secs.saturating_mul(1000) < config.lifecycle.hard_lifetime_ms
    {
        errors.push(ValidationError::new(
            "bootstrap.timeout_secs",
            "must cover lifecycle.hard_lifetime_ms",
        ));
    }
    if config.timeouts.admit_secs == 0 {
        errors.push(ValidationError::new("timeouts.admit_secs", "must be greater than 0"));
    }
    if config.observability.metrics_enabled {
        check_addr("observability.metrics_address", &config.observability.metrics_address, &mut errors);
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Validate a worker configuration.
pub fn validate_worker_config(config: &WorkerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    check_addr("bind_address", &config.bind_address, &mut errors);

    if config.connect_attempts == 0 {
        errors.push(ValidationError::new("connect_attempts", "must be greater than 0"));
    }
    check_lifecycle(&config.lifecycle, &mut errors);

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
