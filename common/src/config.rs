//! Configuration types for runtime and execution settings

use std::time::Duration;

use crate::api::{BasicAuth, Client};

/// Runtime configuration for the tokio runtime
#[derive(Debug, Clone, Copy, Default)]
pub struct RuntimeConfig {
    /// Number of worker threads (0 = number of CPU cores)
    pub max_workers: usize,
}

/// Throttling configuration for requests sent to the destination node
#[derive(Debug, Clone, Copy, Default)]
pub struct ThrottleConfig {
    /// Requests per second across all workers (0 = no throttle)
    pub max_reqs_per_sec: u32,
}

impl ThrottleConfig {
    pub fn limiter(&self) -> throttle::RateLimiter {
        throttle::RateLimiter::per_second(self.max_reqs_per_sec)
    }
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output and the final summary
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
}

/// Connection settings of one node
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// RPC API address, e.g. `http://localhost:5001`
    pub api_url: String,
    /// Credentials sent with every request, if any
    pub auth: Option<BasicAuth>,
    /// Per-request timeout
    pub timeout: Duration,
}

impl NodeConfig {
    /// Builds the RPC client for this node; no request is sent yet.
    ///
    /// # Errors
    ///
    /// Fails if the address is not a valid URL or the HTTP client cannot be built.
    pub fn connect(&self) -> anyhow::Result<Client> {
        Client::new(&self.api_url, self.auth.clone(), self.timeout)
    }
}

/// Settings shared by both copy flows
#[derive(Debug, Clone, Copy)]
pub struct PinSettings {
    /// Number of concurrent pinning (and block copying) workers
    pub workers: usize,
    /// Skip copying raw blocks before pinning (source-node mode only)
    pub skip_blocks: bool,
}

impl Default for PinSettings {
    fn default() -> Self {
        Self {
            workers: 20,
            skip_blocks: false,
        }
    }
}

impl PinSettings {
    /// Validate configuration and return errors if invalid
    pub fn validate(&self) -> Result<(), String> {
        if self.workers == 0 {
            return Err("at least one worker is required".to_string());
        }
        Ok(())
    }
}
