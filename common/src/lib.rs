//! Common library for the `ipfs-copy` tool
//!
//! Replicates pinned content to a destination IPFS node, either from a list of CIDs or from the
//! pin set of a source node. The pipeline is:
//!
//! - a [`source::CidSource`] pushes CIDs into a bounded channel,
//! - a pool of pinning workers ([`pin::pin_all`]) drains it, every request to the destination
//!   taking a token from a shared [`throttle::RateLimiter`] first,
//! - failures end up in a [`sink::FailureSink`], one CID per line, so a later run can retry only
//!   those by passing the file back as its CID list.
//!
//! When copying from a source node the raw blocks of every pin are copied first
//! ([`blocks::replicate_blocks`]); the destination could not complete the pins otherwise.
//!
//! Per-item failures never abort a run. Only setup errors (unreadable input, unreachable node,
//! unsupported version) do, and [`run`] reports them by returning `None`.

use std::future::Future;

pub mod api;
pub mod blocks;
pub mod config;
pub mod copy;
pub mod pin;
pub mod pool;
pub mod sink;
pub mod source;
pub mod version;

#[cfg(test)]
mod testutils;

pub use config::{NodeConfig, OutputConfig, PinSettings, RuntimeConfig, ThrottleConfig};
pub use copy::{copy_from_node, pin_from_file};

fn log_filter(output: &OutputConfig) -> tracing_subscriber::EnvFilter {
    if let Ok(filter) = tracing_subscriber::EnvFilter::try_from_default_env() {
        return filter;
    }
    let level = if output.quiet {
        "off"
    } else {
        match output.verbose {
            0 => "error",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };
    tracing_subscriber::EnvFilter::new(level)
}

/// Final report of a successful run, `None` when quiet.
fn summary_report<Summary: std::fmt::Display>(
    output: &OutputConfig,
    summary: &Summary,
) -> Option<String> {
    (!output.quiet).then(|| summary.to_string())
}

/// Sets up logging and the tokio runtime, then runs `func` to completion.
///
/// The summary of a successful run is printed to stdout unless `output.quiet` is set.
/// Returns `None` if `func` failed; the error has been logged already.
pub fn run<Fut, Summary>(
    output: OutputConfig,
    runtime: RuntimeConfig,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Summary: std::fmt::Display,
    Fut: Future<Output = anyhow::Result<Summary>>,
{
    // fails only if a subscriber is already installed, which is then kept
    let _ = tracing_subscriber::fmt()
        .with_env_filter(log_filter(&output))
        .with_writer(std::io::stdout)
        .try_init();
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    let runtime = match builder.build() {
        Ok(runtime) => runtime,
        Err(error) => {
            tracing::error!("failed to start the tokio runtime: {:#}", error);
            return None;
        }
    };
    match runtime.block_on(func()) {
        Ok(summary) => {
            if let Some(report) = summary_report(&output, &summary) {
                println!("{report}");
            }
            Some(summary)
        }
        Err(error) => {
            tracing::error!("{:#}", error);
            None
        }
    }
}
