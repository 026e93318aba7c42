//! The two copy flows: pinning the CIDs listed in a file, and copying the pin set of a source
//! node.
//!
//! Both flows check that the destination answers before any worker starts, run the CID source
//! on its own task feeding the pinning workers, and flush the failure sink once every worker
//! has been joined.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use cid::Cid;
use tracing::instrument;

use crate::api::{BlockSource, BlockTarget, Node, PinLister, PinTarget};
use crate::blocks;
use crate::config::PinSettings;
use crate::pin;
use crate::sink::FailureSink;
use crate::source::{self, CidSource, PinListing};
use crate::version;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub source: source::Summary,
    pub blocks: blocks::Summary,
    pub pins: pin::Summary,
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}\n{}\n{}", self.source, self.blocks, self.pins)
    }
}

/// Queries the destination version, failing early on bad credentials or an unreachable node.
///
/// # Errors
///
/// Fails if the destination does not answer successfully.
#[instrument(skip(target))]
pub async fn validate_destination<T: Node>(target: &T) -> anyhow::Result<()> {
    let version = target
        .version()
        .await
        .context("cannot query the destination node, check its API URL and credentials")?;
    tracing::info!("destination node version: {}", version);
    Ok(())
}

async fn flush_failures(sink: &FailureSink) {
    if let Err(error) = sink.flush().await {
        tracing::error!("failed to flush the failed CIDs file: {:#}", error);
    }
    if let Some(path) = sink.path() {
        let recorded = sink.recorded();
        if recorded > 0 {
            tracing::warn!("{} failed CIDs recorded in {:?}", recorded, path);
        }
    }
}

/// Feeds `source` to `workers` pinning workers and waits for both sides to finish.
async fn run_pin_phase<T: PinTarget>(
    target: Arc<T>,
    source: CidSource,
    workers: usize,
    limiter: throttle::RateLimiter,
    sink: Arc<FailureSink>,
) -> anyhow::Result<(source::Summary, pin::Summary)> {
    let (tx, rx) = async_channel::bounded::<Cid>(1);
    let producer = source.spawn(tx);
    let pins = pin::pin_all(target, rx, workers, limiter, sink).await?;
    let emitted = producer.await.context("CID source task failed")?;
    Ok((emitted, pins))
}

/// Pins every CID listed in the file at `path` on `target`.
///
/// # Errors
///
/// Fails on setup errors only: unreadable file or unreachable destination. Pins that fail are
/// counted and recorded in `sink`.
#[instrument(skip(target, settings, limiter, sink))]
pub async fn pin_from_file<T: PinTarget>(
    target: Arc<T>,
    path: &Path,
    settings: &PinSettings,
    limiter: throttle::RateLimiter,
    sink: Arc<FailureSink>,
) -> anyhow::Result<Summary> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("cannot open CIDs file {path:?}"))?;
    let source = CidSource::from_reader(file).await?;
    validate_destination(target.as_ref()).await?;
    let result = run_pin_phase(target, source, settings.workers, limiter, sink.clone()).await;
    flush_failures(&sink).await;
    let (source, pins) = result?;
    Ok(Summary {
        source,
        pins,
        ..Default::default()
    })
}

/// Copies the pin set of `source` to `target`.
///
/// Unless `settings.skip_blocks` is set, every block of every eligible pin is copied first and
/// no pin request is sent before that pass has completed.
///
/// # Errors
///
/// Fails on setup errors only: unreachable nodes, unparseable source version or a pin listing
/// that cannot be started.
#[instrument(skip(source, target, settings, limiter, sink))]
pub async fn copy_from_node<S, T>(
    source: Arc<S>,
    target: Arc<T>,
    settings: &PinSettings,
    limiter: throttle::RateLimiter,
    sink: Arc<FailureSink>,
) -> anyhow::Result<Summary>
where
    S: PinLister + BlockSource,
    T: PinTarget + BlockTarget,
{
    validate_destination(target.as_ref()).await?;
    let raw_version = source
        .version()
        .await
        .context("cannot query the source node version")?;
    let source_version = version::parse_node_version(&raw_version)?;
    let streaming = version::has_streaming_pin_listing(&source_version);
    tracing::info!(
        "source node version: {} ({} pin listing)",
        source_version,
        if streaming { "streamed" } else { "bulk" }
    );
    let result =
        replicate_pin_set(source, target, streaming, settings, limiter, sink.clone()).await;
    // failures recorded by the block pass are kept even if pinning cannot start
    flush_failures(&sink).await;
    result
}

/// Block pass followed by the pin pass, both reading their own listing of `source`.
async fn replicate_pin_set<S, T>(
    source: Arc<S>,
    target: Arc<T>,
    streaming: bool,
    settings: &PinSettings,
    limiter: throttle::RateLimiter,
    sink: Arc<FailureSink>,
) -> anyhow::Result<Summary>
where
    S: PinLister + BlockSource,
    T: PinTarget + BlockTarget,
{
    let blocks = if settings.skip_blocks {
        tracing::info!("skipping block replication");
        blocks::Summary::default()
    } else {
        let listing = PinListing::establish(source.as_ref(), streaming).await?;
        let blocks = blocks::replicate_blocks(
            source.clone(),
            target.clone(),
            listing,
            settings.workers,
            limiter.clone(),
            sink.clone(),
        )
        .await?;
        tracing::info!(
            "block replication done: {} copied, {} failed",
            blocks.blocks_copied,
            blocks.blocks_failed
        );
        blocks
    };
    let listing = PinListing::establish(source.as_ref(), streaming).await?;
    let (emitted, pins) = run_pin_phase(
        target,
        CidSource::Pins(listing),
        settings.workers,
        limiter,
        sink,
    )
    .await?;
    Ok(Summary {
        source: emitted,
        blocks,
        pins,
    })
}
