//! Block replication pass.
//!
//! Copies the raw blocks of every eligible pin from the source node to the destination. Pinning
//! a CID on the destination only succeeds once all of its blocks are there, so the source-node
//! flow runs this pass to completion before it issues any pin request.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Context;
use cid::Cid;
use futures::StreamExt;
use tracing::instrument;

use crate::api::{ApiError, BlockSource, BlockTarget};
use crate::pool;
use crate::sink::FailureSink;
use crate::source::{CidSource, PinListing};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub blocks_copied: u64,
    pub blocks_failed: u64,
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            blocks_copied: self.blocks_copied + other.blocks_copied,
            blocks_failed: self.blocks_failed + other.blocks_failed,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "blocks copied: {}\n\
            blocks failed: {}",
            self.blocks_copied, self.blocks_failed,
        )
    }
}

async fn record_failure(sink: &FailureSink, cid: &Cid) {
    if let Err(error) = sink.write(cid).await {
        tracing::error!("unable to record failed block '{}': {:#}", cid, error);
    }
}

const FAILED: Summary = Summary {
    blocks_copied: 0,
    blocks_failed: 1,
};

/// Sends `cid` on unless it was seen before. Returns false once nobody is receiving anymore.
async fn forward(
    cid: Cid,
    seen: &mut HashSet<Cid>,
    blocks: &async_channel::Sender<Cid>,
) -> bool {
    if !seen.insert(cid) {
        return true;
    }
    if blocks.send(cid).await.is_err() {
        tracing::warn!("no block workers left, stopping block enumeration");
        return false;
    }
    true
}

/// Turns pin roots into the unique set of blocks reachable from them, root first.
///
/// A root whose references cannot be listed is recorded as failed and none of its blocks are
/// emitted.
#[instrument(skip_all)]
async fn expand_refs<S: BlockSource>(
    source: &S,
    roots: async_channel::Receiver<Cid>,
    blocks: async_channel::Sender<Cid>,
    sink: &FailureSink,
) -> Summary {
    let mut seen = HashSet::new();
    let mut summary = Summary::default();
    'roots: while let Ok(root) = roots.recv().await {
        let mut refs = match source.refs(&root).await {
            Ok(refs) => refs,
            Err(error) => {
                tracing::error!(
                    "failed listing blocks of '{}': {}",
                    root,
                    error.to_string().trim()
                );
                record_failure(sink, &root).await;
                summary = summary + FAILED;
                continue;
            }
        };
        if !forward(root, &mut seen, &blocks).await {
            break;
        }
        while let Some(entry) = refs.next().await {
            match entry {
                Ok(entry) if entry.err.is_empty() => match Cid::try_from(entry.cid.as_str()) {
                    Ok(cid) => {
                        if !forward(cid, &mut seen, &blocks).await {
                            break 'roots;
                        }
                    }
                    Err(error) => {
                        tracing::error!("failed parsing block ref {:?}: {}", entry.cid, error);
                        summary = summary + FAILED;
                    }
                },
                Ok(entry) => {
                    tracing::error!("failed listing a block of '{}': {}", root, entry.err.trim());
                    summary = summary + FAILED;
                }
                Err(error) if error.is_entry_error() => {
                    tracing::error!("failed listing a block of '{}': {:#}", root, error);
                    summary = summary + FAILED;
                }
                Err(error) => {
                    tracing::error!("listing blocks of '{}' interrupted: {:#}", root, error);
                    record_failure(sink, &root).await;
                    summary = summary + FAILED;
                    break;
                }
            }
        }
    }
    blocks.close();
    tracing::debug!("enumerated {} unique blocks", seen.len());
    summary
}

async fn transfer_block<S: BlockSource, D: BlockTarget>(
    source: &S,
    target: &D,
    cid: &Cid,
    limiter: &throttle::RateLimiter,
) -> Result<(), ApiError> {
    let data = source.get_block(cid).await?;
    limiter.get_token().await;
    target.put_block(cid, data).await
}

/// Copies one block, recording it in `sink` on failure.
pub async fn copy_block<S: BlockSource, D: BlockTarget>(
    source: &S,
    target: &D,
    cid: Cid,
    limiter: &throttle::RateLimiter,
    sink: &FailureSink,
) -> Summary {
    match transfer_block(source, target, &cid, limiter).await {
        Ok(()) => {
            tracing::debug!("copied block '{}'", cid);
            Summary {
                blocks_copied: 1,
                ..Default::default()
            }
        }
        Err(error) => {
            tracing::error!(
                "failed copying block '{}': {}",
                cid,
                error.to_string().trim()
            );
            record_failure(sink, &cid).await;
            FAILED
        }
    }
}

/// Copies every block reachable from the pins in `listing` to `target`.
///
/// Returns only after every block was either copied or recorded as failed.
#[instrument(skip(source, target, listing, limiter, sink))]
pub async fn replicate_blocks<S: BlockSource, D: BlockTarget>(
    source: Arc<S>,
    target: Arc<D>,
    listing: PinListing,
    workers: usize,
    limiter: throttle::RateLimiter,
    sink: Arc<FailureSink>,
) -> anyhow::Result<Summary> {
    let (roots_tx, roots_rx) = async_channel::bounded(1);
    let (blocks_tx, blocks_rx) = async_channel::bounded(workers.max(1));
    let roots = CidSource::Pins(listing).spawn(roots_tx);
    let expander = {
        let source = source.clone();
        let sink = sink.clone();
        tokio::spawn(async move { expand_refs(source.as_ref(), roots_rx, blocks_tx, &sink).await })
    };
    let copied = pool::drain(workers, blocks_rx, move |cid| {
        let source = source.clone();
        let target = target.clone();
        let limiter = limiter.clone();
        let sink = sink.clone();
        async move { copy_block(source.as_ref(), target.as_ref(), cid, &limiter, &sink).await }
    })
    .await?;
    let expanded = expander.await.context("block enumeration task failed")?;
    let pins = roots.await.context("pin enumeration task failed")?;
    tracing::debug!("block pass pin enumeration: {:?}", pins);
    Ok(copied + expanded)
}
