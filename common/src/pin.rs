//! Pinning workers: one throttled `pin/add` per CID, failures counted and recorded

use std::sync::Arc;

use cid::Cid;
use tracing::instrument;

use crate::api::PinTarget;
use crate::pool;
use crate::sink::FailureSink;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub pins_succeeded: u64,
    pub pins_failed: u64,
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            pins_succeeded: self.pins_succeeded + other.pins_succeeded,
            pins_failed: self.pins_failed + other.pins_failed,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "pins succeeded: {}\n\
            pins failed: {}",
            self.pins_succeeded, self.pins_failed,
        )
    }
}

/// Pins one CID. Failures are recorded in `sink`, never retried.
pub async fn pin_cid<T: PinTarget>(
    target: &T,
    cid: Cid,
    limiter: &throttle::RateLimiter,
    sink: &FailureSink,
) -> Summary {
    limiter.get_token().await;
    match target.pin(&cid).await {
        Ok(()) => {
            tracing::info!("pinned: '{}'", cid);
            Summary {
                pins_succeeded: 1,
                ..Default::default()
            }
        }
        Err(error) => {
            tracing::error!(
                "failed pinning CID '{}': {}",
                cid,
                error.to_string().trim()
            );
            if let Err(error) = sink.write(&cid).await {
                tracing::error!("unable to record failed pin of '{}': {:#}", cid, error);
            }
            Summary {
                pins_failed: 1,
                ..Default::default()
            }
        }
    }
}

/// Pins everything received on `cids` with `workers` concurrent workers.
///
/// Returns once the channel is closed and every worker finished its last pin, so the summary is
/// final and the sink holds every failure (flushing it is up to the caller).
#[instrument(skip(target, cids, limiter, sink))]
pub async fn pin_all<T: PinTarget>(
    target: Arc<T>,
    cids: async_channel::Receiver<Cid>,
    workers: usize,
    limiter: throttle::RateLimiter,
    sink: Arc<FailureSink>,
) -> anyhow::Result<Summary> {
    tracing::info!("pinning with {} workers", workers);
    pool::drain(workers, cids, move |cid| {
        let target = target.clone();
        let limiter = limiter.clone();
        let sink = sink.clone();
        async move { pin_cid(target.as_ref(), cid, &limiter, &sink).await }
    })
    .await
}
