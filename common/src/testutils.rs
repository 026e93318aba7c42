use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use cid::Cid;
use futures::StreamExt;

use crate::api::{
    ApiError, BlockSource, BlockTarget, Node, PinInfo, PinLister, PinStream, PinTarget, RefEntry,
    RefStream, StreamedPin,
};

/// Deterministic CIDv1 (raw codec, sha2-256 sized digest) derived from `i`.
pub fn test_cid(i: u64) -> Cid {
    let mut digest = [0u8; 32];
    digest[..8].copy_from_slice(&i.to_be_bytes());
    let hash = cid::multihash::Multihash::<64>::wrap(0x12, &digest).unwrap();
    Cid::new_v1(0x55, hash)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    BlockPut(Cid),
    Pin(Cid),
}

fn http_error(message: &str) -> ApiError {
    ApiError::Http {
        status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
        message: message.to_string(),
    }
}

/// In-memory stand-in for a node, usable both as copy source and destination.
#[derive(Default)]
pub struct MockNode {
    pub version: String,
    pub unreachable: bool,
    /// Pin set as (cid string, type string), as the node would list it.
    pub pins: Vec<(String, String)>,
    pub fail_listing: bool,
    /// Listings past this many fail as if `fail_listing` were set.
    pub fail_listing_after: Option<usize>,
    pub(crate) listings: AtomicUsize,
    pub failing_pins: HashSet<Cid>,
    /// Block contents and the refs reachable from each block.
    pub blocks: HashMap<Cid, (Bytes, Vec<Cid>)>,
    pub failing_blocks: HashSet<Cid>,
    pub pin_delay: Option<std::time::Duration>,
    pub events: Mutex<Vec<Event>>,
    pub stored: Mutex<HashMap<Cid, Bytes>>,
    pub(crate) in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl MockNode {
    pub fn with_version(version: &str) -> Self {
        Self {
            version: version.to_string(),
            ..Default::default()
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn listing_fails(&self) -> bool {
        let listed = self.listings.fetch_add(1, Ordering::SeqCst);
        self.fail_listing || self.fail_listing_after.is_some_and(|max| listed >= max)
    }

    pub fn pin_attempts(&self) -> Vec<Cid> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Pin(cid) => Some(cid),
                Event::BlockPut(_) => None,
            })
            .collect()
    }
}

impl Node for MockNode {
    async fn version(&self) -> Result<String, ApiError> {
        if self.unreachable {
            return Err(http_error("401 Unauthorized"));
        }
        Ok(self.version.clone())
    }
}

impl PinTarget for MockNode {
    async fn pin(&self, cid: &Cid) -> Result<(), ApiError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.pin_delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.events.lock().unwrap().push(Event::Pin(*cid));
        if self.failing_pins.contains(cid) {
            return Err(http_error("pin: merkledag: not found"));
        }
        Ok(())
    }
}

impl PinLister for MockNode {
    async fn list_pins_streamed(&self) -> Result<PinStream, ApiError> {
        if self.listing_fails() {
            return Err(http_error("connection refused"));
        }
        let items: Vec<Result<StreamedPin, ApiError>> = self
            .pins
            .iter()
            .map(|(cid, kind)| {
                if cid.is_empty() {
                    Err(ApiError::Decode("missing Cid".to_string()))
                } else {
                    Ok(StreamedPin {
                        cid: cid.clone(),
                        kind: kind.clone(),
                    })
                }
            })
            .collect();
        Ok(futures::stream::iter(items).boxed())
    }

    async fn list_pins(&self) -> Result<HashMap<String, PinInfo>, ApiError> {
        if self.listing_fails() {
            return Err(http_error("connection refused"));
        }
        Ok(self
            .pins
            .iter()
            .map(|(cid, kind)| (cid.clone(), PinInfo { kind: kind.clone() }))
            .collect())
    }
}

impl BlockSource for MockNode {
    async fn refs(&self, cid: &Cid) -> Result<RefStream, ApiError> {
        let Some((_, links)) = self.blocks.get(cid) else {
            return Err(http_error("block not found"));
        };
        // depth-first walk, unique like `refs -r --unique`
        let mut seen = HashSet::new();
        let mut stack: Vec<Cid> = links.iter().rev().copied().collect();
        let mut items: Vec<Result<RefEntry, ApiError>> = vec![];
        while let Some(next) = stack.pop() {
            if !seen.insert(next) {
                continue;
            }
            items.push(Ok(RefEntry {
                cid: next.to_string(),
                err: String::new(),
            }));
            if let Some((_, children)) = self.blocks.get(&next) {
                stack.extend(children.iter().rev().copied());
            }
        }
        Ok(futures::stream::iter(items).boxed())
    }

    async fn get_block(&self, cid: &Cid) -> Result<Bytes, ApiError> {
        match self.blocks.get(cid) {
            Some((data, _)) if !self.failing_blocks.contains(cid) => Ok(data.clone()),
            _ => Err(http_error("block not found")),
        }
    }
}

impl BlockTarget for MockNode {
    async fn put_block(&self, cid: &Cid, data: Bytes) -> Result<(), ApiError> {
        self.events.lock().unwrap().push(Event::BlockPut(*cid));
        self.stored.lock().unwrap().insert(*cid, data);
        Ok(())
    }
}
