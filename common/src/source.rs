//! Producers of the CIDs to pin.
//!
//! A [`CidSource`] is either a line-delimited file or a listing of the pins held by a remote
//! node. Whatever the variant, it pushes every eligible CID onto the distribution channel and
//! closes the channel (by dropping its sender) once exhausted. Entries that cannot be used are
//! logged and counted, they never stop the producer.

use std::collections::HashMap;

use anyhow::Context;
use cid::Cid;
use futures::StreamExt;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncSeek, AsyncSeekExt};
use tracing::instrument;

use crate::api::{PinInfo, PinLister, PinStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinKind {
    Recursive,
    Direct,
    /// Held only because an ancestor is pinned recursively, never pinned on its own.
    Indirect,
}

impl std::str::FromStr for PinKind {
    type Err = anyhow::Error;

    fn from_str(kind: &str) -> Result<Self, Self::Err> {
        match kind {
            "recursive" => Ok(PinKind::Recursive),
            "direct" => Ok(PinKind::Direct),
            // listings of explicit keys report "indirect through <cid>"
            kind if kind.starts_with("indirect") => Ok(PinKind::Indirect),
            other => Err(anyhow::anyhow!("unknown pin type {other:?}")),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub emitted: u64,
    pub indirect_skipped: u64,
    pub invalid_skipped: u64,
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            emitted: self.emitted + other.emitted,
            indirect_skipped: self.indirect_skipped + other.indirect_skipped,
            invalid_skipped: self.invalid_skipped + other.invalid_skipped,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "CIDs emitted: {}\n\
            indirect pins skipped: {}\n\
            invalid entries skipped: {}",
            self.emitted, self.indirect_skipped, self.invalid_skipped,
        )
    }
}

/// Pin set of a remote node, in whichever shape the node is able to deliver it.
pub enum PinListing {
    /// Entries arrive one by one over an open connection.
    Streamed(PinStream),
    /// The whole pin set, fetched in one response.
    Bulk(HashMap<String, PinInfo>),
}

impl std::fmt::Debug for PinListing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PinListing::Streamed(_) => write!(f, "PinListing::Streamed"),
            PinListing::Bulk(pins) => write!(f, "PinListing::Bulk({} pins)", pins.len()),
        }
    }
}

impl PinListing {
    /// Starts enumerating the pins of `lister`.
    ///
    /// # Errors
    ///
    /// Fails when the node refuses or cannot serve the listing; nothing has been produced yet.
    pub async fn establish<L: PinLister>(lister: &L, streaming: bool) -> anyhow::Result<Self> {
        if streaming {
            tracing::info!("streaming pins from the source node...");
            let stream = lister
                .list_pins_streamed()
                .await
                .context("failed to start streaming pins from the source node")?;
            Ok(PinListing::Streamed(stream))
        } else {
            tracing::info!("fetching pins from the source node to memory...");
            let pins = lister
                .list_pins()
                .await
                .context("failed to fetch pins from the source node")?;
            tracing::info!("fetched {} pins", pins.len());
            Ok(PinListing::Bulk(pins))
        }
    }
}

pub enum CidSource {
    /// One CID per line, first whitespace-delimited token.
    Lines(Box<dyn AsyncBufRead + Send + Unpin>),
    Pins(PinListing),
}

impl CidSource {
    /// Wraps a line-delimited CID list, reading it from the very start even if the caller already
    /// consumed part of it.
    ///
    /// # Errors
    ///
    /// Fails if the reader cannot be rewound.
    pub async fn from_reader<R>(mut reader: R) -> anyhow::Result<Self>
    where
        R: AsyncRead + AsyncSeek + Send + Unpin + 'static,
    {
        reader
            .rewind()
            .await
            .context("failed to seek file to the start")?;
        Ok(CidSource::Lines(Box::new(tokio::io::BufReader::new(reader))))
    }

    /// Runs [`CidSource::produce`] on its own task.
    pub fn spawn(self, cids: async_channel::Sender<Cid>) -> tokio::task::JoinHandle<Summary> {
        tokio::spawn(self.produce(cids))
    }

    /// Pushes every eligible CID to `cids`, then closes the channel.
    ///
    /// Stops early if every receiver is gone.
    pub async fn produce(self, cids: async_channel::Sender<Cid>) -> Summary {
        let summary = match self {
            CidSource::Lines(reader) => read_lines(reader, &cids).await,
            CidSource::Pins(PinListing::Streamed(stream)) => stream_pins(stream, &cids).await,
            CidSource::Pins(PinListing::Bulk(pins)) => send_pins(pins, &cids).await,
        };
        cids.close();
        tracing::debug!("CID source exhausted: {:?}", summary);
        summary
    }
}

/// Returns false once nobody is receiving anymore.
async fn emit(cids: &async_channel::Sender<Cid>, cid: Cid, summary: &mut Summary) -> bool {
    if cids.send(cid).await.is_err() {
        tracing::warn!("no workers left to receive CIDs, stopping the source");
        return false;
    }
    summary.emitted += 1;
    true
}

#[instrument(skip_all)]
async fn read_lines(
    reader: Box<dyn AsyncBufRead + Send + Unpin>,
    cids: &async_channel::Sender<Cid>,
) -> Summary {
    let mut summary = Summary::default();
    let mut lines = reader.split(b'\n');
    let mut line_no = 0u64;
    loop {
        let line = match lines.next_segment().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(error) => {
                tracing::error!("failed reading CIDs after line {}: {:#}", line_no, error);
                break;
            }
        };
        line_no += 1;
        let Ok(line) = std::str::from_utf8(&line) else {
            tracing::warn!("parsing CID on line {}: not valid UTF-8", line_no);
            summary.invalid_skipped += 1;
            continue;
        };
        let Some(token) = line.split_whitespace().next() else {
            tracing::warn!("parsing CID on line {}: unexpected line {:?}", line_no, line);
            summary.invalid_skipped += 1;
            continue;
        };
        let cid = match Cid::try_from(token) {
            Ok(cid) => cid,
            Err(error) => {
                tracing::warn!("parsing CID on line {}: {:?}: {}", line_no, token, error);
                summary.invalid_skipped += 1;
                continue;
            }
        };
        if !emit(cids, cid, &mut summary).await {
            break;
        }
    }
    summary
}

/// Eligible CID of a listed pin, or `None` if it has to be skipped.
fn eligible_pin(cid: &str, kind: &str, summary: &mut Summary) -> Option<Cid> {
    match kind.parse::<PinKind>() {
        Ok(PinKind::Indirect) => {
            summary.indirect_skipped += 1;
            return None;
        }
        Ok(_) => {}
        Err(error) => {
            tracing::error!("failed parsing pin {:?}: {:#}", cid, error);
            summary.invalid_skipped += 1;
            return None;
        }
    }
    match Cid::try_from(cid) {
        Ok(cid) => Some(cid),
        Err(error) => {
            tracing::error!("failed parsing pin {:?}: {}", cid, error);
            summary.invalid_skipped += 1;
            None
        }
    }
}

#[instrument(skip_all)]
async fn stream_pins(mut stream: PinStream, cids: &async_channel::Sender<Cid>) -> Summary {
    let mut summary = Summary::default();
    while let Some(entry) = stream.next().await {
        let pin = match entry {
            Ok(pin) => pin,
            Err(error) if error.is_entry_error() => {
                tracing::error!("failed parsing pin from stream: {:#}", error);
                summary.invalid_skipped += 1;
                continue;
            }
            Err(error) => {
                tracing::error!("pin stream interrupted: {:#}", error);
                break;
            }
        };
        let Some(cid) = eligible_pin(&pin.cid, &pin.kind, &mut summary) else {
            continue;
        };
        if !emit(cids, cid, &mut summary).await {
            break;
        }
    }
    summary
}

#[instrument(skip_all)]
async fn send_pins(pins: HashMap<String, PinInfo>, cids: &async_channel::Sender<Cid>) -> Summary {
    let mut summary = Summary::default();
    for (cid, info) in pins {
        let Some(cid) = eligible_pin(&cid, &info.kind, &mut summary) else {
            continue;
        };
        if !emit(cids, cid, &mut summary).await {
            break;
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{MockNode, test_cid};
    use tracing_test::traced_test;

    async fn collect(source: CidSource) -> (Vec<Cid>, Summary) {
        let (tx, rx) = async_channel::bounded(1);
        let receive = async move {
            let mut received = vec![];
            while let Ok(cid) = rx.recv().await {
                received.push(cid);
            }
            received
        };
        // same task, so logs stay within the test's span
        let (summary, received) = tokio::join!(source.produce(tx), receive);
        (received, summary)
    }

    fn listed(node: &mut MockNode, entries: &[(&str, &str)]) {
        node.pins = entries
            .iter()
            .map(|(cid, kind)| (cid.to_string(), kind.to_string()))
            .collect();
    }

    #[tokio::test]
    #[traced_test]
    async fn file_lines_skip_blank_and_malformed() {
        let a = test_cid(1);
        let b = test_cid(2);
        let content = format!("{a}\n\nQmBADCID\n{b} extra tokens\r\n   \n");
        let source = CidSource::from_reader(std::io::Cursor::new(content.into_bytes()))
            .await
            .unwrap();
        let (received, summary) = collect(source).await;
        assert_eq!(received, vec![a, b]);
        assert_eq!(
            summary,
            Summary {
                emitted: 2,
                indirect_skipped: 0,
                invalid_skipped: 3,
            }
        );
        assert!(logs_contain("QmBADCID"));
    }

    #[tokio::test]
    async fn file_is_read_from_the_start() {
        let content = format!("{}\n{}\n", test_cid(1), test_cid(2)).into_bytes();
        let len = content.len() as u64;
        let mut cursor = std::io::Cursor::new(content);
        cursor.set_position(len);
        let source = CidSource::from_reader(cursor).await.unwrap();
        let (received, _) = collect(source).await;
        assert_eq!(received, vec![test_cid(1), test_cid(2)]);
    }

    #[tokio::test]
    async fn invalid_utf8_line_is_skipped() {
        let mut content = b"\xff\xfe\n".to_vec();
        content.extend_from_slice(format!("{}\n", test_cid(7)).as_bytes());
        let source = CidSource::from_reader(std::io::Cursor::new(content))
            .await
            .unwrap();
        let (received, summary) = collect(source).await;
        assert_eq!(received, vec![test_cid(7)]);
        assert_eq!(summary.invalid_skipped, 1);
    }

    #[test]
    fn pin_kinds() {
        assert_eq!("recursive".parse::<PinKind>().unwrap(), PinKind::Recursive);
        assert_eq!("direct".parse::<PinKind>().unwrap(), PinKind::Direct);
        assert_eq!("indirect".parse::<PinKind>().unwrap(), PinKind::Indirect);
        assert_eq!(
            "indirect through QmYwAPJzv5CZsnA625s3Xf2nemtYgPpHdWEz79ojWnPbdG"
                .parse::<PinKind>()
                .unwrap(),
            PinKind::Indirect
        );
        assert!("all".parse::<PinKind>().is_err());
    }

    #[tokio::test]
    async fn streamed_listing_filters_indirect_and_bad_entries() {
        let (a, b, c) = (test_cid(1), test_cid(2), test_cid(3));
        let mut node = MockNode::with_version("0.7.0");
        let (a_str, b_str, c_str) = (a.to_string(), b.to_string(), c.to_string());
        listed(
            &mut node,
            &[
                (&a_str, "recursive"),
                (&b_str, "indirect"),
                ("not-a-cid", "direct"),
                ("", "recursive"),
                (&c_str, "direct"),
                (&b_str, "mystery"),
            ],
        );
        let listing = PinListing::establish(&node, true).await.unwrap();
        assert!(matches!(listing, PinListing::Streamed(_)));
        let (received, summary) = collect(CidSource::Pins(listing)).await;
        assert_eq!(received, vec![a, c]);
        assert_eq!(
            summary,
            Summary {
                emitted: 2,
                indirect_skipped: 1,
                invalid_skipped: 3,
            }
        );
    }

    #[tokio::test]
    async fn bulk_listing_matches_streamed_semantics() {
        let (a, b, c) = (test_cid(1), test_cid(2), test_cid(3));
        let mut node = MockNode::with_version("0.4.22");
        let (a_str, b_str, c_str) = (a.to_string(), b.to_string(), c.to_string());
        listed(
            &mut node,
            &[
                (&a_str, "recursive"),
                (&b_str, "indirect"),
                ("not-a-cid", "direct"),
                (&c_str, "direct"),
            ],
        );
        let listing = PinListing::establish(&node, false).await.unwrap();
        assert!(matches!(listing, PinListing::Bulk(_)));
        let (mut received, summary) = collect(CidSource::Pins(listing)).await;
        received.sort();
        let mut expected = vec![a, c];
        expected.sort();
        assert_eq!(received, expected);
        assert_eq!(summary.emitted, 2);
        assert_eq!(summary.indirect_skipped, 1);
        assert_eq!(summary.invalid_skipped, 1);
    }

    #[tokio::test]
    async fn listing_that_cannot_start_is_an_error() {
        let node = MockNode {
            fail_listing: true,
            ..Default::default()
        };
        assert!(PinListing::establish(&node, true).await.is_err());
        assert!(PinListing::establish(&node, false).await.is_err());
    }

    #[tokio::test]
    async fn producer_stops_when_receivers_are_gone() {
        let content: String = (0..10).map(|i| format!("{}\n", test_cid(i))).collect();
        let source = CidSource::from_reader(std::io::Cursor::new(content.into_bytes()))
            .await
            .unwrap();
        let (tx, rx) = async_channel::bounded(1);
        drop(rx);
        let summary = source.produce(tx).await;
        assert_eq!(summary.emitted, 0);
    }
}
