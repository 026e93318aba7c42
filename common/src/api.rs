//! Client for the Kubo (go-ipfs) RPC API and the remote capabilities the copy pipeline needs.
//!
//! The pipeline never talks HTTP directly; it is written against the [`Node`], [`PinTarget`],
//! [`PinLister`], [`BlockSource`] and [`BlockTarget`] traits. [`Client`] implements all of them
//! over `/api/v0/*` endpoints, optionally attaching basic auth to every request.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use cid::Cid;
use futures::stream::{BoxStream, Stream, StreamExt};
use serde::Deserialize;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The node answered with a non-success status code.
    #[error("{message} (HTTP {status})")]
    Http {
        status: reqwest::StatusCode,
        message: String,
    },
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    /// The response (or one entry of a streamed response) could not be decoded.
    #[error("failed decoding response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Errors that only affect one entry of a streamed response, the stream itself is still usable.
    #[must_use]
    pub fn is_entry_error(&self) -> bool {
        matches!(self, ApiError::Decode(_))
    }
}

/// One entry of `pin/ls?stream=true`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct StreamedPin {
    #[serde(rename = "Cid")]
    pub cid: String,
    #[serde(rename = "Type")]
    pub kind: String,
}

/// Value of the `Keys` map returned by a non-streamed `pin/ls`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PinInfo {
    #[serde(rename = "Type")]
    pub kind: String,
}

#[derive(Debug, Deserialize)]
struct PinLsResponse {
    #[serde(rename = "Keys", default)]
    keys: HashMap<String, PinInfo>,
}

/// One entry of `refs`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct RefEntry {
    #[serde(rename = "Ref", default)]
    pub cid: String,
    #[serde(rename = "Err", default)]
    pub err: String,
}

#[derive(Debug, Deserialize)]
struct VersionResponse {
    #[serde(rename = "Version")]
    version: String,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(rename = "Message")]
    message: String,
}

pub type PinStream = BoxStream<'static, Result<StreamedPin, ApiError>>;
pub type RefStream = BoxStream<'static, Result<RefEntry, ApiError>>;

pub trait Node: Send + Sync + 'static {
    /// Version string reported by the node, e.g. "0.7.0".
    fn version(&self) -> impl Future<Output = Result<String, ApiError>> + Send;
}

pub trait PinTarget: Node {
    fn pin(&self, cid: &Cid) -> impl Future<Output = Result<(), ApiError>> + Send;
}

/// Enumeration of the pins held by a node.
///
/// The two methods return structurally different responses on purpose: streaming is only
/// available on newer nodes, older ones can only hand over the whole pin set at once.
pub trait PinLister: Node {
    fn list_pins_streamed(&self) -> impl Future<Output = Result<PinStream, ApiError>> + Send;

    fn list_pins(&self)
    -> impl Future<Output = Result<HashMap<String, PinInfo>, ApiError>> + Send;
}

pub trait BlockSource: Send + Sync + 'static {
    /// All unique blocks reachable from `cid`, not including `cid` itself.
    fn refs(&self, cid: &Cid) -> impl Future<Output = Result<RefStream, ApiError>> + Send;

    fn get_block(&self, cid: &Cid) -> impl Future<Output = Result<Bytes, ApiError>> + Send;
}

pub trait BlockTarget: Send + Sync + 'static {
    fn put_block(&self, cid: &Cid, data: Bytes)
    -> impl Future<Output = Result<(), ApiError>> + Send;
}

#[derive(Clone)]
pub struct BasicAuth {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    base_url: String,
    auth: Option<BasicAuth>,
    timeout: Duration,
}

impl Client {
    /// Builds a client for the node listening at `api_url`, e.g. `https://ipfs.infura.io:5001`
    /// or `localhost:5001` (plain http is assumed when no scheme is given).
    ///
    /// `timeout` bounds every request except the streamed ones, which may legitimately stay
    /// open for as long as the node keeps sending.
    pub fn new(api_url: &str, auth: Option<BasicAuth>, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url: normalize_base_url(api_url),
            auth,
            timeout,
        })
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn post(&self, command: &str) -> reqwest::RequestBuilder {
        let builder = self
            .http
            .post(format!("{}/api/v0/{}", self.base_url, command));
        match &self.auth {
            Some(auth) => builder.basic_auth(&auth.username, Some(&auth.password)),
            None => builder,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, ApiError> {
        let response = request.send().await?;
        check_status(response).await
    }
}

fn normalize_base_url(api_url: &str) -> String {
    let trimmed = api_url.trim().trim_end_matches('/');
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ApiError::Http {
        status,
        message: error_message(&body),
    })
}

/// Kubo reports failures as `{"Message": "...", "Code": 0, "Type": "error"}`, but proxies in
/// front of it may answer with plain text.
fn error_message(body: &str) -> String {
    match serde_json::from_str::<ErrorResponse>(body) {
        Ok(error) => error.message.trim().to_string(),
        Err(_) => body.trim().to_string(),
    }
}

/// Splits a byte stream into newline-delimited JSON values.
///
/// A line that fails to decode yields [`ApiError::Decode`] and the stream continues. A transport
/// error is yielded once and ends the stream.
pub fn decode_ndjson<T, S, E>(bytes: S) -> BoxStream<'static, Result<T, ApiError>>
where
    T: serde::de::DeserializeOwned + Send + 'static,
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<ApiError> + 'static,
{
    let state = (bytes.boxed(), Vec::<u8>::new(), false);
    futures::stream::unfold(state, |(mut bytes, mut buf, mut done)| async move {
        loop {
            if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buf.drain(..=pos).collect();
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                return Some((decode_line(&line), (bytes, buf, done)));
            }
            if done {
                if buf.iter().all(u8::is_ascii_whitespace) {
                    return None;
                }
                let line = std::mem::take(&mut buf);
                return Some((decode_line(&line), (bytes, buf, done)));
            }
            match bytes.next().await {
                Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                Some(Err(error)) => {
                    buf.clear();
                    done = true;
                    return Some((Err(error.into()), (bytes, buf, done)));
                }
                None => done = true,
            }
        }
    })
    .boxed()
}

fn decode_line<T: serde::de::DeserializeOwned>(line: &[u8]) -> Result<T, ApiError> {
    serde_json::from_slice(line).map_err(|error| {
        ApiError::Decode(format!(
            "{} in {:?}",
            error,
            String::from_utf8_lossy(line).trim()
        ))
    })
}

/// Codec and multihash names `block/put` expects for `cid`.
fn block_format(cid: &Cid) -> Result<(&'static str, &'static str), ApiError> {
    let codec = match cid.codec() {
        0x55 => "raw",
        0x70 => "dag-pb",
        0x71 => "dag-cbor",
        0x0129 => "dag-json",
        0x0200 => "json",
        other => {
            return Err(ApiError::Decode(format!(
                "unsupported codec 0x{other:x} for block {cid}"
            )));
        }
    };
    let mhtype = match cid.hash().code() {
        0x12 => "sha2-256",
        0x13 => "sha2-512",
        0x16 => "sha3-256",
        0x1e => "blake3",
        0xb220 => "blake2b-256",
        0x00 => "identity",
        other => {
            return Err(ApiError::Decode(format!(
                "unsupported hash function 0x{other:x} for block {cid}"
            )));
        }
    };
    Ok((codec, mhtype))
}

impl Node for Client {
    async fn version(&self) -> Result<String, ApiError> {
        let response = self.send(self.post("version").timeout(self.timeout)).await?;
        let version: VersionResponse = response
            .json()
            .await
            .map_err(|error| ApiError::Decode(error.to_string()))?;
        Ok(version.version)
    }
}

impl PinTarget for Client {
    async fn pin(&self, cid: &Cid) -> Result<(), ApiError> {
        let request = self
            .post("pin/add")
            .query(&[("arg", cid.to_string().as_str()), ("recursive", "true")])
            .timeout(self.timeout);
        self.send(request).await?;
        Ok(())
    }
}

impl PinLister for Client {
    async fn list_pins_streamed(&self) -> Result<PinStream, ApiError> {
        let request = self.post("pin/ls").query(&[("stream", "true")]);
        let response = self.send(request).await?;
        Ok(decode_ndjson(response.bytes_stream()))
    }

    async fn list_pins(&self) -> Result<HashMap<String, PinInfo>, ApiError> {
        let response = self.send(self.post("pin/ls")).await?;
        let pins: PinLsResponse = response
            .json()
            .await
            .map_err(|error| ApiError::Decode(error.to_string()))?;
        Ok(pins.keys)
    }
}

impl BlockSource for Client {
    async fn refs(&self, cid: &Cid) -> Result<RefStream, ApiError> {
        let request = self.post("refs").query(&[
            ("arg", cid.to_string().as_str()),
            ("recursive", "true"),
            ("unique", "true"),
        ]);
        let response = self.send(request).await?;
        Ok(decode_ndjson(response.bytes_stream()))
    }

    async fn get_block(&self, cid: &Cid) -> Result<Bytes, ApiError> {
        let request = self
            .post("block/get")
            .query(&[("arg", cid.to_string())])
            .timeout(self.timeout);
        let response = self.send(request).await?;
        Ok(response.bytes().await?)
    }
}

impl BlockTarget for Client {
    async fn put_block(&self, cid: &Cid, data: Bytes) -> Result<(), ApiError> {
        let (codec, mhtype) = block_format(cid)?;
        let form = reqwest::multipart::Form::new()
            .part("data", reqwest::multipart::Part::bytes(data.to_vec()));
        let request = self
            .post("block/put")
            .query(&[("cid-codec", codec), ("mhtype", mhtype)])
            .multipart(form)
            .timeout(self.timeout);
        self.send(request).await?;
        Ok(())
    }
}
