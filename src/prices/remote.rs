//! HTTP client for the upstream price service.
//!
//! `GET {base}/prices/{exchange}/{ticker}?limit=N` answers with newline-delimited
//! JSON candles. Opening the stream is an idempotent GET and is retried on
//! transient failures; the body is never replayed.
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::Deserialize;

use super::{Exchange, PriceRecord, PriceSource, PriceStream, SourceError};

pub struct RemotePriceSource {
    base_url: String,
    client: ClientWithMiddleware,
    stream_timeout: Duration,
}

/// Upstream lines are either a candle or a terminal error object.
#[derive(Deserialize)]
#[serde(untagged)]
enum UpstreamLine {
    Price(PriceRecord),
    Error { error: String },
}

impl RemotePriceSource {
    pub fn new(base_url: impl Into<String>, stream_timeout: Duration, max_retries: u32) -> anyhow::Result<Self> {
        let reqwest_client = reqwest::Client::builder()
            .pool_max_idle_per_host(32)
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        let retry_policy = ExponentialBackoff::builder()
            .retry_bounds(Duration::from_millis(200), Duration::from_secs(5))
            .build_with_max_retries(max_retries);

        let client = ClientBuilder::new(reqwest_client)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            stream_timeout,
        })
    }
}

fn classify(e: reqwest_middleware::Error) -> SourceError {
    match e {
        reqwest_middleware::Error::Reqwest(e) if e.is_timeout() => SourceError::Timeout,
        other => SourceError::Unreachable(other.to_string()),
    }
}

#[async_trait]
impl PriceSource for RemotePriceSource {
    #[tracing::instrument(skip(self), fields(base = %self.base_url))]
    async fn open(&self, exchange: Exchange, ticker: &str, limit: i64) -> Result<PriceStream, SourceError> {
        let url = format!("{}/prices/{}/{}", self.base_url, exchange.as_str(), ticker);
        let resp = self
            .client
            .get(&url)
            .query(&[("limit", limit)])
            .header("accept", "application/x-ndjson")
            .timeout(self.stream_timeout)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!("price source request failed: {}", e);
                classify(e)
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v["error"].as_str().map(str::to_string))
                .unwrap_or(body);
            tracing::warn!(status = status.as_u16(), "price source refused stream: {}", message);
            return Err(if status.is_client_error() {
                SourceError::Rejected {
                    status: status.as_u16(),
                    message,
                }
            } else {
                SourceError::Upstream {
                    status: status.as_u16(),
                    message,
                }
            });
        }

        Ok(ndjson_records(resp.bytes_stream().boxed()))
    }

    async fn health(&self) -> Result<(), SourceError> {
        let url = format!("{}/health", self.base_url);
        let resp = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(classify)?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(SourceError::Upstream {
                status: resp.status().as_u16(),
                message: "health check failed".into(),
            })
        }
    }
}

fn parse_line(line: &str) -> Result<PriceRecord, SourceError> {
    match serde_json::from_str::<UpstreamLine>(line) {
        Ok(UpstreamLine::Price(record)) => Ok(record),
        Ok(UpstreamLine::Error { error }) => Err(SourceError::Interrupted(error)),
        Err(e) => Err(SourceError::Decode(e.to_string())),
    }
}

type ByteStream = BoxStream<'static, reqwest::Result<Bytes>>;

/// Longest NDJSON line accepted from upstream.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

struct LineReader {
    body: ByteStream,
    buf: Vec<u8>,
    /// Prefix of `buf` already known to hold no newline.
    scanned: usize,
    done: bool,
}

impl LineReader {
    fn ended(mut self) -> Self {
        self.done = true;
        self
    }
}

fn oversized() -> SourceError {
    SourceError::Decode(format!("price record exceeds {} bytes", MAX_LINE_BYTES))
}

/// Split a byte stream into NDJSON records. The stream ends after the first
/// error it yields; a line longer than [`MAX_LINE_BYTES`] is an error.
fn ndjson_records(body: ByteStream) -> PriceStream {
    let reader = LineReader {
        body,
        buf: Vec::new(),
        scanned: 0,
        done: false,
    };
    stream::unfold(reader, |mut r| async move {
        if r.done {
            return None;
        }
        loop {
            if let Some(offset) = r.buf[r.scanned..].iter().position(|b| *b == b'\n') {
                let pos = r.scanned + offset;
                r.scanned = 0;
                if pos > MAX_LINE_BYTES {
                    return Some((Err(oversized()), r.ended()));
                }
                let raw: Vec<u8> = r.buf.drain(..=pos).collect();
                let text = String::from_utf8_lossy(&raw);
                let line = text.trim();
                if line.is_empty() {
                    continue;
                }
                let item = parse_line(line);
                let stop = item.is_err();
                r.done = stop;
                return Some((item, r));
            }
            r.scanned = r.buf.len();
            if r.buf.len() > MAX_LINE_BYTES {
                return Some((Err(oversized()), r.ended()));
            }

            match r.body.next().await {
                Some(Ok(chunk)) => r.buf.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    let err = if e.is_timeout() {
                        SourceError::Timeout
                    } else {
                        SourceError::Interrupted(e.to_string())
                    };
                    return Some((Err(err), r.ended()));
                }
                None => {
                    let rest = std::mem::take(&mut r.buf);
                    let text = String::from_utf8_lossy(&rest);
                    let line = text.trim();
                    if line.is_empty() {
                        return None;
                    }
                    let item = parse_line(line);
                    return Some((item, r.ended()));
                }
            }
        }
    })
    .boxed()
}
