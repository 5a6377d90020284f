//! Relays an upstream [`PriceStream`] to the caller and reports how many
//! records actually reached it.
//!
//! The incremental relay runs the upstream reader in its own task behind a
//! bounded channel. The reader stops as soon as the client side of the
//! channel is gone, which drops (and cancels) the upstream stream. The count
//! is taken on the client side, so records still sitting in the channel when
//! the caller disconnects are never charged.

use std::convert::Infallible;

use axum::response::sse::Event;
use futures::stream::{self, Stream, StreamExt};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::errors::AppError;
use crate::prices::{PriceRecord, PriceStream, SourceError};

/// Candle shape of the buffered response body.
#[derive(Debug, Clone, Serialize)]
pub struct Candle {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl From<PriceRecord> for Candle {
    fn from(r: PriceRecord) -> Self {
        Self {
            open: r.open,
            high: r.high,
            low: r.low,
            close: r.close,
            volume: r.volume,
        }
    }
}

#[derive(Debug)]
pub enum RelayOutcome {
    /// Upstream ended normally and everything was handed to the caller.
    Finished,
    /// Upstream failed after the stream started.
    Failed(SourceError),
    /// The caller went away first.
    Disconnected,
}

impl RelayOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RelayOutcome::Finished => "completed",
            RelayOutcome::Failed(_) => "stream_error",
            RelayOutcome::Disconnected => "disconnected",
        }
    }
}

#[derive(Debug)]
pub struct Delivery {
    pub delivered: i64,
    pub outcome: RelayOutcome,
}

/// Client-side accounting. Reports exactly once, on `finish` or when dropped.
struct DeliveryGuard {
    delivered: i64,
    failure: Option<SourceError>,
    report: Option<oneshot::Sender<Delivery>>,
}

impl DeliveryGuard {
    fn send(&mut self, outcome: RelayOutcome) {
        if let Some(tx) = self.report.take() {
            let _ = tx.send(Delivery {
                delivered: self.delivered,
                outcome,
            });
        }
    }

    /// The channel closed: upstream ended or failed.
    fn finish(mut self) {
        let outcome = match self.failure.take() {
            Some(e) => RelayOutcome::Failed(e),
            None => RelayOutcome::Finished,
        };
        self.send(outcome);
    }
}

impl Drop for DeliveryGuard {
    fn drop(&mut self) {
        let outcome = match self.failure.take() {
            Some(e) => RelayOutcome::Failed(e),
            None => RelayOutcome::Disconnected,
        };
        self.send(outcome);
    }
}

/// Read at most `limit` records from `upstream` into a bounded channel.
/// Stops early when upstream ends or fails, at the deadline, or once the
/// receiver is dropped.
pub fn spawn_reader(
    upstream: PriceStream,
    limit: i64,
    capacity: usize,
    deadline: Instant,
) -> mpsc::Receiver<Result<PriceRecord, SourceError>> {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let mut upstream = upstream.take(usize::try_from(limit).unwrap_or(0));

    tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                _ = tx.closed() => {
                    tracing::debug!("caller disconnected, cancelling upstream price stream");
                    break;
                }
                next = tokio::time::timeout_at(deadline, upstream.next()) => next,
            };

            let item = match next {
                Ok(Some(item)) => item,
                Ok(None) => break,
                Err(_) => Err(SourceError::Timeout),
            };
            let stop = item.is_err();

            // Send to caller; if the caller disconnected, stop reading
            if tx.send(item).await.is_err() {
                break;
            }
            if stop {
                break;
            }
        }
    });

    rx
}

/// Turn the reader channel into SSE events. The returned receiver resolves
/// once the event stream has ended or been dropped.
pub fn sse_events(
    rx: mpsc::Receiver<Result<PriceRecord, SourceError>>,
) -> (impl Stream<Item = Result<Event, Infallible>> + Send + 'static, oneshot::Receiver<Delivery>) {
    let (report_tx, report_rx) = oneshot::channel();
    let guard = DeliveryGuard {
        delivered: 0,
        failure: None,
        report: Some(report_tx),
    };

    let events = stream::unfold((rx, guard), |(mut rx, mut guard)| async move {
        match rx.recv().await {
            Some(Ok(record)) => {
                guard.delivered += 1;
                Some((Ok(price_event(&record)), (rx, guard)))
            }
            Some(Err(e)) => {
                tracing::warn!(delivered = guard.delivered, "price stream failed mid-flight: {}", e);
                let event = error_event(&e);
                guard.failure = Some(e);
                // the reader closes the channel after an error, so this is the last event
                Some((Ok(event), (rx, guard)))
            }
            None => {
                guard.finish();
                None
            }
        }
    });

    (events, report_rx)
}

fn price_event(record: &PriceRecord) -> Event {
    Event::default()
        .event("price")
        .json_data(record)
        .unwrap_or_else(|_| Event::default().event("price").data("{}"))
}

fn error_event(e: &SourceError) -> Event {
    Event::default()
        .event("error")
        .data(json!({ "error": public_message(e) }).to_string())
}

/// What the caller is told about a mid-stream failure.
pub fn public_message(e: &SourceError) -> String {
    match AppError::from(e.clone()) {
        AppError::Internal(_) => "error receiving prices".to_string(),
        other => other.to_string(),
    }
}

/// Collect up to `limit` records. A mid-stream failure discards what was
/// collected and reports how many records had arrived.
pub async fn collect(
    mut upstream: PriceStream,
    limit: i64,
    deadline: Instant,
) -> Result<Vec<PriceRecord>, (usize, SourceError)> {
    let cap = usize::try_from(limit).unwrap_or(0);
    let mut records = Vec::with_capacity(cap.min(1024));

    while records.len() < cap {
        match tokio::time::timeout_at(deadline, upstream.next()).await {
            Ok(Some(Ok(record))) => records.push(record),
            Ok(Some(Err(e))) => return Err((records.len(), e)),
            Ok(None) => break,
            Err(_) => return Err((records.len(), SourceError::Timeout)),
        }
    }

    Ok(records)
}
