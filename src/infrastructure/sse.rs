//! Server-push event stream encoder
//!
//! Turns one operation's progress channel into `text/event-stream` frames:
//! `progress` for every non-terminal event, then exactly one `complete` or
//! `error` frame, after which the stream ends. A comment frame is written
//! whenever the channel stays quiet for a heartbeat interval.

use futures::{Stream, StreamExt, stream};
use serde::Serialize;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error};

use crate::domain::{FailureReason, OperationSummary, ProgressEvent};

pub const HEARTBEAT_FRAME: &str = ": keep-alive\n\n";
pub const CONTENT_TYPE: &str = "text/event-stream";

/// Data of an `error` frame
#[derive(Debug, Serialize)]
struct ErrorPayload<'a> {
    reason: FailureReason,
    message: &'a str,
    partial: Option<&'a OperationSummary>,
}

fn frame(name: &str, data: &str) -> String {
    format!("event: {name}\ndata: {data}\n\n")
}

/// Encodes one event as a complete frame.
pub fn encode_event(event: &ProgressEvent) -> Result<String, serde_json::Error> {
    Ok(match event {
        ProgressEvent::Complete { summary } => frame("complete", &serde_json::to_string(summary)?),
        ProgressEvent::Failed { reason, message, partial } => {
            let payload = ErrorPayload {
                reason: *reason,
                message,
                partial: partial.as_ref(),
            };
            frame("error", &serde_json::to_string(&payload)?)
        }
        other => frame("progress", &serde_json::to_string(other)?),
    })
}

fn internal_error_frame(message: &str) -> String {
    let payload = ErrorPayload {
        reason: FailureReason::Internal,
        message,
        partial: None,
    };
    // a payload of plain strings always serializes
    let data = serde_json::to_string(&payload).unwrap_or_else(|_| "{\"reason\":\"internal\"}".to_string());
    frame("error", &data)
}

#[derive(Debug, Clone, Copy)]
pub struct EventStreamEncoder {
    heartbeat: Duration,
}

impl EventStreamEncoder {
    pub const fn new(heartbeat: Duration) -> Self {
        Self { heartbeat }
    }

    pub fn encode(
        self,
        receiver: mpsc::Receiver<ProgressEvent>,
    ) -> impl Stream<Item = Result<String, Infallible>> + Send + 'static {
        self.encode_stream(ReceiverStream::new(receiver))
    }

    /// Frames for `events`. Ends after the first terminal event; a source
    /// that ends without one yields a synthesized internal `error` frame.
    pub fn encode_stream<S>(self, events: S) -> impl Stream<Item = Result<String, Infallible>> + Send + 'static
    where
        S: Stream<Item = ProgressEvent> + Send + Unpin + 'static,
    {
        let heartbeat = self.heartbeat;
        stream::unfold(Some(events), move |state| async move {
            let mut events = state?;
            let next = match tokio::time::timeout(heartbeat, events.next()).await {
                Err(_) => return Some((Ok(HEARTBEAT_FRAME.to_string()), Some(events))),
                Ok(next) => next,
            };

            let Some(event) = next else {
                error!("Progress channel closed without a terminal event");
                return Some((
                    Ok(internal_error_frame("operation ended without a result")),
                    None,
                ));
            };

            let terminal = event.is_terminal();
            match encode_event(&event) {
                Ok(frame) => {
                    if terminal {
                        debug!("Terminal frame written, closing stream");
                    }
                    Some((Ok(frame), (!terminal).then_some(events)))
                }
                Err(e) => {
                    error!("Failed to encode progress event: {}", e);
                    Some((Ok(internal_error_frame(&format!("failed to encode event: {e}"))), None))
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::SearchSummary;
    use crate::domain::{StoreId, UnitOutcome, UnitRef};

    fn search_summary() -> OperationSummary {
        OperationSummary::Search(SearchSummary {
            code: "012345678905".into(),
            matches: Vec::new(),
            total_found: 0,
            stores_searched: 2,
            failed_stores: Vec::new(),
            no_results: true,
        })
    }

    async fn collect(encoder: EventStreamEncoder, events: Vec<ProgressEvent>) -> Vec<String> {
        encoder
            .encode_stream(stream::iter(events))
            .map(|frame| match frame {
                Ok(frame) => frame,
                Err(never) => match never {},
            })
            .collect()
            .await
    }

    #[tokio::test]
    async fn progress_then_complete_frames() {
        let events = vec![
            ProgressEvent::UnitFinished {
                unit: UnitRef::store(StoreId(1), "ERP"),
                outcome: UnitOutcome::succeeded(0),
            },
            ProgressEvent::Complete { summary: search_summary() },
        ];
        let frames = collect(EventStreamEncoder::new(Duration::from_secs(15)), events).await;

        assert_eq!(frames.len(), 2);
        assert!(frames[0].starts_with("event: progress\ndata: {\"type\":\"unit-finished\""));
        assert!(frames[1].starts_with("event: complete\ndata: {\"operation\":\"search\""));
        assert!(frames[1].contains("\"total_found\":0"));
        assert!(frames.iter().all(|f| f.ends_with("\n\n")));
    }

    #[tokio::test]
    async fn failed_maps_to_error_frame_and_closes() {
        let events = vec![
            ProgressEvent::Failed {
                reason: FailureReason::Cancelled,
                message: "operation cancelled".into(),
                partial: Some(search_summary()),
            },
            ProgressEvent::Complete { summary: search_summary() },
        ];
        let frames = collect(EventStreamEncoder::new(Duration::from_secs(15)), events).await;

        assert_eq!(frames.len(), 1);
        let data = frames[0].strip_prefix("event: error\ndata: ").unwrap().trim_end();
        let payload: serde_json::Value = serde_json::from_str(data).unwrap();
        assert_eq!(payload["reason"], "cancelled");
        assert_eq!(payload["partial"]["stores_searched"], 2);
    }

    #[tokio::test]
    async fn closed_channel_synthesizes_internal_error() {
        let frames = collect(EventStreamEncoder::new(Duration::from_secs(15)), Vec::new()).await;
        assert_eq!(frames.len(), 1);
        assert!(frames[0].starts_with("event: error\n"));
        assert!(frames[0].contains("\"reason\":\"internal\""));
    }

    #[tokio::test]
    async fn idle_channel_emits_heartbeats() {
        let (tx, rx) = mpsc::channel(4);
        let encoder = EventStreamEncoder::new(Duration::from_millis(20));
        let producer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(90)).await;
            tx.send(ProgressEvent::Complete { summary: search_summary() })
                .await
                .unwrap();
        });

        let frames: Vec<String> = encoder
            .encode(rx)
            .map(|frame| frame.unwrap_or_default())
            .collect()
            .await;
        producer.await.unwrap();

        let heartbeats = frames.iter().filter(|f| f.as_str() == HEARTBEAT_FRAME).count();
        assert!(heartbeats >= 2, "expected heartbeats, got {frames:?}");
        assert!(frames.last().unwrap().starts_with("event: complete"));
    }
}
