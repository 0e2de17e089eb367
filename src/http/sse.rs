//! The SSE channel primitive.
//!
//! One broadcaster shared by the REST API, watch mode and live preview.
//! Writes are best-effort: a slow or destroyed client is pruned by the
//! broadcast channel, never blocks a sender. Heartbeat comments keep
//! intermediaries from closing idle connections; exceeding `max_clients`
//! yields 503.

use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::events::{ProgressEvent, ProgressSink};

/// Channel configuration.
#[derive(Debug, Clone)]
pub struct SseChannelConfig {
    pub heartbeat: Duration,
    pub max_clients: usize,
}

impl Default for SseChannelConfig {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(15),
            max_clients: 100,
        }
    }
}

/// One outbound SSE message.
#[derive(Debug, Clone)]
pub struct SseMessage {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

#[derive(Debug, Clone)]
enum Payload {
    Message(SseMessage),
    Shutdown,
}

/// Decrements the client count when a subscriber goes away.
struct ClientGuard {
    clients: Arc<AtomicUsize>,
}

impl Drop for ClientGuard {
    fn drop(&mut self) {
        self.clients.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Server-sent-events broadcaster.
pub struct SseChannel {
    sender: broadcast::Sender<Payload>,
    clients: Arc<AtomicUsize>,
    closed: AtomicBool,
    config: SseChannelConfig,
}

impl SseChannel {
    pub fn new(config: SseChannelConfig) -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            sender,
            clients: Arc::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
            config,
        }
    }

    /// Send a named event. Ordering across sends is preserved per client.
    pub fn send(&self, event: impl Into<String>, data: impl Into<String>, id: Option<String>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.sender.send(Payload::Message(SseMessage {
            event: Some(event.into()),
            data: data.into(),
            id,
        }));
    }

    /// Send unnamed data to every client.
    pub fn broadcast(&self, data: impl Into<String>) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.sender.send(Payload::Message(SseMessage {
            event: None,
            data: data.into(),
            id: None,
        }));
    }

    /// Disconnect every client and refuse new ones.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _ = self.sender.send(Payload::Shutdown);
    }

    /// Currently connected clients.
    pub fn client_count(&self) -> usize {
        self.clients.load(Ordering::SeqCst)
    }

    /// Attach a new client; the response is an event stream, or 503 when
    /// the channel is full or closed.
    pub fn handler(&self) -> Response {
        if self.closed.load(Ordering::SeqCst) {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                axum::Json(json!({ "error": "channel closed" })),
            )
                .into_response();
        }

        // Admit up to max_clients; the incremented slot is released by
        // the guard when the stream drops.
        let admitted = self
            .clients
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                if current < self.config.max_clients {
                    Some(current + 1)
                } else {
                    None
                }
            })
            .is_ok();
        if !admitted {
            return (
                StatusCode::SERVICE_UNAVAILABLE,
                axum::Json(json!({ "error": "too many clients" })),
            )
                .into_response();
        }

        let guard = ClientGuard {
            clients: self.clients.clone(),
        };
        let rx = self.sender.subscribe();

        let stream = futures::stream::unfold((rx, guard), |(mut rx, guard)| async move {
            loop {
                match rx.recv().await {
                    Ok(Payload::Message(message)) => {
                        let mut event = Event::default().data(message.data);
                        if let Some(name) = message.event {
                            event = event.event(name);
                        }
                        if let Some(id) = message.id {
                            event = event.id(id);
                        }
                        return Some((Ok::<_, Infallible>(event), (rx, guard)));
                    }
                    Ok(Payload::Shutdown) => return None,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "sse client lagged, messages dropped");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });

        Sse::new(stream)
            .keep_alive(
                KeepAlive::new()
                    .interval(self.config.heartbeat)
                    .text("heartbeat"),
            )
            .into_response()
    }
}

impl ProgressSink for SseChannel {
    fn emit(&self, event: &ProgressEvent) {
        match serde_json::to_string(event) {
            Ok(data) => self.send(event.kind(), data, None),
            Err(e) => tracing::warn!(error = %e, "unserializable progress event"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn channel(max_clients: usize) -> SseChannel {
        SseChannel::new(SseChannelConfig {
            heartbeat: Duration::from_secs(15),
            max_clients,
        })
    }

    #[tokio::test]
    async fn test_send_preserves_order() {
        let channel = channel(10);
        let mut rx = channel.sender.subscribe();

        channel.send("progress", "one", None);
        channel.send("progress", "two", Some("id-2".to_string()));
        channel.broadcast("three");

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        let third = rx.recv().await.unwrap();
        match (first, second, third) {
            (Payload::Message(a), Payload::Message(b), Payload::Message(c)) => {
                assert_eq!(a.data, "one");
                assert_eq!(b.data, "two");
                assert_eq!(b.id.as_deref(), Some("id-2"));
                assert_eq!(c.data, "three");
                assert!(c.event.is_none());
            }
            _ => panic!("expected three messages"),
        }
    }

    #[tokio::test]
    async fn test_max_clients_exceeded_is_503() {
        let channel = channel(2);
        let first = channel.handler();
        let second = channel.handler();
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(second.status(), StatusCode::OK);
        assert_eq!(channel.client_count(), 2);

        // Exactly max_clients connected; one more is refused.
        let third = channel.handler();
        assert_eq!(third.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(channel.client_count(), 2);
    }

    #[tokio::test]
    async fn test_client_slot_released_on_drop() {
        let channel = channel(1);
        let response = channel.handler();
        assert_eq!(channel.client_count(), 1);
        drop(response);
        // The guard lives inside the response stream; dropping it frees
        // the slot.
        assert_eq!(channel.client_count(), 0);
        assert_eq!(channel.handler().status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_closed_channel_refuses_clients_and_sends() {
        let channel = channel(10);
        channel.close();
        assert_eq!(channel.handler().status(), StatusCode::SERVICE_UNAVAILABLE);

        let mut rx = channel.sender.subscribe();
        channel.send("x", "dropped", None);
        assert!(matches!(
            rx.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_send_without_clients_does_not_error() {
        let channel = channel(10);
        channel.send("progress", "nobody listening", None);
        channel.broadcast("still fine");
    }

    #[tokio::test]
    async fn test_progress_sink_emits_tagged_json() {
        let channel = channel(10);
        let mut rx = channel.sender.subscribe();
        crate::events::ProgressSink::emit(
            &channel,
            &ProgressEvent::Complete { score: 0.9 },
        );

        match rx.recv().await.unwrap() {
            Payload::Message(message) => {
                assert_eq!(message.event.as_deref(), Some("complete"));
                let value: serde_json::Value = serde_json::from_str(&message.data).unwrap();
                assert_eq!(value["type"], "complete");
            }
            _ => panic!("expected a message"),
        }
    }
}
