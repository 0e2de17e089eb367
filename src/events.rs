//! Progress events emitted during a pipeline run.
//!
//! Events are serialized with a `type` tag and broadcast over the SSE
//! channel attached to the run; the watch dashboard and the REST API
//! share the same shapes.

use serde::{Deserialize, Serialize};

/// Observable pipeline progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProgressEvent {
    /// A run started.
    Start { prompt: String },
    /// A stage began.
    Progress { stage: String },
    /// A streamed generation chunk.
    Chunk { text: String },
    /// The run finished; `score` is the rubric total.
    Complete { score: f64 },
    /// The run failed at `stage`.
    Error { message: String, stage: String },
}

impl ProgressEvent {
    /// The wire-level event name.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Progress { .. } => "progress",
            Self::Chunk { .. } => "chunk",
            Self::Complete { .. } => "complete",
            Self::Error { .. } => "error",
        }
    }
}

/// Anything that can receive progress events. The SSE channel implements
/// this; tests collect events into a vector.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: &ProgressEvent);
}

/// A sink that drops everything.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _event: &ProgressEvent) {}
}

/// A sink that records events for assertions.
#[derive(Default)]
pub struct CollectingSink {
    events: std::sync::Mutex<Vec<ProgressEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().expect("sink lock").clone()
    }
}

impl ProgressSink for CollectingSink {
    fn emit(&self, event: &ProgressEvent) {
        self.events.lock().expect("sink lock").push(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_events_serialize_with_type_tag() {
        let event = ProgressEvent::Start {
            prompt: "track my cardio".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "start");
        assert_eq!(json["prompt"], "track my cardio");

        let event = ProgressEvent::Error {
            message: "provider timeout".to_string(),
            stage: "generate".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["stage"], "generate");
    }

    #[test]
    fn test_round_trip() {
        let event = ProgressEvent::Complete { score: 0.82 };
        let json = serde_json::to_string(&event).unwrap();
        let back: ProgressEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, back);
    }

    #[test]
    fn test_collecting_sink_preserves_order() {
        let sink = CollectingSink::new();
        sink.emit(&ProgressEvent::Start { prompt: "p".into() });
        sink.emit(&ProgressEvent::Progress { stage: "context".into() });
        sink.emit(&ProgressEvent::Complete { score: 1.0 });

        let kinds: Vec<&str> = sink.events().iter().map(|e| e.kind()).collect();
        assert_eq!(kinds, vec!["start", "progress", "complete"]);
    }
}
