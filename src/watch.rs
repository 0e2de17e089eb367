//! Watch mode: regenerate on prompt-file changes.
//!
//! Watches a file or directory recursively for `*.txt`/`*.md` changes,
//! debounces them, and runs the pipeline with the changed file's content
//! as the intent. Change events that arrive while a generation is in
//! flight are dropped. A small HTTP server exposes the dashboard, the
//! most recent HTML, and the event stream.

use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use notify::{RecursiveMode, Watcher as _};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::http::{SseChannel, SseChannelConfig};
use crate::pipeline::{Intent, Pipeline};

/// Watch-mode options.
#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub debounce: Duration,
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
        }
    }
}

/// Whether a changed path should trigger regeneration.
fn is_prompt_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("txt") | Some("md")
    )
}

/// Shared state behind the dashboard routes.
#[derive(Clone)]
pub struct WatchState {
    pub latest: Arc<RwLock<Option<String>>>,
    pub channel: Arc<SseChannel>,
}

/// The watch-mode driver.
pub struct WatchMode {
    pipeline: Arc<Pipeline>,
    target: PathBuf,
    options: WatchOptions,
    channel: Arc<SseChannel>,
    latest: Arc<RwLock<Option<String>>>,
    iteration: AtomicU32,
    in_flight: AtomicBool,
}

impl WatchMode {
    pub fn new(pipeline: Arc<Pipeline>, target: impl AsRef<Path>, options: WatchOptions) -> Self {
        Self {
            pipeline,
            target: target.as_ref().to_path_buf(),
            options,
            channel: Arc::new(SseChannel::new(SseChannelConfig::default())),
            latest: Arc::new(RwLock::new(None)),
            iteration: AtomicU32::new(0),
            in_flight: AtomicBool::new(false),
        }
    }

    /// State for [`watch_router`].
    pub fn state(&self) -> WatchState {
        WatchState {
            latest: self.latest.clone(),
            channel: self.channel.clone(),
        }
    }

    /// Run one generation for a changed file.
    pub async fn fire(&self, file: &Path, cancel: &CancellationToken) {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!(file = %file.display(), "generation in flight, change dropped");
            return;
        }

        let iteration = self.iteration.fetch_add(1, Ordering::SeqCst) + 1;
        let started = Instant::now();
        let outcome = async {
            let text = tokio::fs::read_to_string(file)
                .await
                .map_err(|e| Error::persistence(format!("unreadable prompt file: {}", e)))?;
            let intent = Intent::new(text);
            self.pipeline.run(&intent, cancel).await
        }
        .await;

        let elapsed = started.elapsed().as_millis() as u64;
        match outcome {
            Ok(result) => {
                *self.latest.write().await = Some(result.html.clone());
                self.channel.broadcast(
                    json!({
                        "type": "generated",
                        "iteration": iteration,
                        "file": file.display().to_string(),
                        "elapsed": elapsed,
                        "score": result.score.total,
                        "grade": result.score.grade.to_string(),
                    })
                    .to_string(),
                );
            }
            Err(e) => {
                tracing::warn!(file = %file.display(), error = %e, "watch generation failed");
                self.channel.broadcast(
                    json!({
                        "type": "error",
                        "iteration": iteration,
                        "file": file.display().to_string(),
                        "elapsed": elapsed,
                        "message": e.to_string(),
                    })
                    .to_string(),
                );
            }
        }

        self.in_flight.store(false, Ordering::SeqCst);
    }

    /// Watch until cancelled. Fires immediately when the target is a
    /// file, then on every debounced change.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<PathBuf>();

        let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
            if let Ok(event) = event {
                for path in event.paths {
                    if is_prompt_file(&path) {
                        let _ = tx.send(path);
                    }
                }
            }
        })
        .map_err(|e| Error::Internal(format!("watcher setup failed: {}", e)))?;

        watcher
            .watch(&self.target, RecursiveMode::Recursive)
            .map_err(|e| Error::Internal(format!("cannot watch {}: {}", self.target.display(), e)))?;
        tracing::info!(target = %self.target.display(), "watch mode started");

        if self.target.is_file() {
            self.fire(&self.target, cancel).await;
        }

        loop {
            let changed = tokio::select! {
                _ = cancel.cancelled() => break,
                changed = rx.recv() => match changed {
                    Some(path) => path,
                    None => break,
                },
            };

            // Trailing debounce: keep absorbing events, remembering only
            // the most recent path, until the quiet period elapses.
            let mut latest_path = changed;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    more = rx.recv() => match more {
                        Some(path) => latest_path = path,
                        None => break,
                    },
                    _ = tokio::time::sleep(self.options.debounce) => break,
                }
            }

            self.fire(&latest_path, cancel).await;
        }

        self.channel.close();
        Ok(())
    }
}

const DASHBOARD_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="utf-8"><title>forge watch</title></head>
<body>
<h1>forge watch</h1>
<iframe id="preview" src="/latest" style="width:100%;height:80vh;border:1px solid #ccc"></iframe>
<script>
const events = new EventSource('/events');
events.onmessage = () => { document.getElementById('preview').src = '/latest?' + Date.now(); };
</script>
</body>
</html>
"#;

async fn dashboard() -> Html<&'static str> {
    Html(DASHBOARD_PAGE)
}

async fn latest(axum::extract::State(state): axum::extract::State<WatchState>) -> Response {
    match state.latest.read().await.clone() {
        Some(html) => ([(header::CONTENT_TYPE, "text/html")], html).into_response(),
        None => (StatusCode::NOT_FOUND, "no generation yet").into_response(),
    }
}

async fn events(axum::extract::State(state): axum::extract::State<WatchState>) -> Response {
    state.channel.handler()
}

/// Routes for the watch dashboard.
pub fn watch_router(state: WatchState) -> axum::Router {
    axum::Router::new()
        .route("/", get(dashboard))
        .route("/latest", get(latest))
        .route("/events", get(events))
        .with_state(state)
}
