//! Pluggable context probes.
//!
//! A probe contributes one short text hint to the prompt enhancer. Probes
//! are polled in parallel with a per-probe timeout, cached per probe name
//! through the shared cache service, and never abort the bundle: a
//! failing probe simply contributes nothing.

pub mod builtin;

pub use builtin::{ClockProbe, LocaleProbe, SystemLoadProbe};

use async_trait::async_trait;
use chrono::Duration;
use futures::future::join_all;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheNamespace, TtlCache};
use crate::error::Result;

/// Default per-probe timeout when a probe does not override it.
pub const DEFAULT_PROBE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// A read-only signal source producing a short text hint.
#[async_trait]
pub trait ContextProbe: Send + Sync {
    /// Stable probe name; also the cache key.
    fn name(&self) -> &str;

    /// How long a hint stays fresh.
    fn ttl(&self) -> Duration;

    /// Per-probe poll timeout.
    fn timeout(&self) -> std::time::Duration {
        DEFAULT_PROBE_TIMEOUT
    }

    /// Produce the hint. Errors are swallowed by the bundle.
    async fn hint(&self) -> Result<String>;
}

/// One gathered hint.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeHint {
    pub name: String,
    pub hint: String,
    /// Whether this came from the probe's TTL cache.
    pub cached: bool,
}

/// Ordered collection of probe outputs.
#[derive(Debug, Clone, Default)]
pub struct ContextBundle {
    /// In probe-registration order; empty hints are already dropped.
    pub hints: Vec<ProbeHint>,
}

impl ContextBundle {
    /// The non-empty hints joined by newlines.
    pub fn block(&self) -> String {
        self.hints
            .iter()
            .map(|h| h.hint.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn is_empty(&self) -> bool {
        self.hints.is_empty()
    }
}

/// The registered probes plus their shared TTL cache namespace.
pub struct ProbeSet {
    probes: Vec<Arc<dyn ContextProbe>>,
    cache: CacheNamespace,
}

impl ProbeSet {
    pub fn new(cache: &TtlCache) -> Self {
        Self {
            probes: Vec::new(),
            cache: cache.namespace("probes", Duration::seconds(60)),
        }
    }

    /// A set pre-loaded with the builtin probes.
    pub fn with_builtins(cache: &TtlCache) -> Self {
        let mut set = Self::new(cache);
        set.register(Arc::new(ClockProbe));
        set.register(Arc::new(SystemLoadProbe));
        set.register(Arc::new(LocaleProbe));
        set
    }

    /// Register a probe. Bundle order follows registration order.
    pub fn register(&mut self, probe: Arc<dyn ContextProbe>) {
        self.probes.push(probe);
    }

    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    /// Poll every probe in parallel and assemble the bundle.
    pub async fn gather(&self, cancel: &CancellationToken) -> ContextBundle {
        let polls = self.probes.iter().map(|probe| {
            let probe = probe.clone();
            let cache = self.cache.clone();
            let cancel = cancel.clone();
            async move {
                if let Some(cached) = cache.get(probe.name()).await {
                    if let Some(hint) = cached.as_str().filter(|h| !h.is_empty()) {
                        return Some(ProbeHint {
                            name: probe.name().to_string(),
                            hint: hint.to_string(),
                            cached: true,
                        });
                    }
                }

                let hint = tokio::select! {
                    _ = cancel.cancelled() => return None,
                    polled = tokio::time::timeout(probe.timeout(), probe.hint()) => match polled {
                        Ok(Ok(hint)) => hint,
                        Ok(Err(e)) => {
                            tracing::debug!(probe = probe.name(), error = %e, "probe failed");
                            return None;
                        }
                        Err(_) => {
                            tracing::debug!(probe = probe.name(), "probe timed out");
                            return None;
                        }
                    },
                };

                let hint = hint.trim().to_string();
                if hint.is_empty() {
                    return None;
                }
                cache
                    .set_with_ttl(probe.name(), json!(hint.clone()), probe.ttl())
                    .await;
                Some(ProbeHint {
                    name: probe.name().to_string(),
                    hint,
                    cached: false,
                })
            }
        });

        let hints = join_all(polls).await.into_iter().flatten().collect();
        ContextBundle { hints }
    }
}
