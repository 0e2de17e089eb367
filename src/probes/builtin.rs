//! Builtin probes: cheap local signals with no network dependency.

use async_trait::async_trait;
use chrono::{Duration, Local, Timelike};

use super::ContextProbe;
use crate::error::{Error, Result};

/// Time-of-day phase, e.g. "late evening on a Tuesday".
pub struct ClockProbe;

fn phase_of(hour: u32) -> &'static str {
    match hour {
        5..=8 => "early morning",
        9..=11 => "mid-morning",
        12..=13 => "midday",
        14..=17 => "afternoon",
        18..=21 => "evening",
        _ => "late night",
    }
}

#[async_trait]
impl ContextProbe for ClockProbe {
    fn name(&self) -> &str {
        "clock"
    }

    fn ttl(&self) -> Duration {
        Duration::minutes(15)
    }

    async fn hint(&self) -> Result<String> {
        let now = Local::now();
        Ok(format!(
            "it is {} on a {}",
            phase_of(now.hour()),
            now.format("%A")
        ))
    }
}

/// One-minute load average from `/proc/loadavg`; silent elsewhere.
pub struct SystemLoadProbe;

#[async_trait]
impl ContextProbe for SystemLoadProbe {
    fn name(&self) -> &str {
        "system-load"
    }

    fn ttl(&self) -> Duration {
        Duration::minutes(1)
    }

    async fn hint(&self) -> Result<String> {
        let raw = tokio::fs::read_to_string("/proc/loadavg")
            .await
            .map_err(|e| Error::Internal(format!("loadavg unavailable: {}", e)))?;
        let load = raw
            .split_whitespace()
            .next()
            .ok_or_else(|| Error::Internal("empty loadavg".into()))?;
        Ok(format!("machine load average {}", load))
    }
}

/// UI language preference from the `LANG` environment variable.
pub struct LocaleProbe;

#[async_trait]
impl ContextProbe for LocaleProbe {
    fn name(&self) -> &str {
        "locale"
    }

    fn ttl(&self) -> Duration {
        Duration::hours(1)
    }

    async fn hint(&self) -> Result<String> {
        let lang = std::env::var("LANG")
            .map_err(|_| Error::Internal("LANG unset".into()))?;
        let tag = lang.split('.').next().unwrap_or("").trim();
        if tag.is_empty() || tag == "C" || tag == "POSIX" {
            return Err(Error::Internal("no meaningful locale".into()));
        }
        Ok(format!("user locale {}", tag))
    }
}
