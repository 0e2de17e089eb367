//! Usage telemetry with per-day rollups.
//!
//! Every provider call appends one record; the file keeps only the most
//! recent 1000 records, enforced on each write. Writes are serialized
//! through a single lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Error, Result};

/// Cap on retained records.
pub const MAX_RECORDS: usize = 1_000;

/// One provider call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryRecord {
    pub at: DateTime<Utc>,
    pub model: String,
    pub in_tokens: u64,
    pub out_tokens: u64,
    pub cost_est: f64,
    pub duration_ms: u64,
    pub success: bool,
}

/// Aggregate over one calendar day (UTC).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DayRollup {
    /// `YYYY-MM-DD`
    pub day: String,
    pub calls: u64,
    pub in_tokens: u64,
    pub out_tokens: u64,
    pub cost_est: f64,
    pub successes: u64,
}

impl DayRollup {
    pub fn success_rate(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.successes as f64 / self.calls as f64
        }
    }
}

/// Telemetry store at `<root>/telemetry/usage.json`.
pub struct Telemetry {
    path: PathBuf,
    records: Mutex<Vec<TelemetryRecord>>,
}

impl Telemetry {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let path = root.as_ref().join("telemetry").join("usage.json");
        let records = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => Vec::new(),
        };
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    /// Append a record, enforce the cap, persist.
    pub fn record(&self, record: TelemetryRecord) -> Result<()> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| Error::Internal("telemetry lock poisoned".into()))?;
        records.push(record);
        if records.len() > MAX_RECORDS {
            let excess = records.len() - MAX_RECORDS;
            records.drain(..excess);
        }

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec_pretty(&*records)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// All retained records, oldest first.
    pub fn records(&self) -> Result<Vec<TelemetryRecord>> {
        Ok(self
            .records
            .lock()
            .map_err(|_| Error::Internal("telemetry lock poisoned".into()))?
            .clone())
    }

    /// Per-day rollups, oldest day first.
    pub fn rollups(&self) -> Result<Vec<DayRollup>> {
        let records = self.records()?;
        let mut days: BTreeMap<String, DayRollup> = BTreeMap::new();

        for record in &records {
            let day = record.at.format("%Y-%m-%d").to_string();
            let rollup = days.entry(day.clone()).or_insert_with(|| DayRollup {
                day,
                calls: 0,
                in_tokens: 0,
                out_tokens: 0,
                cost_est: 0.0,
                successes: 0,
            });
            rollup.calls += 1;
            rollup.in_tokens += record.in_tokens;
            rollup.out_tokens += record.out_tokens;
            rollup.cost_est += record.cost_est;
            if record.success {
                rollup.successes += 1;
            }
        }

        Ok(days.into_values().collect())
    }
}
