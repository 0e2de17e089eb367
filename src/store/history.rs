//! Append-only record of generation runs.
//!
//! Metadata and the generated HTML artifact live in two collections keyed
//! by the same id; deleting one side always deletes the other.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::store::kv::KvStore;
use crate::store::short_id;
use crate::validate::{Grade, Score};

const META_COLLECTION: &str = "history";
const CODE_COLLECTION: &str = "artifacts";

/// A persisted run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub prompt: String,
    pub enhanced_prompt_hash: String,
    pub model: String,
    pub provider: String,
    pub score: Score,
    pub grade: Grade,
    pub code_length: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub at: DateTime<Utc>,
}

/// Input for [`History::record`]; id and timestamp are assigned on insert.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub prompt: String,
    pub enhanced_prompt_hash: String,
    pub model: String,
    pub provider: String,
    pub score: Score,
    pub style: Option<String>,
    pub tags: Vec<String>,
}

/// Filters for [`History::list`].
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub provider: Option<String>,
    /// Keep entries graded at least this well.
    pub min_grade: Option<Grade>,
    pub limit: Option<usize>,
}

/// Aggregates over the whole history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryStats {
    pub total: u64,
    pub by_provider: HashMap<String, u64>,
    pub by_grade: HashMap<String, u64>,
    pub mean_conatus: f64,
    pub mean_ratio: f64,
    pub mean_laetitia: f64,
    pub mean_natura: f64,
    pub mean_total: f64,
}

/// Run history over the shared [`KvStore`].
pub struct History {
    store: Arc<KvStore>,
}

impl History {
    pub fn new(store: Arc<KvStore>) -> Self {
        Self { store }
    }

    /// Append a run and its artifact, returning the stored entry.
    pub fn record(&self, run: RunRecord, html: &str) -> Result<HistoryEntry> {
        let entry = HistoryEntry {
            id: short_id(),
            prompt: run.prompt,
            enhanced_prompt_hash: run.enhanced_prompt_hash,
            model: run.model,
            provider: run.provider,
            grade: run.score.grade,
            score: run.score,
            code_length: html.len(),
            style: run.style,
            tags: run.tags,
            at: Utc::now(),
        };

        self.store.set(
            META_COLLECTION,
            entry.id.clone(),
            serde_json::to_value(&entry)?,
        )?;
        // Artifact second: a crash between the two writes leaves metadata
        // whose artifact lookup reports NotFound, never an orphaned blob.
        self.store
            .set(CODE_COLLECTION, entry.id.clone(), serde_json::json!(html))?;

        tracing::debug!(id = %entry.id, grade = %entry.grade, "history entry recorded");
        Ok(entry)
    }

    /// Fetch metadata by id.
    pub fn get(&self, id: &str) -> Result<HistoryEntry> {
        let value = self
            .store
            .get(META_COLLECTION, id)?
            .ok_or_else(|| Error::NotFound(format!("history entry {}", id)))?;
        Ok(serde_json::from_value(value)?)
    }

    /// Fetch the stored HTML by id.
    pub fn get_code(&self, id: &str) -> Result<String> {
        let value = self
            .store
            .get(CODE_COLLECTION, id)?
            .ok_or_else(|| Error::NotFound(format!("artifact {}", id)))?;
        value
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| Error::persistence(format!("artifact {} is not a string", id)))
    }

    /// Delete both metadata and artifact. Returns whether anything existed.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let meta = self.store.delete(META_COLLECTION, id)?;
        let code = self.store.delete(CODE_COLLECTION, id)?;
        Ok(meta || code)
    }

    fn entries(&self) -> Result<Vec<HistoryEntry>> {
        let mut entries: Vec<HistoryEntry> = self
            .store
            .all(META_COLLECTION)?
            .into_iter()
            .filter_map(|(_, v)| serde_json::from_value(v).ok())
            .collect();
        entries.sort_by(|a, b| b.at.cmp(&a.at));
        Ok(entries)
    }

    /// List entries, newest first.
    pub fn list(&self, opts: &ListOptions) -> Result<Vec<HistoryEntry>> {
        let mut entries = self.entries()?;

        if let Some(provider) = &opts.provider {
            entries.retain(|e| &e.provider == provider);
        }
        if let Some(min_grade) = opts.min_grade {
            // Grade orders S first, so "at least min_grade" is <=.
            entries.retain(|e| e.grade <= min_grade);
        }
        if let Some(limit) = opts.limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    /// Case-insensitive substring search over prompt text and tags.
    pub fn search(&self, query: &str) -> Result<Vec<HistoryEntry>> {
        let needle = query.to_lowercase();
        let mut entries = self.entries()?;
        entries.retain(|e| {
            e.prompt.to_lowercase().contains(&needle)
                || e.tags.iter().any(|t| t.to_lowercase().contains(&needle))
        });
        Ok(entries)
    }

    /// Totals by provider and grade, plus mean axis scores.
    pub fn stats(&self) -> Result<HistoryStats> {
        let entries = self.entries()?;
        let total = entries.len() as u64;

        let mut by_provider: HashMap<String, u64> = HashMap::new();
        let mut by_grade: HashMap<String, u64> = HashMap::new();
        let mut sums = [0.0f64; 5];

        for entry in &entries {
            *by_provider.entry(entry.provider.clone()).or_default() += 1;
            *by_grade.entry(entry.grade.to_string()).or_default() += 1;
            sums[0] += entry.score.conatus;
            sums[1] += entry.score.ratio;
            sums[2] += entry.score.laetitia;
            sums[3] += entry.score.natura;
            sums[4] += entry.score.total;
        }

        let denom = if total == 0 { 1.0 } else { total as f64 };
        Ok(HistoryStats {
            total,
            by_provider,
            by_grade,
            mean_conatus: sums[0] / denom,
            mean_ratio: sums[1] / denom,
            mean_laetitia: sums[2] / denom,
            mean_natura: sums[3] / denom,
            mean_total: sums[4] / denom,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validate::Validator;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn history() -> (TempDir, History) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(KvStore::open(dir.path()).unwrap());
        (dir, History::new(store))
    }

    fn run(prompt: &str, provider: &str, html: &str) -> RunRecord {
        RunRecord {
            prompt: prompt.to_string(),
            enhanced_prompt_hash: "abc123".to_string(),
            model: "gemini-2.0-flash".to_string(),
            provider: provider.to_string(),
            score: Validator::new().validate(html),
            style: Some("minimal".to_string()),
            tags: vec!["fitness".to_string()],
        }
    }

    #[test]
    fn test_record_then_get_round_trips() {
        let (_dir, history) = history();
        let html = "<!DOCTYPE html><html><body>app</body></html>";
        let entry = history.record(run("track my sleep", "gemini", html), html).unwrap();

        let fetched = history.get(&entry.id).unwrap();
        assert_eq!(fetched.prompt, "track my sleep");
        assert_eq!(fetched.code_length, html.len());
        assert_eq!(history.get_code(&entry.id).unwrap(), html);
    }

    #[test]
    fn test_get_missing_is_not_found() {
        let (_dir, history) = history();
        assert!(matches!(history.get("nope"), Err(Error::NotFound(_))));
        assert!(matches!(history.get_code("nope"), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_delete_removes_both_sides() {
        let (_dir, history) = history();
        let html = "<html></html>";
        let entry = history.record(run("a", "gemini", html), html).unwrap();

        assert!(history.delete(&entry.id).unwrap());
        assert!(history.get(&entry.id).is_err());
        assert!(history.get_code(&entry.id).is_err());
        assert!(!history.delete(&entry.id).unwrap());
    }

    #[test]
    fn test_list_newest_first_with_limit() {
        let (_dir, history) = history();
        let html = "<html></html>";
        let first = history.record(run("first", "gemini", html), html).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = history.record(run("second", "ollama", html), html).unwrap();

        let listed = history.list(&ListOptions::default()).unwrap();
        assert_eq!(listed[0].id, second.id);
        assert_eq!(listed[1].id, first.id);

        let limited = history
            .list(&ListOptions {
                limit: Some(1),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].id, second.id);
    }

    #[test]
    fn test_list_filters_by_provider_and_grade() {
        let (_dir, history) = history();
        let poor = "<html></html>";
        history.record(run("poor", "gemini", poor), poor).unwrap();

        let listed = history
            .list(&ListOptions {
                provider: Some("ollama".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert!(listed.is_empty());

        // A D-grade run is excluded by a min grade of B.
        let listed = history
            .list(&ListOptions {
                min_grade: Some(Grade::B),
                ..Default::default()
            })
            .unwrap();
        assert!(listed.is_empty());

        let listed = history
            .list(&ListOptions {
                min_grade: Some(Grade::D),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[test]
    fn test_search_matches_prompt_and_tags() {
        let (_dir, history) = history();
        let html = "<html></html>";
        history.record(run("Track my CARDIO", "gemini", html), html).unwrap();

        assert_eq!(history.search("cardio").unwrap().len(), 1);
        assert_eq!(history.search("fitness").unwrap().len(), 1);
        assert_eq!(history.search("chess").unwrap().len(), 0);
    }

    #[test]
    fn test_stats_grouping() {
        let (_dir, history) = history();
        let html = "<html></html>";
        history.record(run("a", "gemini", html), html).unwrap();
        history.record(run("b", "gemini", html), html).unwrap();
        history.record(run("c", "ollama", html), html).unwrap();

        let stats = history.stats().unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_provider["gemini"], 2);
        assert_eq!(stats.by_provider["ollama"], 1);
        assert_eq!(stats.by_grade.values().sum::<u64>(), 3);
        assert!(stats.mean_total >= 0.0 && stats.mean_total <= 1.0);
    }

    #[test]
    fn test_stats_empty_history() {
        let (_dir, history) = history();
        let stats = history.stats().unwrap();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.mean_total, 0.0);
    }
}
