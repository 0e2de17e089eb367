//! Curated prompt library ("grimoire").
//!
//! Entries are inscribed once and mutated in place (favorite flag, usage
//! counter, score). Query results are always ordered favorite-first, then
//! by score, then by usage. Persists to a single `grimoire.json`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::error::{Error, Result};
use crate::store::short_id;

/// One inscribed prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrimoireEntry {
    /// Opaque, stable, never reused.
    pub id: String,
    pub prompt: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub category: String,
    #[serde(default)]
    pub favorite: bool,
    /// Opaque quality value in `[0,1]`; the grimoire never interprets it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub used_count: u64,
}

/// Input for [`Grimoire::inscribe`].
#[derive(Debug, Clone, Default)]
pub struct Inscription {
    pub prompt: String,
    pub tags: Vec<String>,
    pub category: String,
    pub score: Option<f64>,
    pub metadata: HashMap<String, Value>,
}

/// Query over the grimoire. All filters are conjunctive.
#[derive(Debug, Clone, Default)]
pub struct GrimoireQuery {
    /// Free text matched against prompt, tags and category.
    pub text: Option<String>,
    pub tag: Option<String>,
    pub category: Option<String>,
    pub favorites_only: bool,
    pub limit: Option<usize>,
}

/// Aggregates over the library.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrimoireStats {
    pub total: u64,
    pub favorites: u64,
    pub by_tag: HashMap<String, u64>,
    pub by_category: HashMap<String, u64>,
    /// Mean over entries that carry a score.
    pub mean_score: f64,
    /// `(id, used_count)` for the five most-used entries.
    pub top_used: Vec<(String, u64)>,
}

/// The prompt library.
pub struct Grimoire {
    path: PathBuf,
    entries: RwLock<Vec<GrimoireEntry>>,
}

impl Grimoire {
    /// Open (or create) the grimoire at `<root>/grimoire.json`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let path = root.as_ref().join("grimoire.json");
        let entries = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), error = %e, "unreadable grimoire, starting empty");
                Vec::new()
            }),
            Err(_) => Vec::new(),
        };
        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    fn flush(&self, entries: &[GrimoireEntry]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec_pretty(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn write_guard(&self) -> Result<std::sync::RwLockWriteGuard<'_, Vec<GrimoireEntry>>> {
        self.entries
            .write()
            .map_err(|_| Error::Internal("grimoire lock poisoned".into()))
    }

    fn read_guard(&self) -> Result<std::sync::RwLockReadGuard<'_, Vec<GrimoireEntry>>> {
        self.entries
            .read()
            .map_err(|_| Error::Internal("grimoire lock poisoned".into()))
    }

    /// Inscribe a new prompt; rejects blank prompts.
    pub fn inscribe(&self, inscription: Inscription) -> Result<GrimoireEntry> {
        if inscription.prompt.trim().is_empty() {
            return Err(Error::InvalidInput("prompt must not be empty".into()));
        }

        let entry = GrimoireEntry {
            id: short_id(),
            prompt: inscription.prompt,
            tags: inscription.tags,
            category: inscription.category,
            favorite: false,
            score: inscription.score.map(|s| s.clamp(0.0, 1.0)),
            metadata: inscription.metadata,
            created_at: Utc::now(),
            used_count: 0,
        };

        let mut entries = self.write_guard()?;
        entries.push(entry.clone());
        self.flush(&entries)?;
        Ok(entry)
    }

    /// Fetch by id.
    pub fn get(&self, id: &str) -> Result<GrimoireEntry> {
        self.read_guard()?
            .iter()
            .find(|e| e.id == id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("grimoire entry {}", id)))
    }

    /// Query, always ordered favorite DESC, score DESC, used_count DESC.
    pub fn search(&self, query: &GrimoireQuery) -> Result<Vec<GrimoireEntry>> {
        let entries = self.read_guard()?;
        let needle = query.text.as_ref().map(|t| t.to_lowercase());

        let mut hits: Vec<GrimoireEntry> = entries
            .iter()
            .filter(|e| {
                if query.favorites_only && !e.favorite {
                    return false;
                }
                if let Some(tag) = &query.tag {
                    if !e.tags.iter().any(|t| t.eq_ignore_ascii_case(tag)) {
                        return false;
                    }
                }
                if let Some(category) = &query.category {
                    if !e.category.eq_ignore_ascii_case(category) {
                        return false;
                    }
                }
                if let Some(needle) = &needle {
                    let hit = e.prompt.to_lowercase().contains(needle)
                        || e.category.to_lowercase().contains(needle)
                        || e.tags.iter().any(|t| t.to_lowercase().contains(needle));
                    if !hit {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect();

        hits.sort_by(|a, b| {
            b.favorite
                .cmp(&a.favorite)
                .then_with(|| {
                    b.score
                        .unwrap_or(0.0)
                        .partial_cmp(&a.score.unwrap_or(0.0))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| b.used_count.cmp(&a.used_count))
        });

        if let Some(limit) = query.limit {
            hits.truncate(limit);
        }
        Ok(hits)
    }

    /// Flip the favorite flag, returning the new value.
    pub fn toggle_favorite(&self, id: &str) -> Result<bool> {
        let mut entries = self.write_guard()?;
        let entry = entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| Error::NotFound(format!("grimoire entry {}", id)))?;
        entry.favorite = !entry.favorite;
        let value = entry.favorite;
        self.flush(&entries)?;
        Ok(value)
    }

    /// Increment the usage counter, returning the new count.
    pub fn record_use(&self, id: &str) -> Result<u64> {
        let mut entries = self.write_guard()?;
        let entry = entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| Error::NotFound(format!("grimoire entry {}", id)))?;
        entry.used_count += 1;
        let count = entry.used_count;
        self.flush(&entries)?;
        Ok(count)
    }

    /// Replace the score, clamped to `[0,1]`.
    pub fn update_score(&self, id: &str, score: f64) -> Result<()> {
        let mut entries = self.write_guard()?;
        let entry = entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| Error::NotFound(format!("grimoire entry {}", id)))?;
        entry.score = Some(score.clamp(0.0, 1.0));
        self.flush(&entries)
    }

    /// Remove an entry. Returns whether it existed. The id is retired.
    pub fn remove(&self, id: &str) -> Result<bool> {
        let mut entries = self.write_guard()?;
        let before = entries.len();
        entries.retain(|e| e.id != id);
        let existed = entries.len() != before;
        if existed {
            self.flush(&entries)?;
        }
        Ok(existed)
    }

    /// Aggregate statistics.
    pub fn stats(&self) -> Result<GrimoireStats> {
        let entries = self.read_guard()?;

        let mut by_tag: HashMap<String, u64> = HashMap::new();
        let mut by_category: HashMap<String, u64> = HashMap::new();
        let mut score_sum = 0.0;
        let mut score_count = 0u64;

        for entry in entries.iter() {
            for tag in &entry.tags {
                *by_tag.entry(tag.clone()).or_default() += 1;
            }
            *by_category.entry(entry.category.clone()).or_default() += 1;
            if let Some(score) = entry.score {
                score_sum += score;
                score_count += 1;
            }
        }

        let mut top_used: Vec<(String, u64)> = entries
            .iter()
            .filter(|e| e.used_count > 0)
            .map(|e| (e.id.clone(), e.used_count))
            .collect();
        top_used.sort_by(|a, b| b.1.cmp(&a.1));
        top_used.truncate(5);

        Ok(GrimoireStats {
            total: entries.len() as u64,
            favorites: entries.iter().filter(|e| e.favorite).count() as u64,
            by_tag,
            by_category,
            mean_score: if score_count == 0 {
                0.0
            } else {
                score_sum / score_count as f64
            },
            top_used,
        })
    }
}
