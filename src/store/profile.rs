//! User taste profile.
//!
//! One small `profile.json` holding a free-form taste hint plus style
//! counters. The enhancer folds the hint into every prompt; the counters
//! let the hint drift toward what the user actually generates.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Error, Result};

/// Persisted profile shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProfileData {
    /// One-line hint folded into enhanced prompts.
    #[serde(default)]
    pub hint: Option<String>,
    /// Runs per style preset name.
    #[serde(default)]
    pub style_counts: HashMap<String, u64>,
}

/// Profile store at `<root>/profile.json`.
pub struct Profile {
    path: PathBuf,
    data: Mutex<ProfileData>,
}

impl Profile {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let path = root.as_ref().join("profile.json");
        let data = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => ProfileData::default(),
        };
        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    fn flush(&self, data: &ProfileData) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec_pretty(data)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// The current hint, if any.
    pub fn hint(&self) -> Result<Option<String>> {
        Ok(self
            .data
            .lock()
            .map_err(|_| Error::Internal("profile lock poisoned".into()))?
            .hint
            .clone())
    }

    /// Replace the hint.
    pub fn set_hint(&self, hint: impl Into<String>) -> Result<()> {
        let mut data = self
            .data
            .lock()
            .map_err(|_| Error::Internal("profile lock poisoned".into()))?;
        data.hint = Some(hint.into());
        self.flush(&data)
    }

    /// Count one run of a style preset.
    pub fn record_style(&self, style: &str) -> Result<()> {
        let mut data = self
            .data
            .lock()
            .map_err(|_| Error::Internal("profile lock poisoned".into()))?;
        *data.style_counts.entry(style.to_string()).or_default() += 1;
        self.flush(&data)
    }

    /// The most-used style preset, if any runs were counted.
    pub fn favorite_style(&self) -> Result<Option<String>> {
        let data = self
            .data
            .lock()
            .map_err(|_| Error::Internal("profile lock poisoned".into()))?;
        Ok(data
            .style_counts
            .iter()
            .max_by_key(|(_, count)| **count)
            .map(|(style, _)| style.clone()))
    }
}
