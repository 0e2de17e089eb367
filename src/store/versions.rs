//! Prompt version tracking.
//!
//! Each prompt id gets its own `versions/<promptId>.json` holding an
//! append-only list of versions. Useful for replaying how an inscribed
//! prompt evolved.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// One saved version of a prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptVersion {
    /// 1-based, assigned on append.
    pub version: u32,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    pub at: DateTime<Utc>,
}

/// Version store under `<root>/versions/`.
pub struct PromptVersions {
    dir: PathBuf,
}

impl PromptVersions {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let dir = root.as_ref().join("versions");
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, prompt_id: &str) -> Result<PathBuf> {
        if prompt_id.is_empty() || !prompt_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(Error::InvalidInput(format!(
                "bad prompt id: {:?}",
                prompt_id
            )));
        }
        Ok(self.dir.join(format!("{}.json", prompt_id)))
    }

    fn read(&self, prompt_id: &str) -> Result<Vec<PromptVersion>> {
        let path = self.path_for(prompt_id)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).unwrap_or_default()),
            Err(_) => Ok(Vec::new()),
        }
    }

    /// Append a version, returning its number.
    pub fn append(
        &self,
        prompt_id: &str,
        prompt: impl Into<String>,
        note: Option<String>,
    ) -> Result<u32> {
        let mut versions = self.read(prompt_id)?;
        let version = versions.len() as u32 + 1;
        versions.push(PromptVersion {
            version,
            prompt: prompt.into(),
            note,
            at: Utc::now(),
        });

        let path = self.path_for(prompt_id)?;
        let bytes = serde_json::to_vec_pretty(&versions)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;
        Ok(version)
    }

    /// All versions for a prompt, oldest first.
    pub fn list(&self, prompt_id: &str) -> Result<Vec<PromptVersion>> {
        self.read(prompt_id)
    }

    /// The latest version, or `NotFound` when the prompt has none.
    pub fn latest(&self, prompt_id: &str) -> Result<PromptVersion> {
        self.read(prompt_id)?
            .into_iter()
            .last()
            .ok_or_else(|| Error::NotFound(format!("versions for {}", prompt_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_append_assigns_sequential_versions() {
        let dir = TempDir::new().unwrap();
        let versions = PromptVersions::open(dir.path()).unwrap();

        assert_eq!(versions.append("abc123", "first draft", None).unwrap(), 1);
        assert_eq!(
            versions
                .append("abc123", "second draft", Some("tightened wording".into()))
                .unwrap(),
            2
        );

        let listed = versions.list("abc123").unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].version, 1);
        assert_eq!(versions.latest("abc123").unwrap().prompt, "second draft");
    }

    #[test]
    fn test_prompts_are_isolated_files() {
        let dir = TempDir::new().unwrap();
        let versions = PromptVersions::open(dir.path()).unwrap();
        versions.append("aaa", "a", None).unwrap();
        versions.append("bbb", "b", None).unwrap();

        assert!(dir.path().join("versions/aaa.json").exists());
        assert!(dir.path().join("versions/bbb.json").exists());
        assert_eq!(versions.list("aaa").unwrap().len(), 1);
    }

    #[test]
    fn test_latest_of_unknown_prompt_is_not_found() {
        let dir = TempDir::new().unwrap();
        let versions = PromptVersions::open(dir.path()).unwrap();
        assert!(matches!(
            versions.latest("ghost"),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_path_traversal_rejected() {
        let dir = TempDir::new().unwrap();
        let versions = PromptVersions::open(dir.path()).unwrap();
        assert!(matches!(
            versions.append("../evil", "x", None),
            Err(Error::InvalidInput(_))
        ));
    }
}
