//! Output rendering: slugged, dated HTML files.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Maximum slug length in characters.
const MAX_SLUG_LEN: usize = 40;

/// Slugify an intent: lowercase, non-alphanumerics to dashes, trimmed of
/// leading/trailing dashes, truncated to 40 characters.
pub fn slug(intent: &str) -> String {
    let mut out = String::with_capacity(intent.len());
    let mut last_dash = true; // suppress a leading dash
    for c in intent.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
        if out.len() >= MAX_SLUG_LEN {
            break;
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "app".to_string()
    } else {
        trimmed.to_string()
    }
}

/// The output filename for an intent at a given time:
/// `<slug>-<YYYY-MM-DD>.html`.
pub fn output_filename(intent: &str, at: DateTime<Utc>) -> String {
    format!("{}-{}.html", slug(intent), at.format("%Y-%m-%d"))
}

/// Writes rendered HTML files into an output directory.
pub struct OutputRenderer {
    dir: PathBuf,
}

impl OutputRenderer {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Write the document, replacing atomically. Returns the final path.
    pub fn render(&self, intent: &str, html: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(output_filename(intent, Utc::now()));
        let tmp = path.with_extension("html.tmp");
        std::fs::write(&tmp, html)?;
        std::fs::rename(&tmp, &path)?;
        tracing::info!(path = %path.display(), bytes = html.len(), "rendered output file");
        Ok(path)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}
