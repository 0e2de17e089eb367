//! Workspace migration log.
//!
//! Applied migrations are recorded append-only in `.forge/migrations.json`.
//! A migration must be idempotent; pending migrations are those not yet
//! listed. Dry runs never write anything, log included.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// One applied-migration record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedMigration {
    pub version: u32,
    pub description: String,
    pub applied_at: DateTime<Utc>,
    pub result: String,
}

/// A single idempotent migration step.
pub trait Migration: Send + Sync {
    fn version(&self) -> u32;
    fn description(&self) -> &str;
    /// Apply the migration, returning a short result summary.
    /// With `dry_run` set, report what would happen without writing.
    fn apply(&self, root: &Path, dry_run: bool) -> Result<String>;
}

/// Creates the persistence directory layout.
struct EnsureLayout;

impl Migration for EnsureLayout {
    fn version(&self) -> u32 {
        1
    }

    fn description(&self) -> &str {
        "create store/ and telemetry/ directories"
    }

    fn apply(&self, root: &Path, dry_run: bool) -> Result<String> {
        let mut created = Vec::new();
        for dir in ["store", "telemetry", "versions"] {
            let path = root.join(dir);
            if !path.exists() {
                if !dry_run {
                    fs::create_dir_all(&path)?;
                }
                created.push(dir);
            }
        }
        Ok(if created.is_empty() {
            "layout already present".to_string()
        } else {
            format!("created {}", created.join(", "))
        })
    }
}

/// Seeds an empty workspace manifest.
struct EnsureWorkspaceManifest;

impl Migration for EnsureWorkspaceManifest {
    fn version(&self) -> u32 {
        2
    }

    fn description(&self) -> &str {
        "seed workspaces.json"
    }

    fn apply(&self, root: &Path, dry_run: bool) -> Result<String> {
        let path = root.join("workspaces.json");
        if path.exists() {
            return Ok("manifest already present".to_string());
        }
        if !dry_run {
            fs::write(&path, b"[]")?;
        }
        Ok("seeded empty manifest".to_string())
    }
}

/// Runs migrations against a workspace root.
pub struct Migrator {
    root: PathBuf,
    migrations: Vec<Box<dyn Migration>>,
}

impl Migrator {
    /// Migrator with the built-in migration set.
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            migrations: vec![Box::new(EnsureLayout), Box::new(EnsureWorkspaceManifest)],
        }
    }

    /// Migrator with a custom migration set (tests, plugins).
    pub fn with_migrations(root: impl AsRef<Path>, migrations: Vec<Box<dyn Migration>>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            migrations,
        }
    }

    fn log_path(&self) -> PathBuf {
        self.root.join(".forge").join("migrations.json")
    }

    /// Migrations already applied, in log order.
    pub fn applied(&self) -> Result<Vec<AppliedMigration>> {
        match fs::read(self.log_path()) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes).unwrap_or_default()),
            Err(_) => Ok(Vec::new()),
        }
    }

    /// Versions and descriptions of migrations not yet applied.
    pub fn pending(&self) -> Result<Vec<(u32, String)>> {
        let applied: Vec<u32> = self.applied()?.iter().map(|m| m.version).collect();
        let mut pending: Vec<(u32, String)> = self
            .migrations
            .iter()
            .filter(|m| !applied.contains(&m.version()))
            .map(|m| (m.version(), m.description().to_string()))
            .collect();
        pending.sort_by_key(|(v, _)| *v);
        Ok(pending)
    }

    /// Apply all pending migrations in version order.
    pub fn upgrade(&self, dry_run: bool) -> Result<Vec<AppliedMigration>> {
        let applied_versions: Vec<u32> = self.applied()?.iter().map(|m| m.version).collect();
        let mut todo: Vec<&Box<dyn Migration>> = self
            .migrations
            .iter()
            .filter(|m| !applied_versions.contains(&m.version()))
            .collect();
        todo.sort_by_key(|m| m.version());

        let mut newly_applied = Vec::new();
        for migration in todo {
            let result = migration.apply(&self.root, dry_run)?;
            tracing::info!(
                version = migration.version(),
                dry_run,
                %result,
                "migration applied"
            );
            newly_applied.push(AppliedMigration {
                version: migration.version(),
                description: migration.description().to_string(),
                applied_at: Utc::now(),
                result,
            });
        }

        if !dry_run && !newly_applied.is_empty() {
            let mut log = self.applied()?;
            log.extend(newly_applied.iter().cloned());
            let path = self.log_path();
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let bytes = serde_json::to_vec_pretty(&log)?;
            let tmp = path.with_extension("json.tmp");
            fs::write(&tmp, bytes)?;
            fs::rename(&tmp, &path)?;
        }

        Ok(newly_applied)
    }
}
