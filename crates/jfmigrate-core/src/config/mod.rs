//! Migration configuration.
//!
//! A run is described by one JSON document that is loaded and validated once,
//! before any file is touched. Everything downstream receives the immutable
//! [`MigrationConfig`] explicitly.

mod jobs;
mod rules;

pub use jobs::{ColumnKind, ColumnSpec, Job, JobLists, Phase, TableSpec, TargetPolicy};
pub use rules::{normalize_separators, PathRuleSet, ReplacementRule, SlashStyle};

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{MigrateError, Result};
use crate::ids::IdKind;

/// Engine tunables.
pub struct EngineConfig;

impl EngineConfig {
    /// SQLite `busy_timeout` applied to every connection.
    pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

    // Bounded retries around store open / transaction begin
    pub const RETRY_ATTEMPTS: u32 = 4;
    pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);
    pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(5);

    // Run state
    pub const STATE_DIR_SUFFIX: &'static str = "jfmigrate";
    pub const LEDGER_FILE_NAME: &'static str = "ledger.jsonl";
    pub const ID_MAP_FILE_NAME: &'static str = "id_map.json";
}

/// The root-relocation triple.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Roots {
    /// Where the installation lived when the server wrote its paths.
    /// Defaults to `source`.
    #[serde(default)]
    pub original: Option<String>,
    /// Where the installation can be read from now.
    pub source: PathBuf,
    /// Directory receiving container-rooted and relative targets.
    pub target: PathBuf,
}

impl Roots {
    pub fn original_root(&self) -> String {
        self.original
            .clone()
            .unwrap_or_else(|| self.source.to_string_lossy().into_owned())
    }
}

/// Inputs to identifier derivation on both sides of the migration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdDerivationConfig {
    /// Program-data directory as the old server stored it.
    #[serde(default)]
    pub old_program_data_path: Option<String>,
    /// Program-data directory as the new server will see it. Defaults to the
    /// old one rewritten through the path rules.
    #[serde(default)]
    pub new_program_data_path: Option<String>,
    #[serde(default)]
    pub case_sensitive: bool,
    /// Encodings searched for identifiers inside file and directory names.
    #[serde(default = "default_path_id_kinds")]
    pub path_id_kinds: Vec<IdKind>,
}

fn default_path_id_kinds() -> Vec<IdKind> {
    vec![IdKind::AncestorStr]
}

impl Default for IdDerivationConfig {
    fn default() -> Self {
        Self {
            old_program_data_path: None,
            new_program_data_path: None,
            case_sensitive: false,
            path_id_kinds: default_path_id_kinds(),
        }
    }
}

/// Where phase 2 reads the items whose identifiers get recomputed.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IdSourceConfig {
    /// Store path relative to the source root.
    pub store: String,
    pub table: String,
    pub id_column: String,
    pub type_column: String,
    pub path_column: String,
}

impl Default for IdSourceConfig {
    fn default() -> Self {
        Self {
            store: "data/library.db".to_string(),
            table: "TypedBaseItems".to_string(),
            id_column: "guid".to_string(),
            type_column: "type".to_string(),
            path_column: "path".to_string(),
        }
    }
}

/// Phase 4 settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimestampConfig {
    pub enabled: bool,
    /// Store path relative to the source root; its migrated copy is edited.
    pub store: String,
    pub table: String,
    pub path_column: String,
    pub created_column: String,
    pub modified_column: String,
}

impl Default for TimestampConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            store: "data/library.db".to_string(),
            table: "TypedBaseItems".to_string(),
            path_column: "path".to_string(),
            created_column: "DateCreated".to_string(),
            modified_column: "DateModified".to_string(),
        }
    }
}

/// A complete migration run description.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MigrationConfig {
    /// How the server sees paths: used for file contents and the
    /// server-visible part of `auto` targets.
    pub path_rules: PathRuleSet,
    /// Maps server-visible paths to where the migrator can write them.
    #[serde(default)]
    pub fs_rules: PathRuleSet,
    pub roots: Roots,
    #[serde(default = "default_true")]
    pub container_rooted_paths: bool,
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    /// Permit a job whose target resolves onto its own source.
    #[serde(default)]
    pub allow_in_place: bool,
    #[serde(default)]
    pub id_derivation: IdDerivationConfig,
    #[serde(default)]
    pub id_source: IdSourceConfig,
    #[serde(default)]
    pub timestamps: TimestampConfig,
    /// Output of the identifier-discovery tool, used as a cross-check.
    #[serde(default)]
    pub discovered_ids: Option<PathBuf>,
    pub jobs: JobLists,
}

fn default_true() -> bool {
    true
}

impl MigrationConfig {
    /// Load and validate a configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            MigrateError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&text)
            .map_err(|e| MigrateError::config(format!("{}: {}", path.display(), e)))
    }

    /// Parse and validate a configuration document.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| MigrateError::config(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks. Nothing on disk is modified.
    pub fn validate(&self) -> Result<()> {
        self.path_rules.validate("path_rules")?;
        self.fs_rules.validate("fs_rules")?;

        if !self.roots.source.is_dir() {
            return Err(MigrateError::config(format!(
                "source root {} is not a directory",
                self.roots.source.display()
            )));
        }
        if self.roots.target.as_os_str().is_empty() {
            return Err(MigrateError::config("target root must not be empty"));
        }

        if self.id_derivation.path_id_kinds.contains(&IdKind::Bin) {
            return Err(MigrateError::config(
                "id_derivation.path_id_kinds: `bin` cannot appear in a path",
            ));
        }

        for phase in [Phase::PathMigration, Phase::IdPathMigration, Phase::IdPropagation] {
            for (index, job) in self.jobs.for_phase(phase).iter().enumerate() {
                job.validate(phase, index)?;
            }
        }

        if self.timestamps.enabled {
            let t = &self.timestamps;
            for (key, value) in [
                ("store", &t.store),
                ("table", &t.table),
                ("path_column", &t.path_column),
                ("created_column", &t.created_column),
                ("modified_column", &t.modified_column),
            ] {
                if value.trim().is_empty() {
                    return Err(MigrateError::config(format!("timestamps.{key} must not be empty")));
                }
            }
        }
        Ok(())
    }

    /// Directory holding the ledger and identifier map.
    pub fn state_dir(&self) -> PathBuf {
        if let Some(dir) = &self.state_dir {
            return dir.clone();
        }
        let target = &self.roots.target;
        let name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "target".to_string());
        target.with_file_name(format!("{}.{}", name, EngineConfig::STATE_DIR_SUFFIX))
    }

    /// Program-data directory as the new server stores it.
    pub fn new_program_data_path(&self) -> Option<String> {
        if let Some(path) = &self.id_derivation.new_program_data_path {
            return Some(path.clone());
        }
        let old = self.id_derivation.old_program_data_path.as_deref()?;
        Some(crate::paths::PathRewriter::new(&self.path_rules).rewrite_path(old).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn minimal(source: &Path, jobs: &str) -> String {
        format!(
            r#"{{
                "path_rules": {{"rules": [{{"from": "C:/ProgramData/Jellyfin/Server", "to": "/config"}}]}},
                "roots": {{"source": {}, "target": "/srv/jellyfin"}},
                "jobs": {jobs}
            }}"#,
            serde_json::to_string(&source.to_string_lossy()).unwrap()
        )
    }

    #[test]
    fn test_minimal_config_defaults() {
        let tmp = TempDir::new().unwrap();
        let config = MigrationConfig::from_json_str(&minimal(tmp.path(), "{}")).unwrap();

        assert!(config.container_rooted_paths);
        assert!(config.timestamps.enabled);
        assert_eq!(config.id_source.table, "TypedBaseItems");
        assert_eq!(config.id_derivation.path_id_kinds, vec![IdKind::AncestorStr]);
        assert_eq!(config.state_dir(), PathBuf::from("/srv/jellyfin.jfmigrate"));
        assert_eq!(config.roots.original_root(), tmp.path().to_string_lossy());
    }

    #[test]
    fn test_missing_source_root_is_config_error() {
        let err = MigrationConfig::from_json_str(&minimal(Path::new("/no/such/dir"), "{}"))
            .unwrap_err();
        assert!(matches!(err, MigrateError::Config { .. }));
    }

    #[test]
    fn test_unknown_key_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let text = minimal(tmp.path(), "{}").replace("\"jobs\"", "\"jbos\": 1, \"jobs\"");
        assert!(MigrationConfig::from_json_str(&text).is_err());
    }

    #[test]
    fn test_phase_mismatch_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let jobs = r#"{"ids": [{"source": "data/library.db", "target": "auto-existing",
                        "tables": {"TypedBaseItems": {"path_columns": ["path"]}}}]}"#;
        let err = MigrationConfig::from_json_str(&minimal(tmp.path(), jobs)).unwrap_err();
        assert!(err.to_string().contains("path_columns"));
    }

    #[test]
    fn test_new_program_data_follows_rules() {
        let tmp = TempDir::new().unwrap();
        let mut config = MigrationConfig::from_json_str(&minimal(tmp.path(), "{}")).unwrap();
        config.id_derivation.old_program_data_path =
            Some("C:\\ProgramData\\Jellyfin\\Server".to_string());
        assert_eq!(config.new_program_data_path().as_deref(), Some("/config"));
    }

    #[test]
    fn test_demo_windows_to_docker_config_parses() {
        let text = include_str!("../../../../demos/jellyfin-windows-to-docker.json");
        // The demo's roots are Windows paths; check everything but the source root.
        let config: MigrationConfig = serde_json::from_str(text).unwrap();
        for phase in [Phase::PathMigration, Phase::IdPathMigration, Phase::IdPropagation] {
            for (index, job) in config.jobs.for_phase(phase).iter().enumerate() {
                job.validate(phase, index).unwrap();
            }
        }

        assert_eq!(config.jobs.paths.len(), 10);
        assert_eq!(config.jobs.ids.len(), 2);
        assert_eq!(
            config.new_program_data_path().as_deref(),
            Some("/config/data")
        );
    }
}
