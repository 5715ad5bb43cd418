//! Declarative job lists and per-table column specs.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::rules::PathRuleSet;
use crate::error::{MigrateError, Result};
use crate::ids::IdKind;

/// The four strictly ordered pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    PathMigration,
    IdPathMigration,
    IdPropagation,
    TimestampSync,
}

impl Phase {
    pub fn number(self) -> u8 {
        match self {
            Phase::PathMigration => 1,
            Phase::IdPathMigration => 2,
            Phase::IdPropagation => 3,
            Phase::TimestampSync => 4,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::PathMigration => "path migration",
            Phase::IdPathMigration => "path-derived identifier migration",
            Phase::IdPropagation => "identifier propagation",
            Phase::TimestampSync => "timestamp reconciliation",
        };
        write!(f, "phase {} ({})", self.number(), name)
    }
}

/// Where a job's output lands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TargetPolicy {
    /// Derived from the source path through the path and filesystem rules;
    /// the file is copied there.
    Auto,
    /// Same location as `Auto`, but the file must already exist (produced by
    /// phase 1); it is edited in place and never recopied.
    AutoExisting,
    /// A literal target path.
    Explicit(PathBuf),
}

impl From<String> for TargetPolicy {
    fn from(value: String) -> Self {
        match value.as_str() {
            "auto" => TargetPolicy::Auto,
            "auto-existing" => TargetPolicy::AutoExisting,
            _ => TargetPolicy::Explicit(PathBuf::from(value)),
        }
    }
}

impl From<TargetPolicy> for String {
    fn from(value: TargetPolicy) -> Self {
        match value {
            TargetPolicy::Auto => "auto".to_string(),
            TargetPolicy::AutoExisting => "auto-existing".to_string(),
            TargetPolicy::Explicit(path) => path.to_string_lossy().into_owned(),
        }
    }
}

/// How a configured column's content is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnKind {
    /// A plain path string.
    Path,
    /// `path*ticks*type*width*height[*hash]` entries joined by `|`.
    JfImage,
    /// A JSON document with path strings anywhere inside.
    Json,
    StrId,
    StrDashId,
    AncestorStrId,
    AncestorStrDashId,
    BinId,
}

impl ColumnKind {
    pub fn config_key(self) -> &'static str {
        match self {
            ColumnKind::Path => "path_columns",
            ColumnKind::JfImage => "jf_image_columns",
            ColumnKind::Json => "json_columns",
            ColumnKind::StrId => "str",
            ColumnKind::StrDashId => "str-dash",
            ColumnKind::AncestorStrId => "ancestor-str",
            ColumnKind::AncestorStrDashId => "ancestor-str-dash",
            ColumnKind::BinId => "bin",
        }
    }

    pub fn is_path_kind(self) -> bool {
        matches!(self, ColumnKind::Path | ColumnKind::JfImage | ColumnKind::Json)
    }

    /// The identifier encoding for identifier kinds.
    pub fn id_kind(self) -> Option<IdKind> {
        match self {
            ColumnKind::StrId => Some(IdKind::Str),
            ColumnKind::StrDashId => Some(IdKind::StrDash),
            ColumnKind::AncestorStrId => Some(IdKind::AncestorStr),
            ColumnKind::AncestorStrDashId => Some(IdKind::AncestorStrDash),
            ColumnKind::BinId => Some(IdKind::Bin),
            ColumnKind::Path | ColumnKind::JfImage | ColumnKind::Json => None,
        }
    }
}

/// A column to rewrite and how to read it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: ColumnKind,
}

/// Columns to rewrite within one table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawTableSpec")]
pub struct TableSpec {
    pub columns: Vec<ColumnSpec>,
}

impl TableSpec {
    pub fn new(columns: impl IntoIterator<Item = (impl Into<String>, ColumnKind)>) -> Self {
        Self {
            columns: columns
                .into_iter()
                .map(|(name, kind)| ColumnSpec {
                    name: name.into(),
                    kind,
                })
                .collect(),
        }
    }
}

/// On-disk shape of a table spec: one list of column names per kind.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawTableSpec {
    /// Accepted for compatibility with older job lists; rows are addressed by rowid.
    #[serde(default, rename = "id_column")]
    _id_column: Option<String>,
    #[serde(default)]
    path_columns: Vec<String>,
    #[serde(default)]
    jf_image_columns: Vec<String>,
    #[serde(default)]
    json_columns: Vec<String>,
    #[serde(default, rename = "str")]
    str_ids: Vec<String>,
    #[serde(default, rename = "str-dash")]
    str_dash_ids: Vec<String>,
    #[serde(default, rename = "ancestor-str")]
    ancestor_str_ids: Vec<String>,
    #[serde(default, rename = "ancestor-str-dash")]
    ancestor_str_dash_ids: Vec<String>,
    #[serde(default, rename = "bin")]
    bin_ids: Vec<String>,
}

impl TryFrom<RawTableSpec> for TableSpec {
    type Error = String;

    fn try_from(raw: RawTableSpec) -> std::result::Result<Self, Self::Error> {
        let groups = [
            (ColumnKind::Path, raw.path_columns),
            (ColumnKind::JfImage, raw.jf_image_columns),
            (ColumnKind::Json, raw.json_columns),
            (ColumnKind::StrId, raw.str_ids),
            (ColumnKind::StrDashId, raw.str_dash_ids),
            (ColumnKind::AncestorStrId, raw.ancestor_str_ids),
            (ColumnKind::AncestorStrDashId, raw.ancestor_str_dash_ids),
            (ColumnKind::BinId, raw.bin_ids),
        ];

        let mut columns: Vec<ColumnSpec> = Vec::new();
        for (kind, names) in groups {
            for name in names {
                if name.trim().is_empty() {
                    return Err(format!("empty column name in `{}`", kind.config_key()));
                }
                if let Some(existing) = columns.iter().find(|c| c.name == name) {
                    return Err(format!(
                        "column `{}` listed as both `{}` and `{}`",
                        name,
                        existing.kind.config_key(),
                        kind.config_key()
                    ));
                }
                columns.push(ColumnSpec { name, kind });
            }
        }
        Ok(TableSpec { columns })
    }
}

/// One declarative unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Job {
    /// Glob relative to the source root (`*`, `?`, `**`).
    pub source: String,
    pub target: TargetPolicy,
    /// Overrides the global path rules for this job.
    #[serde(default)]
    pub replacements: Option<PathRuleSet>,
    #[serde(default)]
    pub tables: BTreeMap<String, TableSpec>,
    /// Copy without rewriting anything.
    #[serde(default)]
    pub copy_only: bool,
    /// Suppress per-file success lines (warnings and errors are still logged).
    #[serde(default)]
    pub no_log: bool,
}

impl Job {
    pub fn new(source: impl Into<String>, target: TargetPolicy) -> Self {
        Self {
            source: source.into(),
            target,
            replacements: None,
            tables: BTreeMap::new(),
            copy_only: false,
            no_log: false,
        }
    }

    pub fn with_table(mut self, name: impl Into<String>, spec: TableSpec) -> Self {
        self.tables.insert(name.into(), spec);
        self
    }

    pub fn copy_only(mut self) -> Self {
        self.copy_only = true;
        self
    }

    pub fn quiet(mut self) -> Self {
        self.no_log = true;
        self
    }

    pub(crate) fn validate(&self, phase: Phase, index: usize) -> Result<()> {
        let here = || format!("{} job #{} ({})", phase, index, self.source);

        if self.source.trim().is_empty() {
            return Err(MigrateError::config(format!("{}: empty source pattern", here())));
        }
        if self.source.split(['/', '\\']).any(|c| c == "..") {
            return Err(MigrateError::config(format!(
                "{}: source pattern must stay inside the source root",
                here()
            )));
        }

        match (phase, &self.target) {
            (Phase::PathMigration, TargetPolicy::AutoExisting) => {
                return Err(MigrateError::config(format!(
                    "{}: `auto-existing` only applies after files were copied; use `auto`",
                    here()
                )));
            }
            (Phase::IdPathMigration | Phase::IdPropagation, TargetPolicy::Auto) => {
                return Err(MigrateError::config(format!(
                    "{}: identifier jobs work on already copied files; use `auto-existing`",
                    here()
                )));
            }
            _ => {}
        }

        if let Some(rules) = &self.replacements {
            rules.validate(&format!("{} replacements", here()))?;
        }

        for (table, spec) in &self.tables {
            for column in &spec.columns {
                let allowed = match phase {
                    Phase::PathMigration | Phase::IdPathMigration => column.kind.is_path_kind(),
                    Phase::IdPropagation => !column.kind.is_path_kind(),
                    Phase::TimestampSync => false,
                };
                if !allowed {
                    return Err(MigrateError::config(format!(
                        "{}: column {}.{} uses `{}`, which {} does not accept",
                        here(),
                        table,
                        column.name,
                        column.kind.config_key(),
                        phase
                    )));
                }
            }
        }

        if phase == Phase::IdPropagation && self.tables.is_empty() {
            return Err(MigrateError::config(format!(
                "{}: identifier propagation jobs need at least one table",
                here()
            )));
        }
        Ok(())
    }
}

/// The three job lists, one per file-processing phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobLists {
    #[serde(default)]
    pub paths: Vec<Job>,
    #[serde(default)]
    pub id_paths: Vec<Job>,
    #[serde(default)]
    pub ids: Vec<Job>,
}

impl JobLists {
    pub fn for_phase(&self, phase: Phase) -> &[Job] {
        match phase {
            Phase::PathMigration => &self.paths,
            Phase::IdPathMigration => &self.id_paths,
            Phase::IdPropagation => &self.ids,
            Phase::TimestampSync => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_policy_from_string() {
        assert_eq!(TargetPolicy::from("auto".to_string()), TargetPolicy::Auto);
        assert_eq!(
            TargetPolicy::from("auto-existing".to_string()),
            TargetPolicy::AutoExisting
        );
        assert_eq!(
            TargetPolicy::from("/srv/jellyfin/library.db".to_string()),
            TargetPolicy::Explicit(PathBuf::from("/srv/jellyfin/library.db"))
        );
    }

    #[test]
    fn test_table_spec_from_original_layout() {
        let spec: TableSpec = serde_json::from_str(
            r#"{
                "id_column": "guid",
                "path_columns": ["path"],
                "jf_image_columns": ["Images"],
                "json_columns": ["data"]
            }"#,
        )
        .unwrap();
        let kinds: Vec<_> = spec.columns.iter().map(|c| (c.name.as_str(), c.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                ("path", ColumnKind::Path),
                ("Images", ColumnKind::JfImage),
                ("data", ColumnKind::Json),
            ]
        );
    }

    #[test]
    fn test_table_spec_rejects_double_listing() {
        let err = serde_json::from_str::<TableSpec>(r#"{"str": ["ItemId"], "bin": ["ItemId"]}"#)
            .unwrap_err();
        assert!(err.to_string().contains("listed as both"));
    }

    #[test]
    fn test_phase_kind_validation() {
        let job = Job::new("data/library.db", TargetPolicy::AutoExisting)
            .with_table("TypedBaseItems", TableSpec::new([("path", ColumnKind::Path)]));
        assert!(job.validate(Phase::IdPathMigration, 0).is_ok());
        assert!(job.validate(Phase::IdPropagation, 0).is_err());

        let job = Job::new("data/library.db", TargetPolicy::AutoExisting)
            .with_table("AncestorIds", TableSpec::new([("ItemId", ColumnKind::BinId)]));
        assert!(job.validate(Phase::IdPropagation, 0).is_ok());
        assert!(job.validate(Phase::PathMigration, 0).is_err());
    }

    #[test]
    fn test_target_policy_must_match_phase() {
        let auto = Job::new("config/*.xml", TargetPolicy::Auto);
        assert!(auto.validate(Phase::PathMigration, 0).is_ok());
        assert!(auto.validate(Phase::IdPathMigration, 0).is_err());

        let existing = Job::new("config/*.xml", TargetPolicy::AutoExisting);
        assert!(existing.validate(Phase::PathMigration, 0).is_err());
    }

    #[test]
    fn test_source_may_not_escape_root() {
        let job = Job::new("../elsewhere/*.db", TargetPolicy::Auto);
        assert!(job.validate(Phase::PathMigration, 0).is_err());
    }
}
