//! Building the identifier map from the source library store.

use std::collections::HashMap;
use std::path::Path;

use rusqlite::types::Value as SqlValue;
use tracing::{debug, error, info, warn};

use crate::config::{normalize_separators, MigrationConfig};
use crate::error::{MigrateError, Result};
use crate::idmap::IdentifierMap;
use crate::ids::{derive_item_id, DerivationContext, ItemId};
use crate::paths::PathRewriter;
use crate::store::{quote_ident, RowStore};

/// Result of scanning the source store.
#[derive(Debug, Default)]
pub struct IdMapBuild {
    pub map: IdentifierMap,
    /// Normalized new server path → new identifier, for cross-checks.
    pub expected: HashMap<String, ItemId>,
    pub items_scanned: usize,
    pub warnings: usize,
    /// Collisions that were refused.
    pub collisions: usize,
}

/// Recompute identifiers for every item of the source store whose path the
/// path rules change.
///
/// The stored identifier must equal the one derived from the item's old path
/// under the old program-data directory; items that don't (ids not derived
/// from paths) are skipped with a warning.
pub fn build_identifier_map(config: &MigrationConfig, store_path: &Path) -> Result<IdMapBuild> {
    let store = RowStore::open_read_only(store_path)?;
    let source = &config.id_source;

    let Some(existing) = store.table_columns(&source.table)? else {
        return Err(MigrateError::MissingTableOrColumn {
            path: store_path.to_path_buf(),
            table: source.table.clone(),
            column: None,
        });
    };
    for column in [&source.id_column, &source.type_column, &source.path_column] {
        if !existing.iter().any(|c| c.eq_ignore_ascii_case(column)) {
            return Err(MigrateError::MissingTableOrColumn {
                path: store_path.to_path_buf(),
                table: source.table.clone(),
                column: Some(column.clone()),
            });
        }
    }

    let sql = format!(
        "SELECT rowid, {}, {}, {} FROM {} WHERE {} IS NOT NULL",
        quote_ident(&source.id_column),
        quote_ident(&source.type_column),
        quote_ident(&source.path_column),
        quote_ident(&source.table),
        quote_ident(&source.path_column),
    );
    let rows = {
        let mut stmt = store.connection().prepare(&sql)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, SqlValue>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows
    };

    let rules = PathRewriter::new(&config.path_rules);
    let derivation = &config.id_derivation;
    let new_program_data = config.new_program_data_path();
    let old_ctx = DerivationContext {
        program_data_path: derivation.old_program_data_path.as_deref(),
        case_sensitive: derivation.case_sensitive,
    };
    let new_ctx = DerivationContext {
        program_data_path: new_program_data.as_deref(),
        case_sensitive: derivation.case_sensitive,
    };

    let mut build = IdMapBuild::default();
    for (rowid, raw_id, item_type, old_path) in rows {
        build.items_scanned += 1;
        let Some(item_type) = item_type.filter(|t| !t.is_empty()) else {
            continue;
        };
        let Some(new_path) = rules.try_rewrite(&old_path).filter(|p| *p != old_path) else {
            continue;
        };

        let stored = match stored_id(&raw_id) {
            Ok(Some(id)) => id,
            Ok(None) => continue,
            Err(reason) => {
                warn!(
                    "{}",
                    MigrateError::UnparseableIdentifierField {
                        table: source.table.clone(),
                        column: source.id_column.clone(),
                        row: rowid,
                        reason,
                    }
                );
                build.warnings += 1;
                continue;
            }
        };

        let derived_old = derive_item_id(&item_type, &old_path, old_ctx);
        if derived_old != stored {
            warn!(
                "Stored id {} of {} ({}) is not derived from its path, leaving it unmapped",
                stored, old_path, item_type
            );
            build.warnings += 1;
            continue;
        }

        let new_id = derive_item_id(&item_type, &new_path, new_ctx);
        match build.map.insert(stored, new_id) {
            Ok(true) => debug!("{} -> {} for {}", stored, new_id, new_path),
            Ok(false) => {}
            Err(e) => {
                error!("{} ({} -> {})", e, old_path, new_path);
                build.collisions += 1;
                continue;
            }
        }
        build
            .expected
            .insert(normalize_separators(&new_path), new_id);
    }

    info!(
        "Scanned {} items in {}, {} identifiers change",
        build.items_scanned,
        store_path.display(),
        build.map.len()
    );
    Ok(build)
}

/// Stored ids are 16-byte blobs (older schemas) or .NET-formatted text.
fn stored_id(raw: &SqlValue) -> std::result::Result<Option<ItemId>, String> {
    match raw {
        SqlValue::Null => Ok(None),
        SqlValue::Blob(bytes) => ItemId::decode_bin(bytes).map(Some).map_err(|e| e.to_string()),
        SqlValue::Text(text) => text.parse::<ItemId>().map(Some).map_err(|e| e.to_string()),
        other => Err(format!("unexpected value {other:?}")),
    }
}
