//! Table Editor: column-typed rewrites of the server's SQLite row stores.
//!
//! All edits to one store file happen inside a single `BEGIN IMMEDIATE`
//! transaction. Any error rolls the whole file back; tables or columns named
//! in the configuration but absent from the file are skipped with a warning.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OpenFlags};
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::config::{ColumnKind, ColumnSpec, EngineConfig, TableSpec};
use crate::error::{MigrateError, Result};
use crate::idmap::IdentifierMap;
use crate::ids::{IdKind, ItemId};
use crate::paths::{rewrite_jf_image, rewrite_json_text, RewriteStats, StringRewrite};
use crate::retry::{retry_blocking, RetryConfig};

/// What to substitute in the configured columns.
#[derive(Clone, Copy)]
pub enum Substitution<'a> {
    /// Rewrite path-bearing columns (`path`, `jf_image`, `json` kinds).
    Paths(&'a dyn StringRewrite),
    /// Replace identifiers in identifier columns.
    Ids(&'a IdentifierMap),
}

/// Counters for one store file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TableEditReport {
    pub rows_scanned: usize,
    pub rows_edited: usize,
    /// Individual identifier occurrences replaced.
    pub ids_replaced: usize,
    pub warnings: usize,
    pub rewrite: RewriteStats,
}

impl TableEditReport {
    pub fn merge(&mut self, other: TableEditReport) {
        self.rows_scanned += other.rows_scanned;
        self.rows_edited += other.rows_edited;
        self.ids_replaced += other.ids_replaced;
        self.warnings += other.warnings;
        self.rewrite.merge(other.rewrite);
    }

    /// Warnings from field parsing, schema gaps and unmatched paths.
    pub fn total_warnings(&self) -> usize {
        self.warnings + self.rewrite.warnings
    }
}

enum CellEdit {
    Unchanged,
    Changed(SqlValue),
    Unparseable(String),
}

/// An open row-store file.
pub struct RowStore {
    path: PathBuf,
    conn: Connection,
}

impl RowStore {
    /// Open an existing store for writing. Never creates a file.
    ///
    /// A file that cannot be opened or is not a database is
    /// [`MigrateError::UnreadableStore`].
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_WRITE)
    }

    /// Open an existing store without write access.
    pub fn open_read_only(path: &Path) -> Result<Self> {
        Self::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
    }

    fn open_with_flags(path: &Path, mode: OpenFlags) -> Result<Self> {
        let flags = mode | OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let retry = RetryConfig::new();

        let conn = retry_blocking(
            &retry,
            || {
                let conn = Connection::open_with_flags(path, flags)
                    .map_err(|e| MigrateError::unreadable_store(path, e))?;
                Self::configure_connection(&conn).map_err(|e| MigrateError::unreadable_store(path, e))?;
                Ok(conn)
            },
            MigrateError::is_retryable,
        )?;

        debug!("Opened row store {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            conn,
        })
    }

    /// Set the busy timeout and prove the file is a readable database.
    fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
        conn.busy_timeout(EngineConfig::BUSY_TIMEOUT)?;
        conn.query_row("SELECT count(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Column names of `table`, or `None` if the table doesn't exist.
    pub fn table_columns(&self, table: &str) -> Result<Option<Vec<String>>> {
        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
        let columns = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(if columns.is_empty() { None } else { Some(columns) })
    }

    /// Run `body` inside one immediate write transaction: commit on `Ok`,
    /// roll back on `Err`.
    pub fn in_transaction<T>(&mut self, body: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        let retry = RetryConfig::new();
        retry_blocking(
            &retry,
            || self.conn.execute_batch("BEGIN IMMEDIATE").map_err(MigrateError::from),
            MigrateError::is_retryable,
        )?;

        match body(self) {
            Ok(value) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = self.conn.execute_batch("ROLLBACK") {
                    warn!("Rollback of {} failed: {}", self.path.display(), rollback);
                }
                Err(e)
            }
        }
    }

    /// Apply `substitution` to every configured table and column.
    pub fn apply(
        &mut self,
        tables: &BTreeMap<String, TableSpec>,
        substitution: Substitution<'_>,
        cancel: &CancellationToken,
    ) -> Result<TableEditReport> {
        self.in_transaction(|store| {
            let mut report = TableEditReport::default();
            for (table, spec) in tables {
                cancel.check()?;
                report.merge(store.apply_table(table, spec, substitution)?);
            }
            Ok(report)
        })
    }

    fn apply_table(
        &self,
        table: &str,
        spec: &TableSpec,
        substitution: Substitution<'_>,
    ) -> Result<TableEditReport> {
        let mut report = TableEditReport::default();
        let columns = self.present_columns(table, spec, &mut report)?;
        if columns.is_empty() {
            return Ok(report);
        }

        let rows = self.read_rows(table, &columns)?;
        report.rows_scanned = rows.len();

        let assignments = columns
            .iter()
            .map(|c| format!("{} = ?", quote_ident(&c.name)))
            .collect::<Vec<_>>();

        for (rowid, values) in rows {
            let mut changed: Vec<(usize, SqlValue)> = Vec::new();
            for (index, (column, value)) in columns.iter().zip(&values).enumerate() {
                match edit_cell(column, value, substitution, &mut report) {
                    CellEdit::Unchanged => {}
                    CellEdit::Changed(new_value) => changed.push((index, new_value)),
                    CellEdit::Unparseable(reason) => {
                        let err = unparseable(table, column, rowid, reason);
                        warn!("{} in {}", err, self.path.display());
                        report.warnings += 1;
                    }
                }
            }
            if changed.is_empty() {
                continue;
            }

            let set = changed
                .iter()
                .map(|(index, _)| assignments[*index].as_str())
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!("UPDATE {} SET {} WHERE rowid = ?", quote_ident(table), set);
            let params = changed
                .into_iter()
                .map(|(_, value)| value)
                .chain(std::iter::once(SqlValue::Integer(rowid)));
            self.conn.execute(&sql, params_from_iter(params))?;
            debug!("Edited {} row {}", table, rowid);
            report.rows_edited += 1;
        }

        info!(
            "Processed {} rows in table {}, {} edited",
            report.rows_scanned, table, report.rows_edited
        );
        Ok(report)
    }

    /// Columns of `spec` that exist in `table`, warning about the others.
    fn present_columns<'s>(
        &self,
        table: &str,
        spec: &'s TableSpec,
        report: &mut TableEditReport,
    ) -> Result<Vec<&'s ColumnSpec>> {
        let Some(existing) = self.table_columns(table)? else {
            warn!(
                "{}",
                MigrateError::MissingTableOrColumn {
                    path: self.path.clone(),
                    table: table.to_string(),
                    column: None,
                }
            );
            report.warnings += 1;
            return Ok(Vec::new());
        };

        let mut present = Vec::new();
        for column in &spec.columns {
            if existing.iter().any(|c| c.eq_ignore_ascii_case(&column.name)) {
                present.push(column);
            } else {
                warn!(
                    "{}",
                    MigrateError::MissingTableOrColumn {
                        path: self.path.clone(),
                        table: table.to_string(),
                        column: Some(column.name.clone()),
                    }
                );
                report.warnings += 1;
            }
        }
        Ok(present)
    }

    fn read_rows(&self, table: &str, columns: &[&ColumnSpec]) -> Result<Vec<(i64, Vec<SqlValue>)>> {
        let select = columns
            .iter()
            .map(|c| quote_ident(&c.name))
            .collect::<Vec<_>>()
            .join(", ");
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT rowid, {} FROM {}", select, quote_ident(table)))?;
        let rows = stmt
            .query_map([], |row| {
                let rowid: i64 = row.get(0)?;
                let values = (1..=columns.len())
                    .map(|i| row.get::<_, SqlValue>(i))
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok((rowid, values))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Count occurrences of mapped (old) identifiers left in the configured
    /// identifier columns. Path columns are ignored.
    pub fn count_stale_ids(&self, tables: &BTreeMap<String, TableSpec>, map: &IdentifierMap) -> Result<usize> {
        let mut stale = 0;
        for (table, spec) in tables {
            let Some(existing) = self.table_columns(table)? else {
                continue;
            };
            let columns: Vec<&ColumnSpec> = spec
                .columns
                .iter()
                .filter(|c| c.kind.id_kind().is_some())
                .filter(|c| existing.iter().any(|e| e.eq_ignore_ascii_case(&c.name)))
                .collect();
            if columns.is_empty() {
                continue;
            }

            for (rowid, values) in self.read_rows(table, &columns)? {
                for (column, value) in columns.iter().zip(&values) {
                    let Some(kind) = column.kind.id_kind() else {
                        continue;
                    };
                    let found = count_ids(kind, value, map);
                    if found > 0 {
                        warn!(
                            "{} stale identifier(s) left in {}.{} row {} of {}",
                            found,
                            table,
                            column.name,
                            rowid,
                            self.path.display()
                        );
                        stale += found;
                    }
                }
            }
        }
        Ok(stale)
    }
}

/// The single dispatch point from column kind to rewrite.
fn edit_cell(
    column: &ColumnSpec,
    value: &SqlValue,
    substitution: Substitution<'_>,
    report: &mut TableEditReport,
) -> CellEdit {
    match column.kind {
        ColumnKind::Path => {
            let Substitution::Paths(rw) = substitution else {
                return CellEdit::Unchanged;
            };
            match text_of(value) {
                Ok(Some(text)) => rw
                    .rewrite_value(&text, &mut report.rewrite)
                    .map_or(CellEdit::Unchanged, |s| CellEdit::Changed(SqlValue::Text(s))),
                Ok(None) => CellEdit::Unchanged,
                Err(reason) => CellEdit::Unparseable(reason),
            }
        }
        ColumnKind::JfImage => {
            let Substitution::Paths(rw) = substitution else {
                return CellEdit::Unchanged;
            };
            match text_of(value) {
                Ok(Some(text)) => match rewrite_jf_image(&text, rw, &mut report.rewrite) {
                    Ok(Some(s)) => CellEdit::Changed(SqlValue::Text(s)),
                    Ok(None) => CellEdit::Unchanged,
                    Err(reason) => CellEdit::Unparseable(reason),
                },
                Ok(None) => CellEdit::Unchanged,
                Err(reason) => CellEdit::Unparseable(reason),
            }
        }
        ColumnKind::Json => {
            let Substitution::Paths(rw) = substitution else {
                return CellEdit::Unchanged;
            };
            match text_of(value) {
                Ok(Some(text)) => match rewrite_json_text(&text, rw, &mut report.rewrite) {
                    Ok(Some(s)) => CellEdit::Changed(SqlValue::Text(s)),
                    Ok(None) => CellEdit::Unchanged,
                    Err(e) => CellEdit::Unparseable(format!("invalid JSON: {e}")),
                },
                Ok(None) => CellEdit::Unchanged,
                Err(reason) => CellEdit::Unparseable(reason),
            }
        }
        ColumnKind::StrId | ColumnKind::StrDashId => {
            let Substitution::Ids(map) = substitution else {
                return CellEdit::Unchanged;
            };
            let kind = if column.kind == ColumnKind::StrId { IdKind::Str } else { IdKind::StrDash };
            match value {
                SqlValue::Text(text) if !text.is_empty() => match ItemId::decode_text(kind, text) {
                    Ok(old) => match map.get(&old) {
                        Some(new) => {
                            report.ids_replaced += 1;
                            let encoded = new.encode_text(kind);
                            let upper = text.chars().any(|c| c.is_ascii_uppercase())
                                && !text.chars().any(|c| c.is_ascii_lowercase());
                            CellEdit::Changed(SqlValue::Text(if upper {
                                encoded.to_ascii_uppercase()
                            } else {
                                encoded
                            }))
                        }
                        None => CellEdit::Unchanged,
                    },
                    Err(e) => CellEdit::Unparseable(e.to_string()),
                },
                SqlValue::Text(_) | SqlValue::Null => CellEdit::Unchanged,
                other => CellEdit::Unparseable(format!("expected text, found {}", type_name(other))),
            }
        }
        ColumnKind::AncestorStrId | ColumnKind::AncestorStrDashId => {
            let Substitution::Ids(map) = substitution else {
                return CellEdit::Unchanged;
            };
            let kind = if column.kind == ColumnKind::AncestorStrId {
                IdKind::AncestorStr
            } else {
                IdKind::AncestorStrDash
            };
            match text_of(value) {
                Ok(Some(text)) => match map.substitute_embedded(kind, &text) {
                    Some((s, n)) => {
                        report.ids_replaced += n;
                        CellEdit::Changed(SqlValue::Text(s))
                    }
                    None => CellEdit::Unchanged,
                },
                Ok(None) => CellEdit::Unchanged,
                Err(reason) => CellEdit::Unparseable(reason),
            }
        }
        ColumnKind::BinId => {
            let Substitution::Ids(map) = substitution else {
                return CellEdit::Unchanged;
            };
            match value {
                SqlValue::Blob(bytes) if !bytes.is_empty() => match ItemId::decode_bin(bytes) {
                    Ok(old) => match map.get(&old) {
                        Some(new) => {
                            report.ids_replaced += 1;
                            CellEdit::Changed(SqlValue::Blob(new.to_bin().to_vec()))
                        }
                        None => CellEdit::Unchanged,
                    },
                    Err(e) => CellEdit::Unparseable(e.to_string()),
                },
                SqlValue::Blob(_) | SqlValue::Null => CellEdit::Unchanged,
                other => CellEdit::Unparseable(format!("expected blob, found {}", type_name(other))),
            }
        }
    }
}

fn count_ids(kind: IdKind, value: &SqlValue, map: &IdentifierMap) -> usize {
    match (kind, value) {
        (IdKind::Bin, SqlValue::Blob(bytes)) => {
            ItemId::decode_bin(bytes).map_or(0, |id| usize::from(map.contains_key(&id)))
        }
        (IdKind::Str | IdKind::StrDash, SqlValue::Text(text)) => {
            ItemId::decode_text(kind, text).map_or(0, |id| usize::from(map.contains_key(&id)))
        }
        (IdKind::AncestorStr | IdKind::AncestorStrDash, SqlValue::Text(text)) => {
            map.count_embedded(kind, text)
        }
        _ => 0,
    }
}

/// Text content of a path-bearing cell. `Ok(None)` for NULL/empty.
fn text_of(value: &SqlValue) -> std::result::Result<Option<String>, String> {
    match value {
        SqlValue::Null => Ok(None),
        SqlValue::Text(text) if text.is_empty() => Ok(None),
        SqlValue::Text(text) => Ok(Some(text.clone())),
        SqlValue::Blob(bytes) => String::from_utf8(bytes.clone())
            .map(Some)
            .map_err(|_| "blob is not UTF-8 text".to_string()),
        other => Err(format!("expected text, found {}", type_name(other))),
    }
}

fn type_name(value: &SqlValue) -> &'static str {
    match value {
        SqlValue::Null => "null",
        SqlValue::Integer(_) => "integer",
        SqlValue::Real(_) => "real",
        SqlValue::Text(_) => "text",
        SqlValue::Blob(_) => "blob",
    }
}

fn unparseable(table: &str, column: &ColumnSpec, row: i64, reason: String) -> MigrateError {
    if column.kind.is_path_kind() {
        MigrateError::UnparseablePathField {
            table: table.to_string(),
            column: column.name.clone(),
            row,
            reason,
        }
    } else {
        MigrateError::UnparseableIdentifierField {
            table: table.to_string(),
            column: column.name.clone(),
            row,
            reason,
        }
    }
}

/// Quote an SQL identifier.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
