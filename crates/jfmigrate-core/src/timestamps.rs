//! Timestamp reconciliation (phase 4).
//!
//! Copying resets file times, so the creation/modification dates the server
//! stored for each item are rewritten from the migrated files' actual times.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::params;
use tracing::{debug, info, warn};

use crate::cancel::CancellationToken;
use crate::config::TimestampConfig;
use crate::error::{MigrateError, Result};
use crate::files::TargetResolver;
use crate::state::Ledger;
use crate::store::{quote_ident, RowStore};

/// Ticks of 100 ns per second: the server's date resolution.
const TICKS_PER_SECOND: u32 = 10_000_000;

/// Format a timestamp the way the server stores dates:
/// `yyyy-MM-dd HH:mm:ss[.fffffff]Z`, UTC, trailing fractional zeros trimmed.
pub fn format_server_time(time: DateTime<Utc>) -> String {
    let base = time.format("%Y-%m-%d %H:%M:%S");
    let ticks = (time.timestamp_subsec_nanos() / 100).min(TICKS_PER_SECOND - 1);
    let fraction = format!("{ticks:07}");
    let fraction = fraction.trim_end_matches('0');
    if fraction.is_empty() {
        format!("{base}Z")
    } else {
        format!("{base}.{fraction}Z")
    }
}

/// Parse a stored server date. Accepts an optional fraction and `Z`.
pub fn parse_server_time(text: &str) -> Option<DateTime<Utc>> {
    let trimmed = text.trim().trim_end_matches('Z');
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Counters for one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimestampReport {
    pub rows_scanned: usize,
    pub rows_updated: usize,
    /// Rows whose path has no known location on disk.
    pub rows_unresolved: usize,
    pub warnings: usize,
}

/// Writes file times back into the configured date columns.
pub struct TimestampReconciler<'a> {
    config: &'a TimestampConfig,
    resolver: &'a TargetResolver<'a>,
    ledger: &'a Ledger,
}

impl<'a> TimestampReconciler<'a> {
    pub fn new(config: &'a TimestampConfig, resolver: &'a TargetResolver<'a>, ledger: &'a Ledger) -> Self {
        Self {
            config,
            resolver,
            ledger,
        }
    }

    /// Where the file the server knows as `server_path` is on disk: the
    /// ledger first, then the filesystem rules.
    pub fn locate(&self, server_path: &str) -> Option<PathBuf> {
        self.ledger
            .destination_for(server_path)
            .map(Path::to_path_buf)
            .or_else(|| self.resolver.try_to_disk(server_path))
    }

    /// Update every row of the configured table in `store_path`, in one
    /// transaction. Per-row failures are warnings.
    pub fn reconcile(&self, store_path: &Path, cancel: &CancellationToken) -> Result<TimestampReport> {
        let mut store = RowStore::open(store_path)?;
        let mut report = TimestampReport::default();

        let t = self.config;
        let Some(existing) = store.table_columns(&t.table)? else {
            warn!(
                "{}",
                MigrateError::MissingTableOrColumn {
                    path: store_path.to_path_buf(),
                    table: t.table.clone(),
                    column: None,
                }
            );
            report.warnings += 1;
            return Ok(report);
        };
        for column in [&t.path_column, &t.created_column, &t.modified_column] {
            if !existing.iter().any(|c| c.eq_ignore_ascii_case(column)) {
                warn!(
                    "{}",
                    MigrateError::MissingTableOrColumn {
                        path: store_path.to_path_buf(),
                        table: t.table.clone(),
                        column: Some(column.clone()),
                    }
                );
                report.warnings += 1;
                return Ok(report);
            }
        }

        let select = format!(
            "SELECT rowid, {} FROM {} WHERE {} IS NOT NULL AND {} <> ''",
            quote_ident(&t.path_column),
            quote_ident(&t.table),
            quote_ident(&t.path_column),
            quote_ident(&t.path_column),
        );
        let update = format!(
            "UPDATE {} SET {} = ?1, {} = ?2 WHERE rowid = ?3",
            quote_ident(&t.table),
            quote_ident(&t.created_column),
            quote_ident(&t.modified_column),
        );

        store.in_transaction(|store| {
            let conn = store.connection();
            let rows = {
                let mut stmt = conn.prepare(&select)?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                rows
            };
            report.rows_scanned = rows.len();

            for (rowid, server_path) in rows {
                cancel.check()?;
                let Some(on_disk) = self.locate(&server_path) else {
                    debug!("No known location for {}, timestamps left as stored", server_path);
                    report.rows_unresolved += 1;
                    continue;
                };
                match file_times(&on_disk) {
                    Ok((created, modified)) => {
                        conn.execute(
                            &update,
                            params![format_server_time(created), format_server_time(modified), rowid],
                        )?;
                        report.rows_updated += 1;
                    }
                    Err(e) => {
                        let err = MigrateError::TimestampSync {
                            path: server_path.clone(),
                            message: format!("{}: {}", on_disk.display(), e),
                        };
                        warn!("{}", err);
                        report.warnings += 1;
                    }
                }
            }
            Ok(())
        })?;

        info!(
            "Timestamps: {} of {} rows updated in {} ({} without a known location)",
            report.rows_updated,
            report.rows_scanned,
            store_path.display(),
            report.rows_unresolved
        );
        Ok(report)
    }
}

/// Creation and modification time. Platforms without a birth time report the
/// modification time for both.
fn file_times(path: &Path) -> std::io::Result<(DateTime<Utc>, DateTime<Utc>)> {
    let meta = fs::metadata(path)?;
    let modified: SystemTime = meta.modified()?;
    let created = meta.created().unwrap_or(modified);
    Ok((created.into(), modified.into()))
}
