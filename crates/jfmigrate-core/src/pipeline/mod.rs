//! Job runner: drives the four migration phases in order.
//!
//! ```text
//! validate → identifier map (read-only, from the source store)
//!   → phase 1 path migration → phase 2 identifier paths
//!   → phase 3 identifier propagation (+ consistency rescan)
//!   → phase 4 timestamps → summary
//! ```
//!
//! Every file outcome is appended to the ledger before the next file starts.
//! Files already finished by a phase (per the ledger) are skipped, so an
//! interrupted run can simply be started again.

mod idsource;

pub use idsource::{build_identifier_map, IdMapBuild};

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, error, info, warn};

use crate::cancel::CancellationToken;
use crate::config::{EngineConfig, Job, MigrationConfig, Phase, TargetPolicy};
use crate::error::{MigrateError, Result, Severity};
use crate::files::{
    copy_file, glob_files, move_file, prune_empty_dirs, rewrite_text_file, ContentFormat,
    ResolvedTarget, TargetResolver,
};
use crate::idmap::{cross_check, load_discovered_ids, IdPathRewriter, IdentifierMap};
use crate::ids::ItemId;
use crate::paths::StringRewrite;
use crate::state::{Ledger, LedgerEntry, Outcome};
use crate::store::{RowStore, Substitution};
use crate::summary::RunSummary;
use crate::timestamps::TimestampReconciler;

/// Runs a complete migration described by a [`MigrationConfig`].
pub struct Migrator<'c> {
    config: &'c MigrationConfig,
    cancel: CancellationToken,
    state_dir: PathBuf,
}

impl<'c> Migrator<'c> {
    pub fn new(config: &'c MigrationConfig, cancel: CancellationToken) -> Self {
        Self {
            config,
            cancel,
            state_dir: config.state_dir(),
        }
    }

    /// Keep the ledger and identifier map somewhere else.
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// Run every phase.
    ///
    /// Configuration problems are returned as errors before anything is
    /// written. Per-file failures are logged and counted in the summary;
    /// cancellation ends the run early with `cancelled` set.
    pub fn run(&self) -> Result<RunSummary> {
        let config = self.config;
        config.validate()?;

        let mut summary = RunSummary::default();
        let jobs = &config.jobs;
        let needs_map = !jobs.id_paths.is_empty() || !jobs.ids.is_empty();

        let (built, expected) = if needs_map {
            self.build_map(&mut summary)?
        } else {
            (IdentifierMap::new(), HashMap::new())
        };

        let map_path = self.state_dir.join(EngineConfig::ID_MAP_FILE_NAME);
        let saved = if needs_map { IdentifierMap::load(&map_path)? } else { None };
        let map = match saved {
            Some(saved) => {
                if saved != built {
                    warn!(
                        "Saved identifier map {} differs from the recomputed one ({} vs {} entries), continuing with the saved map",
                        map_path.display(),
                        saved.len(),
                        built.len()
                    );
                    summary.warnings += 1;
                }
                saved
            }
            None => built,
        };

        if !jobs.ids.is_empty() && map.is_empty() {
            return Err(MigrateError::config(
                "identifier propagation jobs are configured but no item identifier changes; \
                 check path_rules, id_derivation and id_source",
            ));
        }

        let ledger = Ledger::open(&self.state_dir.join(EngineConfig::LEDGER_FILE_NAME))?;
        if needs_map && !map_path.exists() {
            map.save(&map_path)?;
        }
        summary.items_remapped = map.len();

        let mut run = Run {
            config,
            cancel: &self.cancel,
            ledger,
            map,
            expected,
            summary,
        };

        match run.execute() {
            Ok(()) => {}
            Err(MigrateError::Cancelled) => {
                warn!("Run cancelled; rerun to continue where it stopped");
                run.summary.cancelled = true;
            }
            Err(e) => return Err(e),
        }

        info!(
            "Migration finished: {} files copied, {} rows edited, {} identifiers replaced, {} warnings, {} fatal failures",
            run.summary.files_copied,
            run.summary.rows_edited,
            run.summary.ids_remapped,
            run.summary.warnings,
            run.summary.fatal_failures
        );
        Ok(run.summary)
    }

    fn build_map(&self, summary: &mut RunSummary) -> Result<(IdentifierMap, HashMap<String, ItemId>)> {
        let config = self.config;
        let store = config.roots.source.join(&config.id_source.store);
        match build_identifier_map(config, &store) {
            Ok(build) => {
                summary.warnings += build.warnings;
                summary.fatal_failures += build.collisions;
                Ok((build.map, build.expected))
            }
            Err(e) if e.severity() == Severity::RunFatal => Err(e),
            Err(e) if !config.jobs.ids.is_empty() => Err(MigrateError::config(format!(
                "cannot build the identifier map from {}: {}",
                store.display(),
                e
            ))),
            Err(e) => {
                warn!("No identifier map: {}", e);
                summary.warnings += 1;
                Ok((IdentifierMap::new(), HashMap::new()))
            }
        }
    }
}

/// Text or row-store edits made to one file.
#[derive(Debug, Default, Clone, Copy)]
struct ContentChange {
    rows_edited: usize,
    values_modified: usize,
    warnings: usize,
}

/// Rewrite the path-bearing content of `path` according to its format.
fn rewrite_content(
    job: &Job,
    path: &Path,
    rewrite: &dyn StringRewrite,
    cancel: &CancellationToken,
) -> Result<ContentChange> {
    let mut change = ContentChange::default();
    match ContentFormat::of(path) {
        ContentFormat::RowStore => {
            if job.tables.is_empty() {
                debug!("No tables configured for {}, content untouched", path.display());
                return Ok(change);
            }
            let mut store = RowStore::open(path)?;
            let report = store.apply(&job.tables, Substitution::Paths(rewrite), cancel)?;
            change.rows_edited = report.rows_edited;
            change.values_modified = report.rewrite.modified;
            change.warnings = report.total_warnings();
        }
        ContentFormat::Opaque => {}
        format => {
            let result = rewrite_text_file(path, format, rewrite)?;
            change.values_modified = result.stats.modified;
            change.warnings = result.stats.warnings + usize::from(result.unparseable);
        }
    }
    Ok(change)
}

fn is_same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Mutable state of one run.
struct Run<'c> {
    config: &'c MigrationConfig,
    cancel: &'c CancellationToken,
    ledger: Ledger,
    map: IdentifierMap,
    expected: HashMap<String, ItemId>,
    summary: RunSummary,
}

impl<'c> Run<'c> {
    fn execute(&mut self) -> Result<()> {
        self.run_phase(Phase::PathMigration)?;

        self.run_phase(Phase::IdPathMigration)?;
        if !self.config.jobs.id_paths.is_empty() {
            self.discovery_cross_check();
        }

        let propagated = self.run_phase(Phase::IdPropagation)?;
        if !propagated.is_empty() {
            self.consistency_check(&propagated);
        }

        self.reconcile_timestamps()
    }

    /// Run every job of `phase`. Returns the (target, job index) pairs the
    /// phase covered, processed now or in an earlier run.
    fn run_phase(&mut self, phase: Phase) -> Result<Vec<(PathBuf, usize)>> {
        let config = self.config;
        let jobs = config.jobs.for_phase(phase);
        let mut covered = Vec::new();
        if jobs.is_empty() {
            debug!("No jobs for {}", phase);
            return Ok(covered);
        }
        info!("Starting {} ({} jobs)", phase, jobs.len());

        let mut claimed: HashSet<PathBuf> = HashSet::new();
        for (index, job) in jobs.iter().enumerate() {
            self.cancel.check()?;
            let resolver = TargetResolver::new(config, job.replacements.as_ref());
            let files = glob_files(&config.roots.source, &job.source)?;
            if files.is_empty() {
                debug!("{} job #{} ({}) matched no files", phase, index, job.source);
                continue;
            }

            for source in files {
                self.cancel.check()?;
                if !claimed.insert(source.clone()) {
                    continue;
                }
                let resolved = self.locate(phase, job, &resolver, &source);
                covered.push((resolved.target.clone(), index));
                if self.ledger.is_completed(phase, &source) {
                    debug!("{} already done in {}, skipping", source.display(), phase);
                    continue;
                }

                let result = match phase {
                    Phase::PathMigration => self.migrate_file(job, &resolver, &source, resolved.clone()),
                    Phase::IdPathMigration => self.remap_file(job, resolved.clone()),
                    Phase::IdPropagation => self.propagate_file(job, resolved.clone()),
                    Phase::TimestampSync => Ok((Outcome::Skipped, resolved.clone())),
                };

                let entry = match result {
                    Ok((outcome, done)) => {
                        if outcome.is_success() && !job.no_log {
                            info!("{} -> {} ({:?})", source.display(), done.target.display(), outcome);
                        }
                        if let Some((last, _)) = covered.last_mut() {
                            last.clone_from(&done.target);
                        }
                        LedgerEntry::new(phase, index, &source, done.target, done.server_path, outcome)
                    }
                    Err(e) => match e.severity() {
                        Severity::RunFatal => return Err(e),
                        Severity::Warning => {
                            warn!("{}: {}", source.display(), e);
                            self.summary.warnings += 1;
                            LedgerEntry::new(
                                phase,
                                index,
                                &source,
                                resolved.target,
                                resolved.server_path,
                                Outcome::Skipped,
                            )
                            .with_detail(e.to_string())
                        }
                        Severity::JobFatal => {
                            error!("{} job #{} failed on {}: {}", phase, index, source.display(), e);
                            self.summary.fatal_failures += 1;
                            LedgerEntry::new(
                                phase,
                                index,
                                &source,
                                resolved.target,
                                resolved.server_path,
                                Outcome::Failed,
                            )
                            .with_detail(e.to_string())
                        }
                    },
                };
                self.ledger.record(entry)?;
            }
        }

        info!("Finished {}", phase);
        Ok(covered)
    }

    /// Where `source` is (phases 2 and 3) or goes (phase 1).
    fn locate(&self, phase: Phase, job: &Job, resolver: &TargetResolver<'_>, source: &Path) -> ResolvedTarget {
        let resolved = resolver.resolve(source, &job.target);
        if phase == Phase::PathMigration || matches!(job.target, TargetPolicy::Explicit(_)) {
            return resolved;
        }
        match self.ledger.target_of(source) {
            Some(target) => {
                // Phase 2 may already have moved the file and renamed its path.
                let moved = target != resolved.target.as_path();
                let kinds = &self.config.id_derivation.path_id_kinds;
                let server_path = if moved {
                    IdPathRewriter::new(&self.map, kinds)
                        .rewrite(&resolved.server_path)
                        .unwrap_or(resolved.server_path)
                } else {
                    resolved.server_path
                };
                ResolvedTarget {
                    server_path,
                    target: target.to_path_buf(),
                }
            }
            None => resolved,
        }
    }

    /// Phase 1: copy, then rewrite paths in the copy.
    fn migrate_file(
        &mut self,
        job: &Job,
        resolver: &TargetResolver<'_>,
        source: &Path,
        resolved: ResolvedTarget,
    ) -> Result<(Outcome, ResolvedTarget)> {
        let target = &resolved.target;
        let in_place = is_same_file(source, target);
        if in_place && !self.config.allow_in_place {
            warn!(
                "Target of {} is the file itself, skipped (set allow_in_place to edit it)",
                source.display()
            );
            self.summary.warnings += 1;
            return Ok((Outcome::Skipped, resolved));
        }

        if !matches!(job.target, TargetPolicy::Explicit(_)) && !resolver.rules_cover(source) {
            warn!(
                "No path rule covers {}, placed at {}",
                resolver.original_path(source),
                target.display()
            );
            self.summary.warnings += 1;
        }

        if !in_place {
            copy_file(source, target)?;
            self.summary.files_copied += 1;
        }
        if job.copy_only {
            return Ok((if in_place { Outcome::Edited } else { Outcome::Copied }, resolved));
        }

        match rewrite_content(job, target, resolver.path_rules(), self.cancel) {
            Ok(change) => {
                self.summary.rows_edited += change.rows_edited;
                self.summary.warnings += change.warnings;
                Ok((if in_place { Outcome::Edited } else { Outcome::Migrated }, resolved))
            }
            Err(e) => {
                if !in_place {
                    if let Err(remove) = fs::remove_file(target) {
                        debug!("Could not remove partial copy {}: {}", target.display(), remove);
                    }
                }
                Err(e)
            }
        }
    }

    /// Phase 2: substitute identifiers in content and in the file's own path.
    fn remap_file(&mut self, job: &Job, resolved: ResolvedTarget) -> Result<(Outcome, ResolvedTarget)> {
        let target = &resolved.target;
        if !target.is_file() {
            warn!(
                "{} does not exist; identifier jobs only edit files a previous phase produced",
                target.display()
            );
            self.summary.warnings += 1;
            return Ok((Outcome::Skipped, resolved));
        }

        let kinds = &self.config.id_derivation.path_id_kinds;
        let rewriter = IdPathRewriter::new(&self.map, kinds);
        if !job.copy_only {
            let change = rewrite_content(job, target, &rewriter, self.cancel)?;
            self.summary.rows_edited += change.rows_edited;
            self.summary.ids_remapped += change.values_modified;
            self.summary.warnings += change.warnings;
        }

        let on_disk = target.to_string_lossy();
        let Some((moved, count)) = self.map.substitute_in_path(kinds, &on_disk) else {
            return Ok((Outcome::Edited, resolved));
        };
        let moved = PathBuf::from(moved);
        if !move_file(target, &moved)? {
            warn!(
                "Cannot move {} to {}: destination exists, left in place",
                target.display(),
                moved.display()
            );
            self.summary.warnings += 1;
            return Ok((Outcome::Edited, resolved));
        }
        debug!("Moved {} to {}", target.display(), moved.display());
        self.summary.ids_remapped += count;
        if let Some(parent) = target.parent() {
            prune_empty_dirs(parent, &self.config.roots.target);
        }

        let server_path = rewriter
            .rewrite(&resolved.server_path)
            .unwrap_or(resolved.server_path);
        Ok((Outcome::Edited, ResolvedTarget { server_path, target: moved }))
    }

    /// Phase 3: replace every mapped identifier in the configured columns.
    fn propagate_file(&mut self, job: &Job, resolved: ResolvedTarget) -> Result<(Outcome, ResolvedTarget)> {
        let target = &resolved.target;
        if !target.is_file() {
            warn!("{} does not exist, nothing to propagate", target.display());
            self.summary.warnings += 1;
            return Ok((Outcome::Skipped, resolved));
        }
        if ContentFormat::of(target) != ContentFormat::RowStore {
            debug!("{} is not a row store, skipped", target.display());
            return Ok((Outcome::Skipped, resolved));
        }

        let mut store = RowStore::open(target)?;
        let report = store.apply(&job.tables, Substitution::Ids(&self.map), self.cancel)?;
        self.summary.rows_edited += report.rows_edited;
        self.summary.ids_remapped += report.ids_replaced;
        self.summary.warnings += report.total_warnings();
        Ok((Outcome::Edited, resolved))
    }

    fn discovery_cross_check(&mut self) {
        let Some(path) = &self.config.discovered_ids else {
            return;
        };
        match load_discovered_ids(path) {
            Ok(observed) => {
                let mismatches = cross_check(&self.expected, &observed);
                if mismatches == 0 {
                    info!("Discovered identifiers agree with the identifier map ({} checked)", observed.len());
                }
                self.summary.warnings += mismatches;
            }
            Err(e) => {
                warn!("Skipping discovery cross-check: {}", e);
                self.summary.warnings += 1;
            }
        }
    }

    /// Rescan every propagated store for identifiers that still need mapping.
    fn consistency_check(&mut self, propagated: &[(PathBuf, usize)]) {
        let jobs = &self.config.jobs.ids;
        let mut seen = HashSet::new();
        for (target, index) in propagated {
            if !seen.insert((target.clone(), *index))
                || ContentFormat::of(target) != ContentFormat::RowStore
                || !target.is_file()
            {
                continue;
            }
            let tables = &jobs[*index].tables;
            match RowStore::open_read_only(target).and_then(|store| store.count_stale_ids(tables, &self.map)) {
                Ok(0) => debug!("No stale identifiers in {}", target.display()),
                Ok(stale) => {
                    warn!("{} stale identifier occurrences remain in {}", stale, target.display());
                    self.summary.warnings += stale;
                }
                Err(e) => {
                    warn!("Consistency check of {} failed: {}", target.display(), e);
                    self.summary.warnings += 1;
                }
            }
        }
    }

    /// Phase 4.
    fn reconcile_timestamps(&mut self) -> Result<()> {
        let config = self.config;
        let timestamps = &config.timestamps;
        if !timestamps.enabled {
            debug!("Timestamp reconciliation disabled");
            return Ok(());
        }
        self.cancel.check()?;
        info!("Starting {}", Phase::TimestampSync);

        let resolver = TargetResolver::new(config, None);
        let source_store = config.roots.source.join(&timestamps.store);
        let store_path = self
            .ledger
            .target_of(&source_store)
            .map(Path::to_path_buf)
            .unwrap_or_else(|| resolver.resolve(&source_store, &TargetPolicy::Auto).target);
        if !store_path.is_file() {
            warn!("{} not found, timestamps not reconciled", store_path.display());
            self.summary.warnings += 1;
            return Ok(());
        }

        let reconciler = TimestampReconciler::new(timestamps, &resolver, &self.ledger);
        match reconciler.reconcile(&store_path, self.cancel) {
            Ok(report) => {
                self.summary.rows_edited += report.rows_updated;
                self.summary.warnings += report.warnings;
            }
            Err(e) => match e.severity() {
                Severity::RunFatal => return Err(e),
                Severity::Warning => {
                    warn!("{}", e);
                    self.summary.warnings += 1;
                }
                Severity::JobFatal => {
                    error!("{} failed on {}: {}", Phase::TimestampSync, store_path.display(), e);
                    self.summary.fatal_failures += 1;
                }
            },
        }
        info!("Finished {}", Phase::TimestampSync);
        Ok(())
    }
}
