//! The old → new identifier map and the substitutions built on it.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{MigrateError, Result};
use crate::ids::{find_embedded, IdKind, ItemId};
use crate::paths::{RewriteStats, StringRewrite};
use crate::state::{atomic_read_json, atomic_write_json};

/// Old identifier → new identifier for every item whose path changed.
///
/// Each old id maps to exactly one new id and no two old ids share a new id;
/// an insert that would break either rule is rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentifierMap {
    forward: BTreeMap<ItemId, ItemId>,
    reverse: HashMap<ItemId, ItemId>,
}

impl IdentifierMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `old → new`. Returns `false` when nothing needed adding (identity
    /// mapping or an exact repeat).
    pub fn insert(&mut self, old: ItemId, new: ItemId) -> Result<bool> {
        if old == new {
            return Ok(false);
        }
        if let Some(existing) = self.forward.get(&old) {
            if *existing == new {
                return Ok(false);
            }
            return Err(MigrateError::IdentifierCollision {
                message: format!("{old} already maps to {existing}, refusing {new}"),
            });
        }
        if let Some(other) = self.reverse.get(&new) {
            return Err(MigrateError::IdentifierCollision {
                message: format!("{old} and {other} would both become {new}"),
            });
        }
        self.forward.insert(old, new);
        self.reverse.insert(new, old);
        Ok(true)
    }

    pub fn get(&self, old: &ItemId) -> Option<ItemId> {
        self.forward.get(old).copied()
    }

    pub fn contains_key(&self, old: &ItemId) -> bool {
        self.forward.contains_key(old)
    }

    /// The old id that maps to `new`, if any.
    pub fn old_for(&self, new: &ItemId) -> Option<ItemId> {
        self.reverse.get(new).copied()
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ItemId, &ItemId)> {
        self.forward.iter()
    }

    /// Replace every mapped identifier of `kind` embedded in `text`.
    ///
    /// Unmapped identifiers and all other bytes are kept; the letter case of
    /// each replaced occurrence is preserved. Returns the new text and the
    /// number of replacements, or `None` when nothing was replaced.
    pub fn substitute_embedded(&self, kind: IdKind, text: &str) -> Option<(String, usize)> {
        let mut out = String::with_capacity(text.len());
        let mut last = 0;
        let mut count = 0;
        for found in find_embedded(kind, text) {
            let Some(new) = self.get(&found.id) else {
                continue;
            };
            out.push_str(&text[last..found.range.start]);
            out.push_str(&encode_like(new, kind, found.uppercase));
            last = found.range.end;
            count += 1;
        }
        if count == 0 {
            return None;
        }
        out.push_str(&text[last..]);
        Some((out, count))
    }

    /// Number of mapped (old) identifiers of `kind` embedded in `text`.
    pub fn count_embedded(&self, kind: IdKind, text: &str) -> usize {
        find_embedded(kind, text)
            .iter()
            .filter(|found| self.contains_key(&found.id))
            .count()
    }

    /// Rewrite identifiers inside the components of a path.
    ///
    /// A component that is exactly a mapped identifier may sit below a
    /// two-character bucket directory named after the identifier's first two
    /// characters (`metadata/library/71/71d0…/`); the bucket is renamed with it.
    pub fn substitute_in_path(&self, kinds: &[IdKind], path: &str) -> Option<(String, usize)> {
        let mut components: Vec<String> = Vec::new();
        let mut separators: Vec<char> = Vec::new();
        let mut current = String::new();
        for c in path.chars() {
            if c == '/' || c == '\\' {
                components.push(std::mem::take(&mut current));
                separators.push(c);
            } else {
                current.push(c);
            }
        }
        components.push(current);

        let mut count = 0;
        for i in 0..components.len() {
            for &kind in kinds {
                let component = &components[i];
                let whole = find_embedded(kind, component)
                    .into_iter()
                    .find(|found| found.range == (0..component.len()));
                let Some((replaced, n)) = self.substitute_embedded(kind, component) else {
                    continue;
                };
                if let (Some(found), Some(bucket_index)) = (whole, i.checked_sub(1)) {
                    let old_text = found.id.encode_text(kind);
                    let bucket = &components[bucket_index];
                    if bucket.len() == 2 && bucket.eq_ignore_ascii_case(&old_text[..2]) {
                        let new_bucket = replaced[..2].to_string();
                        components[bucket_index] = new_bucket;
                    }
                }
                components[i] = replaced;
                count += n;
            }
        }
        if count == 0 {
            return None;
        }

        let mut out = String::with_capacity(path.len());
        for (i, component) in components.iter().enumerate() {
            out.push_str(component);
            if let Some(sep) = separators.get(i) {
                out.push(*sep);
            }
        }
        Some((out, count))
    }

    /// Persist atomically as `{ "old": "new", ... }`.
    pub fn save(&self, path: &Path) -> Result<()> {
        atomic_write_json(path, &self.forward)?;
        debug!("Saved {} identifier mappings to {}", self.len(), path.display());
        Ok(())
    }

    /// Load a previously saved map. `None` if the file doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let Some(forward) = atomic_read_json::<BTreeMap<ItemId, ItemId>>(path)? else {
            return Ok(None);
        };
        let mut map = Self::new();
        for (old, new) in forward {
            map.insert(old, new)?;
        }
        Ok(Some(map))
    }
}

fn encode_like(id: ItemId, kind: IdKind, uppercase: bool) -> String {
    let text = id.encode_text(kind);
    if uppercase {
        text.to_ascii_uppercase()
    } else {
        text
    }
}

/// Substitutes mapped identifiers inside path-valued strings (phase 2).
#[derive(Debug, Clone, Copy)]
pub struct IdPathRewriter<'m> {
    map: &'m IdentifierMap,
    kinds: &'m [IdKind],
}

impl<'m> IdPathRewriter<'m> {
    pub fn new(map: &'m IdentifierMap, kinds: &'m [IdKind]) -> Self {
        Self { map, kinds }
    }

    pub fn rewrite(&self, path: &str) -> Option<String> {
        self.map
            .substitute_in_path(self.kinds, path)
            .map(|(rewritten, _)| rewritten)
    }
}

impl StringRewrite for IdPathRewriter<'_> {
    fn rewrite_value(&self, value: &str, stats: &mut RewriteStats) -> Option<String> {
        match self.map.substitute_in_path(self.kinds, value) {
            Some((rewritten, _)) => {
                stats.modified += 1;
                Some(rewritten)
            }
            None => {
                stats.ignored += 1;
                None
            }
        }
    }
}

/// One observation from the identifier-discovery tool.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DiscoveredId {
    pub id: ItemId,
    pub path: String,
}

/// Load the discovery tool's output (`[{ "id": ..., "path": ... }]`).
pub fn load_discovered_ids(path: &Path) -> Result<Vec<DiscoveredId>> {
    let text = std::fs::read_to_string(path).map_err(|e| MigrateError::unreadable_file(path, e))?;
    serde_json::from_str(&text).map_err(|e| MigrateError::Json {
        message: format!("Failed to parse {}: {}", path.display(), e),
        source: Some(e),
    })
}

/// Compare discovered identifiers with the ones the map predicts.
///
/// `expected` maps each migrated item's new (normalized) server path to its new
/// id. Every observation of such a path must carry that id. Returns the number
/// of mismatches, each logged as a warning.
pub fn cross_check(expected: &HashMap<String, ItemId>, observed: &[DiscoveredId]) -> usize {
    let mut mismatches = 0;
    for seen in observed {
        let key = crate::config::normalize_separators(&seen.path);
        if let Some(predicted) = expected.get(&key) {
            if *predicted != seen.id {
                warn!(
                    "Discovered id {} for {} differs from the recomputed id {}",
                    seen.id, seen.path, predicted
                );
                mismatches += 1;
            }
        }
    }
    mismatches
}
