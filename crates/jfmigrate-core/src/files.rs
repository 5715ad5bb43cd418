//! Source enumeration, target resolution and per-format file rewriting.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use regex::Regex;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::{normalize_separators, MigrationConfig, PathRuleSet, TargetPolicy};
use crate::error::{MigrateError, Result};
use crate::paths::{
    rewrite_json_document, rewrite_mblink, rewrite_xml, PathRewriter, RewriteStats, StringRewrite,
};

/// Files below `root` matching `pattern`, sorted.
///
/// Patterns are relative to `root` and use `/` or `\` as separator; `*` and `?`
/// stay within one component, `**/` spans any number of directories.
pub fn glob_files(root: &Path, pattern: &str) -> Result<Vec<PathBuf>> {
    let pattern = normalize_separators(pattern);
    let pattern = pattern.trim_start_matches('/');

    if !pattern.contains(['*', '?']) {
        let path = root.join(pattern);
        return Ok(if path.is_file() { vec![path] } else { Vec::new() });
    }

    let matcher = Regex::new(&glob_to_regex(pattern))
        .map_err(|e| MigrateError::config(format!("invalid source pattern `{pattern}`: {e}")))?;

    let mut files: Vec<PathBuf> = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!("Skipping unreadable entry below {}: {}", root.display(), e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .path()
                .strip_prefix(root)
                .map(|rel| matcher.is_match(&rel.to_string_lossy().replace('\\', "/")))
                .unwrap_or(false)
        })
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    Ok(files)
}

fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                if chars.peek() == Some(&'/') {
                    chars.next();
                    out.push_str("(?:.*/)?");
                } else {
                    out.push_str(".*");
                }
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    out
}

/// Where a job puts one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    /// The path the migrated server will use for the file.
    pub server_path: String,
    /// Where the migrator writes the file.
    pub target: PathBuf,
}

/// Resolves job targets: source root → original root → path rules →
/// filesystem rules → root placement.
#[derive(Debug)]
pub struct TargetResolver<'c> {
    config: &'c MigrationConfig,
    path_rules: PathRewriter<'c>,
    fs_rules: PathRewriter<'c>,
}

impl<'c> TargetResolver<'c> {
    /// `job_rules` overrides the global path rules.
    pub fn new(config: &'c MigrationConfig, job_rules: Option<&'c PathRuleSet>) -> Self {
        Self {
            config,
            path_rules: PathRewriter::new(job_rules.unwrap_or(&config.path_rules)),
            fs_rules: PathRewriter::new(&config.fs_rules),
        }
    }

    pub fn path_rules(&self) -> &PathRewriter<'c> {
        &self.path_rules
    }

    /// The path the old server used for `source`.
    pub fn original_path(&self, source: &Path) -> String {
        let relative = source
            .strip_prefix(&self.config.roots.source)
            .unwrap_or(source)
            .to_string_lossy()
            .replace('\\', "/");
        let root = normalize_separators(&self.config.roots.original_root());
        if relative.is_empty() {
            root
        } else if root.ends_with('/') {
            format!("{root}{relative}")
        } else {
            format!("{root}/{relative}")
        }
    }

    /// The path the migrated server will use for `source`.
    pub fn server_path(&self, source: &Path) -> String {
        let original = self.original_path(source);
        self.path_rules.rewrite_path(&original).into_owned()
    }

    /// Where a server-visible path lives on the migrator's filesystem.
    ///
    /// Results that are absolute on this host are used as-is; others are
    /// placed below the target root, leading-`/` ones only when
    /// `container_rooted_paths` is set. A drive-letter path on a Unix host is
    /// relative and lands below the target root.
    pub fn to_disk(&self, server_path: &str) -> PathBuf {
        let mapped = normalize_separators(&self.fs_rules.rewrite_path(server_path));
        self.place(&mapped)
    }

    /// Like [`to_disk`](Self::to_disk), but `None` when neither the server
    /// path itself nor any filesystem rule places it somewhere known.
    pub fn try_to_disk(&self, server_path: &str) -> Option<PathBuf> {
        self.fs_rules
            .try_rewrite(server_path)
            .map(|mapped| self.place(&normalize_separators(&mapped)))
    }

    fn place(&self, mapped: &str) -> PathBuf {
        let target_root = &self.config.roots.target;
        let container_rooted = mapped.starts_with('/') && !mapped.starts_with("//");
        if container_rooted {
            if self.config.container_rooted_paths || !Path::new(mapped).is_absolute() {
                target_root.join(mapped.trim_start_matches('/'))
            } else {
                PathBuf::from(mapped)
            }
        } else if Path::new(mapped).is_absolute() {
            PathBuf::from(mapped)
        } else {
            target_root.join(mapped)
        }
    }

    /// Whether any path rule covers the old server path of `source`.
    pub fn rules_cover(&self, source: &Path) -> bool {
        self.path_rules.try_rewrite(&self.original_path(source)).is_some()
    }

    pub fn resolve(&self, source: &Path, policy: &TargetPolicy) -> ResolvedTarget {
        let server_path = self.server_path(source);
        let target = match policy {
            TargetPolicy::Explicit(path) => path.clone(),
            TargetPolicy::Auto | TargetPolicy::AutoExisting => self.to_disk(&server_path),
        };
        ResolvedTarget { server_path, target }
    }
}

/// How a file's content is interpreted, by extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentFormat {
    RowStore,
    Xml,
    MbLink,
    Json,
    Opaque,
}

impl ContentFormat {
    pub fn of(path: &Path) -> Self {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "db" => ContentFormat::RowStore,
            "xml" | "nfo" => ContentFormat::Xml,
            "mblink" => ContentFormat::MbLink,
            "json" => ContentFormat::Json,
            _ => ContentFormat::Opaque,
        }
    }
}

/// Result of rewriting one text file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileRewrite {
    pub changed: bool,
    pub stats: RewriteStats,
    /// Content left untouched because it could not be parsed.
    pub unparseable: bool,
}

/// Rewrite the path-bearing content of a text file in place.
///
/// Opaque and row-store formats are not handled here. Content that cannot be
/// decoded or parsed is left as it is and reported as `unparseable`.
pub fn rewrite_text_file(path: &Path, format: ContentFormat, rw: &dyn StringRewrite) -> Result<FileRewrite> {
    let mut result = FileRewrite::default();
    if matches!(format, ContentFormat::RowStore | ContentFormat::Opaque) {
        return Ok(result);
    }

    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::InvalidData => {
            warn!("{} is not UTF-8 text, left unchanged", path.display());
            result.unparseable = true;
            return Ok(result);
        }
        Err(e) => return Err(MigrateError::unreadable_file(path, e)),
    };

    let rewritten = match format {
        ContentFormat::Xml => rewrite_xml(&text, rw, &mut result.stats),
        ContentFormat::MbLink => rewrite_mblink(&text, rw, &mut result.stats),
        ContentFormat::Json => match rewrite_json_document(&text, rw, &mut result.stats) {
            Ok(rewritten) => rewritten,
            Err(e) => {
                warn!("{} is not valid JSON ({}), left unchanged", path.display(), e);
                result.unparseable = true;
                return Ok(result);
            }
        },
        ContentFormat::RowStore | ContentFormat::Opaque => None,
    };

    if let Some(rewritten) = rewritten {
        fs::write(path, rewritten).map_err(|e| MigrateError::io_with_path(e, path))?;
        result.changed = true;
    }
    Ok(result)
}

/// Copy `source` to `target`, creating parent directories.
pub fn copy_file(source: &Path, target: &Path) -> Result<u64> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(|e| MigrateError::io_with_path(e, parent))?;
    }
    fs::copy(source, target).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied if !source.is_file() => {
            MigrateError::unreadable_file(source, e)
        }
        _ => MigrateError::io_with_path(e, target),
    })
}

/// Move `from` to `to` without overwriting. Returns `false` (and leaves both
/// untouched) when `to` already exists.
pub fn move_file(from: &Path, to: &Path) -> Result<bool> {
    if to.exists() {
        return Ok(false);
    }
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).map_err(|e| MigrateError::io_with_path(e, parent))?;
    }
    if fs::rename(from, to).is_err() {
        fs::copy(from, to).map_err(|e| MigrateError::io_with_path(e, to))?;
        fs::remove_file(from).map_err(|e| MigrateError::io_with_path(e, from))?;
    }
    Ok(true)
}

/// Remove `dir` and its now-empty ancestors up to (not including) `stop`.
pub fn prune_empty_dirs(dir: &Path, stop: &Path) {
    let mut current = Some(dir);
    while let Some(d) = current {
        if d == stop || !d.starts_with(stop) {
            break;
        }
        if fs::remove_dir(d).is_err() {
            break;
        }
        debug!("Removed empty directory {}", d.display());
        current = d.parent();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ReplacementRule, SlashStyle};
    use tempfile::TempDir;

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"x").unwrap();
    }

    fn rel(root: &Path, files: Vec<PathBuf>) -> Vec<String> {
        files
            .into_iter()
            .map(|f| f.strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/"))
            .collect()
    }

    #[test]
    fn test_glob_patterns() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        for f in [
            "data/library.db",
            "data/jellyfin.db",
            "data/collections/Set/collection.xml",
            "config/system.xml",
            "config/sub/other.xml",
            "metadata/library/71/71d0/movie.nfo",
            "root/default/Movies/movies.mblink",
            "log/log_1.txt",
            "README",
        ] {
            touch(root, f);
        }

        assert_eq!(rel(root, glob_files(root, "data/*.db").unwrap()), ["data/jellyfin.db", "data/library.db"]);
        assert_eq!(rel(root, glob_files(root, "config/*.xml").unwrap()), ["config/system.xml"]);
        assert_eq!(
            rel(root, glob_files(root, "metadata/**/*.nfo").unwrap()),
            ["metadata/library/71/71d0/movie.nfo"]
        );
        assert_eq!(
            rel(root, glob_files(root, "data/collections/**/collection.xml").unwrap()),
            ["data/collections/Set/collection.xml"]
        );
        // `*.*` skips extensionless files.
        assert_eq!(glob_files(root, "**/*.*").unwrap().len(), 8);
        assert_eq!(rel(root, glob_files(root, "data\\library.db").unwrap()), ["data/library.db"]);
        assert!(glob_files(root, "data/absent.db").unwrap().is_empty());
    }

    fn config(source: &Path, original: &str, fs_rules: &str, container_rooted: bool) -> MigrationConfig {
        let text = format!(
            r#"{{
                "path_rules": {{"rules": [
                    {{"from": "C:/ProgramData/Jellyfin/Server/config", "to": "/config"}},
                    {{"from": "C:/ProgramData/Jellyfin/Server", "to": "/config"}},
                    {{"from": "F:/Filme", "to": "/data/movies"}}
                ]}},
                "fs_rules": {fs_rules},
                "roots": {{"original": {}, "source": {}, "target": "/srv/target"}},
                "container_rooted_paths": {container_rooted},
                "jobs": {{}}
            }}"#,
            serde_json::to_string(original).unwrap(),
            serde_json::to_string(&source.to_string_lossy()).unwrap(),
        );
        MigrationConfig::from_json_str(&text).unwrap()
    }

    #[test]
    fn test_auto_target_for_networking_xml() {
        let tmp = TempDir::new().unwrap();
        let config = config(tmp.path(), "C:/ProgramData/Jellyfin/Server", "{}", true);
        let resolver = TargetResolver::new(&config, None);

        let source = tmp.path().join("config/networking.xml");
        let resolved = resolver.resolve(&source, &TargetPolicy::Auto);
        assert_eq!(resolved.server_path, "/config/networking.xml");
        assert_eq!(resolved.target, PathBuf::from("/srv/target/config/networking.xml"));
    }

    #[cfg(unix)]
    #[test]
    fn test_fs_rules_and_root_placement() {
        let tmp = TempDir::new().unwrap();
        let fs_rules = r#"{"rules": [{"from": "/data/movies", "to": "/mnt/movies"}, {"from": "/config", "to": "jf-config"}]}"#;
        let config = config(tmp.path(), "C:\\ProgramData\\Jellyfin\\Server", fs_rules, false);
        let resolver = TargetResolver::new(&config, None);

        assert_eq!(resolver.to_disk("/data/movies/a.mkv"), PathBuf::from("/mnt/movies/a.mkv"));
        assert_eq!(resolver.to_disk("/config/system.xml"), PathBuf::from("/srv/target/jf-config/system.xml"));
        assert_eq!(resolver.to_disk("/elsewhere/x"), PathBuf::from("/elsewhere/x"));
        assert_eq!(resolver.try_to_disk("/elsewhere/x"), None);

        let overrides = PathRuleSet::new(
            SlashStyle::Forward,
            vec![ReplacementRule::new("C:/ProgramData/Jellyfin/Server", "/var/lib/jellyfin")],
        );
        let resolver = TargetResolver::new(&config, Some(&overrides));
        assert_eq!(
            resolver.server_path(&tmp.path().join("data/library.db")),
            "/var/lib/jellyfin/data/library.db"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_drive_letter_result_stays_below_target_root() {
        let tmp = TempDir::new().unwrap();
        let config = config(tmp.path(), "D:/Jellyfin/Server", "{}", true);
        let resolver = TargetResolver::new(&config, None);

        let source = tmp.path().join("other/x.bin");
        assert!(!resolver.rules_cover(&source));
        let resolved = resolver.resolve(&source, &TargetPolicy::Auto);
        assert_eq!(resolved.server_path, "D:/Jellyfin/Server/other/x.bin");
        assert_eq!(
            resolved.target,
            PathBuf::from("/srv/target/D:/Jellyfin/Server/other/x.bin")
        );
    }

    #[test]
    fn test_content_format_by_extension() {
        assert_eq!(ContentFormat::of(Path::new("a/library.db")), ContentFormat::RowStore);
        assert_eq!(ContentFormat::of(Path::new("a/movie.NFO")), ContentFormat::Xml);
        assert_eq!(ContentFormat::of(Path::new("a/x.mblink")), ContentFormat::MbLink);
        assert_eq!(ContentFormat::of(Path::new("a/meta.json")), ContentFormat::Json);
        assert_eq!(ContentFormat::of(Path::new("a/poster.jpg")), ContentFormat::Opaque);
    }

    #[test]
    fn test_rewrite_text_file_formats() {
        let tmp = TempDir::new().unwrap();
        let rules = PathRuleSet::new(SlashStyle::Forward, vec![ReplacementRule::new("F:/Filme", "/data/movies")]);
        let rw = PathRewriter::new(&rules);

        let json = tmp.path().join("options.json");
        fs::write(&json, r#"{"Paths":["F:\\Filme"],"Port":8096}"#).unwrap();
        let result = rewrite_text_file(&json, ContentFormat::Json, &rw).unwrap();
        assert!(result.changed);
        assert_eq!(
            fs::read_to_string(&json).unwrap(),
            "{\n  \"Paths\": [\n    \"/data/movies\"\n  ],\n  \"Port\": 8096\n}"
        );

        let broken = tmp.path().join("broken.json");
        fs::write(&broken, "{ F:/Filme").unwrap();
        let result = rewrite_text_file(&broken, ContentFormat::Json, &rw).unwrap();
        assert!(result.unparseable);
        assert_eq!(fs::read_to_string(&broken).unwrap(), "{ F:/Filme");
    }

    #[test]
    fn test_move_never_overwrites() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a/file.txt");
        let b = tmp.path().join("b/file.txt");
        touch(tmp.path(), "a/file.txt");

        assert!(move_file(&a, &b).unwrap());
        assert!(!a.exists() && b.exists());

        touch(tmp.path(), "a/file.txt");
        assert!(!move_file(&a, &b).unwrap());
        assert!(a.exists());

        fs::remove_file(&a).unwrap();
        prune_empty_dirs(&tmp.path().join("a"), tmp.path());
        assert!(!tmp.path().join("a").exists());
        assert!(tmp.path().exists());
    }
}
