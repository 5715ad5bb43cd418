//! Path rewriting for plain strings and the path-bearing formats the server
//! writes (JSON documents, composite image strings, XML/NFO text, .mblink).
//!
//! The format walkers are generic over [`StringRewrite`], so the same code
//! drives prefix replacement in phase 1 and identifier substitution inside
//! paths in phase 2.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;
use tracing::warn;

use crate::config::{normalize_separators, PathRuleSet, SlashStyle};

/// Element text between a closing `>` and the next `<`.
static XML_TEXT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r">([^<]+)<").unwrap());

/// Separator between entries of an image column.
const IMAGE_ENTRY_SEP: char = '|';

/// Separator between the fields of one image entry.
const IMAGE_FIELD_SEP: char = '*';

/// Counters for one rewrite pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RewriteStats {
    /// Values that were changed.
    pub modified: usize,
    /// Values inspected and left alone.
    pub ignored: usize,
    /// Path-looking values no rule matched (only counted when warnings are on).
    pub warnings: usize,
}

impl RewriteStats {
    pub fn merge(&mut self, other: RewriteStats) {
        self.modified += other.modified;
        self.ignored += other.ignored;
        self.warnings += other.warnings;
    }
}

/// A rewrite of single path-valued strings.
pub trait StringRewrite {
    /// Rewrite `value`, or return `None` to leave it untouched.
    fn rewrite_value(&self, value: &str, stats: &mut RewriteStats) -> Option<String>;
}

/// Applies a [`PathRuleSet`] to path strings.
#[derive(Debug)]
pub struct PathRewriter<'r> {
    rules: &'r PathRuleSet,
    prepared: Vec<PreparedRule>,
}

#[derive(Debug)]
struct PreparedRule {
    from: String,
    to: String,
}

impl<'r> PathRewriter<'r> {
    pub fn new(rules: &'r PathRuleSet) -> Self {
        let prepared = rules
            .rules
            .iter()
            .map(|rule| PreparedRule {
                from: normalize_separators(&rule.from),
                to: normalize_separators(&rule.to),
            })
            .collect();
        Self { rules, prepared }
    }

    pub fn slash(&self) -> SlashStyle {
        self.rules.slash
    }

    /// Apply the first matching rule. `None` when no rule matches.
    ///
    /// Matching is per path component on the slash-normalized input, so
    /// `C:/A` matches `C:/A/b` but not `C:/AB`. URLs never match.
    pub fn try_rewrite(&self, path: &str) -> Option<String> {
        if is_url(path) {
            return None;
        }
        let normalized = normalize_separators(path);
        self.prepared.iter().find_map(|rule| {
            let rest = self.strip_rule_prefix(&normalized, &rule.from)?;
            Some(self.emit(join_prefix(&rule.to, rest)))
        })
    }

    /// Apply the first matching rule or return the input unchanged.
    pub fn rewrite_path<'s>(&self, path: &'s str) -> Cow<'s, str> {
        match self.try_rewrite(path) {
            Some(rewritten) => Cow::Owned(rewritten),
            None => Cow::Borrowed(path),
        }
    }

    /// True if `path` already lies below one of the rules' targets.
    pub fn is_rewritten(&self, path: &str) -> bool {
        let normalized = normalize_separators(path);
        self.prepared
            .iter()
            .any(|rule| self.strip_rule_prefix(&normalized, &rule.to).is_some())
    }

    fn strip_rule_prefix<'p>(&self, normalized: &'p str, prefix: &str) -> Option<&'p str> {
        if prefix.is_empty() {
            return None;
        }
        let head = normalized.get(..prefix.len())?;
        let matches = if self.rules.case_insensitive {
            head.eq_ignore_ascii_case(prefix)
        } else {
            head == prefix
        };
        if !matches {
            return None;
        }
        let rest = &normalized[prefix.len()..];
        if rest.is_empty() || rest.starts_with('/') || prefix.ends_with('/') {
            Some(rest)
        } else {
            None
        }
    }

    fn emit(&self, path: String) -> String {
        match self.rules.slash {
            SlashStyle::Forward => path,
            SlashStyle::Backward => path.replace('/', "\\"),
        }
    }
}

impl StringRewrite for PathRewriter<'_> {
    fn rewrite_value(&self, value: &str, stats: &mut RewriteStats) -> Option<String> {
        match self.try_rewrite(value) {
            Some(rewritten) if rewritten != value => {
                stats.modified += 1;
                Some(rewritten)
            }
            Some(_) => {
                stats.ignored += 1;
                None
            }
            None => {
                stats.ignored += 1;
                if !self.rules.log_no_warnings && looks_like_path(value) && !self.is_rewritten(value) {
                    warn!("No rule matches presumed path: {}", value);
                    stats.warnings += 1;
                }
                None
            }
        }
    }
}

fn join_prefix(prefix: &str, rest: &str) -> String {
    if prefix.is_empty() {
        return rest.trim_start_matches('/').to_string();
    }
    if prefix.ends_with('/') && rest.starts_with('/') {
        format!("{}{}", prefix, &rest[1..])
    } else if !rest.is_empty() && !rest.starts_with('/') && !prefix.ends_with('/') {
        // A root rule (`/`) consumed the separator.
        format!("{prefix}/{rest}")
    } else {
        format!("{prefix}{rest}")
    }
}

fn is_url(value: &str) -> bool {
    let lower = value.trim_start().to_ascii_lowercase();
    lower.contains("://") || lower.starts_with("http:") || lower.starts_with("https:")
}

/// Heuristic for "this string is probably a path": it has at least two
/// components and is not a URL.
pub fn looks_like_path(value: &str) -> bool {
    if value.is_empty() || is_url(value) || value.contains('\n') {
        return false;
    }
    let normalized = normalize_separators(value);
    normalized
        .trim_start_matches('/')
        .trim_end_matches('/')
        .contains('/')
}

/// Recursively rewrite every string value (never keys) of a JSON document.
pub fn rewrite_json_value(value: &mut Value, rw: &dyn StringRewrite, stats: &mut RewriteStats) -> bool {
    match value {
        Value::String(s) => match rw.rewrite_value(s, stats) {
            Some(rewritten) => {
                *s = rewritten;
                true
            }
            None => false,
        },
        Value::Array(items) => items
            .iter_mut()
            .fold(false, |changed, item| rewrite_json_value(item, rw, stats) || changed),
        Value::Object(map) => map
            .values_mut()
            .fold(false, |changed, item| rewrite_json_value(item, rw, stats) || changed),
        _ => false,
    }
}

/// Rewrite a JSON column value. Returns the compact re-serialization when
/// anything changed.
pub fn rewrite_json_text(
    text: &str,
    rw: &dyn StringRewrite,
    stats: &mut RewriteStats,
) -> Result<Option<String>, serde_json::Error> {
    let mut value: Value = serde_json::from_str(text)?;
    if rewrite_json_value(&mut value, rw, stats) {
        Ok(Some(serde_json::to_string(&value)?))
    } else {
        Ok(None)
    }
}

/// Rewrite a JSON file's content. Returns the pretty-printed (2-space)
/// re-serialization when anything changed.
pub fn rewrite_json_document(
    text: &str,
    rw: &dyn StringRewrite,
    stats: &mut RewriteStats,
) -> Result<Option<String>, serde_json::Error> {
    let mut value: Value = serde_json::from_str(text)?;
    if rewrite_json_value(&mut value, rw, stats) {
        Ok(Some(serde_json::to_string_pretty(&value)?))
    } else {
        Ok(None)
    }
}

/// Rewrite the path field of every entry of an image column.
///
/// The column holds entries separated by `|`; each entry is
/// `path*ticks*type*width*height[*blurhash]`. Only the path is touched and
/// every other byte is preserved. An entry whose ticks field is missing or not
/// an integer makes the whole value unparseable.
pub fn rewrite_jf_image(
    text: &str,
    rw: &dyn StringRewrite,
    stats: &mut RewriteStats,
) -> Result<Option<String>, String> {
    let mut entries: Vec<String> = Vec::new();
    let mut changed = false;

    for (index, entry) in text.split(IMAGE_ENTRY_SEP).enumerate() {
        if entry.is_empty() {
            entries.push(String::new());
            continue;
        }
        let (path, properties) = entry
            .split_once(IMAGE_FIELD_SEP)
            .ok_or_else(|| format!("image entry {index} has no properties"))?;
        let ticks = properties.split(IMAGE_FIELD_SEP).next().unwrap_or_default();
        if ticks.parse::<i64>().is_err() {
            return Err(format!("image entry {index}: `{ticks}` is not a tick count"));
        }
        match rw.rewrite_value(path, stats) {
            Some(rewritten) => {
                changed = true;
                entries.push(format!("{rewritten}{IMAGE_FIELD_SEP}{properties}"));
            }
            None => entries.push(entry.to_string()),
        }
    }

    if changed {
        Ok(Some(entries.join(&IMAGE_ENTRY_SEP.to_string())))
    } else {
        Ok(None)
    }
}

/// Rewrite every element text node of an XML/NFO document that is a path.
/// Markup, attributes and unmatched text are preserved byte for byte.
pub fn rewrite_xml(text: &str, rw: &dyn StringRewrite, stats: &mut RewriteStats) -> Option<String> {
    let mut changed = false;
    let out = XML_TEXT.replace_all(text, |caps: &Captures<'_>| {
        let raw = &caps[1];
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return caps[0].to_string();
        }
        let value = xml_unescape(trimmed);
        match rw.rewrite_value(&value, stats) {
            Some(rewritten) => {
                changed = true;
                let lead = &raw[..raw.len() - raw.trim_start().len()];
                let trail = &raw[raw.trim_end().len()..];
                format!(">{}{}{}<", lead, xml_escape(&rewritten), trail)
            }
            None => caps[0].to_string(),
        }
    });
    changed.then(|| out.into_owned())
}

/// Rewrite a `.mblink` file (a single path). Surrounding whitespace is kept.
pub fn rewrite_mblink(text: &str, rw: &dyn StringRewrite, stats: &mut RewriteStats) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    let rewritten = rw.rewrite_value(trimmed, stats)?;
    let lead = &text[..text.len() - text.trim_start().len()];
    let trail = &text[text.trim_end().len()..];
    Some(format!("{lead}{rewritten}{trail}"))
}

fn xml_unescape(text: &str) -> Cow<'_, str> {
    if !text.contains('&') {
        return Cow::Borrowed(text);
    }
    Cow::Owned(
        text.replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&quot;", "\"")
            .replace("&apos;", "'")
            .replace("&amp;", "&"),
    )
}

fn xml_escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
