//! Path rule sets: ordered prefix replacements plus an output slash style.

use serde::{Deserialize, Serialize};

use crate::error::{MigrateError, Result};

/// Separator written into rewritten paths.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlashStyle {
    #[default]
    #[serde(rename = "/")]
    Forward,
    #[serde(rename = "\\")]
    Backward,
}

impl SlashStyle {
    pub fn as_char(self) -> char {
        match self {
            SlashStyle::Forward => '/',
            SlashStyle::Backward => '\\',
        }
    }
}

/// One `from` prefix → `to` prefix replacement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplacementRule {
    pub from: String,
    pub to: String,
}

impl ReplacementRule {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// Ordered rules; the first rule whose `from` prefix matches wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PathRuleSet {
    #[serde(default)]
    pub slash: SlashStyle,
    /// Compare prefixes ignoring ASCII case (Windows sources).
    #[serde(default)]
    pub case_insensitive: bool,
    /// Don't warn about path-looking strings that no rule matches.
    #[serde(default)]
    pub log_no_warnings: bool,
    #[serde(default)]
    pub rules: Vec<ReplacementRule>,
}

impl PathRuleSet {
    pub fn new(slash: SlashStyle, rules: Vec<ReplacementRule>) -> Self {
        Self {
            slash,
            case_insensitive: false,
            log_no_warnings: false,
            rules,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub(crate) fn validate(&self, name: &str) -> Result<()> {
        for (i, rule) in self.rules.iter().enumerate() {
            if normalize_separators(&rule.from).is_empty() {
                return Err(MigrateError::config(format!(
                    "{name}.rules[{i}]: `from` must not be empty"
                )));
            }
        }
        Ok(())
    }
}

/// Convert every `\` to `/`, collapse repeated separators and drop a trailing
/// one. A leading `//` (UNC) is preserved.
pub fn normalize_separators(path: &str) -> String {
    let unc = path.starts_with("\\\\") || path.starts_with("//");
    let mut out = String::with_capacity(path.len());
    let mut prev_sep = false;
    for c in path.chars() {
        let c = if c == '\\' { '/' } else { c };
        if c == '/' {
            if prev_sep {
                continue;
            }
            prev_sep = true;
        } else {
            prev_sep = false;
        }
        out.push(c);
    }
    if out.len() > 1 && out.ends_with('/') {
        out.pop();
    }
    if unc {
        out.insert(0, '/');
    }
    out
}
