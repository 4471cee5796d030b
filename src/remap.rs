//! URL remap table
//!
//! Rules rewrite the target of a proxied GET before it is fetched. A rule
//! maps a source URL prefix to a destination URL prefix; the first rule
//! whose prefix matches wins, and the remainder of the URL is kept.
//!
//! Rules come from the JSON config and from a text file in the format
//!
//! ```text
//! # comment
//! map http://example.com/ http://info.cern.ch/
//! map http://a.example/ http://b.example/ @plugin=header_rewrite.so
//! regex_map http://(.*)/ http://c.example/
//! ```
//!
//! Only `map` directives are used. Options after the two URLs and other
//! directives (`regex_map`, `.include`, ...) are skipped.
//!
//! The table is built once at startup and read-only afterwards.

use std::borrow::Cow;
use std::path::Path;

use tracing::{debug, info};

use crate::config::{RemapConfig, RemapRuleConfig};
use crate::error::ConfigError;

/// One prefix rewrite
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemapRule {
    pub from: String,
    pub to: String,
}

/// Ordered list of remap rules
#[derive(Debug, Clone, Default)]
pub struct RemapTable {
    rules: Vec<RemapRule>,
}

impl RemapTable {
    /// Table with no rules
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from explicit rules, in order
    #[must_use]
    pub fn new(rules: Vec<RemapRule>) -> Self {
        Self { rules }
    }

    /// Build from the config: inline rules first, then the rules file
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read or has a bad line.
    pub fn from_config(config: &RemapConfig) -> Result<Self, ConfigError> {
        let mut rules: Vec<RemapRule> = config.rules.iter().map(RemapRule::from).collect();
        if let Some(path) = &config.file {
            rules.extend(load_rules_file(path)?.rules);
        }
        info!(rules = rules.len(), "Remap table loaded");
        Ok(Self { rules })
    }

    /// Parse `map <from> <to>` lines
    ///
    /// Blank lines and lines starting with `#` are skipped, as are other
    /// directives and anything after the two URLs of a `map` line.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::RemapRule` for a `map` line with fewer than
    /// two URLs.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut rules = Vec::new();
        for (idx, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let directive = fields.next().unwrap_or_default();
            if directive != "map" {
                debug!(line = idx + 1, directive, "Skipping remap directive");
                continue;
            }
            let (Some(from), Some(to)) = (fields.next(), fields.next()) else {
                return Err(ConfigError::RemapRule {
                    line: idx + 1,
                    reason: format!("expected `map <from> <to>`, got {line:?}"),
                });
            };
            if fields.next().is_some() {
                debug!(line = idx + 1, "Ignoring options after remap URLs");
            }
            rules.push(RemapRule {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        Ok(Self { rules })
    }

    /// Rewrite `url` with the first matching rule
    #[must_use]
    pub fn apply<'a>(&self, url: &'a str) -> Cow<'a, str> {
        for rule in &self.rules {
            if let Some(rest) = url.strip_prefix(rule.from.as_str()) {
                debug!(from = %rule.from, to = %rule.to, "Remap rule matched");
                return Cow::Owned(format!("{}{rest}", rule.to));
            }
        }
        Cow::Borrowed(url)
    }

    /// Rules in match order
    #[must_use]
    pub fn rules(&self) -> &[RemapRule] {
        &self.rules
    }

    /// Number of rules
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// No rules
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl From<&RemapRuleConfig> for RemapRule {
    fn from(cfg: &RemapRuleConfig) -> Self {
        Self {
            from: cfg.from.clone(),
            to: cfg.to.clone(),
        }
    }
}

fn load_rules_file(path: &Path) -> Result<RemapTable, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }
    let text = std::fs::read_to_string(path)?;
    RemapTable::parse(&text)
}
