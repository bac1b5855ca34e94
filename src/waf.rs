//! Two-tier request filter
//!
//! A rule document has a `low` and a `high` tier, each with `allow` and
//! `disallow` pattern lists for the URL path, User-Agent and body. A field is
//! denied when it matches a low disallow pattern that no high allow pattern
//! rescues, or when low allow patterns exist and none of them matches.
//!
//! Patterns are compiled case-insensitively, so `bot` matches `EvilBot/1.0`.
//!
//! The override only runs one way: `high.allow` can lift a `low.disallow`
//! match, but nothing lifts in the other direction and `high.disallow` is not
//! consulted at all.

use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("failed to read rules file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse rules document: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid pattern '{pattern}': {source}")]
    Pattern {
        pattern: String,
        source: regex::Error,
    },
}

/// Raw rule document as written on disk
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuleDocument {
    pub low: RuleTier,
    pub high: RuleTier,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuleTier {
    pub allow: FieldPatterns,
    pub disallow: FieldPatterns,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FieldPatterns {
    pub agent: Vec<String>,
    pub body: Vec<String>,
    pub url: Vec<String>,
}

impl FieldPatterns {
    fn is_empty(&self) -> bool {
        self.agent.is_empty() && self.body.is_empty() && self.url.is_empty()
    }
}

impl RuleDocument {
    pub fn from_yaml(text: &str) -> Result<Self, RuleError> {
        Ok(serde_yaml::from_str(text)?)
    }
}

/// Which request field a verdict refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Url,
    Agent,
    Body,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Field::Url => "url",
            Field::Agent => "user-agent",
            Field::Body => "body",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny(String),
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allow)
    }
}

/// Compiled patterns for one field
#[derive(Debug, Default)]
struct FieldRules {
    low_allow: Vec<Regex>,
    low_disallow: Vec<Regex>,
    high_allow: Vec<Regex>,
}

impl FieldRules {
    fn compile(
        low_allow: &[String],
        low_disallow: &[String],
        high_allow: &[String],
    ) -> Result<Self, RuleError> {
        Ok(Self {
            low_allow: compile_all(low_allow)?,
            low_disallow: compile_all(low_disallow)?,
            high_allow: compile_all(high_allow)?,
        })
    }

    fn evaluate(&self, value: &str) -> Verdict {
        evaluate_field(value, &self.low_allow, &self.low_disallow, &self.high_allow)
    }
}

fn compile_all(patterns: &[String]) -> Result<Vec<Regex>, RuleError> {
    patterns.iter().map(|p| compile_pattern(p)).collect()
}

/// Compile a single rule pattern the way the engine does
pub fn compile_pattern(pattern: &str) -> Result<Regex, RuleError> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|source| RuleError::Pattern {
            pattern: pattern.to_string(),
            source,
        })
}

/// Classify one field value.
///
/// The first matching `low_disallow` pattern decides: the field is allowed if
/// any `high_allow` pattern also matches, denied otherwise. Without a disallow
/// match, a non-empty `low_allow` list must contain a match. Matching is an
/// unanchored search.
pub fn evaluate_field(
    value: &str,
    low_allow: &[Regex],
    low_disallow: &[Regex],
    high_allow: &[Regex],
) -> Verdict {
    if let Some(rule) = low_disallow.iter().find(|r| r.is_match(value)) {
        if high_allow.iter().any(|r| r.is_match(value)) {
            return Verdict::Allow;
        }
        return Verdict::Deny(format!("matches disallowed rule: {}", rule.as_str()));
    }

    if !low_allow.is_empty() && !low_allow.iter().any(|r| r.is_match(value)) {
        return Verdict::Deny("does not match any allowed rule".to_string());
    }

    Verdict::Allow
}

/// A rule document with every pattern compiled; shared read-only across requests
#[derive(Debug)]
pub struct RuleEngine {
    url: FieldRules,
    agent: FieldRules,
    body: FieldRules,
}

impl RuleEngine {
    /// Read and compile the rules file at `path`
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, RuleError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| RuleError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::new(&RuleDocument::from_yaml(&text)?)
    }

    pub fn new(doc: &RuleDocument) -> Result<Self, RuleError> {
        if !doc.high.disallow.is_empty() {
            warn!("high.disallow rules are ignored; only high.allow overrides low.disallow");
        }

        let (low, high) = (&doc.low, &doc.high);
        Ok(Self {
            url: FieldRules::compile(&low.allow.url, &low.disallow.url, &high.allow.url)?,
            agent: FieldRules::compile(&low.allow.agent, &low.disallow.agent, &high.allow.agent)?,
            body: FieldRules::compile(&low.allow.body, &low.disallow.body, &high.allow.body)?,
        })
    }

    pub fn evaluate(&self, field: Field, value: &str) -> Verdict {
        match field {
            Field::Url => self.url.evaluate(value),
            Field::Agent => self.agent.evaluate(value),
            Field::Body => self.body.evaluate(value),
        }
    }

    /// Check URL path, then User-Agent, then body; the first denial wins
    pub fn check_request(&self, path: &str, user_agent: &str, body: &str) -> Verdict {
        let fields = [(Field::Url, path), (Field::Agent, user_agent), (Field::Body, body)];
        for (field, value) in fields {
            let verdict = self.evaluate(field, value);
            if let Verdict::Deny(reason) = &verdict {
                debug!("{} rejected: {}", field, reason);
                return verdict;
            }
        }
        Verdict::Allow
    }
}
