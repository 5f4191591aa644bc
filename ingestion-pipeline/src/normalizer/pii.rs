//! PII scrubbing with a fixed built-in pattern set plus user-supplied
//! patterns. Patterns run in a stable order and substitutions are
//! non-overlapping, so scrubbing is deterministic and idempotent.

use std::collections::BTreeMap;

use regex::Regex;
use tracing::warn;

const REDACTED: &str = "[REDACTED]";

const BUILT_IN: [(&str, &str); 5] = [
    ("email", r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b"),
    (
        "phone",
        r"\b(\+\d{1,2}\s?)?\(?\d{3}\)?[\s.-]?\d{3}[\s.-]?\d{4}\b",
    ),
    ("ssn", r"\b\d{3}-?\d{2}-?\d{4}\b"),
    ("credit_card", r"\b(?:\d{4}[-\s]?){3}\d{4}\b"),
    ("ipv4", r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b"),
];

pub struct PiiScrubber {
    patterns: Vec<(String, Regex)>,
}

impl PiiScrubber {
    /// Built-in patterns first (email, phone, ssn, credit card, IPv4), then
    /// custom patterns in sorted-name order. Invalid custom patterns are
    /// skipped with a warning.
    pub fn new(custom_patterns: &BTreeMap<String, String>) -> Self {
        let mut patterns = Vec::with_capacity(BUILT_IN.len() + custom_patterns.len());
        for (name, pattern) in BUILT_IN {
            match Regex::new(pattern) {
                Ok(regex) => patterns.push((name.to_owned(), regex)),
                Err(err) => warn!(name, error = %err, "built-in PII pattern failed to compile"),
            }
        }
        for (name, pattern) in custom_patterns {
            match Regex::new(pattern) {
                Ok(regex) => patterns.push((name.clone(), regex)),
                Err(err) => warn!(%name, error = %err, "invalid custom PII pattern; skipping"),
            }
        }
        Self { patterns }
    }

    pub fn scrub(&self, text: &str) -> String {
        let mut scrubbed = text.to_owned();
        for (_, pattern) in &self.patterns {
            scrubbed = pattern.replace_all(&scrubbed, REDACTED).into_owned();
        }
        scrubbed
    }
}
