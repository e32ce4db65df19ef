//! `key=value` client properties, the option map handed to the broker client.
//!
//! The format is minimal: one pair per line, split on the first `=`,
//! both sides trimmed. There is no quoting, escaping or comment syntax; any line
//! that does not yield a non-empty key and a non-empty value is skipped.

use crate::error::ConfigError;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Configuration {
    entries: BTreeMap<String, String>,
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Inserts or overwrites a single option.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Configuration {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut config = Configuration::new();
        for (k, v) in iter {
            config.insert(k, v);
        }
        config
    }
}

/// Reads and parses a properties file.
pub fn load<P: AsRef<Path>>(path: P) -> Result<Configuration, ConfigError> {
    let raw = fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.as_ref().to_path_buf(),
        source,
    })?;
    let config = parse(&raw);
    tracing::debug!(path = ?path.as_ref(), options = config.len(), "loaded client properties");
    Ok(config)
}

pub fn parse(raw: &str) -> Configuration {
    raw.split('\n').filter_map(parse_line).collect()
}

fn parse_line(line: &str) -> Option<(&str, &str)> {
    let (key, value) = line.split_once('=')?;
    let (key, value) = (key.trim(), value.trim());
    if key.is_empty() || value.is_empty() {
        return None;
    }
    Some((key, value))
}
