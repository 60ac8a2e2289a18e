//! Stage configuration blocks.
//!
//! A [`ConfigBlock`] is an ordered map of keys to [`ConfigValue`]s. Keys may
//! be nested with `:` (for example `detector:threshold`); a pipeline stores
//! each node's parameters under a sub-block named after the node.

use crate::error::{Error, Result};
use std::collections::BTreeMap;
use std::fmt;

/// Separator between a sub-block name and the keys inside it.
pub const BLOCK_SEPARATOR: char = ':';

/// A single configuration value.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigValue {
    /// A string value.
    String(String),
    /// An integer value.
    Integer(i64),
    /// A floating-point value.
    Float(f64),
    /// A boolean value.
    Bool(bool),
}

impl ConfigValue {
    /// Infer a typed value from raw text (`true`, `42`, `0.5`, anything else
    /// becomes a string).
    pub fn infer(raw: &str) -> Self {
        let trimmed = raw.trim();
        match trimmed {
            "true" => return ConfigValue::Bool(true),
            "false" => return ConfigValue::Bool(false),
            _ => {}
        }
        if let Ok(i) = trimmed.parse::<i64>() {
            return ConfigValue::Integer(i);
        }
        if let Ok(f) = trimmed.parse::<f64>() {
            return ConfigValue::Float(f);
        }
        ConfigValue::String(trimmed.to_string())
    }

    /// Get as a string, converting if necessary.
    pub fn as_string(&self) -> String {
        match self {
            ConfigValue::String(s) => s.clone(),
            ConfigValue::Integer(i) => i.to_string(),
            ConfigValue::Float(f) => f.to_string(),
            ConfigValue::Bool(b) => b.to_string(),
        }
    }

    /// Try to get as an integer.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ConfigValue::Integer(i) => Some(*i),
            ConfigValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Try to get as a u64.
    pub fn as_u64(&self) -> Option<u64> {
        self.as_i64().and_then(|i| u64::try_from(i).ok())
    }

    /// Try to get as a float.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ConfigValue::Float(f) => Some(*f),
            ConfigValue::Integer(i) => Some(*i as f64),
            ConfigValue::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Try to get as a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigValue::Bool(b) => Some(*b),
            ConfigValue::String(s) => match s.to_lowercase().as_str() {
                "true" | "yes" | "1" => Some(true),
                "false" | "no" | "0" => Some(false),
                _ => None,
            },
            ConfigValue::Integer(i) => Some(*i != 0),
            _ => None,
        }
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_string())
    }
}

impl From<&str> for ConfigValue {
    fn from(v: &str) -> Self {
        ConfigValue::String(v.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(v: String) -> Self {
        ConfigValue::String(v)
    }
}

impl From<i64> for ConfigValue {
    fn from(v: i64) -> Self {
        ConfigValue::Integer(v)
    }
}

impl From<i32> for ConfigValue {
    fn from(v: i32) -> Self {
        ConfigValue::Integer(i64::from(v))
    }
}

impl From<u32> for ConfigValue {
    fn from(v: u32) -> Self {
        ConfigValue::Integer(i64::from(v))
    }
}

impl From<f64> for ConfigValue {
    fn from(v: f64) -> Self {
        ConfigValue::Float(v)
    }
}

impl From<bool> for ConfigValue {
    fn from(v: bool) -> Self {
        ConfigValue::Bool(v)
    }
}

/// An ordered collection of configuration entries.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigBlock {
    entries: BTreeMap<String, ConfigValue>,
}

impl ConfigBlock {
    /// Create an empty block.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style [`ConfigBlock::set`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<ConfigValue>) -> Self {
        self.set(key, value);
        self
    }

    /// Set a value, replacing any previous one.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<ConfigValue>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Set a value from raw text, inferring its type.
    pub fn set_raw(&mut self, key: impl Into<String>, raw: &str) {
        self.entries.insert(key.into(), ConfigValue::infer(raw));
    }

    /// Look up a value.
    pub fn get(&self, key: &str) -> Option<&ConfigValue> {
        self.entries.get(key)
    }

    /// Whether the key is present.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Remove a value.
    pub fn remove(&mut self, key: &str) -> Option<ConfigValue> {
        self.entries.remove(key)
    }

    /// Get a string value or report a configuration error.
    pub fn require_string(&self, key: &str) -> Result<String> {
        self.get(key)
            .map(ConfigValue::as_string)
            .ok_or_else(|| Error::Config(format!("missing key '{key}'")))
    }

    /// Get an integer value or report a configuration error.
    pub fn require_i64(&self, key: &str) -> Result<i64> {
        self.typed(key, "an integer", ConfigValue::as_i64)
    }

    /// Get an unsigned value or report a configuration error.
    pub fn require_u64(&self, key: &str) -> Result<u64> {
        self.typed(key, "an unsigned integer", ConfigValue::as_u64)
    }

    /// Get a float value or report a configuration error.
    pub fn require_f64(&self, key: &str) -> Result<f64> {
        self.typed(key, "a number", ConfigValue::as_f64)
    }

    /// Get a boolean value or report a configuration error.
    pub fn require_bool(&self, key: &str) -> Result<bool> {
        self.typed(key, "a boolean", ConfigValue::as_bool)
    }

    fn typed<T>(
        &self,
        key: &str,
        expected: &str,
        convert: impl Fn(&ConfigValue) -> Option<T>,
    ) -> Result<T> {
        let value = self
            .get(key)
            .ok_or_else(|| Error::Config(format!("missing key '{key}'")))?;
        convert(value)
            .ok_or_else(|| Error::Config(format!("key '{key}' is not {expected}: '{value}'")))
    }

    /// Extract the entries under `prefix:` with the prefix stripped.
    pub fn subblock(&self, prefix: &str) -> ConfigBlock {
        let lead = format!("{prefix}{BLOCK_SEPARATOR}");
        let entries = self
            .entries
            .iter()
            .filter_map(|(k, v)| k.strip_prefix(&lead).map(|rest| (rest.to_string(), v.clone())))
            .collect();
        ConfigBlock { entries }
    }

    /// Insert every entry of `block` under `prefix:`.
    pub fn add_subblock(&mut self, block: &ConfigBlock, prefix: &str) {
        for (k, v) in &block.entries {
            self.entries
                .insert(format!("{prefix}{BLOCK_SEPARATOR}{k}"), v.clone());
        }
    }

    /// Copy every entry of `other` into this block, overwriting duplicates.
    pub fn merge(&mut self, other: &ConfigBlock) {
        for (k, v) in &other.entries {
            self.entries.insert(k.clone(), v.clone());
        }
    }

    /// Iterate entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &ConfigValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the block is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for ConfigBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (k, v) in &self.entries {
            writeln!(f, "{k} = {v}")?;
        }
        Ok(())
    }
}
