//! Secret value types.
//!
//! Secret material is only reachable through [`SecretValue::expose`]; every
//! formatting path prints a redaction marker instead.

use std::collections::BTreeMap;
use std::fmt;

pub const REDACTED: &str = "***";

/// Single-character values are not masked; every other non-empty value is.
const MIN_MASK_LEN: usize = 2;

#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue {
    value: String,
    version: Option<String>,
}

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            version: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn expose(&self) -> &str {
        &self.value
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretValue")
            .field("value", &REDACTED)
            .field("version", &self.version)
            .finish()
    }
}

impl fmt::Display for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

/// The secrets resolved for one step dispatch.
#[derive(Debug, Clone, Default)]
pub struct SecretBundle {
    values: BTreeMap<String, SecretValue>,
}

impl SecretBundle {
    pub fn insert(&mut self, name: impl Into<String>, value: SecretValue) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&SecretValue> {
        self.values.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &SecretValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn masker(&self) -> SecretMasker {
        SecretMasker::new(self.values.values().map(|v| v.expose().to_string()))
    }
}

/// Replaces known secret values in text with [`REDACTED`].
///
/// Output is masked line by line, so a multi-line value is also registered
/// line by line.
#[derive(Debug, Clone, Default)]
pub struct SecretMasker {
    // Longest first so that a secret containing another is masked whole.
    values: Vec<String>,
}

impl SecretMasker {
    pub fn new(values: impl IntoIterator<Item = String>) -> Self {
        let mut values: Vec<String> = values
            .into_iter()
            .flat_map(|value| {
                let mut entries: Vec<String> = value
                    .lines()
                    .map(|line| line.trim())
                    .filter(|line| !line.is_empty())
                    .map(str::to_string)
                    .collect();
                entries.push(value);
                entries
            })
            .filter(|v| v.len() >= MIN_MASK_LEN)
            .collect();
        values.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        values.dedup();
        Self { values }
    }

    pub fn mask(&self, input: &str) -> String {
        let mut output = input.to_string();
        for value in &self.values {
            if output.contains(value.as_str()) {
                output = output.replace(value.as_str(), REDACTED);
            }
        }
        output
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}
