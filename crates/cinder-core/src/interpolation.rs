//! `${{ ... }}` placeholder resolution for step commands and parameters.
//!
//! Supported forms:
//! - `${{ secrets.NAME }}` - resolved from the step's secret bundle
//! - `${{ variables.NAME }}` / `${{ env.NAME }}` - pipeline, job and step variables
//! - `${{ NAME }}` - shorthand for a variable
//!
//! Variables never fall back to the process environment.

use crate::secrets::SecretBundle;
use crate::{Error, Result};
use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{\{\s*([^}]+?)\s*\}\}").expect("placeholder pattern is valid")
});

/// A parsed placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Secret(String),
    Variable(String),
}

impl Reference {
    fn parse(expr: &str) -> Result<Self> {
        let expr = expr.trim();
        if let Some(name) = expr.strip_prefix("secrets.") {
            return Ok(Reference::Secret(name.to_string()));
        }
        if let Some(name) = expr
            .strip_prefix("variables.")
            .or_else(|| expr.strip_prefix("env."))
        {
            return Ok(Reference::Variable(name.to_string()));
        }
        if expr.contains('.') || expr.is_empty() {
            return Err(Error::InvalidPipeline(format!(
                "unsupported placeholder '${{{{ {} }}}}'",
                expr
            )));
        }
        Ok(Reference::Variable(expr.to_string()))
    }
}

/// All placeholders in `input`, in order of appearance.
pub fn references(input: &str) -> Result<Vec<Reference>> {
    PLACEHOLDER
        .captures_iter(input)
        .map(|caps| Reference::parse(caps.get(1).map_or("", |m| m.as_str())))
        .collect()
}

/// Names of the secrets referenced by `input`. Malformed placeholders are ignored.
pub fn secret_names(input: &str) -> Vec<String> {
    PLACEHOLDER
        .captures_iter(input)
        .filter_map(|caps| Reference::parse(caps.get(1)?.as_str()).ok())
        .filter_map(|r| match r {
            Reference::Secret(name) => Some(name),
            Reference::Variable(_) => None,
        })
        .collect()
}

/// Context for placeholder interpolation.
#[derive(Debug, Clone, Default)]
pub struct InterpolationContext<'a> {
    pub variables: HashMap<String, String>,
    pub secrets: Option<&'a SecretBundle>,
}

impl<'a> InterpolationContext<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_secrets(mut self, secrets: &'a SecretBundle) -> Self {
        self.secrets = Some(secrets);
        self
    }

    pub fn with_variables<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.variables
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Interpolate placeholders in `input`.
    ///
    /// Unknown variables resolve to an empty string; unknown secrets are an
    /// error because the step cannot run without them.
    pub fn interpolate(&self, input: &str) -> Result<String> {
        let mut output = String::with_capacity(input.len());
        let mut last = 0;
        for caps in PLACEHOLDER.captures_iter(input) {
            let (Some(whole), Some(expr)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            output.push_str(&input[last..whole.start()]);
            match Reference::parse(expr.as_str())? {
                Reference::Variable(name) => {
                    if let Some(value) = self.variables.get(&name) {
                        output.push_str(value);
                    }
                }
                Reference::Secret(name) => {
                    let value = self
                        .secrets
                        .and_then(|bundle| bundle.get(&name))
                        .ok_or_else(|| Error::SecretNotFound(name.clone()))?;
                    output.push_str(value.expose());
                }
            }
            last = whole.end();
        }
        output.push_str(&input[last..]);
        Ok(output)
    }
}
