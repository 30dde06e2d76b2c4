//! Environment and file secret providers.

use async_trait::async_trait;
use cinder_core::ports::SecretProvider;
use cinder_core::secrets::SecretValue;
use cinder_core::{Error, Result};
use std::collections::HashMap;
use std::path::Path;
use tracing::debug;

pub const DEFAULT_ENV_PREFIX: &str = "CINDER_SECRET_";

/// Reads `<prefix><NAME>` from the engine's own environment.
///
/// This is the only place the process environment is consulted for
/// credentials; steps never inherit it.
pub struct EnvProvider {
    prefix: String,
}

impl EnvProvider {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn resolve_name(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    /// Secret names currently visible through the prefix.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = std::env::vars()
            .filter_map(|(k, _)| k.strip_prefix(&self.prefix).map(str::to_string))
            .filter(|k| !k.is_empty())
            .collect();
        names.sort();
        names
    }
}

impl Default for EnvProvider {
    fn default() -> Self {
        Self::new(DEFAULT_ENV_PREFIX)
    }
}

#[async_trait]
impl SecretProvider for EnvProvider {
    fn name(&self) -> &str {
        "env"
    }

    async fn get(&self, name: &str) -> Result<Option<SecretValue>> {
        Ok(std::env::var(self.resolve_name(name))
            .ok()
            .map(SecretValue::new))
    }
}

/// Secrets loaded from a dotenv or JSON file.
#[derive(Default)]
pub struct FileProvider {
    secrets: HashMap<String, String>,
}

impl FileProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(secrets: HashMap<String, String>) -> Self {
        Self { secrets }
    }

    /// Load a secrets file. `.json` files, or files whose content starts
    /// with `{`, are read as a flat JSON object; anything else as dotenv.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::SecretProviderNotConfigured(format!(
                "cannot read secrets file {}: {}",
                path.display(),
                e
            ))
        })?;

        let is_json = path.extension().is_some_and(|ext| ext == "json")
            || content.trim_start().starts_with('{');
        let secrets = if is_json {
            serde_json::from_str::<HashMap<String, String>>(&content).map_err(|e| {
                Error::SecretProviderNotConfigured(format!(
                    "invalid secrets file {}: {}",
                    path.display(),
                    e
                ))
            })?
        } else {
            parse_dotenv(path)?
        };

        debug!(path = %path.display(), count = secrets.len(), "loaded secrets file");
        Ok(Self { secrets })
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.secrets.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }
}

fn parse_dotenv(path: &Path) -> Result<HashMap<String, String>> {
    let invalid = |e: dotenvy::Error| {
        Error::SecretProviderNotConfigured(format!(
            "invalid secrets file {}: {}",
            path.display(),
            e
        ))
    };
    let mut secrets = HashMap::new();
    for item in dotenvy::from_path_iter(path).map_err(invalid)? {
        let (key, value) = item.map_err(invalid)?;
        secrets.insert(key, value);
    }
    Ok(secrets)
}

#[async_trait]
impl SecretProvider for FileProvider {
    fn name(&self) -> &str {
        "file"
    }

    async fn get(&self, name: &str) -> Result<Option<SecretValue>> {
        Ok(self.secrets.get(name).cloned().map(SecretValue::new))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_env_provider_uses_prefix() {
        // SAFETY: the variable name is unique to this test.
        unsafe { std::env::set_var("CINDER_TEST_ENVP_DEPLOY_KEY", "secret_value") };
        let provider = EnvProvider::new("CINDER_TEST_ENVP_");

        let value = provider.get("DEPLOY_KEY").await.unwrap().unwrap();
        assert_eq!(value.expose(), "secret_value");
        assert!(provider.get("CINDER_TEST_ENVP_DEPLOY_KEY").await.unwrap().is_none());
        assert!(provider.names().contains(&"DEPLOY_KEY".to_string()));
    }

    #[tokio::test]
    async fn test_file_provider_dotenv() {
        let mut file = tempfile::Builder::new().suffix(".env").tempfile().unwrap();
        writeln!(file, "# deploy credentials").unwrap();
        writeln!(file, "AWS_ACCESS_KEY_ID=AKIAEXAMPLE").unwrap();
        writeln!(file, "SONAR_TOKEN=\"squ_abc123\"").unwrap();

        let provider = FileProvider::load(file.path()).unwrap();
        assert_eq!(provider.names(), vec!["AWS_ACCESS_KEY_ID", "SONAR_TOKEN"]);
        let token = provider.get("SONAR_TOKEN").await.unwrap().unwrap();
        assert_eq!(token.expose(), "squ_abc123");
    }

    #[tokio::test]
    async fn test_file_provider_json() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, r#"{{"DB_PASSWORD": "hunter22"}}"#).unwrap();

        let provider = FileProvider::load(file.path()).unwrap();
        let value = provider.get("DB_PASSWORD").await.unwrap().unwrap();
        assert_eq!(value.expose(), "hunter22");
        assert!(provider.get("MISSING").await.unwrap().is_none());
    }

    #[test]
    fn test_missing_file() {
        let err = FileProvider::load(Path::new("/nonexistent/secrets.env")).err().unwrap();
        assert!(matches!(err, Error::SecretProviderNotConfigured(_)));
    }
}
