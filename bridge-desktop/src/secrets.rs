//! Environment-backed Secrets

use async_trait::async_trait;
use bridge_traits::{error::Result, secrets::SecretsResolver};
use std::collections::HashMap;

/// Prefix marking a config value as an environment variable reference.
pub const ENV_PREFIX: &str = "env:";

/// Resolves `env:NAME` references from the process environment.
///
/// Values without the prefix are returned as literals. Tests can seed the
/// resolver with fixed values via [`EnvSecretsResolver::with_values`].
#[derive(Default, Clone)]
pub struct EnvSecretsResolver {
    overrides: HashMap<String, String>,
}

impl std::fmt::Debug for EnvSecretsResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvSecretsResolver")
            .field("overrides", &self.overrides.len())
            .finish()
    }
}

impl EnvSecretsResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_values<I, K, V>(values: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            overrides: values
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    fn lookup(&self, var: &str) -> Option<String> {
        self.overrides
            .get(var)
            .cloned()
            .or_else(|| std::env::var(var).ok())
            .filter(|v| !v.is_empty())
    }
}

#[async_trait]
impl SecretsResolver for EnvSecretsResolver {
    async fn resolve(&self, name: &str) -> Result<Option<String>> {
        match name.strip_prefix(ENV_PREFIX) {
            Some(var) => Ok(self.lookup(var.trim())),
            None if name.is_empty() => Ok(None),
            None => Ok(Some(name.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolves_references_and_literals() {
        let resolver = EnvSecretsResolver::with_values([("TABLEAU_TOKEN", "s3cr3t")]);

        assert_eq!(
            resolver.resolve("env:TABLEAU_TOKEN").await.unwrap().as_deref(),
            Some("s3cr3t")
        );
        assert_eq!(
            resolver.resolve("literal-token").await.unwrap().as_deref(),
            Some("literal-token")
        );
        assert_eq!(resolver.resolve("").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_missing_variable_is_none() {
        let resolver = EnvSecretsResolver::new();
        assert_eq!(
            resolver
                .resolve("env:TABLEAU_BACKUP_SURELY_UNSET_VAR")
                .await
                .unwrap(),
            None
        );
    }
}
