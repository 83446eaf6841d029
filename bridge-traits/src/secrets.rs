//! Secrets Resolver Abstraction

use async_trait::async_trait;

use crate::error::Result;

/// Resolves named credentials (API tokens, access keys).
///
/// # Security
///
/// Implementations must not log resolved values.
#[async_trait]
pub trait SecretsResolver: Send + Sync {
    /// Look up a secret by name. `Ok(None)` when it is not configured.
    async fn resolve(&self, name: &str) -> Result<Option<String>>;
}
