//! # External Secrets
//!
//! Resolution of opaque secret references into material, and the stable
//! digest used as the drift key on deployed stacks. The real secret
//! managers live behind the [`SecretResolver`] trait; the daemon ships an
//! environment-backed resolver and a disabled one.

use std::collections::BTreeMap;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::errors::JobError;

/// Resolved secret material, keyed by the env-name the stack will see.
/// Material is wiped from memory on drop.
#[derive(Debug, Default)]
pub struct ResolvedSecrets {
    values: BTreeMap<String, String>,
}

impl Drop for ResolvedSecrets {
    fn drop(&mut self) {
        for (mut key, mut value) in std::mem::take(&mut self.values) {
            key.zeroize();
            value.zeroize();
        }
    }
}

impl ResolvedSecrets {
    pub fn new(values: BTreeMap<String, String>) -> Self {
        Self { values }
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.values.iter()
    }

    /// Stable digest over the sorted `(name, material)` pairs.
    ///
    /// Each entry is length-prefixed so `{a: "b", c: "d"}` and
    /// `{a: "bc", c: "d"}` cannot collide. Empty material yields the empty
    /// string, the "no secrets" drift key.
    pub fn hash(&self) -> String {
        if self.values.is_empty() {
            return String::new();
        }
        let mut hasher = Sha256::new();
        for (key, value) in &self.values {
            hasher.update((key.len() as u64).to_le_bytes());
            hasher.update(key.as_bytes());
            hasher.update((value.len() as u64).to_le_bytes());
            hasher.update(value.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// Resolves opaque references to secret material.
#[async_trait]
pub trait SecretResolver: Send + Sync {
    /// Resolve `refs` (env-name -> opaque reference) to material.
    async fn resolve(
        &self,
        refs: &BTreeMap<String, String>,
    ) -> Result<ResolvedSecrets, JobError>;

    /// Free provider resources. Default: nothing to free.
    async fn close(&self) {}
}

/// Used when no provider is configured: every resolution yields an empty
/// map and the zero hash, so stacks that declare no external secrets work
/// unchanged.
#[derive(Debug, Default)]
pub struct NoopResolver;

#[async_trait]
impl SecretResolver for NoopResolver {
    async fn resolve(
        &self,
        _refs: &BTreeMap<String, String>,
    ) -> Result<ResolvedSecrets, JobError> {
        Ok(ResolvedSecrets::default())
    }
}

/// Resolves references against the daemon's own environment. References may
/// be bare variable names or `env://NAME`.
#[derive(Debug, Default)]
pub struct EnvResolver;

#[async_trait]
impl SecretResolver for EnvResolver {
    async fn resolve(
        &self,
        refs: &BTreeMap<String, String>,
    ) -> Result<ResolvedSecrets, JobError> {
        let mut values = BTreeMap::new();
        for (name, reference) in refs {
            let variable = reference.strip_prefix("env://").unwrap_or(reference);
            let material = std::env::var(variable).map_err(|_| {
                JobError::SecretsResolutionFailed(format!(
                    "environment variable '{variable}' for secret '{name}' is not set"
                ))
            })?;
            values.insert(name.clone(), material);
        }
        Ok(ResolvedSecrets::new(values))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secrets(pairs: &[(&str, &str)]) -> ResolvedSecrets {
        ResolvedSecrets::new(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_hash_is_stable_and_order_independent() {
        let a = secrets(&[("DB_PASSWORD", "hunter2"), ("API_KEY", "abc")]);
        let b = secrets(&[("API_KEY", "abc"), ("DB_PASSWORD", "hunter2")]);
        assert_eq!(a.hash(), b.hash());
        assert_eq!(a.hash().len(), 64);
    }

    #[test]
    fn test_hash_length_prefix_prevents_collisions() {
        // Without length prefixes these two would concatenate identically
        let a = secrets(&[("a", "b"), ("c", "d")]);
        let b = secrets(&[("a", "bc"), ("c", "d")]);
        assert_ne!(a.hash(), b.hash());
    }

    #[test]
    fn test_empty_secrets_zero_hash() {
        assert_eq!(ResolvedSecrets::default().hash(), "");
    }

    #[test]
    fn test_material_change_changes_hash() {
        let a = secrets(&[("DB_PASSWORD", "hunter2")]);
        let b = secrets(&[("DB_PASSWORD", "hunter3")]);
        assert_ne!(a.hash(), b.hash());
    }

    #[tokio::test]
    async fn test_noop_resolver_returns_empty() {
        let refs: BTreeMap<String, String> =
            [("X".to_string(), "whatever".to_string())].into();
        let resolved = NoopResolver.resolve(&refs).await.unwrap();
        assert!(resolved.is_empty());
        assert_eq!(resolved.hash(), "");
    }

    #[tokio::test]
    async fn test_env_resolver_resolves_and_fails_on_missing() {
        std::env::set_var("DOCO_CD_TEST_SECRET", "material");
        let refs: BTreeMap<String, String> = [(
            "DB_PASSWORD".to_string(),
            "env://DOCO_CD_TEST_SECRET".to_string(),
        )]
        .into();
        let resolved = EnvResolver.resolve(&refs).await.unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(
            resolved.iter().next().map(|(k, v)| (k.as_str(), v.as_str())),
            Some(("DB_PASSWORD", "material"))
        );
        std::env::remove_var("DOCO_CD_TEST_SECRET");

        let missing: BTreeMap<String, String> = [(
            "DB_PASSWORD".to_string(),
            "env://DOCO_CD_TEST_MISSING".to_string(),
        )]
        .into();
        let result = EnvResolver.resolve(&missing).await;
        assert!(matches!(
            result,
            Err(JobError::SecretsResolutionFailed(_))
        ));
    }
}
