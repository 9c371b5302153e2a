//! Backend alias resolution.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::{Backend, SmtpBackend};
use crate::error::{ConfigError, Error};
use crate::store::Repository;

/// Alias used when a message does not name one.
pub const DEFAULT_ALIAS: &str = "default";

/// Named backends. The default alias falls back to the single active
/// outbox configuration when nothing is registered under it.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: register a backend under `alias`.
    pub fn with_backend(mut self, alias: impl Into<String>, backend: Arc<dyn Backend>) -> Self {
        self.register(alias, backend);
        self
    }

    pub fn register(&mut self, alias: impl Into<String>, backend: Arc<dyn Backend>) {
        self.backends.insert(alias.into(), backend);
    }

    /// Whether `alias` can be resolved without consulting outboxes.
    pub fn is_registered(&self, alias: &str) -> bool {
        self.backends.contains_key(normalize(alias))
    }

    /// Whether messages may name this alias. The default alias is always
    /// accepted; whether it resolves is decided at send time.
    pub fn accepts(&self, alias: &str) -> bool {
        normalize(alias) == DEFAULT_ALIAS || self.is_registered(alias)
    }

    pub fn aliases(&self) -> Vec<&str> {
        let mut aliases: Vec<&str> = self.backends.keys().map(String::as_str).collect();
        aliases.sort_unstable();
        aliases
    }

    /// Resolve an alias to a backend.
    ///
    /// An empty or `default` alias with nothing registered under it needs
    /// exactly one active outbox configuration; zero or several is a
    /// configuration error.
    pub async fn resolve(&self, alias: &str, repo: &dyn Repository) -> Result<Arc<dyn Backend>, Error> {
        let alias = normalize(alias);
        if let Some(backend) = self.backends.get(alias) {
            return Ok(Arc::clone(backend));
        }
        if alias != DEFAULT_ALIAS {
            return Err(ConfigError::UnknownBackend {
                alias: alias.to_string(),
            }
            .into());
        }

        let mut active = repo.active_outboxes().await?;
        if active.len() != 1 {
            return Err(ConfigError::ActiveOutbox { count: active.len() }.into());
        }
        let outbox = active.remove(0);
        debug!(outbox = %outbox, "Resolved default backend from active outbox");
        Ok(Arc::new(SmtpBackend::new(DEFAULT_ALIAS, outbox)?))
    }
}

fn normalize(alias: &str) -> &str {
    let alias = alias.trim();
    if alias.is_empty() { DEFAULT_ALIAS } else { alias }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OutboxConfiguration;
    use crate::store::LibSqlRepository;
    use crate::transport::LocmemBackend;

    #[tokio::test]
    async fn registered_alias_wins() {
        let repo = LibSqlRepository::new_memory().await.unwrap();
        let registry = BackendRegistry::new().with_backend("bulk", Arc::new(LocmemBackend::new()));
        assert_eq!(registry.resolve("bulk", &repo).await.unwrap().name(), "locmem");
        assert!(registry.accepts(""));
        assert!(!registry.accepts("missing"));
    }

    #[tokio::test]
    async fn unknown_alias_is_a_config_error() {
        let repo = LibSqlRepository::new_memory().await.unwrap();
        let err = BackendRegistry::new().resolve("nope", &repo).await.err().unwrap();
        assert_eq!(err.kind(), "UnknownBackend");
    }

    #[tokio::test]
    async fn default_requires_exactly_one_active_outbox() {
        let repo = LibSqlRepository::new_memory().await.unwrap();
        let registry = BackendRegistry::new();

        let err = registry.resolve("", &repo).await.err().unwrap();
        assert!(matches!(err, Error::Config(ConfigError::ActiveOutbox { count: 0 })));

        repo.save_outbox(&OutboxConfiguration::new("main", "smtp.example.com", "u", "p").active())
            .await
            .unwrap();
        let backend = registry.resolve("", &repo).await.unwrap();
        assert_eq!(backend.name(), DEFAULT_ALIAS);
    }
}
