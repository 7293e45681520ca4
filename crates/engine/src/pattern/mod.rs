//! Pattern store: validated, cached access to pattern definitions.
//!
//! Definitions come from a [`PatternSource`]. Each one is validated once, then cached under its
//! `(id, version)` key and handed out as a shared `Arc`. The cache never expires on its own;
//! [`PatternStore::invalidate`] and [`PatternStore::reload_all`] are the only ways to refresh it.

mod source;
mod validation;

use std::{collections::HashMap, sync::Arc};

use meridian_types::{PatternDefinition, PatternKey};
use tokio::sync::RwLock;
use tracing::{debug, info};

pub use source::{DirectoryPatternSource, InMemoryPatternSource, PatternSource, compare_versions, read_definition};
pub use validation::validate_pattern;

use crate::error::EngineError;

#[derive(Debug, Default)]
struct Cache {
    definitions: HashMap<PatternKey, Arc<PatternDefinition>>,
    /// Version served when a caller does not ask for one.
    latest: HashMap<String, PatternKey>,
}

/// Outcome of validating one pattern during [`PatternStore::reload_all`].
#[derive(Debug)]
pub struct ReloadOutcome {
    pub pattern_id: String,
    pub result: Result<PatternKey, EngineError>,
}

pub struct PatternStore {
    source: Arc<dyn PatternSource>,
    cache: RwLock<Cache>,
}

impl PatternStore {
    pub fn new(source: Arc<dyn PatternSource>) -> Self {
        Self {
            source,
            cache: RwLock::new(Cache::default()),
        }
    }

    /// Loads the latest version of `pattern_id`.
    pub async fn load(&self, pattern_id: &str) -> Result<Arc<PatternDefinition>, EngineError> {
        {
            let cache = self.cache.read().await;
            if let Some(definition) = cache.latest.get(pattern_id).and_then(|key| cache.definitions.get(key)) {
                return Ok(Arc::clone(definition));
            }
        }
        self.fetch_and_cache(pattern_id, None).await
    }

    /// Loads a specific version of `pattern_id`.
    pub async fn load_version(&self, pattern_id: &str, version: &str) -> Result<Arc<PatternDefinition>, EngineError> {
        let key = PatternKey::new(pattern_id, version);
        if let Some(definition) = self.cache.read().await.definitions.get(&key) {
            return Ok(Arc::clone(definition));
        }
        self.fetch_and_cache(pattern_id, Some(version)).await
    }

    /// Pattern ids available from the source.
    pub async fn list(&self) -> Result<Vec<String>, EngineError> {
        self.source.list().await
    }

    /// Drops every cached version of `pattern_id`. Returns the number of entries removed.
    pub async fn invalidate(&self, pattern_id: &str) -> usize {
        let mut cache = self.cache.write().await;
        cache.latest.remove(pattern_id);
        let before = cache.definitions.len();
        cache.definitions.retain(|key, _| key.id != pattern_id);
        let removed = before - cache.definitions.len();
        debug!(pattern = %pattern_id, removed, "pattern cache invalidated");
        removed
    }

    /// Clears the cache and reloads every pattern the source lists, reporting each outcome.
    pub async fn reload_all(&self) -> Result<Vec<ReloadOutcome>, EngineError> {
        let pattern_ids = self.source.list().await?;
        *self.cache.write().await = Cache::default();

        let mut outcomes = Vec::with_capacity(pattern_ids.len());
        for pattern_id in pattern_ids {
            let result = self.load(&pattern_id).await.map(|definition| definition.key());
            outcomes.push(ReloadOutcome { pattern_id, result });
        }
        let loaded = outcomes.iter().filter(|outcome| outcome.result.is_ok()).count();
        info!(loaded, total = outcomes.len(), "pattern store reloaded");
        Ok(outcomes)
    }

    async fn fetch_and_cache(&self, pattern_id: &str, version: Option<&str>) -> Result<Arc<PatternDefinition>, EngineError> {
        let definition = self
            .source
            .fetch(pattern_id, version)
            .await?
            .ok_or_else(|| EngineError::pattern_not_found(pattern_id, version.map(str::to_string)))?;

        let violations = validate_pattern(&definition);
        if !violations.is_empty() {
            return Err(EngineError::pattern_invalid(pattern_id, violations.join("; ")));
        }

        let key = definition.key();
        let definition = Arc::new(definition);
        let mut cache = self.cache.write().await;
        // Another task may have cached the same key while this one was fetching.
        let cached = Arc::clone(cache.definitions.entry(key.clone()).or_insert(definition));
        if version.is_none() {
            cache.latest.insert(pattern_id.to_string(), key.clone());
        }
        debug!(pattern = %key, "pattern cached");
        Ok(cached)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;

    const OVERVIEW: &str = r#"
id: portfolio_overview
version: 3
steps:
  - capability: ledger.positions
    as: positions
outputs: [positions]
"#;

    struct CountingSource {
        inner: InMemoryPatternSource,
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl PatternSource for CountingSource {
        async fn fetch(&self, pattern_id: &str, version: Option<&str>) -> Result<Option<PatternDefinition>, EngineError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.inner.fetch(pattern_id, version).await
        }

        async fn list(&self) -> Result<Vec<String>, EngineError> {
            self.inner.list().await
        }
    }

    fn counting_store() -> (Arc<CountingSource>, PatternStore) {
        let definition: PatternDefinition = serde_yaml::from_str(OVERVIEW).expect("yaml");
        let source = Arc::new(CountingSource {
            inner: InMemoryPatternSource::with_definitions([definition]),
            fetches: AtomicUsize::new(0),
        });
        let store = PatternStore::new(source.clone());
        (source, store)
    }

    #[tokio::test]
    async fn repeated_loads_return_cached_arc() {
        let (source, store) = counting_store();
        let first = store.load("portfolio_overview").await.expect("load");
        let second = store.load("portfolio_overview").await.expect("load again");
        let pinned = store.load_version("portfolio_overview", "3").await.expect("pinned");

        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, &pinned));
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_refetch() {
        let (source, store) = counting_store();
        store.load("portfolio_overview").await.expect("load");
        assert_eq!(store.invalidate("portfolio_overview").await, 1);
        store.load("portfolio_overview").await.expect("reload");
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn unknown_pattern_and_version_are_not_found() {
        let (_, store) = counting_store();
        let missing = store.load("tax_lot_report").await.expect_err("missing pattern");
        assert!(matches!(missing, EngineError::PatternNotFound { ref pattern_id, version: None } if pattern_id == "tax_lot_report"));

        let wrong_version = store.load_version("portfolio_overview", "9").await.expect_err("missing version");
        assert!(matches!(wrong_version, EngineError::PatternNotFound { version: Some(ref version), .. } if version == "9"));
    }

    #[tokio::test]
    async fn invalid_definitions_are_rejected_and_not_cached() {
        let source = Arc::new(InMemoryPatternSource::new());
        source.insert(serde_yaml::from_str("id: hollow\nsteps: []\n").expect("yaml"));
        let store = PatternStore::new(source.clone());

        let error = store.load("hollow").await.expect_err("invalid");
        assert_eq!(error.code(), "PATTERN_INVALID");

        let outcomes = store.reload_all().await.expect("reload");
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].result.is_err());
    }
}
