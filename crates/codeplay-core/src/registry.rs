//! Lazily loaded, bounded cache of language engines.
//!
//! Engines are created on first use through their factory and kept until
//! they are evicted for capacity (least recently used first) or for being idle
//! too long. Concurrent requests for a language that is still loading await
//! the same in-flight load instead of starting their own, so an engine is
//! initialized once no matter how many callers arrive during a cold start.

use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::config::{CodeplayConfig, RegistryConfig};
use crate::core_types::Language;
use crate::engines::{factory_for, Engine, EngineFactory};
use crate::errors::ExecutionError;

type EngineLoad = Shared<BoxFuture<'static, Result<Arc<dyn Engine>, ExecutionError>>>;

struct CachedEngine {
    engine: Arc<dyn Engine>,
    last_used: Instant,
}

#[derive(Default)]
struct RegistryState {
    loaded: HashMap<Language, CachedEngine>,
    loading: HashMap<Language, EngineLoad>,
}

pub struct EngineRegistry {
    factories: HashMap<Language, Arc<dyn EngineFactory>>,
    capacity: usize,
    idle_timeout: Duration,
    state: Mutex<RegistryState>,
}

impl EngineRegistry {
    /// An empty registry; register factories with [`EngineRegistry::register`].
    pub fn new(config: &RegistryConfig) -> Self {
        Self {
            factories: HashMap::new(),
            capacity: config.capacity.max(1),
            idle_timeout: config.idle_timeout(),
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Registry with a factory for every language the configured backends can serve.
    pub fn from_config(config: &CodeplayConfig) -> Self {
        let mut registry = Self::new(&config.registry);
        for language in Language::ALL {
            let backend = config.engines.backend_for(language);
            match factory_for(language, &backend) {
                Some(factory) => registry.register(factory),
                None => log::debug!("{} has no engine configured", language),
            }
        }
        registry
    }

    pub fn register(&mut self, factory: Arc<dyn EngineFactory>) {
        let language = factory.language();
        if self.factories.insert(language, factory).is_some() {
            log::debug!("Replaced engine factory for {}", language);
        }
    }

    pub fn with_factory(mut self, factory: Arc<dyn EngineFactory>) -> Self {
        self.register(factory);
        self
    }

    pub fn is_registered(&self, language: Language) -> bool {
        self.factories.contains_key(&language)
    }

    pub fn registered_languages(&self) -> Vec<Language> {
        let mut languages: Vec<Language> = self.factories.keys().copied().collect();
        languages.sort();
        languages
    }

    pub async fn loaded_languages(&self) -> Vec<Language> {
        let state = self.state.lock().await;
        let mut languages: Vec<Language> = state.loaded.keys().copied().collect();
        languages.sort();
        languages
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Engine for `language`, loading it on first use.
    pub async fn get(&self, language: Language) -> Result<Arc<dyn Engine>, ExecutionError> {
        let factory = self
            .factories
            .get(&language)
            .cloned()
            .ok_or_else(|| ExecutionError::UnsupportedLanguage(language.to_string()))?;

        let mut stale = Vec::new();
        let load = {
            let mut state = self.state.lock().await;
            stale.extend(self.take_idle(&mut state, Some(language)));

            let hit = state.loaded.get_mut(&language).map(|cached| {
                cached.last_used = Instant::now();
                cached.engine.clone()
            });
            if let Some(engine) = hit {
                drop(state);
                Self::release(stale).await;
                log::debug!("Engine cache hit for {}", language);
                return Ok(engine);
            }

            match state.loading.get(&language) {
                Some(in_flight) => {
                    log::debug!("Joining in-flight load of {} engine", language);
                    in_flight.clone()
                }
                None => {
                    log::debug!("Loading {} engine", language);
                    let load = async move { factory.create().await }.boxed().shared();
                    state.loading.insert(language, load.clone());
                    load
                }
            }
        };
        Self::release(stale).await;

        let outcome = load.clone().await;

        let mut evicted = Vec::new();
        {
            let mut state = self.state.lock().await;
            let owns_load = state
                .loading
                .get(&language)
                .is_some_and(|current| Shared::ptr_eq(current, &load));
            if owns_load {
                state.loading.remove(&language);
                match &outcome {
                    Ok(engine) => {
                        state.loaded.insert(
                            language,
                            CachedEngine {
                                engine: engine.clone(),
                                last_used: Instant::now(),
                            },
                        );
                        log::info!("Loaded {} engine", language);
                        evicted = self.take_over_capacity(&mut state, language);
                    }
                    Err(e) => log::error!("Failed to load {} engine: {}", language, e),
                }
            }
        }
        Self::release(evicted).await;

        outcome
    }

    /// Drop engines idle longer than the idle timeout. Returns how many were evicted.
    pub async fn evict_idle(&self) -> usize {
        let idle = {
            let mut state = self.state.lock().await;
            self.take_idle(&mut state, None)
        };
        let count = idle.len();
        Self::release(idle).await;
        count
    }

    /// Release per-session state in every loaded engine that keeps any.
    pub async fn cleanup_session(&self, session_id: &str) {
        let engines: Vec<Arc<dyn Engine>> = {
            let state = self.state.lock().await;
            state
                .loaded
                .values()
                .filter(|cached| cached.engine.capabilities().stateful_across_calls)
                .map(|cached| cached.engine.clone())
                .collect()
        };
        for engine in engines {
            engine.cleanup(Some(session_id)).await;
        }
    }

    /// Unload every engine.
    pub async fn cleanup_all(&self) {
        let engines: Vec<(Language, Arc<dyn Engine>)> = {
            let mut state = self.state.lock().await;
            state
                .loaded
                .drain()
                .map(|(language, cached)| (language, cached.engine))
                .collect()
        };
        Self::release(engines).await;
    }

    fn take_idle(&self, state: &mut RegistryState, keep: Option<Language>) -> Vec<(Language, Arc<dyn Engine>)> {
        let now = Instant::now();
        let expired: Vec<Language> = state
            .loaded
            .iter()
            .filter(|(language, cached)| {
                Some(**language) != keep && now.duration_since(cached.last_used) >= self.idle_timeout
            })
            .map(|(language, _)| *language)
            .collect();

        expired
            .into_iter()
            .filter_map(|language| {
                state.loaded.remove(&language).map(|cached| {
                    log::info!("Evicting idle {} engine", language);
                    (language, cached.engine)
                })
            })
            .collect()
    }

    fn take_over_capacity(&self, state: &mut RegistryState, keep: Language) -> Vec<(Language, Arc<dyn Engine>)> {
        let mut evicted = Vec::new();
        while state.loaded.len() > self.capacity {
            let oldest = state
                .loaded
                .iter()
                .filter(|(language, _)| **language != keep)
                .min_by_key(|(_, cached)| cached.last_used)
                .map(|(language, _)| *language);
            let Some(language) = oldest else { break };
            if let Some(cached) = state.loaded.remove(&language) {
                log::info!("Evicting least recently used {} engine", language);
                evicted.push((language, cached.engine));
            }
        }
        evicted
    }

    /// Run `cleanup(None)` on engines that left the cache. Called without the
    /// state lock held.
    async fn release(engines: Vec<(Language, Arc<dyn Engine>)>) {
        for (language, engine) in engines {
            log::debug!("Cleaning up {} engine", language);
            engine.cleanup(None).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_types::{ExecutionRequest, ExecutionResult};
    use crate::engines::EngineCapabilities;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullEngine {
        language: Language,
        cleanups: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Engine for NullEngine {
        fn language(&self) -> Language {
            self.language
        }

        fn capabilities(&self) -> EngineCapabilities {
            EngineCapabilities::default()
        }

        async fn execute(&self, _request: &ExecutionRequest) -> ExecutionResult {
            ExecutionResult::success("")
        }

        async fn cleanup(&self, _session_id: Option<&str>) {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct CountingFactory {
        language: Language,
        creates: Arc<AtomicUsize>,
        cleanups: Arc<AtomicUsize>,
    }

    impl CountingFactory {
        fn new(language: Language) -> Self {
            Self {
                language,
                creates: Arc::new(AtomicUsize::new(0)),
                cleanups: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    #[async_trait]
    impl EngineFactory for CountingFactory {
        fn language(&self) -> Language {
            self.language
        }

        async fn create(&self) -> Result<Arc<dyn Engine>, ExecutionError> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(NullEngine {
                language: self.language,
                cleanups: self.cleanups.clone(),
            }))
        }
    }

    fn registry_config(capacity: usize, idle_timeout_secs: u64) -> RegistryConfig {
        RegistryConfig {
            capacity,
            idle_timeout_secs,
        }
    }

    #[tokio::test]
    async fn test_unregistered_language() {
        let registry = EngineRegistry::new(&RegistryConfig::default());
        let err = registry.get(Language::Python).await.err().unwrap();
        assert_eq!(err, ExecutionError::UnsupportedLanguage("python".to_string()));
        assert!(!registry.is_registered(Language::Python));
    }

    #[tokio::test]
    async fn test_engine_is_cached_after_first_load() {
        let factory = Arc::new(CountingFactory::new(Language::Demo));
        let creates = factory.creates.clone();
        let registry = EngineRegistry::new(&RegistryConfig::default()).with_factory(factory);

        registry.get(Language::Demo).await.unwrap();
        registry.get(Language::Demo).await.unwrap();

        assert_eq!(creates.load(Ordering::SeqCst), 1);
        assert_eq!(registry.loaded_languages().await, vec![Language::Demo]);
    }

    #[tokio::test]
    async fn test_lru_eviction_cleans_up_engine() {
        let demo = Arc::new(CountingFactory::new(Language::Demo));
        let html = Arc::new(CountingFactory::new(Language::Html));
        let markdown = Arc::new(CountingFactory::new(Language::Markdown));
        let demo_cleanups = demo.cleanups.clone();
        let registry = EngineRegistry::new(&registry_config(2, 300))
            .with_factory(demo)
            .with_factory(html)
            .with_factory(markdown);

        registry.get(Language::Demo).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        registry.get(Language::Html).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        registry.get(Language::Markdown).await.unwrap();

        assert_eq!(
            registry.loaded_languages().await,
            vec![Language::Html, Language::Markdown]
        );
        assert_eq!(demo_cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_evict_idle() {
        let factory = Arc::new(CountingFactory::new(Language::Demo));
        let cleanups = factory.cleanups.clone();
        let registry = EngineRegistry::new(&registry_config(5, 0)).with_factory(factory);

        registry.get(Language::Demo).await.unwrap();
        assert_eq!(registry.evict_idle().await, 1);
        assert!(registry.loaded_languages().await.is_empty());
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cleanup_all() {
        let factory = Arc::new(CountingFactory::new(Language::Demo));
        let cleanups = factory.cleanups.clone();
        let registry = EngineRegistry::new(&RegistryConfig::default()).with_factory(factory);

        registry.get(Language::Demo).await.unwrap();
        registry.cleanup_all().await;
        assert!(registry.loaded_languages().await.is_empty());
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_from_config_registers_default_backends() {
        let registry = EngineRegistry::from_config(&CodeplayConfig::default());
        assert!(registry.is_registered(Language::Demo));
        assert!(registry.is_registered(Language::Html));
        assert!(registry.is_registered(Language::Markdown));
        assert!(registry.is_registered(Language::Python));
        assert_eq!(registry.capacity(), 5);
    }
}
