//! The execution dispatcher: the single entry point callers use.
//!
//! A request goes through the same pipeline whatever its language:
//!
//! 1. empty code is rejected without touching any engine
//! 2. the engine is resolved (and loaded on first use) through the registry
//! 3. the security validator screens the code; blocked code never runs
//! 4. a global concurrency permit is acquired, waiting in FIFO order
//! 5. the engine runs under the resource governor
//! 6. failures are classified, metrics recorded and the session updated
//!
//! `execute` never returns an error. Every failure comes back as a result
//! with `success: false`, a sanitized `error` and a `processed_error`.
//!
//! The first execution starts two background tasks: a recorder that writes
//! results into sessions in completion order, and a sweeper that expires
//! idle sessions and evicts idle engines on a fixed interval.

use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::MissedTickBehavior;

use crate::classifier::{ErrorClassifier, ErrorContext};
use crate::config::{CodeplayConfig, DispatcherConfig};
use crate::core_types::{ExecutionRequest, ExecutionResult, Language};
use crate::errors::ExecutionError;
use crate::governor::ResourceGovernor;
use crate::metrics::{
    ExecutionSample, FanoutMetrics, InMemoryMetrics, LogMetricsSink, MetricsSink, MetricsSnapshot,
};
use crate::registry::EngineRegistry;
use crate::security::SecurityValidator;
use crate::session::{SessionManager, SessionRecord};

/// A failure before or around the engine, with metadata gathered so far.
struct Failure {
    error: ExecutionError,
    metadata: Map<String, Value>,
}

impl From<ExecutionError> for Failure {
    fn from(error: ExecutionError) -> Self {
        Self {
            error,
            metadata: Map::new(),
        }
    }
}

/// Tasks started with the first execution.
struct Background {
    records: mpsc::UnboundedSender<SessionRecord>,
    recorder: JoinHandle<()>,
    sweeper: AbortHandle,
}

pub struct ExecutionDispatcher {
    registry: Arc<EngineRegistry>,
    validator: Option<SecurityValidator>,
    governor: Arc<ResourceGovernor>,
    sessions: Arc<SessionManager>,
    classifier: ErrorClassifier,
    metrics: Arc<dyn MetricsSink>,
    permits: Arc<Semaphore>,
    max_concurrent: usize,
    maintenance_interval: Duration,
    background: StdMutex<Option<Background>>,
}

impl ExecutionDispatcher {
    /// Dispatcher over `registry` with default security, limits and sessions.
    pub fn new(registry: EngineRegistry) -> Result<Self, ExecutionError> {
        let max_concurrent = DispatcherConfig::default().max_concurrent;
        Ok(Self {
            registry: Arc::new(registry),
            validator: Some(SecurityValidator::new()),
            governor: Arc::new(ResourceGovernor::new()),
            sessions: Arc::new(SessionManager::default()),
            classifier: ErrorClassifier::new()?,
            metrics: Arc::new(FanoutMetrics::new(vec![
                Arc::new(LogMetricsSink),
                Arc::new(InMemoryMetrics::new()),
            ])),
            permits: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            maintenance_interval: DispatcherConfig::default().maintenance_interval(),
            background: StdMutex::new(None),
        })
    }

    pub fn from_config(config: &CodeplayConfig) -> Result<Self, ExecutionError> {
        config.validate()?;
        let dispatcher = Self::new(EngineRegistry::from_config(config))?
            .with_governor(ResourceGovernor::from_config(&config.limits))
            .with_sessions(SessionManager::new(config.sessions.clone()))
            .with_max_concurrent(config.dispatcher.max_concurrent)
            .with_maintenance_interval(config.dispatcher.maintenance_interval());

        let dispatcher = if config.security.enabled {
            dispatcher.with_validator(SecurityValidator::from_config(&config.security))
        } else {
            dispatcher.without_security()
        };

        log::info!(
            "Dispatcher ready: languages {:?}, {} concurrent executions",
            dispatcher.registry.registered_languages(),
            dispatcher.max_concurrent
        );
        Ok(dispatcher)
    }

    pub fn with_validator(mut self, validator: SecurityValidator) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Skip static screening entirely. Only for trusted deployments.
    pub fn without_security(mut self) -> Self {
        log::warn!("Security validation is disabled; submitted code runs unscreened");
        self.validator = None;
        self
    }

    pub fn with_governor(mut self, governor: ResourceGovernor) -> Self {
        self.governor = Arc::new(governor);
        self
    }

    pub fn with_sessions(mut self, sessions: SessionManager) -> Self {
        self.sessions = Arc::new(sessions);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        self.permits = Arc::new(Semaphore::new(max_concurrent));
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval.max(Duration::from_millis(1));
        self
    }

    pub fn registry(&self) -> &EngineRegistry {
        &self.registry
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn supported_languages(&self) -> Vec<Language> {
        self.registry.registered_languages()
    }

    /// Whether `tag` names a language with a registered engine.
    pub fn is_language_supported(&self, tag: &str) -> bool {
        tag.parse::<Language>()
            .map(|language| self.registry.is_registered(language))
            .unwrap_or(false)
    }

    /// Cheap pre-check: non-empty, accepted by the engine and not blocked by
    /// the security validator. Has no side effects beyond loading the engine.
    pub async fn validate_code(&self, code: &str, language: Language) -> bool {
        if code.trim().is_empty() {
            return false;
        }
        let engine = match self.registry.get(language).await {
            Ok(engine) => engine,
            Err(e) => {
                log::debug!("Cannot validate {} code: {}", language, e);
                return false;
            }
        };
        if !engine.validate_code(code) {
            return false;
        }
        match &self.validator {
            Some(validator) => !validator.validate(code, language).blocked,
            None => true,
        }
    }

    pub async fn execute(&self, request: ExecutionRequest) -> ExecutionResult {
        let started = Instant::now();
        let language = request.language;
        let context = ErrorContext::new(language)
            .with_code(&request.code)
            .with_session(request.session_id.as_deref());

        let mut result = match self.run(&request).await {
            Ok(result) if result.success => ExecutionResult {
                error: None,
                processed_error: None,
                ..result
            },
            Ok(result) => {
                let raw = result.error.as_deref().unwrap_or("Execution failed");
                let processed = self.classifier.classify_message(raw, &context);
                ExecutionResult {
                    error: Some(processed.original_message.clone()),
                    processed_error: Some(processed),
                    ..result
                }
            }
            Err(failure) => {
                let processed = self.classifier.classify(&failure.error, &context);
                let mut result = ExecutionResult::failure(processed.original_message.clone());
                result.metadata = failure.metadata;
                result.processed_error = Some(processed);
                result
            }
        };

        if let Some(Value::String(stderr)) = result.metadata.get_mut("stderr") {
            *stderr = self.classifier.sanitize_message(stderr);
        }

        let elapsed = started.elapsed();
        result.execution_time_ms = elapsed.as_millis() as u64;
        self.metrics.record(&ExecutionSample {
            language,
            duration: elapsed,
            success: result.success,
        });

        let records = self.start_background();
        if let Some(session_id) = request.session_id {
            let record = SessionRecord {
                session_id,
                caller: request.caller,
                code: request.code,
                language,
                result: result.clone(),
            };
            if let Some(records) = records {
                if records.send(record).is_err() {
                    log::warn!("Session recorder has stopped; execution not recorded");
                }
            }
        }

        result
    }

    /// Start the recorder and sweeper if they are not running and return the
    /// recorder's inbox.
    fn start_background(&self) -> Option<mpsc::UnboundedSender<SessionRecord>> {
        let mut background = self.background.lock().ok()?;
        if let Some(running) = background.as_ref() {
            return Some(running.records.clone());
        }

        let (records, mut inbox) = mpsc::unbounded_channel::<SessionRecord>();
        let sessions = self.sessions.clone();
        let recorder = tokio::spawn(async move {
            while let Some(record) = inbox.recv().await {
                let session_id = record.session_id.clone();
                if let Err(e) = sessions.record_execution(record).await {
                    log::warn!("Execution not recorded in session {}: {}", session_id, e);
                }
            }
        });

        let sessions = self.sessions.clone();
        let registry = self.registry.clone();
        let period = self.maintenance_interval;
        let sweeper = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticks.tick().await;
            loop {
                ticks.tick().await;
                let expired = release_expired(&sessions, &registry).await;
                let evicted = registry.evict_idle().await;
                if !expired.is_empty() || evicted > 0 {
                    log::debug!(
                        "Maintenance expired {} sessions, evicted {} engines",
                        expired.len(),
                        evicted
                    );
                }
            }
        });
        log::debug!("Started session recorder and maintenance every {:?}", period);

        *background = Some(Background {
            records: records.clone(),
            recorder,
            sweeper: sweeper.abort_handle(),
        });
        Some(records)
    }

    async fn run(&self, request: &ExecutionRequest) -> Result<ExecutionResult, Failure> {
        if request.code.trim().is_empty() {
            return Err(ExecutionError::EmptyCode.into());
        }

        let engine = self.registry.get(request.language).await?;
        log::debug!("Routing {} request to engine", request.language);

        let mut metadata = Map::new();
        if let Some(validator) = &self.validator {
            let report = validator.validate(&request.code, request.language);
            if !report.is_clean() {
                metadata.insert("security_violations".to_string(), json!(report.violations));
                metadata.insert("risk_score".to_string(), json!(report.risk_score));
            }
            if let Some(message) = report.block_reason() {
                return Err(Failure {
                    error: ExecutionError::SecurityViolation {
                        message,
                        risk_score: report.risk_score,
                    },
                    metadata,
                });
            }
        }

        let mut request = request.clone();
        if !request.options.packages.is_empty() && !engine.capabilities().supports_packages {
            let ignored = std::mem::take(&mut request.options.packages);
            log::debug!("{} engine ignores packages {:?}", request.language, ignored);
            metadata.insert("ignored_packages".to_string(), json!(ignored));
        }

        let limits = self.governor.resolve_limits(request.language, &request.options);
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ExecutionError::Cancelled)?;

        let mut result = match self.governor.govern(engine, request, limits).await {
            Ok(result) => result,
            Err(error) => return Err(Failure { error, metadata }),
        };
        for (key, value) in metadata {
            result.metadata.insert(key, value);
        }
        Ok(result)
    }

    /// Abort every running execution. Returns how many were aborted.
    pub async fn cancel_all(&self) -> usize {
        self.governor.cancel_all().await
    }

    /// Expire idle anonymous sessions and release engine state held for
    /// them. Returns the expired session ids.
    pub async fn expire_sessions(&self) -> Vec<String> {
        release_expired(&self.sessions, &self.registry).await
    }

    pub fn stats(&self) -> MetricsSnapshot {
        self.metrics.snapshot().unwrap_or_default()
    }

    /// Cancel running work, write out pending session records and unload
    /// every engine.
    pub async fn shutdown(&self) {
        self.cancel_all().await;
        let background = self.background.lock().ok().and_then(|mut slot| slot.take());
        if let Some(Background {
            records,
            recorder,
            sweeper,
        }) = background
        {
            sweeper.abort();
            drop(records);
            if let Err(e) = recorder.await {
                log::warn!("Session recorder ended abnormally: {}", e);
            }
        }
        self.registry.cleanup_all().await;
    }
}

async fn release_expired(sessions: &SessionManager, registry: &EngineRegistry) -> Vec<String> {
    let expired = sessions.cleanup_expired().await;
    for session_id in &expired {
        registry.cleanup_session(session_id).await;
    }
    expired
}

impl Drop for ExecutionDispatcher {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.background.lock() {
            if let Some(background) = slot.take() {
                background.sweeper.abort();
            }
        }
    }
}
