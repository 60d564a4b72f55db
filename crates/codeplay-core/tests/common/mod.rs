#![allow(dead_code)]

use async_trait::async_trait;
use codeplay_core::core_types::{ExecutionRequest, ExecutionResult, Language};
use codeplay_core::engines::{Engine, EngineCapabilities, EngineFactory};
use codeplay_core::errors::ExecutionError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What a fake engine does when executed.
#[derive(Debug, Clone)]
pub enum FakeBehavior {
    /// Succeed with the code as output.
    Echo,
    /// Sleep, then echo.
    Delay(Duration),
    /// Return a failed result with this error text.
    Fail(String),
    /// Succeed, reporting this text as stderr.
    Warn(String),
    /// Never finish.
    Hang,
    Panic,
}

/// Counters shared between a fake factory, its engine and the test.
#[derive(Default)]
pub struct Tally {
    pub inits: AtomicUsize,
    pub calls: AtomicUsize,
    pub running: AtomicUsize,
    pub max_running: AtomicUsize,
    pub cleanups: Mutex<Vec<Option<String>>>,
    pub seen_requests: Mutex<Vec<ExecutionRequest>>,
}

impl Tally {
    pub fn inits(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    pub fn cleanups(&self) -> Vec<Option<String>> {
        self.cleanups.lock().unwrap().clone()
    }

    pub fn last_request(&self) -> Option<ExecutionRequest> {
        self.seen_requests.lock().unwrap().last().cloned()
    }
}

struct RunningGuard<'a>(&'a Tally);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.running.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct FakeEngine {
    language: Language,
    behavior: FakeBehavior,
    capabilities: EngineCapabilities,
    tally: Arc<Tally>,
}

#[async_trait]
impl Engine for FakeEngine {
    fn language(&self) -> Language {
        self.language
    }

    fn capabilities(&self) -> EngineCapabilities {
        self.capabilities
    }

    async fn execute(&self, request: &ExecutionRequest) -> ExecutionResult {
        self.tally.calls.fetch_add(1, Ordering::SeqCst);
        self.tally.seen_requests.lock().unwrap().push(request.clone());
        let now_running = self.tally.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.tally.max_running.fetch_max(now_running, Ordering::SeqCst);
        let _guard = RunningGuard(&self.tally);

        match &self.behavior {
            FakeBehavior::Echo => ExecutionResult::success(request.code.clone()),
            FakeBehavior::Delay(delay) => {
                tokio::time::sleep(*delay).await;
                ExecutionResult::success(request.code.clone())
            }
            FakeBehavior::Fail(message) => ExecutionResult::failure(message.clone()),
            FakeBehavior::Warn(stderr) => ExecutionResult::success(request.code.clone())
                .with_metadata("stderr", serde_json::json!(stderr)),
            FakeBehavior::Hang => {
                futures::future::pending::<()>().await;
                ExecutionResult::success("")
            }
            FakeBehavior::Panic => panic!("fake engine exploded"),
        }
    }

    async fn cleanup(&self, session_id: Option<&str>) {
        self.tally
            .cleanups
            .lock()
            .unwrap()
            .push(session_id.map(str::to_string));
    }
}

pub struct FakeFactory {
    language: Language,
    behavior: FakeBehavior,
    capabilities: EngineCapabilities,
    load_delay: Duration,
    failing_loads: AtomicUsize,
    tally: Arc<Tally>,
}

impl FakeFactory {
    pub fn new(language: Language, behavior: FakeBehavior) -> Self {
        Self {
            language,
            behavior,
            capabilities: EngineCapabilities::default(),
            load_delay: Duration::ZERO,
            failing_loads: AtomicUsize::new(0),
            tally: Arc::new(Tally::default()),
        }
    }

    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    /// The first `count` loads fail.
    pub fn with_failing_loads(self, count: usize) -> Self {
        self.failing_loads.store(count, Ordering::SeqCst);
        self
    }

    pub fn with_capabilities(mut self, capabilities: EngineCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn tally(&self) -> Arc<Tally> {
        self.tally.clone()
    }

    pub fn build(self) -> (Arc<dyn EngineFactory>, Arc<Tally>) {
        let tally = self.tally.clone();
        (Arc::new(self), tally)
    }
}

#[async_trait]
impl EngineFactory for FakeFactory {
    fn language(&self) -> Language {
        self.language
    }

    async fn create(&self) -> Result<Arc<dyn Engine>, ExecutionError> {
        self.tally.inits.fetch_add(1, Ordering::SeqCst);
        if !self.load_delay.is_zero() {
            tokio::time::sleep(self.load_delay).await;
        }
        let should_fail = self
            .failing_loads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(ExecutionError::EngineLoad {
                language: self.language.to_string(),
                message: "interpreter not available".to_string(),
            });
        }
        Ok(Arc::new(FakeEngine {
            language: self.language,
            behavior: self.behavior.clone(),
            capabilities: self.capabilities,
            tally: self.tally.clone(),
        }))
    }
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
