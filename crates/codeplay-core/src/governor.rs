//! Wall-clock and memory enforcement around engine invocations.
//!
//! Every invocation runs as its own tokio task raced against a timer. When the
//! timer wins the task is aborted and a timeout is reported even if the engine
//! never yields. Engines that run user code in a child process or container
//! die with the task; in-process engines stop at their next await point.

use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::task::AbortHandle;

use crate::config::LimitsConfig;
use crate::core_types::{ExecutionOptions, ExecutionRequest, ExecutionResult, Language};
use crate::engines::Engine;
use crate::errors::ExecutionError;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResourceLimits {
    pub timeout: Duration,
    pub memory_limit_bytes: u64,
}

impl ResourceLimits {
    pub fn new(timeout: Duration, memory_limit_bytes: u64) -> Self {
        Self {
            timeout,
            memory_limit_bytes,
        }
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout.as_millis() as u64
    }
}

/// Built-in limits for a language before configuration overrides.
pub fn default_limits(language: Language) -> ResourceLimits {
    match language {
        Language::Python => ResourceLimits::new(Duration::from_secs(30), 256 * MIB),
        Language::JavaScript => ResourceLimits::new(Duration::from_secs(10), 128 * MIB),
        Language::Html | Language::Markdown => ResourceLimits::new(Duration::from_secs(3), 32 * MIB),
        Language::Demo => ResourceLimits::new(Duration::from_secs(5), 64 * MIB),
    }
}

/// Source of resident memory readings for the host process.
pub trait MemorySampler: Send + Sync {
    fn resident_bytes(&self) -> Option<u64>;
}

/// Reads the current process RSS through sysinfo.
pub struct SysinfoMemorySampler {
    system: StdMutex<System>,
    pid: Option<Pid>,
}

impl SysinfoMemorySampler {
    pub fn new() -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                log::warn!("Memory sampling disabled, cannot resolve own pid: {}", e);
                None
            }
        };
        Self {
            system: StdMutex::new(System::new()),
            pid,
        }
    }
}

impl Default for SysinfoMemorySampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySampler for SysinfoMemorySampler {
    fn resident_bytes(&self) -> Option<u64> {
        let pid = self.pid?;
        let mut system = self.system.lock().ok()?;
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system.process(pid).map(|process| process.memory())
    }
}

pub struct ResourceGovernor {
    defaults: HashMap<Language, ResourceLimits>,
    max_timeout: Duration,
    max_memory_limit_bytes: u64,
    sampler: Arc<dyn MemorySampler>,
    running: StdMutex<HashMap<u64, AbortHandle>>,
    next_invocation: AtomicU64,
}

impl ResourceGovernor {
    pub fn new() -> Self {
        Self::from_config(&LimitsConfig::default())
    }

    pub fn from_config(config: &LimitsConfig) -> Self {
        let max_timeout = Duration::from_millis(config.max_timeout_ms);
        let defaults = Language::ALL
            .iter()
            .map(|language| {
                let mut limits = default_limits(*language);
                if let Some(custom) = config.per_language.get(language) {
                    if let Some(timeout_ms) = custom.timeout_ms {
                        limits.timeout = Duration::from_millis(timeout_ms);
                    }
                    if let Some(memory) = custom.memory_limit_bytes {
                        limits.memory_limit_bytes = memory;
                    }
                }
                limits.timeout = limits.timeout.min(max_timeout);
                limits.memory_limit_bytes = limits.memory_limit_bytes.min(config.max_memory_limit_bytes);
                (*language, limits)
            })
            .collect();

        Self {
            defaults,
            max_timeout,
            max_memory_limit_bytes: config.max_memory_limit_bytes,
            sampler: Arc::new(SysinfoMemorySampler::new()),
            running: StdMutex::new(HashMap::new()),
            next_invocation: AtomicU64::new(0),
        }
    }

    pub fn with_sampler(mut self, sampler: Arc<dyn MemorySampler>) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn default_limits_for(&self, language: Language) -> ResourceLimits {
        self.defaults
            .get(&language)
            .copied()
            .unwrap_or_else(|| default_limits(language))
    }

    /// Effective limits for a request. Overrides are clamped to the hard
    /// maxima and a zero override means "use the default", never unbounded.
    pub fn resolve_limits(&self, language: Language, options: &ExecutionOptions) -> ResourceLimits {
        let defaults = self.default_limits_for(language);
        let timeout = match options.timeout_ms {
            Some(ms) if ms > 0 => Duration::from_millis(ms).min(self.max_timeout),
            _ => defaults.timeout,
        };
        let memory_limit_bytes = match options.memory_limit_bytes {
            Some(bytes) if bytes > 0 => bytes.min(self.max_memory_limit_bytes),
            _ => defaults.memory_limit_bytes,
        };
        ResourceLimits::new(timeout, memory_limit_bytes)
    }

    /// Run `request` on `engine` under `limits`.
    ///
    /// The engine sees the effective limits in `request.options` so engines
    /// with their own enforcement (child processes, containers) can apply them.
    pub async fn govern(
        &self,
        engine: Arc<dyn Engine>,
        mut request: ExecutionRequest,
        limits: ResourceLimits,
    ) -> Result<ExecutionResult, ExecutionError> {
        request.options.timeout_ms = Some(limits.timeout_ms());
        request.options.memory_limit_bytes = Some(limits.memory_limit_bytes);
        let language = request.language;

        let before = self.sampler.resident_bytes();
        let mut handle = tokio::spawn(async move { engine.execute(&request).await });
        // Aborts the engine task if this future is dropped before it finishes.
        let _invocation = RunningInvocation::register(self, handle.abort_handle());

        let outcome = tokio::time::timeout(limits.timeout, &mut handle).await;

        let mut result = match outcome {
            Err(_) => {
                log::warn!(
                    "{} execution exceeded {}ms, aborted",
                    language,
                    limits.timeout_ms()
                );
                return Err(ExecutionError::Timeout {
                    limit_ms: limits.timeout_ms(),
                });
            }
            Ok(Err(join_error)) if join_error.is_cancelled() => {
                log::info!("{} execution cancelled", language);
                return Err(ExecutionError::Cancelled);
            }
            Ok(Err(join_error)) => {
                let detail = join_error
                    .try_into_panic()
                    .map(|payload| panic_message(payload.as_ref()))
                    .unwrap_or_else(|e| e.to_string());
                log::error!("{} engine panicked: {}", language, detail);
                return Err(ExecutionError::Engine(format!("Engine crashed: {}", detail)));
            }
            Ok(Ok(result)) => result,
        };

        let sampled = match (before, self.sampler.resident_bytes()) {
            (Some(before), Some(after)) => after.saturating_sub(before),
            _ => 0,
        };
        let used = sampled.max(result.reported_memory_bytes().unwrap_or(0));
        if used > limits.memory_limit_bytes {
            log::warn!(
                "{} execution used {} bytes, limit is {}",
                language,
                used,
                limits.memory_limit_bytes
            );
            return Err(ExecutionError::MemoryExceeded {
                used_bytes: used,
                limit_bytes: limits.memory_limit_bytes,
            });
        }

        result
            .metadata
            .insert("memory_bytes".to_string(), serde_json::json!(used));
        Ok(result)
    }

    /// Abort every running invocation. Returns how many were aborted.
    pub async fn cancel_all(&self) -> usize {
        let handles: Vec<AbortHandle> = match self.running.lock() {
            Ok(mut running) => running.drain().map(|(_, handle)| handle).collect(),
            Err(_) => {
                log::error!("Running-invocation table poisoned, nothing cancelled");
                return 0;
            }
        };
        let count = handles.len();
        for handle in handles {
            handle.abort();
        }
        if count > 0 {
            log::info!("Cancelled {} running execution(s)", count);
        }
        count
    }

    pub async fn running_count(&self) -> usize {
        self.running.lock().map(|running| running.len()).unwrap_or(0)
    }
}

/// Entry in the running table for one engine task. Dropping it aborts the
/// task and removes the entry, whether `govern` finished or was abandoned.
struct RunningInvocation<'a> {
    running: &'a StdMutex<HashMap<u64, AbortHandle>>,
    id: u64,
    handle: AbortHandle,
}

impl<'a> RunningInvocation<'a> {
    fn register(governor: &'a ResourceGovernor, handle: AbortHandle) -> Self {
        let id = governor.next_invocation.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut running) = governor.running.lock() {
            running.insert(id, handle.clone());
        }
        Self {
            running: &governor.running,
            id,
            handle,
        }
    }
}

impl Drop for RunningInvocation<'_> {
    fn drop(&mut self) {
        self.handle.abort();
        if let Ok(mut running) = self.running.lock() {
            running.remove(&self.id);
        }
    }
}

impl Default for ResourceGovernor {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}
