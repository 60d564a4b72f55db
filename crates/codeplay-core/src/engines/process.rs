//! Child-process engine for interpreted languages (Python, Node.js).
//!
//! Each execution writes the snippet to a fresh temporary directory and runs
//! the configured interpreter on it with a scrubbed environment. The child is
//! spawned with `kill_on_drop`, so when the resource governor abandons the
//! call the interpreter is killed along with the future. Resident memory of
//! the child is sampled while it runs; a child that grows past the ceiling is
//! killed and reported with its peak usage.

use async_trait::async_trait;
use regex::Regex;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::Mutex;
use uuid::Uuid;
use which::which;

use super::{CappedOutput, Engine, EngineCapabilities, EngineFactory};
use crate::config::ProcessEngineConfig;
use crate::core_types::{ExecutionRequest, ExecutionResult, Language};
use crate::errors::ExecutionError;

const MEMORY_SAMPLE_INTERVAL: Duration = Duration::from_millis(50);
const READ_CHUNK_BYTES: usize = 8 * 1024;

pub struct ProcessEngine {
    language: Language,
    binary: PathBuf,
    config: ProcessEngineConfig,
    /// Holds per-session package directories.
    work_root: TempDir,
    /// Packages already made available, keyed by session.
    loaded_packages: Mutex<HashMap<String, HashSet<String>>>,
    package_name: Regex,
}

impl ProcessEngine {
    pub fn new(language: Language, binary: PathBuf, config: ProcessEngineConfig) -> Result<Self, ExecutionError> {
        let work_root = tempfile::Builder::new().prefix("codeplay-engine-").tempdir()?;
        let package_name = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._\-]*(?:==[A-Za-z0-9.]+)?$").map_err(|e| {
            ExecutionError::EngineLoad {
                language: language.to_string(),
                message: e.to_string(),
            }
        })?;
        Ok(Self {
            language,
            binary,
            config,
            work_root,
            loaded_packages: Mutex::new(HashMap::new()),
            package_name,
        })
    }

    /// Directory-safe key for a session. Distinct ids never share a key.
    fn session_key(session_id: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(session_id.as_bytes());
        format!("session-{:x}", hasher.finalize())
    }

    /// Key for one execution without a session; forgotten after the run.
    fn ephemeral_key() -> String {
        format!("run-{}", Uuid::new_v4())
    }

    fn package_dir(&self, session_key: &str) -> PathBuf {
        self.work_root.path().join(session_key).join("packages")
    }

    /// Make the requested packages available for this session. Returns the
    /// packages that could not be provided.
    async fn prepare_packages(
        &self,
        session_key: &str,
        packages: &[String],
    ) -> Result<Vec<String>, ExecutionError> {
        if let Some(invalid) = packages.iter().find(|p| !self.package_name.is_match(p)) {
            return Err(ExecutionError::Engine(format!(
                "Invalid package name: '{}'",
                invalid
            )));
        }

        let missing: Vec<String> = {
            let loaded = self.loaded_packages.lock().await;
            let known = loaded.get(session_key);
            packages
                .iter()
                .filter(|p| known.map_or(true, |set| !set.contains(*p)))
                .cloned()
                .collect()
        };

        if missing.is_empty() {
            return Ok(Vec::new());
        }

        let mut unavailable = Vec::new();
        let mut installed = Vec::new();
        match &self.config.package_install {
            Some(template) if !template.is_empty() => {
                let target = self.package_dir(session_key);
                tokio::fs::create_dir_all(&target).await?;
                for package in &missing {
                    if self.install_package(template, package, &target).await {
                        installed.push(package.clone());
                    } else {
                        unavailable.push(package.clone());
                    }
                }
            }
            _ => match &self.config.package_check {
                Some(template) if !template.is_empty() => {
                    for package in &missing {
                        if self.package_importable(template, package).await {
                            installed.push(package.clone());
                        } else {
                            unavailable.push(package.clone());
                        }
                    }
                }
                // Nothing to install or check with: trust the interpreter.
                _ => installed.extend(missing.iter().cloned()),
            },
        }

        let mut loaded = self.loaded_packages.lock().await;
        loaded
            .entry(session_key.to_string())
            .or_default()
            .extend(installed);

        Ok(unavailable)
    }

    async fn package_importable(&self, template: &[String], package: &str) -> bool {
        let module = package.split("==").next().unwrap_or(package).replace('-', "_");
        let interpreter = self.binary.to_string_lossy();
        let args: Vec<String> = template
            .iter()
            .map(|arg| arg.replace("{interpreter}", &interpreter).replace("{package}", &module))
            .collect();
        let Some((program, rest)) = args.split_first() else {
            return false;
        };

        let status = Command::new(program)
            .args(rest)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await;
        match status {
            Ok(status) => status.success(),
            Err(e) => {
                log::warn!("Could not check package '{}': {}", package, e);
                false
            }
        }
    }

    /// Drop the package set and directory kept under `key`.
    async fn forget(&self, key: &str) {
        self.loaded_packages.lock().await.remove(key);
        let dir = self.work_root.path().join(key);
        if dir.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                log::warn!("Failed to remove session directory {}: {}", dir.display(), e);
            }
        }
    }

    async fn install_package(&self, template: &[String], package: &str, target: &Path) -> bool {
        let target_str = target.to_string_lossy();
        let args: Vec<String> = template
            .iter()
            .map(|arg| arg.replace("{package}", package).replace("{target}", &target_str))
            .collect();
        let Some((program, rest)) = args.split_first() else {
            return false;
        };

        log::info!("Installing package '{}' for {} engine", package, self.language);
        let output = Command::new(program)
            .args(rest)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await;
        match output {
            Ok(output) if output.status.success() => true,
            Ok(output) => {
                log::warn!(
                    "Package install for '{}' failed: {}",
                    package,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                false
            }
            Err(e) => {
                log::warn!("Could not run package installer for '{}': {}", package, e);
                false
            }
        }
    }

    fn build_command(&self, script: &Path, work_dir: &Path, session_key: &str) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.config.args)
            .arg(script)
            .current_dir(work_dir)
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(path) = std::env::var_os("PATH") {
            cmd.env("PATH", path);
        }
        cmd.env("HOME", work_dir);
        cmd.envs(&self.config.env);

        if let Some(var) = &self.config.package_path_env {
            let package_dir = self.package_dir(session_key);
            if package_dir.exists() {
                cmd.env(var, package_dir);
            }
        }
        cmd
    }

    async fn run(&self, request: &ExecutionRequest) -> Result<ExecutionResult, ExecutionError> {
        match request.session_id.as_deref() {
            Some(session_id) => self.run_in(&Self::session_key(session_id), request).await,
            None => {
                let key = Self::ephemeral_key();
                let outcome = self.run_in(&key, request).await;
                self.forget(&key).await;
                outcome
            }
        }
    }

    async fn run_in(&self, session_key: &str, request: &ExecutionRequest) -> Result<ExecutionResult, ExecutionError> {
        let unavailable = self
            .prepare_packages(session_key, &request.options.packages)
            .await?;

        let temp_dir = tempfile::Builder::new().prefix("codeplay-run-").tempdir()?;
        let script = temp_dir
            .path()
            .join(format!("main.{}", self.config.file_extension));
        tokio::fs::write(&script, request.code.as_bytes()).await?;

        let mut child = self
            .build_command(&script, temp_dir.path(), session_key)
            .spawn()
            .map_err(|e| ExecutionError::Engine(format!("Failed to start {}: {}", self.language, e)))?;

        let max_output = self.config.max_output_bytes;
        let stdout_task = tokio::spawn(read_stream(child.stdout.take(), max_output));
        let stderr_task = tokio::spawn(read_stream(child.stderr.take(), max_output));

        let memory_limit = request.options.memory_limit_bytes.unwrap_or(u64::MAX);
        let pid = child.id().map(Pid::from_u32);
        let mut system = System::new();
        let mut peak_memory = 0u64;
        let mut ticker = tokio::time::interval(MEMORY_SAMPLE_INTERVAL);
        let mut killed_for_memory = false;

        let status = loop {
            tokio::select! {
                status = child.wait() => break status?,
                _ = ticker.tick() => {
                    if let Some(pid) = pid {
                        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
                        if let Some(process) = system.process(pid) {
                            peak_memory = peak_memory.max(process.memory());
                        }
                    }
                    if peak_memory > memory_limit && !killed_for_memory {
                        log::warn!(
                            "{} process exceeded memory ceiling ({} > {} bytes), killing",
                            self.language, peak_memory, memory_limit
                        );
                        killed_for_memory = true;
                        let _ = child.start_kill();
                    }
                }
            }
        };

        let stdout = stdout_task
            .await
            .map_err(|e| ExecutionError::Engine(e.to_string()))??;
        let stderr = stderr_task
            .await
            .map_err(|e| ExecutionError::Engine(e.to_string()))??;
        let output_truncated = stdout.truncated() || stderr.truncated();
        let stdout = stdout.into_text();
        let stderr = stderr.into_text();

        let mut result = if killed_for_memory {
            ExecutionResult::failure(format!(
                "MemoryError: process exceeded the memory limit of {} bytes",
                memory_limit
            ))
            .with_output(stdout)
        } else if status.success() {
            let mut ok = ExecutionResult::success(stdout);
            if !stderr.trim().is_empty() {
                ok = ok.with_metadata("stderr", json!(stderr));
            }
            ok
        } else {
            let message = if stderr.trim().is_empty() {
                format!("Process exited with status {}", status)
            } else {
                stderr
            };
            ExecutionResult::failure(message)
                .with_output(stdout)
                .with_metadata("exit_code", json!(status.code()))
        };

        result = result.with_metadata("memory_bytes", json!(peak_memory));
        if output_truncated {
            result = result.with_metadata("output_truncated", json!(true));
        }
        if !request.options.packages.is_empty() {
            result = result.with_metadata("packages", json!(request.options.packages));
        }
        if !unavailable.is_empty() {
            result = result.with_metadata("unavailable_packages", json!(unavailable));
        }
        Ok(result)
    }
}

/// Read a pipe to the end, keeping at most `max_bytes`. The rest is drained
/// so the child never blocks on a full pipe.
async fn read_stream<R: AsyncRead + Unpin>(
    stream: Option<R>,
    max_bytes: usize,
) -> Result<CappedOutput, ExecutionError> {
    let mut output = CappedOutput::new(max_bytes);
    if let Some(mut stream) = stream {
        let mut chunk = vec![0u8; READ_CHUNK_BYTES];
        loop {
            let read = stream.read(&mut chunk).await?;
            if read == 0 {
                break;
            }
            output.push(&chunk[..read]);
        }
    }
    Ok(output)
}

#[async_trait]
impl Engine for ProcessEngine {
    fn language(&self) -> Language {
        self.language
    }

    fn capabilities(&self) -> EngineCapabilities {
        let packages = self.config.package_path_env.is_some();
        EngineCapabilities {
            renders_visual_output: false,
            supports_packages: packages,
            stateful_across_calls: packages,
        }
    }

    async fn execute(&self, request: &ExecutionRequest) -> ExecutionResult {
        match self.run(request).await {
            Ok(result) => result,
            Err(e) => {
                log::debug!("{} engine failed before completion: {}", self.language, e);
                ExecutionResult::failure(e.to_string())
            }
        }
    }

    fn validate_code(&self, code: &str) -> bool {
        !code.trim().is_empty() && !code.contains('\0')
    }

    async fn cleanup(&self, session_id: Option<&str>) {
        match session_id {
            Some(id) => self.forget(&Self::session_key(id)).await,
            None => {
                self.loaded_packages.lock().await.clear();
                let mut entries = match tokio::fs::read_dir(self.work_root.path()).await {
                    Ok(entries) => entries,
                    Err(e) => {
                        log::warn!("Failed to list engine work directory: {}", e);
                        return;
                    }
                };
                while let Ok(Some(entry)) = entries.next_entry().await {
                    let _ = tokio::fs::remove_dir_all(entry.path()).await;
                }
            }
        }
    }
}

pub struct ProcessEngineFactory {
    language: Language,
    config: ProcessEngineConfig,
}

impl ProcessEngineFactory {
    pub fn new(language: Language, config: ProcessEngineConfig) -> Self {
        Self { language, config }
    }
}

#[async_trait]
impl EngineFactory for ProcessEngineFactory {
    fn language(&self) -> Language {
        self.language
    }

    async fn create(&self) -> Result<Arc<dyn Engine>, ExecutionError> {
        let binary = which(&self.config.command).map_err(|e| ExecutionError::EngineLoad {
            language: self.language.to_string(),
            message: format!("interpreter '{}' not found: {}", self.config.command, e),
        })?;
        log::info!(
            "Loaded {} engine using {}",
            self.language,
            binary.display()
        );
        Ok(Arc::new(ProcessEngine::new(
            self.language,
            binary,
            self.config.clone(),
        )?))
    }
}
