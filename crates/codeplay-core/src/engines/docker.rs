// src/engines/docker.rs
use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions as BollardCreateContainerOptionsQuery,
    LogsOptions as BollardLogsOptionsQuery,
    RemoveContainerOptions as BollardRemoveContainerOptionsQuery,
    StartContainerOptions as BollardStartContainerOptionsQuery,
    WaitContainerOptions as BollardWaitContainerOptionsQuery,
};
use bollard::Docker;
use futures_util::stream::StreamExt;
use serde_json::json;
use std::default::Default;
use std::sync::Arc;
use std::time::Duration;
use tempfile::Builder;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::{CappedOutput, Engine, EngineCapabilities, EngineFactory};
use crate::config::DockerEngineConfig;
use crate::core_types::{ExecutionRequest, ExecutionResult, Language};
use crate::errors::{DockerEngineError, ExecutionError};

/// Used when a request reaches the engine without governor limits.
const FALLBACK_TIMEOUT: Duration = Duration::from_secs(30);
/// The engine gives up this much before the caller's limit so it can remove
/// the container itself.
const DEADLINE_MARGIN: Duration = Duration::from_millis(250);

pub struct DockerEngine {
    docker: Docker,
    language: Language,
    config: DockerEngineConfig,
}

impl DockerEngine {
    pub fn new(docker: Docker, language: Language, config: DockerEngineConfig) -> Self {
        Self {
            docker,
            language,
            config,
        }
    }

    async fn run(&self, request: &ExecutionRequest) -> Result<ExecutionResult, DockerEngineError> {
        self.run_named(request, &format!("codeplay-{}", Uuid::new_v4())).await
    }

    async fn run_named(
        &self,
        request: &ExecutionRequest,
        container_name: &str,
    ) -> Result<ExecutionResult, DockerEngineError> {
        let temp_dir = Builder::new().prefix("codeplay-docker-").tempdir()?;
        let host_temp_dir_path = temp_dir
            .path()
            .to_str()
            .ok_or_else(|| DockerEngineError::TempFileError("Invalid temp path".to_string()))?
            .to_string();

        let script_filename = format!("script_{}.{}", Uuid::new_v4(), self.config.file_extension);
        let host_script_path = temp_dir.path().join(&script_filename);

        let mut file = fs::File::create(&host_script_path).await?;
        file.write_all(request.code.as_bytes()).await?;
        file.flush().await?;

        let container_work_dir = "/app";
        let script_path_in_container = format!("{}/{}", container_work_dir, script_filename);

        let options = Some(BollardCreateContainerOptionsQuery {
            name: Some(container_name.to_string()),
            ..Default::default()
        });

        let memory_limit = request
            .options
            .memory_limit_bytes
            .and_then(|bytes| i64::try_from(bytes).ok());

        let config = ContainerCreateBody {
            image: Some(self.config.image.clone()),
            cmd: Some(container_command(&self.config, &script_path_in_container)),
            working_dir: Some(container_work_dir.to_string()),
            network_disabled: Some(self.config.disable_network),
            host_config: Some(HostConfig {
                binds: Some(vec![format!(
                    "{}:{}:ro",
                    host_temp_dir_path, container_work_dir
                )]),
                memory: memory_limit,
                memory_swap: memory_limit,
                ..Default::default()
            }),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let container = self.docker.create_container(options, config).await?;
        // Removes the container on every exit from here on, including when
        // this future is dropped mid-run.
        let reaper = ContainerReaper::new(self.docker.clone(), container.id.clone());
        self.docker
            .start_container(&container.id, None::<BollardStartContainerOptionsQuery>)
            .await?;

        let timeout = request
            .options
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(FALLBACK_TIMEOUT);

        let mut exec_stream = self
            .docker
            .wait_container(&container.id, None::<BollardWaitContainerOptionsQuery>);
        let timeout_future = tokio::time::sleep(engine_deadline(timeout));

        let wait_outcome = tokio::select! {
            res = exec_stream.next() => res,
            _ = timeout_future => {
                log::warn!("Execution timed out for container {}", container.id);
                reaper.remove().await;
                return Err(DockerEngineError::Timeout);
            }
        };

        let exit_code = match wait_outcome {
            Some(Ok(response)) => response.status_code,
            // A non-zero exit surfaces as a wait error in recent Docker APIs.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
            Some(Err(e)) => {
                reaper.remove().await;
                return Err(DockerEngineError::BollardError(e));
            }
            None => {
                reaper.remove().await;
                return Err(DockerEngineError::ContainerFailed {
                    exit_code: None,
                    stdout: String::new(),
                    stderr: "Container wait stream ended unexpectedly".to_string(),
                });
            }
        };

        let mut output_stream = self.docker.logs(
            &container.id,
            Some(BollardLogsOptionsQuery {
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );

        let mut stdout = CappedOutput::new(self.config.max_output_bytes);
        let mut stderr = CappedOutput::new(self.config.max_output_bytes);
        while let Some(log_result) = output_stream.next().await {
            match log_result {
                Ok(LogOutput::StdOut { message }) => stdout.push(&message),
                Ok(LogOutput::StdErr { message }) => stderr.push(&message),
                Ok(_) => {}
                Err(e) => {
                    reaper.remove().await;
                    return Err(DockerEngineError::BollardError(e));
                }
            }
        }
        reaper.remove().await;

        let output_truncated = stdout.truncated() || stderr.truncated();
        let stdout = stdout.into_text();
        let stderr = stderr.into_text();

        if exit_code != 0 {
            return Err(DockerEngineError::ContainerFailed {
                exit_code: Some(exit_code),
                stdout,
                stderr,
            });
        }

        let mut result = ExecutionResult::success(stdout)
            .with_metadata("container_image", json!(self.config.image));
        if !stderr.trim().is_empty() {
            result = result.with_metadata("stderr", json!(stderr));
        }
        if output_truncated {
            result = result.with_metadata("output_truncated", json!(true));
        }
        Ok(result)
    }
}

#[async_trait]
impl Engine for DockerEngine {
    fn language(&self) -> Language {
        self.language
    }

    fn capabilities(&self) -> EngineCapabilities {
        EngineCapabilities::default()
    }

    async fn execute(&self, request: &ExecutionRequest) -> ExecutionResult {
        match self.run(request).await {
            Ok(result) => result,
            Err(DockerEngineError::ContainerFailed {
                exit_code,
                stdout,
                stderr,
            }) => failed_run(exit_code, stdout, stderr),
            Err(e) => ExecutionResult::failure(ExecutionError::from(e).to_string()),
        }
    }

    async fn cleanup(&self, _session_id: Option<&str>) {
        // Containers are removed after every run; nothing is kept per session.
    }
}

/// Force-removes a container once. Dropping an unremoved reaper hands the
/// removal to the runtime.
struct ContainerReaper {
    docker: Docker,
    id: Option<String>,
}

impl ContainerReaper {
    fn new(docker: Docker, id: String) -> Self {
        Self { docker, id: Some(id) }
    }

    async fn remove(mut self) {
        if let Some(id) = self.id.take() {
            force_remove(&self.docker, &id).await;
        }
    }
}

impl Drop for ContainerReaper {
    fn drop(&mut self) {
        let Some(id) = self.id.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                log::debug!("Removing abandoned container {}", id);
                let docker = self.docker.clone();
                runtime.spawn(async move { force_remove(&docker, &id).await });
            }
            Err(_) => log::warn!("No runtime left to remove container {}", id),
        }
    }
}

async fn force_remove(docker: &Docker, id: &str) {
    let options = Some(BollardRemoveContainerOptionsQuery {
        force: true,
        ..Default::default()
    });
    if let Err(e) = docker.remove_container(id, options).await {
        log::debug!("Failed to remove container {}: {}", id, e);
    }
}

fn engine_deadline(limit: Duration) -> Duration {
    limit.saturating_sub(DEADLINE_MARGIN).max(limit / 2)
}

fn container_command(config: &DockerEngineConfig, script_path_in_container: &str) -> Vec<String> {
    let mut cmd = config.command.clone();
    cmd.push(script_path_in_container.to_string());
    cmd
}

/// Result for a container that ran but exited non-zero.
fn failed_run(exit_code: Option<i64>, stdout: String, stderr: String) -> ExecutionResult {
    let message = if stderr.trim().is_empty() {
        match exit_code {
            Some(code) => format!("Container exited with code {}", code),
            None => "Container exited abnormally".to_string(),
        }
    } else {
        stderr
    };
    ExecutionResult::failure(message)
        .with_output(stdout)
        .with_metadata("exit_code", json!(exit_code))
}

pub struct DockerEngineFactory {
    language: Language,
    config: DockerEngineConfig,
}

impl DockerEngineFactory {
    pub fn new(language: Language, config: DockerEngineConfig) -> Self {
        Self { language, config }
    }
}

#[async_trait]
impl EngineFactory for DockerEngineFactory {
    fn language(&self) -> Language {
        self.language
    }

    async fn create(&self) -> Result<Arc<dyn Engine>, ExecutionError> {
        let load_error = |message: String| ExecutionError::EngineLoad {
            language: self.language.to_string(),
            message,
        };
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| load_error(format!("cannot connect to Docker: {}", e)))?;
        docker
            .ping()
            .await
            .map_err(|e| load_error(format!("Docker daemon not reachable: {}", e)))?;
        log::info!(
            "Loaded {} engine using Docker image {}",
            self.language,
            self.config.image
        );
        Ok(Arc::new(DockerEngine::new(
            docker,
            self.language,
            self.config.clone(),
        )))
    }
}
