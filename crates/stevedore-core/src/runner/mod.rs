//! Drives one container from start to terminal state: create, apply the
//! wait strategy, await exit, collect bounded output tails, tear down.

mod wait;

pub use wait::await_ready;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::engine::{StepExecutor, StepRun};
use crate::error::{Error, Result};
use crate::model::{NodeResult, NodeStatus};
use crate::runtime::{ContainerRuntime, LaunchSpec, LogChunk, RunningContainer};

/// Tunables for container execution.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Byte budget per output stream; older chunks are evicted first.
    pub max_output_bytes: usize,
    /// Poll cadence for port/http/health wait strategies.
    pub poll_interval: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_output_bytes: 256 * 1024,
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// Executes rendered container specs against a [`ContainerRuntime`].
pub struct ContainerRunner {
    runtime: Arc<dyn ContainerRuntime>,
    config: RunnerConfig,
}

impl ContainerRunner {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: RunnerConfig) -> Self {
        Self { runtime, config }
    }

    /// Run one container to a terminal state. Never returns `Err`: every
    /// failure mode is folded into the returned [`NodeResult`].
    pub async fn run(
        &self,
        node: &str,
        launch: &LaunchSpec,
        cancel: &CancellationToken,
    ) -> NodeResult {
        let started_at = Utc::now();
        let spec = &launch.spec;

        // Create + start, bounded by start_timeout.
        let start_budget = Duration::from_secs(spec.start_timeout_seconds.max(1));
        let container = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return self.failed(node, started_at, &Error::Canceled("canceled before start".into()));
            }
            started = tokio::time::timeout(start_budget, self.runtime.create_and_start(launch)) => {
                match started {
                    Ok(Ok(container)) => container,
                    Ok(Err(e)) => return self.failed(node, started_at, &e),
                    Err(_) => {
                        return self.failed(
                            node,
                            started_at,
                            &Error::Container(format!(
                                "container did not start within {}s",
                                spec.start_timeout_seconds
                            )),
                        );
                    }
                }
            }
        };

        debug!(node, container = %container.id, "container started");

        // Readiness gating.
        if let Err(e) = await_ready(
            self.runtime.as_ref(),
            &container,
            &spec.wait,
            self.config.poll_interval,
            cancel,
        )
        .await
        {
            let (stdout, stderr) = self.collect_tails(&container.id).await;
            self.teardown(&container.id, true).await;
            return self.finish(node, started_at, &container, -1, stdout, stderr, Some(e));
        }

        // Specs without a process are services: ready means done, and the
        // container is left running for dependents.
        if !spec.has_process() && spec.wait != crate::model::WaitStrategy::None {
            let (stdout, stderr) = self.collect_tails(&container.id).await;
            return self.finish(node, started_at, &container, 0, stdout, stderr, None);
        }

        // Await exit, bounded by run_timeout when set.
        let exit = self.await_exit(spec, &container, cancel).await;

        let (stdout, stderr) = self.collect_tails(&container.id).await;

        if spec.auto_remove {
            self.teardown(&container.id, exit.is_err()).await;
        }

        match exit {
            Ok(code) => {
                let error = (code != 0).then(|| Error::Container(format!("exited with code {code}")));
                self.finish(node, started_at, &container, code, stdout, stderr, error)
            }
            Err(e) => self.finish(node, started_at, &container, -1, stdout, stderr, Some(e)),
        }
    }

    async fn await_exit(
        &self,
        spec: &crate::model::ContainerSpec,
        container: &RunningContainer,
        cancel: &CancellationToken,
    ) -> Result<i64> {
        let wait = self.runtime.wait_exit(&container.id);

        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                self.teardown(&container.id, true).await;
                Err(Error::Canceled("canceled while running".into()))
            }

            exit = async {
                if spec.run_timeout_seconds > 0 {
                    match tokio::time::timeout(
                        Duration::from_secs(spec.run_timeout_seconds),
                        wait,
                    )
                    .await
                    {
                        Ok(inner) => inner,
                        Err(_) => Err(Error::RunTimeout(format!(
                            "container did not exit within {}s",
                            spec.run_timeout_seconds
                        ))),
                    }
                } else {
                    wait.await
                }
            } => {
                if matches!(exit, Err(Error::RunTimeout(_))) {
                    self.teardown(&container.id, true).await;
                }
                exit
            }
        }
    }

    async fn collect_tails(&self, id: &str) -> (String, String) {
        let mut stdout = TailBuffer::new(self.config.max_output_bytes);
        let mut stderr = TailBuffer::new(self.config.max_output_bytes);

        match self.runtime.logs(id, false).await {
            Ok(mut stream) => {
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(LogChunk::Stdout(text)) => stdout.push(text),
                        Ok(LogChunk::Stderr(text)) => stderr.push(text),
                        Err(e) => {
                            warn!(container = %id, error = %e, "log collection interrupted");
                            break;
                        }
                    }
                }
            }
            Err(e) => warn!(container = %id, error = %e, "could not collect logs"),
        }

        (stdout.into_string(), stderr.into_string())
    }

    async fn teardown(&self, id: &str, force: bool) {
        if let Err(e) = self.runtime.stop_and_remove(id, force).await {
            warn!(container = %id, error = %e, "container teardown failed");
        }
    }

    fn failed(
        &self,
        node: &str,
        started_at: chrono::DateTime<Utc>,
        error: &Error,
    ) -> NodeResult {
        let mut result = NodeResult::failed(node, error);
        result.started_at = started_at;
        result.finished_at = Utc::now();
        result.duration_ms = duration_ms(started_at, result.finished_at);
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        node: &str,
        started_at: chrono::DateTime<Utc>,
        container: &RunningContainer,
        exit_code: i64,
        stdout: String,
        stderr: String,
        error: Option<Error>,
    ) -> NodeResult {
        let finished_at = Utc::now();
        let success = error.is_none();
        NodeResult {
            node: node.to_string(),
            status: if success {
                NodeStatus::Succeeded
            } else {
                NodeStatus::Failed
            },
            container_id: Some(container.id.clone()),
            exit_code,
            stdout,
            stderr,
            host_ports: container.host_ports.clone(),
            started_at,
            finished_at,
            duration_ms: duration_ms(started_at, finished_at),
            success,
            error: error.as_ref().map(ToString::to_string),
            error_kind: error.as_ref().map(Error::kind),
            outputs: HashMap::new(),
        }
    }
}

fn duration_ms(start: chrono::DateTime<Utc>, end: chrono::DateTime<Utc>) -> u64 {
    (end - start).num_milliseconds().max(0) as u64
}

/// Byte-budgeted ring of output chunks; oldest evicted first.
struct TailBuffer {
    chunks: VecDeque<String>,
    bytes: usize,
    max_bytes: usize,
    truncated: bool,
}

impl TailBuffer {
    fn new(max_bytes: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            bytes: 0,
            max_bytes,
            truncated: false,
        }
    }

    fn push(&mut self, chunk: String) {
        self.bytes += chunk.len();
        self.chunks.push_back(chunk);
        while self.bytes > self.max_bytes {
            if let Some(old) = self.chunks.pop_front() {
                self.bytes -= old.len();
                self.truncated = true;
            } else {
                break;
            }
        }
    }

    fn into_string(self) -> String {
        let mut out = String::with_capacity(self.bytes);
        if self.truncated {
            out.push_str("[...truncated...]\n");
        }
        for chunk in self.chunks {
            out.push_str(&chunk);
        }
        out
    }
}

/// Production step executor: plugs the container runner into the engine.
pub struct ContainerStepExecutor {
    runner: ContainerRunner,
}

impl ContainerStepExecutor {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: RunnerConfig) -> Self {
        Self {
            runner: ContainerRunner::new(runtime, config),
        }
    }
}

impl StepExecutor for ContainerStepExecutor {
    async fn execute(&self, step: StepRun) -> NodeResult {
        self.runner.run(&step.node, &step.launch, &step.cancel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_buffer_keeps_newest() {
        let mut tail = TailBuffer::new(10);
        tail.push("aaaa".into());
        tail.push("bbbb".into());
        tail.push("cccc".into());
        let text = tail.into_string();
        assert!(text.starts_with("[...truncated...]"));
        assert!(text.contains("bbbb"));
        assert!(text.contains("cccc"));
        assert!(!text.contains("aaaa"));
    }

    #[test]
    fn tail_buffer_under_budget_untouched() {
        let mut tail = TailBuffer::new(1024);
        tail.push("hello ".into());
        tail.push("world".into());
        assert_eq!(tail.into_string(), "hello world");
    }
}
