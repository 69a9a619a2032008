//! The container runtime boundary.
//!
//! The engine and runner talk to containers only through
//! [`ContainerRuntime`]; production uses the Docker implementation, tests
//! use in-memory fakes.

mod docker;

pub use docker::DockerRuntime;

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::error::Result;
use crate::model::{ContainerSpec, ResourceLimits};

/// A bind mount added by artifact staging, on top of the spec's volumes.
#[derive(Debug, Clone)]
pub struct Bind {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

/// Everything needed to start one container: the rendered spec plus
/// staging binds and advisory resource limits.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub spec: ContainerSpec,
    pub extra_binds: Vec<Bind>,
    pub resources: Option<ResourceLimits>,
}

impl LaunchSpec {
    pub fn new(spec: ContainerSpec) -> Self {
        Self {
            spec,
            extra_binds: Vec::new(),
            resources: None,
        }
    }
}

/// A started container and its resolved port mappings.
#[derive(Debug, Clone)]
pub struct RunningContainer {
    pub id: String,
    /// Container port to host port, after ephemeral assignment.
    pub host_ports: HashMap<u16, u16>,
}

/// One chunk of container output, tagged by stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogChunk {
    Stdout(String),
    Stderr(String),
}

impl LogChunk {
    pub fn text(&self) -> &str {
        match self {
            LogChunk::Stdout(s) | LogChunk::Stderr(s) => s,
        }
    }
}

/// Runtime-reported health of a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    /// Image defines no health check.
    None,
    Starting,
    Healthy,
    Unhealthy,
}

/// Minimal surface the engine needs from a container runtime.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create and start a container. The returned id is used for every
    /// subsequent call.
    async fn create_and_start(&self, launch: &LaunchSpec) -> Result<RunningContainer>;

    /// Block until the container exits, returning its exit code.
    async fn wait_exit(&self, id: &str) -> Result<i64>;

    /// Stream log output. With `follow` the stream stays open until the
    /// container stops; without it the stream ends at the current tail.
    async fn logs(&self, id: &str, follow: bool) -> Result<BoxStream<'static, Result<LogChunk>>>;

    async fn health(&self, id: &str) -> Result<HealthStatus>;

    /// Best-effort kill and remove.
    async fn stop_and_remove(&self, id: &str, force: bool) -> Result<()>;
}
