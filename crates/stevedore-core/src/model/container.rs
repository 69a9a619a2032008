use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Default readiness budget when a wait strategy does not set one.
pub const DEFAULT_STARTUP_TIMEOUT_SECONDS: u64 = 60;

fn default_startup_timeout() -> u64 {
    DEFAULT_STARTUP_TIMEOUT_SECONDS
}

fn default_http_path() -> String {
    "/".to_string()
}

fn default_expected_status() -> u16 {
    200
}

fn default_start_timeout() -> u64 {
    60
}

fn default_auto_remove() -> bool {
    true
}

/// One container to execute: image, process, wiring, and lifecycle policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ContainerSpec {
    /// Display name; falls back to the node name when empty.
    pub name: String,
    /// Image reference. Required.
    pub image: String,
    pub command: Vec<String>,
    pub entrypoint: Vec<String>,
    pub env: HashMap<String, String>,
    /// Port mappings as `"host:container"` strings. A host part of `0`
    /// requests an ephemeral port.
    pub ports: Vec<String>,
    /// Host path to container path bind mounts.
    pub volumes: HashMap<String, String>,
    pub working_dir: Option<String>,
    pub user: Option<String>,
    pub labels: HashMap<String, String>,
    pub wait: WaitStrategy,
    /// Bounds container create+start, in seconds.
    pub start_timeout_seconds: u64,
    /// Bounds the wait for exit, in seconds. `0` means no limit.
    pub run_timeout_seconds: u64,
    /// Remove the container after it terminates.
    pub auto_remove: bool,
}

impl Default for ContainerSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            image: String::new(),
            command: Vec::new(),
            entrypoint: Vec::new(),
            env: HashMap::new(),
            ports: Vec::new(),
            volumes: HashMap::new(),
            working_dir: None,
            user: None,
            labels: HashMap::new(),
            wait: WaitStrategy::None,
            start_timeout_seconds: default_start_timeout(),
            run_timeout_seconds: 0,
            auto_remove: default_auto_remove(),
        }
    }
}

impl ContainerSpec {
    /// Minimal spec for an image; everything else defaulted.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Self::default()
        }
    }

    /// Whether this spec declares a process to run. Specs without one are
    /// treated as services: the runner returns once the wait strategy is
    /// satisfied instead of awaiting exit.
    pub fn has_process(&self) -> bool {
        !self.command.is_empty() || !self.entrypoint.is_empty()
    }
}

/// Policy that defines when a started container counts as ready.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WaitStrategy {
    /// Ready immediately after start.
    None,
    /// Ready when a log line contains the given substring.
    Log {
        message: String,
        #[serde(default = "default_startup_timeout")]
        startup_timeout_seconds: u64,
    },
    /// Ready when the mapped host port accepts a TCP connection.
    Port {
        port: u16,
        #[serde(default = "default_startup_timeout")]
        startup_timeout_seconds: u64,
    },
    /// Ready when `GET http://127.0.0.1:<host_port><path>` returns the
    /// expected status.
    Http {
        port: u16,
        #[serde(default = "default_http_path")]
        path: String,
        #[serde(default = "default_expected_status")]
        expected_status: u16,
        #[serde(default = "default_startup_timeout")]
        startup_timeout_seconds: u64,
    },
    /// Ready when the container runtime reports the health check as healthy.
    Healthy {
        #[serde(default = "default_startup_timeout")]
        startup_timeout_seconds: u64,
    },
}

impl Default for WaitStrategy {
    fn default() -> Self {
        WaitStrategy::None
    }
}

impl WaitStrategy {
    /// The startup budget for this strategy, if it has one.
    pub fn startup_timeout_seconds(&self) -> Option<u64> {
        match self {
            WaitStrategy::None => None,
            WaitStrategy::Log {
                startup_timeout_seconds,
                ..
            }
            | WaitStrategy::Port {
                startup_timeout_seconds,
                ..
            }
            | WaitStrategy::Http {
                startup_timeout_seconds,
                ..
            }
            | WaitStrategy::Healthy {
                startup_timeout_seconds,
            } => Some(*startup_timeout_seconds),
        }
    }
}
