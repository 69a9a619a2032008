//! Wait strategies: how a started container proves it is ready.

use std::time::Duration;

use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::WaitStrategy;
use crate::runtime::{ContainerRuntime, HealthStatus, RunningContainer};

/// Block until the container satisfies its wait strategy.
///
/// Each strategy is bounded by its own `startup_timeout`; cancellation wins
/// over everything.
pub async fn await_ready(
    runtime: &dyn ContainerRuntime,
    container: &RunningContainer,
    strategy: &WaitStrategy,
    poll_interval: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    let Some(startup_seconds) = strategy.startup_timeout_seconds() else {
        return Ok(());
    };
    let startup = Duration::from_secs(startup_seconds);

    let probe = async {
        match strategy {
            WaitStrategy::None => Ok(()),
            WaitStrategy::Log { message, .. } => {
                wait_for_log(runtime, &container.id, message).await
            }
            WaitStrategy::Port { port, .. } => {
                wait_for_port(container, *port, poll_interval).await
            }
            WaitStrategy::Http {
                port,
                path,
                expected_status,
                ..
            } => wait_for_http(container, *port, path, *expected_status, poll_interval).await,
            WaitStrategy::Healthy { .. } => {
                wait_for_healthy(runtime, &container.id, poll_interval).await
            }
        }
    };

    tokio::select! {
        biased;

        _ = cancel.cancelled() => Err(Error::Canceled("canceled while waiting for readiness".into())),

        result = tokio::time::timeout(startup, probe) => match result {
            Ok(inner) => inner,
            Err(_) => Err(Error::WaitTimeout(format!(
                "container not ready within {startup_seconds}s ({})",
                describe(strategy)
            ))),
        },
    }
}

fn describe(strategy: &WaitStrategy) -> String {
    match strategy {
        WaitStrategy::None => "none".into(),
        WaitStrategy::Log { message, .. } => format!("log contains '{message}'"),
        WaitStrategy::Port { port, .. } => format!("port {port} open"),
        WaitStrategy::Http {
            port,
            path,
            expected_status,
            ..
        } => format!("http {port}{path} -> {expected_status}"),
        WaitStrategy::Healthy { .. } => "health check healthy".into(),
    }
}

fn host_port(container: &RunningContainer, port: u16) -> u16 {
    container.host_ports.get(&port).copied().unwrap_or(port)
}

async fn wait_for_log(runtime: &dyn ContainerRuntime, id: &str, message: &str) -> Result<()> {
    let mut stream = runtime.logs(id, true).await?;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        if chunk.text().contains(message) {
            debug!(container = %id, "log wait matched");
            return Ok(());
        }
    }
    Err(Error::Container(format!(
        "log stream ended before '{message}' appeared"
    )))
}

async fn wait_for_port(
    container: &RunningContainer,
    port: u16,
    poll_interval: Duration,
) -> Result<()> {
    let host_port = host_port(container, port);
    loop {
        match TcpStream::connect(("127.0.0.1", host_port)).await {
            Ok(_) => {
                debug!(container = %container.id, host_port, "port wait connected");
                return Ok(());
            }
            Err(_) => tokio::time::sleep(poll_interval).await,
        }
    }
}

async fn wait_for_http(
    container: &RunningContainer,
    port: u16,
    path: &str,
    expected_status: u16,
    poll_interval: Duration,
) -> Result<()> {
    let host_port = host_port(container, port);
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    let url = format!("http://127.0.0.1:{host_port}{path}");

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .map_err(|e| Error::Internal(format!("building http client: {e}")))?;

    loop {
        match client.get(&url).send().await {
            Ok(response) if response.status().as_u16() == expected_status => {
                debug!(container = %container.id, url = %url, "http wait satisfied");
                return Ok(());
            }
            _ => tokio::time::sleep(poll_interval).await,
        }
    }
}

async fn wait_for_healthy(
    runtime: &dyn ContainerRuntime,
    id: &str,
    poll_interval: Duration,
) -> Result<()> {
    loop {
        match runtime.health(id).await? {
            HealthStatus::Healthy => {
                debug!(container = %id, "health wait satisfied");
                return Ok(());
            }
            HealthStatus::Unhealthy => {
                return Err(Error::Container("health check reported unhealthy".into()));
            }
            HealthStatus::None => {
                return Err(Error::Container(
                    "wait strategy is 'healthy' but the image defines no health check".into(),
                ));
            }
            HealthStatus::Starting => tokio::time::sleep(poll_interval).await,
        }
    }
}
