//! Wait for dependent services to become ready.
//!
//! Probes are polled with exponential backoff under a hard deadline. Running
//! out of either attempts or time yields a [`ReadinessTimeout`].

use std::{
    fmt,
    path::PathBuf,
    time::{Duration, Instant},
};

use anyhow::Context;
use backon::{ExponentialBuilder, Retryable};
use serde::{Deserialize, Serialize};

use crate::{
    context::PipelineContext,
    error::{ContextError, ReadinessTimeout},
    fs::FsHandler,
    rpc,
};

/// Bounds on how long and how often a probe is polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessPolicy {
    /// Hard deadline for a probe, in seconds.
    pub timeout_secs: u64,
    /// Delay before the second attempt, in milliseconds.
    pub min_delay_ms: u64,
    /// Upper bound on the delay between attempts, in milliseconds.
    pub max_delay_ms: u64,
    /// Maximum number of retries after the first attempt.
    pub max_attempts: usize,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            min_delay_ms: 500,
            max_delay_ms: 10_000,
            max_attempts: 64,
        }
    }
}

impl ReadinessPolicy {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.min_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_max_times(self.max_attempts)
    }
}

/// Something that answers once a service is up.
///
/// String fields may hold `${KEY}` placeholders, see [`ReadinessProbe::resolve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessProbe {
    /// An Ethereum JSON-RPC endpoint answering `eth_chainId`, optionally
    /// with a specific chain ID.
    JsonRpc {
        url: String,
        expected_chain_id: Option<String>,
    },
    /// A TCP port accepting connections.
    Tcp { addr: String },
    /// A file written by the service once it is initialized.
    File { path: PathBuf },
}

impl fmt::Display for ReadinessProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadinessProbe::JsonRpc { url, .. } => write!(f, "JSON-RPC endpoint {url}"),
            ReadinessProbe::Tcp { addr } => write!(f, "TCP endpoint {addr}"),
            ReadinessProbe::File { path } => write!(f, "file {}", path.display()),
        }
    }
}

impl ReadinessProbe {
    pub fn json_rpc(url: impl Into<String>) -> Self {
        ReadinessProbe::JsonRpc {
            url: url.into(),
            expected_chain_id: None,
        }
    }

    /// Only accept a JSON-RPC endpoint reporting this chain ID.
    pub fn with_chain_id(self, chain_id: impl Into<String>) -> Self {
        match self {
            ReadinessProbe::JsonRpc { url, .. } => ReadinessProbe::JsonRpc {
                url,
                expected_chain_id: Some(chain_id.into()),
            },
            other => other,
        }
    }

    pub fn tcp(addr: impl Into<String>) -> Self {
        ReadinessProbe::Tcp { addr: addr.into() }
    }

    pub fn resolve(&self, ctx: &PipelineContext) -> Result<ReadinessProbe, ContextError> {
        Ok(match self {
            ReadinessProbe::JsonRpc {
                url,
                expected_chain_id,
            } => ReadinessProbe::JsonRpc {
                url: ctx.render(url)?,
                expected_chain_id: expected_chain_id
                    .as_deref()
                    .map(|id| ctx.render(id))
                    .transpose()?,
            },
            ReadinessProbe::Tcp { addr } => ReadinessProbe::Tcp {
                addr: ctx.render(addr)?,
            },
            ReadinessProbe::File { path } => ReadinessProbe::File { path: path.clone() },
        })
    }

    /// Single attempt.
    async fn check(&self, client: &reqwest::Client) -> anyhow::Result<()> {
        match self {
            ReadinessProbe::JsonRpc {
                url,
                expected_chain_id,
            } => {
                let chain_id = rpc::chain_id(client, url).await?;
                let expected = expected_chain_id
                    .as_deref()
                    .map(str::parse::<u64>)
                    .transpose()
                    .context("Invalid expected chain ID")?;
                match expected {
                    Some(expected) if expected != chain_id => {
                        anyhow::bail!("chain ID mismatch: expected {expected}, got {chain_id}")
                    }
                    _ => Ok(()),
                }
            }
            ReadinessProbe::Tcp { addr } => {
                tokio::net::TcpStream::connect(addr.as_str())
                    .await
                    .with_context(|| format!("Failed to connect to {addr}"))?;
                Ok(())
            }
            ReadinessProbe::File { path } => {
                if FsHandler::is_non_empty_file(path) {
                    Ok(())
                } else {
                    anyhow::bail!("{} does not exist yet", path.display())
                }
            }
        }
    }
}

/// Poll `probe` until it succeeds or `policy` is exhausted.
pub async fn wait_ready(probe: &ReadinessProbe, policy: &ReadinessPolicy) -> Result<(), ReadinessTimeout> {
    let started = Instant::now();
    let timed_out = || ReadinessTimeout {
        target: probe.to_string(),
        waited: started.elapsed(),
    };

    tracing::info!(target = %probe, timeout = ?policy.timeout(), "Waiting for readiness");

    if let ReadinessProbe::File { path } = probe {
        return FsHandler::wait_for_file(path, policy.timeout())
            .await
            .map_err(|e| {
                tracing::debug!(err = %format!("{e:#}"), "File probe failed");
                timed_out()
            });
    }

    let client = rpc::create_client().map_err(|e| {
        tracing::error!(err = %format!("{e:#}"), "Failed to create probe client");
        timed_out()
    })?;

    let attempts = (|| async { probe.check(&client).await })
        .retry(policy.backoff())
        .sleep(tokio::time::sleep)
        .notify(|err: &anyhow::Error, delay: Duration| {
            tracing::debug!(target = %probe, err = %err, ?delay, "Not ready yet, retrying");
        });

    match tokio::time::timeout(policy.timeout(), attempts).await {
        Ok(Ok(())) => {
            tracing::info!(target = %probe, elapsed = ?started.elapsed(), "Ready");
            Ok(())
        }
        Ok(Err(e)) => {
            tracing::warn!(target = %probe, err = %e, "Gave up waiting for readiness");
            Err(timed_out())
        }
        Err(_) => Err(timed_out()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;

    fn quick_policy() -> ReadinessPolicy {
        ReadinessPolicy {
            timeout_secs: 1,
            min_delay_ms: 10,
            max_delay_ms: 50,
            max_attempts: 1000,
        }
    }

    #[tokio::test]
    async fn test_tcp_probe_ready() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        wait_ready(&ReadinessProbe::tcp(addr), &quick_policy())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_tcp_probe_times_out() {
        // Bind then drop to get a port nobody listens on.
        let addr = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };

        let err = wait_ready(&ReadinessProbe::tcp(addr.clone()), &quick_policy())
            .await
            .unwrap_err();
        assert_eq!(err.target, format!("TCP endpoint {addr}"));
        assert!(err.waited >= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_attempts_exhausted_before_deadline() {
        let addr = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().to_string()
        };
        let policy = ReadinessPolicy {
            timeout_secs: 30,
            max_attempts: 2,
            ..quick_policy()
        };

        let err = wait_ready(&ReadinessProbe::tcp(addr), &policy)
            .await
            .unwrap_err();
        assert!(err.waited < Duration::from_secs(30));
    }

    #[test]
    fn test_resolve_json_rpc_probe() {
        let mut ctx = PipelineContext::new();
        ctx.set("L2_CHAIN_ID", "42069").unwrap();

        let probe = ReadinessProbe::json_rpc("http://127.0.0.1:8545")
            .with_chain_id("${L2_CHAIN_ID}")
            .resolve(&ctx)
            .unwrap();
        assert_eq!(
            probe,
            ReadinessProbe::JsonRpc {
                url: "http://127.0.0.1:8545".to_string(),
                expected_chain_id: Some("42069".to_string()),
            }
        );
        assert_eq!(probe.to_string(), "JSON-RPC endpoint http://127.0.0.1:8545");
    }

    #[tokio::test]
    async fn test_file_probe() {
        let tmp_dir = TempDir::new("rollstack-ready").unwrap();
        let path = tmp_dir.path().join("jwt.txt");
        std::fs::write(&path, "secret").unwrap();

        wait_ready(&ReadinessProbe::File { path }, &quick_policy())
            .await
            .unwrap();
    }
}
