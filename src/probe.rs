use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::time;
use tracing::debug;
use url::Url;

use crate::types::{CheckResponse, ProbeResult, ProbeTarget};

/// Hard deadline for one probe.
pub const DEFAULT_DEADLINE: Duration = Duration::from_millis(8_000);

/// Transport timeout for calls to a remote boundary service.
pub const BOUNDARY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("invalid secret: {0}")]
    Secret(String),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("proxy returned transport error {0}")]
    Transport(i32),
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
    #[error("boundary call failed: {0}")]
    Boundary(#[from] reqwest::Error),
    #[error("boundary reported the candidate as not working")]
    NotWorking,
}

/// One round trip against a candidate.
///
/// Implementations open exactly one connection, perform a minimal
/// request/response exchange, close the connection and return the time from
/// the start of the call to the receipt of the response. Dropping the
/// returned future must release the connection.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn round_trip(&self, target: &ProbeTarget) -> Result<Duration, ProbeError>;
}

/// Runs probes under a hard deadline and folds every failure into
/// [`ProbeResult::Failed`].
#[derive(Clone)]
pub struct ProbeExecutor {
    prober: Arc<dyn Prober>,
    deadline: Duration,
}

impl ProbeExecutor {
    pub fn new(prober: Arc<dyn Prober>) -> Self {
        Self {
            prober,
            deadline: DEFAULT_DEADLINE,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }

    /// Probe one target. The round trip is dropped when the deadline fires,
    /// so a late completion is never observed.
    pub async fn probe(&self, target: &ProbeTarget) -> ProbeResult {
        match time::timeout(self.deadline, self.prober.round_trip(target)).await {
            Ok(Ok(latency)) if latency <= self.deadline => ProbeResult::Working {
                latency_ms: latency.as_millis() as u64,
            },
            Ok(Ok(latency)) => {
                debug!(server = %target.server, port = target.port, ?latency, "probe finished past deadline");
                ProbeResult::Failed
            }
            Ok(Err(e)) => {
                debug!(server = %target.server, port = target.port, error = %e, "probe failed");
                ProbeResult::Failed
            }
            Err(_) => {
                debug!(server = %target.server, port = target.port, "probe timed out");
                ProbeResult::Failed
            }
        }
    }
}

/// Delegates probes to a remote boundary service (`POST {base}/api/check`).
#[derive(Debug, Clone)]
pub struct BoundaryClient {
    http: reqwest::Client,
    endpoint: Url,
}

impl BoundaryClient {
    pub fn new(base: &str) -> anyhow::Result<Self> {
        Self::with_timeout(base, BOUNDARY_TIMEOUT)
    }

    pub fn with_timeout(base: &str, timeout: Duration) -> anyhow::Result<Self> {
        let mut base =
            Url::parse(base).with_context(|| format!("invalid boundary url: {base}"))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let endpoint = base.join("api/check")?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self { http, endpoint })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl Prober for BoundaryClient {
    async fn round_trip(&self, target: &ProbeTarget) -> Result<Duration, ProbeError> {
        let verdict: CheckResponse = self
            .http
            .post(self.endpoint.clone())
            .json(target)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        match verdict {
            CheckResponse {
                ok: true,
                ping: Some(ms),
            } => Ok(Duration::from_millis(ms)),
            _ => Err(ProbeError::NotWorking),
        }
    }
}
