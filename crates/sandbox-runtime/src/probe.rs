//! Readiness probing
//!
//! [`ReadinessProbe::wait_until_alive`] polls a [`LivenessCheck`] until it
//! succeeds, the supervised process dies, or the deadline passes. The only
//! suspension points are the check itself and the pause between attempts. A
//! check already in flight is never cancelled, so the timeout error can
//! arrive up to one check timeout after the nominal deadline.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{LivenessError, RuntimeError};
use crate::supervisor::SupervisedProcess;
use crate::Result;

/// Path of the action-execution server's liveness endpoint.
pub const ALIVE_PATH: &str = "/alive";

/// Per-request timeout of the HTTP liveness check.
pub const DEFAULT_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// One liveness check against a sandbox's advertised URL.
#[async_trait]
pub trait LivenessCheck: Send + Sync {
    async fn check(&self, base_url: &str) -> std::result::Result<(), LivenessError>;
}

/// `GET {base_url}/alive`; any 2xx response means alive.
#[derive(Debug, Clone)]
pub struct HttpLivenessCheck {
    client: reqwest::Client,
}

impl HttpLivenessCheck {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("sandbox-runtime/", env!("CARGO_PKG_VERSION")))
            .timeout(request_timeout)
            .build()
            .map_err(|e| RuntimeError::Configuration(format!("failed to build HTTP client: {e}")))?;
        Ok(HttpLivenessCheck { client })
    }
}

#[async_trait]
impl LivenessCheck for HttpLivenessCheck {
    async fn check(&self, base_url: &str) -> std::result::Result<(), LivenessError> {
        let url = format!("{}{}", base_url.trim_end_matches('/'), ALIVE_PATH);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|source| LivenessError::Request {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(LivenessError::Status {
                url,
                status: status.as_u16(),
            })
        }
    }
}

/// Polls for readiness with a fixed pause between attempts.
#[derive(Debug, Clone)]
pub struct ReadinessProbe {
    interval: Duration,
}

impl Default for ReadinessProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl ReadinessProbe {
    pub fn new(interval: Duration) -> Self {
        ReadinessProbe { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Wait until `liveness` succeeds against `base_url`.
    ///
    /// Fails with [`RuntimeError::ProcessExited`] as soon as the process is
    /// seen dead, and with [`RuntimeError::Timeout`] (carrying the last
    /// liveness failure) once `timeout` has elapsed, never earlier.
    pub async fn wait_until_alive(
        &self,
        process: &mut SupervisedProcess,
        liveness: &dyn LivenessCheck,
        base_url: &str,
        timeout: Duration,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut last_error: Option<LivenessError> = None;
        let mut attempts: u32 = 0;

        while Instant::now() < deadline {
            if let Some(status) = process.try_exit_status()? {
                return Err(RuntimeError::ProcessExited {
                    code: status.code(),
                });
            }

            attempts += 1;
            match liveness.check(base_url).await {
                Ok(()) => {
                    info!(attempts, url = base_url, "Sandbox runtime is alive");
                    return Ok(());
                }
                Err(e) => {
                    debug!(attempts, error = %e, "Sandbox runtime not ready yet");
                    last_error = Some(e);
                    tokio::time::sleep(self.interval).await;
                }
            }
        }

        Err(RuntimeError::Timeout {
            timeout,
            last_error,
        })
    }
}
