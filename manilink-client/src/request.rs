use std::time::Duration;

use manilink_core::{DEFAULT_REQUEST_TIMEOUT_MS, fingerprint};
use reqwest::{Client, header::CONTENT_TYPE};
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Any way a bounded request can fail. Callers treat every variant the same;
/// the distinction only feeds logs.
#[derive(Debug, Error)]
pub enum RequestFailure {
    #[error("no response within {0:?}")]
    TimedOut(Duration),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected status {0}")]
    Status(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundedReply {
    pub status: u16,
    pub body: Vec<u8>,
}

/// One HTTP exchange with a hard deadline covering both the send and the
/// body read. The in-flight request is dropped (cancelled) on timeout.
#[derive(Debug, Clone)]
pub struct BoundedRequest {
    client: Client,
    timeout: Duration,
}

impl Default for BoundedRequest {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS))
    }
}

impl BoundedRequest {
    pub fn new(timeout: Duration) -> Self {
        Self::with_client(Client::new(), timeout)
    }

    pub fn with_client(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn post_json(
        &self,
        endpoint: &str,
        body: String,
    ) -> Result<BoundedReply, RequestFailure> {
        debug!(
            method = "POST",
            endpoint,
            payload = %fingerprint(&body),
            bytes = body.len(),
            "sending request"
        );

        let exchange = async {
            let response = self
                .client
                .post(endpoint)
                .header(CONTENT_TYPE, "application/json")
                .body(body)
                .send()
                .await?;
            let status = response.status();
            let bytes = response.bytes().await?;
            Ok::<_, reqwest::Error>((status, bytes))
        };

        match timeout(self.timeout, exchange).await {
            Err(_) => {
                warn!(endpoint, timeout = ?self.timeout, "request timed out");
                Err(RequestFailure::TimedOut(self.timeout))
            }
            Ok(Err(err)) => {
                warn!(endpoint, "request failed: {}", err);
                Err(RequestFailure::Transport(err.to_string()))
            }
            Ok(Ok((status, _))) if !status.is_success() => {
                warn!(
                    endpoint,
                    status = status.as_u16(),
                    "request returned non-success status"
                );
                Err(RequestFailure::Status(status.as_u16()))
            }
            Ok(Ok((status, bytes))) => Ok(BoundedReply {
                status: status.as_u16(),
                body: bytes.to_vec(),
            }),
        }
    }
}
