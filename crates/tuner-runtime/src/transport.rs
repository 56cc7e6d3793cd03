use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("upload rejected: status={status}")]
    Status { status: u16 },
    #[error("upload request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Moves object bytes to a presigned URL.
#[async_trait]
pub trait ObjectTransport: Send + Sync + 'static {
    async fn put(&self, url: &str, bytes: Vec<u8>, content_type: &str)
        -> Result<(), TransferError>;
}

pub struct HttpTransport {
    client: reqwest::Client,
    next_request_id: AtomicU64,
}

impl HttpTransport {
    pub fn new() -> Result<Self, TransferError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(120))
            .build()?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            next_request_id: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl ObjectTransport for HttpTransport {
    async fn put(
        &self,
        url: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), TransferError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let len = bytes.len() as u64;
        let resp = http_with_retry(request_id, || {
            self.client
                .put(url)
                .header(reqwest::header::CONTENT_TYPE, content_type)
                .body(bytes.clone())
                .send()
        })
        .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(TransferError::Status {
                status: status.as_u16(),
            });
        }
        debug!(bytes = len, status = status.as_u16(), "object transferred");
        Ok(())
    }
}

/// Issues `f` until it yields a non-transient response, at most 5 times.
///
/// 408, 429, 5xx and connect/timeout errors are transient and retried with
/// exponential backoff (50ms doubling, capped at 1s) plus jitter derived from
/// `request_id`. The final response is returned whatever its status.
pub async fn http_with_retry<F, Fut>(
    request_id: u64,
    mut f: F,
) -> Result<reqwest::Response, reqwest::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<reqwest::Response, reqwest::Error>>,
{
    const MAX_ATTEMPTS: usize = 5;
    const BASE_DELAY_MS: u64 = 50;
    const MAX_DELAY_MS: u64 = 1000;

    let mut attempt: usize = 0;
    let mut delay_ms: u64 = BASE_DELAY_MS;
    loop {
        attempt = attempt.saturating_add(1);
        let transient = match f().await {
            Ok(resp) => {
                let status = resp.status();
                let transient = status == reqwest::StatusCode::TOO_MANY_REQUESTS
                    || status == reqwest::StatusCode::REQUEST_TIMEOUT
                    || status.is_server_error();
                if !transient || attempt >= MAX_ATTEMPTS {
                    return Ok(resp);
                }
                format!("status={status}")
            }
            Err(err) => {
                let transient = err.is_timeout() || err.is_connect();
                if !transient || attempt >= MAX_ATTEMPTS {
                    return Err(err);
                }
                err.to_string()
            }
        };

        let jitter = tuner_observe::time::unix_time_ms().wrapping_add(request_id) % 37;
        debug!(
            request_id,
            attempt = attempt as u64,
            reason = %transient,
            "retrying transient http failure"
        );
        tokio::time::sleep(Duration::from_millis(delay_ms.saturating_add(jitter))).await;
        delay_ms = (delay_ms.saturating_mul(2)).min(MAX_DELAY_MS);
    }
}
