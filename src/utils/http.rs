use std::time::Duration;

use anyhow::Result;
use serde::Serialize;
use tracing::{info, warn};

/// Retry policy for outbound JSON posts. Attempt `n` waits `backoff_base * 2^n` before retrying.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub timeout: Duration,
    pub backoff_base: Duration,
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_base * 2u32.saturating_pow(attempt)
    }
}

pub async fn post_json_with_retry<T: Serialize + ?Sized>(
    client: &reqwest::Client,
    url: &str,
    body: &T,
    policy: &RetryPolicy,
) -> Result<()> {
    let attempts = policy.attempts.max(1);
    let mut last_error = None;

    for attempt in 0..attempts {
        let outcome = client
            .post(url)
            .timeout(policy.timeout)
            .json(body)
            .send()
            .await
            .and_then(|response| response.error_for_status());

        match outcome {
            Ok(response) => {
                info!("Posted notification to {} ({})", url, response.status());
                return Ok(());
            }
            Err(e) => {
                warn!("Notification to {} failed (attempt {}/{}): {}", url, attempt + 1, attempts, e);
                last_error = Some(e);
                if attempt + 1 < attempts {
                    tokio::time::sleep(policy.backoff(attempt)).await;
                }
            }
        }
    }

    Err(anyhow::anyhow!(
        "notification to {} failed after {} attempts: {}",
        url,
        attempts,
        last_error.map(|e| e.to_string()).unwrap_or_default()
    ))
}
