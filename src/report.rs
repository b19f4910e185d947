use std::time::Duration;

use reqwest::{header, StatusCode};
use tracing::{info, warn};

use crate::config::{DeliveryConfig, ServerConfig};
use crate::error::{AttemptFailure, DeliveryError};
use crate::types::ReportPayload;

/// Path of the results endpoint on the management service.
pub const RESULTS_PATH: &str = "/api/v1/ra_api";

/// Bounded exponential backoff for delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Wait before retry number `retry` (1-based): `base * 2^retry`.
    pub fn backoff(&self, retry: u32) -> Duration {
        self.backoff_base
            .saturating_mul(2u32.saturating_pow(retry.min(16)))
    }
}

/// Posts finished job results to the management service.
#[derive(Debug, Clone)]
pub struct ReportDelivery {
    endpoint: String,
    auth_header: String,
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl ReportDelivery {
    pub fn new(server: &ServerConfig, delivery: &DeliveryConfig) -> Result<Self, DeliveryError> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(!server.verify_tls)
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .timeout(delivery.request_timeout)
            .build()
            .map_err(DeliveryError::Request)?;

        Ok(Self {
            endpoint: format!("{}{}", server.url.trim_end_matches('/'), RESULTS_PATH),
            auth_header: format!("Token token=\"{}\"", server.api_token),
            client,
            policy: RetryPolicy {
                max_retries: delivery.max_retries,
                backoff_base: delivery.backoff_base,
            },
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Deliver one payload.
    ///
    /// 4xx answers are final. 5xx answers, any other non-200 status and
    /// transport failures are retried with backoff until the policy runs out.
    pub async fn send(&self, payload: &ReportPayload) -> Result<(), DeliveryError> {
        let body = serde_json::to_vec(payload)?;
        let jid = payload.jid.as_str();
        let attempts = self.policy.max_attempts();
        let mut last = None;

        for attempt in 0..attempts {
            if attempt > 0 {
                let wait = self.policy.backoff(attempt);
                info!(jid, attempt, ?wait, "retrying delivery after backoff");
                tokio::time::sleep(wait).await;
            }

            let response = self
                .client
                .post(&self.endpoint)
                .header(header::AUTHORIZATION, &self.auth_header)
                .header(header::CONTENT_TYPE, "application/json")
                .body(body.clone())
                .send()
                .await;

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    warn!(jid, attempt, error = %e, "delivery request failed");
                    last = Some(AttemptFailure::Transport(e));
                    continue;
                }
            };

            let status = response.status();
            if status == StatusCode::OK {
                info!(jid, attempt, hosts = payload.hosts.len(), "results accepted by server");
                return Ok(());
            }

            let text = response.text().await.unwrap_or_default();
            warn!(jid, attempt, status = status.as_u16(), body = %text, "server rejected results");

            if status.is_client_error() {
                return Err(DeliveryError::Rejected {
                    status: status.as_u16(),
                    body: text,
                });
            }
            last = Some(AttemptFailure::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        let last = last.unwrap_or(AttemptFailure::Status {
            status: 0,
            body: "no attempt made".into(),
        });
        warn!(jid, attempts, error = %last, "giving up on delivery");
        Err(DeliveryError::Exhausted { attempts, last })
    }
}
