// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Outbound HTTP plumbing shared by the provider and identity clients.
//!
//! Failures are split into transient (timeouts, connect errors, 429, 5xx)
//! and permanent (everything else). Only transient failures are retried.

use backoff::future::retry_notify;
use backoff::ExponentialBackoff;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;

use crate::config::Config;
use crate::error::{AppError, Result};

/// Build the HTTP client used for every outbound call.
pub fn http_client(config: &Config) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(config.request_timeout_secs))
        .connect_timeout(Duration::from_secs(config.request_timeout_secs.min(10)))
        .build()
        .map_err(|e| AppError::Internal(anyhow::anyhow!("HTTP client init failed: {}", e)))
}

/// Classify a transport-level error.
pub fn send_error(context: &str, e: reqwest::Error) -> AppError {
    if e.is_timeout() || e.is_connect() || e.is_request() {
        AppError::UpstreamTransient(format!("{}: {}", context, e))
    } else {
        AppError::UpstreamPermanent(format!("{}: {}", context, e))
    }
}

/// Map a non-success status to an error.
pub async fn check_response(context: &str, response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    if status.as_u16() == 429 {
        tracing::warn!(context, "Upstream rate limit hit (429)");
        return Err(AppError::UpstreamTransient(format!("{}: rate limited", context)));
    }
    if status.is_server_error() {
        return Err(AppError::UpstreamTransient(format!(
            "{}: HTTP {}: {}",
            context, status, body
        )));
    }
    Err(AppError::UpstreamPermanent(format!(
        "{}: HTTP {}: {}",
        context, status, body
    )))
}

/// Check response and parse JSON body.
pub async fn check_response_json<T: DeserializeOwned>(
    context: &str,
    response: reqwest::Response,
) -> Result<T> {
    check_response(context, response)
        .await?
        .json()
        .await
        .map_err(|e| AppError::UpstreamPermanent(format!("{}: JSON parse error: {}", context, e)))
}

/// Run `call` until it succeeds, fails permanently, or has been tried
/// `max_attempts` times, sleeping with exponential backoff in between.
pub async fn with_retry<T, F, Fut>(max_attempts: u32, operation: &str, mut call: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = max_attempts.max(1);
    let backoff = ExponentialBackoff {
        initial_interval: Duration::from_millis(100),
        max_interval: Duration::from_secs(5),
        max_elapsed_time: Some(Duration::from_secs(60)),
        ..Default::default()
    };

    let mut attempt = 0u32;
    retry_notify(
        backoff,
        || {
            attempt += 1;
            let current = attempt;
            let fut = call();
            async move {
                match fut.await {
                    Ok(value) => Ok(value),
                    Err(e) if e.is_retryable() && current < max_attempts => {
                        Err(backoff::Error::transient(e))
                    }
                    Err(e) => Err(backoff::Error::permanent(e)),
                }
            }
        },
        |e: AppError, wait: Duration| {
            tracing::warn!(
                operation,
                error = %e,
                retry_in_ms = wait.as_millis() as u64,
                "Transient upstream failure, retrying"
            );
        },
    )
    .await
}
