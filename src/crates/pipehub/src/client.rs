//! Hub client for workers and CLIs
//!
//! One request per connection: connect, send a framed request, read the
//! framed reply. Every attempt runs under a deadline via
//! `tokio::time::timeout`, so behavior is uniform across platforms; the
//! retry policy grows the deadline by a caller-supplied increment per
//! attempt.

use crate::error::{HubError, Result};
use crate::models::{StepDefinition, StepStatus};
use crate::protocol::{encode_request, read_frame, Method, OK_RESPONSE};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

/// Deadline growth policy for one logical request.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts before giving up
    pub attempts: u32,
    /// Deadline for the first attempt
    pub initial_timeout: Duration,
    /// Added to the deadline after each failed attempt
    pub increment: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 4,
            initial_timeout: Duration::from_secs(5),
            increment: Duration::from_secs(5),
        }
    }
}

/// Grouped `step-count` reply.
#[derive(Debug, Clone)]
pub struct StepCounts {
    pub table: HashMap<String, i64>,
    pub total: i64,
}

/// Client for the hub's wire protocol.
#[derive(Debug, Clone)]
pub struct HubClient {
    addr: String,
    retry: RetryPolicy,
}

impl HubClient {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            addr: format!("{}:{}", host, port),
            retry: RetryPolicy::default(),
        }
    }

    /// Builder: replace the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Send one request, retrying with a growing deadline.
    pub async fn request(&self, method: Method, body: &[u8]) -> Result<Vec<u8>> {
        let frame = encode_request(method, body)?;
        let mut deadline = self.retry.initial_timeout;
        let mut last_error: Option<HubError> = None;

        for attempt in 1..=self.retry.attempts {
            match tokio::time::timeout(deadline, self.roundtrip(&frame)).await {
                Ok(Ok(reply)) => return Ok(reply),
                Ok(Err(e)) => {
                    debug!(%method, attempt, error = %e, "request attempt failed");
                    last_error = Some(e);
                }
                Err(_) => {
                    debug!(%method, attempt, ?deadline, "request attempt timed out");
                }
            }
            deadline += self.retry.increment;
        }

        Err(last_error.unwrap_or(HubError::Timeout {
            addr: self.addr.clone(),
            attempts: self.retry.attempts,
        }))
    }

    async fn roundtrip(&self, frame: &[u8]) -> Result<Vec<u8>> {
        let mut stream = TcpStream::connect(&self.addr).await?;
        stream.write_all(frame).await?;
        stream.flush().await?;

        read_frame(&mut stream)
            .await?
            .ok_or_else(|| HubError::Protocol("hub closed the connection without a reply".to_string()))
    }

    async fn request_ok(&self, method: Method, body: &[u8]) -> Result<()> {
        let reply = self.request(method, body).await?;
        if reply == OK_RESPONSE {
            Ok(())
        } else {
            Err(HubError::Protocol(format!(
                "expected ok, got {:?}",
                String::from_utf8_lossy(&reply)
            )))
        }
    }

    /// Lease up to `options.limit` runnable steps in the given scopes.
    pub async fn get_steps(
        &self,
        scopes: &[String],
        options: &Value,
    ) -> Result<Vec<String>> {
        let body = serde_json::to_vec(&json!([scopes, options]))?;
        let reply = self.request(Method::GetSteps, &body).await?;
        Ok(serde_json::from_slice(&reply)?)
    }

    /// `get-steps` with the wire defaults, overriding only `limit`.
    pub async fn get_steps_limited(&self, scopes: &[String], limit: usize) -> Result<Vec<String>> {
        self.get_steps(scopes, &json!({ "limit": limit })).await
    }

    pub async fn done(&self, step_id: &str) -> Result<()> {
        self.request_ok(Method::Done, step_id.as_bytes()).await
    }

    pub async fn pending(&self, step_id: &str) -> Result<()> {
        self.request_ok(Method::Pending, step_id.as_bytes()).await
    }

    pub async fn cancel(&self, step_id: &str) -> Result<()> {
        self.request_ok(Method::Cancel, step_id.as_bytes()).await
    }

    pub async fn reset(&self, step_id: &str) -> Result<()> {
        self.request_ok(Method::Reset, step_id.as_bytes()).await
    }

    /// Report a worker failure with its message and stack trace.
    pub async fn error(&self, step_id: &str, msg: &str, trace: &str) -> Result<()> {
        let body = serde_json::to_vec(&json!({
            "step_id": step_id,
            "msg": msg,
            "trace": trace,
        }))?;
        self.request_ok(Method::Error, &body).await
    }

    /// Upload one step with its natural initial status.
    pub async fn upload_step(&self, def: &StepDefinition) -> Result<()> {
        self.upload_step_with_status(def, def.initial_status()).await
    }

    pub async fn upload_step_with_status(
        &self,
        def: &StepDefinition,
        status: StepStatus,
    ) -> Result<()> {
        let body = serde_json::to_vec(&json!([def, status.as_i64()]))?;
        self.request_ok(Method::UploadStep, &body).await
    }

    /// Upload a batch, each step with its natural initial status.
    pub async fn upload_steps(&self, defs: &[StepDefinition]) -> Result<()> {
        let statuses: Vec<i64> = defs.iter().map(|d| d.initial_status().as_i64()).collect();
        let body = serde_json::to_vec(&json!([defs, statuses]))?;
        self.request_ok(Method::UploadSteps, &body).await
    }

    /// Grouped status counts; pass `"*"` to include terminal statuses.
    pub async fn step_count(&self, types: &str) -> Result<StepCounts> {
        let body = serde_json::to_vec(&json!({ "types": types }))?;
        let reply = self.request(Method::StepCount, &body).await?;
        let value: Value = serde_json::from_slice(&reply)?;
        let table = value
            .get("table")
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_i64().map(|n| (k.clone(), n)))
                    .collect()
            })
            .unwrap_or_default();
        let total = value.get("total").and_then(Value::as_i64).unwrap_or(0);
        Ok(StepCounts { table, total })
    }

    /// Move errored (and optionally working) steps back to pending.
    pub async fn reset_errors(&self, include_working: bool) -> Result<()> {
        let body = if include_working { "true" } else { "false" };
        self.request_ok(Method::ResetErrors, body.as_bytes()).await
    }

    /// Administrative wipe of every step row. Returns the number removed.
    pub async fn delete_steps(&self) -> Result<i64> {
        let reply = self.request(Method::DeleteSteps, b"all").await?;
        let value: Value = serde_json::from_slice(&reply)?;
        Ok(value.get("deleted").and_then(Value::as_i64).unwrap_or(0))
    }

    /// Error report: `{total, count, table}` with definition-enriched rows.
    pub async fn fetch_errors(&self, count: usize, exclude: Option<Value>) -> Result<Value> {
        let body = serde_json::to_vec(&json!({
            "count": count,
            "exclude": exclude,
        }))?;
        let reply = self.request(Method::FetchErrors, &body).await?;
        Ok(serde_json::from_slice(&reply)?)
    }

    /// Fetch rows by id; `step_id` may be a comma-separated list.
    pub async fn fetch_rows(&self, step_id: &str) -> Result<Vec<Value>> {
        let body = serde_json::to_vec(&json!({ "step_id": step_id }))?;
        let reply = self.request(Method::FetchRows, &body).await?;
        Ok(serde_json::from_slice(&reply)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_retry_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.attempts, 4);
        assert_eq!(policy.initial_timeout, Duration::from_secs(5));
        assert_eq!(policy.increment, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_request_fails_after_exhausting_attempts() {
        // Nothing listens on this port; connects fail fast.
        let client = HubClient::new("127.0.0.1", 1).with_retry(RetryPolicy {
            attempts: 2,
            initial_timeout: Duration::from_millis(200),
            increment: Duration::from_millis(0),
        });
        let result = client.request(Method::Done, b"id").await;
        assert!(result.is_err());
    }
}
