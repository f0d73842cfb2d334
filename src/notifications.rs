//! HTTP delivery of attack and schedule reports to a configured webhook receiver.
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{error, info};

use crate::chaos::ChaosResult;
use crate::config::Receiver;
use crate::schedule::Schedule;

const NAME_PLACEHOLDER: &str = "{$name}";
const KIND_PLACEHOLDER: &str = "{$kind}";
const NAMESPACE_PLACEHOLDER: &str = "{$namespace}";
const ERROR_PLACEHOLDER: &str = "{$error}";
const TIMESTAMP_PLACEHOLDER: &str = "{$timestamp}";
const TIME_PLACEHOLDER: &str = "{$time}";
const DATE_PLACEHOLDER: &str = "{$date}";
const ENV_PLACEHOLDER_PREFIX: &str = "{$env:";

/// Errors raised while delivering a notification. Callers log and move on; a failed
/// notification never blocks or fails a termination.
#[derive(Error, Debug)]
pub enum NotificationError {
    /// The underlying HTTP request could not even be sent.
    #[error("failed to send notification to {endpoint}: {source}")]
    Request {
        /// Target endpoint.
        endpoint: String,
        /// Underlying transport error.
        #[source]
        source: reqwest::Error,
    },
    /// The receiver responded with a non-2xx status.
    #[error("notification to {endpoint} returned {status}: {body}")]
    BadStatus {
        /// Target endpoint.
        endpoint: String,
        /// Response status code.
        status: reqwest::StatusCode,
        /// Response body, for diagnostics.
        body: String,
    },
}

/// A thin wrapper around a short-timeout [`reqwest::Client`], mirroring the
/// 10-second-timeout HTTP client used to deliver reports.
#[derive(Clone)]
pub struct NotificationClient {
    http: reqwest::Client,
}

impl NotificationClient {
    /// Builds a client with a 10-second request timeout.
    pub fn new() -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { http })
    }

    /// POSTs `body` to `endpoint` with the given headers, erroring on transport
    /// failure or a non-2xx response.
    pub async fn send(
        &self,
        endpoint: &str,
        body: String,
        headers: &[(String, String)],
    ) -> Result<(), NotificationError> {
        let mut request = self.http.post(endpoint).body(body);
        for (key, value) in headers {
            request = request.header(key, value);
        }

        let response = request
            .send()
            .await
            .map_err(|source| NotificationError::Request {
                endpoint: endpoint.to_string(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotificationError::BadStatus {
                endpoint: endpoint.to_string(),
                status,
                body,
            });
        }
        Ok(())
    }

    /// Reports the outcome of a single chaos execution to the `attacks` receiver.
    pub async fn report_attack(&self, receiver: &Receiver, result: &ChaosResult, at: DateTime<Utc>) {
        if receiver.endpoint.is_empty() {
            return;
        }

        let error_string = result.error_message().unwrap_or_default();
        let msg = replace_placeholders(
            &receiver.message,
            result.victim().name(),
            result.victim().kind().label(),
            result.victim().namespace(),
            &error_string,
            at,
        );
        let headers = resolve_headers(&receiver.headers);

        info!(
            victim = result.victim().name(),
            endpoint = %receiver.endpoint,
            "reporting attack outcome"
        );
        if let Err(e) = self.send(&receiver.endpoint, msg, &headers).await {
            error!(error = %e, "failed to report attack outcome");
        }
    }

    /// Reports the day's full schedule to the `attacks` receiver, when configured to.
    pub async fn report_schedule(&self, receiver: &Receiver, schedule: &Schedule) {
        if receiver.endpoint.is_empty() {
            return;
        }

        let msg = format!("{{\"text\": \"\n{}\n\"}}", schedule);
        let headers = resolve_headers(&receiver.headers);

        info!(endpoint = %receiver.endpoint, "reporting today's schedule");
        if let Err(e) = self.send(&receiver.endpoint, msg, &headers).await {
            error!(error = %e, "failed to report schedule");
        }
    }
}

/// Substitutes the `{$name}`, `{$kind}`, `{$namespace}`, `{$error}`, `{$timestamp}`,
/// `{$time}` and `{$date}` placeholders in a message template.
pub fn replace_placeholders(
    msg: &str,
    name: &str,
    kind: &str,
    namespace: &str,
    error: &str,
    at: DateTime<Utc>,
) -> String {
    msg.replace(NAME_PLACEHOLDER, name)
        .replace(KIND_PLACEHOLDER, kind)
        .replace(NAMESPACE_PLACEHOLDER, namespace)
        .replace(ERROR_PLACEHOLDER, error)
        .replace(TIMESTAMP_PLACEHOLDER, &at.timestamp_millis().to_string())
        .replace(TIME_PLACEHOLDER, &at.to_rfc3339())
        .replace(DATE_PLACEHOLDER, &at.format("%Y-%m-%d").to_string())
}

/// Splits raw `key:value` header strings and resolves any `{$env:VAR}` placeholder in
/// the value against the process environment.
fn resolve_headers(raw: &[String]) -> Vec<(String, String)> {
    raw.iter()
        .filter_map(|h| {
            let (key, value) = h.split_once(':')?;
            Some((key.trim().to_string(), resolve_env_placeholder(value.trim())))
        })
        .collect()
}

fn resolve_env_placeholder(value: &str) -> String {
    if let Some(rest) = value
        .strip_prefix(ENV_PLACEHOLDER_PREFIX)
        .and_then(|r| r.strip_suffix('}'))
    {
        std::env::var(rest).unwrap_or_default()
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn placeholders_are_all_substituted() {
        let at = DateTime::parse_from_rfc3339("2026-07-27T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let rendered = replace_placeholders(
            "{$kind} {$name} in {$namespace} failed: {$error} at {$date}",
            "web",
            "Deployment",
            "default",
            "boom",
            at,
        );
        assert_eq!(rendered, "Deployment web in default failed: boom at 2026-07-27");
    }

    #[test]
    fn resolve_headers_splits_on_first_colon() {
        let headers = resolve_headers(&["Authorization: Bearer abc:def".to_string()]);
        assert_eq!(headers, vec![("Authorization".to_string(), "Bearer abc:def".to_string())]);
    }

    #[test]
    fn resolve_headers_skips_malformed_entries() {
        let headers = resolve_headers(&["no-colon".to_string()]);
        assert!(headers.is_empty());
    }

    #[test]
    fn resolve_env_placeholder_reads_environment() {
        std::env::set_var("CHAOS_NOTIFY_TEST_VAR", "hello");
        assert_eq!(resolve_env_placeholder("{$env:CHAOS_NOTIFY_TEST_VAR}"), "hello");
        std::env::remove_var("CHAOS_NOTIFY_TEST_VAR");
    }

    #[test]
    fn resolve_env_placeholder_passes_through_literal_values() {
        assert_eq!(resolve_env_placeholder("application/json"), "application/json");
    }
}
