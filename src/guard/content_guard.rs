//! External content-guard HTTP client.
//!
//! POSTs the extracted message texts to a configured scanning service with
//! a 10-second deadline. Any network or parse failure fails open (the
//! request is allowed through) — this guard is advisory, not a hard
//! dependency.

use std::time::Duration;

use serde::{Deserialize, Serialize};

const GUARD_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize)]
struct GuardRequest<'a> {
    messages: &'a [String],
}

#[derive(Debug, Deserialize, Default)]
struct GuardResponse {
    #[serde(default)]
    score: f64,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Clone)]
pub struct GuardDecision {
    pub score: f64,
    pub reason: String,
}

pub struct ContentGuardClient {
    http: reqwest::Client,
    url: String,
    threshold: f64,
}

impl ContentGuardClient {
    pub fn new(http: reqwest::Client, url: String, threshold: f64) -> Self {
        Self {
            http,
            url,
            threshold,
        }
    }

    /// Scans `messages`. Returns `Some(decision)` only when the guard
    /// actually decided to block; a clean score, a non-200 response, or any
    /// transport/parse error all resolve to `None` (allow). No messages
    /// extracted from the request means nothing to scan — skip the call
    /// entirely rather than POST an empty list.
    pub async fn check(&self, messages: &[String]) -> Option<GuardDecision> {
        if messages.is_empty() {
            return None;
        }

        let response = match self
            .http
            .post(&self.url)
            .timeout(GUARD_TIMEOUT)
            .json(&GuardRequest { messages })
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                tracing::error!(error = %e, "content guard request failed");
                return None;
            }
        };

        if response.status() != reqwest::StatusCode::OK {
            tracing::warn!(status = %response.status(), "content guard returned non-200");
            return None;
        }

        let parsed: GuardResponse = match response.json().await {
            Ok(r) => r,
            Err(e) => {
                tracing::error!(error = %e, "content guard response was not valid JSON");
                return None;
            }
        };

        if parsed.score >= self.threshold {
            Some(GuardDecision {
                score: parsed.score,
                reason: if parsed.reason.is_empty() {
                    "Content blocked by guard".to_string()
                } else {
                    parsed.reason
                },
            })
        } else {
            None
        }
    }
}
