//! Last-seen snapshot of upstream rate-limit headers.
//!
//! Holds at most one [`QuotaSnapshot`] behind a single-writer/multi-reader
//! lock. Replaced wholesale on each upstream response that carries the
//! expected Anthropic rate-limit headers; any other response leaves the
//! previous snapshot untouched.

use chrono::{DateTime, Utc};
use reqwest::header::HeaderMap;
use serde::Serialize;
use tokio::sync::RwLock;

const TOKENS_RESET_HEADER: &str = "anthropic-ratelimit-tokens-reset";
const TOKENS_LIMIT_HEADER: &str = "anthropic-ratelimit-tokens-limit";
const TOKENS_REMAINING_HEADER: &str = "anthropic-ratelimit-tokens-remaining";
const REQUESTS_RESET_HEADER: &str = "anthropic-ratelimit-requests-reset";
const REQUESTS_LIMIT_HEADER: &str = "anthropic-ratelimit-requests-limit";
const REQUESTS_REMAINING_HEADER: &str = "anthropic-ratelimit-requests-remaining";

#[derive(Debug, Clone, Serialize)]
pub struct QuotaSnapshot {
    pub tokens_limit: u64,
    pub tokens_remaining: u64,
    pub tokens_reset: DateTime<Utc>,
    pub requests_limit: u64,
    pub requests_remaining: u64,
    pub requests_reset: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum QuotaStatus {
    Unavailable {
        available: bool,
    },
    Available {
        available: bool,
        tokens_remaining: u64,
        tokens_limit: u64,
        requests_remaining: u64,
        requests_limit: u64,
        should_max_push: bool,
        minutes_until_reset: f64,
        tokens_reset: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    },
}

pub struct QuotaTracker {
    push_within_minutes: u32,
    latest: RwLock<Option<QuotaSnapshot>>,
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn header_u64(headers: &HeaderMap, name: &str) -> u64 {
    header_str(headers, name)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

fn parse_rfc3339(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

impl QuotaTracker {
    pub fn new(push_within_minutes: u32) -> Self {
        Self {
            push_within_minutes,
            latest: RwLock::new(None),
        }
    }

    /// Updates the snapshot from response headers. Does nothing if the
    /// tokens-reset header is absent. On any parse error, logs and leaves
    /// the previous snapshot intact.
    pub async fn update(&self, headers: &HeaderMap) {
        let Some(tokens_reset_raw) = header_str(headers, TOKENS_RESET_HEADER) else {
            return;
        };

        let Some(tokens_reset) = parse_rfc3339(tokens_reset_raw) else {
            tracing::warn!(value = tokens_reset_raw, "failed to parse tokens-reset header");
            return;
        };

        let requests_reset = match header_str(headers, REQUESTS_RESET_HEADER) {
            Some(raw) => match parse_rfc3339(raw) {
                Some(dt) => dt,
                None => {
                    tracing::warn!(value = raw, "failed to parse requests-reset header");
                    return;
                }
            },
            None => tokens_reset,
        };

        let snapshot = QuotaSnapshot {
            tokens_limit: header_u64(headers, TOKENS_LIMIT_HEADER),
            tokens_remaining: header_u64(headers, TOKENS_REMAINING_HEADER),
            tokens_reset,
            requests_limit: header_u64(headers, REQUESTS_LIMIT_HEADER),
            requests_remaining: header_u64(headers, REQUESTS_REMAINING_HEADER),
            requests_reset,
            updated_at: Utc::now(),
        };

        *self.latest.write().await = Some(snapshot);
    }

    /// True iff a snapshot exists, the token-reset window is imminent but
    /// not already past, and there are still tokens left to spend.
    pub async fn should_max_push(&self) -> bool {
        let guard = self.latest.read().await;
        let Some(snapshot) = guard.as_ref() else {
            return false;
        };
        let minutes = minutes_until(snapshot.tokens_reset);
        minutes > 0.0
            && minutes <= self.push_within_minutes as f64
            && snapshot.tokens_remaining > 0
    }

    pub async fn status(&self) -> QuotaStatus {
        let guard = self.latest.read().await;
        match guard.as_ref() {
            None => QuotaStatus::Unavailable { available: false },
            Some(snapshot) => {
                let minutes = minutes_until(snapshot.tokens_reset).max(0.0);
                let should_max_push = {
                    drop(guard);
                    self.should_max_push().await
                };
                QuotaStatus::Available {
                    available: true,
                    tokens_remaining: snapshot.tokens_remaining,
                    tokens_limit: snapshot.tokens_limit,
                    requests_remaining: snapshot.requests_remaining,
                    requests_limit: snapshot.requests_limit,
                    should_max_push,
                    minutes_until_reset: minutes,
                    tokens_reset: snapshot.tokens_reset,
                    updated_at: snapshot.updated_at,
                }
            }
        }
    }
}

fn minutes_until(target: DateTime<Utc>) -> f64 {
    (target - Utc::now()).num_milliseconds() as f64 / 60_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderName, HeaderValue};

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    #[tokio::test]
    async fn update_parses_well_formed_headers() {
        let tracker = QuotaTracker::new(15);
        let reset = (Utc::now() + chrono::Duration::minutes(10)).to_rfc3339();
        tracker
            .update(&headers(&[
                ("anthropic-ratelimit-tokens-reset", &reset),
                ("anthropic-ratelimit-tokens-limit", "100000"),
                ("anthropic-ratelimit-tokens-remaining", "5000"),
            ]))
            .await;
        let status = tracker.status().await;
        match status {
            QuotaStatus::Available {
                available,
                tokens_remaining,
                ..
            } => {
                assert!(available);
                assert_eq!(tokens_remaining, 5000);
            }
            QuotaStatus::Unavailable { .. } => panic!("expected available status"),
        }
    }

    #[tokio::test]
    async fn missing_tokens_reset_header_is_ignored() {
        let tracker = QuotaTracker::new(15);
        tracker
            .update(&headers(&[("anthropic-ratelimit-tokens-limit", "100000")]))
            .await;
        assert!(!tracker.should_max_push().await);
    }

    #[tokio::test]
    async fn malformed_timestamp_leaves_previous_snapshot() {
        let tracker = QuotaTracker::new(15);
        let reset = (Utc::now() + chrono::Duration::minutes(10)).to_rfc3339();
        tracker
            .update(&headers(&[
                ("anthropic-ratelimit-tokens-reset", &reset),
                ("anthropic-ratelimit-tokens-remaining", "5000"),
            ]))
            .await;
        tracker
            .update(&headers(&[("anthropic-ratelimit-tokens-reset", "not-a-timestamp")]))
            .await;
        assert!(tracker.should_max_push().await);
    }

    #[tokio::test]
    async fn requests_reset_defaults_to_tokens_reset() {
        let tracker = QuotaTracker::new(15);
        let reset = (Utc::now() + chrono::Duration::minutes(10)).to_rfc3339();
        tracker
            .update(&headers(&[
                ("anthropic-ratelimit-tokens-reset", &reset),
                ("anthropic-ratelimit-tokens-remaining", "100"),
            ]))
            .await;
        let guard = tracker.latest.read().await;
        let snapshot = guard.as_ref().unwrap();
        assert_eq!(snapshot.requests_reset, snapshot.tokens_reset);
    }

    #[tokio::test]
    async fn should_max_push_false_with_no_snapshot() {
        let tracker = QuotaTracker::new(15);
        assert!(!tracker.should_max_push().await);
    }

    #[tokio::test]
    async fn should_max_push_true_within_window() {
        let tracker = QuotaTracker::new(15);
        let reset = (Utc::now() + chrono::Duration::minutes(10)).to_rfc3339();
        tracker
            .update(&headers(&[
                ("anthropic-ratelimit-tokens-reset", &reset),
                ("anthropic-ratelimit-tokens-remaining", "5000"),
            ]))
            .await;
        assert!(tracker.should_max_push().await);
    }

    #[tokio::test]
    async fn should_max_push_false_when_reset_far_away() {
        let tracker = QuotaTracker::new(15);
        let reset = (Utc::now() + chrono::Duration::minutes(60)).to_rfc3339();
        tracker
            .update(&headers(&[
                ("anthropic-ratelimit-tokens-reset", &reset),
                ("anthropic-ratelimit-tokens-remaining", "5000"),
            ]))
            .await;
        assert!(!tracker.should_max_push().await);
    }

    #[tokio::test]
    async fn should_max_push_false_when_zero_remaining() {
        let tracker = QuotaTracker::new(15);
        let reset = (Utc::now() + chrono::Duration::minutes(5)).to_rfc3339();
        tracker
            .update(&headers(&[
                ("anthropic-ratelimit-tokens-reset", &reset),
                ("anthropic-ratelimit-tokens-remaining", "0"),
            ]))
            .await;
        assert!(!tracker.should_max_push().await);
    }

    #[tokio::test]
    async fn should_max_push_false_when_reset_already_past() {
        let tracker = QuotaTracker::new(15);
        let reset = (Utc::now() - chrono::Duration::minutes(1)).to_rfc3339();
        tracker
            .update(&headers(&[
                ("anthropic-ratelimit-tokens-reset", &reset),
                ("anthropic-ratelimit-tokens-remaining", "5000"),
            ]))
            .await;
        assert!(!tracker.should_max_push().await);
    }

    #[tokio::test]
    async fn status_clamps_minutes_until_reset_to_zero() {
        let tracker = QuotaTracker::new(15);
        let reset = (Utc::now() - chrono::Duration::minutes(5)).to_rfc3339();
        tracker
            .update(&headers(&[
                ("anthropic-ratelimit-tokens-reset", &reset),
                ("anthropic-ratelimit-tokens-remaining", "100"),
            ]))
            .await;
        match tracker.status().await {
            QuotaStatus::Available {
                minutes_until_reset,
                ..
            } => assert_eq!(minutes_until_reset, 0.0),
            QuotaStatus::Unavailable { .. } => panic!("expected available status"),
        }
    }

    #[tokio::test]
    async fn unrelated_headers_do_not_interfere() {
        let tracker = QuotaTracker::new(15);
        tracker
            .update(&headers(&[
                ("content-type", "application/json"),
                ("x-request-id", "abc123"),
                ("retry-after", "30"),
            ]))
            .await;
        assert!(!tracker.should_max_push().await);
    }
}
