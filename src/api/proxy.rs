//! The proxy pipeline: guard → classify → resolve → forward → record.
//!
//! Every inbound request lands on the fallback route (`ANY /{path}`) except
//! the two fixed operator endpoints. The pipeline degrades gracefully at
//! every decision point — a missing router, a malformed body, or an
//! unreachable guard all fail open toward the least-intrusive default,
//! per the propagation policy: only a deliberate guard block or a reject
//! budget policy produces a 4xx.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::{json, Value};

use crate::bridge;
use crate::context::AppContext;
use crate::error::ProxyError;
use crate::guard::{self, GuardOutcome};
use crate::router::budget::OverBudgetAction;
use crate::router::config::ProviderConfig;
use crate::router::{classify_request, ProviderType};
use crate::sse::UsageExtractor;

const TEXT_EVENT_STREAM: &str = "text/event-stream";
const NO_CACHE: &str = "no-cache";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const ANTHROPIC_BETA_FLAGS: &[&str] = &["oauth-2025-04-20", "claude-code-20250219"];
const ROUTER_USER_AGENT: &str = "llm-router-proxy/1.0";
const ROUTER_X_APP: &str = "llm-router-proxy";

pub fn routes() -> Router<Arc<AppContext>> {
    Router::new()
        .route("/health", get(health))
        .route("/router/status", get(router_status))
        .fallback(handle_proxy)
}

// ---------------------------------------------------------------------
// Operator endpoints
// ---------------------------------------------------------------------

async fn health(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    let mut body = json!({
        "status": "ok",
        "guard_enabled": ctx.guard.enabled,
        "guard_strip_hidden_unicode": ctx.guard.hidden_unicode_mode == guard::GuardMode::Strip,
        "llm_api_base": ctx.legacy.api_base,
    });
    if let Some(router) = &ctx.router {
        body["smart_router"] = json!({
            "enabled": router.config.enabled,
            "default_tier": router.config.default_tier,
        });
    }
    Json(body)
}

async fn router_status(State(ctx): State<Arc<AppContext>>) -> Json<Value> {
    let Some(router) = &ctx.router else {
        return Json(json!({"enabled": false, "ready": false}));
    };
    let providers: Vec<&str> = router.config.providers.keys().map(String::as_str).collect();
    Json(json!({
        "enabled": router.config.enabled,
        "ready": true,
        "classifier": {
            "router": router.config.classifier.router,
            "thresholds": router.config.classifier.thresholds,
            "heuristic_bypass": router.config.classifier.heuristic_bypass,
        },
        "providers": providers,
        "tiers": router.config.tier_order,
        "default_tier": router.config.default_tier,
        "budget": router.budget.status().await,
        "quota": router.quota.status().await,
    }))
}

// ---------------------------------------------------------------------
// Wire-format detection
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientFormat {
    Anthropic,
    OpenAi,
}

impl ClientFormat {
    fn from_path(path: &str) -> Option<Self> {
        if path.ends_with("/v1/messages") {
            Some(ClientFormat::Anthropic)
        } else if path.ends_with("/v1/chat/completions") {
            Some(ClientFormat::OpenAi)
        } else {
            None
        }
    }

    fn endpoint_path(self) -> &'static str {
        match self {
            ClientFormat::Anthropic => "/v1/messages",
            ClientFormat::OpenAi => "/v1/chat/completions",
        }
    }
}

fn provider_matches_format(provider_type: ProviderType, format: ClientFormat) -> bool {
    matches!(
        (provider_type, format),
        (ProviderType::Anthropic, ClientFormat::Anthropic) | (ProviderType::OpenAi, ClientFormat::OpenAi)
    )
}

fn provider_type_from_str(s: &str) -> ProviderType {
    if s.eq_ignore_ascii_case("openai") {
        ProviderType::OpenAi
    } else {
        ProviderType::Anthropic
    }
}

// ---------------------------------------------------------------------
// Tier selection
// ---------------------------------------------------------------------

enum TierSelection {
    Tier(String),
    Reject,
}

async fn select_tier(router: &crate::context::RouterState, body: &Value) -> TierSelection {
    let default_tier = router.config.default_tier.clone();
    let mut tier = classify_request(
        body,
        &router.config.classifier,
        &router.config.tier_order,
        Some(router.scorer.as_ref()),
        &default_tier,
    )
    .await;

    if router.quota.should_max_push().await {
        tier = router
            .budget
            .config()
            .max_push_tier
            .clone()
            .or_else(|| router.config.tier_order.first().cloned())
            .unwrap_or(tier);
    } else if router.budget.is_over_budget().await {
        match router.budget.config().over_budget_action {
            OverBudgetAction::Reject => return TierSelection::Reject,
            OverBudgetAction::Allow => tier = router.config.lowest_tier(),
        }
    } else if router.budget.should_downgrade().await {
        tier = router.config.downgrade_tier(&tier, router.budget.config().downgrade_steps);
    }

    TierSelection::Tier(tier)
}

// ---------------------------------------------------------------------
// Header plumbing
// ---------------------------------------------------------------------

fn strip_client_headers(headers: &mut HeaderMap) {
    headers.remove(header::HOST);
    headers.remove(header::CONTENT_LENGTH);
    headers.remove(header::AUTHORIZATION);
    headers.remove("x-api-key");
}

fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut out = headers.clone();
    out.remove("transfer-encoding");
    out.remove(header::CONNECTION);
    out.remove("keep-alive");
    out
}

fn add_routing_headers(headers: &mut HeaderMap, tier: &str, model: &str, provider: &str) {
    if let Ok(v) = HeaderValue::from_str(tier) {
        headers.insert("x-llm-router-tier", v);
    }
    if let Ok(v) = HeaderValue::from_str(model) {
        headers.insert("x-llm-router-model", v);
    }
    if let Ok(v) = HeaderValue::from_str(provider) {
        headers.insert("x-llm-router-provider", v);
    }
}

fn merge_beta_flags(headers: &mut HeaderMap) {
    let existing = headers
        .get("anthropic-beta")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let mut flags: Vec<&str> = existing.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
    for flag in ANTHROPIC_BETA_FLAGS {
        if !flags.contains(flag) {
            flags.push(flag);
        }
    }
    if let Ok(v) = HeaderValue::from_str(&flags.join(", ")) {
        headers.insert("anthropic-beta", v);
    }
}

fn inject_credentials(headers: &mut HeaderMap, provider_type: ProviderType, api_key: Option<&str>) {
    let Some(key) = api_key else { return };
    match provider_type {
        ProviderType::OpenAi => {
            if let Ok(v) = HeaderValue::from_str(&format!("Bearer {key}")) {
                headers.insert(header::AUTHORIZATION, v);
            }
        }
        ProviderType::Anthropic => {
            headers.insert("anthropic-version", HeaderValue::from_static(ANTHROPIC_VERSION));
            if key.starts_with("sk-ant-oat") {
                if let Ok(v) = HeaderValue::from_str(&format!("Bearer {key}")) {
                    headers.insert(header::AUTHORIZATION, v);
                }
                merge_beta_flags(headers);
                headers.insert(header::USER_AGENT, HeaderValue::from_static(ROUTER_USER_AGENT));
                headers.insert("x-app", HeaderValue::from_static(ROUTER_X_APP));
            } else if let Ok(v) = HeaderValue::from_str(key) {
                headers.insert("x-api-key", v);
            }
        }
    }
}

fn is_sse(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains(TEXT_EVENT_STREAM))
        .unwrap_or(false)
}

// ---------------------------------------------------------------------
// Per-tier parameter overrides
// ---------------------------------------------------------------------

fn merge_extra_params(body: &mut Value, extra: &serde_json::Map<String, Value>) {
    let Some(obj) = body.as_object_mut() else { return };
    for (key, value) in extra {
        match (obj.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                for (k, v) in incoming {
                    existing.insert(k.clone(), v.clone());
                }
            }
            _ => {
                obj.insert(key.clone(), value.clone());
            }
        }
    }
}

// ---------------------------------------------------------------------
// Streaming finalizer: pass bytes through unchanged, extract usage,
// record cost once the upstream stream ends.
// ---------------------------------------------------------------------

fn track_and_forward_sse(
    upstream: reqwest::Response,
    ctx: Arc<AppContext>,
    fallback_model: String,
) -> impl futures::Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static {
    async_stream::stream! {
        let mut extractor = UsageExtractor::new();
        let mut byte_stream = upstream.bytes_stream();
        while let Some(chunk) = byte_stream.next().await {
            match chunk {
                Ok(bytes) => {
                    extractor.feed(&bytes);
                    yield Ok(bytes);
                }
                Err(e) => {
                    yield Err(std::io::Error::other(e.to_string()));
                    break;
                }
            }
        }
        extractor.finalize();
        if extractor.has_usage() {
            let model = extractor.model().unwrap_or(fallback_model.as_str()).to_string();
            if let Some(router) = &ctx.router {
                router.budget.record(&model, extractor.input_tokens(), extractor.output_tokens()).await;
            }
        }
    }
}

async fn record_non_streaming_usage(ctx: &Arc<AppContext>, body: &Value, fallback_model: &str) {
    let Some(router) = &ctx.router else { return };
    let Some(usage) = body.get("usage") else { return };
    let input = usage
        .get("input_tokens")
        .or_else(|| usage.get("prompt_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let output = usage
        .get("output_tokens")
        .or_else(|| usage.get("completion_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    if input == 0 && output == 0 {
        return;
    }
    let model = body.get("model").and_then(Value::as_str).unwrap_or(fallback_model);
    router.budget.record(model, input, output).await;
}

// ---------------------------------------------------------------------
// HTTP forwarder (shared by same-format routing and legacy forwarding)
// ---------------------------------------------------------------------

async fn run_forward(
    ctx: &Arc<AppContext>,
    method: Method,
    url: String,
    headers: HeaderMap,
    body: Bytes,
    trackable: bool,
    request_model: String,
    routing_meta: Option<(String, String, String)>,
) -> Response {
    let mut request = ctx.http_client.request(method, &url).headers(headers);
    if !body.is_empty() {
        request = request.body(body);
    }

    let response = match request.send().await {
        Ok(r) => r,
        Err(e) => return ProxyError::UpstreamConnection(e.to_string()).into_response(),
    };

    if let Some(router) = &ctx.router {
        router.quota.update(response.headers()).await;
    }

    let status = status_from_reqwest(response.status());
    let sse = is_sse(response.headers());
    let mut response_headers = strip_hop_by_hop(response.headers());
    if let Some((tier, model, provider)) = &routing_meta {
        add_routing_headers(&mut response_headers, tier, model, provider);
    }

    if trackable && sse {
        let stream = track_and_forward_sse(response, ctx.clone(), request_model);
        return build_streaming_response(status, response_headers, stream);
    }

    if trackable {
        let bytes = match response.bytes().await {
            Ok(b) => b,
            Err(e) => return ProxyError::UpstreamConnection(e.to_string()).into_response(),
        };
        if status == StatusCode::OK {
            if let Ok(json) = serde_json::from_slice::<Value>(&bytes) {
                record_non_streaming_usage(ctx, &json, &request_model).await;
            }
        }
        return build_buffered_response(status, response_headers, bytes);
    }

    let passthrough = response
        .bytes_stream()
        .map(|r| r.map_err(|e| std::io::Error::other(e.to_string())));
    build_streaming_response(status, response_headers, passthrough)
}

fn status_from_reqwest(status: reqwest::StatusCode) -> StatusCode {
    StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY)
}

fn build_streaming_response(
    status: StatusCode,
    headers: HeaderMap,
    stream: impl futures::Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static,
) -> Response {
    let mut builder = Response::builder().status(status);
    if let Some(h) = builder.headers_mut() {
        *h = headers;
    }
    builder
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

fn build_buffered_response(status: StatusCode, headers: HeaderMap, bytes: Bytes) -> Response {
    let mut builder = Response::builder().status(status);
    if let Some(h) = builder.headers_mut() {
        *h = headers;
    }
    builder
        .body(Body::from(bytes))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

// ---------------------------------------------------------------------
// Same-format and cross-format routed forwarding
// ---------------------------------------------------------------------

#[allow(clippy::too_many_arguments)]
async fn forward_same_format(
    ctx: &Arc<AppContext>,
    provider: &ProviderConfig,
    model: &str,
    extra_params: Option<&serde_json::Map<String, Value>>,
    client_format: ClientFormat,
    mut body_value: Value,
    query: Option<&str>,
    tier: &str,
    mut headers: HeaderMap,
) -> Response {
    if let Some(obj) = body_value.as_object_mut() {
        obj.insert("model".to_string(), Value::String(model.to_string()));
    }
    if let Some(extra) = extra_params {
        merge_extra_params(&mut body_value, extra);
    }
    let body_bytes = Bytes::from(serde_json::to_vec(&body_value).unwrap_or_default());

    let mut url = format!("{}{}", provider.base_url_trimmed(), client_format.endpoint_path());
    if let Some(q) = query {
        if !q.is_empty() {
            url.push('?');
            url.push_str(q);
        }
    }

    inject_credentials(&mut headers, provider.provider_type, provider.api_key.as_deref());
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));

    let routing_meta = (tier.to_string(), model.to_string(), provider.name.clone());
    run_forward(
        ctx,
        Method::POST,
        url,
        headers,
        body_bytes,
        true,
        model.to_string(),
        Some(routing_meta),
    )
    .await
}

async fn forward_cross_format(
    ctx: &Arc<AppContext>,
    provider: &ProviderConfig,
    model: &str,
    body_value: &Value,
    tier: &str,
    mut headers: HeaderMap,
) -> Response {
    let stream = body_value.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let openai_messages = bridge::anthropic_to_openai_messages(body_value);
    let mut request_body = json!({"model": model, "messages": openai_messages, "stream": stream});
    if let Some(tools) = body_value.get("tools") {
        request_body["tools"] = tools.clone();
    }
    let body_bytes = Bytes::from(serde_json::to_vec(&request_body).unwrap_or_default());

    let url = format!("{}/v1/chat/completions", provider.base_url_trimmed());
    inject_credentials(&mut headers, provider.provider_type, provider.api_key.as_deref());
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));

    let response = match ctx
        .http_client
        .request(Method::POST, &url)
        .headers(headers)
        .body(body_bytes)
        .send()
        .await
    {
        Ok(r) => r,
        Err(e) => return ProxyError::UpstreamConnection(e.to_string()).into_response(),
    };

    if let Some(router) = &ctx.router {
        router.quota.update(response.headers()).await;
    }

    let status = status_from_reqwest(response.status());
    let mut response_headers = strip_hop_by_hop(response.headers());
    add_routing_headers(&mut response_headers, tier, model, &provider.name);

    if stream {
        let ctx_clone = ctx.clone();
        let model_for_record = model.to_string();
        let byte_stream = response
            .bytes_stream()
            .map(|r| r.map_err(|e| std::io::Error::other(e.to_string())));
        let anthropic_stream =
            bridge::openai_stream_to_anthropic_sse(byte_stream, model.to_string(), move |in_tok, out_tok| {
                let ctx = ctx_clone.clone();
                let model = model_for_record.clone();
                async move {
                    if in_tok > 0 || out_tok > 0 {
                        if let Some(router) = &ctx.router {
                            router.budget.record(&model, in_tok, out_tok).await;
                        }
                    }
                }
            });
        response_headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(TEXT_EVENT_STREAM));
        response_headers.insert(header::CACHE_CONTROL, HeaderValue::from_static(NO_CACHE));
        return build_streaming_response(status, response_headers, anthropic_stream);
    }

    let upstream_bytes = match response.bytes().await {
        Ok(b) => b,
        Err(e) => return ProxyError::UpstreamConnection(e.to_string()).into_response(),
    };
    let Ok(upstream_json) = serde_json::from_slice::<Value>(&upstream_bytes) else {
        return build_buffered_response(status, response_headers, upstream_bytes);
    };

    if let Some(router) = &ctx.router {
        if let Some(usage) = upstream_json.get("usage") {
            let input = usage.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0);
            let output = usage.get("completion_tokens").and_then(Value::as_u64).unwrap_or(0);
            if input > 0 || output > 0 {
                router.budget.record(model, input, output).await;
            }
        }
    }

    let anthropic_body = bridge::openai_response_to_anthropic(&upstream_json, model);
    build_buffered_response(
        status,
        response_headers,
        Bytes::from(serde_json::to_vec(&anthropic_body).unwrap_or_default()),
    )
}

// ---------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------

async fn handle_proxy(
    State(ctx): State<Arc<AppContext>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path().to_string();
    let query = uri.query().map(str::to_string);

    let mut parsed: Option<Value> = if method == Method::POST && !body.is_empty() {
        serde_json::from_slice::<Value>(&body).ok()
    } else {
        None
    };

    if let Some(value) = parsed.as_mut() {
        match guard::apply(ctx.guard.hidden_unicode_mode, value) {
            GuardOutcome::Blocked(chars) => {
                let code_points: Vec<String> =
                    chars.iter().map(|c| format!("U+{:04X}", *c as u32)).collect();
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({
                        "error": "guard_blocked",
                        "reason": "hidden unicode detected",
                        "code_points": code_points,
                    })),
                )
                    .into_response();
            }
            GuardOutcome::Passed => {}
        }

        if let Some(client) = &ctx.guard_client {
            let texts = guard::extract_message_texts(value);
            if let Some(decision) = client.check(&texts).await {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({"error": "guard_blocked", "reason": decision.reason})),
                )
                    .into_response();
            }
        }
    }

    let trackable =
        method == Method::POST && (path.ends_with("/v1/messages") || path.ends_with("/v1/chat/completions"));
    let client_format = ClientFormat::from_path(&path);

    if let (Some(router), true, Some(body_value), Some(format)) =
        (&ctx.router, trackable, parsed.as_ref(), client_format)
    {
        let tier = match select_tier(router, body_value).await {
            TierSelection::Reject => {
                return (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(json!({"error": "budget_exceeded"})),
                )
                    .into_response();
            }
            TierSelection::Tier(t) => t,
        };

        if let Some((provider, model, extra_params)) = router.config.resolve_target(&tier, &[]) {
            let mut forward_headers = headers.clone();
            strip_client_headers(&mut forward_headers);

            return if provider_matches_format(provider.provider_type, format) {
                forward_same_format(
                    &ctx,
                    provider,
                    model,
                    extra_params,
                    format,
                    body_value.clone(),
                    query.as_deref(),
                    &tier,
                    forward_headers,
                )
                .await
            } else {
                forward_cross_format(&ctx, provider, model, body_value, &tier, forward_headers).await
            };
        }
    }

    let mut forward_headers = headers.clone();
    strip_client_headers(&mut forward_headers);
    let legacy_provider_type = provider_type_from_str(&ctx.legacy.provider);
    inject_credentials(&mut forward_headers, legacy_provider_type, ctx.legacy.api_key.as_deref());

    let effective_body: Bytes = match &parsed {
        Some(value) => Bytes::from(serde_json::to_vec(value).unwrap_or_else(|_| body.to_vec())),
        None => body,
    };

    let mut url = format!("{}{}", ctx.legacy.api_base.trim_end_matches('/'), path);
    if let Some(q) = &query {
        if !q.is_empty() {
            url.push('?');
            url.push_str(q);
        }
    }

    let request_model = parsed
        .as_ref()
        .and_then(|v| v.get("model"))
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();

    run_forward(
        &ctx,
        method,
        url,
        forward_headers,
        effective_body,
        trackable,
        request_model,
        None,
    )
    .await
}
