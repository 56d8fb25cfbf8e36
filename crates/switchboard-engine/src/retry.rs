//! Retry/failover state machine (C6, §4.6): the only place a request's account, endpoint,
//! and model can change mid-flight. Everything below this layer (pool, adapters, format
//! translators) is a pure function of its inputs; this is where the loop lives.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use reqwest::header::HeaderMap;
use tokio_util::sync::CancellationToken;

use switchboard_accounts::{AccountPool, Selection};
use switchboard_core::clock::{capacity_tier_delay, jitter};
use switchboard_core::messages::{CanonicalRequest, CanonicalResponse, Usage};
use switchboard_core::security::ProviderKind;
use switchboard_core::stream::CanonicalEvent;
use switchboard_core::{Clock, ContentBlock, GatewayConfig, GatewayError, StopReason};
use switchboard_providers::google::CLOUDCODE_ENDPOINT_FALLBACKS;
use switchboard_providers::{AdapterRegistry, ProviderAdapter};

use crate::upstream::{UpstreamClient, WireFormat};

/// Backoff schedule for the empty-response sub-loop (§4.6 step 5), in retry order.
const EMPTY_RESPONSE_BACKOFF_MS: [u64; 3] = [500, 1_000, 2_000];

/// Static model-fallback table (§4.6, §9 "static fallback mapping"). A request for a model
/// on the left that exhausts every account falls back to the model on the right, once.
const MODEL_FALLBACK_MAP: &[(&str, &str)] = &[
    ("gemini-3-pro-high", "claude-opus-4-5-thinking"),
    ("gemini-3-pro", "claude-opus-4-5"),
];

fn fallback_model_for(model: &str) -> Option<&'static str> {
    MODEL_FALLBACK_MAP.iter().find(|(from, _)| *from == model).map(|(_, to)| *to)
}

/// One account's resolved dispatch context for the current attempt: its adapter, a
/// materialized token, and (google only) a project id.
struct Dispatch {
    email: String,
    provider: ProviderKind,
    adapter: Arc<dyn ProviderAdapter>,
    token: String,
    project_id: Option<String>,
}

pub struct RetryEngine {
    pool: Arc<AccountPool>,
    registry: Arc<AdapterRegistry>,
    upstream: UpstreamClient,
    clock: Arc<dyn Clock>,
    config: GatewayConfig,
}

impl RetryEngine {
    pub fn new(
        pool: Arc<AccountPool>,
        registry: Arc<AdapterRegistry>,
        clock: Arc<dyn Clock>,
        config: GatewayConfig,
    ) -> Self {
        let upstream = UpstreamClient::new(config.upstream_request_timeout());
        Self { pool, registry, upstream, clock, config }
    }

    /// `SendMessage` (§4.7): one complete, non-streamed assistant turn.
    pub async fn send_message(
        &self,
        req: &CanonicalRequest,
        cancel: &CancellationToken,
    ) -> Result<CanonicalResponse, GatewayError> {
        self.send_message_inner(req, true, cancel).await
    }

    async fn send_message_inner(
        &self,
        req: &CanonicalRequest,
        model_fallback_allowed: bool,
        cancel: &CancellationToken,
    ) -> Result<CanonicalResponse, GatewayError> {
        match self.attempt_loop_non_stream(req, cancel).await {
            Err(GatewayError::MaxRetriesExceeded) if model_fallback_allowed => {
                match fallback_model_for(&req.model) {
                    Some(fallback) => {
                        tracing::info!(model = %req.model, fallback, "falling back to alternate model");
                        let fallback_req = req.with_model(fallback);
                        Box::pin(self.send_message_inner(&fallback_req, false, cancel)).await
                    }
                    None => Err(GatewayError::MaxRetriesExceeded),
                }
            }
            other => other,
        }
    }

    /// `SendMessageStream` (§4.7): a cancellable sequence of canonical events.
    pub async fn send_message_stream(
        &self,
        req: &CanonicalRequest,
        cancel: &CancellationToken,
    ) -> Result<Pin<Box<dyn Stream<Item = CanonicalEvent> + Send>>, GatewayError> {
        self.send_message_stream_inner(req, true, cancel).await
    }

    async fn send_message_stream_inner(
        &self,
        req: &CanonicalRequest,
        model_fallback_allowed: bool,
        cancel: &CancellationToken,
    ) -> Result<Pin<Box<dyn Stream<Item = CanonicalEvent> + Send>>, GatewayError> {
        match self.attempt_loop_stream(req, cancel).await {
            Err(GatewayError::MaxRetriesExceeded) if model_fallback_allowed => {
                match fallback_model_for(&req.model) {
                    Some(fallback) => {
                        tracing::info!(model = %req.model, fallback, "falling back to alternate model");
                        let fallback_req = req.with_model(fallback);
                        Box::pin(self.send_message_stream_inner(&fallback_req, false, cancel)).await
                    }
                    None => Err(GatewayError::MaxRetriesExceeded),
                }
            }
            other => other,
        }
    }

    fn max_attempts(&self, account_count: usize) -> u32 {
        self.config.max_retries.max(account_count as u32 + 1)
    }

    /// Selects an account for this attempt, resolves its token, and returns everything the
    /// per-wire dispatch needs. Distinguishes a `Wait` selection (§4.6 step 2's
    /// `{decrementAttempt: true}`, which must net to `attempt--` — zero attempt budget spent)
    /// from a `None` selection or a recoverable token failure (both spend one attempt).
    async fn resolve_dispatch(
        &self,
        req: &CanonicalRequest,
        cancel: &CancellationToken,
    ) -> Result<DispatchOutcome, GatewayError> {
        match self.pool.select(&req.model).await {
            Selection::Account(email) => {
                let Some(account) = self.pool.account(&email).await else {
                    return Ok(DispatchOutcome::Exhausted);
                };

                let token = match self.pool.get_token(&email).await {
                    Ok(token) => token,
                    Err(GatewayError::AuthInvalidPermanent { reason }) => {
                        self.pool.mark_invalid(&email, reason).await;
                        return Ok(DispatchOutcome::Exhausted);
                    }
                    Err(_) => return Ok(DispatchOutcome::Exhausted),
                };

                let project_id = if account.provider == ProviderKind::Google {
                    self.pool.get_project_id(&email, &token).await
                } else {
                    None
                };

                Ok(DispatchOutcome::Ready(Dispatch {
                    adapter: self.registry.get(account.provider),
                    provider: account.provider,
                    email,
                    token,
                    project_id,
                }))
            }
            Selection::Wait(wait_ms) => {
                self.sleep_cancellable(Duration::from_millis(wait_ms.max(0) as u64), cancel).await?;
                Ok(DispatchOutcome::Waited)
            }
            Selection::None => Ok(DispatchOutcome::Exhausted),
        }
    }

    /// §4.6 step 5/6 classification for a non-2xx response. Pool-mutates as a side effect
    /// and returns the action the attempt loop should take.
    async fn handle_error_response(
        &self,
        dispatch: &Dispatch,
        req: &CanonicalRequest,
        status: u16,
        headers: &HeaderMap,
        body: &str,
    ) -> AttemptAction {
        if dispatch.adapter.is_invalid_credential_error(status, body) {
            self.pool.mark_invalid(&dispatch.email, body.to_string()).await;
            return AttemptAction::NextAttempt;
        }

        let now_ms = self.clock.now_ms();
        let mut err = GatewayError::from_status(status, body, retry_after_secs(headers), dispatch.provider.as_str());
        if let GatewayError::RateLimitExceeded { reset_ms, .. } = &mut err {
            let hint = dispatch.adapter.parse_rate_limit(status, headers, body, now_ms);
            if hint.reset_ms.is_some() {
                *reset_ms = hint.reset_ms;
            }
        }

        match err {
            GatewayError::RateLimitExceeded { reset_ms, .. } => {
                self.pool.mark_rate_limited(&dispatch.email, reset_ms, Some(&req.model)).await;
                AttemptAction::NextAttempt
            }
            GatewayError::AuthInvalidPermanent { reason } => {
                self.pool.mark_invalid(&dispatch.email, reason).await;
                AttemptAction::NextAttempt
            }
            GatewayError::AuthTransient { .. } => {
                self.pool.evict_project(&dispatch.email).await;
                AttemptAction::NextAttempt
            }
            GatewayError::ModelCapacityExhausted { .. } => AttemptAction::Capacity,
            GatewayError::Server5xx { .. } | GatewayError::NetworkTransient { .. } => AttemptAction::NextAttempt,
            other => AttemptAction::Fatal(other),
        }
    }

    async fn attempt_loop_non_stream(
        &self,
        req: &CanonicalRequest,
        cancel: &CancellationToken,
    ) -> Result<CanonicalResponse, GatewayError> {
        let start_ms = self.clock.now_ms();
        let account_count = self.pool.account_count().await;
        let max_attempts = self.max_attempts(account_count);
        let mut attempt = 0u32;

        while attempt < max_attempts {
            if cancel.is_cancelled() {
                return Err(GatewayError::Cancelled);
            }
            if self.clock.now_ms() - start_ms > self.config.max_total_retry_time_ms {
                return Err(GatewayError::MaxRetriesExceeded);
            }

            let dispatch = match self.resolve_dispatch(req, cancel).await? {
                DispatchOutcome::Ready(dispatch) => dispatch,
                DispatchOutcome::Waited => continue,
                DispatchOutcome::Exhausted => {
                    attempt += 1;
                    continue;
                }
            };

            let wire = WireFormat::for_provider(dispatch.provider);
            let mut endpoint_index = 0usize;
            let mut capacity_retries = 0u32;

            loop {
                let built = self.build_request(&dispatch, req, endpoint_index);
                let response = match self.post_cancellable(&built, cancel).await {
                    Ok(response) => response,
                    Err(GatewayError::Cancelled) => return Err(GatewayError::Cancelled),
                    Err(_) => {
                        attempt += 1;
                        break;
                    }
                };

                let status = response.status().as_u16();
                if (200..300).contains(&status) {
                    let body = match response.text().await {
                        Ok(body) => body,
                        Err(e) => {
                            tracing::warn!(error = %e, "failed to read upstream response body");
                            attempt += 1;
                            break;
                        }
                    };
                    match self.upstream.parse_response(wire, &req.model, &body) {
                        Ok(parsed) => {
                            self.pool.notify_success(&dispatch.email, &req.model).await;
                            if dispatch.provider == ProviderKind::Google {
                                let now_ms = self.clock.now_ms();
                                for (id, sig) in switchboard_format::google::collect_tool_signatures(&parsed.content) {
                                    self.registry.google().cache_signature(&id, &sig, now_ms);
                                }
                            }
                            return Ok(parsed);
                        }
                        Err(_) => {
                            attempt += 1;
                            break;
                        }
                    }
                }

                let headers = response.headers().clone();
                let body = response.text().await.unwrap_or_default();
                match self.handle_error_response(&dispatch, req, status, &headers, &body).await {
                    AttemptAction::NextAttempt => {
                        attempt += 1;
                        break;
                    }
                    AttemptAction::Fatal(e) => return Err(e),
                    AttemptAction::Capacity => {
                        match self.next_capacity_step(dispatch.provider, endpoint_index, &mut capacity_retries, cancel).await? {
                            CapacityStep::NextEndpoint(next) => endpoint_index = next,
                            CapacityStep::RetrySameEndpoint => {}
                            CapacityStep::Exhausted => {
                                attempt += 1;
                                break;
                            }
                        }
                    }
                }
            }
        }

        Err(GatewayError::MaxRetriesExceeded)
    }

    async fn attempt_loop_stream(
        &self,
        req: &CanonicalRequest,
        cancel: &CancellationToken,
    ) -> Result<Pin<Box<dyn Stream<Item = CanonicalEvent> + Send>>, GatewayError> {
        let start_ms = self.clock.now_ms();
        let account_count = self.pool.account_count().await;
        let max_attempts = self.max_attempts(account_count);
        let mut attempt = 0u32;

        while attempt < max_attempts {
            if cancel.is_cancelled() {
                return Err(GatewayError::Cancelled);
            }
            if self.clock.now_ms() - start_ms > self.config.max_total_retry_time_ms {
                return Err(GatewayError::MaxRetriesExceeded);
            }

            let dispatch = match self.resolve_dispatch(req, cancel).await? {
                DispatchOutcome::Ready(dispatch) => dispatch,
                DispatchOutcome::Waited => continue,
                DispatchOutcome::Exhausted => {
                    attempt += 1;
                    continue;
                }
            };

            let wire = WireFormat::for_provider(dispatch.provider);
            let mut endpoint_index = 0usize;
            let mut capacity_retries = 0u32;
            let mut empty_retries = 0u32;

            loop {
                let built = self.build_request(&dispatch, req, endpoint_index);
                let response = match self.post_cancellable(&built, cancel).await {
                    Ok(response) => response,
                    Err(GatewayError::Cancelled) => return Err(GatewayError::Cancelled),
                    Err(_) => {
                        attempt += 1;
                        break;
                    }
                };

                let status = response.status().as_u16();
                if (200..300).contains(&status) {
                    let mut events = self.upstream.stream_events(response, wire);
                    match classify_stream_prefix(&mut events).await {
                        Ok(prefix) => {
                            self.pool.notify_success(&dispatch.email, &req.model).await;
                            let combined = futures::stream::iter(prefix).chain(events);
                            let is_google = dispatch.provider == ProviderKind::Google;
                            let registry = self.registry.clone();
                            let now_ms = self.clock.now_ms();
                            let tapped = combined.inspect(move |event| {
                                if !is_google {
                                    return;
                                }
                                if let CanonicalEvent::ContentBlockStart {
                                    block: ContentBlock::ToolUse { id, signature: Some(sig), .. },
                                    ..
                                } = event
                                {
                                    registry.google().cache_signature(id, sig, now_ms);
                                }
                            });
                            return Ok(Box::pin(tapped));
                        }
                        Err(GatewayError::EmptyResponseError) => {
                            if empty_retries < self.config.max_empty_response_retries {
                                let delay_ms = EMPTY_RESPONSE_BACKOFF_MS
                                    [(empty_retries as usize).min(EMPTY_RESPONSE_BACKOFF_MS.len() - 1)];
                                empty_retries += 1;
                                self.sleep_cancellable(Duration::from_millis(delay_ms), cancel).await?;
                                continue;
                            }
                            self.pool.notify_success(&dispatch.email, &req.model).await;
                            return Ok(Box::pin(futures::stream::iter(apology_events())));
                        }
                        Err(_) => {
                            attempt += 1;
                            break;
                        }
                    }
                }

                let headers = response.headers().clone();
                let body = response.text().await.unwrap_or_default();
                match self.handle_error_response(&dispatch, req, status, &headers, &body).await {
                    AttemptAction::NextAttempt => {
                        attempt += 1;
                        break;
                    }
                    AttemptAction::Fatal(e) => return Err(e),
                    AttemptAction::Capacity => {
                        match self.next_capacity_step(dispatch.provider, endpoint_index, &mut capacity_retries, cancel).await? {
                            CapacityStep::NextEndpoint(next) => endpoint_index = next,
                            CapacityStep::RetrySameEndpoint => {}
                            CapacityStep::Exhausted => {
                                attempt += 1;
                                break;
                            }
                        }
                    }
                }
            }
        }

        Err(GatewayError::MaxRetriesExceeded)
    }

    fn build_request(
        &self,
        dispatch: &Dispatch,
        req: &CanonicalRequest,
        endpoint_index: usize,
    ) -> switchboard_providers::BuiltRequest {
        if dispatch.provider == ProviderKind::Google {
            self.registry.google().build_request_for_endpoint(
                req,
                &dispatch.token,
                dispatch.project_id.as_deref(),
                endpoint_index,
                self.clock.now_ms(),
            )
        } else {
            dispatch.adapter.build_request(req, &dispatch.token, None)
        }
    }

    /// §4.6 step 5: for Google, exhaust `CLOUDCODE_ENDPOINT_FALLBACKS` before falling back
    /// to the generic capacity-tier backoff that every provider shares.
    async fn next_capacity_step(
        &self,
        provider: ProviderKind,
        endpoint_index: usize,
        capacity_retries: &mut u32,
        cancel: &CancellationToken,
    ) -> Result<CapacityStep, GatewayError> {
        if provider == ProviderKind::Google && endpoint_index + 1 < CLOUDCODE_ENDPOINT_FALLBACKS.len() {
            return Ok(CapacityStep::NextEndpoint(endpoint_index + 1));
        }
        if *capacity_retries < self.config.max_capacity_retries {
            let delay = jitter(capacity_tier_delay(*capacity_retries as usize), 0.2);
            *capacity_retries += 1;
            self.sleep_cancellable(delay, cancel).await?;
            return Ok(CapacityStep::RetrySameEndpoint);
        }
        Ok(CapacityStep::Exhausted)
    }

    async fn post_cancellable(
        &self,
        built: &switchboard_providers::BuiltRequest,
        cancel: &CancellationToken,
    ) -> Result<reqwest::Response, GatewayError> {
        tokio::select! {
            result = self.upstream.post(built) => result,
            _ = cancel.cancelled() => Err(GatewayError::Cancelled),
        }
    }

    async fn sleep_cancellable(&self, duration: Duration, cancel: &CancellationToken) -> Result<(), GatewayError> {
        tokio::select! {
            _ = self.clock.sleep(duration) => Ok(()),
            _ = cancel.cancelled() => Err(GatewayError::Cancelled),
        }
    }
}

/// Outcome of `resolve_dispatch` (§4.6 step 2): `Ready` proceeds to dispatch, `Waited` means
/// the selector already slept and consumed no attempt budget, `Exhausted` means this tick
/// found nothing usable and spends one attempt.
enum DispatchOutcome {
    Ready(Dispatch),
    Waited,
    Exhausted,
}

enum AttemptAction {
    NextAttempt,
    Capacity,
    Fatal(GatewayError),
}

enum CapacityStep {
    NextEndpoint(usize),
    RetrySameEndpoint,
    Exhausted,
}

fn retry_after_secs(headers: &HeaderMap) -> Option<u64> {
    headers.get("retry-after")?.to_str().ok()?.parse().ok()
}

/// Reads only as much of a per-attempt event stream as is needed to decide whether it
/// produced any content (§4.6 step 5), buffering that prefix and leaving the remainder of
/// `stream` unconsumed. The caller splices the prefix back in front of `stream` so delivery
/// stays genuinely incremental (§4.7: "the consumer MUST NOT be required to exhaust the
/// stream") instead of buffering the whole response before returning anything.
async fn classify_stream_prefix(
    stream: &mut Pin<Box<dyn Stream<Item = CanonicalEvent> + Send>>,
) -> Result<Vec<CanonicalEvent>, GatewayError> {
    let mut prefix = Vec::new();
    while let Some(event) = stream.next().await {
        let is_content = matches!(event, CanonicalEvent::ContentBlockStart { .. } | CanonicalEvent::ContentBlockDelta { .. });
        prefix.push(event);
        if is_content {
            return Ok(prefix);
        }
    }
    Err(GatewayError::EmptyResponseError)
}

fn apology_events() -> Vec<CanonicalEvent> {
    let text = "The upstream provider returned an empty response after repeated retries.";
    vec![
        CanonicalEvent::MessageStart,
        CanonicalEvent::ContentBlockStart { index: 0, block: ContentBlock::text(text) },
        CanonicalEvent::ContentBlockStop { index: 0 },
        CanonicalEvent::MessageDelta { stop_reason: StopReason::EndTurn, usage: Usage::default() },
        CanonicalEvent::MessageStop,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_model_resolves_known_pairs() {
        assert_eq!(fallback_model_for("gemini-3-pro-high"), Some("claude-opus-4-5-thinking"));
        assert_eq!(fallback_model_for("gemini-3-pro"), Some("claude-opus-4-5"));
    }

    #[test]
    fn fallback_model_unknown_is_none() {
        assert_eq!(fallback_model_for("some-random-model"), None);
    }

    #[test]
    fn apology_events_open_and_close_cleanly() {
        let events = apology_events();
        assert!(matches!(events.first(), Some(CanonicalEvent::MessageStart)));
        assert!(matches!(events.last(), Some(CanonicalEvent::MessageStop)));
        assert_eq!(events.len(), 5);
    }

    #[test]
    fn retry_after_secs_parses_numeric_header() {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", "12".parse().unwrap());
        assert_eq!(retry_after_secs(&headers), Some(12));
    }

    #[test]
    fn retry_after_secs_missing_is_none() {
        assert_eq!(retry_after_secs(&HeaderMap::new()), None);
    }

    #[tokio::test]
    async fn classify_stream_prefix_stops_buffering_at_first_content_event() {
        let events = vec![
            CanonicalEvent::MessageStart,
            CanonicalEvent::ContentBlockStart { index: 0, block: ContentBlock::text("") },
            CanonicalEvent::ContentBlockDelta {
                index: 0,
                delta: switchboard_core::stream::ContentBlockDelta::TextDelta { text: "hi".into() },
            },
            CanonicalEvent::ContentBlockStop { index: 0 },
            CanonicalEvent::MessageStop,
        ];
        let mut stream: Pin<Box<dyn Stream<Item = CanonicalEvent> + Send>> =
            Box::pin(futures::stream::iter(events));

        let prefix = classify_stream_prefix(&mut stream).await.unwrap();
        assert_eq!(prefix.len(), 2);
        assert!(matches!(prefix.last(), Some(CanonicalEvent::ContentBlockStart { .. })));

        // the remaining delta/stop/stop events are still there, unconsumed
        let rest: Vec<_> = stream.collect().await;
        assert_eq!(rest.len(), 3);
    }

    #[tokio::test]
    async fn classify_stream_prefix_reports_empty_when_no_content_ever_arrives() {
        let events = vec![CanonicalEvent::MessageStart, CanonicalEvent::MessageStop];
        let mut stream: Pin<Box<dyn Stream<Item = CanonicalEvent> + Send>> =
            Box::pin(futures::stream::iter(events));

        let result = classify_stream_prefix(&mut stream).await;
        assert!(matches!(result, Err(GatewayError::EmptyResponseError)));
    }
}
