//! Upstream HTTP client (C7, §4.7): issues the POST a resolved `BuiltRequest` describes and
//! turns a successful response into either a `CanonicalResponse` or a cancellable sequence
//! of `CanonicalEvent`s. Classification of *unsuccessful* responses stays with the retry
//! engine (§4.6 step 5), since that needs the provider adapter's own rate-limit/invalid-
//! credential hints, not just the wire shape.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use switchboard_core::messages::CanonicalResponse;
use switchboard_core::security::ProviderKind;
use switchboard_core::stream::CanonicalEvent;
use switchboard_core::GatewayError;
use switchboard_format::anthropic_openai::wire::{OpenAiChatResponse, OpenAiStreamChunk};
use switchboard_format::google::{GoogleGenerateResponse, GoogleStreamTranslator};
use switchboard_format::{NativeAnthropicStreamTranslator, StreamTranslator};
use switchboard_providers::BuiltRequest;

/// Upstream connections that sit idle this long without a byte are treated as dead rather
/// than waited on forever, the same idle-timeout idiom used for the single-provider client
/// this one generalizes.
const SSE_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Which wire shape a provider speaks (§4.3). Anthropic's native wire and `CanonicalEvent`
/// differ in two small reshapes; Google wraps the request in an envelope and needs its own
/// response conversion; every other provider speaks OpenAI-chat in both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Native,
    Google,
    OpenAiChat,
}

impl WireFormat {
    pub fn for_provider(kind: ProviderKind) -> Self {
        match kind {
            ProviderKind::Anthropic => WireFormat::Native,
            ProviderKind::Google => WireFormat::Google,
            ProviderKind::OpenAi
            | ProviderKind::OpenRouter
            | ProviderKind::GithubModels
            | ProviderKind::Copilot
            | ProviderKind::Codex => WireFormat::OpenAiChat,
        }
    }
}

enum Translator {
    Native(NativeAnthropicStreamTranslator),
    Google(GoogleStreamTranslator),
    OpenAiChat(StreamTranslator),
}

impl Translator {
    fn new(wire: WireFormat) -> Self {
        match wire {
            WireFormat::Native => Translator::Native(NativeAnthropicStreamTranslator::new()),
            WireFormat::Google => Translator::Google(GoogleStreamTranslator::new()),
            WireFormat::OpenAiChat => Translator::OpenAiChat(StreamTranslator::new()),
        }
    }

    /// `data` is one SSE `data:` payload with the prefix already stripped.
    fn feed(&mut self, data: &str) -> Vec<CanonicalEvent> {
        if data.trim() == "[DONE]" {
            return Vec::new();
        }
        match self {
            Translator::Native(t) => t.feed(data),
            Translator::Google(t) => match serde_json::from_str::<GoogleGenerateResponse>(data) {
                Ok(chunk) => t.feed(&chunk),
                Err(_) => Vec::new(),
            },
            Translator::OpenAiChat(t) => match serde_json::from_str::<OpenAiStreamChunk>(data) {
                Ok(chunk) => t.feed(&chunk),
                Err(_) => Vec::new(),
            },
        }
    }

    fn finish_without_reason(&mut self) -> Vec<CanonicalEvent> {
        match self {
            Translator::Native(t) => t.finish_without_reason(),
            Translator::Google(t) => t.finish_without_reason(),
            Translator::OpenAiChat(t) => t.finish_without_reason(),
        }
    }
}

pub struct UpstreamClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl UpstreamClient {
    pub fn new(timeout: Duration) -> Self {
        Self { client: reqwest::Client::new(), timeout }
    }

    /// Issues the POST itself. `built` already carries the fully-resolved URL, headers, and
    /// body; this has no provider-specific knowledge left to apply.
    pub async fn post(&self, built: &BuiltRequest) -> Result<reqwest::Response, GatewayError> {
        let mut builder = self.client.post(&built.url).json(&built.body).timeout(self.timeout);
        for (name, value) in &built.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder.send().await.map_err(|e| GatewayError::NetworkTransient { message: e.to_string() })
    }

    /// Parses a complete (non-stream) response body per `wire`'s shape (§4.3).
    pub fn parse_response(
        &self,
        wire: WireFormat,
        model: &str,
        body: &str,
    ) -> Result<CanonicalResponse, GatewayError> {
        match wire {
            WireFormat::Native => switchboard_format::native::parse_response(model, body)
                .map_err(|e| malformed_body_error(wire, &e.to_string())),
            WireFormat::Google => {
                let parsed: GoogleGenerateResponse =
                    serde_json::from_str(body).map_err(|e| malformed_body_error(wire, &e.to_string()))?;
                Ok(switchboard_format::google::convert_response(model, &parsed))
            }
            WireFormat::OpenAiChat => {
                let parsed: OpenAiChatResponse =
                    serde_json::from_str(body).map_err(|e| malformed_body_error(wire, &e.to_string()))?;
                Ok(switchboard_format::convert_response(model, &parsed))
            }
        }
    }

    /// Wraps a successful streaming response into a sequence of canonical events (§4.7, §9
    /// "pull iterator, not a callback"). Dropping the returned stream drops the response
    /// body with it, releasing the connection without any explicit close call.
    pub fn stream_events(
        &self,
        response: reqwest::Response,
        wire: WireFormat,
    ) -> Pin<Box<dyn Stream<Item = CanonicalEvent> + Send>> {
        Box::pin(SseStream::new(response, wire))
    }
}

fn malformed_body_error(wire: WireFormat, detail: &str) -> GatewayError {
    GatewayError::UpstreamError {
        provider: format!("{wire:?}"),
        status: 0,
        body: format!("malformed response body: {detail}"),
    }
}

/// Turns a byte stream into canonical events, splitting on blank-line-delimited SSE frames
/// and feeding each `data:` payload to the matching translator. Generalizes the
/// idle-timeout-via-resettable-sleep idiom of the single-provider client this replaces to
/// all three wire formats.
struct SseStream {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
    translator: Translator,
    buffer: String,
    pending: std::collections::VecDeque<CanonicalEvent>,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    finished: bool,
}

impl SseStream {
    fn new(response: reqwest::Response, wire: WireFormat) -> Self {
        Self {
            inner: Box::pin(response.bytes_stream()),
            translator: Translator::new(wire),
            buffer: String::new(),
            pending: std::collections::VecDeque::new(),
            idle_deadline: Box::pin(tokio::time::sleep(SSE_IDLE_TIMEOUT)),
            finished: false,
        }
    }

    fn consume_buffer(&mut self) {
        while let Some(pos) = self.buffer.find("\n\n") {
            let frame: String = self.buffer.drain(..pos + 2).collect();
            for line in frame.lines() {
                let data = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:"));
                if let Some(data) = data {
                    self.pending.extend(self.translator.feed(data.trim_start()));
                }
            }
        }
    }

    fn close(&mut self) {
        self.finished = true;
        self.pending.extend(self.translator.finish_without_reason());
    }
}

impl Stream for SseStream {
    type Item = CanonicalEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if let Some(event) = this.pending.pop_front() {
            return Poll::Ready(Some(event));
        }
        if this.finished {
            return Poll::Ready(None);
        }

        loop {
            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    this.idle_deadline.as_mut().reset(tokio::time::Instant::now() + SSE_IDLE_TIMEOUT);
                    this.buffer.push_str(&String::from_utf8_lossy(&bytes));
                    this.consume_buffer();
                    if let Some(event) = this.pending.pop_front() {
                        return Poll::Ready(Some(event));
                    }
                    // No complete frame in this chunk yet; poll again for more bytes.
                    continue;
                }
                Poll::Ready(Some(Err(_))) | Poll::Ready(None) => {
                    this.close();
                    return Poll::Ready(this.pending.pop_front());
                }
                Poll::Pending => {
                    if std::future::Future::poll(this.idle_deadline.as_mut(), cx).is_ready() {
                        this.close();
                        return Poll::Ready(this.pending.pop_front());
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_core::security::ProviderKind;

    #[test]
    fn wire_format_routes_anthropic_to_native() {
        assert_eq!(WireFormat::for_provider(ProviderKind::Anthropic), WireFormat::Native);
    }

    #[test]
    fn wire_format_routes_google_to_google() {
        assert_eq!(WireFormat::for_provider(ProviderKind::Google), WireFormat::Google);
    }

    #[test]
    fn wire_format_routes_everything_else_to_openai_chat() {
        for kind in [
            ProviderKind::OpenAi,
            ProviderKind::OpenRouter,
            ProviderKind::GithubModels,
            ProviderKind::Copilot,
            ProviderKind::Codex,
        ] {
            assert_eq!(WireFormat::for_provider(kind), WireFormat::OpenAiChat);
        }
    }

    #[test]
    fn parse_response_rejects_malformed_body_per_wire() {
        let client = UpstreamClient::new(Duration::from_secs(1));
        let err = client.parse_response(WireFormat::Native, "claude-opus-4-5", "not json").unwrap_err();
        assert!(matches!(err, GatewayError::UpstreamError { .. }));
    }

    #[test]
    fn translator_ignores_done_sentinel() {
        let mut translator = Translator::new(WireFormat::OpenAiChat);
        assert!(translator.feed("[DONE]").is_empty());
    }
}
