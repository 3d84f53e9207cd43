//! Pre-built helpers for testing code that uses `parley-core` types.
//!
//! Available when the `test-utils` feature is enabled, so downstream
//! crates can reuse them in their own test suites. Also compiled during
//! `#[cfg(test)]` for this crate's own tests. Provides sample responses,
//! stream collectors, a quick [`MockModel`] factory and a tracing
//! subscriber for test output.

use std::borrow::Cow;

use futures::StreamExt;

use crate::error::ModelError;
use crate::messages::{FinishReason, ModelResponse, ModelResponsePart, ToolCallArgs};
use crate::mock::MockModel;
use crate::provider::{ModelMetadata, ModelProfile};
use crate::stream::{ChunkStream, StreamChunk, StreamedResponse};
use crate::events::AgentStreamEvent;
use crate::usage::RequestUsage;

/// Builds a [`ModelResponse`] with a single text part and sample usage.
pub fn text_response(text: &str) -> ModelResponse {
    ModelResponse::new(vec![ModelResponsePart::text(text)])
        .with_usage(sample_usage())
        .with_finish_reason(FinishReason::Stop)
}

/// Builds a [`ModelResponse`] containing one tool call per `(name, args)`
/// pair, with ids `call_1`, `call_2`, ….
pub fn tool_call_response<A: Into<ToolCallArgs>>(
    calls: impl IntoIterator<Item = (&'static str, A)>,
) -> ModelResponse {
    let parts = calls
        .into_iter()
        .enumerate()
        .map(|(i, (name, args))| ModelResponsePart::tool_call(name, args, format!("call_{}", i + 1)))
        .collect();
    ModelResponse::new(parts)
        .with_usage(sample_usage())
        .with_finish_reason(FinishReason::ToolCall)
}

/// Returns a [`RequestUsage`] with 100 input / 50 output tokens.
pub fn sample_usage() -> RequestUsage {
    RequestUsage {
        input_tokens: 100,
        output_tokens: 50,
        ..Default::default()
    }
}

/// Collect raw chunks, returning results including errors.
pub async fn collect_chunk_results(stream: ChunkStream) -> Vec<Result<StreamChunk, ModelError>> {
    stream.collect::<Vec<_>>().await
}

/// Drives a [`StreamedResponse`] to the end, panicking on any error.
pub async fn collect_events(streamed: &mut StreamedResponse) -> Vec<AgentStreamEvent> {
    let mut events = Vec::new();
    while let Some(event) = streamed.next_event().await {
        events.push(event.expect("stream event should be Ok"));
    }
    events
}

/// Creates a [`MockModel`] with the given names and a profile that
/// supports every output mode.
pub fn mock_model(provider_name: &str, model_name: &str) -> MockModel {
    MockModel::new(ModelMetadata {
        provider_name: Cow::Owned(provider_name.to_owned()),
        model_name: model_name.to_owned(),
        profile: ModelProfile::full(),
    })
}

/// Installs a `tracing` subscriber that writes to the test harness.
///
/// Honors `RUST_LOG`; safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Model;
    use serde_json::json;

    #[test]
    fn test_text_response_is_valid() {
        let r = text_response("hello");
        assert_eq!(r.text().as_deref(), Some("hello"));
        assert_eq!(r.finish_reason, Some(FinishReason::Stop));
        assert_eq!(r.usage.input_tokens, 100);
    }

    #[test]
    fn test_tool_call_response_ids() {
        let r = tool_call_response([("a", json!({})), ("b", json!({"x": 1}))]);
        let calls = r.tool_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].tool_call_id, "call_1");
        assert_eq!(calls[1].tool_name, "b");
    }

    #[tokio::test]
    async fn test_collect_chunk_results_with_errors() {
        let stream: ChunkStream = Box::pin(futures::stream::iter(vec![
            Ok(StreamChunk::text("hi")),
            Err(ModelError::Http {
                status: Some(http::StatusCode::INTERNAL_SERVER_ERROR),
                message: "server error".into(),
                retryable: true,
            }),
        ]));
        let collected = collect_chunk_results(stream).await;
        assert_eq!(collected.len(), 2);
        assert!(collected[1].is_err());
    }

    #[tokio::test]
    async fn test_collect_events() {
        let stream: ChunkStream = Box::pin(futures::stream::iter(vec![
            Ok(StreamChunk::text("a")),
            Ok(StreamChunk::text("b")),
        ]));
        let mut streamed = StreamedResponse::new(stream);
        let events = collect_events(&mut streamed).await;
        assert_eq!(events.len(), 2);
        assert_eq!(streamed.get().text().as_deref(), Some("ab"));
    }

    #[test]
    fn test_mock_model_helper() {
        init_tracing();
        let mock = mock_model("google", "gemini-2.0-flash");
        let meta = Model::metadata(&mock);
        assert_eq!(meta.provider_name, "google");
        assert_eq!(meta.model_name, "gemini-2.0-flash");
        assert!(meta.profile.supports_json_schema_output);
    }
}
