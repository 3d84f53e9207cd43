//! End-to-end conversations against scripted models.
//!
//! Each test drives a whole run through [`MockModel`] and checks the
//! resulting history, usage and events.

use std::sync::Arc;

use futures::StreamExt;
use serde_json::{Value, json};

use parley::{Agent, ErrorClass, OutputSpec, OutputVariant, RunContext, RunEvent, RunOptions, ToolError};
use parley_core::events::PartDelta;
use parley_core::messages::{ModelRequestPart, ModelResponsePart, RetryContent, UserContent};
use parley_core::mock::MockModel;
use parley_core::stream::StreamChunk;
use parley_core::test_helpers::{
    init_tracing, mock_model, sample_usage, text_response, tool_call_response,
};
use parley_core::usage::RequestUsage;
use parley_core::{AgentStreamEvent, JsonSchema, ModelMessage, UsageLimits};

fn mock() -> Arc<MockModel> {
    init_tracing();
    Arc::new(mock_model("test", "test-model"))
}

fn country_schema() -> JsonSchema {
    JsonSchema::new(json!({
        "type": "object",
        "properties": {"country": {"type": "string"}},
        "required": ["country"]
    }))
}

#[derive(Debug, PartialEq, serde::Deserialize, schemars::JsonSchema)]
struct Capital {
    city: String,
}

// ── Plain text ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_hello_text_run() {
    let model = mock();
    model.queue_response(text_response("Hello! How can I help?"));
    let agent = Agent::builder(model.clone()).build();

    let result = agent.run("Hello!", RunOptions::default()).await.unwrap();

    assert_eq!(result.output, "Hello! How can I help?");
    assert_eq!(result.usage.requests, 1);
    assert_eq!(result.messages.len(), 2);

    let request = result.messages[0].as_request().unwrap();
    assert_eq!(request.parts.len(), 1);
    let ModelRequestPart::UserPrompt(prompt) = &request.parts[0] else {
        panic!("expected a user prompt, got {:?}", request.parts[0]);
    };
    assert_eq!(prompt.content, UserContent::Text("Hello!".into()));

    let response = result.messages[1].as_response().unwrap();
    assert_eq!(response.text().as_deref(), Some("Hello! How can I help?"));
    assert_eq!(model.request_count(), 1);
}

// ── Function tool then output tool ─────────────────────────────────

#[tokio::test]
async fn test_capital_lookup_with_tool_output() {
    let model = mock();
    model.queue_response(tool_call_response([("get_capital", json!({"country": "France"}))]));
    model.queue_response(tool_call_response([("final_result", json!({"city": "Paris"}))]));

    let agent = Agent::builder(model.clone())
        .tool(
            "get_capital",
            "Get the capital of a country",
            country_schema(),
            |args: Value, _ctx: &RunContext<()>| async move {
                assert_eq!(args["country"], "France");
                Ok::<_, ToolError>("Paris")
            },
        )
        .output(OutputSpec::tool(OutputVariant::<Capital>::of().unwrap()))
        .build();

    let result = agent
        .run("What is the capital of France?", RunOptions::default())
        .await
        .unwrap();

    assert_eq!(result.output, Capital { city: "Paris".into() });
    assert_eq!(result.usage.requests, 2);
    assert_eq!(result.usage.tool_calls, 1);
    let responses = result
        .messages
        .iter()
        .filter(|m| matches!(m, ModelMessage::Response(_)))
        .count();
    assert_eq!(responses, 2);

    let tool_round = result.messages[2].as_request().unwrap();
    let ModelRequestPart::ToolReturn(ret) = &tool_round.parts[0] else {
        panic!("expected a tool return, got {:?}", tool_round.parts[0]);
    };
    assert_eq!(ret.tool_name, "get_capital");
    assert_eq!(ret.content, json!("Paris"));

    let last = result.messages.last().unwrap().as_request().unwrap();
    let ModelRequestPart::ToolReturn(done) = &last.parts[0] else {
        panic!("expected the final result return, got {:?}", last.parts[0]);
    };
    assert_eq!(done.tool_name, "final_result");
    assert_eq!(done.content, json!("Final result processed."));

    let params = &model.recorded_calls()[0].params;
    assert_eq!(params.function_tools.len(), 1);
    assert_eq!(params.output_tools[0].name, "final_result");
    assert!(!params.allow_text_output);
}

// ── Pre-flight token count ─────────────────────────────────────────

#[tokio::test]
async fn test_preflight_count_blocks_request() {
    let model = mock();
    model.queue_token_count(RequestUsage {
        input_tokens: 12,
        ..RequestUsage::default()
    });
    let agent = Agent::builder(model.clone()).build();

    let limits = UsageLimits {
        input_tokens_limit: Some(9),
        count_tokens_before_request: true,
        ..UsageLimits::default()
    };
    let err = agent
        .run("Summarize War and Peace", RunOptions::default().with_usage_limits(limits))
        .await
        .unwrap_err();

    assert_eq!(err.class(), ErrorClass::UsageLimitExceeded);
    assert_eq!(err.usage.requests, 0);
    assert_eq!(model.request_count(), 0);
    assert_eq!(err.messages.len(), 1);
}

// ── Tool asks for a retry ──────────────────────────────────────────

#[tokio::test]
async fn test_tool_retry_is_paired_and_run_continues() {
    let model = mock();
    model.queue_response(tool_call_response([("get_capital", json!({"country": "Atlantis"}))]));
    model.queue_response(text_response("Atlantis has no capital I know of."));

    let agent = Agent::builder(model)
        .tool(
            "get_capital",
            "Get the capital of a country",
            country_schema(),
            |_args: Value, _ctx: &RunContext<()>| async move {
                Err::<String, _>(ToolError::retry("not supported"))
            },
        )
        .build();

    let result = agent
        .run("What is the capital of Atlantis?", RunOptions::default())
        .await
        .unwrap();

    assert_eq!(result.output, "Atlantis has no capital I know of.");
    assert_eq!(result.usage.tool_calls, 0);

    let call = result.messages[1].as_response().unwrap().tool_calls()[0].clone();
    let retry_round = result.messages[2].as_request().unwrap();
    let ModelRequestPart::RetryPrompt(retry) = &retry_round.parts[0] else {
        panic!("expected a retry prompt, got {:?}", retry_round.parts[0]);
    };
    assert_eq!(retry.content, RetryContent::Text("not supported".into()));
    assert_eq!(retry.tool_call_id.as_deref(), Some(call.tool_call_id.as_str()));
    assert_eq!(retry.tool_name.as_deref(), Some("get_capital"));
}

// ── Streamed thinking then text ────────────────────────────────────

#[tokio::test]
async fn test_streamed_thinking_then_text_events() {
    let model = mock();
    model.queue_stream(vec![
        StreamChunk::thinking("The user"),
        StreamChunk::thinking(" says hi."),
        StreamChunk::text("Hel"),
        StreamChunk::text("lo"),
        StreamChunk::Usage(sample_usage()),
    ]);
    let agent = Agent::builder(model).build();

    let items: Vec<_> = agent
        .run_stream_events("Hi", RunOptions::default())
        .collect()
        .await;
    let mut items = items.into_iter().map(Result::unwrap).collect::<Vec<_>>();

    let Some(RunEvent::Done(result)) = items.pop() else {
        panic!("the stream must end with Done");
    };
    assert_eq!(result.output, "Hello");
    assert_eq!(result.usage.requests, 1);
    assert_eq!(result.usage.input_tokens, 100);

    let events: Vec<AgentStreamEvent> = items
        .into_iter()
        .map(|item| item.as_event().cloned().unwrap())
        .collect();
    assert_eq!(events.len(), 5, "{events:#?}");
    assert!(matches!(
        &events[0],
        AgentStreamEvent::PartStart { index: 0, part: ModelResponsePart::Thinking(_) }
    ));
    assert!(matches!(
        &events[1],
        AgentStreamEvent::PartDelta { index: 0, delta: PartDelta::Thinking(_) }
    ));
    assert!(matches!(
        &events[2],
        AgentStreamEvent::PartStart { index: 1, part: ModelResponsePart::Text(_) }
    ));
    assert_eq!(
        events[3],
        AgentStreamEvent::FinalResult {
            tool_name: None,
            tool_call_id: None,
        }
    );
    assert!(matches!(
        &events[4],
        AgentStreamEvent::PartDelta { index: 1, delta: PartDelta::Text(_) }
    ));
}
