//! Tests for the run state machine.

use std::any::Any;
use std::borrow::Cow;
use std::sync::Arc;

use parley_core::messages::{ModelRequest, ModelRequestPart};
use parley_core::mock::{MockError, MockModel};
use parley_core::provider::BuiltinTool;
use parley_core::stream::StreamChunk;
use parley_core::test_helpers::{mock_model, sample_usage, text_response, tool_call_response};
use parley_core::{
    AgentStreamEvent, JsonSchema, ModelError, ModelMessage, ModelMetadata, ModelProfile,
    ModelSettings, SettingsExtension,
};
use serde_json::{Value, json};

use super::*;
use crate::error::{ErrorClass, RunErrorKind};
use crate::output::OutputVariant;

fn mock() -> Arc<MockModel> {
    Arc::new(mock_model("test", "test-model"))
}

fn capital_agent(model: Arc<MockModel>) -> Agent {
    Agent::builder(model)
        .tool(
            "get_capital",
            "Get the capital of a country",
            JsonSchema::new(json!({
                "type": "object",
                "properties": {"country": {"type": "string"}},
                "required": ["country"]
            })),
            |args: Value, _ctx: &RunContext<()>| async move {
                match args["country"].as_str() {
                    Some("France") => Ok("Paris"),
                    _ => Err(ToolError::retry("The country is not supported.")),
                }
            },
        )
        .build()
}

#[derive(Debug)]
struct OtherVendor;

impl SettingsExtension for OtherVendor {
    fn provider(&self) -> &str {
        "other"
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ── Node walk ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_next_walks_every_node() {
    let model = mock();
    model.queue_response(text_response("Hello world"));
    let agent = Agent::builder(model.clone()).build();

    let mut run = agent.iter("Hello!", RunOptions::default());
    assert_eq!(run.node(), NodeKind::UserPrompt);
    assert_eq!(run.next().await.unwrap(), NodeKind::ModelRequest);
    assert!(run.messages().is_empty());
    assert_eq!(run.next().await.unwrap(), NodeKind::CallTools);
    assert_eq!(run.messages().len(), 2);
    assert_eq!(run.next().await.unwrap(), NodeKind::End);
    assert_eq!(run.next().await.unwrap(), NodeKind::End);
    assert_eq!(run.output().map(String::as_str), Some("Hello world"));

    let result = run.into_result().unwrap();
    assert_eq!(result.usage.requests, 1);
    assert_eq!(result.new_messages().len(), 2);
    assert_eq!(model.request_count(), 1);
}

#[tokio::test]
async fn test_into_result_before_end_fails() {
    let agent = Agent::builder(mock()).build();
    let run = agent.iter("Hello!", RunOptions::default());
    let err = run.into_result().unwrap_err();
    assert_eq!(err.class(), ErrorClass::UnexpectedModelBehavior);
    assert!(err.to_string().contains("UserPrompt"));
}

#[tokio::test]
async fn test_failed_run_stays_failed() {
    let model = mock();
    model.queue_error(MockError::Auth("invalid api key".into()));
    let agent = Agent::builder(model).build();

    let mut run = agent.iter("Hello!", RunOptions::default());
    run.next().await.unwrap();
    let err = run.next().await.unwrap_err();
    assert!(matches!(err.kind, RunErrorKind::Model(ModelError::Auth(_))));
    assert_eq!(err.messages.len(), 1);
    assert_eq!(run.node(), NodeKind::Failed);

    let again = run.next().await.unwrap_err();
    assert!(again.to_string().contains("already failed"));
}

// ── Request assembly ────────────────────────────────────────────────

#[tokio::test]
async fn test_system_prompts_only_start_a_conversation() {
    let model = mock();
    model.queue_response(text_response("Bonjour"));
    model.queue_response(text_response("Encore"));
    let agent = Agent::builder(model.clone())
        .system_prompt("Be brief.")
        .instructions("Answer in French.")
        .build();

    let first = agent.run("Hi", RunOptions::default()).await.unwrap();
    let request = first.messages[0].as_request().unwrap();
    assert!(matches!(request.parts[0], ModelRequestPart::SystemPrompt(_)));
    assert!(matches!(request.parts[1], ModelRequestPart::UserPrompt(_)));
    assert_eq!(request.instructions.as_deref(), Some("Answer in French."));

    let second = agent
        .run("Again", RunOptions::default().with_history(first.messages.clone()))
        .await
        .unwrap();
    assert_eq!(second.messages.len(), 4);
    let new = second.new_messages();
    assert_eq!(new.len(), 2);
    let request = new[0].as_request().unwrap();
    assert_eq!(request.parts.len(), 1);
    assert!(matches!(request.parts[0], ModelRequestPart::UserPrompt(_)));
    assert_eq!(model.recorded_calls()[1].messages.len(), 3);
}

#[tokio::test]
async fn test_no_prompt_resends_trailing_request() {
    let model = mock();
    model.queue_response(text_response("42"));
    let agent = Agent::builder(model.clone()).system_prompt("unused").build();
    let history = vec![ModelMessage::Request(ModelRequest::user_text_prompt(
        "What is six times seven?",
    ))];

    let result = agent
        .run(Prompt::none(), RunOptions::default().with_history(history))
        .await
        .unwrap();
    assert_eq!(result.messages.len(), 2);
    assert_eq!(result.new_messages().len(), 2);
    let sent = &model.recorded_calls()[0].messages;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].as_request().unwrap().parts.len(), 1);
}

#[tokio::test]
async fn test_no_prompt_no_history_sends_only_system_prompts() {
    let model = mock();
    model.queue_response(text_response("Hello"));
    let agent = Agent::builder(model.clone())
        .system_prompt("Greet the user.")
        .build();

    let result = agent.run(Prompt::none(), RunOptions::default()).await.unwrap();
    let request = result.messages[0].as_request().unwrap();
    assert_eq!(request.parts.len(), 1);
    assert!(matches!(request.parts[0], ModelRequestPart::SystemPrompt(_)));
}

#[tokio::test]
async fn test_prompted_template_joins_instructions() {
    #[derive(Debug, serde::Deserialize, schemars::JsonSchema)]
    struct Answer {
        value: i64,
    }

    let model = mock();
    model.queue_response(text_response(r#"{"value": 42}"#));
    let agent = Agent::builder(model.clone())
        .instructions("Be exact.")
        .output(OutputSpec::prompted(OutputVariant::<Answer>::of().unwrap()))
        .build();

    let result = agent.run("Six times seven?", RunOptions::default()).await.unwrap();
    assert_eq!(result.output.value, 42);
    let call = &model.recorded_calls()[0];
    let instructions = call.messages[0].as_request().unwrap().instructions.as_deref().unwrap();
    assert!(instructions.starts_with("Be exact.\n\nAlways respond with a JSON object"));
    assert!(call.params.output_object.is_some());
    assert!(call.params.allow_text_output);
}

#[tokio::test]
async fn test_request_parameters_and_settings() {
    let model = mock();
    model.queue_response(text_response("ok"));
    let agent = Agent::builder(model.clone())
        .builtin_tool(BuiltinTool::WebSearch)
        .model_settings(ModelSettings {
            temperature: Some(0.2),
            max_tokens: Some(100),
            ..Default::default()
        })
        .build();

    let options = RunOptions::default().with_model_settings(ModelSettings {
        max_tokens: Some(10),
        ..Default::default()
    });
    agent.run("Search", options).await.unwrap();

    let call = &model.recorded_calls()[0];
    assert_eq!(call.params.builtin_tools, vec![BuiltinTool::WebSearch]);
    assert_eq!(call.settings.temperature, Some(0.2));
    assert_eq!(call.settings.max_tokens, Some(10));
}

#[tokio::test]
async fn test_rejected_extension_is_a_configuration_error() {
    let model = mock();
    let agent = Agent::builder(model.clone())
        .model_settings(ModelSettings {
            extension: Some(Arc::new(OtherVendor)),
            ..Default::default()
        })
        .build();

    let err = agent.run("Hi", RunOptions::default()).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Configuration);
    assert_eq!(model.request_count(), 0);
}

#[tokio::test]
async fn test_tools_without_tool_support_fail_early() {
    let model = Arc::new(MockModel::new(ModelMetadata {
        provider_name: Cow::Borrowed("test"),
        model_name: "plain".into(),
        profile: ModelProfile {
            supports_tools: false,
            ..ModelProfile::default()
        },
    }));
    let agent = capital_agent(model.clone());

    let err = agent.run("Capital?", RunOptions::default()).await.unwrap_err();
    assert!(matches!(&err.kind, RunErrorKind::Configuration(msg) if msg == "plain does not support tools"));
    assert!(err.messages.is_empty());
    assert_eq!(model.request_count(), 0);
}

// ── Node events ─────────────────────────────────────────────────────

#[tokio::test]
async fn test_abandoned_stream_is_drained() {
    let model = mock();
    model.queue_stream(vec![
        StreamChunk::text("Hel"),
        StreamChunk::text("lo"),
        StreamChunk::Usage(sample_usage()),
    ]);
    let agent = Agent::builder(model.clone()).build();

    let mut run = agent.iter("Hi", RunOptions::default());
    assert_eq!(run.next().await.unwrap(), NodeKind::ModelRequest);
    {
        let mut events = run.stream_node();
        let first = events.next().await.unwrap().unwrap();
        assert!(matches!(first, AgentStreamEvent::PartStart { index: 0, .. }));
    }
    assert_eq!(run.node(), NodeKind::Streaming);

    assert_eq!(run.next().await.unwrap(), NodeKind::CallTools);
    assert_eq!(run.next().await.unwrap(), NodeKind::End);
    assert_eq!(run.output().map(String::as_str), Some("Hello"));
    assert_eq!(run.usage().input_tokens, 100);
    assert_eq!(run.usage().requests, 1);
}

#[tokio::test]
async fn test_stream_node_reports_tool_round() {
    let model = mock();
    model.queue_response(tool_call_response([("get_capital", json!({"country": "France"}))]));
    model.queue_response(text_response("Paris it is"));
    let agent = capital_agent(model);

    let mut run = agent.iter("Capital of France?", RunOptions::default());
    run.next().await.unwrap();
    assert_eq!(run.next().await.unwrap(), NodeKind::CallTools);

    let mut seen = Vec::new();
    let mut events = run.stream_node();
    while let Some(event) = events.next().await {
        seen.push(event.unwrap());
    }
    assert!(events.next().await.is_none());
    drop(events);

    assert_eq!(seen.len(), 2);
    assert!(matches!(&seen[0], AgentStreamEvent::FunctionToolCall { part } if part.tool_call_id == "call_1"));
    assert!(matches!(
        &seen[1],
        AgentStreamEvent::FunctionToolResult { result } if !result.is_retry()
    ));
    assert_eq!(run.node(), NodeKind::ModelRequest);
    assert_eq!(run.usage().tool_calls, 1);

    assert_eq!(run.next().await.unwrap(), NodeKind::CallTools);
    assert_eq!(run.next().await.unwrap(), NodeKind::End);
    assert_eq!(run.output().map(String::as_str), Some("Paris it is"));
}

#[tokio::test]
async fn test_stream_node_error_fails_the_run() {
    let model = mock();
    model.queue_stream_then_error(
        vec![StreamChunk::text("Hel")],
        MockError::Http {
            status: None,
            message: "connection reset".into(),
            retryable: true,
        },
    );
    let agent = Agent::builder(model).build();

    let mut run = agent.iter("Hi", RunOptions::default());
    run.next().await.unwrap();
    let mut events = run.stream_node();
    let mut error = None;
    while let Some(event) = events.next().await {
        if let Err(err) = event {
            error = Some(err);
        }
    }
    drop(events);
    let error = error.unwrap();
    assert_eq!(error.class(), ErrorClass::Provider);
    assert_eq!(run.node(), NodeKind::Failed);
}

// ── Output validators ───────────────────────────────────────────────

#[tokio::test]
async fn test_output_validator_rewrites_and_retries() {
    let model = mock();
    model.queue_response(text_response("paris"));
    model.queue_response(text_response("Paris"));
    let agent = Agent::builder(model.clone())
        .output_validator(|output: String, ctx: &RunContext<()>| {
            if output.chars().next().is_some_and(char::is_lowercase) {
                assert_eq!(ctx.retry, 0);
                return Err(ModelRetry::new("Capitalize the city name"));
            }
            Ok(format!("{output}!"))
        })
        .build();

    let result = agent.run("Capital of France?", RunOptions::default()).await.unwrap();
    assert_eq!(result.output, "Paris!");
    assert_eq!(result.usage.requests, 2);
    let retry = result.messages[2].as_request().unwrap();
    assert!(matches!(
        &retry.parts[0],
        ModelRequestPart::RetryPrompt(part) if part.tool_name.is_none()
    ));
}

#[tokio::test]
async fn test_validators_before_output_are_dropped() {
    let model = mock();
    model.queue_response(text_response("7"));
    let agent = Agent::builder(model)
        .output_validator(|_: String, _: &RunContext<()>| Err(ModelRetry::new("never")))
        .output(OutputSpec::text_with(|text: String| {
            text.parse::<i64>().map_err(|e| ModelRetry::new(e.to_string()))
        }))
        .build();

    let result = agent.run("Pick a number", RunOptions::default()).await.unwrap();
    assert_eq!(result.output, 7);
}

#[tokio::test]
async fn test_agent_is_cheap_to_clone_and_debug() {
    let agent = capital_agent(mock());
    let other = agent.clone();
    assert_eq!(other.tools().names(), ["get_capital"]);
    assert_eq!(other.config(), &AgentConfig::default());
    let debug = format!("{agent:?}");
    assert!(debug.contains("test-model"));
    assert!(debug.contains("get_capital"));
}
