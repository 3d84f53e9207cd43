//! Behavioral guarantees of the engine, checked end to end.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use parley::{
    Agent, AgentBuilder, EndStrategy, ErrorClass, OutputSpec, OutputVariant, RunContext,
    RunErrorKind, RunOptions, ToolError,
};
use parley_core::function::{AgentInfo, FunctionModel};
use parley_core::messages::{
    BuiltinToolCallPart, BuiltinToolReturnPart, FinishReason, ModelRequestPart, ModelResponsePart,
    RetryContent, messages_from_json, messages_to_json,
};
use parley_core::mock::{MockError, MockModel};
use parley_core::test_helpers::{
    init_tracing, mock_model, sample_usage, text_response, tool_call_response,
};
use parley_core::usage::LimitKind;
use parley_core::{
    JsonSchema, ModelError, ModelMessage, ModelMetadata, ModelProfile, ModelResponse,
    ModelSettings, OutputMode, UsageLimits,
};

fn mock() -> Arc<MockModel> {
    init_tracing();
    Arc::new(mock_model("test", "test-model"))
}

fn object_schema() -> JsonSchema {
    JsonSchema::new(json!({"type": "object", "properties": {}}))
}

fn echo_agent(model: Arc<MockModel>) -> Agent {
    Agent::builder(model)
        .tool(
            "echo",
            "Echo the arguments back",
            object_schema(),
            |args: Value, _ctx: &RunContext<()>| async move { Ok::<_, ToolError>(args) },
        )
        .build()
}

fn request_parts(message: &ModelMessage) -> &[ModelRequestPart] {
    &message.as_request().unwrap().parts
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, schemars::JsonSchema)]
struct Capital {
    city: String,
}

#[derive(Debug, Clone, PartialEq, serde::Deserialize, schemars::JsonSchema)]
struct Weather {
    celsius: i32,
}

#[derive(Debug, Clone, PartialEq)]
enum Answer {
    Capital(Capital),
    Weather(Weather),
}

// ── Pairing and accounting ──────────────────────────────────────────

#[tokio::test]
async fn test_every_call_is_answered_and_usage_sums() {
    let model = mock();
    model.queue_response(tool_call_response([
        ("echo", json!({"n": 1})),
        ("echo", json!({"n": 2})),
    ]));
    model.queue_response(tool_call_response([("echo", json!({"n": 3}))]));
    model.queue_response(text_response("done"));
    let agent = echo_agent(model);

    let result = agent.run("Echo three times", RunOptions::default()).await.unwrap();

    let mut calls = Vec::new();
    let mut answers = Vec::new();
    for message in &result.messages {
        match message {
            ModelMessage::Response(response) => {
                calls.extend(response.tool_calls().into_iter().map(|c| c.tool_call_id.clone()));
            }
            ModelMessage::Request(request) => {
                answers.extend(request.parts.iter().filter_map(|p| p.tool_call_id().map(str::to_owned)));
            }
        }
    }
    assert_eq!(calls.len(), 3);
    assert_eq!(calls, answers);

    assert_eq!(result.usage.requests, 3);
    assert_eq!(result.usage.tool_calls, 3);
    assert_eq!(result.usage.input_tokens, 3 * sample_usage().input_tokens);
    assert_eq!(result.usage.output_tokens, 3 * sample_usage().output_tokens);
}

#[tokio::test]
async fn test_history_survives_json_round_trip() {
    let model = Arc::new(FunctionModel::new(|messages: Vec<ModelMessage>, _info: AgentInfo| async move {
        if messages.len() == 1 {
            return Ok(ModelResponse::new(vec![
                ModelResponsePart::thinking("Look it up first."),
                serde_json::from_value(json!({
                    "part_kind": "builtin-tool-call",
                    "tool_name": "web_search",
                    "args": {"query": "capital of France"},
                    "tool_call_id": "ws_1"
                }))
                .unwrap(),
                serde_json::from_value(json!({
                    "part_kind": "builtin-tool-return",
                    "tool_name": "web_search",
                    "content": {"results": ["Paris"]},
                    "tool_call_id": "ws_1"
                }))
                .unwrap(),
                ModelResponsePart::tool_call("lookup", json!({"country": "France"}), "call_a"),
                ModelResponsePart::tool_call("missing", json!({}), "call_b"),
            ])
            .with_usage(sample_usage()));
        }
        Ok(ModelResponse::new(vec![ModelResponsePart::text("Paris")]))
    }));
    let agent = Agent::builder(model)
        .system_prompt("You know geography.")
        .tool(
            "lookup",
            "Look up a capital",
            object_schema(),
            |_args: Value, _ctx: &RunContext<()>| async move { Ok::<_, ToolError>(json!({"capital": "Paris"})) },
        )
        .build();

    let result = agent.run("Capital of France?", RunOptions::default()).await.unwrap();
    assert_eq!(result.messages.len(), 4);
    assert!(matches!(request_parts(&result.messages[2])[1], ModelRequestPart::RetryPrompt(_)));

    let json = result.all_messages_json().unwrap();
    let restored = messages_from_json(&json).unwrap();
    assert_eq!(restored, result.messages);
    assert_eq!(messages_to_json(&restored).unwrap(), json);
}

#[tokio::test]
async fn test_missing_call_ids_are_generated() {
    let model = mock();
    model.queue_response(
        ModelResponse::new(vec![
            ModelResponsePart::tool_call("echo", json!({"n": 1}), ""),
            ModelResponsePart::tool_call("echo", json!({"n": 2}), ""),
        ])
        .with_usage(sample_usage()),
    );
    model.queue_response(text_response("done"));
    let agent = echo_agent(model);

    let result = agent.run("Echo twice", RunOptions::default()).await.unwrap();
    let call_ids: Vec<String> = result.messages[1]
        .as_response()
        .unwrap()
        .tool_calls()
        .iter()
        .map(|call| call.tool_call_id.clone())
        .collect();
    assert!(call_ids.iter().all(|id| id.starts_with("call_") && id.len() > 5));
    assert_ne!(call_ids[0], call_ids[1]);

    let return_ids: Vec<String> = returned(&result.messages[2])
        .into_iter()
        .map(|(id, _)| id)
        .collect();
    assert_eq!(return_ids, call_ids);
}

#[tokio::test]
async fn test_builtin_parts_pass_through_untouched() {
    let model = mock();
    let parts = vec![
        ModelResponsePart::BuiltinToolCall(BuiltinToolCallPart {
            tool_name: "web_search".into(),
            args: json!({"query": "capital of France"}).into(),
            tool_call_id: "ws_1".into(),
            provider_name: Some("test".into()),
        }),
        ModelResponsePart::BuiltinToolReturn(
            serde_json::from_value::<BuiltinToolReturnPart>(json!({
                "tool_name": "web_search",
                "content": {"results": ["Paris"]},
                "tool_call_id": "ws_1",
                "provider_name": "test"
            }))
            .unwrap(),
        ),
        ModelResponsePart::text("Paris."),
    ];
    model.queue_response(ModelResponse::new(parts.clone()).with_usage(sample_usage()));
    let agent = echo_agent(model.clone());

    let result = agent.run("Capital of France?", RunOptions::default()).await.unwrap();
    assert_eq!(result.output, "Paris.");
    assert_eq!(result.messages.len(), 2);
    assert_eq!(result.messages[1].as_response().unwrap().parts, parts);
    assert_eq!(result.usage.tool_calls, 0);
    assert_eq!(model.request_count(), 1);
}

// ── Usage limits ────────────────────────────────────────────────────

fn limit_of(err: &parley::RunError) -> &parley_core::UsageLimitExceeded {
    let RunErrorKind::UsageLimitExceeded(exceeded) = &err.kind else {
        panic!("expected a usage limit error, got {:?}", err.kind);
    };
    exceeded
}

#[tokio::test]
async fn test_request_limit_stops_before_next_request() {
    let model = mock();
    model.queue_response(tool_call_response([("echo", json!({"n": 1}))]));
    model.queue_response(text_response("unused"));
    let agent = echo_agent(model.clone());

    let limits = UsageLimits {
        request_limit: Some(1),
        ..UsageLimits::default()
    };
    let err = agent
        .run("Echo", RunOptions::default().with_usage_limits(limits))
        .await
        .unwrap_err();

    assert_eq!(err.class(), ErrorClass::UsageLimitExceeded);
    assert_eq!(limit_of(&err).limit, LimitKind::Requests);
    assert!(limit_of(&err).prospective);
    assert_eq!(err.to_string(), "The next request would exceed the request_limit of 1");
    assert_eq!(model.request_count(), 1);
    assert_eq!(err.usage.requests, 1);
    assert_eq!(err.messages.len(), 3);
}

#[tokio::test]
async fn test_tool_calls_limit_blocks_the_round() {
    let model = mock();
    model.queue_response(tool_call_response([
        ("echo", json!({"n": 1})),
        ("echo", json!({"n": 2})),
    ]));
    let agent = echo_agent(model.clone());

    let limits = UsageLimits {
        tool_calls_limit: Some(1),
        ..UsageLimits::default()
    };
    let err = agent
        .run("Echo twice", RunOptions::default().with_usage_limits(limits))
        .await
        .unwrap_err();

    assert_eq!(limit_of(&err).limit, LimitKind::ToolCalls);
    assert_eq!(
        err.to_string(),
        "The next tool call(s) would exceed the tool_calls_limit of 1 (tool_calls=2)"
    );
    assert_eq!(err.usage.tool_calls, 0);
    assert_eq!(err.messages.len(), 2);
    assert_eq!(model.request_count(), 1);
}

#[tokio::test]
async fn test_token_limit_keeps_the_counted_response() {
    let model = mock();
    model.queue_response(text_response("a long answer"));
    let agent = Agent::builder(model).build();

    let limits = UsageLimits {
        output_tokens_limit: Some(10),
        ..UsageLimits::default()
    };
    let err = agent
        .run("Talk", RunOptions::default().with_usage_limits(limits))
        .await
        .unwrap_err();

    assert_eq!(limit_of(&err).limit, LimitKind::OutputTokens);
    assert!(!limit_of(&err).prospective);
    assert_eq!(err.usage.output_tokens, 50);
    assert_eq!(err.messages.len(), 2);
    let response = err.messages[1].as_response().unwrap();
    assert_eq!(response.text().as_deref(), Some("a long answer"));
    assert_eq!(response.usage.output_tokens, err.usage.output_tokens);
}

// ── Retry budgets ───────────────────────────────────────────────────

fn number_agent(model: Arc<MockModel>, output_retries: u32) -> Agent<(), i64> {
    Agent::builder(model)
        .output(OutputSpec::text_with(|text: String| {
            text.trim()
                .parse::<i64>()
                .map_err(|_| parley::ModelRetry::new("Reply with a bare integer"))
        }))
        .output_retries(output_retries)
        .build()
}

#[tokio::test]
async fn test_zero_output_retries_fails_on_first_rejection() {
    let model = mock();
    model.queue_response(text_response("forty-two"));
    let agent = number_agent(model.clone(), 0);

    let err = agent.run("Pick a number", RunOptions::default()).await.unwrap_err();
    let RunErrorKind::UnexpectedModelBehavior { message, cause, .. } = &err.kind else {
        panic!("expected an exhausted budget, got {:?}", err.kind);
    };
    assert_eq!(message, "Exceeded maximum retries (0) for output validation");
    assert!(matches!(
        cause.as_deref(),
        Some(RunErrorKind::ModelRetryRequested { message }) if message == "Reply with a bare integer"
    ));
    assert_eq!(model.request_count(), 1);
}

#[tokio::test]
async fn test_output_retries_allow_exactly_that_many_recoveries() {
    let model = mock();
    model.queue_response(text_response("one"));
    model.queue_response(text_response("two"));
    model.queue_response(text_response("3"));
    let agent = number_agent(model.clone(), 2);
    let result = agent.run("Count", RunOptions::default()).await.unwrap();
    assert_eq!(result.output, 3);
    assert_eq!(result.usage.requests, 3);

    let model = mock();
    for text in ["one", "two", "three"] {
        model.queue_response(text_response(text));
    }
    let agent = number_agent(model.clone(), 2);
    let err = agent.run("Count", RunOptions::default()).await.unwrap_err();
    assert!(err.to_string().contains("Exceeded maximum retries (2)"));
    assert_eq!(model.request_count(), 3);
    assert_eq!(err.messages.len(), 6);
}

#[tokio::test]
async fn test_accepted_output_validates_again() {
    let model = mock();
    model.queue_response(tool_call_response([("final_result", json!({"city": "Paris"}))]));
    let spec = OutputSpec::tool(OutputVariant::<Capital>::of().unwrap());
    let agent = Agent::builder(model).output(spec.clone()).build();

    let result = agent.run("Capital?", RunOptions::default()).await.unwrap();
    assert_eq!(spec.validate_value(&json!({"city": result.output.city})).unwrap(), result.output);
}

// ── Fatal conditions ────────────────────────────────────────────────

#[tokio::test]
async fn test_content_filter_is_never_retried() {
    let model = mock();
    model.queue_response(text_response("").with_finish_reason(FinishReason::ContentFilter));
    model.queue_response(text_response("unused"));
    let agent = Agent::builder(model.clone()).output_retries(5).build();

    let err = agent.run("Something unsafe", RunOptions::default()).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::UnexpectedModelBehavior);
    assert!(err.to_string().starts_with("Content filter triggered"));
    let RunErrorKind::UnexpectedModelBehavior { body, .. } = &err.kind else {
        unreachable!();
    };
    assert!(body.is_some());
    assert_eq!(model.request_count(), 1);
    assert_eq!(err.messages.len(), 2);
}

#[tokio::test]
async fn test_adapter_refusal_is_fatal() {
    let model = mock();
    model.queue_error(MockError::ContentFiltered("blocked by policy".into()));
    let agent = Agent::builder(model.clone()).build();

    let err = agent.run("Something unsafe", RunOptions::default()).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::UnexpectedModelBehavior);
    assert!(err.to_string().contains("Content filter triggered"));
    assert_eq!(model.request_count(), 1);
}

#[tokio::test]
async fn test_unknown_tool_gets_a_retry_prompt() {
    let model = mock();
    model.queue_response(tool_call_response([("get_weather", json!({"city": "Oslo"}))]));
    model.queue_response(text_response("I cannot check the weather."));
    let agent = echo_agent(model);

    let result = agent.run("Weather in Oslo?", RunOptions::default()).await.unwrap();
    assert_eq!(result.output, "I cannot check the weather.");
    let ModelRequestPart::RetryPrompt(retry) = &request_parts(&result.messages[2])[0] else {
        panic!("expected a retry prompt");
    };
    assert_eq!(retry.tool_name.as_deref(), Some("get_weather"));
    assert_eq!(retry.tool_call_id.as_deref(), Some("call_1"));
    assert!(retry.model_response().contains("Unknown tool name: 'get_weather'. Available tools: 'echo'"));
}

#[tokio::test]
async fn test_unexpected_tool_error_is_fatal() {
    let model = mock();
    model.queue_response(tool_call_response([("query", json!({}))]));
    model.queue_response(text_response("unused"));
    let agent = Agent::builder(model.clone())
        .tool(
            "query",
            "Query the database",
            object_schema(),
            |_args: Value, _ctx: &RunContext<()>| async move {
                Err::<Value, _>(ToolError::failed("connection refused"))
            },
        )
        .build();

    let err = agent.run("Query it", RunOptions::default()).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::ToolExecution);
    assert_eq!(err.to_string(), "Tool 'query' failed: connection refused");
    assert_eq!(model.request_count(), 1);
}

// ── Concurrency ─────────────────────────────────────────────────────

fn sleepy_agent(model: Arc<MockModel>, parallel: bool) -> Agent {
    Agent::builder(model)
        .tool(
            "sleep",
            "Sleep for a while",
            object_schema(),
            |args: Value, _ctx: &RunContext<()>| async move {
                let ms = args["ms"].as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok::<_, ToolError>(format!("slept {ms}ms"))
            },
        )
        .parallel_tool_calls(parallel)
        .build()
}

fn queue_sleeps(model: &MockModel) {
    model.queue_response(tool_call_response([
        ("sleep", json!({"ms": 200})),
        ("sleep", json!({"ms": 10})),
        ("sleep", json!({"ms": 100})),
    ]));
    model.queue_response(text_response("rested"));
}

fn returned(message: &ModelMessage) -> Vec<(String, Value)> {
    request_parts(message)
        .iter()
        .map(|part| match part {
            ModelRequestPart::ToolReturn(ret) => (ret.tool_call_id.clone(), ret.content.clone()),
            other => panic!("expected a tool return, got {other:?}"),
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_calls_keep_call_order() {
    let model = mock();
    queue_sleeps(&model);
    let agent = sleepy_agent(model, true);

    let started = tokio::time::Instant::now();
    let result = agent.run("Rest", RunOptions::default()).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(
        returned(&result.messages[2]),
        vec![
            ("call_1".to_owned(), json!("slept 200ms")),
            ("call_2".to_owned(), json!("slept 10ms")),
            ("call_3".to_owned(), json!("slept 100ms")),
        ]
    );
    assert!(elapsed < Duration::from_millis(300), "calls ran one by one: {elapsed:?}");
}

#[tokio::test(start_paused = true)]
async fn test_sequential_calls_run_one_by_one() {
    let model = mock();
    queue_sleeps(&model);
    let agent = sleepy_agent(model, false);

    let started = tokio::time::Instant::now();
    let result = agent.run("Rest", RunOptions::default()).await.unwrap();

    assert!(started.elapsed() >= Duration::from_millis(310));
    assert_eq!(returned(&result.messages[2]).len(), 3);
    assert_eq!(result.usage.tool_calls, 3);
}

#[tokio::test]
async fn test_cancelled_run_keeps_history() {
    let model = mock();
    model.queue_response(tool_call_response([("stop", json!({}))]));
    let agent = AgentBuilder::<CancellationToken>::new(model.clone())
        .tool(
            "stop",
            "Cancel the run",
            object_schema(),
            |_args: Value, ctx: &RunContext<CancellationToken>| {
                ctx.deps().cancel();
                async move { Ok::<_, ToolError>("stopping") }
            },
        )
        .build();

    let token = CancellationToken::new();
    let options = RunOptions::new(token.clone()).with_cancellation(token);
    let err = agent.run("Stop", options).await.unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(err.class(), ErrorClass::Cancelled);
    assert_eq!(err.messages.len(), 2);
    assert!(err.messages[1].as_response().is_some());
    assert_eq!(err.usage.requests, 1);
    assert_eq!(model.request_count(), 1);
}

#[tokio::test]
async fn test_cancelled_before_start_sends_nothing() {
    let model = mock();
    let agent = Agent::builder(model.clone()).build();
    let token = CancellationToken::new();
    token.cancel();

    let err = agent
        .run("Hi", RunOptions::default().with_cancellation(token))
        .await
        .unwrap_err();
    assert!(err.is_cancelled());
    assert!(err.messages.is_empty());
    assert_eq!(model.request_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_slow_provider_times_out() {
    let model = Arc::new(FunctionModel::new(|_messages: Vec<ModelMessage>, _info: AgentInfo| async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(ModelResponse::new(vec![ModelResponsePart::text("too late")]))
    }));
    let agent = Agent::builder(model)
        .model_settings(ModelSettings {
            timeout: Some(Duration::from_secs(2)),
            ..Default::default()
        })
        .build();

    let err = agent.run("Hi", RunOptions::default()).await.unwrap_err();
    assert!(matches!(
        err.kind,
        RunErrorKind::Model(ModelError::Timeout { elapsed_ms: 2000 })
    ));
    assert_eq!(err.class(), ErrorClass::Provider);
}

// ── Output policies ─────────────────────────────────────────────────

fn answer_variants() -> Vec<OutputVariant<Answer>> {
    vec![
        OutputVariant::<Capital>::of().unwrap().map(Answer::Capital),
        OutputVariant::<Weather>::of().unwrap().map(Answer::Weather),
    ]
}

#[tokio::test]
async fn test_native_variants_decode_through_envelope() {
    let model = Arc::new(FunctionModel::new(|_messages: Vec<ModelMessage>, info: AgentInfo| async move {
        assert_eq!(info.output_mode, OutputMode::Native);
        let schema = info.output_object.unwrap().json_schema.into_value();
        assert!(schema["properties"]["result"].is_object());
        Ok(ModelResponse::new(vec![ModelResponsePart::text(
            r#"{"result": {"kind": "Weather", "data": {"celsius": 21}}}"#,
        )]))
    }));
    let agent = Agent::builder(model)
        .output(OutputSpec::native_variants(answer_variants()))
        .build();

    let result = agent.run("Weather in Rome?", RunOptions::default()).await.unwrap();
    assert_eq!(result.output, Answer::Weather(Weather { celsius: 21 }));
}

#[tokio::test]
async fn test_prompted_output_injects_instructions() {
    let model = Arc::new(FunctionModel::new(|messages: Vec<ModelMessage>, info: AgentInfo| async move {
        assert_eq!(info.output_mode, OutputMode::Prompted);
        assert!(info.function_tools.is_empty());
        let instructions = messages[0].as_request().unwrap().instructions.clone().unwrap();
        assert!(instructions.contains("\"city\""));
        Ok(ModelResponse::new(vec![ModelResponsePart::text(
            "```json\n{\"city\": \"Canberra\"}\n```",
        )]))
    }));
    let agent = Agent::builder(model)
        .output(OutputSpec::prompted(OutputVariant::<Capital>::of().unwrap()))
        .build();

    let result = agent.run("Capital of Australia?", RunOptions::default()).await.unwrap();
    assert_eq!(result.output.city, "Canberra");
}

#[tokio::test]
async fn test_text_transform_is_applied() {
    let model = mock();
    model.queue_response(text_response("  42 "));
    let result = number_agent(model, 1).run("Answer?", RunOptions::default()).await.unwrap();
    assert_eq!(result.output, 42);
}

#[tokio::test]
async fn test_empty_response_is_empty_text() {
    let model = mock();
    model.queue_response(ModelResponse::new(Vec::new()).with_usage(sample_usage()));
    let agent = Agent::builder(model).build();

    let result = agent.run("Say nothing", RunOptions::default()).await.unwrap();
    assert_eq!(result.output, "");
    assert_eq!(result.messages.len(), 2);
}

#[tokio::test]
async fn test_empty_response_under_tool_output_is_retried() {
    let model = mock();
    model.queue_response(ModelResponse::new(Vec::new()));
    model.queue_response(tool_call_response([("final_result", json!({"city": "Lima"}))]));
    let agent = Agent::builder(model)
        .output(OutputSpec::tool(OutputVariant::<Capital>::of().unwrap()))
        .build();

    let result = agent.run("Capital of Peru?", RunOptions::default()).await.unwrap();
    assert_eq!(result.output.city, "Lima");
    let ModelRequestPart::RetryPrompt(retry) = &request_parts(&result.messages[2])[0] else {
        panic!("expected a retry prompt");
    };
    assert!(retry.tool_name.is_none());
    assert_eq!(
        retry.content,
        RetryContent::Text(
            "Plain text responses are not permitted, please include your response in a tool call"
                .into()
        )
    );
}

// ── End strategies ──────────────────────────────────────────────────

fn mixed_turn_agent(model: Arc<MockModel>, strategy: EndStrategy) -> Agent<(), Capital> {
    Agent::builder(model)
        .tool(
            "log",
            "Record a note",
            object_schema(),
            |_args: Value, _ctx: &RunContext<()>| async move { Ok::<_, ToolError>("noted") },
        )
        .output(OutputSpec::tool(OutputVariant::<Capital>::of().unwrap()))
        .end_strategy(strategy)
        .build()
}

fn queue_mixed_turn(model: &MockModel) {
    model.queue_response(tool_call_response([
        ("log", json!({})),
        ("final_result", json!({"city": "Paris"})),
        ("final_result", json!({"city": "Lyon"})),
        ("log", json!({})),
    ]));
}

fn return_texts(message: &ModelMessage) -> Vec<Value> {
    returned(message).into_iter().map(|(_, content)| content).collect()
}

#[tokio::test]
async fn test_exhaustive_strategy_runs_every_function_tool() {
    let model = mock();
    queue_mixed_turn(&model);
    let result = mixed_turn_agent(model.clone(), EndStrategy::Exhaustive)
        .run("Capital?", RunOptions::default())
        .await
        .unwrap();

    assert_eq!(result.output.city, "Paris");
    assert_eq!(result.usage.tool_calls, 2);
    assert_eq!(
        return_texts(&result.messages[2]),
        vec![
            json!("noted"),
            json!("Final result processed."),
            json!("Output tool not used - a final result was already processed."),
            json!("noted"),
        ]
    );
    assert_eq!(model.request_count(), 1);
}

#[tokio::test]
async fn test_early_strategy_skips_function_tools() {
    let model = mock();
    queue_mixed_turn(&model);
    let result = mixed_turn_agent(model, EndStrategy::Early)
        .run("Capital?", RunOptions::default())
        .await
        .unwrap();

    assert_eq!(result.output.city, "Paris");
    assert_eq!(result.usage.tool_calls, 0);
    assert_eq!(
        return_texts(&result.messages[2]),
        vec![
            json!("Tool not executed - a final result was already processed."),
            json!("Final result processed."),
            json!("Output tool not used - a final result was already processed."),
            json!("Tool not executed - a final result was already processed."),
        ]
    );
}

// ── Configuration ───────────────────────────────────────────────────

fn limited_model(profile: ModelProfile) -> Arc<MockModel> {
    Arc::new(MockModel::new(ModelMetadata {
        provider_name: Cow::Borrowed("test"),
        model_name: "limited".into(),
        profile,
    }))
}

#[tokio::test]
async fn test_native_output_needs_schema_support() {
    let model = limited_model(ModelProfile::default());
    let agent = Agent::builder(model.clone())
        .output(OutputSpec::native(OutputVariant::<Capital>::of().unwrap()))
        .build();

    let err = agent.run("Capital?", RunOptions::default()).await.unwrap_err();
    assert_eq!(err.to_string(), "Configuration error: limited does not support native structured output");
    assert_eq!(model.request_count(), 0);
}

#[tokio::test]
async fn test_native_output_with_tools_needs_support() {
    let model = limited_model(ModelProfile {
        supports_json_schema_output: true,
        ..ModelProfile::default()
    });
    let agent = Agent::builder(model.clone())
        .tools(echo_agent(model.clone()).tools().clone())
        .output(OutputSpec::native(OutputVariant::<Capital>::of().unwrap()))
        .build();

    let err = agent.run("Capital?", RunOptions::default()).await.unwrap_err();
    assert!(matches!(
        &err.kind,
        RunErrorKind::Configuration(msg)
            if msg == "limited does not support native structured output and tools at the same time"
    ));
    assert_eq!(model.request_count(), 0);
}

#[tokio::test]
async fn test_invalid_settings_fail_before_any_request() {
    let model = mock();
    let agent = Agent::builder(model.clone())
        .model_settings(ModelSettings {
            temperature: Some(7.5),
            ..Default::default()
        })
        .build();

    let err = agent.run("Hi", RunOptions::default()).await.unwrap_err();
    assert_eq!(err.class(), ErrorClass::Configuration);
    assert!(err.messages.is_empty());
    assert_eq!(model.request_count(), 0);
}
