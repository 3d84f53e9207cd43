//! The run state machine.
//!
//! ```text
//!  UserPrompt ──► ModelRequest ──► (Streaming) ──► CallTools ──► End
//!                      ▲                               │
//!                      └──────── tool results ─────────┘
//!                      └──────── retry prompts ────────┘
//! ```
//!
//! Every state lives in [`Node`]. Advancing takes the node out of the run
//! and puts the successor back, so a step that fails leaves the run in
//! `Failed`. The streaming and dispatching states keep their progress in
//! the node itself: an event subscription that is dropped half-way leaves
//! them resumable, and the next [`AgentRun::next`] drains them.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parley_core::events::ToolResultPart;
use parley_core::messages::{
    FinishReason, RetryPromptPart, SystemPromptPart, ToolReturnPart, UserContent, UserPromptPart,
};
use parley_core::usage::merge;
use parley_core::{
    AgentStreamEvent, ModelError, ModelMessage, ModelMetadata, ModelRequest, ModelRequestPart,
    ModelRequestParameters, ModelResponse, ModelResponsePart, ModelSettings, OutputMode, RunUsage,
    StreamedResponse, ToolCallPart, UsageLimits,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::{EndStrategy, RunOptions};
use super::result::AgentRunResult;
use super::{AgentInner, Prompt};
use crate::context::RunContext;
use crate::error::{RunError, RunErrorKind};
use crate::output::{OutputError, OutputPlan};
use crate::tool::dispatch::ToolDispatch;

const FINAL_RESULT_PROCESSED: &str = "Final result processed.";
const OUTPUT_TOOL_NOT_USED: &str = "Output tool not used - a final result was already processed.";
const TOOL_NOT_EXECUTED: &str = "Tool not executed - a final result was already processed.";
const PLAIN_TEXT_NOT_ALLOWED: &str =
    "Plain text responses are not permitted, please include your response in a tool call";

/// Which state a run is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum NodeKind {
    /// Nothing has happened yet.
    UserPrompt,
    /// A request is ready to be sent.
    ModelRequest,
    /// A response is being streamed.
    Streaming,
    /// A response arrived and is being evaluated; its tools may be running.
    CallTools,
    /// The run produced its output.
    End,
    /// The run failed.
    Failed,
}

struct Round<Deps, O> {
    dispatch: ToolDispatch<Deps>,
    slots: Vec<Option<ModelRequestPart>>,
    output: Option<O>,
}

enum Node<Deps, O> {
    UserPrompt,
    ModelRequest(ModelRequest),
    Streaming(Box<StreamedResponse>),
    CallTools(Box<ModelResponse>),
    Dispatching(Box<Round<Deps, O>>),
    End,
    Failed,
}

impl<Deps, O> Node<Deps, O> {
    fn take(&mut self) -> Self {
        std::mem::replace(self, Self::Failed)
    }

    fn kind(&self) -> NodeKind {
        match self {
            Self::UserPrompt => NodeKind::UserPrompt,
            Self::ModelRequest(_) => NodeKind::ModelRequest,
            Self::Streaming(_) => NodeKind::Streaming,
            Self::CallTools(_) | Self::Dispatching(_) => NodeKind::CallTools,
            Self::End => NodeKind::End,
            Self::Failed => NodeKind::Failed,
        }
    }
}

pub(crate) enum Pumped {
    Event(AgentStreamEvent),
    Advanced(NodeKind),
}

/// One run of an [`Agent`](super::Agent), driven step by step.
///
/// Obtained from [`Agent::iter`](super::Agent::iter). Call
/// [`next`](Self::next) to advance one node with whole responses, or
/// [`stream_node`](Self::stream_node) to watch the current node's events
/// as they happen.
///
/// ```rust,ignore
/// let mut run = agent.iter("Hello!", RunOptions::default());
/// while run.node() != NodeKind::End {
///     let mut events = run.stream_node();
///     while let Some(event) = events.next().await {
///         println!("{:?}", event?);
///     }
/// }
/// let result = run.into_result()?;
/// ```
pub struct AgentRun<Deps, O> {
    agent: Arc<AgentInner<Deps, O>>,
    run_id: Uuid,
    metadata: ModelMetadata,
    node: Node<Deps, O>,
    messages: Vec<ModelMessage>,
    new_message_index: usize,
    usage: RunUsage,
    deps: Arc<Deps>,
    prompt: Option<UserContent>,
    prompt_text: Option<String>,
    settings: ModelSettings,
    limits: UsageLimits,
    cancel: Option<CancellationToken>,
    params: ModelRequestParameters,
    plan: OutputPlan,
    instructions: Option<String>,
    output_retries: u32,
    tool_retries: HashMap<String, u32>,
    run_step: u32,
    pending: VecDeque<AgentStreamEvent>,
    final_emitted: bool,
    output: Option<O>,
}

impl<Deps, O> std::fmt::Debug for AgentRun<Deps, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRun")
            .field("run_id", &self.run_id)
            .field("model", &self.metadata.model_name)
            .field("node", &self.node.kind())
            .field("messages", &self.messages.len())
            .field("usage", &self.usage)
            .field("output_retries", &self.output_retries)
            .finish_non_exhaustive()
    }
}

impl<Deps, O> AgentRun<Deps, O>
where
    Deps: Send + Sync + 'static,
    O: Send + 'static,
{
    pub(crate) fn new(agent: Arc<AgentInner<Deps, O>>, prompt: Prompt, options: RunOptions<Deps>) -> Self {
        let metadata = agent.model.metadata();
        let settings = match &options.model_settings {
            Some(overrides) => agent.model_settings.merge(overrides),
            None => agent.model_settings.clone(),
        };
        let limits = options
            .usage_limits
            .unwrap_or_else(|| agent.usage_limits.clone());
        let prompt_text = prompt.as_text().map(str::to_owned);
        Self {
            agent,
            run_id: Uuid::new_v4(),
            metadata,
            node: Node::UserPrompt,
            new_message_index: options.message_history.len(),
            messages: options.message_history,
            usage: RunUsage::default(),
            deps: Arc::new(options.deps),
            prompt: prompt.0,
            prompt_text,
            settings,
            limits,
            cancel: options.cancellation,
            params: ModelRequestParameters::default(),
            plan: OutputPlan::default(),
            instructions: None,
            output_retries: 0,
            tool_retries: HashMap::new(),
            run_step: 0,
            pending: VecDeque::new(),
            final_emitted: false,
            output: None,
        }
    }

    // ── Inspection ──────────────────────────────────────────────────

    /// The current state.
    pub fn node(&self) -> NodeKind {
        self.node.kind()
    }

    /// The history so far, including any history the run continued from.
    pub fn messages(&self) -> &[ModelMessage] {
        &self.messages
    }

    /// Usage so far.
    pub fn usage(&self) -> &RunUsage {
        &self.usage
    }

    /// The accepted output, once the run has ended.
    pub fn output(&self) -> Option<&O> {
        self.output.as_ref()
    }

    /// Unique id of this run, also recorded on its tracing spans.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    // ── Driving ─────────────────────────────────────────────────────

    /// Advances one node using whole responses and returns the new state.
    ///
    /// A partially consumed stream or tool round is drained first. Once
    /// the run has ended this keeps returning [`NodeKind::End`]; once it
    /// has failed it returns an error.
    #[tracing::instrument(skip_all, fields(run_id = %self.run_id, node = ?self.node.kind()))]
    pub async fn next(&mut self) -> Result<NodeKind, RunError> {
        loop {
            match self.pump(false).await {
                Ok(Pumped::Advanced(kind)) => return Ok(kind),
                Ok(Pumped::Event(_)) => {}
                Err(kind) => return Err(self.error(kind)),
            }
        }
    }

    /// Subscribes to the current node's events.
    ///
    /// The subscription ends when the node advances. While it is alive the
    /// run cannot be advanced any other way; dropping it early is fine,
    /// the rest of the node is drained by the next [`next`](Self::next).
    pub fn stream_node(&mut self) -> NodeEvents<'_, Deps, O> {
        NodeEvents {
            run: self,
            finished: false,
        }
    }

    /// Consumes a finished run.
    pub fn into_result(self) -> Result<AgentRunResult<O>, RunError> {
        match (self.node, self.output) {
            (Node::End, Some(output)) => Ok(AgentRunResult {
                output,
                messages: self.messages,
                usage: self.usage,
                new_message_index: self.new_message_index,
            }),
            (node, _) => Err(RunError::new(
                RunErrorKind::unexpected(format!(
                    "The run has not finished, it is in state {:?}",
                    node.kind()
                )),
                self.messages,
                self.usage,
            )),
        }
    }

    pub(crate) fn error(&self, kind: RunErrorKind) -> RunError {
        RunError::new(kind, self.messages.clone(), self.usage.clone())
    }

    /// Moves the run forward until it has an event to hand out or a node
    /// finishes. With `emit` unset, events are discarded and streams are
    /// drained.
    pub(crate) async fn pump(&mut self, emit: bool) -> Result<Pumped, RunErrorKind> {
        loop {
            if emit {
                if let Some(event) = self.pending.pop_front() {
                    return Ok(Pumped::Event(event));
                }
            } else {
                self.pending.clear();
            }

            match self.node.take() {
                Node::UserPrompt => {
                    let request = self.start()?;
                    self.node = Node::ModelRequest(request);
                    return Ok(Pumped::Advanced(NodeKind::ModelRequest));
                }
                Node::ModelRequest(request) => {
                    if emit {
                        let streamed = self.open_stream(request).await?;
                        self.node = Node::Streaming(Box::new(streamed));
                    } else {
                        let response = self.request(request).await?;
                        self.receive(response)?;
                        return Ok(Pumped::Advanced(NodeKind::CallTools));
                    }
                }
                Node::Streaming(mut streamed) => {
                    if let Some(event) = self.advance_stream(&mut streamed, emit).await? {
                        self.node = Node::Streaming(streamed);
                        return Ok(Pumped::Event(event));
                    }
                    self.receive(streamed.get())?;
                    return Ok(Pumped::Advanced(NodeKind::CallTools));
                }
                Node::CallTools(response) => {
                    self.call_tools(*response)?;
                    if !matches!(self.node, Node::Dispatching(_)) {
                        return Ok(Pumped::Advanced(self.node.kind()));
                    }
                }
                Node::Dispatching(mut round) => {
                    if emit {
                        match round.dispatch.next_event(self.cancel.as_ref()).await {
                            Some(Ok(event)) => {
                                self.node = Node::Dispatching(round);
                                return Ok(Pumped::Event(event));
                            }
                            Some(Err(err)) => return Err(err),
                            None => {}
                        }
                    } else {
                        round.dispatch.drain(self.cancel.as_ref()).await?;
                    }
                    self.complete_round(*round);
                    return Ok(Pumped::Advanced(self.node.kind()));
                }
                Node::End => {
                    self.node = Node::End;
                    return Ok(Pumped::Advanced(NodeKind::End));
                }
                Node::Failed => {
                    return Err(RunErrorKind::unexpected("The run has already failed"));
                }
            }
        }
    }

    // ── Start ───────────────────────────────────────────────────────

    fn start(&mut self) -> Result<ModelRequest, RunErrorKind> {
        let plan = self.agent.output.plan(&self.metadata.profile)?;
        self.check_capabilities(&plan)?;
        self.settings
            .validate()
            .map_err(RunErrorKind::from_model_error)?;

        let params = ModelRequestParameters {
            function_tools: self.agent.tools.definitions(),
            builtin_tools: self.agent.builtin_tools.clone(),
            output_mode: plan.mode,
            output_object: plan.output_object.clone(),
            output_tools: plan.output_tools.clone(),
            allow_text_output: plan.allow_text,
        };
        self.agent
            .model
            .validate_request(&self.settings, &params)
            .map_err(RunErrorKind::from_model_error)?;

        self.instructions = match (&self.agent.instructions, &plan.instructions) {
            (Some(agent), Some(output)) => Some(format!("{agent}\n\n{output}")),
            (Some(only), None) | (None, Some(only)) => Some(only.clone()),
            (None, None) => None,
        };
        self.params = params;
        self.plan = plan;

        let resumed = match self.prompt {
            None => take_trailing_request(&mut self.messages),
            Some(_) => None,
        };
        let mut request = match resumed {
            Some(request) => request,
            None => {
                let mut parts: Vec<ModelRequestPart> = Vec::new();
                if self.messages.is_empty() {
                    parts.extend(
                        self.agent
                            .system_prompts
                            .iter()
                            .map(|prompt| SystemPromptPart::new(prompt.as_str()).into()),
                    );
                }
                if let Some(content) = self.prompt.take() {
                    parts.push(UserPromptPart::new(content).into());
                }
                ModelRequest::new(parts)
            }
        };
        request.instructions.clone_from(&self.instructions);
        self.new_message_index = self.messages.len();
        debug!(
            mode = ?self.plan.mode,
            tools = self.params.function_tools.len(),
            history = self.messages.len(),
            "run started"
        );
        Ok(request)
    }

    fn check_capabilities(&self, plan: &OutputPlan) -> Result<(), RunErrorKind> {
        let profile = &self.metadata.profile;
        let model = &self.metadata.model_name;
        let has_tools = !self.agent.tools.is_empty();
        if plan.mode == OutputMode::Native {
            if !profile.supports_json_schema_output {
                return Err(RunErrorKind::Configuration(format!(
                    "{model} does not support native structured output"
                )));
            }
            if has_tools && !profile.supports_tools_with_native_output {
                return Err(RunErrorKind::Configuration(format!(
                    "{model} does not support native structured output and tools at the same time"
                )));
            }
        }
        if (has_tools || plan.mode == OutputMode::Tool) && !profile.supports_tools {
            return Err(RunErrorKind::Configuration(format!(
                "{model} does not support tools"
            )));
        }
        Ok(())
    }

    // ── Requests ────────────────────────────────────────────────────

    async fn prepare(&mut self, request: ModelRequest) -> Result<(), RunErrorKind> {
        if self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return Err(RunErrorKind::Cancelled);
        }
        self.messages.push(ModelMessage::Request(request));
        self.run_step += 1;

        if self.limits.count_tokens_before_request {
            let counted = call_model(
                self.settings.timeout,
                self.cancel.as_ref(),
                self.agent
                    .model
                    .count_tokens_boxed(&self.messages, &self.settings, &self.params),
            )
            .await?;
            self.limits
                .check_before_request(&merge(&self.usage, &counted))?;
        } else {
            self.limits.check_before_request(&self.usage)?;
        }
        debug!(step = self.run_step, messages = self.messages.len(), "sending request");
        Ok(())
    }

    async fn request(&mut self, request: ModelRequest) -> Result<ModelResponse, RunErrorKind> {
        self.prepare(request).await?;
        call_model(
            self.settings.timeout,
            self.cancel.as_ref(),
            self.agent
                .model
                .request_boxed(&self.messages, &self.settings, &self.params),
        )
        .await
    }

    async fn open_stream(&mut self, request: ModelRequest) -> Result<StreamedResponse, RunErrorKind> {
        self.prepare(request).await?;
        let chunks = call_model(
            self.settings.timeout,
            self.cancel.as_ref(),
            self.agent
                .model
                .request_stream_boxed(&self.messages, &self.settings, &self.params),
        )
        .await?;
        self.final_emitted = false;
        Ok(StreamedResponse::new(chunks)
            .with_names(&self.metadata.provider_name, &self.metadata.model_name))
    }

    async fn advance_stream(
        &mut self,
        streamed: &mut StreamedResponse,
        emit: bool,
    ) -> Result<Option<AgentStreamEvent>, RunErrorKind> {
        if !emit {
            if !streamed.is_complete() {
                warn!(
                    parts = streamed.parts().len(),
                    "event subscription dropped mid-response, draining the stream"
                );
            }
            cancellable(self.cancel.as_ref(), streamed.drain())
                .await?
                .map_err(RunErrorKind::from_model_error)?;
            return Ok(None);
        }
        match cancellable(self.cancel.as_ref(), streamed.next_event()).await? {
            None => Ok(None),
            Some(Err(err)) => Err(RunErrorKind::from_model_error(err)),
            Some(Ok(event)) => {
                self.detect_final_result(&event, streamed);
                Ok(Some(event))
            }
        }
    }

    /// Queues a `FinalResult` event the first time a streamed part could
    /// carry the output.
    fn detect_final_result(&mut self, event: &AgentStreamEvent, streamed: &StreamedResponse) {
        if self.final_emitted {
            return;
        }
        let Some(index) = event.part_index() else {
            return;
        };
        let hit = match streamed.parts().get(index) {
            Some(ModelResponsePart::Text(_)) if self.plan.allow_text => Some((None, None)),
            Some(ModelResponsePart::ToolCall(call)) if self.plan.is_output_tool(&call.tool_name) => {
                Some((Some(call.tool_name.clone()), Some(call.tool_call_id.clone())))
            }
            _ => None,
        };
        if let Some((tool_name, tool_call_id)) = hit {
            self.final_emitted = true;
            self.pending.push_back(AgentStreamEvent::FinalResult {
                tool_name,
                tool_call_id,
            });
        }
    }

    fn receive(&mut self, mut response: ModelResponse) -> Result<(), RunErrorKind> {
        for part in &mut response.parts {
            if let ModelResponsePart::ToolCall(call) = part {
                if call.tool_call_id.is_empty() {
                    call.tool_call_id = ToolCallPart::generate_id();
                }
            }
        }
        self.usage.incr(&response.usage);
        self.usage.requests += 1;
        // The response stays in the history even when a limit trips on it.
        if let Err(err) = self.limits.check(&self.usage) {
            self.messages.push(ModelMessage::Response(response));
            return Err(err.into());
        }

        if response.finish_reason == Some(FinishReason::ContentFilter) {
            let reason = response
                .provider_details
                .as_ref()
                .and_then(|details| details.get("finish_reason"))
                .and_then(serde_json::Value::as_str)
                .unwrap_or("content_filter")
                .to_owned();
            let body = serde_json::to_string(&response).ok();
            self.messages.push(ModelMessage::Response(response));
            return Err(RunErrorKind::UnexpectedModelBehavior {
                message: format!("Content filter triggered. Finish reason: '{reason}'"),
                body,
                cause: None,
            });
        }

        debug!(
            parts = response.parts.len(),
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "response received"
        );
        self.messages.push(ModelMessage::Response(response.clone()));
        self.node = Node::CallTools(Box::new(response));
        Ok(())
    }

    // ── Evaluating a response ───────────────────────────────────────

    fn call_tools(&mut self, response: ModelResponse) -> Result<(), RunErrorKind> {
        let calls: Vec<ToolCallPart> = response.tool_calls().into_iter().cloned().collect();
        if calls.is_empty() {
            return self.handle_text(&response);
        }

        let mut slots: Vec<Option<ModelRequestPart>> = vec![None; calls.len()];
        let mut output: Option<O> = None;
        let mut function_calls = Vec::new();
        let mut unknown_calls = Vec::new();

        for (slot, call) in calls.into_iter().enumerate() {
            if self.plan.is_output_tool(&call.tool_name) {
                if output.is_some() {
                    slots[slot] = Some(tool_return(call, OUTPUT_TOOL_NOT_USED));
                    continue;
                }
                let accepted = self
                    .agent
                    .output
                    .parse_tool_call(&self.plan, &call.tool_name, &call.args)
                    .and_then(|value| self.validate_output(value, Some(&call)));
                match accepted {
                    Ok(value) => {
                        output = Some(value);
                        slots[slot] = Some(tool_return(call, FINAL_RESULT_PROCESSED));
                    }
                    Err(err) => {
                        let retry = RetryPromptPart::for_tool(
                            err.retry_content(),
                            call.tool_name,
                            call.tool_call_id,
                        );
                        self.charge_output_retry(err)?;
                        slots[slot] = Some(retry.into());
                    }
                }
            } else if self.agent.tools.contains(&call.tool_name) {
                function_calls.push((slot, call));
            } else {
                unknown_calls.push((slot, call));
            }
        }

        let mut dispatch = ToolDispatch::new(
            self.agent.config.parallel_tool_calls,
            std::mem::take(&mut self.tool_retries),
        );
        if output.is_some() && self.agent.config.end_strategy == EndStrategy::Early {
            for (slot, call) in function_calls.into_iter().chain(unknown_calls) {
                slots[slot] = Some(tool_return(call, TOOL_NOT_EXECUTED));
            }
        } else {
            if !function_calls.is_empty() {
                let projected = RunUsage {
                    tool_calls: self.usage.tool_calls + function_calls.len() as u64,
                    ..self.usage.clone()
                };
                self.limits.check_before_tool_call(&projected)?;
            }
            let ctx = self.run_context();
            for (slot, call) in function_calls {
                dispatch.push_call(slot, call, &self.agent.tools, &ctx, self.agent.config.retries)?;
            }
            for (slot, call) in unknown_calls {
                let message = self
                    .agent
                    .tools
                    .unknown_tool_message(&call.tool_name, &self.plan.output_tool_names());
                self.charge_output_retry(OutputError::message(message.clone()))?;
                dispatch.push_unknown(slot, call, message);
            }
        }

        debug!(
            calls = dispatch.len(),
            has_output = output.is_some(),
            "dispatching tool calls"
        );
        let round = Round {
            dispatch,
            slots,
            output,
        };
        if round.dispatch.is_done() {
            self.complete_round(round);
        } else {
            self.node = Node::Dispatching(Box::new(round));
        }
        Ok(())
    }

    fn handle_text(&mut self, response: &ModelResponse) -> Result<(), RunErrorKind> {
        // A response with no text parts counts as empty text.
        let text = response.text().unwrap_or_default();
        if !self.plan.allow_text {
            self.charge_output_retry(OutputError::message(PLAIN_TEXT_NOT_ALLOWED))?;
            self.next_request(vec![RetryPromptPart::new(PLAIN_TEXT_NOT_ALLOWED).into()]);
            return Ok(());
        }
        let accepted = self
            .agent
            .output
            .parse_text(&self.plan, text)
            .and_then(|value| self.validate_output(value, None));
        match accepted {
            Ok(output) => self.finish(output),
            Err(err) => {
                let retry = RetryPromptPart::new(err.retry_content());
                self.charge_output_retry(err)?;
                self.next_request(vec![retry.into()]);
            }
        }
        Ok(())
    }

    fn validate_output(&self, mut output: O, call: Option<&ToolCallPart>) -> Result<O, OutputError> {
        if self.agent.validators.is_empty() {
            return Ok(output);
        }
        let mut ctx = self.run_context();
        if let Some(call) = call {
            ctx.tool_name = Some(call.tool_name.clone());
            ctx.tool_call_id = Some(call.tool_call_id.clone());
        }
        for validator in &self.agent.validators {
            output = validator(output, &ctx)?;
        }
        Ok(output)
    }

    fn charge_output_retry(&mut self, err: OutputError) -> Result<(), RunErrorKind> {
        self.output_retries += 1;
        let max = self.agent.config.max_result_retries();
        if self.output_retries > max {
            return Err(RunErrorKind::UnexpectedModelBehavior {
                message: format!("Exceeded maximum retries ({max}) for output validation"),
                body: None,
                cause: Some(Box::new(err.into_cause())),
            });
        }
        warn!(
            retry = self.output_retries,
            max_retries = max,
            error = %err,
            "output rejected, asking the model to try again"
        );
        Ok(())
    }

    fn complete_round(&mut self, round: Round<Deps, O>) {
        let Round {
            dispatch,
            mut slots,
            output,
        } = round;
        let finished = dispatch.finish();
        self.tool_retries = finished.retries;
        self.usage.tool_calls += finished.succeeded;
        for (slot, result) in finished.results {
            if let Some(entry) = slots.get_mut(slot) {
                *entry = Some(ModelRequestPart::from(result));
            }
        }
        let parts: Vec<ModelRequestPart> = slots.into_iter().flatten().collect();
        match output {
            Some(output) => {
                self.messages.push(ModelMessage::Request(ModelRequest::new(parts)));
                self.finish(output);
            }
            None => self.next_request(parts),
        }
    }

    fn next_request(&mut self, parts: Vec<ModelRequestPart>) {
        let mut request = ModelRequest::new(parts);
        request.instructions.clone_from(&self.instructions);
        self.node = Node::ModelRequest(request);
    }

    fn finish(&mut self, output: O) {
        info!(
            run_id = %self.run_id,
            requests = self.usage.requests,
            tool_calls = self.usage.tool_calls,
            total_tokens = self.usage.total_tokens(),
            "run completed"
        );
        self.output = Some(output);
        self.node = Node::End;
    }

    fn run_context(&self) -> RunContext<Deps> {
        RunContext {
            deps: Arc::clone(&self.deps),
            usage: self.usage.clone(),
            model_name: self.metadata.model_name.clone(),
            prompt: self.prompt_text.clone(),
            retry: self.output_retries,
            max_retries: self.agent.config.max_result_retries(),
            tool_name: None,
            tool_call_id: None,
            run_step: self.run_step,
        }
    }
}

// ── Node events ─────────────────────────────────────────────────────

/// A subscription to the events of a run's current node.
///
/// Borrowing the run mutably guarantees a single consumer and keeps the
/// run from advancing behind the subscriber's back.
pub struct NodeEvents<'a, Deps, O> {
    run: &'a mut AgentRun<Deps, O>,
    finished: bool,
}

impl<Deps, O> std::fmt::Debug for NodeEvents<'_, Deps, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeEvents")
            .field("node", &self.run.node.kind())
            .field("finished", &self.finished)
            .finish()
    }
}

impl<Deps, O> NodeEvents<'_, Deps, O>
where
    Deps: Send + Sync + 'static,
    O: Send + 'static,
{
    /// The next event, or `None` once the node has advanced.
    ///
    /// An error ends the subscription and leaves the run failed.
    pub async fn next(&mut self) -> Option<Result<AgentStreamEvent, RunError>> {
        if self.finished {
            return None;
        }
        match self.run.pump(true).await {
            Ok(Pumped::Event(event)) => Some(Ok(event)),
            Ok(Pumped::Advanced(_)) => {
                self.finished = true;
                None
            }
            Err(kind) => {
                self.finished = true;
                Some(Err(self.run.error(kind)))
            }
        }
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn tool_return(call: ToolCallPart, content: &str) -> ModelRequestPart {
    ToolResultPart::ToolReturn(ToolReturnPart::new(call.tool_name, content, call.tool_call_id)).into()
}

/// Pops the history's last message when it is a request, so a run without
/// a new prompt sends it again.
fn take_trailing_request(messages: &mut Vec<ModelMessage>) -> Option<ModelRequest> {
    if !matches!(messages.last(), Some(ModelMessage::Request(_))) {
        return None;
    }
    match messages.pop() {
        Some(ModelMessage::Request(request)) => Some(request),
        _ => None,
    }
}

async fn cancellable<T>(
    cancel: Option<&CancellationToken>,
    fut: impl Future<Output = T>,
) -> Result<T, RunErrorKind> {
    match cancel {
        Some(token) => tokio::select! {
            biased;
            () = token.cancelled() => Err(RunErrorKind::Cancelled),
            value = fut => Ok(value),
        },
        None => Ok(fut.await),
    }
}

/// Awaits one provider call under the per-call timeout and the run's
/// cancellation token.
async fn call_model<T>(
    timeout: Option<Duration>,
    cancel: Option<&CancellationToken>,
    fut: impl Future<Output = Result<T, ModelError>>,
) -> Result<T, RunErrorKind> {
    let timed = async {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .unwrap_or_else(|_| {
                    Err(ModelError::Timeout {
                        elapsed_ms: u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                    })
                }),
            None => fut.await,
        }
    };
    cancellable(cancel, timed)
        .await?
        .map_err(RunErrorKind::from_model_error)
}
