//! Execution of one response's function tool calls.
//!
//! [`ToolDispatch`] is a small pull-driven state machine: every call to
//! [`next_event`](ToolDispatch::next_event) either hands back a buffered
//! event or advances execution by one step. The engine drains it for
//! whole-response runs and forwards its events when streaming. Its state
//! lives in the run, so a dispatch interrupted by a dropped subscription
//! resumes where it stopped.
//!
//! Concurrent mode announces every call in call order, spawns them all on
//! the tokio runtime once the announcements have been handed out, then
//! settles them in call order.
//! Sequential mode announces, runs and settles one call at a time.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parley_core::events::ToolResultPart;
use parley_core::messages::{ErrorDetails, RetryContent, RetryPromptPart, ToolReturnPart};
use parley_core::provider::SchemaError;
use parley_core::{AgentStreamEvent, ToolCallPart};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{ToolError, ToolHandler, ToolOutput, ToolRegistry};
use crate::context::RunContext;
use crate::error::RunErrorKind;

enum Planned<Deps> {
    Ready {
        handler: Arc<dyn ToolHandler<Deps>>,
        args: Value,
        ctx: RunContext<Deps>,
    },
    Running(JoinHandle<Result<ToolOutput, ToolError>>),
    Invalid(Vec<ErrorDetails>),
    Unknown(String),
}

enum Outcome {
    Output(Result<ToolOutput, ToolError>),
    Invalid(Vec<ErrorDetails>),
    Unknown(String),
}

struct ScheduledCall<Deps> {
    slot: usize,
    part: ToolCallPart,
    max_retries: u32,
    planned: Planned<Deps>,
    announced: bool,
}

impl<Deps: Send + Sync + 'static> ScheduledCall<Deps> {
    fn start(&mut self) {
        let planned = std::mem::replace(&mut self.planned, Planned::Unknown(String::new()));
        self.planned = match planned {
            Planned::Ready { handler, args, ctx } => {
                debug!(
                    tool = %self.part.tool_name,
                    tool_call_id = %self.part.tool_call_id,
                    "spawning tool call"
                );
                Planned::Running(tokio::spawn(async move { handler.execute(args, &ctx).await }))
            }
            other => other,
        };
    }

    async fn wait(&mut self, cancel: Option<&CancellationToken>) -> Result<Outcome, RunErrorKind> {
        self.start();
        let handle = match &mut self.planned {
            Planned::Running(handle) => handle,
            Planned::Invalid(errors) => return Ok(Outcome::Invalid(std::mem::take(errors))),
            Planned::Unknown(message) => return Ok(Outcome::Unknown(std::mem::take(message))),
            Planned::Ready { .. } => {
                return Err(RunErrorKind::unexpected("tool call was never started"));
            }
        };
        let joined = match cancel {
            Some(token) => tokio::select! {
                biased;
                () = token.cancelled() => return Err(RunErrorKind::Cancelled),
                joined = handle => joined,
            },
            None => handle.await,
        };
        joined
            .map(Outcome::Output)
            .map_err(|err| RunErrorKind::ToolExecution {
                tool_name: self.part.tool_name.clone(),
                source: Box::new(err),
            })
    }
}

/// What a finished dispatch hands back to the run.
pub(crate) struct DispatchResult {
    /// Result parts keyed by their slot in the response's tool calls.
    pub results: Vec<(usize, ToolResultPart)>,
    /// Per-tool retry counters after this round.
    pub retries: HashMap<String, u32>,
    /// Calls that returned successfully.
    pub succeeded: u64,
}

/// Runs one response's function tool calls.
pub(crate) struct ToolDispatch<Deps> {
    queue: VecDeque<ScheduledCall<Deps>>,
    parallel: bool,
    started: bool,
    spawned: bool,
    events: VecDeque<AgentStreamEvent>,
    results: Vec<(usize, ToolResultPart)>,
    retries: HashMap<String, u32>,
    succeeded: u64,
}

impl<Deps: Send + Sync + 'static> ToolDispatch<Deps> {
    /// Creates an empty dispatch seeded with the run's retry counters.
    pub(crate) fn new(parallel: bool, retries: HashMap<String, u32>) -> Self {
        Self {
            queue: VecDeque::new(),
            parallel,
            started: false,
            spawned: false,
            events: VecDeque::new(),
            results: Vec::new(),
            retries,
            succeeded: 0,
        }
    }

    /// Number of calls scheduled.
    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    /// Schedules a call to a registered tool, validating its arguments.
    ///
    /// Arguments that are not valid JSON or do not match the tool's schema
    /// are settled as a retry without running the tool. A tool whose own
    /// schema is malformed is a configuration error.
    pub(crate) fn push_call(
        &mut self,
        slot: usize,
        part: ToolCallPart,
        registry: &ToolRegistry<Deps>,
        ctx: &RunContext<Deps>,
        default_max_retries: u32,
    ) -> Result<(), RunErrorKind> {
        let (Some(handler), Some(definition)) = (
            registry.get(&part.tool_name),
            registry.definition(&part.tool_name),
        ) else {
            let message = registry.unknown_tool_message(&part.tool_name, &[]);
            self.push_unknown(slot, part, message);
            return Ok(());
        };
        let max_retries = handler.max_retries().unwrap_or(default_max_retries);
        let retry = self.retries.get(&part.tool_name).copied().unwrap_or(0);

        let planned = match part.args.as_value() {
            Err(err) => Planned::Invalid(vec![ErrorDetails {
                path: String::new(),
                message: format!("Invalid JSON: {err}"),
            }]),
            Ok(args) => match definition.parameters.validate(&args) {
                Ok(()) => Planned::Ready {
                    handler: Arc::clone(handler),
                    args,
                    ctx: ctx.for_tool(&part.tool_name, &part.tool_call_id, retry, max_retries),
                },
                Err(SchemaError::Violations(errors)) => Planned::Invalid(errors),
                Err(err) => {
                    return Err(RunErrorKind::Configuration(format!(
                        "tool '{}' has an invalid parameter schema: {err}",
                        part.tool_name
                    )));
                }
            },
        };
        self.queue.push_back(ScheduledCall {
            slot,
            part,
            max_retries,
            planned,
            announced: false,
        });
        Ok(())
    }

    /// Schedules a call to a tool that does not exist.
    pub(crate) fn push_unknown(&mut self, slot: usize, part: ToolCallPart, message: String) {
        self.queue.push_back(ScheduledCall {
            slot,
            part,
            max_retries: 0,
            planned: Planned::Unknown(message),
            announced: false,
        });
    }

    /// Returns `true` once every call has been settled and its events
    /// handed out.
    pub(crate) fn is_done(&self) -> bool {
        self.queue.is_empty() && self.events.is_empty()
    }

    /// Advances the dispatch by one event.
    ///
    /// Returns `None` when every call has settled. An error is fatal for
    /// the run; calls still in flight are detached, not aborted.
    pub(crate) async fn next_event(
        &mut self,
        cancel: Option<&CancellationToken>,
    ) -> Option<Result<AgentStreamEvent, RunErrorKind>> {
        if let Some(event) = self.events.pop_front() {
            return Some(Ok(event));
        }
        if !self.started {
            self.started = true;
            if self.parallel {
                for call in &mut self.queue {
                    call.announced = true;
                    self.events.push_back(AgentStreamEvent::FunctionToolCall {
                        part: call.part.clone(),
                    });
                }
                if let Some(event) = self.events.pop_front() {
                    return Some(Ok(event));
                }
            }
        }
        if self.parallel && !self.spawned {
            self.spawned = true;
            for call in &mut self.queue {
                call.start();
            }
        }

        let call = self.queue.front_mut()?;
        if !call.announced {
            call.announced = true;
            return Some(Ok(AgentStreamEvent::FunctionToolCall {
                part: call.part.clone(),
            }));
        }
        let outcome = match call.wait(cancel).await {
            Ok(outcome) => outcome,
            Err(err) => return Some(Err(err)),
        };
        let call = self.queue.pop_front()?;
        let slot = call.slot;
        match self.settle(call, outcome) {
            Ok(result) => {
                self.results.push((slot, result.clone()));
                Some(Ok(AgentStreamEvent::FunctionToolResult { result }))
            }
            Err(err) => Some(Err(err)),
        }
    }

    /// Runs every remaining call, discarding events.
    pub(crate) async fn drain(
        &mut self,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), RunErrorKind> {
        while let Some(event) = self.next_event(cancel).await {
            event?;
        }
        Ok(())
    }

    /// Consumes the finished dispatch.
    pub(crate) fn finish(self) -> DispatchResult {
        DispatchResult {
            results: self.results,
            retries: self.retries,
            succeeded: self.succeeded,
        }
    }

    fn settle(
        &mut self,
        call: ScheduledCall<Deps>,
        outcome: Outcome,
    ) -> Result<ToolResultPart, RunErrorKind> {
        let ToolCallPart {
            tool_name,
            tool_call_id,
            ..
        } = call.part;
        match outcome {
            Outcome::Output(Ok(output)) => {
                self.retries.remove(&tool_name);
                self.succeeded += 1;
                Ok(ToolResultPart::ToolReturn(ToolReturnPart::new(
                    tool_name,
                    output.content,
                    tool_call_id,
                )))
            }
            Outcome::Output(Err(ToolError::Retry(retry))) => {
                let cause = RunErrorKind::ModelRetryRequested {
                    message: retry.message.clone(),
                };
                self.retry(
                    tool_name,
                    tool_call_id,
                    RetryContent::Text(retry.message),
                    call.max_retries,
                    cause,
                )
            }
            Outcome::Output(Err(ToolError::Failed(source))) => {
                Err(RunErrorKind::ToolExecution { tool_name, source })
            }
            Outcome::Invalid(errors) => {
                let cause = RunErrorKind::ValidationFailure {
                    message: RetryPromptPart::new(errors.clone()).model_response(),
                };
                self.retry(
                    tool_name,
                    tool_call_id,
                    RetryContent::Errors(errors),
                    call.max_retries,
                    cause,
                )
            }
            Outcome::Unknown(message) => Ok(ToolResultPart::RetryPrompt(
                RetryPromptPart::for_tool(message, tool_name, tool_call_id),
            )),
        }
    }

    fn retry(
        &mut self,
        tool_name: String,
        tool_call_id: String,
        content: RetryContent,
        max_retries: u32,
        cause: RunErrorKind,
    ) -> Result<ToolResultPart, RunErrorKind> {
        let count = self.retries.entry(tool_name.clone()).or_insert(0);
        *count += 1;
        if *count > max_retries {
            return Err(RunErrorKind::UnexpectedModelBehavior {
                message: format!("Tool '{tool_name}' exceeded max retries count of {max_retries}"),
                body: None,
                cause: Some(Box::new(cause)),
            });
        }
        warn!(tool = %tool_name, retry = *count, max_retries, "tool call will be retried");
        Ok(ToolResultPart::RetryPrompt(RetryPromptPart::for_tool(
            content,
            tool_name,
            tool_call_id,
        )))
    }
}
