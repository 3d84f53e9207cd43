//! Whole-run event streams.

use futures::Stream;
use parley_core::AgentStreamEvent;

use super::AgentRunResult;
use super::graph::{AgentRun, NodeKind, Pumped};
use crate::error::RunError;

/// One item of [`Agent::run_stream_events`](super::Agent::run_stream_events).
#[derive(Debug)]
pub enum RunEvent<O> {
    /// Something happened inside the current node.
    Event(AgentStreamEvent),
    /// The run finished; always the last item of a successful stream.
    Done(AgentRunResult<O>),
}

impl<O> RunEvent<O> {
    /// The wrapped event, if this is not the final item.
    pub fn as_event(&self) -> Option<&AgentStreamEvent> {
        match self {
            Self::Event(event) => Some(event),
            Self::Done(_) => None,
        }
    }
}

/// Drives `run` to completion, yielding every event.
///
/// The stream owns the run. It ends after `Done` or after the first error;
/// dropping it drops the in-flight provider stream with it.
pub(crate) fn into_event_stream<Deps, O>(
    run: AgentRun<Deps, O>,
) -> impl Stream<Item = Result<RunEvent<O>, RunError>> + Send + 'static
where
    Deps: Send + Sync + 'static,
    O: Send + 'static,
{
    futures::stream::unfold(Some(run), |state| async move {
        let mut run = state?;
        loop {
            match run.pump(true).await {
                Ok(Pumped::Event(event)) => return Some((Ok(RunEvent::Event(event)), Some(run))),
                Ok(Pumped::Advanced(NodeKind::End)) => {
                    return Some((run.into_result().map(RunEvent::Done), None));
                }
                Ok(Pumped::Advanced(_)) => {}
                Err(kind) => return Some((Err(run.error(kind)), None)),
            }
        }
    })
}
