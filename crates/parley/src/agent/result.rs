//! What a finished run hands back.

use parley_core::messages::messages_to_json;
use parley_core::{ModelMessage, RunUsage};

/// The accepted output of a run plus the conversation that produced it.
#[derive(Debug, Clone)]
pub struct AgentRunResult<O> {
    /// The validated output.
    pub output: O,
    /// Full history, including any history the run continued from.
    pub messages: Vec<ModelMessage>,
    /// Usage summed over every request of this run.
    pub usage: RunUsage,
    pub(crate) new_message_index: usize,
}

impl<O> AgentRunResult<O> {
    /// The full history.
    pub fn all_messages(&self) -> &[ModelMessage] {
        &self.messages
    }

    /// Only the messages this run added.
    pub fn new_messages(&self) -> &[ModelMessage] {
        self.messages.get(self.new_message_index..).unwrap_or_default()
    }

    /// The full history as JSON, ready to be stored and resumed.
    pub fn all_messages_json(&self) -> Result<String, serde_json::Error> {
        messages_to_json(&self.messages)
    }

    /// Only this run's messages as JSON.
    pub fn new_messages_json(&self) -> Result<String, serde_json::Error> {
        messages_to_json(self.new_messages())
    }

    /// Consumes the result, keeping only the output.
    pub fn into_output(self) -> O {
        self.output
    }
}
