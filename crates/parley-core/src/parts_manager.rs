//! Assembles streamed chunks into response parts.
//!
//! Backends identify the parts of a streamed response with their own ids
//! (content-block indices, item ids…), or not at all. [`PartsManager`] maps
//! those vendor ids to stable zero-based part indices and turns each chunk
//! into the matching [`AgentStreamEvent`]:
//!
//! - the first chunk of a part becomes `PartStart` carrying that chunk;
//! - later chunks for the same part become `PartDelta`;
//! - a chunk without a vendor id extends the latest part if it has the
//!   right kind, and otherwise starts a new part.
//!
//! Indices are assigned in order of first appearance and never reused.

use std::collections::HashMap;

use tracing::warn;

use crate::events::{AgentStreamEvent, PartDelta, TextPartDelta, ThinkingPartDelta, ToolCallPartDelta};
use crate::messages::{ModelResponsePart, TextPart, ThinkingPart, ToolCallArgs, ToolCallPart};

/// Tracks the parts of one streamed response.
#[derive(Debug, Default)]
pub struct PartsManager {
    parts: Vec<ModelResponsePart>,
    vendor_ids: HashMap<String, usize>,
}

impl PartsManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles a text fragment.
    ///
    /// Returns `None` when there is nothing to report (an empty fragment).
    pub fn handle_text_delta(
        &mut self,
        part_id: Option<&str>,
        content: &str,
    ) -> Option<AgentStreamEvent> {
        if content.is_empty() {
            return None;
        }
        match self.find(part_id, |p| matches!(p, ModelResponsePart::Text(_))) {
            Some(index) => {
                let delta = PartDelta::Text(TextPartDelta {
                    content_delta: content.to_owned(),
                });
                self.apply(index, delta)
            }
            None => Some(self.start(part_id, ModelResponsePart::Text(TextPart::new(content)))),
        }
    }

    /// Handles a reasoning fragment and/or signature.
    pub fn handle_thinking_delta(
        &mut self,
        part_id: Option<&str>,
        content: Option<&str>,
        signature: Option<&str>,
    ) -> Option<AgentStreamEvent> {
        let content = content.filter(|c| !c.is_empty());
        if content.is_none() && signature.is_none() {
            return None;
        }
        match self.find(part_id, |p| matches!(p, ModelResponsePart::Thinking(_))) {
            Some(index) => {
                let delta = PartDelta::Thinking(ThinkingPartDelta {
                    content_delta: content.map(str::to_owned),
                    signature_delta: signature.map(str::to_owned),
                });
                self.apply(index, delta)
            }
            None => {
                let part = ThinkingPart {
                    content: content.unwrap_or_default().to_owned(),
                    signature: signature.map(str::to_owned),
                };
                Some(self.start(part_id, ModelResponsePart::Thinking(part)))
            }
        }
    }

    /// Handles a fragment of a function tool call.
    ///
    /// A call started without an id gets a generated one, which a later
    /// fragment carrying the backend's id replaces.
    pub fn handle_tool_call_delta(
        &mut self,
        part_id: Option<&str>,
        tool_name: Option<&str>,
        args: Option<&str>,
        tool_call_id: Option<&str>,
    ) -> Option<AgentStreamEvent> {
        let tool_name = tool_name.filter(|n| !n.is_empty());
        let args = args.filter(|a| !a.is_empty());
        match self.find(part_id, |p| matches!(p, ModelResponsePart::ToolCall(_))) {
            Some(index) => {
                if tool_name.is_none() && args.is_none() && tool_call_id.is_none() {
                    return None;
                }
                let delta = PartDelta::ToolCall(ToolCallPartDelta {
                    tool_name_delta: tool_name.map(str::to_owned),
                    args_delta: args.map(str::to_owned),
                    tool_call_id: tool_call_id.map(str::to_owned),
                });
                self.apply(index, delta)
            }
            None => {
                let part = ToolCallPart {
                    tool_name: tool_name.unwrap_or_default().to_owned(),
                    args: args.map_or_else(ToolCallArgs::default, ToolCallArgs::from),
                    tool_call_id: tool_call_id
                        .filter(|id| !id.is_empty())
                        .map_or_else(ToolCallPart::generate_id, str::to_owned),
                };
                Some(self.start(part_id, ModelResponsePart::ToolCall(part)))
            }
        }
    }

    /// Handles a complete part delivered in one chunk.
    ///
    /// Tool calls without an id get a generated `call_<uuid>` one. If `part_id` names a known part, that part is replaced and restarted
    /// at the same index.
    pub fn handle_part(&mut self, part_id: Option<&str>, mut part: ModelResponsePart) -> AgentStreamEvent {
        if let ModelResponsePart::ToolCall(call) = &mut part {
            if call.tool_call_id.is_empty() {
                call.tool_call_id = ToolCallPart::generate_id();
            }
        }
        if let Some(index) = part_id.and_then(|id| self.vendor_ids.get(id).copied()) {
            if let Some(slot) = self.parts.get_mut(index) {
                slot.clone_from(&part);
                return AgentStreamEvent::PartStart { index, part };
            }
        }
        self.start(part_id, part)
    }

    /// The parts assembled so far.
    pub fn get_parts(&self) -> &[ModelResponsePart] {
        &self.parts
    }

    /// Consumes the manager, returning the assembled parts.
    pub fn into_parts(self) -> Vec<ModelResponsePart> {
        self.parts
    }

    // ── internals ───────────────────────────────────────────────────

    fn find(
        &self,
        part_id: Option<&str>,
        is_kind: impl Fn(&ModelResponsePart) -> bool,
    ) -> Option<usize> {
        match part_id {
            Some(id) => {
                let index = *self.vendor_ids.get(id)?;
                let part = self.parts.get(index)?;
                if is_kind(part) {
                    Some(index)
                } else {
                    warn!(
                        vendor_part_id = id,
                        existing = part.kind_name(),
                        "vendor part id reused for a different part kind; starting a new part"
                    );
                    None
                }
            }
            None => {
                let last = self.parts.len().checked_sub(1)?;
                is_kind(&self.parts[last]).then_some(last)
            }
        }
    }

    fn start(&mut self, part_id: Option<&str>, part: ModelResponsePart) -> AgentStreamEvent {
        let index = self.parts.len();
        self.parts.push(part.clone());
        if let Some(id) = part_id {
            self.vendor_ids.insert(id.to_owned(), index);
        }
        AgentStreamEvent::PartStart { index, part }
    }

    fn apply(&mut self, index: usize, delta: PartDelta) -> Option<AgentStreamEvent> {
        let part = self.parts.get_mut(index)?;
        if let Err(err) = delta.apply(part) {
            warn!(index, error = %err, "dropping stream delta");
            return None;
        }
        Some(AgentStreamEvent::PartDelta { index, delta })
    }
}
