//! Tool registry for managing function tools.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parley_core::{JsonSchema, ToolDefinition};
use serde_json::Value;

use super::{ToolError, ToolHandler, ToolOutput, tool_fn_with_ctx};
use crate::context::RunContext;

struct ToolEntry<Deps> {
    definition: ToolDefinition,
    handler: Arc<dyn ToolHandler<Deps>>,
}

impl<Deps> Clone for ToolEntry<Deps> {
    fn clone(&self) -> Self {
        Self {
            definition: self.definition.clone(),
            handler: Arc::clone(&self.handler),
        }
    }
}

/// The function tools an agent offers, in registration order.
///
/// Generic over the dependency type `Deps` handed to every handler through
/// its [`RunContext`]. Definitions are captured at registration, so the
/// order the model sees is stable across runs.
pub struct ToolRegistry<Deps = ()> {
    entries: Vec<ToolEntry<Deps>>,
    index: HashMap<String, usize>,
}

impl<Deps> Default for ToolRegistry<Deps> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<Deps> Clone for ToolRegistry<Deps> {
    /// Cheap: clones `Arc` pointers to handlers, not the handlers.
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
            index: self.index.clone(),
        }
    }
}

impl<Deps> std::fmt::Debug for ToolRegistry<Deps> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

impl<Deps: Send + Sync + 'static> ToolRegistry<Deps> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a closure as a tool.
    ///
    /// The closure receives the validated arguments and the run context.
    /// If a tool with the same name exists it is replaced in place.
    pub fn register<F, Fut, O>(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        schema: JsonSchema,
        handler: F,
    ) -> &mut Self
    where
        F: for<'c> Fn(Value, &'c RunContext<Deps>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, ToolError>> + Send + 'static,
        O: Into<ToolOutput> + Send + 'static,
    {
        let definition = ToolDefinition::new(name, description, schema);
        self.register_handler(tool_fn_with_ctx(definition, handler))
    }

    /// Registers a tool handler, replacing any with the same name.
    pub fn register_handler(&mut self, handler: impl ToolHandler<Deps> + 'static) -> &mut Self {
        self.register_shared(Arc::new(handler))
    }

    /// Registers a shared tool handler, replacing any with the same name.
    pub fn register_shared(&mut self, handler: Arc<dyn ToolHandler<Deps>>) -> &mut Self {
        let definition = handler.definition();
        let entry = ToolEntry {
            definition,
            handler,
        };
        match self.index.get(&entry.definition.name) {
            Some(&i) => self.entries[i] = entry,
            None => {
                self.index
                    .insert(entry.definition.name.clone(), self.entries.len());
                self.entries.push(entry);
            }
        }
        self
    }
}

impl<Deps> ToolRegistry<Deps> {
    /// Returns the handler for the given tool name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn ToolHandler<Deps>>> {
        self.index.get(name).map(|&i| &self.entries[i].handler)
    }

    /// Returns the definition for the given tool name.
    pub fn definition(&self, name: &str) -> Option<&ToolDefinition> {
        self.index.get(name).map(|&i| &self.entries[i].definition)
    }

    /// Returns whether a tool with the given name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Definitions of all tools, in registration order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.entries.iter().map(|e| e.definition.clone()).collect()
    }

    /// Names of all tools, in registration order.
    pub fn names(&self) -> Vec<&str> {
        self.entries
            .iter()
            .map(|e| e.definition.name.as_str())
            .collect()
    }

    /// Returns the number of registered tools.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no tools are registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The message sent back when the model calls a tool that does not
    /// exist.
    pub(crate) fn unknown_tool_message(&self, name: &str, output_tools: &[&str]) -> String {
        let available: Vec<String> = self
            .names()
            .into_iter()
            .chain(output_tools.iter().copied())
            .map(|n| format!("'{n}'"))
            .collect();
        if available.is_empty() {
            format!("Unknown tool name: '{name}'. No tools available.")
        } else {
            format!(
                "Unknown tool name: '{name}'. Available tools: {}",
                available.join(", ")
            )
        }
    }
}
