//! Tool-call dispatch.
//!
//! Each call runs in its own tokio task; the response goes back through the
//! same sink the audio uses. Completion order is whatever the handlers take.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::task::{AbortHandle, JoinHandle};

use super::tool::ToolHandler;
use crate::error::ToolError;
use crate::protocol::{FunctionDeclaration, FunctionResponse, ToolCall};

/// Where finished tool responses go. Returns `false` when the response was
/// discarded (session no longer open).
pub trait ResponseSink: Send + Sync {
    fn send_tool_response(&self, response: FunctionResponse) -> bool;
}

pub struct ToolCallDispatcher {
    tools: HashMap<String, Arc<dyn ToolHandler>>,
    in_flight: Arc<Mutex<HashMap<String, (u64, AbortHandle)>>>,
    seq: AtomicU64,
}

impl ToolCallDispatcher {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            seq: AtomicU64::new(0),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn ToolHandler>) {
        log::info!("Registered tool: {}", tool.name());
        self.tools.insert(tool.name().to_string(), tool);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Registered tools as function declarations, sorted by name.
    pub fn declarations(&self) -> Vec<FunctionDeclaration> {
        let mut decls: Vec<_> = self.tools.values().map(|t| t.declaration()).collect();
        decls.sort_by(|a, b| a.name.cmp(&b.name));
        decls
    }

    pub fn progress_note(&self, name: &str) -> Option<String> {
        self.tools
            .get(name)
            .and_then(|t| t.progress_note().map(str::to_string))
    }

    /// Run `call` in the background and answer through `sink`.
    ///
    /// Unknown tools and handler errors are answered with an error response.
    pub fn dispatch(&self, call: ToolCall, sink: Arc<dyn ResponseSink>) -> JoinHandle<()> {
        log::info!("Tool call {} -> {} {}", call.id, call.name, call.args);
        let handler = self.tools.get(&call.name).cloned();
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let in_flight = self.in_flight.clone();
        let id = call.id.clone();

        // Hold the table while spawning so the task cannot finish before it is tracked
        let mut table = match self.in_flight.lock() {
            Ok(t) => t,
            Err(poisoned) => poisoned.into_inner(),
        };

        let handle = tokio::spawn(async move {
            let result = match handler {
                Some(h) => h.call(call.args).await,
                None => Err(ToolError::UnknownTool(call.name.clone())),
            };

            let response = match result {
                Ok(value) => {
                    log::info!("Tool {} ({}) completed", call.name, call.id);
                    FunctionResponse::result(&call.id, &call.name, value)
                }
                Err(e) => {
                    log::warn!("Tool {} ({}) failed: {}", call.name, call.id, e);
                    FunctionResponse::error(&call.id, &call.name, e.to_string())
                }
            };

            if let Ok(mut table) = in_flight.lock() {
                if table.get(&call.id).is_some_and(|(s, _)| *s == seq) {
                    table.remove(&call.id);
                }
            }

            if !sink.send_tool_response(response) {
                log::debug!("Response for tool call {} discarded", call.id);
            }
        });

        table.insert(id, (seq, handle.abort_handle()));
        handle
    }

    /// Abort in-flight calls by id. Their responses are never sent.
    pub fn cancel(&self, ids: &[String]) -> usize {
        let Ok(mut table) = self.in_flight.lock() else {
            return 0;
        };
        let mut cancelled = 0;
        for id in ids {
            if let Some((_, handle)) = table.remove(id) {
                handle.abort();
                cancelled += 1;
                log::info!("Tool call {} cancelled", id);
            }
        }
        cancelled
    }

    pub fn cancel_all(&self) {
        if let Ok(mut table) = self.in_flight.lock() {
            for (_, (_, handle)) in table.drain() {
                handle.abort();
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().map(|t| t.len()).unwrap_or(0)
    }
}

impl Default for ToolCallDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
