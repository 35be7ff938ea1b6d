use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use sandbox_tools_error::OrchestratorError;
use serde_json::{json, Value};

use crate::llm::{ChatModel, ConversationState, Message, ModelReply, ToolCall};
use crate::tools::{ToolDescriptor, ToolRegistry};

pub const SYSTEM_INSTRUCTION: &str = "You are a helpful and intelligent assistant named SmartAssistant.
You have access to multiple tools:
1. Calculator tools - for mathematical operations
2. Weather tool - for querying weather information
3. Python runner - for executing Python code in a sandbox
4. Shell runner - for executing shell commands in a sandbox
5. Browser navigator - for web browsing and data extraction
When the user asks a question:
- Analyze the request carefully
- Choose the most appropriate tool(s) to use
- Execute the tools and interpret the results
- Provide a clear and helpful response
Always be professional, accurate, and helpful.";

pub const MAX_ITERATIONS_EXCEEDED: &str = "max iterations exceeded";

enum Phase<'r> {
    AwaitingModel,
    ToolCallRequested(VecDeque<ToolCall>),
    ToolExecuting {
        call: ToolCall,
        tool: &'r ToolDescriptor,
        remaining: VecDeque<ToolCall>,
    },
    Terminal,
}

/// Drives one request through the model/tool loop.
#[derive(Debug, Clone)]
pub struct AgentInvoker {
    model: Arc<dyn ChatModel>,
    max_iterations: usize,
}

impl AgentInvoker {
    pub fn new(model: Arc<dyn ChatModel>, max_iterations: usize) -> Self {
        Self {
            model,
            max_iterations: max_iterations.max(1),
        }
    }

    /// Runs the conversation to a terminal state.
    ///
    /// Tool failures, unknown tool names and malformed arguments become
    /// error tool results that the model gets to see. Only a failure of the
    /// model itself aborts the invocation, as `Processing`.
    #[tracing::instrument(level = "debug", skip_all, fields(model = self.model.name(), tools = registry.len()))]
    pub async fn invoke(
        &self,
        registry: &ToolRegistry,
        user_message: &str,
    ) -> Result<ConversationState, OrchestratorError> {
        let specs = registry.specs();
        let mut state = ConversationState::from_messages(vec![
            Message::System {
                content: SYSTEM_INSTRUCTION.to_string(),
            },
            Message::User {
                content: user_message.to_string(),
            },
        ]);
        let mut phase = Phase::AwaitingModel;

        loop {
            phase = match phase {
                Phase::AwaitingModel => {
                    if state.iterations() >= self.max_iterations {
                        tracing::warn!(
                            iterations = state.iterations(),
                            "agent stopped at iteration limit"
                        );
                        state.push(Message::assistant_text(MAX_ITERATIONS_EXCEEDED));
                        state.mark_truncated();
                        Phase::Terminal
                    } else {
                        state.record_iteration();
                        let reply = self
                            .model
                            .complete(state.messages(), &specs)
                            .await
                            .map_err(|err| match err {
                                OrchestratorError::Processing { .. } => err,
                                other => OrchestratorError::processing(format!(
                                    "chat model failed: {other}"
                                )),
                            })?;
                        match reply {
                            ModelReply::Final(text) => {
                                state.push(Message::assistant_text(text));
                                Phase::Terminal
                            }
                            ModelReply::ToolCalls { text, calls } if calls.is_empty() => {
                                state.push(Message::Assistant {
                                    text,
                                    tool_calls: Vec::new(),
                                });
                                Phase::Terminal
                            }
                            ModelReply::ToolCalls { text, calls } => {
                                state.push(Message::Assistant {
                                    text,
                                    tool_calls: calls.clone(),
                                });
                                Phase::ToolCallRequested(calls.into())
                            }
                        }
                    }
                }
                Phase::ToolCallRequested(mut pending) => match pending.pop_front() {
                    None => Phase::AwaitingModel,
                    Some(call) => match registry.get(&call.name) {
                        Some(tool) => Phase::ToolExecuting {
                            call,
                            tool,
                            remaining: pending,
                        },
                        None => {
                            tracing::warn!(tool = %call.name, "model requested unknown tool");
                            let message = format!("unknown tool: {}", call.name);
                            state.push(error_result(&call, &message));
                            Phase::ToolCallRequested(pending)
                        }
                    },
                },
                Phase::ToolExecuting {
                    call,
                    tool,
                    remaining,
                } => {
                    state.push(execute(tool, &call).await);
                    Phase::ToolCallRequested(remaining)
                }
                Phase::Terminal => break,
            };
        }

        Ok(state)
    }
}

async fn execute(tool: &ToolDescriptor, call: &ToolCall) -> Message {
    let arguments = match parse_arguments(&call.arguments) {
        Ok(arguments) => arguments,
        Err(message) => {
            tracing::warn!(tool = %call.name, %message, "malformed tool arguments");
            return error_result(call, &message);
        }
    };

    let outcome = AssertUnwindSafe(tool.invoke(arguments)).catch_unwind().await;
    match outcome {
        Ok(Ok(output)) => {
            tracing::debug!(tool = %call.name, "tool call succeeded");
            Message::Tool {
                call_id: call.id.clone(),
                name: call.name.clone(),
                content: output,
                is_error: false,
            }
        }
        Ok(Err(err)) => {
            tracing::warn!(tool = %call.name, error = %err, "tool call failed");
            error_result(call, &tool_error_message(&err))
        }
        Err(_) => {
            tracing::error!(tool = %call.name, "tool panicked");
            error_result(call, "tool panicked")
        }
    }
}

fn parse_arguments(raw: &str) -> Result<Value, String> {
    if raw.trim().is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(raw).map_err(|err| format!("invalid tool arguments: {err}"))
}

/// The tool's own message is what the model needs; the taxonomy prefix only
/// matters for non-tool errors.
fn tool_error_message(err: &OrchestratorError) -> String {
    match err {
        OrchestratorError::ToolExecution { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

fn error_result(call: &ToolCall, message: &str) -> Message {
    Message::Tool {
        call_id: call.id.clone(),
        name: call.name.clone(),
        content: json!({ "error": message }).to_string(),
        is_error: true,
    }
}
