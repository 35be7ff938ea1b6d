//! OpenAI-compatible chat-completions client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use sandbox_tools_error::OrchestratorError;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{ChatModel, Message, ModelReply, ToolCall, ToolSpec};
use crate::config::ModelSettings;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct OpenAiChatModel {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl OpenAiChatModel {
    pub fn new(settings: &ModelSettings) -> Result<Self, OrchestratorError> {
        let api_key = settings.require_api_key()?.to_string();
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| OrchestratorError::Initialization {
                message: format!("failed to build model HTTP client: {err}"),
            })?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", settings.base_url.trim_end_matches('/')),
            api_key,
            model: settings.name.clone(),
        })
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
    ) -> Result<ModelReply, OrchestratorError> {
        let body = request_body(&self.model, messages, tools);
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| {
                let reason = if err.is_timeout() { "timed out" } else { "failed" };
                OrchestratorError::processing(format!("chat model request {reason}: {err}"))
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(OrchestratorError::processing(format!(
                "chat model returned {status}: {detail}"
            )));
        }

        let completion: Completion = response
            .json()
            .await
            .map_err(|err| OrchestratorError::processing(format!("invalid chat model response: {err}")))?;
        parse_reply(completion)
    }
}

fn request_body(model: &str, messages: &[Message], tools: &[ToolSpec]) -> Value {
    let messages: Vec<Value> = messages.iter().map(wire_message).collect();
    let mut body = json!({
        "model": model,
        "messages": messages,
    });
    if !tools.is_empty() {
        body["tools"] = tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    }
                })
            })
            .collect();
    }
    body
}

fn wire_message(message: &Message) -> Value {
    match message {
        Message::System { content } => json!({ "role": "system", "content": content }),
        Message::User { content } => json!({ "role": "user", "content": content }),
        Message::Assistant { text, tool_calls } => {
            let mut value = json!({ "role": "assistant", "content": text });
            if !tool_calls.is_empty() {
                value["tool_calls"] = tool_calls
                    .iter()
                    .map(|call| {
                        json!({
                            "id": call.id,
                            "type": "function",
                            "function": { "name": call.name, "arguments": call.arguments },
                        })
                    })
                    .collect();
            }
            value
        }
        Message::Tool {
            call_id, content, ..
        } => json!({ "role": "tool", "tool_call_id": call_id, "content": content }),
    }
}

#[derive(Debug, Deserialize)]
struct Completion {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

fn parse_reply(completion: Completion) -> Result<ModelReply, OrchestratorError> {
    let message = completion
        .choices
        .into_iter()
        .next()
        .map(|choice| choice.message)
        .ok_or_else(|| OrchestratorError::processing("chat model returned no choices"))?;

    let text = message.content.filter(|text| !text.trim().is_empty());
    let calls = message.tool_calls.unwrap_or_default();
    if calls.is_empty() {
        return Ok(ModelReply::Final(text.unwrap_or_default()));
    }
    Ok(ModelReply::ToolCalls {
        text,
        calls: calls
            .into_iter()
            .map(|call| ToolCall {
                id: call.id,
                name: call.function.name,
                arguments: call.function.arguments,
            })
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_carries_tool_history() {
        let messages = vec![
            Message::User {
                content: "add 2 and 3".to_string(),
            },
            Message::Assistant {
                text: None,
                tool_calls: vec![ToolCall {
                    id: "call_1".to_string(),
                    name: "add".to_string(),
                    arguments: "{\"a\":2,\"b\":3}".to_string(),
                }],
            },
            Message::Tool {
                call_id: "call_1".to_string(),
                name: "add".to_string(),
                content: "5.0".to_string(),
                is_error: false,
            },
        ];
        let tools = vec![ToolSpec {
            name: "add".to_string(),
            description: "Add two numbers".to_string(),
            parameters: json!({ "type": "object" }),
        }];
        let body = request_body("qwen-max", &messages, &tools);
        assert_eq!(body["model"], "qwen-max");
        assert_eq!(body["messages"][1]["content"], Value::Null);
        assert_eq!(body["messages"][1]["tool_calls"][0]["function"]["name"], "add");
        assert_eq!(body["messages"][2]["tool_call_id"], "call_1");
        assert_eq!(body["tools"][0]["function"]["description"], "Add two numbers");
    }

    #[test]
    fn tools_are_omitted_when_empty() {
        let body = request_body("m", &[], &[]);
        assert!(body.get("tools").is_none());
    }

    #[test]
    fn parses_tool_calls_and_final_answers() {
        let completion: Completion = serde_json::from_value(json!({
            "choices": [{
                "message": {
                    "content": "",
                    "tool_calls": [{
                        "id": "call_9",
                        "type": "function",
                        "function": { "name": "divide", "arguments": "{\"a\":8,\"b\":2}" }
                    }]
                }
            }]
        }))
        .expect("completion");
        match parse_reply(completion).expect("reply") {
            ModelReply::ToolCalls { text, calls } => {
                assert!(text.is_none());
                assert_eq!(calls[0].name, "divide");
            }
            other => panic!("unexpected reply {other:?}"),
        }

        let completion: Completion =
            serde_json::from_value(json!({ "choices": [{ "message": { "content": "42" } }] }))
                .expect("completion");
        assert_eq!(parse_reply(completion).expect("reply"), ModelReply::Final("42".to_string()));
    }

    #[test]
    fn empty_choices_is_a_processing_error() {
        let err = parse_reply(Completion { choices: Vec::new() }).expect_err("no choices");
        assert!(matches!(err, OrchestratorError::Processing { .. }));
    }
}
