//! Deterministic chat model for offline mode and tests.
//!
//! In intent mode it recognises a handful of phrasings ("add 2 and 3",
//! "weather in Paris", "run: ls") and answers with one tool call, then turns
//! the tool result into a final sentence. In replay mode it returns a fixed
//! list of replies in order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use sandbox_tools_error::OrchestratorError;
use serde_json::{json, Value};

use super::{ChatModel, Message, ModelReply, ToolCall, ToolSpec};

const CALCULATOR_TOOLS: [&str; 4] = ["add", "subtract", "multiply", "divide"];

#[derive(Debug)]
enum Mode {
    Intents,
    Replay(Mutex<VecDeque<ModelReply>>),
}

#[derive(Debug)]
pub struct ScriptedChatModel {
    mode: Mode,
    turns: AtomicUsize,
}

impl ScriptedChatModel {
    pub fn intents() -> Self {
        Self {
            mode: Mode::Intents,
            turns: AtomicUsize::new(0),
        }
    }

    /// Replays `replies` one per turn; running out is a processing error.
    pub fn replay(replies: impl IntoIterator<Item = ModelReply>) -> Self {
        Self {
            mode: Mode::Replay(Mutex::new(replies.into_iter().collect())),
            turns: AtomicUsize::new(0),
        }
    }

    pub fn turns(&self) -> usize {
        self.turns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatModel for ScriptedChatModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(
        &self,
        messages: &[Message],
        tools: &[ToolSpec],
    ) -> Result<ModelReply, OrchestratorError> {
        let turn = self.turns.fetch_add(1, Ordering::SeqCst) + 1;
        match &self.mode {
            Mode::Replay(replies) => replies
                .lock()
                .map_err(|_| OrchestratorError::processing("scripted replies poisoned"))?
                .pop_front()
                .ok_or_else(|| OrchestratorError::processing("scripted model ran out of replies")),
            Mode::Intents => Ok(respond(messages, tools, turn)),
        }
    }
}

fn respond(messages: &[Message], tools: &[ToolSpec], turn: usize) -> ModelReply {
    if let Some(Message::Tool {
        name,
        content,
        is_error,
        ..
    }) = messages.last()
    {
        return ModelReply::Final(summarize(name, content, *is_error));
    }

    let Some(text) = messages.iter().rev().find_map(|message| match message {
        Message::User { content } => Some(content.as_str()),
        _ => None,
    }) else {
        return ModelReply::Final(String::new());
    };

    match parse_intent(text) {
        Some((tool, arguments)) if tools.iter().any(|spec| spec.name == tool) => {
            ModelReply::ToolCalls {
                text: None,
                calls: vec![ToolCall {
                    id: format!("call_{turn}"),
                    name: tool.to_string(),
                    arguments: arguments.to_string(),
                }],
            }
        }
        Some((tool, _)) => ModelReply::Final(format!(
            "The {tool} tool is not available right now, so I cannot do that."
        )),
        None => ModelReply::Final(format!(
            "I'm SmartAssistant. I can do arithmetic, look up the weather, and run Python \
             or shell commands in a sandbox. You said: {}",
            text.trim()
        )),
    }
}

fn summarize(tool: &str, content: &str, is_error: bool) -> String {
    if is_error {
        let reason = serde_json::from_str::<Value>(content)
            .ok()
            .and_then(|value| value.get("error").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| content.to_string());
        return format!("Sorry, the {tool} tool failed: {reason}");
    }
    if CALCULATOR_TOOLS.contains(&tool) {
        format!("The result is {}.", content.trim())
    } else {
        content.trim().to_string()
    }
}

fn parse_intent(text: &str) -> Option<(&'static str, Value)> {
    let trimmed = text.trim();
    let lower = trimmed.to_ascii_lowercase();

    if let Some(command) = strip_prefix_ci(trimmed, "run:") {
        return Some(("runShellCommand", json!({ "command": command.trim() })));
    }
    if let Some(code) = strip_prefix_ci(trimmed, "python:") {
        return Some(("runPythonCode", json!({ "code": code.trim() })));
    }
    if let Some(url) =
        strip_prefix_ci(trimmed, "open ").filter(|url| url.trim_start().starts_with("http"))
    {
        return Some(("browserNavigate", json!({ "url": url.trim() })));
    }
    if lower.contains("weather") {
        let city = match lower.find(" in ") {
            Some(index) => &trimmed[index + 4..],
            None => trimmed.split_whitespace().last().unwrap_or_default(),
        };
        let city = city.trim_matches(|c: char| !c.is_alphanumeric() && c != ' ');
        return Some(("getWeather", json!({ "city": city })));
    }

    let words: Vec<&str> = lower.split_whitespace().collect();
    let operation = words.iter().find_map(|word| match word.trim_matches(|c: char| !c.is_alphabetic()) {
        "add" | "plus" | "sum" => Some("add"),
        "subtract" | "minus" => Some("subtract"),
        "multiply" | "times" => Some("multiply"),
        "divide" | "divided" => Some("divide"),
        _ => None,
    })?;
    let numbers: Vec<f64> = words.iter().filter_map(|word| parse_number(word)).collect();
    let (mut a, mut b) = match numbers.as_slice() {
        [a, b, ..] => (*a, *b),
        _ => return None,
    };
    // "subtract 4 from 10" means 10 - 4.
    if operation == "subtract" && words.contains(&"from") {
        std::mem::swap(&mut a, &mut b);
    }
    Some((operation, json!({ "a": a, "b": b })))
}

fn parse_number(word: &str) -> Option<f64> {
    let cleaned = word
        .trim_matches(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-'))
        .trim_end_matches('.');
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse().ok()
}

fn strip_prefix_ci<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(&text[prefix.len()..])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> ToolSpec {
        ToolSpec {
            name: name.to_string(),
            description: String::new(),
            parameters: json!({}),
        }
    }

    #[test]
    fn arithmetic_phrasings() {
        assert_eq!(parse_intent("add 2 and 3"), Some(("add", json!({ "a": 2.0, "b": 3.0 }))));
        assert_eq!(
            parse_intent("Please subtract 4 from 10."),
            Some(("subtract", json!({ "a": 10.0, "b": 4.0 })))
        );
        assert_eq!(
            parse_intent("what is 6 times 7?"),
            Some(("multiply", json!({ "a": 6.0, "b": 7.0 })))
        );
        assert_eq!(
            parse_intent("divide 8 by 2"),
            Some(("divide", json!({ "a": 8.0, "b": 2.0 })))
        );
        assert_eq!(parse_intent("add some numbers"), None);
    }

    #[test]
    fn weather_and_sandbox_phrasings() {
        assert_eq!(
            parse_intent("What's the weather in Hangzhou?"),
            Some(("getWeather", json!({ "city": "Hangzhou" })))
        );
        assert_eq!(
            parse_intent("run: echo SHELL_OK"),
            Some(("runShellCommand", json!({ "command": "echo SHELL_OK" })))
        );
        assert_eq!(
            parse_intent("Python: print('hi')"),
            Some(("runPythonCode", json!({ "code": "print('hi')" })))
        );
    }

    #[test]
    fn unavailable_tool_gets_a_final_answer() {
        let messages = vec![Message::User {
            content: "run: ls".to_string(),
        }];
        match respond(&messages, &[spec("add")], 1) {
            ModelReply::Final(text) => assert!(text.contains("runShellCommand")),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[test]
    fn tool_results_are_summarized() {
        assert_eq!(summarize("add", "5.0", false), "The result is 5.0.");
        assert_eq!(
            summarize("divide", "{\"error\":\"Cannot divide by zero\"}", true),
            "Sorry, the divide tool failed: Cannot divide by zero"
        );
    }

    #[tokio::test]
    async fn replay_runs_out_with_processing_error() {
        let model = ScriptedChatModel::replay([ModelReply::Final("42".to_string())]);
        assert_eq!(
            model.complete(&[], &[]).await.expect("first"),
            ModelReply::Final("42".to_string())
        );
        let err = model.complete(&[], &[]).await.expect_err("exhausted");
        assert!(matches!(err, OrchestratorError::Processing { .. }));
        assert_eq!(model.turns(), 2);
    }
}
