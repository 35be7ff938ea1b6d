use crate::llm::{ConversationState, Message};

/// Returned when the conversation holds no assistant text.
pub const NO_RESPONSE: &str = "No response from assistant";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub text: String,
    /// False when `text` is the [`NO_RESPONSE`] sentinel.
    pub found: bool,
}

/// Text of the final assistant message.
///
/// Only the last assistant turn counts. When it has no text (a blank reply
/// or a turn that only requested tools) the sentinel is returned, even if
/// an earlier turn said something. Never fails.
pub fn extract_response(state: &ConversationState) -> Extraction {
    let last = state.messages().iter().rev().find_map(|message| match message {
        Message::Assistant { text, .. } => Some(text.as_deref()),
        _ => None,
    });
    match last {
        Some(Some(text)) if !text.trim().is_empty() => Extraction {
            text: text.to_string(),
            found: true,
        },
        _ => Extraction {
            text: NO_RESPONSE.to_string(),
            found: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ToolCall;

    fn user(content: &str) -> Message {
        Message::User {
            content: content.to_string(),
        }
    }

    #[test]
    fn last_assistant_text_wins() {
        let state = ConversationState::from_messages(vec![
            user("question"),
            Message::assistant_text("first"),
            user("again"),
            Message::assistant_text("42"),
        ]);
        assert_eq!(
            extract_response(&state),
            Extraction {
                text: "42".to_string(),
                found: true
            }
        );
    }

    #[test]
    fn missing_assistant_yields_sentinel() {
        let state = ConversationState::from_messages(vec![user("hello")]);
        let extraction = extract_response(&state);
        assert_eq!(extraction.text, NO_RESPONSE);
        assert!(!extraction.found);

        let empty = ConversationState::new();
        assert_eq!(extract_response(&empty).text, NO_RESPONSE);
    }

    fn add_call() -> ToolCall {
        ToolCall {
            id: "1".to_string(),
            name: "add".to_string(),
            arguments: "{}".to_string(),
        }
    }

    fn add_result() -> Message {
        Message::Tool {
            call_id: "1".to_string(),
            name: "add".to_string(),
            content: "5.0".to_string(),
            is_error: false,
        }
    }

    #[test]
    fn answer_after_tool_call_is_returned() {
        let state = ConversationState::from_messages(vec![
            user("add"),
            Message::Assistant {
                text: None,
                tool_calls: vec![add_call()],
            },
            add_result(),
            Message::assistant_text("The sum is 5"),
        ]);
        assert_eq!(extract_response(&state).text, "The sum is 5");
    }

    #[test]
    fn blank_final_turn_does_not_fall_back_to_earlier_text() {
        let state = ConversationState::from_messages(vec![
            user("what's the weather, then add 2 and 3"),
            Message::Assistant {
                text: Some("Let me check the weather first".to_string()),
                tool_calls: vec![add_call()],
            },
            add_result(),
            Message::assistant_text(""),
        ]);
        assert_eq!(
            extract_response(&state),
            Extraction {
                text: NO_RESPONSE.to_string(),
                found: false
            }
        );
    }

    #[test]
    fn conversation_ending_on_tool_request_yields_sentinel() {
        let state = ConversationState::from_messages(vec![
            user("add"),
            Message::assistant_text("thinking"),
            Message::Assistant {
                text: None,
                tool_calls: vec![add_call()],
            },
            add_result(),
        ]);
        let extraction = extract_response(&state);
        assert_eq!(extraction.text, NO_RESPONSE);
        assert!(!extraction.found);
    }
}
