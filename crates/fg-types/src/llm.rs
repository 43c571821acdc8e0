use serde::{Deserialize, Serialize};

use crate::enums::MessageRole;

/// One turn of the conversation sent upstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }
}

/// Request handed to the upstream provider. Opaque to the governance layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    pub messages: Vec<ChatMessage>,
    pub model: String,
    #[serde(default)]
    pub streaming: bool,
}

/// Provider reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    pub text: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_role_defaults_to_user() {
        let msg: ChatMessage = serde_json::from_str(r#"{"content": "hi"}"#).unwrap();
        assert_eq!(msg.role, MessageRole::User);
    }

    #[test]
    fn request_streaming_defaults_off() {
        let req: LlmRequest = serde_json::from_str(
            r#"{"messages": [{"role": "system", "content": "be brief"}], "model": "m"}"#,
        )
        .unwrap();
        assert!(!req.streaming);
        assert_eq!(req.messages[0], ChatMessage::system("be brief"));
    }
}
