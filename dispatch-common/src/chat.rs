//! OpenAI-compatible chat completion types spoken to compute nodes.
//!
//! Nodes expose `/v1/chat/completions`. A node may attach a non-standard
//! `confidence` score to its response; weighted merging uses it when present.

use serde::{Deserialize, Serialize};

/// Chat completion request sent to a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stream: Option<bool>,
}

impl ChatCompletionRequest {
    /// Single-turn, non-streaming request for `model`.
    pub fn from_prompt(model: &str, prompt: &str) -> Self {
        Self {
            messages: vec![ChatMessage::user(prompt)],
            model: Some(model.to_string()),
            temperature: None,
            max_tokens: None,
            stream: Some(false),
        }
    }

    pub fn with_sampling(mut self, temperature: Option<f32>, max_tokens: Option<u32>) -> Self {
        self.temperature = temperature;
        self.max_tokens = max_tokens;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
}

impl ChatMessage {
    pub fn user(content: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: Some(content.to_string()),
        }
    }

    pub fn assistant(content: &str) -> Self {
        Self {
            role: "assistant".to_string(),
            content: Some(content.to_string()),
        }
    }
}

/// Chat completion response returned by a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// Self-reported confidence in `[0, 1]`, if the node provides one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl ChatCompletionResponse {
    pub fn new(model: String, message: ChatMessage, finish_reason: Option<String>) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: format!("chatcmpl-{}", uuid::Uuid::new_v4()),
            object: "chat.completion".to_string(),
            created: now,
            model,
            choices: vec![Choice {
                index: 0,
                message,
                finish_reason,
            }],
            usage: None,
            confidence: None,
        }
    }

    pub fn with_usage(mut self, prompt_tokens: u32, completion_tokens: u32) -> Self {
        self.usage = Some(Usage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        });
        self
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence);
        self
    }

    /// Text of the first choice, if any.
    pub fn content(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|c| c.message.content.as_deref())
    }

    /// Finish reason of the first choice.
    pub fn finish_reason(&self) -> Option<&str> {
        self.choices
            .first()
            .and_then(|c| c.finish_reason.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_prompt() {
        let req = ChatCompletionRequest::from_prompt("parser-small", "extract the IOCs");
        assert_eq!(req.model.as_deref(), Some("parser-small"));
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.messages[0].role, "user");
        assert_eq!(req.messages[0].content.as_deref(), Some("extract the IOCs"));
        assert_eq!(req.stream, Some(false));
    }

    #[test]
    fn test_sampling_fields_skipped_when_unset() {
        let req = ChatCompletionRequest::from_prompt("m", "hi");
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("temperature"));
        assert!(!json.contains("max_tokens"));

        let req = req.with_sampling(Some(0.2), Some(64));
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains(r#""max_tokens":64"#));
    }

    #[test]
    fn test_response_content_and_finish_reason() {
        let response = ChatCompletionResponse::new(
            "test-model".to_string(),
            ChatMessage::assistant("benign"),
            Some("stop".to_string()),
        );
        assert!(response.id.starts_with("chatcmpl-"));
        assert_eq!(response.content(), Some("benign"));
        assert_eq!(response.finish_reason(), Some("stop"));
        assert!(response.confidence.is_none());
    }

    #[test]
    fn test_response_confidence_is_optional_on_the_wire() {
        let json = r#"{
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 0,
            "model": "m",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "x"}, "finish_reason": "stop"}]
        }"#;
        let parsed: ChatCompletionResponse = serde_json::from_str(json).unwrap();
        assert!(parsed.confidence.is_none());
        assert!(parsed.usage.is_none());

        let with = ChatCompletionResponse::new("m".to_string(), ChatMessage::assistant("x"), None)
            .with_confidence(0.75)
            .with_usage(10, 5);
        let json = serde_json::to_string(&with).unwrap();
        assert!(json.contains(r#""confidence":0.75"#));
        assert_eq!(with.usage.unwrap().total_tokens, 15);
    }

    #[test]
    fn test_content_none_without_choices() {
        let mut response =
            ChatCompletionResponse::new("m".to_string(), ChatMessage::assistant("x"), None);
        response.choices.clear();
        assert_eq!(response.content(), None);
    }
}
