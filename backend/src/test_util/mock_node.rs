use serde::{Deserialize, Serialize};

/// Chat completion body as a compute node returns it.
#[derive(Debug, Serialize, Deserialize)]
pub struct MockCompletion {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<MockChoice>,
    #[serde(default)]
    pub usage: Option<MockUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MockChoice {
    pub index: u32,
    pub message: MockMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MockMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MockUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl MockCompletion {
    pub fn text(model: &str, content: &str) -> Self {
        let completion_tokens = content.split_whitespace().count() as u32;
        Self {
            id: "chatcmpl-mock".to_string(),
            object: "chat.completion".to_string(),
            created: 1_700_000_000,
            model: model.to_string(),
            choices: vec![MockChoice {
                index: 0,
                message: MockMessage {
                    role: "assistant".to_string(),
                    content: Some(content.to_string()),
                },
                finish_reason: Some("stop".to_string()),
            }],
            usage: Some(MockUsage {
                prompt_tokens: 10,
                completion_tokens,
                total_tokens: 10 + completion_tokens,
            }),
            confidence: None,
        }
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence);
        self
    }

    /// Mark the completion as cut off by the token limit.
    pub fn truncated(mut self) -> Self {
        for choice in &mut self.choices {
            choice.finish_reason = Some("length".to_string());
        }
        self
    }

    /// A body with no choices at all.
    pub fn empty(model: &str) -> Self {
        let mut completion = Self::text(model, "");
        completion.choices.clear();
        completion.usage = None;
        completion
    }
}
