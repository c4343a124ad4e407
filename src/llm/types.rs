use crate::schema::EvidenceLabel;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// One call to the model: a system prompt, the conversation so far and sampling parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
}

impl GenerationRequest {
    pub fn new(system: impl Into<String>, user: impl Into<String>, temperature: f64) -> Self {
        Self {
            system: system.into(),
            messages: vec![ChatMessage::user(user)],
            temperature,
        }
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    /// Content of the most recent user turn.
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == ChatRole::User)
            .map(|m| m.content.as_str())
    }
}

/// How strictly the reply is held to the supplied facts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptMode {
    #[default]
    Strict,
    Normal,
}

/// The structured block the model is asked to return.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct CommentaryReply {
    /// Explanation of the deviation in two to four sentences. Use only the numbers given.
    pub narrative: String,

    /// How well the narrative is supported by the facts provided.
    pub evidence_label: EvidenceLabel,

    /// Ids of the facts the narrative relies on, e.g. ["F1", "F3"].
    #[serde(default)]
    pub source_facts: Vec<String>,

    /// Summary of at most ten words.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headline: Option<String>,

    /// Open questions for the responsible department.
    #[serde(default)]
    pub questions: Vec<String>,
}

impl CommentaryReply {
    pub fn json_schema() -> serde_json::Value {
        serde_json::to_value(schemars::schema_for!(CommentaryReply)).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CommentaryEvent {
    Starting { account_id: String },
    Prompted { account_id: String, attempt: u32 },
    Parsed { account_id: String, attempt: u32 },
    CorrectionNeeded { account_id: String, attempt: u32, reason: String },
    Unreachable { account_id: String, retry: u32, error: String },
    Validated { account_id: String, attempt: u32 },
    Exhausted { account_id: String, attempts: u32 },
}

#[cfg(feature = "ollama")]
#[derive(Debug, Serialize)]
pub(crate) struct OllamaChatRequest<'a> {
    pub model: &'a str,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    pub options: OllamaOptions,
}

#[cfg(feature = "ollama")]
#[derive(Debug, Serialize)]
pub(crate) struct OllamaOptions {
    pub temperature: f64,
}

#[cfg(feature = "ollama")]
#[derive(Debug, Deserialize)]
pub(crate) struct OllamaChatResponse {
    pub message: Option<ChatMessage>,
}

#[cfg(feature = "ollama")]
#[derive(Debug, Deserialize)]
pub(crate) struct OllamaTagsResponse {
    #[serde(default)]
    pub models: Vec<OllamaModelTag>,
}

#[cfg(feature = "ollama")]
#[derive(Debug, Deserialize)]
pub(crate) struct OllamaModelTag {
    pub name: String,
}
