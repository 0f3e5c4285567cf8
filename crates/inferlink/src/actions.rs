//! The closed set of invocable actions and their parameter shapes.
//!
//! The correlator and relay never look inside these; they route purely by
//! request id. Only the host dispatcher branches on the action tag.

use serde::{Deserialize, Serialize};

/// What a model can do. Also tags the per-task parameter records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Task {
    Chat,
    Completion,
    Translation,
}

impl Task {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Completion => "completion",
            Self::Translation => "translation",
        }
    }
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engine backing a model. Which engine serves which task is the host's
/// business; the client only carries the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Engine {
    LlamaCpp,
    Onnx,
}

impl Engine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LlamaCpp => "llama_cpp",
            Self::Onnx => "onnx",
        }
    }
}

impl std::fmt::Display for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Model descriptor as returned by `get_models`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Model {
    pub id: String,
    pub name: String,
    pub task: Task,
    pub engine: Engine,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatParams {
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionParams {
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranslationParams {
    pub input_text: String,
    pub source_lang: String,
    pub dest_lang: String,
}

/// Task selector plus its task-specific parameter record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task", content = "params", rename_all = "snake_case")]
pub enum TaskRequest {
    Chat(ChatParams),
    Completion(CompletionParams),
    Translation(TranslationParams),
}

impl TaskRequest {
    pub fn kind(&self) -> Task {
        match self {
            Self::Chat(_) => Task::Chat,
            Self::Completion(_) => Task::Completion,
            Self::Translation(_) => Task::Translation,
        }
    }
}

/// Parameters for the `infer` action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferParams {
    pub model_id: String,
    #[serde(flatten)]
    pub task: TaskRequest,
}

/// One variant per invocable action tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "params", rename_all = "snake_case")]
pub enum Action {
    GetModels,
    Infer(InferParams),
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Self::GetModels => "get_models",
            Self::Infer(_) => "infer",
        }
    }
}
