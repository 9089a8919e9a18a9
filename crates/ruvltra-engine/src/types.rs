use std::fmt;

use serde::{Deserialize, Serialize};

/// The kind of code-assistance work a request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Generate,
    Review,
    Refactor,
    Explain,
    Test,
    Fix,
    Complete,
    Translate,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Generate => "generate",
            TaskType::Review => "review",
            TaskType::Refactor => "refactor",
            TaskType::Explain => "explain",
            TaskType::Test => "test",
            TaskType::Fix => "fix",
            TaskType::Complete => "complete",
            TaskType::Translate => "translate",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The backend substrate that produced (or would produce) a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    #[serde(rename = "http")]
    Http,
    #[serde(rename = "native-local")]
    Native,
    #[serde(rename = "embedded-learning")]
    Embedded,
    #[serde(rename = "mock")]
    Mock,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Http => "http",
            BackendKind::Native => "native-local",
            BackendKind::Embedded => "embedded-learning",
            BackendKind::Mock => "mock",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable inputs to a single generation attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub task_type: TaskType,
    pub instruction: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl GenerateRequest {
    pub fn new(task_type: TaskType, instruction: impl Into<String>) -> Self {
        Self {
            task_type,
            instruction: instruction.into(),
            context: None,
            language: None,
            file_path: None,
            max_tokens: None,
            temperature: None,
            timeout_ms: None,
        }
    }
}

/// Sampling options resolved from a request plus the engine defaults.
#[derive(Debug, Clone, Copy)]
pub struct GenerationOptions {
    pub max_tokens: u32,
    pub temperature: f32,
}

impl GenerationOptions {
    pub fn resolve(request: &GenerateRequest, defaults: crate::config::GenerationDefaults) -> Self {
        Self {
            max_tokens: request.max_tokens.unwrap_or(defaults.max_tokens),
            temperature: request.temperature.unwrap_or(defaults.temperature),
        }
    }
}

/// One finished generation, with adapter-observed provenance.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Generation {
    pub text: String,
    pub model: String,
    pub backend: BackendKind,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_type_serializes_lowercase() {
        let v = serde_json::to_value(TaskType::Refactor).expect("serialize");
        assert_eq!(v, serde_json::json!("refactor"));
        let back: TaskType = serde_json::from_value(v).expect("deserialize");
        assert_eq!(back, TaskType::Refactor);
    }

    #[test]
    fn backend_kind_uses_descriptor_tags() {
        assert_eq!(
            serde_json::to_value(BackendKind::Native).expect("serialize"),
            serde_json::json!("native-local")
        );
        assert_eq!(BackendKind::Embedded.as_str(), "embedded-learning");
    }
}
