//! Tool mediator: the only place untyped transport input lives.
//!
//! Each tool input is validated into a typed struct, composed with a fixed
//! instruction template, and normalized into a [`GenerateRequest`].

use ruvltra_engine::{GenerateRequest, TaskType};
use serde::Deserialize;
use thiserror::Error;

pub const DEFAULT_PERSPECTIVES: [&str; 4] =
    ["security", "performance", "quality", "maintainability"];
pub const MAX_PERSPECTIVES: usize = 8;

/// Tool argument validation failure. Always surfaced as a protocol-level
/// invalid-params error; no task is admitted.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{field} must be a non-empty string")]
    EmptyField { field: String },
    #[error("tasks must contain at least one item")]
    NoTasks,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateInput {
    pub instruction: String,
    pub context: Option<String>,
    pub language: Option<String>,
    pub file_path: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewInput {
    pub code: String,
    pub language: Option<String>,
    pub focus: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefactorInput {
    pub code: String,
    pub instruction: Option<String>,
    pub language: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExplainInput {
    pub code: String,
    pub audience: Option<String>,
    pub language: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestInput {
    pub code: String,
    pub framework: Option<String>,
    pub language: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FixInput {
    pub code: String,
    pub error: String,
    pub language: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteInput {
    pub prefix: String,
    pub language: Option<String>,
    pub max_tokens: Option<u32>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslateInput {
    pub code: String,
    pub target_language: String,
    pub source_language: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelItem {
    pub file_path: String,
    pub instruction: String,
    pub context: Option<String>,
    pub language: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParallelInput {
    pub tasks: Vec<ParallelItem>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SwarmInput {
    pub code: String,
    pub perspectives: Option<Vec<String>>,
    pub language: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SonaStatsInput {
    pub worker_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScaleInput {
    pub target: usize,
}

fn non_empty(value: &str, field: &str) -> Result<(), ToolError> {
    if value.trim().is_empty() {
        Err(ToolError::EmptyField {
            field: field.to_string(),
        })
    } else {
        Ok(())
    }
}

pub fn generate_request(input: GenerateInput) -> Result<GenerateRequest, ToolError> {
    non_empty(&input.instruction, "instruction")?;
    Ok(GenerateRequest {
        task_type: TaskType::Generate,
        instruction: input.instruction,
        context: input.context,
        language: input.language,
        file_path: input.file_path,
        max_tokens: input.max_tokens,
        temperature: input.temperature,
        timeout_ms: input.timeout_ms,
    })
}

pub fn review_request(input: ReviewInput) -> Result<GenerateRequest, ToolError> {
    non_empty(&input.code, "code")?;
    let instruction = match input.focus.as_deref().filter(|f| !f.trim().is_empty()) {
        Some(focus) => format!(
            "Review the following code with a focus on {focus}. List concrete problems and suggested fixes."
        ),
        None => "Review the following code. List concrete problems and suggested fixes."
            .to_string(),
    };
    let mut request = GenerateRequest::new(TaskType::Review, instruction);
    request.context = Some(input.code);
    request.language = input.language;
    request.timeout_ms = input.timeout_ms;
    Ok(request)
}

pub fn refactor_request(input: RefactorInput) -> Result<GenerateRequest, ToolError> {
    non_empty(&input.code, "code")?;
    let mut instruction =
        "Refactor the following code without changing its behavior.".to_string();
    if let Some(goal) = input.instruction.as_deref().filter(|g| !g.trim().is_empty()) {
        instruction.push_str(&format!(" Goal: {goal}"));
    }
    let mut request = GenerateRequest::new(TaskType::Refactor, instruction);
    request.context = Some(input.code);
    request.language = input.language;
    request.timeout_ms = input.timeout_ms;
    Ok(request)
}

pub fn explain_request(input: ExplainInput) -> Result<GenerateRequest, ToolError> {
    non_empty(&input.code, "code")?;
    let instruction = match input.audience.as_deref().filter(|a| !a.trim().is_empty()) {
        Some(audience) => format!(
            "Explain what the following code does, written for {audience}."
        ),
        None => "Explain what the following code does and how it works.".to_string(),
    };
    let mut request = GenerateRequest::new(TaskType::Explain, instruction);
    request.context = Some(input.code);
    request.language = input.language;
    request.timeout_ms = input.timeout_ms;
    Ok(request)
}

pub fn test_request(input: TestInput) -> Result<GenerateRequest, ToolError> {
    non_empty(&input.code, "code")?;
    let mut instruction =
        "Write thorough unit tests for the following code, covering edge cases.".to_string();
    if let Some(framework) = input.framework.as_deref().filter(|f| !f.trim().is_empty()) {
        instruction.push_str(&format!(" Use {framework}."));
    }
    let mut request = GenerateRequest::new(TaskType::Test, instruction);
    request.context = Some(input.code);
    request.language = input.language;
    request.timeout_ms = input.timeout_ms;
    Ok(request)
}

pub fn fix_request(input: FixInput) -> Result<GenerateRequest, ToolError> {
    non_empty(&input.code, "code")?;
    non_empty(&input.error, "error")?;
    let instruction = format!(
        "Fix the following code so the reported error no longer occurs.\nReported error:\n{}",
        input.error
    );
    let mut request = GenerateRequest::new(TaskType::Fix, instruction);
    request.context = Some(input.code);
    request.language = input.language;
    request.timeout_ms = input.timeout_ms;
    Ok(request)
}

pub fn complete_request(input: CompleteInput) -> Result<GenerateRequest, ToolError> {
    non_empty(&input.prefix, "prefix")?;
    let mut request = GenerateRequest::new(
        TaskType::Complete,
        "Continue the following code from where it stops. Return only the continuation.",
    );
    request.context = Some(input.prefix);
    request.language = input.language;
    request.max_tokens = input.max_tokens;
    request.timeout_ms = input.timeout_ms;
    Ok(request)
}

pub fn translate_request(input: TranslateInput) -> Result<GenerateRequest, ToolError> {
    non_empty(&input.code, "code")?;
    non_empty(&input.target_language, "targetLanguage")?;
    let instruction = match input
        .source_language
        .as_deref()
        .filter(|s| !s.trim().is_empty())
    {
        Some(source) => format!(
            "Translate the following {source} code to {}.",
            input.target_language
        ),
        None => format!("Translate the following code to {}.", input.target_language),
    };
    let mut request = GenerateRequest::new(TaskType::Translate, instruction);
    request.context = Some(input.code);
    request.language = Some(input.target_language);
    request.timeout_ms = input.timeout_ms;
    Ok(request)
}

pub fn parallel_requests(
    input: ParallelInput,
) -> Result<Vec<(String, GenerateRequest)>, ToolError> {
    if input.tasks.is_empty() {
        return Err(ToolError::NoTasks);
    }
    let mut requests = Vec::with_capacity(input.tasks.len());
    for (idx, item) in input.tasks.into_iter().enumerate() {
        non_empty(&item.file_path, &format!("tasks[{idx}].filePath"))?;
        non_empty(&item.instruction, &format!("tasks[{idx}].instruction"))?;
        let mut request = GenerateRequest::new(TaskType::Generate, item.instruction);
        request.context = item.context;
        request.language = item.language;
        request.file_path = Some(item.file_path.clone());
        request.timeout_ms = input.timeout_ms;
        requests.push((item.file_path, request));
    }
    Ok(requests)
}

pub fn swarm_requests(input: SwarmInput) -> Result<Vec<(String, GenerateRequest)>, ToolError> {
    non_empty(&input.code, "code")?;
    let mut perspectives: Vec<String> = match input.perspectives {
        Some(list) if !list.is_empty() => list,
        _ => DEFAULT_PERSPECTIVES.iter().map(|s| s.to_string()).collect(),
    };
    perspectives.truncate(MAX_PERSPECTIVES);
    let mut requests = Vec::with_capacity(perspectives.len());
    for perspective in perspectives {
        non_empty(&perspective, "perspectives[]")?;
        let instruction = format!(
            "Review the following code from the {perspective} perspective. Report only findings relevant to {perspective}."
        );
        let mut request = GenerateRequest::new(TaskType::Review, instruction);
        request.context = Some(input.code.clone());
        request.language = input.language.clone();
        request.timeout_ms = input.timeout_ms;
        requests.push((perspective, request));
    }
    Ok(requests)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_instruction_is_rejected() {
        let err = generate_request(GenerateInput {
            instruction: "   ".to_string(),
            context: None,
            language: None,
            file_path: None,
            max_tokens: None,
            temperature: None,
            timeout_ms: None,
        })
        .expect_err("empty instruction");
        assert!(err.to_string().contains("instruction"));
    }

    #[test]
    fn review_template_carries_code_as_context() {
        let request = review_request(ReviewInput {
            code: "fn f() {}".to_string(),
            language: Some("rust".to_string()),
            focus: Some("unsafe blocks".to_string()),
            timeout_ms: Some(2_000),
        })
        .expect("valid review input");
        assert_eq!(request.task_type, TaskType::Review);
        assert!(request.instruction.contains("unsafe blocks"));
        assert_eq!(request.context.as_deref(), Some("fn f() {}"));
        assert_eq!(request.timeout_ms, Some(2_000));
    }

    #[test]
    fn translate_sets_target_language() {
        let request = translate_request(TranslateInput {
            code: "print('hi')".to_string(),
            target_language: "Rust".to_string(),
            source_language: Some("Python".to_string()),
            timeout_ms: None,
        })
        .expect("valid translate input");
        assert_eq!(request.task_type, TaskType::Translate);
        assert_eq!(request.language.as_deref(), Some("Rust"));
        assert!(request.instruction.contains("Python"));
    }

    #[test]
    fn swarm_defaults_and_caps_perspectives() {
        let defaults = swarm_requests(SwarmInput {
            code: "x".to_string(),
            perspectives: None,
            language: None,
            timeout_ms: None,
        })
        .expect("default perspectives");
        assert_eq!(defaults.len(), 4);
        assert_eq!(defaults[0].0, "security");

        let capped = swarm_requests(SwarmInput {
            code: "x".to_string(),
            perspectives: Some((0..20).map(|i| format!("p{i}")).collect()),
            language: None,
            timeout_ms: None,
        })
        .expect("capped perspectives");
        assert_eq!(capped.len(), MAX_PERSPECTIVES);
    }

    #[test]
    fn parallel_items_validate_each_entry() {
        let err = parallel_requests(ParallelInput {
            tasks: vec![ParallelItem {
                file_path: "src/a.rs".to_string(),
                instruction: "".to_string(),
                context: None,
                language: None,
            }],
            timeout_ms: None,
        })
        .expect_err("empty instruction rejected");
        assert!(err.to_string().contains("tasks[0].instruction"));

        let ok = parallel_requests(ParallelInput {
            tasks: vec![ParallelItem {
                file_path: "src/a.rs".to_string(),
                instruction: "write a".to_string(),
                context: None,
                language: Some("rust".to_string()),
            }],
            timeout_ms: Some(500),
        })
        .expect("valid fan-out");
        assert_eq!(ok[0].0, "src/a.rs");
        assert_eq!(ok[0].1.file_path.as_deref(), Some("src/a.rs"));
        assert_eq!(ok[0].1.timeout_ms, Some(500));
    }
}
