use crate::types::GenerateRequest;

/// Render the one canonical prompt for a request. `instruction` is the
/// (possibly memory-rewritten) instruction; adapters never assemble their
/// own prompt.
pub fn render_prompt(request: &GenerateRequest, instruction: &str) -> String {
    let mut out = String::with_capacity(instruction.len() + 128);
    out.push_str("Task: ");
    out.push_str(request.task_type.as_str());
    out.push('\n');
    if let Some(language) = &request.language {
        out.push_str("Language: ");
        out.push_str(language);
        out.push('\n');
    }
    if let Some(file_path) = &request.file_path {
        out.push_str("File: ");
        out.push_str(file_path);
        out.push('\n');
    }
    out.push_str("\nInstruction:\n");
    out.push_str(instruction);
    if let Some(context) = &request.context {
        out.push_str("\n\nContext:\n");
        out.push_str(context);
    }
    out.push_str("\n\nReturn only the final answer, without commentary.");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskType;

    #[test]
    fn renders_header_instruction_and_context() {
        let mut request = GenerateRequest::new(TaskType::Review, "check the parser");
        request.language = Some("rust".to_string());
        request.file_path = Some("src/parser.rs".to_string());
        request.context = Some("fn parse() {}".to_string());

        let prompt = render_prompt(&request, "check the parser");
        assert!(prompt.starts_with("Task: review\n"));
        assert!(prompt.contains("Language: rust\n"));
        assert!(prompt.contains("File: src/parser.rs\n"));
        assert!(prompt.contains("\nInstruction:\ncheck the parser"));
        assert!(prompt.contains("\nContext:\nfn parse() {}"));
        assert!(prompt.ends_with("Return only the final answer, without commentary."));
    }

    #[test]
    fn optional_blocks_are_omitted() {
        let request = GenerateRequest::new(TaskType::Generate, "hello");
        let prompt = render_prompt(&request, "hello");
        assert!(!prompt.contains("Language:"));
        assert!(!prompt.contains("File:"));
        assert!(!prompt.contains("Context:"));
    }
}
