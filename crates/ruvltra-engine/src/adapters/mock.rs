use std::time::Duration;

use rand::Rng;

use crate::adapters::{AdapterOutput, BackendAdapter};
use crate::cancel::CancelToken;
use crate::config::MockBackendConfig;
use crate::error::EngineError;
use crate::types::{BackendKind, GenerationOptions};

const MOCK_MODEL: &str = "ruvltra-mock";
const JITTER_MS: i64 = 15;

/// Deterministic last-resort backend. Always ready, so the fallback chain
/// is total; a request is never rejected for "no backend".
pub struct MockAdapter {
    latency_ms: u64,
}

impl MockAdapter {
    pub fn new(config: MockBackendConfig) -> Self {
        Self {
            latency_ms: config.latency_ms,
        }
    }
}

impl BackendAdapter for MockAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Mock
    }

    fn is_ready(&self) -> bool {
        true
    }

    fn status_note(&self) -> String {
        "ready".to_string()
    }

    fn generate(
        &mut self,
        prompt: &str,
        opts: &GenerationOptions,
        token: &CancelToken,
    ) -> Result<AdapterOutput, EngineError> {
        let jitter = rand::thread_rng().gen_range(-JITTER_MS..=JITTER_MS);
        let sleep_ms = (self.latency_ms as i64 + jitter).max(0) as u64;
        if !token.sleep_for(Duration::from_millis(sleep_ms)) {
            return Err(EngineError::Cancelled);
        }

        let headline = prompt
            .lines()
            .find(|line| line.starts_with("Task:"))
            .unwrap_or("Task: unknown")
            .trim();
        let text = format!(
            "[mock] {headline} | max_tokens={} | {} prompt chars",
            opts.max_tokens,
            prompt.len()
        );
        Ok(AdapterOutput {
            text,
            model: MOCK_MODEL.to_string(),
            prompt_tokens: Some((prompt.len() / 4) as u64),
            completion_tokens: Some(16),
        })
    }
}
