use std::time::Instant;

use serde::Serialize;

use crate::adapters::{BackendAdapter, EmbeddedAdapter, HttpAdapter, MockAdapter, NativeAdapter};
use crate::breaker::CircuitState;
use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::prompt::render_prompt;
use crate::types::{BackendKind, GenerateRequest, Generation, GenerationOptions};

/// Health snapshot of one adapter, exported to the pool status surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendSnapshot {
    pub backend: BackendKind,
    pub ready: bool,
    pub note: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit: Option<CircuitState>,
}

/// Per-worker inference engine: walks the ranked backend chain and returns
/// the first success. Preference order is data (the adapter vector), not
/// control flow.
pub struct InferenceEngine {
    adapters: Vec<Box<dyn BackendAdapter>>,
    active_backend: Option<BackendKind>,
    defaults: crate::config::GenerationDefaults,
}

impl InferenceEngine {
    pub fn new(config: &EngineConfig) -> Self {
        let mut adapters: Vec<Box<dyn BackendAdapter>> = Vec::new();
        if let Some(http) = &config.http {
            match HttpAdapter::new(http.clone()) {
                Ok(adapter) => adapters.push(Box::new(adapter)),
                Err(err) => {
                    tracing::warn!(error = %err, "http adapter init failed, dropping from chain")
                }
            }
        }
        if let Some(native) = &config.native {
            adapters.push(Box::new(NativeAdapter::new(
                native.clone(),
                config.native_runtime.clone(),
            )));
        }
        if let Some(embedded) = &config.embedded {
            adapters.push(Box::new(EmbeddedAdapter::new(embedded.clone())));
        }
        adapters.push(Box::new(MockAdapter::new(config.mock)));
        Self {
            adapters,
            active_backend: None,
            defaults: config.defaults,
        }
    }

    /// Generate text for `request`, using `instruction` as the (possibly
    /// rewritten) instruction body. Walks ready backends in preference
    /// order; cancellation is checked before every attempt.
    pub fn generate(
        &mut self,
        request: &GenerateRequest,
        instruction: &str,
        token: &CancelToken,
    ) -> Result<Generation, EngineError> {
        let prompt = render_prompt(request, instruction);
        let opts = GenerationOptions::resolve(request, self.defaults);
        let mut last_err: Option<EngineError> = None;

        for adapter in &mut self.adapters {
            if token.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            if !adapter.is_ready() {
                continue;
            }
            let kind = adapter.kind();
            let start = Instant::now();
            match adapter.generate(&prompt, &opts, token) {
                Ok(out) => {
                    self.active_backend = Some(kind);
                    return Ok(Generation {
                        text: out.text,
                        model: out.model,
                        backend: kind,
                        latency_ms: start.elapsed().as_millis() as u64,
                        prompt_tokens: out.prompt_tokens,
                        completion_tokens: out.completion_tokens,
                    });
                }
                Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                Err(err) => {
                    tracing::debug!(backend = kind.as_str(), error = %err, "backend attempt failed");
                    last_err = Some(err);
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| EngineError::Unavailable("no backend is ready".to_string())))
    }

    /// The backend that served the most recent successful generation.
    pub fn active_backend(&self) -> Option<BackendKind> {
        self.active_backend
    }

    pub fn snapshot(&self) -> Vec<BackendSnapshot> {
        self.adapters
            .iter()
            .map(|adapter| BackendSnapshot {
                backend: adapter.kind(),
                ready: adapter.is_ready(),
                note: adapter.status_note(),
                circuit: adapter.breaker_state(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MockBackendConfig;
    use crate::types::TaskType;

    fn mock_only_engine() -> InferenceEngine {
        InferenceEngine::new(&EngineConfig {
            mock: MockBackendConfig { latency_ms: 1 },
            ..EngineConfig::default()
        })
    }

    #[test]
    fn mock_only_chain_is_total() {
        let mut engine = mock_only_engine();
        let request = GenerateRequest::new(TaskType::Generate, "hello");
        let generation = engine
            .generate(&request, "hello", &CancelToken::new())
            .expect("mock generation");
        assert_eq!(generation.backend, BackendKind::Mock);
        assert!(!generation.text.is_empty());
        assert_eq!(engine.active_backend(), Some(BackendKind::Mock));
    }

    #[test]
    fn cancelled_token_short_circuits_the_chain() {
        let mut engine = mock_only_engine();
        let request = GenerateRequest::new(TaskType::Generate, "hello");
        let token = CancelToken::new();
        token.cancel();
        let err = engine
            .generate(&request, "hello", &token)
            .expect_err("cancelled");
        assert!(matches!(err, EngineError::Cancelled));
    }

    #[test]
    fn snapshot_reports_every_adapter() {
        let engine = mock_only_engine();
        let snapshot = engine.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].backend, BackendKind::Mock);
        assert!(snapshot[0].ready);
    }
}
