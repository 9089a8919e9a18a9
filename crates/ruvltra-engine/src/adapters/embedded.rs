use std::sync::Arc;

use crate::adapters::{output_is_degraded, AdapterOutput, BackendAdapter, EmbeddedRuntime};
use crate::cancel::CancelToken;
use crate::config::EmbeddedBackendConfig;
use crate::error::EngineError;
use crate::types::{BackendKind, GenerationOptions};

/// Confidence recorded with every trajectory; the embedded runtime treats
/// adapter-sourced pairs as curated examples.
const TRAJECTORY_CONFIDENCE: f32 = 0.9;

/// In-process learning runtime backend. If the runtime ever produces output
/// that self-identifies as fallback/degraded mode, the adapter marks itself
/// unready for the rest of the process and the fallback chain continues.
pub struct EmbeddedAdapter {
    runtime: Arc<dyn EmbeddedRuntime>,
    record_trajectories: bool,
    ready: bool,
    note: String,
}

impl EmbeddedAdapter {
    pub fn new(config: EmbeddedBackendConfig) -> Self {
        let runtime = config.runtime;
        match runtime.ensure_model() {
            Ok(path) => Self {
                runtime,
                record_trajectories: config.record_trajectories,
                ready: true,
                note: format!("model ready at {}", path.display()),
            },
            Err(err) => {
                tracing::warn!(error = %err, "embedded runtime model fetch failed");
                Self {
                    runtime,
                    record_trajectories: config.record_trajectories,
                    ready: false,
                    note: format!("model fetch failed: {err}"),
                }
            }
        }
    }
}

impl BackendAdapter for EmbeddedAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Embedded
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    fn status_note(&self) -> String {
        self.note.clone()
    }

    fn generate(
        &mut self,
        prompt: &str,
        opts: &GenerationOptions,
        token: &CancelToken,
    ) -> Result<AdapterOutput, EngineError> {
        if !self.ready {
            return Err(EngineError::Unavailable(self.note.clone()));
        }
        if token.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        match self.runtime.call(prompt, opts) {
            Ok(text) if output_is_degraded(&text) => {
                self.ready = false;
                self.note = "demoted: runtime self-identified as degraded fallback".to_string();
                tracing::warn!("embedded backend demoted after fallback-mode output");
                Err(EngineError::Unavailable(self.note.clone()))
            }
            Ok(text) => {
                if self.record_trajectories && self.runtime.supports_trajectories() {
                    self.runtime
                        .record_trajectory(prompt, &text, TRAJECTORY_CONFIDENCE);
                }
                Ok(AdapterOutput {
                    text,
                    model: self.runtime.model_id(),
                    prompt_tokens: None,
                    completion_tokens: None,
                })
            }
            Err(err) => Err(EngineError::Unavailable(format!(
                "embedded call failed: {err}"
            ))),
        }
    }
}
