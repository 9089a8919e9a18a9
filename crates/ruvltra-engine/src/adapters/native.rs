use std::sync::Arc;

use crate::adapters::{output_is_degraded, AdapterOutput, BackendAdapter, NativeModel, NativeRuntime};
use crate::cancel::CancelToken;
use crate::config::NativeBackendConfig;
use crate::error::EngineError;
use crate::types::{BackendKind, GenerationOptions};

/// Local native model backend. The model file is loaded once per worker;
/// the runtime contract requires an isolated inference context per call so
/// parallel workers never share mutable decoder state.
pub struct NativeAdapter {
    model: Option<Box<dyn NativeModel>>,
    ready: bool,
    note: String,
    expected_dependency: String,
}

impl NativeAdapter {
    pub fn new(config: NativeBackendConfig, runtime: Option<Arc<dyn NativeRuntime>>) -> Self {
        let Some(runtime) = runtime else {
            return Self::unready("no native runtime linked", String::new());
        };
        let expected = runtime.expected_dependency();
        if !config.model_path.exists() {
            return Self::unready(
                &format!("model file not found: {}", config.model_path.display()),
                expected,
            );
        }
        if !runtime.is_native_loaded() {
            return Self::unready(
                &format!("native bindings unavailable, expected {expected}"),
                expected.clone(),
            );
        }
        if runtime.version().ends_with("-js") {
            return Self::unready(
                &format!(
                    "runtime {} is a non-native shim, expected {expected}",
                    runtime.version()
                ),
                expected.clone(),
            );
        }
        match runtime.load(&config) {
            Ok(model) => Self {
                model: Some(model),
                ready: true,
                note: format!("model loaded from {}", config.model_path.display()),
                expected_dependency: expected,
            },
            Err(err) => Self::unready(&format!("model load failed: {err}"), expected),
        }
    }

    fn unready(note: &str, expected_dependency: String) -> Self {
        tracing::warn!(note, "native backend not ready");
        Self {
            model: None,
            ready: false,
            note: note.to_string(),
            expected_dependency,
        }
    }

    fn demote(&mut self, reason: &str) -> EngineError {
        self.ready = false;
        self.note = if self.expected_dependency.is_empty() {
            format!("demoted: {reason}")
        } else {
            format!(
                "demoted: {reason}; install {} for native inference",
                self.expected_dependency
            )
        };
        tracing::warn!(note = %self.note, "native backend demoted");
        EngineError::Unavailable(self.note.clone())
    }
}

impl BackendAdapter for NativeAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
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
        let model = self
            .model
            .as_mut()
            .ok_or_else(|| EngineError::Unavailable("native model not loaded".to_string()))?;
        let model_id = model.model_id();
        match model.complete(prompt, opts, token) {
            Ok(text) if output_is_degraded(&text) => {
                Err(self.demote("runtime produced fallback-mode output"))
            }
            Ok(text) => Ok(AdapterOutput {
                text,
                model: model_id,
                prompt_tokens: None,
                completion_tokens: None,
            }),
            Err(err) if token.is_cancelled() => {
                tracing::debug!(error = %err, "native completion aborted by cancellation");
                Err(EngineError::Cancelled)
            }
            Err(err) => Err(EngineError::Unavailable(format!(
                "native completion failed: {err}"
            ))),
        }
    }
}
