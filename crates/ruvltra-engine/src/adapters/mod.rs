pub mod embedded;
pub mod http;
pub mod mock;
pub mod native;

use std::path::PathBuf;

pub use embedded::EmbeddedAdapter;
pub use http::HttpAdapter;
pub use mock::MockAdapter;
pub use native::NativeAdapter;

use crate::breaker::CircuitState;
use crate::cancel::CancelToken;
use crate::config::NativeBackendConfig;
use crate::error::EngineError;
use crate::types::{BackendKind, GenerationOptions};

/// A runtime that advertises readiness but cannot run its native kernels
/// must prefix its output with this marker so the adapter can demote it.
pub const DEGRADED_OUTPUT_MARKER: &str = "[fallback-mode]";

/// Uniform generation interface over one model substrate. Adapters receive
/// the fully rendered prompt; they never assemble their own.
pub trait BackendAdapter: Send {
    fn kind(&self) -> BackendKind;

    fn is_ready(&self) -> bool;

    /// Last health note, surfaced through the pool status snapshot.
    fn status_note(&self) -> String;

    fn generate(
        &mut self,
        prompt: &str,
        opts: &GenerationOptions,
        token: &CancelToken,
    ) -> Result<AdapterOutput, EngineError>;

    /// Circuit breaker state; only the HTTP adapter carries one.
    fn breaker_state(&self) -> Option<CircuitState> {
        None
    }
}

/// What an adapter hands back on success. Latency is measured by the engine.
#[derive(Debug, Clone)]
pub struct AdapterOutput {
    pub text: String,
    pub model: String,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
}

/// Seam for a local native model runtime (e.g. a llama.cpp binding). The
/// concrete runtime is an external collaborator; the adapter owns readiness,
/// degraded-mode detection and per-call context isolation through this
/// contract.
pub trait NativeRuntime: Send + Sync {
    /// Load the model file once for the owning worker.
    fn load(&self, config: &NativeBackendConfig) -> Result<Box<dyn NativeModel>, String>;

    /// Whether the native bindings actually loaded on this host.
    fn is_native_loaded(&self) -> bool;

    /// Runtime version tag; a `-js` suffix marks a non-native shim.
    fn version(&self) -> String;

    /// The native dependency the host is expected to provide, included in
    /// degraded-mode notes.
    fn expected_dependency(&self) -> String;
}

/// A loaded native model. Each `complete` call must run in an isolated
/// inference context so parallel workers never share decoder state.
pub trait NativeModel: Send {
    fn model_id(&self) -> String;

    fn complete(
        &mut self,
        prompt: &str,
        opts: &GenerationOptions,
        token: &CancelToken,
    ) -> Result<String, String>;
}

/// Seam for the in-process embedded learning runtime.
pub trait EmbeddedRuntime: Send + Sync {
    fn model_id(&self) -> String;

    /// One-time model fetch into a stable path outside any package cache,
    /// so the download survives reinstalls.
    fn ensure_model(&self) -> Result<PathBuf, String>;

    fn call(&self, prompt: &str, opts: &GenerationOptions) -> Result<String, String>;

    fn supports_trajectories(&self) -> bool {
        false
    }

    /// Record a prompt/response pair into the runtime's trajectory store.
    fn record_trajectory(&self, _prompt: &str, _response: &str, _confidence: f32) {}
}

pub(crate) fn output_is_degraded(text: &str) -> bool {
    text.contains(DEGRADED_OUTPUT_MARKER)
}
