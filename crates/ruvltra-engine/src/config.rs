use std::path::PathBuf;
use std::sync::Arc;

use crate::adapters::{EmbeddedRuntime, NativeRuntime};

/// Remote HTTP backend settings.
#[derive(Debug, Clone)]
pub struct HttpBackendConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: String,
    pub format: WireFormat,
    pub timeout_ms: u64,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub circuit_failure_threshold: u32,
    pub circuit_cooldown_ms: u64,
}

impl HttpBackendConfig {
    pub fn new(endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: None,
            model: model.into(),
            format: WireFormat::Auto,
            timeout_ms: 15_000,
            max_retries: 2,
            retry_base_ms: 250,
            circuit_failure_threshold: 5,
            circuit_cooldown_ms: 30_000,
        }
    }
}

/// Wire shape spoken by the remote endpoint. `Auto` infers from the
/// endpoint path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    Auto,
    OpenAi,
    Llama,
}

impl WireFormat {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(WireFormat::Auto),
            "openai" => Some(WireFormat::OpenAi),
            "llama" => Some(WireFormat::Llama),
            _ => None,
        }
    }
}

/// Local native model settings. The runtime itself is injected through
/// [`EngineConfig::native_runtime`].
#[derive(Debug, Clone)]
pub struct NativeBackendConfig {
    pub model_path: PathBuf,
    pub context_length: u32,
    pub gpu_layers: i32,
    pub threads: u32,
}

impl NativeBackendConfig {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            context_length: 4096,
            gpu_layers: -1,
            threads: 0,
        }
    }
}

/// Embedded learning runtime settings.
#[derive(Clone)]
pub struct EmbeddedBackendConfig {
    pub runtime: Arc<dyn EmbeddedRuntime>,
    pub record_trajectories: bool,
}

/// Deterministic mock backend settings.
#[derive(Debug, Clone, Copy)]
pub struct MockBackendConfig {
    pub latency_ms: u64,
}

impl Default for MockBackendConfig {
    fn default() -> Self {
        Self { latency_ms: 120 }
    }
}

/// Sampling defaults applied when a request does not override them.
#[derive(Debug, Clone, Copy)]
pub struct GenerationDefaults {
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            temperature: 0.2,
        }
    }
}

/// Per-worker inference engine configuration. Backends left at `None` are
/// not part of the fallback chain; the mock backend is always present.
#[derive(Clone, Default)]
pub struct EngineConfig {
    pub http: Option<HttpBackendConfig>,
    pub native: Option<NativeBackendConfig>,
    pub embedded: Option<EmbeddedBackendConfig>,
    pub mock: MockBackendConfig,
    pub defaults: GenerationDefaults,
    pub native_runtime: Option<Arc<dyn NativeRuntime>>,
}
