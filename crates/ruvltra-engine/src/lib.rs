pub mod adapters;
pub mod breaker;
pub mod cancel;
pub mod config;
pub mod engine;
pub mod error;
pub mod prompt;
pub mod types;

pub use adapters::{
    AdapterOutput, BackendAdapter, EmbeddedRuntime, NativeModel, NativeRuntime,
    DEGRADED_OUTPUT_MARKER,
};
pub use breaker::{CircuitBreaker, CircuitState};
pub use cancel::CancelToken;
pub use config::{
    EmbeddedBackendConfig, EngineConfig, GenerationDefaults, HttpBackendConfig, MockBackendConfig,
    NativeBackendConfig, WireFormat,
};
pub use engine::{BackendSnapshot, InferenceEngine};
pub use error::EngineError;
pub use prompt::render_prompt;
pub use types::{BackendKind, GenerateRequest, Generation, GenerationOptions, TaskType};
