//! Operator configuration surface.
//!
//! Resolution order: built-in defaults, then the optional JSON config file
//! named by `RUVLTRA_CONFIG`, then `RUVLTRA_*` environment overrides. Every
//! numeric is clamped to a sane range; malformed file or env values fall
//! back to the defaults silently.

use std::path::PathBuf;

use ruvltra_engine::{
    EngineConfig, GenerationDefaults, HttpBackendConfig, MockBackendConfig, NativeBackendConfig,
    WireFormat,
};
use ruvltra_pool::PoolConfig;
use ruvltra_sona::MemoryConfig;
use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct RuvltraConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub initial_workers: usize,
    pub queue_max_length: usize,
    pub task_timeout_ms: u64,

    pub sona_enabled: bool,
    pub sona_state_dir: Option<PathBuf>,
    pub sona_persist_interval: u64,

    pub http_endpoint: Option<String>,
    pub http_api_key: Option<String>,
    pub http_model: String,
    pub http_format: WireFormat,
    pub http_timeout_ms: u64,
    pub http_max_retries: u32,
    pub http_retry_base_ms: u64,
    pub http_circuit_failure_threshold: u32,
    pub http_circuit_cooldown_ms: u64,

    pub model_path: Option<PathBuf>,
    pub context_length: u32,
    pub gpu_layers: i32,
    pub threads: u32,

    pub max_tokens: u32,
    pub temperature: f32,
    pub mock_latency_ms: u64,
    pub log_level: String,
}

impl Default for RuvltraConfig {
    fn default() -> Self {
        Self {
            min_workers: 2,
            max_workers: 8,
            initial_workers: 2,
            queue_max_length: 256,
            task_timeout_ms: 60_000,
            sona_enabled: true,
            sona_state_dir: None,
            sona_persist_interval: 10,
            http_endpoint: None,
            http_api_key: None,
            http_model: "default".to_string(),
            http_format: WireFormat::Auto,
            http_timeout_ms: 15_000,
            http_max_retries: 2,
            http_retry_base_ms: 250,
            http_circuit_failure_threshold: 5,
            http_circuit_cooldown_ms: 30_000,
            model_path: None,
            context_length: 4096,
            gpu_layers: -1,
            threads: 0,
            max_tokens: 512,
            temperature: 0.2,
            mock_latency_ms: 120,
            log_level: "info".to_string(),
        }
    }
}

/// Optional JSON config file; keys mirror the documented operator names.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct FileConfig {
    min_workers: Option<u64>,
    max_workers: Option<u64>,
    initial_workers: Option<u64>,
    queue_max_length: Option<u64>,
    task_timeout_ms: Option<u64>,
    sona_enabled: Option<bool>,
    sona_state_dir: Option<String>,
    sona_persist_interval: Option<u64>,
    http_endpoint: Option<String>,
    http_api_key: Option<String>,
    http_model: Option<String>,
    http_format: Option<String>,
    http_timeout_ms: Option<u64>,
    http_max_retries: Option<u64>,
    http_retry_base_ms: Option<u64>,
    http_circuit_failure_threshold: Option<u64>,
    http_circuit_cooldown_ms: Option<u64>,
    model_path: Option<String>,
    context_length: Option<u64>,
    gpu_layers: Option<i64>,
    threads: Option<u64>,
    max_tokens: Option<u64>,
    temperature: Option<f64>,
    mock_latency_ms: Option<u64>,
    log_level: Option<String>,
}

impl RuvltraConfig {
    /// Resolve the effective configuration from defaults, the optional
    /// config file and the environment.
    pub fn load() -> Self {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("RUVLTRA_CONFIG") {
            config.apply_file(&path);
        }
        config.apply_env();
        config.clamped()
    }

    fn apply_file(&mut self, path: &str) {
        let Ok(bytes) = std::fs::read(path) else {
            return;
        };
        let parsed: FileConfig = match serde_json::from_slice(&bytes) {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(path, error = %err, "ignoring malformed config file");
                return;
            }
        };
        if let Some(v) = parsed.min_workers {
            self.min_workers = v as usize;
        }
        if let Some(v) = parsed.max_workers {
            self.max_workers = v as usize;
        }
        if let Some(v) = parsed.initial_workers {
            self.initial_workers = v as usize;
        }
        if let Some(v) = parsed.queue_max_length {
            self.queue_max_length = v as usize;
        }
        if let Some(v) = parsed.task_timeout_ms {
            self.task_timeout_ms = v;
        }
        if let Some(v) = parsed.sona_enabled {
            self.sona_enabled = v;
        }
        if let Some(v) = parsed.sona_state_dir {
            self.sona_state_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = parsed.sona_persist_interval {
            self.sona_persist_interval = v;
        }
        if let Some(v) = parsed.http_endpoint {
            self.http_endpoint = Some(v);
        }
        if let Some(v) = parsed.http_api_key {
            self.http_api_key = Some(v);
        }
        if let Some(v) = parsed.http_model {
            self.http_model = v;
        }
        if let Some(v) = parsed.http_format.as_deref().and_then(WireFormat::parse) {
            self.http_format = v;
        }
        if let Some(v) = parsed.http_timeout_ms {
            self.http_timeout_ms = v;
        }
        if let Some(v) = parsed.http_max_retries {
            self.http_max_retries = v as u32;
        }
        if let Some(v) = parsed.http_retry_base_ms {
            self.http_retry_base_ms = v;
        }
        if let Some(v) = parsed.http_circuit_failure_threshold {
            self.http_circuit_failure_threshold = v as u32;
        }
        if let Some(v) = parsed.http_circuit_cooldown_ms {
            self.http_circuit_cooldown_ms = v;
        }
        if let Some(v) = parsed.model_path {
            self.model_path = Some(PathBuf::from(v));
        }
        if let Some(v) = parsed.context_length {
            self.context_length = v as u32;
        }
        if let Some(v) = parsed.gpu_layers {
            self.gpu_layers = v as i32;
        }
        if let Some(v) = parsed.threads {
            self.threads = v as u32;
        }
        if let Some(v) = parsed.max_tokens {
            self.max_tokens = v as u32;
        }
        if let Some(v) = parsed.temperature {
            self.temperature = v as f32;
        }
        if let Some(v) = parsed.mock_latency_ms {
            self.mock_latency_ms = v;
        }
        if let Some(v) = parsed.log_level {
            self.log_level = v;
        }
    }

    fn apply_env(&mut self) {
        self.min_workers = env_usize("RUVLTRA_MIN_WORKERS", self.min_workers);
        self.max_workers = env_usize("RUVLTRA_MAX_WORKERS", self.max_workers);
        self.initial_workers = env_usize("RUVLTRA_INITIAL_WORKERS", self.initial_workers);
        self.queue_max_length = env_usize("RUVLTRA_QUEUE_MAX_LENGTH", self.queue_max_length);
        self.task_timeout_ms = env_u64("RUVLTRA_TASK_TIMEOUT_MS", self.task_timeout_ms);
        self.sona_enabled = env_bool("RUVLTRA_SONA_ENABLED", self.sona_enabled);
        if let Ok(v) = std::env::var("RUVLTRA_SONA_STATE_DIR") {
            if !v.trim().is_empty() {
                self.sona_state_dir = Some(PathBuf::from(v));
            }
        }
        self.sona_persist_interval =
            env_u64("RUVLTRA_SONA_PERSIST_INTERVAL", self.sona_persist_interval);
        if let Ok(v) = std::env::var("RUVLTRA_HTTP_ENDPOINT") {
            if !v.trim().is_empty() {
                self.http_endpoint = Some(v);
            }
        }
        if let Ok(v) = std::env::var("RUVLTRA_HTTP_API_KEY") {
            if !v.trim().is_empty() {
                self.http_api_key = Some(v);
            }
        }
        if let Ok(v) = std::env::var("RUVLTRA_HTTP_MODEL") {
            if !v.trim().is_empty() {
                self.http_model = v;
            }
        }
        if let Some(v) = std::env::var("RUVLTRA_HTTP_FORMAT")
            .ok()
            .as_deref()
            .and_then(WireFormat::parse)
        {
            self.http_format = v;
        }
        self.http_timeout_ms = env_u64("RUVLTRA_HTTP_TIMEOUT_MS", self.http_timeout_ms);
        self.http_max_retries = env_u32("RUVLTRA_HTTP_MAX_RETRIES", self.http_max_retries);
        self.http_retry_base_ms = env_u64("RUVLTRA_HTTP_RETRY_BASE_MS", self.http_retry_base_ms);
        self.http_circuit_failure_threshold = env_u32(
            "RUVLTRA_HTTP_CIRCUIT_FAILURE_THRESHOLD",
            self.http_circuit_failure_threshold,
        );
        self.http_circuit_cooldown_ms = env_u64(
            "RUVLTRA_HTTP_CIRCUIT_COOLDOWN_MS",
            self.http_circuit_cooldown_ms,
        );
        if let Ok(v) = std::env::var("RUVLTRA_MODEL_PATH") {
            if !v.trim().is_empty() {
                self.model_path = Some(PathBuf::from(v));
            }
        }
        self.context_length = env_u32("RUVLTRA_CONTEXT_LENGTH", self.context_length);
        self.gpu_layers = env_i32("RUVLTRA_GPU_LAYERS", self.gpu_layers);
        self.threads = env_u32("RUVLTRA_THREADS", self.threads);
        self.max_tokens = env_u32("RUVLTRA_MAX_TOKENS", self.max_tokens);
        self.temperature = env_f32("RUVLTRA_TEMPERATURE", self.temperature);
        self.mock_latency_ms = env_u64("RUVLTRA_MOCK_LATENCY_MS", self.mock_latency_ms);
        if let Ok(v) = std::env::var("RUVLTRA_LOG") {
            if !v.trim().is_empty() {
                self.log_level = v;
            }
        }
    }

    fn clamped(mut self) -> Self {
        self.min_workers = self.min_workers.clamp(1, 64);
        self.max_workers = self.max_workers.clamp(self.min_workers, 64);
        self.initial_workers = self.initial_workers.clamp(self.min_workers, self.max_workers);
        self.queue_max_length = self.queue_max_length.clamp(1, 100_000);
        self.task_timeout_ms = self.task_timeout_ms.clamp(1, 86_400_000);
        self.sona_persist_interval = self.sona_persist_interval.clamp(1, 100_000);
        self.http_timeout_ms = self.http_timeout_ms.clamp(100, 600_000);
        self.http_max_retries = self.http_max_retries.min(10);
        self.http_retry_base_ms = self.http_retry_base_ms.clamp(1, 60_000);
        self.http_circuit_failure_threshold = self.http_circuit_failure_threshold.clamp(1, 1_000);
        self.http_circuit_cooldown_ms = self.http_circuit_cooldown_ms.clamp(100, 3_600_000);
        self.context_length = self.context_length.clamp(256, 1_048_576);
        self.threads = self.threads.min(1_024);
        self.max_tokens = self.max_tokens.clamp(1, 100_000);
        self.temperature = self.temperature.clamp(0.0, 2.0);
        self.mock_latency_ms = self.mock_latency_ms.min(60_000);
        self
    }

    pub fn into_pool_config(self) -> PoolConfig {
        let http = self.http_endpoint.as_ref().map(|endpoint| HttpBackendConfig {
            endpoint: endpoint.clone(),
            api_key: self.http_api_key.clone(),
            model: self.http_model.clone(),
            format: self.http_format,
            timeout_ms: self.http_timeout_ms,
            max_retries: self.http_max_retries,
            retry_base_ms: self.http_retry_base_ms,
            circuit_failure_threshold: self.http_circuit_failure_threshold,
            circuit_cooldown_ms: self.http_circuit_cooldown_ms,
        });
        let native = self.model_path.as_ref().map(|path| NativeBackendConfig {
            model_path: path.clone(),
            context_length: self.context_length,
            gpu_layers: self.gpu_layers,
            threads: self.threads,
        });
        PoolConfig {
            min_workers: self.min_workers,
            max_workers: self.max_workers,
            initial_workers: self.initial_workers,
            queue_max_length: self.queue_max_length,
            task_timeout_ms: self.task_timeout_ms,
            engine: EngineConfig {
                http,
                native,
                embedded: None,
                mock: MockBackendConfig {
                    latency_ms: self.mock_latency_ms,
                },
                defaults: GenerationDefaults {
                    max_tokens: self.max_tokens,
                    temperature: self.temperature,
                },
                native_runtime: None,
            },
            memory: MemoryConfig {
                enabled: self.sona_enabled,
                state_dir: self.sona_state_dir.clone(),
                persist_interval: self.sona_persist_interval,
            },
        }
    }
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_i32(name: &str, default: i32) -> i32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<i32>().ok())
        .unwrap_or(default)
}

fn env_f32(name: &str, default: f32) -> f32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<f32>().ok())
        .unwrap_or(default)
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_contract() {
        let config = RuvltraConfig::default();
        assert_eq!(config.min_workers, 2);
        assert_eq!(config.max_workers, 8);
        assert_eq!(config.queue_max_length, 256);
        assert_eq!(config.task_timeout_ms, 60_000);
        assert_eq!(config.http_timeout_ms, 15_000);
        assert_eq!(config.http_max_retries, 2);
        assert_eq!(config.http_circuit_failure_threshold, 5);
        assert_eq!(config.http_circuit_cooldown_ms, 30_000);
        assert_eq!(config.max_tokens, 512);
        assert_eq!(config.mock_latency_ms, 120);
        assert!(config.sona_enabled);
    }

    #[test]
    fn clamping_repairs_out_of_range_values() {
        let config = RuvltraConfig {
            min_workers: 0,
            max_workers: 100_000,
            initial_workers: 99,
            queue_max_length: 0,
            temperature: 9.5,
            http_timeout_ms: 1,
            ..RuvltraConfig::default()
        }
        .clamped();
        assert_eq!(config.min_workers, 1);
        assert_eq!(config.max_workers, 64);
        assert_eq!(config.initial_workers, 64);
        assert_eq!(config.queue_max_length, 1);
        assert_eq!(config.temperature, 2.0);
        assert_eq!(config.http_timeout_ms, 100);
    }

    #[test]
    fn file_layer_applies_camel_case_keys() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("ruvltra-config-{}.json", std::process::id()));
        std::fs::write(
            &path,
            br#"{"minWorkers": 3, "httpEndpoint": "http://localhost:8080/completion", "httpFormat": "llama", "mockLatencyMs": 7}"#,
        )
        .expect("write config file");

        let mut config = RuvltraConfig::default();
        config.apply_file(path.to_str().expect("utf8 path"));
        assert_eq!(config.min_workers, 3);
        assert_eq!(
            config.http_endpoint.as_deref(),
            Some("http://localhost:8080/completion")
        );
        assert_eq!(config.http_format, WireFormat::Llama);
        assert_eq!(config.mock_latency_ms, 7);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn malformed_file_is_ignored() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("ruvltra-config-bad-{}.json", std::process::id()));
        std::fs::write(&path, b"{broken").expect("write config file");
        let mut config = RuvltraConfig::default();
        config.apply_file(path.to_str().expect("utf8 path"));
        assert_eq!(config.min_workers, 2);
        let _ = std::fs::remove_file(path);
    }
}
