use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::{json, Value};

use crate::adapters::{AdapterOutput, BackendAdapter};
use crate::breaker::{CircuitBreaker, CircuitState};
use crate::cancel::CancelToken;
use crate::config::{HttpBackendConfig, WireFormat};
use crate::error::EngineError;
use crate::types::{BackendKind, GenerationOptions};

const BACKOFF_CAP_MS: u64 = 15_000;
const BACKOFF_JITTER_MS: u64 = 50;

/// Remote OpenAI-compatible or llama.cpp-style HTTP backend, isolated
/// behind a circuit breaker.
pub struct HttpAdapter {
    config: HttpBackendConfig,
    client: reqwest::Client,
    rt: tokio::runtime::Runtime,
    breaker: CircuitBreaker,
    wire: ResolvedWire,
    note: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResolvedWire {
    Chat,
    Raw,
}

fn resolve_wire(format: WireFormat, endpoint: &str) -> ResolvedWire {
    match format {
        WireFormat::OpenAi => ResolvedWire::Chat,
        WireFormat::Llama => ResolvedWire::Raw,
        WireFormat::Auto => {
            if endpoint.contains("/chat/completions") || endpoint.contains("/v1/completions") {
                ResolvedWire::Chat
            } else if endpoint.contains("/completion") || endpoint.contains("/generate") {
                ResolvedWire::Raw
            } else {
                ResolvedWire::Chat
            }
        }
    }
}

impl HttpAdapter {
    pub fn new(config: HttpBackendConfig) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| EngineError::Config(format!("http runtime init failed: {e}")))?;
        let breaker = CircuitBreaker::new(
            config.circuit_failure_threshold,
            Duration::from_millis(config.circuit_cooldown_ms),
        );
        let wire = resolve_wire(config.format, &config.endpoint);
        Ok(Self {
            config,
            client,
            rt,
            breaker,
            wire,
            note: "not yet attempted".to_string(),
        })
    }

    fn attempt_with_retries(
        &mut self,
        prompt: &str,
        opts: &GenerationOptions,
        token: &CancelToken,
    ) -> Result<AdapterOutput, EngineError> {
        let tries = self.config.max_retries.saturating_add(1);
        let mut last_err: Option<EngineError> = None;
        for attempt in 0..tries {
            if token.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            if attempt > 0 {
                let exp = u32::min(attempt - 1, 20);
                let backoff = self
                    .config
                    .retry_base_ms
                    .saturating_mul(1_u64 << exp)
                    .min(BACKOFF_CAP_MS);
                let jitter = rand::thread_rng().gen_range(0..=BACKOFF_JITTER_MS);
                if !token.sleep_for(Duration::from_millis(backoff + jitter)) {
                    return Err(EngineError::Cancelled);
                }
            }
            match self.one_try(prompt, opts, token) {
                Ok(out) => return Ok(out),
                Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                Err(err) if err.is_retryable() => {
                    tracing::debug!(attempt, error = %err, "http try failed, retrying");
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err
            .unwrap_or_else(|| EngineError::Unavailable("http retries exhausted".to_string())))
    }

    fn one_try(
        &self,
        prompt: &str,
        opts: &GenerationOptions,
        token: &CancelToken,
    ) -> Result<AdapterOutput, EngineError> {
        let payload = match self.wire {
            ResolvedWire::Chat => json!({
                "model": self.config.model,
                "messages": [{"role": "user", "content": prompt}],
                "max_tokens": opts.max_tokens,
                "temperature": opts.temperature,
            }),
            ResolvedWire::Raw => json!({
                "prompt": prompt,
                "n_predict": opts.max_tokens,
                "temperature": opts.temperature,
            }),
        };

        let request = {
            let mut builder = self.client.post(&self.config.endpoint).json(&payload);
            if let Some(key) = &self.config.api_key {
                builder = builder.bearer_auth(key);
            }
            builder
        };

        let cancel = token.clone();
        let value: Value = self.rt.block_on(async move {
            tokio::select! {
                out = async {
                    let res = request.send().await?;
                    if !res.status().is_success() {
                        let status = res.status().as_u16();
                        let body = res.text().await.unwrap_or_default();
                        return Err(EngineError::Api { status, body });
                    }
                    let value: Value = res.json().await?;
                    Ok(value)
                } => out,
                _ = watch_cancel(cancel) => Err(EngineError::Cancelled),
            }
        })?;

        self.extract(&value)
    }

    fn extract(&self, value: &Value) -> Result<AdapterOutput, EngineError> {
        let text = match self.wire {
            ResolvedWire::Chat => value["choices"][0]["message"]["content"]
                .as_str()
                .map(str::to_string),
            ResolvedWire::Raw => find_completion_text(value),
        };
        let text = text.filter(|t| !t.is_empty()).ok_or_else(|| {
            EngineError::InvalidResponse("response carries no completion content".to_string())
        })?;

        let model = value["model"]
            .as_str()
            .unwrap_or(&self.config.model)
            .to_string();
        let (prompt_tokens, completion_tokens) = extract_usage(value);

        Ok(AdapterOutput {
            text,
            model,
            prompt_tokens,
            completion_tokens,
        })
    }
}

async fn watch_cancel(token: CancelToken) {
    loop {
        if token.is_cancelled() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Search the raw-completion response for the first known content field,
/// recursing through nested objects and arrays.
fn find_completion_text(value: &Value) -> Option<String> {
    const CONTENT_KEYS: [&str; 6] = [
        "content",
        "text",
        "response",
        "completion",
        "generated_text",
        "output",
    ];
    match value {
        Value::Object(map) => {
            for key in CONTENT_KEYS {
                if let Some(Value::String(s)) = map.get(key) {
                    return Some(s.clone());
                }
            }
            map.values().find_map(find_completion_text)
        }
        Value::Array(items) => items.iter().find_map(find_completion_text),
        _ => None,
    }
}

fn extract_usage(value: &Value) -> (Option<u64>, Option<u64>) {
    let usage = &value["usage"];
    let prompt = usage["prompt_tokens"]
        .as_u64()
        .or_else(|| value["tokens_evaluated"].as_u64());
    let completion = usage["completion_tokens"]
        .as_u64()
        .or_else(|| value["tokens_predicted"].as_u64());
    (prompt, completion)
}

impl BackendAdapter for HttpAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Http
    }

    fn is_ready(&self) -> bool {
        !self.config.endpoint.is_empty()
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
        if let Err(wait) = self.breaker.try_acquire(Instant::now()) {
            let retry_in_ms = wait.as_millis() as u64;
            self.note = format!("circuit open, retry in {retry_in_ms} ms");
            return Err(EngineError::CircuitOpen { retry_in_ms });
        }

        let result = self.attempt_with_retries(prompt, opts, token);
        match &result {
            Ok(_) => {
                self.breaker.record_success();
                self.note = "healthy".to_string();
            }
            Err(EngineError::Cancelled) => {}
            Err(err) => {
                self.breaker.record_failure(Instant::now());
                self.note = err.to_string();
            }
        }
        result
    }

    fn breaker_state(&self) -> Option<CircuitState> {
        Some(self.breaker.state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_shape_inferred_from_endpoint() {
        let auto = WireFormat::Auto;
        assert_eq!(
            resolve_wire(auto, "http://host/v1/chat/completions"),
            ResolvedWire::Chat
        );
        assert_eq!(
            resolve_wire(auto, "http://host/v1/completions"),
            ResolvedWire::Chat
        );
        assert_eq!(
            resolve_wire(auto, "http://host:8080/completion"),
            ResolvedWire::Raw
        );
        assert_eq!(
            resolve_wire(auto, "http://host/api/generate"),
            ResolvedWire::Raw
        );
        assert_eq!(resolve_wire(auto, "http://host/infer"), ResolvedWire::Chat);
        assert_eq!(
            resolve_wire(WireFormat::Llama, "http://host/v1/chat/completions"),
            ResolvedWire::Raw
        );
    }

    #[test]
    fn raw_content_search_is_recursive() {
        let value = json!({"data": {"nested": [{"generated_text": "fn main() {}"}]}});
        assert_eq!(
            find_completion_text(&value).as_deref(),
            Some("fn main() {}")
        );
        assert_eq!(find_completion_text(&json!({"usage": {"x": 1}})), None);
    }

    #[test]
    fn usage_supports_both_wire_dialects() {
        let openai = json!({"usage": {"prompt_tokens": 12, "completion_tokens": 40}});
        assert_eq!(extract_usage(&openai), (Some(12), Some(40)));
        let llama = json!({"tokens_evaluated": 9, "tokens_predicted": 33});
        assert_eq!(extract_usage(&llama), (Some(9), Some(33)));
        assert_eq!(extract_usage(&json!({})), (None, None));
    }
}
