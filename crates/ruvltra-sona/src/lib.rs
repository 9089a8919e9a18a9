//! SONA: per-worker pattern memory.
//!
//! Each worker accumulates a small bag of scored patterns from its own
//! interactions and uses the best of them to prepend learned preferences to
//! future instructions. High-importance patterns learn slowly, so a few
//! noisy outcomes cannot overwrite what repeated successes cemented.
//! Workers never share memory.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const MEMORY_VERSION: &str = "sona-v1";

const MAX_PATTERNS: usize = 600;
const CONSOLIDATE_EVERY: u64 = 20;
const MAX_KEYWORD_KEYS: usize = 6;
const MIN_KEYWORD_LEN: usize = 4;

const SCORE_RANGE: (f64, f64) = (0.01, 1.0);
const IMPORTANCE_RANGE: (f64, f64) = (0.05, 0.99);
const INITIAL_SCORE: f64 = 0.5;
const INITIAL_IMPORTANCE: f64 = 0.1;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// One learned pattern: a derived key plus its running quality estimate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pattern {
    pub key: String,
    pub score: f64,
    pub importance: f64,
    pub hits: u64,
    pub successes: u64,
    pub last_seen_ms: u64,
}

/// The outcome of one finished generation, as seen by the owning worker.
#[derive(Debug, Clone)]
pub struct Interaction {
    pub task_type: String,
    pub language: Option<String>,
    pub file_path: Option<String>,
    /// The original instruction, before any rewriting.
    pub instruction: String,
    pub response: String,
    pub success: bool,
    pub latency_ms: u64,
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct MemoryConfig {
    pub enabled: bool,
    pub state_dir: Option<PathBuf>,
    pub persist_interval: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            state_dir: None,
            persist_interval: 10,
        }
    }
}

/// Snapshot of one worker's memory, surfaced through `ruvltra_sona_stats`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryStats {
    pub worker_id: String,
    pub interactions: u64,
    pub successes: u64,
    pub consolidations: u64,
    pub last_consolidated_ms: u64,
    pub pattern_count: usize,
    pub top_patterns: Vec<PatternStat>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PatternStat {
    pub key: String,
    pub score: f64,
    pub importance: f64,
    pub hits: u64,
}

#[derive(Serialize)]
struct PersistedMemory<'a> {
    version: &'a str,
    interactions: u64,
    successes: u64,
    consolidations: u64,
    last_consolidated_ms: u64,
    patterns: Vec<&'a Pattern>,
}

#[derive(Deserialize)]
struct LoadedMemory {
    version: String,
    #[serde(default)]
    interactions: u64,
    #[serde(default)]
    successes: u64,
    #[serde(default)]
    consolidations: u64,
    #[serde(default)]
    last_consolidated_ms: u64,
    #[serde(default)]
    patterns: Vec<serde_json::Value>,
}

pub struct PatternMemory {
    worker_id: String,
    enabled: bool,
    state_dir: Option<PathBuf>,
    persist_interval: u64,
    patterns: HashMap<String, Pattern>,
    interactions: u64,
    successes: u64,
    consolidations: u64,
    last_consolidated_ms: u64,
    recorded_since_persist: u64,
}

impl PatternMemory {
    /// Create the memory for `worker_id`, reloading a persisted snapshot
    /// from the state directory when a well-formed, matching-version file
    /// exists. Anything else starts empty.
    pub fn new(worker_id: impl Into<String>, config: &MemoryConfig) -> Self {
        let worker_id = worker_id.into();
        let mut memory = Self {
            worker_id: worker_id.clone(),
            enabled: config.enabled,
            state_dir: config.state_dir.clone(),
            persist_interval: config.persist_interval,
            patterns: HashMap::new(),
            interactions: 0,
            successes: 0,
            consolidations: 0,
            last_consolidated_ms: 0,
            recorded_since_persist: 0,
        };
        if let Some(dir) = &memory.state_dir {
            memory.load_snapshot(&dir.join(format!("{worker_id}.json")));
        }
        memory
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn interactions(&self) -> u64 {
        self.interactions
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    /// Rewrite an instruction by prepending the top learned hints for this
    /// task type and language. Returns the instruction unchanged when no
    /// hint applies.
    pub fn rewrite(&self, instruction: &str, task_type: &str, language: Option<&str>) -> String {
        if !self.enabled || self.patterns.is_empty() {
            return instruction.to_string();
        }
        let task_key = format!("task:{task_type}");
        let lang_key = language.map(|l| format!("lang:{}", l.to_lowercase()));

        let mut candidates: Vec<&Pattern> = self
            .patterns
            .values()
            .filter(|p| {
                p.key == task_key
                    || p.key == "task:general"
                    || lang_key.as_deref() == Some(p.key.as_str())
                    || p.key.starts_with("kw:")
                    || p.key.starts_with("pattern:")
            })
            .collect();
        candidates.sort_by(|a, b| {
            hint_rank(b)
                .partial_cmp(&hint_rank(a))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.key.cmp(&b.key))
        });

        let hints: Vec<String> = candidates
            .iter()
            .take(3)
            .filter_map(|p| hint_phrase(&p.key))
            .collect();
        if hints.is_empty() {
            return instruction.to_string();
        }

        let mut out =
            String::from("Apply these learned project preferences before answering:\n");
        for (i, hint) in hints.iter().enumerate() {
            out.push_str(&format!("{}. {hint}\n", i + 1));
        }
        out.push('\n');
        out.push_str(instruction);
        out
    }

    /// Fold one finished interaction into the pattern store, consolidating
    /// and persisting on their respective cadences.
    pub fn record(&mut self, interaction: &Interaction) {
        if !self.enabled {
            return;
        }
        let now = now_ms();
        let quality = quality_score(interaction);
        for key in extract_keys(interaction) {
            self.update_pattern(key, quality, interaction.success, now);
        }
        self.interactions += 1;
        if interaction.success {
            self.successes += 1;
        }
        self.recorded_since_persist += 1;

        let due_consolidation = self.interactions % CONSOLIDATE_EVERY == 0;
        let due_persist = self.state_dir.is_some()
            && self.persist_interval > 0
            && self.recorded_since_persist >= self.persist_interval;
        if due_consolidation || due_persist {
            self.flush();
        }
    }

    /// Consolidate, then write the snapshot if a state directory is
    /// configured. Disk errors are logged and swallowed; a flush never
    /// takes down a worker.
    pub fn flush(&mut self) {
        let now = now_ms();
        self.consolidate(now);
        if self.state_dir.is_none() {
            return;
        }
        match self.persist() {
            Ok(()) => self.recorded_since_persist = 0,
            Err(err) => {
                tracing::warn!(worker = %self.worker_id, error = %err, "memory flush failed");
            }
        }
    }

    pub fn stats(&self) -> MemoryStats {
        let mut ranked: Vec<&Pattern> = self.patterns.values().collect();
        ranked.sort_by(|a, b| {
            hint_rank(b)
                .partial_cmp(&hint_rank(a))
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.key.cmp(&b.key))
        });
        MemoryStats {
            worker_id: self.worker_id.clone(),
            interactions: self.interactions,
            successes: self.successes,
            consolidations: self.consolidations,
            last_consolidated_ms: self.last_consolidated_ms,
            pattern_count: self.patterns.len(),
            top_patterns: ranked
                .into_iter()
                .take(10)
                .map(|p| PatternStat {
                    key: p.key.clone(),
                    score: p.score,
                    importance: p.importance,
                    hits: p.hits,
                })
                .collect(),
        }
    }

    fn update_pattern(&mut self, key: String, quality: f64, success: bool, now: u64) {
        let pattern = self
            .patterns
            .entry(key.clone())
            .or_insert_with(|| Pattern {
                key,
                score: INITIAL_SCORE,
                importance: INITIAL_IMPORTANCE,
                hits: 0,
                successes: 0,
                last_seen_ms: now,
            });
        pattern.hits += 1;
        if success {
            pattern.successes += 1;
        }
        pattern.last_seen_ms = now;

        // Memory protection: high-importance patterns learn more slowly.
        let plasticity = (1.0 - pattern.importance).max(0.05);
        let alpha = 0.28 * plasticity;
        pattern.score =
            (pattern.score * (1.0 - alpha) + quality * alpha).clamp(SCORE_RANGE.0, SCORE_RANGE.1);
        let gain = if success { 0.06 } else { 0.01 };
        pattern.importance =
            (pattern.importance * 0.97 + gain).clamp(IMPORTANCE_RANGE.0, IMPORTANCE_RANGE.1);
    }

    fn consolidate(&mut self, now: u64) {
        self.patterns.retain(|_, p| {
            let age_min = now.saturating_sub(p.last_seen_ms) as f64 / 60_000.0;
            let value = 0.65 * p.score + 0.35 * p.importance;
            let untouched = p.hits <= 1 && age_min > 30.0;
            let stale = value < 0.22 && age_min > 10.0;
            !(untouched || stale)
        });

        if self.patterns.len() > MAX_PATTERNS {
            let mut ranked: Vec<(String, f64)> = self
                .patterns
                .values()
                .map(|p| (p.key.clone(), 0.7 * p.score + 0.3 * p.importance))
                .collect();
            ranked.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
            let excess = self.patterns.len() - MAX_PATTERNS;
            for (key, _) in ranked.into_iter().take(excess) {
                self.patterns.remove(&key);
            }
        }

        self.consolidations += 1;
        self.last_consolidated_ms = now;
    }

    fn persist(&self) -> Result<(), MemoryError> {
        let Some(dir) = &self.state_dir else {
            return Ok(());
        };
        fs::create_dir_all(dir)?;
        let snapshot = PersistedMemory {
            version: MEMORY_VERSION,
            interactions: self.interactions,
            successes: self.successes,
            consolidations: self.consolidations,
            last_consolidated_ms: self.last_consolidated_ms,
            patterns: self.patterns.values().collect(),
        };
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        let path = dir.join(format!("{}.json", self.worker_id));
        let tmp = dir.join(format!("{}.json.tmp", self.worker_id));
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn load_snapshot(&mut self, path: &Path) {
        let Ok(bytes) = fs::read(path) else {
            return;
        };
        let loaded: LoadedMemory = match serde_json::from_slice(&bytes) {
            Ok(v) => v,
            Err(err) => {
                tracing::info!(path = %path.display(), error = %err, "ignoring unreadable memory snapshot");
                return;
            }
        };
        if loaded.version != MEMORY_VERSION {
            tracing::info!(
                path = %path.display(),
                version = %loaded.version,
                "ignoring memory snapshot with unknown version"
            );
            return;
        }
        self.interactions = loaded.interactions;
        self.successes = loaded.successes;
        self.consolidations = loaded.consolidations;
        self.last_consolidated_ms = loaded.last_consolidated_ms;
        for value in loaded.patterns {
            match serde_json::from_value::<Pattern>(value) {
                Ok(mut pattern) => {
                    pattern.score = pattern.score.clamp(SCORE_RANGE.0, SCORE_RANGE.1);
                    pattern.importance = pattern
                        .importance
                        .clamp(IMPORTANCE_RANGE.0, IMPORTANCE_RANGE.1);
                    self.patterns.insert(pattern.key.clone(), pattern);
                }
                Err(_) => continue,
            }
        }
    }
}

fn hint_rank(pattern: &Pattern) -> f64 {
    0.7 * pattern.score + 0.3 * pattern.importance
}

fn hint_phrase(key: &str) -> Option<String> {
    if let Some(task) = key.strip_prefix("task:") {
        if task == "general" {
            Some("Favor the approaches that worked on earlier tasks in this project.".to_string())
        } else {
            Some(format!("Optimize the answer for {task} tasks."))
        }
    } else if let Some(lang) = key.strip_prefix("lang:") {
        Some(format!("Use idiomatic {lang} style."))
    } else if key == "pattern:error-handling" {
        Some("Include defensive error handling.".to_string())
    } else if key == "pattern:typed-api" {
        Some("Keep API contracts explicit and typed.".to_string())
    } else if let Some(word) = key.strip_prefix("kw:") {
        Some(format!("Respect prior preferences around \"{word}\"."))
    } else if let Some(ext) = key.strip_prefix("fileext:") {
        Some(format!("Match the formatting conventions of .{ext} files."))
    } else {
        None
    }
}

fn quality_score(interaction: &Interaction) -> f64 {
    let base = if interaction.success { 0.8 } else { 0.2 };
    let latency_penalty = (interaction.latency_ms as f64 / 12_000.0).min(0.4);
    let token_bonus = interaction
        .completion_tokens
        .map(|t| (t as f64 / 1_600.0).min(0.15))
        .unwrap_or(0.0);
    let prompt_penalty = interaction
        .prompt_tokens
        .map(|t| (t as f64 / 8_000.0).min(0.08))
        .unwrap_or(0.0);
    (base + token_bonus - latency_penalty - prompt_penalty).clamp(0.05, 1.0)
}

fn extract_keys(interaction: &Interaction) -> Vec<String> {
    let mut keys = Vec::new();
    let mut seen = HashSet::new();
    let push = |key: String, keys: &mut Vec<String>, seen: &mut HashSet<String>| {
        if seen.insert(key.clone()) {
            keys.push(key);
        }
    };

    push(
        format!("task:{}", interaction.task_type),
        &mut keys,
        &mut seen,
    );
    push("task:general".to_string(), &mut keys, &mut seen);
    if let Some(lang) = &interaction.language {
        push(format!("lang:{}", lang.to_lowercase()), &mut keys, &mut seen);
    }
    if let Some(path) = &interaction.file_path {
        if let Some(ext) = path.rsplit('.').next() {
            push(
                format!("fileext:{}", ext.to_lowercase()),
                &mut keys,
                &mut seen,
            );
        }
    }

    let lowered = interaction.instruction.to_lowercase();
    let mut keyword_count = 0;
    for word in lowered.split(|c: char| !(c.is_ascii_alphanumeric() || c == '_')) {
        if word.len() < MIN_KEYWORD_LEN {
            continue;
        }
        let key = format!("kw:{word}");
        if seen.insert(key.clone()) {
            keys.push(key);
            keyword_count += 1;
            if keyword_count >= MAX_KEYWORD_KEYS {
                break;
            }
        }
    }

    if interaction.response.contains("try") && interaction.response.contains("catch") {
        push(
            "pattern:error-handling".to_string(),
            &mut keys,
            &mut seen,
        );
    }
    if interaction.response.contains("interface ") || interaction.response.contains("type ") {
        push("pattern:typed-api".to_string(), &mut keys, &mut seen);
    }

    keys
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn interaction(success: bool) -> Interaction {
        Interaction {
            task_type: "generate".to_string(),
            language: Some("Rust".to_string()),
            file_path: Some("src/main.rs".to_string()),
            instruction: "implement parser combinators quickly".to_string(),
            response: "fn parse() {}".to_string(),
            success,
            latency_ms: 1_200,
            prompt_tokens: Some(400),
            completion_tokens: Some(320),
        }
    }

    fn ephemeral_memory() -> PatternMemory {
        PatternMemory::new(
            "worker-test",
            &MemoryConfig {
                enabled: true,
                state_dir: None,
                persist_interval: 10,
            },
        )
    }

    fn temp_state_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "ruvltra-sona-{tag}-{}-{}",
            std::process::id(),
            now_ms()
        ))
    }

    #[test]
    fn quality_score_rewards_success_and_penalizes_latency() {
        let good = quality_score(&interaction(true));
        let bad = quality_score(&interaction(false));
        assert!(good > bad);
        assert!((0.05..=1.0).contains(&good));

        let slow = Interaction {
            latency_ms: 60_000,
            ..interaction(true)
        };
        assert!(quality_score(&slow) < good);
        // Latency penalty is capped at 0.4.
        let slower = Interaction {
            latency_ms: 600_000,
            ..interaction(true)
        };
        assert_eq!(quality_score(&slow), quality_score(&slower));
    }

    #[test]
    fn key_extraction_covers_all_families() {
        let mut sample = interaction(true);
        sample.response = "try { api() } catch (e) {} interface Foo {}".to_string();
        let keys = extract_keys(&sample);
        assert!(keys.contains(&"task:generate".to_string()));
        assert!(keys.contains(&"task:general".to_string()));
        assert!(keys.contains(&"lang:rust".to_string()));
        assert!(keys.contains(&"fileext:rs".to_string()));
        assert!(keys.contains(&"kw:implement".to_string()));
        assert!(keys.contains(&"kw:parser".to_string()));
        assert!(keys.contains(&"pattern:error-handling".to_string()));
        assert!(keys.contains(&"pattern:typed-api".to_string()));
    }

    #[test]
    fn keyword_keys_are_capped_and_length_filtered() {
        let mut sample = interaction(true);
        sample.instruction =
            "alpha beta gamma delta epsilon zeta theta iota kappa it is of".to_string();
        let kw: Vec<_> = extract_keys(&sample)
            .into_iter()
            .filter(|k| k.starts_with("kw:"))
            .collect();
        assert_eq!(kw.len(), MAX_KEYWORD_KEYS);
        assert_eq!(kw[0], "kw:alpha");
        assert!(!kw.contains(&"kw:it".to_string()));
    }

    #[test]
    fn importance_rises_monotonically_under_success() {
        let mut memory = ephemeral_memory();
        let mut previous = 0.0;
        for _ in 0..200 {
            memory.record(&interaction(true));
            let importance = memory.patterns["task:generate"].importance;
            assert!(importance >= previous);
            previous = importance;
        }
        assert!(previous <= IMPORTANCE_RANGE.1);
        assert!(previous > 0.9);
    }

    #[test]
    fn repeated_success_pulls_score_toward_quality() {
        let mut memory = ephemeral_memory();
        for _ in 0..30 {
            memory.record(&interaction(true));
        }
        let score = memory.patterns["task:generate"].score;
        let q = quality_score(&interaction(true));
        assert!((score - q).abs() < 0.15);
    }

    #[test]
    fn consolidation_enforces_pattern_ceiling() {
        let mut memory = ephemeral_memory();
        for i in 0..900 {
            let mut sample = interaction(true);
            sample.instruction = format!("keyword{i:04} keyword{:04} filler words", i + 1);
            memory.record(&sample);
        }
        memory.flush();
        assert!(memory.pattern_count() <= MAX_PATTERNS);
    }

    #[test]
    fn rewrite_prepends_top_hints() {
        let mut memory = ephemeral_memory();
        for _ in 0..5 {
            memory.record(&interaction(true));
        }
        let rewritten = memory.rewrite("write a lexer", "generate", Some("Rust"));
        assert!(rewritten.starts_with("Apply these learned project preferences before answering:"));
        assert!(rewritten.contains("1. "));
        assert!(rewritten.ends_with("write a lexer"));
    }

    #[test]
    fn rewrite_is_identity_without_patterns() {
        let memory = ephemeral_memory();
        assert_eq!(
            memory.rewrite("write a lexer", "generate", None),
            "write a lexer"
        );
    }

    #[test]
    fn persistence_round_trip_restores_counters_and_patterns() {
        let dir = temp_state_dir("roundtrip");
        let config = MemoryConfig {
            enabled: true,
            state_dir: Some(dir.clone()),
            persist_interval: 1,
        };
        {
            let mut memory = PatternMemory::new("worker-1", &config);
            memory.record(&interaction(true));
            memory.record(&Interaction {
                language: Some("Go".to_string()),
                ..interaction(true)
            });
            memory.flush();
        }

        let restored = PatternMemory::new("worker-1", &config);
        assert!(restored.interactions() >= 2);
        assert!(restored.patterns.contains_key("lang:rust"));
        assert!(restored.patterns.contains_key("lang:go"));
        let stats = restored.stats();
        assert_eq!(stats.worker_id, "worker-1");
        assert!(stats.pattern_count >= 2);

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn corrupted_snapshot_starts_empty() {
        let dir = temp_state_dir("corrupt");
        fs::create_dir_all(&dir).expect("create state dir");
        fs::write(dir.join("worker-1.json"), b"{not json").expect("write garbage");
        let config = MemoryConfig {
            enabled: true,
            state_dir: Some(dir.clone()),
            persist_interval: 1,
        };
        let memory = PatternMemory::new("worker-1", &config);
        assert_eq!(memory.interactions(), 0);
        assert_eq!(memory.pattern_count(), 0);
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn version_mismatch_and_malformed_records_are_skipped() {
        let dir = temp_state_dir("version");
        fs::create_dir_all(&dir).expect("create state dir");

        let wrong_version = serde_json::json!({
            "version": "sona-v0",
            "interactions": 9,
            "patterns": []
        });
        fs::write(
            dir.join("worker-1.json"),
            serde_json::to_vec(&wrong_version).expect("serialize"),
        )
        .expect("write snapshot");
        let config = MemoryConfig {
            enabled: true,
            state_dir: Some(dir.clone()),
            persist_interval: 1,
        };
        assert_eq!(PatternMemory::new("worker-1", &config).interactions(), 0);

        let mixed = serde_json::json!({
            "version": MEMORY_VERSION,
            "interactions": 4,
            "successes": 3,
            "consolidations": 1,
            "last_consolidated_ms": 1,
            "patterns": [
                {"key": "task:general", "score": 7.5, "importance": -2.0,
                 "hits": 3, "successes": 3, "last_seen_ms": 1},
                {"bogus": true}
            ]
        });
        fs::write(
            dir.join("worker-1.json"),
            serde_json::to_vec(&mixed).expect("serialize"),
        )
        .expect("write snapshot");
        let memory = PatternMemory::new("worker-1", &config);
        assert_eq!(memory.interactions(), 4);
        assert_eq!(memory.pattern_count(), 1);
        let pattern = &memory.patterns["task:general"];
        assert_eq!(pattern.score, SCORE_RANGE.1);
        assert_eq!(pattern.importance, IMPORTANCE_RANGE.0);

        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn disabled_memory_is_inert() {
        let mut memory = PatternMemory::new(
            "worker-1",
            &MemoryConfig {
                enabled: false,
                state_dir: None,
                persist_interval: 1,
            },
        );
        memory.record(&interaction(true));
        assert_eq!(memory.interactions(), 0);
        assert_eq!(memory.rewrite("plain", "generate", None), "plain");
    }
}
