use ruvltra_engine::EngineConfig;
use ruvltra_sona::MemoryConfig;

/// Worker pool sizing and deadline configuration, plus the engine and
/// memory configuration applied to every worker.
#[derive(Clone)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub initial_workers: usize,
    pub queue_max_length: usize,
    pub task_timeout_ms: u64,
    pub engine: EngineConfig,
    pub memory: MemoryConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 2,
            max_workers: 8,
            initial_workers: 2,
            queue_max_length: 256,
            task_timeout_ms: 60_000,
            engine: EngineConfig::default(),
            memory: MemoryConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Normalize operator input: sizes are ordered and non-zero, the
    /// initial size sits inside `[min, max]`.
    pub fn normalized(mut self) -> Self {
        self.min_workers = self.min_workers.max(1);
        self.max_workers = self.max_workers.max(self.min_workers);
        self.initial_workers = self.initial_workers.clamp(self.min_workers, self.max_workers);
        self.queue_max_length = self.queue_max_length.max(1);
        self.task_timeout_ms = self.task_timeout_ms.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_orders_worker_bounds() {
        let config = PoolConfig {
            min_workers: 4,
            max_workers: 2,
            initial_workers: 0,
            queue_max_length: 0,
            task_timeout_ms: 0,
            ..PoolConfig::default()
        }
        .normalized();
        assert_eq!(config.min_workers, 4);
        assert_eq!(config.max_workers, 4);
        assert_eq!(config.initial_workers, 4);
        assert_eq!(config.queue_max_length, 1);
        assert_eq!(config.task_timeout_ms, 1);
    }
}
