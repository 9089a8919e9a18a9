use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use ruvltra_engine::{BackendKind, EngineConfig, GenerateRequest, MockBackendConfig, TaskType};
use ruvltra_pool::{PoolConfig, TaskError, WorkerPool};
use ruvltra_sona::MemoryConfig;

fn mock_pool(workers: usize, queue_max: usize, latency_ms: u64, timeout_ms: u64) -> WorkerPool {
    WorkerPool::new(PoolConfig {
        min_workers: workers,
        max_workers: workers,
        initial_workers: workers,
        queue_max_length: queue_max,
        task_timeout_ms: timeout_ms,
        engine: EngineConfig {
            mock: MockBackendConfig { latency_ms },
            ..EngineConfig::default()
        },
        memory: MemoryConfig {
            enabled: true,
            state_dir: None,
            persist_interval: 10,
        },
    })
}

#[test]
fn mock_only_generate_succeeds() {
    let pool = mock_pool(1, 16, 10, 5_000);
    let ticket = pool
        .submit(GenerateRequest::new(TaskType::Generate, "hello"))
        .expect("submit");
    let result = ticket.wait().expect("mock generation succeeds");
    assert_eq!(result.generation.backend, BackendKind::Mock);
    assert!(!result.generation.text.is_empty());
    assert_eq!(result.worker_id, "worker-1");

    let status = pool.status();
    assert_eq!(status.submitted_tasks, 1);
    assert_eq!(status.completed_tasks, 1);
    pool.shutdown();
}

#[test]
fn queue_overflow_rejects_third_task() {
    let pool = mock_pool(1, 1, 100, 5_000);

    // The first task is handed to the only worker at admission, so the
    // second occupies the single queue slot and the third must be rejected.
    let first = pool
        .submit(GenerateRequest::new(TaskType::Generate, "first"))
        .expect("first admitted");
    let second = pool
        .submit(GenerateRequest::new(TaskType::Generate, "second"))
        .expect("second admitted");
    let third = pool.submit(GenerateRequest::new(TaskType::Generate, "third"));

    match third {
        Err(TaskError::QueueOverflow { retry_after_ms, .. }) => {
            assert_eq!(retry_after_ms, 5_000 / 4);
        }
        other => panic!("expected QueueOverflow, got {other:?}"),
    }

    assert!(first.wait().is_ok());
    assert!(second.wait().is_ok());

    let status = pool.status();
    assert_eq!(status.rejected_tasks, 1);
    assert_eq!(status.completed_tasks, 2);
    pool.shutdown();
}

#[test]
fn slow_backend_times_out() {
    let pool = mock_pool(1, 8, 80, 20);
    let started = Instant::now();
    let ticket = pool
        .submit(GenerateRequest::new(TaskType::Generate, "slow"))
        .expect("submit");
    match ticket.wait() {
        Err(TaskError::Timeout { timeout_ms }) => assert_eq!(timeout_ms, 20),
        other => panic!("expected Timeout, got {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_millis(500));

    let status = pool.status();
    assert!(status.timed_out_tasks >= 1);
    assert!(status.cancelled_tasks >= 1);
    pool.shutdown();
}

#[test]
fn per_request_timeout_overrides_pool_default() {
    let pool = mock_pool(1, 8, 80, 60_000);
    let mut request = GenerateRequest::new(TaskType::Generate, "slow");
    request.timeout_ms = Some(15);
    let ticket = pool.submit(request).expect("submit");
    match ticket.wait() {
        Err(TaskError::Timeout { timeout_ms }) => assert_eq!(timeout_ms, 15),
        other => panic!("expected Timeout, got {other:?}"),
    }
    pool.shutdown();
}

#[test]
fn shutdown_cancels_pending_and_running() {
    let pool = mock_pool(1, 8, 500, 10_000);
    let running = pool
        .submit(GenerateRequest::new(TaskType::Generate, "running"))
        .expect("submit running");
    let queued = pool
        .submit(GenerateRequest::new(TaskType::Generate, "queued"))
        .expect("submit queued");
    std::thread::sleep(Duration::from_millis(30));

    let started = Instant::now();
    pool.shutdown();
    assert!(started.elapsed() < Duration::from_secs(2));

    assert!(matches!(running.wait(), Err(TaskError::Cancelled)));
    assert!(matches!(queued.wait(), Err(TaskError::Cancelled)));
}

#[test]
fn submit_after_shutdown_is_cancelled() {
    let pool = mock_pool(1, 8, 10, 5_000);
    pool.shutdown();
    assert!(matches!(
        pool.submit(GenerateRequest::new(TaskType::Generate, "late")),
        Err(TaskError::Cancelled)
    ));
}

#[test]
fn settlement_counters_sum_to_admitted() {
    let pool = mock_pool(2, 32, 30, 5_000);
    let mut tickets = Vec::new();
    for i in 0..6 {
        let mut request = GenerateRequest::new(TaskType::Generate, format!("task {i}"));
        if i % 3 == 0 {
            // These deadlines expire before the 30 ms mock latency.
            request.timeout_ms = Some(5);
        }
        tickets.push(pool.submit(request).expect("submit"));
    }
    for ticket in tickets {
        let _ = ticket.wait();
    }

    let status = pool.status();
    assert_eq!(status.submitted_tasks, 6);
    assert_eq!(
        status.completed_tasks + status.failed_tasks + status.cancelled_tasks,
        status.submitted_tasks
    );
    assert!(status.timed_out_tasks <= status.cancelled_tasks);
    pool.shutdown();
}

#[test]
fn scale_is_clamped_to_configured_bounds() {
    let pool = WorkerPool::new(PoolConfig {
        min_workers: 1,
        max_workers: 4,
        initial_workers: 1,
        queue_max_length: 16,
        task_timeout_ms: 5_000,
        engine: EngineConfig {
            mock: MockBackendConfig { latency_ms: 5 },
            ..EngineConfig::default()
        },
        memory: MemoryConfig::default(),
    });

    let grown = pool.scale(10);
    assert_eq!(grown.workers, 4);
    let shrunk = pool.scale(0);
    assert_eq!(shrunk.workers, 1);

    let status = pool.status();
    assert_eq!(status.min_workers, 1);
    assert_eq!(status.max_workers, 4);
    pool.shutdown();
}

#[test]
fn queue_pressure_scales_up_within_bounds() {
    let pool = WorkerPool::new(PoolConfig {
        min_workers: 1,
        max_workers: 3,
        initial_workers: 1,
        queue_max_length: 32,
        task_timeout_ms: 10_000,
        engine: EngineConfig {
            mock: MockBackendConfig { latency_ms: 120 },
            ..EngineConfig::default()
        },
        memory: MemoryConfig::default(),
    });

    let tickets: Vec<_> = (0..6)
        .map(|i| {
            pool.submit(GenerateRequest::new(TaskType::Generate, format!("t{i}")))
                .expect("submit")
        })
        .collect();
    let status = pool.status();
    assert!(status.workers > 1);
    assert!(status.workers <= 3);
    for ticket in tickets {
        assert!(ticket.wait().is_ok());
    }
    pool.shutdown();
}

#[test]
fn memory_persists_across_pool_restarts() {
    let state_dir = std::env::temp_dir().join(format!(
        "ruvltra-pool-sona-{}-{}",
        std::process::id(),
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0)
    ));
    let config = PoolConfig {
        min_workers: 1,
        max_workers: 1,
        initial_workers: 1,
        queue_max_length: 16,
        task_timeout_ms: 5_000,
        engine: EngineConfig {
            mock: MockBackendConfig { latency_ms: 5 },
            ..EngineConfig::default()
        },
        memory: MemoryConfig {
            enabled: true,
            state_dir: Some(state_dir.clone()),
            persist_interval: 1,
        },
    };

    {
        let pool = WorkerPool::new(config.clone());
        let mut rust_task = GenerateRequest::new(TaskType::Generate, "write a lexer");
        rust_task.language = Some("rust".to_string());
        let mut go_task = GenerateRequest::new(TaskType::Generate, "write a worker queue");
        go_task.language = Some("go".to_string());
        pool.submit(rust_task).expect("submit").wait().expect("rust task");
        pool.submit(go_task).expect("submit").wait().expect("go task");
        pool.shutdown();
    }

    let pool = WorkerPool::new(config);
    let stats = pool.sona_stats(Some("worker-1"));
    assert_eq!(stats.len(), 1);
    assert!(stats[0].interactions >= 2);
    let keys: Vec<&str> = stats[0]
        .top_patterns
        .iter()
        .map(|p| p.key.as_str())
        .collect();
    assert!(keys.contains(&"lang:rust") || keys.contains(&"lang:go"));
    pool.shutdown();

    let _ = std::fs::remove_dir_all(state_dir);
}
