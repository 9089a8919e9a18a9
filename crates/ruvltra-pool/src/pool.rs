//! Bounded worker pool.
//!
//! One control surface (`submit`/`status`/`scale`/`shutdown`), a FIFO queue
//! with a hard admission ceiling, and a set of workers that each own an
//! inference engine and a pattern memory. Concurrency is across workers:
//! a worker runs at most one generation at a time. A housekeeping thread
//! fires task deadlines and retires idle workers.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use ruvltra_engine::{
    BackendKind, BackendSnapshot, CancelToken, EngineError, GenerateRequest, Generation,
    InferenceEngine,
};
use ruvltra_sona::{Interaction, MemoryStats, PatternMemory};
use serde::Serialize;

use crate::config::PoolConfig;
use crate::task::{TaskError, TaskId, TaskResult, TaskTicket};

const IDLE_THRESHOLD: Duration = Duration::from_secs(20);
const HEARTBEAT: Duration = Duration::from_secs(5);

/// Snapshot of the pool, returned by `status` and `scale`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStatus {
    pub workers: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    pub queue_length: usize,
    pub in_flight: usize,
    pub submitted_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub cancelled_tasks: u64,
    pub timed_out_tasks: u64,
    pub rejected_tasks: u64,
    pub workers_by_backend: BTreeMap<String, usize>,
    pub worker_stats: Vec<WorkerStatus>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    pub id: String,
    pub active_tasks: usize,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    pub idle_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<BackendKind>,
    pub backends: Vec<BackendSnapshot>,
}

struct TaskShared {
    id: TaskId,
    token: CancelToken,
    deadline: Instant,
    timeout_ms: u64,
    settled: AtomicBool,
}

struct PendingTask {
    shared: Arc<TaskShared>,
    sender: mpsc::Sender<Result<TaskResult, TaskError>>,
}

struct QueuedTask {
    shared: Arc<TaskShared>,
    request: GenerateRequest,
}

enum WorkerMsg {
    Run(QueuedTask),
    Stop,
}

struct WorkerEntry {
    id: String,
    sender: mpsc::Sender<WorkerMsg>,
    handle: Option<JoinHandle<()>>,
    memory: Arc<Mutex<PatternMemory>>,
    active_tasks: usize,
    completed_tasks: u64,
    failed_tasks: u64,
    last_used_at: Instant,
    current_backend: Option<BackendKind>,
    backends: Vec<BackendSnapshot>,
}

struct PoolState {
    workers: Vec<WorkerEntry>,
    retired: Vec<JoinHandle<()>>,
    queue: VecDeque<QueuedTask>,
    pending: HashMap<TaskId, PendingTask>,
    next_task_id: TaskId,
    next_worker_seq: u64,
    shutting_down: bool,
    submitted_tasks: u64,
    completed_tasks: u64,
    failed_tasks: u64,
    cancelled_tasks: u64,
    timed_out_tasks: u64,
    rejected_tasks: u64,
}

struct PoolShared {
    state: Mutex<PoolState>,
    housekeeping: Condvar,
    config: PoolConfig,
}

enum Settlement {
    Success {
        worker_id: String,
        generation: Generation,
    },
    Timeout,
    Cancelled,
    Backend {
        message: String,
    },
}

pub struct WorkerPool {
    shared: Arc<PoolShared>,
    housekeeper: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Self {
        let config = config.normalized();
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState {
                workers: Vec::new(),
                retired: Vec::new(),
                queue: VecDeque::new(),
                pending: HashMap::new(),
                next_task_id: 0,
                next_worker_seq: 0,
                shutting_down: false,
                submitted_tasks: 0,
                completed_tasks: 0,
                failed_tasks: 0,
                cancelled_tasks: 0,
                timed_out_tasks: 0,
                rejected_tasks: 0,
            }),
            housekeeping: Condvar::new(),
            config,
        });

        {
            let mut state = shared.state.lock().expect("pool state lock poisoned");
            for _ in 0..shared.config.initial_workers {
                spawn_worker_locked(&shared, &mut state);
            }
        }

        let housekeeper_shared = Arc::clone(&shared);
        let housekeeper = std::thread::Builder::new()
            .name("ruvltra-housekeeper".to_string())
            .spawn(move || housekeeping_loop(housekeeper_shared))
            .expect("spawn housekeeping thread");

        Self {
            shared,
            housekeeper: Mutex::new(Some(housekeeper)),
        }
    }

    /// Admit a request. Rejected immediately with `QueueOverflow` when the
    /// queue already holds `queue_max_length` waiting tasks, and with
    /// `Cancelled` once shutdown began.
    pub fn submit(&self, request: GenerateRequest) -> Result<TaskTicket, TaskError> {
        let mut state = self.shared.state.lock().expect("pool state lock poisoned");
        if state.shutting_down {
            return Err(TaskError::Cancelled);
        }
        let waiting = state
            .queue
            .iter()
            .filter(|q| !q.shared.settled.load(Ordering::SeqCst))
            .count();
        if waiting >= self.shared.config.queue_max_length {
            state.rejected_tasks += 1;
            return Err(TaskError::QueueOverflow {
                queued: waiting,
                retry_after_ms: self.shared.config.task_timeout_ms / 4,
            });
        }

        state.next_task_id += 1;
        let task_id = state.next_task_id;
        let timeout_ms = request
            .timeout_ms
            .unwrap_or(self.shared.config.task_timeout_ms)
            .max(1);
        let shared_task = Arc::new(TaskShared {
            id: task_id,
            token: CancelToken::new(),
            deadline: Instant::now() + Duration::from_millis(timeout_ms),
            timeout_ms,
            settled: AtomicBool::new(false),
        });
        let (sender, receiver) = mpsc::channel();
        state.pending.insert(
            task_id,
            PendingTask {
                shared: Arc::clone(&shared_task),
                sender,
            },
        );
        state.queue.push_back(QueuedTask {
            shared: shared_task,
            request,
        });
        state.submitted_tasks += 1;

        if state.queue.len() > state.workers.len()
            && state.workers.len() < self.shared.config.max_workers
        {
            spawn_worker_locked(&self.shared, &mut state);
        }
        dispatch_locked(&mut state);
        drop(state);
        // Wake the housekeeper so a shorter deadline takes effect now.
        self.shared.housekeeping.notify_all();

        Ok(TaskTicket { task_id, receiver })
    }

    pub fn status(&self) -> PoolStatus {
        let state = self.shared.state.lock().expect("pool state lock poisoned");
        status_locked(&state, &self.shared.config)
    }

    /// Memory statistics, for every worker or one worker by id.
    pub fn sona_stats(&self, worker_id: Option<&str>) -> Vec<MemoryStats> {
        let state = self.shared.state.lock().expect("pool state lock poisoned");
        state
            .workers
            .iter()
            .filter(|w| worker_id.map_or(true, |id| w.id == id))
            .map(|w| w.memory.lock().expect("memory lock poisoned").stats())
            .collect()
    }

    /// Operator resize, clamped to `[min_workers, max_workers]`. Running
    /// tasks are never aborted; only idle workers are removed.
    pub fn scale(&self, target: usize) -> PoolStatus {
        let mut state = self.shared.state.lock().expect("pool state lock poisoned");
        let target = target.clamp(
            self.shared.config.min_workers,
            self.shared.config.max_workers,
        );
        while state.workers.len() < target {
            spawn_worker_locked(&self.shared, &mut state);
        }
        while state.workers.len() > target {
            let idx = state
                .workers
                .iter()
                .enumerate()
                .filter(|(_, w)| w.active_tasks == 0)
                .min_by_key(|(_, w)| w.last_used_at)
                .map(|(i, _)| i);
            let Some(idx) = idx else { break };
            retire_worker_locked(&mut state, idx);
        }
        dispatch_locked(&mut state);
        status_locked(&state, &self.shared.config)
    }

    /// Stop accepting, cancel everything pending and running, flush every
    /// worker's memory, and join all threads.
    pub fn shutdown(&self) {
        let mut handles = Vec::new();
        {
            let mut state = self.shared.state.lock().expect("pool state lock poisoned");
            state.shutting_down = true;
            let ids: Vec<TaskId> = state.pending.keys().copied().collect();
            for task_id in ids {
                if let Some(pending) = state.pending.get(&task_id) {
                    pending.shared.token.cancel();
                }
                settle_locked(&mut state, task_id, Settlement::Cancelled);
            }
            state.queue.clear();
            for worker in &mut state.workers {
                let _ = worker.sender.send(WorkerMsg::Stop);
            }
            for worker in &mut state.workers {
                if let Some(handle) = worker.handle.take() {
                    handles.push(handle);
                }
            }
            state.workers.clear();
            handles.append(&mut state.retired);
        }
        self.shared.housekeeping.notify_all();
        for handle in handles {
            let _ = handle.join();
        }
        if let Some(handle) = self
            .housekeeper
            .lock()
            .expect("housekeeper handle lock poisoned")
            .take()
        {
            let _ = handle.join();
        }
        tracing::info!("worker pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_worker_locked(shared: &Arc<PoolShared>, state: &mut PoolState) {
    state.next_worker_seq += 1;
    let id = format!("worker-{}", state.next_worker_seq);
    let engine = InferenceEngine::new(&shared.config.engine);
    let backends = engine.snapshot();
    let memory = Arc::new(Mutex::new(PatternMemory::new(&id, &shared.config.memory)));
    let (sender, receiver) = mpsc::channel();

    let thread_shared = Arc::clone(shared);
    let thread_memory = Arc::clone(&memory);
    let thread_id = id.clone();
    let handle = std::thread::Builder::new()
        .name(id.clone())
        .spawn(move || worker_loop(thread_shared, thread_id, engine, thread_memory, receiver))
        .expect("spawn worker thread");

    tracing::info!(worker = %id, "worker started");
    state.workers.push(WorkerEntry {
        id,
        sender,
        handle: Some(handle),
        memory,
        active_tasks: 0,
        completed_tasks: 0,
        failed_tasks: 0,
        last_used_at: Instant::now(),
        current_backend: None,
        backends,
    });
}

fn retire_worker_locked(state: &mut PoolState, idx: usize) {
    let mut worker = state.workers.remove(idx);
    tracing::info!(worker = %worker.id, "worker retired");
    let _ = worker.sender.send(WorkerMsg::Stop);
    if let Some(handle) = worker.handle.take() {
        state.retired.push(handle);
    }
}

/// Hand queued tasks to idle workers, least-recently-used worker first,
/// until the queue or the idle set runs out.
fn dispatch_locked(state: &mut PoolState) {
    loop {
        while matches!(
            state.queue.front(),
            Some(q) if q.shared.settled.load(Ordering::SeqCst)
        ) {
            state.queue.pop_front();
        }
        if state.queue.is_empty() {
            return;
        }
        let Some(idx) = state
            .workers
            .iter()
            .enumerate()
            .filter(|(_, w)| w.active_tasks == 0)
            .min_by_key(|(_, w)| w.last_used_at)
            .map(|(i, _)| i)
        else {
            return;
        };
        let item = state.queue.pop_front().expect("queue head present");
        let send_result = {
            let worker = &mut state.workers[idx];
            worker.active_tasks = 1;
            worker.last_used_at = Instant::now();
            worker.sender.send(WorkerMsg::Run(item))
        };
        if let Err(mpsc::SendError(WorkerMsg::Run(item))) = send_result {
            let removed = state.workers.remove(idx);
            tracing::error!(worker = %removed.id, "worker channel closed, requeueing task");
            state.queue.push_front(item);
        }
    }
}

fn settle_locked(state: &mut PoolState, task_id: TaskId, settlement: Settlement) {
    // The pending-map removal is the settle-exactly-once latch; late
    // arrivals find nothing and change no counters.
    let Some(pending) = state.pending.remove(&task_id) else {
        return;
    };
    pending.shared.settled.store(true, Ordering::SeqCst);
    state.queue.retain(|q| q.shared.id != task_id);

    let outcome = match settlement {
        Settlement::Success {
            worker_id,
            generation,
        } => {
            state.completed_tasks += 1;
            Ok(TaskResult {
                task_id,
                worker_id,
                generation,
            })
        }
        Settlement::Timeout => {
            state.timed_out_tasks += 1;
            state.cancelled_tasks += 1;
            Err(TaskError::Timeout {
                timeout_ms: pending.shared.timeout_ms,
            })
        }
        Settlement::Cancelled => {
            state.cancelled_tasks += 1;
            Err(TaskError::Cancelled)
        }
        Settlement::Backend { message } => {
            state.failed_tasks += 1;
            Err(TaskError::Backend { message })
        }
    };
    let _ = pending.sender.send(outcome);
}

fn maybe_scale_down_locked(config: &PoolConfig, state: &mut PoolState) {
    let now = Instant::now();
    while state.workers.len() > config.min_workers {
        let idx = state
            .workers
            .iter()
            .enumerate()
            .filter(|(_, w)| {
                w.active_tasks == 0 && now.duration_since(w.last_used_at) > IDLE_THRESHOLD
            })
            .min_by_key(|(_, w)| w.last_used_at)
            .map(|(i, _)| i);
        let Some(idx) = idx else { return };
        retire_worker_locked(state, idx);
    }
}

fn status_locked(state: &PoolState, config: &PoolConfig) -> PoolStatus {
    let now = Instant::now();
    let mut workers_by_backend: BTreeMap<String, usize> = BTreeMap::new();
    for worker in &state.workers {
        let key = worker
            .current_backend
            .map(|b| b.as_str().to_string())
            .unwrap_or_else(|| "unassigned".to_string());
        *workers_by_backend.entry(key).or_insert(0) += 1;
    }
    PoolStatus {
        workers: state.workers.len(),
        min_workers: config.min_workers,
        max_workers: config.max_workers,
        queue_length: state
            .queue
            .iter()
            .filter(|q| !q.shared.settled.load(Ordering::SeqCst))
            .count(),
        in_flight: state.workers.iter().filter(|w| w.active_tasks > 0).count(),
        submitted_tasks: state.submitted_tasks,
        completed_tasks: state.completed_tasks,
        failed_tasks: state.failed_tasks,
        cancelled_tasks: state.cancelled_tasks,
        timed_out_tasks: state.timed_out_tasks,
        rejected_tasks: state.rejected_tasks,
        workers_by_backend,
        worker_stats: state
            .workers
            .iter()
            .map(|w| WorkerStatus {
                id: w.id.clone(),
                active_tasks: w.active_tasks,
                completed_tasks: w.completed_tasks,
                failed_tasks: w.failed_tasks,
                idle_ms: now.duration_since(w.last_used_at).as_millis() as u64,
                backend: w.current_backend,
                backends: w.backends.clone(),
            })
            .collect(),
    }
}

fn worker_loop(
    shared: Arc<PoolShared>,
    worker_id: String,
    mut engine: InferenceEngine,
    memory: Arc<Mutex<PatternMemory>>,
    receiver: mpsc::Receiver<WorkerMsg>,
) {
    loop {
        match receiver.recv() {
            Ok(WorkerMsg::Run(task)) => {
                if task.shared.settled.load(Ordering::SeqCst) {
                    finish_assignment(&shared, &worker_id, None, &engine);
                    continue;
                }
                let request = task.request;
                let original = request.instruction.clone();
                let rewritten = memory
                    .lock()
                    .expect("memory lock poisoned")
                    .rewrite(
                        &original,
                        request.task_type.as_str(),
                        request.language.as_deref(),
                    );
                let started = Instant::now();
                let result = engine.generate(&request, &rewritten, &task.shared.token);
                let latency_ms = started.elapsed().as_millis() as u64;

                let interaction = (!matches!(result, Err(EngineError::Cancelled))).then(|| {
                    let (response, success, prompt_tokens, completion_tokens) = match &result {
                        Ok(generation) => (
                            generation.text.clone(),
                            true,
                            generation.prompt_tokens,
                            generation.completion_tokens,
                        ),
                        Err(err) => (err.to_string(), false, None, None),
                    };
                    Interaction {
                        task_type: request.task_type.as_str().to_string(),
                        language: request.language.clone(),
                        file_path: request.file_path.clone(),
                        instruction: original,
                        response,
                        success,
                        latency_ms,
                        prompt_tokens,
                        completion_tokens,
                    }
                });

                let settled_here = finish_assignment(
                    &shared,
                    &worker_id,
                    Some((task.shared.id, result)),
                    &engine,
                );
                // Only outcomes the caller observed train the memory. A
                // slow backend answer that raced a timeout or shutdown is
                // discarded here exactly like its counters were.
                if settled_here {
                    if let Some(interaction) = interaction {
                        memory
                            .lock()
                            .expect("memory lock poisoned")
                            .record(&interaction);
                    }
                }
            }
            Ok(WorkerMsg::Stop) | Err(_) => break,
        }
    }
    memory.lock().expect("memory lock poisoned").flush();
    tracing::info!(worker = %worker_id, "worker stopped");
}

/// Mark the worker idle, settle its task if it is still pending, and run a
/// dispatch pass. Returns whether this worker's result is what settled the
/// task; a result that arrived after a timeout or shutdown settlement is
/// discarded without touching any counter.
fn finish_assignment(
    shared: &Arc<PoolShared>,
    worker_id: &str,
    done: Option<(TaskId, Result<Generation, EngineError>)>,
    engine: &InferenceEngine,
) -> bool {
    let mut state = shared.state.lock().expect("pool state lock poisoned");
    let mut settled_here = false;
    if let Some((task_id, result)) = done {
        let still_pending = state.pending.contains_key(&task_id);
        match result {
            Ok(generation) => {
                let backend = generation.backend;
                if still_pending {
                    if let Some(worker) = worker_mut(&mut state, worker_id) {
                        worker.completed_tasks += 1;
                    }
                    settle_locked(
                        &mut state,
                        task_id,
                        Settlement::Success {
                            worker_id: worker_id.to_string(),
                            generation,
                        },
                    );
                    settled_here = true;
                }
                if let Some(worker) = worker_mut(&mut state, worker_id) {
                    worker.current_backend = Some(backend);
                }
            }
            Err(EngineError::Cancelled) => {
                settle_locked(&mut state, task_id, Settlement::Cancelled);
            }
            Err(err) => {
                if still_pending {
                    if let Some(worker) = worker_mut(&mut state, worker_id) {
                        worker.failed_tasks += 1;
                    }
                    settle_locked(
                        &mut state,
                        task_id,
                        Settlement::Backend {
                            message: err.to_string(),
                        },
                    );
                    settled_here = true;
                }
            }
        }
    }
    if let Some(worker) = worker_mut(&mut state, worker_id) {
        worker.active_tasks = 0;
        worker.last_used_at = Instant::now();
        worker.backends = engine.snapshot();
        if worker.current_backend.is_none() {
            worker.current_backend = engine.active_backend();
        }
    }
    dispatch_locked(&mut state);
    maybe_scale_down_locked(&shared.config, &mut state);
    settled_here
}

fn worker_mut<'a>(state: &'a mut PoolState, worker_id: &str) -> Option<&'a mut WorkerEntry> {
    state.workers.iter_mut().find(|w| w.id == worker_id)
}

fn housekeeping_loop(shared: Arc<PoolShared>) {
    let mut state = shared.state.lock().expect("pool state lock poisoned");
    loop {
        if state.shutting_down {
            return;
        }
        let now = Instant::now();
        let expired: Vec<TaskId> = state
            .pending
            .values()
            .filter(|p| !p.shared.settled.load(Ordering::SeqCst) && now >= p.shared.deadline)
            .map(|p| p.shared.id)
            .collect();
        for task_id in expired {
            if let Some(pending) = state.pending.get(&task_id) {
                pending.shared.token.cancel();
            }
            tracing::debug!(task = task_id, "task deadline expired");
            settle_locked(&mut state, task_id, Settlement::Timeout);
        }
        maybe_scale_down_locked(&shared.config, &mut state);

        let wait = state
            .pending
            .values()
            .map(|p| p.shared.deadline.saturating_duration_since(now))
            .min()
            .unwrap_or(HEARTBEAT)
            .min(HEARTBEAT)
            .max(Duration::from_millis(1));
        let (next, _) = shared
            .housekeeping
            .wait_timeout(state, wait)
            .expect("pool state lock poisoned");
        state = next;
    }
}
