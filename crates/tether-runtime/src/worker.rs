//! Workers
//!
//! A worker runs on its own OS thread and talks to its creator through two
//! [`MessageQueue`]s carrying JSON values. The process-wide
//! [`WorkerRegistry`] maps worker ids to their shared state.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use serde_json::{Map, Number, Value};

use crate::script::{ScriptObject, ScriptValue};

// ============================================================================
// Message queue
// ============================================================================

struct QueueState<T> {
    messages: VecDeque<T>,
    terminated: bool,
}

/// Blocking FIFO with an explicit terminate signal
pub struct MessageQueue<T> {
    state: Mutex<QueueState<T>>,
    ready: Condvar,
}

impl<T> Default for MessageQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MessageQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                messages: VecDeque::new(),
                terminated: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// Enqueue a message. Returns false once terminated.
    pub fn push(&self, message: T) -> bool {
        let mut state = self.state.lock();
        if state.terminated {
            return false;
        }
        state.messages.push_back(message);
        self.ready.notify_one();
        true
    }

    /// Wait for the next message. `None` after termination.
    pub fn pop(&self) -> Option<T> {
        let mut state = self.state.lock();
        loop {
            if state.terminated {
                return None;
            }
            if let Some(message) = state.messages.pop_front() {
                return Some(message);
            }
            self.ready.wait(&mut state);
        }
    }

    /// Wait at most `timeout` for a message
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.terminated {
                return None;
            }
            if let Some(message) = state.messages.pop_front() {
                return Some(message);
            }
            if self.ready.wait_until(&mut state, deadline).timed_out() {
                return state.messages.pop_front();
            }
        }
    }

    /// Stop the queue and wake every waiter
    pub fn terminate(&self) {
        let mut state = self.state.lock();
        state.terminated = true;
        state.messages.clear();
        self.ready.notify_all();
    }

    pub fn is_terminated(&self) -> bool {
        self.state.lock().terminated
    }

    pub fn len(&self) -> usize {
        self.state.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Worker state
// ============================================================================

/// State shared between a worker's thread and its creator
pub struct WorkerState {
    id: u64,
    running: AtomicBool,
    /// Creator → worker
    inbox: MessageQueue<Value>,
    /// Worker → creator
    outbox: MessageQueue<Value>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerState {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn post_message(&self, message: Value) -> bool {
        self.inbox.push(message)
    }

    /// Next message from the worker, waiting at most `timeout`
    pub fn receive_message(&self, timeout: Duration) -> Option<Value> {
        self.outbox.pop_timeout(timeout)
    }

    /// Stop message processing. A call already running on the worker thread
    /// is not interrupted.
    pub fn terminate(&self) {
        self.inbox.terminate();
    }

    /// Wait for the worker thread to finish
    pub fn join(&self) {
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                log::warn!("worker {} panicked", self.id);
            }
        }
    }
}

impl std::fmt::Debug for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerState")
            .field("id", &self.id)
            .field("running", &self.is_running())
            .finish()
    }
}

/// The worker side of the queues
pub struct WorkerScope {
    state: Arc<WorkerState>,
}

impl WorkerScope {
    pub fn id(&self) -> u64 {
        self.state.id
    }

    /// Wait for the next message; `None` once terminated
    pub fn recv(&self) -> Option<Value> {
        self.state.inbox.pop()
    }

    pub fn post(&self, message: Value) -> bool {
        self.state.outbox.push(message)
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Process-wide map from worker id to worker state
pub struct WorkerRegistry {
    workers: Mutex<FxHashMap<u64, Arc<WorkerState>>>,
    next_id: AtomicU64,
}

static REGISTRY: Lazy<WorkerRegistry> = Lazy::new(|| WorkerRegistry {
    workers: Mutex::new(FxHashMap::default()),
    next_id: AtomicU64::new(1),
});

impl WorkerRegistry {
    pub fn global() -> &'static WorkerRegistry {
        &REGISTRY
    }

    /// Start `entry` on a new thread
    pub fn spawn<F>(&self, entry: F) -> std::io::Result<Arc<WorkerState>>
    where
        F: FnOnce(WorkerScope) + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let state = Arc::new(WorkerState {
            id,
            running: AtomicBool::new(true),
            inbox: MessageQueue::new(),
            outbox: MessageQueue::new(),
            thread: Mutex::new(None),
        });

        let scope = WorkerScope { state: state.clone() };
        let handle = std::thread::Builder::new()
            .name(format!("tether-worker-{}", id))
            .spawn(move || {
                log::debug!("worker {} started", id);
                let state = scope.state.clone();
                entry(scope);
                state.running.store(false, Ordering::Release);
                log::debug!("worker {} stopped", id);
            })?;
        *state.thread.lock() = Some(handle);

        self.workers.lock().insert(id, state.clone());
        Ok(state)
    }

    pub fn get(&self, id: u64) -> Option<Arc<WorkerState>> {
        self.workers.lock().get(&id).cloned()
    }

    pub fn remove(&self, id: u64) -> Option<Arc<WorkerState>> {
        self.workers.lock().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Message conversion
// ============================================================================

/// Plain data of a script value; wrapped native values do not cross threads
pub fn to_message(value: &ScriptValue) -> Value {
    match value {
        ScriptValue::Undefined | ScriptValue::Null => Value::Null,
        ScriptValue::Bool(b) => Value::Bool(*b),
        ScriptValue::Number(n) => Number::from_f64(*n).map(Value::Number).unwrap_or(Value::Null),
        ScriptValue::String(s) => Value::String(s.to_string()),
        ScriptValue::Object(object) if object.is_array() => {
            Value::Array(object.elements().iter().map(to_message).collect())
        }
        ScriptValue::Object(object) if object.wrapper().is_none() && !object.is_callable() => {
            let mut map = Map::new();
            for key in object.keys() {
                if let Some(value) = object.own_value(&key) {
                    map.insert(key, to_message(&value));
                }
            }
            Value::Object(map)
        }
        ScriptValue::Object(_) => Value::Null,
    }
}

pub fn from_message(message: &Value) -> ScriptValue {
    match message {
        Value::Null => ScriptValue::Null,
        Value::Bool(b) => ScriptValue::Bool(*b),
        Value::Number(n) => ScriptValue::Number(n.as_f64().unwrap_or(f64::NAN)),
        Value::String(s) => ScriptValue::string(s),
        Value::Array(items) => {
            ScriptValue::Object(ScriptObject::array(items.iter().map(from_message).collect()))
        }
        Value::Object(map) => ScriptValue::Object(ScriptObject::from_entries(
            map.iter().map(|(k, v)| (k.clone(), from_message(v))),
        )),
    }
}
