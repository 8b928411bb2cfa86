//! Single persistent background worker running one task on demand.
//!
//! [`AsyncTaskRunner::trigger_once`] requests one execution. Triggers that
//! arrive while a run is pending coalesce into that run; a trigger that
//! arrives while a run is in progress schedules exactly one more. Task
//! failures (errors and panics) go to [`Task::on_error`] and the worker
//! keeps waiting for the next trigger.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::Result;
use crate::error::ShmError;

/// Work executed by an [`AsyncTaskRunner`].
pub trait Task: Send + 'static {
    /// Execute one run.
    fn run(&mut self) -> Result<()>;

    /// Report a failed run. Receives a diagnostic message.
    fn on_error(&mut self, message: &str);
}

#[derive(Debug, Default)]
struct State {
    pending: bool,
    running: bool,
    shutdown: bool,
    runs: u64,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    wake: Condvar,
    idle: Condvar,
}

/// Owner of the background worker thread.
pub struct AsyncTaskRunner {
    name: String,
    shared: Arc<Shared>,
    task: Option<Box<dyn Task>>,
    handle: Option<JoinHandle<()>>,
}

impl AsyncTaskRunner {
    /// Create a runner; the worker thread starts with [`async_start`](Self::async_start).
    pub fn new(name: impl Into<String>, task: impl Task) -> Self {
        Self {
            name: name.into(),
            shared: Arc::new(Shared::default()),
            task: Some(Box::new(task)),
            handle: None,
        }
    }

    /// Spawn the worker. Calling it again while running is a no-op.
    pub fn async_start(&mut self) -> Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }
        if self.shared.state.lock().shutdown {
            return Err(ShmError::Closed);
        }
        let task = self.task.take().ok_or(ShmError::Closed)?;

        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || worker(&shared, task))
            .map_err(|e| ShmError::Runner(format!("failed to spawn {}: {e}", self.name)))?;

        tracing::debug!(worker = %self.name, "background worker started");
        self.handle = Some(handle);
        Ok(())
    }

    /// Request one execution of the task.
    ///
    /// Returns `false` once the runner has been stopped.
    pub fn trigger_once(&self) -> bool {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return false;
        }
        state.pending = true;
        self.shared.wake.notify_one();
        true
    }

    /// Stop the worker and join it.
    ///
    /// Any in-flight run completes first; pending triggers are dropped.
    /// Safe to call repeatedly and before `async_start`.
    pub fn async_stop(&mut self) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            state.pending = false;
            self.shared.wake.notify_all();
        }
        self.task = None;

        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        handle
            .join()
            .map_err(|_| ShmError::Runner(format!("{} panicked outside its task", self.name)))?;
        tracing::debug!(worker = %self.name, "background worker stopped");
        Ok(())
    }

    /// Block until no run is pending or in progress, up to `timeout`.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while (state.pending || state.running) && !state.shutdown {
            if self.shared.idle.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        !(state.pending || state.running)
    }

    /// Number of completed runs (successful or not).
    pub fn runs(&self) -> u64 {
        self.shared.state.lock().runs
    }

    /// Whether the worker thread is alive.
    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Worker thread name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for AsyncTaskRunner {
    fn drop(&mut self) {
        if let Err(err) = self.async_stop() {
            tracing::warn!(worker = %self.name, error = %err, "failed to stop background worker");
        }
    }
}

impl std::fmt::Debug for AsyncTaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncTaskRunner")
            .field("name", &self.name)
            .field("running", &self.handle.is_some())
            .field("state", &*self.shared.state.lock())
            .finish()
    }
}

fn worker(shared: &Shared, mut task: Box<dyn Task>) {
    loop {
        {
            let mut state = shared.state.lock();
            while !state.pending && !state.shutdown {
                shared.wake.wait(&mut state);
            }
            if state.shutdown {
                break;
            }
            state.pending = false;
            state.running = true;
        }

        match panic::catch_unwind(AssertUnwindSafe(|| task.run())) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => task.on_error(&err.to_string()),
            Err(payload) => task.on_error(&panic_message(payload.as_ref())),
        }

        let mut state = shared.state.lock();
        state.running = false;
        state.runs += 1;
        shared.idle.notify_all();
    }

    let mut state = shared.state.lock();
    state.running = false;
    shared.idle.notify_all();
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("task panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("task panicked: {msg}")
    } else {
        "task panicked".to_string()
    }
}
