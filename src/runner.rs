//! Background task runner.
//!
//! Blocking work runs on a fixed set of worker threads. Each finished task
//! turns into a continuation that is posted to a [`UiQueue`]; the thread that
//! owns the UI state drains that queue, so continuations never run
//! concurrently with one another.

use std::{
    any::Any,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError, Sender},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use thiserror::Error;
use tracing::{debug, warn};

/// Closure executed on the UI thread with exclusive access to the UI state.
pub type Continuation<C> = Box<dyn FnOnce(&mut C) + Send + 'static>;

type Job = Box<dyn FnOnce() + Send + 'static>;
type SuccessFn<C, T> = Box<dyn FnOnce(&mut C, T) + Send + 'static>;
type ErrorFn<C> = Box<dyn FnOnce(&mut C, TaskError) + Send + 'static>;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
    #[error("task panicked: {0}")]
    Panicked(String),
}

/// Result of a background call, as seen by the UI thread.
#[derive(Debug)]
pub enum TaskOutcome<T> {
    Succeeded(T),
    Failed(TaskError),
}

impl<T> TaskOutcome<T> {
    fn from_run(work: impl FnOnce() -> anyhow::Result<T>) -> Self {
        match panic::catch_unwind(AssertUnwindSafe(work)) {
            Ok(Ok(value)) => Self::Succeeded(value),
            Ok(Err(err)) => Self::Failed(TaskError::Failed(err)),
            Err(payload) => Self::Failed(TaskError::Panicked(panic_message(payload.as_ref()))),
        }
    }
}

/// A unit of blocking work plus its two continuations.
pub struct TaskRequest<C, T> {
    label: String,
    work: Box<dyn FnOnce() -> anyhow::Result<T> + Send + 'static>,
    on_success: Option<SuccessFn<C, T>>,
    on_error: Option<ErrorFn<C>>,
    show_loading: bool,
}

impl<C, T> TaskRequest<C, T>
where
    C: 'static,
    T: Send + 'static,
{
    pub fn new<F>(label: impl Into<String>, work: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        Self {
            label: label.into(),
            work: Box::new(work),
            on_success: None,
            on_error: None,
            show_loading: true,
        }
    }

    pub fn on_success<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&mut C, T) + Send + 'static,
    {
        self.on_success = Some(Box::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&mut C, TaskError) + Send + 'static,
    {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn quiet(mut self) -> Self {
        self.show_loading = false;
        self
    }
}

/// Producer side of the UI queue. Cheap to clone.
pub struct UiSender<C> {
    tx: Sender<Continuation<C>>,
}

impl<C> Clone for UiSender<C> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<C: 'static> UiSender<C> {
    /// Queues `f` for the UI thread. Returns false once the queue is gone.
    pub fn post<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut C) + Send + 'static,
    {
        self.tx.send(Box::new(f)).is_ok()
    }
}

/// Consumer side of the UI queue, owned by the UI thread.
pub struct UiQueue<C> {
    rx: Receiver<Continuation<C>>,
}

impl<C> UiQueue<C> {
    /// Runs every continuation that is already queued.
    pub fn pump(&self, ctx: &mut C) -> usize {
        let mut ran = 0;
        while let Ok(continuation) = self.rx.try_recv() {
            continuation(ctx);
            ran += 1;
        }
        ran
    }

    /// Waits up to `timeout` for the first continuation, then drains the rest.
    pub fn wait_and_pump(&self, ctx: &mut C, timeout: Duration) -> usize {
        match self.rx.recv_timeout(timeout) {
            Ok(continuation) => {
                continuation(ctx);
                1 + self.pump(ctx)
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => 0,
        }
    }
}

pub fn ui_channel<C>() -> (UiSender<C>, UiQueue<C>) {
    let (tx, rx) = mpsc::channel();
    (UiSender { tx }, UiQueue { rx })
}

struct RunnerInner<C> {
    jobs: Mutex<Option<Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    ui: UiSender<C>,
    loading: Arc<AtomicUsize>,
}

/// Bounded worker pool delivering completions to a [`UiQueue`].
pub struct TaskRunner<C> {
    inner: Arc<RunnerInner<C>>,
}

impl<C> Clone for TaskRunner<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: 'static> TaskRunner<C> {
    /// Starts `workers` threads and returns the runner with a fresh UI queue.
    pub fn new(workers: usize) -> (Self, UiQueue<C>) {
        let (ui, queue) = ui_channel();
        (Self::with_ui(workers, ui), queue)
    }

    /// Starts a runner that posts completions through an existing UI sender.
    pub fn with_ui(workers: usize, ui: UiSender<C>) -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let handles = (0..workers.max(1))
            .map(|index| {
                let rx = Arc::clone(&rx);
                thread::Builder::new()
                    .name(format!("launcher-worker-{index}"))
                    .spawn(move || worker_loop(rx))
            })
            .filter_map(|spawned| match spawned {
                Ok(handle) => Some(handle),
                Err(err) => {
                    warn!(error = %err, "failed to spawn worker thread");
                    None
                }
            })
            .collect::<Vec<_>>();
        debug!(workers = handles.len(), "task runner started");

        Self {
            inner: Arc::new(RunnerInner {
                jobs: Mutex::new(Some(tx)),
                workers: Mutex::new(handles),
                ui,
                loading: Arc::new(AtomicUsize::new(0)),
            }),
        }
    }

    pub fn ui(&self) -> UiSender<C> {
        self.inner.ui.clone()
    }

    /// True while at least one loading-flagged task has not delivered its
    /// continuation yet.
    pub fn is_loading(&self) -> bool {
        self.inner.loading.load(Ordering::SeqCst) > 0
    }

    /// Queues `request`. Returns false after [`TaskRunner::shutdown`].
    pub fn submit<T>(&self, request: TaskRequest<C, T>) -> bool
    where
        T: Send + 'static,
    {
        let TaskRequest {
            label,
            work,
            on_success,
            on_error,
            show_loading,
        } = request;

        let loading = Arc::clone(&self.inner.loading);
        if show_loading {
            loading.fetch_add(1, Ordering::SeqCst);
        }
        let ui = self.inner.ui.clone();
        let job: Job = Box::new(move || {
            let outcome = TaskOutcome::from_run(work);
            let delivered = ui.post(move |ctx: &mut C| {
                if show_loading {
                    loading.fetch_sub(1, Ordering::SeqCst);
                }
                deliver(ctx, &label, outcome, on_success, on_error);
            });
            if !delivered {
                debug!("ui queue closed; dropping task completion");
            }
        });

        let sent = match self.inner.jobs.lock() {
            Ok(guard) => guard.as_ref().map(|tx| tx.send(job).is_ok()).unwrap_or(false),
            Err(_) => false,
        };
        if !sent && show_loading {
            self.inner.loading.fetch_sub(1, Ordering::SeqCst);
        }
        sent
    }

    /// Stops accepting work and joins the workers once queued jobs finish.
    pub fn shutdown(&self) {
        if let Ok(mut guard) = self.inner.jobs.lock() {
            guard.take();
        }
        let handles = match self.inner.workers.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            let _ = handle.join();
        }
    }
}

fn worker_loop(rx: Arc<Mutex<Receiver<Job>>>) {
    loop {
        let job = match rx.lock() {
            Ok(guard) => guard.recv(),
            Err(_) => return,
        };
        match job {
            Ok(job) => job(),
            Err(_) => return,
        }
    }
}

fn deliver<C, T>(
    ctx: &mut C,
    label: &str,
    outcome: TaskOutcome<T>,
    on_success: Option<SuccessFn<C, T>>,
    on_error: Option<ErrorFn<C>>,
) {
    match outcome {
        TaskOutcome::Succeeded(value) => {
            if let Some(on_success) = on_success {
                on_success(ctx, value);
            }
        }
        TaskOutcome::Failed(err) => match on_error {
            Some(on_error) => on_error(ctx, err),
            None => warn!(task = label, error = %err, "background task failed"),
        },
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic payload unavailable".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use serde_json::{Value, json};

    #[derive(Default)]
    struct Recorder {
        successes: Vec<Value>,
        errors: Vec<String>,
    }

    fn drain_until(queue: &UiQueue<Recorder>, ctx: &mut Recorder, expected: usize) {
        let mut seen = 0;
        for _ in 0..50 {
            seen += queue.wait_and_pump(ctx, Duration::from_millis(100));
            if seen >= expected {
                break;
            }
        }
    }

    #[test]
    fn success_continuation_receives_value_once() {
        let (runner, queue) = TaskRunner::<Recorder>::new(2);
        let mut ctx = Recorder::default();
        runner.submit(
            TaskRequest::new("fetch", || Ok(json!({"id": 7})))
                .on_success(|ctx: &mut Recorder, value| ctx.successes.push(value))
                .on_error(|ctx: &mut Recorder, err| ctx.errors.push(err.to_string())),
        );

        drain_until(&queue, &mut ctx, 1);
        runner.shutdown();
        queue.pump(&mut ctx);

        assert_eq!(ctx.successes, vec![json!({"id": 7})]);
        assert!(ctx.errors.is_empty());
    }

    #[test]
    fn failing_task_only_hits_error_continuation() {
        let (runner, queue) = TaskRunner::<Recorder>::new(1);
        let mut ctx = Recorder::default();
        runner.submit(
            TaskRequest::new("boom", || -> anyhow::Result<Value> { Err(anyhow!("denied")) })
                .on_success(|ctx: &mut Recorder, value| ctx.successes.push(value))
                .on_error(|ctx: &mut Recorder, err| ctx.errors.push(err.to_string())),
        );

        drain_until(&queue, &mut ctx, 1);
        runner.shutdown();
        queue.pump(&mut ctx);

        assert!(ctx.successes.is_empty());
        assert_eq!(ctx.errors, vec!["denied".to_string()]);
    }

    #[test]
    fn panicking_task_is_reported_as_error() {
        let (runner, queue) = TaskRunner::<Recorder>::new(1);
        let mut ctx = Recorder::default();
        runner.submit(
            TaskRequest::new("panics", || -> anyhow::Result<Value> { panic!("worker bug") })
                .on_error(|ctx: &mut Recorder, err| ctx.errors.push(err.to_string())),
        );

        drain_until(&queue, &mut ctx, 1);
        runner.shutdown();
        assert_eq!(ctx.errors, vec!["task panicked: worker bug".to_string()]);
    }

    #[test]
    fn missing_error_handler_is_swallowed() {
        let (runner, queue) = TaskRunner::<Recorder>::new(1);
        let mut ctx = Recorder::default();
        runner.submit(TaskRequest::new("unhandled", || -> anyhow::Result<()> {
            Err(anyhow!("offline"))
        }));
        drain_until(&queue, &mut ctx, 1);
        runner.shutdown();
        assert!(ctx.errors.is_empty());
        assert!(!runner.is_loading());
    }

    #[test]
    fn loading_flag_clears_when_continuation_runs() {
        let (runner, queue) = TaskRunner::<Recorder>::new(1);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let mut ctx = Recorder::default();
        runner.submit(TaskRequest::new("slow", move || {
            let _ = release_rx.recv_timeout(Duration::from_secs(5));
            Ok(json!(null))
        }));
        assert!(runner.is_loading());

        release_tx.send(()).unwrap();
        drain_until(&queue, &mut ctx, 1);
        assert!(!runner.is_loading());
        runner.shutdown();
    }

    #[test]
    fn submit_after_shutdown_is_rejected() {
        let (runner, _queue) = TaskRunner::<Recorder>::new(1);
        runner.shutdown();
        assert!(!runner.submit(TaskRequest::new("late", || Ok(()))));
        assert!(!runner.is_loading());
    }
}
