//! Progress reporting for chunked work.
//!
//! Reporters are passed explicitly to every operation that reports progress;
//! there is no global progress state.

use crossbeam::channel::{self, Receiver};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

/// Receives progress from planners, executors and runners.
///
/// `begin`/`end` pairs nest: a task begun while another is running is a
/// subtask, and `advance` always counts against the innermost open task.
/// `advance` may be called concurrently from worker threads.
pub trait ProgressReporter: Send + Sync {
    /// A task named `task` with `total_steps` steps has started.
    fn begin(&self, task: &str, total_steps: usize);

    /// `steps` more steps of the innermost task completed.
    fn advance(&self, steps: usize);

    /// The innermost task finished.
    fn end(&self);

    /// A fatal error occurred.
    fn error(&self, _message: &str) {}

    /// Whether the caller asked for cooperative cancellation.
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Reporter that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullProgress;

impl ProgressReporter for NullProgress {
    fn begin(&self, _task: &str, _total_steps: usize) {}
    fn advance(&self, _steps: usize) {}
    fn end(&self) {}
}

/// A progress update event.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressUpdate {
    /// A task has started.
    Started {
        task: String,
        total_steps: usize,
    },
    /// Overall progress of the current task.
    Progress {
        task: String,
        completed: usize,
        total: usize,
        elapsed_ms: u64,
        estimated_remaining_ms: Option<u64>,
    },
    /// The current task has completed.
    Completed {
        task: String,
        steps: usize,
        duration_ms: u64,
    },
    /// Cancellation was requested.
    Cancelled,
    /// An error occurred.
    Error {
        message: String,
    },
}

/// Callback type for progress updates.
pub type ProgressCallback = Box<dyn Fn(ProgressUpdate) + Send + Sync>;

#[derive(Debug)]
struct TaskState {
    name: String,
    total_steps: usize,
    completed: usize,
    start_time: Instant,
}

impl TaskState {
    fn new(name: &str, total_steps: usize) -> Self {
        Self {
            name: name.to_string(),
            total_steps,
            completed: 0,
            start_time: Instant::now(),
        }
    }
}

#[derive(Debug)]
struct Tasks {
    /// Open tasks, innermost last.
    open: Vec<TaskState>,
    /// Most recently finished task.
    last: TaskState,
}

impl Tasks {
    fn current(&self) -> &TaskState {
        self.open.last().unwrap_or(&self.last)
    }
}

/// Tracks task progress and allows cancellation.
pub struct ProgressTracker {
    /// Open and finished tasks.
    tasks: Mutex<Tasks>,
    /// Whether cancellation was requested.
    cancelled: AtomicBool,
    /// Progress callback.
    callback: Option<ProgressCallback>,
}

impl ProgressTracker {
    /// Create a new progress tracker.
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(Tasks {
                open: Vec::new(),
                last: TaskState::new("Task", 0),
            }),
            cancelled: AtomicBool::new(false),
            callback: None,
        }
    }

    /// Set a callback for progress updates.
    pub fn with_callback(mut self, callback: ProgressCallback) -> Self {
        self.callback = Some(callback);
        self
    }

    /// Create a tracker whose updates are delivered over a channel, for
    /// consumers on another thread.
    pub fn channel() -> (Self, Receiver<ProgressUpdate>) {
        let (sender, receiver) = channel::unbounded();
        let tracker = Self::new().with_callback(Box::new(move |update| {
            // A dropped receiver only means nobody is listening any more.
            let _ = sender.send(update);
        }));
        (tracker, receiver)
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
        self.send_update(ProgressUpdate::Cancelled);
    }

    /// Name of the innermost open task, or of the last finished one.
    pub fn current_task(&self) -> String {
        self.tasks.lock().current().name.clone()
    }

    /// Number of tasks currently open.
    pub fn depth(&self) -> usize {
        self.tasks.lock().open.len()
    }

    /// Steps completed in the innermost open task, or in the last finished
    /// one when none is open.
    pub fn completed_steps(&self) -> usize {
        self.tasks.lock().current().completed
    }

    /// Get current progress in the range 0.0 - 1.0.
    pub fn completion(&self) -> f32 {
        let tasks = self.tasks.lock();
        let task = tasks.current();
        if task.total_steps == 0 {
            return 1.0;
        }
        (task.completed as f32 / task.total_steps as f32).min(1.0)
    }

    /// Estimate remaining time in milliseconds.
    pub fn estimated_remaining_ms(&self) -> Option<u64> {
        estimate_remaining(self.tasks.lock().current())
    }

    fn send_update(&self, update: ProgressUpdate) {
        if let Some(ref callback) = self.callback {
            callback(update);
        }
    }
}

fn estimate_remaining(task: &TaskState) -> Option<u64> {
    if task.completed == 0 {
        return None;
    }
    let elapsed = task.start_time.elapsed().as_millis() as u64;
    let remaining = task.total_steps.saturating_sub(task.completed) as u64;
    Some(elapsed / task.completed as u64 * remaining)
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter for ProgressTracker {
    fn begin(&self, task: &str, total_steps: usize) {
        self.tasks.lock().open.push(TaskState::new(task, total_steps));
        self.send_update(ProgressUpdate::Started {
            task: task.to_string(),
            total_steps,
        });
    }

    fn advance(&self, steps: usize) {
        let update = {
            let mut tasks = self.tasks.lock();
            let Some(task) = tasks.open.last_mut() else {
                return;
            };
            task.completed += steps;
            ProgressUpdate::Progress {
                task: task.name.clone(),
                completed: task.completed,
                total: task.total_steps,
                elapsed_ms: task.start_time.elapsed().as_millis() as u64,
                estimated_remaining_ms: estimate_remaining(task),
            }
        };
        self.send_update(update);
    }

    fn end(&self) {
        let update = {
            let mut tasks = self.tasks.lock();
            let Some(task) = tasks.open.pop() else {
                return;
            };
            let update = ProgressUpdate::Completed {
                task: task.name.clone(),
                steps: task.completed,
                duration_ms: task.start_time.elapsed().as_millis() as u64,
            };
            tasks.last = task;
            update
        };
        self.send_update(update);
    }

    fn error(&self, message: &str) {
        self.send_update(ProgressUpdate::Error {
            message: message.to_string(),
        });
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}
