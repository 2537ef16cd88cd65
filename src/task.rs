//! # Task — Resumable Long-Running Computations
//!
//! Every heavy computation (an exponentiation, a proof fold, a Lucas chain)
//! is a task: a `setup → execute → release` loop with restart accounting
//! and at-most-one-forward-progress durability. `execute` commits after
//! every inner step; commits persist to the task's checkpoint file on a
//! time budget, so a crash loses at most `disk_write_time` worth of work.
//!
//! Control flow is explicit: `execute` returns `Err(TaskError::Restart)` to
//! request re-execution from the last durable recovery state (bounded to
//! [`MAX_RESTARTS`] attempts before escalating), and `Err(TaskError::Abort)`
//! to unwind to the driver with checkpoint files left intact for a later
//! resume.
//!
//! Cancellation is cooperative: one process-wide atomic flag, set by signal
//! handlers or a host shell, polled at every commit. There are no
//! asynchronous aborts mid-multiply.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::file::File;
use crate::gw::GwState;
use crate::state::TaskState;

/// Process-wide cooperative cancellation flag.
static ABORT_FLAG: AtomicBool = AtomicBool::new(false);

pub fn request_abort() {
    ABORT_FLAG.store(true, Ordering::Relaxed);
}

pub fn abort_requested() -> bool {
    ABORT_FLAG.load(Ordering::Relaxed)
}

/// Clear a previous abort request (a new run in the same process).
pub fn reset_abort() {
    ABORT_FLAG.store(false, Ordering::Relaxed);
}

/// Restarts allowed before a task gives up.
pub const MAX_RESTARTS: u32 = 5;
/// Seconds between checkpoint writes.
pub const DISK_WRITE_TIME: u64 = 600;
/// Seconds between progress reports.
pub const PROGRESS_TIME: u64 = 60;
/// Multiplications between in-memory state updates.
pub const MULS_PER_STATE_UPDATE: u32 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskError {
    /// Transient arithmetic failure; re-execute from the last recovery state.
    Restart,
    /// Terminal; unwind to the driver, files left intact.
    Abort,
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskError::Restart => write!(f, "task requested restart"),
            TaskError::Abort => write!(f, "task aborted"),
        }
    }
}

impl std::error::Error for TaskError {}

/// Tunables and host hooks threaded through every task.
pub struct TaskContext {
    pub disk_write_time: Duration,
    pub progress_time: Duration,
    pub muls_per_state_update: u32,
    /// Host override: return true to force an immediate checkpoint
    /// (external shells use this to snapshot before preemption).
    pub state_save_hook: Option<Box<dyn Fn() -> bool>>,
}

impl TaskContext {
    pub fn save_requested(&self) -> bool {
        self.state_save_hook.as_ref().map_or(false, |hook| hook())
    }
}

impl Default for TaskContext {
    fn default() -> Self {
        TaskContext {
            disk_write_time: Duration::from_secs(DISK_WRITE_TIME),
            progress_time: Duration::from_secs(PROGRESS_TIME),
            muls_per_state_update: MULS_PER_STATE_UPDATE,
            state_save_hook: None,
        }
    }
}

/// Common task bookkeeping, composed into every concrete task.
pub struct TaskBase {
    pub state: Option<TaskState>,
    pub iterations: u32,
    pub state_update_period: u32,
    pub restart_count: u32,
    pub restart_op: u32,
    pub file: Option<File>,
    pub state_written: bool,
    pub last_write: Instant,
    last_progress: Instant,
    time_started: Instant,
    elapsed: f64,
    ops_at_start: u64,
    pub ops_done: u64,
}

impl TaskBase {
    pub fn new() -> TaskBase {
        TaskBase {
            state: None,
            iterations: 0,
            state_update_period: MULS_PER_STATE_UPDATE,
            restart_count: 0,
            restart_op: 0,
            file: None,
            state_written: false,
            last_write: Instant::now(),
            last_progress: Instant::now(),
            time_started: Instant::now(),
            elapsed: 0.0,
            ops_at_start: 0,
            ops_done: 0,
        }
    }

    pub fn start(&mut self, gw: &GwState) {
        self.time_started = Instant::now();
        self.ops_at_start = gw.ops();
    }

    pub fn done(&mut self, gw: &GwState) {
        self.elapsed = self.time_started.elapsed().as_secs_f64();
        self.ops_done = gw.ops() - self.ops_at_start;
    }

    /// Seconds the last `execute` took.
    pub fn timer(&self) -> f64 {
        self.elapsed
    }

    /// Whether `i` is the final iteration (no `STARTNEXTFFT` past it).
    pub fn is_last(&self, i: u32) -> bool {
        i + 1 >= self.iterations
    }

    pub fn iteration(&self) -> u32 {
        self.state.as_ref().map_or(0, |s| s.iteration())
    }
}

impl Default for TaskBase {
    fn default() -> Self {
        TaskBase::new()
    }
}

pub trait Task {
    fn base(&self) -> &TaskBase;
    fn base_mut(&mut self) -> &mut TaskBase;

    fn setup(&mut self, gw: &mut GwState) -> Result<(), TaskError> {
        let _ = gw;
        Ok(())
    }

    fn execute(&mut self, gw: &mut GwState, ctx: &TaskContext) -> Result<(), TaskError>;

    fn release(&mut self) {}

    /// Persist the in-memory state. Strong-check tasks override to write
    /// their recovery record first.
    fn write_state(&mut self) -> Result<(), TaskError> {
        let base = self.base_mut();
        if let (Some(file), Some(state)) = (&base.file, &base.state) {
            file.write_state(state).map_err(|e| {
                tracing::error!("checkpoint write failed: {}", e);
                TaskError::Abort
            })?;
        }
        base.state_written = true;
        base.last_write = Instant::now();
        Ok(())
    }

    /// Record one step: replace the in-memory state at update-period
    /// boundaries, persist it on the disk-write budget (always on the final
    /// iteration), and emit a progress line on the progress budget. The
    /// abort flag is polled on every call.
    fn commit_execute(
        &mut self,
        ctx: &TaskContext,
        iteration: u32,
        make_state: &mut dyn FnMut() -> TaskState,
    ) -> Result<(), TaskError> {
        if abort_requested() {
            return Err(TaskError::Abort);
        }
        let last = iteration >= self.base().iterations;
        let period = self.base().state_update_period.max(1);
        if !last && iteration % period != 0 {
            return Ok(());
        }

        self.base_mut().state = Some(make_state());
        self.base_mut().state_written = false;

        let due = self.base().last_write.elapsed() >= ctx.disk_write_time;
        if last || due || ctx.save_requested() {
            self.write_state()?;
            let base = self.base_mut();
            if base.last_progress.elapsed() >= ctx.progress_time {
                base.last_progress = Instant::now();
                let total = base.iterations.max(1);
                tracing::info!("{:.1}% done", 100.0 * iteration as f64 / total as f64);
            }
        }
        Ok(())
    }

    /// Drive `setup → execute → release` with bounded restart accounting.
    fn run(&mut self, gw: &mut GwState, ctx: &TaskContext) -> Result<(), TaskError> {
        self.base_mut().start(gw);
        loop {
            self.setup(gw)?;
            match self.execute(gw, ctx) {
                Ok(()) => {
                    self.base_mut().done(gw);
                    self.release();
                    return Ok(());
                }
                Err(TaskError::Restart) => {
                    self.release();
                    let base = self.base_mut();
                    base.restart_count += 1;
                    base.restart_op += 1;
                    if base.restart_count >= MAX_RESTARTS {
                        tracing::error!("too many restarts, aborting");
                        return Err(TaskError::Abort);
                    }
                    tracing::warn!(
                        "restarting from last recovery state (attempt {})",
                        base.restart_count
                    );
                }
                Err(TaskError::Abort) => {
                    self.release();
                    return Err(TaskError::Abort);
                }
            }
        }
    }
}
