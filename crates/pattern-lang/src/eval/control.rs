// Run state, breakpoints and cooperative cancellation
//
// One `ExecControl` belongs to a runtime and is shared (through an `Arc`)
// with the threads that want to observe or steer a run. The evaluator calls
// `checkpoint` at statement boundaries; everything else is host-facing.

use crate::error::EvalError;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    Idle,
    Parsing,
    Evaluating,
    Suspended,
    Success,
    Error,
    Aborted,
}

impl RunState {
    pub fn is_running(&self) -> bool {
        matches!(self, RunState::Parsing | RunState::Evaluating | RunState::Suspended)
    }
}

/// One evaluator frame as seen by a debugger
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScopeSnapshot {
    /// "global", "function foo", "type Header", "block"
    pub kind: String,
    /// Qualified name of the pattern being built, if any
    pub this: Option<String>,
    /// Variable name and rendered value
    pub locals: Vec<(String, String)>,
}

/// Invoked on the worker thread with the line that suspended the run
pub type BreakpointCallback = Arc<dyn Fn(u32) + Send + Sync>;

struct ControlState {
    state: RunState,
    breakpoints: BTreeSet<u32>,
    pause_next: bool,
    pause_line: Option<u32>,
    last_line: Option<u32>,
    resume: bool,
    scopes: Vec<ScopeSnapshot>,
    hit_callback: Option<BreakpointCallback>,
    worker: Option<ThreadId>,
}

pub struct ExecControl {
    abort: AtomicBool,
    inner: Mutex<ControlState>,
    changed: Condvar,
}

impl Default for ExecControl {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ExecControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.lock();
        f.debug_struct("ExecControl")
            .field("state", &st.state)
            .field("breakpoints", &st.breakpoints)
            .field("aborted", &self.abort.load(Ordering::Relaxed))
            .finish()
    }
}

impl ExecControl {
    pub fn new() -> Self {
        Self {
            abort: AtomicBool::new(false),
            inner: Mutex::new(ControlState {
                state: RunState::Idle,
                breakpoints: BTreeSet::new(),
                pause_next: false,
                pause_line: None,
                last_line: None,
                resume: false,
                scopes: Vec::new(),
                hit_callback: None,
                worker: None,
            }),
            changed: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ControlState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> RunState {
        self.lock().state
    }

    pub fn is_running(&self) -> bool {
        self.lock().state.is_running()
    }

    /// Mark the calling thread as the worker of a new run
    pub(crate) fn begin(&self, state: RunState) {
        self.abort.store(false, Ordering::SeqCst);
        let mut st = self.lock();
        st.state = state;
        st.worker = Some(thread::current().id());
        st.pause_line = None;
        st.last_line = None;
        st.resume = false;
        st.scopes.clear();
        drop(st);
        self.changed.notify_all();
    }

    pub(crate) fn set_state(&self, state: RunState) {
        self.lock().state = state;
        self.changed.notify_all();
    }

    pub(crate) fn finish(&self, state: RunState) {
        let mut st = self.lock();
        st.state = state;
        st.worker = None;
        st.pause_line = None;
        drop(st);
        self.changed.notify_all();
    }

    /// Request cancellation and wait until the run has unwound. Called from
    /// the worker thread itself (e.g. inside a callback) it only sets the flag.
    pub fn abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
        let me = thread::current().id();
        let mut st = self.lock();
        self.changed.notify_all();
        while st.state.is_running() && st.worker.is_some() && st.worker != Some(me) {
            st = self
                .changed
                .wait(st)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
    }

    /// Error out when cancellation was requested
    pub fn check(&self) -> Result<(), EvalError> {
        if self.is_aborted() {
            Err(EvalError::aborted())
        } else {
            Ok(())
        }
    }

    pub fn add_breakpoint(&self, line: u32) {
        self.lock().breakpoints.insert(line);
    }

    pub fn remove_breakpoint(&self, line: u32) {
        self.lock().breakpoints.remove(&line);
    }

    pub fn breakpoints(&self) -> Vec<u32> {
        self.lock().breakpoints.iter().copied().collect()
    }

    pub fn set_breakpoints(&self, lines: impl IntoIterator<Item = u32>) {
        self.lock().breakpoints = lines.into_iter().collect();
    }

    pub fn set_hit_callback(&self, callback: Option<BreakpointCallback>) {
        self.lock().hit_callback = callback;
    }

    /// Suspend once at the next distinct line
    pub fn pause_next_line(&self) {
        self.lock().pause_next = true;
    }

    /// Line the run is suspended on
    pub fn pause_line(&self) -> Option<u32> {
        self.lock().pause_line
    }

    pub fn scopes(&self) -> Vec<ScopeSnapshot> {
        self.lock().scopes.clone()
    }

    /// Let a suspended run continue
    pub fn resume(&self) {
        let mut st = self.lock();
        if st.state == RunState::Suspended {
            st.resume = true;
        }
        drop(st);
        self.changed.notify_all();
    }

    /// Step: resume and suspend again at the next distinct line
    pub fn step(&self) {
        self.lock().pause_next = true;
        self.resume();
    }

    /// Block until no run is active
    pub fn wait_idle(&self) {
        let mut st = self.lock();
        while st.state.is_running() {
            st = self
                .changed
                .wait(st)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until `pred` holds for the run state or `timeout` passes;
    /// returns the last observed state
    pub fn wait_until(&self, timeout: Duration, pred: impl Fn(RunState) -> bool) -> RunState {
        let deadline = Instant::now() + timeout;
        let mut st = self.lock();
        while !pred(st.state) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            st = self
                .changed
                .wait_timeout(st, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        st.state
    }

    /// Statement boundary on a main-source `line`. Suspends when the line
    /// holds a breakpoint or a step was requested, and it differs from the
    /// previous checkpoint's line.
    pub(crate) fn checkpoint(
        &self,
        line: u32,
        snapshot: impl FnOnce() -> Vec<ScopeSnapshot>,
    ) -> Result<(), EvalError> {
        self.check()?;
        let hit = {
            let mut st = self.lock();
            if st.last_line == Some(line) {
                false
            } else {
                st.last_line = Some(line);
                st.pause_next || st.breakpoints.contains(&line)
            }
        };
        if !hit {
            return Ok(());
        }

        let scopes = snapshot();
        let callback = {
            let mut st = self.lock();
            st.pause_next = false;
            st.state = RunState::Suspended;
            st.pause_line = Some(line);
            st.scopes = scopes;
            st.resume = false;
            st.hit_callback.clone()
        };
        self.changed.notify_all();
        tracing::debug!(target: "pattern_lang::runtime", line, "suspended at breakpoint");
        if let Some(cb) = callback {
            cb(line);
        }

        let mut st = self.lock();
        while !st.resume && !self.is_aborted() {
            st = self
                .changed
                .wait(st)
                .unwrap_or_else(PoisonError::into_inner);
        }
        st.resume = false;
        st.pause_line = None;
        st.state = RunState::Evaluating;
        drop(st);
        self.changed.notify_all();
        self.check()
    }
}
