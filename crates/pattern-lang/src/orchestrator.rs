// Orchestrator: one runtime per attached provider, driven by a worker pool
//
// Hosts never parse or evaluate on their own thread. `execute` and
// `source_changed` queue jobs; results are announced as `Event`s to every
// `subscribe`d receiver. Each runtime sits behind its own mutex, so two jobs
// for the same provider run one after the other while different providers
// run in parallel.
//
// Steering a run (abort, resume, breakpoints) goes through the runtime's
// `ExecControl` and never waits for the runtime mutex.

use crate::config::OrchestratorConfig;
use crate::error::{CompileError, Error};
use crate::eval::control::{ExecControl, RunState, ScopeSnapshot};
use crate::eval::value::Value;
use crate::provider::{Provider, ProviderId};
use crate::registry::ExtensionRegistry;
use crate::runtime::{panic_message, EnvVar, RunStatus, Runtime};
use rustc_hash::FxHashMap;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Source name used for the program being edited
pub const MAIN_SOURCE: &str = "<main>";

const WORKER_STACK_SIZE: usize = 64 * 1024 * 1024;

/// Slice used when re-sending an abort to a job that started late
const ABORT_RETRY: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub enum Event {
    EvaluationStarted {
        provider: ProviderId,
    },
    EvaluationFinished {
        provider: ProviderId,
        status: RunStatus,
        elapsed: Duration,
    },
    PatternsChanged {
        provider: ProviderId,
    },
    SectionsChanged {
        provider: ProviderId,
    },
    HighlightingChanged {
        provider: ProviderId,
    },
    /// Debounced parse pass finished
    ParseFinished {
        provider: ProviderId,
        errors: Vec<CompileError>,
    },
    BreakpointHit {
        provider: ProviderId,
        line: u32,
    },
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct EventBus {
    subscribers: Mutex<Vec<Sender<Event>>>,
}

impl EventBus {
    fn publish(&self, event: Event) {
        tracing::trace!(target: "pattern_lang::orchestrator", ?event, "event");
        lock(&self.subscribers).retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Inputs of the most recent `execute`, reused by auto-evaluation
#[derive(Default, Clone)]
struct Inputs {
    source: String,
    env: Vec<EnvVar>,
    in_vars: BTreeMap<String, Value>,
}

/// Jobs of one provider run in submission order, one at a time. The entry
/// is on the pool channel at most once (`scheduled`); the worker that takes
/// it drains `queue`.
#[derive(Default)]
struct JobState {
    queue: VecDeque<JobKind>,
    scheduled: bool,
    active: bool,
}

/// Per-provider state
struct Entry {
    id: ProviderId,
    runtime: Mutex<Runtime>,
    control: Arc<ExecControl>,
    breakpoints: Mutex<BTreeSet<u32>>,
    inputs: Mutex<Inputs>,
    jobs: Mutex<JobState>,
    idle: Condvar,
}

impl Entry {
    fn new(id: ProviderId, runtime: Runtime, breakpoints: BTreeSet<u32>, events: &Arc<EventBus>) -> Self {
        let control = runtime.control();
        control.set_breakpoints(breakpoints.iter().copied());
        let bus = events.clone();
        control.set_hit_callback(Some(Arc::new(move |line| {
            bus.publish(Event::BreakpointHit { provider: id, line });
        })));
        Self {
            id,
            runtime: Mutex::new(runtime),
            control,
            breakpoints: Mutex::new(breakpoints),
            inputs: Mutex::new(Inputs::default()),
            jobs: Mutex::new(JobState::default()),
            idle: Condvar::new(),
        }
    }

    /// Take the next job, or unschedule the entry when the queue is empty
    fn next_job(&self) -> Option<JobKind> {
        let mut jobs = lock(&self.jobs);
        jobs.active = false;
        let next = jobs.queue.pop_front();
        match next {
            Some(_) => jobs.active = true,
            None => jobs.scheduled = false,
        }
        drop(jobs);
        self.idle.notify_all();
        next
    }

    fn wait_idle(&self) {
        let mut jobs = lock(&self.jobs);
        while jobs.scheduled {
            jobs = self.idle.wait(jobs).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Drop queued jobs and stop the running one. Returns once no job for
    /// this entry is active.
    fn cancel(&self) {
        lock(&self.jobs).queue.clear();
        loop {
            self.control.abort();
            let jobs = lock(&self.jobs);
            let (jobs, _) = self
                .idle
                .wait_timeout_while(jobs, ABORT_RETRY, |j| j.active)
                .unwrap_or_else(PoisonError::into_inner);
            if !jobs.active {
                break;
            }
        }
    }
}

enum JobKind {
    Parse,
    Execute,
}

type Entries = Arc<Mutex<FxHashMap<ProviderId, Arc<Entry>>>>;

/// Queue side of the worker pool
struct Scheduler {
    tx: Mutex<Option<Sender<Arc<Entry>>>>,
}

impl Scheduler {
    fn submit(&self, entry: &Arc<Entry>, kind: JobKind) {
        let mut jobs = lock(&entry.jobs);
        jobs.queue.push_back(kind);
        if jobs.scheduled {
            return;
        }
        jobs.scheduled = true;
        drop(jobs);

        let sent = match lock(&self.tx).as_ref() {
            Some(tx) => tx.send(entry.clone()).is_ok(),
            None => false,
        };
        if !sent {
            tracing::warn!(target: "pattern_lang::orchestrator", provider = %entry.id, "worker pool is shut down");
            let mut jobs = lock(&entry.jobs);
            jobs.queue.clear();
            jobs.scheduled = false;
            drop(jobs);
            entry.idle.notify_all();
        }
    }
}

#[derive(Default)]
struct DebounceState {
    deadlines: FxHashMap<ProviderId, Instant>,
    shutdown: bool,
}

#[derive(Default)]
struct Debouncer {
    state: Mutex<DebounceState>,
    wake: Condvar,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    shared: Arc<ExtensionRegistry>,
    entries: Entries,
    events: Arc<EventBus>,
    scheduler: Arc<Scheduler>,
    debouncer: Arc<Debouncer>,
    threads: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("providers", &lock(&self.entries).len())
            .field("workers", &self.config.worker_threads)
            .finish()
    }
}

impl Orchestrator {
    /// Start the worker pool. `shared` should already be frozen.
    pub fn new(mut config: OrchestratorConfig, shared: Arc<ExtensionRegistry>) -> Result<Self, Error> {
        config.validate();
        let (tx, rx) = mpsc::channel::<Arc<Entry>>();
        let rx = Arc::new(Mutex::new(rx));
        let events = Arc::new(EventBus::default());
        let mut threads = Vec::with_capacity(config.worker_threads + 1);

        for i in 0..config.worker_threads {
            let rx = rx.clone();
            let events = events.clone();
            let handle = thread::Builder::new()
                .name(format!("pattern-worker-{}", i))
                .stack_size(WORKER_STACK_SIZE)
                .spawn(move || worker_loop(&rx, &events))?;
            threads.push(handle);
        }

        let scheduler = Arc::new(Scheduler {
            tx: Mutex::new(Some(tx)),
        });
        let entries: Entries = Arc::default();
        let debouncer = Arc::new(Debouncer::default());
        {
            let debouncer = debouncer.clone();
            let entries = entries.clone();
            let scheduler = scheduler.clone();
            let auto_evaluate = config.auto_evaluate;
            threads.push(
                thread::Builder::new()
                    .name("pattern-debounce".to_string())
                    .spawn(move || debounce_loop(&debouncer, &entries, &scheduler, auto_evaluate))?,
            );
        }

        tracing::info!(
            target: "pattern_lang::orchestrator",
            workers = config.worker_threads,
            debounce_ms = config.debounce_ms,
            "orchestrator started"
        );
        Ok(Self {
            config,
            shared,
            entries,
            events,
            scheduler,
            debouncer,
            threads,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Receive every event published from now on
    pub fn subscribe(&self) -> Receiver<Event> {
        let (tx, rx) = mpsc::channel();
        lock(&self.events.subscribers).push(tx);
        rx
    }

    fn entry(&self, id: ProviderId) -> Result<Arc<Entry>, Error> {
        lock(&self.entries)
            .get(&id)
            .cloned()
            .ok_or(Error::UnknownProvider(id))
    }

    fn new_runtime(&self, provider: Arc<dyn Provider>) -> Runtime {
        let mut runtime = Runtime::new(self.config.runtime.clone(), self.shared.clone());
        runtime.set_provider(provider);
        runtime
    }

    pub fn attach(&self, provider: Arc<dyn Provider>) -> ProviderId {
        let id = ProviderId::next();
        let entry = Arc::new(Entry::new(id, self.new_runtime(provider), BTreeSet::new(), &self.events));
        lock(&self.entries).insert(id, entry);
        tracing::info!(target: "pattern_lang::orchestrator", provider = %id, "runtime created");
        id
    }

    /// Swap the provider behind `id`. The runtime is rebuilt; breakpoints
    /// and the last program inputs carry over.
    pub fn set_provider(&self, id: ProviderId, provider: Arc<dyn Provider>) -> Result<(), Error> {
        let old = self.entry(id)?;
        old.cancel();
        let breakpoints = lock(&old.breakpoints).clone();
        let entry = Entry::new(id, self.new_runtime(provider), breakpoints, &self.events);
        *lock(&entry.inputs) = lock(&old.inputs).clone();
        lock(&self.entries).insert(id, Arc::new(entry));
        tracing::info!(target: "pattern_lang::orchestrator", provider = %id, "runtime recreated");
        self.events.publish(Event::PatternsChanged { provider: id });
        self.events.publish(Event::HighlightingChanged { provider: id });
        Ok(())
    }

    /// Abort any job, wait for it and drop the runtime and its breakpoints
    pub fn detach(&self, id: ProviderId) -> Result<(), Error> {
        let entry = lock(&self.entries)
            .remove(&id)
            .ok_or(Error::UnknownProvider(id))?;
        lock(&self.debouncer.state).deadlines.remove(&id);
        entry.cancel();
        tracing::info!(target: "pattern_lang::orchestrator", provider = %id, "runtime invalidated");
        Ok(())
    }

    pub fn providers(&self) -> Vec<ProviderId> {
        let mut ids: Vec<_> = lock(&self.entries).keys().copied().collect();
        ids.sort();
        ids
    }

    /// Queue a parse and evaluation of `source`
    pub fn execute(
        &self,
        id: ProviderId,
        source: &str,
        env: Vec<EnvVar>,
        in_vars: BTreeMap<String, Value>,
    ) -> Result<(), Error> {
        let entry = self.entry(id)?;
        *lock(&entry.inputs) = Inputs {
            source: source.to_string(),
            env,
            in_vars,
        };
        self.scheduler.submit(&entry, JobKind::Execute);
        Ok(())
    }

    /// The editor changed the source. After the quiet period a parse-only
    /// pass runs, followed by an evaluation when auto-evaluate is on.
    pub fn source_changed(&self, id: ProviderId, source: &str) -> Result<(), Error> {
        let entry = self.entry(id)?;
        lock(&entry.inputs).source = source.to_string();
        let deadline = Instant::now() + Duration::from_millis(self.config.debounce_ms);
        lock(&self.debouncer.state).deadlines.insert(id, deadline);
        self.debouncer.wake.notify_all();
        Ok(())
    }

    /// Latest source seen for `id`, from `execute` or `source_changed`
    pub fn source(&self, id: ProviderId) -> Result<String, Error> {
        Ok(lock(&self.entry(id)?.inputs).source.clone())
    }

    /// Stop the running job and drop queued ones. When this returns no
    /// worker holds the runtime.
    pub fn abort(&self, id: ProviderId) -> Result<(), Error> {
        self.entry(id)?.cancel();
        Ok(())
    }

    pub fn resume(&self, id: ProviderId) -> Result<(), Error> {
        self.entry(id)?.control.resume();
        Ok(())
    }

    pub fn step(&self, id: ProviderId) -> Result<(), Error> {
        self.entry(id)?.control.step();
        Ok(())
    }

    pub fn pause_next_line(&self, id: ProviderId) -> Result<(), Error> {
        self.entry(id)?.control.pause_next_line();
        Ok(())
    }

    pub fn state(&self, id: ProviderId) -> Result<RunState, Error> {
        Ok(self.entry(id)?.control.state())
    }

    pub fn is_running(&self, id: ProviderId) -> Result<bool, Error> {
        Ok(self.entry(id)?.control.is_running())
    }

    pub fn pause_line(&self, id: ProviderId) -> Result<Option<u32>, Error> {
        Ok(self.entry(id)?.control.pause_line())
    }

    /// Frames of a suspended run, outermost first
    pub fn scopes(&self, id: ProviderId) -> Result<Vec<ScopeSnapshot>, Error> {
        Ok(self.entry(id)?.control.scopes())
    }

    pub fn add_breakpoint(&self, id: ProviderId, line: u32) -> Result<(), Error> {
        let entry = self.entry(id)?;
        lock(&entry.breakpoints).insert(line);
        entry.control.add_breakpoint(line);
        Ok(())
    }

    pub fn remove_breakpoint(&self, id: ProviderId, line: u32) -> Result<(), Error> {
        let entry = self.entry(id)?;
        lock(&entry.breakpoints).remove(&line);
        entry.control.remove_breakpoint(line);
        Ok(())
    }

    pub fn breakpoints(&self, id: ProviderId) -> Result<Vec<u32>, Error> {
        Ok(lock(&self.entry(id)?.breakpoints).iter().copied().collect())
    }

    /// Block until every queued job for `id` has finished
    pub fn wait_idle(&self, id: ProviderId) -> Result<(), Error> {
        self.entry(id)?.wait_idle();
        Ok(())
    }

    /// Read the runtime. Blocks while a job holds it.
    pub fn with_runtime<R>(&self, id: ProviderId, f: impl FnOnce(&Runtime) -> R) -> Result<R, Error> {
        let entry = self.entry(id)?;
        let runtime = lock(&entry.runtime);
        Ok(f(&runtime))
    }

    /// Configure the runtime, e.g. to add functions or a permission handler
    pub fn with_runtime_mut<R>(
        &self,
        id: ProviderId,
        f: impl FnOnce(&mut Runtime) -> R,
    ) -> Result<R, Error> {
        let entry = self.entry(id)?;
        let mut runtime = lock(&entry.runtime);
        Ok(f(&mut runtime))
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        let entries: Vec<_> = lock(&self.entries).drain().map(|(_, e)| e).collect();
        for entry in entries {
            entry.cancel();
        }
        lock(&self.scheduler.tx).take();
        lock(&self.debouncer.state).shutdown = true;
        self.debouncer.wake.notify_all();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                tracing::error!(target: "pattern_lang::orchestrator", "worker thread panicked");
            }
        }
    }
}

fn worker_loop(rx: &Mutex<Receiver<Arc<Entry>>>, events: &EventBus) {
    loop {
        // The receiver lock is released before the jobs run
        let entry = lock(rx).recv();
        match entry {
            Ok(entry) => {
                while let Some(kind) = entry.next_job() {
                    let execute = matches!(kind, JobKind::Execute);
                    let ran =
                        panic::catch_unwind(AssertUnwindSafe(|| run_job(&entry, kind, events)));
                    if let Err(payload) = ran {
                        tracing::error!(
                            target: "pattern_lang::orchestrator",
                            provider = %entry.id,
                            "job panicked: {}",
                            panic_message(payload.as_ref())
                        );
                        entry.control.finish(RunState::Error);
                        if execute {
                            events.publish(Event::EvaluationFinished {
                                provider: entry.id,
                                status: RunStatus::EvalFailed,
                                elapsed: Duration::ZERO,
                            });
                        }
                    }
                }
            }
            Err(_) => break,
        }
    }
}

fn run_job(entry: &Entry, kind: JobKind, events: &EventBus) {
    let inputs = lock(&entry.inputs).clone();
    let id = entry.id;
    match kind {
        JobKind::Parse => {
            let errors = lock(&entry.runtime).parse_only(&inputs.source, MAIN_SOURCE);
            events.publish(Event::ParseFinished { provider: id, errors });
        }
        JobKind::Execute => {
            events.publish(Event::EvaluationStarted { provider: id });
            let (status, elapsed) = {
                let mut runtime = lock(&entry.runtime);
                runtime.execute(&inputs.source, MAIN_SOURCE, &inputs.env, &inputs.in_vars);
                (
                    runtime.status().unwrap_or(RunStatus::CompileFailed),
                    runtime.last_running_time(),
                )
            };
            events.publish(Event::EvaluationFinished {
                provider: id,
                status,
                elapsed,
            });
            if status != RunStatus::CompileFailed {
                events.publish(Event::PatternsChanged { provider: id });
                events.publish(Event::SectionsChanged { provider: id });
                events.publish(Event::HighlightingChanged { provider: id });
            }
        }
    }
}

fn debounce_loop(debouncer: &Debouncer, entries: &Entries, scheduler: &Scheduler, auto_evaluate: bool) {
    let mut state = lock(&debouncer.state);
    loop {
        if state.shutdown {
            break;
        }
        let now = Instant::now();
        let due: Vec<ProviderId> = state
            .deadlines
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in &due {
            state.deadlines.remove(id);
        }
        if !due.is_empty() {
            drop(state);
            for id in due {
                let entry = lock(entries).get(&id).cloned();
                if let Some(entry) = entry {
                    tracing::debug!(target: "pattern_lang::orchestrator", provider = %id, "debounced parse");
                    scheduler.submit(&entry, JobKind::Parse);
                    if auto_evaluate {
                        scheduler.submit(&entry, JobKind::Execute);
                    }
                }
            }
            state = lock(&debouncer.state);
            continue;
        }
        state = match state.deadlines.values().min().copied() {
            Some(next) => {
                debouncer
                    .wake
                    .wait_timeout(state, next.saturating_duration_since(now))
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
            None => debouncer
                .wake
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner),
        };
    }
}
