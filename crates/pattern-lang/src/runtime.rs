// Runtime: one pattern program bound to one provider
//
// A `Runtime` owns the results of its last run (pattern tree, sections,
// out-variables, diagnostics) and the debugger state. Runs are synchronous
// on the calling thread; other threads steer them through the shared
// `ExecControl` returned by `control()`.

use crate::config::{Metadata, RunSettings, RuntimeConfig};
use crate::error::{CompileError, ErrorCode, EvalError};
use crate::eval::control::{BreakpointCallback, ExecControl, RunState, ScopeSnapshot};
use crate::eval::value::Value;
use crate::eval::{EvalEnv, EvalOutput, Evaluator, PermissionHandler};
use crate::log::{LogCallback, LogConsole};
use crate::name::StringInterner;
use crate::parser::Parser;
use crate::pattern::{Color, Pattern, PatternId, PatternTree};
use crate::preprocessor::{FsResolver, IncludeResolver, PragmaOutcome, Preprocessor};
use crate::provider::{EmptyProvider, FnProvider, Provider};
use crate::registry::{
    Arity, ExtensionRegistry, Extensions, NativeFn, PragmaContext, PragmaHandler, RegistryError,
    TypeFactory,
};
use crate::resolve::{resolve, Program};
use crate::section::{SectionId, SectionStore};
use crate::span::SourceMap;
use rustc_hash::FxHashMap;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Host-supplied variable visible to the program as a constant and
/// through `std::env`
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: Value,
}

impl EnvVar {
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// How the last run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    CompileFailed,
    EvalFailed,
    Aborted,
}

impl RunStatus {
    fn state(self) -> RunState {
        match self {
            RunStatus::Success => RunState::Success,
            RunStatus::CompileFailed | RunStatus::EvalFailed => RunState::Error,
            RunStatus::Aborted => RunState::Aborted,
        }
    }
}

pub struct Runtime {
    config: RuntimeConfig,
    /// Process-wide extensions, frozen
    shared: Arc<ExtensionRegistry>,
    /// Extensions added to this runtime only; shadow `shared`
    local: ExtensionRegistry,
    provider: Arc<dyn Provider>,
    resolver: Box<dyn IncludeResolver + Send>,
    defines: Vec<(String, String)>,
    control: Arc<ExecControl>,
    console: LogConsole,
    permission: Option<PermissionHandler>,
    /// Kept across runs; a run's `in_vars` argument updates them
    in_vars: FxHashMap<String, Value>,

    output: EvalOutput,
    /// Output of a run that failed, kept for debugging
    failed_output: Option<EvalOutput>,
    compile_errors: Vec<CompileError>,
    eval_error: Option<EvalError>,
    metadata: Metadata,
    status: Option<RunStatus>,
    last_run_time: Duration,
    pattern_limit: u64,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("state", &self.control.state())
            .field("patterns", &self.output.tree.len())
            .field("sections", &self.output.sections.len())
            .field("status", &self.status)
            .finish()
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(RuntimeConfig::default(), Arc::new(frozen_std()))
    }
}

fn frozen_std() -> ExtensionRegistry {
    let mut registry = ExtensionRegistry::with_std();
    registry.freeze();
    registry
}

impl Runtime {
    pub fn new(mut config: RuntimeConfig, shared: Arc<ExtensionRegistry>) -> Self {
        config.validate();
        if !shared.is_frozen() {
            tracing::warn!(
                target: "pattern_lang::runtime",
                "runtime created over an extension registry that is not frozen"
            );
        }
        let resolver = Box::new(FsResolver::new(config.include_paths.clone()));
        Self {
            pattern_limit: config.pattern_limit,
            config,
            shared,
            local: ExtensionRegistry::new(),
            provider: Arc::new(EmptyProvider),
            resolver,
            defines: Vec::new(),
            control: Arc::new(ExecControl::new()),
            console: LogConsole::new(),
            permission: None,
            in_vars: FxHashMap::default(),
            output: EvalOutput::default(),
            failed_output: None,
            compile_errors: Vec::new(),
            eval_error: None,
            metadata: Metadata::default(),
            status: None,
            last_run_time: Duration::ZERO,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    // ---- data source and program inputs ----

    pub fn set_provider(&mut self, provider: Arc<dyn Provider>) {
        self.provider = provider;
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    /// Install a provider built from host read/write callbacks
    pub fn set_data_source(
        &mut self,
        base: u64,
        size: u64,
        read: impl Fn(u64, &mut [u8]) + Send + Sync + 'static,
        write: Option<Box<dyn Fn(u64, &[u8]) + Send + Sync>>,
    ) {
        self.provider = Arc::new(FnProvider::new(base, size, Box::new(read), write));
    }

    pub fn set_include_paths(&mut self, paths: Vec<PathBuf>) {
        self.config.include_paths = paths.clone();
        self.resolver = Box::new(FsResolver::new(paths));
    }

    /// Replace the include lookup, e.g. with an in-memory `MapResolver`
    pub fn set_include_resolver(&mut self, resolver: impl IncludeResolver + Send + 'static) {
        self.resolver = Box::new(resolver);
    }

    /// `#define name value` ahead of every run; an absent value defines the
    /// name as empty
    pub fn add_define(&mut self, name: impl Into<String>, value: Option<&str>) {
        let name = name.into();
        self.defines.retain(|(n, _)| *n != name);
        self.defines.push((name, value.unwrap_or("").to_string()));
    }

    pub fn set_in_var(&mut self, name: impl Into<String>, value: Value) {
        self.in_vars.insert(name.into(), value);
    }

    pub fn in_vars(&self) -> &FxHashMap<String, Value> {
        &self.in_vars
    }

    // ---- runtime-local extensions ----

    pub fn add_function(
        &mut self,
        namespace: &str,
        name: &str,
        arity: Arity,
        callback: NativeFn,
    ) -> Result<(), RegistryError> {
        self.local.add_function(namespace, name, arity, callback)
    }

    pub fn add_dangerous_function(
        &mut self,
        namespace: &str,
        name: &str,
        arity: Arity,
        callback: NativeFn,
    ) -> Result<(), RegistryError> {
        self.local.add_dangerous_function(namespace, name, arity, callback)
    }

    pub fn add_type(
        &mut self,
        namespace: &str,
        name: &str,
        arity: Arity,
        factory: TypeFactory,
    ) -> Result<(), RegistryError> {
        self.local.add_type(namespace, name, arity, factory)
    }

    pub fn add_pragma(&mut self, name: &str, handler: PragmaHandler) -> Result<(), RegistryError> {
        self.local.add_pragma(name, handler)
    }

    pub fn set_dangerous_function_handler(&mut self, handler: Option<PermissionHandler>) {
        self.permission = handler;
    }

    pub fn set_log_callback(&self, callback: Option<LogCallback>) {
        self.console.set_callback(callback);
    }

    pub fn console(&self) -> &LogConsole {
        &self.console
    }

    // ---- compiling and running ----

    fn compile(&self, source: &str, name: &str) -> Result<Program, Vec<CompileError>> {
        let ext = Extensions::new(&self.local, &self.shared);
        let mut settings = RunSettings::from(&self.config);
        let mut metadata = Metadata::default();
        let mut interner = StringInterner::new();
        let mut sources = SourceMap::new();

        let tokens = {
            let mut sink = |pragma: &str, value: &str| match ext.pragma(pragma) {
                Some(handler) => {
                    let mut ctx = PragmaContext {
                        settings: &mut settings,
                        metadata: &mut metadata,
                    };
                    if handler(&mut ctx, value) {
                        PragmaOutcome::Accepted
                    } else {
                        PragmaOutcome::Rejected
                    }
                }
                None => PragmaOutcome::Unknown,
            };
            let mut pp = Preprocessor::new(
                self.resolver.as_ref(),
                &mut sink,
                &mut interner,
                &mut sources,
            );
            for (define, value) in &self.defines {
                pp.define(define, value);
            }
            pp.process(source, name)
        };
        let tokens = tokens.map_err(|errs| locate(errs, &sources))?;
        let ast = Parser::new(tokens, &mut interner)
            .parse()
            .map_err(|errs| locate(errs, &sources))?;
        let located = sources.clone();
        resolve(ast, interner, sources, ext, settings, metadata)
            .map_err(|errs| locate(errs, &located))
    }

    /// Preprocess, parse and resolve without evaluating. The previous run's
    /// patterns stay in place.
    pub fn parse_only(&mut self, source: &str, name: &str) -> Vec<CompileError> {
        self.control.begin(RunState::Parsing);
        let errors = match self.compile(source, name) {
            Ok(program) => {
                self.metadata = program.metadata;
                Vec::new()
            }
            Err(errors) => errors,
        };
        self.compile_errors = errors.clone();
        self.control.finish(RunState::Idle);
        errors
    }

    /// Compile and evaluate `source`. Returns whether the run succeeded;
    /// details are in `compile_errors()`, `eval_error()` and `status()`.
    pub fn execute(
        &mut self,
        source: &str,
        name: &str,
        env: &[EnvVar],
        in_vars: &BTreeMap<String, Value>,
    ) -> bool {
        let started = Instant::now();
        self.control.begin(RunState::Parsing);
        self.compile_errors.clear();
        self.eval_error = None;
        self.failed_output = None;
        self.console.clear();
        for (key, value) in in_vars {
            self.in_vars.insert(key.clone(), value.clone());
        }
        tracing::info!(target: "pattern_lang::runtime", source = name, "run started");

        let program = match self.compile(source, name) {
            Ok(program) => program,
            Err(errors) => {
                tracing::debug!(target: "pattern_lang::runtime", count = errors.len(), "compile failed");
                self.compile_errors = errors;
                return self.finish(RunStatus::CompileFailed, started);
            }
        };
        self.metadata = program.metadata.clone();
        self.pattern_limit = program.settings.pattern_limit;
        self.console.set_debug(program.settings.debug);
        self.control.set_state(RunState::Evaluating);

        let env: FxHashMap<String, Value> = env
            .iter()
            .map(|var| (var.name.clone(), var.value.clone()))
            .collect();
        let (result, output) = {
            let mut evaluator = Evaluator::new(
                &program,
                self.provider.as_ref(),
                EvalEnv {
                    ext: Extensions::new(&self.local, &self.shared),
                    control: &self.control,
                    console: &self.console,
                    env: &env,
                    in_vars: &self.in_vars,
                    policy: self.config.dangerous_functions,
                    permission: self.permission.as_ref(),
                },
            );
            // A panicking native function fails the run instead of
            // unwinding through the host
            let result = panic::catch_unwind(AssertUnwindSafe(|| evaluator.run()))
                .unwrap_or_else(|payload| {
                    Err(EvalError::new(
                        ErrorCode::NativeFailure,
                        format!("evaluation panicked: {}", panic_message(payload.as_ref())),
                    ))
                });
            (result, evaluator.into_output())
        };

        let status = match result {
            Ok(()) => {
                self.output = output;
                RunStatus::Success
            }
            Err(e) if e.is_aborted() => {
                // Partial results stay visible; out-variables keep their
                // last committed values
                let committed = std::mem::take(&mut self.output.out_vars);
                self.output = output;
                self.output.out_vars = committed;
                self.output.main_result = None;
                RunStatus::Aborted
            }
            Err(e) => {
                tracing::debug!(target: "pattern_lang::runtime", code = %e.code, "evaluation failed");
                self.eval_error = Some(e);
                let committed = std::mem::take(&mut self.output.out_vars);
                self.output = EvalOutput {
                    out_vars: committed,
                    ..EvalOutput::default()
                };
                self.failed_output = Some(output);
                RunStatus::EvalFailed
            }
        };
        self.finish(status, started)
    }

    fn finish(&mut self, status: RunStatus, started: Instant) -> bool {
        self.last_run_time = started.elapsed();
        self.status = Some(status);
        tracing::info!(
            target: "pattern_lang::runtime",
            status = ?status,
            elapsed_ms = self.last_run_time.as_millis() as u64,
            patterns = self.output.tree.len(),
            "run finished"
        );
        self.control.finish(status.state());
        status == RunStatus::Success
    }

    /// Drop every result of the previous run
    pub fn reset(&mut self) {
        self.output = EvalOutput::default();
        self.failed_output = None;
        self.compile_errors.clear();
        self.eval_error = None;
        self.status = None;
    }

    // ---- run state ----

    /// Handle for steering a run from another thread
    pub fn control(&self) -> Arc<ExecControl> {
        self.control.clone()
    }

    pub fn state(&self) -> RunState {
        self.control.state()
    }

    pub fn status(&self) -> Option<RunStatus> {
        self.status
    }

    pub fn is_running(&self) -> bool {
        self.control.is_running()
    }

    pub fn abort(&self) {
        self.control.abort();
    }

    pub fn resume(&self) {
        self.control.resume();
    }

    pub fn step(&self) {
        self.control.step();
    }

    pub fn last_running_time(&self) -> Duration {
        self.last_run_time
    }

    pub fn created_pattern_count(&self) -> usize {
        self.output.tree.len()
    }

    /// Pattern ceiling of the last run, after pragmas
    pub fn maximum_pattern_count(&self) -> u64 {
        self.pattern_limit
    }

    /// Most recent read, write or placement address of the last run
    pub fn last_address(&self) -> u64 {
        self.output.last_address
    }

    // ---- results ----

    pub fn compile_errors(&self) -> &[CompileError] {
        &self.compile_errors
    }

    pub fn eval_error(&self) -> Option<&EvalError> {
        self.eval_error.as_ref()
    }

    /// `out` variables of the last successful run
    pub fn out_variables(&self) -> &BTreeMap<String, Value> {
        &self.output.out_vars
    }

    pub fn main_result(&self) -> Option<&Value> {
        self.output.main_result.as_ref()
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn tree(&self) -> &PatternTree {
        &self.output.tree
    }

    /// Patterns of a run that failed with an evaluation error
    pub fn failed_tree(&self) -> Option<&PatternTree> {
        self.failed_output.as_ref().map(|o| &o.tree)
    }

    pub fn pattern(&self, id: PatternId) -> Option<&Pattern> {
        self.output.tree.get(id)
    }

    /// Top-level patterns placed into `section`
    pub fn patterns(&self, section: SectionId) -> Vec<PatternId> {
        self.output.tree.roots_in(section).collect()
    }

    pub fn patterns_at(&self, offset: u64, section: SectionId) -> Vec<PatternId> {
        self.output.tree.patterns_at(offset, section)
    }

    pub fn colors_at(&self, offset: u64) -> Vec<Color> {
        self.output.tree.colors_at(offset, SectionId::PROVIDER)
    }

    pub fn tooltips_at(&self, offset: u64) -> Vec<PatternId> {
        self.output.tree.tooltips_at(offset, SectionId::PROVIDER)
    }

    pub fn pattern_by_name(&self, path: &str) -> Option<&Pattern> {
        self.output
            .tree
            .by_qualified_name(path)
            .and_then(|id| self.output.tree.get(id))
    }

    pub fn sections(&self) -> &SectionStore {
        &self.output.sections
    }

    // ---- debugger ----

    pub fn add_breakpoint(&self, line: u32) {
        self.control.add_breakpoint(line);
    }

    pub fn remove_breakpoint(&self, line: u32) {
        self.control.remove_breakpoint(line);
    }

    pub fn breakpoints(&self) -> Vec<u32> {
        self.control.breakpoints()
    }

    pub fn set_breakpoint_hit_callback(&self, callback: Option<BreakpointCallback>) {
        self.control.set_hit_callback(callback);
    }

    pub fn pause_next_line(&self) {
        self.control.pause_next_line();
    }

    pub fn pause_line(&self) -> Option<u32> {
        self.control.pause_line()
    }

    pub fn scope_count(&self) -> usize {
        self.control.scopes().len()
    }

    /// Frame `index` of the suspended run; negative indices count from the
    /// innermost frame (-1)
    pub fn scope(&self, index: isize) -> Option<ScopeSnapshot> {
        let mut scopes = self.control.scopes();
        let at = if index < 0 {
            scopes.len().checked_sub(index.unsigned_abs())?
        } else {
            index as usize
        };
        if at < scopes.len() {
            Some(scopes.swap_remove(at))
        } else {
            None
        }
    }
}

fn locate(errors: Vec<CompileError>, sources: &SourceMap) -> Vec<CompileError> {
    errors.into_iter().map(|e| e.located(sources)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::pattern::PatternValue;
    use crate::provider::MemoryProvider;
    use crate::registry::native;

    fn runtime(bytes: Vec<u8>) -> Runtime {
        let mut rt = Runtime::default();
        rt.set_provider(Arc::new(MemoryProvider::new(bytes)));
        rt
    }

    fn run(rt: &mut Runtime, source: &str) -> bool {
        rt.execute(source, "<main>", &[], &BTreeMap::new())
    }

    #[test]
    fn test_compile_errors_stop_before_evaluation() {
        let mut rt = runtime(vec![0; 4]);
        assert!(!run(&mut rt, "u8 x @ ;"));
        assert_eq!(rt.status(), Some(RunStatus::CompileFailed));
        assert!(!rt.compile_errors().is_empty());
        assert_eq!(rt.compile_errors()[0].location.line, 1);
        assert!(rt.tree().is_empty());
        assert_eq!(rt.state(), RunState::Error);
    }

    #[test]
    fn test_eval_error_discards_tree_but_keeps_it_for_debugging() {
        let mut rt = runtime(vec![1, 2, 3, 4]);
        assert!(!run(&mut rt, "u8 a @ 0;\nu32 b @ 2;"));
        let err = rt.eval_error().unwrap();
        assert_eq!(err.code, ErrorCode::OutOfBounds);
        assert_eq!(err.location.as_ref().unwrap().line, 2);
        assert!(rt.tree().is_empty());
        assert_eq!(rt.failed_tree().unwrap().len(), 1);
    }

    #[test]
    fn test_unknown_pragma_is_compile_error() {
        let mut rt = runtime(vec![0; 4]);
        assert!(!run(&mut rt, "#pragma frobnicate yes\nu8 x @ 0;"));
        assert!(rt.compile_errors()[0].message.contains("unknown pragma"));
    }

    #[test]
    fn test_local_pragma_and_metadata() {
        let mut rt = runtime(vec![0; 4]);
        rt.add_pragma(
            "tag",
            Arc::new(|ctx: &mut PragmaContext<'_>, value: &str| {
                ctx.metadata.push("tag", value);
                true
            }),
        )
        .unwrap();
        assert!(run(&mut rt, "#pragma tag hello\n#pragma author someone\nu8 x @ 0;"));
        assert_eq!(rt.metadata().get("tag"), Some("hello"));
        assert_eq!(rt.metadata().get("author"), Some("someone"));
    }

    #[test]
    fn test_parse_only_keeps_previous_patterns() {
        let mut rt = runtime(vec![0; 4]);
        assert!(run(&mut rt, "u16 x @ 0;"));
        assert!(rt.parse_only("u8 y @ 0;", "<main>").is_empty());
        assert!(rt.pattern_by_name("x").is_some());
        assert_eq!(rt.parse_only("u8 y @", "<main>").len(), 1);
        assert_eq!(rt.state(), RunState::Idle);
    }

    #[test]
    fn test_host_defines_and_local_functions() {
        let mut rt = runtime(vec![7; 8]);
        rt.add_define("COUNT", Some("3"));
        rt.add_function(
            "host",
            "twice",
            Arity::Exactly(1),
            native(|ctx, args| Ok(Value::Unsigned(ctx.scalar(&args[0])?.to_unsigned()? * 2))),
        )
        .unwrap();
        assert!(run(&mut rt, "u8 a[COUNT] @ 0;\nout u32 r;\nr = host::twice(a[1]);"));
        assert_eq!(rt.pattern_by_name("a").unwrap().size, 3);
        assert_eq!(rt.out_variables()["r"].to_unsigned().unwrap(), 14);
    }

    #[test]
    fn test_queries_on_provider_section() {
        let mut rt = runtime((0u8..16).collect());
        assert!(run(&mut rt, "struct P { u8 a; u8 b [[hidden]]; };\nP p @ 4;"));
        assert_eq!(rt.patterns(SectionId::PROVIDER).len(), 1);
        assert_eq!(rt.patterns_at(5, SectionId::PROVIDER).len(), 2);
        assert_eq!(rt.colors_at(5).len(), 1);
        assert_eq!(rt.tooltips_at(4).len(), 2);
        assert!(rt.patterns_at(9, SectionId::PROVIDER).is_empty());
        assert_eq!(rt.created_pattern_count(), 3);
        assert_eq!(rt.last_address(), 5);
    }

    #[test]
    fn test_fn_data_source() {
        let mut rt = Runtime::default();
        rt.set_data_source(
            0x1000,
            4,
            |offset, buf: &mut [u8]| {
                for (i, b) in buf.iter_mut().enumerate() {
                    *b = (offset as usize + i) as u8;
                }
            },
            None,
        );
        assert!(run(&mut rt, "u8 x @ 0x1002;"));
        let x = rt.pattern_by_name("x").unwrap();
        assert_eq!(x.value, PatternValue::Unsigned(2));
    }

    #[test]
    fn test_scope_negative_index() {
        let rt = Runtime::default();
        assert_eq!(rt.scope_count(), 0);
        assert!(rt.scope(-1).is_none());
        assert!(rt.scope(0).is_none());
    }
}
