// Pattern language runtime: describes binary layouts and evaluates them
// against a data provider into a queryable pattern tree.
//
// Pipeline: preprocessor -> parser -> resolver -> evaluator -> pattern tree.
// `Runtime` drives one pipeline for one provider; `Orchestrator` keeps a
// runtime per provider and runs them on a worker pool.

pub mod config;
pub mod error;
pub mod eval;
pub mod lexer;
pub mod log;
pub mod name;
pub mod orchestrator;
pub mod parser;
pub mod pattern;
pub mod preprocessor;
pub mod project;
pub mod provider;
pub mod registry;
pub mod resolve;
pub mod runtime;
pub mod section;
pub mod span;
pub mod stdlib;
pub mod types;

pub use name::{Name, StringInterner};

// Re-export key types for public API
pub use config::{
    DangerousPolicy, Metadata, OrchestratorConfig, RuntimeConfig, MAX_EVAL_DEPTH, MAX_LIMIT,
};
pub use error::{CompileError, Error, ErrorCode, EvalError};
pub use eval::control::{ExecControl, RunState, ScopeSnapshot};
pub use eval::native::NativeContext;
pub use eval::value::Value;
pub use eval::PermissionHandler;
pub use log::{LogConsole, LogLevel};
pub use orchestrator::{Event, Orchestrator, MAIN_SOURCE};
pub use pattern::{Color, Pattern, PatternId, PatternTree, PatternValue, Visibility};
pub use preprocessor::{FsResolver, IncludeResolver, MapResolver};
pub use project::{ProjectArchive, ProjectError};
pub use provider::{MemoryProvider, Provider, ProviderError, ProviderId};
pub use registry::{native, Arity, ExtensionRegistry, NativeFn};
pub use runtime::{EnvVar, RunStatus, Runtime};
pub use section::{Section, SectionId, SectionStore, VirtualFile};
pub use span::Location;
pub use types::Endian;
