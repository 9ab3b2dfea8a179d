// Tree-walking evaluator for the pattern language
//
// An `Evaluator` runs one resolved `Program` against one data view. It is
// single-use: `run` it once, then take the results with `into_output`.
// Implementation is split by concern:
//   types.rs  - type instances, template bindings, enum tables
//   place.rs  - turning types at addresses into patterns
//   stmt.rs   - statements and variable declarations
//   expr.rs   - expressions, operators and calls

pub mod control;
mod expr;
pub mod native;
mod place;
pub(crate) mod scope;
mod stmt;
pub(crate) mod types;
pub mod value;

use crate::config::{DangerousPolicy, RunSettings};
use crate::error::{ErrorCode, EvalError};
use crate::log::LogConsole;
use crate::name::Name;
use crate::parser::ast::*;
use crate::pattern::{Pattern, PatternId, PatternTree, PatternValue};
use crate::provider::Provider;
use crate::registry::Extensions;
use crate::resolve::{Program, TypeRes};
use crate::section::{SectionId, SectionStore};
use crate::span::Span;
use crate::types::{BitOrder, Builtin, Endian, TypeSpec};
use control::{ExecControl, ScopeSnapshot};
use native::{DataView, FileTable, NativeContext};
use rustc_hash::FxHashMap;
use scope::{Frame, FrameKind, Layout, Scopes, Var};
use std::collections::BTreeMap;
use std::rc::Rc;
use std::sync::Arc;
use types::{Binding, EnumTable, Ty, TypeInst};
use value::Value;

pub(crate) use expr::compare;

/// Control flow signal from statement evaluation
pub(crate) enum ControlFlow {
    None,
    Break,
    Continue,
    Return(Option<Value>),
}

/// Asked before a dangerous function runs; gets the qualified function name
/// and returns whether the call may proceed. May block.
pub type PermissionHandler = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Inputs of a run besides the program and the data
pub struct EvalEnv<'a> {
    pub ext: Extensions<'a>,
    pub control: &'a ExecControl,
    pub console: &'a LogConsole,
    pub env: &'a FxHashMap<String, Value>,
    pub in_vars: &'a FxHashMap<String, Value>,
    pub policy: DangerousPolicy,
    pub permission: Option<&'a PermissionHandler>,
}

/// Everything a run leaves behind
#[derive(Debug, Default)]
pub struct EvalOutput {
    pub tree: PatternTree,
    pub sections: SectionStore,
    /// Values of `out` globals; only filled by a successful run
    pub out_vars: BTreeMap<String, Value>,
    pub main_result: Option<Value>,
    pub last_address: u64,
}

pub struct Evaluator<'a> {
    program: &'a Program,
    ext: Extensions<'a>,
    data: DataView<'a>,
    control: &'a ExecControl,
    console: &'a LogConsole,
    env: &'a FxHashMap<String, Value>,
    in_vars: &'a FxHashMap<String, Value>,
    policy: DangerousPolicy,
    permission: Option<&'a PermissionHandler>,
    /// Permission answers, asked at most once per function and run
    permissions: FxHashMap<String, bool>,
    settings: RunSettings,
    tree: PatternTree,
    sections: SectionStore,
    scopes: Scopes,
    /// `$`
    cursor: u64,
    /// Section new patterns are placed into
    section: SectionId,
    /// Nesting of calls and type placements
    depth: u32,
    last_address: u64,
    out_names: Vec<Name>,
    out_vars: BTreeMap<String, Value>,
    enums: FxHashMap<Name, Rc<EnumTable>>,
    /// Set by `break` inside a type body; ends the enclosing array
    break_array: bool,
    main_result: Option<Value>,
    files: FileTable,
}

impl<'a> Evaluator<'a> {
    pub fn new(program: &'a Program, provider: &'a dyn Provider, env: EvalEnv<'a>) -> Self {
        let settings = program.settings.clone();
        Self {
            program,
            ext: env.ext,
            data: DataView::new(provider, settings.base_address),
            control: env.control,
            console: env.console,
            env: env.env,
            in_vars: env.in_vars,
            policy: env.policy,
            permission: env.permission,
            permissions: FxHashMap::default(),
            scopes: Scopes::new(settings.endian),
            cursor: 0,
            section: SectionId::PROVIDER,
            depth: 0,
            last_address: 0,
            out_names: Vec::new(),
            out_vars: BTreeMap::new(),
            enums: FxHashMap::default(),
            break_array: false,
            main_result: None,
            files: FileTable::default(),
            tree: PatternTree::new(),
            sections: SectionStore::with_size_limit(settings.section_limit),
            settings,
        }
    }

    /// Execute the program. Errors carry source locations.
    pub fn run(&mut self) -> Result<(), EvalError> {
        self.run_program()
            .map_err(|e| e.located(&self.program.sources))
    }

    fn run_program(&mut self) -> Result<(), EvalError> {
        let program = self.program;
        self.cursor = self.data.base();
        self.bind_env();

        for stmt in &program.ast.stmts {
            if let ControlFlow::Return(_) = self.exec_stmt(stmt)? {
                break;
            }
        }

        if let Some(main) = program.main_fn() {
            if !main.def.params.is_empty() || main.def.variadic.is_some() {
                return Err(EvalError::at(
                    ErrorCode::ArityMismatch,
                    "main must not take parameters",
                    main.def.span,
                ));
            }
            let result = self.call_user(main, Vec::new(), main.def.span)?;
            self.main_result = Some(self.load(result.clone()).unwrap_or(result));
        }

        for name in std::mem::take(&mut self.out_names) {
            if let Some(var) = self.scopes.global(name) {
                let value = self.load(var.value.clone())?;
                self.out_vars.insert(program.name(name).to_string(), value);
            }
        }
        Ok(())
    }

    /// Environment variables become read-only globals
    fn bind_env(&mut self) {
        let interner = &self.program.interner;
        for (key, value) in self.env {
            if let Some(name) = interner.get(key) {
                self.scopes
                    .define_global(name, Var::new(value.clone(), None, true));
            }
        }
    }

    pub fn into_output(mut self) -> EvalOutput {
        self.tree.finalize();
        EvalOutput {
            tree: self.tree,
            sections: self.sections,
            out_vars: self.out_vars,
            main_result: self.main_result,
            last_address: self.last_address,
        }
    }

    pub fn pattern_count(&self) -> usize {
        self.tree.len()
    }

    /// Scalar behind a value; patterns are read back, aggregates fail
    pub(crate) fn load(&self, value: Value) -> Result<Value, EvalError> {
        match value {
            Value::Pattern(id) => {
                let p = self
                    .tree
                    .get(id)
                    .ok_or_else(|| EvalError::type_mismatch("stale pattern reference"))?;
                p.value.to_value().ok_or_else(|| {
                    EvalError::type_mismatch(format!(
                        "'{}' of type '{}' cannot be used as a value",
                        p.name, p.type_name
                    ))
                })
            }
            other => Ok(other),
        }
    }

    /// Debugger view of the frame stack, outermost first
    pub(crate) fn snapshot(&self) -> Vec<ScopeSnapshot> {
        self.scopes
            .frames()
            .iter()
            .map(|frame| ScopeSnapshot {
                kind: match frame.kind {
                    FrameKind::Global => "global".to_string(),
                    FrameKind::Block => "block".to_string(),
                    FrameKind::Function | FrameKind::Type => {
                        frame.label.clone().unwrap_or_default()
                    }
                },
                this: frame
                    .this
                    .filter(|id| (id.0 as usize) < self.tree.len())
                    .map(|id| self.tree.qualified_name(id)),
                locals: frame
                    .order
                    .iter()
                    .filter_map(|name| {
                        let var = frame.vars.get(name)?;
                        Some((self.program.name(*name).to_string(), self.render(&var.value)))
                    })
                    .collect(),
            })
            .collect()
    }

    fn render(&self, value: &Value) -> String {
        match value {
            Value::Pattern(id) => match self.tree.get(*id) {
                Some(p) => format!("{} = {}", self.tree.qualified_name(*id), p.value),
                None => value.to_string(),
            },
            Value::String(s) => format!("\"{}\"", s.escape_default()),
            other => other.to_string(),
        }
    }
}
