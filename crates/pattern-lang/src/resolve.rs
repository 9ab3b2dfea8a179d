// Name resolution
//
// Runs between parsing and evaluation. The first pass collects every type
// and function declaration under its fully-qualified name; the second walks
// the tree, resolves each type reference into the side table and checks that
// every called function exists. All failures are collected.

use crate::config::{Metadata, RunSettings};
use crate::error::{CompileError, CompileStage};
use crate::name::{Name, StringInterner};
use crate::parser::ast::*;
use crate::registry::Extensions;
use crate::span::{SourceMap, Span};
use crate::types::Builtin;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// What a type reference names
#[derive(Debug, Clone, PartialEq)]
pub enum TypeRes {
    Builtin(Builtin),
    /// Qualified name of a user type
    User(Name),
    /// Qualified name of a registered type factory
    Registered(String),
    /// Template parameter of the enclosing type
    Param(Name),
    /// A template argument that is really a value expression (`Array<N>`)
    Value(Vec<Name>),
}

#[derive(Debug, Clone)]
pub struct TypeInfo {
    pub decl: Arc<TypeDecl>,
    /// Namespace the type was declared in
    pub namespace: Vec<Name>,
    pub qualified: Name,
}

#[derive(Debug, Clone)]
pub struct FnInfo {
    pub def: Arc<FnDef>,
    pub namespace: Vec<Name>,
    pub qualified: Name,
}

/// A parsed and resolved program, ready to evaluate
#[derive(Debug, Clone)]
pub struct Program {
    pub ast: Ast,
    pub interner: StringInterner,
    pub sources: SourceMap,
    pub types: FxHashMap<Name, TypeInfo>,
    pub functions: FxHashMap<Name, FnInfo>,
    type_refs: Vec<Option<TypeRes>>,
    /// Settings after the program's pragmas were applied
    pub settings: RunSettings,
    pub metadata: Metadata,
}

impl Program {
    pub fn type_res(&self, id: TypeRefId) -> Option<&TypeRes> {
        self.type_refs.get(id.0 as usize).and_then(|r| r.as_ref())
    }

    pub fn name(&self, name: Name) -> &str {
        self.interner.resolve(name)
    }

    pub fn path_string(&self, path: &[Name]) -> String {
        self.interner.join(path)
    }

    /// Look a function up from inside namespace `ns`, innermost first
    pub fn find_fn(&self, ns: &[Name], path: &[Name]) -> Option<&FnInfo> {
        for i in (0..=ns.len()).rev() {
            let mut joined = self.interner.join(&ns[..i]);
            if !joined.is_empty() {
                joined.push_str("::");
            }
            joined.push_str(&self.interner.join(path));
            if let Some(info) = self.interner.get(&joined).and_then(|n| self.functions.get(&n)) {
                return Some(info);
            }
        }
        None
    }

    /// Candidate registry names for a call from inside `ns`, innermost first
    pub fn qualified_candidates(&self, ns: &[Name], path: &[Name]) -> Vec<String> {
        let tail = self.interner.join(path);
        (0..=ns.len())
            .rev()
            .map(|i| {
                let prefix = self.interner.join(&ns[..i]);
                if prefix.is_empty() {
                    tail.clone()
                } else {
                    format!("{}::{}", prefix, tail)
                }
            })
            .collect()
    }

    pub fn main_fn(&self) -> Option<&FnInfo> {
        self.interner
            .get("main")
            .and_then(|n| self.functions.get(&n))
    }

    /// Source line of a span, 0 when unknown
    pub fn line_of(&self, span: Span) -> u32 {
        self.sources.line_of(span)
    }

    pub fn is_main_source(&self, span: Span) -> bool {
        self.sources
            .get(span.source_id)
            .map(|u| u.is_main)
            .unwrap_or(false)
    }
}

struct Resolver<'a> {
    interner: &'a mut StringInterner,
    ext: Extensions<'a>,
    types: FxHashMap<Name, TypeInfo>,
    functions: FxHashMap<Name, FnInfo>,
    type_refs: Vec<Option<TypeRes>>,
    errors: Vec<CompileError>,
    ns: Vec<Name>,
    /// Template parameters in scope
    params: Vec<Name>,
}

/// Resolve `ast`; pragmas and metadata were already applied to `settings`
pub fn resolve(
    ast: Ast,
    mut interner: StringInterner,
    sources: SourceMap,
    ext: Extensions<'_>,
    settings: RunSettings,
    mut metadata: Metadata,
) -> Result<Program, Vec<CompileError>> {
    let (types, functions, type_refs, errors) = {
        let mut r = Resolver {
            interner: &mut interner,
            ext,
            types: FxHashMap::default(),
            functions: FxHashMap::default(),
            type_refs: vec![None; ast.type_ref_count as usize],
            errors: Vec::new(),
            ns: Vec::new(),
            params: Vec::new(),
        };
        r.collect(&ast.stmts);
        r.ns.clear();
        r.stmts(&ast.stmts);
        (r.types, r.functions, r.type_refs, r.errors)
    };
    if !errors.is_empty() {
        return Err(errors);
    }
    for doc in &ast.global_docs {
        metadata.push("doc", doc.trim());
    }
    Ok(Program {
        ast,
        interner,
        sources,
        types,
        functions,
        type_refs,
        settings,
        metadata,
    })
}

impl<'a> Resolver<'a> {
    fn error(&mut self, message: impl Into<String>, span: Span) {
        self.errors
            .push(CompileError::new(CompileStage::Resolve, message, span));
    }

    fn qualify(&mut self, name: Name) -> Name {
        let mut path = self.ns.clone();
        path.push(name);
        self.interner.intern_path(&path)
    }

    // ---- pass 1: declarations ----

    fn collect(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            match &stmt.kind {
                StmtKind::Type(decl) => {
                    let qualified = self.qualify(decl.name);
                    let forward = matches!(decl.kind, TypeDeclKind::Forward);
                    match self.types.get(&qualified) {
                        Some(_) if forward => continue,
                        Some(existing) if !matches!(existing.decl.kind, TypeDeclKind::Forward) => {
                            let msg = format!("redefinition of type '{}'", self.interner.resolve(qualified));
                            self.error(msg, decl.span);
                            continue;
                        }
                        _ => {}
                    }
                    self.types.insert(
                        qualified,
                        TypeInfo {
                            decl: decl.clone(),
                            namespace: self.ns.clone(),
                            qualified,
                        },
                    );
                }
                StmtKind::Fn(def) => {
                    let qualified = self.qualify(def.name);
                    if self.functions.contains_key(&qualified) {
                        let msg = format!("redefinition of function '{}'", self.interner.resolve(qualified));
                        self.error(msg, def.span);
                        continue;
                    }
                    self.functions.insert(
                        qualified,
                        FnInfo {
                            def: def.clone(),
                            namespace: self.ns.clone(),
                            qualified,
                        },
                    );
                }
                StmtKind::Namespace { path, body } => {
                    let depth = self.ns.len();
                    self.ns.extend_from_slice(path);
                    self.collect(body);
                    self.ns.truncate(depth);
                }
                _ => {}
            }
        }
    }

    // ---- pass 2: references ----

    fn lookup_type(&mut self, path: &[Name]) -> Option<TypeRes> {
        if let [single] = path {
            if self.params.contains(single) {
                return Some(TypeRes::Param(*single));
            }
        }
        let tail = self.interner.join(path);
        for i in (0..=self.ns.len()).rev() {
            let prefix = self.interner.join(&self.ns[..i]);
            let joined = if prefix.is_empty() {
                tail.clone()
            } else {
                format!("{}::{}", prefix, tail)
            };
            if let Some(name) = self.interner.get(&joined) {
                if self.types.contains_key(&name) {
                    return Some(TypeRes::User(name));
                }
            }
            if self.ext.type_entry(&joined).is_some() {
                return Some(TypeRes::Registered(joined));
            }
        }
        None
    }

    fn type_expr(&mut self, ty: &TypeExpr) {
        let res = match &ty.kind {
            TypeKind::Builtin(b) => Some(TypeRes::Builtin(*b)),
            TypeKind::Named { path, args } => {
                for arg in args {
                    self.template_arg(arg);
                }
                let res = self.lookup_type(path);
                if res.is_none() {
                    let msg = format!("unknown type '{}'", self.interner.join(path));
                    self.error(msg, ty.span);
                }
                res
            }
            TypeKind::Array(inner, size) => {
                self.type_expr(inner);
                self.array_size(size);
                None
            }
        };
        if let Some(slot) = self.type_refs.get_mut(ty.id.0 as usize) {
            *slot = res;
        }
    }

    fn template_arg(&mut self, arg: &TemplateArg) {
        match arg {
            TemplateArg::Value(e) => self.expr(e),
            TemplateArg::Type(ty) => {
                if let TypeKind::Named { path, args } = &ty.kind {
                    if args.is_empty() && ty.endian.is_none() && self.lookup_type(path).is_none() {
                        if let Some(slot) = self.type_refs.get_mut(ty.id.0 as usize) {
                            *slot = Some(TypeRes::Value(path.clone()));
                        }
                        return;
                    }
                }
                self.type_expr(ty);
            }
        }
    }

    fn array_size(&mut self, size: &ArraySize) {
        match size {
            ArraySize::Count(e) | ArraySize::While(e) => self.expr(e),
            ArraySize::Open => {}
        }
    }

    fn attrs(&mut self, attrs: &[Attribute]) {
        for attr in attrs {
            self.exprs(&attr.args);
        }
    }

    fn stmts(&mut self, stmts: &[Stmt]) {
        for stmt in stmts {
            self.stmt(stmt);
        }
    }

    fn stmt(&mut self, stmt: &Stmt) {
        match &stmt.kind {
            StmtKind::Var(v) => {
                self.type_expr(&v.ty);
                if let Some(size) = &v.array {
                    self.array_size(size);
                }
                if let Some(p) = &v.pointer {
                    self.type_expr(p);
                }
                for e in [&v.placement, &v.section, &v.init].into_iter().flatten() {
                    self.expr(e);
                }
                self.attrs(&v.attrs);
            }
            StmtKind::Group(stmts) | StmtKind::Block(stmts) => self.stmts(stmts),
            StmtKind::Type(decl) => self.type_decl(decl),
            StmtKind::Fn(def) => {
                for p in &def.params {
                    self.type_expr(&p.ty);
                    if let Some(d) = &p.default {
                        self.expr(d);
                    }
                }
                self.stmts(&def.body);
            }
            StmtKind::Namespace { path, body } => {
                let depth = self.ns.len();
                self.ns.extend_from_slice(path);
                self.stmts(body);
                self.ns.truncate(depth);
            }
            StmtKind::If(s) => {
                self.expr(&s.cond);
                self.stmts(&s.then_body);
                self.stmts(&s.else_body);
            }
            StmtKind::Match(m) => {
                self.exprs(&m.scrutinees);
                for arm in &m.arms {
                    for p in &arm.patterns {
                        self.match_pattern(p);
                    }
                    self.stmts(&arm.body);
                }
            }
            StmtKind::While { cond, body } => {
                self.expr(cond);
                self.stmts(body);
            }
            StmtKind::For(f) => {
                if let Some(init) = &f.init {
                    self.stmt(init);
                }
                self.expr(&f.cond);
                if let Some(step) = &f.step {
                    self.stmt(step);
                }
                self.stmts(&f.body);
            }
            StmtKind::Return(Some(e)) | StmtKind::Expr(e) => self.expr(e),
            StmtKind::TryCatch { body, handler } => {
                self.stmts(body);
                self.stmts(handler);
            }
            StmtKind::BitfieldField(field) => {
                if let Some(ty) = &field.ty {
                    self.type_expr(ty);
                }
                self.expr(&field.bits);
                self.attrs(&field.attrs);
            }
            StmtKind::Return(None)
            | StmtKind::Break
            | StmtKind::Continue
            | StmtKind::Pragma { .. }
            | StmtKind::Import { .. } => {}
        }
    }

    fn type_decl(&mut self, decl: &TypeDecl) {
        let params = self.params.len();
        self.params
            .extend(decl.template_params.iter().map(|p| p.name));
        match &decl.kind {
            TypeDeclKind::Struct { parents, body } => {
                for p in parents {
                    self.type_expr(p);
                }
                self.stmts(body);
            }
            TypeDeclKind::Union { body } | TypeDeclKind::Bitfield { body } => self.stmts(body),
            TypeDeclKind::Enum { underlying, members } => {
                self.type_expr(underlying);
                for m in members {
                    for e in [&m.value, &m.range_end].into_iter().flatten() {
                        self.expr(e);
                    }
                }
            }
            TypeDeclKind::Alias(target) => self.type_expr(target),
            TypeDeclKind::Forward => {}
        }
        self.attrs(&decl.attrs);
        self.params.truncate(params);
    }

    fn match_pattern(&mut self, p: &MatchPattern) {
        match p {
            MatchPattern::Wildcard => {}
            MatchPattern::Value(e) => self.expr(e),
            MatchPattern::Range(a, b) => {
                self.expr(a);
                self.expr(b);
            }
            MatchPattern::Any(ps) => {
                for p in ps {
                    self.match_pattern(p);
                }
            }
        }
    }

    fn exprs(&mut self, exprs: &[Expr]) {
        for e in exprs {
            self.expr(e);
        }
    }

    fn expr(&mut self, e: &Expr) {
        match &e.kind {
            ExprKind::Unary(_, a) | ExprKind::Member(a, _) | ExprKind::Addressof(a) => self.expr(a),
            ExprKind::Binary(_, a, b) | ExprKind::Assign(_, a, b) | ExprKind::Index(a, b) => {
                self.expr(a);
                self.expr(b);
            }
            ExprKind::Ternary(a, b, c) => {
                self.expr(a);
                self.expr(b);
                self.expr(c);
            }
            ExprKind::Call(path, args) => {
                self.exprs(args);
                self.check_call(path, e.span);
            }
            ExprKind::Cast(ty, a) => {
                self.type_expr(ty);
                self.expr(a);
            }
            ExprKind::Sizeof(t) | ExprKind::Typenameof(t) => match &**t {
                TypeOrExpr::Type(ty) => self.type_expr(ty),
                TypeOrExpr::Expr(a) => self.expr(a),
            },
            ExprKind::Int(_)
            | ExprKind::Float(_)
            | ExprKind::Str(_)
            | ExprKind::Char(_)
            | ExprKind::Bool(_)
            | ExprKind::Null
            | ExprKind::Path(_)
            | ExprKind::Dollar
            | ExprKind::This
            | ExprKind::Parent => {}
        }
    }

    fn check_call(&mut self, path: &[Name], span: Span) {
        let tail = self.interner.join(path);
        for i in (0..=self.ns.len()).rev() {
            let prefix = self.interner.join(&self.ns[..i]);
            let joined = if prefix.is_empty() {
                tail.clone()
            } else {
                format!("{}::{}", prefix, tail)
            };
            let user = self
                .interner
                .get(&joined)
                .map(|n| self.functions.contains_key(&n))
                .unwrap_or(false);
            if user || self.ext.function(&joined).is_some() {
                return;
            }
        }
        self.error(format!("unknown function '{}'", tail), span);
    }
}
