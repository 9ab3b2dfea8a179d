// Statement evaluation methods for the evaluator
use super::place::{Count, Slot};
use super::*;

impl<'a> Evaluator<'a> {
    /// Evaluate a statement
    pub(crate) fn exec_stmt(&mut self, stmt: &Stmt) -> Result<ControlFlow, EvalError> {
        self.statement_boundary(stmt)?;
        self.exec_stmt_kind(stmt).map_err(|e| e.or_span(stmt.span))
    }

    /// Cancellation and debugger checkpoint before each executable statement
    fn statement_boundary(&mut self, stmt: &Stmt) -> Result<(), EvalError> {
        if matches!(
            stmt.kind,
            StmtKind::Type(_)
                | StmtKind::Fn(_)
                | StmtKind::Pragma { .. }
                | StmtKind::Import { .. }
                | StmtKind::Namespace { .. }
                | StmtKind::Group(_)
        ) {
            return Ok(());
        }
        if !self.program.is_main_source(stmt.span) {
            return self.control.check();
        }
        let line = self.program.line_of(stmt.span);
        let control = self.control;
        control.checkpoint(line, || self.snapshot())
    }

    fn exec_stmt_kind(&mut self, stmt: &Stmt) -> Result<ControlFlow, EvalError> {
        match &stmt.kind {
            StmtKind::Var(decl) => {
                self.exec_var(decl, stmt.span)?;
                Ok(ControlFlow::None)
            }
            StmtKind::Group(stmts) => self.exec_stmts(stmts),
            StmtKind::Type(_) | StmtKind::Fn(_) | StmtKind::Pragma { .. } | StmtKind::Import { .. } => {
                Ok(ControlFlow::None)
            }
            StmtKind::Namespace { path, body } => {
                let outer = self.scopes.current_ns();
                let inner: Rc<[Name]> = outer.iter().chain(path.iter()).copied().collect();
                self.scopes.top_mut().ns = inner;
                let result = self.exec_stmts(body);
                self.scopes.top_mut().ns = outer;
                result
            }
            StmtKind::If(d) => {
                if self.eval_bool(&d.cond)? {
                    self.exec_block(&d.then_body)
                } else {
                    self.exec_block(&d.else_body)
                }
            }
            StmtKind::While { cond, body } => {
                let mut iterations = 0u64;
                while self.eval_bool(cond)? {
                    iterations += 1;
                    self.check_loop(iterations, stmt.span)?;
                    match self.exec_block(body)? {
                        ControlFlow::Break => break,
                        ControlFlow::Return(v) => return Ok(ControlFlow::Return(v)),
                        ControlFlow::None | ControlFlow::Continue => {}
                    }
                }
                Ok(ControlFlow::None)
            }
            StmtKind::For(d) => {
                let depth = self.scopes.depth();
                self.scopes.push_block();
                let result = self.exec_for(d, stmt.span);
                self.scopes.unwind_to(depth);
                result
            }
            StmtKind::Match(d) => self.exec_match(d),
            StmtKind::TryCatch { body, handler } => {
                let tree_len = self.tree.len();
                let depth = self.scopes.depth();
                let cursor = self.cursor;
                let section = self.section;
                let call_depth = self.depth;
                match self.exec_block(body) {
                    Ok(flow) => Ok(flow),
                    Err(e) if e.is_aborted() => Err(e),
                    Err(e) => {
                        tracing::debug!(target: "pattern_lang::eval", error = %e, "try block failed");
                        self.tree.truncate(tree_len);
                        self.scopes.unwind_to(depth);
                        self.scopes.purge_patterns(tree_len);
                        self.cursor = cursor;
                        self.section = section;
                        self.depth = call_depth;
                        self.break_array = false;
                        self.exec_block(handler)
                    }
                }
            }
            StmtKind::Block(body) => self.exec_block(body),
            StmtKind::Break => Ok(ControlFlow::Break),
            StmtKind::Continue => Ok(ControlFlow::Continue),
            StmtKind::Return(value) => {
                let value = value.as_ref().map(|e| self.eval_expr(e)).transpose()?;
                Ok(ControlFlow::Return(value))
            }
            StmtKind::BitfieldField(field) => {
                self.exec_bitfield_field(field, stmt.span)?;
                Ok(ControlFlow::None)
            }
            StmtKind::Expr(e) => {
                self.eval_expr(e)?;
                Ok(ControlFlow::None)
            }
        }
    }

    /// Run statements in the current frame until one changes control flow
    pub(crate) fn exec_stmts(&mut self, stmts: &[Stmt]) -> Result<ControlFlow, EvalError> {
        for stmt in stmts {
            match self.exec_stmt(stmt)? {
                ControlFlow::None => {}
                flow => return Ok(flow),
            }
        }
        Ok(ControlFlow::None)
    }

    /// Run statements in a fresh block frame
    pub(crate) fn exec_block(&mut self, stmts: &[Stmt]) -> Result<ControlFlow, EvalError> {
        let depth = self.scopes.depth();
        self.scopes.push_block();
        let result = self.exec_stmts(stmts);
        self.scopes.unwind_to(depth);
        result
    }

    fn check_loop(&self, iterations: u64, span: Span) -> Result<(), EvalError> {
        self.control.check()?;
        if iterations > self.settings.loop_limit {
            return Err(EvalError::at(
                ErrorCode::LoopLimit,
                format!(
                    "loop ran more than {} times; raise the limit with #pragma loop_limit",
                    self.settings.loop_limit
                ),
                span,
            ));
        }
        Ok(())
    }

    fn exec_for(&mut self, d: &ForStmt, span: Span) -> Result<ControlFlow, EvalError> {
        if let Some(init) = &d.init {
            self.exec_stmt(init)?;
        }
        let mut iterations = 0u64;
        while self.eval_bool(&d.cond)? {
            iterations += 1;
            self.check_loop(iterations, span)?;
            match self.exec_block(&d.body)? {
                ControlFlow::Break => break,
                ControlFlow::Return(v) => return Ok(ControlFlow::Return(v)),
                ControlFlow::None | ControlFlow::Continue => {}
            }
            if let Some(step) = &d.step {
                self.exec_stmt(step)?;
            }
        }
        Ok(ControlFlow::None)
    }

    fn exec_match(&mut self, d: &MatchStmt) -> Result<ControlFlow, EvalError> {
        let mut values = Vec::with_capacity(d.scrutinees.len());
        for e in &d.scrutinees {
            values.push(self.eval_scalar(e)?);
        }
        for arm in &d.arms {
            let mut matched = arm.patterns.len() == values.len();
            for (pattern, value) in arm.patterns.iter().zip(&values) {
                if !matched {
                    break;
                }
                matched = self.match_pattern(pattern, value)?;
            }
            if matched {
                return self.exec_block(&arm.body);
            }
        }
        Ok(ControlFlow::None)
    }

    fn match_pattern(&mut self, pattern: &MatchPattern, value: &Value) -> Result<bool, EvalError> {
        Ok(match pattern {
            MatchPattern::Wildcard => true,
            MatchPattern::Value(e) => {
                let other = self.eval_scalar(e)?;
                super::expr::equal(value, &other)
            }
            MatchPattern::Range(lo, hi) => {
                let lo = self.eval_scalar(lo)?;
                let hi = self.eval_scalar(hi)?;
                super::expr::compare(value, &lo)?.is_ge() && super::expr::compare(value, &hi)?.is_le()
            }
            MatchPattern::Any(patterns) => {
                for p in patterns {
                    if self.match_pattern(p, value)? {
                        return Ok(true);
                    }
                }
                false
            }
        })
    }

    /// Variable declaration: either a local value or a placement
    fn exec_var(&mut self, decl: &VarDecl, span: Span) -> Result<(), EvalError> {
        let m = decl.modifiers;
        let placed = decl.placement.is_some() || self.scopes.type_frame().is_some();
        if decl.init.is_some() || m.is_const || m.is_in || m.is_out || !placed {
            return self.declare_local(decl, span);
        }
        if let Some(Frame {
            layout: Layout::Bits { .. },
            ..
        }) = self.scopes.type_frame()
        {
            return Err(EvalError::at(
                ErrorCode::InvalidPlacement,
                "only bit fields can be declared inside a bitfield",
                span,
            ));
        }
        let section = self.section;
        let result = self.place_var(decl, span);
        self.section = section;
        result
    }

    /// Scalar type a local of type `ty` is narrowed to
    pub(crate) fn local_builtin(&mut self, ty: &Ty) -> Result<Option<Builtin>, EvalError> {
        if let Some(inst) = ty.as_enum() {
            let inst = inst.clone();
            return Ok(Some(self.enum_table(&inst)?.underlying));
        }
        Ok(ty.builtin().filter(|b| *b != Builtin::Auto))
    }

    fn declare_local(&mut self, decl: &VarDecl, span: Span) -> Result<(), EvalError> {
        let program = self.program;
        let name = decl.name.ok_or_else(|| {
            EvalError::at(
                ErrorCode::InvalidPlacement,
                "anonymous declarations need a placement",
                span,
            )
        })?;
        if decl.array.is_some() || decl.pointer.is_some() {
            return Err(EvalError::at(
                ErrorCode::InvalidPlacement,
                format!(
                    "'{}': arrays and pointers must be placed with '@'",
                    program.name(name)
                ),
                span,
            ));
        }
        let ty = self.resolve_ty(&decl.ty)?;
        let builtin = self.local_builtin(&ty)?;
        let m = decl.modifiers;

        let supplied = if m.is_in && self.scopes.at_top_level() {
            self.in_vars.get(program.name(name)).cloned()
        } else {
            None
        };
        let value = match supplied {
            Some(v) => {
                if let Some(b) = builtin {
                    if !in_var_fits(b, &v) {
                        return Err(EvalError::at(
                            ErrorCode::TypeMismatch,
                            format!(
                                "in variable '{}' of type '{}' cannot take a {}",
                                program.name(name),
                                b,
                                v.kind_name()
                            ),
                            span,
                        ));
                    }
                }
                v
            }
            None => match &decl.init {
                Some(init) => self.eval_expr(init)?,
                None => default_value(builtin),
            },
        };
        let value = match builtin {
            Some(b) => self.load(value)?.narrow(b)?,
            None => value,
        };

        let var = Var::new(value, builtin, m.is_const);
        if m.is_out && !self.out_names.contains(&name) {
            self.out_names.push(name);
        }
        if m.is_in || m.is_out {
            self.scopes.define_global(name, var);
        } else {
            self.scopes.define(name, var);
        }
        Ok(())
    }

    fn place_var(&mut self, decl: &VarDecl, span: Span) -> Result<(), EvalError> {
        let program = self.program;
        if let Some(section) = &decl.section {
            self.section = SectionId(self.eval_u64(section)?);
        }
        let saved_cursor = self.cursor;
        let parent = self.current_parent();
        let explicit = decl.placement.is_some();
        let address = match &decl.placement {
            Some(e) => self.eval_u64(e)?,
            None => match self.scopes.type_frame().map(|f| f.layout) {
                Some(Layout::Union { start }) => start,
                _ => self.cursor,
            },
        };

        let ty = self.resolve_ty(&decl.ty)?;
        let name = match decl.name {
            Some(n) => program.name(n).to_string(),
            None => self.type_name(&ty),
        };
        let slot = Slot {
            name,
            parent,
            follow: explicit && parent.is_some(),
        };
        let endian = self.current_endian();
        let id = match (&decl.array, &decl.pointer) {
            (None, None) => self.place(&ty, slot, address, endian, span)?,
            (Some(size), None) => {
                let count = match size {
                    ArraySize::Count(e) => Count::Fixed(self.eval_u64(e)?),
                    ArraySize::While(e) => Count::While(e),
                    ArraySize::Open => Count::Open,
                };
                self.place_array(&ty, count, slot, address, endian, span)?
            }
            (None, Some(size_ty)) => {
                let size_ty = self.resolve_ty(size_ty)?;
                self.place_pointer(&ty, &size_ty, slot, address, endian, span)?
            }
            (Some(_), Some(_)) => {
                return Err(EvalError::at(
                    ErrorCode::InvalidPlacement,
                    "arrays of pointers are not supported",
                    span,
                ))
            }
        };

        self.apply_attributes(id, &decl.attrs)?;
        if let Some(doc) = &decl.doc {
            if let Some(p) = self.tree.get_mut(id) {
                if p.comment.is_none() {
                    p.comment = Some(doc.trim().to_string());
                }
            }
        }

        self.cursor = if explicit { saved_cursor } else { self.tree[id].end() };
        if parent.is_none() {
            if let Some(name) = decl.name {
                self.scopes.define(name, Var::new(Value::Pattern(id), None, false));
            }
        }
        Ok(())
    }
}

fn in_var_fits(ty: Builtin, value: &Value) -> bool {
    match ty {
        Builtin::Unsigned(_) | Builtin::Signed(_) => {
            matches!(value, Value::Unsigned(_) | Value::Signed(_))
        }
        Builtin::Float | Builtin::Double => value.is_numeric(),
        Builtin::Bool => matches!(value, Value::Bool(_)),
        Builtin::Char | Builtin::Char16 => matches!(value, Value::Char(_) | Value::Unsigned(_)),
        Builtin::Str => matches!(value, Value::String(_)),
        Builtin::Auto | Builtin::Padding => true,
    }
}

fn default_value(ty: Option<Builtin>) -> Value {
    match ty {
        Some(Builtin::Unsigned(_)) => Value::Unsigned(0),
        Some(Builtin::Signed(_)) => Value::Signed(0),
        Some(Builtin::Float | Builtin::Double) => Value::Float(0.0),
        Some(Builtin::Bool) => Value::Bool(false),
        Some(Builtin::Char | Builtin::Char16) => Value::Char('\0'),
        Some(Builtin::Str) => Value::String(String::new()),
        _ => Value::Null,
    }
}
