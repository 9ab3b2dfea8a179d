// Expression evaluation methods for the evaluator
use super::place::Slot;
use super::*;
use crate::registry::FunctionEntry;
use crate::resolve::FnInfo;
use std::cmp::Ordering;

impl<'a> Evaluator<'a> {
    /// Evaluate an expression. Placed data comes back as `Value::Pattern`.
    pub fn eval_expr(&mut self, expr: &Expr) -> Result<Value, EvalError> {
        self.eval_expr_kind(expr).map_err(|e| e.or_span(expr.span))
    }

    /// Evaluate and read patterns back as scalars
    pub(crate) fn eval_scalar(&mut self, expr: &Expr) -> Result<Value, EvalError> {
        let value = self.eval_expr(expr)?;
        self.load(value).map_err(|e| e.or_span(expr.span))
    }

    /// Addresses, counts and sizes; saturates instead of wrapping
    pub(crate) fn eval_u64(&mut self, expr: &Expr) -> Result<u64, EvalError> {
        let v = self.eval_scalar(expr)?.to_unsigned().map_err(|e| e.or_span(expr.span))?;
        Ok(u64::try_from(v).unwrap_or(u64::MAX))
    }

    pub(crate) fn eval_bool(&mut self, expr: &Expr) -> Result<bool, EvalError> {
        let value = self.eval_expr(expr)?;
        match self.load(value) {
            Ok(v) => v.to_bool().map_err(|e| e.or_span(expr.span)),
            // aggregates are always truthy
            Err(_) => Ok(true),
        }
    }

    fn eval_expr_kind(&mut self, expr: &Expr) -> Result<Value, EvalError> {
        let span = expr.span;
        match &expr.kind {
            ExprKind::Int(v) => Ok(Value::Unsigned(*v)),
            ExprKind::Float(v) => Ok(Value::Float(*v)),
            ExprKind::Str(s) => Ok(Value::String(s.clone())),
            ExprKind::Char(c) => Ok(Value::Char(*c)),
            ExprKind::Bool(b) => Ok(Value::Bool(*b)),
            ExprKind::Null => Ok(Value::Null),
            ExprKind::Path(path) => self.eval_path(path, span),
            ExprKind::Dollar => Ok(Value::Unsigned(self.cursor as u128)),
            ExprKind::This => self
                .scopes
                .top()
                .this
                .map(Value::Pattern)
                .ok_or_else(|| EvalError::at(ErrorCode::UndefinedName, "'this' used outside of a type", span)),
            ExprKind::Parent => {
                let this = self.scopes.top().this.ok_or_else(|| {
                    EvalError::at(ErrorCode::UndefinedName, "'parent' used outside of a type", span)
                })?;
                self.tree[this]
                    .parent
                    .map(Value::Pattern)
                    .ok_or_else(|| EvalError::at(ErrorCode::UndefinedName, "pattern has no parent", span))
            }
            ExprKind::Unary(op, operand) => {
                let v = self.eval_scalar(operand)?;
                unary_op(*op, &v)
            }
            ExprKind::Binary(BinOp::And, l, r) => {
                Ok(Value::Bool(self.eval_bool(l)? && self.eval_bool(r)?))
            }
            ExprKind::Binary(BinOp::Or, l, r) => {
                Ok(Value::Bool(self.eval_bool(l)? || self.eval_bool(r)?))
            }
            ExprKind::Binary(BinOp::Xor, l, r) => {
                let l = self.eval_bool(l)?;
                Ok(Value::Bool(l ^ self.eval_bool(r)?))
            }
            ExprKind::Binary(op, l, r) => {
                let l = self.eval_scalar(l)?;
                let r = self.eval_scalar(r)?;
                binary_op(*op, &l, &r)
            }
            ExprKind::Ternary(cond, then, other) => {
                if self.eval_bool(cond)? {
                    self.eval_expr(then)
                } else {
                    self.eval_expr(other)
                }
            }
            ExprKind::Assign(op, target, value) => self.eval_assign(*op, target, value, span),
            ExprKind::Call(path, args) => self.eval_call(path, args, span),
            ExprKind::Index(base, index) => self.eval_index(base, index, span),
            ExprKind::Member(base, name) => {
                let base = self.eval_expr(base)?;
                let member = self.program.name(*name);
                let Value::Pattern(id) = base else {
                    return Err(EvalError::at(
                        ErrorCode::TypeMismatch,
                        format!("cannot access '{}' of a {}", member, base.kind_name()),
                        span,
                    ));
                };
                self.member_of(id, member).map(Value::Pattern).ok_or_else(|| {
                    EvalError::at(
                        ErrorCode::UndefinedName,
                        format!("'{}' has no member '{}'", self.tree.qualified_name(id), member),
                        span,
                    )
                })
            }
            ExprKind::Cast(ty, value) => self.eval_cast(ty, value, span),
            ExprKind::Sizeof(arg) => self.eval_sizeof(arg, span),
            ExprKind::Addressof(inner) => match self.eval_expr(inner)? {
                Value::Pattern(id) => Ok(Value::Unsigned(self.tree[id].offset as u128)),
                other => Err(EvalError::at(
                    ErrorCode::TypeMismatch,
                    format!("addressof needs placed data, got a {}", other.kind_name()),
                    span,
                )),
            },
            ExprKind::Typenameof(arg) => {
                let name = match &**arg {
                    TypeOrExpr::Type(te) => match self.type_value_path(te) {
                        Some(path) => self.typename_of_value(&path, te.span)?,
                        None => {
                            let ty = self.resolve_ty(te)?;
                            self.type_name(&ty)
                        }
                    },
                    TypeOrExpr::Expr(e) => match self.eval_expr(e)? {
                        Value::Pattern(id) => self.tree[id].type_name.clone(),
                        other => other.kind_name().to_string(),
                    },
                };
                Ok(Value::String(name))
            }
        }
    }

    /// Value behind a (possibly qualified) name
    pub(crate) fn eval_path(&mut self, path: &[Name], span: Span) -> Result<Value, EvalError> {
        let program = self.program;
        let Some((last, prefix)) = path.split_last() else {
            return Err(EvalError::at(ErrorCode::UndefinedName, "empty name", span));
        };
        if !prefix.is_empty() {
            return match self.enum_member(prefix, *last, span)? {
                Some(v) => Ok(v),
                None => Err(EvalError::at(
                    ErrorCode::UndefinedName,
                    format!("'{}' is not defined", program.path_string(path)),
                    span,
                )),
            };
        }

        let name = *last;
        if let Some(var) = self.scopes.get(name) {
            return Ok(var.value.clone());
        }
        if self.scopes.pack(name).is_some() {
            return Err(EvalError::at(
                ErrorCode::TypeMismatch,
                format!("'{}' is a parameter pack and can only be passed on", program.name(name)),
                span,
            ));
        }
        let text = program.name(name);
        if let Some(this) = self.scopes.top().this {
            if let Some(child) = self.member_of(this, text) {
                return Ok(Value::Pattern(child));
            }
        }
        if let Some(Binding::Value(v)) = self.scopes.binding(name) {
            return Ok(v.clone());
        }
        if let Some(id) = self.tree.roots().iter().rev().find(|id| self.tree[**id].name == text) {
            return Ok(Value::Pattern(*id));
        }
        Err(EvalError::at(
            ErrorCode::UndefinedName,
            format!("'{}' is not defined", text),
            span,
        ))
    }

    /// Member `name` of a pattern; pointers are looked through
    fn member_of(&self, id: PatternId, name: &str) -> Option<PatternId> {
        let p = self.tree.get(id)?;
        if let Some(found) = self.tree.find_in(&p.children, name) {
            return Some(found);
        }
        match p.value {
            PatternValue::Pointer { .. } => {
                let pointee = *p.children.first()?;
                self.member_of(pointee, name)
            }
            _ => None,
        }
    }

    fn eval_index(&mut self, base: &Expr, index: &Expr, span: Span) -> Result<Value, EvalError> {
        let base = self.eval_expr(base)?;
        let i = self.eval_u64(index)?;
        let out_of_range = |len: usize| {
            EvalError::at(
                ErrorCode::OutOfBounds,
                format!("index {} is out of range for length {}", i, len),
                span,
            )
        };
        match base {
            Value::Pattern(id) => {
                let p = &self.tree[id];
                match &p.value {
                    PatternValue::Array => p
                        .children
                        .get(i as usize)
                        .map(|c| Value::Pattern(*c))
                        .ok_or_else(|| out_of_range(p.children.len())),
                    PatternValue::String(s) => s
                        .chars()
                        .nth(i as usize)
                        .map(Value::Char)
                        .ok_or_else(|| out_of_range(s.chars().count())),
                    _ => Err(EvalError::at(
                        ErrorCode::TypeMismatch,
                        format!("'{}' of type '{}' cannot be indexed", p.name, p.type_name),
                        span,
                    )),
                }
            }
            Value::String(s) => s
                .chars()
                .nth(i as usize)
                .map(Value::Char)
                .ok_or_else(|| out_of_range(s.chars().count())),
            other => Err(EvalError::at(
                ErrorCode::TypeMismatch,
                format!("a {} cannot be indexed", other.kind_name()),
                span,
            )),
        }
    }

    fn eval_assign(
        &mut self,
        op: Option<BinOp>,
        target: &Expr,
        value: &Expr,
        span: Span,
    ) -> Result<Value, EvalError> {
        let mut value = self.eval_expr(value)?;
        if let Some(op) = op {
            let current = self.eval_scalar(target)?;
            let rhs = self.load(value)?;
            value = binary_op(op, &current, &rhs)?;
        }
        match &target.kind {
            ExprKind::Dollar => {
                let v = self.load(value)?;
                let address = v.to_unsigned()?;
                self.cursor = u64::try_from(address).unwrap_or(u64::MAX);
                Ok(v)
            }
            ExprKind::Path(path) if path.len() == 1 => {
                let name = path[0];
                let program = self.program;
                let (is_const, ty) = match self.scopes.get(name) {
                    Some(var) => (var.is_const, var.ty),
                    None => {
                        return Err(EvalError::at(
                            ErrorCode::UndefinedName,
                            format!("cannot assign to '{}': not a variable", program.name(name)),
                            span,
                        ))
                    }
                };
                if is_const {
                    return Err(EvalError::at(
                        ErrorCode::TypeMismatch,
                        format!("cannot assign to constant '{}'", program.name(name)),
                        span,
                    ));
                }
                let value = match ty {
                    Some(b) => self.load(value)?.narrow(b)?,
                    None => value,
                };
                if let Some(var) = self.scopes.get_mut(name) {
                    var.value = value.clone();
                }
                Ok(value)
            }
            _ => Err(EvalError::at(
                ErrorCode::TypeMismatch,
                "left side of an assignment must be a variable or '$'",
                span,
            )),
        }
    }

    fn eval_cast(&mut self, te: &TypeExpr, value: &Expr, span: Span) -> Result<Value, EvalError> {
        let ty = self.resolve_ty(te)?;
        let v = self.eval_scalar(value)?;
        if let Some(inst) = ty.as_enum() {
            let inst = inst.clone();
            let table = self.enum_table(&inst)?;
            return v.narrow(table.underlying);
        }
        let (inner, endian) = ty.peel();
        let Ty::Builtin(b) = inner else {
            return Err(EvalError::at(
                ErrorCode::TypeMismatch,
                format!("cannot cast a {} to '{}'", v.kind_name(), self.type_name(&ty)),
                span,
            ));
        };
        let out = v.narrow(*b)?;
        match (endian, b) {
            (Some(Endian::Big), Builtin::Unsigned(n)) => {
                Ok(Value::Unsigned(swap_bytes(out.to_unsigned()?, *n)))
            }
            (Some(Endian::Big), Builtin::Signed(n)) => Ok(Value::Signed(value::sign_extend(
                swap_bytes(out.to_unsigned()?, *n),
                *n,
            ))),
            _ => Ok(out),
        }
    }

    /// A type-position name that the resolver found to be a value
    fn type_value_path(&self, te: &TypeExpr) -> Option<Vec<Name>> {
        match self.program.type_res(te.id) {
            Some(TypeRes::Value(path)) => Some(path.clone()),
            _ => None,
        }
    }

    fn typename_of_value(&mut self, path: &[Name], span: Span) -> Result<String, EvalError> {
        Ok(match self.eval_path(path, span)? {
            Value::Pattern(id) => self.tree[id].type_name.clone(),
            other => other.kind_name().to_string(),
        })
    }

    fn eval_sizeof(&mut self, arg: &TypeOrExpr, span: Span) -> Result<Value, EvalError> {
        let value = match arg {
            TypeOrExpr::Type(te) => match self.type_value_path(te) {
                Some(path) => self.eval_path(&path, te.span)?,
                None => {
                    let ty = self.resolve_ty(te)?;
                    let size = match ty.fixed_size() {
                        Some(size) => size,
                        None => self.speculative_size(&ty, span)?,
                    };
                    return Ok(Value::Unsigned(size as u128));
                }
            },
            TypeOrExpr::Expr(e) => self.eval_expr(e)?,
        };
        match value {
            Value::Pattern(id) => Ok(Value::Unsigned(self.tree[id].size as u128)),
            Value::String(s) => Ok(Value::Unsigned(s.len() as u128)),
            other => Err(EvalError::at(
                ErrorCode::TypeMismatch,
                format!("sizeof needs a type or placed data, got a {}", other.kind_name()),
                span,
            )),
        }
    }

    /// Size of a dynamically sized type: place it at `$` and roll back
    fn speculative_size(&mut self, ty: &Ty, span: Span) -> Result<u64, EvalError> {
        let tree_len = self.tree.len();
        let depth = self.scopes.depth();
        let cursor = self.cursor;
        let last_address = self.last_address;
        let slot = Slot {
            name: String::from("sizeof"),
            parent: None,
            follow: false,
        };
        let endian = self.current_endian();
        let result = self
            .place(ty, slot, cursor, endian, span)
            .map(|id| self.tree[id].size);
        self.tree.truncate(tree_len);
        self.scopes.unwind_to(depth);
        self.scopes.purge_patterns(tree_len);
        self.cursor = cursor;
        self.last_address = last_address;
        result
    }

    fn eval_args(&mut self, args: &[Expr]) -> Result<Vec<Value>, EvalError> {
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            if let ExprKind::Path(path) = &arg.kind {
                if let [name] = path.as_slice() {
                    if self.scopes.get(*name).is_none() {
                        if let Some(pack) = self.scopes.pack(*name) {
                            values.extend(pack.iter().cloned());
                            continue;
                        }
                    }
                }
            }
            values.push(self.eval_expr(arg)?);
        }
        Ok(values)
    }

    fn eval_call(&mut self, path: &[Name], args: &[Expr], span: Span) -> Result<Value, EvalError> {
        let program = self.program;
        let values = self.eval_args(args)?;
        let ns = self.scopes.current_ns();
        if let Some(info) = program.find_fn(&ns, path) {
            return self.call_user(info, values, span);
        }
        for candidate in program.qualified_candidates(&ns, path) {
            if let Some(entry) = self.ext.function(&candidate) {
                return self.call_native(entry, values, span);
            }
        }
        Err(EvalError::at(
            ErrorCode::UnknownExtension,
            format!("unknown function '{}'", program.path_string(path)),
            span,
        ))
    }

    /// Call a function by its written name, e.g. from `[[format("fn")]]`
    pub(crate) fn call_named(&mut self, name: &str, args: Vec<Value>, span: Span) -> Result<Value, EvalError> {
        let program = self.program;
        let path: Option<Vec<Name>> = name.split("::").map(|s| program.interner.get(s)).collect();
        if let Some(path) = path {
            let ns = self.scopes.current_ns();
            if let Some(info) = program.find_fn(&ns, &path) {
                return self.call_user(info, args, span);
            }
        }
        match self.ext.function(name) {
            Some(entry) => self.call_native(entry, args, span),
            None => Err(EvalError::at(
                ErrorCode::UndefinedName,
                format!("unknown function '{}'", name),
                span,
            )),
        }
    }

    pub(crate) fn call_user(&mut self, info: &'a FnInfo, mut args: Vec<Value>, span: Span) -> Result<Value, EvalError> {
        let program = self.program;
        let def = info.def.clone();
        let fname = program.name(info.qualified);
        if self.depth >= self.settings.eval_depth {
            return Err(EvalError::at(
                ErrorCode::RecursionLimit,
                format!(
                    "calling '{}' exceeded the depth limit of {}",
                    fname, self.settings.eval_depth
                ),
                span,
            ));
        }
        let required = def.params.iter().take_while(|p| p.default.is_none()).count();
        let max = def.params.len();
        if args.len() < required || (args.len() > max && def.variadic.is_none()) {
            return Err(EvalError::at(
                ErrorCode::ArityMismatch,
                format!("'{}' takes {} arguments, got {}", fname, max, args.len()),
                span,
            ));
        }
        for param in def.params.iter().skip(args.len()) {
            if let Some(default) = &param.default {
                args.push(self.eval_expr(default)?);
            }
        }
        let pack = if args.len() > max { args.split_off(max) } else { Vec::new() };

        let mut bound = Vec::with_capacity(args.len());
        for (param, arg) in def.params.iter().zip(args) {
            let ty = self.resolve_ty(&param.ty)?;
            let builtin = match param.kind {
                ParamKind::Ref => None,
                ParamKind::Value => self.local_builtin(&ty)?,
            };
            let value = match builtin {
                Some(b) => self.load(arg)?.narrow(b)?,
                None => arg,
            };
            bound.push((param.name, Var::new(value, builtin, false)));
        }

        let mut frame = Frame::new(
            FrameKind::Function,
            Rc::from(info.namespace.clone()),
            self.current_endian(),
        );
        frame.label = Some(format!("function {}", fname));
        frame.pack = def.variadic.map(|name| (name, pack));
        let depth = self.scopes.depth();
        self.scopes.push(frame);
        for (name, var) in bound {
            self.scopes.define(name, var);
        }
        self.depth += 1;
        let result = self.exec_stmts(&def.body);
        self.depth -= 1;
        self.scopes.unwind_to(depth);

        match result {
            Ok(ControlFlow::Return(value)) => Ok(value.unwrap_or(Value::Null)),
            Ok(_) => Ok(Value::Null),
            Err(mut e) => {
                if !e.is_aborted() {
                    e.push_frame(fname, program.sources.locate(span));
                }
                Err(e)
            }
        }
    }

    fn call_native(&mut self, entry: &'a FunctionEntry, args: Vec<Value>, span: Span) -> Result<Value, EvalError> {
        let qualified = if entry.namespace.is_empty() {
            entry.name.clone()
        } else {
            format!("{}::{}", entry.namespace, entry.name)
        };
        if !entry.arity.accepts(args.len()) {
            return Err(EvalError::at(
                ErrorCode::ArityMismatch,
                format!("'{}' expects {} arguments, got {}", qualified, entry.arity, args.len()),
                span,
            ));
        }
        if entry.dangerous {
            self.check_permission(&qualified, span)?;
        }
        let mut ctx = NativeContext {
            data: self.data,
            sections: &mut self.sections,
            tree: &self.tree,
            console: self.console,
            env: self.env,
            settings: &self.settings,
            control: self.control,
            files: &mut self.files,
            cursor: self.cursor,
            section: self.section,
            last_address: &mut self.last_address,
        };
        (entry.callback)(&mut ctx, &args).map_err(|e| e.or_span(span))
    }

    fn check_permission(&mut self, function: &str, span: Span) -> Result<(), EvalError> {
        let allowed = match self.policy {
            DangerousPolicy::Allow => true,
            DangerousPolicy::Deny => false,
            DangerousPolicy::Ask => match self.permissions.get(function) {
                Some(allowed) => *allowed,
                None => {
                    let allowed = self.permission.map_or(false, |ask| ask(function));
                    tracing::info!(target: "pattern_lang::eval", function, allowed, "dangerous function permission");
                    self.permissions.insert(function.to_string(), allowed);
                    allowed
                }
            },
        };
        if allowed {
            Ok(())
        } else {
            Err(EvalError::at(
                ErrorCode::PermissionDenied,
                format!("call to dangerous function '{}' was denied", function),
                span,
            ))
        }
    }
}

fn swap_bytes(v: u128, bytes: u8) -> u128 {
    let n = usize::from(bytes.min(16));
    let le = v.to_le_bytes();
    le[..n].iter().fold(0u128, |acc, b| (acc << 8) | u128::from(*b))
}

fn unary_op(op: UnaryOp, v: &Value) -> Result<Value, EvalError> {
    Ok(match (op, v) {
        (UnaryOp::Plus, v) if v.is_numeric() => v.clone(),
        (UnaryOp::Neg, Value::Unsigned(x)) => Value::Signed((*x as i128).wrapping_neg()),
        (UnaryOp::Neg, Value::Signed(x)) => Value::Signed(x.wrapping_neg()),
        (UnaryOp::Neg, Value::Float(x)) => Value::Float(-x),
        (UnaryOp::Not, v) => Value::Bool(!v.to_bool()?),
        (UnaryOp::BitNot, Value::Unsigned(x)) => Value::Unsigned(!x),
        (UnaryOp::BitNot, Value::Signed(x)) => Value::Signed(!x),
        (UnaryOp::BitNot, Value::Bool(b)) => Value::Bool(!b),
        (op, v) => {
            let symbol = match op {
                UnaryOp::Neg => "-",
                UnaryOp::Plus => "+",
                UnaryOp::Not => "!",
                UnaryOp::BitNot => "~",
            };
            return Err(EvalError::type_mismatch(format!(
                "operator '{}' cannot be applied to a {}",
                symbol,
                v.kind_name()
            )));
        }
    })
}

/// Ordering of two scalars. Strings only compare with strings.
pub(crate) fn compare(a: &Value, b: &Value) -> Result<Ordering, EvalError> {
    match (a, b) {
        (Value::String(x), Value::String(y)) => Ok(x.cmp(y)),
        (Value::String(_), other) | (other, Value::String(_)) => Err(EvalError::type_mismatch(
            format!("cannot compare a string with a {}", other.kind_name()),
        )),
        (Value::Float(_), _) | (_, Value::Float(_)) => a
            .to_float()?
            .partial_cmp(&b.to_float()?)
            .ok_or_else(|| EvalError::type_mismatch("comparison with NaN")),
        (Value::Signed(_), _) | (_, Value::Signed(_)) => Ok(a.to_signed()?.cmp(&b.to_signed()?)),
        _ => Ok(a.to_unsigned()?.cmp(&b.to_unsigned()?)),
    }
}

/// Equality of two scalars; a string equals an integer holding its bytes
pub(crate) fn equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::String(x), Value::String(y)) => x == y,
        (Value::String(_), other) | (other, Value::String(_)) => {
            match (a.to_unsigned(), b.to_unsigned()) {
                (Ok(x), Ok(y)) => other.is_numeric() && x == y,
                _ => false,
            }
        }
        _ => matches!(compare(a, b), Ok(Ordering::Equal)),
    }
}

fn division_by_zero() -> EvalError {
    EvalError::new(ErrorCode::DivisionByZero, "division by zero")
}

pub(crate) fn binary_op(op: BinOp, l: &Value, r: &Value) -> Result<Value, EvalError> {
    match op {
        BinOp::Eq => return Ok(Value::Bool(equal(l, r))),
        BinOp::Ne => return Ok(Value::Bool(!equal(l, r))),
        BinOp::Lt => return Ok(Value::Bool(compare(l, r)?.is_lt())),
        BinOp::Gt => return Ok(Value::Bool(compare(l, r)?.is_gt())),
        BinOp::Le => return Ok(Value::Bool(compare(l, r)?.is_le())),
        BinOp::Ge => return Ok(Value::Bool(compare(l, r)?.is_ge())),
        BinOp::And => return Ok(Value::Bool(l.to_bool()? && r.to_bool()?)),
        BinOp::Or => return Ok(Value::Bool(l.to_bool()? || r.to_bool()?)),
        BinOp::Xor => return Ok(Value::Bool(l.to_bool()? ^ r.to_bool()?)),
        _ => {}
    }

    match (l, r) {
        (Value::String(a), Value::String(b)) if op == BinOp::Add => {
            return Ok(Value::String(format!("{}{}", a, b)))
        }
        (Value::String(a), Value::Char(c)) if op == BinOp::Add => {
            return Ok(Value::String(format!("{}{}", a, c)))
        }
        (Value::Char(c), Value::String(b)) if op == BinOp::Add => {
            return Ok(Value::String(format!("{}{}", c, b)))
        }
        (Value::String(_), _) | (_, Value::String(_)) => {
            return Err(EvalError::type_mismatch(format!(
                "operator '{}' cannot be applied to a {} and a {}",
                op.symbol(),
                l.kind_name(),
                r.kind_name()
            )))
        }
        _ => {}
    }

    if matches!(l, Value::Float(_)) || matches!(r, Value::Float(_)) {
        let (a, b) = (l.to_float()?, r.to_float()?);
        return Ok(Value::Float(match op {
            BinOp::Add => a + b,
            BinOp::Sub => a - b,
            BinOp::Mul => a * b,
            BinOp::Div if b == 0.0 => return Err(division_by_zero()),
            BinOp::Div => a / b,
            BinOp::Rem if b == 0.0 => return Err(division_by_zero()),
            BinOp::Rem => a % b,
            _ => {
                return Err(EvalError::type_mismatch(format!(
                    "operator '{}' cannot be applied to floats",
                    op.symbol()
                )))
            }
        }));
    }

    if matches!(l, Value::Signed(_)) || matches!(r, Value::Signed(_)) {
        let (a, b) = (l.to_signed()?, r.to_signed()?);
        return Ok(Value::Signed(match op {
            BinOp::Add => a.wrapping_add(b),
            BinOp::Sub => a.wrapping_sub(b),
            BinOp::Mul => a.wrapping_mul(b),
            BinOp::Div if b == 0 => return Err(division_by_zero()),
            BinOp::Div => a.wrapping_div(b),
            BinOp::Rem if b == 0 => return Err(division_by_zero()),
            BinOp::Rem => a.wrapping_rem(b),
            BinOp::Shl => u32::try_from(b).ok().and_then(|s| a.checked_shl(s)).unwrap_or(0),
            BinOp::Shr => u32::try_from(b)
                .ok()
                .and_then(|s| a.checked_shr(s))
                .unwrap_or(if a < 0 { -1 } else { 0 }),
            BinOp::BitAnd => a & b,
            BinOp::BitOr => a | b,
            BinOp::BitXor => a ^ b,
            _ => unreachable!("logical and comparison operators are handled above"),
        }));
    }

    let (a, b) = (l.to_unsigned()?, r.to_unsigned()?);
    Ok(Value::Unsigned(match op {
        BinOp::Add => a.wrapping_add(b),
        BinOp::Sub => a.wrapping_sub(b),
        BinOp::Mul => a.wrapping_mul(b),
        BinOp::Div if b == 0 => return Err(division_by_zero()),
        BinOp::Div => a / b,
        BinOp::Rem if b == 0 => return Err(division_by_zero()),
        BinOp::Rem => a % b,
        BinOp::Shl => u32::try_from(b).ok().and_then(|s| a.checked_shl(s)).unwrap_or(0),
        BinOp::Shr => u32::try_from(b).ok().and_then(|s| a.checked_shr(s)).unwrap_or(0),
        BinOp::BitAnd => a & b,
        BinOp::BitOr => a | b,
        BinOp::BitXor => a ^ b,
        _ => unreachable!("logical and comparison operators are handled above"),
    }))
}
