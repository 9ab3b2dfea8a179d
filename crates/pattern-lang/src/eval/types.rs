// Type instances: user types with their template arguments bound
use super::*;

#[derive(Debug, Clone)]
pub(crate) enum Ty {
    Builtin(Builtin),
    User(Rc<TypeInst>),
    /// Fixed-size array, from aliases and registered types
    Array(Box<Ty>, u64),
    Endian(Endian, Box<Ty>),
    /// `using Name = T;`, keeps the alias name for display
    Alias(Rc<str>, Box<Ty>),
}

impl Ty {
    /// Strip alias and endian wrappers. The outermost endian wins.
    pub fn peel(&self) -> (&Ty, Option<Endian>) {
        let mut ty = self;
        let mut endian = None;
        loop {
            match ty {
                Ty::Endian(e, inner) => {
                    endian = endian.or(Some(*e));
                    ty = inner;
                }
                Ty::Alias(_, inner) => ty = inner,
                _ => return (ty, endian),
            }
        }
    }

    pub fn builtin(&self) -> Option<Builtin> {
        match self.peel().0 {
            Ty::Builtin(b) => Some(*b),
            _ => None,
        }
    }

    /// Size known without reading data
    pub fn fixed_size(&self) -> Option<u64> {
        match self.peel().0 {
            Ty::Builtin(b) => b.size(),
            Ty::Array(inner, n) => inner.fixed_size()?.checked_mul(*n),
            _ => None,
        }
    }

    /// Enum instance behind aliases, if any
    pub fn as_enum(&self) -> Option<&Rc<TypeInst>> {
        match self.peel().0 {
            Ty::User(inst) if matches!(inst.decl.kind, TypeDeclKind::Enum { .. }) => Some(inst),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Binding {
    Type(Ty),
    Value(Value),
}

#[derive(Debug)]
pub(crate) struct TypeInst {
    pub decl: Arc<TypeDecl>,
    pub ns: Rc<[Name]>,
    pub qualified: Name,
    /// `Name` or `Name<u8, 4>`
    pub display: String,
    pub bindings: Vec<(Name, Binding)>,
}

/// Members of an enum with their inclusive value ranges
#[derive(Debug)]
pub(crate) struct EnumTable {
    pub underlying: Builtin,
    pub members: Vec<(String, u128, u128)>,
}

impl EnumTable {
    pub fn lookup(&self, value: u128) -> Option<&str> {
        self.members
            .iter()
            .find(|(_, lo, hi)| *lo <= value && value <= *hi)
            .map(|(name, _, _)| name.as_str())
    }

    pub fn value_of(&self, member: &str) -> Option<u128> {
        self.members
            .iter()
            .find(|(name, _, _)| name == member)
            .map(|(_, lo, _)| *lo)
    }
}

impl<'a> Evaluator<'a> {
    pub(crate) fn resolve_ty(&mut self, te: &TypeExpr) -> Result<Ty, EvalError> {
        let program = self.program;
        let ty = match &te.kind {
            TypeKind::Builtin(b) => Ty::Builtin(*b),
            TypeKind::Array(inner, size) => {
                let inner = self.resolve_ty(inner)?;
                match &**size {
                    ArraySize::Count(count) => {
                        let n = self.eval_u64(count)?;
                        Ty::Array(Box::new(inner), n)
                    }
                    _ => {
                        return Err(EvalError::at(
                            ErrorCode::InvalidPlacement,
                            "array types need a fixed element count",
                            te.span,
                        ))
                    }
                }
            }
            TypeKind::Named { path, args } => match program.type_res(te.id) {
                Some(TypeRes::Builtin(b)) => Ty::Builtin(*b),
                Some(TypeRes::Param(name)) => match self.scopes.binding(*name) {
                    Some(Binding::Type(ty)) => ty.clone(),
                    Some(Binding::Value(_)) => {
                        return Err(EvalError::at(
                            ErrorCode::TypeMismatch,
                            format!("'{}' is a value, not a type", program.name(*name)),
                            te.span,
                        ))
                    }
                    None => {
                        return Err(EvalError::at(
                            ErrorCode::UndefinedName,
                            format!("template parameter '{}' is not bound", program.name(*name)),
                            te.span,
                        ))
                    }
                },
                Some(TypeRes::User(qualified)) => self.instantiate(*qualified, args, te.span)?,
                Some(TypeRes::Registered(name)) => self.registered_type(name, args, te.span)?,
                Some(TypeRes::Value(_)) | None => {
                    return Err(EvalError::at(
                        ErrorCode::UndefinedName,
                        format!("unknown type '{}'", program.path_string(path)),
                        te.span,
                    ))
                }
            },
        };
        Ok(match te.endian {
            Some(endian) => Ty::Endian(endian, Box::new(ty)),
            None => ty,
        })
    }

    pub(crate) fn instantiate(
        &mut self,
        qualified: Name,
        args: &[TemplateArg],
        span: Span,
    ) -> Result<Ty, EvalError> {
        let program = self.program;
        let info = program.types.get(&qualified).ok_or_else(|| {
            EvalError::at(
                ErrorCode::UndefinedName,
                format!("unknown type '{}'", program.name(qualified)),
                span,
            )
        })?;
        if let TypeDeclKind::Forward = info.decl.kind {
            return Err(EvalError::at(
                ErrorCode::UndefinedName,
                format!("type '{}' is declared but never defined", program.name(qualified)),
                span,
            ));
        }
        let params = &info.decl.template_params;
        if params.len() != args.len() {
            return Err(EvalError::at(
                ErrorCode::ArityMismatch,
                format!(
                    "type '{}' takes {} template arguments, got {}",
                    program.name(qualified),
                    params.len(),
                    args.len()
                ),
                span,
            ));
        }

        let mut bindings = Vec::with_capacity(params.len());
        let mut rendered = Vec::with_capacity(params.len());
        for (param, arg) in params.iter().zip(args) {
            let binding = self.template_arg(param, arg)?;
            rendered.push(match &binding {
                Binding::Type(ty) => self.type_name(ty),
                Binding::Value(v) => v.to_string(),
            });
            bindings.push((param.name, binding));
        }
        let base = program.name(qualified);
        let display = if rendered.is_empty() {
            base.to_string()
        } else {
            format!("{}<{}>", base, rendered.join(", "))
        };
        let inst = Rc::new(TypeInst {
            decl: info.decl.clone(),
            ns: Rc::from(info.namespace.clone()),
            qualified,
            display,
            bindings,
        });

        if let TypeDeclKind::Alias(target) = &info.decl.kind {
            let name: Rc<str> = Rc::from(inst.display.as_str());
            let target = self.with_type_frame(inst, |ev| ev.resolve_ty(target))?;
            return Ok(Ty::Alias(name, Box::new(target)));
        }
        Ok(Ty::User(inst))
    }

    fn template_arg(&mut self, param: &TemplateParam, arg: &TemplateArg) -> Result<Binding, EvalError> {
        match arg {
            TemplateArg::Value(e) => Ok(Binding::Value(self.eval_scalar(e)?)),
            TemplateArg::Type(te) => {
                if let Some(value) = self.template_value(te)? {
                    return Ok(Binding::Value(value));
                }
                if param.is_value {
                    return Err(EvalError::at(
                        ErrorCode::TypeMismatch,
                        format!(
                            "template argument for '{}' must be a value",
                            self.program.name(param.name)
                        ),
                        te.span,
                    ));
                }
                Ok(Binding::Type(self.resolve_ty(te)?))
            }
        }
    }

    /// A type-position template argument that really names a value
    fn template_value(&mut self, te: &TypeExpr) -> Result<Option<Value>, EvalError> {
        let program = self.program;
        match program.type_res(te.id) {
            Some(TypeRes::Value(path)) => {
                let value = self.eval_path(path, te.span)?;
                Ok(Some(self.load(value)?))
            }
            Some(TypeRes::Param(name)) => match self.scopes.binding(*name) {
                Some(Binding::Value(v)) => Ok(Some(v.clone())),
                _ => Ok(None),
            },
            _ => Ok(None),
        }
    }

    fn registered_type(&mut self, name: &str, args: &[TemplateArg], span: Span) -> Result<Ty, EvalError> {
        let entry = self.ext.type_entry(name).ok_or_else(|| {
            EvalError::at(ErrorCode::UnknownExtension, format!("unknown type '{}'", name), span)
        })?;
        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            let value = match arg {
                TemplateArg::Value(e) => self.eval_scalar(e)?,
                TemplateArg::Type(te) => self.template_value(te)?.ok_or_else(|| {
                    EvalError::at(
                        ErrorCode::TypeMismatch,
                        format!("'{}' takes value arguments only", name),
                        te.span,
                    )
                })?,
            };
            values.push(value);
        }
        if !entry.arity.accepts(values.len()) {
            return Err(EvalError::at(
                ErrorCode::ArityMismatch,
                format!("type '{}' expects {} arguments, got {}", name, entry.arity, values.len()),
                span,
            ));
        }
        let spec = (entry.factory)(&values)
            .map_err(|message| EvalError::at(ErrorCode::NativeFailure, message, span))?;
        self.spec_to_ty(&spec, span)
    }

    fn spec_to_ty(&mut self, spec: &TypeSpec, span: Span) -> Result<Ty, EvalError> {
        Ok(match spec {
            TypeSpec::Builtin(b) => Ty::Builtin(*b),
            TypeSpec::Array(inner, n) => Ty::Array(Box::new(self.spec_to_ty(inner, span)?), *n),
            TypeSpec::Endian(e, inner) => Ty::Endian(*e, Box::new(self.spec_to_ty(inner, span)?)),
            TypeSpec::Named(name) => {
                let program = self.program;
                match program.interner.get(name).filter(|n| program.types.contains_key(n)) {
                    Some(qualified) => self.instantiate(qualified, &[], span)?,
                    None => {
                        return Err(EvalError::at(
                            ErrorCode::UndefinedName,
                            format!("unknown type '{}'", name),
                            span,
                        ))
                    }
                }
            }
        })
    }

    /// Run `f` inside a type frame for `inst`, without a pattern under construction
    pub(crate) fn with_type_frame<T>(
        &mut self,
        inst: Rc<TypeInst>,
        f: impl FnOnce(&mut Self) -> Result<T, EvalError>,
    ) -> Result<T, EvalError> {
        let depth = self.scopes.depth();
        let mut frame = Frame::new(FrameKind::Type, inst.ns.clone(), self.scopes.top().endian);
        frame.label = Some(format!("type {}", inst.display));
        frame.inst = Some(inst);
        self.scopes.push(frame);
        let result = f(self);
        self.scopes.unwind_to(depth);
        result
    }

    pub(crate) fn type_name(&self, ty: &Ty) -> String {
        match ty {
            Ty::Builtin(b) => b.to_string(),
            Ty::User(inst) => inst.display.clone(),
            Ty::Array(inner, n) => format!("{}[{}]", self.type_name(inner), n),
            Ty::Endian(endian, inner) => {
                let prefix = if *endian == Endian::Big { "be" } else { "le" };
                format!("{} {}", prefix, self.type_name(inner))
            }
            Ty::Alias(name, _) => name.to_string(),
        }
    }

    /// Evaluate the member table of an enum; cached per type
    pub(crate) fn enum_table(&mut self, inst: &Rc<TypeInst>) -> Result<Rc<EnumTable>, EvalError> {
        if let Some(table) = self.enums.get(&inst.qualified) {
            return Ok(table.clone());
        }
        let decl = inst.decl.clone();
        let TypeDeclKind::Enum { underlying, members } = &decl.kind else {
            return Err(EvalError::type_mismatch(format!("'{}' is not an enum", inst.display)));
        };
        let table = self.with_type_frame(inst.clone(), |ev| {
            let under = ev.resolve_ty(underlying)?.builtin();
            let width = match under {
                Some(Builtin::Unsigned(n)) | Some(Builtin::Signed(n)) => n,
                Some(Builtin::Char) | Some(Builtin::Bool) => 1,
                Some(Builtin::Char16) => 2,
                _ => {
                    return Err(EvalError::at(
                        ErrorCode::TypeMismatch,
                        "enum underlying type must be an integer",
                        underlying.span,
                    ))
                }
            };
            let mut next: u128 = 0;
            let mut out = Vec::with_capacity(members.len());
            for member in members {
                let lo = match &member.value {
                    Some(e) => value::truncate(ev.eval_scalar(e)?.to_unsigned()?, width),
                    None => next,
                };
                let hi = match &member.range_end {
                    Some(e) => value::truncate(ev.eval_scalar(e)?.to_unsigned()?, width),
                    None => lo,
                };
                out.push((ev.program.name(member.name).to_string(), lo, hi));
                next = value::truncate(hi.wrapping_add(1), width);
            }
            Ok(EnumTable {
                underlying: under.unwrap_or(Builtin::Unsigned(width)),
                members: out,
            })
        })?;
        let table = Rc::new(table);
        if inst.bindings.is_empty() {
            self.enums.insert(inst.qualified, table.clone());
        }
        Ok(table)
    }

    /// `Enum::Member`; `None` when `prefix` does not name an enum
    pub(crate) fn enum_member(
        &mut self,
        prefix: &[Name],
        member: Name,
        span: Span,
    ) -> Result<Option<Value>, EvalError> {
        let program = self.program;
        let ns = self.scopes.current_ns();
        let tail = program.path_string(prefix);
        let found = (0..=ns.len()).rev().find_map(|i| {
            let head = program.path_string(&ns[..i]);
            let joined = if head.is_empty() {
                tail.clone()
            } else {
                format!("{}::{}", head, tail)
            };
            program
                .interner
                .get(&joined)
                .filter(|n| program.types.contains_key(n))
        });
        let Some(qualified) = found else {
            return Ok(None);
        };
        let ty = self.instantiate(qualified, &[], span)?;
        let Some(inst) = ty.as_enum() else {
            return Ok(None);
        };
        let inst = inst.clone();
        let table = self.enum_table(&inst)?;
        match table.value_of(program.name(member)) {
            Some(v) => Ok(Some(Value::Unsigned(v))),
            None => Err(EvalError::at(
                ErrorCode::UndefinedName,
                format!("enum '{}' has no member '{}'", inst.display, program.name(member)),
                span,
            )),
        }
    }
}
