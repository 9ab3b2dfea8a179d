// Placement: turning types at addresses into patterns
use super::*;
use crate::pattern::{BitRange, PatternAttribute, Visibility};
use smallvec::SmallVec;

/// Element count of an array placement
#[derive(Clone, Copy)]
pub(crate) enum Count<'e> {
    Fixed(u64),
    /// `[while(cond)]`, re-evaluated with `$` at each element
    While(&'e Expr),
    /// `[]`
    Open,
}

/// Where a new pattern hangs in the tree
pub(crate) struct Slot {
    pub name: String,
    pub parent: Option<PatternId>,
    /// Placed with an explicit address or through a pointer
    pub follow: bool,
}

impl Slot {
    fn child(name: String, parent: PatternId) -> Self {
        Self {
            name,
            parent: Some(parent),
            follow: false,
        }
    }
}

/// Assemble an integer from raw bytes
pub(crate) fn compose(bytes: &[u8], endian: Endian) -> u128 {
    let push = |acc: u128, b: &u8| (acc << 8) | u128::from(*b);
    match endian {
        Endian::Little => bytes.iter().rev().fold(0, push),
        Endian::Big => bytes.iter().fold(0, push),
    }
}

pub(crate) fn decode(ty: Builtin, bytes: &[u8], endian: Endian) -> PatternValue {
    let raw = compose(bytes, endian);
    match ty {
        Builtin::Unsigned(_) => PatternValue::Unsigned(raw),
        Builtin::Signed(n) => PatternValue::Signed(value::sign_extend(raw, n)),
        Builtin::Float => PatternValue::Float(f32::from_bits(raw as u32) as f64),
        Builtin::Double => PatternValue::Float(f64::from_bits(raw as u64)),
        Builtin::Char => PatternValue::Char(raw as u8 as char),
        Builtin::Char16 => PatternValue::Char(char::from_u32(raw as u32).unwrap_or('\u{FFFD}')),
        Builtin::Bool => PatternValue::Bool(raw != 0),
        Builtin::Padding | Builtin::Str | Builtin::Auto => PatternValue::Padding,
    }
}

impl<'a> Evaluator<'a> {
    pub(crate) fn current_endian(&self) -> Endian {
        self.scopes.top().endian
    }

    /// Pattern that members declared here become children of
    pub(crate) fn current_parent(&self) -> Option<PatternId> {
        self.scopes.type_frame().and_then(|f| f.this)
    }

    /// `[lo, hi)` address range of a section
    fn extent(&self, section: SectionId) -> Result<(u64, u64), EvalError> {
        if section == SectionId::PROVIDER {
            Ok((self.data.base(), self.data.end()))
        } else {
            Ok((0, self.sections.size(section)?))
        }
    }

    pub(crate) fn read_bytes(&mut self, section: SectionId, address: u64, buf: &mut [u8]) -> Result<(), EvalError> {
        self.last_address = address;
        if section == SectionId::PROVIDER {
            self.data.read(address, buf)
        } else {
            self.sections.read(section, address, buf)
        }
    }

    fn new_pattern(&self, slot: Slot, type_name: String, address: u64, size: u64, endian: Endian) -> Pattern {
        let mut p = Pattern::new(slot.name, type_name, address, size);
        p.parent = slot.parent;
        p.pointer_follow = slot.follow;
        p.section = self.section;
        p.endian = endian;
        p
    }

    /// Every pattern goes through here: cancellation, the pattern ceiling
    /// and section bounds are checked before it is recorded
    pub(crate) fn add_pattern(&mut self, pattern: Pattern) -> Result<PatternId, EvalError> {
        self.control.check()?;
        if self.tree.len() as u64 >= self.settings.pattern_limit {
            return Err(EvalError::new(
                ErrorCode::RunawayGuard,
                format!(
                    "pattern limit of {} reached; raise it with #pragma pattern_limit",
                    self.settings.pattern_limit
                ),
            ));
        }
        self.check_extent(pattern.section, pattern.offset, pattern.size, &pattern.name)?;
        self.last_address = pattern.offset;
        Ok(self.tree.add(pattern))
    }

    fn check_extent(&self, section: SectionId, offset: u64, size: u64, name: &str) -> Result<(), EvalError> {
        let (lo, hi) = self.extent(section)?;
        let fits = offset >= lo && offset.checked_add(size).map_or(false, |end| end <= hi);
        if fits {
            Ok(())
        } else {
            Err(EvalError::new(
                ErrorCode::OutOfBounds,
                format!(
                    "'{}' at 0x{:X} with size 0x{:X} does not fit into [0x{:X}, 0x{:X})",
                    name, offset, size, lo, hi
                ),
            ))
        }
    }

    fn set_size(&mut self, id: PatternId, size: u64) -> Result<(), EvalError> {
        let (section, offset, name) = {
            let p = &self.tree[id];
            (p.section, p.offset, p.name.clone())
        };
        self.check_extent(section, offset, size, &name)?;
        if let Some(p) = self.tree.get_mut(id) {
            p.size = size;
        }
        Ok(())
    }

    /// Place `ty` at `address`
    pub(crate) fn place(
        &mut self,
        ty: &Ty,
        slot: Slot,
        address: u64,
        endian: Endian,
        span: Span,
    ) -> Result<PatternId, EvalError> {
        match ty {
            Ty::Endian(e, inner) => self.place(inner, slot, address, *e, span),
            Ty::Alias(name, inner) => {
                let id = self.place(inner, slot, address, endian, span)?;
                if let Some(p) = self.tree.get_mut(id) {
                    p.type_name = name.to_string();
                }
                Ok(id)
            }
            Ty::Builtin(b) => self.place_builtin(*b, slot, address, endian, span),
            Ty::Array(inner, n) => self.place_array(inner, Count::Fixed(*n), slot, address, endian, span),
            Ty::User(inst) => self.place_user(inst, slot, address, endian, span),
        }
    }

    fn place_builtin(
        &mut self,
        ty: Builtin,
        slot: Slot,
        address: u64,
        endian: Endian,
        span: Span,
    ) -> Result<PatternId, EvalError> {
        let size = match ty {
            Builtin::Str | Builtin::Auto => None,
            other => other.size(),
        }
        .ok_or_else(|| {
            EvalError::at(
                ErrorCode::InvalidPlacement,
                format!("a value of type '{}' cannot be placed", ty),
                span,
            )
        })?;
        let value = if ty == Builtin::Padding {
            PatternValue::Padding
        } else {
            let mut buf = [0u8; 16];
            let section = self.section;
            self.read_bytes(section, address, &mut buf[..size as usize])?;
            decode(ty, &buf[..size as usize], endian)
        };
        let mut p = self.new_pattern(slot, ty.to_string(), address, size, endian);
        p.value = value;
        self.add_pattern(p)
    }

    fn check_array_count(&self, count: u64, span: Span) -> Result<(), EvalError> {
        if (self.tree.len() as u64).saturating_add(count) > self.settings.pattern_limit {
            return Err(EvalError::at(
                ErrorCode::RunawayGuard,
                format!(
                    "array of {} elements exceeds the pattern limit of {}",
                    count, self.settings.pattern_limit
                ),
                span,
            ));
        }
        if count > self.settings.array_limit {
            return Err(EvalError::at(
                ErrorCode::ArrayLimit,
                format!(
                    "array of {} elements exceeds the array limit of {}",
                    count, self.settings.array_limit
                ),
                span,
            ));
        }
        Ok(())
    }

    fn check_element_index(&self, index: u64, span: Span) -> Result<(), EvalError> {
        if index >= self.settings.array_limit {
            return Err(EvalError::at(
                ErrorCode::ArrayLimit,
                format!("array grew past the array limit of {}", self.settings.array_limit),
                span,
            ));
        }
        self.control.check()
    }

    pub(crate) fn place_array(
        &mut self,
        elem: &Ty,
        count: Count<'_>,
        slot: Slot,
        address: u64,
        endian: Endian,
        span: Span,
    ) -> Result<PatternId, EvalError> {
        let elem_endian = elem.peel().1.unwrap_or(endian);
        match elem.builtin() {
            Some(b @ (Builtin::Char | Builtin::Char16)) => {
                return self.place_string(b, count, slot, address, elem_endian, span)
            }
            Some(Builtin::Padding) => return self.place_padding(count, slot, address, endian, span),
            _ => {}
        }
        if let Count::Fixed(n) = count {
            self.check_array_count(n, span)?;
        }

        let elem_name = self.type_name(elem);
        let mut p = self.new_pattern(slot, format!("{}[]", elem_name), address, 0, endian);
        p.value = PatternValue::Array;
        let id = self.add_pattern(p)?;
        let (_, section_end) = self.extent(self.section)?;

        let outer_break = std::mem::replace(&mut self.break_array, false);
        let mut at = address;
        let mut index = 0u64;
        let result = loop {
            match count {
                Count::Fixed(n) if index >= n => break Ok(()),
                Count::While(cond) => {
                    self.cursor = at;
                    match self.eval_bool(cond) {
                        Ok(true) => {}
                        Ok(false) => break Ok(()),
                        Err(e) => break Err(e),
                    }
                }
                Count::Open if at >= section_end => break Ok(()),
                _ => {}
            }
            if let Err(e) = self.check_element_index(index, span) {
                break Err(e);
            }
            let child = match self.place(elem, Slot::child(format!("[{}]", index), id), at, endian, span) {
                Ok(child) => child,
                Err(e) => break Err(e),
            };
            index += 1;
            let (end, zero) = {
                let c = &self.tree[child];
                (c.end(), matches!(c.value, PatternValue::Unsigned(0) | PatternValue::Signed(0)))
            };
            let stalled = end == at;
            at = end;
            if self.break_array || (zero && matches!(count, Count::Open)) {
                break Ok(());
            }
            if stalled && !matches!(count, Count::Fixed(_)) {
                break Ok(());
            }
        };
        self.break_array = outer_break;
        result?;

        if let Some(p) = self.tree.get_mut(id) {
            p.type_name = format!("{}[{}]", elem_name, index);
        }
        self.set_size(id, at - address)?;
        Ok(id)
    }

    /// `char` and `char16` arrays become one string pattern
    fn place_string(
        &mut self,
        ty: Builtin,
        count: Count<'_>,
        slot: Slot,
        address: u64,
        endian: Endian,
        span: Span,
    ) -> Result<PatternId, EvalError> {
        let width = if ty == Builtin::Char16 { 2u64 } else { 1 };
        let section = self.section;
        let (_, section_end) = self.extent(section)?;
        let mut units: Vec<u16> = Vec::new();
        let mut size = 0u64;
        let mut buf = [0u8; 2];
        let w = width as usize;

        match count {
            Count::Fixed(n) => {
                let len = n.checked_mul(width).ok_or_else(|| {
                    EvalError::at(ErrorCode::OutOfBounds, "string length overflows", span)
                })?;
                self.check_extent(section, address, len, &slot.name)
                    .map_err(|e| e.or_span(span))?;
                let mut bytes = vec![0u8; len as usize];
                self.read_bytes(section, address, &mut bytes)?;
                units = bytes
                    .chunks(w)
                    .map(|c| compose(c, endian) as u16)
                    .take_while(|u| *u != 0)
                    .collect();
                size = len;
            }
            Count::While(cond) => loop {
                self.cursor = address + size;
                if !self.eval_bool(cond)? {
                    // a terminating NUL belongs to the string
                    let at = address + size;
                    if at + width <= section_end {
                        self.read_bytes(section, at, &mut buf[..w])?;
                        if compose(&buf[..w], endian) == 0 {
                            size += width;
                        }
                    }
                    break;
                }
                self.check_element_index(size / width, span)?;
                self.read_bytes(section, address + size, &mut buf[..w])?;
                units.push(compose(&buf[..w], endian) as u16);
                size += width;
            },
            Count::Open => loop {
                let at = address + size;
                if at + width > section_end {
                    break;
                }
                self.check_element_index(size / width, span)?;
                self.read_bytes(section, at, &mut buf[..w])?;
                size += width;
                let unit = compose(&buf[..w], endian) as u16;
                if unit == 0 {
                    break;
                }
                units.push(unit);
            },
        }

        let text = if width == 1 {
            let bytes: Vec<u8> = units.iter().map(|u| *u as u8).collect();
            String::from_utf8_lossy(&bytes).into_owned()
        } else {
            String::from_utf16_lossy(&units)
        };
        let mut p = self.new_pattern(slot, format!("{}[{}]", ty, size / width), address, size, endian);
        p.value = PatternValue::String(text);
        self.add_pattern(p)
    }

    fn place_padding(
        &mut self,
        count: Count<'_>,
        slot: Slot,
        address: u64,
        endian: Endian,
        span: Span,
    ) -> Result<PatternId, EvalError> {
        let size = match count {
            Count::Fixed(n) => n,
            Count::While(cond) => {
                let mut n = 0u64;
                loop {
                    self.cursor = address + n;
                    if !self.eval_bool(cond)? {
                        break n;
                    }
                    self.check_element_index(n, span)?;
                    n += 1;
                }
            }
            Count::Open => {
                return Err(EvalError::at(
                    ErrorCode::InvalidPlacement,
                    "padding needs an explicit size",
                    span,
                ))
            }
        };
        let mut p = self.new_pattern(slot, format!("padding[{}]", size), address, size, endian);
        p.value = PatternValue::Padding;
        self.add_pattern(p)
    }

    fn place_user(
        &mut self,
        inst: &Rc<TypeInst>,
        slot: Slot,
        address: u64,
        endian: Endian,
        span: Span,
    ) -> Result<PatternId, EvalError> {
        if self.depth >= self.settings.eval_depth {
            return Err(EvalError::at(
                ErrorCode::RecursionLimit,
                format!("type nesting exceeded the depth limit of {}", self.settings.eval_depth),
                span,
            ));
        }
        let decl = inst.decl.clone();
        self.depth += 1;
        let result = match &decl.kind {
            TypeDeclKind::Struct { parents, body } => self.place_compound(
                inst,
                parents,
                body,
                PatternValue::Struct,
                Layout::Sequential,
                slot,
                address,
                endian,
            ),
            TypeDeclKind::Union { body } => self.place_compound(
                inst,
                &[],
                body,
                PatternValue::Union,
                Layout::Union { start: address },
                slot,
                address,
                endian,
            ),
            TypeDeclKind::Bitfield { body } => self.place_compound(
                inst,
                &[],
                body,
                PatternValue::Bitfield,
                Layout::Bits {
                    start: address,
                    bits: 0,
                },
                slot,
                address,
                endian,
            ),
            TypeDeclKind::Enum { .. } => self.place_enum(inst, slot, address, endian),
            TypeDeclKind::Alias(_) | TypeDeclKind::Forward => Err(EvalError::at(
                ErrorCode::InvalidPlacement,
                format!("'{}' cannot be placed", inst.display),
                span,
            )),
        };
        self.depth -= 1;
        let id = result?;
        self.apply_attributes(id, &decl.attrs)?;
        Ok(id)
    }

    fn push_type_frame(&mut self, inst: &Rc<TypeInst>, this: PatternId, layout: Layout, endian: Endian) {
        let mut frame = Frame::new(FrameKind::Type, inst.ns.clone(), endian);
        frame.this = Some(this);
        frame.inst = Some(inst.clone());
        frame.layout = layout;
        frame.label = Some(format!("type {}", inst.display));
        self.scopes.push(frame);
        for (name, binding) in &inst.bindings {
            if let Binding::Value(v) = binding {
                self.scopes.define(*name, Var::new(v.clone(), None, true));
            }
        }
    }

    /// Structs, unions and bitfields: run the body with `this` set
    #[allow(clippy::too_many_arguments)]
    fn place_compound(
        &mut self,
        inst: &Rc<TypeInst>,
        parents: &[TypeExpr],
        body: &[Stmt],
        kind: PatternValue,
        layout: Layout,
        slot: Slot,
        address: u64,
        endian: Endian,
    ) -> Result<PatternId, EvalError> {
        let mut p = self.new_pattern(slot, inst.display.clone(), address, 0, endian);
        p.value = kind;
        let id = self.add_pattern(p)?;

        let depth = self.scopes.depth();
        self.push_type_frame(inst, id, layout, endian);
        self.cursor = address;
        let result = self.run_type_body(parents, body, id, endian);
        let bits = match self.scopes.type_frame().map(|f| f.layout) {
            Some(Layout::Bits { bits, .. }) => Some(bits),
            _ => None,
        };
        self.scopes.unwind_to(depth);
        result?;

        let size = match (layout, bits) {
            (Layout::Bits { .. }, Some(bits)) => bits.div_ceil(8),
            _ => {
                let mut end = match layout {
                    Layout::Union { .. } => address,
                    _ => self.cursor.max(address),
                };
                let children = self.tree[id].children.clone();
                for child in children {
                    let (offset, child_end, follow) = {
                        let c = &self.tree[child];
                        (c.offset, c.end(), c.pointer_follow)
                    };
                    if follow {
                        continue;
                    }
                    if offset < address {
                        // moved before the start with `$`: treat as a jump
                        if let Some(c) = self.tree.get_mut(child) {
                            c.pointer_follow = true;
                        }
                        continue;
                    }
                    end = end.max(child_end);
                }
                end - address
            }
        };
        self.set_size(id, size)?;
        self.cursor = address + size;
        Ok(id)
    }

    fn run_type_body(
        &mut self,
        parents: &[TypeExpr],
        body: &[Stmt],
        this: PatternId,
        endian: Endian,
    ) -> Result<(), EvalError> {
        for parent in parents {
            let ty = self.resolve_ty(parent)?;
            let pinst = match ty.peel().0 {
                Ty::User(inst) => inst.clone(),
                _ => {
                    return Err(EvalError::at(
                        ErrorCode::TypeMismatch,
                        format!("'{}' cannot be inherited from", self.type_name(&ty)),
                        parent.span,
                    ))
                }
            };
            let pdecl = pinst.decl.clone();
            let TypeDeclKind::Struct { parents, body } = &pdecl.kind else {
                return Err(EvalError::at(
                    ErrorCode::TypeMismatch,
                    format!("'{}' is not a struct and cannot be inherited from", pinst.display),
                    parent.span,
                ));
            };
            let depth = self.scopes.depth();
            self.push_type_frame(&pinst, this, Layout::Sequential, endian);
            let result = self.run_type_body(parents, body, this, endian);
            self.scopes.unwind_to(depth);
            result?;
        }
        for stmt in body {
            match self.exec_stmt(stmt)? {
                ControlFlow::None => {}
                ControlFlow::Break => {
                    self.break_array = true;
                    break;
                }
                ControlFlow::Continue | ControlFlow::Return(_) => break,
            }
        }
        Ok(())
    }

    fn place_enum(
        &mut self,
        inst: &Rc<TypeInst>,
        slot: Slot,
        address: u64,
        endian: Endian,
    ) -> Result<PatternId, EvalError> {
        let table = self.enum_table(inst)?;
        let size = table.underlying.size().unwrap_or(1);
        let mut buf = [0u8; 16];
        let section = self.section;
        self.read_bytes(section, address, &mut buf[..size as usize])?;
        let raw = compose(&buf[..size as usize], endian);
        let mut p = self.new_pattern(slot, inst.display.clone(), address, size, endian);
        p.value = PatternValue::Enum {
            value: raw,
            member: table.lookup(raw).map(str::to_string),
        };
        self.add_pattern(p)
    }

    /// `T *name : SizeType @ address`
    pub(crate) fn place_pointer(
        &mut self,
        target: &Ty,
        size_ty: &Ty,
        slot: Slot,
        address: u64,
        endian: Endian,
        span: Span,
    ) -> Result<PatternId, EvalError> {
        let size = match size_ty.builtin() {
            Some(b) if b.is_integer() => b.size().unwrap_or(1),
            _ => {
                return Err(EvalError::at(
                    ErrorCode::TypeMismatch,
                    "pointer size type must be an integer type",
                    span,
                ))
            }
        };
        let endian = size_ty.peel().1.unwrap_or(endian);
        let mut buf = [0u8; 16];
        let section = self.section;
        self.read_bytes(section, address, &mut buf[..size as usize])?;
        let target_address = compose(&buf[..size as usize], endian) as u64;

        let name = format!("*{}", slot.name);
        let mut p = self.new_pattern(slot, format!("{}*", self.type_name(target)), address, size, endian);
        p.value = PatternValue::Pointer {
            address: target_address,
        };
        let id = self.add_pattern(p)?;

        let saved = self.cursor;
        let pointee = Slot {
            name,
            parent: Some(id),
            follow: true,
        };
        self.place(target, pointee, target_address, endian, span)?;
        self.cursor = saved;
        Ok(id)
    }

    /// `Kind kind : 3;` inside a bitfield
    pub(crate) fn exec_bitfield_field(&mut self, field: &BitfieldField, span: Span) -> Result<(), EvalError> {
        let (start, bits, this) = match self.scopes.type_frame() {
            Some(Frame {
                layout: Layout::Bits { start, bits },
                this,
                ..
            }) => (*start, *bits, *this),
            _ => {
                return Err(EvalError::at(
                    ErrorCode::InvalidPlacement,
                    "bit fields are only allowed inside a bitfield",
                    span,
                ))
            }
        };
        let width = self.eval_u64(&field.bits)?;
        if width == 0 || width > 64 {
            return Err(EvalError::at(
                ErrorCode::InvalidPlacement,
                format!("bit field width must be between 1 and 64, got {}", width),
                span,
            ));
        }
        if let Some(frame) = self.scopes.type_frame_mut() {
            frame.layout = Layout::Bits {
                start,
                bits: bits + width,
            };
        }
        let Some(name) = field.name else {
            return Ok(());
        };

        let first = bits / 8;
        let nbytes = (bits % 8 + width).div_ceil(8);
        let shift = bits % 8;
        let endian = self.current_endian();
        let mut buf = [0u8; 16];
        let section = self.section;
        self.read_bytes(section, start + first, &mut buf[..nbytes as usize])?;
        let mask = if width >= 128 { u128::MAX } else { (1u128 << width) - 1 };
        let raw = match self.settings.bit_order {
            BitOrder::RightToLeft => (compose(&buf[..nbytes as usize], endian) >> shift) & mask,
            BitOrder::LeftToRight => {
                (compose(&buf[..nbytes as usize], Endian::Big) >> (nbytes * 8 - shift - width)) & mask
            }
        };

        let ty = match &field.ty {
            Some(te) => Some(self.resolve_ty(te)?),
            None => None,
        };
        let (type_name, value) = match &ty {
            Some(ty) => {
                let type_name = self.type_name(ty);
                let value = if let Some(inst) = ty.as_enum() {
                    let table = self.enum_table(&inst.clone())?;
                    PatternValue::Enum {
                        value: raw,
                        member: table.lookup(raw).map(str::to_string),
                    }
                } else {
                    match ty.builtin() {
                        Some(Builtin::Bool) => PatternValue::Bool(raw != 0),
                        Some(Builtin::Signed(_)) => {
                            let shift = 128 - width as u32;
                            PatternValue::Signed(((raw << shift) as i128) >> shift)
                        }
                        _ => PatternValue::Unsigned(raw),
                    }
                };
                (type_name, value)
            }
            None => (format!("bits[{}]", width), PatternValue::Unsigned(raw)),
        };

        let slot = Slot {
            name: self.program.name(name).to_string(),
            parent: this,
            follow: false,
        };
        let mut p = self.new_pattern(slot, type_name, start + first, nbytes, endian);
        p.value = value;
        p.bits = Some(BitRange {
            bit_offset: shift as u32,
            width: width as u32,
        });
        let id = self.add_pattern(p)?;
        self.apply_attributes(id, &field.attrs)
    }

    /// Apply `[[...]]` attributes to a placed pattern
    pub(crate) fn apply_attributes(&mut self, id: PatternId, attrs: &[Attribute]) -> Result<(), EvalError> {
        if attrs.is_empty() {
            return Ok(());
        }
        let depth = self.scopes.depth();
        self.scopes.push_block();
        self.scopes.top_mut().this = Some(id);
        let result = attrs.iter().try_for_each(|attr| self.apply_attribute(id, attr));
        self.scopes.unwind_to(depth);
        result
    }

    fn apply_attribute(&mut self, id: PatternId, attr: &Attribute) -> Result<(), EvalError> {
        let mut args: SmallVec<[Value; 2]> = SmallVec::new();
        for arg in &attr.args {
            args.push(self.eval_expr(arg)?);
        }
        let string_arg = |ev: &Self, args: &[Value]| -> Result<String, EvalError> {
            match args.first().map(|v| ev.load(v.clone())).transpose()? {
                Some(Value::String(s)) => Ok(s),
                Some(other) => Ok(other.to_string()),
                None => Err(EvalError::at(
                    ErrorCode::ArityMismatch,
                    format!("attribute '{}' needs an argument", attr.name),
                    attr.span,
                )),
            }
        };

        match attr.name.as_str() {
            "color" => {
                let color = match args.first().map(|v| self.load(v.clone())).transpose()? {
                    Some(Value::String(s)) => {
                        u32::from_str_radix(s.trim_start_matches('#'), 16).map_err(|_| {
                            EvalError::at(
                                ErrorCode::TypeMismatch,
                                format!("invalid color '{}'", s),
                                attr.span,
                            )
                        })?
                    }
                    Some(v) => v.to_unsigned()? as u32,
                    None => {
                        return Err(EvalError::at(
                            ErrorCode::ArityMismatch,
                            "attribute 'color' needs an argument",
                            attr.span,
                        ))
                    }
                };
                if let Some(p) = self.tree.get_mut(id) {
                    p.color = color & 0xFF_FFFF;
                    p.explicit_color = true;
                }
            }
            "name" => {
                let name = string_arg(self, &args)?;
                if let Some(p) = self.tree.get_mut(id) {
                    p.display_name = Some(name);
                }
            }
            "comment" => {
                let comment = string_arg(self, &args)?;
                if let Some(p) = self.tree.get_mut(id) {
                    p.comment = Some(comment);
                }
            }
            "format" | "format_read" => {
                let function = string_arg(self, &args)?;
                let formatted = self.call_named(&function, vec![Value::Pattern(id)], attr.span)?;
                let formatted = match self.load(formatted.clone()) {
                    Ok(v) => v.to_string(),
                    Err(_) => formatted.to_string(),
                };
                if let Some(p) = self.tree.get_mut(id) {
                    p.format = Some(formatted);
                }
            }
            "hex::visualize" | "hex::inline_visualize" => {
                let name = string_arg(self, &args)?;
                let inline = attr.name == "hex::inline_visualize";
                let visualizer = if inline {
                    self.ext.inline_visualizer(&name)
                } else {
                    self.ext.visualizer(&name)
                };
                let visualizer = visualizer.ok_or_else(|| {
                    EvalError::at(
                        ErrorCode::UnknownExtension,
                        format!("unknown visualizer '{}'", name),
                        attr.span,
                    )
                })?;
                if !visualizer.arity.accepts(args.len() - 1) {
                    return Err(EvalError::at(
                        ErrorCode::ArityMismatch,
                        format!(
                            "visualizer '{}' expects {} arguments, got {}",
                            name,
                            visualizer.arity,
                            args.len() - 1
                        ),
                        attr.span,
                    ));
                }
            }
            _ => {}
        }

        let visibility = match attr.name.as_str() {
            "hidden" => Some(Visibility::Hidden),
            "highlight_hidden" => Some(Visibility::HighlightHidden),
            _ => None,
        };
        if let Some(p) = self.tree.get_mut(id) {
            if let Some(v) = visibility {
                p.visibility = p.visibility.max(v);
            }
            match attr.name.as_str() {
                "inline" => p.inline = true,
                "sealed" => p.sealed = true,
                _ => {}
            }
            p.attributes.push(PatternAttribute {
                name: attr.name.clone(),
                args: args.into_vec(),
            });
        }
        Ok(())
    }
}
