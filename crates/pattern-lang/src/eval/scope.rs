// Scope stack for the evaluator
//
// Frame 0 holds globals. Function and type frames are opaque: a lookup that
// reaches one stops there and falls back to the globals. Block frames (if,
// loops, match arms) see everything of the frame they are nested in.

use super::types::{Binding, TypeInst};
use super::value::Value;
use crate::name::Name;
use crate::pattern::PatternId;
use crate::types::{Builtin, Endian};
use rustc_hash::FxHashMap;
use std::rc::Rc;

#[derive(Debug, Clone)]
pub(crate) struct Var {
    pub value: Value,
    /// Declared scalar type, used to narrow assigned values
    pub ty: Option<Builtin>,
    pub is_const: bool,
}

impl Var {
    pub fn new(value: Value, ty: Option<Builtin>, is_const: bool) -> Self {
        Self {
            value,
            ty,
            is_const,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameKind {
    Global,
    Function,
    Type,
    Block,
}

/// How members of a type frame are laid out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Layout {
    Sequential,
    /// Every member starts at `start`
    Union { start: u64 },
    /// Members are bit ranges; `bits` consumed so far
    Bits { start: u64, bits: u64 },
}

#[derive(Debug)]
pub(crate) struct Frame {
    pub kind: FrameKind,
    pub vars: FxHashMap<Name, Var>,
    /// Declaration order, for debugger snapshots
    pub order: Vec<Name>,
    pub ns: Rc<[Name]>,
    /// Pattern under construction (type frames)
    pub this: Option<PatternId>,
    pub inst: Option<Rc<TypeInst>>,
    pub endian: Endian,
    pub layout: Layout,
    /// Variadic arguments of a function frame
    pub pack: Option<(Name, Vec<Value>)>,
    /// Function or type name, for snapshots
    pub label: Option<String>,
}

impl Frame {
    pub fn new(kind: FrameKind, ns: Rc<[Name]>, endian: Endian) -> Self {
        Self {
            kind,
            vars: FxHashMap::default(),
            order: Vec::new(),
            ns,
            this: None,
            inst: None,
            endian,
            layout: Layout::Sequential,
            pack: None,
            label: None,
        }
    }

    fn opaque(&self) -> bool {
        matches!(self.kind, FrameKind::Function | FrameKind::Type)
    }
}

#[derive(Debug)]
pub(crate) struct Scopes {
    frames: Vec<Frame>,
}

impl Scopes {
    pub fn new(endian: Endian) -> Self {
        Self {
            frames: vec![Frame::new(FrameKind::Global, Rc::from(Vec::new()), endian)],
        }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn push(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    /// Block frame inheriting namespace, endian and `this` from the top frame
    pub fn push_block(&mut self) {
        let top = &self.frames[self.frames.len() - 1];
        let mut frame = Frame::new(FrameKind::Block, top.ns.clone(), top.endian);
        frame.this = top.this;
        self.frames.push(frame);
    }

    pub fn current_ns(&self) -> Rc<[Name]> {
        self.frames[self.frames.len() - 1].ns.clone()
    }

    pub fn pop(&mut self) -> Option<Frame> {
        if self.frames.len() > 1 {
            self.frames.pop()
        } else {
            None
        }
    }

    /// Truncate back to `depth` frames, e.g. after an error
    pub fn unwind_to(&mut self, depth: usize) {
        self.frames.truncate(depth.max(1));
    }

    pub fn top(&self) -> &Frame {
        &self.frames[self.frames.len() - 1]
    }

    pub fn top_mut(&mut self) -> &mut Frame {
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    fn owner_index(&self) -> usize {
        self.frames
            .iter()
            .rposition(|f| f.kind != FrameKind::Block)
            .unwrap_or(0)
    }

    /// Nearest non-block frame
    pub fn owner(&self) -> &Frame {
        &self.frames[self.owner_index()]
    }

    pub fn owner_mut(&mut self) -> &mut Frame {
        let i = self.owner_index();
        &mut self.frames[i]
    }

    /// Nearest type frame, unless a function frame comes first
    pub fn type_frame(&self) -> Option<&Frame> {
        let owner = self.owner();
        (owner.kind == FrameKind::Type).then_some(owner)
    }

    pub fn type_frame_mut(&mut self) -> Option<&mut Frame> {
        let owner = self.owner_mut();
        if owner.kind == FrameKind::Type {
            Some(owner)
        } else {
            None
        }
    }

    /// Nearest function frame
    pub fn function_frame(&self) -> Option<&Frame> {
        let owner = self.owner();
        (owner.kind == FrameKind::Function).then_some(owner)
    }

    pub fn in_function(&self) -> bool {
        self.frames.iter().any(|f| f.kind == FrameKind::Function)
    }

    pub fn at_top_level(&self) -> bool {
        self.owner().kind == FrameKind::Global
    }

    pub fn define(&mut self, name: Name, var: Var) {
        let frame = self.top_mut();
        if frame.vars.insert(name, var).is_none() {
            frame.order.push(name);
        }
    }

    pub fn define_global(&mut self, name: Name, var: Var) {
        let frame = &mut self.frames[0];
        if frame.vars.insert(name, var).is_none() {
            frame.order.push(name);
        }
    }

    fn find(&self, name: Name) -> Option<usize> {
        for (i, frame) in self.frames.iter().enumerate().rev() {
            if frame.vars.contains_key(&name) {
                return Some(i);
            }
            if frame.opaque() {
                break;
            }
        }
        self.frames[0].vars.contains_key(&name).then_some(0)
    }

    pub fn get(&self, name: Name) -> Option<&Var> {
        self.find(name).and_then(|i| self.frames[i].vars.get(&name))
    }

    pub fn get_mut(&mut self, name: Name) -> Option<&mut Var> {
        let i = self.find(name)?;
        self.frames[i].vars.get_mut(&name)
    }

    pub fn global(&self, name: Name) -> Option<&Var> {
        self.frames[0].vars.get(&name)
    }

    /// Variadic pack of the enclosing function, if `name` names it
    pub fn pack(&self, name: Name) -> Option<&[Value]> {
        self.function_frame()
            .and_then(|f| f.pack.as_ref())
            .filter(|(pack, _)| *pack == name)
            .map(|(_, values)| values.as_slice())
    }

    /// Template argument bound to `name` by an enclosing type instance
    pub fn binding(&self, name: Name) -> Option<&Binding> {
        for frame in self.frames.iter().rev() {
            if let Some(inst) = &frame.inst {
                if let Some((_, binding)) = inst.bindings.iter().find(|(n, _)| *n == name) {
                    return Some(binding);
                }
            }
            if frame.kind == FrameKind::Function {
                break;
            }
        }
        None
    }

    /// Forget variables bound to patterns that were rolled back
    pub fn purge_patterns(&mut self, len: usize) {
        let dead = |v: &Var| matches!(v.value, Value::Pattern(id) if id.0 as usize >= len);
        for frame in &mut self.frames {
            let before = frame.vars.len();
            frame.vars.retain(|_, v| !dead(v));
            if frame.vars.len() != before {
                let vars = &frame.vars;
                frame.order.retain(|n| vars.contains_key(n));
            }
            if matches!(frame.this, Some(id) if id.0 as usize >= len) {
                frame.this = None;
            }
        }
    }
}
