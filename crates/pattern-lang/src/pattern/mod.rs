// Pattern tree: the arena of patterns a run produced, plus address queries
//
// Patterns are written once during a run and only read afterwards. Handles
// are plain indices into the arena; rolling back (`truncate`) drops every
// pattern created after a snapshot.

pub mod index;

use crate::eval::value::Value;
use crate::section::SectionId;
use crate::types::Endian;
use index::IntervalIndex;
use rustc_hash::{FxHashMap, FxHasher};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::Hasher;
use std::ops::Index;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PatternId(pub u32);

/// 0xRRGGBB
pub type Color = u32;

const PALETTE: [Color; 12] = [
    0x5A9BD5, 0xED7D31, 0x70AD47, 0xFFC000, 0x4472C4, 0xA5A5A5, 0x9E480E, 0x43682B, 0x997300,
    0x7030A0, 0xC00000, 0x2E75B6,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum Visibility {
    #[default]
    Visible,
    /// Highlighted, but no tooltip and not listed in tooltips
    HighlightHidden,
    /// Neither highlighted nor shown
    Hidden,
}

/// Decoded value of a pattern
#[derive(Debug, Clone, PartialEq)]
pub enum PatternValue {
    Unsigned(u128),
    Signed(i128),
    Float(f64),
    Bool(bool),
    Char(char),
    String(String),
    /// Value and the matching member, if any
    Enum { value: u128, member: Option<String> },
    Struct,
    Union,
    Array,
    Bitfield,
    Pointer { address: u64 },
    Padding,
}

impl PatternValue {
    /// Scalar value usable in expressions, `None` for aggregates
    pub fn to_value(&self) -> Option<Value> {
        Some(match self {
            PatternValue::Unsigned(v) => Value::Unsigned(*v),
            PatternValue::Signed(v) => Value::Signed(*v),
            PatternValue::Float(v) => Value::Float(*v),
            PatternValue::Bool(v) => Value::Bool(*v),
            PatternValue::Char(v) => Value::Char(*v),
            PatternValue::String(s) => Value::String(s.clone()),
            PatternValue::Enum { value, .. } => Value::Unsigned(*value),
            PatternValue::Pointer { address } => Value::Unsigned(*address as u128),
            _ => return None,
        })
    }

    pub fn is_aggregate(&self) -> bool {
        matches!(
            self,
            PatternValue::Struct | PatternValue::Union | PatternValue::Array | PatternValue::Bitfield
        )
    }
}

impl fmt::Display for PatternValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatternValue::Unsigned(v) => write!(f, "{} (0x{:X})", v, v),
            PatternValue::Signed(v) => write!(f, "{}", v),
            PatternValue::Float(v) => write!(f, "{}", v),
            PatternValue::Bool(v) => write!(f, "{}", v),
            PatternValue::Char(c) => write!(f, "'{}'", c.escape_default()),
            PatternValue::String(s) => write!(f, "\"{}\"", s.escape_default()),
            PatternValue::Enum { value, member } => match member {
                Some(name) => write!(f, "{} ({})", name, value),
                None => write!(f, "??? ({})", value),
            },
            PatternValue::Struct => f.write_str("{ ... }"),
            PatternValue::Union => f.write_str("union { ... }"),
            PatternValue::Array => f.write_str("[ ... ]"),
            PatternValue::Bitfield => f.write_str("bitfield { ... }"),
            PatternValue::Pointer { address } => write!(f, "*(0x{:X})", address),
            PatternValue::Padding => f.write_str("padding"),
        }
    }
}

/// Bit position of a bitfield member relative to its byte offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitRange {
    pub bit_offset: u32,
    pub width: u32,
}

/// Attribute as written in the program, e.g. `hex::visualize("image", data)`
#[derive(Debug, Clone, PartialEq)]
pub struct PatternAttribute {
    pub name: String,
    pub args: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Pattern {
    pub name: String,
    pub type_name: String,
    pub offset: u64,
    pub size: u64,
    pub section: SectionId,
    pub endian: Endian,
    pub value: PatternValue,
    /// Final color, assigned by `PatternTree::finalize` unless explicit
    pub color: Color,
    pub explicit_color: bool,
    /// As declared; `effective_visibility` includes inherited hiding
    pub visibility: Visibility,
    pub effective_visibility: Visibility,
    pub comment: Option<String>,
    pub display_name: Option<String>,
    pub format: Option<String>,
    pub sealed: bool,
    pub inline: bool,
    pub attributes: Vec<PatternAttribute>,
    pub parent: Option<PatternId>,
    pub children: Vec<PatternId>,
    pub bits: Option<BitRange>,
    /// Placed through a pointer or an explicit `@` inside a type, so it
    /// may lie outside the parent's range
    pub pointer_follow: bool,
}

impl Pattern {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>, offset: u64, size: u64) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            offset,
            size,
            section: SectionId::PROVIDER,
            endian: Endian::Little,
            value: PatternValue::Struct,
            color: 0,
            explicit_color: false,
            visibility: Visibility::Visible,
            effective_visibility: Visibility::Visible,
            comment: None,
            display_name: None,
            format: None,
            sealed: false,
            inline: false,
            attributes: Vec::new(),
            parent: None,
            children: Vec::new(),
            bits: None,
            pointer_follow: false,
        }
    }

    /// One past the last byte
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.size)
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.offset <= offset && offset < self.end()
    }

    pub fn attribute(&self, name: &str) -> Option<&PatternAttribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Name shown to users: `[[name(...)]]` overrides the declared name
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PatternTree {
    patterns: Vec<Pattern>,
    roots: Vec<PatternId>,
    indices: FxHashMap<SectionId, IntervalIndex>,
}

impl PartialEq for PatternTree {
    fn eq(&self, other: &Self) -> bool {
        self.patterns == other.patterns && self.roots == other.roots
    }
}

impl Index<PatternId> for PatternTree {
    type Output = Pattern;

    fn index(&self, id: PatternId) -> &Pattern {
        &self.patterns[id.0 as usize]
    }
}

impl PatternTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Insert a pattern, linking it under `pattern.parent` or as a root
    pub fn add(&mut self, pattern: Pattern) -> PatternId {
        let id = PatternId(self.patterns.len() as u32);
        match pattern.parent {
            Some(parent) => self.patterns[parent.0 as usize].children.push(id),
            None => self.roots.push(id),
        }
        self.patterns.push(pattern);
        id
    }

    pub fn get(&self, id: PatternId) -> Option<&Pattern> {
        self.patterns.get(id.0 as usize)
    }

    pub fn get_mut(&mut self, id: PatternId) -> Option<&mut Pattern> {
        self.patterns.get_mut(id.0 as usize)
    }

    pub fn roots(&self) -> &[PatternId] {
        &self.roots
    }

    pub fn iter(&self) -> impl Iterator<Item = (PatternId, &Pattern)> {
        self.patterns
            .iter()
            .enumerate()
            .map(|(i, p)| (PatternId(i as u32), p))
    }

    /// Root patterns of one section
    pub fn roots_in(&self, section: SectionId) -> impl Iterator<Item = PatternId> + '_ {
        self.roots
            .iter()
            .copied()
            .filter(move |id| self[*id].section == section)
    }

    /// Drop every pattern with an id >= `len`
    pub fn truncate(&mut self, len: usize) {
        if len >= self.patterns.len() {
            return;
        }
        self.patterns.truncate(len);
        let keep = |id: &PatternId| (id.0 as usize) < len;
        self.roots.retain(keep);
        for p in &mut self.patterns {
            p.children.retain(keep);
        }
        self.indices.clear();
    }

    /// Detach a pattern from its parent (or the roots) without freeing it
    pub fn unlink(&mut self, id: PatternId) {
        match self.patterns.get(id.0 as usize).and_then(|p| p.parent) {
            Some(parent) => self.patterns[parent.0 as usize].children.retain(|c| *c != id),
            None => self.roots.retain(|c| *c != id),
        }
    }

    /// Compute effective visibility and colors, and build the address index
    pub fn finalize(&mut self) {
        let mut stack: Vec<(PatternId, Visibility, Option<Color>, u64)> = self
            .roots
            .iter()
            .rev()
            .map(|id| {
                let name = self[*id].name.clone();
                (*id, Visibility::Visible, None, path_hash(0, &name))
            })
            .collect();
        while let Some((id, inherited, inherited_color, hash)) = stack.pop() {
            let p = &mut self.patterns[id.0 as usize];
            p.effective_visibility = p.visibility.max(inherited);
            if !p.explicit_color {
                p.color = inherited_color.unwrap_or(PALETTE[(hash % PALETTE.len() as u64) as usize]);
            }
            let child_visibility = if p.sealed {
                p.effective_visibility.max(Visibility::HighlightHidden)
            } else {
                p.effective_visibility
            };
            // array elements share the array's color
            let child_color = matches!(p.value, PatternValue::Array).then_some(p.color);
            let children = p.children.clone();
            for child in children.into_iter().rev() {
                let child_hash = path_hash(hash, &self[child].name);
                stack.push((child, child_visibility, child_color, child_hash));
            }
        }

        let mut per_section: FxHashMap<SectionId, Vec<(u64, u64, PatternId)>> = FxHashMap::default();
        for (id, p) in self.iter() {
            per_section
                .entry(p.section)
                .or_default()
                .push((p.offset, p.end(), id));
        }
        self.indices = per_section
            .into_iter()
            .map(|(section, ranges)| (section, IntervalIndex::build(ranges)))
            .collect();
    }

    /// Every pattern whose range contains `offset`, outermost first
    pub fn patterns_at(&self, offset: u64, section: SectionId) -> Vec<PatternId> {
        let mut hits = match self.indices.get(&section) {
            Some(index) => index.query(offset),
            None => self
                .iter()
                .filter(|(_, p)| p.section == section && p.contains(offset))
                .map(|(id, _)| id)
                .collect(),
        };
        hits.sort_by_key(|id| (self.depth(*id), *id));
        hits
    }

    /// Colors of the patterns covering `offset`, outermost first; hidden
    /// patterns contribute nothing
    pub fn colors_at(&self, offset: u64, section: SectionId) -> Vec<Color> {
        self.patterns_at(offset, section)
            .into_iter()
            .map(|id| &self[id])
            .filter(|p| p.effective_visibility != Visibility::Hidden)
            .map(|p| p.color)
            .collect()
    }

    /// Patterns worth a tooltip at `offset`: visible ones only
    pub fn tooltips_at(&self, offset: u64, section: SectionId) -> Vec<PatternId> {
        self.patterns_at(offset, section)
            .into_iter()
            .filter(|id| self[*id].effective_visibility == Visibility::Visible)
            .collect()
    }

    fn depth(&self, id: PatternId) -> usize {
        let mut depth = 0;
        let mut cur = self[id].parent;
        while let Some(p) = cur {
            depth += 1;
            cur = self[p].parent;
        }
        depth
    }

    /// `h.items[2].x` style path of a pattern
    pub fn qualified_name(&self, id: PatternId) -> String {
        let mut parts = Vec::new();
        let mut cur = Some(id);
        while let Some(p) = cur {
            let pattern = &self[p];
            if !pattern.inline || pattern.parent.is_none() {
                parts.push(pattern.name.as_str());
            }
            cur = pattern.parent;
        }
        let mut out = String::new();
        for part in parts.into_iter().rev() {
            if !out.is_empty() && !part.starts_with('[') {
                out.push('.');
            }
            out.push_str(part);
        }
        out
    }

    pub fn by_qualified_name(&self, path: &str) -> Option<PatternId> {
        let mut segments = Vec::new();
        for part in path.split('.') {
            let (head, indices) = match part.find('[') {
                Some(i) => part.split_at(i),
                None => (part, ""),
            };
            if !head.is_empty() {
                segments.push(head.to_string());
            }
            let mut rest = indices;
            while let Some(start) = rest.find('[') {
                let end = rest[start..].find(']')? + start;
                segments.push(rest[start..=end].to_string());
                rest = &rest[end + 1..];
            }
        }
        let (first, tail) = segments.split_first()?;
        let mut cur = self.find_in(&self.roots, first)?;
        for segment in tail {
            cur = self.find_in(&self[cur].children, segment)?;
        }
        Some(cur)
    }

    /// Child by name, looking through `inline` members
    pub fn find_in(&self, ids: &[PatternId], name: &str) -> Option<PatternId> {
        for id in ids {
            let p = &self[*id];
            if p.name == name {
                return Some(*id);
            }
        }
        ids.iter()
            .filter(|id| self[**id].inline)
            .find_map(|id| self.find_in(&self[*id].children, name))
    }

    /// Every pattern's range inside its section, for invariant checks
    pub fn ranges(&self) -> impl Iterator<Item = (PatternId, SectionId, u64, u64)> + '_ {
        self.iter().map(|(id, p)| (id, p.section, p.offset, p.end()))
    }
}

fn path_hash(seed: u64, segment: &str) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write_u64(seed);
    hasher.write(segment.as_bytes());
    hasher.finish()
}
