// Source units, spans and resolved locations for diagnostics

use std::fmt;
use std::sync::Arc;

/// Index of a source unit inside a [`SourceMap`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct SourceId(pub u32);

/// Byte range inside one source unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Span {
    pub start: u32,
    pub end: u32,
    pub source_id: SourceId,
}

impl Span {
    pub fn new(start: u32, end: u32, source_id: SourceId) -> Self {
        Self {
            start,
            end,
            source_id,
        }
    }

    pub fn dummy() -> Self {
        Self::default()
    }

    /// Cover both spans. Spans from different units keep `self`.
    pub fn to(self, other: Span) -> Span {
        if self.source_id != other.source_id {
            return self;
        }
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
            source_id: self.source_id,
        }
    }

    pub fn len(&self) -> u32 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One piece of source text: the main program or an included file
#[derive(Debug, Clone)]
pub struct SourceUnit {
    pub name: Arc<str>,
    pub text: Arc<str>,
    pub is_main: bool,
    line_starts: Vec<u32>,
}

impl SourceUnit {
    pub fn new(name: impl Into<Arc<str>>, text: impl Into<Arc<str>>, is_main: bool) -> Self {
        let text = text.into();
        let line_starts = std::iter::once(0)
            .chain(memchr::memchr_iter(b'\n', text.as_bytes()).map(|i| i as u32 + 1))
            .collect();
        Self {
            name: name.into(),
            text,
            is_main,
            line_starts,
        }
    }

    /// 1-based (line, column) of a byte offset
    pub fn line_col(&self, offset: u32) -> (u32, u32) {
        let line = match self.line_starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i.saturating_sub(1),
        };
        (line as u32 + 1, offset - self.line_starts[line] + 1)
    }

    /// Byte offset where the given 1-based line ends (exclusive of the newline)
    pub fn line_end(&self, offset: u32) -> u32 {
        let (line, _) = self.line_col(offset);
        self.line_starts
            .get(line as usize)
            .map(|next| next - 1)
            .unwrap_or(self.text.len() as u32)
    }

    pub fn line_count(&self) -> usize {
        self.line_starts.len()
    }
}

/// All source units taking part in one compilation
#[derive(Debug, Clone, Default)]
pub struct SourceMap {
    units: Vec<SourceUnit>,
}

impl SourceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, unit: SourceUnit) -> SourceId {
        let id = SourceId(self.units.len() as u32);
        self.units.push(unit);
        id
    }

    pub fn get(&self, id: SourceId) -> Option<&SourceUnit> {
        self.units.get(id.0 as usize)
    }

    pub fn find(&self, name: &str) -> Option<SourceId> {
        self.units
            .iter()
            .position(|u| &*u.name == name)
            .map(|i| SourceId(i as u32))
    }

    pub fn main(&self) -> Option<SourceId> {
        self.units
            .iter()
            .position(|u| u.is_main)
            .map(|i| SourceId(i as u32))
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Resolve a span to a self-contained location
    pub fn locate(&self, span: Span) -> Location {
        match self.get(span.source_id) {
            Some(unit) => {
                let (line, column) = unit.line_col(span.start);
                Location {
                    source: unit.name.clone(),
                    line,
                    column,
                    length: span.len(),
                }
            }
            None => Location::unknown(),
        }
    }

    /// Source line a span starts on
    pub fn line_of(&self, span: Span) -> u32 {
        self.get(span.source_id)
            .map(|u| u.line_col(span.start).0)
            .unwrap_or(0)
    }
}

/// `(source, line, column, length)` attached to every diagnostic
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Location {
    pub source: Arc<str>,
    pub line: u32,
    pub column: u32,
    pub length: u32,
}

impl Location {
    pub fn unknown() -> Self {
        Self {
            source: Arc::from("<unknown>"),
            line: 0,
            column: 0,
            length: 0,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.source, self.line, self.column)
    }
}
