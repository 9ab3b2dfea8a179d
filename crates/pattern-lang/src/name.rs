// Interned identifiers
//
// A `Name` is a u32 index into the interner of the program it was parsed
// with. Qualified paths (`ns::Type`) are interned as a whole string so that
// resolution can compare them by index.

use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::Arc;

/// Interned identifier. Equality and hashing are integer operations.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Name(u32);

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct StringInterner {
    strings: Vec<Arc<str>>,
    lookup: FxHashMap<Arc<str>, Name>,
}

impl StringInterner {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn intern(&mut self, s: &str) -> Name {
        if let Some(&name) = self.lookup.get(s) {
            return name;
        }
        let name = Name(self.strings.len() as u32);
        let shared: Arc<str> = Arc::from(s);
        self.strings.push(shared.clone());
        self.lookup.insert(shared, name);
        name
    }

    /// Intern the `::`-joined form of a path
    pub fn intern_path(&mut self, path: &[Name]) -> Name {
        let joined = self.join(path);
        self.intern(&joined)
    }

    pub fn get(&self, s: &str) -> Option<Name> {
        self.lookup.get(s).copied()
    }

    #[inline]
    pub fn resolve(&self, name: Name) -> &str {
        self.strings
            .get(name.0 as usize)
            .map(|s| &**s)
            .unwrap_or("<?>")
    }

    /// Shared handle to the string, for values that outlive the interner borrow
    pub fn resolve_arc(&self, name: Name) -> Arc<str> {
        self.strings
            .get(name.0 as usize)
            .cloned()
            .unwrap_or_else(|| Arc::from("<?>"))
    }

    pub fn join(&self, path: &[Name]) -> String {
        let mut out = String::new();
        for (i, part) in path.iter().enumerate() {
            if i > 0 {
                out.push_str("::");
            }
            out.push_str(self.resolve(*part));
        }
        out
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }
}
