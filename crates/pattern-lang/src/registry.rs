//! Extension registry
//!
//! Tables of functions, types, pragmas, visualizers and data-source kinds
//! contributed by the host. Tables are filled at startup and then frozen;
//! after `freeze()` every registration fails with [`RegistryError::Frozen`]
//! and the registry may be shared across threads behind an `Arc`.
//!
//! Each runtime keeps a second, local registry for per-runtime additions
//! (`Runtime::add_function` and friends). Lookups go through [`Extensions`],
//! which consults the local table first.

use crate::config::{Metadata, RunSettings, MAX_EVAL_DEPTH, MAX_LIMIT};
use crate::error::EvalError;
use crate::eval::native::NativeContext;
use crate::eval::value::Value;
use crate::pattern::{PatternId, PatternTree};
use crate::provider::Provider;
use crate::types::{BitOrder, Builtin, Endian, TypeSpec};
use rustc_hash::FxHashMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Registration attempted after `freeze()`
    Frozen,
    /// The name is reserved (a built-in type)
    Duplicate(String),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegistryError::Frozen => f.write_str("extension registry is frozen"),
            RegistryError::Duplicate(name) => write!(f, "'{}' is reserved", name),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Accepted argument counts of a function, type or visualizer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Exactly(usize),
    AtLeast(usize),
    Between(usize, usize),
}

impl Arity {
    pub fn accepts(&self, n: usize) -> bool {
        match *self {
            Arity::Exactly(k) => n == k,
            Arity::AtLeast(k) => n >= k,
            Arity::Between(lo, hi) => lo <= n && n <= hi,
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Exactly(k) => write!(f, "{}", k),
            Arity::AtLeast(k) => write!(f, "at least {}", k),
            Arity::Between(lo, hi) => write!(f, "{} to {}", lo, hi),
        }
    }
}

pub type NativeFn =
    Arc<dyn Fn(&mut NativeContext<'_>, &[Value]) -> Result<Value, EvalError> + Send + Sync>;

/// Wrap a closure as a [`NativeFn`]
pub fn native(
    f: impl Fn(&mut NativeContext<'_>, &[Value]) -> Result<Value, EvalError> + Send + Sync + 'static,
) -> NativeFn {
    Arc::new(f)
}

#[derive(Clone)]
pub struct FunctionEntry {
    pub namespace: String,
    pub name: String,
    pub arity: Arity,
    pub callback: NativeFn,
    pub dangerous: bool,
}

pub type TypeFactory = Arc<dyn Fn(&[Value]) -> Result<TypeSpec, String> + Send + Sync>;

#[derive(Clone)]
pub struct TypeEntry {
    pub namespace: String,
    pub name: String,
    pub arity: Arity,
    pub factory: TypeFactory,
}

/// What a pragma handler may change
pub struct PragmaContext<'a> {
    pub settings: &'a mut RunSettings,
    pub metadata: &'a mut Metadata,
}

/// Returns false to reject the value
pub type PragmaHandler = Arc<dyn Fn(&mut PragmaContext<'_>, &str) -> bool + Send + Sync>;

pub type VisualizerFn =
    Arc<dyn Fn(&PatternTree, PatternId, &[Value]) -> Result<String, String> + Send + Sync>;

#[derive(Clone)]
pub struct Visualizer {
    pub arity: Arity,
    pub callback: VisualizerFn,
}

pub type DataSourceFactory = Arc<dyn Fn() -> Result<Arc<dyn Provider>, String> + Send + Sync>;

/// Insertion-ordered table. Re-registering a key replaces the entry in place.
struct Table<T> {
    kind: &'static str,
    entries: Vec<(String, T)>,
    index: FxHashMap<String, usize>,
}

impl<T> Table<T> {
    fn new(kind: &'static str) -> Self {
        Self {
            kind,
            entries: Vec::new(),
            index: FxHashMap::default(),
        }
    }

    fn insert(&mut self, key: String, value: T) {
        match self.index.get(&key) {
            Some(&i) => {
                tracing::warn!(target: "pattern_lang::registry", "{} '{}' registered twice, replacing", self.kind, key);
                self.entries[i].1 = value;
            }
            None => {
                self.index.insert(key.clone(), self.entries.len());
                self.entries.push((key, value));
            }
        }
    }

    fn get(&self, key: &str) -> Option<&T> {
        self.index.get(key).map(|&i| &self.entries[i].1)
    }

    fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

impl<T> Drop for Table<T> {
    fn drop(&mut self) {
        // release in reverse insertion order
        while self.entries.pop().is_some() {}
    }
}

fn qualify(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{}::{}", namespace, name)
    }
}

pub struct ExtensionRegistry {
    functions: Table<FunctionEntry>,
    types: Table<TypeEntry>,
    pragmas: Table<PragmaHandler>,
    visualizers: Table<Visualizer>,
    inline_visualizers: Table<Visualizer>,
    data_sources: Table<DataSourceFactory>,
    frozen: bool,
}

impl Default for ExtensionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ExtensionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionRegistry")
            .field("functions", &self.functions.len())
            .field("types", &self.types.len())
            .field("pragmas", &self.pragmas.len())
            .field("visualizers", &self.visualizers.len())
            .field("frozen", &self.frozen)
            .finish()
    }
}

impl ExtensionRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self {
            functions: Table::new("function"),
            types: Table::new("type"),
            pragmas: Table::new("pragma"),
            visualizers: Table::new("visualizer"),
            inline_visualizers: Table::new("inline visualizer"),
            data_sources: Table::new("data source"),
            frozen: false,
        }
    }

    /// Registry with the `std` library and the default pragmas
    pub fn with_std() -> Self {
        let mut registry = Self::new();
        if let Err(e) = crate::stdlib::register(&mut registry) {
            tracing::error!(target: "pattern_lang::registry", error = %e, "registering the standard library failed");
        }
        register_default_pragmas(&mut registry);
        registry
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    fn check_open(&self) -> Result<(), RegistryError> {
        if self.frozen {
            Err(RegistryError::Frozen)
        } else {
            Ok(())
        }
    }

    pub fn add_function(
        &mut self,
        namespace: &str,
        name: &str,
        arity: Arity,
        callback: NativeFn,
    ) -> Result<(), RegistryError> {
        self.insert_function(namespace, name, arity, callback, false)
    }

    /// Like `add_function`, but every call asks the host for permission first
    pub fn add_dangerous_function(
        &mut self,
        namespace: &str,
        name: &str,
        arity: Arity,
        callback: NativeFn,
    ) -> Result<(), RegistryError> {
        self.insert_function(namespace, name, arity, callback, true)
    }

    fn insert_function(
        &mut self,
        namespace: &str,
        name: &str,
        arity: Arity,
        callback: NativeFn,
        dangerous: bool,
    ) -> Result<(), RegistryError> {
        self.check_open()?;
        self.functions.insert(
            qualify(namespace, name),
            FunctionEntry {
                namespace: namespace.to_string(),
                name: name.to_string(),
                arity,
                callback,
                dangerous,
            },
        );
        Ok(())
    }

    pub fn add_type(
        &mut self,
        namespace: &str,
        name: &str,
        arity: Arity,
        factory: TypeFactory,
    ) -> Result<(), RegistryError> {
        self.check_open()?;
        if namespace.is_empty() && Builtin::from_name(name).is_some() {
            return Err(RegistryError::Duplicate(name.to_string()));
        }
        self.types.insert(
            qualify(namespace, name),
            TypeEntry {
                namespace: namespace.to_string(),
                name: name.to_string(),
                arity,
                factory,
            },
        );
        Ok(())
    }

    pub fn add_pragma(&mut self, name: &str, handler: PragmaHandler) -> Result<(), RegistryError> {
        self.check_open()?;
        if name == "once" {
            return Err(RegistryError::Duplicate(name.to_string()));
        }
        self.pragmas.insert(name.to_string(), handler);
        Ok(())
    }

    pub fn add_visualizer(
        &mut self,
        name: &str,
        arity: Arity,
        callback: VisualizerFn,
    ) -> Result<(), RegistryError> {
        self.check_open()?;
        self.visualizers
            .insert(name.to_string(), Visualizer { arity, callback });
        Ok(())
    }

    pub fn add_inline_visualizer(
        &mut self,
        name: &str,
        arity: Arity,
        callback: VisualizerFn,
    ) -> Result<(), RegistryError> {
        self.check_open()?;
        self.inline_visualizers
            .insert(name.to_string(), Visualizer { arity, callback });
        Ok(())
    }

    pub fn add_data_source(
        &mut self,
        name: &str,
        factory: DataSourceFactory,
    ) -> Result<(), RegistryError> {
        self.check_open()?;
        self.data_sources.insert(name.to_string(), factory);
        Ok(())
    }

    pub fn function(&self, qualified: &str) -> Option<&FunctionEntry> {
        self.functions.get(qualified)
    }

    pub fn type_entry(&self, qualified: &str) -> Option<&TypeEntry> {
        self.types.get(qualified)
    }

    pub fn pragma(&self, name: &str) -> Option<&PragmaHandler> {
        self.pragmas.get(name)
    }

    pub fn visualizer(&self, name: &str) -> Option<&Visualizer> {
        self.visualizers.get(name)
    }

    pub fn inline_visualizer(&self, name: &str) -> Option<&Visualizer> {
        self.inline_visualizers.get(name)
    }

    pub fn data_source_kinds(&self) -> impl Iterator<Item = &str> {
        self.data_sources.keys()
    }

    /// Instantiate a data source of a registered kind
    pub fn create_data_source(&self, kind: &str) -> Option<Result<Arc<dyn Provider>, String>> {
        self.data_sources.get(kind).map(|factory| factory())
    }

    pub fn function_names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys()
    }

    pub fn pragma_names(&self) -> impl Iterator<Item = &str> {
        self.pragmas.keys()
    }
}

/// Lookup view over a runtime's local registry layered on the shared one
#[derive(Clone, Copy)]
pub struct Extensions<'a> {
    pub local: &'a ExtensionRegistry,
    pub shared: &'a ExtensionRegistry,
}

impl<'a> Extensions<'a> {
    pub fn new(local: &'a ExtensionRegistry, shared: &'a ExtensionRegistry) -> Self {
        Self { local, shared }
    }

    pub fn function(&self, qualified: &str) -> Option<&'a FunctionEntry> {
        self.local
            .function(qualified)
            .or_else(|| self.shared.function(qualified))
    }

    pub fn type_entry(&self, qualified: &str) -> Option<&'a TypeEntry> {
        self.local
            .type_entry(qualified)
            .or_else(|| self.shared.type_entry(qualified))
    }

    pub fn pragma(&self, name: &str) -> Option<&'a PragmaHandler> {
        self.local.pragma(name).or_else(|| self.shared.pragma(name))
    }

    pub fn visualizer(&self, name: &str) -> Option<&'a Visualizer> {
        self.local
            .visualizer(name)
            .or_else(|| self.shared.visualizer(name))
    }

    pub fn inline_visualizer(&self, name: &str) -> Option<&'a Visualizer> {
        self.local
            .inline_visualizer(name)
            .or_else(|| self.shared.inline_visualizer(name))
    }
}

/// `0x10`, `0b101`, `0o17` or decimal
pub(crate) fn parse_number(s: &str) -> Option<u64> {
    let s = s.trim().replace('\'', "");
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else if let Some(bin) = s.strip_prefix("0b").or_else(|| s.strip_prefix("0B")) {
        u64::from_str_radix(bin, 2).ok()
    } else if let Some(oct) = s.strip_prefix("0o") {
        u64::from_str_radix(oct, 8).ok()
    } else {
        s.parse().ok()
    }
}

/// Numeric limit in `1..=max`
fn limit_pragma(max: u64, apply: fn(&mut RunSettings, u64)) -> PragmaHandler {
    handler(move |ctx, value| match parse_number(value) {
        Some(n) if n > 0 && n <= max => {
            apply(ctx.settings, n);
            true
        }
        _ => false,
    })
}

fn metadata_pragma(key: &'static str) -> PragmaHandler {
    handler(move |ctx, value| {
        let value = value.trim();
        if value.is_empty() {
            return false;
        }
        ctx.metadata.push(key, value.trim_matches('"'));
        true
    })
}

/// `magic [ 50 4B ?? 03 ] @ 0x00`
fn valid_magic(value: &str) -> bool {
    let Some(open) = value.find('[') else {
        return false;
    };
    let Some(close) = value.find(']') else {
        return false;
    };
    if close < open {
        return false;
    }
    let bytes_ok = value[open + 1..close].split_whitespace().all(|b| {
        b.len() == 2 && b.chars().all(|c| c.is_ascii_hexdigit() || c == '?')
    });
    let rest = value[close + 1..].trim();
    bytes_ok
        && rest
            .strip_prefix('@')
            .map(|addr| {
                let addr = addr.trim();
                let addr = addr.strip_prefix('-').unwrap_or(addr);
                parse_number(addr).is_some()
            })
            .unwrap_or(false)
}

fn handler(f: impl Fn(&mut PragmaContext<'_>, &str) -> bool + Send + Sync + 'static) -> PragmaHandler {
    Arc::new(f)
}

fn register_default_pragmas(registry: &mut ExtensionRegistry) {
    let pragmas: Vec<(&str, PragmaHandler)> = vec![
        (
            "endian",
            handler(|ctx, value| match Endian::parse(value.trim()) {
                Some(endian) => {
                    ctx.settings.endian = endian;
                    true
                }
                None => false,
            }),
        ),
        (
            "eval_depth",
            limit_pragma(MAX_EVAL_DEPTH as u64, |s, n| s.eval_depth = n as u32),
        ),
        ("array_limit", limit_pragma(MAX_LIMIT, |s, n| s.array_limit = n)),
        ("pattern_limit", limit_pragma(MAX_LIMIT, |s, n| s.pattern_limit = n)),
        ("loop_limit", limit_pragma(MAX_LIMIT, |s, n| s.loop_limit = n)),
        (
            "base_address",
            handler(|ctx, value| match parse_number(value) {
                Some(n) => {
                    ctx.settings.base_address = Some(n);
                    true
                }
                None => false,
            }),
        ),
        (
            "bitfield_order",
            handler(|ctx, value| {
                ctx.settings.bit_order = match value.trim() {
                    "left_to_right" => BitOrder::LeftToRight,
                    "right_to_left" => BitOrder::RightToLeft,
                    _ => return false,
                };
                true
            }),
        ),
        (
            "magic",
            handler(|ctx, value| {
                if !valid_magic(value) {
                    return false;
                }
                ctx.metadata.push("magic", value.trim());
                true
            }),
        ),
        ("MIME", metadata_pragma("MIME")),
        ("author", metadata_pragma("author")),
        ("description", metadata_pragma("description")),
        ("name", metadata_pragma("name")),
        ("version", metadata_pragma("version")),
        (
            "debug",
            handler(|ctx, value| {
                if !value.trim().is_empty() {
                    return false;
                }
                ctx.settings.debug = true;
                true
            }),
        ),
    ];
    for (name, handler) in pragmas {
        registry.pragmas.insert(name.to_string(), handler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MemoryProvider;

    fn constant(v: u128) -> NativeFn {
        native(move |_, _| Ok(Value::Unsigned(v)))
    }

    #[test]
    fn test_arity() {
        assert!(Arity::Exactly(2).accepts(2));
        assert!(!Arity::Exactly(2).accepts(1));
        assert!(Arity::AtLeast(1).accepts(5));
        assert!(Arity::Between(1, 2).accepts(2));
        assert!(!Arity::Between(1, 2).accepts(3));
    }

    #[test]
    fn test_freeze_rejects_registration() {
        let mut registry = ExtensionRegistry::new();
        registry.add_function("a", "f", Arity::Exactly(0), constant(1)).unwrap();
        registry.freeze();
        assert_eq!(
            registry.add_function("a", "g", Arity::Exactly(0), constant(2)).unwrap_err(),
            RegistryError::Frozen
        );
        assert!(registry.function("a::f").is_some());
        assert!(registry.function("a::g").is_none());
    }

    #[test]
    fn test_duplicate_overwrites_in_place() {
        let mut registry = ExtensionRegistry::new();
        registry.add_function("", "f", Arity::Exactly(0), constant(1)).unwrap();
        registry.add_function("", "h", Arity::Exactly(0), constant(3)).unwrap();
        registry.add_dangerous_function("", "f", Arity::Exactly(1), constant(2)).unwrap();
        let entry = registry.function("f").unwrap();
        assert!(entry.dangerous);
        assert_eq!(entry.arity, Arity::Exactly(1));
        assert_eq!(registry.function_names().collect::<Vec<_>>(), vec!["f", "h"]);
    }

    #[test]
    fn test_builtin_type_names_reserved() {
        let mut registry = ExtensionRegistry::new();
        let factory: TypeFactory = Arc::new(|_| Ok(TypeSpec::Builtin(Builtin::Bool)));
        assert!(matches!(
            registry.add_type("", "u8", Arity::Exactly(0), factory.clone()),
            Err(RegistryError::Duplicate(_))
        ));
        registry.add_type("my", "Flag", Arity::Exactly(0), factory).unwrap();
        assert!(registry.type_entry("my::Flag").is_some());
    }

    #[test]
    fn test_local_shadows_shared() {
        let mut shared = ExtensionRegistry::new();
        shared.add_function("", "f", Arity::Exactly(0), constant(1)).unwrap();
        shared.add_function("", "g", Arity::Exactly(0), constant(1)).unwrap();
        shared.freeze();
        let mut local = ExtensionRegistry::new();
        local.add_function("", "f", Arity::Exactly(3), constant(2)).unwrap();
        let ext = Extensions::new(&local, &shared);
        assert_eq!(ext.function("f").unwrap().arity, Arity::Exactly(3));
        assert_eq!(ext.function("g").unwrap().arity, Arity::Exactly(0));
        assert!(ext.function("nope").is_none());
    }

    #[test]
    fn test_default_pragmas() {
        let registry = ExtensionRegistry::with_std();
        let mut settings = RunSettings::default();
        let mut metadata = Metadata::default();
        let mut ctx = PragmaContext {
            settings: &mut settings,
            metadata: &mut metadata,
        };
        assert!(registry.pragma("endian").unwrap()(&mut ctx, "big"));
        assert!(!registry.pragma("endian").unwrap()(&mut ctx, "sideways"));
        assert!(registry.pragma("pattern_limit").unwrap()(&mut ctx, "0x100"));
        assert!(!registry.pragma("array_limit").unwrap()(&mut ctx, "0"));
        assert!(registry.pragma("MIME").unwrap()(&mut ctx, "application/zip"));
        assert!(registry.pragma("magic").unwrap()(&mut ctx, "[ 50 4B ?? 04 ] @ 0x00"));
        assert!(!registry.pragma("magic").unwrap()(&mut ctx, "PK"));
        assert!(registry.pragma("bitfield_order").unwrap()(&mut ctx, "left_to_right"));
        assert_eq!(settings.endian, Endian::Big);
        assert_eq!(settings.pattern_limit, 0x100);
        assert_eq!(settings.bit_order, BitOrder::LeftToRight);
        assert_eq!(metadata.get("MIME"), Some("application/zip"));
    }

    #[test]
    fn test_limit_pragmas_reject_values_above_ceiling() {
        let registry = ExtensionRegistry::with_std();
        let mut settings = RunSettings::default();
        let mut metadata = Metadata::default();
        let mut ctx = PragmaContext {
            settings: &mut settings,
            metadata: &mut metadata,
        };
        let eval_depth = registry.pragma("eval_depth").unwrap();
        assert!(!eval_depth(&mut ctx, "1000000"));
        assert!(eval_depth(&mut ctx, &MAX_EVAL_DEPTH.to_string()));
        assert!(!registry.pragma("pattern_limit").unwrap()(&mut ctx, "0xFFFFFFFFFFFF"));
        assert_eq!(settings.eval_depth, MAX_EVAL_DEPTH);
        assert_eq!(settings.pattern_limit, 0x2000);
    }

    #[test]
    fn test_data_source_factory() {
        let mut registry = ExtensionRegistry::new();
        registry
            .add_data_source(
                "zeros",
                Arc::new(|| Ok(Arc::new(MemoryProvider::new(vec![0; 16])) as Arc<dyn Provider>)),
            )
            .unwrap();
        assert_eq!(registry.data_source_kinds().collect::<Vec<_>>(), vec!["zeros"]);
        let provider = registry.create_data_source("zeros").unwrap().unwrap();
        assert_eq!(provider.actual_size(), 16);
        assert!(registry.create_data_source("disk").is_none());
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("0x10"), Some(16));
        assert_eq!(parse_number("1'000"), Some(1000));
        assert_eq!(parse_number("0b11"), Some(3));
        assert_eq!(parse_number("ten"), None);
    }
}
