//! Runtime and orchestrator configuration
//!
//! `RuntimeConfig` holds the limits every run starts from. Pragmas adjust a
//! per-run copy (`RunSettings`) and never the configuration itself.

use crate::types::{BitOrder, Endian};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Deepest call and type nesting the 64 MiB worker stack can hold
pub const MAX_EVAL_DEPTH: u32 = 256;

/// Ceiling for the array, pattern, loop and section limits
pub const MAX_LIMIT: u64 = 0x1000_0000;

/// What to do when a program calls a dangerous function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DangerousPolicy {
    /// Ask the host's permission handler (deny if none is installed)
    #[default]
    Ask,
    Deny,
    Allow,
}

/// Limits and defaults a run starts with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Maximum nesting of function calls and type placements
    pub eval_depth: u32,
    /// Maximum element count of a single array
    pub array_limit: u64,
    /// Maximum number of patterns a run may create
    pub pattern_limit: u64,
    /// Maximum iterations of a single loop
    pub loop_limit: u64,
    /// Maximum size in bytes a program may grow a section to
    pub section_limit: u64,
    pub default_endian: Endian,
    pub dangerous_functions: DangerousPolicy,
    pub include_paths: Vec<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            eval_depth: 32,
            array_limit: 0x1000,
            pattern_limit: 0x2000,
            loop_limit: 0x1000,
            section_limit: 0x1000_0000,
            default_endian: Endian::Little,
            dangerous_functions: DangerousPolicy::Ask,
            include_paths: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    /// Reset zero or out-of-range limits back to their defaults
    pub fn validate(&mut self) {
        let defaults = Self::default();
        if self.eval_depth == 0 || self.eval_depth > MAX_EVAL_DEPTH {
            self.eval_depth = defaults.eval_depth;
        }
        for (limit, default) in [
            (&mut self.array_limit, defaults.array_limit),
            (&mut self.pattern_limit, defaults.pattern_limit),
            (&mut self.loop_limit, defaults.loop_limit),
            (&mut self.section_limit, defaults.section_limit),
        ] {
            if *limit == 0 || *limit > MAX_LIMIT {
                *limit = default;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Evaluate after the debounce period, not just parse
    pub auto_evaluate: bool,
    /// Quiet period after the last edit
    pub debounce_ms: u64,
    pub worker_threads: usize,
    pub runtime: RuntimeConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            auto_evaluate: false,
            debounce_ms: 1000,
            worker_threads: 2,
            runtime: RuntimeConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&mut self) {
        if self.worker_threads == 0 {
            self.worker_threads = 1;
        }
        self.runtime.validate();
    }
}

/// Effective settings of one run: the config plus pragma overrides
#[derive(Debug, Clone, PartialEq)]
pub struct RunSettings {
    pub eval_depth: u32,
    pub array_limit: u64,
    pub pattern_limit: u64,
    pub loop_limit: u64,
    pub section_limit: u64,
    pub endian: Endian,
    pub bit_order: BitOrder,
    /// `#pragma base_address`: where offset 0 of the provider appears
    pub base_address: Option<u64>,
    /// `#pragma debug`
    pub debug: bool,
}

impl From<&RuntimeConfig> for RunSettings {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            eval_depth: config.eval_depth,
            array_limit: config.array_limit,
            pattern_limit: config.pattern_limit,
            loop_limit: config.loop_limit,
            section_limit: config.section_limit,
            endian: config.default_endian,
            bit_order: BitOrder::default(),
            base_address: None,
            debug: false,
        }
    }
}

impl Default for RunSettings {
    fn default() -> Self {
        Self::from(&RuntimeConfig::default())
    }
}

/// Descriptive pragmas (`MIME`, `author`, ...) and global doc comments
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    entries: Vec<(String, String)>,
}

impl Metadata {
    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.push((key.into(), value.into()));
    }

    /// First value recorded for `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
