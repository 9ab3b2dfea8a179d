// What native (host-registered) functions get to see of a run

use super::control::ExecControl;
use super::value::Value;
use crate::config::RunSettings;
use crate::error::{ErrorCode, EvalError};
use crate::log::{LogConsole, LogLevel};
use crate::pattern::{PatternId, PatternTree};
use crate::provider::{check_bounds, Provider};
use crate::section::{SectionId, SectionStore};
use rustc_hash::FxHashMap;
use std::fs::File;
use std::path::PathBuf;

/// The provider as the program sees it: `#pragma base_address` moves the
/// first byte to `base` without touching the provider
#[derive(Clone, Copy)]
pub struct DataView<'a> {
    provider: &'a dyn Provider,
    base: u64,
}

impl<'a> DataView<'a> {
    pub fn new(provider: &'a dyn Provider, base_override: Option<u64>) -> Self {
        Self {
            provider,
            base: base_override.unwrap_or_else(|| provider.base_address()),
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.provider.actual_size()
    }

    pub fn end(&self) -> u64 {
        self.base.saturating_add(self.size())
    }

    fn translate(&self, address: u64, len: u64) -> Result<u64, EvalError> {
        if !self.provider.is_available() {
            return Err(EvalError::new(ErrorCode::OutOfBounds, "data source is not available"));
        }
        let rel = check_bounds(self.base, self.size(), address, len)?;
        Ok(self.provider.base_address() + rel as u64)
    }

    pub fn read(&self, address: u64, buf: &mut [u8]) -> Result<(), EvalError> {
        let at = self.translate(address, buf.len() as u64)?;
        self.provider.read(at, buf)?;
        Ok(())
    }

    pub fn write(&self, address: u64, bytes: &[u8]) -> Result<(), EvalError> {
        let at = self.translate(address, bytes.len() as u64)?;
        self.provider.write(at, bytes)?;
        Ok(())
    }
}

/// A host file opened by `std::file`
#[derive(Debug)]
pub struct OpenFile {
    pub file: File,
    pub path: PathBuf,
}

/// Host files opened during one run. Handles count from 1 and every file
/// still open is closed when the run ends.
#[derive(Debug, Default)]
pub struct FileTable {
    next: u128,
    open: FxHashMap<u128, OpenFile>,
}

impl FileTable {
    pub fn insert(&mut self, path: impl Into<PathBuf>, file: File) -> u128 {
        self.next += 1;
        self.open.insert(
            self.next,
            OpenFile {
                file,
                path: path.into(),
            },
        );
        self.next
    }

    pub fn get_mut(&mut self, handle: u128) -> Result<&mut File, EvalError> {
        self.open
            .get_mut(&handle)
            .map(|f| &mut f.file)
            .ok_or_else(|| invalid_handle(handle))
    }

    pub fn remove(&mut self, handle: u128) -> Result<OpenFile, EvalError> {
        self.open.remove(&handle).ok_or_else(|| invalid_handle(handle))
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }
}

fn invalid_handle(handle: u128) -> EvalError {
    EvalError::new(ErrorCode::NativeFailure, format!("invalid file handle {}", handle))
}

/// Context handed to every native function call
pub struct NativeContext<'a> {
    pub data: DataView<'a>,
    pub sections: &'a mut SectionStore,
    pub tree: &'a PatternTree,
    pub console: &'a LogConsole,
    pub env: &'a FxHashMap<String, Value>,
    pub settings: &'a RunSettings,
    pub control: &'a ExecControl,
    pub files: &'a mut FileTable,
    /// `$` at the call site
    pub cursor: u64,
    /// Section the caller is placing into
    pub section: SectionId,
    pub(crate) last_address: &'a mut u64,
}

impl NativeContext<'_> {
    /// Read from the provider or a section
    pub fn read(
        &mut self,
        section: SectionId,
        address: u64,
        buf: &mut [u8],
    ) -> Result<(), EvalError> {
        *self.last_address = address;
        if section == SectionId::PROVIDER {
            self.data.read(address, buf)
        } else {
            self.sections.read(section, address, buf)
        }
    }

    pub fn read_vec(
        &mut self,
        section: SectionId,
        address: u64,
        len: u64,
    ) -> Result<Vec<u8>, EvalError> {
        let (base, size) = if section == SectionId::PROVIDER {
            (self.data.base(), self.data.size())
        } else {
            (0, self.sections.size(section)?)
        };
        check_bounds(base, size, address, len)?;
        let mut buf = vec![0u8; len as usize];
        self.read(section, address, &mut buf)?;
        Ok(buf)
    }

    /// Size of the provider view or a section
    pub fn section_size(&self, section: SectionId) -> Result<u64, EvalError> {
        if section == SectionId::PROVIDER {
            Ok(self.data.size())
        } else {
            self.sections.size(section)
        }
    }

    /// Long-running natives poll this between chunks of work
    pub fn check_abort(&self) -> Result<(), EvalError> {
        self.control.check()
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.console.log(level, message);
    }

    /// Scalar behind an argument; pattern arguments are read back
    pub fn scalar(&self, value: &Value) -> Result<Value, EvalError> {
        match value {
            Value::Pattern(id) => {
                let p = self
                    .tree
                    .get(*id)
                    .ok_or_else(|| EvalError::type_mismatch("stale pattern reference"))?;
                p.value.to_value().ok_or_else(|| {
                    EvalError::type_mismatch(format!(
                        "'{}' of type '{}' cannot be used as a value",
                        p.name, p.type_name
                    ))
                })
            }
            other => Ok(other.clone()),
        }
    }

    /// Offset and size of a pattern argument
    pub fn pattern_range(&self, id: PatternId) -> Result<(SectionId, u64, u64), EvalError> {
        let p = self
            .tree
            .get(id)
            .ok_or_else(|| EvalError::type_mismatch("stale pattern reference"))?;
        Ok((p.section, p.offset, p.size))
    }
}
