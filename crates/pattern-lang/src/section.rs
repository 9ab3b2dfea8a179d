// Named auxiliary byte buffers created by pattern programs

use crate::config::MAX_LIMIT;
use crate::error::{ErrorCode, EvalError};
use crate::provider::{check_bounds, MemoryProvider};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SectionId(pub u64);

impl SectionId {
    /// The provider itself
    pub const PROVIDER: SectionId = SectionId(0);
}

impl fmt::Display for SectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub id: SectionId,
    pub name: String,
    pub data: Vec<u8>,
}

/// Region of a section a virtual file was taken from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub section: SectionId,
    pub offset: u64,
    pub size: u64,
}

/// Bytes a program published under a path, e.g. an extracted archive entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualFile {
    pub path: String,
    pub data: Vec<u8>,
    pub region: Region,
}

#[derive(Debug, Clone)]
pub struct SectionStore {
    sections: BTreeMap<SectionId, Section>,
    next_id: u64,
    virtual_files: Vec<VirtualFile>,
    /// Largest size a write may grow a section to
    size_limit: u64,
}

impl Default for SectionStore {
    fn default() -> Self {
        Self {
            sections: BTreeMap::new(),
            next_id: 1,
            size_limit: MAX_LIMIT,
            virtual_files: Vec::new(),
        }
    }
}

impl SectionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_size_limit(size_limit: u64) -> Self {
        Self {
            size_limit,
            ..Self::default()
        }
    }

    /// Largest size a section may grow to
    pub fn size_limit(&self) -> u64 {
        self.size_limit
    }

    /// Allocate an empty section. Ids are never reused within a store.
    pub fn create(&mut self, name: impl Into<String>) -> SectionId {
        let id = SectionId(self.next_id);
        self.next_id += 1;
        self.sections.insert(
            id,
            Section {
                id,
                name: name.into(),
                data: Vec::new(),
            },
        );
        id
    }

    pub fn get(&self, id: SectionId) -> Option<&Section> {
        self.sections.get(&id)
    }

    pub fn get_mut(&mut self, id: SectionId) -> Option<&mut Section> {
        self.sections.get_mut(&id)
    }

    pub fn remove(&mut self, id: SectionId) -> Option<Section> {
        self.sections.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.sections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Section> {
        self.sections.values()
    }

    pub fn size(&self, id: SectionId) -> Result<u64, EvalError> {
        Ok(self.section(id)?.data.len() as u64)
    }

    pub fn read(&self, id: SectionId, offset: u64, buf: &mut [u8]) -> Result<(), EvalError> {
        let section = self.section(id)?;
        let at = check_bounds(0, section.data.len() as u64, offset, buf.len() as u64)?;
        buf.copy_from_slice(&section.data[at..at + buf.len()]);
        Ok(())
    }

    /// Write at `offset`, growing the section with zeros up to the size limit
    pub fn write(&mut self, id: SectionId, offset: u64, bytes: &[u8]) -> Result<(), EvalError> {
        let limit = self.size_limit;
        let section = self.section_mut(id)?;
        let end = offset
            .checked_add(bytes.len() as u64)
            .ok_or_else(|| EvalError::new(ErrorCode::OutOfBounds, "section write overflows"))?;
        if end > limit {
            return Err(EvalError::new(
                ErrorCode::OutOfBounds,
                format!(
                    "writing 0x{:X} bytes at 0x{:X} would grow section {} past its limit of 0x{:X}",
                    bytes.len(),
                    offset,
                    id,
                    limit
                ),
            ));
        }
        if end as usize > section.data.len() {
            section.data.resize(end as usize, 0);
        }
        section.data[offset as usize..end as usize].copy_from_slice(bytes);
        Ok(())
    }

    /// View a section as a standalone provider (a copy of its bytes)
    pub fn as_provider(&self, id: SectionId) -> Option<MemoryProvider> {
        self.get(id)
            .map(|s| MemoryProvider::new(s.data.clone()).read_only())
    }

    /// Write the raw bytes of a section to disk
    pub fn export(&self, id: SectionId, path: &Path) -> std::io::Result<()> {
        let section = self.get(id).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, format!("no section {}", id))
        })?;
        std::fs::write(path, &section.data)
    }

    pub fn add_virtual_file(&mut self, path: impl Into<String>, data: Vec<u8>, region: Region) {
        self.virtual_files.push(VirtualFile {
            path: path.into(),
            data,
            region,
        });
    }

    pub fn virtual_files(&self) -> &[VirtualFile] {
        &self.virtual_files
    }

    /// Drop every section and virtual file; ids keep increasing
    pub fn clear(&mut self) {
        self.sections.clear();
        self.virtual_files.clear();
    }

    fn section(&self, id: SectionId) -> Result<&Section, EvalError> {
        self.sections
            .get(&id)
            .ok_or_else(|| EvalError::new(ErrorCode::InvalidPlacement, format!("no section with id {}", id)))
    }

    fn section_mut(&mut self, id: SectionId) -> Result<&mut Section, EvalError> {
        self.sections
            .get_mut(&id)
            .ok_or_else(|| EvalError::new(ErrorCode::InvalidPlacement, format!("no section with id {}", id)))
    }
}
