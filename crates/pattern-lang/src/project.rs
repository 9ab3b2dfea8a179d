//! Project archive: pattern sources saved per provider
//!
//! An archive is a directory:
//!
//! ```text
//! project.json
//! <provider-key>/pattern_source_code.hexpat
//! ```
//!
//! Sources are stored with trailing whitespace removed and loaded back
//! unchanged.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE: &str = "project.json";
pub const SOURCE_FILE: &str = "pattern_source_code.hexpat";
const FORMAT_VERSION: u32 = 1;

#[derive(Debug)]
pub enum ProjectError {
    Io(std::io::Error),
    Manifest(serde_json::Error),
    UnsupportedVersion(u32),
    /// Provider keys become directory names
    InvalidKey(String),
    MissingSource(String),
}

impl fmt::Display for ProjectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProjectError::Io(e) => write!(f, "project io error: {}", e),
            ProjectError::Manifest(e) => write!(f, "invalid project manifest: {}", e),
            ProjectError::UnsupportedVersion(v) => {
                write!(f, "unsupported project format version {}", v)
            }
            ProjectError::InvalidKey(key) => write!(f, "invalid provider key '{}'", key),
            ProjectError::MissingSource(key) => {
                write!(f, "provider '{}' has no {}", key, SOURCE_FILE)
            }
        }
    }
}

impl std::error::Error for ProjectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProjectError::Io(e) => Some(e),
            ProjectError::Manifest(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ProjectError {
    fn from(e: std::io::Error) -> Self {
        ProjectError::Io(e)
    }
}

impl From<serde_json::Error> for ProjectError {
    fn from(e: serde_json::Error) -> Self {
        ProjectError::Manifest(e)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Manifest {
    version: u32,
    providers: Vec<ProviderRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ProviderRecord {
    key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
struct ProviderSource {
    name: Option<String>,
    source: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectArchive {
    providers: BTreeMap<String, ProviderSource>,
}

fn check_key(key: &str) -> Result<(), ProjectError> {
    let valid = !key.is_empty()
        && key != "."
        && key != ".."
        && !key.contains(['/', '\\', ':'])
        && !key.chars().any(char::is_control);
    if valid {
        Ok(())
    } else {
        Err(ProjectError::InvalidKey(key.to_string()))
    }
}

impl ProjectArchive {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the source of provider `key`; `name` is a display name for hosts
    pub fn set_source(
        &mut self,
        key: &str,
        name: Option<&str>,
        source: &str,
    ) -> Result<(), ProjectError> {
        check_key(key)?;
        self.providers.insert(
            key.to_string(),
            ProviderSource {
                name: name.map(str::to_string),
                source: source.trim_end().to_string(),
            },
        );
        Ok(())
    }

    pub fn source(&self, key: &str) -> Option<&str> {
        self.providers.get(key).map(|p| p.source.as_str())
    }

    pub fn name(&self, key: &str) -> Option<&str> {
        self.providers.get(key).and_then(|p| p.name.as_deref())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.providers.remove(key).is_some()
    }

    pub fn save(&self, root: &Path) -> Result<(), ProjectError> {
        std::fs::create_dir_all(root)?;
        let manifest = Manifest {
            version: FORMAT_VERSION,
            providers: self
                .providers
                .iter()
                .map(|(key, p)| ProviderRecord {
                    key: key.clone(),
                    name: p.name.clone(),
                })
                .collect(),
        };
        for (key, p) in &self.providers {
            let dir = root.join(key);
            std::fs::create_dir_all(&dir)?;
            std::fs::write(dir.join(SOURCE_FILE), &p.source)?;
        }
        std::fs::write(root.join(MANIFEST_FILE), serde_json::to_string_pretty(&manifest)?)?;
        tracing::debug!(
            target: "pattern_lang::project",
            path = %root.display(),
            providers = self.providers.len(),
            "project saved"
        );
        Ok(())
    }

    pub fn load(root: &Path) -> Result<Self, ProjectError> {
        let manifest: Manifest =
            serde_json::from_str(&std::fs::read_to_string(root.join(MANIFEST_FILE))?)?;
        if manifest.version != FORMAT_VERSION {
            return Err(ProjectError::UnsupportedVersion(manifest.version));
        }
        let mut providers = BTreeMap::new();
        for record in manifest.providers {
            check_key(&record.key)?;
            let path: PathBuf = root.join(&record.key).join(SOURCE_FILE);
            let source = match std::fs::read_to_string(&path) {
                Ok(source) => source,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(ProjectError::MissingSource(record.key))
                }
                Err(e) => return Err(e.into()),
            };
            providers.insert(
                record.key,
                ProviderSource {
                    name: record.name,
                    source,
                },
            );
        }
        Ok(Self { providers })
    }
}
