//! Kernel specifications.
//!
//! A kernel spec lives on disk as `<kernels dir>/<name>/kernel.json`.
//! [`KernelSpecCache`] keeps parsed specs keyed by file path and only
//! re-parses a file when its content hash changes.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;

/// Interpreter version triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl Version {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// Parse `3.11.4`, `3.11`, or `Python 3.11.4`.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let text = text.rsplit(' ').next().unwrap_or(text);
        let mut parts = text.split('.').map(|p| {
            p.chars()
                .take_while(|c| c.is_ascii_digit())
                .collect::<String>()
                .parse::<u32>()
                .ok()
        });
        let major = parts.next()??;
        let minor = parts.next().flatten().unwrap_or(0);
        let patch = parts.next().flatten().unwrap_or(0);
        Some(Self { major, minor, patch })
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// An interpreter a kernel should run on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterpreterInfo {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl InterpreterInfo {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            version: None,
            display_name: None,
        }
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }
}

/// `metadata` of a kernel spec.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelSpecMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interpreter: Option<InterpreterInfo>,
    /// Everything else, preserved on rewrite.
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

/// On-disk `kernel.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelSpecFile {
    pub argv: Vec<String>,
    pub display_name: String,
    #[serde(default)]
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<KernelSpecMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupt_mode: Option<String>,
}

impl KernelSpecFile {
    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), text)?;
        Ok(())
    }
}

/// A kernel specification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KernelSpec {
    /// Directory name of the spec (`python3`).
    pub name: String,
    pub display_name: String,
    pub language: String,
    /// Executable the kernel runs (`argv[0]`).
    pub path: String,
    pub argv: Vec<String>,
    /// Where the `kernel.json` lives, when known.
    pub spec_file_path: Option<PathBuf>,
    pub metadata: KernelSpecMetadata,
}

impl KernelSpec {
    /// Build from a parsed `kernel.json`.
    pub fn from_file(name: impl Into<String>, file: KernelSpecFile, spec_file_path: Option<PathBuf>) -> Self {
        Self {
            name: name.into(),
            display_name: file.display_name,
            language: file.language,
            path: file.argv.first().cloned().unwrap_or_default(),
            argv: file.argv,
            spec_file_path,
            metadata: file.metadata.unwrap_or_default(),
        }
    }

    /// Read `<dir>/kernel.json`, naming the spec after the directory.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let spec_file = dir.join("kernel.json");
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let file = KernelSpecFile::read(&spec_file)?;
        Ok(Self::from_file(name, file, Some(spec_file)))
    }

    /// Version of the interpreter recorded in the spec metadata.
    pub fn interpreter_version(&self) -> Option<Version> {
        self.metadata.interpreter.as_ref().and_then(|i| i.version)
    }
}

fn content_hash(bytes: &[u8]) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

/// Parsed kernel specs keyed by `kernel.json` path.
#[derive(Default)]
pub struct KernelSpecCache {
    entries: Mutex<HashMap<PathBuf, (u64, KernelSpec)>>,
}

impl KernelSpecCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the spec in `dir`, reusing the cached copy if the file is unchanged.
    pub fn load_dir(&self, dir: &Path) -> Result<KernelSpec> {
        let spec_file = dir.join("kernel.json");
        let bytes = std::fs::read(&spec_file)?;
        let hash = content_hash(&bytes);

        if let Ok(entries) = self.entries.lock() {
            if let Some((cached_hash, spec)) = entries.get(&spec_file) {
                if *cached_hash == hash {
                    return Ok(spec.clone());
                }
            }
        }

        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let file: KernelSpecFile = serde_json::from_slice(&bytes)?;
        let spec = KernelSpec::from_file(name, file, Some(spec_file.clone()));

        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(spec_file, (hash, spec.clone()));
        }
        Ok(spec)
    }

    /// Number of cached specs.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
