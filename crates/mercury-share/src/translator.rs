//! Mapping file paths between a peer's disk and the shared namespace.

use std::path::{Path, PathBuf};

/// Prefix of paths in the shared namespace.
pub const SHARED_ROOT: &str = "vsls:";

/// Converts file paths carried by cells and requests.
pub trait PathTranslator: Send + Sync {
    /// Local path → the form sent to the other side.
    fn to_shared(&self, local: &str) -> String;

    /// Shared path → a path on this machine.
    fn to_local(&self, shared: &str) -> String;
}

/// Leaves paths untouched. Used when both sides see the same disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityTranslator;

impl PathTranslator for IdentityTranslator {
    fn to_shared(&self, local: &str) -> String {
        local.to_string()
    }

    fn to_local(&self, shared: &str) -> String {
        shared.to_string()
    }
}

/// Swaps a local workspace root for a shared prefix such as `vsls:`.
///
/// Paths outside the root pass through unchanged.
#[derive(Debug, Clone)]
pub struct PrefixTranslator {
    local_root: PathBuf,
    shared_root: String,
}

impl PrefixTranslator {
    pub fn new(local_root: impl Into<PathBuf>, shared_root: impl Into<String>) -> Self {
        Self {
            local_root: local_root.into(),
            shared_root: shared_root.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn local_root(&self) -> &Path {
        &self.local_root
    }
}

impl PathTranslator for PrefixTranslator {
    fn to_shared(&self, local: &str) -> String {
        match Path::new(local).strip_prefix(&self.local_root) {
            Ok(rest) => {
                let rest: Vec<_> = rest
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect();
                format!("{}/{}", self.shared_root, rest.join("/"))
            }
            Err(_) => local.to_string(),
        }
    }

    fn to_local(&self, shared: &str) -> String {
        match shared.strip_prefix(&self.shared_root) {
            Some(rest) if rest.is_empty() || rest.starts_with('/') => {
                let mut path = self.local_root.clone();
                path.extend(rest.split('/').filter(|part| !part.is_empty()));
                path.to_string_lossy().to_string()
            }
            _ => shared.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity() {
        assert_eq!(IdentityTranslator.to_shared("/a/b.py"), "/a/b.py");
        assert_eq!(IdentityTranslator.to_local("/a/b.py"), "/a/b.py");
    }

    #[cfg(unix)]
    #[test]
    fn test_prefix_round_trip() {
        let translator = PrefixTranslator::new("/home/me/proj", "vsls:/");
        assert_eq!(translator.to_shared("/home/me/proj/src/a.py"), "vsls:/src/a.py");
        assert_eq!(translator.to_local("vsls:/src/a.py"), "/home/me/proj/src/a.py");
    }

    #[test]
    fn test_prefix_passes_foreign_paths() {
        let translator = PrefixTranslator::new("/home/me/proj", "vsls:");
        assert_eq!(translator.to_shared("/tmp/scratch.py"), "/tmp/scratch.py");
        assert_eq!(translator.to_local("vslsx/a.py"), "vslsx/a.py");
        assert_eq!(translator.to_local("untitled-1"), "untitled-1");
    }
}
