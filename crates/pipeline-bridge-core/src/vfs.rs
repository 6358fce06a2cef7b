//! Module-private virtual filesystem
//!
//! Each module instance owns a sandbox directory on the host which it sees as
//! `/`. Guest paths are always resolved inside that directory.

use crate::error::CodecError;
use std::path::{Component, Path, PathBuf};

/// View of a module's sandbox directory
#[derive(Debug, Clone, Copy)]
pub struct VirtualFs<'a> {
    root: &'a Path,
}

impl<'a> VirtualFs<'a> {
    pub fn new(root: &'a Path) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        self.root
    }

    /// Map a guest path onto the host, refusing anything that escapes the sandbox
    pub fn resolve(&self, path: &str) -> Result<PathBuf, CodecError> {
        let mut resolved = self.root.to_path_buf();
        let mut depth = 0usize;
        for component in Path::new(path).components() {
            match component {
                Component::RootDir | Component::CurDir => {}
                Component::Normal(part) => {
                    resolved.push(part);
                    depth += 1;
                }
                Component::ParentDir | Component::Prefix(_) => {
                    return Err(CodecError::InvalidPath(path.to_string()));
                }
            }
        }
        if depth == 0 {
            return Err(CodecError::InvalidPath(path.to_string()));
        }
        Ok(resolved)
    }

    pub fn write(&self, path: &str, bytes: &[u8]) -> Result<(), CodecError> {
        let host_path = self.resolve(path)?;
        if let Some(parent) = host_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(host_path, bytes)?;
        Ok(())
    }

    pub fn read(&self, path: &str) -> Result<Vec<u8>, CodecError> {
        let host_path = self.resolve(path)?;
        Ok(std::fs::read(host_path)?)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.resolve(path).map(|p| p.exists()).unwrap_or(false)
    }

    pub fn remove(&self, path: &str) -> Result<(), CodecError> {
        let host_path = self.resolve(path)?;
        if host_path.is_dir() {
            std::fs::remove_dir_all(host_path)?;
        } else if host_path.exists() {
            std::fs::remove_file(host_path)?;
        }
        Ok(())
    }

    /// Remove every entry of the sandbox, keeping the root itself
    pub fn clear(&self) -> Result<(), CodecError> {
        for entry in std::fs::read_dir(self.root)? {
            let path = entry?.path();
            if path.is_dir() {
                std::fs::remove_dir_all(path)?;
            } else {
                std::fs::remove_file(path)?;
            }
        }
        Ok(())
    }
}

/// Join a guest directory and a relative entry with `/`
pub(crate) fn join(dir: &str, entry: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), entry)
}
