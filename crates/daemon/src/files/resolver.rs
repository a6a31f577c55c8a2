//! Mapping of client paths onto the shared root.
//!
//! Client paths are interpreted relative to the root whether or not they start
//! with `/`. Resolution is purely lexical: `.` segments are dropped, `..`
//! segments cancel the previous segment, and a `..` that would climb above
//! the root is rejected. Symbolic links inside the root are left to the
//! filesystem.

use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// Errors produced while resolving a client path.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    /// The path climbs above the shared root.
    #[error("path escapes the shared root: {0}")]
    EscapesRoot(String),
}

/// Resolves client paths against a fixed root directory.
#[derive(Debug, Clone)]
pub struct PathResolver {
    root: PathBuf,
}

impl PathResolver {
    /// Create a resolver for `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The shared root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a client path to an absolute path under the root.
    ///
    /// `""`, `"."` and `"/"` all name the root itself.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, ResolveError> {
        let segments = normalize(path)?;
        let mut resolved = self.root.clone();
        resolved.extend(segments);
        Ok(resolved)
    }

    /// Client-visible canonical form of a path: `/` for the root, otherwise
    /// `/a/b` with every `.` and `..` folded away.
    pub fn canonical_name(&self, path: &str) -> Result<String, ResolveError> {
        let segments = normalize(path)?;
        if segments.is_empty() {
            return Ok("/".to_string());
        }
        let mut name = String::new();
        for segment in segments {
            name.push('/');
            name.push_str(&segment.to_string_lossy());
        }
        Ok(name)
    }
}

fn normalize(path: &str) -> Result<Vec<&OsStr>, ResolveError> {
    let mut segments = Vec::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(segment) => segments.push(segment),
            Component::ParentDir => {
                if segments.pop().is_none() {
                    return Err(ResolveError::EscapesRoot(path.to_string()));
                }
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    Ok(segments)
}
