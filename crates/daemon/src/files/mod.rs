//! Filesystem side of the adapter.
//!
//! This module provides:
//! - Confinement of client paths to the shared root
//! - The per-session handle registry
//! - Directory listing coordination (one scan per handle)
//! - The [`FileSystem`] capability and its local-disk implementation
//!
//! # Security
//!
//! Every client path goes through [`PathResolver`], which rejects any path
//! that climbs above the root. Symbolic links inside the root are followed
//! by the operating system and are not checked.

pub mod attrs;
pub mod backend;
pub mod handles;
pub mod listing;
pub mod resolver;

pub use attrs::{attributes_from_metadata, long_name, mode_string};
pub use backend::{FileSystem, LocalFile, LocalFs};
pub use handles::{HandleRegistry, OpenDir, OpenFile};
pub use listing::{scan_directory, DirectoryListing, ReadDirAction, ScanOutcome, Terminal};
pub use resolver::{PathResolver, ResolveError};
