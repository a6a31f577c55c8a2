//! Directory listing coordination.
//!
//! Each open directory handle owns a [`DirectoryListing`]. The first READDIR
//! starts a scan; READDIRs that arrive while it runs are queued; when the
//! scan finishes every queued request receives the same answer. After that
//! the handle is exhausted and further READDIRs are answered from the
//! recorded outcome without touching the filesystem.
//!
//! ```text
//!   Idle ──READDIR──▶ Scanning ──scan done──▶ Completed(Eof | Failed)
//!                       │  ▲
//!                       └──┘ READDIR (queued)
//!   any ──CLOSE──▶ Closed   (a late scan result is discarded)
//! ```

use std::io;
use std::path::Path;

use futures_util::future::join_all;
use protocol::messages::{NameEntry, RequestId, StatusCode};
use tracing::trace;

use super::attrs::long_name;
use super::backend::FileSystem;

/// Recorded result of a finished listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    /// Entries were delivered (or the directory was empty).
    Eof,
    /// The directory could not be read.
    Failed,
}

impl Terminal {
    /// Status replayed to READDIRs after completion.
    pub fn status(self) -> StatusCode {
        match self {
            Terminal::Eof => StatusCode::Eof,
            Terminal::Failed => StatusCode::Failure,
        }
    }
}

#[derive(Debug)]
enum ListingState {
    Idle,
    Scanning { pending: Vec<RequestId> },
    Completed(Terminal),
    Closed,
}

/// What the dispatcher must do for a READDIR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadDirAction {
    /// Answer right away with this status.
    Reply(StatusCode),
    /// The request joined a running scan and will be answered with it.
    Queued,
    /// The request is the first; start the scan.
    Scan,
}

/// Result of enumerating a directory.
#[derive(Debug)]
pub enum ScanOutcome {
    /// Reading the directory failed.
    Failed(io::Error),
    /// The directory has no entries.
    Empty,
    /// Entries whose metadata could be read.
    Entries(Vec<NameEntry>),
}

/// Listing state of one directory handle.
#[derive(Debug)]
pub struct DirectoryListing {
    state: ListingState,
    eof_logged: bool,
}

impl Default for DirectoryListing {
    fn default() -> Self {
        Self::new()
    }
}

impl DirectoryListing {
    /// Fresh listing state for a newly opened handle.
    pub fn new() -> Self {
        Self {
            state: ListingState::Idle,
            eof_logged: false,
        }
    }

    /// Register a READDIR for this handle.
    pub fn on_read_dir(&mut self, id: RequestId) -> ReadDirAction {
        match &mut self.state {
            ListingState::Idle => {
                self.state = ListingState::Scanning { pending: vec![id] };
                ReadDirAction::Scan
            }
            ListingState::Scanning { pending } => {
                pending.push(id);
                ReadDirAction::Queued
            }
            ListingState::Completed(terminal) => ReadDirAction::Reply(terminal.status()),
            // Unreachable through the registry, which forgets a handle before closing it.
            ListingState::Closed => ReadDirAction::Reply(StatusCode::NoSuchFile),
        }
    }

    /// Record the scan result and hand back the requests waiting on it.
    ///
    /// Returns `None` if the handle was closed while the scan ran; the
    /// outcome must then be dropped.
    pub fn complete(&mut self, outcome: &ScanOutcome) -> Option<Vec<RequestId>> {
        let ListingState::Scanning { pending } = &mut self.state else {
            return None;
        };
        let pending = std::mem::take(pending);
        let terminal = match outcome {
            ScanOutcome::Failed(_) => Terminal::Failed,
            ScanOutcome::Empty | ScanOutcome::Entries(_) => Terminal::Eof,
        };
        self.state = ListingState::Completed(terminal);
        Some(pending)
    }

    /// Mark the handle closed. Returns the number of queued requests dropped.
    pub fn close(&mut self) -> usize {
        let dropped = match &self.state {
            ListingState::Scanning { pending } => pending.len(),
            _ => 0,
        };
        self.state = ListingState::Closed;
        dropped
    }

    /// Whether a scan is running.
    pub fn is_scanning(&self) -> bool {
        matches!(self.state, ListingState::Scanning { .. })
    }

    /// Recorded outcome, once the listing finished.
    pub fn terminal(&self) -> Option<Terminal> {
        match self.state {
            ListingState::Completed(terminal) => Some(terminal),
            _ => None,
        }
    }

    /// True the first time it is called; used to log the end of a listing once.
    pub fn first_eof_replay(&mut self) -> bool {
        !std::mem::replace(&mut self.eof_logged, true)
    }
}

/// Enumerate `path` and fetch metadata for every entry concurrently.
///
/// Entries whose metadata cannot be read are left out. Entries are sorted by
/// name. Metadata is fetched with the on-disk name; non-UTF-8 names are
/// converted lossily for the reply only.
pub async fn scan_directory<F: FileSystem>(fs: &F, path: &Path, owner: &str) -> ScanOutcome {
    let names = match fs.read_dir(path).await {
        Ok(names) => names,
        Err(e) => return ScanOutcome::Failed(e),
    };
    if names.is_empty() {
        return ScanOutcome::Empty;
    }

    let lookups: Vec<_> = names
        .into_iter()
        .map(move |name| async move {
            let attrs = fs.stat(&path.join(&name)).await;
            (name, attrs)
        })
        .collect();

    let mut entries: Vec<NameEntry> = join_all(lookups)
        .await
        .into_iter()
        .filter_map(|(name, attrs)| {
            let name = name.to_string_lossy().into_owned();
            match attrs {
                Ok(attrs) => Some(NameEntry {
                    longname: long_name(&name, &attrs, owner),
                    filename: name,
                    attrs,
                }),
                Err(e) => {
                    trace!(entry = %name, error = %e, "Dropping entry with unreadable metadata");
                    None
                }
            }
        })
        .collect();

    entries.sort_by(|a, b| a.filename.cmp(&b.filename));
    ScanOutcome::Entries(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::backend::LocalFs;
    use tempfile::TempDir;

    #[test]
    fn test_first_read_dir_starts_scan() {
        let mut listing = DirectoryListing::new();
        assert_eq!(listing.on_read_dir(1), ReadDirAction::Scan);
        assert!(listing.is_scanning());
    }

    #[test]
    fn test_concurrent_read_dirs_are_queued() {
        let mut listing = DirectoryListing::new();
        assert_eq!(listing.on_read_dir(1), ReadDirAction::Scan);
        assert_eq!(listing.on_read_dir(2), ReadDirAction::Queued);
        assert_eq!(listing.on_read_dir(3), ReadDirAction::Queued);

        let pending = listing.complete(&ScanOutcome::Entries(vec![])).unwrap();
        assert_eq!(pending, vec![1, 2, 3]);
        assert_eq!(listing.terminal(), Some(Terminal::Eof));
    }

    #[test]
    fn test_completed_listing_replays_eof() {
        let mut listing = DirectoryListing::new();
        listing.on_read_dir(1);
        listing.complete(&ScanOutcome::Empty).unwrap();

        assert_eq!(listing.on_read_dir(2), ReadDirAction::Reply(StatusCode::Eof));
        assert_eq!(listing.on_read_dir(3), ReadDirAction::Reply(StatusCode::Eof));
        assert!(!listing.is_scanning());
    }

    #[test]
    fn test_failed_listing_replays_failure() {
        let mut listing = DirectoryListing::new();
        listing.on_read_dir(1);
        let outcome = ScanOutcome::Failed(io::Error::from(io::ErrorKind::PermissionDenied));
        assert_eq!(listing.complete(&outcome), Some(vec![1]));
        assert_eq!(
            listing.on_read_dir(2),
            ReadDirAction::Reply(StatusCode::Failure)
        );
    }

    #[test]
    fn test_close_during_scan_discards_result() {
        let mut listing = DirectoryListing::new();
        listing.on_read_dir(1);
        listing.on_read_dir(2);

        assert_eq!(listing.close(), 2);
        assert_eq!(listing.complete(&ScanOutcome::Empty), None);
        assert_eq!(listing.terminal(), None);
    }

    #[test]
    fn test_complete_without_scan_is_ignored() {
        let mut listing = DirectoryListing::new();
        assert_eq!(listing.complete(&ScanOutcome::Empty), None);
        assert_eq!(listing.on_read_dir(1), ReadDirAction::Scan);
    }

    #[test]
    fn test_first_eof_replay_only_once() {
        let mut listing = DirectoryListing::new();
        assert!(listing.first_eof_replay());
        assert!(!listing.first_eof_replay());
    }

    #[tokio::test]
    async fn test_scan_directory_lists_sorted_entries() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("b.txt"), b"bb").unwrap();
        std::fs::write(temp_dir.path().join("a.txt"), b"a").unwrap();
        std::fs::create_dir(temp_dir.path().join("c")).unwrap();

        let ScanOutcome::Entries(entries) =
            scan_directory(&LocalFs::new(), temp_dir.path(), "admin").await
        else {
            panic!("expected entries");
        };

        let names: Vec<_> = entries.iter().map(|e| e.filename.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "c"]);
        assert_eq!(entries[1].attrs.size, 2);
        assert!(entries[2].attrs.is_dir());
        assert!(entries[2].longname.starts_with('d'));
        assert!(entries[0].longname.ends_with(" a.txt"));
    }

    #[tokio::test]
    async fn test_scan_directory_drops_unreadable_entries() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("ok.txt"), b"ok").unwrap();
        std::os::unix::fs::symlink(
            temp_dir.path().join("nowhere"),
            temp_dir.path().join("dangling"),
        )
        .unwrap();

        let ScanOutcome::Entries(entries) =
            scan_directory(&LocalFs::new(), temp_dir.path(), "admin").await
        else {
            panic!("expected entries");
        };
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].filename, "ok.txt");
    }

    #[tokio::test]
    async fn test_scan_directory_empty_and_missing() {
        let temp_dir = TempDir::new().unwrap();
        assert!(matches!(
            scan_directory(&LocalFs::new(), temp_dir.path(), "admin").await,
            ScanOutcome::Empty
        ));
        assert!(matches!(
            scan_directory(&LocalFs::new(), &temp_dir.path().join("missing"), "admin").await,
            ScanOutcome::Failed(_)
        ));
    }

    #[tokio::test]
    async fn test_scan_directory_keeps_non_utf8_entries() {
        use std::os::unix::ffi::OsStrExt;

        let temp_dir = TempDir::new().unwrap();
        let name = std::ffi::OsStr::from_bytes(b"r\xe9sum\xe9.pdf");
        std::fs::write(temp_dir.path().join(name), b"cv").unwrap();

        let ScanOutcome::Entries(entries) =
            scan_directory(&LocalFs::new(), temp_dir.path(), "admin").await
        else {
            panic!("expected entries");
        };
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].filename, name.to_string_lossy());
        assert_eq!(entries[0].attrs.size, 2);
    }
}
