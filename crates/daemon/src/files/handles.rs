//! Per-session registry of open file and directory handles.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use protocol::messages::Handle;

use super::listing::DirectoryListing;

/// State behind a file handle.
#[derive(Debug, Clone)]
pub struct OpenFile<T> {
    /// The open descriptor.
    pub file: T,
    /// Resolved absolute path.
    pub path: PathBuf,
}

/// State behind a directory handle.
#[derive(Debug)]
pub struct OpenDir {
    /// Resolved absolute path.
    pub path: PathBuf,
    listing: Mutex<DirectoryListing>,
}

impl OpenDir {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            listing: Mutex::new(DirectoryListing::new()),
        }
    }

    /// Lock the listing state.
    ///
    /// Critical sections never panic, so a poisoned lock still holds a
    /// consistent state and is recovered.
    pub fn listing(&self) -> MutexGuard<'_, DirectoryListing> {
        self.listing.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle table for one client session.
///
/// Handles come from a single counter, so file and directory handles never
/// share a value. A handle value is not handed out again while it is still
/// registered.
#[derive(Debug)]
pub struct HandleRegistry<T> {
    next: AtomicU32,
    files: DashMap<Handle, OpenFile<T>>,
    dirs: DashMap<Handle, Arc<OpenDir>>,
}

impl<T: Clone> Default for HandleRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> HandleRegistry<T> {
    /// Empty registry with the counter at zero.
    pub fn new() -> Self {
        Self {
            next: AtomicU32::new(0),
            files: DashMap::new(),
            dirs: DashMap::new(),
        }
    }

    /// Mint a handle that is not currently registered.
    pub fn allocate(&self) -> Handle {
        loop {
            let handle = Handle::from_counter(self.next.fetch_add(1, Ordering::Relaxed));
            if !self.files.contains_key(&handle) && !self.dirs.contains_key(&handle) {
                return handle;
            }
        }
    }

    /// Register an open file under `handle`.
    pub fn register_file(&self, handle: Handle, file: T, path: PathBuf) {
        self.files.insert(handle, OpenFile { file, path });
    }

    /// Register an open directory under `handle`.
    pub fn register_dir(&self, handle: Handle, path: PathBuf) -> Arc<OpenDir> {
        let dir = Arc::new(OpenDir::new(path));
        self.dirs.insert(handle, Arc::clone(&dir));
        dir
    }

    /// Look up a file handle.
    pub fn file(&self, handle: &Handle) -> Option<OpenFile<T>> {
        self.files.get(handle).map(|entry| entry.value().clone())
    }

    /// Look up a directory handle.
    pub fn dir(&self, handle: &Handle) -> Option<Arc<OpenDir>> {
        self.dirs.get(handle).map(|entry| Arc::clone(entry.value()))
    }

    /// Forget a file handle, returning its state for closing.
    pub fn release_file(&self, handle: &Handle) -> Option<OpenFile<T>> {
        self.files.remove(handle).map(|(_, file)| file)
    }

    /// Forget a directory handle.
    pub fn release_dir(&self, handle: &Handle) -> Option<Arc<OpenDir>> {
        self.dirs.remove(handle).map(|(_, dir)| dir)
    }

    /// Number of open file handles.
    pub fn open_files(&self) -> usize {
        self.files.len()
    }

    /// Number of open directory handles.
    pub fn open_dirs(&self) -> usize {
        self.dirs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_is_monotonic_big_endian() {
        let registry: HandleRegistry<()> = HandleRegistry::new();
        assert_eq!(registry.allocate().as_bytes(), &[0, 0, 0, 0]);
        assert_eq!(registry.allocate().as_bytes(), &[0, 0, 0, 1]);
        assert_eq!(registry.allocate().counter(), Some(2));
    }

    #[test]
    fn test_file_and_dir_namespaces_are_disjoint() {
        let registry: HandleRegistry<u8> = HandleRegistry::new();
        let file = registry.allocate();
        let dir = registry.allocate();
        registry.register_file(file.clone(), 7, PathBuf::from("/r/f"));
        registry.register_dir(dir.clone(), PathBuf::from("/r/d"));

        assert!(registry.file(&dir).is_none());
        assert!(registry.dir(&file).is_none());
        assert_eq!(registry.file(&file).unwrap().file, 7);
        assert_eq!(registry.dir(&dir).unwrap().path, PathBuf::from("/r/d"));
    }

    #[test]
    fn test_release_is_idempotent() {
        let registry: HandleRegistry<u8> = HandleRegistry::new();
        let handle = registry.allocate();
        registry.register_file(handle.clone(), 1, PathBuf::from("/r/f"));

        assert!(registry.release_file(&handle).is_some());
        assert!(registry.release_file(&handle).is_none());
        assert!(registry.release_dir(&handle).is_none());
        assert!(registry.file(&handle).is_none());
        assert_eq!(registry.open_files(), 0);
    }

    #[test]
    fn test_allocate_skips_registered_values() {
        let registry: HandleRegistry<u8> = HandleRegistry::new();
        registry.register_dir(Handle::from_counter(0), PathBuf::from("/r"));
        registry.register_file(Handle::from_counter(1), 0, PathBuf::from("/r/f"));
        assert_eq!(registry.allocate().counter(), Some(2));
    }

    #[test]
    fn test_released_dir_keeps_state_for_holders() {
        let registry: HandleRegistry<u8> = HandleRegistry::new();
        let handle = registry.allocate();
        let dir = registry.register_dir(handle.clone(), PathBuf::from("/r"));
        dir.listing().on_read_dir(1);

        let released = registry.release_dir(&handle).unwrap();
        assert!(Arc::ptr_eq(&dir, &released));
        assert!(released.listing().is_scanning());
        assert_eq!(registry.open_dirs(), 0);
    }
}
