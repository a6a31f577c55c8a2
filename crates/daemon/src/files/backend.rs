//! Filesystem capability used by the dispatcher.
//!
//! [`FileSystem`] abstracts the storage primitives the adapter needs, so the
//! dispatcher can be driven against something other than the local disk
//! (tests wrap [`LocalFs`] to count or stall calls). Every method returns a
//! `Send` future so handlers can run on spawned tasks.

use std::ffi::OsString;
use std::future::Future;
use std::io;
use std::os::fd::IntoRawFd;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use nix::errno::Errno;
use protocol::messages::{FileAttributes, OpenMode};
use tokio::sync::RwLock;
use tracing::debug;

use super::attrs::attributes_from_metadata;

/// Storage primitives consumed by the adapter.
pub trait FileSystem: Send + Sync + 'static {
    /// An open file. Cloned into concurrent READ/WRITE tasks.
    type File: Clone + Send + Sync + 'static;

    /// Attributes of `path`, following symlinks.
    fn stat(&self, path: &Path) -> impl Future<Output = io::Result<FileAttributes>> + Send;

    /// Attributes of `path` itself, not following a final symlink.
    fn lstat(&self, path: &Path) -> impl Future<Output = io::Result<FileAttributes>> + Send;

    /// Open `path` in the given mode.
    fn open(
        &self,
        path: &Path,
        mode: OpenMode,
    ) -> impl Future<Output = io::Result<Self::File>> + Send;

    /// Read up to `len` bytes at `offset`. An empty result means end of file.
    fn read_at(
        &self,
        file: &Self::File,
        offset: u64,
        len: u32,
    ) -> impl Future<Output = io::Result<Vec<u8>>> + Send;

    /// Write all of `data` at `offset`.
    fn write_at(
        &self,
        file: &Self::File,
        offset: u64,
        data: Vec<u8>,
    ) -> impl Future<Output = io::Result<()>> + Send;

    /// Close a file, surfacing errors from the final close.
    ///
    /// Waits for READ and WRITE calls already running on the file, so the
    /// descriptor is really closed when this returns. Later calls on other
    /// clones of the file fail.
    fn close(&self, file: Self::File) -> impl Future<Output = io::Result<()>> + Send;

    /// Names of the entries of a directory, without `.` and `..`.
    ///
    /// Names are returned as stored on disk; non-UTF-8 names are only made
    /// lossy when displayed.
    fn read_dir(&self, path: &Path) -> impl Future<Output = io::Result<Vec<OsString>>> + Send;

    /// Create a directory.
    fn mkdir(&self, path: &Path) -> impl Future<Output = io::Result<()>> + Send;

    /// Remove an empty directory.
    fn rmdir(&self, path: &Path) -> impl Future<Output = io::Result<()>> + Send;

    /// Remove a file.
    fn remove(&self, path: &Path) -> impl Future<Output = io::Result<()>> + Send;

    /// Rename `from` to `to`.
    fn rename(&self, from: &Path, to: &Path) -> impl Future<Output = io::Result<()>> + Send;
}

/// The local disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalFs;

/// An open local file.
///
/// Positioned reads and writes share the descriptor under the read side of
/// the lock; close takes the write side and empties the slot.
#[derive(Debug, Clone)]
pub struct LocalFile(Arc<RwLock<Option<std::fs::File>>>);

impl LocalFs {
    /// Create a local filesystem backend.
    pub fn new() -> Self {
        Self
    }
}

impl FileSystem for LocalFs {
    type File = LocalFile;

    async fn stat(&self, path: &Path) -> io::Result<FileAttributes> {
        let metadata = tokio::fs::metadata(path).await?;
        Ok(attributes_from_metadata(&metadata))
    }

    async fn lstat(&self, path: &Path) -> io::Result<FileAttributes> {
        let metadata = tokio::fs::symlink_metadata(path).await?;
        Ok(attributes_from_metadata(&metadata))
    }

    async fn open(&self, path: &Path, mode: OpenMode) -> io::Result<LocalFile> {
        let file = match open_options(mode, true).open(path).await {
            // Write-only files can still be written to.
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied && mode != OpenMode::Read => {
                debug!(path = %path.display(), "Reopening without read access");
                open_options(mode, false).open(path).await?
            }
            result => result?,
        };
        Ok(LocalFile(Arc::new(RwLock::new(Some(file.into_std().await)))))
    }

    async fn read_at(&self, file: &LocalFile, offset: u64, len: u32) -> io::Result<Vec<u8>> {
        let guard = Arc::clone(&file.0).read_owned().await;
        blocking(move || {
            let file = guard.as_ref().ok_or_else(closed)?;
            let mut buf = vec![0u8; len as usize];
            let mut filled = 0;
            while filled < buf.len() {
                match file.read_at(&mut buf[filled..], offset + filled as u64) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }
            buf.truncate(filled);
            Ok(buf)
        })
        .await
    }

    async fn write_at(&self, file: &LocalFile, offset: u64, data: Vec<u8>) -> io::Result<()> {
        // With O_APPEND the kernel ignores `offset` and appends.
        let guard = Arc::clone(&file.0).read_owned().await;
        blocking(move || {
            let file = guard.as_ref().ok_or_else(closed)?;
            file.write_all_at(&data, offset)
        })
        .await
    }

    async fn close(&self, file: LocalFile) -> io::Result<()> {
        let taken = file.0.write().await.take();
        match taken {
            Some(file) => {
                blocking(move || nix::unistd::close(file.into_raw_fd()).map_err(io::Error::from))
                    .await
            }
            None => Ok(()),
        }
    }

    async fn read_dir(&self, path: &Path) -> io::Result<Vec<OsString>> {
        let mut entries = tokio::fs::read_dir(path).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name());
        }
        Ok(names)
    }

    async fn mkdir(&self, path: &Path) -> io::Result<()> {
        tokio::fs::create_dir(path).await
    }

    async fn rmdir(&self, path: &Path) -> io::Result<()> {
        tokio::fs::remove_dir(path).await
    }

    async fn remove(&self, path: &Path) -> io::Result<()> {
        tokio::fs::remove_file(path).await
    }

    async fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        tokio::fs::rename(from, to).await
    }
}

fn open_options(mode: OpenMode, read: bool) -> tokio::fs::OpenOptions {
    let mut options = tokio::fs::OpenOptions::new();
    options.read(read || mode == OpenMode::Read);
    match mode {
        OpenMode::Read => &mut options,
        OpenMode::Write => options.write(true).create(true).truncate(true),
        OpenMode::Append => options.append(true).create(true),
    };
    options
}

fn closed() -> io::Error {
    io::Error::from(Errno::EBADF)
}

async fn blocking<T, F>(f: F) -> io::Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(io::Error::other)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_then_read_back() {
        let temp_dir = TempDir::new().unwrap();
        let fs = LocalFs::new();
        let path = temp_dir.path().join("new.txt");

        let file = fs.open(&path, OpenMode::Write).await.unwrap();
        fs.write_at(&file, 0, b"hello".to_vec()).await.unwrap();

        assert_eq!(fs.read_at(&file, 0, 5).await.unwrap(), b"hello");
        assert_eq!(fs.read_at(&file, 1, 100).await.unwrap(), b"ello");
        assert!(fs.read_at(&file, 5, 5).await.unwrap().is_empty());
        fs.close(file).await.unwrap();
    }

    #[tokio::test]
    async fn test_write_mode_truncates() {
        let temp_dir = TempDir::new().unwrap();
        let fs = LocalFs::new();
        let path = temp_dir.path().join("existing.txt");
        std::fs::write(&path, b"old contents").unwrap();

        let file = fs.open(&path, OpenMode::Write).await.unwrap();
        fs.close(file).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"");
    }

    #[tokio::test]
    async fn test_append_mode_appends() {
        let temp_dir = TempDir::new().unwrap();
        let fs = LocalFs::new();
        let path = temp_dir.path().join("log.txt");
        std::fs::write(&path, b"one,").unwrap();

        let file = fs.open(&path, OpenMode::Append).await.unwrap();
        fs.write_at(&file, 0, b"two".to_vec()).await.unwrap();
        fs.close(file).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"one,two");
    }

    #[tokio::test]
    async fn test_read_mode_requires_existing_file() {
        let temp_dir = TempDir::new().unwrap();
        let fs = LocalFs::new();
        let err = fs
            .open(&temp_dir.path().join("missing"), OpenMode::Read)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_read_only_file_rejects_writes() {
        let temp_dir = TempDir::new().unwrap();
        let fs = LocalFs::new();
        let path = temp_dir.path().join("ro.txt");
        std::fs::write(&path, b"data").unwrap();

        let file = fs.open(&path, OpenMode::Read).await.unwrap();
        assert!(fs.write_at(&file, 0, b"x".to_vec()).await.is_err());
    }

    #[tokio::test]
    async fn test_close_with_outstanding_clone() {
        let temp_dir = TempDir::new().unwrap();
        let fs = LocalFs::new();
        let path = temp_dir.path().join("shared.txt");
        std::fs::write(&path, b"abc").unwrap();

        let file = fs.open(&path, OpenMode::Read).await.unwrap();
        let other = file.clone();
        fs.close(file).await.unwrap();

        let err = fs.read_at(&other, 0, 3).await.unwrap_err();
        assert_eq!(err.raw_os_error(), Some(Errno::EBADF as i32));
        // Closing again through the other clone is a no-op.
        fs.close(other).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_waits_for_running_reads() {
        let temp_dir = TempDir::new().unwrap();
        let fs = LocalFs::new();
        let path = temp_dir.path().join("busy.txt");
        std::fs::write(&path, vec![9u8; 64 * 1024]).unwrap();

        let file = fs.open(&path, OpenMode::Read).await.unwrap();
        let guard = Arc::clone(&file.0).read_owned().await;

        let closing = tokio::spawn({
            let file = file.clone();
            async move { LocalFs::new().close(file).await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!closing.is_finished());
        assert!(guard.is_some());

        drop(guard);
        closing.await.unwrap().unwrap();
        assert!(file.0.read().await.is_none());
    }

    #[tokio::test]
    async fn test_write_only_file_can_be_opened_for_writing() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let fs = LocalFs::new();
        let path = temp_dir.path().join("drop-box.txt");
        std::fs::write(&path, b"old").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o200)).unwrap();

        let file = fs.open(&path, OpenMode::Write).await.unwrap();
        fs.write_at(&file, 0, b"new".to_vec()).await.unwrap();
        fs.close(file).await.unwrap();

        let file = fs.open(&path, OpenMode::Append).await.unwrap();
        fs.write_at(&file, 0, b"er".to_vec()).await.unwrap();
        fs.close(file).await.unwrap();

        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"newer");
    }

    #[tokio::test]
    async fn test_read_dir_keeps_non_utf8_names() {
        use std::os::unix::ffi::OsStrExt;

        let temp_dir = TempDir::new().unwrap();
        let fs = LocalFs::new();
        let name = std::ffi::OsStr::from_bytes(b"caf\xe9.txt");
        std::fs::write(temp_dir.path().join(name), b"x").unwrap();

        let names = fs.read_dir(temp_dir.path()).await.unwrap();
        assert_eq!(names, vec![name.to_os_string()]);
        assert!(fs.stat(&temp_dir.path().join(&names[0])).await.is_ok());
    }

    #[tokio::test]
    async fn test_read_dir_and_metadata_operations() {
        let temp_dir = TempDir::new().unwrap();
        let fs = LocalFs::new();
        let root = temp_dir.path();

        fs.mkdir(&root.join("sub")).await.unwrap();
        std::fs::write(root.join("a.txt"), b"a").unwrap();

        let mut names = fs.read_dir(root).await.unwrap();
        names.sort();
        assert_eq!(names, vec![OsString::from("a.txt"), OsString::from("sub")]);

        assert!(fs.stat(&root.join("sub")).await.unwrap().is_dir());
        fs.rename(&root.join("a.txt"), &root.join("b.txt")).await.unwrap();
        fs.remove(&root.join("b.txt")).await.unwrap();
        fs.rmdir(&root.join("sub")).await.unwrap();
        assert!(fs.read_dir(root).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_lstat_does_not_follow_symlinks() {
        let temp_dir = TempDir::new().unwrap();
        let fs = LocalFs::new();
        let target = temp_dir.path().join("target");
        let link = temp_dir.path().join("link");
        std::fs::create_dir(&target).unwrap();
        std::os::unix::fs::symlink(&target, &link).unwrap();

        assert!(fs.stat(&link).await.unwrap().is_dir());
        assert!(fs.lstat(&link).await.unwrap().is_symlink());
    }
}
