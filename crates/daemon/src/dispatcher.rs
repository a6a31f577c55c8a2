//! Request dispatcher.
//!
//! The [`Dispatcher`] owns the per-session state (path resolver and handle
//! registry) and turns each incoming [`Request`] into exactly one
//! [`Response`] on the session's response channel, except for READDIRs that
//! are discarded because their handle was closed mid-scan.
//!
//! Bookkeeping (handle lookup, listing state transitions, handle release) is
//! done synchronously inside [`Dispatcher::dispatch`]; filesystem work runs on
//! spawned tasks, so any number of requests may be outstanding at once and
//! responses may arrive in any order.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use protocol::messages::{
    Handle, NameEntry, OpenFlags, OpenMode, Operation, Request, RequestId, Response,
    ResponseBody, StatusCode,
};
use tokio::sync::mpsc;
use tracing::{debug, debug_span, info, trace, warn, Instrument};

use crate::files::{
    long_name, scan_directory, FileSystem, HandleRegistry, OpenDir, PathResolver, ReadDirAction,
    ResolveError, ScanOutcome,
};

/// Default owner shown in long names.
pub const DEFAULT_DISPLAY_USER: &str = "admin";

/// Default cap on the number of bytes a single READ returns.
pub const DEFAULT_MAX_READ_SIZE: u32 = 256 * 1024;

/// Channel half the dispatcher sends responses into.
pub type ResponseSink = mpsc::UnboundedSender<Response>;

/// Per-session parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    /// Absolute directory every client path is resolved against.
    pub root: PathBuf,
    /// Owner and group shown in directory long names.
    pub display_user: String,
    /// Upper bound for READ lengths.
    pub max_read_size: u32,
}

impl SessionSettings {
    /// Settings for `root` with default display user and read size.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            display_user: DEFAULT_DISPLAY_USER.to_string(),
            max_read_size: DEFAULT_MAX_READ_SIZE,
        }
    }
}

/// Errors raised while handling a request.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The client path could not be mapped under the root.
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// A mutating operation named the shared root itself.
    #[error("operation not permitted on the shared root")]
    RootTarget,

    /// The handle is not registered (never issued, closed, or wrong kind).
    #[error("unknown handle {0}")]
    UnknownHandle(Handle),

    /// OPENDIR on something that is not a directory.
    #[error("not a directory: {}", .0.display())]
    NotADirectory(PathBuf),

    /// A filesystem call failed.
    #[error("{verb} {} failed: {source}", .path.display())]
    Io {
        /// Protocol verb being served.
        verb: &'static str,
        /// Resolved path the call targeted.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

impl DispatchError {
    /// Status sent to the client. `fallback` is the verb's error class.
    pub fn status(&self, fallback: StatusCode) -> StatusCode {
        match self {
            DispatchError::UnknownHandle(_) => StatusCode::NoSuchFile,
            _ => fallback,
        }
    }

    fn io(verb: &'static str, path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| DispatchError::Io { verb, path, source }
    }
}

/// Status for failed lookups and for failed mutations.
fn failure_status(op: &Operation) -> StatusCode {
    match op {
        Operation::RealPath { .. }
        | Operation::OpenDir { .. }
        | Operation::Open { .. }
        | Operation::Stat { .. }
        | Operation::LStat { .. } => StatusCode::NoSuchFile,
        _ => StatusCode::Failure,
    }
}

struct Shared<F: FileSystem> {
    fs: Arc<F>,
    resolver: PathResolver,
    handles: HandleRegistry<F::File>,
    settings: SessionSettings,
    responses: ResponseSink,
}

/// Per-session request dispatcher.
///
/// Cloning yields another reference to the same session state.
pub struct Dispatcher<F: FileSystem> {
    shared: Arc<Shared<F>>,
}

impl<F: FileSystem> Clone for Dispatcher<F> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<F: FileSystem> Dispatcher<F> {
    /// Create a dispatcher that answers into `responses`.
    pub fn new(fs: Arc<F>, settings: SessionSettings, responses: ResponseSink) -> Self {
        Self {
            shared: Arc::new(Shared {
                fs,
                resolver: PathResolver::new(settings.root.clone()),
                handles: HandleRegistry::new(),
                settings,
                responses,
            }),
        }
    }

    /// Create a dispatcher together with the receiving end of its responses.
    pub fn channel(
        fs: Arc<F>,
        settings: SessionSettings,
    ) -> (Self, mpsc::UnboundedReceiver<Response>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(fs, settings, tx), rx)
    }

    /// Session settings.
    pub fn settings(&self) -> &SessionSettings {
        &self.shared.settings
    }

    /// Number of file and directory handles currently open.
    pub fn open_handles(&self) -> usize {
        self.shared.handles.open_files() + self.shared.handles.open_dirs()
    }

    /// Handle one request.
    ///
    /// Must be called from within a Tokio runtime. The response is delivered
    /// on the response channel, possibly after later requests were answered.
    pub fn dispatch(&self, request: Request) {
        let Request { id, op } = request;
        trace!(id, verb = op.verb(), "Dispatching request");

        match op {
            Operation::ReadDir { handle } => self.read_dir(id, handle),
            Operation::Close { handle } => self.close(id, handle),
            op => self.spawn_operation(id, op),
        }
    }

    // =========================================================================
    // Directory listing
    // =========================================================================

    fn read_dir(&self, id: RequestId, handle: Handle) {
        let Some(dir) = self.shared.handles.dir(&handle) else {
            debug!(id, handle = %handle, "READDIR on unknown handle");
            self.shared.respond(Response::status(id, StatusCode::NoSuchFile));
            return;
        };

        let action = {
            let mut listing = dir.listing();
            let action = listing.on_read_dir(id);
            if action == ReadDirAction::Reply(StatusCode::Eof) && listing.first_eof_replay() {
                debug!(handle = %handle, path = %dir.path.display(), "Directory listing finished");
            }
            action
        };

        match action {
            ReadDirAction::Reply(status) => self.shared.respond(Response::status(id, status)),
            ReadDirAction::Queued => {
                trace!(id, handle = %handle, "READDIR joined running scan");
            }
            ReadDirAction::Scan => {
                let shared = Arc::clone(&self.shared);
                let span = debug_span!("scan", handle = %handle);
                tokio::spawn(async move { shared.run_scan(dir).await }.instrument(span));
            }
        }
    }

    // =========================================================================
    // Close
    // =========================================================================

    fn close(&self, id: RequestId, handle: Handle) {
        if let Some(open) = self.shared.handles.release_file(&handle) {
            info!(handle = %handle, path = %open.path.display(), "Closing file");
            let shared = Arc::clone(&self.shared);
            let span = debug_span!("request", id, verb = "CLOSE");
            tokio::spawn(
                async move {
                    let status = match shared.fs.close(open.file).await {
                        Ok(()) => StatusCode::Ok,
                        Err(e) => {
                            warn!(path = %open.path.display(), error = %e, "Close failed");
                            StatusCode::Failure
                        }
                    };
                    shared.respond(Response::status(id, status));
                }
                .instrument(span),
            );
            return;
        }

        if let Some(dir) = self.shared.handles.release_dir(&handle) {
            let dropped = dir.listing().close();
            info!(handle = %handle, path = %dir.path.display(), "Closing directory");
            if dropped > 0 {
                debug!(handle = %handle, dropped, "Discarding READDIRs waiting on scan");
            }
        } else {
            trace!(id, handle = %handle, "CLOSE on unknown handle");
        }
        self.shared.respond(Response::status(id, StatusCode::Ok));
    }

    // =========================================================================
    // Everything else
    // =========================================================================

    fn spawn_operation(&self, id: RequestId, op: Operation) {
        let shared = Arc::clone(&self.shared);
        let span = debug_span!("request", id, verb = op.verb());
        tokio::spawn(
            async move {
                let verb = op.verb();
                let fallback = failure_status(&op);
                let body = match shared.execute(op).await {
                    Ok(body) => body,
                    Err(e) => {
                        match &e {
                            DispatchError::Resolve(_) | DispatchError::RootTarget => {
                                warn!(verb, error = %e, "Rejected path")
                            }
                            _ => debug!(verb, error = %e, "Request failed"),
                        }
                        ResponseBody::Status(e.status(fallback))
                    }
                };
                shared.respond(Response { id, body });
            }
            .instrument(span),
        );
    }
}

impl<F: FileSystem> Shared<F> {
    fn respond(&self, response: Response) {
        if self.responses.send(response).is_err() {
            trace!("Session gone; dropping response");
        }
    }

    /// Resolve a path that a mutating operation may target.
    fn resolve_target(&self, path: &str) -> Result<PathBuf, DispatchError> {
        let resolved = self.resolver.resolve(path)?;
        if resolved == self.resolver.root() {
            return Err(DispatchError::RootTarget);
        }
        Ok(resolved)
    }

    async fn execute(&self, op: Operation) -> Result<ResponseBody, DispatchError> {
        match op {
            Operation::RealPath { path } => self.real_path(&path).await,
            Operation::OpenDir { path } => self.open_dir(&path).await,
            Operation::Open { path, flags } => self.open(&path, flags).await,
            Operation::Read {
                handle,
                offset,
                length,
            } => self.read(handle, offset, length).await,
            Operation::Write {
                handle,
                offset,
                data,
            } => self.write(handle, offset, data).await,
            Operation::Stat { path } => {
                let resolved = self.resolver.resolve(&path)?;
                let attrs = self
                    .fs
                    .stat(&resolved)
                    .await
                    .map_err(DispatchError::io("STAT", &resolved))?;
                Ok(ResponseBody::Attrs(attrs))
            }
            Operation::LStat { path } => {
                let resolved = self.resolver.resolve(&path)?;
                let attrs = self
                    .fs
                    .lstat(&resolved)
                    .await
                    .map_err(DispatchError::io("LSTAT", &resolved))?;
                Ok(ResponseBody::Attrs(attrs))
            }
            Operation::Mkdir { path } => {
                let resolved = self.resolve_target(&path)?;
                self.fs
                    .mkdir(&resolved)
                    .await
                    .map_err(DispatchError::io("MKDIR", &resolved))?;
                info!(path = %resolved.display(), "Created directory");
                Ok(ResponseBody::Status(StatusCode::Ok))
            }
            Operation::Rmdir { path } => {
                let resolved = self.resolve_target(&path)?;
                self.fs
                    .rmdir(&resolved)
                    .await
                    .map_err(DispatchError::io("RMDIR", &resolved))?;
                info!(path = %resolved.display(), "Removed directory");
                Ok(ResponseBody::Status(StatusCode::Ok))
            }
            Operation::Remove { path } => {
                let resolved = self.resolve_target(&path)?;
                self.fs
                    .remove(&resolved)
                    .await
                    .map_err(DispatchError::io("REMOVE", &resolved))?;
                info!(path = %resolved.display(), "Removed file");
                Ok(ResponseBody::Status(StatusCode::Ok))
            }
            Operation::Rename { from, to } => {
                let from = self.resolve_target(&from)?;
                let to = self.resolve_target(&to)?;
                self.fs
                    .rename(&from, &to)
                    .await
                    .map_err(DispatchError::io("RENAME", &from))?;
                info!(from = %from.display(), to = %to.display(), "Renamed");
                Ok(ResponseBody::Status(StatusCode::Ok))
            }
            // Handled synchronously by `Dispatcher::dispatch`.
            Operation::ReadDir { handle } | Operation::Close { handle } => {
                Err(DispatchError::UnknownHandle(handle))
            }
        }
    }

    async fn real_path(&self, path: &str) -> Result<ResponseBody, DispatchError> {
        let name = self.resolver.canonical_name(path)?;
        let resolved = self.resolver.resolve(path)?;
        let attrs = self
            .fs
            .stat(&resolved)
            .await
            .map_err(DispatchError::io("REALPATH", &resolved))?;

        Ok(ResponseBody::Name(vec![NameEntry {
            longname: long_name(&name, &attrs, &self.settings.display_user),
            filename: name,
            attrs,
        }]))
    }

    async fn open_dir(&self, path: &str) -> Result<ResponseBody, DispatchError> {
        let resolved = self.resolver.resolve(path)?;
        let attrs = self
            .fs
            .stat(&resolved)
            .await
            .map_err(DispatchError::io("OPENDIR", &resolved))?;
        if !attrs.is_dir() {
            return Err(DispatchError::NotADirectory(resolved));
        }

        let handle = self.handles.allocate();
        info!(handle = %handle, path = %resolved.display(), "Opened directory");
        self.handles.register_dir(handle.clone(), resolved);
        Ok(ResponseBody::Handle(handle))
    }

    async fn open(&self, path: &str, flags: OpenFlags) -> Result<ResponseBody, DispatchError> {
        let resolved = self.resolver.resolve(path)?;
        let mode = OpenMode::from_flags(flags);
        let file = self
            .fs
            .open(&resolved, mode)
            .await
            .map_err(DispatchError::io("OPEN", &resolved))?;

        let handle = self.handles.allocate();
        info!(handle = %handle, path = %resolved.display(), ?mode, "Opened file");
        self.handles.register_file(handle.clone(), file, resolved);
        Ok(ResponseBody::Handle(handle))
    }

    async fn read(
        &self,
        handle: Handle,
        offset: u64,
        length: u32,
    ) -> Result<ResponseBody, DispatchError> {
        let open = self
            .handles
            .file(&handle)
            .ok_or(DispatchError::UnknownHandle(handle))?;
        let length = length.min(self.settings.max_read_size);

        let data = self
            .fs
            .read_at(&open.file, offset, length)
            .await
            .map_err(DispatchError::io("READ", &open.path))?;

        if data.is_empty() {
            trace!(path = %open.path.display(), offset, "Read at end of file");
            return Ok(ResponseBody::Status(StatusCode::Eof));
        }
        Ok(ResponseBody::Data(data))
    }

    async fn write(
        &self,
        handle: Handle,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<ResponseBody, DispatchError> {
        let open = self
            .handles
            .file(&handle)
            .ok_or(DispatchError::UnknownHandle(handle))?;
        let len = data.len();

        self.fs
            .write_at(&open.file, offset, data)
            .await
            .map_err(DispatchError::io("WRITE", &open.path))?;

        trace!(path = %open.path.display(), offset, len, "Wrote");
        Ok(ResponseBody::Status(StatusCode::Ok))
    }

    async fn run_scan(&self, dir: Arc<OpenDir>) {
        let outcome = scan_directory(self.fs.as_ref(), &dir.path, &self.settings.display_user).await;

        let Some(pending) = dir.listing().complete(&outcome) else {
            debug!(path = %dir.path.display(), "Directory closed during scan; discarding result");
            return;
        };

        let body = match outcome {
            ScanOutcome::Failed(e) => {
                warn!(path = %dir.path.display(), error = %e, "Failed to read directory");
                ResponseBody::Status(StatusCode::Failure)
            }
            ScanOutcome::Empty => ResponseBody::Status(StatusCode::Eof),
            ScanOutcome::Entries(entries) => {
                debug!(
                    path = %dir.path.display(),
                    entries = entries.len(),
                    waiting = pending.len(),
                    "Directory scanned"
                );
                ResponseBody::Name(entries)
            }
        };

        for id in pending {
            self.respond(Response {
                id,
                body: body.clone(),
            });
        }
    }
}
