//! Session transport.
//!
//! A session is one byte stream carrying framed [`Envelope`]s in each
//! direction: requests from the client, responses from the daemon. Frames are
//! read and dispatched as they arrive; a writer task drains the dispatcher's
//! response channel so slow filesystem calls never hold up the reader.
//!
//! [`SessionListener`] accepts sessions on a Unix socket. Each connection gets
//! its own dispatcher, so handles and the handle counter are per session.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use protocol::framing::{Frame, FrameCodec, FRAME_HEADER_SIZE};
use protocol::messages::{Envelope, Packet, Response};
use protocol::ProtocolError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::dispatcher::{Dispatcher, SessionSettings};
use crate::files::FileSystem;

/// Errors that end a session.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// A frame or envelope could not be decoded or encoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The underlying stream failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Counters reported when a session ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Requests read from the client.
    pub requests: u64,
    /// Responses written back.
    pub responses: u64,
}

/// Read one envelope.
///
/// Returns `None` on a clean end of stream at a frame boundary.
pub async fn read_envelope<R>(
    reader: &mut R,
    codec: &FrameCodec,
) -> Result<Option<Envelope>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    if reader.read(&mut header[..1]).await? == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut header[1..]).await?;

    let total = codec.frame_length(&header)?;
    let mut buf = vec![0u8; total];
    buf[..FRAME_HEADER_SIZE].copy_from_slice(&header);
    reader.read_exact(&mut buf[FRAME_HEADER_SIZE..]).await?;

    let (frame, _) = codec.decode(&buf)?;
    Ok(Some(Envelope::from_msgpack(&frame.payload)?))
}

/// Write one envelope and flush.
pub async fn write_envelope<W>(
    writer: &mut W,
    codec: &FrameCodec,
    envelope: &Envelope,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = codec.encode(&Frame::new(envelope.to_msgpack()?))?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Serve one session until the client closes its side.
///
/// Returns once the reader reached end of stream and every outstanding
/// response has been written.
pub async fn serve_connection<R, W, F>(
    mut reader: R,
    writer: W,
    fs: Arc<F>,
    settings: SessionSettings,
    codec: FrameCodec,
) -> Result<SessionStats, TransportError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
    F: FileSystem,
{
    let (dispatcher, responses) = Dispatcher::channel(fs, settings);
    let writer_task = tokio::spawn(write_responses(writer, responses, codec.clone()));

    let read_result = read_requests(&mut reader, &dispatcher, &codec).await;
    // In-flight tasks keep the response channel open until they answer.
    drop(dispatcher);

    let written = writer_task.await.map_err(io::Error::other)?;
    let requests = read_result?;
    let responses = written?;

    Ok(SessionStats {
        requests,
        responses,
    })
}

async fn read_requests<R, F>(
    reader: &mut R,
    dispatcher: &Dispatcher<F>,
    codec: &FrameCodec,
) -> Result<u64, TransportError>
where
    R: AsyncRead + Unpin,
    F: FileSystem,
{
    let mut count = 0;
    while let Some(envelope) = read_envelope(reader, codec).await? {
        match envelope.payload {
            Packet::Request(request) => {
                count += 1;
                dispatcher.dispatch(request);
            }
            Packet::Response(response) => {
                warn!(id = response.id, "Ignoring response sent by client");
            }
        }
    }
    debug!(requests = count, "Client closed its side");
    Ok(count)
}

async fn write_responses<W>(
    mut writer: W,
    mut responses: mpsc::UnboundedReceiver<Response>,
    codec: FrameCodec,
) -> Result<u64, TransportError>
where
    W: AsyncWrite + Unpin,
{
    let mut sequence = 0u64;
    while let Some(response) = responses.recv().await {
        let envelope = Envelope::new(sequence, Packet::Response(response));
        write_envelope(&mut writer, &codec, &envelope).await?;
        sequence += 1;
    }
    writer.shutdown().await?;
    Ok(sequence)
}

/// Accepts sessions on a Unix Domain Socket.
pub struct SessionListener {
    listener: UnixListener,
    path: PathBuf,
}

impl SessionListener {
    /// Bind to `path`.
    ///
    /// Parent directories are created and a stale socket file at `path` is
    /// removed first.
    pub async fn bind(path: &Path) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    /// Socket path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept and serve sessions until `shutdown` resolves, then remove the
    /// socket file. Sessions already running are left to finish on their own.
    pub async fn serve<F, S>(
        self,
        fs: Arc<F>,
        settings: SessionSettings,
        codec: FrameCodec,
        shutdown: S,
    ) -> io::Result<()>
    where
        F: FileSystem,
        S: Future<Output = ()>,
    {
        info!(socket = %self.path.display(), root = %settings.root.display(), "Listening");
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutting down listener");
                    break;
                }
                accepted = self.listener.accept() => {
                    let (stream, _addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };

                    let session_id = Uuid::new_v4();
                    let (reader, writer) = stream.into_split();
                    let fs = Arc::clone(&fs);
                    let settings = settings.clone();
                    let codec = codec.clone();

                    tokio::spawn(
                        async move {
                            info!("Session started");
                            match serve_connection(reader, writer, fs, settings, codec).await {
                                Ok(stats) => info!(
                                    requests = stats.requests,
                                    responses = stats.responses,
                                    "Session ended"
                                ),
                                Err(e) => warn!(error = %e, "Session ended with error"),
                            }
                        }
                        .instrument(info_span!("session", id = %session_id)),
                    );
                }
            }
        }

        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!(socket = %self.path.display(), error = %e, "Could not remove socket file");
        }
        Ok(())
    }
}
