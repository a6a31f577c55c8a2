//! Request and response definitions for dirshare.
//!
//! A client sends [`Request`]s, each tagged with a [`RequestId`] and carrying
//! one [`Operation`]. The daemon answers every request with exactly one
//! [`Response`] echoing the same id. All messages travel inside an
//! [`Envelope`] serialized with MessagePack.

use std::fmt;
use std::ops::BitOr;

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Current protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Identifier chosen by the client to pair a response with its request.
pub type RequestId = u32;

/// Length in bytes of handles minted by the daemon.
pub const HANDLE_LENGTH: usize = 4;

// ============================================================================
// Handles
// ============================================================================

/// Opaque token naming an open file or directory within one session.
///
/// The daemon mints 4-byte big-endian counters, but clients may send back
/// arbitrary bytes; anything the registry does not know is simply an
/// unknown handle.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(#[serde(with = "serde_bytes")] Vec<u8>);

impl Handle {
    /// Build the handle for a counter value.
    pub fn from_counter(counter: u32) -> Self {
        Self(counter.to_be_bytes().to_vec())
    }

    /// Wrap raw handle bytes received from a client.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Raw handle bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Counter value, if this handle has the shape the daemon mints.
    pub fn counter(&self) -> Option<u32> {
        let bytes: [u8; HANDLE_LENGTH] = self.0.as_slice().try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({})", self)
    }
}

// ============================================================================
// Open flags
// ============================================================================

/// Bit set sent with an OPEN request (SFTP v3 bit values).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpenFlags(u32);

impl OpenFlags {
    /// Open for reading.
    pub const READ: OpenFlags = OpenFlags(0x0000_0001);
    /// Open for writing.
    pub const WRITE: OpenFlags = OpenFlags(0x0000_0002);
    /// Writes go to the end of the file.
    pub const APPEND: OpenFlags = OpenFlags(0x0000_0004);
    /// Create the file if it does not exist.
    pub const CREATE: OpenFlags = OpenFlags(0x0000_0008);
    /// Truncate an existing file.
    pub const TRUNCATE: OpenFlags = OpenFlags(0x0000_0010);
    /// Fail if the file already exists.
    pub const EXCLUSIVE: OpenFlags = OpenFlags(0x0000_0020);

    /// Create flags from a raw value. Unknown bits are kept and ignored.
    #[inline]
    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw bit value.
    #[inline]
    pub fn bits(self) -> u32 {
        self.0
    }

    /// True when every bit of `other` is set.
    #[inline]
    pub fn contains(self, other: OpenFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for OpenFlags {
    type Output = OpenFlags;

    fn bitor(self, rhs: OpenFlags) -> OpenFlags {
        OpenFlags(self.0 | rhs.0)
    }
}

/// How a file is opened on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read-only; the file must exist.
    Read,
    /// Read-write, created if absent and truncated.
    Write,
    /// Read-append, created if absent; writes land at the end.
    Append,
}

impl OpenMode {
    /// Map client flags to an open mode.
    ///
    /// APPEND wins over WRITE/CREATE; WRITE or CREATE select [`OpenMode::Write`];
    /// anything else opens read-only. Contradictory combinations are not
    /// rejected.
    pub fn from_flags(flags: OpenFlags) -> Self {
        if flags.contains(OpenFlags::APPEND) {
            OpenMode::Append
        } else if flags.contains(OpenFlags::WRITE) || flags.contains(OpenFlags::CREATE) {
            OpenMode::Write
        } else {
            OpenMode::Read
        }
    }

    /// Whether this mode may modify the file.
    pub fn is_writable(self) -> bool {
        !matches!(self, OpenMode::Read)
    }
}

impl From<OpenFlags> for OpenMode {
    fn from(flags: OpenFlags) -> Self {
        OpenMode::from_flags(flags)
    }
}

// ============================================================================
// Attributes and listings
// ============================================================================

/// File type mask of a Unix mode.
pub const S_IFMT: u32 = 0o170_000;
/// Directory file type.
pub const S_IFDIR: u32 = 0o040_000;
/// Regular file type.
pub const S_IFREG: u32 = 0o100_000;
/// Symbolic link file type.
pub const S_IFLNK: u32 = 0o120_000;

/// File attributes reported by STAT, LSTAT, REALPATH and READDIR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileAttributes {
    /// Size in bytes.
    pub size: u64,
    /// Owner user id.
    pub uid: u32,
    /// Owner group id.
    pub gid: u32,
    /// Unix mode, including the file type bits.
    pub permissions: u32,
    /// Last access time (Unix epoch seconds).
    pub atime: u64,
    /// Last modification time (Unix epoch seconds).
    pub mtime: u64,
}

impl FileAttributes {
    /// True when the mode describes a directory.
    pub fn is_dir(&self) -> bool {
        self.permissions & S_IFMT == S_IFDIR
    }

    /// True when the mode describes a symbolic link.
    pub fn is_symlink(&self) -> bool {
        self.permissions & S_IFMT == S_IFLNK
    }

    /// True when the mode describes a regular file.
    pub fn is_file(&self) -> bool {
        self.permissions & S_IFMT == S_IFREG
    }
}

/// One entry of a NAME response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameEntry {
    /// Entry name (for listings) or canonical path (for REALPATH).
    pub filename: String,
    /// `ls -l` style line for display.
    pub longname: String,
    /// Entry attributes.
    pub attrs: FileAttributes,
}

// ============================================================================
// Status codes
// ============================================================================

/// Status codes carried by STATUS responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    /// Operation succeeded.
    Ok,
    /// End of file or end of a directory listing.
    Eof,
    /// Target missing, of the wrong type, or an unknown handle.
    NoSuchFile,
    /// Any other failure.
    Failure,
}

impl StatusCode {
    /// Numeric code as defined by SFTP v3.
    pub fn code(self) -> u32 {
        match self {
            StatusCode::Ok => 0,
            StatusCode::Eof => 1,
            StatusCode::NoSuchFile => 2,
            StatusCode::Failure => 4,
        }
    }

    /// Inverse of [`StatusCode::code`].
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(StatusCode::Ok),
            1 => Some(StatusCode::Eof),
            2 => Some(StatusCode::NoSuchFile),
            4 => Some(StatusCode::Failure),
            _ => None,
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusCode::Ok => "OK",
            StatusCode::Eof => "EOF",
            StatusCode::NoSuchFile => "NO_SUCH_FILE",
            StatusCode::Failure => "FAILURE",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Requests
// ============================================================================

/// A file operation requested by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "args")]
pub enum Operation {
    /// Canonicalize a path.
    RealPath {
        /// Client path.
        path: String,
    },
    /// Open a directory for listing.
    OpenDir {
        /// Client path.
        path: String,
    },
    /// Read the entries of an open directory.
    ReadDir {
        /// Directory handle.
        handle: Handle,
    },
    /// Open a file.
    Open {
        /// Client path.
        path: String,
        /// Open flags.
        flags: OpenFlags,
    },
    /// Read bytes from an open file.
    Read {
        /// File handle.
        handle: Handle,
        /// Byte offset.
        offset: u64,
        /// Maximum number of bytes.
        length: u32,
    },
    /// Write bytes to an open file.
    Write {
        /// File handle.
        handle: Handle,
        /// Byte offset.
        offset: u64,
        /// Bytes to write.
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    /// Close a file or directory handle.
    Close {
        /// Handle to close.
        handle: Handle,
    },
    /// Attributes of a path, following symlinks.
    Stat {
        /// Client path.
        path: String,
    },
    /// Attributes of a path, not following symlinks.
    LStat {
        /// Client path.
        path: String,
    },
    /// Create a directory.
    Mkdir {
        /// Client path.
        path: String,
    },
    /// Remove an empty directory.
    Rmdir {
        /// Client path.
        path: String,
    },
    /// Remove a file.
    Remove {
        /// Client path.
        path: String,
    },
    /// Rename or move a file or directory.
    Rename {
        /// Existing client path.
        from: String,
        /// New client path.
        to: String,
    },
}

impl Operation {
    /// Protocol verb name, used in logs.
    pub fn verb(&self) -> &'static str {
        match self {
            Operation::RealPath { .. } => "REALPATH",
            Operation::OpenDir { .. } => "OPENDIR",
            Operation::ReadDir { .. } => "READDIR",
            Operation::Open { .. } => "OPEN",
            Operation::Read { .. } => "READ",
            Operation::Write { .. } => "WRITE",
            Operation::Close { .. } => "CLOSE",
            Operation::Stat { .. } => "STAT",
            Operation::LStat { .. } => "LSTAT",
            Operation::Mkdir { .. } => "MKDIR",
            Operation::Rmdir { .. } => "RMDIR",
            Operation::Remove { .. } => "REMOVE",
            Operation::Rename { .. } => "RENAME",
        }
    }
}

/// A request as handed over by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Client-chosen request id.
    pub id: RequestId,
    /// The operation to perform.
    pub op: Operation,
}

impl Request {
    /// Create a request.
    pub fn new(id: RequestId, op: Operation) -> Self {
        Self { id, op }
    }
}

// ============================================================================
// Responses
// ============================================================================

/// Payload of a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body")]
pub enum ResponseBody {
    /// Named entries (READDIR, REALPATH).
    Name(Vec<NameEntry>),
    /// File data (READ).
    Data(#[serde(with = "serde_bytes")] Vec<u8>),
    /// Attributes (STAT, LSTAT).
    Attrs(FileAttributes),
    /// Newly created handle (OPEN, OPENDIR).
    Handle(Handle),
    /// Status code.
    Status(StatusCode),
}

/// A response to exactly one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Id of the request being answered.
    pub id: RequestId,
    /// Response payload.
    pub body: ResponseBody,
}

impl Response {
    /// STATUS response.
    pub fn status(id: RequestId, code: StatusCode) -> Self {
        Self {
            id,
            body: ResponseBody::Status(code),
        }
    }

    /// NAME response.
    pub fn name(id: RequestId, entries: Vec<NameEntry>) -> Self {
        Self {
            id,
            body: ResponseBody::Name(entries),
        }
    }

    /// DATA response.
    pub fn data(id: RequestId, data: Vec<u8>) -> Self {
        Self {
            id,
            body: ResponseBody::Data(data),
        }
    }

    /// ATTRS response.
    pub fn attrs(id: RequestId, attrs: FileAttributes) -> Self {
        Self {
            id,
            body: ResponseBody::Attrs(attrs),
        }
    }

    /// HANDLE response.
    pub fn handle(id: RequestId, handle: Handle) -> Self {
        Self {
            id,
            body: ResponseBody::Handle(handle),
        }
    }

    /// Status code, if this is a STATUS response.
    pub fn status_code(&self) -> Option<StatusCode> {
        match self.body {
            ResponseBody::Status(code) => Some(code),
            _ => None,
        }
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// Anything that travels on a session stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Packet {
    /// Client to daemon.
    Request(Request),
    /// Daemon to client.
    Response(Response),
}

/// Envelope wrapper adding a version and a per-direction sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version for compatibility checking.
    pub version: u8,
    /// Sequence number, increasing per sender.
    pub sequence: u64,
    /// The packet.
    pub payload: Packet,
}

impl Envelope {
    /// Create a new envelope with the current protocol version.
    pub fn new(sequence: u64, payload: Packet) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            sequence,
            payload,
        }
    }

    /// Serialize the envelope to MessagePack bytes.
    ///
    /// Structs are written as maps; tagged operations with struct variants
    /// cannot be read back from the compact array form.
    pub fn to_msgpack(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Deserialize an envelope from MessagePack bytes, rejecting unknown versions.
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self> {
        let envelope: Envelope = rmp_serde::from_slice(bytes)?;
        if envelope.version != PROTOCOL_VERSION {
            return Err(ProtocolError::UnsupportedVersion(envelope.version));
        }
        Ok(envelope)
    }
}
