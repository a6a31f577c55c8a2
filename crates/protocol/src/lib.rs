//! # dirshare Protocol Library
//!
//! Typed model of the file-transfer requests the daemon serves, plus the
//! envelope and frame codec used to move them over a byte stream.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Request / Response packets       │  MessagePack-encoded
//! ├─────────────────────────────────────────┤
//! │              Framing                    │  Length-prefixed, LZ4
//! ├─────────────────────────────────────────┤
//! │   External transport (auth, encryption) │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{Envelope, Frame, FrameCodec, Operation, Packet, Request};
//!
//! let request = Request::new(1, Operation::OpenDir { path: "/".to_string() });
//! let bytes = Envelope::new(0, Packet::Request(request)).to_msgpack().unwrap();
//!
//! let codec = FrameCodec::new();
//! let frame_bytes = codec.encode(&Frame::new(bytes)).unwrap();
//! assert_eq!(codec.frame_length(&frame_bytes).unwrap(), frame_bytes.len());
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Requests, responses, handles, attributes and status codes
//! - [`framing`]: Frame codec with compression
//! - [`error`]: Error types

pub mod error;
pub mod framing;
pub mod messages;

pub use error::{ProtocolError, Result};
pub use framing::{
    Frame, FrameCodec, FrameFlags, COMPRESSION_THRESHOLD, FRAME_HEADER_SIZE, FRAME_MAGIC,
    MAX_FRAME_SIZE,
};
pub use messages::{
    Envelope, FileAttributes, Handle, NameEntry, OpenFlags, OpenMode, Operation, Packet, Request,
    RequestId, Response, ResponseBody, StatusCode, HANDLE_LENGTH, PROTOCOL_VERSION,
};
