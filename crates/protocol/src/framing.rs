//! Length-prefixed frames with optional LZ4 compression.
//!
//! # Frame Format
//!
//! - 4 bytes: magic "DSHR"
//! - 4 bytes: content length (big-endian, flags byte included)
//! - 1 byte: flags (bit 0 = compressed)
//! - N bytes: payload (LZ4 with prepended size when compressed)
//!
//! Payloads above [`COMPRESSION_THRESHOLD`] are compressed when that makes
//! them smaller. Listing responses for large directories and READ data
//! dominate the traffic, so the threshold is low.

use crate::error::{ProtocolError, Result};

/// Magic bytes identifying a dirshare frame.
pub const FRAME_MAGIC: [u8; 4] = *b"DSHR";

/// Payloads larger than this are candidates for compression.
pub const COMPRESSION_THRESHOLD: usize = 1024;

/// Maximum encoded frame size (16 MB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Header size: 4 (magic) + 4 (length) + 1 (flags).
pub const FRAME_HEADER_SIZE: usize = 9;

/// Bytes preceding the length-counted content (magic + length).
const PREFIX_SIZE: usize = 8;

/// Flags byte of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Payload is LZ4 compressed.
    pub const COMPRESSED: u8 = 0b0000_0001;

    /// Empty flag set.
    #[inline]
    pub fn new() -> Self {
        Self(0)
    }

    /// Flags from a raw byte.
    #[inline]
    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    /// Raw byte value.
    #[inline]
    pub fn as_byte(self) -> u8 {
        self.0
    }

    /// Whether the compressed bit is set.
    #[inline]
    pub fn is_compressed(self) -> bool {
        self.0 & Self::COMPRESSED != 0
    }

    /// Return a copy with the compressed bit set or cleared.
    #[inline]
    pub fn with_compressed(self, compressed: bool) -> Self {
        if compressed {
            Self(self.0 | Self::COMPRESSED)
        } else {
            Self(self.0 & !Self::COMPRESSED)
        }
    }
}

/// A decoded frame. The payload is always held uncompressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame flags.
    pub flags: FrameFlags,
    /// Uncompressed payload.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Frame around a payload.
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            flags: FrameFlags::new(),
            payload,
        }
    }
}

/// Encoder and decoder for frames.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    compression_enabled: bool,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Codec with compression enabled.
    pub fn new() -> Self {
        Self {
            compression_enabled: true,
        }
    }

    /// Codec that never compresses. Compressed frames are still decoded.
    pub fn without_compression() -> Self {
        Self {
            compression_enabled: false,
        }
    }

    /// Whether outgoing payloads may be compressed.
    pub fn compression_enabled(&self) -> bool {
        self.compression_enabled
    }

    /// Encode a frame into bytes.
    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>> {
        let payload = &frame.payload;

        if payload.len() > MAX_FRAME_SIZE - FRAME_HEADER_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: payload.len() + FRAME_HEADER_SIZE,
                max: MAX_FRAME_SIZE,
            });
        }

        let compressed = if self.compression_enabled && payload.len() > COMPRESSION_THRESHOLD {
            Some(lz4_flex::compress_prepend_size(payload)).filter(|c| c.len() < payload.len())
        } else {
            None
        };

        let (body, flags) = match &compressed {
            Some(c) => (c.as_slice(), frame.flags.with_compressed(true)),
            None => (payload.as_slice(), frame.flags.with_compressed(false)),
        };

        let content_len = 1 + body.len();
        let mut output = Vec::with_capacity(PREFIX_SIZE + content_len);
        output.extend_from_slice(&FRAME_MAGIC);
        output.extend_from_slice(&(content_len as u32).to_be_bytes());
        output.push(flags.as_byte());
        output.extend_from_slice(body);

        Ok(output)
    }

    /// Total encoded length of the frame whose header starts `data`.
    ///
    /// `data` must hold at least [`FRAME_HEADER_SIZE`] bytes. Streaming
    /// readers call this after reading the header to learn how much more to
    /// read.
    pub fn frame_length(&self, data: &[u8]) -> Result<usize> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(ProtocolError::Deserialization(format!(
                "insufficient data for frame header: need {} bytes, have {}",
                FRAME_HEADER_SIZE,
                data.len()
            )));
        }

        let magic: [u8; 4] = [data[0], data[1], data[2], data[3]];
        if magic != FRAME_MAGIC {
            return Err(ProtocolError::InvalidFrameMagic {
                expected: u32::from_be_bytes(FRAME_MAGIC),
                got: u32::from_be_bytes(magic),
            });
        }

        let content_len = u32::from_be_bytes([data[4], data[5], data[6], data[7]]) as usize;
        if content_len < 1 {
            return Err(ProtocolError::Deserialization(
                "invalid frame: content length must cover the flags byte".to_string(),
            ));
        }

        let total = PREFIX_SIZE + content_len;
        if total > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: total,
                max: MAX_FRAME_SIZE,
            });
        }

        Ok(total)
    }

    /// Decode one frame from the start of `data`.
    ///
    /// Returns the frame and the number of bytes consumed.
    pub fn decode(&self, data: &[u8]) -> Result<(Frame, usize)> {
        let total = self.frame_length(data)?;
        if data.len() < total {
            return Err(ProtocolError::Deserialization(format!(
                "insufficient data for frame: need {} bytes, have {}",
                total,
                data.len()
            )));
        }

        let flags = FrameFlags::from_byte(data[PREFIX_SIZE]);
        let body = &data[FRAME_HEADER_SIZE..total];

        let payload = if flags.is_compressed() {
            let declared = decompressed_size(body)?;
            if declared > MAX_FRAME_SIZE {
                return Err(ProtocolError::FrameTooLarge {
                    size: declared,
                    max: MAX_FRAME_SIZE,
                });
            }
            lz4_flex::decompress_size_prepended(body).map_err(|e| {
                ProtocolError::Deserialization(format!("failed to decompress payload: {}", e))
            })?
        } else {
            body.to_vec()
        };

        Ok((
            Frame {
                flags: flags.with_compressed(false),
                payload,
            },
            total,
        ))
    }

    /// Decode a frame if `data` holds a complete one, `None` otherwise.
    pub fn try_decode(&self, data: &[u8]) -> Result<Option<(Frame, usize)>> {
        if data.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        if data.len() < self.frame_length(data)? {
            return Ok(None);
        }
        self.decode(data).map(Some)
    }
}

/// Size recorded in the little-endian prefix of an LZ4 body.
fn decompressed_size(body: &[u8]) -> Result<usize> {
    let prefix: [u8; 4] = body
        .get(..4)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or_else(|| {
            ProtocolError::Deserialization("compressed payload missing size prefix".to_string())
        })?;
    Ok(u32::from_le_bytes(prefix) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_flags() {
        let flags = FrameFlags::new();
        assert!(!flags.is_compressed());
        assert!(flags.with_compressed(true).is_compressed());
        assert!(!FrameFlags::from_byte(0b1111_1110).is_compressed());
        assert_eq!(
            FrameFlags::from_byte(0xFF).with_compressed(false).as_byte(),
            0xFE
        );
    }

    #[test]
    fn test_encode_layout() {
        let codec = FrameCodec::new();
        let encoded = codec.encode(&Frame::new(vec![1, 2, 3])).unwrap();

        assert_eq!(&encoded[0..4], b"DSHR");
        assert_eq!(&encoded[4..8], &4u32.to_be_bytes());
        assert_eq!(encoded[8], 0);
        assert_eq!(&encoded[9..], &[1, 2, 3]);
        assert_eq!(codec.frame_length(&encoded).unwrap(), encoded.len());
    }

    #[test]
    fn test_encode_decode_empty_payload() {
        let codec = FrameCodec::new();
        let encoded = codec.encode(&Frame::new(vec![])).unwrap();
        let (decoded, consumed) = codec.decode(&encoded).unwrap();
        assert!(decoded.payload.is_empty());
        assert_eq!(consumed, FRAME_HEADER_SIZE);
    }

    #[test]
    fn test_large_repetitive_payload_is_compressed() {
        let codec = FrameCodec::new();
        let payload: Vec<u8> = (0..4096).map(|i| (i % 16) as u8).collect();

        let encoded = codec.encode(&Frame::new(payload.clone())).unwrap();
        assert_eq!(encoded[8] & FrameFlags::COMPRESSED, FrameFlags::COMPRESSED);
        assert!(encoded.len() < payload.len());

        let (decoded, consumed) = codec.decode(&encoded).unwrap();
        assert_eq!(decoded.payload, payload);
        assert!(!decoded.flags.is_compressed());
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_without_compression_still_decodes_compressed() {
        let payload: Vec<u8> = vec![7u8; 4096];
        let compressed = FrameCodec::new().encode(&Frame::new(payload.clone())).unwrap();

        let plain_codec = FrameCodec::without_compression();
        let plain = plain_codec.encode(&Frame::new(payload.clone())).unwrap();
        assert_eq!(plain[8], 0);

        let (decoded, _) = plain_codec.decode(&compressed).unwrap();
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn test_decode_rejects_bad_magic() {
        let codec = FrameCodec::new();
        let mut encoded = codec.encode(&Frame::new(vec![1])).unwrap();
        encoded[0] = b'X';
        assert!(matches!(
            codec.decode(&encoded),
            Err(ProtocolError::InvalidFrameMagic { .. })
        ));
    }

    #[test]
    fn test_frame_length_rejects_oversized() {
        let codec = FrameCodec::new();
        let mut header = Vec::new();
        header.extend_from_slice(&FRAME_MAGIC);
        header.extend_from_slice(&(MAX_FRAME_SIZE as u32).to_be_bytes());
        header.push(0);
        assert!(matches!(
            codec.frame_length(&header),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_frame_length_rejects_zero_content() {
        let codec = FrameCodec::new();
        let mut header = Vec::new();
        header.extend_from_slice(&FRAME_MAGIC);
        header.extend_from_slice(&0u32.to_be_bytes());
        header.push(0);
        assert!(codec.frame_length(&header).is_err());
    }

    #[test]
    fn test_try_decode_partial_and_back_to_back() {
        let codec = FrameCodec::new();
        let first = codec.encode(&Frame::new(b"first".to_vec())).unwrap();
        let second = codec.encode(&Frame::new(b"second".to_vec())).unwrap();

        assert!(codec.try_decode(&first[..4]).unwrap().is_none());
        assert!(codec.try_decode(&first[..first.len() - 1]).unwrap().is_none());

        let mut stream = first.clone();
        stream.extend_from_slice(&second);
        let (frame, consumed) = codec.try_decode(&stream).unwrap().unwrap();
        assert_eq!(frame.payload, b"first");
        let (frame, _) = codec.try_decode(&stream[consumed..]).unwrap().unwrap();
        assert_eq!(frame.payload, b"second");
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let codec = FrameCodec::without_compression();
        let payload = vec![0u8; MAX_FRAME_SIZE];
        assert!(matches!(
            codec.encode(&Frame::new(payload)),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_oversized_decompressed_size() {
        let codec = FrameCodec::new();
        let mut encoded = codec.encode(&Frame::new(vec![0u8; 4096])).unwrap();
        assert_eq!(encoded[8], FrameFlags::COMPRESSED);

        // Claim a 64 MB payload behind a frame of a few dozen bytes.
        let claimed = (64 * 1024 * 1024u32).to_le_bytes();
        encoded[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + 4].copy_from_slice(&claimed);

        match codec.decode(&encoded) {
            Err(ProtocolError::FrameTooLarge { size, max }) => {
                assert_eq!(size, 64 * 1024 * 1024);
                assert_eq!(max, MAX_FRAME_SIZE);
            }
            other => panic!("Expected FrameTooLarge, got {:?}", other.map(|(f, _)| f.payload.len())),
        }
    }

    #[test]
    fn test_decode_rejects_compressed_body_without_size() {
        let codec = FrameCodec::new();
        let mut encoded = Vec::new();
        encoded.extend_from_slice(&FRAME_MAGIC);
        encoded.extend_from_slice(&3u32.to_be_bytes());
        encoded.push(FrameFlags::COMPRESSED);
        encoded.extend_from_slice(&[1, 2]);
        assert!(matches!(
            codec.decode(&encoded),
            Err(ProtocolError::Deserialization(_))
        ));
    }
}
