//! Length-prefix framing for message streams.
//!
//! Messages on a byte stream are delimited by a length header. The default
//! header follows CBOR major type 0: the low values of the first byte carry
//! the length directly, three codes announce a 1, 2 or 4 byte big-endian
//! length that follows, and everything from `0x1B` upwards is reserved.
//!
//! ```text
//! 0x00..=0x17  length = header                      (1 byte header)
//! 0x18         length = next u8                     (2 byte header)
//! 0x19         length = next u16 (big-endian)       (3 byte header)
//! 0x1A         length = next u32 (big-endian)       (5 byte header)
//! 0x1B..=0xFF  reserved, rejected
//! ```
//!
//! A fixed four-byte big-endian header is available as an alternative
//! framing. Both decoders are restartable: they never consume bytes until
//! an entire frame (header and payload) is buffered.

use crate::error::FrameError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Largest payload any framing will carry (2^31 - 1 bytes)
pub const MAX_FRAME_LENGTH: usize = i32::MAX as usize;

/// Largest length carried directly in the header byte
pub const DIRECT_LENGTH_MAX: u8 = 0x17;

/// Most a partial frame may grow the buffer by before its bytes arrive
pub const DECODE_RESERVE_LIMIT: usize = 8 * 1024;

/// Header code: one length byte follows
pub const LENGTH_CODE_U8: u8 = 0x18;

/// Header code: two length bytes follow
pub const LENGTH_CODE_U16: u8 = 0x19;

/// Header code: four length bytes follow
pub const LENGTH_CODE_U32: u8 = 0x1A;

/// Header size of the fixed-width framing
pub const FOUR_BYTE_HEADER_SIZE: usize = 4;

/// Framing variant used on a stream connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    /// CBOR major-type-0 style variable length prefix
    #[default]
    VariableLength,
    /// Constant 4-byte big-endian length prefix
    FourByte,
}

/// Classification of a variable-length header byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthCode {
    /// Length is the header value itself (0-23)
    Direct(u8),
    /// Length is stored in the given number of following bytes (1, 2 or 4)
    Extended(usize),
    /// Reserved header value
    Reserved,
}

impl LengthCode {
    /// Classify the first byte of a variable-length header.
    pub fn classify(header: u8) -> Self {
        match header {
            0x00..=DIRECT_LENGTH_MAX => Self::Direct(header),
            LENGTH_CODE_U8 => Self::Extended(1),
            LENGTH_CODE_U16 => Self::Extended(2),
            LENGTH_CODE_U32 => Self::Extended(4),
            _ => Self::Reserved,
        }
    }

    /// Total header size (header byte plus extension bytes)
    pub fn header_size(&self) -> usize {
        match self {
            Self::Direct(_) | Self::Reserved => 1,
            Self::Extended(n) => 1 + n,
        }
    }
}

/// Stateless encoder/decoder for one framing variant.
///
/// # Examples
///
/// ```
/// use bytes::BytesMut;
/// use conduit_core::frame::FrameCodec;
///
/// let codec = FrameCodec::variable_length();
/// let mut wire = BytesMut::new();
/// codec.encode(b"hello", &mut wire).unwrap();
/// assert_eq!(&wire[..], b"\x05hello");
///
/// let payload = codec.decode(&mut wire).unwrap().unwrap();
/// assert_eq!(&payload[..], b"hello");
/// assert!(wire.is_empty());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    framing: Framing,
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::variable_length()
    }
}

impl FrameCodec {
    /// Create a codec for `framing` accepting payloads up to `max_frame_size`.
    ///
    /// The maximum is capped at [`MAX_FRAME_LENGTH`].
    #[must_use]
    pub fn new(framing: Framing, max_frame_size: usize) -> Self {
        Self {
            framing,
            max_frame_size: max_frame_size.min(MAX_FRAME_LENGTH),
        }
    }

    /// Variable-length framing with the largest allowed maximum.
    #[must_use]
    pub fn variable_length() -> Self {
        Self::new(Framing::VariableLength, MAX_FRAME_LENGTH)
    }

    /// Fixed four-byte framing with the largest allowed maximum.
    #[must_use]
    pub fn four_byte() -> Self {
        Self::new(Framing::FourByte, MAX_FRAME_LENGTH)
    }

    /// Replace the maximum payload size.
    #[must_use]
    pub fn with_max_frame_size(self, max_frame_size: usize) -> Self {
        Self::new(self.framing, max_frame_size)
    }

    /// Framing variant
    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Maximum payload size in bytes
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Header size used for a payload of `len` bytes.
    pub fn header_size(&self, len: usize) -> usize {
        match self.framing {
            Framing::FourByte => FOUR_BYTE_HEADER_SIZE,
            Framing::VariableLength => match len {
                0..=0x17 => 1,
                0x18..=0xFF => 2,
                0x100..=0xFFFF => 3,
                _ => 5,
            },
        }
    }

    /// Append the framed `payload` to `dst`.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::FrameTooLarge`] if the payload exceeds the
    /// configured maximum; `dst` is left untouched in that case.
    pub fn encode(&self, payload: &[u8], dst: &mut BytesMut) -> Result<(), FrameError> {
        let len = payload.len();
        if len > self.max_frame_size {
            return Err(FrameError::FrameTooLarge {
                len: len as u64,
                max: self.max_frame_size,
            });
        }

        dst.reserve(self.header_size(len) + len);
        match self.framing {
            Framing::FourByte => dst.put_u32(len as u32),
            Framing::VariableLength => match len {
                0..=0x17 => dst.put_u8(len as u8),
                0x18..=0xFF => {
                    dst.put_u8(LENGTH_CODE_U8);
                    dst.put_u8(len as u8);
                }
                0x100..=0xFFFF => {
                    dst.put_u8(LENGTH_CODE_U16);
                    dst.put_u16(len as u16);
                }
                _ => {
                    dst.put_u8(LENGTH_CODE_U32);
                    dst.put_u32(len as u32);
                }
            },
        }
        dst.extend_from_slice(payload);
        Ok(())
    }

    /// Frame `payload` into a fresh buffer.
    ///
    /// # Errors
    ///
    /// Same as [`FrameCodec::encode`].
    pub fn encode_to_bytes(&self, payload: &[u8]) -> Result<Bytes, FrameError> {
        let mut dst = BytesMut::with_capacity(self.header_size(payload.len()) + payload.len());
        self.encode(payload, &mut dst)?;
        Ok(dst.freeze())
    }

    /// Try to take one complete frame off the front of `src`.
    ///
    /// Returns `Ok(None)` when more bytes are needed; nothing is consumed
    /// in that case, so the call can simply be repeated once more data has
    /// been appended.
    ///
    /// # Errors
    ///
    /// - [`FrameError::CorruptedFrame`] for a reserved header byte
    /// - [`FrameError::FrameTooLarge`] when the declared length exceeds the
    ///   configured maximum
    ///
    /// Neither error consumes any bytes.
    pub fn decode(&self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        let Some((header_size, len)) = self.peek_header(src)? else {
            return Ok(None);
        };

        if len > self.max_frame_size as u64 {
            return Err(FrameError::FrameTooLarge {
                len,
                max: self.max_frame_size,
            });
        }

        let total = header_size + len as usize;
        if src.len() < total {
            // The declared length is untrusted; only reserve a bounded amount.
            src.reserve((total - src.len()).min(DECODE_RESERVE_LIMIT));
            return Ok(None);
        }

        src.advance(header_size);
        Ok(Some(src.split_to(len as usize).freeze()))
    }

    /// Decode every complete frame currently buffered in `src`.
    ///
    /// # Errors
    ///
    /// Stops at the first framing error; frames decoded before it are lost
    /// to the caller, which is acceptable since the connection is closed.
    pub fn decode_all(&self, src: &mut BytesMut) -> Result<Vec<Bytes>, FrameError> {
        let mut frames = Vec::new();
        while let Some(frame) = self.decode(src)? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Read header size and declared length without consuming anything.
    fn peek_header(&self, src: &[u8]) -> Result<Option<(usize, u64)>, FrameError> {
        match self.framing {
            Framing::FourByte => {
                if src.len() < FOUR_BYTE_HEADER_SIZE {
                    return Ok(None);
                }
                let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
                Ok(Some((FOUR_BYTE_HEADER_SIZE, u64::from(len))))
            }
            Framing::VariableLength => {
                let Some(&first) = src.first() else {
                    return Ok(None);
                };
                match LengthCode::classify(first) {
                    LengthCode::Direct(len) => Ok(Some((1, u64::from(len)))),
                    LengthCode::Extended(n) => {
                        if src.len() < 1 + n {
                            return Ok(None);
                        }
                        let len = src[1..=n]
                            .iter()
                            .fold(0u64, |acc, &b| (acc << 8) | u64::from(b));
                        Ok(Some((1 + n, len)))
                    }
                    LengthCode::Reserved => Err(FrameError::CorruptedFrame(first)),
                }
            }
        }
    }
}
