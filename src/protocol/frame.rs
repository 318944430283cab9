//! WebSocket frame encoding and header decoding (RFC 6455 Section 5.2).
//!
//! The server side only ever encodes frames. Decoding exists so the probe
//! client can report exactly which header bits a scenario put on the wire,
//! so it deliberately does not reject frames with reserved bits set.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::protocol::OpCode;

const FIN_BIT: u8 = 0x80;
const RSV1_BIT: u8 = 0x40;
const RSV2_BIT: u8 = 0x20;
const RSV3_BIT: u8 = 0x10;
const MASK_BIT: u8 = 0x80;

/// XOR `data` with the 4-byte masking key.
#[inline]
pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= mask[i & 3];
    }
}

/// Size of the length field following the second header byte.
#[inline]
const fn extended_len_size(payload_len: usize) -> usize {
    if payload_len <= 125 {
        0
    } else if payload_len <= 0xFFFF {
        2
    } else {
        8
    }
}

/// A single WebSocket frame.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-------+-+-------------+-------------------------------+
/// |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
/// |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
/// |N|V|V|V|       |S|             |   (if payload len==126/127)   |
/// | |1|2|3|       |K|             |                               |
/// +-+-+-+-+-------+-+-------------+-------------------------------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment flag.
    pub fin: bool,
    /// Reserved bit 1.
    pub rsv1: bool,
    /// Reserved bit 2.
    pub rsv2: bool,
    /// Reserved bit 3.
    pub rsv3: bool,
    /// Frame opcode.
    pub opcode: OpCode,
    /// Whether the frame arrived masked. Only meaningful for parsed frames.
    pub masked: bool,
    payload: Bytes,
}

impl Frame {
    /// Create a frame with all reserved bits clear.
    #[must_use]
    pub fn new(fin: bool, opcode: OpCode, payload: impl Into<Bytes>) -> Self {
        Self {
            fin,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode,
            masked: false,
            payload: payload.into(),
        }
    }

    /// Create a final text frame.
    #[must_use]
    pub fn text(data: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Text, data)
    }

    /// Create a final binary frame.
    #[must_use]
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(true, OpCode::Binary, data)
    }

    /// Create a close frame with optional status code and reason.
    #[must_use]
    pub fn close(code: Option<u16>, reason: &str) -> Self {
        let payload = match code {
            Some(code) => {
                let mut data = BytesMut::with_capacity(2 + reason.len());
                data.put_u16(code);
                data.put_slice(reason.as_bytes());
                data.freeze()
            }
            None => Bytes::new(),
        };
        Self::new(true, OpCode::Close, payload)
    }

    /// Set the three reserved bits.
    #[must_use]
    pub fn with_rsv(mut self, rsv1: bool, rsv2: bool, rsv3: bool) -> Self {
        self.rsv1 = rsv1;
        self.rsv2 = rsv2;
        self.rsv3 = rsv3;
        self
    }

    /// True if any reserved bit is set.
    #[inline]
    #[must_use]
    pub const fn has_rsv(&self) -> bool {
        self.rsv1 || self.rsv2 || self.rsv3
    }

    /// Payload bytes (already unmasked for parsed frames).
    #[inline]
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// First header byte: FIN, RSV1-3 and opcode.
    #[must_use]
    pub const fn first_byte(&self) -> u8 {
        let mut byte0 = self.opcode.as_u8();
        if self.fin {
            byte0 |= FIN_BIT;
        }
        if self.rsv1 {
            byte0 |= RSV1_BIT;
        }
        if self.rsv2 {
            byte0 |= RSV2_BIT;
        }
        if self.rsv3 {
            byte0 |= RSV3_BIT;
        }
        byte0
    }

    /// Number of bytes this frame occupies on the wire.
    #[must_use]
    pub fn wire_size(&self, masked: bool) -> usize {
        let len = self.payload.len();
        let mask_size = if masked { 4 } else { 0 };
        2 + extended_len_size(len) + mask_size + len
    }

    /// Append the encoded frame to `dst`.
    ///
    /// Server frames pass `None`; a masking key is only used by the probe
    /// when it answers with a Close frame.
    pub fn encode_into(&self, dst: &mut BytesMut, mask: Option<[u8; 4]>) {
        let payload_len = self.payload.len();
        dst.reserve(self.wire_size(mask.is_some()));
        dst.put_u8(self.first_byte());

        let mask_flag = if mask.is_some() { MASK_BIT } else { 0 };
        match extended_len_size(payload_len) {
            0 => dst.put_u8(mask_flag | payload_len as u8),
            2 => {
                dst.put_u8(mask_flag | 126);
                dst.put_u16(payload_len as u16);
            }
            _ => {
                dst.put_u8(mask_flag | 127);
                dst.put_u64(payload_len as u64);
            }
        }

        match mask {
            Some(key) => {
                dst.put_slice(&key);
                let start = dst.len();
                dst.put_slice(&self.payload);
                apply_mask(&mut dst[start..], key);
            }
            None => dst.put_slice(&self.payload),
        }
    }

    /// Encode the frame unmasked into a fresh buffer.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.wire_size(false));
        self.encode_into(&mut buf, None);
        buf.freeze()
    }

    /// Decode one frame from the start of `buf`.
    ///
    /// Returns the frame and the number of bytes consumed. Reserved bits are
    /// reported as-is.
    ///
    /// # Errors
    ///
    /// - `Error::IncompleteFrame` if `buf` does not yet hold the whole frame
    /// - `Error::ReservedOpcode` / `Error::InvalidOpcode` for unknown opcodes
    /// - `Error::InvalidFrame` if the declared length does not fit in memory
    pub fn parse(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < 2 {
            return Err(Error::IncompleteFrame {
                needed: 2 - buf.len(),
            });
        }

        let byte0 = buf[0];
        let byte1 = buf[1];
        let opcode = OpCode::from_u8(byte0 & 0x0F)?;
        let masked = byte1 & MASK_BIT != 0;

        let (payload_len, mut offset) = match byte1 & 0x7F {
            126 => {
                if buf.len() < 4 {
                    return Err(Error::IncompleteFrame {
                        needed: 4 - buf.len(),
                    });
                }
                (u16::from_be_bytes([buf[2], buf[3]]) as usize, 4)
            }
            127 => {
                if buf.len() < 10 {
                    return Err(Error::IncompleteFrame {
                        needed: 10 - buf.len(),
                    });
                }
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&buf[2..10]);
                let len = usize::try_from(u64::from_be_bytes(raw)).map_err(|_| {
                    Error::InvalidFrame("payload length exceeds platform limits".into())
                })?;
                (len, 10)
            }
            short => (short as usize, 2),
        };

        let mask = if masked {
            if buf.len() < offset + 4 {
                return Err(Error::IncompleteFrame {
                    needed: offset + 4 - buf.len(),
                });
            }
            let key = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
            offset += 4;
            Some(key)
        } else {
            None
        };

        let total = offset
            .checked_add(payload_len)
            .ok_or_else(|| Error::InvalidFrame("payload length overflow".into()))?;
        if buf.len() < total {
            return Err(Error::IncompleteFrame {
                needed: total - buf.len(),
            });
        }

        let mut payload = buf[offset..total].to_vec();
        if let Some(key) = mask {
            apply_mask(&mut payload, key);
        }

        let frame = Frame {
            fin: byte0 & FIN_BIT != 0,
            rsv1: byte0 & RSV1_BIT != 0,
            rsv2: byte0 & RSV2_BIT != 0,
            rsv3: byte0 & RSV3_BIT != 0,
            opcode,
            masked,
            payload: Bytes::from(payload),
        };
        Ok((frame, total))
    }

    /// Split a close payload into status code and reason.
    ///
    /// Returns `None` for non-close frames and for close frames without a
    /// status code.
    #[must_use]
    pub fn close_code(&self) -> Option<(u16, String)> {
        if self.opcode != OpCode::Close || self.payload.len() < 2 {
            return None;
        }
        let code = u16::from_be_bytes([self.payload[0], self.payload[1]]);
        let reason = String::from_utf8_lossy(&self.payload[2..]).into_owned();
        Some((code, reason))
    }
}
