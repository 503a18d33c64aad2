//! 9P wire framing: the fixed message header and integer field codec.
//!
//! Every 9P message starts with the same seven bytes:
//! `size[4] type[1] tag[2]`, followed by `size - 7` bytes of
//! opcode-specific body. `size` counts itself. Multi-byte integers are
//! little-endian on the wire.
//!
//! # Protocol
//! 9P2000

use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};
use enum_primitive::*;

/// 9P2000 version string
pub const P92000: &str = "9P2000";

/// Byte length of the fixed message header: size[4] type[1] tag[2]
pub const HEADER_SIZE: usize = 7;

/// Special tag which `TVersion`/`RVersion` must use as `tag`
pub const NOTAG: u16 = !0;

/// Default upper bound on the declared `size` field.
///
/// A frame claiming to be larger than this is treated as a framing error
/// rather than buffered; real 9P clients negotiate msize well below it.
pub const DEFAULT_MAX_MSIZE: u32 = 8 * 1024 * 1024;

enum_from_primitive! {
    #[doc = "Message type, 9P2000 operations"]
    #[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
    pub enum MsgType {
        TVersion        = 100,
        RVersion,
        TAuth           = 102,
        RAuth,
        TAttach         = 104,
        RAttach,
        //TError          = 106,  // Illegal, never used
        RError          = 107,
        TFlush          = 108,
        RFlush,
        TWalk           = 110,
        RWalk,
        TOpen           = 112,
        ROpen,
        TCreate         = 114,
        RCreate,
        TRead           = 116,
        RRead,
        TWrite          = 118,
        RWrite,
        TClunk          = 120,
        RClunk,
        TRemove         = 122,
        RRemove,
        TStat           = 124,
        RStat,
        TWStat          = 126,
        RWStat,
    }
}

impl MsgType {
    /// If the message type is T-message
    pub fn is_t(&self) -> bool {
        !self.is_r()
    }

    /// If the message type is R-message
    pub fn is_r(&self) -> bool {
        (*self as u8) & 1 == 1
    }
}

/// Read an unsigned little-endian integer of `width` bytes at `offset`.
///
/// The caller must have checked that `buf` holds at least
/// `offset + width` bytes; anything else is a caller bug, not a runtime
/// condition.
pub fn read_uint(buf: &[u8], offset: usize, width: usize) -> u64 {
    LittleEndian::read_uint(&buf[offset..offset + width], width)
}

/// Serialize `value` into exactly `width` little-endian bytes,
/// appending them to `buf`.
///
/// Panics if `value` does not fit in `width` bytes; protocol invariants
/// guarantee it always does.
pub fn write_uint(buf: &mut BytesMut, value: u64, width: usize) {
    let mut field = [0u8; 8];
    LittleEndian::write_uint(&mut field[..width], value, width);
    buf.extend_from_slice(&field[..width]);
}

/// The fixed prefix of every 9P message.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Header {
    /// Total message length in bytes, including the size field itself
    pub size: u32,
    /// Opcode identifying the request or response kind
    pub typ: u8,
    /// Opaque correlation identifier chosen by the request originator
    pub tag: u16,
}

impl Header {
    /// Parse a header from the first `HEADER_SIZE` bytes of `buf`.
    ///
    /// The caller must have checked the buffer length first.
    pub fn decode(buf: &[u8]) -> Header {
        Header {
            size: read_uint(buf, 0, 4) as u32,
            typ: buf[4],
            tag: read_uint(buf, 5, 2) as u16,
        }
    }

    /// Serialize the header into its seven wire bytes.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        LittleEndian::write_u32(&mut buf[0..4], self.size);
        buf[4] = self.typ;
        LittleEndian::write_u16(&mut buf[5..7], self.tag);
        buf
    }
}

/// Build a complete wire message, size field included.
///
/// Useful for clients and tests; the server side lets the length
/// codec prepend the size field instead.
pub fn frame(typ: u8, tag: u16, body: &[u8]) -> Bytes {
    let header = Header {
        size: (HEADER_SIZE + body.len()) as u32,
        typ,
        tag,
    };
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + body.len());
    buf.put_slice(&header.encode());
    buf.put_slice(body);
    buf.freeze()
}
