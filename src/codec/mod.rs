//! Wire format of a single datagram ('frame'). All numbers are little endian.
//!
//! ```ascii
//! 0:  flags (8 bits):
//!     * bit 0: reliable SYN - starts a reliable handshake, carries a payload
//!     * bit 1: reliable SYN success - receiver accepted the SYN
//!     * bit 2: reliable SYN failure - receiver rejected the SYN (checksum / timestamp)
//!     * bit 3: reliable SYN-ACK success - sender's ACK of 'SYN success'
//!     * bit 4: reliable ACK - receiver's final ACK, closing the handshake
//!     * bit 5: ignore timestamp - no timestamp field is present
//!     * bit 6: double content count - field headers are 2 bytes instead of 1
//!     * bit 7: reserved, should be 0
//! 1:  message id (u32) - present iff one of the 'reliable' flags is set, never 0
//! *:  checksum (u32) - wrapping sum of all bytes after the checksum field. Not present for
//!      control frames (bits 1-4), which end after the message id.
//! *:  timestamp (u16) - per-peer counter, not present if 'ignore timestamp' is set
//! *:  repeated until the end of the frame:
//!       field header (u8: 3 bit type tag, 5 bit count) or (u16: 3 bit type tag, 13 bit count)
//!       payload
//! ```
//!
//! Type tags and payload sizes:
//! ```ascii
//! 0: bool bitset   ceil(count / 8) bytes, LSB first
//! 1: byte array    count bytes
//! 2: char array    count bytes of UTF-8
//! 3: short array   count * 2 bytes (i16)
//! 4: int array     count * 4 bytes (i32)
//! 5: float array   count * 4 bytes (f32)
//! ```
//!
//! NB: The decoder stops at the first field it can not make sense of (unknown tag, truncated
//!      payload, invalid UTF-8) and returns the fields it parsed so far. This is lenient on
//!      purpose: peers rely on trailing bytes being ignored.
//!
//! NB: Sending timestamp 65535 turns the frame into a SYN without timestamp, forcing the peer
//!      to reset its timestamp tracking before the counter wraps around.

pub mod field;
pub mod flags;
pub mod frame;

pub use field::{FieldKind, FieldMap, FieldValues};
pub use flags::{FrameFlags, FrameKind};
pub use frame::{decode, encode, encode_control, DecodeError, DecodedFrame, EncodeError, FrameHeader, FrameOptions};
