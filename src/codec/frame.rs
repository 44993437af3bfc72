use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tracing::trace;

use crate::codec::field::{FieldKind, FieldMap, FieldValues};
use crate::codec::flags::{FrameFlags, FrameKind};
use crate::util::safe_converter::{PrecheckedCast, SafeCast};

/// every frame has at least a flags byte and either a message id or a checksum
pub const MIN_FRAME_LEN: usize = 5;

pub const MAX_SHORT_FIELD_COUNT: usize = 0x1f;
pub const MAX_DOUBLE_FIELD_COUNT: usize = 0x1fff;

/// Encoding this timestamp forces a SYN frame without timestamp, so the peer resets its
///  timestamp tracking before the 16-bit counter wraps around
pub const WRAPAROUND_TIMESTAMP: u16 = u16::MAX;

const SHORT_HEADER_TAG_SHIFT: u32 = 5;
const DOUBLE_HEADER_TAG_SHIFT: u32 = 13;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame is too short")]
    TooShort,
    #[error("reliable frame with message id 0")]
    ZeroMessageId,
    #[error("conflicting reliable flags {0:?}")]
    ConflictingFlags(FrameFlags),
    #[error("checksum mismatch: frame says {expected:08x}, content sums to {actual:08x}")]
    ChecksumMismatch {
        header: FrameHeader,
        expected: u32,
        actual: u32,
    },
    #[error("malformed field header {0:04x}")]
    MalformedFieldHeader(u16),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("{kind} field with {count} elements exceeds the maximum of {max}")]
    CountOverflow {
        kind: FieldKind,
        count: usize,
        max: usize,
    },
    #[error("a reliable frame requires a message id")]
    MissingMessageId,
    #[error("message id 0 is reserved")]
    ZeroMessageId,
}

/// The part of a frame that precedes the checksum, i.e. everything that is readable even
///  if the checksum turns out to be wrong
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub flags: FrameFlags,
    pub message_id: Option<u32>,
}

impl FrameHeader {
    pub fn kind(&self) -> Result<FrameKind, DecodeError> {
        FrameKind::from_flags(self.flags)
            .ok_or(DecodeError::ConflictingFlags(self.flags & FrameFlags::RELIABLE))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    pub header: FrameHeader,
    pub kind: FrameKind,
    pub timestamp: Option<u16>,
    pub fields: FieldMap,
}

/// Encoding options for data frames, i.e. plain or SYN frames
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameOptions {
    /// `Some` turns the frame into a reliable SYN frame
    pub message_id: Option<u32>,
    /// `None` encodes the frame with `IGNORE_TIMESTAMP`
    pub timestamp: Option<u16>,
    pub double_content_count: bool,
}

pub fn checksum(buf: &[u8]) -> u32 {
    buf.iter()
        .fold(0u32, |acc, &b| acc.wrapping_add(b.into()))
}

pub fn decode(mut buf: &[u8]) -> Result<DecodedFrame, DecodeError> {
    if buf.len() < MIN_FRAME_LEN {
        return Err(DecodeError::TooShort);
    }

    let flags = FrameFlags::from_bits_truncate(buf.get_u8());
    let message_id = if flags.is_reliable() {
        match buf.try_get_u32_le().map_err(|_| DecodeError::TooShort)? {
            0 => return Err(DecodeError::ZeroMessageId),
            id => Some(id),
        }
    }
    else {
        None
    };

    let header = FrameHeader { flags, message_id };
    let kind = header.kind()?;

    if kind.is_control() {
        if buf.has_remaining() {
            trace!("ignoring {} trailing bytes after control frame", buf.remaining());
        }
        return Ok(DecodedFrame {
            header,
            kind,
            timestamp: None,
            fields: FieldMap::default(),
        });
    }

    let expected = buf.try_get_u32_le().map_err(|_| DecodeError::TooShort)?;
    let actual = checksum(buf);
    if expected != actual {
        return Err(DecodeError::ChecksumMismatch { header, expected, actual });
    }

    let timestamp = if flags.contains(FrameFlags::IGNORE_TIMESTAMP) {
        None
    }
    else {
        Some(buf.try_get_u16_le().map_err(|_| DecodeError::TooShort)?)
    };

    let double_content_count = flags.contains(FrameFlags::DOUBLE_CONTENT_COUNT);
    let mut fields = FieldMap::default();
    while buf.has_remaining() {
        match try_get_field(&mut buf, double_content_count) {
            Ok(Some(values)) => fields.merge(values),
            Ok(None) => {
                trace!("truncated field - ignoring {} trailing bytes", buf.remaining());
                break;
            }
            Err(e) => {
                trace!("{} - ignoring {} trailing bytes", e, buf.remaining());
                break;
            }
        }
    }

    Ok(DecodedFrame {
        header,
        kind,
        timestamp,
        fields,
    })
}

/// Reads a single field. Returns `Ok(None)` if the buffer ends before the field does - the
///  buffer is left in an unspecified position in that case.
pub fn try_get_field(buf: &mut &[u8], double_content_count: bool) -> Result<Option<FieldValues>, DecodeError> {
    let (raw_header, tag_shift) = if double_content_count {
        match buf.try_get_u16_le() {
            Ok(h) => (h, DOUBLE_HEADER_TAG_SHIFT),
            Err(_) => return Ok(None),
        }
    }
    else {
        match buf.try_get_u8() {
            Ok(h) => (u16::from(h), SHORT_HEADER_TAG_SHIFT),
            Err(_) => return Ok(None),
        }
    };

    let tag = (raw_header >> tag_shift) as u8;
    let count: usize = (raw_header & ((1u16 << tag_shift) - 1)).safe_cast();
    let kind = FieldKind::try_from(tag)
        .map_err(|_| DecodeError::MalformedFieldHeader(raw_header))?;

    if buf.remaining() < kind.payload_len(count) {
        return Ok(None);
    }

    let values = match kind {
        FieldKind::Boolean => {
            let packed_len = kind.payload_len(count);
            let v = (0..count)
                .map(|i| buf[i / 8] & (1u8 << (i % 8)) != 0)
                .collect();
            buf.advance(packed_len);
            FieldValues::Booleans(v)
        }
        FieldKind::Byte => {
            let v = buf[..count].to_vec();
            buf.advance(count);
            FieldValues::Bytes(v)
        }
        FieldKind::Char => {
            let s = std::str::from_utf8(&buf[..count])
                .map_err(|_| DecodeError::MalformedFieldHeader(raw_header))?
                .to_string();
            buf.advance(count);
            FieldValues::Chars(s)
        }
        FieldKind::Short => FieldValues::Shorts((0..count).map(|_| buf.get_i16_le()).collect()),
        FieldKind::Integer => FieldValues::Integers((0..count).map(|_| buf.get_i32_le()).collect()),
        FieldKind::Float => FieldValues::Floats((0..count).map(|_| buf.get_f32_le()).collect()),
    };
    Ok(Some(values))
}

/// Encodes a plain or SYN frame. The checksum covers everything after it, i.e. the
///  timestamp and all fields.
pub fn encode<'a>(fields: impl IntoIterator<Item = &'a FieldValues>, options: &FrameOptions) -> Result<BytesMut, EncodeError> {
    let mut flags = FrameFlags::empty();
    let mut timestamp = options.timestamp;
    let message_id = options.message_id;

    if timestamp == Some(WRAPAROUND_TIMESTAMP) {
        if message_id.is_none() {
            return Err(EncodeError::MissingMessageId);
        }
        timestamp = None;
    }
    if let Some(id) = message_id {
        if id == 0 {
            return Err(EncodeError::ZeroMessageId);
        }
        flags |= FrameFlags::RELIABLE_SYN;
    }
    if timestamp.is_none() {
        flags |= FrameFlags::IGNORE_TIMESTAMP;
    }
    if options.double_content_count {
        flags |= FrameFlags::DOUBLE_CONTENT_COUNT;
    }

    let mut buf = BytesMut::new();
    buf.put_u8(flags.bits());
    if let Some(id) = message_id {
        buf.put_u32_le(id);
    }

    let checksum_offset = buf.len();
    buf.put_u32_le(0);

    if let Some(ts) = timestamp {
        buf.put_u16_le(ts);
    }

    for values in fields {
        put_field(&mut buf, values, options.double_content_count)?;
    }

    let sum = checksum(&buf[checksum_offset + 4..]);
    buf[checksum_offset..checksum_offset + 4].copy_from_slice(&sum.to_le_bytes());
    Ok(buf)
}

pub fn put_field(buf: &mut BytesMut, values: &FieldValues, double_content_count: bool) -> Result<(), EncodeError> {
    let kind = values.kind();
    let count = values.count();
    let max = if double_content_count { MAX_DOUBLE_FIELD_COUNT } else { MAX_SHORT_FIELD_COUNT };
    if count > max {
        return Err(EncodeError::CountOverflow { kind, count, max });
    }

    let tag: u8 = kind.into();
    if double_content_count {
        let count: u16 = count.prechecked_cast();
        buf.put_u16_le((u16::from(tag) << DOUBLE_HEADER_TAG_SHIFT) | count);
    }
    else {
        let count: u8 = count.prechecked_cast();
        buf.put_u8((tag << SHORT_HEADER_TAG_SHIFT) | count);
    }

    match values {
        FieldValues::Booleans(v) => {
            for chunk in v.chunks(8) {
                let packed = chunk.iter()
                    .enumerate()
                    .fold(0u8, |acc, (i, &b)| if b { acc | (1u8 << i) } else { acc });
                buf.put_u8(packed);
            }
        }
        FieldValues::Bytes(v) => buf.put_slice(v),
        FieldValues::Chars(s) => buf.put_slice(s.as_bytes()),
        FieldValues::Shorts(v) => v.iter().for_each(|&x| buf.put_i16_le(x)),
        FieldValues::Integers(v) => v.iter().for_each(|&x| buf.put_i32_le(x)),
        FieldValues::Floats(v) => v.iter().for_each(|&x| buf.put_f32_le(x)),
    }
    Ok(())
}

/// Encodes a handshake acknowledgement: flags and message id only
pub fn encode_control(kind: FrameKind, message_id: u32) -> BytesMut {
    debug_assert!(kind.is_control());
    debug_assert_ne!(message_id, 0);

    let mut buf = BytesMut::with_capacity(MIN_FRAME_LEN);
    buf.put_u8(kind.flag().bits());
    buf.put_u32_le(message_id);
    buf
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    fn sample_fields() -> FieldMap {
        FieldMap::new()
            .with(FieldValues::Booleans(vec![true, false, true, true, false, false, false, false, true]))
            .with(FieldValues::Bytes(vec![0, 1, 255]))
            .with(FieldValues::Chars("héllo".to_string()))
            .with(FieldValues::Shorts(vec![-1, 0, 300]))
            .with(FieldValues::Integers(vec![i32::MIN, 5, i32::MAX]))
            .with(FieldValues::Floats(vec![0.5, -1.25]))
    }

    #[rstest]
    #[case::plain(vec![], FrameOptions { message_id: None, timestamp: None, double_content_count: false }, vec![0x20, 0,0,0,0])]
    #[case::plain_timestamp(vec![], FrameOptions { message_id: None, timestamp: Some(0x0102), double_content_count: false }, vec![0x00, 3,0,0,0, 2,1])]
    #[case::bytes(vec![FieldValues::Bytes(vec![7, 8])], FrameOptions { message_id: None, timestamp: Some(1), double_content_count: false }, vec![0x00, 50,0,0,0, 1,0, 0x22, 7,8])]
    #[case::bytes_double(vec![FieldValues::Bytes(vec![7, 8])], FrameOptions { message_id: None, timestamp: Some(1), double_content_count: true }, vec![0x40, 50,0,0,0, 1,0, 2,0x20, 7,8])]
    #[case::syn(vec![FieldValues::Chars("ab".to_string())], FrameOptions { message_id: Some(0x01020304), timestamp: Some(2), double_content_count: false }, vec![0x01, 4,3,2,1, 0x07,0x01,0,0, 2,0, 0x42, b'a',b'b'])]
    #[case::bools(vec![FieldValues::Booleans(vec![true, false, true])], FrameOptions { message_id: None, timestamp: None, double_content_count: false }, vec![0x20, 8,0,0,0, 0x03, 0x05])]
    #[case::shorts(vec![FieldValues::Shorts(vec![-2])], FrameOptions { message_id: None, timestamp: None, double_content_count: false }, vec![0x20, 0x5e,0x02,0,0, 0x61, 0xfe,0xff])]
    #[case::wraparound(vec![], FrameOptions { message_id: Some(9), timestamp: Some(65535), double_content_count: false }, vec![0x21, 9,0,0,0, 0,0,0,0])]
    fn test_encode(#[case] fields: Vec<FieldValues>, #[case] options: FrameOptions, #[case] expected: Vec<u8>) {
        let actual = encode(fields.iter(), &options).unwrap();
        assert_eq!(actual.as_ref(), expected.as_slice());
    }

    #[rstest]
    #[case::wraparound_without_id(FrameOptions { message_id: None, timestamp: Some(65535), double_content_count: false }, EncodeError::MissingMessageId)]
    #[case::zero_id(FrameOptions { message_id: Some(0), timestamp: Some(1), double_content_count: false }, EncodeError::ZeroMessageId)]
    fn test_encode_invalid_options(#[case] options: FrameOptions, #[case] expected: EncodeError) {
        assert_eq!(encode(sample_fields().values(), &options), Err(expected));
    }

    #[rstest]
    #[case::plain(FrameOptions { message_id: None, timestamp: Some(17), double_content_count: false })]
    #[case::no_timestamp(FrameOptions { message_id: None, timestamp: None, double_content_count: false })]
    #[case::syn(FrameOptions { message_id: Some(12345), timestamp: Some(3), double_content_count: false })]
    #[case::double(FrameOptions { message_id: None, timestamp: Some(0), double_content_count: true })]
    #[case::wraparound(FrameOptions { message_id: Some(1), timestamp: Some(65535), double_content_count: true })]
    fn test_round_trip(#[case] options: FrameOptions) {
        let fields = sample_fields();
        let buf = encode(fields.values(), &options).unwrap();

        let decoded = decode(&buf).unwrap();
        assert_eq!(decoded.fields, fields);
        assert_eq!(decoded.header.message_id, options.message_id);
        if options.timestamp == Some(WRAPAROUND_TIMESTAMP) {
            assert_eq!(decoded.kind, FrameKind::Syn);
            assert_eq!(decoded.timestamp, None);
        }
        else {
            assert_eq!(decoded.timestamp, options.timestamp);
        }
    }

    #[test]
    fn test_decode_concatenates_fields_of_same_kind() {
        let fields = vec![
            FieldValues::Integers(vec![1, 2]),
            FieldValues::Chars("ab".to_string()),
            FieldValues::Integers(vec![3]),
            FieldValues::Chars("c".to_string()),
        ];
        let buf = encode(fields.iter(), &FrameOptions::default()).unwrap();

        let decoded = decode(&buf).unwrap();
        assert_eq!(decoded.fields.integers(), Some([1, 2, 3].as_slice()));
        assert_eq!(decoded.fields.chars(), Some("abc"));
        assert_eq!(decoded.fields.len(), 2);
    }

    #[test]
    fn test_checksum_detects_every_single_byte_flip() {
        let options = FrameOptions { message_id: Some(77), timestamp: Some(1000), double_content_count: false };
        let buf = encode(sample_fields().values(), &options).unwrap();
        let checksum_end = 1 + 4 + 4;

        for i in checksum_end..buf.len() {
            for flip in [0x01u8, 0x80, 0xff] {
                let mut corrupted = buf.to_vec();
                corrupted[i] ^= flip;
                match decode(&corrupted) {
                    Err(DecodeError::ChecksumMismatch { header, .. }) => {
                        assert_eq!(header.message_id, Some(77));
                        assert_eq!(header.kind(), Ok(FrameKind::Syn));
                    }
                    other => panic!("flipping byte {} did not fail the checksum: {:?}", i, other),
                }
            }
        }
    }

    #[rstest]
    #[case::empty(vec![])]
    #[case::four_bytes(vec![0, 0, 0, 0])]
    #[case::truncated_timestamp(vec![0x00, 0,0,0,0])]
    #[case::truncated_message_id(vec![0x01, 1,0,0])]
    fn test_decode_too_short(#[case] buf: Vec<u8>) {
        assert_eq!(decode(&buf), Err(DecodeError::TooShort));
    }

    #[rstest]
    #[case::syn(vec![0x01, 0,0,0,0, 0,0,0,0])]
    #[case::control(vec![0x10, 0,0,0,0])]
    fn test_decode_zero_message_id(#[case] buf: Vec<u8>) {
        assert_eq!(decode(&buf), Err(DecodeError::ZeroMessageId));
    }

    #[test]
    fn test_decode_conflicting_flags() {
        let buf = vec![0x03, 1,0,0,0, 0,0,0,0];
        assert_eq!(decode(&buf), Err(DecodeError::ConflictingFlags(FrameFlags::RELIABLE_SYN | FrameFlags::RELIABLE_SYN_SUCCESS)));
    }

    #[rstest]
    #[case::syn_success(FrameKind::SynSuccess, 5, vec![0x02, 5,0,0,0])]
    #[case::syn_failure(FrameKind::SynFailure, 0x100, vec![0x04, 0,1,0,0])]
    #[case::syn_ack_success(FrameKind::SynAckSuccess, 7, vec![0x08, 7,0,0,0])]
    #[case::ack(FrameKind::Ack, 0xffffffff, vec![0x10, 255,255,255,255])]
    fn test_control_frames(#[case] kind: FrameKind, #[case] message_id: u32, #[case] expected: Vec<u8>) {
        let buf = encode_control(kind, message_id);
        assert_eq!(buf.as_ref(), expected.as_slice());

        let decoded = decode(&buf).unwrap();
        assert_eq!(decoded.kind, kind);
        assert_eq!(decoded.header.message_id, Some(message_id));
        assert_eq!(decoded.timestamp, None);
        assert!(decoded.fields.is_empty());
    }

    #[test]
    fn test_control_frame_ignores_trailing_bytes() {
        let decoded = decode(&[0x08, 7,0,0,0, 1,2,3]).unwrap();
        assert_eq!(decoded.kind, FrameKind::SynAckSuccess);
        assert!(decoded.fields.is_empty());
    }

    fn with_checksum(mut raw: Vec<u8>) -> Vec<u8> {
        // layout: flags, checksum, content
        let sum = checksum(&raw[5..]);
        raw[1..5].copy_from_slice(&sum.to_le_bytes());
        raw
    }

    #[rstest]
    #[case::truncated_payload(vec![0x20, 0,0,0,0, 0x22, 1,2, 0x23, 1], vec![FieldValues::Bytes(vec![1, 2])])]
    #[case::truncated_double_header(vec![0x60, 0,0,0,0, 1,0x20, 9, 0x02], vec![FieldValues::Bytes(vec![9])])]
    #[case::unknown_tag(vec![0x20, 0,0,0,0, 0x21, 5, 0xc1, 1,2,3], vec![FieldValues::Bytes(vec![5])])]
    #[case::invalid_utf8(vec![0x20, 0,0,0,0, 0x41, b'x', 0x42, 0xff, 0xfe], vec![FieldValues::Chars("x".to_string())])]
    #[case::nothing_valid(vec![0x20, 0,0,0,0, 0xe0], vec![])]
    fn test_decode_stops_at_malformed_trailing_bytes(#[case] raw: Vec<u8>, #[case] expected: Vec<FieldValues>) {
        let buf = with_checksum(raw);
        let decoded = decode(&buf).unwrap();
        assert_eq!(decoded.fields, expected.into_iter().collect::<FieldMap>());
    }

    #[test]
    fn test_try_get_field_malformed_header() {
        let mut buf: &[u8] = &[0xc1, 0];
        assert_eq!(try_get_field(&mut buf, false), Err(DecodeError::MalformedFieldHeader(0xc1)));
    }

    #[rstest]
    #[case::short_max(31, false, true)]
    #[case::short_overflow(32, false, false)]
    #[case::double_32(32, true, true)]
    #[case::double_max(8191, true, true)]
    #[case::double_overflow(8192, true, false)]
    #[case::short_far_overflow(8192, false, false)]
    fn test_field_capacity(#[case] count: usize, #[case] double_content_count: bool, #[case] expected_ok: bool) {
        let fields = vec![FieldValues::Bytes(vec![3; count])];
        let options = FrameOptions { message_id: None, timestamp: Some(1), double_content_count };

        match encode(fields.iter(), &options) {
            Ok(buf) => {
                assert!(expected_ok);
                let decoded = decode(&buf).unwrap();
                assert_eq!(decoded.fields.bytes().map(|b| b.len()), Some(count));
            }
            Err(e) => {
                assert!(!expected_ok);
                assert_eq!(e, EncodeError::CountOverflow {
                    kind: FieldKind::Byte,
                    count,
                    max: if double_content_count { MAX_DOUBLE_FIELD_COUNT } else { MAX_SHORT_FIELD_COUNT },
                });
            }
        }
    }
}
