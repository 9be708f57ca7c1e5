use crate::value::{BigInt, JsString};
use crate::{Error, Result};
use bytes::{Buf, BufMut, BytesMut};

// Serialization tags. Each encoded value starts with one of these bytes; the values are shared
// with the engine's own reader and writer and must never change.

/// Latest wire format version this implementation reads and writes.
pub const LATEST_VERSION: u32 = 15;

/// version:uint32_t (if at beginning of data, sets version > 0)
pub const TAG_VERSION: u8 = 0xFF;
/// ignore
pub const TAG_PADDING: u8 = 0x00;
/// refTableSize:uint32_t (previously used for sanity checks; safe to ignore)
pub const TAG_VERIFY_OBJECT_COUNT: u8 = b'?';
// Oddballs (no data).
pub const TAG_THE_HOLE: u8 = b'-';
pub const TAG_UNDEFINED: u8 = b'_';
pub const TAG_NULL: u8 = b'0';
pub const TAG_TRUE: u8 = b'T';
pub const TAG_FALSE: u8 = b'F';
/// Number as 32-bit integer, zigzag-encoded
pub const TAG_INT32: u8 = b'I';
/// Number as 32-bit unsigned integer, varint-encoded
pub const TAG_UINT32: u8 = b'U';
/// Number as 64-bit double, host byte order
pub const TAG_DOUBLE: u8 = b'N';
/// BigInt. bitfield:uint32_t, then raw digits
pub const TAG_BIGINT: u8 = b'Z';
/// byteLength:uint32_t, then UTF-8 data
pub const TAG_UTF8_STRING: u8 = b'S';
/// byteLength:uint32_t, then Latin-1 data
pub const TAG_ONE_BYTE_STRING: u8 = b'"';
/// byteLength:uint32_t, then UTF-16 code units
pub const TAG_TWO_BYTE_STRING: u8 = b'c';
/// objectID:uint32_t
pub const TAG_OBJECT_REFERENCE: u8 = b'^';
pub const TAG_BEGIN_JS_OBJECT: u8 = b'o';
/// numProperties:uint32_t
pub const TAG_END_JS_OBJECT: u8 = b'{';
/// length:uint32_t, then key/value pairs
pub const TAG_BEGIN_SPARSE_JS_ARRAY: u8 = b'a';
/// numProperties:uint32_t, length:uint32_t
pub const TAG_END_SPARSE_JS_ARRAY: u8 = b'@';
/// length:uint32_t, then |length| elements, then key/value pairs
pub const TAG_BEGIN_DENSE_JS_ARRAY: u8 = b'A';
/// numProperties:uint32_t, length:uint32_t
pub const TAG_END_DENSE_JS_ARRAY: u8 = b'$';
/// millisSinceEpoch:double
pub const TAG_DATE: u8 = b'D';
pub const TAG_TRUE_OBJECT: u8 = b'y';
pub const TAG_FALSE_OBJECT: u8 = b'x';
/// value:double
pub const TAG_NUMBER_OBJECT: u8 = b'n';
/// bitfield:uint32_t, then raw digits
pub const TAG_BIGINT_OBJECT: u8 = b'z';
/// a string value follows
pub const TAG_STRING_OBJECT: u8 = b's';
/// pattern:string, flags:uint32_t
pub const TAG_REGEXP: u8 = b'R';
pub const TAG_BEGIN_JS_MAP: u8 = b';';
/// length:uint32_t (keys + values)
pub const TAG_END_JS_MAP: u8 = b':';
pub const TAG_BEGIN_JS_SET: u8 = b'\'';
/// length:uint32_t
pub const TAG_END_JS_SET: u8 = b',';
/// byteLength:uint32_t, then raw data
pub const TAG_ARRAY_BUFFER: u8 = b'B';
/// byteLength:uint32_t, maxByteLength:uint32_t, then raw data
pub const TAG_RESIZABLE_ARRAY_BUFFER: u8 = b'~';
/// transferID:uint32_t
pub const TAG_ARRAY_BUFFER_TRANSFER: u8 = b't';
/// subtag, byteOffset:uint32_t, byteLength:uint32_t, flags:uint32_t (version >= 14)
pub const TAG_ARRAY_BUFFER_VIEW: u8 = b'V';
/// transferID:uint32_t
pub const TAG_SHARED_ARRAY_BUFFER: u8 = b'u';
/// sharedValueID:uint32_t
pub const TAG_SHARED_OBJECT: u8 = b'p';
pub const TAG_WASM_MODULE_TRANSFER: u8 = b'w';
/// The delegate is responsible for all following data
pub const TAG_HOST_OBJECT: u8 = b'\\';
pub const TAG_WASM_MEMORY_TRANSFER: u8 = b'm';
/// A list of (ErrorTag, data) pairs
pub const TAG_ERROR: u8 = b'r';

// Reserved because Chromium used them before TAG_HOST_OBJECT existed (format version 13).
// Never written; readers of old data hand them to the delegate.
pub const TAG_LEGACY_RESERVED_MESSAGE_PORT: u8 = b'M';
pub const TAG_LEGACY_RESERVED_BLOB: u8 = b'b';
pub const TAG_LEGACY_RESERVED_BLOB_INDEX: u8 = b'i';
pub const TAG_LEGACY_RESERVED_FILE: u8 = b'f';
pub const TAG_LEGACY_RESERVED_FILE_INDEX: u8 = b'e';
pub const TAG_LEGACY_RESERVED_DOM_FILE_SYSTEM: u8 = b'd';
pub const TAG_LEGACY_RESERVED_FILE_LIST: u8 = b'l';
pub const TAG_LEGACY_RESERVED_FILE_LIST_INDEX: u8 = b'L';
pub const TAG_LEGACY_RESERVED_IMAGE_DATA: u8 = b'#';
pub const TAG_LEGACY_RESERVED_IMAGE_BITMAP: u8 = b'g';
pub const TAG_LEGACY_RESERVED_IMAGE_BITMAP_TRANSFER: u8 = b'G';
pub const TAG_LEGACY_RESERVED_OFFSCREEN_CANVAS: u8 = b'H';
pub const TAG_LEGACY_RESERVED_CRYPTO_KEY: u8 = b'K';
pub const TAG_LEGACY_RESERVED_RTC_CERTIFICATE: u8 = b'k';

// Array buffer view subtags.
pub const VIEW_INT8_ARRAY: u8 = b'b';
pub const VIEW_UINT8_ARRAY: u8 = b'B';
pub const VIEW_UINT8_CLAMPED_ARRAY: u8 = b'C';
pub const VIEW_INT16_ARRAY: u8 = b'w';
pub const VIEW_UINT16_ARRAY: u8 = b'W';
pub const VIEW_INT32_ARRAY: u8 = b'd';
pub const VIEW_UINT32_ARRAY: u8 = b'D';
pub const VIEW_FLOAT16_ARRAY: u8 = b'h';
pub const VIEW_FLOAT32_ARRAY: u8 = b'f';
pub const VIEW_FLOAT64_ARRAY: u8 = b'F';
pub const VIEW_BIGINT64_ARRAY: u8 = b'q';
pub const VIEW_BIGUINT64_ARRAY: u8 = b'Q';
pub const VIEW_DATA_VIEW: u8 = b'?';

/// The view tracks the length of a resizable buffer
pub const VIEW_FLAG_LENGTH_TRACKING: u32 = 1 << 0;
/// The view is backed by a resizable buffer
pub const VIEW_FLAG_BACKED_BY_RAB: u32 = 1 << 1;

// Error subtags. Prototype tags carry no data.
pub const ERROR_EVAL_ERROR_PROTOTYPE: u8 = b'E';
pub const ERROR_RANGE_ERROR_PROTOTYPE: u8 = b'R';
pub const ERROR_REFERENCE_ERROR_PROTOTYPE: u8 = b'F';
pub const ERROR_SYNTAX_ERROR_PROTOTYPE: u8 = b'S';
pub const ERROR_TYPE_ERROR_PROTOTYPE: u8 = b'T';
pub const ERROR_URI_ERROR_PROTOTYPE: u8 = b'U';
/// Followed by message: string
pub const ERROR_MESSAGE: u8 = b'm';
/// Followed by cause: any value
pub const ERROR_CAUSE: u8 = b'c';
/// Followed by stack: string
pub const ERROR_STACK: u8 = b's';
/// End of the error fields
pub const ERROR_END: u8 = b'.';

// RegExp flag bits.
pub const REGEXP_GLOBAL: u32 = 1 << 0;
pub const REGEXP_IGNORE_CASE: u32 = 1 << 1;
pub const REGEXP_MULTILINE: u32 = 1 << 2;
pub const REGEXP_STICKY: u32 = 1 << 3;
pub const REGEXP_UNICODE: u32 = 1 << 4;
pub const REGEXP_DOT_ALL: u32 = 1 << 5;

/// Smallest integer the engine stores as a small integer (31-bit Smi).
pub const SMI_MIN: i32 = -(1 << 30);
/// Largest integer the engine stores as a small integer (31-bit Smi).
pub const SMI_MAX: i32 = (1 << 30) - 1;

/// Largest `ArrayBuffer` byte length that can be cloned (`Number.MAX_SAFE_INTEGER`).
pub const MAX_SAFE_INTEGER: u64 = (1 << 53) - 1;

/// Upper bound on the length announced by a dense array begin tag.
pub const MAX_DENSE_ARRAY_LENGTH: u64 = (1 << 30) - 1;

/// Deepest nesting of values the reader and writer accept before failing.
pub const MAX_DEPTH: usize = 128;

/// Bytes that must be buffered before the framing adapter tries to decode an envelope.
///
/// A header is two bytes, the envelope string tag and its length at least two more, and the body
/// at least one.
pub const MIN_FRAME_SIZE: usize = 5;

/// First chunk size (in code units) of the one-byte string attempt.
pub(crate) const ONE_BYTE_CHUNK_START: usize = 128;

/// Returns true if `value` fits the engine's small-integer range.
#[inline]
pub fn is_smi(value: i32) -> bool {
    (SMI_MIN..=SMI_MAX).contains(&value)
}

/// Returns the small integer `value` is exactly equal to, if any.
///
/// `-0` is not a small integer.
#[inline]
pub fn double_as_smi(value: f64) -> Option<i32> {
    if value.fract() != 0.0 || value < SMI_MIN as f64 || value > SMI_MAX as f64 {
        return None;
    }
    if value == 0.0 && value.is_sign_negative() {
        return None;
    }
    Some(value as i32)
}

// --- varint ---
/// Writes an unsigned integer as a base-128 varint.
///
/// Seven bits at a time, least significant group first; every byte but the last has the
/// continuation bit (0x80) set.
#[inline]
pub fn write_varint(writer: &mut BytesMut, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            writer.put_u8(byte);
            return;
        }
        writer.put_u8(byte | 0x80);
    }
}

/// Number of bytes `write_varint` produces for `value`.
#[inline]
pub fn varint_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

/// Reads a base-128 varint.
///
/// Bits beyond the 64th are discarded, like the engine's reader does for its target width.
///
/// # Errors
/// Returns `InsufficientData` if the input ends before the last byte.
#[inline]
pub fn read_varint<B: Buf>(reader: &mut B) -> Result<u64> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    loop {
        if !reader.has_remaining() {
            return Err(Error::InsufficientData);
        }
        let byte = reader.get_u8();
        if shift < u64::BITS {
            value |= ((byte & 0x7F) as u64) << shift;
            shift += 7;
        }
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
}

/// Reads a varint and truncates it to 32 bits.
#[inline]
pub fn read_varint32<B: Buf>(reader: &mut B) -> Result<u32> {
    Ok(read_varint(reader)? as u32)
}

// --- zigzag ---
#[inline]
pub fn zigzag_encode(value: i32) -> u32 {
    ((value << 1) ^ (value >> 31)) as u32
}

#[inline]
pub fn zigzag_decode(value: u32) -> i32 {
    ((value >> 1) as i32) ^ -((value & 1) as i32)
}

pub fn write_zigzag(writer: &mut BytesMut, value: i32) {
    write_varint(writer, zigzag_encode(value) as u64);
}

pub fn read_zigzag<B: Buf>(reader: &mut B) -> Result<i32> {
    Ok(zigzag_decode(read_varint32(reader)?))
}

// --- double ---
/// Writes an IEEE-754 double in host byte order.
#[inline]
pub fn write_double(writer: &mut BytesMut, value: f64) {
    writer.put_f64_ne(value);
}

/// Reads an IEEE-754 double in host byte order.
#[inline]
pub fn read_double<B: Buf>(reader: &mut B) -> Result<f64> {
    if reader.remaining() < 8 {
        return Err(Error::InsufficientData);
    }
    Ok(reader.get_f64_ne())
}

// --- BigInt ---
/// Serialized digit length of `value`: magnitude bytes rounded up to whole 64-bit digits.
pub fn bigint_byte_length(value: &BigInt) -> usize {
    (value.magnitude().len() + 7) & !7
}

/// Bitfield written before the digits: `byteLength << 1 | signBit`.
pub fn bigint_bitfield(value: &BigInt) -> u64 {
    ((bigint_byte_length(value) as u64) << 1) | value.is_negative() as u64
}

/// Writes the bitfield and little-endian digits of a BigInt (without tag).
pub fn write_bigint_contents(writer: &mut BytesMut, value: &BigInt) {
    let byte_length = bigint_byte_length(value);
    write_varint(writer, bigint_bitfield(value));
    let magnitude = value.magnitude();
    writer.put_slice(magnitude);
    writer.put_bytes(0, byte_length - magnitude.len());
}

/// Reads the bitfield and digits of a BigInt (without tag).
pub fn read_bigint_contents<B: Buf>(reader: &mut B) -> Result<BigInt> {
    let bitfield = read_varint32(reader)?;
    let byte_length = (bitfield >> 1) as usize;
    if reader.remaining() < byte_length {
        return Err(Error::InsufficientData);
    }
    let mut digits = vec![0u8; byte_length];
    reader.copy_to_slice(&mut digits);
    Ok(BigInt::from_le_bytes(bitfield & 1 == 1, &digits))
}

// --- strings ---
/// Writes UTF-16 code units in host byte order.
pub fn write_two_byte_units(writer: &mut BytesMut, units: &[u16]) {
    for unit in units {
        writer.put_u16_ne(*unit);
    }
}

/// Reads `byte_length / 2` UTF-16 code units in host byte order.
pub fn read_two_byte_units<B: Buf>(reader: &mut B, byte_length: usize) -> Result<Vec<u16>> {
    if byte_length % 2 != 0 {
        return Err(Error::Decode(format!(
            "Two-byte string has odd byte length {}",
            byte_length
        )));
    }
    if reader.remaining() < byte_length {
        return Err(Error::InsufficientData);
    }
    let mut units = Vec::with_capacity(byte_length / 2);
    for _ in 0..byte_length / 2 {
        units.push(reader.get_u16_ne());
    }
    Ok(units)
}

/// Reads a length-prefixed UTF-8 string (without tag). Invalid sequences are replaced.
pub fn read_utf8_contents<B: Buf>(reader: &mut B) -> Result<JsString> {
    let byte_length = read_varint(reader)? as usize;
    if reader.remaining() < byte_length {
        return Err(Error::InsufficientData);
    }
    let mut bytes = vec![0u8; byte_length];
    reader.copy_to_slice(&mut bytes);
    Ok(JsString::from(&*String::from_utf8_lossy(&bytes)))
}

/// Reads a length-prefixed Latin-1 string (without tag).
pub fn read_one_byte_contents<B: Buf>(reader: &mut B) -> Result<JsString> {
    let byte_length = read_varint(reader)? as usize;
    if reader.remaining() < byte_length {
        return Err(Error::InsufficientData);
    }
    let mut bytes = vec![0u8; byte_length];
    reader.copy_to_slice(&mut bytes);
    Ok(JsString::from_latin1(&bytes))
}
