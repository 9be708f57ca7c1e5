//! # structured-clone
//!
//! A wire-compatible implementation of the V8 `ValueSerializer` format, the binary encoding
//! JavaScript engines use for structured cloning (`postMessage`, `v8.serialize`, IndexedDB, ...).
//!
//! - Byte-for-byte compatible varint, zigzag, double and BigInt encodings
//! - Object graphs with shared and cyclic references, held in an arena ([`Heap`])
//! - Dense and sparse arrays, maps, sets, dates, regexps, errors, primitive wrappers
//! - `ArrayBuffer`s (plain, resizable, shared, transferred) and typed views over them
//! - Pluggable host-object handling through [`SerializerDelegate`] / [`DeserializerDelegate`]
//! - A framing adapter ([`SerializerStream`] / [`DeserializerStream`]) that recovers message
//!   boundaries from arbitrarily fragmented byte chunks
//!
//! ## Example
//!
//! ```rust
//! use structured_clone::{deserialize, serialize, Heap, Value};
//!
//! let mut heap = Heap::new();
//! let obj = heap.new_object([("prop", Value::from("x"))]);
//! heap.set_property(obj, "obj", Value::Object(obj)).unwrap();
//!
//! let bytes = serialize(&heap, &Value::Object(obj)).unwrap();
//!
//! let mut decoded = Heap::new();
//! let value = deserialize(bytes, &mut decoded).unwrap();
//! assert!(heap.graph_eq(&Value::Object(obj), &decoded, &value));
//! ```
//!
//! ## Feature Flags
//!
//! - `serde_json` — Lossy conversion between value graphs and `serde_json::Value`.
//! - `chrono` — Conversion between `Date` objects and `chrono::DateTime<Utc>`.
//! - `codec` — `tokio_util::codec::{Encoder, Decoder}` for the framing envelope.

pub mod core;
pub mod de;
mod features;
pub mod ser;
pub mod serdes;
pub mod stream;
pub mod value;

use bytes::Bytes;

pub use crate::core::{LATEST_VERSION, MAX_DEPTH, MIN_FRAME_SIZE};
pub use crate::de::{DeserializerDelegate, ValueDeserializer};
pub use crate::ser::{SerializerDelegate, ValueSerializer};
pub use crate::serdes::{
    Deserializer, DeserializerOptions, HostViewDelegate, Serializer, SerializerOptions,
};
pub use crate::stream::{DeserializerStream, SerializerStream};
pub use crate::value::{
    ArrayBuffer, ArrayBufferView, BigInt, ErrorKind, Heap, HeapObject, HostObject, JsArray,
    JsError, JsObject, JsString, ObjectRef, PrimitiveWrapper, RegExp, SharedArrayBuffer,
    Unclonable, Value, ViewKind,
};

#[cfg(feature = "codec")]
pub use crate::features::{Frame, ValueCodec};

/// Errors that can occur while serializing or deserializing.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The value graph contains something that cannot be cloned.
    #[error("DataCloneError: {0}")]
    DataClone(String),
    /// The input is not a valid serialization.
    #[error("Decode error: {0}")]
    Decode(String),
    /// The buffer did not contain enough data to complete the operation.
    #[error("Insufficient data in buffer")]
    InsufficientData,
    /// The header announces a newer format than this implementation understands.
    #[error("Unsupported wire format version {version} (latest supported is {latest})")]
    Version { version: u32, latest: u32 },
    /// An operation was applied to a value of the wrong shape.
    #[error("TypeError: {0}")]
    Type(String),
    /// A delegate broke its contract or is missing.
    #[error("Delegate error: {0}")]
    Delegate(String),
    /// Container-specific decode error
    #[error(transparent)]
    Container(#[from] ContainerDecodeError),
    /// Typed view specific decode error
    #[error(transparent)]
    View(#[from] ViewDecodeError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// The result type used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Decode errors raised while reading objects, arrays, maps and sets.
#[derive(Debug, thiserror::Error)]
pub enum ContainerDecodeError {
    #[error("Property count mismatch for {container}: end tag says {expected}, read {actual}")]
    PropertyCountMismatch {
        container: &'static str,
        expected: u64,
        actual: u64,
    },
    #[error("Length mismatch for {container}: begin tag says {expected}, end tag says {actual}")]
    LengthMismatch {
        container: &'static str,
        expected: u64,
        actual: u64,
    },
    #[error("Duplicate property key {key:?} in {container}")]
    DuplicateKey {
        container: &'static str,
        key: String,
    },
    #[error("Invalid property key in {container}: expected string or number")]
    InvalidKey { container: &'static str },
    #[error("Dense array length {length} exceeds the remaining input or the maximum array size")]
    ArrayTooLarge { length: u64 },
}

/// Decode errors raised while reconstructing typed views.
#[derive(Debug, thiserror::Error)]
pub enum ViewDecodeError {
    #[error("Unknown array buffer view subtag: {0}")]
    UnknownSubtag(u32),
    #[error("View range {byte_offset}+{byte_length} is out of bounds for a buffer of {buffer_length} bytes")]
    OutOfRange {
        byte_offset: u64,
        byte_length: u64,
        buffer_length: u64,
    },
    #[error("View {kind:?} at {byte_offset}+{byte_length} is not aligned to its element size")]
    Misaligned {
        kind: ViewKind,
        byte_offset: u64,
        byte_length: u64,
    },
    #[error("View flags {flags:#x} do not match the backing buffer")]
    FlagsMismatch { flags: u32 },
    #[error("Array buffer view is not preceded by an array buffer")]
    MissingBuffer,
}

/// Convenience function to serialize a value with the default host-object delegate.
///
/// This is equivalent to `Serializer::new(heap, SerializerOptions::default()).serialize(value)`.
/// A version header is always written.
///
/// # Arguments
/// * `heap` - The arena holding every object reachable from `value`.
/// * `value` - The value to serialize.
pub fn serialize(heap: &Heap, value: &Value) -> Result<Bytes> {
    Serializer::new(heap, SerializerOptions::default()).serialize(value)
}

/// Convenience function to deserialize a value produced by [`serialize`] (or by the engine's
/// own `v8.serialize`).
///
/// Objects are allocated into `heap`; the returned value may reference them.
///
/// # Arguments
/// * `data` - The serialized bytes, header included.
/// * `heap` - The arena that receives the reconstructed objects.
pub fn deserialize(data: Bytes, heap: &mut Heap) -> Result<Value> {
    Deserializer::new(data, heap, DeserializerOptions::default())?.deserialize()
}
