//! Streaming framing adapter.
//!
//! Each value is serialized on its own, then the resulting bytes are serialized once more as a
//! plain one-byte string:
//!
//! ```text
//! 0xFF 0x0F '"' varint(len) <len bytes of a complete serialization>
//! ```
//!
//! The outer encoding carries the body length, so [`DeserializerStream`] can tell whether a frame
//! is complete by attempting an outer decode and treating [`Error::InsufficientData`] as "wait for
//! more bytes". Streams produced this way are only readable by this adapter.

use crate::core::MIN_FRAME_SIZE;
use crate::de::{DeserializerDelegate, ValueDeserializer};
use crate::ser::{SerializerDelegate, ValueSerializer};
use crate::serdes::{Deserializer, DeserializerOptions, HostViewDelegate, Serializer, SerializerOptions};
use crate::value::{Heap, Value};
use crate::{Error, Result};
use bytes::{Buf, Bytes, BytesMut};
use log::{debug, trace};

/// Wraps a complete serialization in the framing envelope.
pub(crate) fn frame(body: &[u8]) -> Result<Bytes> {
    let heap = Heap::new();
    let mut outer = ValueSerializer::new(&heap);
    outer.write_header()?;
    outer.write_raw_one_byte_string(body)?;
    Ok(outer.release())
}

/// Splits the first frame off `data`: returns the inner serialization and the frame's length.
///
/// # Errors
/// `Error::InsufficientData` if `data` holds only part of a frame.
pub(crate) fn read_frame(data: Bytes) -> Result<(Bytes, usize)> {
    let mut scratch = Heap::new();
    let mut outer = ValueDeserializer::new(data, &mut scratch);
    outer.read_header()?;
    let body = outer.read_raw_one_byte_string()?;
    Ok((body, outer.position()))
}

/// Encodes values into frames.
///
/// The inner serialization uses a delegate from `factory` per value; the envelope always uses
/// the plain writer.
pub struct SerializerStream<D = HostViewDelegate, F = fn() -> D> {
    options: SerializerOptions,
    factory: F,
    _delegate: std::marker::PhantomData<fn() -> D>,
}

impl SerializerStream {
    pub fn new(options: SerializerOptions) -> Self {
        Self::with_delegate_factory(options, HostViewDelegate::default)
    }
}

impl Default for SerializerStream {
    fn default() -> Self {
        Self::new(SerializerOptions::default())
    }
}

impl<D, F> SerializerStream<D, F>
where
    D: SerializerDelegate,
    F: FnMut() -> D,
{
    pub fn with_delegate_factory(options: SerializerOptions, factory: F) -> Self {
        Self {
            options,
            factory,
            _delegate: std::marker::PhantomData,
        }
    }

    /// Serializes `value` and returns one complete frame.
    pub fn encode(&mut self, heap: &Heap, value: &Value) -> Result<Bytes> {
        let delegate = (self.factory)();
        let body = Serializer::with_delegate(heap, delegate, self.options.clone()).serialize(value)?;
        let chunk = frame(&body)?;
        trace!("framed {} byte value into {} bytes", body.len(), chunk.len());
        Ok(chunk)
    }
}

/// Reassembles frames from arbitrarily split chunks and decodes them in order.
///
/// Partial frames are kept between calls to [`push`](Self::push); nothing is registered in the
/// heap until a frame is complete, and a frame that fails to decode leaves nothing behind.
pub struct DeserializerStream<D = HostViewDelegate, F = fn() -> D> {
    options: DeserializerOptions,
    factory: F,
    incomplete: Bytes,
    error: Option<Error>,
    failed: bool,
    _delegate: std::marker::PhantomData<fn() -> D>,
}

impl DeserializerStream {
    pub fn new(options: DeserializerOptions) -> Self {
        Self::with_delegate_factory(options, HostViewDelegate::default)
    }
}

impl Default for DeserializerStream {
    fn default() -> Self {
        Self::new(DeserializerOptions::default())
    }
}

impl<D, F> DeserializerStream<D, F>
where
    D: DeserializerDelegate,
    F: FnMut() -> D,
{
    pub fn with_delegate_factory(options: DeserializerOptions, factory: F) -> Self {
        Self {
            options,
            factory,
            incomplete: Bytes::new(),
            error: None,
            failed: false,
            _delegate: std::marker::PhantomData,
        }
    }

    /// Appends `chunk` and decodes every frame that is now complete, allocating into `heap`.
    ///
    /// If a frame is malformed after others in the same call decoded, those values are returned
    /// and the error is reported by the next call to `push` or [`finish`](Self::finish).
    ///
    /// # Errors
    /// Malformed frames. The stream stops at the first bad frame; later calls fail with
    /// `Error::Decode`.
    pub fn push(&mut self, chunk: &[u8], heap: &mut Heap) -> Result<Vec<Value>> {
        if let Some(err) = self.error.take() {
            return Err(err);
        }
        if self.failed {
            return Err(Error::Decode(
                "Stream stopped at a malformed frame".to_string(),
            ));
        }

        let mut pending = BytesMut::with_capacity(self.incomplete.len() + chunk.len());
        pending.extend_from_slice(&self.incomplete);
        pending.extend_from_slice(chunk);
        self.incomplete = pending.freeze();

        let mut values = Vec::new();
        while self.incomplete.len() >= MIN_FRAME_SIZE {
            match self.decode_frame(heap) {
                Ok(Some((value, consumed))) => {
                    debug!("decoded frame of {} bytes", consumed);
                    values.push(value);
                    self.incomplete.advance(consumed);
                }
                Ok(None) => break,
                Err(err) => {
                    self.failed = true;
                    if values.is_empty() {
                        return Err(err);
                    }
                    debug!("frame failed after {} decoded values: {}", values.len(), err);
                    self.error = Some(err);
                    return Ok(values);
                }
            }
        }

        if !self.incomplete.is_empty() {
            trace!("buffering {} bytes of an incomplete frame", self.incomplete.len());
        }
        Ok(values)
    }

    /// Decodes the first buffered frame. Returns `None` if it is not complete yet.
    fn decode_frame(&mut self, heap: &mut Heap) -> Result<Option<(Value, usize)>> {
        let (body, consumed) = match read_frame(self.incomplete.clone()) {
            Ok(frame) => frame,
            Err(Error::InsufficientData) => return Ok(None),
            Err(err) => return Err(err),
        };
        let heap_len = heap.len();
        let delegate = (self.factory)();
        let result = Deserializer::with_delegate(body, heap, delegate, self.options.clone())
            .and_then(|mut de| de.deserialize());
        match result {
            Ok(value) => Ok(Some((value, consumed))),
            Err(err) => {
                heap.truncate(heap_len);
                Err(err)
            }
        }
    }

    /// Bytes of a partial frame waiting for more input.
    pub fn buffered_len(&self) -> usize {
        self.incomplete.len()
    }

    /// Ends the stream.
    ///
    /// # Errors
    /// The error of a malformed frame not yet reported, or `Error::InsufficientData` if the input
    /// stopped in the middle of a frame.
    pub fn finish(self) -> Result<()> {
        if let Some(err) = self.error {
            return Err(err);
        }
        if self.incomplete.is_empty() {
            Ok(())
        } else {
            debug!("stream ended with {} buffered bytes", self.incomplete.len());
            Err(Error::InsufficientData)
        }
    }
}
