//! Higher-level `Serializer` / `Deserializer` pairs.
//!
//! These wrap the raw codec with a default delegate that writes typed views as host objects in
//! Node's format (`type index, byteLength, bytes`) instead of writing their whole backing buffer.

use crate::de::{DeserializerDelegate, ValueDeserializer};
use crate::ser::{SerializerDelegate, ValueSerializer};
use crate::value::{ArrayBuffer, ArrayBufferView, Heap, HeapObject, ObjectRef, Value, ViewKind};
use crate::{Result, ViewDecodeError};
use bytes::Bytes;

/// Options for [`Serializer`].
#[derive(Debug, Clone)]
pub struct SerializerOptions {
    /// Always write strings as UTF-8. Faster, but mangles strings with lone surrogates.
    pub force_utf8: bool,
    /// Skip named properties of dense arrays.
    pub ignore_array_properties: bool,
    /// Write typed views through the delegate instead of with their backing buffer.
    pub treat_array_buffer_views_as_host_objects: bool,
}

impl Default for SerializerOptions {
    fn default() -> Self {
        Self {
            force_utf8: false,
            ignore_array_properties: false,
            treat_array_buffer_views_as_host_objects: true,
        }
    }
}

/// Options for [`Deserializer`].
#[derive(Debug, Clone, Default)]
pub struct DeserializerOptions {
    /// Decode two-byte strings as strict UTF-16 (lone surrogates become U+FFFD).
    pub force_utf16: bool,
}

/// Delegate that handles typed views in Node's host-object format.
#[derive(Debug, Clone, Default)]
pub struct HostViewDelegate {
    message_buffer: Option<ObjectRef>,
}

impl SerializerDelegate for HostViewDelegate {
    fn write_host_object(ser: &mut ValueSerializer<'_, Self>, object: ObjectRef) -> Result<()> {
        write_array_buffer_view_host_object(ser, object)
    }
}

impl DeserializerDelegate for HostViewDelegate {
    fn read_host_object(de: &mut ValueDeserializer<'_, Self>) -> Result<ObjectRef> {
        let tag = de.read_uint32()?;
        let mut message_buffer = de.delegate_mut().message_buffer.take();
        let result = read_array_buffer_view_host_object(de, tag, &mut message_buffer);
        de.delegate_mut().message_buffer = message_buffer;
        result
    }
}

/// Writes a typed view as `type index, byteLength, bytes`. `Uint8Array` is always index 1.
pub fn write_array_buffer_view_host_object<D: SerializerDelegate>(
    ser: &mut ValueSerializer<'_, D>,
    object: ObjectRef,
) -> Result<()> {
    let heap = ser.heap();
    let Some(HeapObject::View(view)) = heap.get(object) else {
        let kind = heap.get(object).map_or("object", |o| o.kind_name());
        return Err(ser
            .delegate_mut()
            .data_clone_error(format!("Unserializable host object: {}", kind)));
    };
    let Some(index) = view.kind.host_index() else {
        return Err(ser
            .delegate_mut()
            .data_clone_error(format!("Unserializable host object: {:?}Array", view.kind)));
    };
    let Some(bytes) = heap.view_bytes(object) else {
        return Err(ser.delegate_mut().data_clone_error(format!(
            "Could not clone {:?} view at {}+{}: out of bounds",
            view.kind, view.byte_offset, view.byte_length
        )));
    };
    ser.write_uint32(index)?;
    ser.write_uint32(bytes.len() as u32)?;
    ser.write_raw_bytes(&bytes)
}

/// Reads a typed view written by [`write_array_buffer_view_host_object`]; `tag` has already been
/// read. V8 view subtags are accepted in place of the type index.
///
/// Aligned payloads become views over one buffer covering the whole input, cached in
/// `message_buffer`. Misaligned payloads are copied into a buffer of their own.
pub fn read_array_buffer_view_host_object<D: DeserializerDelegate>(
    de: &mut ValueDeserializer<'_, D>,
    tag: u32,
    message_buffer: &mut Option<ObjectRef>,
) -> Result<ObjectRef> {
    let kind = ViewKind::from_host_index(tag)
        .or_else(|| ViewKind::from_tag(tag))
        .ok_or(ViewDecodeError::UnknownSubtag(tag))?;
    let byte_length = de.read_uint32()? as usize;
    let offset = de.read_raw_bytes_no_alloc(byte_length)?;
    let element_size = kind.element_size();
    if byte_length % element_size != 0 {
        return Err(ViewDecodeError::Misaligned {
            kind,
            byte_offset: offset as u64,
            byte_length: byte_length as u64,
        }
        .into());
    }

    let (buffer, byte_offset) = if offset % element_size == 0 {
        let data = de.data().clone();
        // The cache does not survive a heap rollback.
        let cached = message_buffer.filter(|buffer| {
            matches!(de.heap().get(*buffer), Some(HeapObject::ArrayBuffer(b))
                if b.data.as_ptr() == data.as_ptr() && b.data.len() == data.len())
        });
        let buffer = match cached {
            Some(buffer) => buffer,
            None => de
                .heap_mut()
                .alloc(HeapObject::ArrayBuffer(ArrayBuffer::new(data))),
        };
        *message_buffer = Some(buffer);
        (buffer, offset)
    } else {
        let copy = Bytes::copy_from_slice(&de.data()[offset..offset + byte_length]);
        let buffer = de
            .heap_mut()
            .alloc(HeapObject::ArrayBuffer(ArrayBuffer::new(copy)));
        (buffer, 0)
    };

    Ok(de.heap_mut().alloc(HeapObject::View(ArrayBufferView {
        kind,
        buffer,
        byte_offset,
        byte_length,
        length_tracking: false,
    })))
}

/// Serializes one value per session with a version header.
pub struct Serializer<'h, D: SerializerDelegate = HostViewDelegate> {
    serializer: ValueSerializer<'h, D>,
    data: Option<Bytes>,
}

impl<'h> Serializer<'h> {
    pub fn new(heap: &'h Heap, options: SerializerOptions) -> Self {
        Self::with_delegate(heap, HostViewDelegate::default(), options)
    }
}

impl<'h, D: SerializerDelegate> Serializer<'h, D> {
    pub fn with_delegate(heap: &'h Heap, delegate: D, options: SerializerOptions) -> Self {
        let mut serializer = ValueSerializer::with_delegate(heap, delegate);
        serializer.set_force_utf8(options.force_utf8);
        serializer.set_ignore_array_properties(options.ignore_array_properties);
        serializer.set_treat_array_buffer_views_as_host_objects(
            options.treat_array_buffer_views_as_host_objects,
        );
        Self {
            serializer,
            data: None,
        }
    }

    pub fn write_header(&mut self) -> Result<()> {
        self.serializer.write_header()
    }

    /// Writes `value` and releases the session buffer for [`release_buffer`](Self::release_buffer).
    pub fn write_value(&mut self, value: &Value) -> Result<()> {
        match self.serializer.write_object(value) {
            Ok(()) => {
                self.data = Some(self.serializer.release());
                Ok(())
            }
            Err(err) => {
                self.data = None;
                Err(err)
            }
        }
    }

    pub fn release_buffer(&mut self) -> Option<Bytes> {
        self.data.take()
    }

    pub fn transfer_array_buffer(&mut self, transfer_id: u32, buffer: ObjectRef) -> Result<()> {
        self.serializer.transfer_array_buffer(transfer_id, buffer)
    }

    /// Header plus one value.
    pub fn serialize(&mut self, value: &Value) -> Result<Bytes> {
        self.write_header()?;
        self.write_value(value)?;
        Ok(self.release_buffer().unwrap_or_default())
    }

    pub fn inner_mut(&mut self) -> &mut ValueSerializer<'h, D> {
        &mut self.serializer
    }
}

/// Deserializes values written by [`Serializer`] or by a V8-based runtime.
pub struct Deserializer<'a, D: DeserializerDelegate = HostViewDelegate> {
    deserializer: ValueDeserializer<'a, D>,
}

impl<'a> Deserializer<'a> {
    /// Creates a deserializer and consumes the header.
    pub fn new(data: Bytes, heap: &'a mut Heap, options: DeserializerOptions) -> Result<Self> {
        Self::with_delegate(data, heap, HostViewDelegate::default(), options)
    }
}

impl<'a, D: DeserializerDelegate> Deserializer<'a, D> {
    pub fn with_delegate(
        data: Bytes,
        heap: &'a mut Heap,
        delegate: D,
        options: DeserializerOptions,
    ) -> Result<Self> {
        let mut deserializer = ValueDeserializer::with_delegate(data, heap, delegate);
        deserializer.set_force_utf16(options.force_utf16);
        deserializer.read_header()?;
        Ok(Self { deserializer })
    }

    pub fn read_value(&mut self) -> Result<Value> {
        self.deserializer.read_object_wrapper()
    }

    pub fn transfer_array_buffer(&mut self, transfer_id: u32, buffer: ObjectRef) {
        self.deserializer.transfer_array_buffer(transfer_id, buffer);
    }

    pub fn wire_format_version(&self) -> u32 {
        self.deserializer.wire_format_version()
    }

    pub fn deserialize(&mut self) -> Result<Value> {
        self.read_value()
    }

    pub fn inner_mut(&mut self) -> &mut ValueDeserializer<'a, D> {
        &mut self.deserializer
    }
}
