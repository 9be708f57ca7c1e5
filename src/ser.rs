//! The writer half of the codec.

use crate::core::*;
use crate::value::{
    ArrayBuffer, ArrayBufferView, ErrorKind, Heap, HeapObject, JsArray, JsError, JsObject,
    JsString, ObjectRef, PrimitiveWrapper, Value,
};
use crate::{Error, Result};
use bytes::{BufMut, Bytes, BytesMut};
use indexmap::IndexMap;
use log::trace;
use std::collections::HashMap;

/// Hooks the writer calls for values it cannot encode on its own.
///
/// Every method has a default that behaves as if no delegate were installed, so `()` is the
/// "no delegate" implementation.
pub trait SerializerDelegate: Sized {
    /// Builds the error returned when a value cannot be cloned.
    fn data_clone_error(&mut self, message: String) -> Error {
        Error::DataClone(message)
    }

    /// Whether plain objects should be offered to [`is_host_object`](Self::is_host_object).
    fn has_custom_host_objects(&self) -> bool {
        false
    }

    fn is_host_object(&mut self, _heap: &Heap, _object: ObjectRef) -> Result<bool> {
        Ok(false)
    }

    /// Writes the payload of a host object. `TAG_HOST_OBJECT` has already been written.
    ///
    /// The payload must be self-delimiting; the matching reader hook consumes exactly these bytes.
    fn write_host_object(ser: &mut ValueSerializer<'_, Self>, object: ObjectRef) -> Result<()> {
        let kind = ser.heap().get(object).map_or("object", |o| o.kind_name());
        Err(ser
            .delegate_mut()
            .data_clone_error(format!("Could not clone {}: no host object delegate", kind)))
    }

    fn get_shared_array_buffer_id(&mut self, _heap: &Heap, _buffer: ObjectRef) -> Result<u32> {
        Err(self.data_clone_error("Could not clone SharedArrayBuffer".to_string()))
    }

    /// Returns a buffer holding the bytes of `buffer` with capacity for at least `size` bytes.
    fn reallocate_buffer_memory(&mut self, mut buffer: BytesMut, size: usize) -> Result<BytesMut> {
        buffer.reserve(size.saturating_sub(buffer.len()));
        Ok(buffer)
    }
}

impl SerializerDelegate for () {}

/// Serializes value graphs to the V8 wire format.
///
/// A session starts with [`write_header`](Self::write_header), writes one or more values and
/// ends with [`release`](Self::release), which hands back the bytes and resets the id table.
pub struct ValueSerializer<'h, D: SerializerDelegate = ()> {
    heap: &'h Heap,
    delegate: D,
    buffer: BytesMut,
    id_map: HashMap<ObjectRef, u32>,
    next_id: u32,
    transfer_map: HashMap<ObjectRef, u32>,
    force_utf8: bool,
    ignore_array_properties: bool,
    treat_array_buffer_views_as_host_objects: bool,
    depth: usize,
}

impl<'h> ValueSerializer<'h, ()> {
    pub fn new(heap: &'h Heap) -> Self {
        Self::with_delegate(heap, ())
    }
}

impl<'h, D: SerializerDelegate> ValueSerializer<'h, D> {
    pub fn with_delegate(heap: &'h Heap, delegate: D) -> Self {
        Self {
            heap,
            delegate,
            buffer: BytesMut::new(),
            id_map: HashMap::new(),
            next_id: 0,
            transfer_map: HashMap::new(),
            force_utf8: false,
            ignore_array_properties: false,
            treat_array_buffer_views_as_host_objects: false,
            depth: 0,
        }
    }

    /// Always write strings as UTF-8. Lone surrogates are replaced.
    pub fn set_force_utf8(&mut self, mode: bool) {
        self.force_utf8 = mode;
    }

    /// Skip named properties of dense arrays.
    pub fn set_ignore_array_properties(&mut self, mode: bool) {
        self.ignore_array_properties = mode;
    }

    /// Hand typed views to the delegate as host objects instead of writing them with their buffer.
    pub fn set_treat_array_buffer_views_as_host_objects(&mut self, mode: bool) {
        self.treat_array_buffer_views_as_host_objects = mode;
    }

    pub fn heap(&self) -> &'h Heap {
        self.heap
    }

    pub fn delegate(&self) -> &D {
        &self.delegate
    }

    pub fn delegate_mut(&mut self) -> &mut D {
        &mut self.delegate
    }

    /// Number of bytes written so far.
    pub fn position(&self) -> usize {
        self.buffer.len()
    }

    pub fn write_header(&mut self) -> Result<()> {
        self.write_tag(TAG_VERSION)?;
        self.write_varint(LATEST_VERSION as u64)
    }

    /// Writes one value. On failure the whole buffer is discarded.
    pub fn write_object(&mut self, value: &Value) -> Result<()> {
        let result = self.write_value(value);
        if result.is_err() {
            self.buffer.clear();
            self.id_map.clear();
            self.next_id = 0;
        }
        result
    }

    /// Returns the bytes written so far and resets the session.
    pub fn release(&mut self) -> Bytes {
        self.id_map.clear();
        self.next_id = 0;
        std::mem::take(&mut self.buffer).freeze()
    }

    /// Marks `buffer` as transferred: it is written as `TAG_ARRAY_BUFFER_TRANSFER` + `transfer_id`
    /// instead of by value.
    pub fn transfer_array_buffer(&mut self, transfer_id: u32, buffer: ObjectRef) -> Result<()> {
        if self.transfer_map.contains_key(&buffer) {
            return Err(Error::DataClone(
                "ArrayBuffer is already in the transfer map".to_string(),
            ));
        }
        match self.heap.get(buffer) {
            Some(HeapObject::ArrayBuffer(_)) => {}
            Some(HeapObject::SharedArrayBuffer(_)) => {
                return Err(Error::DataClone(
                    "SharedArrayBuffer cannot be transferred".to_string(),
                ))
            }
            _ => return Err(Error::Type("Only an ArrayBuffer can be transferred".to_string())),
        }
        self.transfer_map.insert(buffer, transfer_id);
        Ok(())
    }

    // --- raw primitives for delegates ---
    pub fn write_uint32(&mut self, value: u32) -> Result<()> {
        self.write_varint(value as u64)
    }

    pub fn write_uint64(&mut self, value: u64) -> Result<()> {
        self.write_varint(value)
    }

    pub fn write_double(&mut self, value: f64) -> Result<()> {
        self.reserve(8)?;
        write_double(&mut self.buffer, value);
        Ok(())
    }

    pub fn write_raw_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.reserve(bytes.len())?;
        self.buffer.put_slice(bytes);
        Ok(())
    }

    pub fn write_byte(&mut self, value: u8) -> Result<()> {
        self.reserve(1)?;
        self.buffer.put_u8(value);
        Ok(())
    }

    /// Writes `bytes` as a one-byte string without inspecting them.
    pub(crate) fn write_raw_one_byte_string(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_tag(TAG_ONE_BYTE_STRING)?;
        self.write_varint(bytes.len() as u64)?;
        self.write_raw_bytes(bytes)
    }

    fn write_tag(&mut self, tag: u8) -> Result<()> {
        self.write_byte(tag)
    }

    fn write_varint(&mut self, value: u64) -> Result<()> {
        self.reserve(varint_len(value))?;
        write_varint(&mut self.buffer, value);
        Ok(())
    }

    /// Makes room for `additional` bytes, growing through the delegate.
    fn reserve(&mut self, additional: usize) -> Result<()> {
        let required = self.buffer.len() + additional;
        let capacity = self.buffer.capacity();
        if required <= capacity {
            return Ok(());
        }
        let requested = required.max(capacity * 2) + 64;
        let old = std::mem::take(&mut self.buffer);
        let old_len = old.len();
        let grown = self.delegate.reallocate_buffer_memory(old, requested)?;
        if grown.len() != old_len || grown.capacity() < required {
            return Err(Error::Delegate(format!(
                "reallocate_buffer_memory returned {} bytes with capacity {}, expected {} bytes with capacity {}",
                grown.len(),
                grown.capacity(),
                old_len,
                required
            )));
        }
        self.buffer = grown;
        Ok(())
    }

    fn clone_error(&mut self, message: String) -> Error {
        self.delegate.data_clone_error(message)
    }

    fn write_value(&mut self, value: &Value) -> Result<()> {
        if self.depth >= MAX_DEPTH {
            return Err(self.clone_error(format!(
                "Could not clone value nested deeper than {} levels",
                MAX_DEPTH
            )));
        }
        self.depth += 1;
        let result = self.write_nested_value(value);
        self.depth -= 1;
        result
    }

    fn write_nested_value(&mut self, value: &Value) -> Result<()> {
        match value {
            Value::Undefined => self.write_tag(TAG_UNDEFINED),
            Value::Null => self.write_tag(TAG_NULL),
            Value::Bool(true) => self.write_tag(TAG_TRUE),
            Value::Bool(false) => self.write_tag(TAG_FALSE),
            Value::Int32(n) if is_smi(*n) => self.write_smi(*n),
            Value::Int32(n) => self.write_heap_number(*n as f64),
            Value::Double(d) => match double_as_smi(*d) {
                Some(n) => self.write_smi(n),
                None => self.write_heap_number(*d),
            },
            Value::BigInt(b) => {
                self.write_tag(TAG_BIGINT)?;
                self.reserve(varint_len(bigint_bitfield(b)) + bigint_byte_length(b))?;
                write_bigint_contents(&mut self.buffer, b);
                Ok(())
            }
            Value::String(s) => self.write_string(s),
            Value::Symbol(_) => Err(self.clone_error("Could not clone Symbol()".to_string())),
            Value::Object(object) => {
                let heap = self.heap;
                // Views are preceded by their buffer, before the view itself gets an id.
                if let Some(HeapObject::View(view)) = heap.get(*object) {
                    if !self.id_map.contains_key(object)
                        && !self.treat_array_buffer_views_as_host_objects
                    {
                        self.write_receiver(view.buffer)?;
                    }
                }
                self.write_receiver(*object)
            }
        }
    }

    fn write_smi(&mut self, value: i32) -> Result<()> {
        self.write_tag(TAG_INT32)?;
        self.write_varint(zigzag_encode(value) as u64)
    }

    fn write_heap_number(&mut self, value: f64) -> Result<()> {
        self.write_tag(TAG_DOUBLE)?;
        self.write_double(value)
    }

    fn write_string(&mut self, value: &JsString) -> Result<()> {
        if self.force_utf8 {
            let utf8 = value.to_string_lossy();
            self.write_tag(TAG_UTF8_STRING)?;
            self.write_varint(utf8.len() as u64)?;
            return self.write_raw_bytes(utf8.as_bytes());
        }

        let start = self.buffer.len();
        let units = value.as_code_units();
        self.write_tag(TAG_ONE_BYTE_STRING)?;
        self.write_varint(units.len() as u64)?;
        self.reserve(units.len())?;

        let mut chunk_size = ONE_BYTE_CHUNK_START;
        let mut offset = 0;
        while offset < units.len() {
            let end = units.len().min(offset + chunk_size);
            let chunk = &units[offset..end];
            if chunk.iter().any(|&u| u >= 0x80) {
                trace!(
                    "string of {} code units is not ASCII, rewriting as two-byte",
                    units.len()
                );
                self.buffer.truncate(start);
                return self.write_two_byte_string(units);
            }
            self.buffer.extend(chunk.iter().map(|&u| u as u8));
            offset = end;
            chunk_size *= 2;
        }
        Ok(())
    }

    fn write_two_byte_string(&mut self, units: &[u16]) -> Result<()> {
        let byte_length = units.len() * 2;
        // The payload must start at an even offset.
        if (self.buffer.len() + 1 + varint_len(byte_length as u64)) & 1 != 0 {
            self.write_tag(TAG_PADDING)?;
        }
        self.write_tag(TAG_TWO_BYTE_STRING)?;
        self.write_varint(byte_length as u64)?;
        self.reserve(byte_length)?;
        write_two_byte_units(&mut self.buffer, units);
        Ok(())
    }

    /// Writes a property key: array indices as numbers, everything else as a string.
    fn write_key(&mut self, key: &JsString) -> Result<()> {
        match key.as_array_index() {
            Some(index) => self.write_value(&Value::from_u32(index)),
            None => self.write_string(key),
        }
    }

    fn write_receiver(&mut self, object: ObjectRef) -> Result<()> {
        if let Some(&id) = self.id_map.get(&object) {
            self.write_tag(TAG_OBJECT_REFERENCE)?;
            return self.write_varint(id as u64);
        }

        let id = self.next_id;
        self.next_id += 1;
        self.id_map.insert(object, id);

        let heap = self.heap;
        let Some(receiver) = heap.get(object) else {
            return Err(self.clone_error(format!("Dangling object reference {:?}", object)));
        };
        match receiver {
            HeapObject::Unclonable(_) => {
                Err(self.clone_error(format!("Could not clone {}", receiver.kind_name())))
            }
            HeapObject::Array(array) => self.write_js_array(array),
            HeapObject::Date(time) => {
                self.write_tag(TAG_DATE)?;
                self.write_double(*time)
            }
            HeapObject::Primitive(wrapper) => self.write_js_primitive_wrapper(wrapper),
            HeapObject::RegExp(regexp) => {
                self.write_tag(TAG_REGEXP)?;
                self.write_string(&regexp.pattern)?;
                self.write_varint(regexp.flags as u64)
            }
            HeapObject::Map(entries) => {
                self.write_tag(TAG_BEGIN_JS_MAP)?;
                for (key, value) in entries {
                    self.write_value(key)?;
                    self.write_value(value)?;
                }
                self.write_tag(TAG_END_JS_MAP)?;
                self.write_varint(entries.len() as u64 * 2)
            }
            HeapObject::Set(values) => {
                self.write_tag(TAG_BEGIN_JS_SET)?;
                for value in values {
                    self.write_value(value)?;
                }
                self.write_tag(TAG_END_JS_SET)?;
                self.write_varint(values.len() as u64)
            }
            HeapObject::ArrayBuffer(buffer) => self.write_js_array_buffer(object, buffer),
            HeapObject::SharedArrayBuffer(_) => {
                let index = self.delegate.get_shared_array_buffer_id(heap, object)?;
                self.write_tag(TAG_SHARED_ARRAY_BUFFER)?;
                self.write_varint(index as u64)
            }
            HeapObject::View(view) => self.write_js_array_buffer_view(object, view),
            HeapObject::Error(error) => self.write_js_error(error),
            HeapObject::Object(obj) => {
                let is_host = self.delegate.has_custom_host_objects()
                    && self.delegate.is_host_object(heap, object)?;
                if is_host {
                    self.write_host_object(object)
                } else {
                    self.write_js_object(obj)
                }
            }
            HeapObject::Host(_) => self.write_host_object(object),
        }
    }

    fn write_js_object(&mut self, object: &JsObject) -> Result<()> {
        self.write_tag(TAG_BEGIN_JS_OBJECT)?;
        let mut properties_written = 0u64;
        for key in object.ordered_keys() {
            if let Some(value) = object.properties.get(key) {
                self.write_key(key)?;
                self.write_value(value)?;
                properties_written += 1;
            }
        }
        self.write_tag(TAG_END_JS_OBJECT)?;
        self.write_varint(properties_written)
    }

    fn write_named_properties(&mut self, properties: &IndexMap<JsString, Value>) -> Result<u64> {
        for (key, value) in properties {
            self.write_string(key)?;
            self.write_value(value)?;
        }
        Ok(properties.len() as u64)
    }

    /// Optimistically writes a dense array and rewinds to the sparse form at the first hole.
    fn write_js_array(&mut self, array: &JsArray) -> Result<()> {
        let start = self.buffer.len();
        let first_id = self.next_id;
        let length = array.length;

        self.write_tag(TAG_BEGIN_DENSE_JS_ARRAY)?;
        self.write_varint(length as u64)?;
        let mut bailed = false;
        for index in 0..length {
            match array.elements.get(&index) {
                Some(element) => self.write_value(element)?,
                None => {
                    bailed = true;
                    break;
                }
            }
        }

        if !bailed {
            let properties_written = if self.ignore_array_properties {
                0
            } else {
                self.write_named_properties(&array.properties)?
            };
            self.write_tag(TAG_END_DENSE_JS_ARRAY)?;
            self.write_varint(properties_written)?;
            return self.write_varint(length as u64);
        }

        trace!("array of length {} has holes, rewriting as sparse", length);
        self.buffer.truncate(start);
        // Objects first seen inside the abandoned attempt get their ids again.
        self.id_map.retain(|_, id| *id < first_id);
        self.next_id = first_id;

        self.write_tag(TAG_BEGIN_SPARSE_JS_ARRAY)?;
        self.write_varint(length as u64)?;
        for (index, element) in &array.elements {
            self.write_value(&Value::from_u32(*index))?;
            self.write_value(element)?;
        }
        let properties_written =
            array.elements.len() as u64 + self.write_named_properties(&array.properties)?;
        self.write_tag(TAG_END_SPARSE_JS_ARRAY)?;
        self.write_varint(properties_written)?;
        self.write_varint(length as u64)
    }

    fn write_js_primitive_wrapper(&mut self, wrapper: &PrimitiveWrapper) -> Result<()> {
        match wrapper {
            PrimitiveWrapper::Boolean(true) => self.write_tag(TAG_TRUE_OBJECT),
            PrimitiveWrapper::Boolean(false) => self.write_tag(TAG_FALSE_OBJECT),
            PrimitiveWrapper::Number(n) => {
                self.write_tag(TAG_NUMBER_OBJECT)?;
                self.write_double(*n)
            }
            PrimitiveWrapper::BigInt(b) => {
                self.write_tag(TAG_BIGINT_OBJECT)?;
                self.reserve(varint_len(bigint_bitfield(b)) + bigint_byte_length(b))?;
                write_bigint_contents(&mut self.buffer, b);
                Ok(())
            }
            PrimitiveWrapper::String(s) => {
                self.write_tag(TAG_STRING_OBJECT)?;
                self.write_string(s)
            }
            PrimitiveWrapper::Symbol(_) => {
                Err(self.clone_error("Could not clone Object(Symbol())".to_string()))
            }
        }
    }

    fn write_js_array_buffer(&mut self, object: ObjectRef, buffer: &ArrayBuffer) -> Result<()> {
        if let Some(&transfer_id) = self.transfer_map.get(&object) {
            self.write_tag(TAG_ARRAY_BUFFER_TRANSFER)?;
            return self.write_varint(transfer_id as u64);
        }

        let byte_length = buffer.data.len() as u64;
        if byte_length > MAX_SAFE_INTEGER {
            return Err(self.clone_error(format!(
                "Could not clone ArrayBuffer of {} bytes",
                byte_length
            )));
        }

        match buffer.max_byte_length {
            Some(max_byte_length) => {
                if max_byte_length as u64 > MAX_SAFE_INTEGER || (max_byte_length as u64) < byte_length {
                    return Err(self.clone_error(format!(
                        "Could not clone resizable ArrayBuffer with maxByteLength {}",
                        max_byte_length
                    )));
                }
                self.write_tag(TAG_RESIZABLE_ARRAY_BUFFER)?;
                self.write_varint(byte_length)?;
                self.write_varint(max_byte_length as u64)?;
            }
            None => {
                self.write_tag(TAG_ARRAY_BUFFER)?;
                self.write_varint(byte_length)?;
            }
        }
        self.write_raw_bytes(&buffer.data)
    }

    fn write_js_array_buffer_view(&mut self, object: ObjectRef, view: &ArrayBufferView) -> Result<()> {
        if self.treat_array_buffer_views_as_host_objects {
            return self.write_host_object(object);
        }

        let heap = self.heap;
        let (buffer_length, backed_by_rab) = match heap.get(view.buffer) {
            Some(HeapObject::ArrayBuffer(b)) => (b.data.len(), b.is_resizable()),
            Some(HeapObject::SharedArrayBuffer(b)) => (b.data.len(), false),
            _ => {
                return Err(self.clone_error(
                    "Could not clone ArrayBufferView: its buffer is not an ArrayBuffer".to_string(),
                ))
            }
        };
        let in_bounds = view
            .byte_offset
            .checked_add(view.byte_length)
            .is_some_and(|end| end <= buffer_length);
        if !in_bounds {
            return Err(self.clone_error(format!(
                "Could not clone {:?} view at {}+{}: out of bounds",
                view.kind, view.byte_offset, view.byte_length
            )));
        }

        let mut flags = 0;
        if view.length_tracking {
            flags |= VIEW_FLAG_LENGTH_TRACKING;
        }
        if backed_by_rab {
            flags |= VIEW_FLAG_BACKED_BY_RAB;
        }

        self.write_tag(TAG_ARRAY_BUFFER_VIEW)?;
        self.write_varint(view.kind.tag() as u64)?;
        self.write_varint(view.byte_offset as u64)?;
        self.write_varint(view.byte_length as u64)?;
        self.write_varint(flags as u64)
    }

    fn write_js_error(&mut self, error: &JsError) -> Result<()> {
        self.write_tag(TAG_ERROR)?;
        let prototype = match error.kind {
            ErrorKind::Error => None,
            ErrorKind::EvalError => Some(ERROR_EVAL_ERROR_PROTOTYPE),
            ErrorKind::RangeError => Some(ERROR_RANGE_ERROR_PROTOTYPE),
            ErrorKind::ReferenceError => Some(ERROR_REFERENCE_ERROR_PROTOTYPE),
            ErrorKind::SyntaxError => Some(ERROR_SYNTAX_ERROR_PROTOTYPE),
            ErrorKind::TypeError => Some(ERROR_TYPE_ERROR_PROTOTYPE),
            ErrorKind::UriError => Some(ERROR_URI_ERROR_PROTOTYPE),
        };
        if let Some(tag) = prototype {
            self.write_varint(tag as u64)?;
        }
        if let Some(message) = &error.message {
            self.write_varint(ERROR_MESSAGE as u64)?;
            self.write_string(message)?;
        }
        if let Some(stack) = &error.stack {
            self.write_varint(ERROR_STACK as u64)?;
            self.write_string(stack)?;
        }
        if let Some(cause) = &error.cause {
            self.write_varint(ERROR_CAUSE as u64)?;
            self.write_value(cause)?;
        }
        self.write_varint(ERROR_END as u64)
    }

    fn write_host_object(&mut self, object: ObjectRef) -> Result<()> {
        self.write_tag(TAG_HOST_OBJECT)?;
        D::write_host_object(self, object)
    }
}
