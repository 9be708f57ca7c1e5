//! The reader half of the codec.

use crate::core::*;
use crate::value::{
    ArrayBuffer, ArrayBufferView, ErrorKind, Heap, HeapObject, JsArray, JsError, JsObject,
    JsString, ObjectRef, PrimitiveWrapper, RegExp, SharedArrayBuffer, Value, ViewKind,
};
use crate::{ContainerDecodeError, Error, Result, ViewDecodeError};
use bytes::Bytes;
use log::{debug, warn};
use std::collections::HashMap;

/// Hooks the reader calls for payloads it cannot decode on its own.
///
/// `()` is the "no delegate" implementation: host objects and shared buffers fail to decode.
pub trait DeserializerDelegate: Sized {
    /// Reads the payload of a host object (`TAG_HOST_OBJECT` has been consumed) and allocates the
    /// result in the reader's heap.
    ///
    /// For wire versions below 13 this is also called for unknown tags, with the position rewound
    /// to the tag byte.
    fn read_host_object(de: &mut ValueDeserializer<'_, Self>) -> Result<ObjectRef> {
        Err(Error::Delegate(format!(
            "No delegate to read host object at offset {}",
            de.position()
        )))
    }

    fn get_shared_array_buffer_from_id(&mut self, id: u32) -> Result<SharedArrayBuffer> {
        Err(Error::Delegate(format!(
            "No delegate to resolve SharedArrayBuffer {}",
            id
        )))
    }
}

impl DeserializerDelegate for () {}

/// Reconstructs value graphs from the V8 wire format.
///
/// Objects are allocated into the borrowed [`Heap`]. Back-references resolve against ids assigned
/// during this session only.
pub struct ValueDeserializer<'a, D: DeserializerDelegate = ()> {
    data: Bytes,
    position: usize,
    heap: &'a mut Heap,
    delegate: D,
    id_map: HashMap<u32, ObjectRef>,
    next_id: u32,
    version: u32,
    version13_broken_data_mode: bool,
    force_utf16: bool,
    transfer_map: HashMap<u32, ObjectRef>,
    depth: usize,
}

impl<'a> ValueDeserializer<'a, ()> {
    pub fn new(data: Bytes, heap: &'a mut Heap) -> Self {
        Self::with_delegate(data, heap, ())
    }
}

impl<'a, D: DeserializerDelegate> ValueDeserializer<'a, D> {
    pub fn with_delegate(data: Bytes, heap: &'a mut Heap, delegate: D) -> Self {
        Self {
            data,
            position: 0,
            heap,
            delegate,
            id_map: HashMap::new(),
            next_id: 0,
            version: 0,
            version13_broken_data_mode: false,
            force_utf16: false,
            transfer_map: HashMap::new(),
            depth: 0,
        }
    }

    /// Decode two-byte strings as strict UTF-16, replacing lone surrogates.
    pub fn set_force_utf16(&mut self, mode: bool) {
        self.force_utf16 = mode;
    }

    /// Version from the header, or 0 if the data had none.
    pub fn wire_format_version(&self) -> u32 {
        self.version
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// The complete input.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn heap(&self) -> &Heap {
        &*self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut *self.heap
    }

    pub fn delegate(&self) -> &D {
        &self.delegate
    }

    pub fn delegate_mut(&mut self) -> &mut D {
        &mut self.delegate
    }

    /// Resolves `TAG_ARRAY_BUFFER_TRANSFER` with `transfer_id` to `buffer`.
    pub fn transfer_array_buffer(&mut self, transfer_id: u32, buffer: ObjectRef) {
        self.transfer_map.insert(transfer_id, buffer);
    }

    /// Consumes the version header if there is one. Returns whether a header was present.
    ///
    /// # Errors
    /// Returns `Error::Version` if the header announces a version newer than `LATEST_VERSION`.
    pub fn read_header(&mut self) -> Result<bool> {
        if self.peek_tag() != Some(TAG_VERSION) {
            return Ok(false);
        }
        self.read_tag()?;
        let version = self.read_uint32()?;
        if version > LATEST_VERSION {
            return Err(Error::Version {
                version,
                latest: LATEST_VERSION,
            });
        }
        self.version = version;
        Ok(true)
    }

    /// Reads one top-level value.
    ///
    /// Version 13 data that fails to decode is read again in the compatibility mode for the
    /// encoder bug that wrote view flags one version early.
    pub fn read_object_wrapper(&mut self) -> Result<Value> {
        let start = self.position;
        let heap_len = self.heap.len();
        let next_id = self.next_id;
        let saved_ids = (self.version == 13).then(|| self.id_map.clone());

        match self.read_object() {
            Ok(value) => Ok(value),
            Err(err) => match saved_ids {
                Some(ids) if !self.version13_broken_data_mode => {
                    warn!("version 13 data failed to decode ({}), retrying in broken-data mode", err);
                    self.position = start;
                    self.heap.truncate(heap_len);
                    self.next_id = next_id;
                    self.id_map = ids;
                    self.version13_broken_data_mode = true;
                    self.read_object()
                }
                _ => Err(err),
            },
        }
    }

    // --- raw primitives for delegates ---
    pub fn read_uint32(&mut self) -> Result<u32> {
        self.read_with(read_varint32)
    }

    pub fn read_uint64(&mut self) -> Result<u64> {
        self.read_with(read_varint)
    }

    pub fn read_double(&mut self) -> Result<f64> {
        self.read_with(read_double)
    }

    /// Returns the next `size` bytes without copying.
    pub fn read_raw_bytes(&mut self, size: usize) -> Result<Bytes> {
        let offset = self.read_raw_bytes_no_alloc(size)?;
        Ok(self.data.slice(offset..offset + size))
    }

    /// Skips `size` bytes and returns the offset they start at.
    pub fn read_raw_bytes_no_alloc(&mut self, size: usize) -> Result<usize> {
        if self.data.len() - self.position < size {
            return Err(Error::InsufficientData);
        }
        let offset = self.position;
        self.position += size;
        Ok(offset)
    }

    pub fn read_byte(&mut self) -> Result<u8> {
        let byte = *self.data.get(self.position).ok_or(Error::InsufficientData)?;
        self.position += 1;
        Ok(byte)
    }

    /// Reads the body of a one-byte string envelope without decoding it as text.
    ///
    /// Also accepts a `Uint8Array` written in the host-object view format, which is how
    /// JavaScript producers of the same framing wrap their bodies.
    pub(crate) fn read_raw_one_byte_string(&mut self) -> Result<Bytes> {
        match self.read_tag()? {
            TAG_ONE_BYTE_STRING => {}
            TAG_HOST_OBJECT => {
                let index = self.read_uint32()?;
                if ViewKind::from_host_index(index) != Some(ViewKind::Uint8) {
                    return Err(Error::Decode(format!(
                        "Expected a framed Uint8Array, got host view type {}",
                        index
                    )));
                }
            }
            other => {
                return Err(Error::Decode(format!(
                    "Expected a framed byte string, got tag {}",
                    other
                )))
            }
        }
        let length = self.read_uint32()? as usize;
        self.read_raw_bytes(length)
    }

    fn read_with<T>(&mut self, read: impl FnOnce(&mut Bytes) -> Result<T>) -> Result<T> {
        let mut rest = self.data.slice(self.position..);
        let before = rest.len();
        let value = read(&mut rest)?;
        self.position += before - rest.len();
        Ok(value)
    }

    /// Next tag after any padding, without consuming it.
    fn peek_tag(&self) -> Option<u8> {
        self.data[self.position..]
            .iter()
            .copied()
            .find(|&tag| tag != TAG_PADDING)
    }

    fn read_tag(&mut self) -> Result<u8> {
        loop {
            let tag = self.read_byte()?;
            if tag != TAG_PADDING {
                return Ok(tag);
            }
        }
    }

    fn consume_tag(&mut self, expected: u8) -> Result<()> {
        let tag = self.read_tag()?;
        if tag != expected {
            return Err(Error::Decode(format!(
                "Expected tag {}, got {}",
                expected, tag
            )));
        }
        Ok(())
    }

    fn allocate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn alloc_with_id(&mut self, id: u32, object: HeapObject) -> ObjectRef {
        let object = self.heap.alloc(object);
        self.id_map.insert(id, object);
        object
    }

    fn read_object(&mut self) -> Result<Value> {
        if self.depth >= MAX_DEPTH {
            return Err(Error::Decode(format!(
                "Values nested deeper than {} levels at offset {}",
                MAX_DEPTH, self.position
            )));
        }
        self.depth += 1;
        let result = self.read_nested_object();
        self.depth -= 1;
        result
    }

    fn read_nested_object(&mut self) -> Result<Value> {
        let value = self.read_object_internal()?;

        // A view consumes the buffer read just before it.
        if let Value::Object(buffer) = value {
            let is_buffer = matches!(
                self.heap.get(buffer),
                Some(HeapObject::ArrayBuffer(_) | HeapObject::SharedArrayBuffer(_))
            );
            if is_buffer && self.peek_tag() == Some(TAG_ARRAY_BUFFER_VIEW) {
                self.consume_tag(TAG_ARRAY_BUFFER_VIEW)?;
                return self.read_js_array_buffer_view(buffer);
            }
        }
        Ok(value)
    }

    fn read_object_internal(&mut self) -> Result<Value> {
        let tag = self.read_tag()?;
        match tag {
            TAG_VERIFY_OBJECT_COUNT => {
                self.read_uint32()?;
                self.read_object()
            }
            TAG_UNDEFINED => Ok(Value::Undefined),
            TAG_NULL => Ok(Value::Null),
            TAG_TRUE => Ok(Value::Bool(true)),
            TAG_FALSE => Ok(Value::Bool(false)),
            TAG_INT32 => Ok(Value::Int32(self.read_with(read_zigzag)?)),
            TAG_UINT32 => Ok(Value::from_u32(self.read_uint32()?)),
            TAG_DOUBLE => Ok(Value::Double(self.read_double()?)),
            TAG_BIGINT => Ok(Value::BigInt(self.read_with(read_bigint_contents)?)),
            TAG_UTF8_STRING => Ok(Value::String(self.read_with(read_utf8_contents)?)),
            TAG_ONE_BYTE_STRING => Ok(Value::String(self.read_with(read_one_byte_contents)?)),
            TAG_TWO_BYTE_STRING => Ok(Value::String(self.read_two_byte_string()?)),
            TAG_OBJECT_REFERENCE => {
                let id = self.read_uint32()?;
                match self.id_map.get(&id) {
                    Some(object) => Ok(Value::Object(*object)),
                    None => Err(Error::Decode(format!("Invalid object reference {}", id))),
                }
            }
            TAG_BEGIN_JS_OBJECT => self.read_js_object(),
            TAG_BEGIN_SPARSE_JS_ARRAY => self.read_sparse_js_array(),
            TAG_BEGIN_DENSE_JS_ARRAY => self.read_dense_js_array(),
            TAG_DATE => {
                let time = self.read_double()?;
                let id = self.allocate_id();
                Ok(Value::Object(self.alloc_with_id(id, HeapObject::Date(time))))
            }
            TAG_TRUE_OBJECT | TAG_FALSE_OBJECT | TAG_NUMBER_OBJECT | TAG_BIGINT_OBJECT
            | TAG_STRING_OBJECT => self.read_js_primitive_wrapper(tag),
            TAG_REGEXP => {
                let id = self.allocate_id();
                let pattern = self.read_string()?;
                let flags = self.read_uint32()?;
                let regexp = HeapObject::RegExp(RegExp { pattern, flags });
                Ok(Value::Object(self.alloc_with_id(id, regexp)))
            }
            TAG_BEGIN_JS_MAP => self.read_js_map(),
            TAG_BEGIN_JS_SET => self.read_js_set(),
            TAG_ARRAY_BUFFER => self.read_js_array_buffer(false),
            TAG_RESIZABLE_ARRAY_BUFFER => self.read_js_array_buffer(true),
            TAG_ARRAY_BUFFER_TRANSFER => {
                let id = self.allocate_id();
                let transfer_id = self.read_uint32()?;
                let buffer = *self.transfer_map.get(&transfer_id).ok_or_else(|| {
                    Error::Decode(format!("Unknown ArrayBuffer transfer id {}", transfer_id))
                })?;
                self.id_map.insert(id, buffer);
                Ok(Value::Object(buffer))
            }
            TAG_SHARED_ARRAY_BUFFER => {
                let id = self.allocate_id();
                let clone_id = self.read_uint32()?;
                let buffer = self.delegate.get_shared_array_buffer_from_id(clone_id)?;
                let buffer = HeapObject::SharedArrayBuffer(buffer);
                Ok(Value::Object(self.alloc_with_id(id, buffer)))
            }
            TAG_ERROR => self.read_js_error(),
            TAG_HOST_OBJECT => self.read_host_object(),
            _ if self.version < 13 => {
                // Before TAG_HOST_OBJECT, embedders wrote their own tags inline.
                self.position -= 1;
                self.read_host_object()
            }
            _ => Err(Error::Decode(format!("Unknown serialization tag {}", tag))),
        }
    }

    /// Reads a string nested in another value.
    fn read_string(&mut self) -> Result<JsString> {
        if self.version < 12 {
            return self.read_with(read_utf8_contents);
        }
        match self.read_object()? {
            Value::String(s) => Ok(s),
            other => Err(Error::Decode(format!("Expected a string, got {:?}", other))),
        }
    }

    fn read_two_byte_string(&mut self) -> Result<JsString> {
        let byte_length = self.read_uint32()? as usize;
        let units = self.read_with(|reader| read_two_byte_units(reader, byte_length))?;
        if self.force_utf16 {
            return Ok(JsString::from(String::from_utf16_lossy(&units)));
        }
        Ok(JsString::from_code_units(units))
    }

    fn read_js_object(&mut self) -> Result<Value> {
        let id = self.allocate_id();
        let object = self.alloc_with_id(id, HeapObject::Object(JsObject::default()));
        let num_properties = self.read_js_object_properties(object, TAG_END_JS_OBJECT, "Object")?;
        let expected = self.read_uint32()?;
        if num_properties != expected {
            return Err(ContainerDecodeError::PropertyCountMismatch {
                container: "Object",
                expected: expected as u64,
                actual: num_properties as u64,
            }
            .into());
        }
        Ok(Value::Object(object))
    }

    fn read_sparse_js_array(&mut self) -> Result<Value> {
        let length = self.read_uint32()?;
        let id = self.allocate_id();
        let array = self.alloc_with_id(
            id,
            HeapObject::Array(JsArray {
                length,
                ..JsArray::default()
            }),
        );
        let num_properties =
            self.read_js_object_properties(array, TAG_END_SPARSE_JS_ARRAY, "sparse Array")?;
        self.check_array_end("sparse Array", num_properties, length)?;
        Ok(Value::Object(array))
    }

    fn read_dense_js_array(&mut self) -> Result<Value> {
        let length = self.read_uint64()?;
        // Every element takes at least one byte.
        if length > MAX_DENSE_ARRAY_LENGTH || length > (self.data.len() - self.position) as u64 {
            return Err(ContainerDecodeError::ArrayTooLarge { length }.into());
        }
        let length = length as u32;
        let id = self.allocate_id();
        let array = self.alloc_with_id(
            id,
            HeapObject::Array(JsArray {
                length,
                ..JsArray::default()
            }),
        );

        for index in 0..length {
            if self.peek_tag() == Some(TAG_THE_HOLE) {
                self.consume_tag(TAG_THE_HOLE)?;
                continue;
            }
            let element = self.read_object()?;
            // Versions before 11 wrote holes as undefined.
            if self.version < 11 && matches!(element, Value::Undefined) {
                continue;
            }
            self.array_mut(array)?.elements.insert(index, element);
        }

        let num_properties =
            self.read_js_object_properties(array, TAG_END_DENSE_JS_ARRAY, "dense Array")?;
        self.check_array_end("dense Array", num_properties, length)?;
        Ok(Value::Object(array))
    }

    fn check_array_end(&mut self, container: &'static str, num_properties: u32, length: u32) -> Result<()> {
        let expected_properties = self.read_uint32()?;
        let expected_length = self.read_uint32()?;
        if num_properties != expected_properties {
            return Err(ContainerDecodeError::PropertyCountMismatch {
                container,
                expected: expected_properties as u64,
                actual: num_properties as u64,
            }
            .into());
        }
        if length != expected_length {
            return Err(ContainerDecodeError::LengthMismatch {
                container,
                expected: length as u64,
                actual: expected_length as u64,
            }
            .into());
        }
        Ok(())
    }

    fn array_mut(&mut self, array: ObjectRef) -> Result<&mut JsArray> {
        match self.heap.get_mut(array) {
            Some(HeapObject::Array(array)) => Ok(array),
            _ => Err(Error::Decode("Array was replaced while decoding".to_string())),
        }
    }

    /// Reads key/value pairs into `object` until `end_tag`; returns how many were read.
    fn read_js_object_properties(
        &mut self,
        object: ObjectRef,
        end_tag: u8,
        container: &'static str,
    ) -> Result<u32> {
        let mut num_properties = 0;
        loop {
            match self.peek_tag() {
                None => return Err(Error::InsufficientData),
                Some(tag) if tag == end_tag => {
                    self.consume_tag(end_tag)?;
                    return Ok(num_properties);
                }
                Some(_) => {}
            }

            let key = match self.read_object()? {
                Value::String(s) => s,
                Value::Int32(n) => JsString::from_number_key(n as f64),
                Value::Double(d) => JsString::from_number_key(d),
                _ => return Err(ContainerDecodeError::InvalidKey { container }.into()),
            };
            let value = self.read_object()?;

            let duplicate = match self.heap.get_mut(object) {
                Some(HeapObject::Object(obj)) => {
                    obj.properties.insert(key.clone(), value).is_some()
                }
                Some(HeapObject::Array(arr)) => match key.as_array_index() {
                    Some(index) => {
                        let duplicate = arr.elements.contains_key(&index);
                        arr.set(index, value);
                        duplicate
                    }
                    None => arr.properties.insert(key.clone(), value).is_some(),
                },
                _ => return Err(Error::Decode(format!("{} was replaced while decoding", container))),
            };
            if duplicate {
                return Err(ContainerDecodeError::DuplicateKey {
                    container,
                    key: key.to_string_lossy(),
                }
                .into());
            }
            num_properties += 1;
        }
    }

    fn read_js_primitive_wrapper(&mut self, tag: u8) -> Result<Value> {
        let id = self.allocate_id();
        let wrapper = match tag {
            TAG_TRUE_OBJECT => PrimitiveWrapper::Boolean(true),
            TAG_FALSE_OBJECT => PrimitiveWrapper::Boolean(false),
            TAG_NUMBER_OBJECT => PrimitiveWrapper::Number(self.read_double()?),
            TAG_BIGINT_OBJECT => PrimitiveWrapper::BigInt(self.read_with(read_bigint_contents)?),
            _ => PrimitiveWrapper::String(self.read_string()?),
        };
        Ok(Value::Object(self.alloc_with_id(id, HeapObject::Primitive(wrapper))))
    }

    fn read_js_map(&mut self) -> Result<Value> {
        let id = self.allocate_id();
        let map = self.alloc_with_id(id, HeapObject::Map(Vec::new()));
        let mut length = 0u32;
        loop {
            match self.peek_tag() {
                None => return Err(Error::InsufficientData),
                Some(TAG_END_JS_MAP) => {
                    self.consume_tag(TAG_END_JS_MAP)?;
                    break;
                }
                Some(_) => {}
            }
            let key = self.read_object()?;
            let value = self.read_object()?;
            if let Some(HeapObject::Map(entries)) = self.heap.get_mut(map) {
                entries.push((key, value));
            }
            length += 2;
        }
        let expected = self.read_uint32()?;
        if length != expected {
            return Err(ContainerDecodeError::PropertyCountMismatch {
                container: "Map",
                expected: expected as u64,
                actual: length as u64,
            }
            .into());
        }
        Ok(Value::Object(map))
    }

    fn read_js_set(&mut self) -> Result<Value> {
        let id = self.allocate_id();
        let set = self.alloc_with_id(id, HeapObject::Set(Vec::new()));
        let mut length = 0u32;
        loop {
            match self.peek_tag() {
                None => return Err(Error::InsufficientData),
                Some(TAG_END_JS_SET) => {
                    self.consume_tag(TAG_END_JS_SET)?;
                    break;
                }
                Some(_) => {}
            }
            let value = self.read_object()?;
            if let Some(HeapObject::Set(values)) = self.heap.get_mut(set) {
                values.push(value);
            }
            length += 1;
        }
        let expected = self.read_uint32()?;
        if length != expected {
            return Err(ContainerDecodeError::PropertyCountMismatch {
                container: "Set",
                expected: expected as u64,
                actual: length as u64,
            }
            .into());
        }
        Ok(Value::Object(set))
    }

    fn read_js_array_buffer(&mut self, resizable: bool) -> Result<Value> {
        let id = self.allocate_id();
        let byte_length = self.read_uint32()? as usize;
        let max_byte_length = if resizable {
            let max_byte_length = self.read_uint32()? as usize;
            if byte_length > max_byte_length {
                return Err(Error::Decode(format!(
                    "ArrayBuffer byteLength {} exceeds maxByteLength {}",
                    byte_length, max_byte_length
                )));
            }
            Some(max_byte_length)
        } else {
            None
        };
        let data = self.read_raw_bytes(byte_length)?;
        let buffer = HeapObject::ArrayBuffer(ArrayBuffer {
            data,
            max_byte_length,
        });
        Ok(Value::Object(self.alloc_with_id(id, buffer)))
    }

    fn read_js_array_buffer_view(&mut self, buffer: ObjectRef) -> Result<Value> {
        let (buffer_length, resizable, shared) = match self.heap.get(buffer) {
            Some(HeapObject::ArrayBuffer(b)) => (b.data.len() as u64, b.is_resizable(), false),
            Some(HeapObject::SharedArrayBuffer(b)) => (b.data.len() as u64, false, true),
            _ => return Err(ViewDecodeError::MissingBuffer.into()),
        };

        let subtag = self.read_uint32()?;
        let byte_offset = self.read_uint32()? as u64;
        let byte_length = self.read_uint32()? as u64;
        if byte_offset > buffer_length || byte_length > buffer_length - byte_offset {
            return Err(ViewDecodeError::OutOfRange {
                byte_offset,
                byte_length,
                buffer_length,
            }
            .into());
        }
        let flags = if self.version >= 14 || self.version13_broken_data_mode {
            self.read_uint32()?
        } else {
            0
        };
        let id = self.allocate_id();

        let kind = ViewKind::from_tag(subtag).ok_or(ViewDecodeError::UnknownSubtag(subtag))?;
        let element_size = kind.element_size() as u64;
        if byte_offset % element_size != 0 || byte_length % element_size != 0 {
            return Err(ViewDecodeError::Misaligned {
                kind,
                byte_offset,
                byte_length,
            }
            .into());
        }

        let length_tracking = flags & VIEW_FLAG_LENGTH_TRACKING != 0;
        let backed_by_rab = flags & VIEW_FLAG_BACKED_BY_RAB != 0;
        let flags_valid = if length_tracking || backed_by_rab {
            resizable && !(backed_by_rab && shared)
        } else {
            true
        };
        // The buffer's resizability and the view's flag must agree.
        if !flags_valid || (resizable && !shared && !backed_by_rab) {
            return Err(ViewDecodeError::FlagsMismatch { flags }.into());
        }

        let view = HeapObject::View(ArrayBufferView {
            kind,
            buffer,
            byte_offset: byte_offset as usize,
            byte_length: byte_length as usize,
            length_tracking,
        });
        Ok(Value::Object(self.alloc_with_id(id, view)))
    }

    fn read_js_error(&mut self) -> Result<Value> {
        let id = self.allocate_id();
        let kind = match self.peek_byte() {
            Some(ERROR_EVAL_ERROR_PROTOTYPE) => Some(ErrorKind::EvalError),
            Some(ERROR_RANGE_ERROR_PROTOTYPE) => Some(ErrorKind::RangeError),
            Some(ERROR_REFERENCE_ERROR_PROTOTYPE) => Some(ErrorKind::ReferenceError),
            Some(ERROR_SYNTAX_ERROR_PROTOTYPE) => Some(ErrorKind::SyntaxError),
            Some(ERROR_TYPE_ERROR_PROTOTYPE) => Some(ErrorKind::TypeError),
            Some(ERROR_URI_ERROR_PROTOTYPE) => Some(ErrorKind::UriError),
            _ => None,
        };
        if kind.is_some() {
            self.position += 1;
        }

        let mut error = JsError {
            kind: kind.unwrap_or_default(),
            ..JsError::default()
        };
        loop {
            let tag = self.read_uint32()?;
            match u8::try_from(tag) {
                Ok(ERROR_END) => break,
                Ok(ERROR_MESSAGE) => error.message = Some(self.read_string()?),
                Ok(ERROR_STACK) => error.stack = Some(self.read_string()?),
                Ok(ERROR_CAUSE) => error.cause = Some(self.read_object()?),
                _ => return Err(Error::Decode(format!("Unknown error tag {}", tag))),
            }
        }
        Ok(Value::Object(self.alloc_with_id(id, HeapObject::Error(error))))
    }

    fn peek_byte(&self) -> Option<u8> {
        self.data.get(self.position).copied()
    }

    fn read_host_object(&mut self) -> Result<Value> {
        let id = self.allocate_id();
        let object = D::read_host_object(self)?;
        debug!("delegate read host object {:?} with id {}", object, id);
        self.id_map.insert(id, object);
        Ok(Value::Object(object))
    }
}
