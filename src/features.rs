#[allow(unused_imports)]
use bytes::{Buf, BufMut, Bytes, BytesMut};
#[cfg(feature = "chrono")]
use chrono::{DateTime, Utc};
#[cfg(feature = "serde_json")]
use serde_json::{Map, Number, Value as JsonValue};

#[allow(unused_imports)]
use crate::value::*;
#[allow(unused_imports)]
use crate::*;

// --- serde_json::Value ---
/// Lossy conversion to JSON, following `JSON.stringify`:
///
/// - `undefined`, symbols, functions and host objects become `null`
/// - holes become `null`; named array properties are dropped
/// - Maps, Sets, RegExps, Errors and buffers become `{}`
/// - primitive wrappers are unwrapped; Dates become their time value in milliseconds
#[cfg(feature = "serde_json")]
impl Heap {
    /// # Errors
    /// Returns `Error::Type` for BigInts and cyclic graphs, which JSON cannot represent.
    pub fn to_json(&self, value: &crate::Value) -> Result<JsonValue> {
        self.to_json_inner(value, &mut Vec::new())
    }

    fn to_json_inner(&self, value: &crate::Value, stack: &mut Vec<ObjectRef>) -> Result<JsonValue> {
        match value {
            crate::Value::Undefined | crate::Value::Null | crate::Value::Symbol(_) => {
                Ok(JsonValue::Null)
            }
            crate::Value::Bool(b) => Ok(JsonValue::Bool(*b)),
            crate::Value::Int32(n) => Ok(JsonValue::Number(Number::from(*n))),
            crate::Value::Double(d) => Ok(Number::from_f64(*d).map_or(JsonValue::Null, JsonValue::Number)),
            crate::Value::BigInt(_) => Err(Error::Type(
                "Do not know how to serialize a BigInt".to_string(),
            )),
            crate::Value::String(s) => Ok(JsonValue::String(s.to_string_lossy())),
            crate::Value::Object(object) => {
                if stack.contains(object) {
                    return Err(Error::Type("Converting circular structure to JSON".to_string()));
                }
                stack.push(*object);
                let json = self.object_to_json(*object, stack);
                stack.pop();
                json
            }
        }
    }

    fn object_to_json(&self, object: ObjectRef, stack: &mut Vec<ObjectRef>) -> Result<JsonValue> {
        let Some(heap_object) = self.get(object) else {
            return Ok(JsonValue::Null);
        };
        match heap_object {
            HeapObject::Object(obj) => {
                let mut map = Map::new();
                for key in obj.ordered_keys() {
                    if let Some(value) = obj.properties.get(key) {
                        map.insert(key.to_string_lossy(), self.to_json_inner(value, stack)?);
                    }
                }
                Ok(JsonValue::Object(map))
            }
            HeapObject::Array(arr) => {
                let mut items = Vec::with_capacity(arr.elements.len());
                for index in 0..arr.length {
                    items.push(match arr.elements.get(&index) {
                        Some(value) => self.to_json_inner(value, stack)?,
                        None => JsonValue::Null,
                    });
                }
                Ok(JsonValue::Array(items))
            }
            HeapObject::Date(time) => Ok(Number::from_f64(*time).map_or(JsonValue::Null, JsonValue::Number)),
            HeapObject::Primitive(PrimitiveWrapper::Boolean(b)) => Ok(JsonValue::Bool(*b)),
            HeapObject::Primitive(PrimitiveWrapper::Number(n)) => {
                Ok(Number::from_f64(*n).map_or(JsonValue::Null, JsonValue::Number))
            }
            HeapObject::Primitive(PrimitiveWrapper::String(s)) => {
                Ok(JsonValue::String(s.to_string_lossy()))
            }
            HeapObject::Primitive(PrimitiveWrapper::BigInt(_)) => Err(Error::Type(
                "Do not know how to serialize a BigInt".to_string(),
            )),
            HeapObject::Primitive(PrimitiveWrapper::Symbol(_))
            | HeapObject::Host(_)
            | HeapObject::Unclonable(_) => Ok(JsonValue::Null),
            HeapObject::RegExp(_)
            | HeapObject::Map(_)
            | HeapObject::Set(_)
            | HeapObject::ArrayBuffer(_)
            | HeapObject::SharedArrayBuffer(_)
            | HeapObject::View(_)
            | HeapObject::Error(_) => Ok(JsonValue::Object(Map::new())),
        }
    }

    /// Allocates a value graph for `json`. Integers in the small-integer range become `Int32`.
    pub fn alloc_json(&mut self, json: &JsonValue) -> crate::Value {
        match json {
            JsonValue::Null => crate::Value::Null,
            JsonValue::Bool(b) => crate::Value::Bool(*b),
            JsonValue::Number(n) => match n.as_i64().and_then(|i| i32::try_from(i).ok()) {
                Some(i) if crate::core::is_smi(i) => crate::Value::Int32(i),
                _ => crate::Value::from(n.as_f64().unwrap_or(f64::NAN)),
            },
            JsonValue::String(s) => crate::Value::from(s.as_str()),
            JsonValue::Array(items) => {
                let elements: Vec<crate::Value> = items.iter().map(|item| self.alloc_json(item)).collect();
                crate::Value::Object(self.new_array(elements))
            }
            JsonValue::Object(map) => {
                let properties: Vec<(String, crate::Value)> = map
                    .iter()
                    .map(|(k, v)| (k.clone(), self.alloc_json(v)))
                    .collect();
                crate::Value::Object(self.new_object(properties))
            }
        }
    }
}

// --- chrono::DateTime ---
#[cfg(feature = "chrono")]
impl From<DateTime<Utc>> for HeapObject {
    /// A `Date` with millisecond precision.
    fn from(value: DateTime<Utc>) -> Self {
        HeapObject::Date(value.timestamp_millis() as f64)
    }
}

#[cfg(feature = "chrono")]
impl HeapObject {
    /// The time of a `Date`, or `None` for other objects and invalid dates (`NaN`).
    pub fn as_date_time(&self) -> Option<DateTime<Utc>> {
        match self {
            HeapObject::Date(time) if time.is_finite() => {
                let millis = time.trunc() as i64;
                DateTime::from_timestamp(
                    millis.div_euclid(1000),
                    (millis.rem_euclid(1000) * 1_000_000) as u32,
                )
            }
            _ => None,
        }
    }
}

// --- tokio_util codec ---
/// A decoded frame together with the heap its objects live in.
#[cfg(feature = "codec")]
#[derive(Debug, Clone)]
pub struct Frame {
    pub heap: Heap,
    pub value: crate::Value,
}

/// `tokio_util` codec for the framing envelope of [`SerializerStream`](crate::SerializerStream).
#[cfg(feature = "codec")]
#[derive(Debug, Clone, Default)]
pub struct ValueCodec {
    pub serializer_options: SerializerOptions,
    pub deserializer_options: DeserializerOptions,
}

#[cfg(feature = "codec")]
impl tokio_util::codec::Decoder for ValueCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < MIN_FRAME_SIZE {
            return Ok(None);
        }
        let (body, consumed) = match crate::stream::read_frame(Bytes::copy_from_slice(src)) {
            Ok(frame) => frame,
            Err(Error::InsufficientData) => return Ok(None),
            Err(err) => return Err(err),
        };
        src.advance(consumed);

        let mut heap = Heap::new();
        let value = Deserializer::new(body, &mut heap, self.deserializer_options.clone())?.deserialize()?;
        Ok(Some(Frame { heap, value }))
    }
}

#[cfg(feature = "codec")]
impl<'a> tokio_util::codec::Encoder<&'a Frame> for ValueCodec {
    type Error = Error;

    fn encode(&mut self, item: &'a Frame, dst: &mut BytesMut) -> Result<()> {
        let body = Serializer::new(&item.heap, self.serializer_options.clone()).serialize(&item.value)?;
        dst.put_slice(&crate::stream::frame(&body)?);
        Ok(())
    }
}
