//! In-memory value graph.
//!
//! Primitives live inline in [`Value`]; every composite lives in a [`Heap`] slot and is referred to
//! by an [`ObjectRef`]. Object identity is slot identity, which is what the writer's id table and
//! the reader's back-references are keyed on.

use crate::core::{
    double_as_smi, REGEXP_DOT_ALL, REGEXP_GLOBAL, REGEXP_IGNORE_CASE, REGEXP_MULTILINE,
    REGEXP_STICKY, REGEXP_UNICODE, VIEW_BIGINT64_ARRAY, VIEW_BIGUINT64_ARRAY, VIEW_DATA_VIEW,
    VIEW_FLOAT16_ARRAY, VIEW_FLOAT32_ARRAY, VIEW_FLOAT64_ARRAY, VIEW_INT16_ARRAY, VIEW_INT32_ARRAY,
    VIEW_INT8_ARRAY, VIEW_UINT16_ARRAY, VIEW_UINT32_ARRAY, VIEW_UINT8_ARRAY,
    VIEW_UINT8_CLAMPED_ARRAY,
};
use crate::{Error, Result};
use bytes::Bytes;
use indexmap::IndexMap;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// A JavaScript string: a sequence of UTF-16 code units, possibly containing lone surrogates.
#[derive(Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JsString(Vec<u16>);

impl JsString {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Wraps raw UTF-16 code units without validation.
    pub fn from_code_units(units: Vec<u16>) -> Self {
        Self(units)
    }

    /// Decodes Latin-1 bytes (each byte is one code unit).
    pub fn from_latin1(bytes: &[u8]) -> Self {
        Self(bytes.iter().map(|&b| b as u16).collect())
    }

    pub fn as_code_units(&self) -> &[u16] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns true if every code unit is ASCII.
    pub fn is_ascii(&self) -> bool {
        self.0.iter().all(|&u| u < 0x80)
    }

    /// Converts to a Rust string, replacing lone surrogates with U+FFFD.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf16_lossy(&self.0)
    }

    /// Returns the array index this string names, if it is a canonical index
    /// (`"0"`, `"17"`, but not `"017"` or `"4294967295"`).
    pub fn as_array_index(&self) -> Option<u32> {
        let units = &self.0;
        if units.is_empty() || units.len() > 10 {
            return None;
        }
        if units.len() > 1 && units[0] == b'0' as u16 {
            return None;
        }
        let mut value: u64 = 0;
        for &unit in units {
            if !(b'0' as u16..=b'9' as u16).contains(&unit) {
                return None;
            }
            value = value * 10 + (unit - b'0' as u16) as u64;
        }
        // 2^32 - 1 is a valid property name but not an array index.
        if value >= u32::MAX as u64 {
            return None;
        }
        Some(value as u32)
    }

    /// Converts a number used as a property key to the string `Number.prototype.toString` gives.
    pub fn from_number_key(value: f64) -> Self {
        Self::from(number_to_string(value))
    }
}

/// Formats a number the way JavaScript does: shortest round-trip digits, exponent notation
/// below `1e-6` and from `1e21` up.
fn number_to_string(value: f64) -> String {
    if value.is_nan() {
        return "NaN".to_string();
    }
    if value.is_infinite() {
        return if value > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if value == 0.0 {
        return "0".to_string();
    }

    let sign = if value < 0.0 { "-" } else { "" };
    // `{:e}` yields the shortest digits, e.g. "1.2345e-7".
    let scientific = format!("{:e}", value.abs());
    let Some((mantissa, exponent)) = scientific.split_once('e') else {
        return format!("{}{}", sign, value.abs());
    };
    let Ok(exponent) = exponent.parse::<i32>() else {
        return format!("{}{}", sign, value.abs());
    };
    let digits: String = mantissa.chars().filter(|c| *c != '.').collect();
    let k = digits.len() as i32;
    // value = 0.digits * 10^n
    let n = exponent + 1;

    let body = if k <= n && n <= 21 {
        format!("{}{}", digits, "0".repeat((n - k) as usize))
    } else if 0 < n && n <= 21 {
        let (int, frac) = digits.split_at(n as usize);
        format!("{}.{}", int, frac)
    } else if -6 < n && n <= 0 {
        format!("0.{}{}", "0".repeat((-n) as usize), digits)
    } else {
        let (first, rest) = digits.split_at(1);
        let fraction = if rest.is_empty() {
            String::new()
        } else {
            format!(".{}", rest)
        };
        let exponent_sign = if n - 1 < 0 { '-' } else { '+' };
        format!("{}{}e{}{}", first, fraction, exponent_sign, (n - 1).abs())
    };
    format!("{}{}", sign, body)
}

impl From<&str> for JsString {
    fn from(value: &str) -> Self {
        Self(value.encode_utf16().collect())
    }
}

impl From<String> for JsString {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

impl From<u32> for JsString {
    fn from(value: u32) -> Self {
        Self::from(value.to_string())
    }
}

impl PartialEq<&str> for JsString {
    fn eq(&self, other: &&str) -> bool {
        self.0.iter().copied().eq(other.encode_utf16())
    }
}

impl fmt::Display for JsString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string_lossy())
    }
}

impl fmt::Debug for JsString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.to_string_lossy())
    }
}

/// Arbitrary-precision integer in sign-and-magnitude form.
///
/// The magnitude is little-endian with no trailing zero bytes; zero is never negative.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct BigInt {
    negative: bool,
    magnitude: Vec<u8>,
}

impl BigInt {
    pub fn zero() -> Self {
        Self::default()
    }

    /// Builds a BigInt from a sign and little-endian magnitude bytes.
    pub fn from_le_bytes(negative: bool, magnitude: &[u8]) -> Self {
        let len = magnitude
            .iter()
            .rposition(|&b| b != 0)
            .map_or(0, |last| last + 1);
        let magnitude = magnitude[..len].to_vec();
        Self {
            negative: negative && !magnitude.is_empty(),
            magnitude,
        }
    }

    pub fn is_negative(&self) -> bool {
        self.negative
    }

    pub fn is_zero(&self) -> bool {
        self.magnitude.is_empty()
    }

    /// Little-endian magnitude bytes, without padding.
    pub fn magnitude(&self) -> &[u8] {
        &self.magnitude
    }

    /// Returns the value as an `i128` if it fits.
    pub fn to_i128(&self) -> Option<i128> {
        if self.magnitude.len() > 16 {
            return None;
        }
        let mut buf = [0u8; 16];
        buf[..self.magnitude.len()].copy_from_slice(&self.magnitude);
        let magnitude = u128::from_le_bytes(buf);
        if self.negative {
            if magnitude == 1u128 << 127 {
                Some(i128::MIN)
            } else {
                i128::try_from(magnitude).ok().map(|m| -m)
            }
        } else {
            i128::try_from(magnitude).ok()
        }
    }
}

impl From<u128> for BigInt {
    fn from(value: u128) -> Self {
        Self::from_le_bytes(false, &value.to_le_bytes())
    }
}

impl From<i128> for BigInt {
    fn from(value: i128) -> Self {
        Self::from_le_bytes(value < 0, &value.unsigned_abs().to_le_bytes())
    }
}

impl From<u64> for BigInt {
    fn from(value: u64) -> Self {
        Self::from(value as u128)
    }
}

impl From<i64> for BigInt {
    fn from(value: i64) -> Self {
        Self::from(value as i128)
    }
}

impl From<i32> for BigInt {
    fn from(value: i32) -> Self {
        Self::from(value as i128)
    }
}

/// Index of a composite value in a [`Heap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef(usize);

impl ObjectRef {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A JavaScript value.
///
/// Equality follows `SameValue` for numbers (`NaN` equals `NaN`, `-0` differs from `+0`, and
/// `Int32(n)` equals `Double(n)`); objects compare by identity.
#[derive(Debug, Clone)]
pub enum Value {
    Undefined,
    Null,
    Bool(bool),
    Int32(i32),
    Double(f64),
    BigInt(BigInt),
    String(JsString),
    /// Symbols can be held but never cloned.
    Symbol(Option<JsString>),
    Object(ObjectRef),
}

impl Value {
    /// Numeric value of `Int32` and `Double`.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Int32(n) => Some(*n as f64),
            Value::Double(d) => Some(*d),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&JsString> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<ObjectRef> {
        match self {
            Value::Object(r) => Some(*r),
            _ => None,
        }
    }

    pub fn from_u32(value: u32) -> Self {
        match i32::try_from(value) {
            Ok(n) => Value::Int32(n),
            Err(_) => Value::Double(value as f64),
        }
    }
}

fn same_value(a: f64, b: f64) -> bool {
    if a.is_nan() && b.is_nan() {
        return true;
    }
    a == b && a.is_sign_negative() == b.is_sign_negative()
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::BigInt(a), Value::BigInt(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            _ => match (self.as_number(), other.as_number()) {
                (Some(a), Some(b)) => same_value(a, b),
                _ => false,
            },
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Int32(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        match double_as_smi(value) {
            Some(n) => Value::Int32(n),
            None => Value::Double(value),
        }
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(JsString::from(value))
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(JsString::from(value))
    }
}

impl From<JsString> for Value {
    fn from(value: JsString) -> Self {
        Value::String(value)
    }
}

impl From<BigInt> for Value {
    fn from(value: BigInt) -> Self {
        Value::BigInt(value)
    }
}

impl From<ObjectRef> for Value {
    fn from(value: ObjectRef) -> Self {
        Value::Object(value)
    }
}

/// A plain object: own enumerable string-keyed properties in insertion order.
#[derive(Debug, Clone, Default)]
pub struct JsObject {
    pub properties: IndexMap<JsString, Value>,
}

impl JsObject {
    /// Property keys in the engine's own-key order: array indices ascending, then names in
    /// insertion order.
    pub fn ordered_keys(&self) -> Vec<&JsString> {
        let mut indices: Vec<(u32, &JsString)> = self
            .properties
            .keys()
            .filter_map(|k| k.as_array_index().map(|i| (i, k)))
            .collect();
        indices.sort_by_key(|(i, _)| *i);
        indices
            .into_iter()
            .map(|(_, k)| k)
            .chain(self.properties.keys().filter(|k| k.as_array_index().is_none()))
            .collect()
    }
}

/// An array. Missing entries below `length` are holes.
#[derive(Debug, Clone, Default)]
pub struct JsArray {
    pub length: u32,
    pub elements: BTreeMap<u32, Value>,
    /// Non-index named properties.
    pub properties: IndexMap<JsString, Value>,
}

impl JsArray {
    pub fn is_dense(&self) -> bool {
        self.elements.len() as u64 == self.length as u64
    }

    /// Sets an element, growing `length` past `index` like an assignment would.
    pub fn set(&mut self, index: u32, value: Value) {
        if index >= self.length {
            self.length = index + 1;
        }
        self.elements.insert(index, value);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RegExp {
    pub pattern: JsString,
    /// Flag bits; unknown bits are kept verbatim.
    pub flags: u32,
}

impl RegExp {
    /// Renders the known flag bits in `gimyus` order.
    pub fn flag_string(&self) -> String {
        [
            (REGEXP_GLOBAL, 'g'),
            (REGEXP_IGNORE_CASE, 'i'),
            (REGEXP_MULTILINE, 'm'),
            (REGEXP_STICKY, 'y'),
            (REGEXP_UNICODE, 'u'),
            (REGEXP_DOT_ALL, 's'),
        ]
        .iter()
        .filter(|(bit, _)| self.flags & bit != 0)
        .map(|(_, c)| *c)
        .collect()
    }
}

/// Boxed primitive (`new Number(1)`, `Object(1n)`, ...).
#[derive(Debug, Clone)]
pub enum PrimitiveWrapper {
    Boolean(bool),
    Number(f64),
    BigInt(BigInt),
    String(JsString),
    /// `Object(Symbol())`; never clonable.
    Symbol(Option<JsString>),
}

#[derive(Debug, Clone, Default)]
pub struct ArrayBuffer {
    pub data: Bytes,
    /// `Some` for resizable buffers.
    pub max_byte_length: Option<usize>,
}

impl ArrayBuffer {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            max_byte_length: None,
        }
    }

    pub fn resizable(data: impl Into<Bytes>, max_byte_length: usize) -> Self {
        Self {
            data: data.into(),
            max_byte_length: Some(max_byte_length),
        }
    }

    pub fn is_resizable(&self) -> bool {
        self.max_byte_length.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SharedArrayBuffer {
    pub data: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewKind {
    Int8,
    Uint8,
    Uint8Clamped,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Float16,
    Float32,
    Float64,
    BigInt64,
    BigUint64,
    DataView,
}

impl ViewKind {
    pub fn element_size(self) -> usize {
        match self {
            ViewKind::Int8 | ViewKind::Uint8 | ViewKind::Uint8Clamped | ViewKind::DataView => 1,
            ViewKind::Int16 | ViewKind::Uint16 | ViewKind::Float16 => 2,
            ViewKind::Int32 | ViewKind::Uint32 | ViewKind::Float32 => 4,
            ViewKind::Float64 | ViewKind::BigInt64 | ViewKind::BigUint64 => 8,
        }
    }

    /// Subtag written after `TAG_ARRAY_BUFFER_VIEW`.
    pub fn tag(self) -> u8 {
        match self {
            ViewKind::Int8 => VIEW_INT8_ARRAY,
            ViewKind::Uint8 => VIEW_UINT8_ARRAY,
            ViewKind::Uint8Clamped => VIEW_UINT8_CLAMPED_ARRAY,
            ViewKind::Int16 => VIEW_INT16_ARRAY,
            ViewKind::Uint16 => VIEW_UINT16_ARRAY,
            ViewKind::Int32 => VIEW_INT32_ARRAY,
            ViewKind::Uint32 => VIEW_UINT32_ARRAY,
            ViewKind::Float16 => VIEW_FLOAT16_ARRAY,
            ViewKind::Float32 => VIEW_FLOAT32_ARRAY,
            ViewKind::Float64 => VIEW_FLOAT64_ARRAY,
            ViewKind::BigInt64 => VIEW_BIGINT64_ARRAY,
            ViewKind::BigUint64 => VIEW_BIGUINT64_ARRAY,
            ViewKind::DataView => VIEW_DATA_VIEW,
        }
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        let tag = u8::try_from(tag).ok()?;
        Some(match tag {
            VIEW_INT8_ARRAY => ViewKind::Int8,
            VIEW_UINT8_ARRAY => ViewKind::Uint8,
            VIEW_UINT8_CLAMPED_ARRAY => ViewKind::Uint8Clamped,
            VIEW_INT16_ARRAY => ViewKind::Int16,
            VIEW_UINT16_ARRAY => ViewKind::Uint16,
            VIEW_INT32_ARRAY => ViewKind::Int32,
            VIEW_UINT32_ARRAY => ViewKind::Uint32,
            VIEW_FLOAT16_ARRAY => ViewKind::Float16,
            VIEW_FLOAT32_ARRAY => ViewKind::Float32,
            VIEW_FLOAT64_ARRAY => ViewKind::Float64,
            VIEW_BIGINT64_ARRAY => ViewKind::BigInt64,
            VIEW_BIGUINT64_ARRAY => ViewKind::BigUint64,
            VIEW_DATA_VIEW => ViewKind::DataView,
            _ => return None,
        })
    }

    /// Type index used by Node's host-object view format. `Float16` has none.
    pub fn host_index(self) -> Option<u32> {
        Some(match self {
            ViewKind::Int8 => 0,
            ViewKind::Uint8 => 1,
            ViewKind::Uint8Clamped => 2,
            ViewKind::Int16 => 3,
            ViewKind::Uint16 => 4,
            ViewKind::Int32 => 5,
            ViewKind::Uint32 => 6,
            ViewKind::Float32 => 7,
            ViewKind::Float64 => 8,
            ViewKind::DataView => 9,
            ViewKind::BigInt64 => 11,
            ViewKind::BigUint64 => 12,
            ViewKind::Float16 => return None,
        })
    }

    /// Inverse of [`host_index`](Self::host_index). Index 10 (Node's `FastBuffer`) maps to `Uint8`.
    pub fn from_host_index(index: u32) -> Option<Self> {
        Some(match index {
            0 => ViewKind::Int8,
            1 | 10 => ViewKind::Uint8,
            2 => ViewKind::Uint8Clamped,
            3 => ViewKind::Int16,
            4 => ViewKind::Uint16,
            5 => ViewKind::Int32,
            6 => ViewKind::Uint32,
            7 => ViewKind::Float32,
            8 => ViewKind::Float64,
            9 => ViewKind::DataView,
            11 => ViewKind::BigInt64,
            12 => ViewKind::BigUint64,
            _ => return None,
        })
    }
}

/// A typed array or `DataView` over an `ArrayBuffer` or `SharedArrayBuffer` in the same heap.
#[derive(Debug, Clone)]
pub struct ArrayBufferView {
    pub kind: ViewKind,
    pub buffer: ObjectRef,
    pub byte_offset: usize,
    pub byte_length: usize,
    pub length_tracking: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ErrorKind {
    #[default]
    Error,
    EvalError,
    RangeError,
    ReferenceError,
    SyntaxError,
    TypeError,
    UriError,
}

impl ErrorKind {
    /// Maps an error's `name` to its kind. Unknown names map to `Error`.
    pub fn from_name(name: &str) -> Self {
        match name {
            "EvalError" => ErrorKind::EvalError,
            "RangeError" => ErrorKind::RangeError,
            "ReferenceError" => ErrorKind::ReferenceError,
            "SyntaxError" => ErrorKind::SyntaxError,
            "TypeError" => ErrorKind::TypeError,
            "URIError" => ErrorKind::UriError,
            _ => ErrorKind::Error,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ErrorKind::Error => "Error",
            ErrorKind::EvalError => "EvalError",
            ErrorKind::RangeError => "RangeError",
            ErrorKind::ReferenceError => "ReferenceError",
            ErrorKind::SyntaxError => "SyntaxError",
            ErrorKind::TypeError => "TypeError",
            ErrorKind::UriError => "URIError",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct JsError {
    pub kind: ErrorKind,
    pub message: Option<JsString>,
    pub stack: Option<JsString>,
    pub cause: Option<Value>,
}

/// An embedder-defined object. Its bytes are produced and consumed by a delegate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostObject {
    pub tag: u32,
    pub data: Bytes,
}

/// Objects that exist in the graph but can never be cloned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unclonable {
    Function,
    Promise,
    WeakMap,
    WeakSet,
    WeakRef,
}

#[derive(Debug, Clone)]
pub enum HeapObject {
    Object(JsObject),
    Array(JsArray),
    /// Milliseconds since the epoch.
    Date(f64),
    RegExp(RegExp),
    Primitive(PrimitiveWrapper),
    Map(Vec<(Value, Value)>),
    Set(Vec<Value>),
    ArrayBuffer(ArrayBuffer),
    SharedArrayBuffer(SharedArrayBuffer),
    View(ArrayBufferView),
    Error(JsError),
    Host(HostObject),
    Unclonable(Unclonable),
}

impl HeapObject {
    pub fn kind_name(&self) -> &'static str {
        match self {
            HeapObject::Object(_) => "Object",
            HeapObject::Array(_) => "Array",
            HeapObject::Date(_) => "Date",
            HeapObject::RegExp(_) => "RegExp",
            HeapObject::Primitive(_) => "primitive wrapper",
            HeapObject::Map(_) => "Map",
            HeapObject::Set(_) => "Set",
            HeapObject::ArrayBuffer(_) => "ArrayBuffer",
            HeapObject::SharedArrayBuffer(_) => "SharedArrayBuffer",
            HeapObject::View(_) => "ArrayBufferView",
            HeapObject::Error(_) => "Error",
            HeapObject::Host(_) => "host object",
            HeapObject::Unclonable(Unclonable::Function) => "function",
            HeapObject::Unclonable(Unclonable::Promise) => "Promise",
            HeapObject::Unclonable(Unclonable::WeakMap) => "WeakMap",
            HeapObject::Unclonable(Unclonable::WeakSet) => "WeakSet",
            HeapObject::Unclonable(Unclonable::WeakRef) => "WeakRef",
        }
    }
}

/// Arena owning every composite value of a graph.
#[derive(Debug, Clone, Default)]
pub struct Heap {
    objects: Vec<HeapObject>,
}

impl Heap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, object: HeapObject) -> ObjectRef {
        self.objects.push(object);
        ObjectRef(self.objects.len() - 1)
    }

    pub fn get(&self, object: ObjectRef) -> Option<&HeapObject> {
        self.objects.get(object.0)
    }

    pub fn get_mut(&mut self, object: ObjectRef) -> Option<&mut HeapObject> {
        self.objects.get_mut(object.0)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Drops every object allocated after the first `len`.
    pub(crate) fn truncate(&mut self, len: usize) {
        self.objects.truncate(len);
    }

    /// Allocates a plain object with the given properties.
    pub fn new_object<K, I>(&mut self, properties: I) -> ObjectRef
    where
        K: Into<JsString>,
        I: IntoIterator<Item = (K, Value)>,
    {
        let properties = properties
            .into_iter()
            .map(|(k, v)| (k.into(), v))
            .collect();
        self.alloc(HeapObject::Object(JsObject { properties }))
    }

    /// Allocates a dense array holding `elements`.
    pub fn new_array<I>(&mut self, elements: I) -> ObjectRef
    where
        I: IntoIterator<Item = Value>,
    {
        let elements: BTreeMap<u32, Value> = elements
            .into_iter()
            .enumerate()
            .map(|(i, v)| (i as u32, v))
            .collect();
        self.alloc(HeapObject::Array(JsArray {
            length: elements.len() as u32,
            elements,
            properties: IndexMap::new(),
        }))
    }

    /// Allocates an array of `length` holes.
    pub fn new_holey_array(&mut self, length: u32) -> ObjectRef {
        self.alloc(HeapObject::Array(JsArray {
            length,
            ..JsArray::default()
        }))
    }

    /// Sets a property on an object or array. Index keys on arrays become elements.
    ///
    /// # Errors
    /// Returns `Error::Type` if `object` is not an object or array.
    pub fn set_property(
        &mut self,
        object: ObjectRef,
        key: impl Into<JsString>,
        value: Value,
    ) -> Result<()> {
        let key = key.into();
        match self.objects.get_mut(object.0) {
            Some(HeapObject::Object(obj)) => {
                obj.properties.insert(key, value);
                Ok(())
            }
            Some(HeapObject::Array(arr)) => {
                match key.as_array_index() {
                    Some(index) => arr.set(index, value),
                    None => {
                        arr.properties.insert(key, value);
                    }
                }
                Ok(())
            }
            Some(other) => Err(Error::Type(format!(
                "Cannot set property {:?} on {}",
                key,
                other.kind_name()
            ))),
            None => Err(Error::Type(format!("Dangling object reference {:?}", object))),
        }
    }

    /// Looks up an own property of an object or array.
    pub fn get_property(&self, object: ObjectRef, key: &str) -> Option<&Value> {
        let key = JsString::from(key);
        match self.get(object)? {
            HeapObject::Object(obj) => obj.properties.get(&key),
            HeapObject::Array(arr) => match key.as_array_index() {
                Some(index) => arr.elements.get(&index),
                None => arr.properties.get(&key),
            },
            _ => None,
        }
    }

    /// Bytes of an `ArrayBuffer` or `SharedArrayBuffer`.
    pub fn buffer_data(&self, buffer: ObjectRef) -> Option<&Bytes> {
        match self.get(buffer)? {
            HeapObject::ArrayBuffer(b) => Some(&b.data),
            HeapObject::SharedArrayBuffer(b) => Some(&b.data),
            _ => None,
        }
    }

    /// The bytes a view covers, or `None` if it is not a view or is out of bounds.
    pub fn view_bytes(&self, view: ObjectRef) -> Option<Bytes> {
        let HeapObject::View(view) = self.get(view)? else {
            return None;
        };
        let data = self.buffer_data(view.buffer)?;
        let end = view.byte_offset.checked_add(view.byte_length)?;
        if end > data.len() {
            return None;
        }
        Some(data.slice(view.byte_offset..end))
    }

    /// Deep structural equality between `a` in this heap and `b` in `other`.
    ///
    /// Objects are matched one-to-one, so shared references and cycles must have the same shape
    /// on both sides. Views compare by kind and viewed bytes only, so a view's buffer may differ,
    /// as it does after writing views as host objects. Use
    /// [`graph_eq_with_buffers`](Self::graph_eq_with_buffers) to also check which views share a
    /// buffer.
    pub fn graph_eq(&self, a: &Value, other: &Heap, b: &Value) -> bool {
        GraphEq::new(self, other, false).values(a, b)
    }

    /// Like [`graph_eq`](Self::graph_eq), but views must also have the same offsets and their
    /// buffers are matched one-to-one with the rest of the graph.
    pub fn graph_eq_with_buffers(&self, a: &Value, other: &Heap, b: &Value) -> bool {
        GraphEq::new(self, other, true).values(a, b)
    }
}

struct GraphEq<'a> {
    left: &'a Heap,
    right: &'a Heap,
    buffer_identity: bool,
    forward: HashMap<ObjectRef, ObjectRef>,
    backward: HashMap<ObjectRef, ObjectRef>,
}

impl<'a> GraphEq<'a> {
    fn new(left: &'a Heap, right: &'a Heap, buffer_identity: bool) -> Self {
        Self {
            left,
            right,
            buffer_identity,
            forward: HashMap::new(),
            backward: HashMap::new(),
        }
    }

    fn values(&mut self, a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Object(a), Value::Object(b)) => self.objects(*a, *b),
            (Value::Object(_), _) | (_, Value::Object(_)) => false,
            _ => a == b,
        }
    }

    fn objects(&mut self, a: ObjectRef, b: ObjectRef) -> bool {
        match (self.forward.get(&a), self.backward.get(&b)) {
            (Some(mapped), _) => return *mapped == b,
            (None, Some(_)) => return false,
            (None, None) => {}
        }
        self.forward.insert(a, b);
        self.backward.insert(b, a);

        let (left_heap, right_heap) = (self.left, self.right);
        let (Some(left), Some(right)) = (left_heap.get(a), right_heap.get(b)) else {
            return false;
        };
        match (left, right) {
            (HeapObject::Object(x), HeapObject::Object(y)) => {
                self.properties(&x.properties, &y.properties)
            }
            (HeapObject::Array(x), HeapObject::Array(y)) => {
                x.length == y.length
                    && x.elements.len() == y.elements.len()
                    && x.elements.iter().all(|(i, v)| match y.elements.get(i) {
                        Some(w) => self.values(v, w),
                        None => false,
                    })
                    && self.properties(&x.properties, &y.properties)
            }
            (HeapObject::Date(x), HeapObject::Date(y)) => same_value(*x, *y),
            (HeapObject::RegExp(x), HeapObject::RegExp(y)) => x == y,
            (HeapObject::Primitive(x), HeapObject::Primitive(y)) => match (x, y) {
                (PrimitiveWrapper::Boolean(p), PrimitiveWrapper::Boolean(q)) => p == q,
                (PrimitiveWrapper::Number(p), PrimitiveWrapper::Number(q)) => same_value(*p, *q),
                (PrimitiveWrapper::BigInt(p), PrimitiveWrapper::BigInt(q)) => p == q,
                (PrimitiveWrapper::String(p), PrimitiveWrapper::String(q)) => p == q,
                (PrimitiveWrapper::Symbol(p), PrimitiveWrapper::Symbol(q)) => p == q,
                _ => false,
            },
            (HeapObject::Map(x), HeapObject::Map(y)) => {
                x.len() == y.len()
                    && x
                        .iter()
                        .zip(y)
                        .all(|((k1, v1), (k2, v2))| self.values(k1, k2) && self.values(v1, v2))
            }
            (HeapObject::Set(x), HeapObject::Set(y)) => {
                x.len() == y.len() && x.iter().zip(y).all(|(v, w)| self.values(v, w))
            }
            (HeapObject::ArrayBuffer(x), HeapObject::ArrayBuffer(y)) => {
                x.data == y.data && x.max_byte_length == y.max_byte_length
            }
            (HeapObject::SharedArrayBuffer(x), HeapObject::SharedArrayBuffer(y)) => x == y,
            (HeapObject::View(x), HeapObject::View(y)) if self.buffer_identity => {
                x.kind == y.kind
                    && x.length_tracking == y.length_tracking
                    && x.byte_offset == y.byte_offset
                    && x.byte_length == y.byte_length
                    && self.objects(x.buffer, y.buffer)
            }
            (HeapObject::View(x), HeapObject::View(y)) => {
                x.kind == y.kind
                    && x.length_tracking == y.length_tracking
                    && left_heap.view_bytes(a).is_some()
                    && left_heap.view_bytes(a) == right_heap.view_bytes(b)
            }
            (HeapObject::Error(x), HeapObject::Error(y)) => {
                x.kind == y.kind
                    && x.message == y.message
                    && x.stack == y.stack
                    && match (&x.cause, &y.cause) {
                        (Some(p), Some(q)) => self.values(p, q),
                        (None, None) => true,
                        _ => false,
                    }
            }
            (HeapObject::Host(x), HeapObject::Host(y)) => x == y,
            (HeapObject::Unclonable(x), HeapObject::Unclonable(y)) => x == y,
            _ => false,
        }
    }

    fn properties(
        &mut self,
        x: &IndexMap<JsString, Value>,
        y: &IndexMap<JsString, Value>,
    ) -> bool {
        x.len() == y.len()
            && x.iter().all(|(k, v)| match y.get(k) {
                Some(w) => self.values(v, w),
                None => false,
            })
    }
}
