use bytes::{Bytes, BytesMut};
use structured_clone::core::*;
use structured_clone::*;

fn encode(heap: &Heap, value: &Value) -> Vec<u8> {
    serialize(heap, value).unwrap().to_vec()
}

fn encode_raw(heap: &Heap, value: &Value) -> Vec<u8> {
    let mut ser = ValueSerializer::new(heap);
    ser.write_header().unwrap();
    ser.write_object(value).unwrap();
    ser.release().to_vec()
}

#[test]
fn test_varint() {
    let cases: &[(u64, &[u8])] = &[
        (0, &[0x00]),
        (1, &[0x01]),
        (127, &[0x7F]),
        (128, &[0x80, 0x01]),
        (300, &[0xAC, 0x02]),
        (u32::MAX as u64, &[0xFF, 0xFF, 0xFF, 0xFF, 0x0F]),
    ];
    for (value, expected) in cases {
        let mut buf = BytesMut::new();
        write_varint(&mut buf, *value);
        assert_eq!(&buf[..], *expected, "encoding {}", value);
        assert_eq!(varint_len(*value), expected.len());

        let mut reader = &buf[..];
        assert_eq!(read_varint(&mut reader).unwrap(), *value);
        assert!(reader.is_empty());
    }
}

#[test]
fn test_varint_truncated() {
    let mut reader: &[u8] = &[0x80, 0x80];
    assert!(matches!(read_varint(&mut reader), Err(Error::InsufficientData)));
}

#[test]
fn test_varint_drops_bits_past_64() {
    // Eleven bytes: everything beyond the 64th bit is ignored.
    let mut data = vec![0xFF; 10];
    data.push(0x01);
    let mut reader = &data[..];
    assert_eq!(read_varint(&mut reader).unwrap(), u64::MAX);
    assert!(reader.is_empty());
}

#[test]
fn test_zigzag() {
    assert_eq!(zigzag_encode(0), 0);
    assert_eq!(zigzag_encode(-1), 1);
    assert_eq!(zigzag_encode(1), 2);
    assert_eq!(zigzag_encode(-2), 3);
    assert_eq!(zigzag_encode(i32::MAX), u32::MAX - 1);
    assert_eq!(zigzag_encode(i32::MIN), u32::MAX);
    for n in [0, 1, -1, 63, -64, 1 << 20, i32::MIN, i32::MAX] {
        assert_eq!(zigzag_decode(zigzag_encode(n)), n);
    }
}

#[test]
fn test_smi_range() {
    assert!(is_smi(SMI_MAX));
    assert!(is_smi(SMI_MIN));
    assert!(!is_smi(SMI_MAX + 1));
    assert!(!is_smi(SMI_MIN - 1));
    assert_eq!(double_as_smi(42.0), Some(42));
    assert_eq!(double_as_smi(-0.0), None);
    assert_eq!(double_as_smi(1.5), None);
    assert_eq!(double_as_smi(f64::NAN), None);
    assert_eq!(double_as_smi(SMI_MAX as f64 + 1.0), None);
}

#[test]
fn test_header() {
    let heap = Heap::new();
    assert_eq!(encode(&heap, &Value::Null), vec![0xFF, 0x0F, 0x30]);
    assert_eq!(encode(&heap, &Value::Undefined), vec![0xFF, 0x0F, 0x5F]);
    assert_eq!(encode(&heap, &Value::Bool(true)), vec![0xFF, 0x0F, 0x54]);
    assert_eq!(encode(&heap, &Value::Bool(false)), vec![0xFF, 0x0F, 0x46]);
}

#[test]
fn test_numbers() {
    let heap = Heap::new();
    assert_eq!(encode(&heap, &Value::Int32(1)), vec![0xFF, 0x0F, 0x49, 0x02]);
    assert_eq!(encode(&heap, &Value::Int32(-1)), vec![0xFF, 0x0F, 0x49, 0x01]);
    // Integral doubles in the small-integer range use the integer form.
    assert_eq!(encode(&heap, &Value::Double(3.0)), vec![0xFF, 0x0F, 0x49, 0x06]);

    let mut expected = vec![0xFF, 0x0F, 0x4E];
    expected.extend_from_slice(&1.5f64.to_ne_bytes());
    assert_eq!(encode(&heap, &Value::Double(1.5)), expected);

    // Int32 values outside the small-integer range are written as doubles.
    let mut expected = vec![0xFF, 0x0F, 0x4E];
    expected.extend_from_slice(&(i32::MAX as f64).to_ne_bytes());
    assert_eq!(encode(&heap, &Value::Int32(i32::MAX)), expected);

    let mut expected = vec![0xFF, 0x0F, 0x4E];
    expected.extend_from_slice(&(-0.0f64).to_ne_bytes());
    assert_eq!(encode(&heap, &Value::Double(-0.0)), expected);
}

#[test]
fn test_bigint_layout() {
    let heap = Heap::new();
    assert_eq!(
        encode(&heap, &Value::BigInt(BigInt::zero())),
        vec![0xFF, 0x0F, 0x5A, 0x00]
    );
    assert_eq!(
        encode(&heap, &Value::BigInt(BigInt::from(255u64))),
        vec![0xFF, 0x0F, 0x5A, 0x10, 0xFF, 0, 0, 0, 0, 0, 0, 0]
    );
    assert_eq!(
        encode(&heap, &Value::BigInt(BigInt::from(-1i64))),
        vec![0xFF, 0x0F, 0x5A, 0x11, 0x01, 0, 0, 0, 0, 0, 0, 0]
    );

    let mut expected = vec![0xFF, 0x0F, 0x5A, 0x20];
    expected.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0]);
    assert_eq!(encode(&heap, &Value::BigInt(BigInt::from(1u128 << 64))), expected);
}

#[test]
fn test_bigint_helpers() {
    let big = BigInt::from(u64::MAX as u128 + 1);
    assert_eq!(bigint_byte_length(&big), 16);
    assert_eq!(bigint_bitfield(&big), 32);

    let negative = BigInt::from(-(1i128 << 70));
    assert_eq!(bigint_bitfield(&negative), 33);

    let mut buf = BytesMut::new();
    write_bigint_contents(&mut buf, &negative);
    let mut reader = &buf[..];
    assert_eq!(read_bigint_contents(&mut reader).unwrap(), negative);
    assert!(reader.is_empty());
    assert_eq!(negative.to_i128(), Some(-(1i128 << 70)));
}

#[test]
fn test_strings() {
    let heap = Heap::new();
    assert_eq!(
        encode(&heap, &Value::from("abc")),
        vec![0xFF, 0x0F, 0x22, 0x03, b'a', b'b', b'c']
    );
    assert_eq!(encode(&heap, &Value::from("")), vec![0xFF, 0x0F, 0x22, 0x00]);
}

#[cfg(target_endian = "little")]
#[test]
fn test_two_byte_string() {
    let heap = Heap::new();
    // Payload starts at offset 4, already even.
    assert_eq!(
        encode(&heap, &Value::from("é")),
        vec![0xFF, 0x0F, 0x63, 0x02, 0xE9, 0x00]
    );
}

#[cfg(target_endian = "little")]
#[test]
fn test_two_byte_string_padding() {
    let mut heap = Heap::new();
    let object = heap.new_object([("ab", Value::from("é"))]);
    assert_eq!(
        encode(&heap, &Value::Object(object)),
        vec![
            0xFF, 0x0F, 0x6F, 0x22, 0x02, b'a', b'b', 0x00, 0x63, 0x02, 0xE9, 0x00, 0x7B, 0x01
        ]
    );
}

#[test]
fn test_non_ascii_after_first_chunk() {
    let heap = Heap::new();
    let mut text = "a".repeat(300);
    text.push('é');
    let bytes = encode(&heap, &Value::from(text.as_str()));
    // Header, padding, tag and a two-byte length put the payload at offset 6.
    assert_eq!(bytes[2], TAG_PADDING);
    assert_eq!(bytes[3], TAG_TWO_BYTE_STRING);
    assert_eq!(bytes.len(), 6 + 301 * 2);
}

#[test]
fn test_force_utf8() {
    let heap = Heap::new();
    let mut ser = ValueSerializer::new(&heap);
    ser.set_force_utf8(true);
    ser.write_header().unwrap();
    ser.write_object(&Value::from("é")).unwrap();
    assert_eq!(ser.release().to_vec(), vec![0xFF, 0x0F, 0x53, 0x02, 0xC3, 0xA9]);
}

#[test]
fn test_object() {
    let mut heap = Heap::new();
    let object = heap.new_object([("a", Value::Int32(1))]);
    assert_eq!(
        encode(&heap, &Value::Object(object)),
        vec![0xFF, 0x0F, 0x6F, 0x22, 0x01, 0x61, 0x49, 0x02, 0x7B, 0x01]
    );
}

#[test]
fn test_object_index_keys_first() {
    let mut heap = Heap::new();
    let object = heap.new_object([("b", Value::Int32(1)), ("2", Value::Int32(2))]);
    assert_eq!(
        encode(&heap, &Value::Object(object)),
        vec![
            0xFF, 0x0F, 0x6F, 0x49, 0x04, 0x49, 0x04, 0x22, 0x01, b'b', 0x49, 0x02, 0x7B, 0x02
        ]
    );
}

#[test]
fn test_self_reference() {
    let mut heap = Heap::new();
    let object = heap.new_object([("prop", Value::from("x"))]);
    heap.set_property(object, "obj", Value::Object(object)).unwrap();

    let mut expected = vec![0xFF, 0x0F, 0x6F];
    expected.extend_from_slice(&[0x22, 0x04, b'p', b'r', b'o', b'p', 0x22, 0x01, b'x']);
    expected.extend_from_slice(&[0x22, 0x03, b'o', b'b', b'j', 0x5E, 0x00]);
    expected.extend_from_slice(&[0x7B, 0x02]);
    assert_eq!(encode(&heap, &Value::Object(object)), expected);
}

#[test]
fn test_shared_reference_ids() {
    let mut heap = Heap::new();
    let inner = heap.new_object(Vec::<(&str, Value)>::new());
    let array = heap.new_array([Value::Object(inner), Value::Object(inner)]);
    assert_eq!(
        encode(&heap, &Value::Object(array)),
        vec![0xFF, 0x0F, 0x41, 0x02, 0x6F, 0x7B, 0x00, 0x5E, 0x01, 0x24, 0x00, 0x02]
    );
}

#[test]
fn test_dense_array() {
    let mut heap = Heap::new();
    let array = heap.new_array([Value::Int32(1), Value::Int32(2), Value::Int32(3)]);
    assert_eq!(
        encode(&heap, &Value::Object(array)),
        vec![0xFF, 0x0F, 0x41, 0x03, 0x49, 0x02, 0x49, 0x04, 0x49, 0x06, 0x24, 0x00, 0x03]
    );
}

#[test]
fn test_sparse_array() {
    let mut heap = Heap::new();
    let array = heap.new_holey_array(3);
    heap.set_property(array, "0", Value::Int32(1)).unwrap();
    heap.set_property(array, "2", Value::Int32(3)).unwrap();
    assert_eq!(
        encode(&heap, &Value::Object(array)),
        vec![
            0xFF, 0x0F, 0x61, 0x03, 0x49, 0x00, 0x49, 0x02, 0x49, 0x04, 0x49, 0x06, 0x40, 0x02,
            0x03
        ]
    );
}

#[test]
fn test_sparse_fallback_reassigns_ids() {
    let mut heap = Heap::new();
    let inner = heap.new_object(Vec::<(&str, Value)>::new());
    let array = heap.new_holey_array(3);
    heap.set_property(array, "0", Value::Object(inner)).unwrap();
    heap.set_property(array, "2", Value::Object(inner)).unwrap();

    // The inner object keeps id 1 after the dense attempt is abandoned.
    assert_eq!(
        encode(&heap, &Value::Object(array)),
        vec![
            0xFF, 0x0F, 0x61, 0x03, 0x49, 0x00, 0x6F, 0x7B, 0x00, 0x49, 0x04, 0x5E, 0x01, 0x40,
            0x02, 0x03
        ]
    );
}

#[test]
fn test_array_properties() {
    let mut heap = Heap::new();
    let array = heap.new_array([Value::Int32(1)]);
    heap.set_property(array, "x", Value::Null).unwrap();
    assert_eq!(
        encode(&heap, &Value::Object(array)),
        vec![0xFF, 0x0F, 0x41, 0x01, 0x49, 0x02, 0x22, 0x01, b'x', 0x30, 0x24, 0x01, 0x01]
    );

    let mut ser = ValueSerializer::new(&heap);
    ser.set_ignore_array_properties(true);
    ser.write_header().unwrap();
    ser.write_object(&Value::Object(array)).unwrap();
    assert_eq!(
        ser.release().to_vec(),
        vec![0xFF, 0x0F, 0x41, 0x01, 0x49, 0x02, 0x24, 0x00, 0x01]
    );
}

#[test]
fn test_map_and_set() {
    let mut heap = Heap::new();
    let map = heap.alloc(HeapObject::Map(vec![(Value::Int32(1), Value::from("a"))]));
    assert_eq!(
        encode(&heap, &Value::Object(map)),
        vec![0xFF, 0x0F, 0x3B, 0x49, 0x02, 0x22, 0x01, b'a', 0x3A, 0x02]
    );

    let set = heap.alloc(HeapObject::Set(vec![Value::Null, Value::Bool(true)]));
    assert_eq!(
        encode(&heap, &Value::Object(set)),
        vec![0xFF, 0x0F, 0x27, 0x30, 0x54, 0x2C, 0x02]
    );
}

#[test]
fn test_regexp() {
    let mut heap = Heap::new();
    let regexp = heap.alloc(HeapObject::RegExp(RegExp {
        pattern: JsString::from("a+"),
        flags: REGEXP_GLOBAL | REGEXP_IGNORE_CASE,
    }));
    assert_eq!(
        encode(&heap, &Value::Object(regexp)),
        vec![0xFF, 0x0F, 0x52, 0x22, 0x02, b'a', b'+', 0x03]
    );
}

#[test]
fn test_error() {
    let mut heap = Heap::new();
    let error = heap.alloc(HeapObject::Error(JsError {
        kind: ErrorKind::TypeError,
        message: Some(JsString::from("bad")),
        stack: None,
        cause: Some(Value::Int32(1)),
    }));
    assert_eq!(
        encode(&heap, &Value::Object(error)),
        vec![
            0xFF, 0x0F, 0x72, b'T', b'm', 0x22, 0x03, b'b', b'a', b'd', b'c', 0x49, 0x02, b'.'
        ]
    );
}

#[test]
fn test_view_with_buffer() {
    let mut heap = Heap::new();
    let buffer = heap.alloc(HeapObject::ArrayBuffer(ArrayBuffer::new(vec![1u8, 2, 3, 4])));
    let view = heap.alloc(HeapObject::View(ArrayBufferView {
        kind: ViewKind::Uint8,
        buffer,
        byte_offset: 1,
        byte_length: 2,
        length_tracking: false,
    }));
    assert_eq!(
        encode_raw(&heap, &Value::Object(view)),
        vec![0xFF, 0x0F, 0x42, 0x04, 1, 2, 3, 4, 0x56, 0x42, 0x01, 0x02, 0x00]
    );
}

#[test]
fn test_view_on_resizable_buffer_flags() {
    let mut heap = Heap::new();
    let buffer = heap.alloc(HeapObject::ArrayBuffer(ArrayBuffer::resizable(vec![0u8; 4], 8)));
    let view = heap.alloc(HeapObject::View(ArrayBufferView {
        kind: ViewKind::Uint16,
        buffer,
        byte_offset: 0,
        byte_length: 4,
        length_tracking: true,
    }));
    assert_eq!(
        encode_raw(&heap, &Value::Object(view)),
        vec![0xFF, 0x0F, 0x7E, 0x04, 0x08, 0, 0, 0, 0, 0x56, 0x57, 0x00, 0x04, 0x03]
    );
}

#[test]
fn test_view_as_host_object() {
    let mut heap = Heap::new();
    let buffer = heap.alloc(HeapObject::ArrayBuffer(ArrayBuffer::new(vec![1u8, 2, 3, 4])));
    let view = heap.alloc(HeapObject::View(ArrayBufferView {
        kind: ViewKind::Uint8,
        buffer,
        byte_offset: 1,
        byte_length: 2,
        length_tracking: false,
    }));
    assert_eq!(
        encode(&heap, &Value::Object(view)),
        vec![0xFF, 0x0F, 0x5C, 0x01, 0x02, 2, 3]
    );
}

#[test]
fn test_release_resets_ids() {
    let mut heap = Heap::new();
    let object = heap.new_object(Vec::<(&str, Value)>::new());
    let mut ser = ValueSerializer::new(&heap);
    ser.write_object(&Value::Object(object)).unwrap();
    assert_eq!(ser.release().to_vec(), vec![0x6F, 0x7B, 0x00]);
    // A new session writes the object in full again.
    ser.write_object(&Value::Object(object)).unwrap();
    assert_eq!(ser.release().to_vec(), vec![0x6F, 0x7B, 0x00]);
}

#[test]
fn test_failed_write_discards_buffer() {
    let mut heap = Heap::new();
    let function = heap.alloc(HeapObject::Unclonable(Unclonable::Function));
    let array = heap.new_array([Value::Int32(1), Value::Object(function)]);

    let mut ser = ValueSerializer::new(&heap);
    ser.write_header().unwrap();
    assert!(matches!(
        ser.write_object(&Value::Object(array)),
        Err(Error::DataClone(_))
    ));
    assert_eq!(ser.position(), 0);
    assert_eq!(ser.release(), Bytes::new());
}

#[test]
fn test_raw_primitives() {
    let heap = Heap::new();
    let mut ser = ValueSerializer::new(&heap);
    ser.write_uint32(300).unwrap();
    ser.write_uint64(1).unwrap();
    ser.write_byte(0xAB).unwrap();
    ser.write_raw_bytes(b"xy").unwrap();
    ser.write_double(2.5).unwrap();
    let bytes = ser.release();

    let mut scratch = Heap::new();
    let mut de = ValueDeserializer::new(bytes, &mut scratch);
    assert!(!de.read_header().unwrap());
    assert_eq!(de.wire_format_version(), 0);
    assert_eq!(de.read_uint32().unwrap(), 300);
    assert_eq!(de.read_uint64().unwrap(), 1);
    assert_eq!(de.read_byte().unwrap(), 0xAB);
    assert_eq!(&de.read_raw_bytes(2).unwrap()[..], b"xy");
    assert_eq!(de.read_double().unwrap(), 2.5);
    assert!(matches!(de.read_byte(), Err(Error::InsufficientData)));
}
