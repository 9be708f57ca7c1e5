use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use structured_clone::serdes::{read_array_buffer_view_host_object, write_array_buffer_view_host_object};
use structured_clone::*;

const PORT_TAG: u32 = 1000;

/// Writes `Host` objects and objects with a `__port` property as ports, views in Node's format.
#[derive(Default)]
struct PortWriter {
    shared: Vec<Bytes>,
    shared_ids: HashMap<ObjectRef, u32>,
    reallocations: usize,
}

impl SerializerDelegate for PortWriter {
    fn has_custom_host_objects(&self) -> bool {
        true
    }

    fn is_host_object(&mut self, heap: &Heap, object: ObjectRef) -> Result<bool> {
        Ok(heap.get_property(object, "__port").is_some())
    }

    fn write_host_object(ser: &mut ValueSerializer<'_, Self>, object: ObjectRef) -> Result<()> {
        let heap = ser.heap();
        match heap.get(object) {
            Some(HeapObject::Host(host)) => {
                ser.write_uint32(PORT_TAG)?;
                ser.write_uint32(host.tag)?;
                ser.write_uint32(host.data.len() as u32)?;
                ser.write_raw_bytes(&host.data)
            }
            Some(HeapObject::Object(_)) => {
                let Some(port) = heap.get_property(object, "__port").and_then(Value::as_number) else {
                    return Err(Error::DataClone("port number must be a number".to_string()));
                };
                ser.write_uint32(PORT_TAG)?;
                ser.write_uint32(port as u32)?;
                ser.write_uint32(0)
            }
            _ => write_array_buffer_view_host_object(ser, object),
        }
    }

    fn get_shared_array_buffer_id(&mut self, heap: &Heap, buffer: ObjectRef) -> Result<u32> {
        if let Some(id) = self.shared_ids.get(&buffer) {
            return Ok(*id);
        }
        let Some(data) = heap.buffer_data(buffer) else {
            return Err(Error::DataClone("not a buffer".to_string()));
        };
        let id = self.shared.len() as u32;
        self.shared.push(data.clone());
        self.shared_ids.insert(buffer, id);
        Ok(id)
    }

    fn reallocate_buffer_memory(&mut self, mut buffer: BytesMut, size: usize) -> Result<BytesMut> {
        self.reallocations += 1;
        buffer.reserve(size - buffer.len());
        Ok(buffer)
    }
}

#[derive(Default)]
struct PortReader {
    shared: Vec<Bytes>,
    message_buffer: Option<ObjectRef>,
}

impl DeserializerDelegate for PortReader {
    fn read_host_object(de: &mut ValueDeserializer<'_, Self>) -> Result<ObjectRef> {
        let tag = de.read_uint32()?;
        if tag == PORT_TAG {
            let port = de.read_uint32()?;
            let length = de.read_uint32()? as usize;
            let data = de.read_raw_bytes(length)?;
            return Ok(de.heap_mut().alloc(HeapObject::Host(HostObject { tag: port, data })));
        }
        let mut message_buffer = de.delegate_mut().message_buffer.take();
        let result = read_array_buffer_view_host_object(de, tag, &mut message_buffer);
        de.delegate_mut().message_buffer = message_buffer;
        result
    }

    fn get_shared_array_buffer_from_id(&mut self, id: u32) -> Result<SharedArrayBuffer> {
        self.shared
            .get(id as usize)
            .map(|data| SharedArrayBuffer { data: data.clone() })
            .ok_or_else(|| Error::Delegate(format!("unknown shared buffer {}", id)))
    }
}

fn write_with_ports(heap: &Heap, value: &Value, options: SerializerOptions) -> (Bytes, PortWriter) {
    let mut ser = Serializer::with_delegate(heap, PortWriter::default(), options);
    let bytes = ser.serialize(value).unwrap();
    let delegate = std::mem::take(ser.inner_mut().delegate_mut());
    (bytes, delegate)
}

fn read_with_ports(bytes: Bytes, shared: Vec<Bytes>) -> (Heap, Value) {
    let mut heap = Heap::new();
    let reader = PortReader {
        shared,
        ..PortReader::default()
    };
    let value = Deserializer::with_delegate(bytes, &mut heap, reader, DeserializerOptions::default())
        .unwrap()
        .deserialize()
        .unwrap();
    (heap, value)
}

#[test]
fn test_host_objects() {
    let mut heap = Heap::new();
    let port = heap.alloc(HeapObject::Host(HostObject {
        tag: 3,
        data: Bytes::from_static(b"abc"),
    }));
    let marked = heap.new_object([("__port", Value::Int32(5))]);
    let buffer = heap.alloc(HeapObject::ArrayBuffer(ArrayBuffer::new(vec![1u8, 2, 3, 4])));
    let view = heap.alloc(HeapObject::View(ArrayBufferView {
        kind: ViewKind::Uint8,
        buffer,
        byte_offset: 1,
        byte_length: 3,
        length_tracking: false,
    }));
    let root = heap.new_array([
        Value::Object(port),
        Value::Object(marked),
        Value::Object(view),
        Value::Object(port),
    ]);

    let (bytes, _) = write_with_ports(&heap, &Value::Object(root), SerializerOptions::default());
    let (decoded, value) = read_with_ports(bytes, Vec::new());
    let array = value.as_object().unwrap();

    let first = decoded.get_property(array, "0").unwrap().as_object().unwrap();
    match decoded.get(first) {
        Some(HeapObject::Host(host)) => {
            assert_eq!(host.tag, 3);
            assert_eq!(&host.data[..], b"abc");
        }
        other => panic!("expected a host object, got {:?}", other),
    }
    assert_eq!(decoded.get_property(array, "3"), Some(&Value::Object(first)));

    let second = decoded.get_property(array, "1").unwrap().as_object().unwrap();
    assert!(matches!(
        decoded.get(second),
        Some(HeapObject::Host(HostObject { tag: 5, .. }))
    ));

    let view = decoded.get_property(array, "2").unwrap().as_object().unwrap();
    assert_eq!(&decoded.view_bytes(view).unwrap()[..], &[2, 3, 4]);
}

#[test]
fn test_host_object_check_is_gated() {
    struct Strict;
    impl SerializerDelegate for Strict {
        fn is_host_object(&mut self, _heap: &Heap, _object: ObjectRef) -> Result<bool> {
            panic!("is_host_object called without custom host objects");
        }
    }

    let mut heap = Heap::new();
    let object = heap.new_object([("__port", Value::Int32(5))]);
    let mut ser = ValueSerializer::with_delegate(&heap, Strict);
    ser.write_header().unwrap();
    ser.write_object(&Value::Object(object)).unwrap();
    let bytes = ser.release();

    let mut decoded = Heap::new();
    let value = deserialize(bytes, &mut decoded).unwrap();
    assert!(heap.graph_eq(&Value::Object(object), &decoded, &value));
}

#[test]
fn test_shared_array_buffers() {
    let mut heap = Heap::new();
    let shared = heap.alloc(HeapObject::SharedArrayBuffer(SharedArrayBuffer {
        data: Bytes::from_static(&[1, 2, 3, 4]),
    }));
    let view = heap.alloc(HeapObject::View(ArrayBufferView {
        kind: ViewKind::Int8,
        buffer: shared,
        byte_offset: 2,
        byte_length: 2,
        length_tracking: false,
    }));
    let root = heap.new_array([Value::Object(shared), Value::Object(view), Value::Object(shared)]);

    let options = SerializerOptions {
        treat_array_buffer_views_as_host_objects: false,
        ..SerializerOptions::default()
    };
    let (bytes, writer) = write_with_ports(&heap, &Value::Object(root), options);
    assert_eq!(writer.shared.len(), 1);

    let (decoded, value) = read_with_ports(bytes, writer.shared);
    assert!(heap.graph_eq(&Value::Object(root), &decoded, &value));

    let array = value.as_object().unwrap();
    let first = decoded.get_property(array, "0").unwrap().as_object().unwrap();
    assert_eq!(decoded.get_property(array, "2"), Some(&Value::Object(first)));
    let view = decoded.get_property(array, "1").unwrap().as_object().unwrap();
    assert!(matches!(decoded.get(view), Some(HeapObject::View(v)) if v.buffer == first));
}

#[test]
fn test_shared_array_buffer_without_delegate() {
    let mut heap = Heap::new();
    let shared = heap.alloc(HeapObject::SharedArrayBuffer(SharedArrayBuffer::default()));
    assert!(matches!(
        serialize(&heap, &Value::Object(shared)),
        Err(Error::DataClone(_))
    ));
}

#[test]
fn test_unknown_shared_buffer_id() {
    let bytes = Bytes::from_static(&[0xFF, 0x0F, 0x75, 0x03]);
    let mut heap = Heap::new();
    let result = Deserializer::with_delegate(bytes, &mut heap, PortReader::default(), DeserializerOptions::default())
        .unwrap()
        .deserialize();
    assert!(matches!(result, Err(Error::Delegate(_))));
}

#[test]
fn test_reallocation_hook() {
    let mut heap = Heap::new();
    let text = "structured clone ".repeat(1000);
    let root = heap.new_object([("text", Value::from(text.as_str()))]);

    let (bytes, writer) = write_with_ports(&heap, &Value::Object(root), SerializerOptions::default());
    assert!(writer.reallocations > 0);
    assert_eq!(bytes, serialize(&heap, &Value::Object(root)).unwrap());
}

#[test]
fn test_broken_reallocation() {
    struct Shrinking;
    impl SerializerDelegate for Shrinking {
        fn reallocate_buffer_memory(&mut self, _buffer: BytesMut, _size: usize) -> Result<BytesMut> {
            Ok(BytesMut::new())
        }
    }

    let heap = Heap::new();
    let mut ser = ValueSerializer::with_delegate(&heap, Shrinking);
    assert!(matches!(ser.write_header(), Err(Error::Delegate(_))));
}

#[test]
fn test_custom_clone_error() {
    struct Custom;
    impl SerializerDelegate for Custom {
        fn data_clone_error(&mut self, message: String) -> Error {
            Error::Type(format!("custom: {}", message))
        }
    }

    let mut heap = Heap::new();
    let function = heap.alloc(HeapObject::Unclonable(Unclonable::Function));
    let mut ser = ValueSerializer::with_delegate(&heap, Custom);
    match ser.write_object(&Value::Object(function)) {
        Err(Error::Type(message)) => assert!(message.starts_with("custom: ")),
        other => panic!("expected a custom error, got {:?}", other),
    }
}

#[test]
fn test_transfer() {
    let mut heap = Heap::new();
    let buffer = heap.alloc(HeapObject::ArrayBuffer(ArrayBuffer::new(vec![1u8, 2, 3])));
    let root = heap.new_array([Value::Object(buffer), Value::Object(buffer)]);

    let mut ser = Serializer::new(&heap, SerializerOptions::default());
    ser.transfer_array_buffer(7, buffer).unwrap();
    let bytes = ser.serialize(&Value::Object(root)).unwrap();
    assert_eq!(
        bytes.to_vec(),
        vec![0xFF, 0x0F, 0x41, 0x02, 0x74, 0x07, 0x5E, 0x01, 0x24, 0x00, 0x02]
    );

    let mut decoded = Heap::new();
    let target = decoded.alloc(HeapObject::ArrayBuffer(ArrayBuffer::new(vec![9u8; 3])));
    let value = {
        let mut de = Deserializer::new(bytes, &mut decoded, DeserializerOptions::default()).unwrap();
        de.transfer_array_buffer(7, target);
        de.deserialize().unwrap()
    };
    let array = value.as_object().unwrap();
    assert_eq!(decoded.get_property(array, "0"), Some(&Value::Object(target)));
    assert_eq!(decoded.get_property(array, "1"), Some(&Value::Object(target)));
}

#[test]
fn test_transfer_with_view() {
    let mut heap = Heap::new();
    let buffer = heap.alloc(HeapObject::ArrayBuffer(ArrayBuffer::new(vec![0u8; 8])));
    let view = heap.alloc(HeapObject::View(ArrayBufferView {
        kind: ViewKind::Float32,
        buffer,
        byte_offset: 4,
        byte_length: 4,
        length_tracking: false,
    }));

    let mut ser = ValueSerializer::new(&heap);
    ser.transfer_array_buffer(0, buffer).unwrap();
    ser.write_header().unwrap();
    ser.write_object(&Value::Object(view)).unwrap();
    let bytes = ser.release();

    let mut decoded = Heap::new();
    let target = decoded.alloc(HeapObject::ArrayBuffer(ArrayBuffer::new(vec![5u8; 8])));
    let value = {
        let mut de = ValueDeserializer::new(bytes, &mut decoded);
        de.transfer_array_buffer(0, target);
        de.read_header().unwrap();
        de.read_object_wrapper().unwrap()
    };
    let Some(HeapObject::View(v)) = decoded.get(value.as_object().unwrap()) else {
        panic!("expected a view");
    };
    assert_eq!(v.buffer, target);
    assert_eq!(v.kind, ViewKind::Float32);
    assert_eq!(v.byte_offset, 4);
}

#[test]
fn test_transfer_errors() {
    let mut heap = Heap::new();
    let buffer = heap.alloc(HeapObject::ArrayBuffer(ArrayBuffer::new(vec![1u8])));
    let shared = heap.alloc(HeapObject::SharedArrayBuffer(SharedArrayBuffer::default()));
    let object = heap.new_object(Vec::<(&str, Value)>::new());

    let mut ser = ValueSerializer::new(&heap);
    ser.transfer_array_buffer(1, buffer).unwrap();
    assert!(matches!(ser.transfer_array_buffer(2, buffer), Err(Error::DataClone(_))));
    assert!(matches!(ser.transfer_array_buffer(3, shared), Err(Error::DataClone(_))));
    assert!(matches!(ser.transfer_array_buffer(4, object), Err(Error::Type(_))));
}

/// Reads inline embedder tags from data written before `TAG_HOST_OBJECT` existed.
struct LegacyReader;

impl DeserializerDelegate for LegacyReader {
    fn read_host_object(de: &mut ValueDeserializer<'_, Self>) -> Result<ObjectRef> {
        let tag = de.read_byte()?;
        if tag != b'M' {
            return Err(Error::Decode(format!("unexpected embedder tag {}", tag)));
        }
        let index = de.read_uint32()?;
        Ok(de.heap_mut().alloc(HeapObject::Host(HostObject {
            tag: index,
            data: Bytes::new(),
        })))
    }
}

#[test]
fn test_legacy_embedder_tags() {
    let bytes = Bytes::from_static(&[
        0xFF, 0x0C, 0x41, 0x02, b'M', 0x07, b'M', 0x08, 0x24, 0x00, 0x02,
    ]);
    let mut heap = Heap::new();
    let value = Deserializer::with_delegate(bytes, &mut heap, LegacyReader, DeserializerOptions::default())
        .unwrap()
        .deserialize()
        .unwrap();
    let array = value.as_object().unwrap();
    for (key, port) in [("0", 7), ("1", 8)] {
        let object = heap.get_property(array, key).unwrap().as_object().unwrap();
        assert!(matches!(
            heap.get(object),
            Some(HeapObject::Host(HostObject { tag, .. })) if *tag == port
        ));
    }
}
