//! Self-describing value encoding with identity-preserving back-references.
//!
//! Every value starts with a one-byte tag, so a reader can walk (and skip)
//! fields it has no schema for. Objects are written inline the first time
//! they are reached and assigned the next back-reference number; later
//! references to the same [`ObjectId`] are written as `BACKREF n`.
//!
//! ```text
//! OBJECT  := 0x0B type_name:str field_count:varint (name:str value)*
//! BACKREF := 0x0C n:varint
//! MAP     := 0x0A count:varint (key present:u8 value?)*
//! ```

use std::collections::HashMap;

use bytes::{BufMut, BytesMut};

use super::value::{MapEntry, Object, ObjectGraph, ObjectId, Value};
use super::varint::{read_varint_slice, varint_size, write_signed, write_varint, zigzag_decode};
use crate::error::{Result, RpcError};

/// Maximum nesting depth accepted on read or write
pub const MAX_DEPTH: usize = 256;

mod tag {
    pub const NULL: u8 = 0x00;
    pub const FALSE: u8 = 0x01;
    pub const TRUE: u8 = 0x02;
    pub const INT: u8 = 0x03;
    pub const FLOAT: u8 = 0x04;
    pub const STR: u8 = 0x05;
    pub const BYTES: u8 = 0x06;
    pub const ENUM: u8 = 0x07;
    pub const LIST: u8 = 0x08;
    pub const SET: u8 = 0x09;
    pub const MAP: u8 = 0x0A;
    pub const OBJECT: u8 = 0x0B;
    pub const BACKREF: u8 = 0x0C;
}

pub(crate) fn put_str(buf: &mut BytesMut, s: &str) {
    put_bytes(buf, s.as_bytes());
}

pub(crate) fn put_bytes(buf: &mut BytesMut, b: &[u8]) {
    buf.reserve(varint_size(b.len() as u64) + b.len());
    write_varint(buf, b.len() as u64);
    buf.extend_from_slice(b);
}

pub(crate) fn put_opt_str(buf: &mut BytesMut, s: Option<&str>) {
    match s {
        Some(s) => {
            buf.put_u8(1);
            put_str(buf, s);
        },
        None => buf.put_u8(0),
    }
}

/// Cursor over a payload slice
pub(crate) struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    pub(crate) fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                RpcError::Marshalling(format!(
                    "unexpected end of payload: wanted {n} bytes at offset {}",
                    self.pos
                ))
            })?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn bool(&mut self) -> Result<bool> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(RpcError::Marshalling(format!("invalid flag byte {other}"))),
        }
    }

    pub(crate) fn varint(&mut self) -> Result<u64> {
        let (value, used) = read_varint_slice(&self.data[self.pos.min(self.data.len())..])?;
        self.pos += used;
        Ok(value)
    }

    pub(crate) fn len(&mut self) -> Result<usize> {
        let len = self.varint()?;
        let remaining = self.data.len().saturating_sub(self.pos) as u64;
        // every element occupies at least one byte
        if len > remaining {
            return Err(RpcError::Marshalling(format!(
                "length {len} exceeds remaining {remaining} bytes"
            )));
        }
        Ok(len as usize)
    }

    pub(crate) fn bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.len()?;
        self.take(len)
    }

    pub(crate) fn string(&mut self) -> Result<String> {
        let raw = self.bytes()?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| RpcError::Marshalling(format!("invalid UTF-8 string: {e}")))
    }

    pub(crate) fn opt_string(&mut self) -> Result<Option<String>> {
        if self.bool()? {
            Ok(Some(self.string()?))
        } else {
            Ok(None)
        }
    }

    fn f64(&mut self) -> Result<f64> {
        let raw = self.take(8)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(raw);
        Ok(f64::from_be_bytes(bytes))
    }
}

/// Writes values, assigning back-reference numbers to objects on first sight.
pub(crate) struct GraphWriter<'g> {
    graph: &'g ObjectGraph,
    refs: HashMap<ObjectId, u64>,
}

impl<'g> GraphWriter<'g> {
    pub(crate) fn new(graph: &'g ObjectGraph) -> Self {
        Self {
            graph,
            refs: HashMap::new(),
        }
    }

    pub(crate) fn write(&mut self, buf: &mut BytesMut, value: &Value) -> Result<()> {
        self.write_value(buf, value, 0)
    }

    fn write_value(&mut self, buf: &mut BytesMut, value: &Value, depth: usize) -> Result<()> {
        if depth > MAX_DEPTH {
            return Err(RpcError::Marshalling(format!(
                "value nesting exceeds {MAX_DEPTH} levels"
            )));
        }
        match value {
            Value::Null => buf.put_u8(tag::NULL),
            Value::Bool(false) => buf.put_u8(tag::FALSE),
            Value::Bool(true) => buf.put_u8(tag::TRUE),
            Value::Int(i) => {
                buf.put_u8(tag::INT);
                write_signed(buf, *i);
            },
            Value::Float(f) => {
                buf.put_u8(tag::FLOAT);
                buf.put_f64(*f);
            },
            Value::Str(s) => {
                buf.put_u8(tag::STR);
                put_str(buf, s);
            },
            Value::Bytes(b) => {
                buf.put_u8(tag::BYTES);
                put_bytes(buf, b);
            },
            Value::Enum(name) => {
                buf.put_u8(tag::ENUM);
                put_str(buf, name);
            },
            Value::List(items) | Value::Set(items) => {
                buf.put_u8(if matches!(value, Value::List(_)) {
                    tag::LIST
                } else {
                    tag::SET
                });
                write_varint(buf, items.len() as u64);
                for item in items {
                    self.write_value(buf, item, depth + 1)?;
                }
            },
            Value::Map(entries) => {
                buf.put_u8(tag::MAP);
                write_varint(buf, entries.len() as u64);
                for entry in entries {
                    self.write_value(buf, &entry.key, depth + 1)?;
                    match &entry.value {
                        Some(v) => {
                            buf.put_u8(1);
                            self.write_value(buf, v, depth + 1)?;
                        },
                        None => buf.put_u8(0),
                    }
                }
            },
            Value::Object(id) => self.write_object(buf, *id, depth)?,
        }
        Ok(())
    }

    fn write_object(&mut self, buf: &mut BytesMut, id: ObjectId, depth: usize) -> Result<()> {
        if let Some(n) = self.refs.get(&id) {
            buf.put_u8(tag::BACKREF);
            write_varint(buf, *n);
            return Ok(());
        }

        let graph = self.graph;
        let object = graph.get(id).ok_or_else(|| {
            RpcError::Marshalling(format!("object {id} is not part of the graph"))
        })?;

        let n = self.refs.len() as u64;
        self.refs.insert(id, n);

        buf.put_u8(tag::OBJECT);
        put_str(buf, &object.type_name);
        write_varint(buf, object.fields.len() as u64);
        for (name, value) in &object.fields {
            put_str(buf, name);
            self.write_value(buf, value, depth + 1)?;
        }
        Ok(())
    }
}

/// Reads values into a fresh [`ObjectGraph`], resolving back-references.
pub(crate) struct GraphReader {
    graph: ObjectGraph,
    refs: Vec<ObjectId>,
}

impl GraphReader {
    pub(crate) fn new() -> Self {
        Self {
            graph: ObjectGraph::new(),
            refs: Vec::new(),
        }
    }

    pub(crate) fn read(&mut self, r: &mut WireReader<'_>) -> Result<Value> {
        self.read_value(r, 0)
    }

    pub(crate) fn into_graph(self) -> ObjectGraph {
        self.graph
    }

    fn read_value(&mut self, r: &mut WireReader<'_>, depth: usize) -> Result<Value> {
        if depth > MAX_DEPTH {
            return Err(RpcError::Marshalling(format!(
                "value nesting exceeds {MAX_DEPTH} levels"
            )));
        }
        let value = match r.u8()? {
            tag::NULL => Value::Null,
            tag::FALSE => Value::Bool(false),
            tag::TRUE => Value::Bool(true),
            tag::INT => Value::Int(zigzag_decode(r.varint()?)),
            tag::FLOAT => Value::Float(r.f64()?),
            tag::STR => Value::Str(r.string()?),
            tag::BYTES => Value::Bytes(r.bytes()?.to_vec()),
            tag::ENUM => Value::Enum(r.string()?),
            t @ (tag::LIST | tag::SET) => {
                let count = r.len()?;
                let mut items = Vec::with_capacity(count);
                for _ in 0..count {
                    items.push(self.read_value(r, depth + 1)?);
                }
                if t == tag::LIST {
                    Value::List(items)
                } else {
                    Value::Set(items)
                }
            },
            tag::MAP => {
                let count = r.len()?;
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    let key = self.read_value(r, depth + 1)?;
                    let value = if r.bool()? {
                        Some(self.read_value(r, depth + 1)?)
                    } else {
                        None
                    };
                    entries.push(MapEntry { key, value });
                }
                Value::Map(entries)
            },
            tag::OBJECT => {
                let type_name = r.string()?;
                // register before reading fields so cycles resolve to this node
                let id = self.graph.insert(Object::new(&type_name));
                self.refs.push(id);

                let count = r.len()?;
                let mut fields = Vec::with_capacity(count);
                for _ in 0..count {
                    let name = r.string()?;
                    let value = self.read_value(r, depth + 1)?;
                    fields.push((name, value));
                }
                if let Some(object) = self.graph.get_mut(id) {
                    object.fields = fields;
                }
                Value::Object(id)
            },
            tag::BACKREF => {
                let n = r.varint()?;
                let id = usize::try_from(n)
                    .ok()
                    .and_then(|n| self.refs.get(n).copied())
                    .ok_or_else(|| {
                        RpcError::Marshalling(format!("back-reference {n} to unseen object"))
                    })?;
                Value::Object(id)
            },
            other => {
                return Err(RpcError::Marshalling(format!(
                    "unknown value tag 0x{other:02x}"
                )))
            },
        };
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(graph: &ObjectGraph, value: &Value) -> (ObjectGraph, Value) {
        let mut buf = BytesMut::new();
        GraphWriter::new(graph).write(&mut buf, value).unwrap();
        let mut reader = GraphReader::new();
        let mut cursor = WireReader::new(&buf);
        let decoded = reader.read(&mut cursor).unwrap();
        assert!(cursor.is_empty());
        (reader.into_graph(), decoded)
    }

    #[test]
    fn test_scalars_and_collections() {
        let value = Value::List(vec![
            Value::Null,
            Value::Bool(true),
            Value::Int(-12345),
            Value::Float(2.5),
            Value::Str("héllo".into()),
            Value::Bytes(vec![0, 1, 2]),
            Value::Enum("RED".into()),
            Value::Set(vec![Value::Int(1), Value::Int(2)]),
            Value::Map(vec![MapEntry::new("a", 1), MapEntry::key_only("b")]),
        ]);
        let (_, decoded) = roundtrip(&ObjectGraph::new(), &value);
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_cycle_preserves_identity() {
        let mut graph = ObjectGraph::new();
        let a = graph.insert(Object::new("A").with("name", "a"));
        let b = graph.insert(Object::new("B").with("a", a));
        graph.get_mut(a).unwrap().set("b", b);

        let (decoded_graph, decoded) = roundtrip(&graph, &Value::Object(a));
        let root = decoded.as_object().unwrap();
        let child = decoded_graph.follow(root, "b").unwrap();

        assert_eq!(decoded_graph.follow(child, "a"), Some(root));
        assert_eq!(decoded_graph.len(), 2);
    }

    #[test]
    fn test_shared_node_written_once() {
        let mut graph = ObjectGraph::new();
        let shared = graph.insert(Object::new("Leaf").with("v", 1));
        let value = Value::List(vec![Value::Object(shared), Value::Object(shared)]);

        let (decoded_graph, decoded) = roundtrip(&graph, &value);
        let Value::List(items) = decoded else {
            panic!("expected list");
        };
        assert_eq!(items[0], items[1]);
        assert_eq!(decoded_graph.len(), 1);
    }

    #[test]
    fn test_self_reference() {
        let mut graph = ObjectGraph::new();
        let node = graph.insert(Object::new("Node"));
        graph.get_mut(node).unwrap().set("me", node);

        let (decoded_graph, decoded) = roundtrip(&graph, &Value::Object(node));
        let id = decoded.as_object().unwrap();
        assert_eq!(decoded_graph.follow(id, "me"), Some(id));
    }

    #[test]
    fn test_dangling_object_rejected_on_write() {
        let graph = ObjectGraph::new();
        let mut other = ObjectGraph::new();
        let stray = other.insert(Object::new("X"));

        let mut buf = BytesMut::new();
        let err = GraphWriter::new(&graph)
            .write(&mut buf, &Value::Object(stray))
            .unwrap_err();
        assert!(matches!(err, RpcError::Marshalling(_)));
    }

    #[test]
    fn test_bad_backref_rejected() {
        let data = [tag::BACKREF, 3];
        let err = GraphReader::new()
            .read(&mut WireReader::new(&data))
            .unwrap_err();
        assert!(matches!(err, RpcError::Marshalling(_)));
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let data = [tag::STR, 10, b'a'];
        assert!(GraphReader::new().read(&mut WireReader::new(&data)).is_err());
    }

    #[test]
    fn test_depth_limit() {
        let mut value = Value::Null;
        for _ in 0..(MAX_DEPTH + 2) {
            value = Value::List(vec![value]);
        }
        let mut buf = BytesMut::new();
        assert!(GraphWriter::new(&ObjectGraph::new())
            .write(&mut buf, &value)
            .is_err());
    }
}
