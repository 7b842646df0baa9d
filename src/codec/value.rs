//! Dynamic value model for call arguments and results.
//!
//! Nested objects are stored in an [`ObjectGraph`] arena and referenced by
//! [`ObjectId`]. Two references to the same id are the same object, which
//! is how shared nodes and cycles survive a round trip through the wire.

use std::fmt;

/// Index of an object within an [`ObjectGraph`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId(usize);

impl ObjectId {
    /// Arena index.
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A marshallable value
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Value {
    /// Absent / null
    #[default]
    Null,
    /// Boolean
    Bool(bool),
    /// Signed integer
    Int(i64),
    /// Floating point
    Float(f64),
    /// UTF-8 string
    Str(String),
    /// Raw bytes
    Bytes(Vec<u8>),
    /// Enum constant, by name
    Enum(String),
    /// Ordered list
    List(Vec<Value>),
    /// Set (insertion order kept, duplicates allowed on the wire)
    Set(Vec<Value>),
    /// Map with optional values
    Map(Vec<MapEntry>),
    /// Reference to an object in the owning graph
    Object(ObjectId),
}

impl Value {
    /// Whether the value is `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Short type label used in validation messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Enum(_) => "enum",
            Value::List(_) => "list",
            Value::Set(_) => "set",
            Value::Map(_) => "map",
            Value::Object(_) => "object",
        }
    }

    /// Integer payload, if any.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// String payload, if any.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Enum constant name, if any.
    pub fn as_enum(&self) -> Option<&str> {
        match self {
            Value::Enum(s) => Some(s),
            _ => None,
        }
    }

    /// Object reference, if any.
    pub fn as_object(&self) -> Option<ObjectId> {
        match self {
            Value::Object(id) => Some(*id),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<ObjectId> for Value {
    fn from(id: ObjectId) -> Self {
        Value::Object(id)
    }
}

/// Map entry; the value may be absent
#[derive(Debug, Clone, PartialEq)]
pub struct MapEntry {
    /// Key
    pub key: Value,
    /// Value, `None` when the key maps to nothing
    pub value: Option<Value>,
}

impl MapEntry {
    /// Entry with a value.
    pub fn new(key: impl Into<Value>, value: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    /// Entry whose value is absent.
    pub fn key_only(key: impl Into<Value>) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }
}

/// An object instance: a type name plus named fields
#[derive(Debug, Clone, PartialEq)]
pub struct Object {
    /// Type name used to find the local schema
    pub type_name: String,
    /// Fields in declaration order
    pub fields: Vec<(String, Value)>,
}

impl Object {
    /// Empty object of the given type.
    pub fn new(type_name: &str) -> Self {
        Self {
            type_name: type_name.to_string(),
            fields: Vec::new(),
        }
    }

    /// Builder-style field setter.
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    /// Set or replace a field.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        let value = value.into();
        match self.fields.iter_mut().find(|(n, _)| n == name) {
            Some((_, slot)) => *slot = value,
            None => self.fields.push((name.to_string(), value)),
        }
    }

    /// Look up a field.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Whether a field with this name exists.
    pub fn has_field(&self, name: &str) -> bool {
        self.fields.iter().any(|(n, _)| n == name)
    }
}

/// Arena of objects referenced by values
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectGraph {
    objects: Vec<Object>,
}

impl ObjectGraph {
    /// Empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an object and return its id.
    pub fn insert(&mut self, object: Object) -> ObjectId {
        self.objects.push(object);
        ObjectId(self.objects.len() - 1)
    }

    /// Borrow an object.
    pub fn get(&self, id: ObjectId) -> Option<&Object> {
        self.objects.get(id.0)
    }

    /// Mutably borrow an object.
    pub fn get_mut(&mut self, id: ObjectId) -> Option<&mut Object> {
        self.objects.get_mut(id.0)
    }

    /// Follow `field` on object `id` to another object.
    pub fn follow(&self, id: ObjectId, field: &str) -> Option<ObjectId> {
        self.get(id)?.field(field)?.as_object()
    }

    /// Number of objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

/// Named argument list for one call, with the graph its objects live in
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Arguments {
    graph: ObjectGraph,
    values: Vec<(String, Value)>,
}

impl Arguments {
    /// Empty argument list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Arguments over an existing graph.
    pub fn with_graph(graph: ObjectGraph) -> Self {
        Self {
            graph,
            values: Vec::new(),
        }
    }

    pub(crate) fn from_parts(graph: ObjectGraph, values: Vec<(String, Value)>) -> Self {
        Self { graph, values }
    }

    /// Builder-style argument setter.
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    /// Set or replace an argument.
    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        let value = value.into();
        match self.values.iter_mut().find(|(n, _)| n == name) {
            Some((_, slot)) => *slot = value,
            None => self.values.push((name.to_string(), value)),
        }
    }

    /// Look up an argument by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// All arguments in order.
    pub fn values(&self) -> &[(String, Value)] {
        &self.values
    }

    /// Object graph.
    pub fn graph(&self) -> &ObjectGraph {
        &self.graph
    }

    /// Mutable object graph, for building nested arguments.
    pub fn graph_mut(&mut self) -> &mut ObjectGraph {
        &mut self.graph
    }

    /// Number of arguments.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether there are no arguments.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Successful call result
#[derive(Debug, Clone, PartialEq)]
pub struct Returned {
    /// Graph holding any objects in `value`
    pub graph: ObjectGraph,
    /// Result value, `Null` for void operations
    pub value: Value,
}

impl Returned {
    /// Result without objects.
    pub fn value(value: impl Into<Value>) -> Self {
        Self {
            graph: ObjectGraph::new(),
            value: value.into(),
        }
    }

    /// Result of a void operation.
    pub fn void() -> Self {
        Self::value(Value::Null)
    }

    /// Result whose value references objects in `graph`.
    pub fn with_graph(graph: ObjectGraph, value: impl Into<Value>) -> Self {
        Self {
            graph,
            value: value.into(),
        }
    }
}
