//! Local schemas: parameter lists, object types and enums.
//!
//! Schemas are matched against the wire *by name*, never by position. A
//! [`SchemaRegistry`] is built once at startup and shared read-only.

use std::collections::HashMap;
use std::fmt;

use crate::error::{Result, RpcError};

/// Semantic type of a field or parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypeTag {
    /// Accept any value unchanged
    Any,
    /// Boolean
    Bool,
    /// Signed integer
    Int,
    /// Floating point (integers widen)
    Float,
    /// String
    Str,
    /// Raw bytes
    Bytes,
    /// Enum type by name
    Enum(String),
    /// List of elements
    List(Box<TypeTag>),
    /// Set of elements
    Set(Box<TypeTag>),
    /// Map from key to optional value
    Map(Box<TypeTag>, Box<TypeTag>),
    /// Nested object type by name
    Object(String),
}

impl TypeTag {
    /// Enum type tag.
    pub fn enumeration(name: &str) -> Self {
        TypeTag::Enum(name.to_string())
    }

    /// Object type tag.
    pub fn object(name: &str) -> Self {
        TypeTag::Object(name.to_string())
    }

    /// List type tag.
    pub fn list(element: TypeTag) -> Self {
        TypeTag::List(Box::new(element))
    }

    /// Set type tag.
    pub fn set(element: TypeTag) -> Self {
        TypeTag::Set(Box::new(element))
    }

    /// Map type tag.
    pub fn map(key: TypeTag, value: TypeTag) -> Self {
        TypeTag::Map(Box::new(key), Box::new(value))
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeTag::Any => write!(f, "any"),
            TypeTag::Bool => write!(f, "bool"),
            TypeTag::Int => write!(f, "int"),
            TypeTag::Float => write!(f, "float"),
            TypeTag::Str => write!(f, "string"),
            TypeTag::Bytes => write!(f, "bytes"),
            TypeTag::Enum(name) => write!(f, "enum {name}"),
            TypeTag::List(e) => write!(f, "list<{e}>"),
            TypeTag::Set(e) => write!(f, "set<{e}>"),
            TypeTag::Map(k, v) => write!(f, "map<{k}, {v}>"),
            TypeTag::Object(name) => write!(f, "{name}"),
        }
    }
}

/// Named, typed field or parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// Name used on the wire
    pub name: String,
    /// Semantic type
    pub tag: TypeTag,
    /// Absence is a validation failure
    pub mandatory: bool,
}

impl FieldDescriptor {
    /// Optional field.
    pub fn optional(name: &str, tag: TypeTag) -> Self {
        Self {
            name: name.to_string(),
            tag,
            mandatory: false,
        }
    }

    /// Mandatory field.
    pub fn mandatory(name: &str, tag: TypeTag) -> Self {
        Self {
            name: name.to_string(),
            tag,
            mandatory: true,
        }
    }
}

/// Object type schema
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeSchema {
    /// Type name
    pub name: String,
    /// Fields in local declaration order
    pub fields: Vec<FieldDescriptor>,
}

impl TypeSchema {
    /// Schema with no fields yet.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            fields: Vec::new(),
        }
    }

    /// Add a field.
    pub fn field(mut self, descriptor: FieldDescriptor) -> Self {
        self.fields.push(descriptor);
        self
    }
}

/// Enum schema
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumSchema {
    /// Enum type name
    pub name: String,
    /// Known constant names
    pub constants: Vec<String>,
    /// Constant substituted for unknown names under lenient decoding
    pub unknown_sentinel: Option<String>,
}

impl EnumSchema {
    /// Enum with the given constants and no sentinel.
    pub fn new(name: &str, constants: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            constants: constants.iter().map(|c| (*c).to_string()).collect(),
            unknown_sentinel: None,
        }
    }

    /// Designate the "unknown value" constant, adding it if absent.
    pub fn with_unknown_sentinel(mut self, sentinel: &str) -> Self {
        if !self.contains(sentinel) {
            self.constants.push(sentinel.to_string());
        }
        self.unknown_sentinel = Some(sentinel.to_string());
        self
    }

    /// Whether `name` is a known constant.
    pub fn contains(&self, name: &str) -> bool {
        self.constants.iter().any(|c| c == name)
    }
}

/// Ordered parameter list of an operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterSchema {
    params: Vec<FieldDescriptor>,
}

impl ParameterSchema {
    /// No parameters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a parameter.
    pub fn param(mut self, descriptor: FieldDescriptor) -> Self {
        self.params.push(descriptor);
        self
    }

    /// Parameters in order.
    pub fn params(&self) -> &[FieldDescriptor] {
        &self.params
    }
}

/// Identifies an operation: service, service version, operation name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationKey {
    /// Service name
    pub service: String,
    /// Service interface version
    pub version: String,
    /// Operation name
    pub operation: String,
}

impl OperationKey {
    /// Create a key.
    pub fn new(service: &str, version: &str, operation: &str) -> Self {
        Self {
            service: service.to_string(),
            version: version.to_string(),
            operation: operation.to_string(),
        }
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.service, self.version, self.operation)
    }
}

/// Parameters and result type of an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationDefinition {
    /// Operation key
    pub key: OperationKey,
    /// Parameter schema
    pub params: ParameterSchema,
    /// Result type, `None` for void
    pub returns: Option<TypeTag>,
}

impl OperationDefinition {
    /// Definition with no parameters and a void result.
    pub fn new(key: OperationKey) -> Self {
        Self {
            key,
            params: ParameterSchema::new(),
            returns: None,
        }
    }

    /// Append a parameter.
    pub fn param(mut self, descriptor: FieldDescriptor) -> Self {
        self.params = self.params.param(descriptor);
        self
    }

    /// Set the result type.
    pub fn returns(mut self, tag: TypeTag) -> Self {
        self.returns = Some(tag);
        self
    }
}

/// All schemas known to this process
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    types: HashMap<String, TypeSchema>,
    enums: HashMap<String, EnumSchema>,
    operations: HashMap<OperationKey, OperationDefinition>,
}

impl SchemaRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an object type.
    pub fn with_type(mut self, schema: TypeSchema) -> Self {
        self.types.insert(schema.name.clone(), schema);
        self
    }

    /// Register an enum.
    pub fn with_enum(mut self, schema: EnumSchema) -> Self {
        self.enums.insert(schema.name.clone(), schema);
        self
    }

    /// Register an operation.
    pub fn with_operation(mut self, definition: OperationDefinition) -> Self {
        self.operations.insert(definition.key.clone(), definition);
        self
    }

    /// Object schema by type name.
    pub fn type_schema(&self, name: &str) -> Option<&TypeSchema> {
        self.types.get(name)
    }

    /// Enum schema by name.
    pub fn enum_schema(&self, name: &str) -> Option<&EnumSchema> {
        self.enums.get(name)
    }

    /// Operation definition by key.
    pub fn operation(&self, key: &OperationKey) -> Option<&OperationDefinition> {
        self.operations.get(key)
    }

    /// Operation definition by key, as an error when missing.
    pub fn require_operation(&self, key: &OperationKey) -> Result<&OperationDefinition> {
        self.operation(key)
            .ok_or_else(|| RpcError::UnknownOperation(key.to_string()))
    }

    /// All registered operation keys.
    pub fn operation_keys(&self) -> impl Iterator<Item = &OperationKey> {
        self.operations.keys()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enum_sentinel_added() {
        let schema = EnumSchema::new("Colour", &["RED", "GREEN"]).with_unknown_sentinel("UNKNOWN");
        assert!(schema.contains("UNKNOWN"));
        assert_eq!(schema.constants.len(), 3);

        let again = schema.with_unknown_sentinel("UNKNOWN");
        assert_eq!(again.constants.len(), 3);
    }

    #[test]
    fn test_operation_lookup() {
        let key = OperationKey::new("Baseline", "1.0", "echo");
        let registry = SchemaRegistry::new().with_operation(
            OperationDefinition::new(key.clone())
                .param(FieldDescriptor::mandatory("msg", TypeTag::Str))
                .returns(TypeTag::Str),
        );

        let def = registry.require_operation(&key).unwrap();
        assert_eq!(def.params.params().len(), 1);
        assert_eq!(key.to_string(), "Baseline/1.0/echo");

        let missing = OperationKey::new("Baseline", "1.0", "nope");
        assert!(matches!(
            registry.require_operation(&missing),
            Err(RpcError::UnknownOperation(_))
        ));
    }

    #[test]
    fn test_type_tag_display() {
        let tag = TypeTag::map(TypeTag::Str, TypeTag::list(TypeTag::object("Point")));
        assert_eq!(tag.to_string(), "map<string, list<Point>>");
    }
}
