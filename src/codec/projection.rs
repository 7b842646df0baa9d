//! Projection of decoded values onto local schemas.
//!
//! Structural decoding ([`super::wire`]) reproduces exactly what the peer
//! wrote. Projection then reshapes that graph into what the *local* schema
//! expects:
//!
//! - fields the local schema does not declare are dropped
//! - declared fields missing on the wire become `Null`, unless mandatory
//! - unknown enum constants fail or map to the sentinel, per [`DecodeOptions`]
//! - `Int` widens to `Float`
//!
//! Objects are projected in place, once each, so shared nodes and cycles
//! keep their identity.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use super::schema::{ParameterSchema, SchemaRegistry, TypeTag};
use super::value::{Arguments, MapEntry, ObjectGraph, ObjectId, Value};
use crate::error::{Result, RpcError};

/// Per-call decoding policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodeOptions {
    /// Fail on unknown enum constants instead of substituting the sentinel
    pub enum_hard_fail: bool,
}

impl DecodeOptions {
    /// Strict enum handling.
    pub fn hard_fail() -> Self {
        Self {
            enum_hard_fail: true,
        }
    }

    /// Lenient enum handling.
    pub fn lenient() -> Self {
        Self {
            enum_hard_fail: false,
        }
    }
}

pub(crate) struct Projector<'r> {
    registry: &'r SchemaRegistry,
    options: DecodeOptions,
    visited: HashSet<ObjectId>,
}

impl<'r> Projector<'r> {
    pub(crate) fn new(registry: &'r SchemaRegistry, options: DecodeOptions) -> Self {
        Self {
            registry,
            options,
            visited: HashSet::new(),
        }
    }

    /// Bind wire arguments to a parameter list by name.
    pub(crate) fn bind_arguments(
        &mut self,
        params: &ParameterSchema,
        mut graph: ObjectGraph,
        mut wire: Vec<(String, Value)>,
    ) -> Result<Arguments> {
        let mut bound = Vec::with_capacity(params.params().len());
        for param in params.params() {
            let found = wire
                .iter()
                .position(|(name, _)| *name == param.name)
                .map(|idx| wire.swap_remove(idx).1);
            let value = match found {
                Some(value) if !value.is_null() => {
                    self.project(&mut graph, value, &param.tag, &param.name)?
                },
                _ if param.mandatory => {
                    return Err(RpcError::Validation(format!(
                        "mandatory argument '{}' is missing",
                        param.name
                    )))
                },
                _ => Value::Null,
            };
            bound.push((param.name.clone(), value));
        }
        Ok(Arguments::from_parts(graph, bound))
    }

    pub(crate) fn project(
        &mut self,
        graph: &mut ObjectGraph,
        value: Value,
        tag: &TypeTag,
        path: &str,
    ) -> Result<Value> {
        match (tag, value) {
            (_, Value::Null) => Ok(Value::Null),
            (TypeTag::Any, Value::Object(id)) => {
                self.project_object(graph, id, None)?;
                Ok(Value::Object(id))
            },
            (TypeTag::Any, value) => Ok(value),
            (TypeTag::Bool, v @ Value::Bool(_)) => Ok(v),
            (TypeTag::Int, v @ Value::Int(_)) => Ok(v),
            (TypeTag::Float, v @ Value::Float(_)) => Ok(v),
            (TypeTag::Float, Value::Int(i)) => Ok(Value::Float(i as f64)),
            (TypeTag::Str, v @ Value::Str(_)) => Ok(v),
            (TypeTag::Bytes, v @ Value::Bytes(_)) => Ok(v),
            (TypeTag::Enum(enum_name), Value::Enum(constant)) => {
                self.project_enum(enum_name, constant)
            },
            (TypeTag::List(element), Value::List(items)) => {
                Ok(Value::List(self.project_items(graph, items, element, path)?))
            },
            (TypeTag::Set(element), Value::Set(items)) => {
                Ok(Value::Set(self.project_items(graph, items, element, path)?))
            },
            (TypeTag::Map(key_tag, value_tag), Value::Map(entries)) => {
                let mut projected = Vec::with_capacity(entries.len());
                for entry in entries {
                    let key = self.project(graph, entry.key, key_tag, path)?;
                    let value = match entry.value {
                        Some(v) => Some(self.project(graph, v, value_tag, path)?),
                        None => None,
                    };
                    projected.push(MapEntry { key, value });
                }
                Ok(Value::Map(projected))
            },
            (TypeTag::Object(declared), Value::Object(id)) => {
                self.project_object(graph, id, Some(declared.as_str()))?;
                Ok(Value::Object(id))
            },
            (tag, other) => Err(RpcError::Validation(format!(
                "'{path}': expected {tag}, found {}",
                other.kind()
            ))),
        }
    }

    fn project_items(
        &mut self,
        graph: &mut ObjectGraph,
        items: Vec<Value>,
        element: &TypeTag,
        path: &str,
    ) -> Result<Vec<Value>> {
        items
            .into_iter()
            .map(|item| self.project(graph, item, element, path))
            .collect()
    }

    fn project_enum(&self, enum_name: &str, constant: String) -> Result<Value> {
        let Some(schema) = self.registry.enum_schema(enum_name) else {
            // no local definition to check against
            return Ok(Value::Enum(constant));
        };
        if schema.contains(&constant) {
            return Ok(Value::Enum(constant));
        }
        match &schema.unknown_sentinel {
            Some(sentinel) if !self.options.enum_hard_fail => Ok(Value::Enum(sentinel.clone())),
            _ => Err(RpcError::EnumDeserialisation {
                enum_name: enum_name.to_string(),
                value: constant,
            }),
        }
    }

    fn project_object(
        &mut self,
        graph: &mut ObjectGraph,
        id: ObjectId,
        declared: Option<&str>,
    ) -> Result<()> {
        if !self.visited.insert(id) {
            return Ok(());
        }

        let registry = self.registry;
        let (wire_type, wire_fields) = {
            let object = graph.get_mut(id).ok_or_else(|| {
                RpcError::Marshalling(format!("object {id} missing from decoded graph"))
            })?;
            (object.type_name.clone(), std::mem::take(&mut object.fields))
        };

        let schema = registry
            .type_schema(&wire_type)
            .or_else(|| declared.and_then(|name| registry.type_schema(name)));

        let Some(schema) = schema else {
            // unknown type: keep the fields, but still walk nested objects
            let mut fields = Vec::with_capacity(wire_fields.len());
            for (name, value) in wire_fields {
                let value = self.project(graph, value, &TypeTag::Any, &name)?;
                fields.push((name, value));
            }
            if let Some(object) = graph.get_mut(id) {
                object.fields = fields;
            }
            return Ok(());
        };

        let mut wire_fields = wire_fields;
        let mut fields = Vec::with_capacity(schema.fields.len());
        for descriptor in &schema.fields {
            let found = wire_fields
                .iter()
                .position(|(name, _)| *name == descriptor.name)
                .map(|idx| wire_fields.swap_remove(idx).1);
            let path = format!("{}.{}", schema.name, descriptor.name);
            let value = match found {
                Some(value) if !value.is_null() => {
                    self.project(graph, value, &descriptor.tag, &path)?
                },
                _ if descriptor.mandatory => {
                    return Err(RpcError::Validation(format!(
                        "mandatory field '{path}' is missing"
                    )))
                },
                _ => Value::Null,
            };
            fields.push((descriptor.name.clone(), value));
        }

        if !wire_fields.is_empty() {
            tracing::trace!(
                type_name = %schema.name,
                dropped = wire_fields.len(),
                "Dropped fields unknown to local schema"
            );
        }

        if let Some(object) = graph.get_mut(id) {
            object.type_name = schema.name.clone();
            object.fields = fields;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::schema::{EnumSchema, FieldDescriptor, TypeSchema};
    use crate::codec::value::Object;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::new()
            .with_type(
                TypeSchema::new("Point")
                    .field(FieldDescriptor::mandatory("x", TypeTag::Int))
                    .field(FieldDescriptor::optional("y", TypeTag::Float)),
            )
            .with_enum(EnumSchema::new("Colour", &["RED"]).with_unknown_sentinel("UNKNOWN"))
            .with_enum(EnumSchema::new("Strict", &["ON", "OFF"]))
    }

    #[test]
    fn test_object_fields_projected() {
        let registry = registry();
        let mut graph = ObjectGraph::new();
        let id = graph.insert(Object::new("Point").with("x", 1).with("y", 2).with("z", 3));

        let mut projector = Projector::new(&registry, DecodeOptions::default());
        projector
            .project(&mut graph, Value::Object(id), &TypeTag::object("Point"), "p")
            .unwrap();

        let object = graph.get(id).unwrap();
        assert_eq!(object.field("x"), Some(&Value::Int(1)));
        assert_eq!(object.field("y"), Some(&Value::Float(2.0)));
        assert!(!object.has_field("z"));
    }

    #[test]
    fn test_missing_mandatory_field() {
        let registry = registry();
        let mut graph = ObjectGraph::new();
        let id = graph.insert(Object::new("Point").with("y", 2.0));

        let err = Projector::new(&registry, DecodeOptions::default())
            .project(&mut graph, Value::Object(id), &TypeTag::object("Point"), "p")
            .unwrap_err();
        assert!(matches!(err, RpcError::Validation(msg) if msg.contains("Point.x")));
    }

    #[test]
    fn test_enum_policy() {
        let registry = registry();
        let mut graph = ObjectGraph::new();
        let tag = TypeTag::enumeration("Colour");

        let lenient = Projector::new(&registry, DecodeOptions::lenient())
            .project(&mut graph, Value::Enum("BLUE".into()), &tag, "c")
            .unwrap();
        assert_eq!(lenient, Value::Enum("UNKNOWN".into()));

        let strict = Projector::new(&registry, DecodeOptions::hard_fail())
            .project(&mut graph, Value::Enum("BLUE".into()), &tag, "c");
        assert!(matches!(strict, Err(RpcError::EnumDeserialisation { .. })));

        // no sentinel: fails even when lenient
        let no_sentinel = Projector::new(&registry, DecodeOptions::lenient()).project(
            &mut graph,
            Value::Enum("DIM".into()),
            &TypeTag::enumeration("Strict"),
            "s",
        );
        assert!(matches!(no_sentinel, Err(RpcError::EnumDeserialisation { .. })));
    }

    #[test]
    fn test_type_mismatch() {
        let registry = registry();
        let err = Projector::new(&registry, DecodeOptions::default())
            .project(&mut ObjectGraph::new(), Value::Str("1".into()), &TypeTag::Int, "n")
            .unwrap_err();
        assert!(matches!(err, RpcError::Validation(_)));
    }

    #[test]
    fn test_bind_arguments_by_name() {
        let registry = registry();
        let params = ParameterSchema::new()
            .param(FieldDescriptor::mandatory("a", TypeTag::Int))
            .param(FieldDescriptor::optional("b", TypeTag::Str));
        let wire = vec![
            ("extra".to_string(), Value::Bool(true)),
            ("a".to_string(), Value::Int(5)),
        ];

        let args = Projector::new(&registry, DecodeOptions::default())
            .bind_arguments(&params, ObjectGraph::new(), wire)
            .unwrap();
        assert_eq!(args.get("a"), Some(&Value::Int(5)));
        assert_eq!(args.get("b"), Some(&Value::Null));
        assert!(args.get("extra").is_none());
    }
}
