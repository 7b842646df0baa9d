//! Schema evolution tests across two independently built schema sets.
//!
//! The "writer" side encodes with its own view of the types; the "reader"
//! side decodes with a different view, as happens when peers are upgraded
//! one at a time.

use std::sync::Arc;

use sockrpc::codec::{
    Arguments, DecodeOptions, EnumSchema, ExecutionContext, FieldDescriptor, Marshaller, Object,
    ObjectGraph, OperationDefinition, OperationKey, ParameterSchema, Returned, SchemaRegistry,
    TypeSchema, TypeTag, Value,
};
use sockrpc::{ProtocolVersion, RpcError};

fn point_schema(fields: &[&str]) -> TypeSchema {
    fields.iter().fold(TypeSchema::new("Point"), |schema, name| {
        schema.field(FieldDescriptor::optional(name, TypeTag::Int))
    })
}

fn marshaller(registry: SchemaRegistry) -> Marshaller {
    Marshaller::new(Arc::new(registry))
}

fn encode_point(fields: &[(&str, i64)]) -> bytes::Bytes {
    let mut graph = ObjectGraph::new();
    let point = fields
        .iter()
        .fold(Object::new("Point"), |object, (name, value)| object.with(name, *value));
    let id = graph.insert(point);
    marshaller(SchemaRegistry::new())
        .encode_response(&Returned::with_graph(graph, id))
        .unwrap()
}

#[test]
fn test_unknown_field_is_dropped() {
    let payload = encode_point(&[("i", 1), ("j", 2), ("x", 99)]);
    let reader = marshaller(SchemaRegistry::new().with_type(point_schema(&["i", "j"])));

    let returned = reader
        .decode_response(&payload, Some(&TypeTag::object("Point")), DecodeOptions::default())
        .unwrap();
    let id = returned.value.as_object().unwrap();
    let point = returned.graph.get(id).unwrap();

    assert_eq!(point.field("i"), Some(&Value::Int(1)));
    assert_eq!(point.field("j"), Some(&Value::Int(2)));
    assert!(!point.has_field("x"));
}

#[test]
fn test_missing_field_takes_default() {
    let payload = encode_point(&[("i", 1)]);
    let reader = marshaller(SchemaRegistry::new().with_type(point_schema(&["i", "j"])));

    let returned = reader
        .decode_response(&payload, Some(&TypeTag::object("Point")), DecodeOptions::default())
        .unwrap();
    let point = returned.graph.get(returned.value.as_object().unwrap()).unwrap();

    assert_eq!(point.field("i"), Some(&Value::Int(1)));
    assert_eq!(point.field("j"), Some(&Value::Null));
}

#[test]
fn test_missing_mandatory_field_fails_validation() {
    let payload = encode_point(&[("i", 1)]);
    let schema = TypeSchema::new("Point")
        .field(FieldDescriptor::optional("i", TypeTag::Int))
        .field(FieldDescriptor::mandatory("j", TypeTag::Int));
    let reader = marshaller(SchemaRegistry::new().with_type(schema));

    let err = reader
        .decode_response(&payload, Some(&TypeTag::object("Point")), DecodeOptions::default())
        .unwrap_err();
    assert!(matches!(err, RpcError::Validation(_)));
}

#[test]
fn test_removed_enum_constant() {
    let payload = marshaller(SchemaRegistry::new())
        .encode_response(&Returned::value(Value::Enum("BLUE".to_string())))
        .unwrap();
    let color = EnumSchema::new("Color", &["RED", "GREEN", "UNKNOWN"])
        .with_unknown_sentinel("UNKNOWN");
    let reader = marshaller(SchemaRegistry::new().with_enum(color));
    let tag = TypeTag::enumeration("Color");

    let err = reader
        .decode_response(&payload, Some(&tag), DecodeOptions::hard_fail())
        .unwrap_err();
    match err {
        RpcError::EnumDeserialisation { enum_name, value } => {
            assert_eq!(enum_name, "Color");
            assert_eq!(value, "BLUE");
        },
        other => panic!("unexpected error: {other:?}"),
    }

    let returned = reader
        .decode_response(&payload, Some(&tag), DecodeOptions::lenient())
        .unwrap();
    assert_eq!(returned.value.as_enum(), Some("UNKNOWN"));
}

#[test]
fn test_removed_enum_constant_without_sentinel_always_fails() {
    let payload = marshaller(SchemaRegistry::new())
        .encode_response(&Returned::value(Value::Enum("BLUE".to_string())))
        .unwrap();
    let reader = marshaller(SchemaRegistry::new().with_enum(EnumSchema::new("Color", &["RED"])));

    let err = reader
        .decode_response(&payload, Some(&TypeTag::enumeration("Color")), DecodeOptions::lenient())
        .unwrap_err();
    assert!(matches!(err, RpcError::EnumDeserialisation { .. }));
}

#[test]
fn test_cycle_identity_preserved() {
    let mut graph = ObjectGraph::new();
    let a = graph.insert(Object::new("Node").with("name", "a"));
    let b = graph.insert(Object::new("Node").with("name", "b").with("next", a));
    graph.get_mut(a).unwrap().set("next", b);

    let node = TypeSchema::new("Node")
        .field(FieldDescriptor::optional("name", TypeTag::Str))
        .field(FieldDescriptor::optional("next", TypeTag::object("Node")));
    let m = marshaller(SchemaRegistry::new().with_type(node));

    let payload = m.encode_response(&Returned::with_graph(graph, a)).unwrap();
    let returned = m
        .decode_response(&payload, Some(&TypeTag::object("Node")), DecodeOptions::default())
        .unwrap();

    let decoded_a = returned.value.as_object().unwrap();
    let decoded_b = returned.graph.follow(decoded_a, "next").unwrap();
    assert_ne!(decoded_a, decoded_b);
    assert_eq!(returned.graph.follow(decoded_b, "next"), Some(decoded_a));
    assert_eq!(returned.graph.len(), 2);
}

#[test]
fn test_arguments_bound_by_name_across_versions() {
    let key = OperationKey::new("Geo", "1", "move");
    let writer_args = Arguments::new()
        .with("dy", 2)
        .with("dx", 1)
        .with("added_later", "ignored");
    let payload = marshaller(SchemaRegistry::new())
        .encode_request(ProtocolVersion::V5, &key, &ExecutionContext::new(), &writer_args)
        .unwrap();

    let params = ParameterSchema::new()
        .param(FieldDescriptor::mandatory("dx", TypeTag::Int))
        .param(FieldDescriptor::mandatory("dy", TypeTag::Int))
        .param(FieldDescriptor::optional("dz", TypeTag::Int));
    let reader = marshaller(
        SchemaRegistry::new().with_operation(OperationDefinition::new(key.clone())),
    );
    let request = reader.decode_request(ProtocolVersion::V5, &payload).unwrap();
    assert_eq!(request.key, key);

    let (_, _, args) = reader
        .bind_arguments(request, &params, DecodeOptions::default())
        .unwrap();
    let names: Vec<&str> = args.values().iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, ["dx", "dy", "dz"]);
    assert_eq!(args.get("dx").and_then(Value::as_int), Some(1));
    assert_eq!(args.get("dz"), Some(&Value::Null));
    assert!(args.get("added_later").is_none());
}

#[test]
fn test_old_writer_missing_mandatory_argument() {
    let key = OperationKey::new("Geo", "1", "move");
    let payload = marshaller(SchemaRegistry::new())
        .encode_request(
            ProtocolVersion::V1,
            &key,
            &ExecutionContext::new(),
            &Arguments::new().with("dx", 1),
        )
        .unwrap();

    let params = ParameterSchema::new()
        .param(FieldDescriptor::mandatory("dx", TypeTag::Int))
        .param(FieldDescriptor::mandatory("dy", TypeTag::Int));
    let reader = marshaller(SchemaRegistry::new());
    let request = reader.decode_request(ProtocolVersion::V1, &payload).unwrap();
    let err = reader
        .bind_arguments(request, &params, DecodeOptions::default())
        .unwrap_err();
    assert!(matches!(err, RpcError::Validation(msg) if msg.contains("dy")));
}
