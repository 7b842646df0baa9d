//! Wire codec: frames, values, schemas and the schema-evolving marshaller.
//!
//! # Layers
//!
//! | Layer          | Module        | Concern                                   |
//! |----------------|---------------|-------------------------------------------|
//! | [`Frame`]      | `frame`       | 14-byte header + payload, partial reads   |
//! | [`Value`]      | `value`       | dynamic values over an object arena       |
//! | wire           | `wire`        | tagged encoding with back-references      |
//! | projection     | `projection`  | reshaping decoded values to local schemas |
//! | [`Marshaller`] | `marshaller`  | request/response/fault payloads           |
//!
//! # Usage
//!
//! ```rust,ignore
//! use sockrpc::codec::{Marshaller, SchemaRegistry, Arguments, ExecutionContext};
//!
//! let marshaller = Marshaller::new(Arc::new(registry));
//! let payload = marshaller.encode_request(version, &key, &ExecutionContext::new(), &args)?;
//! let inbound = marshaller.decode_request(version, &payload)?;
//! ```

mod context;
mod frame;
mod marshaller;
mod projection;
mod schema;
mod value;
pub mod varint;
mod wire;

pub use context::{ExecutionContext, GeoLocation, IdentityToken, RequestUuid};
pub use frame::{encode_frame, Frame, FrameCodec, MessageType, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use marshaller::{InboundRequest, Marshaller};
pub use projection::DecodeOptions;
pub use schema::{
    EnumSchema, FieldDescriptor, OperationDefinition, OperationKey, ParameterSchema,
    SchemaRegistry, TypeSchema, TypeTag,
};
pub use value::{Arguments, MapEntry, Object, ObjectGraph, ObjectId, Returned, Value};
pub use wire::MAX_DEPTH;

pub(crate) use wire::{put_str, WireReader};
