//! Request, response and fault payloads.
//!
//! # Payload layouts
//!
//! ```text
//! REQUEST        := service:str version:str operation:str context arg_count (name:str value)*
//! RESPONSE_OK    := value
//! RESPONSE_FAULT := code:str message:str detail:opt_str
//! ```
//!
//! All argument values of one request share a back-reference table, so an
//! object passed in two arguments arrives as one object.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use super::context::ExecutionContext;
use super::projection::{DecodeOptions, Projector};
use super::schema::{OperationKey, ParameterSchema, SchemaRegistry, TypeTag};
use super::value::{Arguments, ObjectGraph, Returned, Value};
use super::varint::write_varint;
use super::wire::{put_opt_str, put_str, GraphReader, GraphWriter, WireReader};
use crate::error::{Fault, FaultCode, Result};
use crate::protocol::ProtocolVersion;

/// A request whose arguments have been decoded but not yet bound
#[derive(Debug, Clone)]
pub struct InboundRequest {
    /// Operation being called
    pub key: OperationKey,
    /// Caller context
    pub context: ExecutionContext,
    graph: ObjectGraph,
    args: Vec<(String, Value)>,
}

impl InboundRequest {
    /// Names of the arguments as sent by the caller.
    pub fn wire_argument_names(&self) -> impl Iterator<Item = &str> {
        self.args.iter().map(|(name, _)| name.as_str())
    }
}

/// Encodes and decodes payloads against a shared [`SchemaRegistry`]
#[derive(Debug, Clone)]
pub struct Marshaller {
    registry: Arc<SchemaRegistry>,
}

impl Marshaller {
    /// Create a marshaller.
    pub fn new(registry: Arc<SchemaRegistry>) -> Self {
        Self { registry }
    }

    /// Schemas in use.
    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Encode a REQUEST payload.
    pub fn encode_request(
        &self,
        version: ProtocolVersion,
        key: &OperationKey,
        context: &ExecutionContext,
        args: &Arguments,
    ) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(128);
        put_str(&mut buf, &key.service);
        put_str(&mut buf, &key.version);
        put_str(&mut buf, &key.operation);
        context.encode(&mut buf, version);

        let mut writer = GraphWriter::new(args.graph());
        write_varint(&mut buf, args.len() as u64);
        for (name, value) in args.values() {
            put_str(&mut buf, name);
            writer.write(&mut buf, value)?;
        }
        Ok(buf.freeze())
    }

    /// Decode a REQUEST payload up to, but not including, argument binding.
    pub fn decode_request(
        &self,
        version: ProtocolVersion,
        payload: &[u8],
    ) -> Result<InboundRequest> {
        let mut r = WireReader::new(payload);
        let service = r.string()?;
        let service_version = r.string()?;
        let operation = r.string()?;
        let context = ExecutionContext::decode(&mut r, version)?;

        let mut reader = GraphReader::new();
        let count = r.len()?;
        let mut args = Vec::with_capacity(count);
        for _ in 0..count {
            let name = r.string()?;
            let value = reader.read(&mut r)?;
            args.push((name, value));
        }

        Ok(InboundRequest {
            key: OperationKey {
                service,
                version: service_version,
                operation,
            },
            context,
            graph: reader.into_graph(),
            args,
        })
    }

    /// Bind decoded arguments to the local parameter list.
    pub fn bind_arguments(
        &self,
        request: InboundRequest,
        params: &ParameterSchema,
        options: DecodeOptions,
    ) -> Result<(OperationKey, ExecutionContext, Arguments)> {
        let InboundRequest {
            key,
            context,
            graph,
            args,
        } = request;
        let arguments =
            Projector::new(&self.registry, options).bind_arguments(params, graph, args)?;
        Ok((key, context, arguments))
    }

    /// Encode a RESPONSE_OK payload.
    pub fn encode_response(&self, returned: &Returned) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(64);
        GraphWriter::new(&returned.graph).write(&mut buf, &returned.value)?;
        Ok(buf.freeze())
    }

    /// Decode a RESPONSE_OK payload, projecting it onto `returns` when known.
    pub fn decode_response(
        &self,
        payload: &[u8],
        returns: Option<&TypeTag>,
        options: DecodeOptions,
    ) -> Result<Returned> {
        let mut reader = GraphReader::new();
        let value = reader.read(&mut WireReader::new(payload))?;
        let mut graph = reader.into_graph();
        let any = TypeTag::Any;
        let tag = returns.unwrap_or(&any);
        let value =
            Projector::new(&self.registry, options).project(&mut graph, value, tag, "result")?;
        Ok(Returned { graph, value })
    }

    /// Encode a RESPONSE_FAULT payload.
    pub fn encode_fault(&self, fault: &Fault) -> Bytes {
        let mut buf = BytesMut::with_capacity(32 + fault.message.len());
        put_str(&mut buf, fault.code.as_str());
        put_str(&mut buf, &fault.message);
        put_opt_str(&mut buf, fault.detail.as_deref());
        buf.freeze()
    }

    /// Decode a RESPONSE_FAULT payload.
    pub fn decode_fault(&self, payload: &[u8]) -> Result<Fault> {
        let mut r = WireReader::new(payload);
        let code = FaultCode::from_name(&r.string()?);
        let message = r.string()?;
        let detail = r.opt_string()?;
        Ok(Fault {
            code,
            message,
            detail,
        })
    }
}
