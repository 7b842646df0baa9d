//! Execution context carried with every request.
//!
//! Fields introduced after v1 are gated on the negotiated version: below
//! their introducing version they are neither written nor read, and decode
//! as absent.

use std::collections::BTreeMap;

use bytes::{BufMut, BytesMut};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::varint::{write_signed, write_varint, zigzag_decode};
use super::wire::{put_opt_str, put_str, WireReader};
use crate::error::{Result, RpcError};
use crate::protocol::ProtocolVersion;

/// Caller identity token, e.g. a user name or an auth ticket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityToken {
    /// Token name
    pub name: String,
    /// Token value
    pub value: String,
}

impl IdentityToken {
    /// Create a token.
    pub fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
        }
    }
}

/// Where the original request came from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeoLocation {
    /// Address of the original caller
    pub remote_addr: String,
    /// Addresses the request passed through
    pub resolved_addresses: Vec<String>,
    /// Country code
    pub country: Option<String>,
    /// Inferred country code (v2+)
    pub inferred_country: Option<String>,
}

impl GeoLocation {
    /// Location with only the remote address set.
    pub fn new(remote_addr: &str) -> Self {
        Self {
            remote_addr: remote_addr.to_string(),
            ..Default::default()
        }
    }
}

/// Request identifier chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestUuid {
    /// This request
    pub local: Uuid,
    /// First request in the chain (v3+)
    pub root: Option<Uuid>,
    /// Request that caused this one (v3+)
    pub parent: Option<Uuid>,
}

impl RequestUuid {
    /// Fresh chain rooted at a new request.
    pub fn new() -> Self {
        Self {
            local: Uuid::new_v4(),
            root: None,
            parent: None,
        }
    }

    /// Identifier for a request issued while handling this one.
    pub fn child(&self) -> Self {
        Self {
            local: Uuid::new_v4(),
            root: Some(self.root.unwrap_or(self.local)),
            parent: Some(self.local),
        }
    }
}

impl Default for RequestUuid {
    fn default() -> Self {
        Self::new()
    }
}

/// Context bundle sent ahead of the arguments of each request
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionContext {
    /// Caller identity tokens
    pub identity: Vec<IdentityToken>,
    /// Caller location
    pub location: Option<GeoLocation>,
    /// When the originating request was received
    pub received_time: DateTime<Utc>,
    /// Whether the request should be traced end to end
    pub trace_enabled: bool,
    /// Request UUID chain
    pub request_uuid: RequestUuid,
    /// Free-form parameters (v4+)
    pub additional: BTreeMap<String, String>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContext {
    /// Context for a request received now.
    pub fn new() -> Self {
        Self {
            identity: Vec::new(),
            location: None,
            received_time: Utc::now(),
            trace_enabled: false,
            request_uuid: RequestUuid::new(),
            additional: BTreeMap::new(),
        }
    }

    /// Context for a downstream call made while handling this request.
    pub fn child(&self) -> Self {
        Self {
            request_uuid: self.request_uuid.child(),
            ..self.clone()
        }
    }

    /// Add an identity token.
    pub fn with_identity(mut self, token: IdentityToken) -> Self {
        self.identity.push(token);
        self
    }

    /// Set the location.
    pub fn with_location(mut self, location: GeoLocation) -> Self {
        self.location = Some(location);
        self
    }

    /// Enable tracing.
    pub fn with_trace(mut self, enabled: bool) -> Self {
        self.trace_enabled = enabled;
        self
    }

    /// Add a free-form parameter.
    pub fn with_additional(mut self, key: &str, value: &str) -> Self {
        self.additional.insert(key.to_string(), value.to_string());
        self
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut, version: ProtocolVersion) {
        write_varint(buf, self.identity.len() as u64);
        for token in &self.identity {
            put_str(buf, &token.name);
            put_str(buf, &token.value);
        }

        match &self.location {
            Some(location) => {
                buf.put_u8(1);
                put_str(buf, &location.remote_addr);
                write_varint(buf, location.resolved_addresses.len() as u64);
                for addr in &location.resolved_addresses {
                    put_str(buf, addr);
                }
                put_opt_str(buf, location.country.as_deref());
                if version.supports(ProtocolVersion::INFERRED_COUNTRY) {
                    put_opt_str(buf, location.inferred_country.as_deref());
                }
            },
            None => buf.put_u8(0),
        }

        write_signed(buf, self.received_time.timestamp_millis());
        buf.put_u8(u8::from(self.trace_enabled));
        buf.extend_from_slice(self.request_uuid.local.as_bytes());

        if version.supports(ProtocolVersion::REQUEST_UUID_CHAIN) {
            put_opt_uuid(buf, self.request_uuid.root);
            put_opt_uuid(buf, self.request_uuid.parent);
        }

        if version.supports(ProtocolVersion::ADDITIONAL_CONTEXT) {
            write_varint(buf, self.additional.len() as u64);
            for (key, value) in &self.additional {
                put_str(buf, key);
                put_str(buf, value);
            }
        }
    }

    pub(crate) fn decode(r: &mut WireReader<'_>, version: ProtocolVersion) -> Result<Self> {
        let count = r.len()?;
        let mut identity = Vec::with_capacity(count);
        for _ in 0..count {
            let name = r.string()?;
            let value = r.string()?;
            identity.push(IdentityToken { name, value });
        }

        let location = if r.bool()? {
            let remote_addr = r.string()?;
            let count = r.len()?;
            let mut resolved_addresses = Vec::with_capacity(count);
            for _ in 0..count {
                resolved_addresses.push(r.string()?);
            }
            let country = r.opt_string()?;
            let inferred_country = if version.supports(ProtocolVersion::INFERRED_COUNTRY) {
                r.opt_string()?
            } else {
                None
            };
            Some(GeoLocation {
                remote_addr,
                resolved_addresses,
                country,
                inferred_country,
            })
        } else {
            None
        };

        let millis = zigzag_decode(r.varint()?);
        let received_time = DateTime::<Utc>::from_timestamp_millis(millis)
            .ok_or_else(|| RpcError::Marshalling(format!("received time {millis} out of range")))?;
        let trace_enabled = r.bool()?;
        let local = read_uuid(r)?;

        let (root, parent) = if version.supports(ProtocolVersion::REQUEST_UUID_CHAIN) {
            (read_opt_uuid(r)?, read_opt_uuid(r)?)
        } else {
            (None, None)
        };

        let mut additional = BTreeMap::new();
        if version.supports(ProtocolVersion::ADDITIONAL_CONTEXT) {
            let count = r.len()?;
            for _ in 0..count {
                let key = r.string()?;
                let value = r.string()?;
                additional.insert(key, value);
            }
        }

        Ok(Self {
            identity,
            location,
            received_time,
            trace_enabled,
            request_uuid: RequestUuid {
                local,
                root,
                parent,
            },
            additional,
        })
    }
}

fn put_opt_uuid(buf: &mut BytesMut, id: Option<Uuid>) {
    match id {
        Some(id) => {
            buf.put_u8(1);
            buf.extend_from_slice(id.as_bytes());
        },
        None => buf.put_u8(0),
    }
}

fn read_uuid(r: &mut WireReader<'_>) -> Result<Uuid> {
    Uuid::from_slice(r.take(16)?).map_err(|e| RpcError::Marshalling(format!("invalid uuid: {e}")))
}

fn read_opt_uuid(r: &mut WireReader<'_>) -> Result<Option<Uuid>> {
    if r.bool()? {
        Ok(Some(read_uuid(r)?))
    } else {
        Ok(None)
    }
}
