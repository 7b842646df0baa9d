//! Protocol versions and version-range negotiation.
//!
//! Each endpoint advertises an inclusive `[min, max]` range during the
//! HANDSHAKE/HANDSHAKE_ACK exchange. The negotiated version is the largest
//! value inside both ranges; if the ranges do not overlap the handshake
//! fails and no session becomes active.

use std::fmt;

use crate::error::{Result, RpcError};

/// A single protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion(u8);

impl ProtocolVersion {
    /// Base protocol
    pub const V1: Self = Self(1);
    /// Adds inferred country on geo-location
    pub const V2: Self = Self(2);
    /// Adds the request-UUID chain (root/parent)
    pub const V3: Self = Self(3);
    /// Adds free-form additional context parameters
    pub const V4: Self = Self(4);
    /// Adds SUSPEND during graceful drain
    pub const V5: Self = Self(5);

    /// Lowest version this build can speak
    pub const MIN_KNOWN: Self = Self::V1;
    /// Highest version this build can speak
    pub const MAX_KNOWN: Self = Self::V5;

    /// First version that carries `GeoLocation::inferred_country`.
    pub const INFERRED_COUNTRY: Self = Self::V2;
    /// First version that carries the root/parent request UUIDs.
    pub const REQUEST_UUID_CHAIN: Self = Self::V3;
    /// First version that carries additional context parameters.
    pub const ADDITIONAL_CONTEXT: Self = Self::V4;
    /// First version in which the server sends SUSPEND before DISCONNECT.
    pub const SUSPEND: Self = Self::V5;

    /// Wrap a raw version byte.
    pub const fn new(raw: u8) -> Self {
        Self(raw)
    }

    /// Raw version byte.
    pub const fn as_u8(self) -> u8 {
        self.0
    }

    /// Whether a feature introduced at `introduced` is active at this version.
    pub fn supports(self, introduced: ProtocolVersion) -> bool {
        self >= introduced
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Inclusive range of supported versions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionRange {
    min: ProtocolVersion,
    max: ProtocolVersion,
}

impl Default for VersionRange {
    fn default() -> Self {
        Self {
            min: ProtocolVersion::MIN_KNOWN,
            max: ProtocolVersion::MAX_KNOWN,
        }
    }
}

impl VersionRange {
    /// Create a range, rejecting inverted or unknown bounds.
    pub fn new(min: u8, max: u8) -> Result<Self> {
        let (min, max) = (ProtocolVersion(min), ProtocolVersion(max));
        if min > max {
            return Err(RpcError::Config(format!(
                "protocol version min {min} is greater than max {max}"
            )));
        }
        if min < ProtocolVersion::MIN_KNOWN || max > ProtocolVersion::MAX_KNOWN {
            return Err(RpcError::Config(format!(
                "protocol versions must lie within {}..={}, got {min}..={max}",
                ProtocolVersion::MIN_KNOWN,
                ProtocolVersion::MAX_KNOWN
            )));
        }
        Ok(Self { min, max })
    }

    /// Lower bound.
    pub fn min(&self) -> ProtocolVersion {
        self.min
    }

    /// Upper bound.
    pub fn max(&self) -> ProtocolVersion {
        self.max
    }

    /// Check whether a version lies within the range
    pub fn contains(&self, version: ProtocolVersion) -> bool {
        self.min <= version && version <= self.max
    }

    /// Pick the highest version acceptable to both ranges.
    pub fn negotiate(&self, peer: &VersionRange) -> Option<ProtocolVersion> {
        let floor = self.min.max(peer.min);
        let ceiling = self.max.min(peer.max);
        (floor <= ceiling).then_some(ceiling)
    }

    /// Range from raw bytes received off the wire, without the known-version check.
    pub(crate) fn from_wire(min: u8, max: u8) -> Result<Self> {
        if min > max {
            return Err(RpcError::Framing(format!(
                "peer advertised inverted version range {min}..={max}"
            )));
        }
        Ok(Self {
            min: ProtocolVersion(min),
            max: ProtocolVersion(max),
        })
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.min, self.max)
    }
}
