//! Core types and constants for the flow compiler.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Width of the RSS hash key in bytes. The hardware accepts exactly this
/// much key material, no more, no less.
pub const RSS_KEY_LEN: usize = 40;

/// Capacity of a flow's receive-queue list.
pub const MAX_FLOW_QUEUES: usize = 16;

/// Reserved priority for control-plane flows (broadcast, VLAN, ...).
/// User flows may only request priority 0 or this value.
pub const CTRL_FLOW_PRIORITY: u16 = 4;

/// Exclusive upper bound of the flow-mark id space.
pub const MARK_ID_MAX: u32 = 16_777_200;

/// Mark id used by the flag action.
pub const MARK_ID_DEFAULT: u32 = 0xff_ffff;

/// Default Toeplitz hash key programmed when the caller supplies none.
pub const DEFAULT_RSS_KEY: [u8; RSS_KEY_LEN] = [
    0x2c, 0xc6, 0x81, 0xd1, 0x5b, 0xdb, 0xf4, 0xf7, 0xfc, 0xa2, 0x83, 0x19, 0xdb, 0x1a, 0x3e,
    0x94, 0x6b, 0x9e, 0x38, 0xd9, 0x2c, 0x9c, 0x03, 0xd1, 0xad, 0x99, 0x44, 0xa7, 0xd9, 0x56,
    0x3d, 0x59, 0x06, 0x3c, 0x25, 0xf3, 0xfc, 0x1f, 0xdc, 0x2a,
];

/// Internet protocol version carried by a hash class or pattern layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpVersion {
    V4,
    V6,
}

bitflags! {
    /// Packet fields the hardware hashes over, as programmed into a
    /// hash-queue group.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct HashFields: u64 {
        const SRC_IPV4 = 1 << 0;
        const DST_IPV4 = 1 << 1;
        const SRC_IPV6 = 1 << 2;
        const DST_IPV6 = 1 << 3;
        const SRC_PORT_TCP = 1 << 4;
        const DST_PORT_TCP = 1 << 5;
        const SRC_PORT_UDP = 1 << 6;
        const DST_PORT_UDP = 1 << 7;

        const IPV4 = Self::SRC_IPV4.bits() | Self::DST_IPV4.bits();
        const IPV6 = Self::SRC_IPV6.bits() | Self::DST_IPV6.bits();
        const TCP_PORTS = Self::SRC_PORT_TCP.bits() | Self::DST_PORT_TCP.bits();
        const UDP_PORTS = Self::SRC_PORT_UDP.bits() | Self::DST_PORT_UDP.bits();
    }
}

bitflags! {
    /// Generic RSS hash-type request, the vendor-neutral equivalent of
    /// [`HashFields`] used by the caller-facing RSS action.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct RssTypes: u64 {
        const IPV4 = 1 << 0;
        const FRAG_IPV4 = 1 << 1;
        const NONFRAG_IPV4_TCP = 1 << 2;
        const NONFRAG_IPV4_UDP = 1 << 3;
        const IPV6 = 1 << 4;
        const FRAG_IPV6 = 1 << 5;
        const NONFRAG_IPV6_TCP = 1 << 6;
        const NONFRAG_IPV6_UDP = 1 << 7;

        const IP = Self::IPV4.bits()
            | Self::FRAG_IPV4.bits()
            | Self::IPV6.bits()
            | Self::FRAG_IPV6.bits();
    }
}

/// RSS configuration carried by a compiled flow: requested hash types
/// plus the key material for the hash-queue groups it ends up on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RssConfig {
    pub types: RssTypes,
    #[serde(with = "rss_key")]
    pub key: [u8; RSS_KEY_LEN],
}

/// Serde shim for the hash key: serde only derives array support up to
/// 32 elements and the key is 40.
mod rss_key {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    use super::RSS_KEY_LEN;

    pub fn serialize<S: Serializer>(key: &[u8; RSS_KEY_LEN], ser: S) -> Result<S::Ok, S::Error> {
        key[..].serialize(ser)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<[u8; RSS_KEY_LEN], D::Error> {
        let bytes = Vec::<u8>::deserialize(de)?;
        let len = bytes.len();
        bytes
            .try_into()
            .map_err(|_| D::Error::invalid_length(len, &"an RSS key of exactly 40 bytes"))
    }
}

impl Default for RssConfig {
    fn default() -> Self {
        Self {
            types: RssTypes::all(),
            key: DEFAULT_RSS_KEY,
        }
    }
}

/// Flow rule attributes.
///
/// Only ingress rules at priority 0 or [`CTRL_FLOW_PRIORITY`] are
/// implementable; groups and egress are rejected up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowAttr {
    pub group: u32,
    pub priority: u16,
    pub ingress: bool,
    pub egress: bool,
}

impl Default for FlowAttr {
    fn default() -> Self {
        Self {
            group: 0,
            priority: 0,
            ingress: true,
            egress: false,
        }
    }
}

/// Opaque handle to a compiled flow on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowId(pub(crate) u64);

impl std::fmt::Display for FlowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "flow#{}", self.0)
    }
}

/// Error taxonomy of the flow compiler.
///
/// Every failure carries a human-readable reason naming the offending
/// item or action; partial allocations are rolled back before any of
/// these surface.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FlowError {
    /// Item, action, mask or range not implementable by the hardware.
    #[error("not supported: {0}")]
    Unsupported(String),
    /// Malformed request: bad index, bad key length, zero tunnel id,
    /// empty VLAN mask, conflicting queue/RSS set.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Descriptor or hardware object allocation failed.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    /// Operation incompatible with the device state.
    #[error("conflict: {0}")]
    Conflict(String),
    /// No matching compiled flow.
    #[error("not found: {0}")]
    NotFound(String),
}

/// Result alias for compiler operations.
pub type FlowResult<T> = Result<T, FlowError>;
