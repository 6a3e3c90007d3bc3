//! Match pattern items and their byte-wise validation rules.
//!
//! Each item carries a spec, an optional mask and an optional upper
//! bound. Validation is byte-wise against a per-item supported mask:
//! the hardware matches exact values only, so any requested mask bit
//! outside the supported mask, or any real range, is rejected.

use crate::types::{FlowError, FlowResult};

/// One step of a match pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchItem {
    Eth(Pattern<EthItem>),
    Vlan(Pattern<VlanItem>),
    Ipv4(Pattern<Ipv4Item>),
    Ipv6(Pattern<Ipv6Item>),
    Udp(Pattern<UdpItem>),
    Tcp(Pattern<TcpItem>),
    Vxlan(Pattern<VxlanItem>),
}

/// Spec/mask/last triple for a single item. A `None` mask selects the
/// item's default mask; `last` turns the spec into an inclusive range,
/// which the hardware only accepts when it degenerates to a point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pattern<T> {
    pub spec: T,
    pub mask: Option<T>,
    pub last: Option<T>,
}

impl<T> Pattern<T> {
    pub fn new(spec: T) -> Self {
        Self {
            spec,
            mask: None,
            last: None,
        }
    }

    pub fn with_mask(spec: T, mask: T) -> Self {
        Self {
            spec,
            mask: Some(mask),
            last: None,
        }
    }
}

/// Byte-serialisable item payload. `bytes()` must emit fields in a
/// fixed order with multi-byte protocol values big-endian, so the
/// byte-wise mask check lines up with what the converters write out.
pub trait ItemSpec: Copy {
    /// Item name used in error messages.
    const NAME: &'static str;

    /// Mask of bytes the hardware can match on.
    fn supported_mask() -> Self;

    /// Mask applied when the caller supplies none.
    fn default_mask() -> Self;

    fn bytes(&self) -> Vec<u8>;
}

impl<T: ItemSpec> Pattern<T> {
    /// Validate this pattern and return its effective mask bytes.
    ///
    /// The requested mask must be a byte-wise subset of the supported
    /// mask, and if `last` is present the masked range must collapse to
    /// a single value.
    pub(crate) fn effective_mask(&self) -> FlowResult<Vec<u8>> {
        let supported = T::supported_mask().bytes();
        let mask = self
            .mask
            .map(|m| m.bytes())
            .unwrap_or_else(|| T::default_mask().bytes());
        debug_assert_eq!(mask.len(), supported.len());
        for (i, (&m, &s)) in mask.iter().zip(supported.iter()).enumerate() {
            if m & !s != 0 {
                return Err(FlowError::Unsupported(format!(
                    "{} item: mask byte {i} ({m:#04x}) not matchable",
                    T::NAME
                )));
            }
        }
        if let Some(last) = self.last {
            let spec = self.spec.bytes();
            let last = last.bytes();
            for ((&sp, &la), &m) in spec.iter().zip(last.iter()).zip(mask.iter()) {
                if sp & m != la & m {
                    return Err(FlowError::Unsupported(format!(
                        "{} item: value ranges not matchable",
                        T::NAME
                    )));
                }
            }
        }
        Ok(mask)
    }
}

/// Ethernet header item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EthItem {
    pub dst: [u8; 6],
    pub src: [u8; 6],
    pub ether_type: u16,
}

impl ItemSpec for EthItem {
    const NAME: &'static str = "eth";

    fn supported_mask() -> Self {
        Self {
            dst: [0xff; 6],
            src: [0xff; 6],
            ether_type: 0xffff,
        }
    }

    fn default_mask() -> Self {
        Self {
            dst: [0xff; 6],
            src: [0xff; 6],
            ether_type: 0,
        }
    }

    fn bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(14);
        out.extend_from_slice(&self.dst);
        out.extend_from_slice(&self.src);
        out.extend_from_slice(&self.ether_type.to_be_bytes());
        out
    }
}

/// 802.1Q tag item; merges into the preceding Ethernet descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VlanItem {
    pub tci: u16,
}

impl ItemSpec for VlanItem {
    const NAME: &'static str = "vlan";

    fn supported_mask() -> Self {
        Self { tci: 0xffff }
    }

    fn default_mask() -> Self {
        Self { tci: 0xffff }
    }

    fn bytes(&self) -> Vec<u8> {
        self.tci.to_be_bytes().to_vec()
    }
}

/// IPv4 header item. The hardware cannot match on TTL, so any TTL mask
/// bit is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ipv4Item {
    pub src: u32,
    pub dst: u32,
    pub tos: u8,
    pub ttl: u8,
    pub proto: u8,
}

impl ItemSpec for Ipv4Item {
    const NAME: &'static str = "ipv4";

    fn supported_mask() -> Self {
        Self {
            src: u32::MAX,
            dst: u32::MAX,
            tos: 0xff,
            ttl: 0,
            proto: 0xff,
        }
    }

    fn default_mask() -> Self {
        Self {
            src: u32::MAX,
            dst: u32::MAX,
            tos: 0,
            ttl: 0,
            proto: 0,
        }
    }

    fn bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(11);
        out.extend_from_slice(&self.src.to_be_bytes());
        out.extend_from_slice(&self.dst.to_be_bytes());
        out.push(self.tos);
        out.push(self.ttl);
        out.push(self.proto);
        out
    }
}

/// IPv6 header item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ipv6Item {
    pub src: [u8; 16],
    pub dst: [u8; 16],
    /// Version, traffic class and flow label, as on the wire.
    pub vtc_flow: u32,
    pub proto: u8,
    pub hop_limits: u8,
}

impl ItemSpec for Ipv6Item {
    const NAME: &'static str = "ipv6";

    fn supported_mask() -> Self {
        Self {
            src: [0xff; 16],
            dst: [0xff; 16],
            vtc_flow: u32::MAX,
            proto: 0xff,
            hop_limits: 0xff,
        }
    }

    fn default_mask() -> Self {
        Self {
            src: [0xff; 16],
            dst: [0xff; 16],
            vtc_flow: 0,
            proto: 0,
            hop_limits: 0,
        }
    }

    fn bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(38);
        out.extend_from_slice(&self.src);
        out.extend_from_slice(&self.dst);
        out.extend_from_slice(&self.vtc_flow.to_be_bytes());
        out.push(self.proto);
        out.push(self.hop_limits);
        out
    }
}

/// UDP header item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UdpItem {
    pub src_port: u16,
    pub dst_port: u16,
}

impl ItemSpec for UdpItem {
    const NAME: &'static str = "udp";

    fn supported_mask() -> Self {
        Self {
            src_port: 0xffff,
            dst_port: 0xffff,
        }
    }

    fn default_mask() -> Self {
        Self::supported_mask()
    }

    fn bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4);
        out.extend_from_slice(&self.src_port.to_be_bytes());
        out.extend_from_slice(&self.dst_port.to_be_bytes());
        out
    }
}

/// TCP header item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpItem {
    pub src_port: u16,
    pub dst_port: u16,
}

impl ItemSpec for TcpItem {
    const NAME: &'static str = "tcp";

    fn supported_mask() -> Self {
        Self {
            src_port: 0xffff,
            dst_port: 0xffff,
        }
    }

    fn default_mask() -> Self {
        Self::supported_mask()
    }

    fn bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4);
        out.extend_from_slice(&self.src_port.to_be_bytes());
        out.extend_from_slice(&self.dst_port.to_be_bytes());
        out
    }
}

/// VXLAN tunnel item; everything after it matches the inner headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VxlanItem {
    pub vni: [u8; 3],
}

impl ItemSpec for VxlanItem {
    const NAME: &'static str = "vxlan";

    fn supported_mask() -> Self {
        Self { vni: [0xff; 3] }
    }

    fn default_mask() -> Self {
        Self { vni: [0xff; 3] }
    }

    fn bytes(&self) -> Vec<u8> {
        self.vni.to_vec()
    }
}

/// Kind tag used to walk the pattern graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ItemKind {
    Eth,
    Vlan,
    Ipv4,
    Ipv6,
    Udp,
    Tcp,
    Vxlan,
}

impl MatchItem {
    pub(crate) fn kind(&self) -> ItemKind {
        match self {
            MatchItem::Eth(_) => ItemKind::Eth,
            MatchItem::Vlan(_) => ItemKind::Vlan,
            MatchItem::Ipv4(_) => ItemKind::Ipv4,
            MatchItem::Ipv6(_) => ItemKind::Ipv6,
            MatchItem::Udp(_) => ItemKind::Udp,
            MatchItem::Tcp(_) => ItemKind::Tcp,
            MatchItem::Vxlan(_) => ItemKind::Vxlan,
        }
    }
}

impl ItemKind {
    pub(crate) fn name(self) -> &'static str {
        match self {
            ItemKind::Eth => "eth",
            ItemKind::Vlan => "vlan",
            ItemKind::Ipv4 => "ipv4",
            ItemKind::Ipv6 => "ipv6",
            ItemKind::Udp => "udp",
            ItemKind::Tcp => "tcp",
            ItemKind::Vxlan => "vxlan",
        }
    }
}

/// Items allowed at the start of a pattern.
pub(crate) const START_ITEMS: &[ItemKind] = &[ItemKind::Eth, ItemKind::Vxlan];

/// Items allowed directly after `kind` in a pattern.
pub(crate) fn successors(kind: ItemKind) -> &'static [ItemKind] {
    match kind {
        ItemKind::Eth => &[ItemKind::Vlan, ItemKind::Ipv4, ItemKind::Ipv6],
        ItemKind::Vlan => &[ItemKind::Ipv4, ItemKind::Ipv6],
        ItemKind::Ipv4 | ItemKind::Ipv6 => &[ItemKind::Udp, ItemKind::Tcp],
        ItemKind::Udp => &[ItemKind::Vxlan],
        ItemKind::Tcp => &[],
        ItemKind::Vxlan => &[ItemKind::Eth],
    }
}
