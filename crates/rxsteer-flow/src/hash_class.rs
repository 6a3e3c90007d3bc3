//! The fixed table of hardware hash classes.
//!
//! Every compiled flow materialises as up to one match descriptor per
//! class; a class is populated when the flow's RSS request intersects
//! the class's hash types, so traffic hashed by that class lands on the
//! right queue set.

use crate::types::{HashFields, IpVersion, RssTypes};

/// One row of the hash-class table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HashClass {
    TcpV4,
    UdpV4,
    Ipv4,
    TcpV6,
    UdpV6,
    Ipv6,
    /// Catch-all class hashing over nothing; every flow lands here at
    /// least, and drop flows land here only.
    Eth,
}

/// All classes in table order, most specific first.
pub const HASH_CLASSES: [HashClass; 7] = [
    HashClass::TcpV4,
    HashClass::UdpV4,
    HashClass::Ipv4,
    HashClass::TcpV6,
    HashClass::UdpV6,
    HashClass::Ipv6,
    HashClass::Eth,
];

impl HashClass {
    /// Fields the hardware hashes over for this class.
    pub fn hash_fields(self) -> HashFields {
        match self {
            HashClass::TcpV4 => HashFields::IPV4 | HashFields::TCP_PORTS,
            HashClass::UdpV4 => HashFields::IPV4 | HashFields::UDP_PORTS,
            HashClass::Ipv4 => HashFields::IPV4,
            HashClass::TcpV6 => HashFields::IPV6 | HashFields::TCP_PORTS,
            HashClass::UdpV6 => HashFields::IPV6 | HashFields::UDP_PORTS,
            HashClass::Ipv6 => HashFields::IPV6,
            HashClass::Eth => HashFields::empty(),
        }
    }

    /// RSS hash types this class satisfies. A flow requesting any of
    /// these gets a descriptor in this class.
    pub fn rss_types(self) -> RssTypes {
        match self {
            HashClass::TcpV4 => RssTypes::NONFRAG_IPV4_TCP,
            HashClass::UdpV4 => RssTypes::NONFRAG_IPV4_UDP,
            HashClass::Ipv4 => RssTypes::IPV4 | RssTypes::FRAG_IPV4,
            HashClass::TcpV6 => RssTypes::NONFRAG_IPV6_TCP,
            HashClass::UdpV6 => RssTypes::NONFRAG_IPV6_UDP,
            HashClass::Ipv6 => RssTypes::IPV6 | RssTypes::FRAG_IPV6,
            HashClass::Eth => RssTypes::empty(),
        }
    }

    /// Base match priority of the class. More specific classes sit at a
    /// lower (stronger) number so an L4 descriptor always beats the L3
    /// and catch-all descriptors of a coarser flow.
    pub fn flow_priority(self) -> u16 {
        match self {
            HashClass::TcpV4 | HashClass::UdpV4 | HashClass::TcpV6 | HashClass::UdpV6 => 1,
            HashClass::Ipv4 | HashClass::Ipv6 => 2,
            HashClass::Eth => 3,
        }
    }

    /// IP version the class is tied to, if any.
    pub fn ip_version(self) -> Option<IpVersion> {
        match self {
            HashClass::TcpV4 | HashClass::UdpV4 | HashClass::Ipv4 => Some(IpVersion::V4),
            HashClass::TcpV6 | HashClass::UdpV6 | HashClass::Ipv6 => Some(IpVersion::V6),
            HashClass::Eth => None,
        }
    }

    /// Table index of the class.
    pub fn index(self) -> usize {
        match self {
            HashClass::TcpV4 => 0,
            HashClass::UdpV4 => 1,
            HashClass::Ipv4 => 2,
            HashClass::TcpV6 => 3,
            HashClass::UdpV6 => 4,
            HashClass::Ipv6 => 5,
            HashClass::Eth => 6,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn table_order_matches_index() {
        for (i, class) in HASH_CLASSES.iter().enumerate() {
            assert_eq!(class.index(), i);
        }
    }

    #[test]
    fn l4_classes_outrank_l3_and_catch_all() {
        assert!(HashClass::TcpV4.flow_priority() < HashClass::Ipv4.flow_priority());
        assert!(HashClass::Ipv4.flow_priority() < HashClass::Eth.flow_priority());
        assert!(HashClass::UdpV6.flow_priority() < HashClass::Ipv6.flow_priority());
    }

    #[test]
    fn rss_type_rows_are_disjoint() {
        let mut seen = RssTypes::empty();
        for class in HASH_CLASSES {
            assert!((seen & class.rss_types()).is_empty());
            seen |= class.rss_types();
        }
        assert_eq!(seen, RssTypes::all());
    }

    #[test]
    fn catch_all_hashes_nothing() {
        assert!(HashClass::Eth.hash_fields().is_empty());
        assert_eq!(HashClass::Eth.ip_version(), None);
    }
}
