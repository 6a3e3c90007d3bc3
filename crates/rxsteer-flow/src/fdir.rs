//! Flow-director adapter: the legacy exact-match filter interface,
//! expressed as generic flow rules.
//!
//! A flow-director filter names a flow 5-tuple and a queue (or reject).
//! The adapter rewrites it into a pattern of wildcard-Ethernet plus L3
//! and L4 items, with the match *masks* taken from the device-level
//! flow-director configuration rather than the filter, and feeds it to
//! the regular compiler. Deletion has no handle: the filter is
//! recompiled and the resulting descriptor compared structurally
//! against every live flow.

use serde::{Deserialize, Serialize};
use tracing::debug;

use rxsteer_hal::FlowHal;

use crate::action::Action;
use crate::compiler::{self, ConvertCtx};
use crate::hash_class::HashClass;
use crate::item::{
    EthItem, Ipv4Item, Ipv6Item, MatchItem, Pattern, TcpItem, UdpItem,
};
use crate::orch::FlowOrch;
use crate::spec::{self, frag};
use crate::types::{FlowAttr, FlowError, FlowId, FlowResult};

/// Flow-director operating mode, fixed at device configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FdirMode {
    #[default]
    None,
    Signature,
    Perfect,
    PerfectMacVlan,
}

impl FdirMode {
    fn supports_filters(self) -> bool {
        matches!(self, FdirMode::Perfect | FdirMode::PerfectMacVlan)
    }
}

/// Device-level masks applied to every flow-director filter. A zero
/// field wildcards that field in all filters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FdirMasks {
    pub ipv4_src: u32,
    pub ipv4_dst: u32,
    pub ipv4_tos: u8,
    pub ipv4_ttl: u8,
    pub ipv4_proto: u8,
    pub ipv6_src: [u8; 16],
    pub ipv6_dst: [u8; 16],
    pub src_port: u16,
    pub dst_port: u16,
}

impl Default for FdirMasks {
    fn default() -> Self {
        Self {
            ipv4_src: u32::MAX,
            ipv4_dst: u32::MAX,
            ipv4_tos: 0,
            ipv4_ttl: 0,
            ipv4_proto: 0,
            ipv6_src: [0xff; 16],
            ipv6_dst: [0xff; 16],
            src_port: 0xffff,
            dst_port: 0xffff,
        }
    }
}

/// IPv4 half of a filter's flow key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FdirIpv4 {
    pub src: u32,
    pub dst: u32,
    pub tos: u8,
    pub ttl: u8,
    pub proto: u8,
}

/// IPv6 half of a filter's flow key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FdirIpv6 {
    pub src: [u8; 16],
    pub dst: [u8; 16],
    pub proto: u8,
    pub hop_limits: u8,
}

/// L4 ports of a filter's flow key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FdirPorts {
    pub src: u16,
    pub dst: u16,
}

/// The flow key of one filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FdirFlow {
    Ipv4(FdirIpv4),
    Udp4 { ip: FdirIpv4, ports: FdirPorts },
    Tcp4 { ip: FdirIpv4, ports: FdirPorts },
    Ipv6(FdirIpv6),
    Udp6 { ip: FdirIpv6, ports: FdirPorts },
    Tcp6 { ip: FdirIpv6, ports: FdirPorts },
}

/// What to do with packets matching a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FdirAction {
    Accept { rx_queue: u16 },
    Reject,
}

/// One flow-director filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FdirFilter {
    pub flow: FdirFlow,
    pub action: FdirAction,
}

/// Flow-director capabilities of a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FdirInfo {
    pub mode: FdirMode,
    pub masks: FdirMasks,
}

impl<H: FlowHal> FlowOrch<H> {
    /// Install a flow-director filter as a regular flow.
    pub fn fdir_add(&mut self, filter: &FdirFilter) -> FlowResult<FlowId> {
        self.fdir_check_mode()?;
        let (attr, pattern, actions) = self.fdir_convert(filter)?;
        self.validate(&attr, &pattern, &actions)?;
        let id = self.create(&attr, &pattern, &actions)?;
        debug!(flow = %id, "flow director filter created");
        Ok(id)
    }

    /// Remove the flow matching `filter` exactly.
    ///
    /// The filter is recompiled and its descriptor compared against
    /// every live flow in the class the filter lands on: first the
    /// attribute header, then each fragment over the shorter of the
    /// two fragment lengths.
    pub fn fdir_delete(&mut self, filter: &FdirFilter) -> FlowResult<()> {
        self.fdir_check_mode()?;
        let (attr, pattern, actions) = self.fdir_convert(filter)?;
        let ctx = ConvertCtx {
            rxqs_n: self.rxqs_n(),
            default_rss: self.default_rss(),
        };
        let mut parser =
            compiler::convert(self.hal(), &ctx, &attr, &pattern, &actions, true)?;
        // The drop fragment only exists in descriptors that went
        // through the creation path; graft it onto the needle too.
        if parser.drop {
            if let Some(desc) = parser.classes[HashClass::Eth.index()].buf.as_mut() {
                desc.append(&spec::filler(frag::DROP, spec::DROP_SPEC_SIZE));
            }
        }
        let class = if parser.drop {
            HashClass::Eth
        } else {
            parser.layer
        };
        let Some(needle) = parser.class_buf(class) else {
            return Err(FlowError::NotFound(
                "no flow director filter matched".into(),
            ));
        };
        let Some(id) = self.find_flow_by_descriptor(class, |candidate| {
            if candidate.attr_bytes() != needle.attr_bytes() {
                return false;
            }
            if needle.fragment_count() == 0 {
                return false;
            }
            let n = usize::from(needle.fragment_count().min(candidate.fragment_count()));
            needle
                .fragments()
                .zip(candidate.fragments())
                .take(n)
                .all(|(a, b)| {
                    let len = a.bytes.len().min(b.bytes.len());
                    a.bytes[..len] == b.bytes[..len]
                })
        }) else {
            return Err(FlowError::NotFound(
                "no flow director filter matched".into(),
            ));
        };
        self.destroy(id)?;
        debug!(flow = %id, "flow director filter deleted");
        Ok(())
    }

    /// Re-point an existing filter: delete the old instance, then add
    /// the new one.
    pub fn fdir_update(&mut self, filter: &FdirFilter) -> FlowResult<FlowId> {
        self.fdir_delete(filter)?;
        self.fdir_add(filter)
    }

    /// Remove every filter. Flow-director state is not tracked apart
    /// from the flow list, so this clears all user flows.
    pub fn fdir_flush(&mut self) -> FlowResult<()> {
        self.fdir_check_mode()?;
        self.flush();
        Ok(())
    }

    /// Report the device's flow-director configuration.
    pub fn fdir_info(&self) -> FdirInfo {
        FdirInfo {
            mode: self.fdir_mode(),
            masks: self.fdir_masks().clone(),
        }
    }

    fn fdir_check_mode(&self) -> FlowResult<()> {
        if !self.fdir_mode().supports_filters() {
            return Err(FlowError::InvalidArgument(format!(
                "flow director mode {:?} not supported",
                self.fdir_mode()
            )));
        }
        Ok(())
    }

    /// Rewrite a filter into attribute, pattern and actions for the
    /// compiler. Specs come from the filter, masks from the device
    /// configuration.
    fn fdir_convert(
        &self,
        filter: &FdirFilter,
    ) -> FlowResult<(FlowAttr, Vec<MatchItem>, Vec<Action>)> {
        let masks = self.fdir_masks();
        let action = match filter.action {
            FdirAction::Accept { rx_queue } => {
                if rx_queue >= self.rxqs_n() {
                    return Err(FlowError::InvalidArgument(format!(
                        "invalid queue number {rx_queue}"
                    )));
                }
                Action::Queue { index: rx_queue }
            }
            FdirAction::Reject => Action::Drop,
        };
        // Wildcard Ethernet layer in front of every filter.
        let mut pattern = vec![MatchItem::Eth(Pattern::with_mask(
            EthItem::default(),
            EthItem {
                dst: [0; 6],
                src: [0; 6],
                ether_type: 0,
            },
        ))];
        let ipv4_item = |ip: &FdirIpv4| {
            MatchItem::Ipv4(Pattern::with_mask(
                Ipv4Item {
                    src: ip.src,
                    dst: ip.dst,
                    tos: ip.tos,
                    ttl: ip.ttl,
                    proto: ip.proto,
                },
                Ipv4Item {
                    src: masks.ipv4_src,
                    dst: masks.ipv4_dst,
                    tos: masks.ipv4_tos,
                    ttl: masks.ipv4_ttl,
                    proto: masks.ipv4_proto,
                },
            ))
        };
        let ipv6_item = |ip: &FdirIpv6| {
            MatchItem::Ipv6(Pattern::with_mask(
                Ipv6Item {
                    src: ip.src,
                    dst: ip.dst,
                    vtc_flow: 0,
                    proto: ip.proto,
                    hop_limits: ip.hop_limits,
                },
                Ipv6Item {
                    src: masks.ipv6_src,
                    dst: masks.ipv6_dst,
                    vtc_flow: 0,
                    proto: 0,
                    hop_limits: 0,
                },
            ))
        };
        let udp_item = |ports: &FdirPorts| {
            MatchItem::Udp(Pattern::with_mask(
                UdpItem {
                    src_port: ports.src,
                    dst_port: ports.dst,
                },
                UdpItem {
                    src_port: masks.src_port,
                    dst_port: masks.dst_port,
                },
            ))
        };
        let tcp_item = |ports: &FdirPorts| {
            MatchItem::Tcp(Pattern::with_mask(
                TcpItem {
                    src_port: ports.src,
                    dst_port: ports.dst,
                },
                TcpItem {
                    src_port: masks.src_port,
                    dst_port: masks.dst_port,
                },
            ))
        };
        match &filter.flow {
            FdirFlow::Ipv4(ip) => pattern.push(ipv4_item(ip)),
            FdirFlow::Udp4 { ip, ports } => {
                pattern.push(ipv4_item(ip));
                pattern.push(udp_item(ports));
            }
            FdirFlow::Tcp4 { ip, ports } => {
                pattern.push(ipv4_item(ip));
                pattern.push(tcp_item(ports));
            }
            FdirFlow::Ipv6(ip) => pattern.push(ipv6_item(ip)),
            FdirFlow::Udp6 { ip, ports } => {
                pattern.push(ipv6_item(ip));
                pattern.push(udp_item(ports));
            }
            FdirFlow::Tcp6 { ip, ports } => {
                pattern.push(ipv6_item(ip));
                pattern.push(tcp_item(ports));
            }
        }
        Ok((FlowAttr::default(), pattern, vec![action]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rxsteer_hal::MockHal;

    use crate::orch::FlowOrchConfig;
    use crate::types::RssConfig;

    fn fdir_orch() -> FlowOrch<MockHal> {
        let config = FlowOrchConfig {
            rxqs_n: 4,
            default_rss: RssConfig::default(),
            fdir_mode: FdirMode::Perfect,
            fdir_masks: FdirMasks::default(),
        };
        let mut orch = FlowOrch::new(MockHal::new(), config).unwrap();
        orch.start_all().unwrap();
        orch
    }

    fn tcp4_filter(dst_port: u16, rx_queue: u16) -> FdirFilter {
        FdirFilter {
            flow: FdirFlow::Tcp4 {
                ip: FdirIpv4 {
                    src: 0x0a000001,
                    dst: 0x0a000002,
                    ..Default::default()
                },
                ports: FdirPorts {
                    src: 0,
                    dst: dst_port,
                },
            },
            action: FdirAction::Accept { rx_queue },
        }
    }

    #[test]
    fn filters_require_perfect_mode() {
        let config = FlowOrchConfig {
            rxqs_n: 4,
            default_rss: RssConfig::default(),
            ..FlowOrchConfig::default()
        };
        let mut orch = FlowOrch::new(MockHal::new(), config).unwrap();
        let err = orch.fdir_add(&tcp4_filter(80, 0)).unwrap_err();
        assert!(matches!(err, FlowError::InvalidArgument(_)));
    }

    #[test]
    fn add_then_delete_finds_the_exact_filter() {
        let mut orch = fdir_orch();
        orch.fdir_add(&tcp4_filter(80, 1)).unwrap();
        orch.fdir_add(&tcp4_filter(443, 2)).unwrap();
        assert_eq!(orch.stats().flows, 2);
        orch.fdir_delete(&tcp4_filter(80, 1)).unwrap();
        assert_eq!(orch.stats().flows, 1);
        // The remaining filter is still deletable.
        orch.fdir_delete(&tcp4_filter(443, 2)).unwrap();
        assert_eq!(orch.stats().flows, 0);
        assert_eq!(orch.hal().live_flows(), 0);
    }

    #[test]
    fn delete_of_unknown_filter_is_not_found() {
        let mut orch = fdir_orch();
        orch.fdir_add(&tcp4_filter(80, 1)).unwrap();
        let err = orch.fdir_delete(&tcp4_filter(81, 1)).unwrap_err();
        assert!(matches!(err, FlowError::NotFound(_)));
        assert_eq!(orch.stats().flows, 1);
    }

    #[test]
    fn reject_filters_compile_to_drop_flows() {
        let mut orch = fdir_orch();
        let filter = FdirFilter {
            flow: FdirFlow::Ipv4(FdirIpv4 {
                dst: 0x0a0000ff,
                ..Default::default()
            }),
            action: FdirAction::Reject,
        };
        orch.fdir_add(&filter).unwrap();
        assert_eq!(orch.hal().live_hash_groups(), 0);
        orch.fdir_delete(&filter).unwrap();
        assert_eq!(orch.stats().flows, 0);
    }

    #[test]
    fn update_replaces_the_queue() {
        let mut orch = fdir_orch();
        orch.fdir_add(&tcp4_filter(80, 1)).unwrap();
        // Same flow key, new queue: the key matches because masks and
        // pattern are identical; only the action differs, which the
        // descriptor does not encode for accept filters.
        orch.fdir_update(&tcp4_filter(80, 1)).unwrap();
        assert_eq!(orch.stats().flows, 1);
    }

    #[test]
    fn invalid_queue_is_rejected() {
        let mut orch = fdir_orch();
        let err = orch.fdir_add(&tcp4_filter(80, 9)).unwrap_err();
        assert!(matches!(err, FlowError::InvalidArgument(_)));
    }

    #[test]
    fn ttl_mask_in_device_config_is_rejected() {
        let config = FlowOrchConfig {
            rxqs_n: 4,
            default_rss: RssConfig::default(),
            fdir_mode: FdirMode::Perfect,
            fdir_masks: FdirMasks {
                ipv4_ttl: 0xff,
                ..FdirMasks::default()
            },
        };
        let mut orch = FlowOrch::new(MockHal::new(), config).unwrap();
        let err = orch.fdir_add(&tcp4_filter(80, 1)).unwrap_err();
        assert!(matches!(err, FlowError::Unsupported(_)));
    }

    #[test]
    fn info_reports_the_device_configuration() {
        let orch = fdir_orch();
        let info = orch.fdir_info();
        assert_eq!(info.mode, FdirMode::Perfect);
        assert_eq!(info.masks, FdirMasks::default());
    }

    #[test]
    fn flush_clears_all_filters() {
        let mut orch = fdir_orch();
        orch.fdir_add(&tcp4_filter(80, 1)).unwrap();
        orch.fdir_add(&tcp4_filter(443, 2)).unwrap();
        orch.fdir_flush().unwrap();
        assert_eq!(orch.stats().flows, 0);
        assert_eq!(orch.hal().live_flows(), 0);
    }
}
