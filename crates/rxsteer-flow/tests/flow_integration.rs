//! End-to-end checks through the public API: compile rules against a
//! mock HAL and observe the hardware objects that come out.

use pretty_assertions::assert_eq;
use rxsteer_hal::MockHal;

use rxsteer_flow::{
    Action, EthItem, FdirAction, FdirFilter, FdirFlow, FdirIpv4, FdirMasks,
    FdirMode, FdirPorts, FlowAttr, FlowOrch, FlowOrchConfig, Ipv4Item,
    MatchItem, Pattern, RssAction, RssConf, RssConfig, RssTypes, TcpItem,
    UdpItem,
};

fn started_orch(rxqs_n: u16) -> FlowOrch<MockHal> {
    let config = FlowOrchConfig {
        rxqs_n,
        default_rss: RssConfig::default(),
        fdir_mode: FdirMode::Perfect,
        fdir_masks: FdirMasks::default(),
    };
    let mut orch = FlowOrch::new(MockHal::new(), config).unwrap();
    orch.start_all().unwrap();
    orch
}

fn eth() -> MatchItem {
    MatchItem::Eth(Pattern::new(EthItem::default()))
}

fn ipv4(dst: u32) -> MatchItem {
    MatchItem::Ipv4(Pattern::new(Ipv4Item {
        dst,
        ..Ipv4Item::default()
    }))
}

fn tcp(dst_port: u16) -> MatchItem {
    MatchItem::Tcp(Pattern::new(TcpItem {
        src_port: 0,
        dst_port,
    }))
}

fn udp(dst_port: u16) -> MatchItem {
    MatchItem::Udp(Pattern::new(UdpItem {
        src_port: 0,
        dst_port,
    }))
}

fn rss_all(queues: &[u16]) -> Action {
    Action::Rss(RssAction {
        conf: Some(RssConf {
            types: RssTypes::all(),
            key: None,
        }),
        queues: queues.to_vec(),
    })
}

#[test]
fn tcp_rule_programs_exactly_one_class() {
    let mut orch = started_orch(4);
    orch.create(
        &FlowAttr::default(),
        &[eth(), ipv4(0x0a000001), tcp(80)],
        &[rss_all(&[0, 1, 2, 3])],
    )
    .unwrap();
    // A fully specified TCP/IPv4 rule collapses to its own hash class.
    assert_eq!(orch.hal().live_flows(), 1);
    assert_eq!(orch.hal().live_hash_groups(), 1);
}

#[test]
fn ethernet_rule_fans_out_to_every_class() {
    let mut orch = started_orch(4);
    orch.create(&FlowAttr::default(), &[eth()], &[rss_all(&[0, 1, 2, 3])])
        .unwrap();
    // One hardware flow per hash class so every hashed packet kind
    // still lands on the RSS queues.
    assert_eq!(orch.hal().live_flows(), 7);
}

#[test]
fn tcp_and_udp_rules_use_disjoint_classes() {
    let mut orch = started_orch(4);
    let t = orch
        .create(
            &FlowAttr::default(),
            &[eth(), ipv4(0x0a000001), tcp(80)],
            &[rss_all(&[0, 1])],
        )
        .unwrap();
    let u = orch
        .create(
            &FlowAttr::default(),
            &[eth(), ipv4(0x0a000001), udp(53)],
            &[rss_all(&[0, 1])],
        )
        .unwrap();
    assert_eq!(orch.hal().live_flows(), 2);
    // Different hash fields, so the groups are not shared.
    assert_eq!(orch.hal().live_hash_groups(), 2);
    orch.destroy(t).unwrap();
    assert_eq!(orch.hal().live_flows(), 1);
    orch.destroy(u).unwrap();
    assert_eq!(orch.hal().live_hash_groups(), 0);
}

#[test]
fn identical_rules_share_a_hash_group() {
    let mut orch = started_orch(4);
    let a = orch
        .create(
            &FlowAttr::default(),
            &[eth(), ipv4(0x0a000001), tcp(80)],
            &[rss_all(&[0, 1, 2, 3])],
        )
        .unwrap();
    let b = orch
        .create(
            &FlowAttr::default(),
            &[eth(), ipv4(0x0a000002), tcp(81)],
            &[rss_all(&[0, 1, 2, 3])],
        )
        .unwrap();
    assert_eq!(orch.hal().live_hash_groups(), 1);
    orch.destroy(a).unwrap();
    assert_eq!(orch.hal().live_hash_groups(), 1);
    orch.destroy(b).unwrap();
    assert_eq!(orch.hal().live_hash_groups(), 0);
}

#[test]
fn stopped_device_binds_without_programming() {
    let config = FlowOrchConfig {
        rxqs_n: 2,
        default_rss: RssConfig::default(),
        ..FlowOrchConfig::default()
    };
    let mut orch = FlowOrch::new(MockHal::new(), config).unwrap();
    orch.create(
        &FlowAttr::default(),
        &[eth(), ipv4(1), tcp(80)],
        &[rss_all(&[0, 1])],
    )
    .unwrap();
    // Bound flow: hash group held, no hardware flow yet.
    assert_eq!(orch.hal().live_flows(), 0);
    assert_eq!(orch.hal().live_hash_groups(), 1);

    orch.start_all().unwrap();
    assert_eq!(orch.hal().live_flows(), 1);

    orch.stop_all();
    assert_eq!(orch.hal().live_flows(), 0);
    // The compiled flow and its group survive the stop.
    assert_eq!(orch.stats().flows, 1);
    assert_eq!(orch.hal().live_hash_groups(), 1);

    orch.start_all().unwrap();
    assert_eq!(orch.hal().live_flows(), 1);
}

#[test]
fn mark_bit_is_the_union_over_live_flows() {
    let mut orch = started_orch(2);
    let a = orch
        .create(
            &FlowAttr::default(),
            &[eth(), ipv4(1), tcp(80)],
            &[Action::Queue { index: 0 }, Action::Mark { id: 7 }],
        )
        .unwrap();
    let b = orch
        .create(
            &FlowAttr::default(),
            &[eth(), ipv4(2), tcp(81)],
            &[Action::Queue { index: 0 }, Action::Mark { id: 8 }],
        )
        .unwrap();
    assert!(orch.queue_mark_enabled(0));
    assert!(!orch.queue_mark_enabled(1));
    orch.destroy(a).unwrap();
    assert!(orch.queue_mark_enabled(0));
    orch.destroy(b).unwrap();
    assert!(!orch.queue_mark_enabled(0));
}

#[test]
fn validate_allocates_nothing() {
    let orch = started_orch(4);
    orch.validate(
        &FlowAttr::default(),
        &[eth(), ipv4(1), tcp(80)],
        &[rss_all(&[0, 1, 2, 3]), Action::Count],
    )
    .unwrap();
    assert_eq!(orch.hal().live_flows(), 0);
    assert_eq!(orch.hal().live_hash_groups(), 0);
    assert_eq!(orch.hal().live_counters(), 0);
}

#[test]
fn drop_rule_needs_no_hash_group() {
    let mut orch = started_orch(4);
    let id = orch
        .create(
            &FlowAttr::default(),
            &[eth(), ipv4(0x0a0000ff)],
            &[Action::Drop],
        )
        .unwrap();
    assert_eq!(orch.hal().live_flows(), 1);
    assert_eq!(orch.hal().live_hash_groups(), 0);
    orch.destroy(id).unwrap();
    assert_eq!(orch.hal().live_flows(), 0);
    // The shared drop path outlives individual drop flows.
    assert_eq!(orch.hal().live_drop_paths(), 1);
}

#[test]
fn flow_director_round_trip() {
    let mut orch = started_orch(4);
    let filter = FdirFilter {
        flow: FdirFlow::Udp4 {
            ip: FdirIpv4 {
                src: 0xc0a80001,
                dst: 0xc0a80002,
                ..Default::default()
            },
            ports: FdirPorts { src: 0, dst: 4789 },
        },
        action: FdirAction::Accept { rx_queue: 2 },
    };
    orch.fdir_add(&filter).unwrap();
    assert_eq!(orch.stats().flows, 1);
    orch.fdir_delete(&filter).unwrap();
    assert_eq!(orch.stats().flows, 0);
    assert_eq!(orch.hal().live_flows(), 0);
    assert_eq!(orch.hal().live_hash_groups(), 0);
}

#[test]
fn close_returns_the_device_to_empty() {
    let mut orch = started_orch(2);
    orch.create(
        &FlowAttr::default(),
        &[eth(), ipv4(1), tcp(80)],
        &[rss_all(&[0, 1])],
    )
    .unwrap();
    orch.ctrl_flow(
        EthItem {
            dst: [0xff; 6],
            ..EthItem::default()
        },
        EthItem {
            dst: [0xff; 6],
            ..EthItem::default()
        },
    )
    .unwrap();
    let hal = orch.close();
    assert_eq!(hal.live_flows(), 0);
    assert_eq!(hal.live_hash_groups(), 0);
    assert_eq!(hal.live_drop_paths(), 0);
}
