//! Packet-classification offload compiler.
//!
//! Translates a vendor-neutral description of a traffic-steering rule
//! (an ordered pattern of protocol-layer matches plus a list of actions)
//! into hardware match descriptors attached to receive-side contexts,
//! and owns the full lifecycle of the compiled artifacts: validation
//! dry-runs, creation, per-device start/stop reprogramming, teardown and
//! flow-director exact-match add/update/delete.
//!
//! # Architecture
//!
//! ```text
//! pattern + actions
//!       │
//!       ▼
//! [item graph / validator] ──> [action extractor] ──> FlowParser
//!       │                                                │
//!       ▼                                                ▼
//! [hash-class allocator] ──> [spec converters] ──> descriptors
//!                                                        │
//!                                                        ▼
//!                         [FlowOrch] ──> FlowHal ──> hardware objects
//! ```
//!
//! The compiler talks to the device exclusively through
//! [`rxsteer_hal::FlowHal`]; everything above that trait is pure
//! single-threaded control-plane code.

pub mod action;
mod compiler;
pub mod fdir;
pub mod hash_class;
mod hrxq;
pub mod item;
pub mod orch;
mod spec;
pub mod types;

pub use action::{Action, RssAction, RssConf};
pub use fdir::{
    FdirAction, FdirFilter, FdirFlow, FdirInfo, FdirIpv4, FdirIpv6, FdirMasks, FdirMode, FdirPorts,
};
pub use hash_class::HashClass;
pub use item::{EthItem, Ipv4Item, Ipv6Item, MatchItem, Pattern, TcpItem, UdpItem, VlanItem, VxlanItem};
pub use orch::{FlowOrch, FlowOrchConfig, FlowOrchStats};
pub use types::{FlowAttr, FlowError, FlowId, FlowResult, HashFields, RssConfig, RssTypes};
