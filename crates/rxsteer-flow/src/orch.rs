//! Device-level flow orchestration: the list of live compiled flows,
//! shared hash-queue groups, per-queue mark bits and the drop path.
//!
//! Flows exist in two states. A bound flow owns its descriptors, hash
//! groups and counter but no hardware flow objects; a live flow has the
//! descriptors programmed. `start_all` promotes every flow to live and
//! `stop_all` demotes them, which is how the device start/stop cycle
//! reprograms steering without recompiling anything.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, warn};

use rxsteer_hal::{CounterStats, DropPathId, FlowHal, FlowObjectId, FlowTarget};

use crate::action::{Action, RssAction};
use crate::compiler::{self, ConvertCtx, FlowParser};
use crate::fdir::{FdirMasks, FdirMode};
use crate::hash_class::{HashClass, HASH_CLASSES};
use crate::hrxq::{HashGroupCache, HrxqKey};
use crate::item::{EthItem, MatchItem, Pattern, VlanItem};
use crate::spec::{self, frag, Descriptor};
use crate::types::{
    FlowAttr, FlowError, FlowId, FlowResult, RssConfig, CTRL_FLOW_PRIORITY,
};

/// Static device parameters for the orchestrator.
#[derive(Debug, Clone)]
pub struct FlowOrchConfig {
    /// Number of receive queues configured on the device.
    pub rxqs_n: u16,
    /// RSS configuration applied when a flow does not carry its own.
    pub default_rss: RssConfig,
    /// Flow-director operating mode.
    pub fdir_mode: FdirMode,
    /// Device-level masks applied to flow-director filters.
    pub fdir_masks: FdirMasks,
}

impl Default for FlowOrchConfig {
    fn default() -> Self {
        Self {
            rxqs_n: 1,
            default_rss: RssConfig {
                types: crate::types::RssTypes::empty(),
                ..RssConfig::default()
            },
            fdir_mode: FdirMode::default(),
            fdir_masks: FdirMasks::default(),
        }
    }
}

/// Counters exposed for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct FlowOrchStats {
    pub flows: usize,
    pub ctrl_flows: usize,
    pub hash_groups: usize,
    pub started: bool,
    pub isolated: bool,
}

/// One hash class of a compiled flow.
struct ClassFlow {
    descriptor: Descriptor,
    hw_flow: Option<FlowObjectId>,
    hash_group: Option<HrxqKey>,
}

/// A compiled flow held in one of the device lists.
struct CompiledFlow {
    id: FlowId,
    drop: bool,
    mark: bool,
    queues: Vec<u16>,
    rss: RssConfig,
    counter: Option<rxsteer_hal::CounterId>,
    counter_base: CounterStats,
    classes: [Option<ClassFlow>; 7],
}

impl CompiledFlow {
    fn is_live(&self) -> bool {
        self.classes
            .iter()
            .flatten()
            .any(|c| c.hw_flow.is_some())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum FlowList {
    User,
    Ctrl,
}

/// Flow orchestrator for one device.
pub struct FlowOrch<H: FlowHal> {
    hal: H,
    rxqs_n: u16,
    default_rss: RssConfig,
    flows: Vec<CompiledFlow>,
    ctrl_flows: Vec<CompiledFlow>,
    hash_groups: HashGroupCache,
    queue_marks: Vec<AtomicBool>,
    drop_path: DropPathId,
    started: bool,
    isolated: bool,
    next_flow_id: u64,
    fdir_mode: FdirMode,
    fdir_masks: FdirMasks,
}

impl<H: FlowHal> FlowOrch<H> {
    /// Set up the orchestrator, creating the shared drop path.
    pub fn new(hal: H, config: FlowOrchConfig) -> FlowResult<Self> {
        let drop_path = hal.create_drop_path().map_err(|e| {
            FlowError::ResourceExhausted(format!("cannot create drop path: {e}"))
        })?;
        debug!(drop_path = %drop_path, rxqs = config.rxqs_n, "flow orchestrator ready");
        Ok(Self {
            hal,
            rxqs_n: config.rxqs_n,
            default_rss: config.default_rss,
            flows: Vec::new(),
            ctrl_flows: Vec::new(),
            hash_groups: HashGroupCache::default(),
            queue_marks: (0..config.rxqs_n).map(|_| AtomicBool::new(false)).collect(),
            drop_path,
            started: false,
            isolated: false,
            next_flow_id: 1,
            fdir_mode: config.fdir_mode,
            fdir_masks: config.fdir_masks,
        })
    }

    pub fn hal(&self) -> &H {
        &self.hal
    }

    pub(crate) fn rxqs_n(&self) -> u16 {
        self.rxqs_n
    }

    pub(crate) fn default_rss(&self) -> &RssConfig {
        &self.default_rss
    }

    pub(crate) fn fdir_mode(&self) -> FdirMode {
        self.fdir_mode
    }

    pub(crate) fn fdir_masks(&self) -> &FdirMasks {
        &self.fdir_masks
    }

    /// Scan the user flow list for a flow whose descriptor at `class`
    /// satisfies the predicate.
    pub(crate) fn find_flow_by_descriptor(
        &self,
        class: HashClass,
        pred: impl Fn(&Descriptor) -> bool,
    ) -> Option<FlowId> {
        self.flows.iter().find_map(|flow| {
            let slot = flow.classes[class.index()].as_ref()?;
            pred(&slot.descriptor).then_some(flow.id)
        })
    }

    /// Dry-run compile of a rule; nothing is allocated.
    pub fn validate(
        &self,
        attr: &FlowAttr,
        pattern: &[MatchItem],
        actions: &[Action],
    ) -> FlowResult<()> {
        let ctx = ConvertCtx {
            rxqs_n: self.rxqs_n,
            default_rss: &self.default_rss,
        };
        compiler::convert(&self.hal, &ctx, attr, pattern, actions, false).map(|_| ())
    }

    /// Compile a rule and add it to the device. The flow goes live
    /// immediately when the device is started, otherwise it stays
    /// bound until `start_all`.
    pub fn create(
        &mut self,
        attr: &FlowAttr,
        pattern: &[MatchItem],
        actions: &[Action],
    ) -> FlowResult<FlowId> {
        self.list_create(FlowList::User, attr, pattern, actions)
    }

    /// Destroy a flow and every resource it holds.
    pub fn destroy(&mut self, id: FlowId) -> FlowResult<()> {
        let Some(idx) = self.flows.iter().position(|f| f.id == id) else {
            return Err(FlowError::NotFound(format!("{id} is not a known flow")));
        };
        self.destroy_at(FlowList::User, idx);
        Ok(())
    }

    /// Destroy every user flow.
    pub fn flush(&mut self) {
        while !self.flows.is_empty() {
            self.destroy_at(FlowList::User, 0);
        }
    }

    /// Promote every bound flow to live. On any failure the device is
    /// returned to the fully stopped state before the error surfaces.
    pub fn start_all(&mut self) -> FlowResult<()> {
        if self.started {
            return Ok(());
        }
        self.started = true;
        for list in [FlowList::Ctrl, FlowList::User] {
            let n = self.list_len(list);
            for idx in 0..n {
                if let Err(e) = self.promote_at(list, idx) {
                    self.stop_all();
                    return Err(e);
                }
            }
        }
        debug!(
            flows = self.flows.len(),
            ctrl_flows = self.ctrl_flows.len(),
            "flows started"
        );
        Ok(())
    }

    /// Demote every flow to bound: hardware flow objects are destroyed
    /// and mark bits cleared, descriptors and hash groups are kept.
    pub fn stop_all(&mut self) {
        if !self.started {
            return;
        }
        self.started = false;
        for list in [FlowList::User, FlowList::Ctrl] {
            for idx in (0..self.list_len(list)).rev() {
                self.demote_at(list, idx);
            }
        }
        for mark in &self.queue_marks {
            mark.store(false, Ordering::Release);
        }
        debug!("flows stopped");
    }

    /// Toggle isolated mode. In isolated mode no control flows exist,
    /// so only explicitly created rules receive traffic; the switch is
    /// only allowed while the device is stopped.
    pub fn isolate(&mut self, enable: bool) -> FlowResult<()> {
        if self.started {
            return Err(FlowError::Conflict(
                "isolated mode cannot change while started".into(),
            ));
        }
        self.isolated = enable;
        Ok(())
    }

    pub fn is_isolated(&self) -> bool {
        self.isolated
    }

    /// Whether packets on `queue` may carry a flow mark.
    pub fn queue_mark_enabled(&self, queue: u16) -> bool {
        self.queue_marks
            .get(usize::from(queue))
            .map(|m| m.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Read a flow's counter relative to the last reset.
    pub fn query_count(&mut self, id: FlowId, reset: bool) -> FlowResult<CounterStats> {
        let Some(flow) = self.flows.iter_mut().find(|f| f.id == id) else {
            return Err(FlowError::NotFound(format!("{id} is not a known flow")));
        };
        let Some(counter) = flow.counter else {
            return Err(FlowError::InvalidArgument(format!(
                "{id} has no counter"
            )));
        };
        let raw = self.hal.query_counter(counter).map_err(|e| {
            FlowError::InvalidArgument(format!("counter query failed: {e}"))
        })?;
        let stats = CounterStats {
            hits: raw.hits - flow.counter_base.hits,
            bytes: raw.bytes - flow.counter_base.bytes,
        };
        if reset {
            flow.counter_base = raw;
        }
        Ok(stats)
    }

    /// Install a control flow matching `eth_spec`/`eth_mask`, spread
    /// over every configured queue at the reserved control priority.
    pub fn ctrl_flow(&mut self, eth_spec: EthItem, eth_mask: EthItem) -> FlowResult<FlowId> {
        self.ctrl_flow_vlan(eth_spec, eth_mask, None)
    }

    /// Control flow with an optional VLAN constraint.
    pub fn ctrl_flow_vlan(
        &mut self,
        eth_spec: EthItem,
        eth_mask: EthItem,
        vlan: Option<(VlanItem, VlanItem)>,
    ) -> FlowResult<FlowId> {
        if self.isolated {
            return Err(FlowError::Conflict(
                "control flows are disabled in isolated mode".into(),
            ));
        }
        let attr = FlowAttr {
            priority: CTRL_FLOW_PRIORITY,
            ..FlowAttr::default()
        };
        let mut pattern = vec![MatchItem::Eth(Pattern::with_mask(eth_spec, eth_mask))];
        if let Some((spec, mask)) = vlan {
            pattern.push(MatchItem::Vlan(Pattern::with_mask(spec, mask)));
        }
        let actions = [Action::Rss(RssAction {
            conf: None,
            queues: (0..self.rxqs_n).collect(),
        })];
        self.list_create(FlowList::Ctrl, &attr, &pattern, &actions)
    }

    /// Destroy every control flow.
    pub fn flush_ctrl(&mut self) {
        while !self.ctrl_flows.is_empty() {
            self.destroy_at(FlowList::Ctrl, 0);
        }
    }

    pub fn stats(&self) -> FlowOrchStats {
        FlowOrchStats {
            flows: self.flows.len(),
            ctrl_flows: self.ctrl_flows.len(),
            hash_groups: self.hash_groups.len(),
            started: self.started,
            isolated: self.isolated,
        }
    }

    /// Log any flow still present and return how many there are.
    pub fn verify(&self) -> usize {
        for flow in self.flows.iter().chain(self.ctrl_flows.iter()) {
            warn!(flow = %flow.id, "flow still referenced");
        }
        self.flows.len() + self.ctrl_flows.len()
    }

    /// Tear the device down: all flows, then the drop path. Hands the
    /// HAL back to the caller.
    pub fn close(mut self) -> H {
        self.flush();
        self.flush_ctrl();
        if let Err(e) = self.hal.destroy_drop_path(self.drop_path) {
            warn!(error = %e, "drop path destruction failed");
        }
        self.hal
    }

    fn list_len(&self, list: FlowList) -> usize {
        match list {
            FlowList::User => self.flows.len(),
            FlowList::Ctrl => self.ctrl_flows.len(),
        }
    }

    fn list_mut(&mut self, list: FlowList) -> &mut Vec<CompiledFlow> {
        match list {
            FlowList::User => &mut self.flows,
            FlowList::Ctrl => &mut self.ctrl_flows,
        }
    }

    fn list_create(
        &mut self,
        list: FlowList,
        attr: &FlowAttr,
        pattern: &[MatchItem],
        actions: &[Action],
    ) -> FlowResult<FlowId> {
        let ctx = ConvertCtx {
            rxqs_n: self.rxqs_n,
            default_rss: &self.default_rss,
        };
        let parser = compiler::convert(&self.hal, &ctx, attr, pattern, actions, true)?;
        let id = FlowId(self.next_flow_id);
        let mut flow = CompiledFlow {
            id,
            drop: parser.drop,
            mark: parser.mark,
            queues: parser.queues.clone(),
            rss: parser.rss.clone(),
            counter: parser.counter,
            counter_base: CounterStats::default(),
            classes: Default::default(),
        };
        let result = if parser.drop {
            self.setup_drop_flow(&mut flow, parser)
        } else {
            self.setup_queue_flow(&mut flow, parser)
        };
        if let Err(e) = result {
            self.release_flow_resources(&mut flow);
            return Err(e);
        }
        self.next_flow_id += 1;
        debug!(flow = %id, drop = flow.drop, queues = ?flow.queues, "flow created");
        self.list_mut(list).push(flow);
        Ok(id)
    }

    /// Attach the drop descriptor to the flow and program it when the
    /// device is started. The drop fragment is appended here rather
    /// than by the compiler, matching the descriptor the device
    /// actually sees.
    fn setup_drop_flow(&mut self, flow: &mut CompiledFlow, mut parser: FlowParser) -> FlowResult<()> {
        let mut descriptor = parser.classes[HashClass::Eth.index()]
            .take()
            .ok_or_else(|| {
                FlowError::InvalidArgument("internal error in flow creation".into())
            })?;
        descriptor.append(&spec::filler(frag::DROP, spec::DROP_SPEC_SIZE));
        let hw_flow = if self.started {
            Some(
                self.hal
                    .create_flow(FlowTarget::DropPath(self.drop_path), descriptor.as_bytes())
                    .map_err(|e| {
                        FlowError::ResourceExhausted(format!("flow rule creation failure: {e}"))
                    })?,
            )
        } else {
            None
        };
        flow.classes[HashClass::Eth.index()] = Some(ClassFlow {
            descriptor,
            hw_flow,
            hash_group: None,
        });
        Ok(())
    }

    /// Move descriptors out of the parser, acquire the hash group of
    /// every populated class, and when started program the flow
    /// objects.
    fn setup_queue_flow(
        &mut self,
        flow: &mut CompiledFlow,
        mut parser: FlowParser,
    ) -> FlowResult<()> {
        for class in HASH_CLASSES {
            let Some(descriptor) = parser.classes[class.index()].take() else {
                continue;
            };
            let key = HrxqKey {
                key: flow.rss.key,
                hash_fields: class.hash_fields(),
                queues: flow.queues.clone(),
            };
            let (key, _) = self.hash_groups.acquire(&self.hal, key)?;
            flow.classes[class.index()] = Some(ClassFlow {
                descriptor,
                hw_flow: None,
                hash_group: Some(key),
            });
        }
        if !self.started {
            return Ok(());
        }
        let mut created = 0usize;
        for class in HASH_CLASSES {
            let Some(class_flow) = &mut flow.classes[class.index()] else {
                continue;
            };
            let Some(key) = &class_flow.hash_group else {
                continue;
            };
            let group = self
                .hash_groups
                .id(key)
                .ok_or_else(|| FlowError::NotFound("hash-queue group vanished".into()))?;
            let hw_flow = self
                .hal
                .create_flow(FlowTarget::HashGroup(group), class_flow.descriptor.as_bytes())
                .map_err(|e| {
                    FlowError::ResourceExhausted(format!("flow rule creation failure: {e}"))
                })?;
            class_flow.hw_flow = Some(hw_flow);
            created += 1;
        }
        if created == 0 {
            return Err(FlowError::InvalidArgument(
                "internal error in flow creation".into(),
            ));
        }
        if flow.mark {
            for &q in &flow.queues {
                if let Some(m) = self.queue_marks.get(usize::from(q)) {
                    m.store(true, Ordering::Release);
                }
            }
        }
        Ok(())
    }

    /// Program the hardware objects of one bound flow.
    fn promote_at(&mut self, list: FlowList, idx: usize) -> FlowResult<()> {
        // Work on the flow in place; only disjoint fields of self are
        // touched while the list element is borrowed.
        let flow = match list {
            FlowList::User => &mut self.flows[idx],
            FlowList::Ctrl => &mut self.ctrl_flows[idx],
        };
        if flow.is_live() {
            return Ok(());
        }
        let drop_target = FlowTarget::DropPath(self.drop_path);
        for class in HASH_CLASSES {
            let Some(class_flow) = &mut flow.classes[class.index()] else {
                continue;
            };
            let target = match &class_flow.hash_group {
                Some(key) => FlowTarget::HashGroup(
                    self.hash_groups
                        .id(key)
                        .ok_or_else(|| FlowError::NotFound("hash-queue group vanished".into()))?,
                ),
                None => drop_target,
            };
            let hw_flow = self
                .hal
                .create_flow(target, class_flow.descriptor.as_bytes())
                .map_err(|e| {
                    FlowError::ResourceExhausted(format!("flow rule creation failure: {e}"))
                })?;
            class_flow.hw_flow = Some(hw_flow);
        }
        if flow.mark {
            for &q in &flow.queues {
                if let Some(m) = self.queue_marks.get(usize::from(q)) {
                    m.store(true, Ordering::Release);
                }
            }
        }
        Ok(())
    }

    /// Destroy the hardware objects of one flow, keeping descriptors
    /// and hash groups for a later promote.
    fn demote_at(&mut self, list: FlowList, idx: usize) {
        let hal = &self.hal;
        let flow = match list {
            FlowList::User => &mut self.flows[idx],
            FlowList::Ctrl => &mut self.ctrl_flows[idx],
        };
        for class_flow in flow.classes.iter_mut().flatten() {
            if let Some(hw_flow) = class_flow.hw_flow.take() {
                if let Err(e) = hal.destroy_flow(hw_flow) {
                    warn!(flow = %flow.id, error = %e, "flow object destruction failed");
                }
            }
        }
    }

    /// Remove a flow from its list and free everything it owns,
    /// recomputing the mark bit of each of its queues from the flows
    /// that remain.
    fn destroy_at(&mut self, list: FlowList, idx: usize) {
        let mut flow = self.list_mut(list).remove(idx);
        if !flow.drop && flow.mark {
            for &q in &flow.queues {
                let still_marked = self
                    .list_mut(list)
                    .iter()
                    .any(|f| f.mark && f.is_live() && f.queues.contains(&q));
                if let Some(m) = self.queue_marks.get(usize::from(q)) {
                    m.store(still_marked, Ordering::Release);
                }
            }
        }
        self.release_flow_resources(&mut flow);
        debug!(flow = %flow.id, "flow destroyed");
    }

    /// Free every hardware object and reference a flow holds, in
    /// dependency order: flow objects, then hash groups, then the
    /// counter.
    fn release_flow_resources(&mut self, flow: &mut CompiledFlow) {
        for class_flow in flow.classes.iter_mut().flatten() {
            if let Some(hw_flow) = class_flow.hw_flow.take() {
                if let Err(e) = self.hal.destroy_flow(hw_flow) {
                    warn!(flow = %flow.id, error = %e, "flow object destruction failed");
                }
            }
            if let Some(key) = class_flow.hash_group.take() {
                self.hash_groups.release(&self.hal, &key);
            }
        }
        if let Some(counter) = flow.counter.take() {
            if let Err(e) = self.hal.destroy_counter(counter) {
                warn!(flow = %flow.id, error = %e, "counter destruction failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rxsteer_hal::MockHal;

    use crate::item::{Ipv4Item, TcpItem, UdpItem};
    use crate::types::RssTypes;

    fn orch(rxqs_n: u16) -> FlowOrch<MockHal> {
        let config = FlowOrchConfig {
            rxqs_n,
            default_rss: RssConfig::default(),
            ..FlowOrchConfig::default()
        };
        FlowOrch::new(MockHal::new(), config).unwrap()
    }

    fn started_orch(rxqs_n: u16) -> FlowOrch<MockHal> {
        let mut orch = orch(rxqs_n);
        orch.start_all().unwrap();
        orch
    }

    fn eth() -> MatchItem {
        MatchItem::Eth(Pattern::new(EthItem::default()))
    }

    fn ipv4_tcp(dst_port: u16) -> Vec<MatchItem> {
        vec![
            eth(),
            MatchItem::Ipv4(Pattern::new(Ipv4Item {
                dst: 0x0a000001,
                ..Default::default()
            })),
            MatchItem::Tcp(Pattern::new(TcpItem {
                dst_port,
                ..Default::default()
            })),
        ]
    }

    fn rss(queues: &[u16]) -> Action {
        Action::Rss(RssAction {
            conf: None,
            queues: queues.to_vec(),
        })
    }

    #[test]
    fn create_destroy_round_trip_releases_everything() {
        let mut orch = started_orch(4);
        let id = orch
            .create(&FlowAttr::default(), &ipv4_tcp(80), &[rss(&[0, 1])])
            .unwrap();
        assert_eq!(orch.hal().live_flows(), 1);
        assert_eq!(orch.hal().live_hash_groups(), 1);
        orch.destroy(id).unwrap();
        assert_eq!(orch.hal().live_flows(), 0);
        assert_eq!(orch.hal().live_hash_groups(), 0);
        assert_eq!(orch.stats().flows, 0);
    }

    #[test]
    fn destroy_unknown_flow_is_not_found() {
        let mut orch = orch(2);
        assert!(matches!(
            orch.destroy(FlowId(99)),
            Err(FlowError::NotFound(_))
        ));
    }

    #[test]
    fn flows_created_stopped_go_live_on_start() {
        let mut orch = orch(4);
        orch.create(&FlowAttr::default(), &ipv4_tcp(80), &[rss(&[0, 1])])
            .unwrap();
        // Bound: groups held, nothing programmed.
        assert_eq!(orch.hal().live_flows(), 0);
        assert_eq!(orch.hal().live_hash_groups(), 1);
        orch.start_all().unwrap();
        assert_eq!(orch.hal().live_flows(), 1);
        orch.stop_all();
        assert_eq!(orch.hal().live_flows(), 0);
        // Demotion keeps the groups for the next start.
        assert_eq!(orch.hal().live_hash_groups(), 1);
    }

    #[test]
    fn failed_start_rolls_back_completely() {
        let mut orch = orch(4);
        orch.create(&FlowAttr::default(), &ipv4_tcp(80), &[rss(&[0, 1])])
            .unwrap();
        orch.create(&FlowAttr::default(), &ipv4_tcp(443), &[rss(&[0, 1])])
            .unwrap();
        orch.hal().fail_create_flow_after(1);
        assert!(orch.start_all().is_err());
        assert!(!orch.stats().started);
        assert_eq!(orch.hal().live_flows(), 0);
    }

    #[test]
    fn failed_create_leaves_no_residue() {
        let mut orch = started_orch(4);
        orch.hal().fail_create_flow_after(0);
        let err = orch
            .create(&FlowAttr::default(), &ipv4_tcp(80), &[rss(&[0, 1])])
            .unwrap_err();
        assert!(matches!(err, FlowError::ResourceExhausted(_)));
        assert_eq!(orch.stats().flows, 0);
        assert_eq!(orch.hal().live_flows(), 0);
        assert_eq!(orch.hal().live_hash_groups(), 0);
    }

    #[test]
    fn two_flows_share_one_hash_group() {
        let mut orch = started_orch(4);
        let a = orch
            .create(&FlowAttr::default(), &ipv4_tcp(80), &[rss(&[0, 1])])
            .unwrap();
        let b = orch
            .create(&FlowAttr::default(), &ipv4_tcp(443), &[rss(&[0, 1])])
            .unwrap();
        assert_eq!(orch.hal().live_hash_groups(), 1);
        orch.destroy(a).unwrap();
        assert_eq!(orch.hal().live_hash_groups(), 1);
        orch.destroy(b).unwrap();
        assert_eq!(orch.hal().live_hash_groups(), 0);
    }

    #[test]
    fn drop_flow_targets_the_drop_path() {
        let mut orch = started_orch(2);
        let id = orch
            .create(&FlowAttr::default(), &[eth()], &[Action::Drop])
            .unwrap();
        assert_eq!(orch.hal().live_flows(), 1);
        assert_eq!(orch.hal().live_hash_groups(), 0);
        orch.destroy(id).unwrap();
        assert_eq!(orch.hal().live_flows(), 0);
    }

    #[test]
    fn mark_bits_follow_flow_lifecycle() {
        let mut orch = started_orch(4);
        let a = orch
            .create(
                &FlowAttr::default(),
                &ipv4_tcp(80),
                &[rss(&[0, 1]), Action::Mark { id: 1 }],
            )
            .unwrap();
        let b = orch
            .create(
                &FlowAttr::default(),
                &ipv4_tcp(443),
                &[rss(&[1, 2]), Action::Mark { id: 2 }],
            )
            .unwrap();
        assert!(orch.queue_mark_enabled(0));
        assert!(orch.queue_mark_enabled(1));
        assert!(orch.queue_mark_enabled(2));
        assert!(!orch.queue_mark_enabled(3));
        orch.destroy(a).unwrap();
        // Queue 1 is still covered by the second marked flow.
        assert!(!orch.queue_mark_enabled(0));
        assert!(orch.queue_mark_enabled(1));
        assert!(orch.queue_mark_enabled(2));
        orch.destroy(b).unwrap();
        assert!(!orch.queue_mark_enabled(1));
        assert!(!orch.queue_mark_enabled(2));
    }

    #[test]
    fn stop_clears_mark_bits() {
        let mut orch = started_orch(2);
        orch.create(
            &FlowAttr::default(),
            &ipv4_tcp(80),
            &[rss(&[0, 1]), Action::Flag],
        )
        .unwrap();
        assert!(orch.queue_mark_enabled(0));
        orch.stop_all();
        assert!(!orch.queue_mark_enabled(0));
        orch.start_all().unwrap();
        assert!(orch.queue_mark_enabled(0));
    }

    #[test]
    fn counted_flow_owns_one_counter() {
        let mut orch = started_orch(2);
        let id = orch
            .create(
                &FlowAttr::default(),
                &ipv4_tcp(80),
                &[Action::Queue { index: 0 }, Action::Count],
            )
            .unwrap();
        assert_eq!(orch.hal().live_counters(), 1);
        assert_eq!(orch.query_count(id, false).unwrap(), CounterStats::default());
        orch.destroy(id).unwrap();
        assert_eq!(orch.hal().live_counters(), 0);
    }

    /// Loads readouts into the only live counter of the mock device.
    fn load_counter(orch: &FlowOrch<MockHal>, stats: CounterStats) {
        assert_eq!(orch.hal().live_counters(), 1);
        for raw in 1..=10 {
            let counter = rxsteer_hal::CounterId::from_raw(raw).unwrap();
            orch.hal().set_counter(counter, stats);
        }
    }

    #[test]
    fn query_count_reports_deltas_and_resets_the_baseline() {
        let mut orch = started_orch(2);
        let id = orch
            .create(
                &FlowAttr::default(),
                &ipv4_tcp(80),
                &[Action::Queue { index: 0 }, Action::Count],
            )
            .unwrap();
        load_counter(&orch, CounterStats { hits: 5, bytes: 500 });
        let stats = orch.query_count(id, true).unwrap();
        assert_eq!(stats, CounterStats { hits: 5, bytes: 500 });
        // The reset moved the baseline; only growth past it is reported.
        load_counter(&orch, CounterStats { hits: 8, bytes: 900 });
        let stats = orch.query_count(id, false).unwrap();
        assert_eq!(stats, CounterStats { hits: 3, bytes: 400 });
        let again = orch.query_count(id, false).unwrap();
        assert_eq!(again, stats);
    }

    #[test]
    fn counter_allocation_failure_rolls_the_flow_back() {
        let mut orch = started_orch(2);
        orch.hal().fail_create_counter(true);
        let err = orch.create(
            &FlowAttr::default(),
            &ipv4_tcp(80),
            &[Action::Queue { index: 0 }, Action::Count],
        );
        assert!(matches!(err, Err(FlowError::ResourceExhausted(_))));
        assert_eq!(orch.stats().flows, 0);
        assert_eq!(orch.hal().live_counters(), 0);
        assert_eq!(orch.hal().live_hash_groups(), 0);
    }

    #[test]
    fn query_count_without_counter_is_invalid() {
        let mut orch = started_orch(2);
        let id = orch
            .create(&FlowAttr::default(), &ipv4_tcp(80), &[Action::Queue { index: 0 }])
            .unwrap();
        assert!(matches!(
            orch.query_count(id, false),
            Err(FlowError::InvalidArgument(_))
        ));
    }

    #[test]
    fn isolate_toggles_only_while_stopped() {
        let mut orch = started_orch(2);
        assert!(matches!(orch.isolate(true), Err(FlowError::Conflict(_))));
        orch.stop_all();
        orch.isolate(true).unwrap();
        assert!(orch.is_isolated());
        assert!(matches!(
            orch.ctrl_flow(EthItem::default(), EthItem::default()),
            Err(FlowError::Conflict(_))
        ));
    }

    #[test]
    fn ctrl_flows_spread_over_all_queues() {
        let mut orch = started_orch(4);
        let bcast = EthItem {
            dst: [0xff; 6],
            ..Default::default()
        };
        let mask = EthItem {
            dst: [0xff; 6],
            ..Default::default()
        };
        orch.ctrl_flow(bcast, mask).unwrap();
        assert_eq!(orch.stats().ctrl_flows, 1);
        assert!(orch.hal().live_flows() >= 1);
        orch.flush_ctrl();
        assert_eq!(orch.stats().ctrl_flows, 0);
        assert_eq!(orch.hal().live_flows(), 0);
    }

    #[test]
    fn close_releases_flows_and_the_drop_path() {
        let mut orch = started_orch(2);
        orch.create(&FlowAttr::default(), &[eth()], &[Action::Drop])
            .unwrap();
        assert_eq!(orch.hal().live_drop_paths(), 1);
        let hal = orch.close();
        assert_eq!(hal.live_flows(), 0);
        assert_eq!(hal.live_drop_paths(), 0);
    }

    #[test]
    fn flush_destroys_in_creation_order() {
        let mut orch = started_orch(4);
        orch.create(&FlowAttr::default(), &ipv4_tcp(80), &[rss(&[0, 1])])
            .unwrap();
        orch.create(
            &FlowAttr::default(),
            &[
                eth(),
                MatchItem::Ipv4(Pattern::new(Ipv4Item::default())),
                MatchItem::Udp(Pattern::new(UdpItem::default())),
            ],
            &[rss(&[2, 3])],
        )
        .unwrap();
        assert_eq!(orch.verify(), 2);
        orch.flush();
        assert_eq!(orch.verify(), 0);
        assert_eq!(orch.hal().live_flows(), 0);
        assert_eq!(orch.hal().live_hash_groups(), 0);
    }

    #[test]
    fn single_queue_flow_uses_zero_hash_fields() {
        let mut orch = started_orch(2);
        // Default RSS in these tests hashes everything, so pin the
        // flow with an explicit empty hash request.
        orch.create(
            &FlowAttr::default(),
            &[eth()],
            &[Action::Rss(RssAction {
                conf: Some(crate::action::RssConf {
                    types: RssTypes::empty(),
                    key: None,
                }),
                queues: vec![1],
            })],
        )
        .unwrap();
        assert_eq!(orch.hal().live_hash_groups(), 1);
        let group = orch
            .hal()
            .hash_group(
                // Only one group exists; find it through the flow.
                {
                    let flows: Vec<_> = (1..=10)
                        .filter_map(|raw| rxsteer_hal::FlowObjectId::from_raw(raw))
                        .filter_map(|f| orch.hal().flow(f))
                        .collect();
                    match flows[0].target {
                        FlowTarget::HashGroup(g) => g,
                        FlowTarget::DropPath(_) => panic!("expected a hash group target"),
                    }
                },
            )
            .unwrap();
        assert_eq!(group.hash_fields, 0);
        assert_eq!(group.queues, vec![1]);
    }
}
