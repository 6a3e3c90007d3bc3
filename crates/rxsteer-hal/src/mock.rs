//! In-memory fake of the hardware capability layer.
//!
//! Used by the flow compiler's tests to exercise lifecycle and rollback
//! paths without a device. Every create call hands out a fresh handle and
//! records the object; destroy calls validate the handle so leaks and
//! double-frees show up as test failures. Individual call sites can be
//! made to fail on demand.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{HalError, HalResult};
use crate::types::{CounterId, CounterStats, DropPathId, FlowObjectId, HashGroupId};
use crate::{FlowHal, FlowTarget};

/// Recorded state of a mock hash-queue group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockHashGroup {
    pub key: Vec<u8>,
    pub hash_fields: u64,
    pub queues: Vec<u16>,
}

/// Recorded state of a mock flow object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockFlow {
    pub target: FlowTarget,
    pub descriptor: Vec<u8>,
}

#[derive(Debug, Default)]
struct MockState {
    flows: HashMap<u64, MockFlow>,
    hash_groups: HashMap<u64, MockHashGroup>,
    counters: HashMap<u64, CounterStats>,
    drop_paths: HashMap<u64, ()>,
    fail_create_flow_after: Option<u32>,
    fail_create_hash_group: bool,
    fail_create_counter: bool,
    fail_create_drop_path: bool,
}

/// In-memory [`FlowHal`] implementation.
#[derive(Debug, Default)]
pub struct MockHal {
    next_id: AtomicU64,
    state: Mutex<MockState>,
}

impl MockHal {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            state: Mutex::default(),
        }
    }

    fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Makes the Nth subsequent `create_flow` call fail (0 = next call).
    pub fn fail_create_flow_after(&self, n: u32) {
        self.state.lock().unwrap().fail_create_flow_after = Some(n);
    }

    /// Makes the next `create_hash_group` calls fail.
    pub fn fail_create_hash_group(&self, fail: bool) {
        self.state.lock().unwrap().fail_create_hash_group = fail;
    }

    /// Makes the next `create_counter` calls fail.
    pub fn fail_create_counter(&self, fail: bool) {
        self.state.lock().unwrap().fail_create_counter = fail;
    }

    /// Makes the next `create_drop_path` calls fail.
    pub fn fail_create_drop_path(&self, fail: bool) {
        self.state.lock().unwrap().fail_create_drop_path = fail;
    }

    /// Overwrites a live counter's cumulative readout.
    pub fn set_counter(&self, counter: CounterId, stats: CounterStats) {
        let mut state = self.state.lock().unwrap();
        if let Some(entry) = state.counters.get_mut(&counter.as_raw()) {
            *entry = stats;
        }
    }

    /// Number of live flow objects.
    pub fn live_flows(&self) -> usize {
        self.state.lock().unwrap().flows.len()
    }

    /// Number of live hash-queue groups.
    pub fn live_hash_groups(&self) -> usize {
        self.state.lock().unwrap().hash_groups.len()
    }

    /// Number of live counters.
    pub fn live_counters(&self) -> usize {
        self.state.lock().unwrap().counters.len()
    }

    /// Number of live drop paths.
    pub fn live_drop_paths(&self) -> usize {
        self.state.lock().unwrap().drop_paths.len()
    }

    /// Snapshot of a live flow object, if any.
    pub fn flow(&self, flow: FlowObjectId) -> Option<MockFlow> {
        self.state.lock().unwrap().flows.get(&flow.as_raw()).cloned()
    }

    /// Snapshot of a live hash-queue group, if any.
    pub fn hash_group(&self, group: HashGroupId) -> Option<MockHashGroup> {
        self.state
            .lock()
            .unwrap()
            .hash_groups
            .get(&group.as_raw())
            .cloned()
    }
}

impl FlowHal for MockHal {
    fn create_flow(&self, target: FlowTarget, descriptor: &[u8]) -> HalResult<FlowObjectId> {
        let id = self.alloc_id();
        let mut state = self.state.lock().unwrap();
        if let Some(n) = state.fail_create_flow_after {
            if n == 0 {
                state.fail_create_flow_after = None;
                return Err(HalError::OutOfResources(crate::HalStatus::TableFull));
            }
            state.fail_create_flow_after = Some(n - 1);
        }
        match target {
            FlowTarget::HashGroup(group) => {
                if !state.hash_groups.contains_key(&group.as_raw()) {
                    return Err(HalError::UnknownObject);
                }
            }
            FlowTarget::DropPath(drop) => {
                if !state.drop_paths.contains_key(&drop.as_raw()) {
                    return Err(HalError::UnknownObject);
                }
            }
        }
        state.flows.insert(
            id,
            MockFlow {
                target,
                descriptor: descriptor.to_vec(),
            },
        );
        Ok(FlowObjectId::from_raw(id).unwrap())
    }

    fn destroy_flow(&self, flow: FlowObjectId) -> HalResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .flows
            .remove(&flow.as_raw())
            .map(|_| ())
            .ok_or(HalError::UnknownObject)
    }

    fn create_hash_group(
        &self,
        key: &[u8],
        hash_fields: u64,
        queues: &[u16],
    ) -> HalResult<HashGroupId> {
        let id = self.alloc_id();
        let mut state = self.state.lock().unwrap();
        if state.fail_create_hash_group {
            return Err(HalError::OutOfResources(crate::HalStatus::NoMemory));
        }
        state.hash_groups.insert(
            id,
            MockHashGroup {
                key: key.to_vec(),
                hash_fields,
                queues: queues.to_vec(),
            },
        );
        Ok(HashGroupId::from_raw(id).unwrap())
    }

    fn destroy_hash_group(&self, group: HashGroupId) -> HalResult<()> {
        let mut state = self.state.lock().unwrap();
        let raw = group.as_raw();
        if state
            .flows
            .values()
            .any(|f| f.target == FlowTarget::HashGroup(group))
        {
            return Err(HalError::ObjectInUse);
        }
        state
            .hash_groups
            .remove(&raw)
            .map(|_| ())
            .ok_or(HalError::UnknownObject)
    }

    fn create_drop_path(&self) -> HalResult<DropPathId> {
        let id = self.alloc_id();
        let mut state = self.state.lock().unwrap();
        if state.fail_create_drop_path {
            return Err(HalError::OutOfResources(crate::HalStatus::NoMemory));
        }
        state.drop_paths.insert(id, ());
        Ok(DropPathId::from_raw(id).unwrap())
    }

    fn destroy_drop_path(&self, drop: DropPathId) -> HalResult<()> {
        let mut state = self.state.lock().unwrap();
        if state
            .flows
            .values()
            .any(|f| f.target == FlowTarget::DropPath(drop))
        {
            return Err(HalError::ObjectInUse);
        }
        state
            .drop_paths
            .remove(&drop.as_raw())
            .map(|_| ())
            .ok_or(HalError::UnknownObject)
    }

    fn create_counter(&self) -> HalResult<CounterId> {
        let id = self.alloc_id();
        let mut state = self.state.lock().unwrap();
        if state.fail_create_counter {
            return Err(HalError::OutOfResources(crate::HalStatus::NoMemory));
        }
        state.counters.insert(id, CounterStats::default());
        Ok(CounterId::from_raw(id).unwrap())
    }

    fn destroy_counter(&self, counter: CounterId) -> HalResult<()> {
        let mut state = self.state.lock().unwrap();
        state
            .counters
            .remove(&counter.as_raw())
            .map(|_| ())
            .ok_or(HalError::UnknownObject)
    }

    fn query_counter(&self, counter: CounterId) -> HalResult<CounterStats> {
        let state = self.state.lock().unwrap();
        state
            .counters
            .get(&counter.as_raw())
            .copied()
            .ok_or(HalError::UnknownObject)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn flow_needs_a_live_target() {
        let hal = MockHal::new();
        let bogus = HashGroupId::from_raw(7).unwrap();
        let err = hal.create_flow(FlowTarget::HashGroup(bogus), &[0u8; 8]);
        assert_eq!(err, Err(HalError::UnknownObject));

        let group = hal.create_hash_group(&[0u8; 40], 0xf, &[0, 1]).unwrap();
        let flow = hal
            .create_flow(FlowTarget::HashGroup(group), &[0u8; 8])
            .unwrap();
        assert_eq!(hal.live_flows(), 1);
        hal.destroy_flow(flow).unwrap();
        hal.destroy_hash_group(group).unwrap();
        assert_eq!(hal.live_hash_groups(), 0);
    }

    #[test]
    fn group_with_flows_is_in_use() {
        let hal = MockHal::new();
        let group = hal.create_hash_group(&[0u8; 40], 0xf, &[0]).unwrap();
        let flow = hal
            .create_flow(FlowTarget::HashGroup(group), &[1u8; 8])
            .unwrap();
        assert_eq!(hal.destroy_hash_group(group), Err(HalError::ObjectInUse));
        hal.destroy_flow(flow).unwrap();
        hal.destroy_hash_group(group).unwrap();
    }

    #[test]
    fn handle_ids_start_at_one_and_are_dense() {
        let hal = MockHal::new();
        let first = hal.create_counter().unwrap();
        assert_eq!(first.as_raw(), 1);
        let second = hal.create_drop_path().unwrap();
        assert_eq!(second.as_raw(), 2);
    }

    #[test]
    fn failure_injection_is_one_shot() {
        let hal = MockHal::new();
        let group = hal.create_hash_group(&[0u8; 40], 0, &[0]).unwrap();
        hal.fail_create_flow_after(0);
        assert!(hal.create_flow(FlowTarget::HashGroup(group), &[]).is_err());
        assert!(hal.create_flow(FlowTarget::HashGroup(group), &[]).is_ok());
    }
}
