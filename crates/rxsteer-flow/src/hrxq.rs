//! Reference-counted cache of hardware hash-queue groups.
//!
//! Flows that share the same hash key, hash fields and ordered queue
//! list share one hardware group. The cache owns the hardware objects;
//! entries are created on first acquire and destroyed when the last
//! reference goes away.

use tracing::debug;

use rxsteer_hal::{FlowHal, HashGroupId};

use crate::types::{FlowError, FlowResult, HashFields, RSS_KEY_LEN};

/// Identity of a hash-queue group. Queue order is significant: the
/// hash indexes into the list positionally.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct HrxqKey {
    pub key: [u8; RSS_KEY_LEN],
    pub hash_fields: HashFields,
    pub queues: Vec<u16>,
}

struct HrxqEntry {
    key: HrxqKey,
    id: HashGroupId,
    refcnt: usize,
}

/// The per-device group cache.
#[derive(Default)]
pub(crate) struct HashGroupCache {
    entries: Vec<HrxqEntry>,
}

impl HashGroupCache {
    /// Get or create the group for `key`, taking one reference.
    pub(crate) fn acquire<H: FlowHal>(
        &mut self,
        hal: &H,
        key: HrxqKey,
    ) -> FlowResult<(HrxqKey, HashGroupId)> {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.key == key) {
            entry.refcnt += 1;
            return Ok((key, entry.id));
        }
        let id = hal
            .create_hash_group(&key.key, key.hash_fields.bits(), &key.queues)
            .map_err(|e| {
                FlowError::ResourceExhausted(format!("hash-queue group creation failed: {e}"))
            })?;
        debug!(group = %id, fields = ?key.hash_fields, queues = ?key.queues,
               "created hash-queue group");
        self.entries.push(HrxqEntry {
            key: key.clone(),
            id,
            refcnt: 1,
        });
        Ok((key, id))
    }

    /// Drop one reference; the hardware group is destroyed with the
    /// last one. Returns true when the entry was torn down.
    pub(crate) fn release<H: FlowHal>(&mut self, hal: &H, key: &HrxqKey) -> bool {
        let Some(pos) = self.entries.iter().position(|e| &e.key == key) else {
            return false;
        };
        let entry = &mut self.entries[pos];
        entry.refcnt -= 1;
        if entry.refcnt > 0 {
            return false;
        }
        let entry = self.entries.remove(pos);
        if let Err(e) = hal.destroy_hash_group(entry.id) {
            debug!(group = %entry.id, error = %e, "hash-queue group destruction failed");
        } else {
            debug!(group = %entry.id, "destroyed hash-queue group");
        }
        true
    }

    pub(crate) fn id(&self, key: &HrxqKey) -> Option<HashGroupId> {
        self.entries.iter().find(|e| &e.key == key).map(|e| e.id)
    }

    /// Number of live groups, for leak checks at teardown.
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rxsteer_hal::MockHal;

    use crate::types::DEFAULT_RSS_KEY;

    fn key(queues: &[u16]) -> HrxqKey {
        HrxqKey {
            key: DEFAULT_RSS_KEY,
            hash_fields: HashFields::IPV4,
            queues: queues.to_vec(),
        }
    }

    #[test]
    fn identical_keys_share_one_group() {
        let hal = MockHal::new();
        let mut cache = HashGroupCache::default();
        let (k1, id1) = cache.acquire(&hal, key(&[0, 1])).unwrap();
        let (k2, id2) = cache.acquire(&hal, key(&[0, 1])).unwrap();
        assert_eq!(id1, id2);
        assert_eq!(cache.len(), 1);
        assert_eq!(hal.live_hash_groups(), 1);
        assert!(!cache.release(&hal, &k1));
        assert!(cache.release(&hal, &k2));
        assert_eq!(hal.live_hash_groups(), 0);
    }

    #[test]
    fn queue_order_distinguishes_groups() {
        let hal = MockHal::new();
        let mut cache = HashGroupCache::default();
        let (_, id1) = cache.acquire(&hal, key(&[0, 1])).unwrap();
        let (_, id2) = cache.acquire(&hal, key(&[1, 0])).unwrap();
        assert_ne!(id1, id2);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn creation_failure_maps_to_resource_exhausted() {
        let hal = MockHal::new();
        hal.fail_create_hash_group(true);
        let mut cache = HashGroupCache::default();
        match cache.acquire(&hal, key(&[0])) {
            Err(FlowError::ResourceExhausted(_)) => {}
            other => panic!("expected resource exhaustion, got {other:?}"),
        }
        assert_eq!(cache.len(), 0);
    }
}
