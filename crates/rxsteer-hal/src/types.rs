//! Type-safe handles for hardware objects.
//!
//! Each object class gets its own handle type so a flow-object handle can
//! never be passed where a hash-group handle is expected. The wrapper is
//! a raw `u64` plus a phantom kind marker, the same trick the rest of the
//! control plane uses for its object ids.

use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;

/// Raw hardware object id.
pub type RawObjectId = u64;

/// Marker trait for hardware object kinds.
pub trait HalObjectKind: Send + Sync + 'static {
    /// Object class name, for logs and errors.
    fn type_name() -> &'static str;
}

/// A type-safe hardware object handle.
pub struct HalObjectId<K: HalObjectKind> {
    raw: RawObjectId,
    _marker: PhantomData<K>,
}

impl<K: HalObjectKind> HalObjectId<K> {
    /// Creates a handle from a raw value. Zero is reserved for "no
    /// object" and rejected.
    pub fn from_raw(raw: RawObjectId) -> Option<Self> {
        if raw == 0 {
            None
        } else {
            Some(Self {
                raw,
                _marker: PhantomData,
            })
        }
    }

    /// Returns the raw handle value.
    pub const fn as_raw(&self) -> RawObjectId {
        self.raw
    }
}

impl<K: HalObjectKind> Clone for HalObjectId<K> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<K: HalObjectKind> Copy for HalObjectId<K> {}

impl<K: HalObjectKind> PartialEq for HalObjectId<K> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<K: HalObjectKind> Eq for HalObjectId<K> {}

impl<K: HalObjectKind> Hash for HalObjectId<K> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl<K: HalObjectKind> fmt::Debug for HalObjectId<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(0x{:x})", K::type_name(), self.raw)
    }
}

impl<K: HalObjectKind> fmt::Display for HalObjectId<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.raw)
    }
}

macro_rules! object_kind {
    ($kind:ident, $alias:ident, $name:literal) => {
        #[doc = concat!("Marker for ", $name, " handles.")]
        #[derive(Debug, Clone, Copy)]
        pub enum $kind {}

        impl HalObjectKind for $kind {
            fn type_name() -> &'static str {
                $name
            }
        }

        #[doc = concat!("Handle to a ", $name, ".")]
        pub type $alias = HalObjectId<$kind>;
    };
}

object_kind!(FlowObjectKind, FlowObjectId, "flow object");
object_kind!(HashGroupKind, HashGroupId, "hash-queue group");
object_kind!(CounterKind, CounterId, "flow counter");
object_kind!(DropPathKind, DropPathId, "drop path");

/// Cumulative counter readout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterStats {
    /// Packets matched by the flow.
    pub hits: u64,
    /// Bytes matched by the flow.
    pub bytes: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn zero_is_rejected() {
        assert!(FlowObjectId::from_raw(0).is_none());
        assert!(FlowObjectId::from_raw(1).is_some());
    }

    #[test]
    fn debug_names_the_kind() {
        let id = HashGroupId::from_raw(0x2a).unwrap();
        assert_eq!(format!("{:?}", id), "hash-queue group(0x2a)");
    }
}
