//! Hardware capability layer for the rxsteer flow compiler.
//!
//! This crate models the device objects the flow compiler manipulates:
//! hardware flow-match objects, hash-queue groups, flow counters and the
//! dedicated drop path. The compiler never touches registers itself; it
//! drives everything through the [`FlowHal`] trait, which the real bus
//! layer implements out of tree.
//!
//! # Architecture
//!
//! - [`types`]: type-safe handles for the hardware objects
//! - [`error`]: status codes and error handling
//! - [`mock`]: an in-memory fake used by the compiler's tests
//!
//! All calls are synchronous and may fail immediately; the caller owns
//! serialization (one in-flight call per device).

pub mod error;
pub mod mock;
pub mod types;

pub use error::{HalError, HalResult, HalStatus};
pub use mock::MockHal;
pub use types::{
    CounterId, CounterStats, DropPathId, FlowObjectId, HalObjectId, HalObjectKind, HashGroupId,
    RawObjectId,
};

/// Target context a hardware flow-match object is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowTarget {
    /// A reference-counted hash-queue group.
    HashGroup(HashGroupId),
    /// The dedicated drop path.
    DropPath(DropPathId),
}

/// Operations the flow compiler needs from the device.
///
/// Handles returned by the `create_*` calls stay valid until the matching
/// `destroy_*` call. Destroying an object that still has dependents (for
/// example a hash-queue group with live flows attached) is a caller bug
/// and reported as [`HalError::ObjectInUse`].
pub trait FlowHal {
    /// Creates a hardware flow-match object from an encoded descriptor,
    /// attached to `target`.
    fn create_flow(&self, target: FlowTarget, descriptor: &[u8]) -> HalResult<FlowObjectId>;

    /// Destroys a hardware flow-match object.
    fn destroy_flow(&self, flow: FlowObjectId) -> HalResult<()>;

    /// Creates a hash-queue group binding an RSS key and hash-field mask
    /// to an ordered list of receive queues.
    fn create_hash_group(
        &self,
        key: &[u8],
        hash_fields: u64,
        queues: &[u16],
    ) -> HalResult<HashGroupId>;

    /// Destroys a hash-queue group.
    fn destroy_hash_group(&self, group: HashGroupId) -> HalResult<()>;

    /// Creates the dedicated drop path (receive context that absorbs
    /// packets matched by drop flows).
    fn create_drop_path(&self) -> HalResult<DropPathId>;

    /// Destroys the drop path.
    fn destroy_drop_path(&self, drop: DropPathId) -> HalResult<()>;

    /// Creates a flow counter.
    fn create_counter(&self) -> HalResult<CounterId>;

    /// Destroys a flow counter.
    fn destroy_counter(&self, counter: CounterId) -> HalResult<()>;

    /// Reads a flow counter. Values are cumulative since creation.
    fn query_counter(&self, counter: CounterId) -> HalResult<CounterStats>;
}
