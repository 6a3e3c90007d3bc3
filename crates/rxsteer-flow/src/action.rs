//! Flow rule actions.

use crate::types::RssTypes;

/// Terminal and modifier actions attached to a flow rule.
///
/// At least one fate action (`Queue`, `Rss` or `Drop`) is required.
/// `Drop` wins over any queue assignment and suppresses marking;
/// `Mark`/`Flag` and `Count` modify whichever fate is chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Steer matching packets to a single receive queue.
    Queue { index: u16 },
    /// Spread matching packets over a queue set by hash.
    Rss(RssAction),
    /// Discard matching packets.
    Drop,
    /// Tag matching packets with `id`, delivered in completion metadata.
    Mark { id: u32 },
    /// Tag matching packets with the reserved default mark.
    Flag,
    /// Count matching packets and bytes.
    Count,
}

/// RSS fate: the queue set plus an optional hash configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RssAction {
    /// Hash configuration; `None` keeps the device defaults.
    pub conf: Option<RssConf>,
    pub queues: Vec<u16>,
}

/// Caller-supplied hash configuration for an RSS action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RssConf {
    pub types: RssTypes,
    /// Toeplitz key; must be exactly [`crate::RSS_KEY_LEN`] bytes when
    /// supplied.
    pub key: Option<Vec<u8>>,
}
