use std::collections::{HashSet, VecDeque};

use tokio::time::Instant;

use super::job::{ConnId, JobId};
use super::tube::TubeName;

/// Tracks a blocked `reserve` / `reserve-with-timeout` for one connection.
#[derive(Debug, Clone, Copy)]
pub struct Waiting {
    pub requested_at: Instant,
    /// `None` means `reserve` (block forever); `Some(t)` is the
    /// `reserve-with-timeout` deadline, already clamped so that `timeout=0`
    /// resolves immediately.
    pub deadline: Option<Instant>,
}

/// Per-connection protocol state: which tube it's producing into, which
/// tubes it watches, which jobs it currently holds a reservation on, and
/// whether it's presently blocked waiting on a `reserve`.
#[derive(Debug)]
pub struct ConnState {
    pub used: TubeName,
    pub watched: HashSet<TubeName>,
    pub reserved: HashSet<JobId>,
    pub waiting: Option<Waiting>,
    /// `min` over `reserved` of `deadline_at - DEADLINE_SOON_MARGIN`, kept
    /// incrementally so `DEADLINE_SOON` checks don't have to scan the
    /// reserved set on every `reserve`.
    pub soonest_deadline_at: Option<Instant>,
    pub is_producer: bool,
    pub is_worker: bool,
}

impl ConnState {
    pub fn new(default_tube: TubeName) -> Self {
        let mut watched = HashSet::new();
        watched.insert(default_tube.clone());
        Self {
            used: default_tube,
            watched,
            reserved: HashSet::new(),
            waiting: None,
            soonest_deadline_at: None,
            is_producer: false,
            is_worker: false,
        }
    }
}

/// FIFO of connections blocked on a `reserve` against a single tube.
pub type WaitQueue = VecDeque<ConnId>;
