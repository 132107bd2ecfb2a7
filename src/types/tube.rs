use std::collections::VecDeque;

use serde::Serialize;
use tokio::time::Instant;

use super::conn::WaitQueue;
use super::heap::IndexedHeap;
use super::job::{JobId, URGENT_THRESHOLD};

/// Maximum tube name length, per the wire protocol.
pub const MAX_TUBE_NAME_LEN: usize = 200;

/// A validated tube name: ASCII, `[A-Za-z0-9+/;.$_()-]{1,200}`, not starting
/// with `-`.
#[derive(Clone, Debug, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct TubeName(Vec<u8>);

impl TubeName {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn default_tube() -> Self {
        // Safe: "default" satisfies the tube-name grammar.
        Self::parse(b"default").unwrap()
    }

    pub fn parse(raw: &[u8]) -> Option<Self> {
        if raw.is_empty() || raw.len() > MAX_TUBE_NAME_LEN {
            return None;
        }
        if raw[0] == b'-' {
            return None;
        }
        let valid = raw.iter().all(|&b| {
            b.is_ascii_alphanumeric()
                || matches!(
                    b,
                    b'+' | b'/' | b';' | b'.' | b'$' | b'_' | b'(' | b')' | b'-'
                )
        });
        if !valid {
            return None;
        }
        Some(Self(raw.to_vec()))
    }
}

impl std::fmt::Display for TubeName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

#[derive(Debug, PartialEq, Serialize, Clone, Default)]
pub struct TubeStats {
    /// number of jobs in ready state with priority < 2^31
    #[serde(rename = "current-jobs-urgent")]
    pub current_jobs_urgent: u64,
    /// number of jobs in ready state
    #[serde(rename = "current-jobs-ready")]
    pub current_jobs_ready: u64,
    /// number of jobs reserved by clients
    #[serde(rename = "current-jobs-reserved")]
    pub current_jobs_reserved: u64,
    /// number of jobs in delayed state
    #[serde(rename = "current-jobs-delayed")]
    pub current_jobs_delayed: u64,
    /// number of jobs in buried state
    #[serde(rename = "current-jobs-buried")]
    pub current_jobs_buried: u64,
    /// total jobs created in this tube
    #[serde(rename = "total-jobs")]
    pub total_jobs: u64,
    /// number of clients that have `use`d this queue
    #[serde(rename = "current-using")]
    pub current_using: u64,
    /// number of clients that have `watch`ed this queue and are waiting on a
    /// `reserve`
    #[serde(rename = "current-waiting")]
    pub current_waiting: u64,
    /// number of clients that have `watch`ed this queue
    #[serde(rename = "current-watching")]
    pub current_watching: u64,
    /// number of seconds this queue has been paused for in total
    pub pause: u32,
    /// number of `delete` commands issued for this tube
    #[serde(rename = "cmd-delete")]
    pub cmd_delete: u64,
    /// number of `pause-tube` commands issued for this tube
    #[serde(rename = "cmd-pause-tube")]
    pub cmd_pause_tube: u64,
}

/// A named queue: ready heap (by priority), delayed heap (by deadline),
/// buried list (FIFO), pause state, and the consumers presently blocked on
/// a `reserve` against it.
pub struct Tube {
    pub name: TubeName,
    ready: IndexedHeap<(u32, JobId), JobId>,
    delayed: IndexedHeap<Instant, JobId>,
    buried: VecDeque<JobId>,
    pub paused_until: Option<Instant>,
    pub waiting: WaitQueue,
    pub use_count: u64,
    pub watch_count: u64,
    pub stats: TubeStats,
}

impl Tube {
    pub fn new(name: TubeName) -> Self {
        Self {
            name,
            ready: IndexedHeap::new(),
            delayed: IndexedHeap::new(),
            buried: VecDeque::new(),
            paused_until: None,
            waiting: WaitQueue::new(),
            use_count: 0,
            watch_count: 0,
            stats: TubeStats::default(),
        }
    }

    /// A tube with no users, no watchers, and no contained jobs is
    /// collectible (unless it's `default`, which the engine never offers up
    /// for collection).
    pub fn is_collectible(&self) -> bool {
        self.use_count == 0
            && self.watch_count == 0
            && self.ready.is_empty()
            && self.delayed.is_empty()
            && self.buried.is_empty()
    }

    pub fn is_paused(&self, now: Instant) -> bool {
        matches!(self.paused_until, Some(until) if until > now)
    }

    pub fn ready_push(
        &mut self,
        priority: u32,
        id: JobId,
        mut set_pos: impl FnMut(JobId, usize),
    ) {
        self.ready.push((priority, id), id, &mut set_pos);
        self.stats.current_jobs_ready += 1;
        if priority < URGENT_THRESHOLD {
            self.stats.current_jobs_urgent += 1;
        }
    }

    pub fn ready_peek(&self) -> Option<JobId> {
        self.ready.peek().map(|(_, v)| *v)
    }

    pub fn ready_pop(
        &mut self,
        mut set_pos: impl FnMut(JobId, usize),
    ) -> Option<JobId> {
        let ((priority, _), id) = self.ready.pop(&mut set_pos)?;
        self.stats.current_jobs_ready -= 1;
        if priority < URGENT_THRESHOLD {
            self.stats.current_jobs_urgent -= 1;
        }
        Some(id)
    }

    pub fn ready_remove(
        &mut self,
        pos: usize,
        priority: u32,
        mut set_pos: impl FnMut(JobId, usize),
    ) {
        self.ready.remove(pos, &mut set_pos);
        self.stats.current_jobs_ready -= 1;
        if priority < URGENT_THRESHOLD {
            self.stats.current_jobs_urgent -= 1;
        }
    }

    pub fn delayed_push(
        &mut self,
        until: Instant,
        id: JobId,
        mut set_pos: impl FnMut(JobId, usize),
    ) {
        self.delayed.push(until, id, &mut set_pos);
        self.stats.current_jobs_delayed += 1;
    }

    pub fn delayed_peek_deadline(&self) -> Option<Instant> {
        self.delayed.peek().map(|(k, _)| *k)
    }

    pub fn delayed_peek(&self) -> Option<JobId> {
        self.delayed.peek().map(|(_, v)| *v)
    }

    pub fn delayed_pop(
        &mut self,
        mut set_pos: impl FnMut(JobId, usize),
    ) -> Option<JobId> {
        let (_, id) = self.delayed.pop(&mut set_pos)?;
        self.stats.current_jobs_delayed -= 1;
        Some(id)
    }

    pub fn delayed_remove(
        &mut self,
        pos: usize,
        mut set_pos: impl FnMut(JobId, usize),
    ) {
        self.delayed.remove(pos, &mut set_pos);
        self.stats.current_jobs_delayed -= 1;
    }

    pub fn bury_push(&mut self, id: JobId) {
        self.buried.push_back(id);
        self.stats.current_jobs_buried += 1;
    }

    pub fn bury_pop_front(&mut self) -> Option<JobId> {
        let id = self.buried.pop_front();
        if id.is_some() {
            self.stats.current_jobs_buried -= 1;
        }
        id
    }

    pub fn bury_remove(&mut self, id: JobId) -> bool {
        if let Some(idx) = self.buried.iter().position(|&j| j == id) {
            self.buried.remove(idx);
            self.stats.current_jobs_buried -= 1;
            true
        } else {
            false
        }
    }

    pub fn bury_front(&self) -> Option<JobId> {
        self.buried.front().copied()
    }
}
