use std::num::NonZeroU64;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;

use super::tube::TubeName;

/// Minimum time-to-run: a `ttr` of zero on the wire is clamped up to one
/// second.
pub const MIN_TTR: Duration = Duration::from_secs(1);

/// Priorities below this value count as "urgent" for `current-jobs-urgent`.
pub const URGENT_THRESHOLD: u32 = 1 << 31;

/// Safety margin used to decide whether a reservation is in `DEADLINE_SOON`.
pub const DEADLINE_SOON_MARGIN: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct JobId(NonZeroU64);

impl JobId {
    pub fn new(id: u64) -> Option<Self> {
        NonZeroU64::new(id).map(Self)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a single client connection for the lifetime of the process.
/// Never reused while the connection is registered with the engine.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord, Hash)]
pub struct ConnId(u64);

impl ConnId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JobState {
    Ready,
    Delayed,
    Reserved,
    Buried,
}

impl JobState {
    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Ready => "ready",
            JobState::Delayed => "delayed",
            JobState::Reserved => "reserved",
            JobState::Buried => "buried",
        }
    }
}

/// A job: identity, payload, and all state needed to place it in exactly one
/// of a tube's ordering structures, a connection's reserved-set, or nowhere
/// (once deleted).
#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    pub tube: TubeName,
    pub priority: u32,
    pub delay: Duration,
    pub ttr: Duration,
    pub body: Bytes,
    pub created_at: Instant,
    /// Meaning depends on `state`: the time the job becomes ready again
    /// (`Delayed`), or the TTR deadline (`Reserved`). Unused otherwise.
    pub deadline_at: Instant,
    pub state: JobState,

    pub reserve_count: u64,
    pub timeout_count: u64,
    pub release_count: u64,
    pub bury_count: u64,
    pub kick_count: u64,

    /// Position in the owning tube's ready heap, while `state == Ready`.
    pub ready_pos: Option<usize>,
    /// Position in the owning tube's delayed heap, while `state == Delayed`.
    pub delayed_pos: Option<usize>,
    /// The connection currently holding this job's reservation, while
    /// `state == Reserved`.
    pub reserved_by: Option<ConnId>,

    /// Earliest binlog segment index containing a durable record for this
    /// job, surfaced in `stats-job` as `file`. `0` when WAL is disabled.
    pub wal_file: u64,
}

impl Job {
    pub fn body_size(&self) -> u32 {
        self.body.len() as u32
    }
}
