//! Write-ahead log (binlog) durability.
//!
//! Jobs are persisted as a sequence of fixed-size segment files
//! (`binlog.N`) in a directory locked for the lifetime of the process.
//! `Put`/`Update`/`Delete` records are folded per job id on replay to
//! reconstruct state after a restart. See `SPEC_FULL.md` §4.5 for the full
//! design.

pub mod falloc;
pub mod record;
pub mod segment;

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::fcntl::{flock, FlockArg};
use thiserror::Error;
use tracing::{debug, warn};

pub use self::falloc::Falloc;
pub use self::record::RecordState;
use self::record::Record;
use self::segment::Segment;

#[derive(Debug, Error)]
pub enum Error {
    #[error("write-ahead log is out of space")]
    OutOfMemory,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("write-ahead log directory {0} is locked by another process")]
    Locked(PathBuf),
    #[error("write-ahead log replay failed: {0}")]
    Replay(String),
}

#[derive(Debug, Clone, Copy)]
pub enum FsyncPolicy {
    /// fsync after every write.
    Always,
    /// fsync at most once per period.
    Periodic(Duration),
    /// never fsync (`-F`; unsafe).
    Never,
}

/// A job folded from its `Put` record plus any later `Update`s, as returned
/// by [`Wal::open`]. Absent if its last durable record was `Delete`.
#[derive(Debug, Clone)]
pub struct RecoveredJob {
    pub id: u64,
    pub tube: Vec<u8>,
    pub priority: u32,
    pub delay_secs: u32,
    pub ttr_secs: u32,
    pub body: Vec<u8>,
    pub state: RecordState,
    pub anchor_segment: u64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct WalStats {
    pub oldest_index: u64,
    pub current_index: u64,
    pub max_size: u64,
    pub records_written: u64,
    pub records_migrated: u64,
}

struct JobWalInfo {
    anchor_segment: u64,
    latest_segment: u64,
}

/// Owns every open segment and the locked WAL directory. Reservation
/// (`put`/`record_update`/`compact`/`delete`) and in-memory job mutation are
/// ordered by the caller: call the WAL method first, and only mutate engine
/// state on `Ok` — this keeps "no state change on OUT_OF_MEMORY" trivial.
pub struct Wal {
    dir: PathBuf,
    segment_size: u64,
    falloc: Falloc,
    fsync_policy: FsyncPolicy,
    last_fsync: Instant,
    _lock_file: fs::File,
    segments: VecDeque<Segment>,
    next_index: u64,
    live: HashMap<u64, JobWalInfo>,
    stats: WalStats,
}

impl Wal {
    pub fn open(
        dir: &Path,
        segment_size: u64,
        fsync_policy: FsyncPolicy,
        falloc: Falloc,
    ) -> Result<(Self, Vec<RecoveredJob>), Error> {
        fs::create_dir_all(dir)?;

        let lock_path = dir.join("lock");
        let lock_file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&lock_path)?;
        flock(lock_file.as_raw_fd(), FlockArg::LockExclusiveNonblock)
            .map_err(|_| Error::Locked(dir.to_path_buf()))?;

        let mut indices: Vec<u64> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if let Some(suffix) = name.strip_prefix("binlog.") {
                    if let Ok(idx) = suffix.parse::<u64>() {
                        indices.push(idx);
                    }
                }
            }
        }
        indices.sort_unstable();

        let mut wal = Wal {
            dir: dir.to_path_buf(),
            segment_size,
            falloc,
            fsync_policy,
            last_fsync: Instant::now(),
            _lock_file: lock_file,
            segments: VecDeque::new(),
            next_index: 1,
            live: HashMap::new(),
            stats: WalStats { max_size: segment_size, ..Default::default() },
        };

        let mut folded: HashMap<u64, RecoveredJob> = HashMap::new();
        let mut latest_segment_of: HashMap<u64, u64> = HashMap::new();
        // Every id for which we've folded at least one `Put`. An `Update` or
        // `Delete` for an id never seen this way is a genuine corruption (the
        // first record for any id must be a `Put`), distinct from the
        // harmless case of a `Delete`/`Update` landing after we already
        // folded and removed that job's entry.
        let mut seen_put: std::collections::HashSet<u64> = std::collections::HashSet::new();
        let mut max_id = 0u64;

        for idx in indices {
            let path = Segment::path(dir, idx);
            let data = fs::read(&path)?;
            let mut offset = 0usize;

            loop {
                if offset >= data.len() {
                    break;
                }
                match Record::decode(&data[offset..]) {
                    Ok(Some((rec, len))) => {
                        max_id = max_id.max(rec.id());
                        latest_segment_of.insert(rec.id(), idx);
                        match rec {
                            Record::Put { id, tube, priority, delay_secs, ttr_secs, body } => {
                                let state = if delay_secs > 0 {
                                    RecordState::Delayed
                                } else {
                                    RecordState::Ready
                                };
                                seen_put.insert(id);
                                folded.insert(id, RecoveredJob {
                                    id,
                                    tube,
                                    priority,
                                    delay_secs,
                                    ttr_secs,
                                    body,
                                    state,
                                    anchor_segment: idx,
                                });
                            },
                            Record::Update { id, priority, delay_secs, ttr_secs, state } => {
                                if !seen_put.contains(&id) {
                                    return Err(Error::Replay(format!(
                                        "segment {idx} offset {offset}: update record for job {id} with no prior put"
                                    )));
                                }
                                if let Some(job) = folded.get_mut(&id) {
                                    job.priority = priority;
                                    job.delay_secs = delay_secs;
                                    job.ttr_secs = ttr_secs;
                                    job.state = state;
                                }
                            },
                            Record::Delete { id } => {
                                if !seen_put.contains(&id) {
                                    return Err(Error::Replay(format!(
                                        "segment {idx} offset {offset}: delete record for job {id} with no prior put"
                                    )));
                                }
                                folded.remove(&id);
                            },
                        }
                        offset += len;
                    },
                    Ok(None) => break,
                    Err(()) => {
                        warn!(
                            segment = idx,
                            offset,
                            "corrupt or truncated write-ahead log record, truncating replay here"
                        );
                        break;
                    },
                }
            }

            wal.segments.push_back(Segment::open_existing(
                dir,
                idx,
                segment_size,
                offset as u64,
            )?);
        }

        for (&id, job) in &folded {
            if let Some(seg) =
                wal.segments.iter_mut().find(|s| s.index == job.anchor_segment)
            {
                seg.anchors.insert(id);
            }
            let latest = latest_segment_of.get(&id).copied().unwrap_or(job.anchor_segment);
            if let Some(seg) = wal.segments.iter_mut().find(|s| s.index == latest) {
                seg.latest_refs.insert(id);
            }
            wal.live.insert(id, JobWalInfo { anchor_segment: job.anchor_segment, latest_segment: latest });
        }

        wal.next_index = wal.segments.back().map(|s| s.index).unwrap_or(0) + 1;
        wal.stats.current_index = wal.segments.back().map(|s| s.index).unwrap_or(0);
        wal.stats.oldest_index = wal.segments.front().map(|s| s.index).unwrap_or(0);

        let recovered: Vec<RecoveredJob> = folded.into_values().collect();
        debug!(
            jobs = recovered.len(),
            next_id = max_id + 1,
            segments = wal.segments.len(),
            "replayed write-ahead log"
        );

        Ok((wal, recovered))
    }

    fn open_new_segment(&mut self) -> Result<(), Error> {
        let index = self.next_index;
        self.next_index += 1;
        let seg = Segment::create(&self.dir, index, self.segment_size, &mut self.falloc)
            .map_err(|_| Error::OutOfMemory)?;
        self.segments.push_back(seg);
        self.stats.current_index = index;
        if self.stats.oldest_index == 0 {
            self.stats.oldest_index = index;
        }
        Ok(())
    }

    fn should_sync(&mut self) -> bool {
        match self.fsync_policy {
            FsyncPolicy::Always => true,
            FsyncPolicy::Never => false,
            FsyncPolicy::Periodic(period) => {
                if self.last_fsync.elapsed() >= period {
                    self.last_fsync = Instant::now();
                    true
                } else {
                    false
                }
            },
        }
    }

    /// Appends `record`, rotating to a fresh segment if it doesn't fit.
    /// Returns the index of the segment the record landed in.
    fn append(&mut self, record: &Record) -> Result<u64, Error> {
        let bytes = record.encode();
        if bytes.len() as u64 > self.segment_size {
            return Err(Error::OutOfMemory);
        }

        if self.segments.back().map_or(true, |s| s.remaining() < bytes.len() as u64) {
            self.open_new_segment()?;
        }

        let sync = self.should_sync();
        let seg = self.segments.back_mut().expect("segment just ensured");
        seg.append(&bytes, sync).map_err(|_| Error::OutOfMemory)?;
        self.stats.records_written += 1;
        Ok(seg.index)
    }

    pub fn put(
        &mut self,
        id: u64,
        tube: &[u8],
        priority: u32,
        delay_secs: u32,
        ttr_secs: u32,
        body: &[u8],
    ) -> Result<u64, Error> {
        let record = Record::Put {
            id,
            tube: tube.to_vec(),
            priority,
            delay_secs,
            ttr_secs,
            body: body.to_vec(),
        };
        let idx = self.append(&record)?;
        self.mark_anchor(id, idx);
        self.live.insert(id, JobWalInfo { anchor_segment: idx, latest_segment: idx });
        Ok(idx)
    }

    /// `true` once a job's only durable body-bearing record lives in the
    /// oldest segment still on disk: its next mutation must go through
    /// [`Wal::compact`] instead of [`Wal::record_update`] so the body is
    /// carried forward before that segment is reclaimed.
    pub fn needs_compaction(&self, id: u64) -> bool {
        let Some(info) = self.live.get(&id) else { return false };
        match self.segments.front() {
            Some(oldest) => info.anchor_segment == oldest.index,
            None => false,
        }
    }

    /// Rewrites a job as a fresh `Put` record, carrying its current body
    /// forward into the newest segment so the old anchor can be reclaimed.
    pub fn compact(
        &mut self,
        id: u64,
        tube: &[u8],
        priority: u32,
        delay_secs: u32,
        ttr_secs: u32,
        body: &[u8],
    ) -> Result<u64, Error> {
        let record = Record::Put {
            id,
            tube: tube.to_vec(),
            priority,
            delay_secs,
            ttr_secs,
            body: body.to_vec(),
        };
        let idx = self.append(&record)?;
        self.unmark(id);
        self.mark_anchor(id, idx);
        self.live.insert(id, JobWalInfo { anchor_segment: idx, latest_segment: idx });
        self.stats.records_migrated += 1;
        self.gc();
        Ok(idx)
    }

    pub fn record_update(
        &mut self,
        id: u64,
        priority: u32,
        delay_secs: u32,
        ttr_secs: u32,
        state: RecordState,
    ) -> Result<u64, Error> {
        let record = Record::Update { id, priority, delay_secs, ttr_secs, state };
        let idx = self.append(&record)?;
        if let Some(info) = self.live.get(&id) {
            let anchor = info.anchor_segment;
            self.unmark_latest(id);
            if let Some(seg) = self.segments.iter_mut().find(|s| s.index == idx) {
                seg.latest_refs.insert(id);
            }
            self.live.insert(id, JobWalInfo { anchor_segment: anchor, latest_segment: idx });
        }
        self.gc();
        Ok(idx)
    }

    pub fn delete(&mut self, id: u64) -> Result<(), Error> {
        let record = Record::Delete { id };
        self.append(&record)?;
        self.unmark(id);
        self.live.remove(&id);
        self.gc();
        Ok(())
    }

    pub fn anchor_of(&self, id: u64) -> Option<u64> {
        self.live.get(&id).map(|info| info.anchor_segment)
    }

    fn mark_anchor(&mut self, id: u64, idx: u64) {
        if let Some(seg) = self.segments.iter_mut().find(|s| s.index == idx) {
            seg.anchors.insert(id);
            seg.latest_refs.insert(id);
        }
    }

    fn unmark(&mut self, id: u64) {
        if let Some(info) = self.live.get(&id) {
            let (anchor, latest) = (info.anchor_segment, info.latest_segment);
            for seg in self.segments.iter_mut() {
                if seg.index == anchor {
                    seg.anchors.remove(&id);
                }
                if seg.index == latest {
                    seg.latest_refs.remove(&id);
                }
            }
        }
    }

    fn unmark_latest(&mut self, id: u64) {
        if let Some(info) = self.live.get(&id) {
            let latest = info.latest_segment;
            if let Some(seg) = self.segments.iter_mut().find(|s| s.index == latest) {
                seg.latest_refs.remove(&id);
            }
        }
    }

    /// Drops segments from the front of the deque once nothing references
    /// them, keeping at least the two most-recently-opened segments around
    /// regardless (the writer always has somewhere to land the next
    /// record without a fresh preallocation on the hot path).
    fn gc(&mut self) {
        let keep_open = 2usize.min(self.segments.len());
        while self.segments.len() > keep_open {
            let reclaimable = self.segments.front().map_or(false, Segment::is_reclaimable);
            if !reclaimable {
                break;
            }
            let seg = self.segments.pop_front().unwrap();
            let idx = seg.index;
            match seg.unlink(&self.dir) {
                Ok(()) => debug!(segment = idx, "reclaimed binlog segment"),
                Err(error) => {
                    warn!(%error, segment = idx, "failed to remove reclaimed binlog segment")
                },
            }
        }
        self.stats.oldest_index = self.segments.front().map_or(0, |s| s.index);
    }

    pub fn flush(&mut self) -> Result<(), Error> {
        if let Some(seg) = self.segments.back_mut() {
            seg.sync()?;
        }
        Ok(())
    }

    pub fn stats(&self) -> WalStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    struct TempDir(PathBuf);
    impl TempDir {
        fn new(tag: &str) -> Self {
            let dir = env::temp_dir().join(format!(
                "beanstalk-rs-wal-test-{tag}-{}-{:?}",
                std::process::id(),
                std::thread::current().id(),
            ));
            fs::create_dir_all(&dir).unwrap();
            Self(dir)
        }
    }
    impl Drop for TempDir {
        fn drop(&mut self) {
            fs::remove_dir_all(&self.0).ok();
        }
    }

    #[test]
    fn put_then_replay_round_trips_body() {
        let dir = TempDir::new("basic");
        {
            let (mut wal, recovered) =
                Wal::open(&dir.0, 65536, FsyncPolicy::Never, Falloc::real()).unwrap();
            assert!(recovered.is_empty());
            wal.put(1, b"default", 10, 0, 60, b"hello").unwrap();
            wal.put(2, b"default", 20, 0, 60, b"world").unwrap();
            wal.flush().unwrap();
        }

        let (_wal, recovered) =
            Wal::open(&dir.0, 65536, FsyncPolicy::Never, Falloc::real()).unwrap();
        let mut recovered = recovered;
        recovered.sort_by_key(|j| j.id);
        assert_eq!(recovered.len(), 2);
        assert_eq!(recovered[0].body, b"hello");
        assert_eq!(recovered[1].body, b"world");
    }

    #[test]
    fn delete_removes_job_from_replay() {
        let dir = TempDir::new("delete");
        {
            let (mut wal, _) =
                Wal::open(&dir.0, 65536, FsyncPolicy::Never, Falloc::real()).unwrap();
            wal.put(1, b"default", 10, 0, 60, b"body").unwrap();
            wal.delete(1).unwrap();
        }
        let (_wal, recovered) =
            Wal::open(&dir.0, 65536, FsyncPolicy::Never, Falloc::real()).unwrap();
        assert!(recovered.is_empty());
    }

    #[test]
    fn empty_dir_replays_clean() {
        let dir = TempDir::new("empty");
        let (_wal, recovered) =
            Wal::open(&dir.0, 65536, FsyncPolicy::Never, Falloc::real()).unwrap();
        assert!(recovered.is_empty());
    }

    #[test]
    fn segment_rolls_over_when_full() {
        let dir = TempDir::new("rollover");
        // Each put record is HEADER_LEN + 7 (tube) + 5 (body) bytes; force a
        // rollover to binlog.2 after a handful of them.
        let rec_len = (record::HEADER_LEN + 7 + 5) as u64;
        let (mut wal, _) = Wal::open(
            &dir.0,
            rec_len * 2,
            FsyncPolicy::Never,
            Falloc::real(),
        )
        .unwrap();

        for id in 1..=5u64 {
            wal.put(id, b"default", 0, 0, 60, b"hello").unwrap();
        }

        assert!(dir.0.join("binlog.1").exists());
        assert!(dir.0.join("binlog.2").exists());
    }

    #[test]
    fn disk_full_pattern_fails_one_put_and_leaves_others_intact() {
        let dir = TempDir::new("diskfull");
        let (mut wal, _) = Wal::open(
            &dir.0,
            8192,
            FsyncPolicy::Never,
            Falloc::pattern(vec![true, false, true]),
        )
        .unwrap();

        // First put allocates binlog.1 (pattern[0] = succeeds).
        assert!(wal.put(1, b"default", 0, 0, 60, b"a").unwrap_or(0) > 0);

        // A body too big to fit in what's left of binlog.1 forces a
        // rollover to a fresh segment, whose preallocation is scripted to
        // fail (pattern[1] = fails).
        let huge = vec![0u8; 8100];
        let err = wal.put(2, b"default", 0, 0, 60, &huge);
        assert!(matches!(err, Err(Error::OutOfMemory)));

        // binlog.1 still has room and no new segment is needed, so this
        // succeeds regardless of the pattern's remaining entries.
        assert!(wal.put(3, b"default", 0, 0, 60, b"c").is_ok());
    }

    #[test]
    fn compaction_carries_body_into_new_segment_before_gc() {
        let dir = TempDir::new("compact");
        let rec_len = (record::HEADER_LEN + 7 + 4) as u64;
        let (mut wal, _) = Wal::open(&dir.0, rec_len, FsyncPolicy::Never, Falloc::real()).unwrap();

        wal.put(1, b"default", 0, 0, 60, b"body").unwrap();
        assert!(wal.needs_compaction(1));

        wal.compact(1, b"default", 0, 0, 60, b"body").unwrap();
        assert!(!wal.needs_compaction(1));
        assert!(dir.0.join("binlog.1").exists().then_some(()).is_some());
    }
}
