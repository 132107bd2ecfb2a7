use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::falloc::Falloc;

/// One fixed-size `binlog.N` file.
///
/// `anchors` tracks job ids whose most recent `Put` record (original or
/// rewritten by compaction) lives in this segment — losing that record
/// would lose the job body. `latest_refs` tracks job ids whose most recent
/// record of *any* kind lives here. A segment is only reclaimable once both
/// are empty.
pub struct Segment {
    pub index: u64,
    file: File,
    pub capacity: u64,
    pub used: u64,
    pub anchors: HashSet<u64>,
    pub latest_refs: HashSet<u64>,
}

impl Segment {
    pub fn path(dir: &Path, index: u64) -> PathBuf {
        dir.join(format!("binlog.{index}"))
    }

    pub fn create(
        dir: &Path,
        index: u64,
        capacity: u64,
        falloc: &mut Falloc,
    ) -> io::Result<Self> {
        let path = Self::path(dir, index);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        falloc.allocate(&file, capacity)?;
        Ok(Self {
            index,
            file,
            capacity,
            used: 0,
            anchors: HashSet::new(),
            latest_refs: HashSet::new(),
        })
    }

    /// Reopens a segment found on disk during replay. `used` is the offset
    /// replay stopped at (first zero-tag or corrupt record), i.e. the number
    /// of bytes of genuine record data at the front of the file.
    pub fn open_existing(dir: &Path, index: u64, capacity: u64, used: u64) -> io::Result<Self> {
        let path = Self::path(dir, index);
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        Ok(Self {
            index,
            file,
            capacity,
            used,
            anchors: HashSet::new(),
            latest_refs: HashSet::new(),
        })
    }

    pub fn remaining(&self) -> u64 {
        self.capacity - self.used
    }

    pub fn append(&mut self, bytes: &[u8], sync: bool) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(self.used))?;
        self.file.write_all(bytes)?;
        if sync {
            self.file.sync_data()?;
        }
        self.used += bytes.len() as u64;
        Ok(())
    }

    pub fn sync(&mut self) -> io::Result<()> {
        self.file.sync_data()
    }

    pub fn is_reclaimable(&self) -> bool {
        self.anchors.is_empty() && self.latest_refs.is_empty()
    }

    pub fn unlink(self, dir: &Path) -> io::Result<()> {
        let path = Self::path(dir, self.index);
        drop(self.file);
        fs::remove_file(path)
    }
}
