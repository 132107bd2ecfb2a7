use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::wal::FsyncPolicy;

/// Server configuration, built once at startup from CLI args and threaded
/// through to [`crate::server::Server::open`]. Kept as a plain struct (rather
/// than reading `Args` deeper into the stack) so tests can build a `Config`
/// directly without going through `clap`.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: IpAddr,
    pub port: u16,
    pub wal_dir: Option<PathBuf>,
    pub max_job_size: u32,
    pub fsync_period: Duration,
    pub no_fsync: bool,
    pub binlog_segment_size: u64,
    pub verbose: bool,
}

impl Config {
    pub fn fsync_policy(&self) -> FsyncPolicy {
        if self.no_fsync {
            FsyncPolicy::Never
        } else if self.fsync_period.is_zero() {
            FsyncPolicy::Always
        } else {
            FsyncPolicy::Periodic(self.fsync_period)
        }
    }
}
