use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use beanstalk_rs::config::Config;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
pub struct Args {
    /// Address to listen on.
    #[arg(short, long, default_value_t = IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)))]
    pub listen: IpAddr,
    /// (TCP) port to listen on.
    #[arg(short, long, default_value_t = 11300)]
    pub port: u16,
    /// Enables write-ahead logging and sets the directory to store WAL files in.
    #[arg(short = 'b', long)]
    pub wal_dir: Option<PathBuf>,
    /// Sets the maximum allowed job size.
    #[arg(short = 'z', long, default_value_t = 65535)]
    pub max_job_size: u32,
    /// Write-ahead log fsync period in milliseconds. 0 means fsync after
    /// every write.
    #[arg(short = 'f', long, default_value_t = 50)]
    pub fsync_period_ms: u64,
    /// Disables fsync on the write-ahead log entirely. Unsafe: a crash can
    /// lose recently-written jobs that the OS hadn't flushed to disk yet.
    #[arg(short = 'F', long, default_value_t = false)]
    pub no_fsync: bool,
    /// Maximum size in bytes of a single binlog segment file.
    #[arg(short = 's', long, default_value_t = 10_485_760)]
    pub binlog_segment_size: u64,
    /// Enables human-friendly, verbose logging.
    #[arg(short = 'V', long = "debug", default_value_t)]
    pub debug: bool,
}

impl Args {
    pub fn into_config(self) -> Config {
        Config {
            listen: self.listen,
            port: self.port,
            wal_dir: self.wal_dir,
            max_job_size: self.max_job_size,
            fsync_period: Duration::from_millis(self.fsync_period_ms),
            no_fsync: self.no_fsync,
            binlog_segment_size: self.binlog_segment_size,
            verbose: self.debug,
        }
    }
}
