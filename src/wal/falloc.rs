use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;

use nix::fcntl::{fallocate, FallocateFlags};

/// Abstracts space preallocation for WAL segments so tests can inject
/// deterministic allocation failures without needing a filesystem that's
/// actually out of space.
#[derive(Debug)]
pub enum Falloc {
    Real,
    /// `sequence[i]` is whether the `i`th allocation call succeeds. Once the
    /// sequence is exhausted, further calls succeed: a scripted failure
    /// models one disk-full window, not a permanently wedged volume.
    Pattern { sequence: Vec<bool>, cursor: usize },
}

impl Falloc {
    pub fn real() -> Self {
        Falloc::Real
    }

    pub fn pattern(sequence: Vec<bool>) -> Self {
        Falloc::Pattern { sequence, cursor: 0 }
    }

    pub fn allocate(&mut self, file: &File, len: u64) -> io::Result<()> {
        match self {
            // offset/len are `libc::off_t`, i.e. `i64` on every platform this
            // crate targets.
            Falloc::Real => {
                fallocate(file.as_raw_fd(), FallocateFlags::empty(), 0, len as i64)
                    .map_err(io::Error::from)
            },
            Falloc::Pattern { sequence, cursor } => {
                let ok = sequence.get(*cursor).copied().unwrap_or(true);
                *cursor += 1;
                if ok {
                    file.set_len(len)
                } else {
                    Err(io::Error::new(
                        io::ErrorKind::Other,
                        "simulated allocation failure (disk full)",
                    ))
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn pattern_fails_then_succeeds() {
        let mut f = Falloc::pattern(vec![true, false, true]);
        let dir = env::temp_dir().join(format!("beanstalk-rs-falloc-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("seg");
        let file = File::create(&path).unwrap();

        assert!(f.allocate(&file, 1024).is_ok());
        assert!(f.allocate(&file, 1024).is_err());
        assert!(f.allocate(&file, 1024).is_ok());
        // sequence exhausted: defaults to success from here on
        assert!(f.allocate(&file, 1024).is_ok());

        std::fs::remove_dir_all(&dir).ok();
    }
}
