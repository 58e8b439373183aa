//! Liveness beacon.
//!
//! The worker bumps the mtime of a scratch file once per dispatch-loop
//! iteration; the supervising process `stat`s the descriptor and kills
//! workers whose beacon has gone stale. Timestamps come from the monotonic
//! clock so a wallclock jump cannot make a healthy worker look hung.

use std::env;
use std::fs::File;
use std::os::fd::AsFd;
use std::path::PathBuf;
use std::time::Duration;

use nix::sys::stat::{fstat, futimens, umask, Mode};
use nix::time::{clock_gettime, ClockId};
use nix::unistd::{fchown, getegid, geteuid, Gid, Uid};
use tracing::debug;

use crate::config::Config;

const BEACON_PREFIX: &str = "wstoker-";

/// Scratch file whose mtime tells the supervisor this worker is alive.
#[derive(Debug)]
pub struct Beacon {
    file: File,
}

impl Beacon {
    /// Create the beacon file under the configured directory.
    ///
    /// The file is created with the configured umask (restored afterwards),
    /// chowned to the worker's uid/gid when those differ from the effective
    /// ids, and unlinked immediately so no directory entry can leak. Only
    /// the descriptor stays alive.
    pub fn new(cfg: &Config) -> crate::Result<Beacon> {
        let dir = match &cfg.worker_tmp_dir {
            Some(dir) => {
                if !dir.is_dir() {
                    return Err(crate::Error::new_beacon(format!(
                        "{} doesn't exist, can't create beacon",
                        dir.display()
                    )));
                }
                dir.clone()
            }
            None => env::temp_dir(),
        };

        let tmp = create_with_umask(&dir, cfg.umask)?;

        if let Err(err) = chown_if_needed(&tmp, cfg.uid, cfg.gid) {
            return Err(crate::Error::new_beacon(err));
        }

        // Dropping the path unlinks it; the descriptor stays open.
        let file = tmp.into_file();
        debug!("beacon created in {}", dir.display());

        Ok(Beacon { file })
    }

    /// Bump the beacon's access and modification times to monotonic now.
    pub fn notify(&self) -> crate::Result<()> {
        let now = clock_gettime(ClockId::CLOCK_MONOTONIC).map_err(crate::Error::new_beacon)?;
        futimens(self.file.as_fd(), &now, &now).map_err(crate::Error::new_beacon)
    }

    /// The beacon's last modification time, as monotonic-clock seconds.
    pub fn last_update(&self) -> crate::Result<Duration> {
        let st = fstat(self.file.as_fd()).map_err(crate::Error::new_beacon)?;
        Ok(Duration::new(st.st_mtime as u64, st.st_mtime_nsec as u32))
    }

    /// Release the descriptor.
    pub fn close(self) {
        drop(self.file);
    }
}

fn create_with_umask(dir: &PathBuf, mask: u32) -> crate::Result<tempfile::NamedTempFile> {
    let old_mask = umask(Mode::from_bits_truncate(mask as nix::libc::mode_t));
    let result = tempfile::Builder::new()
        .prefix(BEACON_PREFIX)
        .tempfile_in(dir);
    umask(old_mask);
    result.map_err(crate::Error::new_beacon)
}

fn chown_if_needed(
    tmp: &tempfile::NamedTempFile,
    uid: Option<u32>,
    gid: Option<u32>,
) -> nix::Result<()> {
    let want_uid = uid.map(Uid::from_raw).filter(|uid| *uid != geteuid());
    let want_gid = gid.map(Gid::from_raw).filter(|gid| *gid != getegid());
    if want_uid.is_none() && want_gid.is_none() {
        return Ok(());
    }
    fchown(tmp.as_file().as_fd(), want_uid, want_gid)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn beacon_in(dir: &tempfile::TempDir) -> Beacon {
        let cfg = Config::builder()
            .worker_tmp_dir(dir.path())
            .build()
            .unwrap();
        Beacon::new(&cfg).unwrap()
    }

    #[test]
    fn creates_and_unlinks() {
        let dir = tempfile::tempdir().unwrap();
        let beacon = beacon_in(&dir);
        // No directory entry may remain once the beacon exists.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        beacon.close();
    }

    #[test]
    fn notify_advances_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let beacon = beacon_in(&dir);

        beacon.notify().unwrap();
        let first = beacon.last_update().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        beacon.notify().unwrap();
        let second = beacon.last_update().unwrap();

        assert!(second > first, "mtime must advance: {first:?} {second:?}");
    }

    #[test]
    fn missing_dir_is_an_error() {
        let cfg = Config::builder()
            .worker_tmp_dir("/nonexistent/stoker-beacon")
            .build()
            .unwrap();
        let err = Beacon::new(&cfg).unwrap_err();
        assert!(err.to_string().contains("beacon"));
    }
}
