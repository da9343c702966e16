use anyhow::{Context, Result, anyhow};
use log::{debug, error, trace};
use nix::unistd::{Gid, Uid};
use std::fmt::{self, Display};
use std::io::Write;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;

/// The byte sent from the process creating the namespaces to the process
/// writing the id maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncSignal {
    Continue = b'.',
    Abort = b'X',
}

impl SyncSignal {
    pub fn send(self, fd: &OwnedFd) -> Result<()> {
        nix::unistd::write(fd, &[self as u8])
            .context(format!("failed to send {:?} over sync pipe", self))?;
        Ok(())
    }

    /* End of file means the other side went away without saying anything,
     * which is treated like an abort. */
    pub fn receive(fd: &OwnedFd) -> Result<SyncSignal> {
        let mut buffer = [0; 1];
        let n = nix::unistd::read(fd.as_raw_fd(), &mut buffer)
            .context("failed to read from sync pipe")?;
        if n == 1 && buffer[0] == SyncSignal::Continue as u8 {
            Ok(SyncSignal::Continue)
        } else {
            Ok(SyncSignal::Abort)
        }
    }
}

/// One line of a uid_map or gid_map file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMap {
    pub inner: u32,
    pub outer: u32,
    pub count: u32,
}

impl IdMap {
    pub fn identity(id: u32) -> Self {
        IdMap {
            inner: id,
            outer: id,
            count: 1,
        }
    }
}

impl Display for IdMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.inner, self.outer, self.count)
    }
}

fn write_proc(proc_dir: &Path, name: &str, contents: &str) -> Result<()> {
    let path = proc_dir.join(name);
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .open(&path)
        .context(format!("open {}", path.display()))?;
    // the kernel wants each map in a single write
    let written = file
        .write(contents.as_bytes())
        .context(format!("write {}", path.display()))?;
    if written != contents.len() {
        return Err(anyhow!(
            "short write to {}: {} of {} bytes",
            path.display(),
            written,
            contents.len()
        ));
    }
    Ok(())
}

/**
 * Maps `uid` and `gid` to themselves in the user namespace of the process
 * whose /proc directory is `proc_dir`.
 */
pub fn write_maps(proc_dir: &Path, uid: Uid, gid: Gid) -> Result<()> {
    if !proc_dir.is_dir() {
        return Err(anyhow!("open {}: not a directory", proc_dir.display()));
    }

    write_proc(proc_dir, "uid_map", &IdMap::identity(uid.as_raw()).to_string())?;

    // Kernels before Linux 3.19 don't have this file
    if let Err(e) = write_proc(proc_dir, "setgroups", "deny") {
        trace!("Ignoring setgroups failure: {:#}", e);
    }

    write_proc(proc_dir, "gid_map", &IdMap::identity(gid.as_raw()).to_string())?;

    Ok(())
}

/**
 * Body of the short lived child that writes the id maps once the namespaces
 * exist. Returns the exit status for the child.
 */
pub fn run_id_mapper(
    read_fd: &OwnedFd,
    proc_dir: &Path,
    uid: Uid,
    gid: Gid,
) -> i32 {
    match SyncSignal::receive(read_fd) {
        Ok(SyncSignal::Continue) => (),
        Ok(SyncSignal::Abort) => {
            debug!("Namespace creation aborted, not writing id maps");
            return 1;
        }
        Err(e) => {
            error!("read pipe from parent: {:#}", e);
            return 1;
        }
    }

    match write_maps(proc_dir, uid, gid) {
        Ok(_) => 0,
        Err(e) => {
            error!("Failed to write id maps: {:#}", e);
            1
        }
    }
}
