use crate::sandbox::Sandbox;
use crate::sandbox::id_map::{SyncSignal, run_id_mapper};
use crate::util::{MountBuilder, SystemMounter};
use anyhow::{Context, Result, anyhow};
use log::{debug, error, trace};
use nix::sched::{CloneFlags, unshare};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{ForkResult, fork, getpid, pipe};
use std::path::PathBuf;

impl Sandbox {
    /**
     * Moves the calling process into a fresh set of namespaces with the new
     * root assembled and entered. Only the process that should go on to run
     * the build returns from here; the first process waits for it and
     * exits with its status.
     */
    pub fn enter(&self) -> Result<()> {
        self.create_namespaces()?;
        self.fork_into_namespaces()?;

        let mut builder = MountBuilder::new(&self.root_dir, SystemMounter);
        self.setup_chroot(&mut builder)
    }

    pub(crate) fn namespace_flags(&self) -> CloneFlags {
        let mut flags = CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWUSER;
        if self.pid_namespace {
            flags |= CloneFlags::CLONE_NEWPID;
        }
        flags
    }

    /* A process can't write its own id maps after unsharing the user
     * namespace, so a helper forked beforehand writes them once it hears the
     * namespaces exist. */
    fn create_namespaces(&self) -> Result<()> {
        let (read_fd, write_fd) = pipe().context("pipe")?;
        let namespace_pid = getpid();

        match unsafe { fork() }.context("fork")? {
            ForkResult::Child => {
                drop(write_fd);
                let proc_dir = PathBuf::from(format!("/proc/{}", namespace_pid));
                let status =
                    run_id_mapper(&read_fd, &proc_dir, self.uid, self.gid);
                std::process::exit(status);
            }
            ForkResult::Parent { child } => {
                drop(read_fd);

                let flags = self.namespace_flags();
                trace!("Unsharing {:?}", flags);
                if let Err(e) = unshare(flags) {
                    if let Err(e) = SyncSignal::Abort.send(&write_fd) {
                        error!("signal child exit: {:#}", e);
                    }
                    drop(write_fd);
                    match waitpid(child, None) {
                        Ok(status) => {
                            trace!("id map writer aborted: {:?}", status)
                        }
                        Err(e) => error!("waitpid on id map writer: {}", e),
                    }
                    return Err(anyhow!("unshare {:?}: {}", flags, e));
                }

                let sent = SyncSignal::Continue.send(&write_fd);
                drop(write_fd);

                let status = waitpid(child, None)
                    .context("waitpid on id map writer")?;
                sent.context("signal id map writer")?;

                match status {
                    WaitStatus::Exited(_, 0) => {
                        debug!(
                            "Mapped uid {} and gid {} into the user namespace",
                            self.uid, self.gid
                        );
                        Ok(())
                    }
                    status => Err(anyhow!(
                        "Failed to write uid/gid maps: {:?}",
                        status
                    )),
                }
            }
        }
    }

    /* A PID namespace only applies to children, so the build always runs in
     * a forked child. The parent stays outside and mirrors its exit code. */
    fn fork_into_namespaces(&self) -> Result<()> {
        match unsafe { fork() }.context("fork")? {
            ForkResult::Child => Ok(()),
            ForkResult::Parent { child } => {
                trace!("Waiting for sandboxed process {}", child);
                let code = exit_code(waitpid(child, None));
                std::process::exit(code);
            }
        }
    }
}

/// The exit code the waiting parent should report for its child.
pub(crate) fn exit_code(status: nix::Result<WaitStatus>) -> i32 {
    match status {
        Ok(WaitStatus::Exited(_, code)) => code,
        Ok(WaitStatus::Signaled(_, signal, _)) => {
            error!("sandbox: killed by signal {}", signal);
            1
        }
        Ok(status) => {
            error!("sandbox: unexpected wait status {:?}", status);
            1
        }
        Err(e) => {
            error!("sandbox: waitpid failure: {}", e);
            1
        }
    }
}
