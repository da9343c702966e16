use crate::util::{Mounter, PathCache, make_directories};
use anyhow::{Context, Result, anyhow};
use log::{debug, trace};
use nix::mount::MsFlags;
use nix::sys::statvfs::{FsFlags, statvfs};
use nix::unistd::AccessFlags;
use std::ffi::OsString;
use std::os::unix::fs::symlink;
use std::path::{Component, Path, PathBuf};

/// Same limit the kernel applies when following a path (MAXSYMLINKS).
const MAX_SYMLINK_HOPS: usize = 40;

/**
 * Populates a new root directory with bind mounts of host paths. Each host
 * path `/p` lands at `<root>/p`.
 *
 * Two caches are kept: `created` for directories and symlinks made inside the
 * new root, `mounted` for mount destinations. They are separate because a
 * directory created as the ancestor of one mount must still be mountable
 * itself later on.
 */
pub struct MountBuilder<M: Mounter> {
    root: PathBuf,
    created: PathCache,
    mounted: PathCache,
    mounter: M,
}

impl<M: Mounter> MountBuilder<M> {
    pub fn new(root: &Path, mounter: M) -> Self {
        MountBuilder {
            root: root.to_path_buf(),
            created: PathCache::new(),
            mounted: PathCache::new(),
            mounter,
        }
    }

    /// Number of distinct mount destinations so far.
    pub fn mount_count(&self) -> usize {
        self.mounted.len()
    }

    pub fn mounter(&mut self) -> &mut M {
        &mut self.mounter
    }

    /**
     * Where the host path `path` appears inside the new root. `..` is
     * resolved lexically first and stops at `/`, so the result never
     * leaves the root.
     */
    pub fn mount_target(&self, path: &Path) -> Result<PathBuf> {
        if !path.is_absolute() {
            return Err(anyhow!(
                "Mount source '{}' is not absolute",
                path.display()
            ));
        }
        let mut target = OsString::from(self.root.as_os_str());
        target.push(normalize(path).as_os_str());
        Ok(PathBuf::from(target))
    }

    /// `make_directories` that remembers what it already created.
    pub fn make_directories_cached(&mut self, path: &Path) -> Result<()> {
        make_directories(path, Some(&mut self.created))
    }

    pub fn make_directories(&mut self, path: &Path) -> Result<()> {
        make_directories(path, None)
    }

    /**
     * Bind mounts `path` into the new root. Missing sources are skipped, not
     * errors. With `resolve_symlinks` the canonical location is mounted and
     * any symlinks leading to it are recreated inside the root.
     */
    pub fn bind_mount(
        &mut self,
        path: &Path,
        read_only: bool,
        restricted: bool,
        resolve_symlinks: bool,
    ) -> Result<()> {
        let source = if resolve_symlinks {
            match std::fs::canonicalize(path) {
                Ok(source) => source,
                Err(e) => {
                    debug!("Skipping missing mount source {}: {}", path.display(), e);
                    return Ok(());
                }
            }
        } else {
            if nix::unistd::access(path, AccessFlags::F_OK).is_err() {
                debug!("Skipping missing mount source {}", path.display());
                return Ok(());
            }
            path.to_path_buf()
        };

        if is_regular_file(&source) {
            return self.bind_file(&source);
        }

        let target = self.mount_target(&source)?;

        if resolve_symlinks {
            self.recreate_symlink_chain(path, &source)?;
        }

        self.make_directories(&target)?;

        if !self.mounted.insert_if_absent(&target) {
            trace!("{} is already mounted", target.display());
            return Ok(());
        }

        let base_flags = MsFlags::MS_BIND | MsFlags::MS_REC;
        trace!("Binding {} to {}", source.display(), target.display());
        self.mounter
            .mount(Some(source.as_path()), &target, None, base_flags, None)
            .context(format!(
                "mount {} to {}",
                source.display(),
                target.display()
            ))?;

        let mut extra_flags = MsFlags::empty();
        if read_only {
            extra_flags |= MsFlags::MS_RDONLY;
        }
        if restricted {
            extra_flags |= MsFlags::MS_NOSUID | MsFlags::MS_NODEV;
        }

        // A bind mount ignores these flags, they only take effect on remount
        if !extra_flags.is_empty() {
            let extra_flags = extra_flags | locked_flags(&source);
            trace!("Remounting {} with {:?}", target.display(), extra_flags);
            self.mounter
                .mount(
                    Some(Path::new("none")),
                    &target,
                    None,
                    base_flags | MsFlags::MS_REMOUNT | extra_flags,
                    None,
                )
                .context(format!("remount {}", target.display()))?;
        }

        Ok(())
    }

    /// Bind mounts a single file. Unreadable sources are skipped.
    pub fn bind_file(&mut self, path: &Path) -> Result<()> {
        if nix::unistd::access(path, AccessFlags::R_OK).is_err() {
            debug!("Skipping unreadable mount source {}", path.display());
            return Ok(());
        }

        let target = self.mount_target(path)?;
        if let Some(parent) = target.parent() {
            self.make_directories_cached(parent)?;
        }

        if !self.mounted.insert_if_absent(&target) {
            trace!("{} is already mounted", target.display());
            return Ok(());
        }

        // no truncation, the target may be the host file seen through an
        // earlier bind mount
        std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&target)
            .context(format!("unable to create {}", target.display()))?;

        trace!("Binding file {} to {}", path.display(), target.display());
        self.mounter
            .mount(Some(path), &target, None, MsFlags::MS_BIND, None)
            .context(format!(
                "mount file {} to {}",
                path.display(),
                target.display()
            ))
    }

    /* Walks from `from` to its canonical form `to`, recreating every symlink
     * along the way inside the root with the same link text, so following
     * them inside the sandbox ends up at the mounted canonical path. */
    fn recreate_symlink_chain(&mut self, from: &Path, to: &Path) -> Result<()> {
        let mut current = from.to_path_buf();

        for _ in 0..MAX_SYMLINK_HOPS {
            if current == to {
                return Ok(());
            }

            let link_text = match std::fs::read_link(&current) {
                Ok(link_text) => link_text,
                Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
                    // not a symlink, nothing more to recreate
                    return Ok(());
                }
                Err(e) => {
                    return Err(anyhow!(
                        "reading link {}: {}",
                        current.display(),
                        e
                    ));
                }
            };

            let target = self.mount_target(&current)?;
            if let Some(parent) = target.parent() {
                self.make_directories_cached(parent)?;
            }

            if self.created.insert_if_absent(&target) {
                match symlink(&link_text, &target) {
                    Ok(_) => trace!(
                        "Linked {} -> {}",
                        target.display(),
                        link_text.display()
                    ),
                    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
                    Err(e) => {
                        return Err(anyhow!(
                            "creating symlink from {} to {}: {}",
                            target.display(),
                            link_text.display(),
                            e
                        ));
                    }
                }
            }

            current = match current.parent() {
                Some(dir) if link_text.is_relative() => {
                    normalize(&dir.join(&link_text))
                }
                _ => normalize(&link_text),
            };
        }

        Err(anyhow!(
            "Too many levels of symbolic links between {} and {}",
            from.display(),
            to.display()
        ))
    }
}

/* Drops `.` and folds `..` into its parent in an absolute path without
 * touching the filesystem. `..` at `/` stays at `/`, as the kernel does. */
fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    normalized
}

/* Flags of the mount `path` lives on. Inside a user namespace the kernel
 * locks these on mounts inherited from the host, and a remount that drops
 * one fails with EPERM. */
fn locked_flags(path: &Path) -> MsFlags {
    let Ok(stat) = statvfs(path) else {
        return MsFlags::empty();
    };
    [
        (FsFlags::ST_RDONLY, MsFlags::MS_RDONLY),
        (FsFlags::ST_NOSUID, MsFlags::MS_NOSUID),
        (FsFlags::ST_NODEV, MsFlags::MS_NODEV),
        (FsFlags::ST_NOEXEC, MsFlags::MS_NOEXEC),
        (FsFlags::ST_NOATIME, MsFlags::MS_NOATIME),
        (FsFlags::ST_NODIRATIME, MsFlags::MS_NODIRATIME),
        (FsFlags::ST_RELATIME, MsFlags::MS_RELATIME),
    ]
    .into_iter()
    .filter(|(fs_flag, _)| stat.flags().contains(*fs_flag))
    .fold(MsFlags::empty(), |flags, (_, ms_flag)| flags | ms_flag)
}

fn is_regular_file(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file())
        .unwrap_or(false)
}
