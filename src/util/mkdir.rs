use crate::util::PathCache;
use anyhow::{Result, anyhow};
use log::trace;
use nix::errno::Errno;
use nix::sys::stat::Mode;
use std::path::{Path, PathBuf};

/* Makes `path` and every missing ancestor, top-down. An entry that already
 * exists is fine. When a cache is given, each directory is only attempted
 * once for the lifetime of that cache.
 */
pub fn make_directories(
    path: &Path,
    mut cache: Option<&mut PathCache>,
) -> Result<()> {
    if !path.is_absolute() {
        return Err(anyhow!("Path '{}' is not absolute", path.display()));
    }

    let mut pending: Vec<PathBuf> = path
        .ancestors()
        .filter(|dir| dir.parent().is_some())
        .map(Path::to_path_buf)
        .collect();
    pending.reverse();

    for dir in pending {
        if let Some(cache) = cache.as_deref_mut() {
            if !cache.insert_if_absent(&dir) {
                continue;
            }
        }

        match nix::unistd::mkdir(&dir, Mode::from_bits_truncate(0o755)) {
            Ok(_) => trace!("Created directory {}", dir.display()),
            Err(Errno::EEXIST) => (),
            Err(e) => {
                return Err(anyhow!(
                    "Failed to create directory {}: {}",
                    dir.display(),
                    e
                ));
            }
        }
    }

    Ok(())
}
