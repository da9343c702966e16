use crate::config::{Config, ExtraMount};
use crate::sandbox::chroot::STATIC_ETC_LINK;
use nix::unistd::{Gid, Uid, getegid, geteuid};
use std::path::PathBuf;

pub struct Sandbox {
    pub root_dir: PathBuf,
    pub store_dir: PathBuf,
    pub pid_namespace: bool,
    pub full_store: bool,
    pub binsh: Option<PathBuf>,
    pub nix_store_bin: String,
    pub path_vars: Vec<String>,
    pub mounts: Vec<ExtraMount>,
    /// Link whose target's closure is mounted when it exists
    pub static_etc: PathBuf,
    // effective ids, mapped to themselves inside the user namespace
    pub uid: Uid,
    pub gid: Gid,
}

impl Sandbox {
    pub fn from_config(config: &Config) -> Sandbox {
        Sandbox {
            root_dir: config.root_dir.clone(),
            store_dir: config.store_dir.clone(),
            pid_namespace: config.pid_namespace,
            full_store: config.full_store,
            binsh: config.binsh.clone(),
            nix_store_bin: config.nix_store_bin.clone(),
            path_vars: config.path_vars.clone(),
            mounts: config.mounts.clone(),
            static_etc: PathBuf::from(STATIC_ETC_LINK),
            uid: geteuid(),
            gid: getegid(),
        }
    }
}

#[cfg(test)]
impl Sandbox {
    /// A sandbox rooted at `root_dir` with nothing optional turned on.
    pub(crate) fn for_tests(root_dir: &std::path::Path) -> Sandbox {
        Sandbox {
            root_dir: root_dir.to_path_buf(),
            store_dir: PathBuf::from("/nix/store"),
            pid_namespace: false,
            full_store: false,
            binsh: None,
            nix_store_bin: "nix-store".to_string(),
            path_vars: Vec::new(),
            mounts: Vec::new(),
            static_etc: root_dir.join("no-static-etc"),
            uid: geteuid(),
            gid: getegid(),
        }
    }
}
