use crate::sandbox::Sandbox;
use crate::sandbox::closure::{ClosureQuery, NixStoreQuery};
use crate::util::{MountBuilder, Mounter, expand_env_vars_with, make_directories};
use anyhow::{Context, Result, anyhow};
use log::{debug, info, trace};
use nix::mount::MsFlags;
use nix::unistd::{chdir, chroot};
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

/// Host directories to bind into the sandbox, as `host=sandbox` pairs
/// separated by `:`. Meant for debugging builds.
pub const DEBUG_INJECT_VAR: &str = "BUILD_SANDBOX_DEBUG_INJECT_DIRS";

/// On NixOS this points at the store path holding the generated /etc.
pub const STATIC_ETC_LINK: &str = "/etc/static";

impl Sandbox {
    /// Assembles the new root and moves into it.
    pub fn setup_chroot<M: Mounter>(
        &self,
        builder: &mut MountBuilder<M>,
    ) -> Result<()> {
        let env = |name: &str| std::env::var(name).ok();
        if self.full_store {
            self.assemble_root(builder, None, &env)?;
        } else {
            let mut query = NixStoreQuery::new(&self.nix_store_bin);
            self.assemble_root(builder, Some(&mut query), &env)?;
        }

        debug!(
            "Entering {} with {} bind mounts",
            self.root_dir.display(),
            builder.mount_count()
        );
        chroot(&self.root_dir)
            .context(format!("chroot {}", self.root_dir.display()))?;
        chdir("/").context("chdir rootfs")?;
        Ok(())
    }

    /**
     * Mounts everything the build needs under the root directory. `query` is
     * used for dependency closures and must be present unless `full_store`
     * is set. Environment variables are read through `env`.
     */
    pub(crate) fn assemble_root<M: Mounter>(
        &self,
        builder: &mut MountBuilder<M>,
        query: Option<&mut dyn ClosureQuery>,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<()> {
        let root = self.root_dir.clone();

        debug!("Mounting tmpfs on {}", root.display());
        builder.make_directories(&root)?;
        builder
            .mounter()
            .mount(
                Some(Path::new("none")),
                &root,
                Some("tmpfs"),
                MsFlags::MS_NOEXEC
                    | MsFlags::MS_NOSUID
                    | MsFlags::MS_NODEV
                    | MsFlags::MS_NOATIME,
                None,
            )
            .context("mount rootfs")?;

        debug!("Mounting system directories");
        builder.bind_mount(Path::new("/etc"), true, true, false)?;
        builder.bind_mount(Path::new("/dev"), false, false, false)?;

        if self.pid_namespace {
            let proc_dir = root.join("proc");
            builder.make_directories(&proc_dir)?;
            builder
                .mounter()
                .mount(
                    Some(Path::new("none")),
                    &proc_dir,
                    Some("proc"),
                    MsFlags::empty(),
                    None,
                )
                .context("mount proc")?;
        } else {
            builder.bind_mount(Path::new("/proc"), false, false, false)?;
        }

        for dir in ["/sys", "/run", "/var/run"] {
            builder.bind_mount(Path::new(dir), false, false, false)?;
        }
        builder.bind_mount(Path::new("/tmp"), false, true, false)?;

        match query {
            _ if self.full_store => {
                debug!("Mounting the whole store {}", self.store_dir.display());
                builder.bind_mount(&self.store_dir, true, true, false)?;
            }
            Some(query) => {
                self.mount_static_etc(builder, query)?;
                for var in &self.path_vars {
                    match env(var) {
                        Some(value) => {
                            debug!("Mounting closures of ${}", var);
                            self.mount_path_list(builder, query, &value)?;
                        }
                        None => trace!("${} is not set", var),
                    }
                }
            }
            None => {
                return Err(anyhow!(
                    "No closure query available to resolve dependencies"
                ));
            }
        }

        self.mount_extra(builder, env)?;
        mount_xauthority(builder, env)?;
        if let Some(dirs) = env(DEBUG_INJECT_VAR) {
            inject_debug_dirs(builder, &dirs)?;
        }

        if let Some(binsh) = &self.binsh {
            let bin = root.join("bin");
            builder.make_directories(&bin)?;
            symlink(binsh, bin.join("sh")).context(format!(
                "creating symlink from {} to {}",
                bin.join("sh").display(),
                binsh.display()
            ))?;
        }

        Ok(())
    }

    pub(crate) fn mount_static_etc<M: Mounter>(
        &self,
        builder: &mut MountBuilder<M>,
        query: &mut dyn ClosureQuery,
    ) -> Result<()> {
        let link = &self.static_etc;
        match std::fs::read_link(link) {
            Ok(target) => {
                debug!("Mounting closure of {}", target.display());
                mount_requisites(builder, query, &target)
            }
            Err(e) => {
                trace!("No {}: {}", link.display(), e);
                Ok(())
            }
        }
    }

    fn mount_path_list<M: Mounter>(
        &self,
        builder: &mut MountBuilder<M>,
        query: &mut dyn ClosureQuery,
        value: &str,
    ) -> Result<()> {
        for entry in value.split(':').filter(|e| !e.is_empty()) {
            mount_requisites(builder, query, Path::new(entry))?;
        }
        Ok(())
    }

    fn mount_extra<M: Mounter>(
        &self,
        builder: &mut MountBuilder<M>,
        env: &dyn Fn(&str) -> Option<String>,
    ) -> Result<()> {
        for mount in &self.mounts {
            let expanded = expand_env_vars_with(&mount.path, env)?;
            let path = Path::new(&expanded);
            if mount.required {
                make_directories(path, None)
                    .context(format!("creating required mount {}", expanded))?;
            }
            builder.bind_mount(path, false, true, true)?;
        }
        Ok(())
    }
}

fn mount_requisites<M: Mounter>(
    builder: &mut MountBuilder<M>,
    query: &mut dyn ClosureQuery,
    path: &Path,
) -> Result<()> {
    query
        .query_requisites(path)
        .context(format!("Unable to get requisites for {}", path.display()))?;

    while let Some(requisite) = query.next_result() {
        if is_directory(&requisite) {
            builder.bind_mount(&requisite, true, true, false)?;
        } else {
            builder.bind_file(&requisite)?;
        }
    }
    Ok(())
}

// a requisite that can't be stat'ed is handed to bind_mount, which skips it
fn is_directory(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(metadata) => metadata.is_dir(),
        Err(e) => {
            trace!("stat {}: {}", path.display(), e);
            true
        }
    }
}

fn mount_xauthority<M: Mounter>(
    builder: &mut MountBuilder<M>,
    env: &dyn Fn(&str) -> Option<String>,
) -> Result<()> {
    let xauthority = match env("XAUTHORITY") {
        Some(xauthority) => PathBuf::from(xauthority),
        None => {
            let home = env("HOME").ok_or_else(|| anyhow!("Unable to find $HOME"))?;
            Path::new(&home).join(".Xauthority")
        }
    };
    if !xauthority.is_absolute() {
        debug!("Skipping relative Xauthority path {}", xauthority.display());
        return Ok(());
    }
    builder.bind_file(&xauthority)
}

fn inject_debug_dirs<M: Mounter>(
    builder: &mut MountBuilder<M>,
    dirs: &str,
) -> Result<()> {
    for entry in dirs.split(':').filter(|e| !e.is_empty()) {
        let Some((host, sandbox)) = entry.split_once('=') else {
            trace!("Ignoring {} entry without '=': {}", DEBUG_INJECT_VAR, entry);
            continue;
        };

        let target = builder.mount_target(Path::new(sandbox))?;
        builder.make_directories_cached(&target)?;
        builder
            .mounter()
            .mount(Some(Path::new(host)), &target, None, MsFlags::MS_BIND, None)
            .context(format!("mount {} to {}", host, target.display()))?;
        info!("Injected directory '{}' to '{}'", host, sandbox);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExtraMount;
    use crate::util::{MountCall, RecordingMounter, test_dir};
    use std::collections::{HashMap, VecDeque};

    /// Answers closure queries from a fixed table.
    #[derive(Default)]
    struct FakeQuery {
        closures: HashMap<PathBuf, Vec<PathBuf>>,
        queried: Vec<PathBuf>,
        pending: VecDeque<PathBuf>,
    }

    impl ClosureQuery for FakeQuery {
        fn query_requisites(&mut self, path: &Path) -> Result<()> {
            self.queried.push(path.to_path_buf());
            let closure = self
                .closures
                .get(path)
                .ok_or_else(|| anyhow!("{} is not a valid store path", path.display()))?;
            self.pending = closure.iter().cloned().collect();
            Ok(())
        }

        fn next_result(&mut self) -> Option<PathBuf> {
            self.pending.pop_front()
        }
    }

    struct Fixture {
        base: PathBuf,
        sandbox: Sandbox,
        builder: MountBuilder<RecordingMounter>,
        env: HashMap<String, String>,
    }

    impl Fixture {
        fn new(name: &str) -> Self {
            let base = test_dir(name);
            std::fs::create_dir_all(base.join("home"))
                .expect("create fixture home");
            let root = base.join("root");
            let mut env = HashMap::new();
            env.insert("HOME".to_string(), base.join("home").display().to_string());
            Fixture {
                sandbox: Sandbox::for_tests(&root),
                builder: MountBuilder::new(&root, RecordingMounter::default()),
                base,
                env,
            }
        }

        fn assemble(&mut self, query: Option<&mut dyn ClosureQuery>) -> Result<()> {
            let env = self.env.clone();
            let lookup = move |name: &str| env.get(name).cloned();
            self.sandbox.assemble_root(&mut self.builder, query, &lookup)
        }

        fn calls(&mut self) -> Vec<MountCall> {
            self.builder.mounter().calls.clone()
        }

        fn in_root(&self, path: &Path) -> PathBuf {
            self.builder.mount_target(path).expect("absolute path")
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.base);
        }
    }

    fn targets(calls: &[MountCall]) -> Vec<PathBuf> {
        calls.iter().map(|c| c.target.clone()).collect()
    }

    #[test]
    fn test_full_store_order() -> Result<()> {
        let mut f = Fixture::new("assemble-order");
        f.sandbox.full_store = true;
        f.sandbox.store_dir = f.base.join("store");
        std::fs::create_dir_all(&f.sandbox.store_dir)?;
        f.assemble(None)?;

        let calls = f.calls();
        let root = f.sandbox.root_dir.clone();
        assert_eq!(calls[0].target, root);
        assert_eq!(calls[0].fstype.as_deref(), Some("tmpfs"));
        assert_eq!(
            calls[0].flags,
            MsFlags::MS_NOEXEC
                | MsFlags::MS_NOSUID
                | MsFlags::MS_NODEV
                | MsFlags::MS_NOATIME
        );
        assert!(root.is_dir());

        // /etc is bound then remounted read-only
        assert_eq!(calls[1].target, f.in_root(Path::new("/etc")));
        assert!(calls[2].flags.contains(MsFlags::MS_RDONLY));
        assert_eq!(calls[3].target, f.in_root(Path::new("/dev")));

        let ts = targets(&calls);
        let position = |p: &Path| ts.iter().position(|t| t == p);
        let proc_at = position(&f.in_root(Path::new("/proc")));
        let tmp_at = position(&f.in_root(Path::new("/tmp")));
        let store_at = position(&f.in_root(&f.sandbox.store_dir));
        assert!(proc_at.is_some());
        assert!(proc_at < tmp_at);
        assert!(tmp_at < store_at);

        // the store is read-only and restricted
        let store_remount = &calls[store_at.unwrap() + 1];
        assert!(store_remount.flags.contains(
            MsFlags::MS_RDONLY | MsFlags::MS_NOSUID | MsFlags::MS_NODEV
        ));
        Ok(())
    }

    #[test]
    fn test_pid_namespace_mounts_fresh_proc() -> Result<()> {
        let mut f = Fixture::new("assemble-proc");
        f.sandbox.full_store = true;
        f.sandbox.store_dir = f.base.join("store");
        f.sandbox.pid_namespace = true;
        f.assemble(None)?;

        let proc_dir = f.sandbox.root_dir.join("proc");
        let proc_calls: Vec<MountCall> = f
            .calls()
            .into_iter()
            .filter(|c| c.target == proc_dir)
            .collect();
        assert_eq!(proc_calls.len(), 1);
        assert_eq!(proc_calls[0].fstype.as_deref(), Some("proc"));
        assert!(proc_dir.is_dir());
        Ok(())
    }

    #[test]
    fn test_closure_of_path_vars() -> Result<()> {
        let mut f = Fixture::new("assemble-closure");
        let store = f.base.join("store");
        let tool = store.join("aaa-tool");
        let lib = store.join("bbb-lib");
        let script = store.join("ccc-script");
        std::fs::create_dir_all(tool.join("bin"))?;
        std::fs::create_dir_all(&lib)?;
        std::fs::write(&script, "#!/bin/sh\n")?;

        let mut query = FakeQuery::default();
        query.closures.insert(
            tool.join("bin"),
            vec![tool.clone(), lib.clone(), script.clone()],
        );
        query.closures.insert(script.clone(), vec![script.clone()]);

        f.sandbox.path_vars = vec!["BUILD_PATH".into(), "UNSET_PATH".into()];
        f.env.insert(
            "BUILD_PATH".into(),
            format!("{}::{}", tool.join("bin").display(), script.display()),
        );
        f.assemble(Some(&mut query))?;

        assert_eq!(query.queried, vec![tool.join("bin"), script.clone()]);

        let calls = f.calls();
        let tool_target = f.in_root(&tool);
        let tool_mounts: Vec<&MountCall> =
            calls.iter().filter(|c| c.target == tool_target).collect();
        assert_eq!(tool_mounts.len(), 2);
        assert!(tool_mounts[1].flags.contains(MsFlags::MS_RDONLY));

        // the script shows up twice in the closures but is bound once
        let script_target = f.in_root(&script);
        let script_mounts: Vec<&MountCall> =
            calls.iter().filter(|c| c.target == script_target).collect();
        assert_eq!(script_mounts.len(), 1);
        assert_eq!(script_mounts[0].flags, MsFlags::MS_BIND);
        assert!(script_target.is_file());
        Ok(())
    }

    #[test]
    fn test_failed_closure_query_is_fatal() {
        let mut f = Fixture::new("assemble-bad-query");
        f.sandbox.path_vars = vec!["BUILD_PATH".into()];
        f.env.insert("BUILD_PATH".into(), "/not/a/store/path".into());
        let mut query = FakeQuery::default();

        let err = f.assemble(Some(&mut query)).unwrap_err();
        assert!(
            err.to_string()
                .contains("Unable to get requisites for /not/a/store/path")
        );
    }

    #[test]
    fn test_missing_query_is_an_error() {
        let mut f = Fixture::new("assemble-no-query");
        assert!(f.assemble(None).is_err());
    }

    #[test]
    fn test_static_etc_closure() -> Result<()> {
        let mut f = Fixture::new("static-etc");
        let etc = f.base.join("store/ddd-etc");
        std::fs::create_dir_all(&etc)?;
        let link = f.base.join("static");
        symlink(&etc, &link)?;
        f.sandbox.static_etc = link;

        let mut query = FakeQuery::default();
        query.closures.insert(etc.clone(), vec![etc.clone()]);
        let mut builder =
            MountBuilder::new(&f.sandbox.root_dir, RecordingMounter::default());
        f.sandbox.mount_static_etc(&mut builder, &mut query)?;
        assert_eq!(query.queried, vec![etc.clone()]);
        assert_eq!(builder.mounter().calls[0].source, Some(etc));

        // no link, nothing queried
        f.sandbox.static_etc = f.base.join("none");
        let mut query = FakeQuery::default();
        f.sandbox.mount_static_etc(&mut builder, &mut query)?;
        assert!(query.queried.is_empty());
        Ok(())
    }

    #[test]
    fn test_extra_mounts() -> Result<()> {
        let mut f = Fixture::new("assemble-extra");
        f.sandbox.full_store = true;
        f.sandbox.store_dir = f.base.join("store");
        let cache = f.base.join("home/.cache/ccache");
        f.sandbox.mounts = vec![
            ExtraMount::optional("$HOME/.missing"),
            ExtraMount::required("${XDG_CACHE_HOME}/ccache"),
        ];
        f.assemble(None)?;

        assert!(cache.is_dir());
        let calls = f.calls();
        let cache_mounts: Vec<&MountCall> = calls
            .iter()
            .filter(|c| c.target == f.in_root(&cache))
            .collect();
        assert_eq!(cache_mounts.len(), 2);
        assert!(!cache_mounts[1].flags.contains(MsFlags::MS_RDONLY));
        assert!(cache_mounts[1].flags.contains(MsFlags::MS_NOSUID));
        assert!(!f.in_root(&f.base.join("home/.missing")).exists());
        Ok(())
    }

    #[test]
    fn test_undefined_variable_in_mount_fails() {
        let mut f = Fixture::new("assemble-undefined");
        f.sandbox.full_store = true;
        f.sandbox.store_dir = f.base.join("store");
        f.sandbox.mounts = vec![ExtraMount::optional("$NOT_DEFINED_ANYWHERE/x")];
        let err = f.assemble(None).unwrap_err();
        assert!(err.to_string().contains("NOT_DEFINED_ANYWHERE"));
    }

    #[test]
    fn test_xauthority() -> Result<()> {
        let mut f = Fixture::new("assemble-xauth");
        f.sandbox.full_store = true;
        f.sandbox.store_dir = f.base.join("store");
        let xauth = f.base.join("home/.Xauthority");
        std::fs::write(&xauth, "cookie")?;
        f.assemble(None)?;

        let target = f.in_root(&xauth);
        assert!(f.calls().iter().any(|c| c.target == target));
        assert!(target.is_file());
        Ok(())
    }

    #[test]
    fn test_relative_xauthority_is_skipped() -> Result<()> {
        let mut f = Fixture::new("assemble-xauth-relative");
        f.sandbox.full_store = true;
        f.sandbox.store_dir = f.base.join("store");
        // readable from the test's working directory
        f.env.insert("XAUTHORITY".into(), "Cargo.toml".into());
        f.assemble(None)?;

        assert!(
            f.calls()
                .iter()
                .all(|c| !c.target.ends_with("Cargo.toml"))
        );
        Ok(())
    }

    #[test]
    fn test_xauthority_needs_home() {
        let mut f = Fixture::new("assemble-no-home");
        f.sandbox.full_store = true;
        f.sandbox.store_dir = f.base.join("store");
        f.env.remove("HOME");
        let err = f.assemble(None).unwrap_err();
        assert!(err.to_string().contains("$HOME"));
    }

    #[test]
    fn test_debug_injection() -> Result<()> {
        let mut f = Fixture::new("assemble-inject");
        f.sandbox.full_store = true;
        f.sandbox.store_dir = f.base.join("store");
        let host = f.base.join("debug");
        std::fs::create_dir_all(&host)?;
        f.env.insert(
            DEBUG_INJECT_VAR.into(),
            format!("{}=/debug/src:bogus", host.display()),
        );
        f.assemble(None)?;

        let calls = f.calls();
        let last = calls.last().unwrap();
        assert_eq!(last.source, Some(host));
        assert_eq!(last.target, f.in_root(Path::new("/debug/src")));
        assert_eq!(last.flags, MsFlags::MS_BIND);
        assert!(last.target.is_dir());
        Ok(())
    }

    #[test]
    fn test_debug_injection_stays_in_root() -> Result<()> {
        let mut f = Fixture::new("assemble-inject-climb");
        f.sandbox.full_store = true;
        f.sandbox.store_dir = f.base.join("store");
        let host = f.base.join("debug");
        std::fs::create_dir_all(&host)?;
        f.env.insert(
            DEBUG_INJECT_VAR.into(),
            format!("{}=/../../../dbg", host.display()),
        );
        f.assemble(None)?;

        let calls = f.calls();
        let last = calls.last().unwrap();
        assert_eq!(last.target, f.sandbox.root_dir.join("dbg"));
        assert!(last.target.is_dir());
        Ok(())
    }

    #[test]
    fn test_binsh_symlink() -> Result<()> {
        let mut f = Fixture::new("assemble-binsh");
        f.sandbox.full_store = true;
        f.sandbox.store_dir = f.base.join("store");
        f.sandbox.binsh = Some(PathBuf::from("/nix/store/eee-bash/bin/bash"));
        f.assemble(None)?;

        let sh = f.sandbox.root_dir.join("bin/sh");
        assert_eq!(
            std::fs::read_link(&sh)?,
            PathBuf::from("/nix/store/eee-bash/bin/bash")
        );
        Ok(())
    }
}
