use anyhow::Context;
use anyhow::{Result, anyhow};
use nix::mount::MsFlags;
use std::ffi::CStr;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

pub fn mount<S1, S2, S3, S4>(
    source: Option<S1>,
    target: S2,
    fstype: Option<S3>,
    flags: MsFlags,
    data: Option<S4>,
) -> Result<()>
where
    S1: AsRef<std::ffi::OsStr>,
    S2: AsRef<std::ffi::OsStr>,
    S3: AsRef<std::ffi::OsStr>,
    S4: AsRef<std::ffi::OsStr>,
{
    let source_cstr = match &source {
        Some(source) => CString::new(source.as_ref().as_bytes())?,
        None => CString::new("")?,
    };
    let target_cstr = CString::new(target.as_ref().as_bytes())?;
    let fstype_cstr = match &fstype {
        Some(fstype) => CString::new(fstype.as_ref().as_bytes())?,
        None => CString::new("")?,
    };
    let data_cstr = match &data {
        Some(data) => CString::new(data.as_ref().as_bytes())?,
        None => CString::new("")?,
    };

    let source = source.map(|_| source_cstr.as_c_str());
    let target = target_cstr.as_c_str();
    let fstype = fstype.map(|_| fstype_cstr.as_c_str());
    let data = data.map(|_| data_cstr.as_c_str());

    let result = nix::mount::mount::<CStr, CStr, CStr, CStr>(
        source, target, fstype, flags, data,
    );

    if let Err(e) = result {
        let err_context = format!(
            "failed to mount {} {} [type={}, flags={}, data={}]",
            source_cstr.to_string_lossy(),
            target_cstr.to_string_lossy(),
            fstype_cstr.to_string_lossy(),
            flags.bits(),
            data_cstr.to_string_lossy(),
        );

        // Inside a user namespace the kernel locks the flags a mount already
        // carried, and a remount that would clear one of them is refused.
        if e == nix::errno::Errno::EPERM && flags.contains(MsFlags::MS_REMOUNT)
        {
            return Err(anyhow!(
                "Remount refused. Mounts inherited from the parent user \
                namespace keep their nosuid/nodev/noexec/atime flags and \
                cannot have them cleared: {}",
                e
            ))
            .context(err_context);
        }

        return Err(e).context(err_context);
    }

    Ok(())
}

/**
 * The seam between the mount engine and mount(2). The sandbox always uses
 * `SystemMounter`; tests substitute a recorder so the engine can be exercised
 * without privileges.
 */
pub trait Mounter {
    fn mount(
        &mut self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<()>;
}

#[derive(Debug, Default)]
pub struct SystemMounter;

impl Mounter for SystemMounter {
    fn mount(
        &mut self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<()> {
        mount(source, target, fstype, flags, data)
    }
}
