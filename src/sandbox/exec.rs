use crate::sandbox::Sandbox;
use anyhow::{Context, Result, anyhow};
use log::trace;
use nix::unistd::execvpe;
use std::ffi::{CStr, CString};
use std::os::unix::ffi::OsStrExt;

impl Sandbox {
    /**
     * Replace the current process, which is expected to be inside the
     * assembled root, with `command`. This function never returns on
     * success.
     */
    pub fn exec(&self, command: &[String]) -> Result<()> {
        if command.is_empty() {
            return Err(anyhow!("Command must not be empty"));
        }

        let args_cstr: Vec<CString> = command
            .iter()
            .map(|s| CString::new(s.as_str()))
            .collect::<Result<_, _>>()
            .context("Command contains a NUL byte")?;
        let environment = std::env::vars_os()
            .map(|(key, value)| {
                let mut entry = key.as_bytes().to_vec();
                entry.push(b'=');
                entry.extend_from_slice(value.as_bytes());
                CString::new(entry).context(
                    "Failed to create CString for environment variable",
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let args_ptr: Vec<&CStr> = args_cstr.iter().map(|s| s.as_ref()).collect();
        let env_ptr: Vec<&CStr> =
            environment.iter().map(|s| s.as_ref()).collect();

        trace!("Executing {}", command.join(" "));

        // execvpe. This will never return on success
        let Err(e) = execvpe(&args_cstr[0], &args_ptr, &env_ptr);
        Err(anyhow!(
            "Failed to execute command {}: {}",
            command.join(" "),
            e
        ))
    }
}
