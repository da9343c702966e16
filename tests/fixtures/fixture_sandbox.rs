use anyhow::Result;
use rand::Rng;
use rstest::*;
use std::path::{Path, PathBuf};
use std::process::Command;

const TEST_DATA_DIR: &str = "/tmp/build-sandbox-integration";

pub fn rid() -> String {
    let mut rng = rand::rng();
    let rid: String = (0..10)
        .map(|_| rng.sample(rand::distr::Alphanumeric) as char)
        .collect();
    rid
}

/// Runs the build-sandbox binary and keeps what it printed.
pub struct SandboxRunner {
    pub sandbox_bin: String,
    /// Scratch directory owned by this runner, removed on drop
    pub dir: PathBuf,
    pub last_stdout: String,
    pub last_stderr: String,
    pub last_code: Option<i32>,
    /// Skip loading the system and user config files
    pub no_config: bool,
    pub debug_mode: bool,
    env: Vec<(String, Option<String>)>,
}

impl SandboxRunner {
    pub fn new() -> Self {
        let dir = Path::new(TEST_DATA_DIR).join(rid());

        #[allow(clippy::panic)]
        if let Err(e) = std::fs::create_dir_all(&dir) {
            panic!("Failed to create {}: {}", dir.display(), e);
        }

        Self {
            sandbox_bin: env!("CARGO_BIN_EXE_build-sandbox").to_string(),
            dir,
            last_stdout: String::new(),
            last_stderr: String::new(),
            last_code: None,
            no_config: true,
            debug_mode: false,
            env: Vec::new(),
        }
    }

    /* When debug mode is on, the scratch directory is left behind */
    #[allow(dead_code)]
    pub fn set_debug_mode(&mut self, debug_mode: bool) {
        self.debug_mode = debug_mode;
    }

    /// Sets an environment variable for every following run.
    #[allow(dead_code)]
    pub fn set_env(&mut self, key: &str, value: &str) {
        self.env.push((key.to_string(), Some(value.to_string())));
    }

    #[allow(dead_code)]
    pub fn unset_env(&mut self, key: &str) {
        self.env.push((key.to_string(), None));
    }

    #[allow(dead_code)]
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn run(&mut self, args: &[&str]) -> Result<std::process::Output> {
        let mut cmd = Command::new(&self.sandbox_bin);
        cmd.env_remove("COMPLETE");
        for (key, value) in &self.env {
            match value {
                Some(value) => cmd.env(key, value),
                None => cmd.env_remove(key),
            };
        }
        if self.no_config {
            cmd.arg("--no-config");
        }
        cmd.args(args);
        println!(
            "Running command: {} {}",
            cmd.get_program().to_string_lossy(),
            cmd.get_args()
                .map(|c| c.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        );

        let output = cmd
            .output()
            .map_err(|e| anyhow::anyhow!("Command failed: {:?}", e))?;
        self.last_stdout = String::from_utf8_lossy(&output.stdout).to_string();
        self.last_stderr = String::from_utf8_lossy(&output.stderr).to_string();
        self.last_code = output.status.code();

        match self.last_code {
            Some(0) => Ok(output),
            Some(code) => Err(anyhow::anyhow!(
                "Command returned non-zero exit code: {}\nstdout: {}\nstderr: {}",
                code,
                self.last_stdout,
                self.last_stderr
            )),
            None => Err(anyhow::anyhow!(
                "Command did not return a valid exit code\nstdout: {}\nstderr: {}",
                self.last_stdout,
                self.last_stderr
            )),
        }
    }

    #[allow(dead_code)]
    pub fn pass(&mut self, args: &[&str]) -> bool {
        if self.run(args).is_ok() {
            return true;
        }
        println!("last_stderr: {}", self.last_stderr);
        println!("last_stdout: {}", self.last_stdout);
        false
    }

    #[allow(dead_code)]
    pub fn xfail(&mut self, args: &[&str]) -> bool {
        if self.run(args).is_err() {
            return true;
        }
        println!("last_stderr: {}", self.last_stderr);
        println!("last_stdout: {}", self.last_stdout);
        false
    }

    /**
     * True when the last run died while building the sandbox because the
     * host does not let unprivileged users create namespaces or mounts, as
     * is common in containers and hardened kernels.
     */
    #[allow(dead_code)]
    pub fn namespaces_refused(&self) -> bool {
        self.last_code == Some(1)
            && (self.last_stderr.contains("unshare")
                || self.last_stderr.contains("Operation not permitted")
                || self.last_stderr.contains("Permission denied")
                || self.last_stderr.contains("uid/gid maps"))
    }
}

impl Drop for SandboxRunner {
    fn drop(&mut self) {
        if self.debug_mode {
            println!("Debug mode is on, *NOT* cleaning up {}", self.dir.display());
            return;
        }
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

#[fixture]
pub fn sandbox() -> SandboxRunner {
    SandboxRunner::new()
}
