use anyhow::{Context, Result, anyhow};
use log::trace;
use std::collections::VecDeque;
use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/**
 * Source of dependency closures. `query_requisites` replaces the pending
 * results with every store path `path` transitively depends on (including
 * itself), which are then drained with `next_result`.
 */
pub trait ClosureQuery {
    fn query_requisites(&mut self, path: &Path) -> Result<()>;
    fn next_result(&mut self) -> Option<PathBuf>;
}

/// Answers closure queries with `nix-store --query --requisites`.
pub struct NixStoreQuery {
    program: String,
    results: VecDeque<PathBuf>,
}

impl NixStoreQuery {
    pub fn new(program: &str) -> Self {
        NixStoreQuery {
            program: program.to_string(),
            results: VecDeque::new(),
        }
    }
}

impl ClosureQuery for NixStoreQuery {
    fn query_requisites(&mut self, path: &Path) -> Result<()> {
        self.results.clear();

        trace!(
            "Running {} --query --requisites {}",
            self.program,
            path.display()
        );
        let output = Command::new(&self.program)
            .arg("--query")
            .arg("--requisites")
            .arg(path)
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .output()
            .context(format!("failed to run {}", self.program))?;

        if !output.status.success() {
            return Err(anyhow!(
                "{} --query --requisites {} failed: {}",
                self.program,
                path.display(),
                output.status
            ));
        }

        self.results = parse_requisites(&output.stdout);
        Ok(())
    }

    fn next_result(&mut self) -> Option<PathBuf> {
        self.results.pop_front()
    }
}

fn parse_requisites(stdout: &[u8]) -> VecDeque<PathBuf> {
    stdout
        .split(|b| *b == b'\n')
        .map(|line| line.trim_ascii())
        .filter(|line| !line.is_empty())
        .map(|line| PathBuf::from(OsStr::from_bytes(line)))
        .collect()
}
