use std::collections::HashSet;
use std::path::{Path, PathBuf};

/**
 * Remembers which paths have already been acted on while the new root is
 * being assembled, so shared prefixes are only created or mounted once.
 */
#[derive(Debug, Default)]
pub struct PathCache {
    paths: HashSet<PathBuf>,
}

impl PathCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true the first time `path` is seen, false afterwards.
    pub fn insert_if_absent(&mut self, path: &Path) -> bool {
        if self.contains(path) {
            return false;
        }
        self.paths.insert(path.to_path_buf())
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.paths.contains(path)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }
}
