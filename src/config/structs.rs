use super::impls::deserialize_level_filter;
use serde::Deserialize;
use std::{collections::HashMap, path::PathBuf};

/// A user requested mount. `path` may contain `$VAR` references which are
/// expanded right before mounting.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExtraMount {
    pub path: String,
    /// Create the host directory first if it does not exist
    pub required: bool,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct PartialConfig {
    #[serde(deserialize_with = "deserialize_level_filter", default)]
    pub log_level: Option<log::LevelFilter>,
    pub root_dir: Option<String>,
    pub store_dir: Option<String>,
    pub pid_namespace: Option<bool>,
    pub full_store: Option<bool>,
    pub binsh: Option<String>,
    pub nix_store_bin: Option<String>,
    pub path_vars: Option<Vec<String>>,
    pub mounts: Option<Vec<String>>,
    pub required_mounts: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: log::LevelFilter,
    /// Where the new root is assembled; tmpfs is mounted here
    pub root_dir: PathBuf,
    pub store_dir: PathBuf,
    pub pid_namespace: bool,
    /// Bind the whole store instead of the dependency closure
    pub full_store: bool,
    /// Target of the /bin/sh symlink inside the sandbox
    pub binsh: Option<PathBuf>,
    pub nix_store_bin: String,
    /// Colon separated path list variables whose entries' closures are mounted
    pub path_vars: Vec<String>,
    pub mounts: Vec<ExtraMount>,
    pub sources: HashMap<String, String>,
}
