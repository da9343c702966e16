use super::cli::Args;
use super::{Config, ExtraMount, PartialConfig};
use anyhow::{Context, Result, anyhow};
use log::trace;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::{env, str::FromStr};

pub const DEFAULT_ROOT_DIR: &str = "/var/empty";
pub const DEFAULT_STORE_DIR: &str = "/nix/store";
pub const DEFAULT_NIX_STORE_BIN: &str = "nix-store";

pub fn resolve_config(cli: Args) -> Result<Config> {
    let (mut partial_config, mut sources) =
        load_partial(cli.no_config, cli.config.as_deref())?;

    apply_environment(&mut partial_config, &mut sources, &|name| {
        env::var(name).ok()
    })?;

    // Override with CLI args if provided (highest precedence)
    if let Some(log_level) = cli.log_level {
        partial_config.log_level = Some(log_level);
        sources.insert("log_level".into(), "cli".into());
    }
    if let Some(root_dir) = cli.root_dir {
        partial_config.root_dir = Some(root_dir);
        sources.insert("root_dir".into(), "cli".into());
    }
    if let Some(store_dir) = cli.store_dir {
        partial_config.store_dir = Some(store_dir);
        sources.insert("store_dir".into(), "cli".into());
    }
    if cli.pid_namespace {
        partial_config.pid_namespace = Some(true);
        sources.insert("pid_namespace".into(), "cli".into());
    }
    if cli.full_store {
        partial_config.full_store = Some(true);
        sources.insert("full_store".into(), "cli".into());
    }
    if let Some(binsh) = cli.binsh {
        partial_config.binsh = Some(binsh);
        sources.insert("binsh".into(), "cli".into());
    }
    if let Some(nix_store_bin) = cli.nix_store_bin {
        partial_config.nix_store_bin = Some(nix_store_bin);
        sources.insert("nix_store_bin".into(), "cli".into());
    }
    if let Some(path_vars) = cli.path_vars {
        extend(&mut partial_config.path_vars, path_vars);
        sources.insert("path_vars".into(), "cli".into());
    }
    if let Some(mounts) = cli.mounts {
        let (required, optional): (Vec<_>, Vec<_>) =
            mounts.into_iter().partition(|m| m.required);
        extend(
            &mut partial_config.mounts,
            optional.into_iter().map(|m| m.path).collect(),
        );
        extend(
            &mut partial_config.required_mounts,
            required.into_iter().map(|m| m.path).collect(),
        );
        sources.insert("mounts".into(), "cli".into());
    }

    let config = finalize(partial_config, sources)?;

    trace!("Root dir: {}", config.root_dir.display());
    trace!("Store dir: {}", config.store_dir.display());

    Ok(config)
}

/* Environment variables sit between config files and the command line */
fn apply_environment(
    partial_config: &mut PartialConfig,
    sources: &mut HashMap<String, String>,
    lookup: &dyn Fn(&str) -> Option<String>,
) -> Result<()> {
    let var = |name: &str| lookup(name).filter(|value| !value.is_empty());

    if let Some(log_level) = var("BUILD_SANDBOX_LOG_LEVEL") {
        let log_level = log::LevelFilter::from_str(&log_level)
            .map_err(|_| anyhow!("Invalid log level: {}", log_level))?;
        partial_config.log_level = Some(log_level);
        sources.insert("log_level".into(), "environment".into());
    }
    if let Some(root_dir) = var("BUILD_SANDBOX_ROOT_DIR") {
        partial_config.root_dir = Some(root_dir);
        sources.insert("root_dir".into(), "environment".into());
    }
    if let Some(store_dir) = var("BUILD_SANDBOX_STORE_DIR") {
        partial_config.store_dir = Some(store_dir);
        sources.insert("store_dir".into(), "environment".into());
    }
    for (name, key, field) in [
        (
            "BUILD_SANDBOX_PID_NAMESPACE",
            "pid_namespace",
            &mut partial_config.pid_namespace,
        ),
        (
            "BUILD_SANDBOX_FULL_STORE",
            "full_store",
            &mut partial_config.full_store,
        ),
    ] {
        if let Some(value) = var(name) {
            let value = bool::from_str(&value)
                .map_err(|_| anyhow!("Invalid value for {}: {}", name, value))?;
            *field = Some(value);
            sources.insert(key.into(), "environment".into());
        }
    }
    if let Some(binsh) = var("BUILD_SANDBOX_BINSH") {
        partial_config.binsh = Some(binsh);
        sources.insert("binsh".into(), "environment".into());
    }
    if let Some(path_vars) = var("BUILD_SANDBOX_PATH_VARS") {
        extend(&mut partial_config.path_vars, split_list(&path_vars));
        sources.insert("path_vars".into(), "environment".into());
    }
    if let Some(mounts) = var("BUILD_SANDBOX_MOUNTS") {
        for mount in split_list(&mounts) {
            let mount = ExtraMount::from_str(&mount).map_err(|e| anyhow!(e))?;
            let list = if mount.required {
                &mut partial_config.required_mounts
            } else {
                &mut partial_config.mounts
            };
            extend(list, vec![mount.path]);
        }
        sources.insert("mounts".into(), "environment".into());
    }

    Ok(())
}

fn finalize(
    partial_config: PartialConfig,
    mut sources: HashMap<String, String>,
) -> Result<Config> {
    let mut with_default = |key: &str| {
        sources.entry(key.into()).or_insert_with(|| "default".into());
    };
    for key in [
        "log_level",
        "root_dir",
        "store_dir",
        "pid_namespace",
        "full_store",
        "nix_store_bin",
    ] {
        with_default(key);
    }

    let mounts = partial_config
        .mounts
        .unwrap_or_default()
        .iter()
        .map(|path| ExtraMount::optional(path))
        .chain(
            partial_config
                .required_mounts
                .unwrap_or_default()
                .iter()
                .map(|path| ExtraMount::required(path)),
        )
        .collect();

    let config = Config {
        log_level: partial_config.log_level.unwrap_or(log::LevelFilter::Info),
        root_dir: PathBuf::from(
            partial_config
                .root_dir
                .unwrap_or_else(|| DEFAULT_ROOT_DIR.to_string()),
        ),
        store_dir: PathBuf::from(
            partial_config
                .store_dir
                .unwrap_or_else(|| DEFAULT_STORE_DIR.to_string()),
        ),
        pid_namespace: partial_config.pid_namespace.unwrap_or(false),
        full_store: partial_config.full_store.unwrap_or(false),
        binsh: partial_config.binsh.map(PathBuf::from),
        nix_store_bin: partial_config
            .nix_store_bin
            .unwrap_or_else(|| DEFAULT_NIX_STORE_BIN.to_string()),
        path_vars: partial_config.path_vars.unwrap_or_default(),
        mounts,
        sources,
    };

    validate_config(&config)?;
    Ok(config)
}

pub fn load_partial(
    no_config: bool,
    extra_config: Option<&Path>,
) -> Result<(PartialConfig, HashMap<String, String>)> {
    let mut config_paths = if no_config {
        vec![]
    } else {
        find_config_files()
    };
    if let Some(extra_config) = extra_config {
        if !extra_config.exists() {
            return Err(anyhow!(
                "Config file {} does not exist",
                extra_config.display()
            ));
        }
        config_paths.push(extra_config.to_path_buf());
    }

    let mut sources = HashMap::new();
    if config_paths.is_empty() {
        trace!("No config files found, using default config");
        return Ok((PartialConfig::default(), sources));
    }

    let mut merged_config = PartialConfig::default();
    for path in config_paths.iter() {
        let config_str = std::fs::read_to_string(path).context(format!(
            "Failed to read config file {}",
            path.display()
        ))?;

        let config: PartialConfig = toml::from_str(&config_str).context(
            format!("Failed to parse config file {}", path.display()),
        )?;

        merge_configs(
            &mut merged_config,
            &mut sources,
            config,
            path.to_str()
                .context("Failed to convert config path to str")?,
        );
        trace!("Loaded config file: {}", path.display());
    }

    Ok((merged_config, sources))
}

/** Returns the existing config files, lowest precedence first */
fn find_config_files() -> Vec<PathBuf> {
    let mut paths_to_check = vec![PathBuf::from("/etc/build-sandbox.toml")];

    let config_home = env::var("XDG_CONFIG_HOME")
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .or_else(|| env::var("HOME").ok().map(|h| Path::new(&h).join(".config")));
    if let Some(config_home) = config_home {
        paths_to_check.push(config_home.join("build-sandbox/config.toml"));
    }

    paths_to_check
        .into_iter()
        .filter(|path| path.is_file())
        .collect()
}

fn merge_configs(
    base: &mut PartialConfig,
    sources: &mut HashMap<String, String>,
    override_config: PartialConfig,
    source: &str,
) {
    if let Some(log_level) = override_config.log_level {
        base.log_level = Some(log_level);
        sources.insert("log_level".into(), source.into());
    }
    if let Some(root_dir) = override_config.root_dir {
        base.root_dir = Some(root_dir);
        sources.insert("root_dir".into(), source.into());
    }
    if let Some(store_dir) = override_config.store_dir {
        base.store_dir = Some(store_dir);
        sources.insert("store_dir".into(), source.into());
    }
    if let Some(pid_namespace) = override_config.pid_namespace {
        base.pid_namespace = Some(pid_namespace);
        sources.insert("pid_namespace".into(), source.into());
    }
    if let Some(full_store) = override_config.full_store {
        base.full_store = Some(full_store);
        sources.insert("full_store".into(), source.into());
    }
    if let Some(binsh) = override_config.binsh {
        base.binsh = Some(binsh);
        sources.insert("binsh".into(), source.into());
    }
    if let Some(nix_store_bin) = override_config.nix_store_bin {
        base.nix_store_bin = Some(nix_store_bin);
        sources.insert("nix_store_bin".into(), source.into());
    }
    // Lists are additive
    if let Some(path_vars) = override_config.path_vars {
        extend(&mut base.path_vars, path_vars);
        sources.insert("path_vars".into(), source.into());
    }
    if let Some(mounts) = override_config.mounts {
        extend(&mut base.mounts, mounts);
        sources.insert("mounts".into(), source.into());
    }
    if let Some(required_mounts) = override_config.required_mounts {
        extend(&mut base.required_mounts, required_mounts);
        sources.insert("mounts".into(), source.into());
    }
}

fn validate_config(config: &Config) -> Result<()> {
    if !config.root_dir.is_absolute() || config.root_dir == Path::new("/") {
        return Err(anyhow!(
            "Invalid root directory: {}",
            config.root_dir.display()
        ));
    }
    if !config.store_dir.is_absolute() {
        return Err(anyhow!(
            "Store directory is not absolute: {}",
            config.store_dir.display()
        ));
    }
    if let Some(binsh) = &config.binsh {
        if !binsh.is_absolute() {
            return Err(anyhow!(
                "/bin/sh target is not absolute: {}",
                binsh.display()
            ));
        }
    }
    Ok(())
}

fn extend(list: &mut Option<Vec<String>>, values: Vec<String>) {
    match list {
        Some(existing) => existing.extend(values),
        None => *list = Some(values),
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
