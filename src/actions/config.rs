use crate::config::Config;
use crate::util::Output;
use anyhow::{Result, anyhow};
use log::debug;
use serde_json::Value;

const ALL_KEYS: [&str; 9] = [
    "log_level",
    "root_dir",
    "store_dir",
    "pid_namespace",
    "full_store",
    "binsh",
    "nix_store_bin",
    "path_vars",
    "mounts",
];

fn lookup(config: &Config, key: &str) -> Result<(&'static str, Value)> {
    let display = |p: &std::path::Path| Value::String(p.display().to_string());
    let value = match key {
        "log_level" | "log-level" => {
            ("log_level", Value::String(config.log_level.as_str().to_lowercase()))
        }
        "root_dir" | "root-dir" => ("root_dir", display(&config.root_dir)),
        "store_dir" | "store-dir" => ("store_dir", display(&config.store_dir)),
        "pid_namespace" | "pid-namespace" => {
            ("pid_namespace", Value::Bool(config.pid_namespace))
        }
        "full_store" | "full-store" => {
            ("full_store", Value::Bool(config.full_store))
        }
        "binsh" => (
            "binsh",
            config
                .binsh
                .as_deref()
                .map(display)
                .unwrap_or(Value::Null),
        ),
        "nix_store_bin" | "nix-store-bin" => {
            ("nix_store_bin", Value::String(config.nix_store_bin.clone()))
        }
        "path_vars" | "path-vars" => (
            "path_vars",
            Value::Array(
                config.path_vars.iter().cloned().map(Value::String).collect(),
            ),
        ),
        "mounts" => (
            "mounts",
            Value::Array(
                config
                    .mounts
                    .iter()
                    .map(|m| Value::String(m.to_string()))
                    .collect(),
            ),
        ),
        _ => return Err(anyhow!("Unknown key: {}", key)),
    };
    Ok(value)
}

/// Prints the resolved value of each key, or of every key when none are given.
pub fn config(
    config: &Config,
    keys: Option<Vec<String>>,
    output: &mut Output,
) -> Result<()> {
    let keys = keys
        .filter(|keys| !keys.is_empty())
        .unwrap_or_else(|| ALL_KEYS.map(String::from).to_vec());
    let multi_line = keys.len() > 1;

    // validate everything before printing anything
    let values = keys
        .iter()
        .map(|key| lookup(config, key))
        .collect::<Result<Vec<_>>>()?;

    for (key, value) in values {
        if let Some(source) = config.sources.get(key) {
            debug!("{} set from {}", key, source);
        }
        output.value(key, value, multi_line);
    }

    Ok(())
}
