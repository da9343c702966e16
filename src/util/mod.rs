mod expand_env;
mod mkdir;
mod mount;
mod mount_builder;
mod output;
mod path_cache;

pub use expand_env::*;
pub use mkdir::*;
pub use mount::*;
pub use mount_builder::*;
pub use output::*;
pub use path_cache::*;

#[cfg(test)]
pub(crate) use mount_builder::tests::{MountCall, RecordingMounter};

/// A fresh, not yet created, scratch path under /tmp for a test.
#[cfg(test)]
pub(crate) fn test_dir(name: &str) -> std::path::PathBuf {
    use rand::Rng;
    let rid: String = (0..10)
        .map(|_| rand::rng().sample(rand::distr::Alphanumeric) as char)
        .collect();
    std::path::PathBuf::from(format!(
        "/tmp/build-sandbox-tests-{}-{}",
        name, rid
    ))
}
