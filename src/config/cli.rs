use super::ExtraMount;
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Parser, Clone, Debug)]
#[command(version, about, long_about = None,
    override_usage = "\n    build-sandbox [OPTIONS] config [KEYS...]\n    build-sandbox [OPTIONS] [--] <COMMAND ...>")]
pub struct Args {
    /**********************/
    /* Flags and settings */
    /**********************/
    /// Set the log level to one of trace, debug, info, warn, or error.
    /// `-v` is shorthand for enabling verbose (trace) logging.
    #[arg(short = 'v',
        long,
        global = true,
        default_missing_value = "trace",
        num_args = 0..=1,
        require_equals = true,
        value_parser = parse_log_level
    )]
    pub log_level: Option<log::LevelFilter>,

    /// Additional config file, loaded after the system and user config files
    #[arg(long, global = true, value_hint = clap::ValueHint::FilePath)]
    pub config: Option<PathBuf>,

    /// Do not load config files.
    #[arg(long, global = true, action = clap::ArgAction::SetTrue)]
    pub no_config: bool,

    /// Directory the new root is assembled in. Defaults to `/var/empty`
    #[arg(long, global = true, value_hint = clap::ValueHint::DirPath)]
    pub root_dir: Option<String>,

    /// Store directory holding the build's dependencies. Defaults to `/nix/store`
    #[arg(long, global = true, value_hint = clap::ValueHint::DirPath)]
    pub store_dir: Option<String>,

    /// Run the build in its own PID namespace with a fresh /proc
    #[arg(long, global = true, action = clap::ArgAction::SetTrue)]
    pub pid_namespace: bool,

    /// Expose the whole store instead of only the dependency closure
    #[arg(long, global = true, action = clap::ArgAction::SetTrue)]
    pub full_store: bool,

    /// Create /bin/sh inside the sandbox as a symlink to this executable
    #[arg(long, global = true, value_hint = clap::ValueHint::ExecutablePath)]
    pub binsh: Option<String>,

    /// Program used to query a store path's dependency closure
    #[arg(long, global = true)]
    pub nix_store_bin: Option<String>,

    /// Name of a colon separated path list variable whose entries'
    /// dependency closures get mounted. Can be specified multiple times.
    #[arg(long = "path-var", global = true, action = clap::ArgAction::Append)]
    pub path_vars: Option<Vec<String>>,

    /// Bind mount a host path into the sandbox if it exists. `$VAR` and
    /// `${VAR}` references are expanded. A trailing `!` creates the host
    /// directory first. Can be specified multiple times or as a
    /// comma-separated list.
    #[arg(
        long = "mount",
        global = true,
        value_delimiter = ',',
        action = clap::ArgAction::Append
    )]
    pub mounts: Option<Vec<ExtraMount>>,

    /// Formats action output as a JSON blob. Does nothing for sandboxed commands.
    #[arg(long, global = true, action = clap::ArgAction::SetTrue)]
    pub json: bool,

    /***************/
    /* Subcommands */
    /***************/
    #[command(subcommand)]
    pub action: Option<Action>,

    /*********************/
    /* Sandboxed Command */
    /*********************/
    /// The command to run in the sandbox. Defaults to /bin/sh.
    #[arg(
        trailing_var_arg = true,
        allow_hyphen_values = true,
        num_args = 0..,
        value_parser = validate_command,
        help_heading = "Sandboxed Command",
    )]
    pub sandboxed_command: Option<Vec<String>>,
}

#[derive(clap::Subcommand, Clone, Debug)]
#[command(subcommand_help_heading = "Actions")]
pub enum Action {
    /// Print the resolved configuration
    Config {
        /// The keys to print
        #[arg(value_name = "KEYS", num_args = 0..)]
        keys: Option<Vec<String>>,
    },
}

static ARG_COUNT: AtomicUsize = AtomicUsize::new(0);

// An option clap doesn't know ends up here as the first word of the command,
// reject it instead of trying to execute it.
fn validate_command(s: &str) -> Result<String, String> {
    if ARG_COUNT.fetch_add(1, Ordering::Relaxed) == 0
        && s.starts_with('-')
        && s != "--"
    {
        Err(String::from("Unknown option"))
    } else {
        Ok(s.to_string())
    }
}

fn parse_log_level(s: &str) -> Result<log::LevelFilter, String> {
    s.parse::<log::LevelFilter>().map_err(|e| e.to_string())
}
