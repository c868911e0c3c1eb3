use clap::{ArgAction, Parser};
use std::ffi::OsString;
use std::path::PathBuf;

/// HLS ingestion and repackaging relay.
#[derive(Debug, Clone, Parser)]
#[command(name = "dubreamer", version, about)]
pub struct Args {
    /// Base name of the configuration file (searched as `<name>.toml`), or a path
    #[arg(long, default_value = "config")]
    pub config: String,

    /// Dump the resolved configuration and log at debug level
    #[arg(long, action = ArgAction::Set, num_args = 0..=1, default_value_t = false, default_missing_value = "true")]
    pub debug: bool,

    /// Folder for the log file; created if missing
    #[arg(long, default_value = "log")]
    pub log: PathBuf,

    /// Permit the built-in default credentials
    #[arg(long, action = ArgAction::Set, num_args = 0..=1, default_value_t = false, default_missing_value = "true")]
    pub allow_default_credentials: bool,
}

const LONG_FLAGS: &[&str] = &["config", "debug", "log", "allow-default-credentials", "help", "version"];

/// Rewrite single-dash long flags (`-config x`, `-debug=false`) to the
/// double-dash form clap expects. Short flags and positionals are untouched,
/// as is everything after `--`.
pub fn normalize_go_style_flags<I, T>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    let mut out = Vec::new();
    let mut passthrough = false;
    for (index, arg) in args.into_iter().enumerate() {
        let arg: OsString = arg.into();
        if index == 0 || passthrough {
            out.push(arg);
            continue;
        }
        let Some(text) = arg.to_str() else {
            out.push(arg);
            continue;
        };
        if text == "--" {
            passthrough = true;
            out.push(arg);
            continue;
        }
        if let Some(rest) = text.strip_prefix('-')
            && !rest.starts_with('-')
        {
            let name = rest.split_once('=').map_or(rest, |(name, _)| name);
            if LONG_FLAGS.contains(&name) {
                out.push(OsString::from(format!("-{text}")));
                continue;
            }
        }
        out.push(arg);
    }
    out
}

impl Args {
    pub fn parse_normalized<I, T>(args: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString>,
    {
        Self::parse_from(normalize_go_style_flags(args))
    }
}
