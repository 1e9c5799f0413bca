use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Watch directories for changes using the best native facility available.
#[derive(Parser, Debug)]
#[command(
    name = "dirmon",
    version,
    about,
    long_about = None,
    propagate_version = true,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List the backends compiled into this build, default first.
    Backends {
        /// Output results as JSON instead of human-readable text.
        #[arg(long)]
        json: bool,
    },

    /// Watch one or more paths and print changes until interrupted.
    Watch {
        /// Paths to watch. Single-mode backends only keep the last one.
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Backend to use instead of the platform default.
        #[arg(short, long)]
        backend: Option<String>,

        /// TOML file with monitor settings.
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Rescan interval for polling backends, in milliseconds.
        #[arg(long)]
        poll_interval_ms: Option<u64>,

        /// Print one JSON object per event.
        #[arg(long)]
        json: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_watch() {
        let cli = Cli::try_parse_from([
            "dirmon", "watch", "--backend", "dummy", "--json", "/a", "/b",
        ])
        .unwrap();
        match cli.command {
            Commands::Watch {
                paths,
                backend,
                json,
                config,
                poll_interval_ms,
            } => {
                assert_eq!(paths, vec![PathBuf::from("/a"), PathBuf::from("/b")]);
                assert_eq!(backend.as_deref(), Some("dummy"));
                assert!(json);
                assert_eq!(config, None);
                assert_eq!(poll_interval_ms, None);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_watch_requires_a_path() {
        assert!(Cli::try_parse_from(["dirmon", "watch"]).is_err());
    }
}
