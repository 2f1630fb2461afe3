//! Command-line argument parsing with clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use keel_tunnel::manager::DEFAULT_TUNNEL_NAME;

/// keelctl - bring a keel `WireGuard` tunnel up and down.
#[derive(Parser, Debug, Clone)]
#[command(name = "keelctl")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Tunnel interface name.
    #[arg(long, global = true, env = "KEEL_TUNNEL", default_value = DEFAULT_TUNNEL_NAME)]
    pub tunnel: String,

    /// Directory for rendered configuration files.
    #[arg(long, global = true, env = "KEEL_RUNTIME_DIR", default_value = "/run/keel")]
    pub runtime_dir: PathBuf,

    /// Use an in-memory backend instead of wg-quick.
    #[arg(long, global = true)]
    pub simulate: bool,

    /// Refuse commands that arrive while a transition is running.
    #[arg(long, global = true)]
    pub reject_busy: bool,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Bring the tunnel up.
    Up {
        /// wg-quick configuration file.
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Bring the tunnel down.
    Down,

    /// Show the tunnel state.
    Status {
        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },

    /// Validate a configuration file and print a summary without secrets.
    Check {
        /// wg-quick configuration file.
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Generate a new key pair.
    Keygen,

    /// Interactive session: read `up`, `down`, `toggle`, `status` and `quit`
    /// from stdin while printing every state change.
    Session {
        /// wg-quick configuration file.
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_help_does_not_panic() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parse_defaults() {
        let cli = Cli::try_parse_from(["keelctl", "down"]).expect("parses");
        assert_eq!(cli.command, Commands::Down);
        assert_eq!(cli.tunnel, "keel0");
        assert_eq!(cli.runtime_dir, PathBuf::from("/run/keel"));
        assert!(!cli.simulate);
        assert!(!cli.reject_busy);
    }

    #[test]
    fn parse_up_with_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "keelctl", "up", "--config", "/etc/keel/home.conf", "--tunnel", "wg1", "--simulate",
        ])
        .expect("parses");
        assert_eq!(
            cli.command,
            Commands::Up {
                config: PathBuf::from("/etc/keel/home.conf")
            }
        );
        assert_eq!(cli.tunnel, "wg1");
        assert!(cli.simulate);
    }

    #[test]
    fn parse_status_json() {
        let cli = Cli::try_parse_from(["keelctl", "status", "--json"]).expect("parses");
        assert_eq!(cli.command, Commands::Status { json: true });
    }

    #[test]
    fn up_requires_config() {
        assert!(Cli::try_parse_from(["keelctl", "up"]).is_err());
    }
}
