//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// tokenward - signed bearer token authority
#[derive(Parser, Debug)]
#[command(name = "tokenward")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "TOKENWARD_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "TOKENWARD_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "TOKENWARD_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "TOKENWARD_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "TOKENWARD_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the issuing service (default)
    Serve,

    /// Signing key management
    #[command(subcommand)]
    Keys(KeysCommand),

    /// Issue a token pair with the configured keys
    Issue {
        /// User id (UUID)
        #[arg(long)]
        user: uuid::Uuid,

        /// User email
        #[arg(long)]
        email: String,

        /// Role to embed (repeatable)
        #[arg(long = "role")]
        roles: Vec<String>,
    },

    /// Verify a token against the configured remote issuer
    Verify {
        /// The bearer token
        #[arg(required = true)]
        token: String,
    },
}

/// Key subcommands. Both need `keys.store_dir`.
#[derive(Subcommand, Debug)]
pub enum KeysCommand {
    /// List all keys with their state
    List {
        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,
    },

    /// Generate a new active key and start the overlap window for the old one
    Rotate,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_subcommand_means_serve() {
        let cli = Cli::parse_from(["tokenward"]);

        assert!(cli.command.is_none());
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn issue_collects_repeated_roles() {
        let cli = Cli::parse_from([
            "tokenward",
            "issue",
            "--user",
            "6f1c1f0e-7a3b-4b8e-9d55-0d7f2a1b9c11",
            "--email",
            "ops@example.com",
            "--role",
            "admin",
            "--role",
            "editor",
        ]);

        match cli.command {
            Some(Command::Issue { roles, email, .. }) => {
                assert_eq!(roles, vec!["admin", "editor"]);
                assert_eq!(email, "ops@example.com");
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn global_flags_follow_subcommands() {
        let cli = Cli::parse_from(["tokenward", "keys", "list", "--log-format", "json"]);

        assert_eq!(cli.log_format.as_deref(), Some("json"));
        assert!(matches!(
            cli.command,
            Some(Command::Keys(KeysCommand::List { .. }))
        ));
    }
}
