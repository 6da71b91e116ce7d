//! Command-line interface definitions and parsing

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file path (server or client settings, per command)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create a certificate authority and key stores for a server and clients
    GenCerts {
        /// Output directory
        #[arg(short, long, default_value = "certs")]
        out: PathBuf,
        /// Name of the root authority
        #[arg(long, default_value = "SecureChat Root CA")]
        root_name: String,
        /// Subject of the server certificate
        #[arg(long, default_value = "server")]
        server: String,
        /// Comma-separated client subjects
        #[arg(long, value_delimiter = ',')]
        clients: Vec<String>,
    },
    /// Run a chat server
    Serve {
        /// Address to listen on
        #[arg(short, long)]
        bind: Option<String>,
        /// Number of connection handlers
        #[arg(short, long)]
        pool_size: Option<usize>,
        /// Server key store
        #[arg(long)]
        keystore: Option<PathBuf>,
        /// Trusted root file
        #[arg(long)]
        trusted_root: Option<PathBuf>,
    },
    /// Connect to a server and chat from the terminal
    Connect {
        /// Identifier to announce
        #[arg(short, long)]
        username: Option<String>,
        /// Server address
        #[arg(short, long)]
        server: Option<String>,
        /// Client key store
        #[arg(long)]
        keystore: Option<PathBuf>,
        /// Trusted root file
        #[arg(long)]
        trusted_root: Option<PathBuf>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gen_certs_splits_clients() {
        let cli = Cli::parse_from([
            "securechat",
            "gen-certs",
            "--out",
            "/tmp/certs",
            "--clients",
            "alice,bob",
        ]);
        match cli.command {
            Commands::GenCerts { clients, server, .. } => {
                assert_eq!(clients, vec!["alice".to_string(), "bob".to_string()]);
                assert_eq!(server, "server");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["securechat", "serve", "-p", "4", "-v"]);
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Serve { pool_size: Some(4), .. }));
    }
}
