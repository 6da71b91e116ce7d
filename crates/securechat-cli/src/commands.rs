//! Command handlers for the SecureChat CLI

use std::path::{Path, PathBuf};
use std::sync::Arc;

use securechat_core::{
    CertificateAuthority, ChatClient, ClientConfig, KeyStore, ServerConfig, StoreCredentials,
    TrustedRoot,
};
use securechat_server::ServerBuilder;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::cli::{Cli, Commands};
use crate::error::{CliError, Result};
use crate::input::{parse_line, Input};

/// File names written by `gen-certs`
pub const ROOT_FILE: &str = "root.toml";
pub const AUTHORITY_FILE: &str = "ca.toml";

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command
    pub async fn execute(cli: Cli) -> Result<()> {
        match cli.command {
            Commands::GenCerts {
                out,
                root_name,
                server,
                clients,
            } => Self::handle_gen_certs(&out, &root_name, &server, &clients).map(|_| ()),
            Commands::Serve {
                bind,
                pool_size,
                keystore,
                trusted_root,
            } => {
                let mut config = match &cli.config {
                    Some(path) => ServerConfig::load_from_file(path)?,
                    None => ServerConfig::default(),
                };
                if let Some(bind) = bind {
                    config.bind_address = bind;
                }
                if let Some(pool_size) = pool_size {
                    config.pool_size = pool_size;
                }
                if let Some(keystore) = keystore {
                    config.keystore = keystore;
                }
                if let Some(trusted_root) = trusted_root {
                    config.trusted_root = trusted_root;
                }
                config.validate()?;
                Self::handle_serve(config).await
            }
            Commands::Connect {
                username,
                server,
                keystore,
                trusted_root,
            } => {
                let mut config = match &cli.config {
                    Some(path) => ClientConfig::load_from_file(path)?,
                    None => ClientConfig::default(),
                };
                if let Some(username) = username {
                    config.username = username;
                }
                if let Some(server) = server {
                    config.server_address = server;
                }
                if let Some(keystore) = keystore {
                    config.keystore = keystore;
                }
                if let Some(trusted_root) = trusted_root {
                    config.trusted_root = trusted_root;
                }
                config.validate()?;
                Self::handle_connect(config).await
            }
        }
    }

    /// Create the authority, its root file and one key store per subject.
    ///
    /// Returns the paths written.
    pub fn handle_gen_certs(
        out: &Path,
        root_name: &str,
        server: &str,
        clients: &[String],
    ) -> Result<Vec<PathBuf>> {
        std::fs::create_dir_all(out)?;
        let authority = CertificateAuthority::generate(root_name)?;

        let mut written = vec![out.join(AUTHORITY_FILE), out.join(ROOT_FILE)];
        authority.save_to_file(&written[0])?;
        authority.root().save_to_file(&written[1])?;

        let subjects = std::iter::once(server).chain(clients.iter().map(String::as_str));
        for subject in subjects {
            let subject = subject.trim();
            if subject.is_empty() {
                continue;
            }
            if subject.contains(['/', '\\']) {
                return Err(CliError::Input(format!("invalid subject name: {}", subject)));
            }
            let path = out.join(format!("{}.toml", subject));
            KeyStore::generate(subject, &authority)?.save_to_file(&path)?;
            written.push(path);
        }

        for path in &written {
            info!("Wrote {}", path.display());
        }
        Ok(written)
    }

    /// Run a server until interrupted
    async fn handle_serve(config: ServerConfig) -> Result<()> {
        let store = KeyStore::load_from_file(&config.keystore)?;
        let root = TrustedRoot::load_from_file(&config.trusted_root)?;
        info!(
            subject = store.certificate().subject(),
            root = %root.name,
            "Loaded server credentials"
        );

        let mut server = ServerBuilder::new(Arc::new(StoreCredentials::new(store)), root)
            .with_config(&config)
            .build_and_start()
            .await?;
        info!("SecureChat server listening on {}", server.local_addr());

        tokio::signal::ctrl_c().await?;
        info!("Interrupted; shutting down");
        let stats = server.engine().stats();
        server.shutdown().await?;
        info!(?stats, "Server stopped");
        Ok(())
    }

    /// Connect and relay between the terminal and the server
    async fn handle_connect(config: ClientConfig) -> Result<()> {
        let store = KeyStore::load_from_file(&config.keystore)?;
        let root = TrustedRoot::load_from_file(&config.trusted_root)?;

        let client = ChatClient::connect(
            config.server_address.as_str(),
            Arc::new(StoreCredentials::new(store)),
            &root,
            &config.username,
        )
        .await?;
        println!(
            "Connected to {} as {} (port {}). Commands: /who, /pm <target> <text>, /logout",
            client.server_subject(),
            config.username,
            client.local_addr().port()
        );

        let (mut sender, mut receiver) = client.into_split();
        let mut deliveries = tokio::spawn(async move {
            loop {
                match receiver.receive().await {
                    Ok(line) => println!("{}", line),
                    Err(e) if e.is_transport() => {
                        println!("Server closed the connection");
                        break;
                    }
                    Err(e) => warn!(error = %e, "Could not read delivery"),
                }
            }
        });

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = tokio::select! {
                _ = &mut deliveries => return Ok(()),
                line = lines.next_line() => line?,
            };
            let Some(line) = line else {
                sender.logout().await?;
                break;
            };

            match parse_line(&line) {
                Ok(Input::Empty) => {}
                Ok(Input::Chat(text)) => sender.send_chat(&text).await?,
                Ok(Input::Private { target, text }) => sender.send_private(target, &text).await?,
                Ok(Input::WhoIsIn) => sender.who_is_in().await?,
                Ok(Input::Logout) => {
                    sender.logout().await?;
                    break;
                }
                Err(e) => println!("{}", e),
            }
        }

        deliveries.abort();
        Ok(())
    }
}
