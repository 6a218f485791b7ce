//! tokenward - signed bearer token authority

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use tracing::{error, info};

use tokenward::{
    cli::{Cli, Command, KeysCommand},
    clock::{Clock, SystemClock},
    config::Config,
    keys::{KeyStore, PublishedKey},
    rbac::InMemoryRbacStore,
    remote::RemoteVerifier,
    server::{self, Server, auth::VerifyOutcome},
    setup_tracing,
    token::{InMemoryRevocationStore, TokenService, UserIdentity},
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = match cli.command {
        Some(Command::Keys(cmd)) => run_keys_command(cmd, &config).await,
        Some(Command::Issue { user, email, roles }) => {
            run_issue(&config, UserIdentity { id: user, email }, &roles).await
        }
        Some(Command::Verify { token }) => run_verify(&config, &token).await,
        Some(Command::Serve) | None => run_server(config).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Run the issuing service
async fn run_server(config: Config) -> anyhow::Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        algorithm = %config.keys.algorithm,
        "Starting tokenward"
    );

    let server = Server::new(config)
        .await
        .context("failed to initialize signing keys")?;
    server.run().await?;

    info!("tokenward shutdown complete");
    Ok(())
}

/// Run key management commands
async fn run_keys_command(cmd: KeysCommand, config: &Config) -> anyhow::Result<()> {
    if config.keys.store_dir.is_none() {
        bail!("keys.store_dir must be configured to manage keys");
    }

    match cmd {
        KeysCommand::List { format } => {
            let store = server::open_key_store(&config.keys).await?;
            let mut keys: Vec<_> = store.list().await?.into_iter().map(|s| s.key).collect();
            keys.sort_by(|a, b| b.created_at.cmp(&a.created_at));

            if format == "json" {
                let published: Vec<PublishedKey> = keys.iter().map(PublishedKey::from).collect();
                println!("{}", serde_json::to_string_pretty(&published)?);
                return Ok(());
            }

            if keys.is_empty() {
                println!("No keys in store");
                return Ok(());
            }
            println!("{:<18} {:<6} {:<9} {:<26} {:>8}", "KID", "ALG", "STATE", "CREATED", "ISSUED");
            for key in keys {
                println!(
                    "{:<18} {:<6} {:<9} {:<26} {:>8}",
                    key.kid,
                    key.algorithm.to_string(),
                    key.state.to_string(),
                    key.created_at.to_rfc3339(),
                    key.tokens_issued
                );
            }
            Ok(())
        }
        KeysCommand::Rotate => {
            let manager = server::bootstrap_keys(config, Arc::new(SystemClock)).await?;
            let previous = manager.active_key().kid;
            let key = manager.rotate().await?;
            println!("Rotated {previous} -> {}", key.kid);
            Ok(())
        }
    }
}

/// Issue a token pair from the command line
async fn run_issue(config: &Config, user: UserIdentity, roles: &[String]) -> anyhow::Result<()> {
    if config.keys.store_dir.is_none() {
        bail!("keys.store_dir must be configured: an in-memory key would sign tokens nobody can verify");
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let keys = server::bootstrap_keys(config, Arc::clone(&clock)).await?;
    let service = TokenService::new(
        keys,
        Arc::new(InMemoryRevocationStore::new()),
        Arc::new(InMemoryRbacStore::new()),
        clock,
        config.tokens.clone(),
    );

    let pair = service.issue_token_pair(&user, roles)?;
    println!("{}", serde_json::to_string_pretty(&pair)?);
    Ok(())
}

/// Verify a token against the remote issuer
async fn run_verify(config: &Config, token: &str) -> anyhow::Result<()> {
    let verifier = RemoteVerifier::from_config(&config.remote, Arc::new(SystemClock))?;

    match verifier.validate_token(token).await {
        Ok(VerifyOutcome::Verified(claims)) => {
            println!("{}", serde_json::to_string_pretty(&claims)?);
            Ok(())
        }
        Ok(VerifyOutcome::Bypass) => {
            bail!("no verification key available (fail-open): token was not checked")
        }
        Err(e) => bail!("token rejected: {e}"),
    }
}
