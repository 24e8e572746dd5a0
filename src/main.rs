//! Token authority - OAuth2 token issuance with rotating RS256 keys.

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use token_authority::{
    authority::open_key_manager,
    cli::{Cli, Command, KeysCommand},
    config::Config,
    grant::mint_assertion,
    keys::JwkSet,
    password::PasswordHasher,
    server::Server,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::Keys(ref cmd)) => run_keys_command(&cli, cmd).await,
        Some(Command::HashPassword { ref password }) => run_hash_password(password),
        Some(Command::MintAssertion { ref client_id, ttl }) => {
            run_mint_assertion(&cli, client_id, ttl).await
        }
        Some(Command::Serve) | None => run_server(cli).await,
    }
}

fn load_config(cli: &Cli) -> Option<Config> {
    match Config::load(cli.config.as_deref()) {
        Ok(config) => Some(config),
        Err(e) => {
            error!("Failed to load configuration: {e}");
            None
        }
    }
}

/// Run key management commands
async fn run_keys_command(cli: &Cli, cmd: &KeysCommand) -> ExitCode {
    let Some(config) = load_config(cli) else {
        return ExitCode::FAILURE;
    };
    let keys = match open_key_manager(&config.keys).await {
        Ok(keys) => keys,
        Err(e) => {
            eprintln!("❌ Failed to open key store: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cmd {
        KeysCommand::List { jwks: true } => match keys.public_keys().await {
            Ok(keys) => match serde_json::to_string_pretty(&JwkSet { keys }) {
                Ok(json) => {
                    println!("{json}");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("❌ Failed to serialize JWKS: {e}");
                    ExitCode::FAILURE
                }
            },
            Err(e) => {
                eprintln!("❌ Failed to read keys: {e}");
                ExitCode::FAILURE
            }
        },
        KeysCommand::List { jwks: false } => match keys.keys().await {
            Ok(list) if list.is_empty() => {
                println!("No signing keys stored. Run `keys rotate` or start the server.");
                ExitCode::SUCCESS
            }
            Ok(list) => {
                println!("{} key(s):\n", list.len());
                for (i, key) in list.iter().enumerate() {
                    let marker = if i == 0 { " (active)" } else { "" };
                    println!("🔑 {}{marker}", key.id);
                    println!("   Created: {}", key.created_at.to_rfc3339());
                }
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("❌ Failed to read keys: {e}");
                ExitCode::FAILURE
            }
        },
        KeysCommand::Rotate => match keys.rotate().await {
            Ok(key) => {
                println!("✅ New signing key: {}", key.id);
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("❌ Rotation failed: {e}");
                ExitCode::FAILURE
            }
        },
    }
}

/// Print an argon2 hash
fn run_hash_password(password: &str) -> ExitCode {
    match PasswordHasher::default().hash(password) {
        Ok(hash) => {
            println!("{hash}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Hashing failed: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Print a signed jwt-bearer assertion
async fn run_mint_assertion(cli: &Cli, client_id: &str, ttl: std::time::Duration) -> ExitCode {
    let Some(config) = load_config(cli) else {
        return ExitCode::FAILURE;
    };
    let keys = match open_key_manager(&config.keys).await {
        Ok(keys) => keys,
        Err(e) => {
            eprintln!("❌ Failed to open key store: {e}");
            return ExitCode::FAILURE;
        }
    };
    if config.clients.iter().all(|c| c.client_id != client_id) {
        eprintln!("⚠️  Client '{client_id}' is not registered in the configuration");
    }

    match mint_assertion(&keys, &config.issuer, client_id, ttl).await {
        Ok(assertion) => {
            println!("{assertion}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Failed to sign assertion: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Run the authority server
async fn run_server(cli: Cli) -> ExitCode {
    let Some(mut config) = load_config(&cli) else {
        return ExitCode::FAILURE;
    };
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host = host.clone();
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        clients = config.clients.len(),
        users = config.users.len(),
        "Starting token authority"
    );

    let server = match Server::new(config).await {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to create server: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = server.run().await {
        error!("Server error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Token authority shutdown complete");
    ExitCode::SUCCESS
}
