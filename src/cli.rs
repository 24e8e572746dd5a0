//! Command-line interface

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::config::humantime_serde;

/// OAuth2 token authority - rotating RS256 keys, JWKS and token issuance
#[derive(Parser, Debug)]
#[command(name = "token-authority")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "TOKEN_AUTHORITY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "TOKEN_AUTHORITY_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "TOKEN_AUTHORITY_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "TOKEN_AUTHORITY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "TOKEN_AUTHORITY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the authority server (default)
    Serve,

    /// Signing key management
    #[command(subcommand)]
    Keys(KeysCommand),

    /// Hash a password or client secret for use in the config file
    HashPassword {
        /// Plaintext to hash
        #[arg(required = true)]
        password: String,
    },

    /// Sign a jwt-bearer assertion for a client with the active key
    MintAssertion {
        /// Client the assertion is for (`sub`)
        #[arg(required = true)]
        client_id: String,

        /// Assertion lifetime ("60s", "5m", ...)
        #[arg(long, default_value = "5m", value_parser = parse_duration)]
        ttl: Duration,
    },
}

/// Key subcommands
#[derive(Subcommand, Debug)]
pub enum KeysCommand {
    /// List stored keys, newest (active) first
    List {
        /// Print the JWKS document instead of a table
        #[arg(long)]
        jwks: bool,
    },

    /// Generate a new signing key now
    Rotate,
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime_serde::parse(value)
}
