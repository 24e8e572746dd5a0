//! Token Authority Library
//!
//! An OAuth2 token authority that signs RS256 access tokens with rotating
//! key pairs and publishes every key it has ever used as a JWKS.
//!
//! # Features
//!
//! - **Key lifecycle**: bootstrap, scheduled and manual rotation; private keys
//!   encrypted at rest; race-free bootstrap across instances
//! - **Grants**: password, jwt-bearer and refresh-token, behind a pluggable
//!   [`grant::GrantHandler`] registry
//! - **Tokens**: claim shaping (roles vs. authorities), persisted
//!   authorizations, single-use refresh tokens
//! - **Endpoints**: token, JWKS, introspection, revocation, metadata,
//!   userinfo, health, metrics
//!
//! # Rotation
//!
//! Old keys are never deleted, so a token signed before a rotation keeps
//! validating until it expires.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod authority;
pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod grant;
pub mod keys;
pub mod password;
pub mod principal;
pub mod server;
pub mod token;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
