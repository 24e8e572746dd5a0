//! Access-token minting and verification.
//!
//! - [`TokenIssuer`] signs RS256 access tokens with the active key, mints
//!   refresh tokens and persists the [`Authorization`] record.
//! - [`TokenValidator`] verifies bearer tokens against any stored key and
//!   projects the claims into an [`AuthenticatedContext`].
//! - [`AuthorizationStore`] keeps the issued-token records that back refresh,
//!   revocation and introspection.

pub mod authorization;
pub mod issuer;
pub mod validator;

pub use authorization::{
    AccessTokenRecord, Authorization, AuthorizationStore, ConsumedRefreshToken,
    FileAuthorizationStore, InMemoryAuthorizationStore, RefreshTokenRecord, spawn_reaper,
};
pub use issuer::{IssuedTokens, TokenIssuer};
pub use validator::{AuthenticatedContext, TokenError, TokenValidator};
