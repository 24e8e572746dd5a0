//! Token authority core library
//!
//! Plain data types shared by the authority server and anything that consumes
//! its tokens: principals, registered clients, scope sets, grant types and the
//! claim shaping applied to every issued access token. Nothing in this crate
//! performs I/O or cryptography.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod claims;
pub mod client;
pub mod grant_type;
pub mod principal;
pub mod scope;

pub use claims::{AccessTokenClaims, ClaimsCustomizer};
pub use client::{ClientAuthenticationMethod, RegisteredClient};
pub use grant_type::GrantType;
pub use principal::{Principal, ROLE_PREFIX};
pub use scope::ScopeSet;
