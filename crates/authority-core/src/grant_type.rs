//! OAuth2 grant type identifiers understood by the authority.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Grant types the authority can authenticate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GrantType {
    /// Resource-owner password credentials.
    #[serde(rename = "password")]
    Password,
    /// Self-asserted JWT presented by a machine client.
    #[serde(rename = "urn:ietf:params:oauth:grant-type:jwt-bearer")]
    JwtBearer,
    /// Refresh-token exchange.
    #[serde(rename = "refresh_token")]
    RefreshToken,
}

impl GrantType {
    /// All supported grant types, in advertisement order.
    pub const ALL: [Self; 3] = [Self::Password, Self::JwtBearer, Self::RefreshToken];

    /// Wire identifier used in the `grant_type` form field.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Password => "password",
            Self::JwtBearer => "urn:ietf:params:oauth:grant-type:jwt-bearer",
            Self::RefreshToken => "refresh_token",
        }
    }
}

impl fmt::Display for GrantType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GrantType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|g| g.as_str() == s)
            .ok_or_else(|| format!("unsupported grant type: {s}"))
    }
}
