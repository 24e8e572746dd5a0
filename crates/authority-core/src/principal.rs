//! Authenticated principals.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Authorities carrying this prefix are roles; everything else is a
/// fine-grained permission.
pub const ROLE_PREFIX: &str = "ROLE_";

/// The party a token is issued to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Principal {
    /// A resource owner authenticated with username and password.
    User {
        /// Login name.
        username: String,
        /// Granted authorities (roles and permissions).
        authorities: BTreeSet<String>,
    },
    /// A machine client authenticated by its own assertion.
    Client {
        /// Registered client identifier.
        client_id: String,
        /// Granted authorities (roles and permissions).
        authorities: BTreeSet<String>,
    },
}

impl Principal {
    /// Name used as the token subject.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::User { username, .. } => username,
            Self::Client { client_id, .. } => client_id,
        }
    }

    /// All granted authorities.
    #[must_use]
    pub fn authorities(&self) -> &BTreeSet<String> {
        match self {
            Self::User { authorities, .. } | Self::Client { authorities, .. } => authorities,
        }
    }

    /// Whether this is a machine client.
    #[must_use]
    pub fn is_client(&self) -> bool {
        matches!(self, Self::Client { .. })
    }

    /// Split authorities into `(roles, permissions)` by the [`ROLE_PREFIX`]
    /// convention.
    #[must_use]
    pub fn split_authorities(&self) -> (BTreeSet<String>, BTreeSet<String>) {
        self.authorities()
            .iter()
            .cloned()
            .partition(|a| a.starts_with(ROLE_PREFIX))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(authorities: &[&str]) -> Principal {
        Principal::User {
            username: "admin".to_string(),
            authorities: authorities.iter().map(|a| (*a).to_string()).collect(),
        }
    }

    #[test]
    fn split_separates_roles_from_permissions() {
        let (roles, perms) = user(&["ROLE_ADMIN", "READ_USER", "WRITE_USER"]).split_authorities();
        assert_eq!(roles.into_iter().collect::<Vec<_>>(), vec!["ROLE_ADMIN"]);
        assert_eq!(perms.into_iter().collect::<Vec<_>>(), vec!["READ_USER", "WRITE_USER"]);
    }

    #[test]
    fn prefix_match_is_case_sensitive() {
        let (roles, perms) = user(&["role_admin"]).split_authorities();
        assert!(roles.is_empty());
        assert_eq!(perms.len(), 1);
    }

    #[test]
    fn name_is_username_or_client_id() {
        assert_eq!(user(&[]).name(), "admin");
        let client = Principal::Client {
            client_id: "billing-svc".to_string(),
            authorities: BTreeSet::new(),
        };
        assert_eq!(client.name(), "billing-svc");
        assert!(client.is_client());
    }
}
