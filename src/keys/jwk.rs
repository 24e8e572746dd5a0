//! RSA public keys in JWK form (RFC 7517 / RFC 7518 §6.3.1).

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::FromDer;
use x509_parser::public_key::PublicKey;
use x509_parser::x509::SubjectPublicKeyInfo;

use super::KeyError;

/// A single published verification key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    /// Always `RSA`.
    pub kty: String,
    /// Key id, equal to the JWT header `kid`.
    pub kid: String,
    /// Always `sig`.
    #[serde(rename = "use")]
    pub key_use: String,
    /// Always `RS256`.
    pub alg: String,
    /// Modulus, base64url without padding.
    pub n: String,
    /// Public exponent, base64url without padding.
    pub e: String,
}

/// The `{"keys": [...]}` document served at `/oauth2/jwks`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JwkSet {
    /// Published keys.
    pub keys: Vec<Jwk>,
}

impl JwkSet {
    /// Find a key by id.
    #[must_use]
    pub fn find(&self, kid: &str) -> Option<&Jwk> {
        self.keys.iter().find(|k| k.kid == kid)
    }
}

impl Jwk {
    /// Project an SPKI PEM public key into a JWK.
    pub fn from_public_pem(kid: &str, pem: &str) -> Result<Self, KeyError> {
        let (_, pem) = parse_x509_pem(pem.as_bytes())
            .map_err(|e| KeyError::Crypto(format!("invalid public key PEM: {e}")))?;
        let (_, spki) = SubjectPublicKeyInfo::from_der(&pem.contents)
            .map_err(|e| KeyError::Crypto(format!("invalid SubjectPublicKeyInfo: {e}")))?;
        let parsed = spki
            .parsed()
            .map_err(|e| KeyError::Crypto(format!("unsupported public key: {e}")))?;

        let PublicKey::RSA(rsa) = parsed else {
            return Err(KeyError::Crypto("public key is not RSA".to_string()));
        };

        Ok(Self {
            kty: "RSA".to_string(),
            kid: kid.to_string(),
            key_use: "sig".to_string(),
            alg: "RS256".to_string(),
            n: URL_SAFE_NO_PAD.encode(strip_leading_zeros(rsa.modulus)),
            e: URL_SAFE_NO_PAD.encode(strip_leading_zeros(rsa.exponent)),
        })
    }
}

/// DER integers carry a leading zero byte when the high bit is set; JWK
/// values are unsigned big-endian without it.
fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[start..]
}
