//! Credentials and HMAC-SHA-256 request signing
//!
//! Every authenticated request carries a timestamp and a signature over
//! `timestamp + METHOD + path + body`, keyed by the base64-decoded API
//! secret. Credentials come from the environment (`CB_API_KEY`,
//! `CB_API_SECRET`, `CB_API_PASSPHRASE`) or a JSON file, with the
//! environment taking priority.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;

use super::VenueError;

type HmacSha256 = Hmac<Sha256>;

/// Env var overriding the credentials file location
pub const CONFIG_PATH_ENV: &str = "CB_CONFIG_PATH";

/// API credentials for the venue
#[derive(Debug, Clone)]
pub struct Credentials {
    pub api_key: String,
    pub api_secret: String,
    pub passphrase: String,
}

#[derive(Deserialize)]
struct CredentialsFile {
    api_key: Option<String>,
    api_secret: Option<String>,
    passphrase: Option<String>,
}

impl Credentials {
    pub fn new(
        api_key: impl Into<String>,
        api_secret: impl Into<String>,
        passphrase: impl Into<String>,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            passphrase: passphrase.into(),
        }
    }

    /// Load credentials from the environment, falling back to a JSON file.
    ///
    /// File location: `config_path` argument, else `CB_CONFIG_PATH`, else
    /// `~/.coinbase_config.json`. Individual environment variables win over
    /// file entries.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut api_key = std::env::var("CB_API_KEY").ok();
        let mut api_secret = std::env::var("CB_API_SECRET").ok();
        let mut passphrase = std::env::var("CB_API_PASSPHRASE").ok();

        if api_key.is_none() || api_secret.is_none() || passphrase.is_none() {
            let path: PathBuf = match config_path {
                Some(p) => p.to_path_buf(),
                None => match std::env::var(CONFIG_PATH_ENV) {
                    Ok(p) => PathBuf::from(p),
                    Err(_) => dirs_fallback().join(".coinbase_config.json"),
                },
            };

            if path.exists() {
                let contents = std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read credentials file {}", path.display()))?;
                let file: CredentialsFile = serde_json::from_str(&contents)
                    .with_context(|| format!("Failed to parse credentials file {}", path.display()))?;
                api_key = api_key.or(file.api_key);
                api_secret = api_secret.or(file.api_secret);
                passphrase = passphrase.or(file.passphrase);
            }
        }

        match (api_key, api_secret, passphrase) {
            (Some(api_key), Some(api_secret), Some(passphrase)) => Ok(Self {
                api_key,
                api_secret,
                passphrase,
            }),
            _ => anyhow::bail!(
                "Missing venue credentials. Provide CB_API_KEY, CB_API_SECRET and \
                 CB_API_PASSPHRASE via the environment or a credentials file"
            ),
        }
    }

    /// Decode the base64 API secret into the HMAC key.
    ///
    /// A secret that is not valid base64 can never produce an accepted
    /// signature, so this is checked once at client construction.
    pub fn decoded_secret(&self) -> Result<Vec<u8>, VenueError> {
        BASE64
            .decode(&self.api_secret)
            .map_err(|e| VenueError::Signing(format!("API secret must be base64-encoded: {e}")))
    }
}

fn dirs_fallback() -> PathBuf {
    std::env::var("HOME").map(PathBuf::from).unwrap_or_default()
}

/// Sign `timestamp + METHOD + path + body` with the decoded secret.
///
/// Returns the base64-encoded signature for the `CB-ACCESS-SIGN` header.
pub fn sign_request(
    secret_key: &[u8],
    timestamp: &str,
    method: &str,
    path: &str,
    body: &str,
) -> Result<String, VenueError> {
    let message = format!("{}{}{}{}", timestamp, method.to_uppercase(), path, body);
    let mut mac = HmacSha256::new_from_slice(secret_key)
        .map_err(|e| VenueError::Signing(e.to_string()))?;
    mac.update(message.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_creation() {
        let creds = Credentials::new("key", "secret", "phrase");
        assert_eq!(creds.api_key, "key");
        assert_eq!(creds.passphrase, "phrase");
    }

    #[test]
    fn test_decoded_secret_rejects_invalid_base64() {
        let creds = Credentials::new("key", "not base64 !!!", "phrase");
        assert!(matches!(creds.decoded_secret(), Err(VenueError::Signing(_))));
    }

    #[test]
    fn test_decoded_secret_accepts_valid_base64() {
        let secret = BASE64.encode(b"raw-secret-bytes");
        let creds = Credentials::new("key", secret, "phrase");
        assert_eq!(creds.decoded_secret().unwrap(), b"raw-secret-bytes");
    }

    #[test]
    fn test_signature_is_deterministic_base64() {
        let key = b"0123456789abcdef";
        let sig1 = sign_request(key, "1700000000", "POST", "/orders", "{}").unwrap();
        let sig2 = sign_request(key, "1700000000", "post", "/orders", "{}").unwrap();
        // method is upper-cased before signing
        assert_eq!(sig1, sig2);
        // base64 of a 32-byte digest
        assert_eq!(BASE64.decode(&sig1).unwrap().len(), 32);
    }

    #[test]
    fn test_signature_varies_with_message() {
        let key = b"0123456789abcdef";
        let a = sign_request(key, "1", "GET", "/orders/x", "").unwrap();
        let b = sign_request(key, "2", "GET", "/orders/x", "").unwrap();
        assert_ne!(a, b);
    }
}
