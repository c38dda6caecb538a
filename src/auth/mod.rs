//! Credential handling for the chat server connection
//!
//! The server authenticates both HTTP calls and the WebSocket handshake
//! with an opaque bearer token issued by an external identity provider.
//! Registration completion is signalled through two custom claims
//! (`name`, `profile`) embedded in the token; the connector refuses to
//! open a socket until both are present.
//!
//! Tokens live in the system keyring under the `charla` service, with a
//! `CHARLA_TOKEN` environment fallback for headless use.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use keyring::Entry;
use serde::Deserialize;
use std::error::Error as StdError;
use std::fmt;
use tracing::debug;

const KEYRING_SERVICE: &str = "charla";
const KEYRING_USER: &str = "bearer-token";
const TOKEN_ENV_VAR: &str = "CHARLA_TOKEN";

/// Custom claims carried by the bearer token.
///
/// Both fields are set by the server at registration time; a token
/// without them belongs to an account that has not finished signup.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub profile: Option<u8>,
}

impl Claims {
    /// Best-effort claim extraction from a JWT-shaped token.
    ///
    /// Tokens that are not JWTs (or carry an undecodable payload) yield
    /// empty claims rather than an error; the connector treats those the
    /// same as an unregistered account.
    pub fn from_token(token: &str) -> Claims {
        let Some(payload) = token.split('.').nth(1) else {
            return Claims::default();
        };
        let Ok(bytes) = URL_SAFE_NO_PAD.decode(payload) else {
            debug!("token payload segment is not base64url");
            return Claims::default();
        };
        match serde_json::from_slice(&bytes) {
            Ok(claims) => claims,
            Err(error) => {
                debug!(error = %error, "token payload is not a claims object");
                Claims::default()
            }
        }
    }
}

/// A bearer token plus the claims decoded from it.
#[derive(Debug, Clone)]
pub struct Credential {
    pub token: String,
    pub claims: Claims,
}

impl Credential {
    pub fn from_token(token: String) -> Credential {
        let claims = Claims::from_token(&token);
        Credential { token, claims }
    }

    /// Whether the account behind this token completed registration.
    pub fn registration_complete(&self) -> bool {
        self.claims.name.is_some() && self.claims.profile.is_some()
    }
}

/// Describes failures when accessing the credential store.
///
/// Recoverable errors indicate the platform keyring backend was
/// temporarily unavailable (keychain locked or inaccessible); permanent
/// errors surface the underlying cause for the user.
#[derive(Debug)]
pub enum CredentialStoreError {
    Recoverable(keyring::Error),
    Permanent(keyring::Error),
}

impl CredentialStoreError {
    fn inner(&self) -> &keyring::Error {
        match self {
            CredentialStoreError::Recoverable(err) | CredentialStoreError::Permanent(err) => err,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, CredentialStoreError::Recoverable(_))
    }
}

impl From<keyring::Error> for CredentialStoreError {
    fn from(err: keyring::Error) -> Self {
        match err {
            keyring::Error::PlatformFailure(_) | keyring::Error::NoStorageAccess(_) => {
                CredentialStoreError::Recoverable(err)
            }
            other => CredentialStoreError::Permanent(other),
        }
    }
}

impl fmt::Display for CredentialStoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner())
    }
}

impl StdError for CredentialStoreError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(self.inner())
    }
}

/// Source of the bearer credential for the connection manager and the
/// HTTP client.
///
/// `force_refresh` asks providers backed by a refreshing identity SDK to
/// re-mint the token; store-backed providers simply re-read.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn credential(
        &self,
        force_refresh: bool,
    ) -> Result<Option<Credential>, CredentialStoreError>;
}

/// Keyring-backed provider with an environment-variable fallback.
pub struct KeyringCredentials {
    use_keyring: bool,
}

impl KeyringCredentials {
    pub fn new() -> Self {
        KeyringCredentials { use_keyring: true }
    }

    /// Skip the system keyring and rely on the environment only
    /// (useful for tests and CI).
    pub fn env_only() -> Self {
        KeyringCredentials { use_keyring: false }
    }

    fn entry() -> Result<Entry, CredentialStoreError> {
        Entry::new(KEYRING_SERVICE, KEYRING_USER).map_err(CredentialStoreError::from)
    }

    /// Store a token, replacing any previous one.
    pub fn store_token(token: &str) -> Result<(), CredentialStoreError> {
        Self::entry()?.set_password(token)?;
        Ok(())
    }

    /// Remove the stored token. Missing entries are not an error.
    pub fn clear_token() -> Result<(), CredentialStoreError> {
        match Self::entry()?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn read(&self) -> Result<Option<String>, CredentialStoreError> {
        if self.use_keyring {
            match Self::entry()?.get_password() {
                Ok(token) => return Ok(Some(token)),
                Err(keyring::Error::NoEntry) => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(std::env::var(TOKEN_ENV_VAR).ok().filter(|t| !t.is_empty()))
    }
}

impl Default for KeyringCredentials {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CredentialProvider for KeyringCredentials {
    async fn credential(
        &self,
        _force_refresh: bool,
    ) -> Result<Option<Credential>, CredentialStoreError> {
        Ok(self.read()?.map(Credential::from_token))
    }
}

/// Fixed-token provider for `--token` invocations and tests.
pub struct StaticCredentials {
    credential: Option<Credential>,
}

impl StaticCredentials {
    pub fn new(token: Option<String>) -> Self {
        StaticCredentials {
            credential: token.map(Credential::from_token),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn credential(
        &self,
        _force_refresh: bool,
    ) -> Result<Option<Credential>, CredentialStoreError> {
        Ok(self.credential.clone())
    }
}
