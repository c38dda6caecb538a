//! HTTP client for the chat server's REST surface
//!
//! Covers the user and room endpoints that sit next to the WebSocket:
//! registration, identity lookup, and room listing. Requests carry the
//! bearer token from the shared [`CredentialProvider`]; a `401` is
//! retried once with a force-refreshed credential, mirroring the
//! server's `requiresTokenRefresh` contract after registration.

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{CredentialProvider, CredentialStoreError};
use crate::utils::url::construct_api_url;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterRequest<'a> {
    id_token: &'a str,
    name: &'a str,
    profile: u8,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub requires_token_refresh: bool,
}

/// The registered identity behind the current credential.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub user_id: String,
    #[serde(default)]
    pub email: String,
    pub name: String,
    #[serde(default)]
    pub profile: u8,
}

/// One chat room as listed by the server.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: String,
    #[serde(default)]
    pub creator_id: String,
    #[serde(default)]
    pub member_ids: Vec<String>,
    #[serde(default)]
    pub room_name: Option<String>,
    #[serde(default)]
    pub background_color: Option<String>,
    #[serde(default)]
    pub last_message_sent: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_public: bool,
}

#[derive(Debug)]
pub enum ApiError {
    /// No credential available for an authenticated endpoint.
    NotAuthenticated,
    Credential(CredentialStoreError),
    Http(reqwest::Error),
    /// The server answered with a non-success status.
    Status { status: StatusCode, body: String },
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApiError::NotAuthenticated => {
                write!(f, "no credential available; run `charla auth` first")
            }
            ApiError::Credential(source) => write!(f, "credential store error: {}", source),
            ApiError::Http(source) => write!(f, "request failed: {}", source),
            ApiError::Status { status, body } => {
                write!(f, "server returned {}: {}", status, body)
            }
        }
    }
}

impl StdError for ApiError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            ApiError::Credential(source) => Some(source),
            ApiError::Http(source) => Some(source),
            _ => None,
        }
    }
}

impl From<CredentialStoreError> for ApiError {
    fn from(err: CredentialStoreError) -> Self {
        ApiError::Credential(err)
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        ApiError::Http(err)
    }
}

/// Client for the room/user REST endpoints.
pub struct RoomClient {
    http: reqwest::Client,
    base_url: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl RoomClient {
    pub fn new(
        base_url: &str,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<RoomClient, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(RoomClient {
            http,
            base_url: base_url.to_string(),
            credentials,
        })
    }

    pub async fn public_rooms(&self) -> Result<Vec<Room>, ApiError> {
        self.get_json("/api/rooms/public").await
    }

    pub async fn private_room(&self, target_id: &str) -> Result<Room, ApiError> {
        self.get_json(&format!("/api/rooms/private/{}", target_id))
            .await
    }

    pub async fn me(&self) -> Result<UserInfo, ApiError> {
        self.get_json("/api/users/me").await
    }

    /// Complete registration for the account behind the current token.
    /// On success the server stamps the `name`/`profile` claims and asks
    /// for a token refresh before the WebSocket will accept the account.
    pub async fn register(&self, name: &str, profile: u8) -> Result<RegisterResponse, ApiError> {
        let token = self.token(false).await?;
        let url = construct_api_url(&self.base_url, "/api/users/register");
        let response = self
            .http
            .post(url)
            .json(&RegisterRequest {
                id_token: &token,
                name,
                profile,
            })
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn token(&self, force_refresh: bool) -> Result<String, ApiError> {
        match self.credentials.credential(force_refresh).await? {
            Some(credential) => Ok(credential.token),
            None => Err(ApiError::NotAuthenticated),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, ApiError> {
        let url = construct_api_url(&self.base_url, endpoint);
        let token = self.token(false).await?;
        let response = self
            .http
            .get(&url)
            .bearer_auth(&token)
            .send()
            .await?;

        // One forced refresh on 401, then give up.
        if response.status() == StatusCode::UNAUTHORIZED {
            let token = self.token(true).await?;
            let response = self.http.get(&url).bearer_auth(&token).send().await?;
            return Self::decode(response).await;
        }
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| "<no body>".to_string());
            return Err(ApiError::Status { status, body });
        }
        Ok(response.json().await?)
    }
}
