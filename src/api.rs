//! Official Account API session
//!
//! Handles:
//! - Access token issuance (the caller owns the token and decides when to refresh)
//! - Callback server IP list (for restricting who may call the webhook)

use anyhow::{Context, Result, anyhow};
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

// =============================================================================
// API Endpoints
// =============================================================================

const TOKEN_PATH: &str = "cgi-bin/token";
const CALLBACK_IP_PATH: &str = "cgi-bin/getcallbackip";
const GRANT_TYPE: &str = "client_credential";

/// Refresh this long before the platform's stated expiry
const REFRESH_MARGIN: Duration = Duration::from_secs(300);

// =============================================================================
// Tagged API results
// =============================================================================

/// Error body returned by the platform
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, thiserror::Error)]
#[error("API error {errcode}: {errmsg}")]
pub struct ApiError {
    pub errcode: i64,
    #[serde(default)]
    pub errmsg: String,
}

/// Result of an API call, decided by `errcode` alone
#[derive(Debug, Clone, PartialEq)]
pub enum ApiReply<T> {
    Ok(T),
    Err(ApiError),
}

impl<T: DeserializeOwned> ApiReply<T> {
    /// Classify a JSON response body
    ///
    /// A non-zero `errcode` is an error whatever else the body carries.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let errcode = value.get("errcode").and_then(|v| v.as_i64()).unwrap_or(0);
        if errcode != 0 {
            let err: ApiError =
                serde_json::from_value(value).context("Failed to parse API error body")?;
            return Ok(Self::Err(err));
        }

        let ok = serde_json::from_value(value).context("Failed to parse API response body")?;
        Ok(Self::Ok(ok))
    }
}

impl<T> ApiReply<T> {
    pub fn into_result(self) -> Result<T, ApiError> {
        match self {
            Self::Ok(v) => Ok(v),
            Self::Err(e) => Err(e),
        }
    }
}

// =============================================================================
// Access Token
// =============================================================================

/// Access token issued to the caller
///
/// Not cached inside the client. Callers hold it, check `is_expired`, and
/// call `ApiClient::fetch_access_token` for a replacement.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_at: Instant,
}

impl AccessToken {
    pub fn new(token: String, expires_in_secs: u64) -> Self {
        let effective = Duration::from_secs(expires_in_secs).saturating_sub(REFRESH_MARGIN);
        Self {
            token,
            expires_at: Instant::now() + effective,
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

/// Token response from the platform
#[derive(Debug, PartialEq, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

/// Callback IP response
#[derive(Debug, PartialEq, Deserialize)]
struct CallbackIpResponse {
    ip_list: Vec<String>,
}

// =============================================================================
// API Client
// =============================================================================

/// Official Account API client
#[derive(Clone)]
pub struct ApiClient {
    host: String,
    app_id: String,
    app_secret: String,
    http_client: Client,
}

impl ApiClient {
    pub fn new(host: &str, app_id: &str, app_secret: &str) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            host: host.to_string(),
            app_id: app_id.to_string(),
            app_secret: app_secret.to_string(),
            http_client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("https://{}/{}", self.host, path)
    }

    /// Request a fresh access token
    pub async fn fetch_access_token(&self) -> Result<AccessToken> {
        debug!("Requesting access token for {}", self.app_id);

        let response = self
            .http_client
            .get(self.url(TOKEN_PATH))
            .query(&[
                ("grant_type", GRANT_TYPE),
                ("appid", self.app_id.as_str()),
                ("secret", self.app_secret.as_str()),
            ])
            .send()
            .await
            .context("Failed to send token request")?;

        let token_resp: TokenResponse = self
            .read_reply(response)
            .await?
            .into_result()
            .map_err(|e| {
                error!("Access token error for {}: {}", self.app_id, e);
                anyhow!("appid {} get access_token: {}", self.app_id, e)
            })?;

        if token_resp.access_token.is_empty() {
            return Err(anyhow!("appid {} got an empty access_token", self.app_id));
        }

        info!(
            "Obtained access token for {} (expires in {}s)",
            self.app_id, token_resp.expires_in
        );
        Ok(AccessToken::new(token_resp.access_token, token_resp.expires_in))
    }

    /// IP addresses the platform calls back from
    pub async fn callback_ips(&self, token: &AccessToken) -> Result<Vec<String>> {
        let response = self
            .http_client
            .get(self.url(CALLBACK_IP_PATH))
            .query(&[("access_token", token.token.as_str())])
            .send()
            .await
            .context("Failed to send callback IP request")?;

        let ips: CallbackIpResponse = self
            .read_reply(response)
            .await?
            .into_result()
            .map_err(|e| anyhow!("get callback ip: {}", e))?;

        debug!("Platform calls back from {} addresses", ips.ip_list.len());
        Ok(ips.ip_list)
    }

    async fn read_reply<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<ApiReply<T>> {
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("HTTP {}", status));
        }
        let value: serde_json::Value = response
            .json()
            .await
            .context("Failed to parse API response")?;
        ApiReply::from_value(value)
    }
}

// =============================================================================
// Tests
// =============================================================================
