//! OAuth2 service-account flow for Google APIs.
//!
//! A signed RS256 assertion is exchanged at the key's `token_uri` for a short-lived
//! access token, which is cached until shortly before it expires.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::error::{AppResult, LoggerError};

/// Scope granting read/write access to spreadsheets.
pub const SPREADSHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const TOKEN_LIFETIME_SECS: i64 = 3600;
const REFRESH_MARGIN_SECS: i64 = 60;

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".to_string()
}

/// Fields of a service-account key file that the token flow needs.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    /// Service account address, used as the JWT issuer
    pub client_email: String,
    /// PEM-encoded RSA key
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    /// OAuth2 token endpoint
    pub token_uri: String,
}

impl ServiceAccountKey {
    /// Read a key file downloaded from the Google Cloud console.
    pub fn from_file(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            LoggerError::Auth(format!("Cannot read credentials '{}': {e}", path.display()))
        })?;
        Ok(serde_json::from_str(&contents)?)
    }
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: i64,
}

fn default_expires_in() -> i64 {
    TOKEN_LIFETIME_SECS
}

struct CachedToken {
    value: String,
    refresh_at: DateTime<Utc>,
}

/// Issues and caches access tokens for one service account and scope.
pub struct TokenProvider {
    key: ServiceAccountKey,
    encoding_key: EncodingKey,
    scope: String,
    client: Client,
    cached: Option<CachedToken>,
}

impl TokenProvider {
    /// Fails if the private key is not a valid RSA PEM.
    pub fn new(key: ServiceAccountKey, scope: impl Into<String>) -> AppResult<Self> {
        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())?;
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            key,
            encoding_key,
            scope: scope.into(),
            client,
            cached: None,
        })
    }

    /// Signed assertion presented to the token endpoint.
    fn assertion(&self, now: DateTime<Utc>) -> AppResult<String> {
        let iat = now.timestamp();
        let claims = Claims {
            iss: &self.key.client_email,
            scope: &self.scope,
            aud: &self.key.token_uri,
            iat,
            exp: iat + TOKEN_LIFETIME_SECS,
        };
        Ok(encode(&Header::new(Algorithm::RS256), &claims, &self.encoding_key)?)
    }

    /// Return a valid access token, refreshing it when it is close to expiry.
    pub async fn access_token(&mut self) -> AppResult<String> {
        let now = Utc::now();
        if let Some(token) = &self.cached {
            if now < token.refresh_at {
                return Ok(token.value.clone());
            }
        }

        let assertion = self.assertion(now)?;
        let response = self
            .client
            .post(&self.key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LoggerError::Auth(format!(
                "Token exchange for '{}' failed with {status}: {body}",
                self.key.client_email
            )));
        }

        let token: TokenResponse = response.json().await?;
        tracing::debug!(
            client_email = %self.key.client_email,
            expires_in = token.expires_in,
            "Obtained Google access token"
        );
        let refresh_at =
            now + chrono::Duration::seconds((token.expires_in - REFRESH_MARGIN_SECS).max(0));
        self.cached = Some(CachedToken {
            value: token.access_token.clone(),
            refresh_at,
        });
        Ok(token.access_token)
    }
}
