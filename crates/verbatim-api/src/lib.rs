//! REST client for the Verbatim marketplace server.
//!
//! Thin typed wrapper over reqwest. Holds a mirror of the session token so
//! call sites never thread credentials through; the session service updates
//! the mirror on login, refresh and logout.

use std::sync::RwLock;

use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;
use uuid::Uuid;

use verbatim_types::api::{
    ApiErrorBody, AuthResponse, CountsResponse, LoginRequest, RegisterRequest,
    SendMessageRequest, UploadResponse,
};
use verbatim_types::models::{ChatMessage, UserProfile};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The server rejected the token. Callers treat this as a signed-out
    /// signal, not a retryable failure.
    #[error("unauthorized")]
    Unauthorized,

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: RwLock<Option<String>>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http: reqwest::Client::new(),
            base_url,
            token: RwLock::new(None),
        }
    }

    /// Replace the mirrored token. `None` drops authentication.
    pub fn set_token(&self, token: Option<String>) {
        *self.token.write().expect("token lock poisoned") = token;
    }

    pub fn clear_token(&self) {
        self.set_token(None);
    }

    pub fn token(&self) -> Option<String> {
        self.token.read().expect("token lock poisoned").clone()
    }

    // ── Auth ─────────────────────────────────────────────────────────────

    pub async fn login(&self, req: &LoginRequest) -> Result<AuthResponse, ApiError> {
        let resp = self
            .http
            .post(format!("{}/auth/login", self.base_url))
            .json(req)
            .send()
            .await?;
        parse(resp).await
    }

    pub async fn register(&self, req: &RegisterRequest) -> Result<AuthResponse, ApiError> {
        let resp = self
            .http
            .post(format!("{}/auth/register", self.base_url))
            .json(req)
            .send()
            .await?;
        parse(resp).await
    }

    /// Fetch the profile behind the current token. The authoritative role
    /// and assessment state come from here, never from the cached session.
    pub async fn me(&self) -> Result<UserProfile, ApiError> {
        let resp = self
            .authed(self.http.get(format!("{}/auth/me", self.base_url)))
            .send()
            .await?;
        parse(resp).await
    }

    // ── Messages ─────────────────────────────────────────────────────────

    pub async fn direct_history(&self, peer: Uuid) -> Result<Vec<ChatMessage>, ApiError> {
        let resp = self
            .authed(self.http.get(format!(
                "{}/conversations/direct/{}/messages",
                self.base_url, peer
            )))
            .send()
            .await?;
        parse(resp).await
    }

    pub async fn job_history(&self, job: Uuid) -> Result<Vec<ChatMessage>, ApiError> {
        let resp = self
            .authed(
                self.http
                    .get(format!("{}/jobs/{}/messages", self.base_url, job)),
            )
            .send()
            .await?;
        parse(resp).await
    }

    /// Returns the stored message with its server-assigned id and timestamp.
    pub async fn send_message(&self, req: &SendMessageRequest) -> Result<ChatMessage, ApiError> {
        let resp = self
            .authed(self.http.post(format!("{}/messages", self.base_url)))
            .json(req)
            .send()
            .await?;
        parse(resp).await
    }

    // ── Uploads ──────────────────────────────────────────────────────────

    pub async fn upload_attachment(
        &self,
        name: &str,
        bytes: Vec<u8>,
    ) -> Result<UploadResponse, ApiError> {
        let part = reqwest::multipart::Part::bytes(bytes).file_name(name.to_string());
        let form = reqwest::multipart::Form::new().part("file", part);

        let resp = self
            .authed(self.http.post(format!("{}/uploads", self.base_url)))
            .multipart(form)
            .send()
            .await?;
        parse(resp).await
    }

    // ── Dashboard counts ─────────────────────────────────────────────────

    pub async fn counts(&self) -> Result<CountsResponse, ApiError> {
        let resp = self
            .authed(self.http.get(format!("{}/counts", self.base_url)))
            .send()
            .await?;
        parse(resp).await
    }

    fn authed(&self, req: RequestBuilder) -> RequestBuilder {
        match self.token() {
            Some(token) => req.header("Authorization", format!("Bearer {}", token)),
            None => req,
        }
    }
}

async fn parse<T: DeserializeOwned>(resp: Response) -> Result<T, ApiError> {
    let status = resp.status();

    if status == StatusCode::UNAUTHORIZED {
        return Err(ApiError::Unauthorized);
    }

    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        // Servers send {"error": "..."}; tolerate plain-text bodies too.
        let message = serde_json::from_str::<ApiErrorBody>(&body)
            .map(|b| b.error)
            .unwrap_or(body);
        debug!("Request failed ({}): {}", status, message);
        return Err(ApiError::Server {
            status: status.as_u16(),
            message,
        });
    }

    Ok(resp.json().await?)
}
