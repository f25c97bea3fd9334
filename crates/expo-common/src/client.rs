use std::sync::{Arc, PoisonError, RwLock};

use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::api::feedback::{FeedbackCreated, FeedbackRecord};
use crate::api::session::SessionInfo;

/// Bearer credential shared by every request a client makes.
///
/// Cloning yields a handle to the same credential, so a login flow can `set`
/// it once and all clients built from the context pick it up.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    token: Arc<RwLock<Option<String>>>,
}

impl SessionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, token: impl Into<String>) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = Some(token.into());
    }

    pub fn clear(&self) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn token(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server responded {status}: {body}")]
    Api { status: StatusCode, body: Value },
}

/// Typed client for the feedback API.
#[derive(Debug, Clone)]
pub struct FeedbackClient {
    http: Client,
    base_url: String,
    session: SessionContext,
}

impl FeedbackClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_session(base_url, SessionContext::new())
    }

    pub fn with_session(base_url: impl Into<String>, session: SessionContext) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            http: Client::new(),
            base_url,
            session,
        }
    }

    pub fn session(&self) -> &SessionContext {
        &self.session
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .http
            .request(method, format!("{}{}", self.base_url, path));

        match self.session.token() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    pub async fn submit(&self, payload: &Value) -> Result<FeedbackRecord, ClientError> {
        let response = self
            .request(Method::POST, "/api/feedback")
            .json(payload)
            .send()
            .await?;

        let created: FeedbackCreated = read_json(response).await?;
        Ok(created.feedback)
    }

    pub async fn list(&self) -> Result<Vec<FeedbackRecord>, ClientError> {
        let response = self.request(Method::GET, "/api/feedback").send().await?;
        read_json(response).await
    }

    pub async fn current_session(&self) -> Result<SessionInfo, ClientError> {
        let response = self.request(Method::GET, "/api/session").send().await?;
        read_json(response).await
    }
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json::<T>().await?);
    }

    let text = response.text().await?;
    let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
    Err(ClientError::Api { status, body })
}
