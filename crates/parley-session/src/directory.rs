//! Room directory: the HTTP join call that precedes signaling.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{JoinFailure, SessionError, SessionResult};
use crate::types::RtpCapabilities;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub room_id: String,
    pub peer_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinResponse {
    pub router_rtp_capabilities: RtpCapabilities,
    #[serde(default)]
    pub is_creator: bool,
    #[serde(default)]
    pub locked: bool,
}

#[async_trait]
pub trait RoomDirectory: Send + Sync {
    async fn join(&self, request: JoinRequest) -> SessionResult<JoinResponse>;
}

/// `POST {api}/rooms/{room}/join`.
#[derive(Clone)]
pub struct HttpRoomDirectory {
    client: Client,
    base_url: String,
}

impl HttpRoomDirectory {
    pub fn new(base_url: &str) -> SessionResult<Self> {
        url::Url::parse(base_url)?;
        let client = Client::builder().build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
        })
    }
}

#[async_trait]
impl RoomDirectory for HttpRoomDirectory {
    async fn join(&self, request: JoinRequest) -> SessionResult<JoinResponse> {
        let url = format!("{}/rooms/{}/join", self.base_url, request.room_id);
        let resp = match self.client.post(&url).json(&request).send().await {
            Ok(resp) => resp,
            Err(e) if e.is_connect() => {
                warn!(error = %e, url = %url, "Room directory unreachable");
                return Err(JoinFailure::ConnectionRefused.into());
            }
            Err(e) => return Err(SessionError::Http(e)),
        };

        let status = resp.status();
        if !status.is_success() {
            let body_error = resp
                .json::<Value>()
                .await
                .ok()
                .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_owned));
            debug!(status = status.as_u16(), ?body_error, "Join rejected");
            let failure = classify_join_status(status, request.password.is_some(), body_error);
            return Err(failure.into());
        }

        Ok(resp.json::<JoinResponse>().await?)
    }
}

/// Map a non-success join status to a user-facing category.
pub fn classify_join_status(
    status: StatusCode,
    password_supplied: bool,
    body_error: Option<String>,
) -> JoinFailure {
    match status {
        StatusCode::UNAUTHORIZED if password_supplied => JoinFailure::InvalidPassword,
        StatusCode::UNAUTHORIZED => JoinFailure::PasswordRequired,
        StatusCode::FORBIDDEN => JoinFailure::InvalidPassword,
        _ => JoinFailure::Other(body_error.unwrap_or_else(|| status.to_string())),
    }
}
