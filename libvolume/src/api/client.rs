//! HTTP client for the control-plane API.

use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::debug;

use super::error::{ErrorBody, ErrorCode};
use super::server::{BackendList, MessageResponse, VolumeList};
use crate::types::{
    BackendInfo, CreateVolumeRequest, PublishVolumeRequest, StageVolumeRequest,
    UnpublishVolumeRequest, UnstageVolumeRequest, Volume,
};

#[derive(Debug, Error)]
pub enum ClientError {
    /// The manager answered with an error body.
    #[error("{code} ({status}): {message}")]
    Api {
        status: StatusCode,
        code: ErrorCode,
        message: String,
    },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("decode error: {0}")]
    Decode(String),
}

impl ClientError {
    /// The machine-readable code, if the manager sent one.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Api { code, .. } => Some(*code),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.code() == Some(ErrorCode::NotFound)
    }
}

/// Thin typed wrapper over the `/api/v1` routes.
#[derive(Debug, Clone)]
pub struct ManagerClient {
    http: reqwest::Client,
    base_url: String,
}

impl ManagerClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn create_volume(&self, req: &CreateVolumeRequest) -> Result<Volume, ClientError> {
        self.request(Method::POST, "/api/v1/volumes", Some(req)).await
    }

    pub async fn get_volume(&self, id: &str) -> Result<Volume, ClientError> {
        self.request(Method::GET, &format!("/api/v1/volumes/{id}"), None::<&()>)
            .await
    }

    pub async fn list_volumes(&self) -> Result<Vec<Volume>, ClientError> {
        let list: VolumeList = self
            .request(Method::GET, "/api/v1/volumes", None::<&()>)
            .await?;
        Ok(list.volumes)
    }

    pub async fn delete_volume(&self, id: &str) -> Result<(), ClientError> {
        let _: MessageResponse = self
            .request(Method::DELETE, &format!("/api/v1/volumes/{id}"), None::<&()>)
            .await?;
        Ok(())
    }

    pub async fn stage_volume(
        &self,
        id: &str,
        req: &StageVolumeRequest,
    ) -> Result<Volume, ClientError> {
        self.request(Method::POST, &format!("/api/v1/volumes/{id}/stage"), Some(req))
            .await
    }

    pub async fn unstage_volume(
        &self,
        id: &str,
        req: &UnstageVolumeRequest,
    ) -> Result<(), ClientError> {
        let _: MessageResponse = self
            .request(Method::DELETE, &format!("/api/v1/volumes/{id}/stage"), Some(req))
            .await?;
        Ok(())
    }

    pub async fn publish_volume(
        &self,
        id: &str,
        req: &PublishVolumeRequest,
    ) -> Result<Volume, ClientError> {
        self.request(Method::POST, &format!("/api/v1/volumes/{id}/publish"), Some(req))
            .await
    }

    pub async fn unpublish_volume(
        &self,
        id: &str,
        req: &UnpublishVolumeRequest,
    ) -> Result<(), ClientError> {
        let _: MessageResponse = self
            .request(
                Method::DELETE,
                &format!("/api/v1/volumes/{id}/publish"),
                Some(req),
            )
            .await?;
        Ok(())
    }

    pub async fn list_backends(&self) -> Result<Vec<BackendInfo>, ClientError> {
        let list: BackendList = self
            .request(Method::GET, "/api/v1/backends", None::<&()>)
            .await?;
        Ok(list.backends)
    }

    /// `true` when the manager answers `/health` with a success status.
    pub async fn health(&self) -> Result<bool, ClientError> {
        let resp = self
            .http
            .get(format!("{}/health", self.base_url))
            .send()
            .await?;
        Ok(resp.status().is_success())
    }

    async fn request<B, T>(&self, method: Method, path: &str, body: Option<&B>) -> Result<T, ClientError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}{path}", self.base_url);
        debug!(%method, %url, "manager request");

        let mut req = self.http.request(method, &url);
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().await?;
        let status = resp.status();
        let bytes = resp.bytes().await?;

        if !status.is_success() {
            return Err(match serde_json::from_slice::<ErrorBody>(&bytes) {
                Ok(body) => ClientError::Api {
                    status,
                    code: body.code,
                    message: body.message,
                },
                Err(_) => ClientError::Api {
                    status,
                    code: ErrorCode::Unknown,
                    message: String::from_utf8_lossy(&bytes).into_owned(),
                },
            });
        }
        serde_json::from_slice(&bytes).map_err(|e| ClientError::Decode(e.to_string()))
    }
}
