//! Remote sync service
//!
//! Request/response side of the server contract: authoritative snapshots,
//! mutation submission and conflict resolution. The push channel lives in
//! `connection`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::error::{SyncError, SyncResult};
use super::message::{
    ResolveRequest, ResolveResponse, SnapshotResponse, SubmitOutcome, SubmitRequest,
    SubmitResponse,
};
use crate::models::{EntityType, SyncMode};

/// Server endpoints used by the engine
#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Fetch the authoritative snapshot for an account
    async fn fetch_snapshot(&self, account_id: &str, mode: SyncMode)
        -> SyncResult<SnapshotResponse>;

    /// Deliver one queued mutation
    async fn submit(
        &self,
        entity_type: EntityType,
        request: &SubmitRequest,
    ) -> SyncResult<SubmitOutcome>;

    /// Settle a conflict on the server
    async fn resolve(
        &self,
        conflict_id: &str,
        request: &ResolveRequest,
    ) -> SyncResult<ResolveResponse>;
}

/// `RemoteService` over HTTP
pub struct HttpRemote {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpRemote {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("mtrace/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

#[async_trait]
impl RemoteService for HttpRemote {
    async fn fetch_snapshot(
        &self,
        account_id: &str,
        mode: SyncMode,
    ) -> SyncResult<SnapshotResponse> {
        let url = self.url(&format!("{}/{}", mode.path(), account_id));
        debug!(%url, "Fetching snapshot");

        let response = self.authorized(self.client.get(&url)).send().await?;
        let response = check_status(response).await?;
        decode(response).await
    }

    async fn submit(
        &self,
        entity_type: EntityType,
        request: &SubmitRequest,
    ) -> SyncResult<SubmitOutcome> {
        let url = self.url(&format!("sync/{}", entity_type.as_str()));
        let response = self
            .authorized(self.client.post(&url).json(request))
            .send()
            .await?;

        if response.status() == StatusCode::CONFLICT {
            let body: SubmitResponse = decode(response).await?;
            return match body.conflict {
                Some(info) => Ok(SubmitOutcome::Conflict(info)),
                None => Err(SyncError::Protocol(
                    "conflict response without conflict details".to_string(),
                )),
            };
        }

        let response = check_status(response).await?;
        let body: SubmitResponse = decode(response).await?;
        interpret_submit(body)
    }

    async fn resolve(
        &self,
        conflict_id: &str,
        request: &ResolveRequest,
    ) -> SyncResult<ResolveResponse> {
        let url = self.url(&format!("resolve/{}", conflict_id));
        let response = self
            .authorized(self.client.post(&url).json(request))
            .send()
            .await?;

        let response = check_status(response).await?;
        let body: ResolveResponse = decode(response).await?;
        if body.success {
            Ok(body)
        } else {
            Err(SyncError::ServerRejected(body.message))
        }
    }
}

/// Map a submit body onto an outcome
fn interpret_submit(body: SubmitResponse) -> SyncResult<SubmitOutcome> {
    if let Some(info) = body.conflict {
        return Ok(SubmitOutcome::Conflict(info));
    }
    if body.success {
        Ok(SubmitOutcome::Accepted)
    } else {
        Err(SyncError::ServerRejected(
            body.error.unwrap_or_else(|| "mutation rejected".to_string()),
        ))
    }
}

/// Classify non-success statuses
pub(crate) async fn check_status(response: Response) -> SyncResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, body))
}

fn classify_status(status: StatusCode, body: String) -> SyncError {
    let detail = if body.is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, body)
    };

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SyncError::AuthenticationFailed(detail),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => SyncError::transport(detail),
        s if s.is_client_error() => SyncError::ServerRejected(detail),
        _ => SyncError::transport(detail),
    }
}

pub(crate) async fn decode<T: DeserializeOwned>(response: Response) -> SyncResult<T> {
    let text = response.text().await?;
    serde_json::from_str(&text)
        .map_err(|e| SyncError::Protocol(format!("invalid response body: {}", e)))
}
