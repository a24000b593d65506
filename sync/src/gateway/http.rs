//! HTTP/JSON gateway.
//!
//! Routes, relative to the base URL:
//! - `GET workspaces?south&west&north&east[&pageToken]` returns a [`Page`]
//! - `GET workspaces/{id}` returns a record, 404 when unknown
//! - `POST mutations` returns 200 `{record}`, 409 `{remote}` or 422 `{reason}`
//! - `GET saved` returns `{ids}`

use super::{GatewayError, Page, PushOutcome, RemoteGateway};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use std::time::Duration;
use workspot_engine::{BoundingBox, PendingMutation, RecordId, WorkspaceRecord};

#[derive(Deserialize)]
struct AckBody {
    #[serde(default)]
    record: Option<WorkspaceRecord>,
}

#[derive(Deserialize)]
struct ConflictBody {
    remote: WorkspaceRecord,
}

#[derive(Deserialize)]
struct RejectedBody {
    reason: String,
}

#[derive(Deserialize)]
struct SavedBody {
    ids: Vec<RecordId>,
}

/// Gateway talking to the remote workspace API over HTTP.
#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: Client,
    base_url: Url,
}

impl HttpGateway {
    /// Create a gateway for `base_url`. `timeout` bounds every request.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, GatewayError> {
        let base_url = Url::parse(base_url).map_err(|e| GatewayError::Remote {
            code: 0,
            message: format!("invalid base url {base_url}: {e}"),
        })?;
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Remote {
                code: 0,
                message: e.to_string(),
            })?;
        Ok(Self { client, base_url })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, GatewayError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| GatewayError::Remote {
                code: 0,
                message: format!("base url {} cannot have a path", self.base_url),
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

/// Connection problems and timeouts are retryable; everything else is not.
fn transport_error(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        GatewayError::NetworkUnavailable(err.to_string())
    } else {
        GatewayError::Remote {
            code: err.status().map_or(0, |s| s.as_u16()),
            message: err.to_string(),
        }
    }
}

async fn status_error(response: reqwest::Response) -> GatewayError {
    let code = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    GatewayError::Remote { code, message }
}

async fn decode<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, GatewayError> {
    let code = response.status().as_u16();
    response.json().await.map_err(|e| GatewayError::Remote {
        code,
        message: format!("malformed response: {e}"),
    })
}

#[async_trait]
impl RemoteGateway for HttpGateway {
    async fn fetch_by_bounds(
        &self,
        bounds: &BoundingBox,
        page_token: Option<&str>,
    ) -> Result<Page, GatewayError> {
        let mut query = vec![
            ("south", bounds.south.to_string()),
            ("west", bounds.west.to_string()),
            ("north", bounds.north.to_string()),
            ("east", bounds.east.to_string()),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken", token.to_string()));
        }

        let response = self
            .client
            .get(self.endpoint(&["workspaces"])?)
            .query(&query)
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        decode(response).await
    }

    async fn fetch_by_id(&self, id: &str) -> Result<Option<WorkspaceRecord>, GatewayError> {
        let response = self
            .client
            .get(self.endpoint(&["workspaces", id])?)
            .send()
            .await
            .map_err(transport_error)?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => decode(response).await.map(Some),
            _ => Err(status_error(response).await),
        }
    }

    async fn push(&self, mutation: &PendingMutation) -> Result<PushOutcome, GatewayError> {
        let response = self
            .client
            .post(self.endpoint(&["mutations"])?)
            .json(mutation)
            .send()
            .await
            .map_err(transport_error)?;
        match response.status() {
            StatusCode::CONFLICT => {
                let body: ConflictBody = decode(response).await?;
                Ok(PushOutcome::Conflict {
                    remote: body.remote,
                })
            }
            StatusCode::UNPROCESSABLE_ENTITY => {
                let body: RejectedBody = decode(response).await?;
                Ok(PushOutcome::Rejected {
                    reason: body.reason,
                })
            }
            status if status.is_success() => {
                let body: AckBody = decode(response).await?;
                Ok(PushOutcome::Ack {
                    record: body.record,
                })
            }
            _ => Err(status_error(response).await),
        }
    }

    async fn fetch_saved_ids(&self) -> Result<Vec<RecordId>, GatewayError> {
        let response = self
            .client
            .get(self.endpoint(&["saved"])?)
            .send()
            .await
            .map_err(transport_error)?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        let body: SavedBody = decode(response).await?;
        Ok(body.ids)
    }
}
