use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use exam_core::model::{AnswerValue, AttemptId, AttemptStatus, QuestionId, UserId};

use super::{AttemptApi, PersistRequest, SessionRecord, SubmitResult};
use crate::config::ApiConfig;
use crate::error::{ApiError, ConfigError};

/// `reqwest`-backed client for the attempt backend.
#[derive(Clone)]
pub struct HttpAttemptApi {
    client: Client,
    config: ApiConfig,
}

impl HttpAttemptApi {
    /// # Errors
    ///
    /// Returns `ConfigError::Http` if the HTTP client cannot be built.
    pub fn new(config: ApiConfig) -> Result<Self, ConfigError> {
        let client = Client::builder().timeout(config.timeout()).build()?;
        Ok(Self { client, config })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self.client.request(method, self.config.endpoint(path));
        match self.config.token() {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(
        &self,
        builder: RequestBuilder,
        attempt_id: Option<AttemptId>,
    ) -> Result<Response, ApiError> {
        let response = builder.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        tracing::debug!(%status, ?attempt_id, "attempt api returned an error status");
        match (status, attempt_id) {
            (StatusCode::NOT_FOUND, Some(id)) => Err(ApiError::NotFound(id)),
            (StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY, _) => {
                let body = response.text().await.unwrap_or_default();
                Err(ApiError::Conflict(body))
            }
            (StatusCode::SERVICE_UNAVAILABLE, _) => Err(ApiError::Unavailable),
            _ => Err(ApiError::HttpStatus(status)),
        }
    }

    async fn transition(
        &self,
        attempt_id: AttemptId,
        action: &str,
    ) -> Result<AttemptStatus, ApiError> {
        let path = format!("attempts/{attempt_id}/{action}");
        let response = self
            .send(self.request(Method::POST, &path), Some(attempt_id))
            .await?;
        let body: StatusResponse = response.json().await?;
        Ok(body.status)
    }
}

#[async_trait]
impl AttemptApi for HttpAttemptApi {
    async fn list_sessions(
        &self,
        user_id: UserId,
        include_expired: bool,
    ) -> Result<Vec<SessionRecord>, ApiError> {
        let path = format!("users/{user_id}/attempts");
        let builder = self
            .request(Method::GET, &path)
            .query(&[("includeExpired", include_expired)]);
        let response = self.send(builder, None).await?;
        Ok(response.json().await?)
    }

    async fn fetch_session(&self, attempt_id: AttemptId) -> Result<SessionRecord, ApiError> {
        let path = format!("attempts/{attempt_id}");
        let response = self
            .send(self.request(Method::GET, &path), Some(attempt_id))
            .await?;
        Ok(response.json().await?)
    }

    async fn persist(&self, request: &PersistRequest) -> Result<(), ApiError> {
        let path = format!("attempts/{}/state", request.attempt_id);
        self.send(
            self.request(Method::PUT, &path).json(request),
            Some(request.attempt_id),
        )
        .await?;
        Ok(())
    }

    async fn resume(&self, attempt_id: AttemptId) -> Result<AttemptStatus, ApiError> {
        self.transition(attempt_id, "resume").await
    }

    async fn pause(&self, attempt_id: AttemptId) -> Result<AttemptStatus, ApiError> {
        self.transition(attempt_id, "pause").await
    }

    async fn abandon(&self, attempt_id: AttemptId) -> Result<(), ApiError> {
        let path = format!("attempts/{attempt_id}/abandon");
        self.send(self.request(Method::POST, &path), Some(attempt_id))
            .await?;
        Ok(())
    }

    async fn submit(
        &self,
        attempt_id: AttemptId,
        answers: &BTreeMap<QuestionId, AnswerValue>,
    ) -> Result<SubmitResult, ApiError> {
        let path = format!("attempts/{attempt_id}/submit");
        let payload = SubmitRequest { answers };
        let response = self
            .send(self.request(Method::POST, &path).json(&payload), Some(attempt_id))
            .await?;
        Ok(response.json().await?)
    }
}

#[derive(Debug, Serialize)]
struct SubmitRequest<'a> {
    answers: &'a BTreeMap<QuestionId, AnswerValue>,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: AttemptStatus,
}
