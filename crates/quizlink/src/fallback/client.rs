// reqwest implementation of the fallback API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::fallback::{FallbackApi, FallbackError};
use crate::protocol::{
    AnswerResultData, Heartbeat, MatchId, QuestionId, ResponseEnvelope, RoomStateWire, ScoreItem,
    SubmitAnswer,
};

/// HTTP client for `{base_url}/battles/{matchId}/...`.
pub struct HttpFallback {
    http: reqwest::Client,
    base_url: String,
    bearer_token: Option<String>,
}

impl HttpFallback {
    pub fn new(
        base_url: &str,
        bearer_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, FallbackError> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            bearer_token,
        })
    }

    fn url(&self, match_id: MatchId, tail: &str) -> String {
        format!("{}/battles/{}/{}", self.base_url, match_id, tail)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.bearer_token {
            Some(token) => request.header(AUTHORIZATION, format!("Bearer {token}")),
            None => request,
        }
    }

    async fn get<T: DeserializeOwned>(&self, url: String) -> Result<T, FallbackError> {
        debug!("GET {}", url);
        let response = self.authorize(self.http.get(&url)).send().await?;
        unwrap_envelope::<T>(response)
            .await?
            .ok_or(FallbackError::MissingData)
    }

    async fn post<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        url: String,
        body: &B,
    ) -> Result<Option<T>, FallbackError> {
        debug!("POST {}", url);
        let response = self.authorize(self.http.post(&url).json(body)).send().await?;
        unwrap_envelope(response).await
    }
}

/// Check the status and the `{success, message, data}` envelope.
async fn unwrap_envelope<T: DeserializeOwned>(
    response: Response,
) -> Result<Option<T>, FallbackError> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(FallbackError::Status {
            status: status.as_u16(),
            body,
        });
    }
    if body.trim().is_empty() {
        return Ok(None);
    }
    let envelope: ResponseEnvelope<T> = serde_json::from_str(&body)?;
    if !envelope.success {
        return Err(FallbackError::Rejected(
            envelope.message.unwrap_or_else(|| "no reason given".to_string()),
        ));
    }
    Ok(envelope.data)
}

#[async_trait]
impl FallbackApi for HttpFallback {
    async fn get_room_state(&self, match_id: MatchId) -> Result<RoomStateWire, FallbackError> {
        self.get(self.url(match_id, "state")).await
    }

    async fn get_scoreboard(&self, match_id: MatchId) -> Result<Vec<ScoreItem>, FallbackError> {
        self.get(self.url(match_id, "scoreboard")).await
    }

    async fn get_question_detail(
        &self,
        match_id: MatchId,
        question_id: QuestionId,
    ) -> Result<Value, FallbackError> {
        self.get(self.url(match_id, &format!("questions/{question_id}")))
            .await
    }

    async fn post_answer(
        &self,
        answer: &SubmitAnswer,
    ) -> Result<Option<AnswerResultData>, FallbackError> {
        self.post(self.url(answer.match_id, "answers"), answer).await
    }

    async fn post_heartbeat(&self, match_id: MatchId) -> Result<(), FallbackError> {
        self.post::<_, Value>(self.url(match_id, "heartbeat"), &Heartbeat { match_id })
            .await
            .map(|_| ())
    }
}
