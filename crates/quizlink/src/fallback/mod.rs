// Request/response fallback to the battle server's HTTP API.
//
// Poll-mode sessions use it as their only feed; push-mode sessions use it
// when the push channel cannot take an answer. Calls run as spawned tasks
// and report back through an mpsc channel, tagged with the session
// generation that issued them.

pub mod client;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::protocol::{
    AnswerResultData, MatchId, QuestionId, RoomStateWire, ScoreItem, SubmitAnswer,
};

pub use client::HttpFallback;

#[derive(Debug, Error)]
pub enum FallbackError {
    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("server rejected request: {0}")]
    Rejected(String),
    #[error("response had no data")]
    MissingData,
    #[error("invalid response body: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("fallback API not configured")]
    Disabled,
}

/// The pull operations of the battle server.
#[async_trait]
pub trait FallbackApi: Send + Sync {
    async fn get_room_state(&self, match_id: MatchId) -> Result<RoomStateWire, FallbackError>;
    async fn get_scoreboard(&self, match_id: MatchId) -> Result<Vec<ScoreItem>, FallbackError>;
    async fn get_question_detail(
        &self,
        match_id: MatchId,
        question_id: QuestionId,
    ) -> Result<Value, FallbackError>;
    async fn post_answer(
        &self,
        answer: &SubmitAnswer,
    ) -> Result<Option<AnswerResultData>, FallbackError>;
    async fn post_heartbeat(&self, match_id: MatchId) -> Result<(), FallbackError>;
}

/// Result of a spawned fallback call.
#[derive(Debug)]
pub enum FallbackEvent {
    RoomState {
        generation: u64,
        match_id: MatchId,
        result: Result<RoomStateWire, FallbackError>,
    },
    Scoreboard {
        generation: u64,
        /// Session scoreboard version when the fetch went out.
        version: u64,
        result: Result<Vec<ScoreItem>, FallbackError>,
    },
    QuestionDetail {
        generation: u64,
        question_id: QuestionId,
        result: Result<Value, FallbackError>,
    },
    AnswerPosted {
        generation: u64,
        question_id: QuestionId,
        auto_submitted: bool,
        result: Result<Option<AnswerResultData>, FallbackError>,
    },
    HeartbeatPosted {
        generation: u64,
        result: Result<(), FallbackError>,
    },
}

impl FallbackEvent {
    pub fn generation(&self) -> u64 {
        match self {
            FallbackEvent::RoomState { generation, .. }
            | FallbackEvent::Scoreboard { generation, .. }
            | FallbackEvent::QuestionDetail { generation, .. }
            | FallbackEvent::AnswerPosted { generation, .. }
            | FallbackEvent::HeartbeatPosted { generation, .. } => *generation,
        }
    }
}

/// Spawns fallback calls and forwards their results to the event loop.
#[derive(Clone)]
pub struct FallbackDispatcher {
    api: Arc<dyn FallbackApi>,
    tx: mpsc::Sender<FallbackEvent>,
}

impl FallbackDispatcher {
    pub fn new(api: Arc<dyn FallbackApi>, tx: mpsc::Sender<FallbackEvent>) -> Self {
        Self { api, tx }
    }

    fn spawn_call<F>(&self, call: F)
    where
        F: Future<Output = FallbackEvent> + Send + 'static,
    {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let event = call.await;
            if tx.send(event).await.is_err() {
                debug!("fallback result dropped: event loop gone");
            }
        });
    }

    pub fn room_state(&self, generation: u64, match_id: MatchId) {
        let api = self.api.clone();
        self.spawn_call(async move {
            FallbackEvent::RoomState {
                generation,
                match_id,
                result: api.get_room_state(match_id).await,
            }
        });
    }

    pub fn scoreboard(&self, generation: u64, version: u64, match_id: MatchId) {
        let api = self.api.clone();
        self.spawn_call(async move {
            FallbackEvent::Scoreboard {
                generation,
                version,
                result: api.get_scoreboard(match_id).await,
            }
        });
    }

    pub fn question_detail(&self, generation: u64, match_id: MatchId, question_id: QuestionId) {
        let api = self.api.clone();
        self.spawn_call(async move {
            FallbackEvent::QuestionDetail {
                generation,
                question_id,
                result: api.get_question_detail(match_id, question_id).await,
            }
        });
    }

    pub fn answer(&self, generation: u64, answer: SubmitAnswer) {
        let api = self.api.clone();
        self.spawn_call(async move {
            let result = api.post_answer(&answer).await;
            FallbackEvent::AnswerPosted {
                generation,
                question_id: answer.question_id,
                auto_submitted: answer.auto_submitted,
                result,
            }
        });
    }

    pub fn heartbeat(&self, generation: u64, match_id: MatchId) {
        let api = self.api.clone();
        self.spawn_call(async move {
            FallbackEvent::HeartbeatPosted {
                generation,
                result: api.post_heartbeat(match_id).await,
            }
        });
    }
}

/// Stand-in used when no HTTP base URL is configured. Every call fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledFallback;

#[async_trait]
impl FallbackApi for DisabledFallback {
    async fn get_room_state(&self, _: MatchId) -> Result<RoomStateWire, FallbackError> {
        Err(FallbackError::Disabled)
    }

    async fn get_scoreboard(&self, _: MatchId) -> Result<Vec<ScoreItem>, FallbackError> {
        Err(FallbackError::Disabled)
    }

    async fn get_question_detail(&self, _: MatchId, _: QuestionId) -> Result<Value, FallbackError> {
        Err(FallbackError::Disabled)
    }

    async fn post_answer(
        &self,
        _: &SubmitAnswer,
    ) -> Result<Option<AnswerResultData>, FallbackError> {
        Err(FallbackError::Disabled)
    }

    async fn post_heartbeat(&self, _: MatchId) -> Result<(), FallbackError> {
        Err(FallbackError::Disabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dispatcher_tags_results_with_generation() {
        let (tx, mut rx) = mpsc::channel(8);
        let dispatcher = FallbackDispatcher::new(Arc::new(DisabledFallback), tx);

        dispatcher.heartbeat(3, 42);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.generation(), 3);
        assert!(matches!(
            event,
            FallbackEvent::HeartbeatPosted {
                result: Err(FallbackError::Disabled),
                ..
            }
        ));

        dispatcher.answer(
            4,
            SubmitAnswer {
                match_id: 42,
                question_id: 501,
                answer: String::new(),
                auto_submitted: true,
            },
        );
        match rx.recv().await.unwrap() {
            FallbackEvent::AnswerPosted {
                generation,
                question_id,
                auto_submitted,
                result,
            } => {
                assert_eq!(generation, 4);
                assert_eq!(question_id, 501);
                assert!(auto_submitted);
                assert!(result.is_err());
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
