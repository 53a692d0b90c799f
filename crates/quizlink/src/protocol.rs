// Wire protocol types for the battle server and the client-facing channels
// (notices out to the presentation layer, commands in from the user).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::battle::phase::MatchPhase;
use crate::battle::scoreboard::Participant;
use crate::battle::submission::SubmitChannel;

pub type MatchId = i64;
pub type QuestionId = i64;
pub type UserId = i64;

// ---------------------------------------------------------------------------
// Destinations
// ---------------------------------------------------------------------------

/// Prefix of the per-match room broadcast topic (`/topic/battle/{matchId}`).
pub const ROOM_TOPIC_PREFIX: &str = "/topic/battle/";

pub const SEND_REQUEST_MATCH: &str = "/app/battle/match";
pub const SEND_CANCEL_MATCH: &str = "/app/battle/cancel";
pub const SEND_JOIN: &str = "/app/battle/join";
pub const SEND_ANSWER: &str = "/app/battle/answer";
pub const SEND_HEARTBEAT: &str = "/app/battle/heartbeat";

/// Room broadcast destination for a match.
pub fn room_destination(match_id: MatchId) -> String {
    format!("{ROOM_TOPIC_PREFIX}{match_id}")
}

/// Parse the match id out of a room broadcast destination.
pub fn room_match_id(destination: &str) -> Option<MatchId> {
    destination.strip_prefix(ROOM_TOPIC_PREFIX)?.parse().ok()
}

/// Kinds of personal responses. Each kind has its own queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseKind {
    MatchResult,
    JoinResult,
    AnswerResult,
    HeartbeatAck,
}

impl ResponseKind {
    pub const ALL: [ResponseKind; 4] = [
        ResponseKind::MatchResult,
        ResponseKind::JoinResult,
        ResponseKind::AnswerResult,
        ResponseKind::HeartbeatAck,
    ];

    pub fn destination(self) -> &'static str {
        match self {
            ResponseKind::MatchResult => "/user/queue/battle/match-result",
            ResponseKind::JoinResult => "/user/queue/battle/join-result",
            ResponseKind::AnswerResult => "/user/queue/battle/answer-result",
            ResponseKind::HeartbeatAck => "/user/queue/battle/heartbeat-ack",
        }
    }

    pub fn from_destination(destination: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.destination() == destination)
    }
}

// ---------------------------------------------------------------------------
// Outbound frames
// ---------------------------------------------------------------------------

/// A frame written to the push channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientFrame {
    Subscribe {
        destination: String,
    },
    Unsubscribe {
        destination: String,
    },
    Send {
        destination: String,
        payload: OutboundPayload,
    },
}

impl ClientFrame {
    pub fn subscribe(destination: impl Into<String>) -> Self {
        ClientFrame::Subscribe {
            destination: destination.into(),
        }
    }

    pub fn unsubscribe(destination: impl Into<String>) -> Self {
        ClientFrame::Unsubscribe {
            destination: destination.into(),
        }
    }

    pub fn request_match(request: MatchRequest) -> Self {
        Self::send(SEND_REQUEST_MATCH, OutboundPayload::RequestMatch(request))
    }

    pub fn cancel_match(mode: impl Into<String>) -> Self {
        Self::send(
            SEND_CANCEL_MATCH,
            OutboundPayload::CancelMatch(CancelMatch { mode: mode.into() }),
        )
    }

    pub fn join(match_id: MatchId) -> Self {
        Self::send(SEND_JOIN, OutboundPayload::Join(JoinRequest { match_id }))
    }

    pub fn answer(answer: SubmitAnswer) -> Self {
        Self::send(SEND_ANSWER, OutboundPayload::Answer(answer))
    }

    pub fn heartbeat(match_id: MatchId) -> Self {
        Self::send(
            SEND_HEARTBEAT,
            OutboundPayload::Heartbeat(Heartbeat { match_id }),
        )
    }

    fn send(destination: &str, payload: OutboundPayload) -> Self {
        ClientFrame::Send {
            destination: destination.to_string(),
            payload,
        }
    }

    /// The answer carried by an answer submission frame.
    pub fn as_answer(&self) -> Option<&SubmitAnswer> {
        match self {
            ClientFrame::Send {
                payload: OutboundPayload::Answer(answer),
                ..
            } => Some(answer),
            _ => None,
        }
    }

    /// Serialize to the JSON text carried by one WebSocket message.
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OutboundPayload {
    RequestMatch(MatchRequest),
    CancelMatch(CancelMatch),
    Join(JoinRequest),
    Answer(SubmitAnswer),
    Heartbeat(Heartbeat),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchRequest {
    pub mode: String,
    pub scope: String,
    pub exam_mode: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelMatch {
    pub mode: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub match_id: MatchId,
}

/// Answer submission, shared by the push channel and the HTTP fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitAnswer {
    pub match_id: MatchId,
    pub question_id: QuestionId,
    pub answer: String,
    pub auto_submitted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub match_id: MatchId,
}

// ---------------------------------------------------------------------------
// Inbound frames
// ---------------------------------------------------------------------------

/// A frame read from the push channel, before classification.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerFrame {
    pub destination: String,
    #[serde(default)]
    pub payload: Value,
}

fn default_true() -> bool {
    true
}

/// Envelope wrapping every personal response and every fallback reply.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope<T> {
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    pub data: Option<T>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchFound {
    pub match_id: MatchId,
    #[serde(default)]
    pub opponents: Vec<ScoreItem>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerResultData {
    #[serde(default)]
    pub question_id: Option<QuestionId>,
    #[serde(default = "default_true")]
    pub accepted: bool,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatAckData {
    #[serde(default)]
    pub server_time: Option<i64>,
}

/// Room lifecycle as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoomStatus {
    Waiting,
    #[serde(alias = "IN_PROGRESS", alias = "PLAYING")]
    Active,
    #[serde(alias = "FINISHED", alias = "ENDED")]
    Completed,
    #[default]
    #[serde(other)]
    Unknown,
}

/// Sub-stage of a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PhaseTag {
    #[default]
    Main,
    Revival,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub match_id: MatchId,
    #[serde(default)]
    pub status: RoomStatus,
    #[serde(default)]
    pub phase: Option<PhaseTag>,
}

/// Question as it appears in snapshots, poll responses and
/// `QUESTION_STARTED` events.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionInfo {
    pub question_id: QuestionId,
    #[serde(default)]
    pub round_no: u32,
    #[serde(default)]
    pub phase: PhaseTag,
    #[serde(default)]
    pub order_no: u32,
    pub time_limit_sec: u32,
    /// Epoch milliseconds at which the question opened.
    #[serde(default)]
    pub started_at: Option<i64>,
    /// Remaining milliseconds, when the server reports it directly.
    #[serde(default)]
    pub remaining_ms: Option<i64>,
    /// Set in snapshots when this participant already answered.
    #[serde(default)]
    pub answered: bool,
    #[serde(default)]
    pub content: Option<Value>,
}

/// One scoreboard / participant entry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreItem {
    pub user_id: UserId,
    #[serde(default)]
    pub display_name: String,
    #[serde(default = "default_true")]
    pub alive: bool,
    #[serde(default)]
    pub revived: bool,
    #[serde(default)]
    pub score: i64,
    #[serde(default)]
    pub correct_count: u32,
    #[serde(default)]
    pub total_count: u32,
    #[serde(default)]
    pub rank: u32,
}

/// Full room state: the join-result payload and the poll response body.
///
/// Every field is optional on the wire; recovery fills gaps with defaults.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStateWire {
    #[serde(default)]
    pub room: Option<RoomInfo>,
    #[serde(default)]
    pub participants: Option<Vec<ScoreItem>>,
    #[serde(default)]
    pub current_question: Option<QuestionInfo>,
    #[serde(default)]
    pub scoreboard: Option<Vec<ScoreItem>>,
    #[serde(default)]
    pub self_user_id: Option<UserId>,
}

// ---------------------------------------------------------------------------
// Room broadcast events
// ---------------------------------------------------------------------------

/// Events broadcast on a match's room topic, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoomEvent {
    PlayerJoined(PlayerJoined),
    MatchStarted(MatchStarted),
    QuestionStarted(QuestionInfo),
    AnswerSubmitted(AnswerSubmitted),
    ScoreboardUpdated(ScoreboardUpdated),
    RoundCompleted(RoundCompleted),
    IntermissionStarted(IntermissionStarted),
    MatchFinished(MatchFinishedEvent),
}

impl RoomEvent {
    /// Discriminator values accepted on the room topic.
    pub const KINDS: [&'static str; 8] = [
        "PLAYER_JOINED",
        "MATCH_STARTED",
        "QUESTION_STARTED",
        "ANSWER_SUBMITTED",
        "SCOREBOARD_UPDATED",
        "ROUND_COMPLETED",
        "INTERMISSION_STARTED",
        "MATCH_FINISHED",
    ];
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerJoined {
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub participants: Option<Vec<ScoreItem>>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchStarted {
    #[serde(default)]
    pub started_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerSubmitted {
    #[serde(default)]
    pub user_id: Option<UserId>,
    #[serde(default)]
    pub question_id: Option<QuestionId>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreboardUpdated {
    #[serde(default)]
    pub items: Vec<ScoreItem>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundCompleted {
    #[serde(default)]
    pub question_id: Option<QuestionId>,
    #[serde(default)]
    pub items: Option<Vec<ScoreItem>>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntermissionStarted {
    #[serde(default)]
    pub next_phase: Option<PhaseTag>,
    #[serde(default)]
    pub duration_sec: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchFinishedEvent {
    #[serde(default)]
    pub winner_id: Option<UserId>,
    #[serde(default)]
    pub items: Option<Vec<ScoreItem>>,
}

// ---------------------------------------------------------------------------
// Client-side channels
// ---------------------------------------------------------------------------

/// How a session learns about match progress. Fixed for the session's life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Server-pushed events over the WebSocket.
    Push,
    /// Periodic full-state polling over HTTP.
    Poll,
}

/// Connection status of the push channel as shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Commands from the user (or the embedding application).
#[derive(Debug, Clone, PartialEq)]
pub enum UserCommand {
    RequestMatch,
    CancelMatch,
    Join(MatchId),
    /// Submit an answer; `question_id` defaults to the active question.
    Submit {
        question_id: Option<QuestionId>,
        answer: String,
    },
    StopHeartbeat,
    Disconnect,
    Quit,
}

/// Updates pushed to the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    ConnectionStatus(ConnectionStatus),
    MatchFound {
        match_id: MatchId,
    },
    MatchmakingFailed {
        message: String,
    },
    Joined {
        match_id: MatchId,
    },
    JoinFailed {
        match_id: MatchId,
        message: String,
    },
    PhaseChanged(MatchPhase),
    QuestionStarted {
        question_id: QuestionId,
        round_no: u32,
        phase: PhaseTag,
        time_limit_sec: u32,
    },
    QuestionDetail {
        question_id: QuestionId,
        content: Value,
    },
    Remaining {
        question_id: QuestionId,
        seconds: u32,
    },
    Scoreboard(Vec<Participant>),
    Eliminated,
    Revived,
    NotEligibleToRevive,
    OpponentDeparted {
        winner_id: UserId,
    },
    SubmissionAccepted {
        question_id: QuestionId,
        auto_submitted: bool,
        channel: SubmitChannel,
    },
    SubmissionFailed {
        question_id: QuestionId,
        reason: String,
    },
    AnswerResult {
        question_id: Option<QuestionId>,
        accepted: bool,
        message: Option<String>,
    },
    MatchFinished {
        winner_id: Option<UserId>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_kind_destinations_round_trip() {
        for kind in ResponseKind::ALL {
            assert_eq!(ResponseKind::from_destination(kind.destination()), Some(kind));
        }
        assert_eq!(ResponseKind::from_destination("/user/queue/battle/other"), None);
    }

    #[test]
    fn room_destination_parses_match_id() {
        assert_eq!(room_destination(42), "/topic/battle/42");
        assert_eq!(room_match_id("/topic/battle/42"), Some(42));
        assert_eq!(room_match_id("/topic/battle/abc"), None);
        assert_eq!(room_match_id("/topic/other/42"), None);
    }

    #[test]
    fn answer_frame_serializes_with_command_tag() {
        let frame = ClientFrame::answer(SubmitAnswer {
            match_id: 42,
            question_id: 501,
            answer: "B".into(),
            auto_submitted: false,
        });
        let value: Value = serde_json::from_str(&frame.to_text().unwrap()).unwrap();
        assert_eq!(value["command"], "SEND");
        assert_eq!(value["destination"], SEND_ANSWER);
        assert_eq!(value["payload"]["matchId"], 42);
        assert_eq!(value["payload"]["questionId"], 501);
        assert_eq!(value["payload"]["answer"], "B");
        assert_eq!(value["payload"]["autoSubmitted"], false);
    }

    #[test]
    fn subscribe_frame_shape() {
        let value = serde_json::to_value(ClientFrame::subscribe("/topic/battle/7")).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"command": "SUBSCRIBE", "destination": "/topic/battle/7"})
        );
    }

    #[test]
    fn question_started_event_parses() {
        let json = r#"{"type":"QUESTION_STARTED","questionId":501,"roundNo":2,
            "phase":"REVIVAL","orderNo":3,"timeLimitSec":20,"startedAt":1000}"#;
        let event: RoomEvent = serde_json::from_str(json).unwrap();
        match event {
            RoomEvent::QuestionStarted(q) => {
                assert_eq!(q.question_id, 501);
                assert_eq!(q.phase, PhaseTag::Revival);
                assert_eq!(q.time_limit_sec, 20);
                assert_eq!(q.started_at, Some(1000));
                assert!(!q.answered);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn unit_like_events_tolerate_extra_fields() {
        let event: RoomEvent =
            serde_json::from_str(r#"{"type":"MATCH_STARTED","extra":true}"#).unwrap();
        assert_eq!(event, RoomEvent::MatchStarted(MatchStarted::default()));
    }

    #[test]
    fn score_item_defaults() {
        let item: ScoreItem = serde_json::from_str(r#"{"userId":9}"#).unwrap();
        assert!(item.alive);
        assert!(!item.revived);
        assert_eq!(item.score, 0);
    }

    #[test]
    fn room_status_aliases_and_unknown() {
        let s: RoomStatus = serde_json::from_str(r#""IN_PROGRESS""#).unwrap();
        assert_eq!(s, RoomStatus::Active);
        let s: RoomStatus = serde_json::from_str(r#""FINISHED""#).unwrap();
        assert_eq!(s, RoomStatus::Completed);
        let s: RoomStatus = serde_json::from_str(r#""SOMETHING_NEW""#).unwrap();
        assert_eq!(s, RoomStatus::Unknown);
    }

    #[test]
    fn envelope_defaults_to_success() {
        let env: ResponseEnvelope<HeartbeatAckData> = serde_json::from_str("{}").unwrap();
        assert!(env.success);
        assert!(env.data.is_none());
    }
}
