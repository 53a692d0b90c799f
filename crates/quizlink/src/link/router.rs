// Classification and dispatch of inbound push-channel frames.

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::{trace, warn};

use crate::protocol::{
    room_match_id, AnswerResultData, HeartbeatAckData, MatchFound, MatchId, ResponseEnvelope,
    ResponseKind, RoomEvent, RoomStateWire, ServerFrame, ROOM_TOPIC_PREFIX,
};

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame is not valid JSON: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("no handler for destination {0}")]
    UnknownDestination(String),
    #[error("room event has no type discriminator")]
    MissingKind,
    #[error("unknown room event type {0}")]
    UnknownKind(String),
    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A personal response, already typed by its queue.
#[derive(Debug, Clone, PartialEq)]
pub enum PersonalResponse {
    MatchResult(ResponseEnvelope<MatchFound>),
    JoinResult(ResponseEnvelope<RoomStateWire>),
    AnswerResult(ResponseEnvelope<AnswerResultData>),
    HeartbeatAck(ResponseEnvelope<HeartbeatAckData>),
}

/// One classified inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Personal(PersonalResponse),
    Room { match_id: MatchId, event: RoomEvent },
}

/// Receives dispatched frames. Exactly one method is called per valid frame.
pub trait InboundHandler {
    fn on_match_result(&mut self, envelope: ResponseEnvelope<MatchFound>);
    fn on_join_result(&mut self, envelope: ResponseEnvelope<RoomStateWire>);
    fn on_answer_result(&mut self, envelope: ResponseEnvelope<AnswerResultData>);
    fn on_heartbeat_ack(&mut self, envelope: ResponseEnvelope<HeartbeatAckData>);
    fn on_room_event(&mut self, match_id: MatchId, event: RoomEvent);
}

fn typed<T: DeserializeOwned>(kind: &str, payload: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(payload).map_err(|source| ProtocolError::InvalidPayload {
        kind: kind.to_string(),
        source,
    })
}

/// Parse and classify one raw frame.
pub fn parse(raw: &str) -> Result<Inbound, ProtocolError> {
    let frame: ServerFrame = serde_json::from_str(raw).map_err(ProtocolError::Malformed)?;

    if let Some(kind) = ResponseKind::from_destination(&frame.destination) {
        let name = frame.destination.as_str();
        let response = match kind {
            ResponseKind::MatchResult => PersonalResponse::MatchResult(typed(name, frame.payload)?),
            ResponseKind::JoinResult => PersonalResponse::JoinResult(typed(name, frame.payload)?),
            ResponseKind::AnswerResult => {
                PersonalResponse::AnswerResult(typed(name, frame.payload)?)
            }
            ResponseKind::HeartbeatAck => {
                PersonalResponse::HeartbeatAck(typed(name, frame.payload)?)
            }
        };
        return Ok(Inbound::Personal(response));
    }

    if frame.destination.starts_with(ROOM_TOPIC_PREFIX) {
        let match_id = room_match_id(&frame.destination)
            .ok_or_else(|| ProtocolError::UnknownDestination(frame.destination.clone()))?;
        let kind = frame
            .payload
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingKind)?
            .to_string();
        if !RoomEvent::KINDS.contains(&kind.as_str()) {
            return Err(ProtocolError::UnknownKind(kind));
        }
        let event = typed(&kind, frame.payload)?;
        return Ok(Inbound::Room { match_id, event });
    }

    Err(ProtocolError::UnknownDestination(frame.destination))
}

/// Routes frames to an [`InboundHandler`], filtering room events to the
/// match currently followed.
#[derive(Debug, Clone, Copy, Default)]
pub struct MessageRouter {
    room: Option<MatchId>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn room(&self) -> Option<MatchId> {
        self.room
    }

    pub fn follow_room(&mut self, match_id: MatchId) {
        self.room = Some(match_id);
    }

    pub fn leave_room(&mut self) {
        self.room = None;
    }

    /// Dispatch one raw frame. Malformed, unknown and foreign-room frames are
    /// logged and dropped. Returns whether a handler was called.
    pub fn dispatch<H: InboundHandler + ?Sized>(&self, raw: &str, handler: &mut H) -> bool {
        let inbound = match parse(raw) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!("Dropping inbound frame: {}", e);
                trace!("dropped frame: {}", raw);
                return false;
            }
        };

        match inbound {
            Inbound::Personal(PersonalResponse::MatchResult(env)) => handler.on_match_result(env),
            Inbound::Personal(PersonalResponse::JoinResult(env)) => handler.on_join_result(env),
            Inbound::Personal(PersonalResponse::AnswerResult(env)) => {
                handler.on_answer_result(env)
            }
            Inbound::Personal(PersonalResponse::HeartbeatAck(env)) => {
                handler.on_heartbeat_ack(env)
            }
            Inbound::Room { match_id, event } => {
                if self.room != Some(match_id) {
                    warn!(
                        "Dropping room event for match {} (following {:?})",
                        match_id, self.room
                    );
                    return false;
                }
                handler.on_room_event(match_id, event);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MatchFinishedEvent;

    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
        room_events: Vec<RoomEvent>,
    }

    impl InboundHandler for Recorder {
        fn on_match_result(&mut self, _: ResponseEnvelope<MatchFound>) {
            self.calls.push("match".into());
        }
        fn on_join_result(&mut self, _: ResponseEnvelope<RoomStateWire>) {
            self.calls.push("join".into());
        }
        fn on_answer_result(&mut self, _: ResponseEnvelope<AnswerResultData>) {
            self.calls.push("answer".into());
        }
        fn on_heartbeat_ack(&mut self, _: ResponseEnvelope<HeartbeatAckData>) {
            self.calls.push("heartbeat".into());
        }
        fn on_room_event(&mut self, _: MatchId, event: RoomEvent) {
            self.calls.push("room".into());
            self.room_events.push(event);
        }
    }

    #[test]
    fn personal_kind_comes_from_destination() {
        let raw = r#"{"destination":"/user/queue/battle/match-result",
                      "payload":{"success":true,"data":{"matchId":42}}}"#;
        match parse(raw).unwrap() {
            Inbound::Personal(PersonalResponse::MatchResult(env)) => {
                assert_eq!(env.data.unwrap().match_id, 42);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn room_kind_comes_from_type_field() {
        let raw = r#"{"destination":"/topic/battle/42",
                      "payload":{"type":"MATCH_FINISHED","winnerId":7}}"#;
        assert_eq!(
            parse(raw).unwrap(),
            Inbound::Room {
                match_id: 42,
                event: RoomEvent::MatchFinished(MatchFinishedEvent {
                    winner_id: Some(7),
                    items: None,
                }),
            }
        );
    }

    #[test]
    fn error_classes() {
        assert!(matches!(parse("not json"), Err(ProtocolError::Malformed(_))));
        assert!(matches!(
            parse(r#"{"destination":"/topic/battle/1","payload":{}}"#),
            Err(ProtocolError::MissingKind)
        ));
        assert!(matches!(
            parse(r#"{"destination":"/topic/battle/1","payload":{"type":"DANCE"}}"#),
            Err(ProtocolError::UnknownKind(k)) if k == "DANCE"
        ));
        assert!(matches!(
            parse(r#"{"destination":"/somewhere","payload":{}}"#),
            Err(ProtocolError::UnknownDestination(_))
        ));
        assert!(matches!(
            parse(r#"{"destination":"/topic/battle/1","payload":{"type":"QUESTION_STARTED"}}"#),
            Err(ProtocolError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn dispatch_calls_exactly_one_handler() {
        let mut router = MessageRouter::new();
        router.follow_room(42);
        let mut rec = Recorder::default();

        assert!(router.dispatch(
            r#"{"destination":"/user/queue/battle/heartbeat-ack","payload":{"success":true}}"#,
            &mut rec
        ));
        assert!(router.dispatch(
            r#"{"destination":"/topic/battle/42","payload":{"type":"MATCH_STARTED"}}"#,
            &mut rec
        ));
        assert_eq!(rec.calls, vec!["heartbeat", "room"]);
    }

    #[test]
    fn malformed_and_foreign_frames_are_dropped() {
        let mut router = MessageRouter::new();
        router.follow_room(42);
        let mut rec = Recorder::default();

        assert!(!router.dispatch("{", &mut rec));
        assert!(!router.dispatch(
            r#"{"destination":"/topic/battle/41","payload":{"type":"MATCH_STARTED"}}"#,
            &mut rec
        ));
        router.leave_room();
        assert!(!router.dispatch(
            r#"{"destination":"/topic/battle/42","payload":{"type":"MATCH_STARTED"}}"#,
            &mut rec
        ));
        assert!(rec.calls.is_empty());
    }
}
