// Full-state recovery from a join-result snapshot or a poll response.

use thiserror::Error;
use tracing::warn;

use crate::battle::deadline::QuestionRound;
use crate::battle::phase::{derive_phase, MatchPhase};
use crate::battle::scoreboard::{participants_from_items, Participant};
use crate::protocol::{MatchId, PhaseTag, RoomStateWire, RoomStatus, UserId};

/// A field the snapshot should have carried but did not. Recovery continues
/// with a default for each of these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotInconsistency {
    #[error("snapshot has no room info; assuming match {0} is active")]
    MissingRoom(MatchId),
    #[error("snapshot has neither scoreboard nor participants")]
    MissingParticipants,
    #[error("snapshot room status unknown; treating as waiting")]
    UnknownStatus,
    #[error("snapshot is for match {got}, expected {expected}")]
    ForeignMatch { expected: MatchId, got: MatchId },
    #[error("snapshot question has no startedAt or remaining time")]
    MissingTiming,
}

/// Internal form of a full room state, ready to overwrite a session.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomSnapshot {
    pub match_id: MatchId,
    pub status: RoomStatus,
    pub phase: MatchPhase,
    pub phase_tag: PhaseTag,
    pub participants: Vec<Participant>,
    /// Open question, or `None` for intermission / finished.
    pub round: Option<QuestionRound>,
    /// The server reports this participant already answered the open question.
    pub answered_current: bool,
    pub self_user_id: Option<UserId>,
    pub inconsistencies: Vec<SnapshotInconsistency>,
}

impl RoomSnapshot {
    /// Convert a wire snapshot. Never fails: each gap is recorded in
    /// `inconsistencies` and filled with a best-effort default.
    pub fn recover(wire: RoomStateWire, expected_match: MatchId, now_ms: i64) -> Self {
        let mut inconsistencies = Vec::new();

        let (match_id, mut status, room_phase) = match &wire.room {
            Some(room) => (room.match_id, room.status, room.phase),
            None => {
                inconsistencies.push(SnapshotInconsistency::MissingRoom(expected_match));
                let status = if wire.current_question.is_some() {
                    RoomStatus::Active
                } else {
                    RoomStatus::Waiting
                };
                (expected_match, status, None)
            }
        };
        if match_id != expected_match {
            inconsistencies.push(SnapshotInconsistency::ForeignMatch {
                expected: expected_match,
                got: match_id,
            });
        }
        if status == RoomStatus::Unknown {
            inconsistencies.push(SnapshotInconsistency::UnknownStatus);
            status = RoomStatus::Waiting;
        }

        // The scoreboard carries the ranked order; participants is the
        // fallback for rooms that have not scored anything yet.
        let items = match (wire.scoreboard, wire.participants) {
            (Some(board), _) if !board.is_empty() => board,
            (_, Some(participants)) => participants,
            (Some(board), None) => board,
            (None, None) => {
                inconsistencies.push(SnapshotInconsistency::MissingParticipants);
                Vec::new()
            }
        };
        let participants = participants_from_items(&items);

        let phase = derive_phase(status, wire.current_question.is_some());
        let mut answered_current = false;
        let round = match (&wire.current_question, phase) {
            (Some(question), MatchPhase::QuestionPlaying) => {
                if question.started_at.is_none() && question.remaining_ms.is_none() {
                    inconsistencies.push(SnapshotInconsistency::MissingTiming);
                }
                answered_current = question.answered;
                Some(QuestionRound::from_info(question, now_ms))
            }
            _ => None,
        };

        let phase_tag = round
            .as_ref()
            .map(|r| r.phase)
            .or(room_phase)
            .unwrap_or_default();

        for issue in &inconsistencies {
            warn!(match_id, "{issue}");
        }

        Self {
            match_id,
            status,
            phase,
            phase_tag,
            participants,
            round,
            answered_current,
            self_user_id: wire.self_user_id,
            inconsistencies,
        }
    }

    /// A snapshot for some other match must not be applied.
    pub fn is_foreign(&self) -> bool {
        self.inconsistencies
            .iter()
            .any(|i| matches!(i, SnapshotInconsistency::ForeignMatch { .. }))
    }
}
