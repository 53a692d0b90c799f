// Match phase state machine, fed by exactly one source per session.

use std::collections::HashSet;

use thiserror::Error;

use crate::protocol::{QuestionId, RoomStatus};

/// Phases a match moves through on the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchPhase {
    /// Joined, no question open yet (or between questions after recovery).
    Waiting,
    /// A question is open for answers.
    QuestionPlaying,
    /// The last question closed; intermission until the next one.
    QuestionFinished,
    /// Terminal. No further transitions are accepted.
    MatchFinished,
}

/// Which feed drives a session's state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseSource {
    Push,
    Poll,
}

/// Incremental events from the push feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    MatchStarted,
    QuestionStarted(QuestionId),
    /// A round completed; carries the question id when the server sent one.
    QuestionFinished(Option<QuestionId>),
    Intermission,
    MatchFinished,
}

/// Why an update was not applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PhaseRejection {
    #[error("update from {got:?} source rejected: session is driven by {expected:?}")]
    WrongSource {
        expected: PhaseSource,
        got: PhaseSource,
    },
    #[error("match already finished")]
    Terminal,
    #[error("question {0} already finished in this match")]
    StaleQuestion(QuestionId),
}

/// Phase implied by a full room state (snapshot or poll response).
pub fn derive_phase(status: RoomStatus, question_present: bool) -> MatchPhase {
    match (status, question_present) {
        (RoomStatus::Completed, _) => MatchPhase::MatchFinished,
        (RoomStatus::Active, true) => MatchPhase::QuestionPlaying,
        (RoomStatus::Active, false) => MatchPhase::Waiting,
        _ => MatchPhase::Waiting,
    }
}

/// Tracks the phase of one match.
///
/// The source is chosen at construction and every update names the source it
/// came from, so a push-driven session can never be moved by a poll result
/// (or the reverse). `MatchFinished` is absorbing.
#[derive(Debug, Clone)]
pub struct MatchStateMachine {
    source: PhaseSource,
    phase: MatchPhase,
    active_question: Option<QuestionId>,
    finished_questions: HashSet<QuestionId>,
    version: usize,
}

impl MatchStateMachine {
    pub fn new(source: PhaseSource) -> Self {
        Self {
            source,
            phase: MatchPhase::Waiting,
            active_question: None,
            finished_questions: HashSet::new(),
            version: 0,
        }
    }

    pub fn source(&self) -> PhaseSource {
        self.source
    }

    pub fn phase(&self) -> MatchPhase {
        self.phase
    }

    pub fn active_question(&self) -> Option<QuestionId> {
        self.active_question
    }

    pub fn is_terminal(&self) -> bool {
        self.phase == MatchPhase::MatchFinished
    }

    /// Incremented on every applied change.
    pub fn version(&self) -> usize {
        self.version
    }

    fn check(&self, source: PhaseSource) -> Result<(), PhaseRejection> {
        if source != self.source {
            return Err(PhaseRejection::WrongSource {
                expected: self.source,
                got: source,
            });
        }
        if self.is_terminal() {
            return Err(PhaseRejection::Terminal);
        }
        Ok(())
    }

    /// Apply one incremental event. Returns `Ok(true)` when the phase or the
    /// active question changed and `Ok(false)` for an idempotent repeat.
    pub fn apply(&mut self, source: PhaseSource, event: PhaseEvent) -> Result<bool, PhaseRejection> {
        self.check(source)?;

        let changed = match event {
            PhaseEvent::MatchStarted => false,
            PhaseEvent::QuestionStarted(question_id) => {
                if self.active_question == Some(question_id) {
                    false
                } else if self.finished_questions.contains(&question_id) {
                    return Err(PhaseRejection::StaleQuestion(question_id));
                } else {
                    // A new question while another is open means we missed the
                    // round-completed event; close the old one.
                    self.close_active();
                    self.active_question = Some(question_id);
                    self.phase = MatchPhase::QuestionPlaying;
                    true
                }
            }
            PhaseEvent::QuestionFinished(question_id) => match (self.phase, question_id) {
                (MatchPhase::QuestionPlaying, Some(id)) if Some(id) != self.active_question => {
                    false
                }
                (MatchPhase::QuestionPlaying, _) => {
                    self.close_active();
                    self.phase = MatchPhase::QuestionFinished;
                    true
                }
                _ => false,
            },
            PhaseEvent::Intermission => {
                if self.phase == MatchPhase::QuestionPlaying {
                    self.close_active();
                    self.phase = MatchPhase::QuestionFinished;
                    true
                } else {
                    false
                }
            }
            PhaseEvent::MatchFinished => {
                self.close_active();
                self.phase = MatchPhase::MatchFinished;
                true
            }
        };

        if changed {
            self.version += 1;
        }
        Ok(changed)
    }

    /// Overwrite the phase from a full room state. Used by snapshot recovery
    /// and by every poll response; never merges with the previous phase.
    pub fn observe_full_state(
        &mut self,
        source: PhaseSource,
        status: RoomStatus,
        question: Option<QuestionId>,
    ) -> Result<bool, PhaseRejection> {
        self.check(source)?;

        let phase = derive_phase(status, question.is_some());
        let question = if phase == MatchPhase::QuestionPlaying {
            question
        } else {
            None
        };

        if self.phase == phase && self.active_question == question {
            return Ok(false);
        }

        if self.active_question != question {
            self.close_active();
        }
        if let Some(id) = question {
            // The server is authoritative even about questions we thought
            // were over.
            self.finished_questions.remove(&id);
        }
        self.active_question = question;
        self.phase = phase;
        self.version += 1;
        Ok(true)
    }

    fn close_active(&mut self) {
        if let Some(id) = self.active_question.take() {
            self.finished_questions.insert(id);
        }
    }
}
