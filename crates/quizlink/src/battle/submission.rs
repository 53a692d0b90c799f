// At-most-once answer submission per question.
//
// Every path that wants to send an answer (user command, deadline expiry,
// resumed session) goes through `AnswerSubmitter::prepare`, which checks and
// writes the ledger in one step. The ledger entry is written before anything
// is sent, so a second call for the same question cannot get past the check.

use std::collections::HashMap;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::protocol::{MatchId, QuestionId, SubmitAnswer, TransportMode};

/// One local record per question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionRecord {
    pub submitted: bool,
    pub auto_submitted: bool,
    pub answer: String,
}

/// Channel a submission was (or will be) sent on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SubmitChannel {
    /// The persistent WebSocket channel.
    Push,
    /// The HTTP request/response fallback.
    Fallback,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmissionError {
    #[error("no question is open")]
    NoActiveQuestion,
    #[error("question {requested} is not the open question ({active})")]
    QuestionMismatch {
        active: QuestionId,
        requested: QuestionId,
    },
    #[error("eliminated participants cannot submit")]
    Spectating,
    #[error("question {0} already answered")]
    AlreadySubmitted(QuestionId),
    #[error("match already finished")]
    MatchFinished,
    #[error("push channel unavailable: {0}")]
    PrimaryUnavailable(String),
    #[error("fallback submission failed: {0}")]
    FallbackFailed(String),
}

impl SubmissionError {
    /// Guard outcomes that mean "silently do nothing" rather than a failure
    /// the user should hear about.
    pub fn is_skip(&self) -> bool {
        !matches!(
            self,
            SubmissionError::PrimaryUnavailable(_) | SubmissionError::FallbackFailed(_)
        )
    }
}

/// Per-match record of every question answered.
#[derive(Debug, Clone, Default)]
pub struct SubmissionLedger {
    records: HashMap<QuestionId, SubmissionRecord>,
}

impl SubmissionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, question_id: QuestionId) -> Option<&SubmissionRecord> {
        self.records.get(&question_id)
    }

    pub fn contains(&self, question_id: QuestionId) -> bool {
        self.records
            .get(&question_id)
            .is_some_and(|record| record.submitted)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Insert a record unless one already exists. Returns whether it was new.
    fn record(&mut self, question_id: QuestionId, record: SubmissionRecord) -> bool {
        if self.contains(question_id) {
            return false;
        }
        self.records.insert(question_id, record);
        true
    }

    /// Mark a question answered without a local submission (persisted
    /// history or a snapshot that says the server already has an answer).
    pub fn seed(&mut self, question_id: QuestionId) {
        self.records
            .entry(question_id)
            .or_insert_with(|| SubmissionRecord {
                submitted: true,
                auto_submitted: false,
                answer: String::new(),
            });
    }
}

/// Session facts the submitter needs for one decision.
#[derive(Debug, Clone, Copy)]
pub struct SubmitContext {
    pub active_question: Option<QuestionId>,
    pub spectating: bool,
    pub match_finished: bool,
    pub mode: TransportMode,
    pub push_connected: bool,
}

/// A submission that passed the guards and must now be sent.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionOrder {
    pub payload: SubmitAnswer,
    pub channel: SubmitChannel,
}

/// Owns the ledger for one match and decides what to send where.
#[derive(Debug, Clone)]
pub struct AnswerSubmitter {
    match_id: MatchId,
    ledger: SubmissionLedger,
    failure_reported: HashMap<QuestionId, bool>,
}

impl AnswerSubmitter {
    pub fn new(match_id: MatchId) -> Self {
        Self {
            match_id,
            ledger: SubmissionLedger::new(),
            failure_reported: HashMap::new(),
        }
    }

    pub fn ledger(&self) -> &SubmissionLedger {
        &self.ledger
    }

    pub fn seed(&mut self, question_id: QuestionId) {
        self.ledger.seed(question_id);
    }

    /// Check the guards, write the ledger entry and return what to send.
    ///
    /// `question_id` of `None` targets the open question.
    pub fn prepare(
        &mut self,
        question_id: Option<QuestionId>,
        answer: String,
        auto_submitted: bool,
        ctx: SubmitContext,
    ) -> Result<SubmissionOrder, SubmissionError> {
        if ctx.match_finished {
            return Err(SubmissionError::MatchFinished);
        }
        let active = ctx.active_question.ok_or(SubmissionError::NoActiveQuestion)?;
        let question_id = question_id.unwrap_or(active);
        if question_id != active {
            return Err(SubmissionError::QuestionMismatch {
                active,
                requested: question_id,
            });
        }
        if ctx.spectating {
            return Err(SubmissionError::Spectating);
        }

        let record = SubmissionRecord {
            submitted: true,
            auto_submitted,
            answer: answer.clone(),
        };
        if !self.ledger.record(question_id, record) {
            debug!(question_id, auto_submitted, "duplicate submission suppressed");
            return Err(SubmissionError::AlreadySubmitted(question_id));
        }

        let channel = match ctx.mode {
            TransportMode::Push if ctx.push_connected => SubmitChannel::Push,
            _ => SubmitChannel::Fallback,
        };
        info!(
            match_id = self.match_id,
            question_id,
            auto_submitted,
            ?channel,
            "submitting answer"
        );

        Ok(SubmissionOrder {
            payload: SubmitAnswer {
                match_id: self.match_id,
                question_id,
                answer,
                auto_submitted,
            },
            channel,
        })
    }

    /// Record that the last channel failed for `question_id`. Returns `true`
    /// only the first time, so the user hears about it once.
    pub fn note_failure(&mut self, question_id: QuestionId) -> bool {
        let reported = self.failure_reported.entry(question_id).or_insert(false);
        if *reported {
            return false;
        }
        *reported = true;
        warn!(question_id, "answer submission failed on every channel");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(active: Option<QuestionId>) -> SubmitContext {
        SubmitContext {
            active_question: active,
            spectating: false,
            match_finished: false,
            mode: TransportMode::Push,
            push_connected: true,
        }
    }

    #[test]
    fn manual_then_auto_submits_once() {
        let mut submitter = AnswerSubmitter::new(42);
        let order = submitter
            .prepare(None, "B".into(), false, ctx(Some(501)))
            .unwrap();
        assert_eq!(order.channel, SubmitChannel::Push);
        assert_eq!(order.payload.question_id, 501);
        assert_eq!(order.payload.match_id, 42);

        assert_eq!(
            submitter.prepare(None, String::new(), true, ctx(Some(501))),
            Err(SubmissionError::AlreadySubmitted(501))
        );
        let record = submitter.ledger().get(501).unwrap();
        assert!(!record.auto_submitted);
        assert_eq!(record.answer, "B");
    }

    #[test]
    fn auto_submit_with_empty_answer() {
        let mut submitter = AnswerSubmitter::new(42);
        let order = submitter
            .prepare(Some(501), String::new(), true, ctx(Some(501)))
            .unwrap();
        assert!(order.payload.auto_submitted);
        assert_eq!(order.payload.answer, "");
        assert_eq!(
            submitter.ledger().get(501),
            Some(&SubmissionRecord {
                submitted: true,
                auto_submitted: true,
                answer: String::new(),
            })
        );
        assert!(submitter
            .prepare(Some(501), "A".into(), false, ctx(Some(501)))
            .is_err());
    }

    #[test]
    fn guards_leave_no_record() {
        let mut submitter = AnswerSubmitter::new(1);
        assert_eq!(
            submitter.prepare(None, "A".into(), false, ctx(None)),
            Err(SubmissionError::NoActiveQuestion)
        );

        let mut spectating = ctx(Some(3));
        spectating.spectating = true;
        assert_eq!(
            submitter.prepare(None, "A".into(), false, spectating),
            Err(SubmissionError::Spectating)
        );

        assert_eq!(
            submitter.prepare(Some(2), "A".into(), false, ctx(Some(3))),
            Err(SubmissionError::QuestionMismatch {
                active: 3,
                requested: 2
            })
        );

        let mut finished = ctx(Some(3));
        finished.match_finished = true;
        assert_eq!(
            submitter.prepare(None, "A".into(), false, finished),
            Err(SubmissionError::MatchFinished)
        );

        assert!(submitter.ledger().is_empty());
        // After revival the same question is still open for submission.
        assert!(submitter.prepare(None, "A".into(), false, ctx(Some(3))).is_ok());
    }

    #[test]
    fn channel_selection() {
        let mut submitter = AnswerSubmitter::new(1);
        let mut disconnected = ctx(Some(1));
        disconnected.push_connected = false;
        assert_eq!(
            submitter
                .prepare(None, "A".into(), false, disconnected)
                .unwrap()
                .channel,
            SubmitChannel::Fallback
        );

        let mut poll = ctx(Some(2));
        poll.mode = TransportMode::Poll;
        assert_eq!(
            submitter.prepare(None, "A".into(), false, poll).unwrap().channel,
            SubmitChannel::Fallback
        );
    }

    #[test]
    fn seeded_question_is_not_resubmitted() {
        let mut submitter = AnswerSubmitter::new(1);
        submitter.seed(9);
        assert_eq!(
            submitter.prepare(None, String::new(), true, ctx(Some(9))),
            Err(SubmissionError::AlreadySubmitted(9))
        );
    }

    #[test]
    fn failure_is_reported_once() {
        let mut submitter = AnswerSubmitter::new(1);
        assert!(submitter.note_failure(4));
        assert!(!submitter.note_failure(4));
        assert!(submitter.note_failure(5));
    }

    #[test]
    fn skip_classification() {
        assert!(SubmissionError::Spectating.is_skip());
        assert!(SubmissionError::AlreadySubmitted(1).is_skip());
        assert!(!SubmissionError::FallbackFailed("x".into()).is_skip());
    }
}
