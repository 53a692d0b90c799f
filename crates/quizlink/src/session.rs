// One match participation and every timer it owns.
//
// `MatchSession` holds no I/O handles. The event loop feeds it server data and
// timer ticks; it answers with notices and tells the loop what to send.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::battle::deadline::{DeadlineClock, QuestionRound};
use crate::battle::phase::{MatchPhase, MatchStateMachine, PhaseEvent, PhaseSource};
use crate::battle::scoreboard::{
    participants_from_items, Participant, ScoreboardReconciler, ScoreboardSignal,
};
use crate::battle::snapshot::RoomSnapshot;
use crate::battle::submission::{
    AnswerSubmitter, SubmissionError, SubmissionOrder, SubmitContext,
};
use crate::link::heartbeat::HeartbeatScheduler;
use crate::protocol::{
    MatchId, Notice, QuestionId, QuestionInfo, RoomEvent, ScoreItem, TransportMode, UserId,
};
use crate::timer::RepeatingTimer;

/// Timer intervals a session runs with.
#[derive(Debug, Clone, Copy)]
pub struct SessionTiming {
    pub heartbeat_interval: Duration,
    pub deadline_tick: Duration,
    pub poll_interval: Duration,
}

/// Which session timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionTimer {
    Heartbeat,
    DeadlineTick,
    Poll,
}

/// What the event loop must do after the session absorbed an update.
#[derive(Debug, Default, PartialEq)]
pub struct SessionUpdate {
    pub notices: Vec<Notice>,
    /// A question this session has not seen before became active.
    pub new_question: Option<QuestionId>,
    /// The event lacked scoreboard items; fetch them.
    pub refresh_scoreboard: bool,
    /// The match reached its terminal phase.
    pub finished: bool,
}

/// Result of one deadline tick.
#[derive(Debug, Default, PartialEq)]
pub struct DeadlineOutcome {
    pub notice: Option<Notice>,
    /// The open question's time ran out on this tick.
    pub expired: Option<QuestionId>,
}

pub struct MatchSession {
    match_id: MatchId,
    generation: u64,
    mode: TransportMode,
    timing: SessionTiming,
    machine: MatchStateMachine,
    round: Option<QuestionRound>,
    clock: Option<DeadlineClock>,
    scoreboard: ScoreboardReconciler,
    submitter: AnswerSubmitter,
    heartbeat: HeartbeatScheduler,
    deadline_timer: RepeatingTimer,
    poll_timer: RepeatingTimer,
    joined: bool,
    /// Bumped on every scoreboard received, changed or not.
    scoreboard_version: u64,
}

fn source_for(mode: TransportMode) -> PhaseSource {
    match mode {
        TransportMode::Push => PhaseSource::Push,
        TransportMode::Poll => PhaseSource::Poll,
    }
}

fn signal_notice(signal: ScoreboardSignal) -> Notice {
    match signal {
        ScoreboardSignal::SelfEliminated => Notice::Eliminated,
        ScoreboardSignal::SelfRevived => Notice::Revived,
        ScoreboardSignal::NotEligibleToRevive => Notice::NotEligibleToRevive,
        ScoreboardSignal::OpponentDeparted { winner_id } => Notice::OpponentDeparted { winner_id },
    }
}

impl MatchSession {
    pub fn new(
        match_id: MatchId,
        generation: u64,
        mode: TransportMode,
        self_id: Option<UserId>,
        timing: SessionTiming,
    ) -> Self {
        Self {
            match_id,
            generation,
            mode,
            timing,
            machine: MatchStateMachine::new(source_for(mode)),
            round: None,
            clock: None,
            scoreboard: ScoreboardReconciler::new(self_id),
            submitter: AnswerSubmitter::new(match_id),
            heartbeat: HeartbeatScheduler::new(timing.heartbeat_interval),
            deadline_timer: RepeatingTimer::new(),
            poll_timer: RepeatingTimer::new(),
            joined: false,
            scoreboard_version: 0,
        }
    }

    pub fn match_id(&self) -> MatchId {
        self.match_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn mode(&self) -> TransportMode {
        self.mode
    }

    pub fn source(&self) -> PhaseSource {
        self.machine.source()
    }

    pub fn phase(&self) -> MatchPhase {
        self.machine.phase()
    }

    pub fn round(&self) -> Option<&QuestionRound> {
        self.round.as_ref()
    }

    pub fn scoreboard(&self) -> &ScoreboardReconciler {
        &self.scoreboard
    }

    pub fn submitter(&self) -> &AnswerSubmitter {
        &self.submitter
    }

    /// Tag for scoreboard fetches; a reply is stale once this moves on.
    pub fn scoreboard_version(&self) -> u64 {
        self.scoreboard_version
    }

    pub fn is_joined(&self) -> bool {
        self.joined
    }

    pub fn is_finished(&self) -> bool {
        self.machine.is_terminal()
    }

    pub fn heartbeat_running(&self) -> bool {
        self.heartbeat.is_running()
    }

    /// Mark previously answered questions (persisted across a reload).
    pub fn seed_submissions(&mut self, question_ids: &[QuestionId]) {
        for &question_id in question_ids {
            self.submitter.seed(question_id);
        }
    }

    // -----------------------------------------------------------------------
    // Join lifecycle
    // -----------------------------------------------------------------------

    /// Join acknowledged. Starts the heartbeat unless the match is over.
    pub fn mark_joined(&mut self) {
        self.joined = true;
        if !self.is_finished() {
            self.heartbeat.start();
        }
    }

    /// The push channel dropped: the server forgets our join with it.
    pub fn on_link_lost(&mut self) {
        self.joined = false;
        self.heartbeat.stop();
    }

    pub fn stop_heartbeat(&mut self) {
        self.heartbeat.stop();
    }

    /// Begin periodic full-state polling (poll-mode sessions only).
    pub fn start_polling(&mut self) {
        if self.mode != TransportMode::Poll {
            warn!("Ignoring poll start for push-mode match {}", self.match_id);
            return;
        }
        if !self.poll_timer.is_running() {
            info!("Polling match {} every {:?}", self.match_id, self.timing.poll_interval);
            self.poll_timer.start(self.timing.poll_interval, true);
        }
    }

    /// Stop every timer. Used on match end and on teardown.
    pub fn cancel_timers(&mut self) {
        self.heartbeat.stop();
        self.deadline_timer.stop();
        self.poll_timer.stop();
    }

    fn finish(&mut self) {
        self.heartbeat.finish();
        self.deadline_timer.stop();
        self.poll_timer.stop();
        self.round = None;
        self.clock = None;
        self.scoreboard.end_phase();
    }

    /// Wait for the next session timer. Pends forever when none is running.
    pub async fn next_timer(&mut self) -> SessionTimer {
        tokio::select! {
            _ = self.heartbeat.tick() => SessionTimer::Heartbeat,
            _ = self.deadline_timer.tick() => SessionTimer::DeadlineTick,
            _ = self.poll_timer.tick() => SessionTimer::Poll,
        }
    }

    // -----------------------------------------------------------------------
    // State updates
    // -----------------------------------------------------------------------

    fn open_round(&mut self, round: QuestionRound, update: &mut SessionUpdate) {
        update.notices.push(Notice::QuestionStarted {
            question_id: round.question_id,
            round_no: round.round_no,
            phase: round.phase,
            time_limit_sec: round.time_limit_sec,
        });
        update.new_question = Some(round.question_id);
        if let Some(signal) = self.scoreboard.enter_phase(round.phase) {
            update.notices.push(signal_notice(signal));
        }
        self.clock = Some(DeadlineClock::new(&round));
        self.round = Some(round);
        self.deadline_timer.start(self.timing.deadline_tick, true);
    }

    fn close_round(&mut self) {
        self.round = None;
        self.clock = None;
        self.deadline_timer.stop();
    }

    fn replace_participants(&mut self, items: &[ScoreItem], update: &mut SessionUpdate) {
        self.replace_table(participants_from_items(items), update);
    }

    fn replace_table(&mut self, participants: Vec<Participant>, update: &mut SessionUpdate) {
        self.scoreboard_version += 1;
        if participants.as_slice() == self.scoreboard.participants() {
            return;
        }
        let signals = self.scoreboard.replace(participants);
        update
            .notices
            .push(Notice::Scoreboard(self.scoreboard.participants().to_vec()));
        update.notices.extend(signals.into_iter().map(signal_notice));
    }

    fn push_phase_notice(&self, before: MatchPhase, update: &mut SessionUpdate) {
        if self.machine.phase() != before {
            update.notices.push(Notice::PhaseChanged(self.machine.phase()));
        }
    }

    /// Overwrite local state with a full room state (join snapshot or poll
    /// response). Nothing of the previous view is merged in.
    pub fn apply_full_state(&mut self, snapshot: RoomSnapshot) -> SessionUpdate {
        let mut update = SessionUpdate::default();
        if snapshot.is_foreign() {
            warn!(
                "Ignoring state for match {} in session {}",
                snapshot.match_id, self.match_id
            );
            return update;
        }

        let before = self.machine.phase();
        let question = snapshot.round.as_ref().map(|r| r.question_id);
        if let Err(rejection) =
            self.machine
                .observe_full_state(self.source(), snapshot.status, question)
        {
            debug!("full state not applied: {}", rejection);
            return update;
        }

        if let Some(self_id) = snapshot.self_user_id {
            if self.scoreboard.self_id().is_none() {
                self.scoreboard.set_self_id(self_id);
            }
        }

        match snapshot.round {
            Some(round) => {
                let same_question =
                    self.round.as_ref().map(|r| r.question_id) == Some(round.question_id);
                if same_question {
                    if let Some(clock) = self.clock.as_mut() {
                        clock.retarget(round.end_timestamp_ms);
                    }
                    self.round = Some(round);
                } else {
                    self.close_round();
                    self.open_round(round, &mut update);
                }
                if snapshot.answered_current {
                    if let Some(id) = question {
                        self.submitter.seed(id);
                    }
                }
            }
            None => {
                self.close_round();
                if let Some(signal) = self.scoreboard.enter_phase(snapshot.phase_tag) {
                    update.notices.push(signal_notice(signal));
                }
            }
        }

        self.replace_table(snapshot.participants, &mut update);

        self.push_phase_notice(before, &mut update);
        if self.machine.is_terminal() {
            self.finish();
            update.notices.push(Notice::MatchFinished { winner_id: None });
            update.finished = true;
        }
        update
    }

    /// Apply one room broadcast event (push-mode sessions).
    pub fn apply_room_event(&mut self, event: RoomEvent, now_ms: i64) -> SessionUpdate {
        let mut update = SessionUpdate::default();
        let before = self.machine.phase();
        let source = self.source();

        match event {
            RoomEvent::PlayerJoined(joined) => {
                debug!("player {:?} joined match {}", joined.user_id, self.match_id);
                if let Some(items) = joined.participants {
                    self.replace_participants(&items, &mut update);
                }
            }
            RoomEvent::MatchStarted(_) => {
                if let Err(rejection) = self.machine.apply(source, PhaseEvent::MatchStarted) {
                    debug!("match-started ignored: {}", rejection);
                }
            }
            RoomEvent::QuestionStarted(info) => {
                self.on_question_started(&info, now_ms, &mut update);
            }
            RoomEvent::AnswerSubmitted(submitted) => {
                debug!(
                    "participant {:?} answered question {:?}",
                    submitted.user_id, submitted.question_id
                );
            }
            RoomEvent::ScoreboardUpdated(board) => {
                self.replace_participants(&board.items, &mut update);
            }
            RoomEvent::RoundCompleted(completed) => {
                match self
                    .machine
                    .apply(source, PhaseEvent::QuestionFinished(completed.question_id))
                {
                    Ok(true) => self.close_round(),
                    Ok(false) => {}
                    Err(rejection) => debug!("round-completed ignored: {}", rejection),
                }
                match completed.items {
                    Some(items) => self.replace_participants(&items, &mut update),
                    None if !self.is_finished() => update.refresh_scoreboard = true,
                    None => {}
                }
            }
            RoomEvent::IntermissionStarted(intermission) => {
                match self.machine.apply(source, PhaseEvent::Intermission) {
                    Ok(true) => self.close_round(),
                    Ok(false) => {}
                    Err(rejection) => debug!("intermission ignored: {}", rejection),
                }
                if let Some(next) = intermission.next_phase {
                    if let Some(signal) = self.scoreboard.enter_phase(next) {
                        update.notices.push(signal_notice(signal));
                    }
                }
            }
            RoomEvent::MatchFinished(finished) => {
                if let Some(items) = finished.items {
                    self.replace_participants(&items, &mut update);
                }
                match self.machine.apply(source, PhaseEvent::MatchFinished) {
                    Ok(_) => {
                        info!(
                            "Match {} finished, winner {:?}",
                            self.match_id, finished.winner_id
                        );
                        self.finish();
                        self.push_phase_notice(before, &mut update);
                        update.notices.push(Notice::MatchFinished {
                            winner_id: finished.winner_id,
                        });
                        update.finished = true;
                    }
                    Err(rejection) => debug!("match-finished ignored: {}", rejection),
                }
                return update;
            }
        }

        self.push_phase_notice(before, &mut update);
        update
    }

    fn on_question_started(&mut self, info: &QuestionInfo, now_ms: i64, update: &mut SessionUpdate) {
        let source = self.source();
        match self
            .machine
            .apply(source, PhaseEvent::QuestionStarted(info.question_id))
        {
            Ok(true) => {
                self.close_round();
                self.open_round(QuestionRound::from_info(info, now_ms), update);
                if let Some(content) = &info.content {
                    update.notices.push(Notice::QuestionDetail {
                        question_id: info.question_id,
                        content: content.clone(),
                    });
                    // Content arrived with the event; nothing to fetch.
                    update.new_question = None;
                }
            }
            Ok(false) => debug!("duplicate question-started for {}", info.question_id),
            Err(rejection) => warn!("question-started ignored: {}", rejection),
        }
    }

    /// Replace the scoreboard from a fetched item list.
    pub fn apply_scoreboard(&mut self, items: &[ScoreItem]) -> SessionUpdate {
        let mut update = SessionUpdate::default();
        if self.is_finished() {
            return update;
        }
        self.replace_participants(items, &mut update);
        update
    }

    /// Recompute the countdown. Stops the deadline timer once it expired.
    pub fn on_deadline_tick(&mut self, now_ms: i64) -> DeadlineOutcome {
        let Some(clock) = self.clock.as_mut() else {
            self.deadline_timer.stop();
            return DeadlineOutcome::default();
        };
        let tick = clock.tick(now_ms);
        let question_id = clock.question_id();
        let notice = tick.changed.then_some(Notice::Remaining {
            question_id,
            seconds: tick.remaining,
        });
        let expired = if tick.expired {
            info!("Question {} time is up", question_id);
            self.deadline_timer.stop();
            Some(question_id)
        } else {
            None
        };
        DeadlineOutcome { notice, expired }
    }

    /// Run the submission guards for this session.
    pub fn prepare_submission(
        &mut self,
        question_id: Option<QuestionId>,
        answer: String,
        auto_submitted: bool,
        push_connected: bool,
    ) -> Result<SubmissionOrder, SubmissionError> {
        let ctx = SubmitContext {
            active_question: self.machine.active_question(),
            spectating: self.scoreboard.is_spectating(),
            match_finished: self.machine.is_terminal(),
            mode: self.mode,
            push_connected,
        };
        self.submitter
            .prepare(question_id, answer, auto_submitted, ctx)
    }

    /// Both channels failed for `question_id`. Returns `true` the first time.
    pub fn note_submission_failure(&mut self, question_id: QuestionId) -> bool {
        self.submitter.note_failure(question_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{
        MatchFinishedEvent, PhaseTag, RoomStateWire, RoundCompleted, ScoreboardUpdated,
    };

    fn timing() -> SessionTiming {
        SessionTiming {
            heartbeat_interval: Duration::from_secs(10),
            deadline_tick: Duration::from_millis(200),
            poll_interval: Duration::from_secs(2),
        }
    }

    fn session(mode: TransportMode) -> MatchSession {
        MatchSession::new(42, 1, mode, Some(1), timing())
    }

    fn question(id: QuestionId, started_at: i64) -> QuestionInfo {
        QuestionInfo {
            question_id: id,
            round_no: 1,
            phase: PhaseTag::Main,
            order_no: 1,
            time_limit_sec: 20,
            started_at: Some(started_at),
            remaining_ms: None,
            answered: false,
            content: None,
        }
    }

    fn snapshot(json: &str, now_ms: i64) -> RoomSnapshot {
        let wire: RoomStateWire = serde_json::from_str(json).unwrap();
        RoomSnapshot::recover(wire, 42, now_ms)
    }

    fn item(user_id: UserId, alive: bool) -> ScoreItem {
        ScoreItem {
            user_id,
            display_name: String::new(),
            alive,
            revived: false,
            score: 0,
            correct_count: 0,
            total_count: 0,
            rank: 0,
        }
    }

    #[tokio::test]
    async fn snapshot_replaces_round_and_participants() {
        let mut s = session(TransportMode::Push);
        let update = s.apply_full_state(snapshot(
            r#"{"room":{"matchId":42,"status":"ACTIVE"},
                "participants":[{"userId":1},{"userId":2}],
                "currentQuestion":{"questionId":501,"timeLimitSec":20,"startedAt":0}}"#,
            1_000,
        ));
        assert_eq!(s.phase(), MatchPhase::QuestionPlaying);
        assert_eq!(s.round().unwrap().question_id, 501);
        assert_eq!(update.new_question, Some(501));
        assert!(update
            .notices
            .contains(&Notice::PhaseChanged(MatchPhase::QuestionPlaying)));

        // Reconnect: the server moved on to a different question and the
        // opponent order changed.
        let update = s.apply_full_state(snapshot(
            r#"{"room":{"matchId":42,"status":"ACTIVE"},
                "scoreboard":[{"userId":2,"score":5},{"userId":1}],
                "currentQuestion":{"questionId":502,"timeLimitSec":20,"startedAt":30000}}"#,
            31_000,
        ));
        assert_eq!(s.round().unwrap().question_id, 502);
        assert_eq!(s.round().unwrap().end_timestamp_ms, 50_000);
        let ids: Vec<_> = s.scoreboard().participants().iter().map(|p| p.user_id).collect();
        assert_eq!(ids, vec![2, 1]);
        assert_eq!(s.scoreboard().participants()[0].score, 5);
        assert_eq!(update.new_question, Some(502));
    }

    #[tokio::test]
    async fn identical_snapshot_twice_is_harmless() {
        let mut s = session(TransportMode::Poll);
        let json = r#"{"room":{"matchId":42,"status":"ACTIVE"},"participants":[{"userId":1}],
                       "currentQuestion":{"questionId":7,"timeLimitSec":10,"startedAt":0}}"#;
        let first = s.apply_full_state(snapshot(json, 0));
        assert!(!first.notices.is_empty());
        let second = s.apply_full_state(snapshot(json, 500));
        assert!(second.notices.is_empty());
        assert_eq!(second.new_question, None);
    }

    #[tokio::test]
    async fn answered_snapshot_seeds_ledger() {
        let mut s = session(TransportMode::Push);
        s.apply_full_state(snapshot(
            r#"{"room":{"matchId":42,"status":"ACTIVE"},"participants":[{"userId":1}],
                "currentQuestion":{"questionId":9,"timeLimitSec":10,"startedAt":0,"answered":true}}"#,
            0,
        ));
        assert_eq!(
            s.prepare_submission(None, "A".into(), false, true),
            Err(SubmissionError::AlreadySubmitted(9))
        );
    }

    #[tokio::test]
    async fn completed_snapshot_finishes_and_blocks_heartbeat() {
        let mut s = session(TransportMode::Push);
        let update = s.apply_full_state(snapshot(
            r#"{"room":{"matchId":42,"status":"COMPLETED"},"participants":[]}"#,
            0,
        ));
        assert!(update.finished);
        s.mark_joined();
        assert!(!s.heartbeat_running());
    }

    #[tokio::test]
    async fn push_events_drive_question_loop() {
        let mut s = session(TransportMode::Push);
        let update = s.apply_room_event(RoomEvent::QuestionStarted(question(3, 0)), 0);
        assert_eq!(update.new_question, Some(3));
        assert_eq!(s.phase(), MatchPhase::QuestionPlaying);

        // Duplicate delivery changes nothing.
        let update = s.apply_room_event(RoomEvent::QuestionStarted(question(3, 0)), 100);
        assert_eq!(update, SessionUpdate::default());

        let update = s.apply_room_event(
            RoomEvent::RoundCompleted(RoundCompleted {
                question_id: Some(3),
                items: None,
            }),
            5_000,
        );
        assert!(update.refresh_scoreboard);
        assert_eq!(s.phase(), MatchPhase::QuestionFinished);
        assert!(s.round().is_none());

        // A late duplicate for the finished question is ignored.
        s.apply_room_event(RoomEvent::QuestionStarted(question(3, 0)), 6_000);
        assert_eq!(s.phase(), MatchPhase::QuestionFinished);
    }

    #[tokio::test]
    async fn match_finished_stops_heartbeat_for_good() {
        let mut s = session(TransportMode::Push);
        s.mark_joined();
        assert!(s.heartbeat_running());
        let update = s.apply_room_event(
            RoomEvent::MatchFinished(MatchFinishedEvent {
                winner_id: Some(2),
                items: None,
            }),
            0,
        );
        assert!(update.finished);
        assert!(update.notices.contains(&Notice::MatchFinished { winner_id: Some(2) }));
        assert!(!s.heartbeat_running());
        s.mark_joined();
        assert!(!s.heartbeat_running());

        // Nothing moves a finished match.
        s.apply_room_event(RoomEvent::QuestionStarted(question(4, 0)), 0);
        assert_eq!(s.phase(), MatchPhase::MatchFinished);
    }

    #[tokio::test]
    async fn poll_session_ignores_push_events() {
        let mut s = session(TransportMode::Poll);
        s.apply_room_event(RoomEvent::QuestionStarted(question(3, 0)), 0);
        assert_eq!(s.phase(), MatchPhase::Waiting);
        assert!(s.round().is_none());
    }

    #[tokio::test]
    async fn elimination_blocks_submission_until_revival() {
        let mut s = session(TransportMode::Push);
        s.apply_room_event(
            RoomEvent::ScoreboardUpdated(ScoreboardUpdated {
                items: vec![item(1, true), item(2, true)],
            }),
            0,
        );
        s.apply_room_event(RoomEvent::QuestionStarted(question(5, 0)), 0);

        let update = s.apply_room_event(
            RoomEvent::ScoreboardUpdated(ScoreboardUpdated {
                items: vec![item(2, true), item(1, false)],
            }),
            0,
        );
        assert!(update.notices.contains(&Notice::Eliminated));
        assert_eq!(
            s.prepare_submission(None, "A".into(), false, true),
            Err(SubmissionError::Spectating)
        );

        let update = s.apply_scoreboard(&[item(1, true), item(2, true)]);
        assert!(update.notices.contains(&Notice::Revived));
        assert!(s.prepare_submission(None, "A".into(), false, true).is_ok());
    }

    #[tokio::test]
    async fn deadline_expiry_reported_once() {
        let mut s = session(TransportMode::Push);
        s.apply_room_event(RoomEvent::QuestionStarted(question(501, 0)), 0);

        let first = s.on_deadline_tick(9_500);
        assert_eq!(
            first.notice,
            Some(Notice::Remaining {
                question_id: 501,
                seconds: 11
            })
        );
        assert_eq!(first.expired, None);

        let done = s.on_deadline_tick(20_000);
        assert_eq!(done.expired, Some(501));
        assert_eq!(s.on_deadline_tick(20_200).expired, None);
    }
}
