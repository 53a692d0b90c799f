// Client state and orchestration logic.
//
// The central event loop that coordinates push-channel transport events,
// fallback API results, user commands, and the timers owned by the
// connection and the match session. Pushes notices to the presentation layer.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::battle::snapshot::RoomSnapshot;
use crate::battle::submission::{SubmissionError, SubmitChannel};
use crate::clock::Clock;
use crate::config::Config;
use crate::db::Database;
use crate::fallback::{FallbackDispatcher, FallbackError, FallbackEvent};
use crate::link::connection::{
    ConnectionError, ConnectionManager, ConnectionTimer, FramePublisher,
};
use crate::link::router::{InboundHandler, MessageRouter};
use crate::link::subscriptions::SubscriptionRegistry;
use crate::protocol::{
    AnswerResultData, ClientFrame, HeartbeatAckData, MatchFound, MatchId, MatchRequest, Notice,
    QuestionId, ResponseEnvelope, RoomEvent, RoomStateWire, SubmitAnswer, TransportMode, UserCommand,
    UserId,
};
use crate::session::{MatchSession, SessionTimer, SessionTiming, SessionUpdate};
use crate::ws_client::TransportEvent;

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// The parts of the configuration the event loop consults at runtime.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub mode: TransportMode,
    pub match_request: MatchRequest,
    pub timing: SessionTiming,
    /// Fallback identity for scoreboard lookups when snapshots omit it.
    pub self_id: Option<UserId>,
}

impl ClientSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            mode: config.transport.mode,
            match_request: config.matchmaking.request(),
            timing: SessionTiming {
                heartbeat_interval: config.heartbeat_interval(),
                deadline_tick: config.deadline_tick(),
                poll_interval: config.poll_interval(),
            },
            self_id: config.credentials.user_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct Client {
    settings: ClientSettings,
    db: Database,
    connection: ConnectionManager,
    subscriptions: SubscriptionRegistry,
    router: MessageRouter,
    fallback: FallbackDispatcher,
    clock: Arc<dyn Clock>,
    session: Option<MatchSession>,
    /// Generation handed to the next session. Fallback results carrying an
    /// older generation belong to a discarded session.
    next_generation: u64,
    /// The settle delay after the last handshake has elapsed.
    link_ready: bool,
    /// A match request waits for the push channel to become ready.
    pending_request: bool,
    /// Joins sent on the current link that the server has not answered yet,
    /// oldest first. Join results come back in the order the joins went out.
    pending_joins: VecDeque<MatchId>,
    notices: Vec<Notice>,
}

impl Client {
    pub fn new(
        settings: ClientSettings,
        db: Database,
        connection: ConnectionManager,
        fallback: FallbackDispatcher,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            settings,
            db,
            connection,
            subscriptions: SubscriptionRegistry::new(),
            router: MessageRouter::new(),
            fallback,
            clock,
            session: None,
            next_generation: 0,
            link_ready: false,
            pending_request: false,
            pending_joins: VecDeque::new(),
            notices: Vec::new(),
        }
    }

    pub fn session(&self) -> Option<&MatchSession> {
        self.session.as_ref()
    }

    fn notify(&mut self, notice: Notice) {
        self.notices.push(notice);
    }

    fn notify_status(&mut self) {
        let status = self.connection.status();
        self.notify(Notice::ConnectionStatus(status));
    }

    async fn flush(&mut self, notice_tx: &mpsc::Sender<Notice>) {
        for notice in self.notices.drain(..) {
            let _ = notice_tx.send(notice).await;
        }
    }

    // -----------------------------------------------------------------------
    // Session lifecycle
    // -----------------------------------------------------------------------

    fn start_session(&mut self, match_id: MatchId) {
        if let Some(current) = &self.session {
            if current.match_id() == match_id && !current.is_finished() {
                debug!("already in match {}; re-sending join", match_id);
                if self.link_ready {
                    self.join_room();
                }
                return;
            }
            self.end_session();
        }

        self.next_generation += 1;
        let mode = self.settings.mode;
        let mut session = MatchSession::new(
            match_id,
            self.next_generation,
            mode,
            self.settings.self_id,
            self.settings.timing,
        );
        match self.db.load_submissions(match_id) {
            Ok(answered) => session.seed_submissions(&answered),
            Err(e) => warn!("Failed to load submissions for match {}: {:#}", match_id, e),
        }
        if let Err(e) = self.db.set_last_match_id(match_id) {
            warn!("Failed to persist match {}: {:#}", match_id, e);
        }
        info!("Starting session for match {} ({:?} mode)", match_id, mode);

        match mode {
            TransportMode::Push => {
                self.session = Some(session);
                self.router.follow_room(match_id);
                if self.link_ready {
                    self.join_room();
                } else if self.connection.connect() {
                    self.notify_status();
                }
            }
            TransportMode::Poll => {
                session.start_polling();
                self.session = Some(session);
            }
        }
    }

    /// Discard the session: timers, room subscription and the resumable
    /// match record all go with it.
    fn end_session(&mut self) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        session.cancel_timers();
        let match_id = session.match_id();
        if self.subscriptions.room() == Some(match_id) {
            self.subscriptions.unsubscribe_room(&self.connection);
        }
        self.router.leave_room();
        if let Err(e) = self.db.clear_last_match() {
            warn!("Failed to clear resumable match: {:#}", e);
        }
        info!("Session for match {} ended", match_id);
    }

    fn send_join(&mut self, match_id: MatchId) -> Result<(), ConnectionError> {
        self.subscriptions.subscribe_personal(&self.connection)?;
        self.subscriptions.subscribe_room(match_id, &self.connection)?;
        self.connection.publish(ClientFrame::join(match_id))?;
        self.pending_joins.push_back(match_id);
        Ok(())
    }

    /// Subscribe to the session's room and send the join handshake.
    fn join_room(&mut self) {
        let Some(session) = &self.session else {
            return;
        };
        if session.mode() != TransportMode::Push || session.is_finished() {
            return;
        }
        let match_id = session.match_id();
        match self.send_join(match_id) {
            Ok(()) => info!("Joining match {}", match_id),
            Err(e) => warn!("Join for match {} not sent: {}", match_id, e),
        }
    }

    /// Hand a session update to the presentation layer and run the
    /// follow-up fetches it asks for.
    fn absorb(&mut self, update: SessionUpdate) {
        self.notices.extend(update.notices);
        let Some(session) = &self.session else {
            return;
        };
        let (match_id, generation) = (session.match_id(), session.generation());
        if let Some(question_id) = update.new_question {
            self.fallback.question_detail(generation, match_id, question_id);
        }
        if update.refresh_scoreboard {
            self.fallback
                .scoreboard(generation, session.scoreboard_version(), match_id);
        }
        if update.finished {
            self.end_session();
        }
    }

    // -----------------------------------------------------------------------
    // Matchmaking
    // -----------------------------------------------------------------------

    fn request_match(&mut self) {
        if self.settings.mode == TransportMode::Poll {
            warn!("Match request ignored: matchmaking needs the push channel");
            self.notify(Notice::MatchmakingFailed {
                message: "matchmaking is not available in poll mode".to_string(),
            });
            return;
        }
        self.pending_request = true;
        if self.link_ready {
            self.send_match_request();
        } else if self.connection.connect() {
            self.notify_status();
        }
    }

    fn send_match_request(&mut self) {
        self.pending_request = false;
        let frame = ClientFrame::request_match(self.settings.match_request.clone());
        let result = self
            .subscriptions
            .subscribe_personal(&self.connection)
            .and_then(|()| self.connection.publish(frame));
        match result {
            Ok(()) => info!(
                "Match requested (mode {}, scope {})",
                self.settings.match_request.mode, self.settings.match_request.scope
            ),
            Err(e) => {
                warn!("Match request not sent: {}", e);
                self.notify(Notice::MatchmakingFailed {
                    message: e.to_string(),
                });
            }
        }
    }

    fn cancel_match(&mut self) {
        self.pending_request = false;
        if !self.link_ready {
            debug!("cancel ignored: push channel not ready");
            return;
        }
        let frame = ClientFrame::cancel_match(self.settings.match_request.mode.clone());
        match self.connection.publish(frame) {
            Ok(()) => info!("Match request cancelled"),
            Err(e) => warn!("Cancel not sent: {}", e),
        }
    }

    // -----------------------------------------------------------------------
    // Submission
    // -----------------------------------------------------------------------

    fn submit(&mut self, question_id: Option<QuestionId>, answer: String, auto_submitted: bool) {
        let push_connected = self.link_ready;
        let Some(session) = self.session.as_mut() else {
            debug!("submit ignored: no active session");
            return;
        };
        let order =
            match session.prepare_submission(question_id, answer, auto_submitted, push_connected) {
                Ok(order) => order,
                Err(e) if e.is_skip() => {
                    debug!("Submission skipped: {}", e);
                    return;
                }
                Err(e) => {
                    warn!("Submission refused: {}", e);
                    return;
                }
            };
        let generation = session.generation();
        let payload = order.payload;
        let question_id = payload.question_id;

        if let Err(e) = self.db.record_submission(payload.match_id, question_id) {
            warn!("Failed to persist submission for question {}: {:#}", question_id, e);
        }

        match order.channel {
            SubmitChannel::Push => match self.connection.publish(ClientFrame::answer(payload.clone()))
            {
                Ok(()) => {
                    info!(
                        "Answer for question {} sent (auto: {})",
                        question_id, auto_submitted
                    );
                    self.notify(Notice::SubmissionAccepted {
                        question_id,
                        auto_submitted,
                        channel: SubmitChannel::Push,
                    });
                }
                Err(e) => {
                    let error = SubmissionError::PrimaryUnavailable(e.to_string());
                    warn!("{}; posting question {} over HTTP", error, question_id);
                    self.fallback.answer(generation, payload);
                }
            },
            SubmitChannel::Fallback => {
                debug!("posting answer for question {} over HTTP", question_id);
                self.fallback.answer(generation, payload);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Event handlers
    // -----------------------------------------------------------------------

    /// Handle a user command. `Quit` is handled by the main loop.
    pub fn handle_command(&mut self, cmd: UserCommand) {
        match cmd {
            UserCommand::RequestMatch => self.request_match(),
            UserCommand::CancelMatch => self.cancel_match(),
            UserCommand::Join(match_id) => self.start_session(match_id),
            UserCommand::Submit {
                question_id,
                answer,
            } => self.submit(question_id, answer, false),
            UserCommand::StopHeartbeat => {
                if let Some(session) = self.session.as_mut() {
                    info!("Heartbeat stopped for match {}", session.match_id());
                    session.stop_heartbeat();
                }
            }
            UserCommand::Disconnect => self.disconnect(),
            UserCommand::Quit => {}
        }
    }

    fn disconnect(&mut self) {
        info!("Disconnect requested");
        self.end_session();
        self.connection.disconnect();
        self.subscriptions.clear();
        self.pending_joins.clear();
        self.link_ready = false;
        self.pending_request = false;
        self.notify_status();
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                if self.connection.on_connected() {
                    self.notify_status();
                }
            }
            TransportEvent::Disconnected { reason } => {
                if self.connection.on_dropped(&reason) {
                    self.link_ready = false;
                    self.subscriptions.clear();
                    self.pending_joins.clear();
                    if let Some(session) = self.session.as_mut() {
                        session.on_link_lost();
                    }
                    self.notify_status();
                }
            }
            TransportEvent::Frame(raw) => {
                trace!("inbound frame: {}", raw);
                let router = self.router;
                router.dispatch(&raw, self);
            }
            TransportEvent::Undelivered(answer) => self.reroute_answer(answer),
        }
    }

    /// An answer the push channel took but never wrote goes out over HTTP.
    fn reroute_answer(&mut self, answer: SubmitAnswer) {
        let Some(session) = self
            .session
            .as_ref()
            .filter(|s| s.match_id() == answer.match_id)
        else {
            debug!(
                "undelivered answer for match {} has no session",
                answer.match_id
            );
            return;
        };
        warn!(
            "Answer for question {} not delivered on the push channel; posting over HTTP",
            answer.question_id
        );
        self.fallback.answer(session.generation(), answer);
    }

    pub fn handle_connection_timer(&mut self, timer: ConnectionTimer) {
        match timer {
            ConnectionTimer::Settled => {
                self.link_ready = true;
                if let Err(e) = self.subscriptions.subscribe_personal(&self.connection) {
                    warn!("Personal queues not subscribed: {}", e);
                }
                if self.pending_request {
                    self.send_match_request();
                }
                self.join_room();
            }
            ConnectionTimer::ConnectTimedOut => {
                self.notify_status();
                if self.pending_request {
                    self.pending_request = false;
                    self.notify(Notice::MatchmakingFailed {
                        message: "push channel did not connect".to_string(),
                    });
                }
            }
        }
    }

    pub fn handle_session_timer(&mut self, timer: SessionTimer) {
        match timer {
            SessionTimer::Heartbeat => self.send_heartbeat(),
            SessionTimer::DeadlineTick => {
                let now = self.clock.now_ms();
                let Some(session) = self.session.as_mut() else {
                    return;
                };
                let outcome = session.on_deadline_tick(now);
                if let Some(notice) = outcome.notice {
                    self.notify(notice);
                }
                if let Some(question_id) = outcome.expired {
                    self.submit(Some(question_id), String::new(), true);
                }
            }
            SessionTimer::Poll => {
                if let Some(session) = &self.session {
                    trace!("polling room state for match {}", session.match_id());
                    self.fallback
                        .room_state(session.generation(), session.match_id());
                }
            }
        }
    }

    fn send_heartbeat(&mut self) {
        let Some(session) = &self.session else {
            return;
        };
        let match_id = session.match_id();
        match session.mode() {
            TransportMode::Push => match self.connection.publish(ClientFrame::heartbeat(match_id)) {
                Ok(()) => debug!("heartbeat sent for match {}", match_id),
                Err(e) => debug!("heartbeat for match {} not sent: {}", match_id, e),
            },
            TransportMode::Poll => self.fallback.heartbeat(session.generation(), match_id),
        }
    }

    pub fn handle_fallback_event(&mut self, event: FallbackEvent) {
        let current = self.session.as_ref().map(MatchSession::generation);
        if current != Some(event.generation()) {
            debug!(
                "dropping fallback result from generation {} (current {:?})",
                event.generation(),
                current
            );
            return;
        }

        match event {
            FallbackEvent::RoomState {
                match_id, result, ..
            } => match result {
                Ok(wire) => {
                    let now = self.clock.now_ms();
                    let Some(session) = self.session.as_mut() else {
                        return;
                    };
                    let update = session.apply_full_state(RoomSnapshot::recover(wire, match_id, now));
                    let first = !session.is_joined();
                    if first {
                        session.mark_joined();
                        info!("Following match {} by polling", match_id);
                        self.notify(Notice::Joined { match_id });
                    }
                    self.absorb(update);
                }
                Err(e) => warn!("Room state poll for match {} failed: {}", match_id, e),
            },
            FallbackEvent::Scoreboard {
                version, result, ..
            } => match result {
                Ok(items) => {
                    let Some(session) = self.session.as_mut() else {
                        return;
                    };
                    if session.scoreboard_version() != version {
                        debug!("fetched scoreboard superseded by a newer one");
                        return;
                    }
                    let update = session.apply_scoreboard(&items);
                    self.absorb(update);
                }
                Err(e) => warn!("Scoreboard fetch failed: {}", e),
            },
            FallbackEvent::QuestionDetail {
                question_id,
                result,
                ..
            } => match result {
                Ok(content) => self.notify(Notice::QuestionDetail {
                    question_id,
                    content,
                }),
                Err(FallbackError::Disabled) => {
                    debug!("no HTTP API configured; question {} detail skipped", question_id)
                }
                Err(e) => warn!("Question {} detail fetch failed: {}", question_id, e),
            },
            FallbackEvent::AnswerPosted {
                question_id,
                auto_submitted,
                result,
                ..
            } => match result {
                Ok(data) => {
                    info!("Answer for question {} posted over HTTP", question_id);
                    self.notify(Notice::SubmissionAccepted {
                        question_id,
                        auto_submitted,
                        channel: SubmitChannel::Fallback,
                    });
                    if let Some(data) = data {
                        self.notify(Notice::AnswerResult {
                            question_id: data.question_id.or(Some(question_id)),
                            accepted: data.accepted,
                            message: None,
                        });
                    }
                }
                Err(e) => {
                    let error = SubmissionError::FallbackFailed(e.to_string());
                    warn!("Answer for question {} lost: {}", question_id, error);
                    let first = self
                        .session
                        .as_mut()
                        .is_some_and(|s| s.note_submission_failure(question_id));
                    if first {
                        self.notify(Notice::SubmissionFailed {
                            question_id,
                            reason: error.to_string(),
                        });
                    }
                }
            },
            FallbackEvent::HeartbeatPosted { result, .. } => match result {
                Ok(()) => trace!("heartbeat posted"),
                Err(e) => debug!("heartbeat post failed: {}", e),
            },
        }
    }

    /// Stop every timer and close the push channel, keeping the resumable
    /// match record for the next start.
    fn shutdown(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.cancel_timers();
        }
        self.connection.disconnect();
    }
}

// ---------------------------------------------------------------------------
// Inbound push-channel frames
// ---------------------------------------------------------------------------

impl InboundHandler for Client {
    fn on_match_result(&mut self, envelope: ResponseEnvelope<MatchFound>) {
        self.pending_request = false;
        if !envelope.success {
            let message = envelope
                .message
                .unwrap_or_else(|| "matchmaking failed".to_string());
            warn!("Matchmaking failed: {}", message);
            self.notify(Notice::MatchmakingFailed { message });
            return;
        }
        let Some(found) = envelope.data else {
            warn!("Match result carried no match");
            return;
        };
        info!(
            "Match {} found with {} opponent(s)",
            found.match_id,
            found.opponents.len()
        );
        self.notify(Notice::MatchFound {
            match_id: found.match_id,
        });
        self.start_session(found.match_id);
    }

    fn on_join_result(&mut self, envelope: ResponseEnvelope<RoomStateWire>) {
        let Some(acked) = self.pending_joins.pop_front() else {
            debug!("join result with no join outstanding");
            return;
        };
        let now = self.clock.now_ms();
        let Some(session) = self
            .session
            .as_mut()
            .filter(|s| s.match_id() == acked && !s.is_finished())
        else {
            debug!("join result for match {} arrived after its session", acked);
            return;
        };

        if !envelope.success {
            let message = envelope
                .message
                .unwrap_or_else(|| "join rejected".to_string());
            warn!("Join for match {} rejected: {}", acked, message);
            self.notify(Notice::JoinFailed {
                match_id: acked,
                message,
            });
            self.end_session();
            return;
        }

        let update = match envelope.data {
            Some(wire) => {
                let snapshot = RoomSnapshot::recover(wire, acked, now);
                if snapshot.is_foreign() {
                    warn!(
                        "Join result for match {} carried match {}; not joined",
                        acked, snapshot.match_id
                    );
                    return;
                }
                session.apply_full_state(snapshot)
            }
            None => {
                warn!("Join result for match {} carried no room state", acked);
                SessionUpdate::default()
            }
        };
        session.mark_joined();
        info!("Joined match {}", acked);
        self.notify(Notice::Joined { match_id: acked });
        self.absorb(update);
    }

    fn on_answer_result(&mut self, envelope: ResponseEnvelope<AnswerResultData>) {
        let (question_id, accepted) = match &envelope.data {
            Some(data) => (data.question_id, envelope.success && data.accepted),
            None => (None, envelope.success),
        };
        debug!("answer result for {:?}: accepted={}", question_id, accepted);
        self.notify(Notice::AnswerResult {
            question_id,
            accepted,
            message: envelope.message,
        });
    }

    fn on_heartbeat_ack(&mut self, envelope: ResponseEnvelope<HeartbeatAckData>) {
        if !envelope.success {
            warn!("Heartbeat rejected: {:?}", envelope.message);
            return;
        }
        trace!(
            "heartbeat ack, server time {:?}",
            envelope.data.and_then(|d| d.server_time)
        );
    }

    fn on_room_event(&mut self, match_id: MatchId, event: RoomEvent) {
        let now = self.clock.now_ms();
        let Some(session) = self
            .session
            .as_mut()
            .filter(|s| s.match_id() == match_id)
        else {
            debug!("room event for match {} without its session", match_id);
            return;
        };
        let update = session.apply_room_event(event, now);
        self.absorb(update);
    }
}

// ---------------------------------------------------------------------------
// Main event loop
// ---------------------------------------------------------------------------

/// Wait for the next timer of the current session, if there is one.
async fn session_timer(session: &mut Option<MatchSession>) -> SessionTimer {
    match session {
        Some(session) => session.next_timer().await,
        None => std::future::pending().await,
    }
}

/// Run the main client event loop.
///
/// Listens on three channels using `tokio::select!`:
/// 1. Transport events from the WebSocket task
/// 2. Fallback API results
/// 3. User commands
///
/// alongside the connection timers (settle, connect timeout) and the session
/// timers (heartbeat, deadline, poll). Pushes notices through `notice_tx`.
pub async fn run(
    mut transport_rx: mpsc::Receiver<TransportEvent>,
    mut fallback_rx: mpsc::Receiver<FallbackEvent>,
    mut cmd_rx: mpsc::Receiver<UserCommand>,
    notice_tx: mpsc::Sender<Notice>,
    mut client: Client,
) -> anyhow::Result<()> {
    info!("Client event loop started");

    let mut transport_open = true;
    let mut fallback_open = true;

    loop {
        tokio::select! {
            // --- Transport events ---
            event = transport_rx.recv(), if transport_open => {
                match event {
                    Some(event) => client.handle_transport_event(event),
                    None => {
                        info!("Transport channel closed");
                        transport_open = false;
                    }
                }
            }

            // --- Fallback results ---
            event = fallback_rx.recv(), if fallback_open => {
                match event {
                    Some(event) => client.handle_fallback_event(event),
                    None => {
                        info!("Fallback channel closed");
                        fallback_open = false;
                    }
                }
            }

            // --- User commands ---
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(UserCommand::Quit) => {
                        info!("Quit command received, shutting down");
                        break;
                    }
                    Some(cmd) => client.handle_command(cmd),
                    None => {
                        info!("Command channel closed, shutting down");
                        break;
                    }
                }
            }

            // --- Connection timers ---
            timer = client.connection.next_timer() => {
                client.handle_connection_timer(timer);
            }

            // --- Session timers ---
            timer = session_timer(&mut client.session) => {
                client.handle_session_timer(timer);
            }
        }
        client.flush(&notice_tx).await;
    }

    client.shutdown();
    client.flush(&notice_tx).await;
    info!("Client event loop exiting");
    Ok(())
}
