// Participant table, replaced wholesale from every authoritative payload.

use std::collections::HashSet;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::protocol::{PhaseTag, ScoreItem, UserId};

/// One participant as last reported by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Participant {
    pub user_id: UserId,
    pub display_name: String,
    pub alive: bool,
    pub revived: bool,
    pub score: i64,
    pub correct_count: u32,
    pub total_count: u32,
    pub rank: u32,
}

impl From<&ScoreItem> for Participant {
    fn from(item: &ScoreItem) -> Self {
        Participant {
            user_id: item.user_id,
            display_name: item.display_name.clone(),
            alive: item.alive,
            revived: item.revived,
            score: item.score,
            correct_count: item.correct_count,
            total_count: item.total_count,
            rank: item.rank,
        }
    }
}

/// Convert wire items into participants, keeping server order and the first
/// entry for any repeated user id.
pub fn participants_from_items(items: &[ScoreItem]) -> Vec<Participant> {
    let mut seen = HashSet::with_capacity(items.len());
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        if !seen.insert(item.user_id) {
            warn!(user_id = item.user_id, "duplicate participant in payload, keeping first");
            continue;
        }
        out.push(Participant::from(item));
    }
    out
}

/// Changes worth telling the user about, produced by reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreboardSignal {
    /// Self went from alive to eliminated; submissions are now disabled.
    SelfEliminated,
    /// Self came back; submissions are enabled again.
    SelfRevived,
    /// Self is eliminated during a revival phase and was not revived.
    NotEligibleToRevive,
    /// Two-participant match dropped to one entry.
    OpponentDeparted { winner_id: UserId },
}

/// Owns the participant table and the self-status flags derived from it.
#[derive(Debug, Clone)]
pub struct ScoreboardReconciler {
    self_id: Option<UserId>,
    participants: Vec<Participant>,
    spectating: bool,
    phase: PhaseTag,
    revival_notice_raised: bool,
    opponent_departure_signaled: bool,
}

impl ScoreboardReconciler {
    pub fn new(self_id: Option<UserId>) -> Self {
        Self {
            self_id,
            participants: Vec::new(),
            spectating: false,
            phase: PhaseTag::Main,
            revival_notice_raised: false,
            opponent_departure_signaled: false,
        }
    }

    pub fn participants(&self) -> &[Participant] {
        &self.participants
    }

    pub fn self_id(&self) -> Option<UserId> {
        self.self_id
    }

    pub fn set_self_id(&mut self, self_id: UserId) {
        self.self_id = Some(self_id);
    }

    pub fn me(&self) -> Option<&Participant> {
        let id = self.self_id?;
        self.participants.iter().find(|p| p.user_id == id)
    }

    /// Eliminated and not (yet) revived: submissions are no-ops.
    pub fn is_spectating(&self) -> bool {
        self.spectating
    }

    pub fn phase(&self) -> PhaseTag {
        self.phase
    }

    /// Replace the whole table with `participants`, in the order given.
    pub fn replace(&mut self, participants: Vec<Participant>) -> Vec<ScoreboardSignal> {
        let mut signals = Vec::new();

        let previous_len = self.participants.len();
        let was_alive = self.me().map(|p| p.alive);
        self.participants = participants;
        let now_alive = self.me().map(|p| p.alive);

        match (was_alive, now_alive) {
            (Some(true), Some(false)) => {
                info!("self eliminated, switching to spectator mode");
                self.spectating = true;
                signals.push(ScoreboardSignal::SelfEliminated);
            }
            (Some(false), Some(true)) => {
                info!("self revived, submissions re-enabled");
                self.spectating = false;
                signals.push(ScoreboardSignal::SelfRevived);
            }
            (None, Some(alive)) => {
                // First sighting (fresh join or recovery): adopt silently.
                self.spectating = !alive;
            }
            _ => {}
        }

        if previous_len == 2 && self.participants.len() == 1 && !self.opponent_departure_signaled {
            let winner_id = self.participants[0].user_id;
            info!(winner_id, "opponent departed from two-participant match");
            self.opponent_departure_signaled = true;
            signals.push(ScoreboardSignal::OpponentDeparted { winner_id });
        }

        signals.extend(self.check_revival_eligibility());
        debug!(count = self.participants.len(), "scoreboard replaced");
        signals
    }

    /// Record the phase tag of the round now in play. Leaving a phase resets
    /// the once-per-phase revival notice.
    pub fn enter_phase(&mut self, phase: PhaseTag) -> Option<ScoreboardSignal> {
        if phase != self.phase {
            self.phase = phase;
            self.revival_notice_raised = false;
        }
        self.check_revival_eligibility()
    }

    /// The current phase ended (match finished or phase switch announced).
    pub fn end_phase(&mut self) {
        self.revival_notice_raised = false;
    }

    fn check_revival_eligibility(&mut self) -> Option<ScoreboardSignal> {
        if self.phase != PhaseTag::Revival || self.revival_notice_raised {
            return None;
        }
        let me = self.me()?;
        if !me.alive && !me.revived {
            self.revival_notice_raised = true;
            return Some(ScoreboardSignal::NotEligibleToRevive);
        }
        None
    }
}
