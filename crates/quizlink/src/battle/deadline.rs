// Active question round and the countdown derived from its end timestamp.

use tracing::warn;

use crate::protocol::{PhaseTag, QuestionId, QuestionInfo};

/// The question currently open in a match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuestionRound {
    pub question_id: QuestionId,
    pub round_no: u32,
    pub phase: PhaseTag,
    pub order_no: u32,
    pub time_limit_sec: u32,
    /// Authoritative close time, epoch milliseconds.
    pub end_timestamp_ms: i64,
}

impl QuestionRound {
    /// Build a round from its wire form.
    ///
    /// The end timestamp prefers a directly reported remaining time, then
    /// `startedAt + timeLimitSec`. With neither, the full time limit is
    /// counted from `now_ms`.
    pub fn from_info(info: &QuestionInfo, now_ms: i64) -> Self {
        let limit_ms = i64::from(info.time_limit_sec) * 1000;
        let end_timestamp_ms = match (info.remaining_ms, info.started_at) {
            (Some(remaining), _) => now_ms + remaining.max(0),
            (None, Some(started_at)) => started_at + limit_ms,
            (None, None) => {
                warn!(
                    question_id = info.question_id,
                    "question has no startedAt or remaining time; counting from now"
                );
                now_ms + limit_ms
            }
        };

        Self {
            question_id: info.question_id,
            round_no: info.round_no,
            phase: info.phase,
            order_no: info.order_no,
            time_limit_sec: info.time_limit_sec,
            end_timestamp_ms,
        }
    }
}

/// Whole seconds left until `end_ms`, rounded up and floored at zero.
pub fn remaining_secs(end_ms: i64, now_ms: i64) -> u32 {
    let left = end_ms - now_ms;
    if left <= 0 {
        return 0;
    }
    let secs = (left + 999) / 1000;
    u32::try_from(secs).unwrap_or(u32::MAX)
}

/// Result of one clock tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockTick {
    pub remaining: u32,
    /// The displayed value differs from the previous tick.
    pub changed: bool,
    /// Zero was reached on this tick. True at most once per clock.
    pub expired: bool,
}

/// Countdown for one question. Purely derived from the end timestamp.
#[derive(Debug, Clone)]
pub struct DeadlineClock {
    question_id: QuestionId,
    end_ms: i64,
    last_remaining: Option<u32>,
    expired: bool,
}

impl DeadlineClock {
    pub fn new(round: &QuestionRound) -> Self {
        Self {
            question_id: round.question_id,
            end_ms: round.end_timestamp_ms,
            last_remaining: None,
            expired: false,
        }
    }

    pub fn question_id(&self) -> QuestionId {
        self.question_id
    }

    /// Move the end timestamp (a fresher authoritative value for the same
    /// question). Expiry already observed stays observed.
    pub fn retarget(&mut self, end_ms: i64) {
        self.end_ms = end_ms;
    }

    pub fn tick(&mut self, now_ms: i64) -> ClockTick {
        let remaining = remaining_secs(self.end_ms, now_ms);
        let changed = self.last_remaining != Some(remaining);
        self.last_remaining = Some(remaining);

        let expired = remaining == 0 && !self.expired;
        if expired {
            self.expired = true;
        }

        ClockTick {
            remaining,
            changed,
            expired,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(question_id: QuestionId) -> QuestionInfo {
        QuestionInfo {
            question_id,
            round_no: 1,
            phase: PhaseTag::Main,
            order_no: 1,
            time_limit_sec: 20,
            started_at: None,
            remaining_ms: None,
            answered: false,
            content: None,
        }
    }

    #[test]
    fn ceiling_rounding() {
        assert_eq!(remaining_secs(10_500, 0), 11);
        assert_eq!(remaining_secs(10_000, 0), 10);
        assert_eq!(remaining_secs(1, 0), 1);
        assert_eq!(remaining_secs(0, 0), 0);
        assert_eq!(remaining_secs(0, 5_000), 0);
    }

    #[test]
    fn end_timestamp_from_started_at() {
        let mut q = info(501);
        q.started_at = Some(1_000_000);
        let round = QuestionRound::from_info(&q, 1_005_000);
        assert_eq!(round.end_timestamp_ms, 1_020_000);
    }

    #[test]
    fn remaining_time_wins_over_started_at() {
        let mut q = info(501);
        q.started_at = Some(1_000_000);
        q.remaining_ms = Some(3_000);
        let round = QuestionRound::from_info(&q, 2_000_000);
        assert_eq!(round.end_timestamp_ms, 2_003_000);
    }

    #[test]
    fn missing_timing_counts_full_limit_from_now() {
        let round = QuestionRound::from_info(&info(1), 50_000);
        assert_eq!(round.end_timestamp_ms, 70_000);
    }

    #[test]
    fn countdown_expires_exactly_once() {
        let round = QuestionRound {
            question_id: 501,
            round_no: 1,
            phase: PhaseTag::Main,
            order_no: 1,
            time_limit_sec: 20,
            end_timestamp_ms: 10_500,
        };
        let mut clock = DeadlineClock::new(&round);

        let first = clock.tick(0);
        assert_eq!(first.remaining, 11);
        assert!(first.changed);
        assert!(!first.expired);

        let same = clock.tick(200);
        assert_eq!(same.remaining, 11);
        assert!(!same.changed);

        let mut expirations = 0;
        let mut now = 0;
        while now <= 12_000 {
            if clock.tick(now).expired {
                expirations += 1;
            }
            now += 200;
        }
        assert_eq!(expirations, 1);
        let after = clock.tick(20_000);
        assert_eq!(after.remaining, 0);
        assert!(!after.expired);
    }

    #[test]
    fn retarget_keeps_expiry_state() {
        let mut q = info(2);
        q.started_at = Some(0);
        let round = QuestionRound::from_info(&q, 0);
        let mut clock = DeadlineClock::new(&round);
        assert!(clock.tick(25_000).expired);
        clock.retarget(30_000);
        let tick = clock.tick(25_000);
        assert_eq!(tick.remaining, 5);
        assert!(!tick.expired);
        assert!(!clock.tick(31_000).expired);
    }
}
