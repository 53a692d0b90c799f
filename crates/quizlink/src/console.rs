// Line-oriented console: stdin commands in, notices out on stdout.
//
// Translates typed lines into UserCommand messages for the event loop and
// prints every notice it receives as one line.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::protocol::{ConnectionStatus, Notice, UserCommand};

pub const HELP: &str = "commands: match | cancel | join <matchId> | answer <text> | \
                        answer <questionId> <text> | stop | disconnect | quit";

/// Parse one input line.
///
/// Returns `Ok(None)` for blank lines and `Err` with a message for anything
/// unrecognized.
pub fn parse_line(line: &str) -> Result<Option<UserCommand>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    let cmd = match word.to_ascii_lowercase().as_str() {
        "match" => UserCommand::RequestMatch,
        "cancel" => UserCommand::CancelMatch,
        "join" => {
            let match_id = rest
                .parse()
                .map_err(|_| format!("join needs a numeric match id, got {rest:?}"))?;
            UserCommand::Join(match_id)
        }
        "answer" => parse_answer(rest)?,
        "stop" => UserCommand::StopHeartbeat,
        "disconnect" => UserCommand::Disconnect,
        "quit" | "exit" => UserCommand::Quit,
        other => return Err(format!("unknown command {other:?}")),
    };
    Ok(Some(cmd))
}

/// `answer B` targets the active question; `answer 501 B` names one.
fn parse_answer(rest: &str) -> Result<UserCommand, String> {
    if rest.is_empty() {
        return Err("answer needs a value".to_string());
    }
    if let Some((first, answer)) = rest.split_once(char::is_whitespace) {
        if let Ok(question_id) = first.parse() {
            return Ok(UserCommand::Submit {
                question_id: Some(question_id),
                answer: answer.trim().to_string(),
            });
        }
    }
    Ok(UserCommand::Submit {
        question_id: None,
        answer: rest.to_string(),
    })
}

/// One display line per notice.
pub fn render(notice: &Notice) -> String {
    match notice {
        Notice::ConnectionStatus(status) => {
            let label = match status {
                ConnectionStatus::Disconnected => "disconnected",
                ConnectionStatus::Connecting => "connecting",
                ConnectionStatus::Connected => "connected",
                ConnectionStatus::Reconnecting => "reconnecting",
            };
            format!("[link] {label}")
        }
        Notice::MatchFound { match_id } => format!("[match] found match {match_id}"),
        Notice::MatchmakingFailed { message } => format!("[match] matchmaking failed: {message}"),
        Notice::Joined { match_id } => format!("[match] joined {match_id}"),
        Notice::JoinFailed { match_id, message } => {
            format!("[match] could not join {match_id}: {message}")
        }
        Notice::PhaseChanged(phase) => format!("[phase] {phase:?}"),
        Notice::QuestionStarted {
            question_id,
            round_no,
            phase,
            time_limit_sec,
        } => format!(
            "[question] #{question_id} round {round_no} ({phase:?}), {time_limit_sec}s"
        ),
        Notice::QuestionDetail {
            question_id,
            content,
        } => format!("[question] #{question_id} {content}"),
        Notice::Remaining {
            question_id,
            seconds,
        } => format!("[timer] #{question_id} {seconds}s left"),
        Notice::Scoreboard(rows) => {
            let table: Vec<String> = rows
                .iter()
                .map(|p| {
                    let name = if p.display_name.is_empty() {
                        p.user_id.to_string()
                    } else {
                        p.display_name.clone()
                    };
                    let status = if p.alive { "" } else { " (out)" };
                    format!("{}. {} {}{}", p.rank, name, p.score, status)
                })
                .collect();
            format!("[score] {}", table.join(" | "))
        }
        Notice::Eliminated => "[you] eliminated; spectating".to_string(),
        Notice::Revived => "[you] revived".to_string(),
        Notice::NotEligibleToRevive => "[you] not eligible to revive".to_string(),
        Notice::OpponentDeparted { winner_id } => {
            format!("[match] opponent left; {winner_id} wins")
        }
        Notice::SubmissionAccepted {
            question_id,
            auto_submitted,
            channel,
        } => {
            let how = if *auto_submitted { "auto-submitted" } else { "submitted" };
            format!("[answer] #{question_id} {how} via {channel:?}")
        }
        Notice::SubmissionFailed {
            question_id,
            reason,
        } => format!("[answer] #{question_id} failed: {reason}"),
        Notice::AnswerResult {
            question_id,
            accepted,
            message,
        } => {
            let id = question_id.map_or_else(|| "?".to_string(), |id| id.to_string());
            let verdict = if *accepted { "accepted" } else { "rejected" };
            match message {
                Some(message) => format!("[answer] #{id} {verdict}: {message}"),
                None => format!("[answer] #{id} {verdict}"),
            }
        }
        Notice::MatchFinished { winner_id } => match winner_id {
            Some(winner) => format!("[match] finished; winner {winner}"),
            None => "[match] finished".to_string(),
        },
    }
}

/// Run the console until stdin closes, the user quits, or the event loop
/// goes away.
pub async fn run(
    mut notice_rx: mpsc::Receiver<Notice>,
    cmd_tx: mpsc::Sender<UserCommand>,
) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut stdin_open = true;

    stdout.write_all(format!("{HELP}\n").as_bytes()).await?;

    loop {
        tokio::select! {
            notice = notice_rx.recv() => {
                match notice {
                    Some(notice) => {
                        stdout.write_all(format!("{}\n", render(&notice)).as_bytes()).await?;
                        stdout.flush().await?;
                    }
                    None => {
                        debug!("notice channel closed");
                        break;
                    }
                }
            }

            line = lines.next_line(), if stdin_open => {
                match line? {
                    Some(line) => match parse_line(&line) {
                        Ok(Some(cmd)) => {
                            let quit = cmd == UserCommand::Quit;
                            if cmd_tx.send(cmd).await.is_err() || quit {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(message) => {
                            stdout.write_all(format!("{message}\n{HELP}\n").as_bytes()).await?;
                        }
                    },
                    None => {
                        info!("stdin closed");
                        stdin_open = false;
                        let _ = cmd_tx.send(UserCommand::Quit).await;
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::battle::submission::SubmitChannel;

    #[test]
    fn parses_simple_commands() {
        assert_eq!(parse_line("match"), Ok(Some(UserCommand::RequestMatch)));
        assert_eq!(parse_line("  CANCEL "), Ok(Some(UserCommand::CancelMatch)));
        assert_eq!(parse_line("join 42"), Ok(Some(UserCommand::Join(42))));
        assert_eq!(parse_line("stop"), Ok(Some(UserCommand::StopHeartbeat)));
        assert_eq!(parse_line("disconnect"), Ok(Some(UserCommand::Disconnect)));
        assert_eq!(parse_line("quit"), Ok(Some(UserCommand::Quit)));
        assert_eq!(parse_line("   "), Ok(None));
    }

    #[test]
    fn answer_with_and_without_question_id() {
        assert_eq!(
            parse_line("answer B"),
            Ok(Some(UserCommand::Submit {
                question_id: None,
                answer: "B".into()
            }))
        );
        assert_eq!(
            parse_line("answer 501 the moon"),
            Ok(Some(UserCommand::Submit {
                question_id: Some(501),
                answer: "the moon".into()
            }))
        );
        assert_eq!(
            parse_line("answer two words"),
            Ok(Some(UserCommand::Submit {
                question_id: None,
                answer: "two words".into()
            }))
        );
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse_line("join abc").is_err());
        assert!(parse_line("answer").is_err());
        assert!(parse_line("dance").is_err());
    }

    #[test]
    fn renders_notices() {
        assert_eq!(
            render(&Notice::Remaining {
                question_id: 501,
                seconds: 11
            }),
            "[timer] #501 11s left"
        );
        assert_eq!(
            render(&Notice::SubmissionAccepted {
                question_id: 501,
                auto_submitted: true,
                channel: SubmitChannel::Push,
            }),
            "[answer] #501 auto-submitted via Push"
        );
        assert_eq!(
            render(&Notice::MatchFinished { winner_id: None }),
            "[match] finished"
        );
    }
}
