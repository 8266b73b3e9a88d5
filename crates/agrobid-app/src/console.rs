// Line-oriented console: parses stdin commands into session commands and
// renders session updates as single lines for stdout.

use agrobid_core::membership::MembershipPhase;
use agrobid_core::submission::SubmissionOutcome;
use thiserror::Error;

use crate::session::{SessionCommand, SessionUpdate};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("unknown command `{0}` (try: bid <amount>, join <id>, leave, quit)")]
    Unknown(String),

    #[error("`{command}` needs {argument}")]
    MissingArgument {
        command: &'static str,
        argument: &'static str,
    },

    #[error("invalid amount `{0}`")]
    InvalidAmount(String),
}

/// Parse one input line. Blank lines yield `Ok(None)`.
pub fn parse_command(line: &str) -> Result<Option<SessionCommand>, CommandError> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };

    let command = match verb.to_ascii_lowercase().as_str() {
        "bid" => {
            let raw = words.next().ok_or(CommandError::MissingArgument {
                command: "bid",
                argument: "an amount",
            })?;
            SessionCommand::PlaceBid {
                amount: parse_amount(raw)?,
            }
        }
        "join" => {
            let id = words.next().ok_or(CommandError::MissingArgument {
                command: "join",
                argument: "an auction id",
            })?;
            SessionCommand::Join(id.into())
        }
        "leave" => SessionCommand::Leave,
        "quit" | "exit" => SessionCommand::Shutdown,
        other => return Err(CommandError::Unknown(other.to_string())),
    };
    Ok(Some(command))
}

/// Amounts are whole currency units; `,` and `_` separators are allowed.
fn parse_amount(raw: &str) -> Result<u64, CommandError> {
    let digits: String = raw.chars().filter(|c| *c != ',' && *c != '_').collect();
    match digits.parse::<u64>() {
        Ok(amount) if amount > 0 => Ok(amount),
        _ => Err(CommandError::InvalidAmount(raw.to_string())),
    }
}

/// One display line per update. Connection churn while reconnecting is left
/// to the log file.
pub fn render_update(update: &SessionUpdate) -> Option<String> {
    let line = match update {
        SessionUpdate::View(Some(view)) => {
            let leader = view
                .current_highest_bidder_name
                .as_deref()
                .unwrap_or("no bids yet");
            let status = if view.is_active { "" } else { " [ended]" };
            format!(
                "{} ({}): highest {} by {}, {} bids{}",
                view.product_name,
                view.auction_id,
                view.current_highest_bid,
                leader,
                view.total_bids,
                status
            )
        }
        SessionUpdate::View(None) => "No auction loaded".to_string(),
        SessionUpdate::Membership(phase) => match phase {
            MembershipPhase::Idle => "Not in an auction".to_string(),
            MembershipPhase::Joining { auction_id, .. } => format!("Joining auction {auction_id}..."),
            MembershipPhase::Joined { auction_id } => format!("Joined auction {auction_id}"),
            MembershipPhase::Leaving { auction_id } => format!("Leaving auction {auction_id}..."),
        },
        SessionUpdate::Connection(state) if state.connected => "Connected".to_string(),
        SessionUpdate::Connection(state) if state.reconnect_attempt == 0 => "Disconnected".to_string(),
        SessionUpdate::Connection(_) => return None,
        SessionUpdate::TransportFailed { attempts } => {
            format!("Connection lost after {attempts} reconnect attempts; bids go over REST")
        }
        SessionUpdate::Countdown(text) => format!("Time left: {text}"),
        SessionUpdate::Submission(outcome) => render_outcome(outcome),
        SessionUpdate::BidRefused(e) => format!("Bid not sent: {e}"),
        SessionUpdate::MembershipRefused(e) => format!("Cannot do that: {e}"),
        SessionUpdate::FallbackFailed { auction_id, reason } => {
            format!("Could not load auction {auction_id}: {reason}")
        }
        SessionUpdate::ServerError(message) => format!("Server error: {message}"),
    };
    Some(line)
}

fn render_outcome(outcome: &SubmissionOutcome) -> String {
    match outcome {
        SubmissionOutcome::Accepted { amount, .. } => format!("Bid of {amount} accepted"),
        SubmissionOutcome::Rejected { amount, reason, .. } => {
            format!("Bid of {amount} rejected: {reason}")
        }
        SubmissionOutcome::Failed { amount, reason, .. } => {
            format!("Bid of {amount} not placed ({reason}); safe to retry")
        }
        SubmissionOutcome::Unknown { amount, .. } => {
            format!("Bid of {amount}: no confirmation, check the auction before retrying")
        }
        SubmissionOutcome::Cancelled { amount, .. } => format!("Bid of {amount} cancelled"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agrobid_core::transport::ConnectionState;

    #[test]
    fn parses_bid_with_separators() {
        assert_eq!(
            parse_command("bid 95,000").unwrap(),
            Some(SessionCommand::PlaceBid { amount: 95_000 })
        );
        assert_eq!(
            parse_command("  BID 1_500 ").unwrap(),
            Some(SessionCommand::PlaceBid { amount: 1_500 })
        );
    }

    #[test]
    fn rejects_bad_amounts() {
        assert_eq!(
            parse_command("bid lots"),
            Err(CommandError::InvalidAmount("lots".into()))
        );
        assert_eq!(parse_command("bid 0"), Err(CommandError::InvalidAmount("0".into())));
        assert!(matches!(
            parse_command("bid"),
            Err(CommandError::MissingArgument { command: "bid", .. })
        ));
    }

    #[test]
    fn parses_membership_commands() {
        assert_eq!(
            parse_command("join lot-7").unwrap(),
            Some(SessionCommand::Join("lot-7".into()))
        );
        assert_eq!(parse_command("leave").unwrap(), Some(SessionCommand::Leave));
        assert_eq!(parse_command("quit").unwrap(), Some(SessionCommand::Shutdown));
        assert_eq!(parse_command("exit").unwrap(), Some(SessionCommand::Shutdown));
    }

    #[test]
    fn blank_line_is_nothing() {
        assert_eq!(parse_command("   ").unwrap(), None);
    }

    #[test]
    fn unknown_verb() {
        assert_eq!(parse_command("sell 5"), Err(CommandError::Unknown("sell".into())));
    }

    #[test]
    fn renders_outcomes() {
        let line = render_update(&SessionUpdate::Submission(SubmissionOutcome::Rejected {
            auction_id: "a-1".into(),
            amount: 95_000,
            reason: "outbid".into(),
        }))
        .unwrap();
        assert_eq!(line, "Bid of 95000 rejected: outbid");

        let line = render_update(&SessionUpdate::Submission(SubmissionOutcome::Unknown {
            auction_id: "a-1".into(),
            amount: 95_000,
        }))
        .unwrap();
        assert!(line.contains("no confirmation"));
    }

    #[test]
    fn reconnect_churn_is_not_printed() {
        let reconnecting = ConnectionState {
            connected: false,
            reconnect_attempt: 2,
        };
        assert!(render_update(&SessionUpdate::Connection(reconnecting)).is_none());
        assert_eq!(
            render_update(&SessionUpdate::Connection(ConnectionState {
                connected: true,
                reconnect_attempt: 0
            }))
            .as_deref(),
            Some("Connected")
        );
    }
}
