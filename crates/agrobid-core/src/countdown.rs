// Countdown projection for the auction clock.

use chrono::{DateTime, Duration, Utc};

use crate::protocol::{AuctionId, AuctionView};

/// Shown once an auction is over.
pub const ENDED_TEXT: &str = "Auction ended";

/// Project the time left on `view` as seen at `now`.
///
/// `2d 3h 4m 5s`, `4m 5s`, `5s`: leading zero units are dropped. Before the
/// start date the text reads `Starts in ...`.
pub fn project(now: DateTime<Utc>, view: &AuctionView) -> String {
    if !view.is_active || now >= view.bid_end_date {
        return ENDED_TEXT.to_string();
    }
    if now < view.bid_start_date {
        return format!("Starts in {}", format_remaining(view.bid_start_date - now));
    }
    format_remaining(view.bid_end_date - now)
}

/// Render a positive duration as its largest nonzero units down to seconds.
pub fn format_remaining(remaining: Duration) -> String {
    let total = remaining.num_seconds().max(0);
    let units = [
        (total / 86_400, "d"),
        ((total % 86_400) / 3_600, "h"),
        ((total % 3_600) / 60, "m"),
        (total % 60, "s"),
    ];

    let first = units.iter().position(|(n, _)| *n > 0).unwrap_or(units.len() - 1);
    units[first..]
        .iter()
        .map(|(n, unit)| format!("{n}{unit}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Stateful projector that never leaves the ended state for an auction once
/// it has reached it, even if the wall clock steps backwards.
#[derive(Debug, Default)]
pub struct CountdownTicker {
    ended: Option<AuctionId>,
}

impl CountdownTicker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn project(&mut self, now: DateTime<Utc>, view: &AuctionView) -> String {
        if self.ended.as_ref() == Some(&view.auction_id) {
            return ENDED_TEXT.to_string();
        }
        let text = project(now, view);
        if text == ENDED_TEXT {
            self.ended = Some(view.auction_id.clone());
        }
        text
    }
}
