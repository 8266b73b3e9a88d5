// Bid submission gating.
//
// Holds at most one in-flight bid and tracks it through the pre-flight
// check and the wait for the server's confirmation. The controller never
// touches the auction view: a confirmed bid shows up there only when the
// matching delta arrives.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::protocol::{AuctionId, AuctionView, BidAcceptance};

/// Why a bid was refused before any network call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error("no auction is loaded")]
    NoAuction,

    #[error("bid of {amount} must exceed the current highest bid of {current}")]
    NotAboveHighest { amount: u64, current: u64 },

    #[error("a bid of {amount} is already being submitted")]
    AlreadyPending { amount: u64 },

    #[error("the auction has ended")]
    AuctionEnded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BidStage {
    Preflight,
    AwaitingConfirmation,
}

/// The single bid currently in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingBid {
    pub auction_id: AuctionId,
    pub amount: u64,
    pub submitted_at: DateTime<Utc>,
    /// Identifies this submission across timers and spawned calls.
    pub ticket: u64,
    pub stage: BidStage,
}

/// How a submission ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmissionOutcome {
    /// The server committed the bid.
    Accepted {
        auction_id: AuctionId,
        amount: u64,
        current_highest_bid: u64,
    },
    /// Pre-flight or the server said no. The view is unaffected.
    Rejected {
        auction_id: AuctionId,
        amount: u64,
        reason: String,
    },
    /// The pre-flight call itself failed; nothing was committed.
    Failed {
        auction_id: AuctionId,
        amount: u64,
        reason: String,
    },
    /// No confirmation within the window. The bid may or may not have been
    /// applied, so it is not retried.
    Unknown { auction_id: AuctionId, amount: u64 },
    /// Abandoned because the client left the auction.
    Cancelled { auction_id: AuctionId, amount: u64 },
}

#[derive(Debug, Default)]
pub struct BidController {
    pending: Option<PendingBid>,
    next_ticket: u64,
}

impl BidController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending(&self) -> Option<&PendingBid> {
        self.pending.as_ref()
    }

    /// Check `amount` against the view and record it as pending.
    ///
    /// Any error means no network call may be made.
    pub fn submit(
        &mut self,
        amount: u64,
        view: Option<&AuctionView>,
        now: DateTime<Utc>,
    ) -> Result<PendingBid, SubmitError> {
        let view = view
            .filter(|v| !v.auction_id.is_empty())
            .ok_or(SubmitError::NoAuction)?;

        if let Some(pending) = &self.pending {
            return Err(SubmitError::AlreadyPending {
                amount: pending.amount,
            });
        }
        if !view.is_active {
            return Err(SubmitError::AuctionEnded);
        }
        if amount <= view.current_highest_bid {
            return Err(SubmitError::NotAboveHighest {
                amount,
                current: view.current_highest_bid,
            });
        }

        self.next_ticket += 1;
        let pending = PendingBid {
            auction_id: view.auction_id.clone(),
            amount,
            submitted_at: now,
            ticket: self.next_ticket,
            stage: BidStage::Preflight,
        };
        info!(
            "Submitting bid of {} on auction {} (ticket {})",
            amount, pending.auction_id, pending.ticket
        );
        self.pending = Some(pending.clone());
        Ok(pending)
    }

    /// Pre-flight approved ticket `ticket`. Returns the bid to place, or
    /// `None` if the ticket is no longer pending.
    pub fn preflight_passed(&mut self, ticket: u64) -> Option<PendingBid> {
        let pending = self.pending.as_mut().filter(|p| {
            p.ticket == ticket && p.stage == BidStage::Preflight
        })?;
        pending.stage = BidStage::AwaitingConfirmation;
        Some(pending.clone())
    }

    /// Pre-flight answered `valid: false`.
    pub fn preflight_rejected(&mut self, ticket: u64, reason: String) -> Option<SubmissionOutcome> {
        let pending = self.take_ticket(ticket)?;
        info!("Bid of {} rejected by pre-flight: {}", pending.amount, reason);
        Some(SubmissionOutcome::Rejected {
            auction_id: pending.auction_id,
            amount: pending.amount,
            reason,
        })
    }

    /// The pre-flight call failed before producing an answer.
    pub fn preflight_failed(&mut self, ticket: u64, reason: String) -> Option<SubmissionOutcome> {
        let pending = self.take_ticket(ticket)?;
        warn!("Pre-flight for bid of {} failed: {}", pending.amount, reason);
        Some(SubmissionOutcome::Failed {
            auction_id: pending.auction_id,
            amount: pending.amount,
            reason,
        })
    }

    /// Placing the bid failed after pre-flight, with the outcome unknown or
    /// definitively rejected depending on `rejected`.
    pub fn placement_failed(
        &mut self,
        ticket: u64,
        reason: String,
        rejected: bool,
    ) -> Option<SubmissionOutcome> {
        let pending = self.take_ticket(ticket)?;
        warn!("Placing bid of {} failed: {}", pending.amount, reason);
        Some(if rejected {
            SubmissionOutcome::Rejected {
                auction_id: pending.auction_id,
                amount: pending.amount,
                reason,
            }
        } else {
            SubmissionOutcome::Unknown {
                auction_id: pending.auction_id,
                amount: pending.amount,
            }
        })
    }

    /// The server confirmed a bid.
    pub fn confirm(&mut self, acceptance: &BidAcceptance) -> Option<SubmissionOutcome> {
        let matches = self.pending.as_ref().is_some_and(|p| {
            p.stage == BidStage::AwaitingConfirmation
                && p.auction_id == acceptance.bid.auction_id
                && p.amount == acceptance.bid.amount
        });
        if !matches {
            debug!(
                "Ignoring confirmation of {} on auction {}: no matching pending bid",
                acceptance.bid.amount, acceptance.bid.auction_id
            );
            return None;
        }

        let pending = self.pending.take()?;
        info!("Bid of {} on auction {} accepted", pending.amount, pending.auction_id);
        Some(SubmissionOutcome::Accepted {
            auction_id: pending.auction_id,
            amount: pending.amount,
            current_highest_bid: acceptance.current_highest_bid,
        })
    }

    /// The server rejected the bid in flight.
    pub fn reject(&mut self, reason: String) -> Option<SubmissionOutcome> {
        if self
            .pending
            .as_ref()
            .map_or(true, |p| p.stage != BidStage::AwaitingConfirmation)
        {
            debug!("Ignoring bid rejection with nothing awaiting confirmation: {reason}");
            return None;
        }
        let pending = self.pending.take()?;
        info!("Bid of {} rejected by server: {}", pending.amount, reason);
        Some(SubmissionOutcome::Rejected {
            auction_id: pending.auction_id,
            amount: pending.amount,
            reason,
        })
    }

    /// The confirmation window for `ticket` closed.
    pub fn timed_out(&mut self, ticket: u64) -> Option<SubmissionOutcome> {
        let still_waiting = self
            .pending
            .as_ref()
            .is_some_and(|p| p.ticket == ticket && p.stage == BidStage::AwaitingConfirmation);
        if !still_waiting {
            return None;
        }
        let pending = self.pending.take()?;
        warn!(
            "No confirmation for bid of {} on auction {}; outcome unknown",
            pending.amount, pending.auction_id
        );
        Some(SubmissionOutcome::Unknown {
            auction_id: pending.auction_id,
            amount: pending.amount,
        })
    }

    /// Abandon whatever is in flight.
    pub fn cancel(&mut self) -> Option<SubmissionOutcome> {
        let pending = self.pending.take()?;
        info!("Cancelled bid of {} on auction {}", pending.amount, pending.auction_id);
        Some(SubmissionOutcome::Cancelled {
            auction_id: pending.auction_id,
            amount: pending.amount,
        })
    }

    fn take_ticket(&mut self, ticket: u64) -> Option<PendingBid> {
        if self.pending.as_ref().is_some_and(|p| p.ticket == ticket) {
            self.pending.take()
        } else {
            None
        }
    }
}
