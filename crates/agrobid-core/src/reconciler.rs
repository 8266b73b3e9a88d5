// Auction state reconciliation.
//
// Folds snapshots and deltas from the real-time channel and the REST
// fallback into the single `AuctionView` for the joined auction. Arrival
// order across the wire is not guaranteed, so every delta is guarded by a
// matching auction id and a strictly increasing highest bid.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::protocol::{AuctionDelta, AuctionId, AuctionStatus, AuctionView, BidEntry, ProtocolAnomaly};

/// Default cap on `AuctionView::recent_bids`.
pub const DEFAULT_RECENT_BIDS_CAP: usize = 50;

/// Default cap on deltas held back while a join is syncing.
pub const DEFAULT_DELTA_BUFFER_CAP: usize = 64;

/// What happened to a delta handed to [`Reconciler::apply_delta`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOutcome {
    /// The view changed.
    Applied,
    /// The bid did not exceed the current highest bid.
    Stale,
    /// The delta belongs to a different auction than the one held.
    Mismatched,
    /// Held back until the pending snapshot arrives.
    Buffered,
    /// Accepted but carried nothing new (or there was no view at all).
    Ignored,
}

/// Counters for dropped and applied updates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcilerStats {
    pub applied: u64,
    pub stale: u64,
    pub mismatched: u64,
    pub anomalies: u64,
}

/// Sole owner and writer of the current [`AuctionView`].
#[derive(Debug)]
pub struct Reconciler {
    view: Option<AuctionView>,
    /// Auction whose snapshot we are waiting for. Deltas for it are buffered.
    syncing: Option<AuctionId>,
    buffered: VecDeque<AuctionDelta>,
    recent_bids_cap: usize,
    buffer_cap: usize,
    stats: ReconcilerStats,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new(DEFAULT_RECENT_BIDS_CAP, DEFAULT_DELTA_BUFFER_CAP)
    }
}

impl Reconciler {
    pub fn new(recent_bids_cap: usize, buffer_cap: usize) -> Self {
        Reconciler {
            view: None,
            syncing: None,
            buffered: VecDeque::new(),
            recent_bids_cap: recent_bids_cap.max(1),
            buffer_cap: buffer_cap.max(1),
            stats: ReconcilerStats::default(),
        }
    }

    /// Read-only access to the current view.
    pub fn view(&self) -> Option<&AuctionView> {
        self.view.as_ref()
    }

    pub fn stats(&self) -> ReconcilerStats {
        self.stats
    }

    /// Whether a snapshot is still outstanding for `auction_id`.
    pub fn is_syncing(&self, auction_id: &AuctionId) -> bool {
        self.syncing.as_ref() == Some(auction_id)
    }

    /// True when the held view belongs to `auction_id` and is not awaiting a
    /// fresh snapshot.
    pub fn has_synced_view(&self, auction_id: &AuctionId) -> bool {
        self.syncing.is_none()
            && self
                .view
                .as_ref()
                .is_some_and(|v| v.auction_id == *auction_id)
    }

    /// Start waiting for a snapshot of `auction_id`.
    ///
    /// A view of the same auction (a rejoin) stays visible until the snapshot
    /// replaces it; a view of any other auction is dropped.
    pub fn begin_sync(&mut self, auction_id: AuctionId) {
        if self
            .view
            .as_ref()
            .is_some_and(|v| v.auction_id != auction_id)
        {
            self.view = None;
        }
        if !self.buffered.is_empty() {
            debug!("Discarding {} buffered deltas", self.buffered.len());
            self.buffered.clear();
        }
        self.syncing = Some(auction_id);
    }

    /// Replace the view wholesale.
    ///
    /// Always accepted. Deltas buffered for the same auction are replayed
    /// through the usual guards afterwards; the rest are discarded. Returns
    /// the number of buffered deltas that changed the view.
    pub fn apply_snapshot(&mut self, mut snapshot: AuctionView) -> usize {
        snapshot.recent_bids.truncate(self.recent_bids_cap);
        info!(
            "Snapshot for auction {}: highest bid {} after {} bids",
            snapshot.auction_id, snapshot.current_highest_bid, snapshot.total_bids
        );

        self.syncing = None;
        let buffered = std::mem::take(&mut self.buffered);
        self.view = Some(snapshot);

        let mut replayed = 0;
        for delta in buffered {
            if self.apply_delta(delta) == DeltaOutcome::Applied {
                replayed += 1;
            }
        }
        if replayed > 0 {
            debug!("Replayed {replayed} buffered deltas on top of snapshot");
        }
        replayed
    }

    /// Fold one incremental update into the view.
    pub fn apply_delta(&mut self, delta: AuctionDelta) -> DeltaOutcome {
        if let Some(target) = &self.syncing {
            if delta.auction_id == *target {
                if self.buffered.len() >= self.buffer_cap {
                    self.buffered.pop_front();
                }
                self.buffered.push_back(delta);
                return DeltaOutcome::Buffered;
            }
            self.stats.mismatched += 1;
            debug!(
                "Dropping delta for auction {} while syncing {}",
                delta.auction_id, target
            );
            return DeltaOutcome::Mismatched;
        }

        let Some(view) = self.view.as_mut() else {
            debug!("Dropping delta for auction {}: no view held", delta.auction_id);
            return DeltaOutcome::Ignored;
        };

        if view.auction_id != delta.auction_id {
            self.stats.mismatched += 1;
            warn!(
                "Dropping delta for auction {} (view holds {})",
                delta.auction_id, view.auction_id
            );
            return DeltaOutcome::Mismatched;
        }

        let mut changed = false;

        // The ended flag is terminal and idempotent, so it is honoured even
        // when it rides along with a stale bid.
        if delta.status == Some(AuctionStatus::Ended) && view.is_active {
            view.is_active = false;
            info!("Auction {} ended", view.auction_id);
            changed = true;
        }

        if let Some(bid) = delta.bid {
            if bid.current_highest_bid <= view.current_highest_bid {
                self.stats.stale += 1;
                debug!(
                    "Stale bid {} for auction {} (holding {})",
                    bid.current_highest_bid, view.auction_id, view.current_highest_bid
                );
                if !changed {
                    return DeltaOutcome::Stale;
                }
                self.stats.applied += 1;
                return DeltaOutcome::Applied;
            }

            view.current_highest_bid = bid.current_highest_bid;
            view.current_highest_bidder_name = Some(bid.bidder_name.clone());
            view.total_bids = (view.total_bids + 1).max(bid.total_bids.unwrap_or(0));
            view.recent_bids.insert(
                0,
                BidEntry {
                    bidder_name: bid.bidder_name,
                    bid_amount: bid.current_highest_bid,
                    bid_time: bid.bid_time,
                },
            );
            view.recent_bids.truncate(self.recent_bids_cap);
            changed = true;
        }

        if changed {
            self.stats.applied += 1;
            DeltaOutcome::Applied
        } else {
            DeltaOutcome::Ignored
        }
    }

    /// Flip the view to inactive. Returns `true` if it was active.
    pub fn mark_ended(&mut self) -> bool {
        match self.view.as_mut() {
            Some(view) if view.is_active => {
                view.is_active = false;
                info!("Auction {} marked ended", view.auction_id);
                true
            }
            _ => false,
        }
    }

    /// Mark the view ended once its end date has passed.
    pub fn expire(&mut self, now: DateTime<Utc>) -> bool {
        let past_end = self
            .view
            .as_ref()
            .is_some_and(|v| v.is_active && now >= v.bid_end_date);
        past_end && self.mark_ended()
    }

    /// Drop the view and any pending sync.
    pub fn clear(&mut self) {
        self.view = None;
        self.syncing = None;
        self.buffered.clear();
    }

    /// Count a frame that failed boundary validation.
    pub fn record_anomaly(&mut self, anomaly: &ProtocolAnomaly) {
        self.stats.anomalies += 1;
        warn!("Protocol anomaly #{}: {}", self.stats.anomalies, anomaly);
    }
}
