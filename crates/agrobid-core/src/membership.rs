// Auction room membership.
//
// A small state machine (Idle -> Joining -> Joined -> Leaving -> Idle, plus
// Joining -> Idle on timeout and Joined -> Joining when switching rooms) that
// decides which auction room the client is in. It performs no I/O: every transition returns the effects the session
// driver must carry out, in order.

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::protocol::AuctionId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipPhase {
    Idle,
    /// A join request is outstanding. `generation` identifies this attempt so
    /// timers armed for earlier attempts can be recognised as stale.
    Joining { auction_id: AuctionId, generation: u64 },
    Joined { auction_id: AuctionId },
    Leaving { auction_id: AuctionId },
}

/// Work the session driver performs on behalf of a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEffect {
    /// Abort timers, fallback fetches and any pending bid of the previous room.
    CancelTimers,
    SendLeave(AuctionId),
    ClearView,
    BeginSync(AuctionId),
    SendJoin(AuctionId),
    ArmJoinTimer { auction_id: AuctionId, generation: u64 },
    TriggerFallback { auction_id: AuctionId, generation: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MembershipError {
    #[error("auction id is empty")]
    MissingAuctionId,

    #[error("not joined to any auction")]
    NotJoined,
}

#[derive(Debug)]
pub struct MembershipManager {
    phase: MembershipPhase,
    generation: u64,
    /// Set once the REST fallback has fired for the current join attempt.
    fallback_fired: bool,
}

impl Default for MembershipManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MembershipManager {
    pub fn new() -> Self {
        MembershipManager {
            phase: MembershipPhase::Idle,
            generation: 0,
            fallback_fired: false,
        }
    }

    pub fn phase(&self) -> &MembershipPhase {
        &self.phase
    }

    /// The joined auction id, if `Joined`.
    pub fn joined_auction_id(&self) -> Option<&AuctionId> {
        match &self.phase {
            MembershipPhase::Joined { auction_id } => Some(auction_id),
            _ => None,
        }
    }

    /// The auction being joined or already joined.
    pub fn current_auction(&self) -> Option<&AuctionId> {
        match &self.phase {
            MembershipPhase::Joining { auction_id, .. } | MembershipPhase::Joined { auction_id } => {
                Some(auction_id)
            }
            _ => None,
        }
    }

    /// Join `auction_id`, leaving the current room first if it differs.
    pub fn join(&mut self, auction_id: AuctionId) -> Result<Vec<MembershipEffect>, MembershipError> {
        if auction_id.is_empty() {
            return Err(MembershipError::MissingAuctionId);
        }
        if self.current_auction() == Some(&auction_id) {
            debug!("Already in auction {auction_id}, ignoring join");
            return Ok(Vec::new());
        }

        let mut effects = vec![MembershipEffect::CancelTimers];
        if let Some(previous) = self.current_auction().cloned() {
            info!("Leaving auction {previous} to join {auction_id}");
            effects.push(MembershipEffect::SendLeave(previous));
            effects.push(MembershipEffect::ClearView);
        }

        effects.extend(self.enter_joining(auction_id));
        Ok(effects)
    }

    /// Leave the joined auction. Only valid from `Joined`.
    ///
    /// The phase stays `Leaving` until the driver has carried out the
    /// returned effects and calls [`MembershipManager::left`].
    pub fn leave(&mut self) -> Result<Vec<MembershipEffect>, MembershipError> {
        let MembershipPhase::Joined { auction_id } = &self.phase else {
            return Err(MembershipError::NotJoined);
        };
        let auction_id = auction_id.clone();
        info!("Leaving auction {auction_id}");

        self.phase = MembershipPhase::Leaving {
            auction_id: auction_id.clone(),
        };
        let effects = vec![
            MembershipEffect::CancelTimers,
            MembershipEffect::SendLeave(auction_id),
            MembershipEffect::ClearView,
        ];
        Ok(effects)
    }

    /// The leave signal went out and the view is cleared.
    pub fn left(&mut self) {
        if let MembershipPhase::Leaving { auction_id } = &self.phase {
            debug!("Left auction {auction_id}");
            self.phase = MembershipPhase::Idle;
        }
    }

    /// A snapshot for `auction_id` arrived. Completes a pending join and
    /// returns `true` if that happened.
    pub fn snapshot_received(&mut self, auction_id: &AuctionId) -> bool {
        match &self.phase {
            MembershipPhase::Joining { auction_id: joining, .. } if joining == auction_id => {
                info!("Joined auction {auction_id}");
                self.phase = MembershipPhase::Joined {
                    auction_id: auction_id.clone(),
                };
                true
            }
            _ => false,
        }
    }

    /// The join timer armed for (`auction_id`, `generation`) expired.
    ///
    /// Returns to `Idle` and signals the fallback path if that attempt is
    /// still pending; a timer from an earlier attempt does nothing.
    pub fn join_timed_out(&mut self, auction_id: &AuctionId, generation: u64) -> Vec<MembershipEffect> {
        if !self.is_attempt(auction_id, generation) {
            debug!("Ignoring stale join timer for auction {auction_id} (generation {generation})");
            return Vec::new();
        }

        warn!("Join of auction {auction_id} timed out");
        self.phase = MembershipPhase::Idle;
        self.fallback_effect(auction_id, generation).into_iter().collect()
    }

    /// The post-join grace period for (`auction_id`, `generation`) elapsed.
    ///
    /// Fires the fallback early when no synced view exists yet.
    pub fn grace_elapsed(
        &mut self,
        auction_id: &AuctionId,
        generation: u64,
        has_synced_view: bool,
    ) -> Vec<MembershipEffect> {
        if has_synced_view || !self.is_attempt(auction_id, generation) {
            return Vec::new();
        }
        debug!("No state for auction {auction_id} after grace period");
        self.fallback_effect(auction_id, generation).into_iter().collect()
    }

    /// The transport reconnected. Room membership does not survive a
    /// reconnect on the server, so rejoin whatever we were in.
    pub fn on_reconnected(&mut self) -> Vec<MembershipEffect> {
        match self.current_auction().cloned() {
            Some(auction_id) => {
                info!("Rejoining auction {auction_id} after reconnect");
                self.enter_joining(auction_id)
            }
            None => Vec::new(),
        }
    }

    fn enter_joining(&mut self, auction_id: AuctionId) -> Vec<MembershipEffect> {
        self.generation += 1;
        self.fallback_fired = false;
        self.phase = MembershipPhase::Joining {
            auction_id: auction_id.clone(),
            generation: self.generation,
        };
        vec![
            MembershipEffect::BeginSync(auction_id.clone()),
            MembershipEffect::SendJoin(auction_id.clone()),
            MembershipEffect::ArmJoinTimer {
                auction_id,
                generation: self.generation,
            },
        ]
    }

    fn is_attempt(&self, auction_id: &AuctionId, generation: u64) -> bool {
        self.generation == generation
            && match &self.phase {
                MembershipPhase::Joining { auction_id: joining, .. } => joining == auction_id,
                _ => false,
            }
    }

    fn fallback_effect(&mut self, auction_id: &AuctionId, generation: u64) -> Option<MembershipEffect> {
        if self.fallback_fired {
            return None;
        }
        self.fallback_fired = true;
        Some(MembershipEffect::TriggerFallback {
            auction_id: auction_id.clone(),
            generation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use MembershipEffect::*;

    fn id(s: &str) -> AuctionId {
        s.into()
    }

    fn joined(m: &mut MembershipManager, auction: &str) {
        m.join(id(auction)).unwrap();
        assert!(m.snapshot_received(&id(auction)));
    }

    #[test]
    fn join_from_idle() {
        let mut m = MembershipManager::new();
        let effects = m.join(id("a-1")).unwrap();
        assert_eq!(
            effects,
            vec![
                CancelTimers,
                BeginSync(id("a-1")),
                SendJoin(id("a-1")),
                ArmJoinTimer {
                    auction_id: id("a-1"),
                    generation: 1
                },
            ]
        );
        assert_eq!(
            m.phase(),
            &MembershipPhase::Joining {
                auction_id: id("a-1"),
                generation: 1
            }
        );
    }

    #[test]
    fn join_same_auction_twice_is_noop() {
        let mut m = MembershipManager::new();
        joined(&mut m, "a-1");
        assert!(m.join(id("a-1")).unwrap().is_empty());
        assert_eq!(m.joined_auction_id(), Some(&id("a-1")));
    }

    #[test]
    fn join_same_auction_while_joining_is_noop() {
        let mut m = MembershipManager::new();
        m.join(id("a-1")).unwrap();
        assert!(m.join(id("a-1")).unwrap().is_empty());
    }

    #[test]
    fn switching_leaves_before_joining() {
        let mut m = MembershipManager::new();
        joined(&mut m, "a-1");

        let effects = m.join(id("a-2")).unwrap();
        assert_eq!(
            effects,
            vec![
                CancelTimers,
                SendLeave(id("a-1")),
                ClearView,
                BeginSync(id("a-2")),
                SendJoin(id("a-2")),
                ArmJoinTimer {
                    auction_id: id("a-2"),
                    generation: 2
                },
            ]
        );
    }

    #[test]
    fn empty_auction_id_is_refused() {
        let mut m = MembershipManager::new();
        assert_eq!(m.join(id("  ")), Err(MembershipError::MissingAuctionId));
        assert_eq!(m.phase(), &MembershipPhase::Idle);
    }

    #[test]
    fn leave_only_from_joined() {
        let mut m = MembershipManager::new();
        assert_eq!(m.leave(), Err(MembershipError::NotJoined));

        m.join(id("a-1")).unwrap();
        assert_eq!(m.leave(), Err(MembershipError::NotJoined));

        m.snapshot_received(&id("a-1"));
        let effects = m.leave().unwrap();
        assert_eq!(effects, vec![CancelTimers, SendLeave(id("a-1")), ClearView]);
        assert_eq!(
            m.phase(),
            &MembershipPhase::Leaving {
                auction_id: id("a-1")
            }
        );
        assert_eq!(m.leave(), Err(MembershipError::NotJoined));

        m.left();
        assert_eq!(m.phase(), &MembershipPhase::Idle);
    }

    #[test]
    fn left_outside_leaving_changes_nothing() {
        let mut m = MembershipManager::new();
        joined(&mut m, "a-1");
        m.left();
        assert_eq!(
            m.phase(),
            &MembershipPhase::Joined {
                auction_id: id("a-1")
            }
        );
    }

    #[test]
    fn switching_goes_straight_to_joining() {
        let mut m = MembershipManager::new();
        joined(&mut m, "a-1");
        m.join(id("a-2")).unwrap();
        assert!(matches!(
            m.phase(),
            MembershipPhase::Joining { auction_id, .. } if *auction_id == id("a-2")
        ));
    }

    #[test]
    fn timeout_returns_to_idle_and_requests_fallback_once() {
        let mut m = MembershipManager::new();
        m.join(id("a-1")).unwrap();

        let effects = m.join_timed_out(&id("a-1"), 1);
        assert_eq!(
            effects,
            vec![TriggerFallback {
                auction_id: id("a-1"),
                generation: 1
            }]
        );
        assert_eq!(m.phase(), &MembershipPhase::Idle);
        assert!(m.join_timed_out(&id("a-1"), 1).is_empty());
    }

    #[test]
    fn grace_then_timeout_fires_fallback_once() {
        let mut m = MembershipManager::new();
        m.join(id("a-1")).unwrap();

        assert_eq!(m.grace_elapsed(&id("a-1"), 1, false).len(), 1);
        assert!(m.join_timed_out(&id("a-1"), 1).is_empty());
        assert_eq!(m.phase(), &MembershipPhase::Idle);
    }

    #[test]
    fn grace_with_view_does_nothing() {
        let mut m = MembershipManager::new();
        m.join(id("a-1")).unwrap();
        assert!(m.grace_elapsed(&id("a-1"), 1, true).is_empty());
    }

    #[test]
    fn stale_timer_from_earlier_attempt_is_ignored() {
        let mut m = MembershipManager::new();
        m.join(id("a-1")).unwrap();
        m.join(id("a-2")).unwrap();

        assert!(m.join_timed_out(&id("a-1"), 1).is_empty());
        assert!(matches!(m.phase(), MembershipPhase::Joining { .. }));
    }

    #[test]
    fn timer_after_join_completed_is_ignored() {
        let mut m = MembershipManager::new();
        joined(&mut m, "a-1");
        assert!(m.join_timed_out(&id("a-1"), 1).is_empty());
        assert_eq!(m.joined_auction_id(), Some(&id("a-1")));
    }

    #[test]
    fn snapshot_for_other_auction_does_not_complete_join() {
        let mut m = MembershipManager::new();
        m.join(id("a-1")).unwrap();
        assert!(!m.snapshot_received(&id("a-2")));
        assert!(matches!(m.phase(), MembershipPhase::Joining { .. }));
    }

    #[test]
    fn reconnect_rejoins_with_new_generation() {
        let mut m = MembershipManager::new();
        joined(&mut m, "a-1");

        let effects = m.on_reconnected();
        assert_eq!(
            effects,
            vec![
                BeginSync(id("a-1")),
                SendJoin(id("a-1")),
                ArmJoinTimer {
                    auction_id: id("a-1"),
                    generation: 2
                },
            ]
        );
        // The rejoin attempt gets its own fallback.
        assert_eq!(m.join_timed_out(&id("a-1"), 2).len(), 1);
    }

    #[test]
    fn reconnect_while_idle_does_nothing() {
        let mut m = MembershipManager::new();
        assert!(m.on_reconnected().is_empty());
    }
}
