// Session driver: the single event loop that owns the reconciler, membership
// and bid controller.
//
// Listens on the transport event channel, the command channel and an
// internal channel fed by spawned timers and REST calls. Every state change
// happens on this loop; spawned tasks only report back.

use std::sync::Arc;
use std::time::Duration;

use agrobid_core::countdown::CountdownTicker;
use agrobid_core::membership::{MembershipEffect, MembershipError, MembershipManager, MembershipPhase};
use agrobid_core::protocol::{
    AuctionId, AuctionView, BidAcceptance, BidValidation, ClientSignal, ServerEvent,
};
use agrobid_core::reconciler::{DeltaOutcome, Reconciler};
use agrobid_core::submission::{BidController, PendingBid, SubmissionOutcome, SubmitError};
use agrobid_core::transport::{
    ApiError, AuctionApi, ConnectionEvent, ConnectionState, RealtimeChannel, TransportEvent,
};
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::TimingConfig;

const INTERNAL_CAPACITY: usize = 64;

/// Commands from the user-facing side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    Join(AuctionId),
    Leave,
    PlaceBid { amount: u64 },
    Shutdown,
}

/// Everything observers are told about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    /// The reconciled view changed (`None` after leaving).
    View(Option<AuctionView>),
    Membership(MembershipPhase),
    Connection(ConnectionState),
    /// The transport gave up reconnecting.
    TransportFailed { attempts: u32 },
    Countdown(String),
    Submission(SubmissionOutcome),
    /// A bid was refused locally; nothing went over the network.
    BidRefused(SubmitError),
    MembershipRefused(MembershipError),
    FallbackFailed { auction_id: AuctionId, reason: String },
    /// The server reported a `protocolError`.
    ServerError(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimings {
    pub join_timeout: Duration,
    pub fallback_grace: Duration,
    pub submission_timeout: Duration,
    pub countdown_tick: Duration,
}

impl Default for SessionTimings {
    fn default() -> Self {
        Self::from(&TimingConfig::default())
    }
}

impl From<&TimingConfig> for SessionTimings {
    fn from(timing: &TimingConfig) -> Self {
        SessionTimings {
            join_timeout: timing.join_timeout(),
            fallback_grace: timing.fallback_grace(),
            submission_timeout: timing.submission_timeout(),
            countdown_tick: timing.countdown_tick(),
        }
    }
}

/// Results reported back by spawned timers and calls.
#[derive(Debug)]
enum Internal {
    JoinTimeout { auction_id: AuctionId, generation: u64 },
    FallbackGrace { auction_id: AuctionId, generation: u64 },
    FallbackResult {
        auction_id: AuctionId,
        generation: u64,
        result: Result<AuctionView, ApiError>,
    },
    PreflightResult {
        ticket: u64,
        result: Result<BidValidation, ApiError>,
    },
    RestPlacement {
        ticket: u64,
        result: Result<BidAcceptance, ApiError>,
    },
    SubmissionTimeout { ticket: u64 },
}

pub struct Session {
    channel: Arc<dyn RealtimeChannel>,
    api: Arc<dyn AuctionApi>,
    timings: SessionTimings,

    reconciler: Reconciler,
    membership: MembershipManager,
    bids: BidController,
    connection: ConnectionState,
    ticker: CountdownTicker,
    last_countdown: Option<String>,

    /// The fallback fetch in flight, if any, by (auction, join generation).
    fallback_target: Option<(AuctionId, u64)>,
    /// Join timers and fallback fetches for the current room.
    room_tasks: Vec<JoinHandle<()>>,
    /// Pre-flight, placement and confirmation timer for the pending bid.
    bid_tasks: Vec<JoinHandle<()>>,

    internal_tx: mpsc::Sender<Internal>,
    internal_rx: mpsc::Receiver<Internal>,
    updates: mpsc::Sender<SessionUpdate>,
}

impl Session {
    pub fn new(
        channel: Arc<dyn RealtimeChannel>,
        api: Arc<dyn AuctionApi>,
        timings: SessionTimings,
        reconciler: Reconciler,
        updates: mpsc::Sender<SessionUpdate>,
    ) -> Self {
        let (internal_tx, internal_rx) = mpsc::channel(INTERNAL_CAPACITY);
        Session {
            channel,
            api,
            timings,
            reconciler,
            membership: MembershipManager::new(),
            bids: BidController::new(),
            connection: ConnectionState::default(),
            ticker: CountdownTicker::new(),
            last_countdown: None,
            fallback_target: None,
            room_tasks: Vec::new(),
            bid_tasks: Vec::new(),
            internal_tx,
            internal_rx,
            updates,
        }
    }

    /// Run until `Shutdown`, or until the command channel closes.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<TransportEvent>,
        mut commands: mpsc::Receiver<SessionCommand>,
    ) -> anyhow::Result<()> {
        info!("Session loop started");

        // Once the transport stops for good its sender drops; stop polling
        // the closed receiver so select! does not spin on it.
        let mut events_open = true;

        let mut countdown = tokio::time::interval(self.timings.countdown_tick);
        countdown.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        countdown.tick().await;

        loop {
            tokio::select! {
                event = events.recv(), if events_open => {
                    match event {
                        Some(event) => self.handle_transport(event).await,
                        None => {
                            info!("Transport event channel closed");
                            events_open = false;
                        }
                    }
                }

                cmd = commands.recv() => {
                    match cmd {
                        Some(SessionCommand::Shutdown) => {
                            info!("Shutdown requested");
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                        None => {
                            info!("Command channel closed, shutting down");
                            break;
                        }
                    }
                }

                Some(internal) = self.internal_rx.recv() => {
                    self.handle_internal(internal).await;
                }

                _ = countdown.tick() => {
                    self.tick().await;
                }
            }
        }

        abort_all(&mut self.room_tasks);
        abort_all(&mut self.bid_tasks);
        let stats = self.reconciler.stats();
        info!(
            "Session loop exiting (applied {}, stale {}, mismatched {}, anomalies {})",
            stats.applied, stats.stale, stats.mismatched, stats.anomalies
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Transport events
    // -----------------------------------------------------------------------

    async fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Server(event) => self.handle_server(event).await,
            TransportEvent::Connection(event) => self.handle_connection(event).await,
            TransportEvent::Anomaly(anomaly) => {
                warn!("Dropping frame: {anomaly}");
                self.reconciler.record_anomaly(&anomaly);
            }
        }
    }

    async fn handle_server(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Snapshot(view) => {
                let wanted = self.membership.current_auction() == Some(&view.auction_id)
                    || self.reconciler.is_syncing(&view.auction_id);
                if !wanted {
                    debug!("Ignoring snapshot for auction {} we are not in", view.auction_id);
                    return;
                }
                // A fallback fetch still in flight would land on top of
                // deltas applied after this snapshot.
                if self
                    .fallback_target
                    .as_ref()
                    .is_some_and(|(target, _)| *target == view.auction_id)
                {
                    debug!("Live snapshot for auction {} supersedes the fallback fetch", view.auction_id);
                    self.fallback_target = None;
                }
                self.accept_snapshot(view).await;
            }
            ServerEvent::Delta(delta) => {
                let auction_id = delta.auction_id.clone();
                match self.reconciler.apply_delta(delta) {
                    DeltaOutcome::Applied => self.publish_view().await,
                    DeltaOutcome::Buffered => debug!("Buffered delta for auction {auction_id}"),
                    outcome => debug!("Delta for auction {auction_id} not applied: {outcome:?}"),
                }
            }
            ServerEvent::BidAccepted(acceptance) => {
                if let Some(outcome) = self.bids.confirm(&acceptance) {
                    self.finish_bid(outcome).await;
                }
            }
            ServerEvent::BidRejected { reason } => {
                if let Some(outcome) = self.bids.reject(reason) {
                    self.finish_bid(outcome).await;
                }
            }
            ServerEvent::ProtocolError { message } => {
                warn!("Server reported protocol error: {message}");
                self.send_update(SessionUpdate::ServerError(message)).await;
            }
        }
    }

    async fn handle_connection(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => {
                self.connection.on_connected();
                self.send_update(SessionUpdate::Connection(self.connection)).await;

                let before = self.membership.phase().clone();
                let effects = self.membership.on_reconnected();
                self.execute(effects).await;
                self.publish_phase_change(before).await;
            }
            ConnectionEvent::Disconnected(reason) => {
                info!("Real-time channel down: {reason:?}");
                self.connection.connected = false;
                self.send_update(SessionUpdate::Connection(self.connection)).await;
            }
            ConnectionEvent::ConnectError(error) => {
                debug!("Connect attempt failed: {error}");
            }
            ConnectionEvent::ReconnectScheduled { attempt, delay } => {
                debug!("Transport reconnecting (attempt {attempt}, in {delay:?})");
                self.connection.reconnect_attempt = attempt;
                self.send_update(SessionUpdate::Connection(self.connection)).await;
            }
            ConnectionEvent::ReconnectExhausted { attempts } => {
                warn!("Transport gave up after {attempts} reconnect attempts");
                self.send_update(SessionUpdate::TransportFailed { attempts }).await;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    async fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Join(auction_id) => {
                let before = self.membership.phase().clone();
                match self.membership.join(auction_id) {
                    Ok(effects) => {
                        self.execute(effects).await;
                        self.publish_phase_change(before).await;
                    }
                    Err(e) => self.send_update(SessionUpdate::MembershipRefused(e)).await,
                }
            }
            SessionCommand::Leave => {
                let before = self.membership.phase().clone();
                match self.membership.leave() {
                    Ok(effects) => {
                        self.publish_phase_change(before).await;
                        self.execute(effects).await;
                        let leaving = self.membership.phase().clone();
                        self.membership.left();
                        self.publish_phase_change(leaving).await;
                    }
                    Err(e) => self.send_update(SessionUpdate::MembershipRefused(e)).await,
                }
            }
            SessionCommand::PlaceBid { amount } => {
                match self.bids.submit(amount, self.reconciler.view(), Utc::now()) {
                    Ok(pending) => self.start_preflight(pending),
                    Err(e) => {
                        info!("Bid of {amount} refused: {e}");
                        self.send_update(SessionUpdate::BidRefused(e)).await;
                    }
                }
            }
            SessionCommand::Shutdown => {}
        }
    }

    // -----------------------------------------------------------------------
    // Membership effects
    // -----------------------------------------------------------------------

    async fn execute(&mut self, effects: Vec<MembershipEffect>) {
        for effect in effects {
            match effect {
                MembershipEffect::CancelTimers => {
                    abort_all(&mut self.room_tasks);
                    self.fallback_target = None;
                    if let Some(outcome) = self.bids.cancel() {
                        abort_all(&mut self.bid_tasks);
                        self.send_update(SessionUpdate::Submission(outcome)).await;
                    }
                }
                MembershipEffect::SendLeave(auction_id) => {
                    self.send_signal(ClientSignal::LeaveAuction { auction_id }).await;
                }
                MembershipEffect::ClearView => {
                    self.reconciler.clear();
                    self.last_countdown = None;
                    self.send_update(SessionUpdate::View(None)).await;
                }
                MembershipEffect::BeginSync(auction_id) => {
                    self.reconciler.begin_sync(auction_id);
                }
                MembershipEffect::SendJoin(auction_id) => {
                    self.send_signal(ClientSignal::JoinAuction { auction_id }).await;
                }
                MembershipEffect::ArmJoinTimer { auction_id, generation } => {
                    self.room_tasks.retain(|task| !task.is_finished());
                    let grace = self.spawn_after(
                        self.timings.fallback_grace,
                        Internal::FallbackGrace {
                            auction_id: auction_id.clone(),
                            generation,
                        },
                    );
                    let timeout = self.spawn_after(
                        self.timings.join_timeout,
                        Internal::JoinTimeout { auction_id, generation },
                    );
                    self.room_tasks.extend([grace, timeout]);
                }
                MembershipEffect::TriggerFallback { auction_id, generation } => {
                    self.start_fallback(auction_id, generation);
                }
            }
        }
    }

    fn start_fallback(&mut self, auction_id: AuctionId, generation: u64) {
        info!("Fetching auction {auction_id} over REST (join attempt {generation})");
        self.fallback_target = Some((auction_id.clone(), generation));

        let api = Arc::clone(&self.api);
        let tx = self.internal_tx.clone();
        let task = tokio::spawn(async move {
            let result = api.auction_state(&auction_id).await;
            let _ = tx
                .send(Internal::FallbackResult {
                    auction_id,
                    generation,
                    result,
                })
                .await;
        });
        self.room_tasks.push(task);
    }

    async fn accept_snapshot(&mut self, view: AuctionView) {
        let auction_id = view.auction_id.clone();
        let replayed = self.reconciler.apply_snapshot(view);
        if replayed > 0 {
            debug!("Replayed {replayed} buffered deltas for auction {auction_id}");
        }

        let before = self.membership.phase().clone();
        self.membership.snapshot_received(&auction_id);
        self.publish_view().await;
        self.publish_phase_change(before).await;
    }

    // -----------------------------------------------------------------------
    // Bid submission
    // -----------------------------------------------------------------------

    /// Pre-flight runs under the same limit as confirmation, so a stalled
    /// call cannot hold the pending slot.
    fn start_preflight(&mut self, pending: PendingBid) {
        let api = Arc::clone(&self.api);
        let tx = self.internal_tx.clone();
        let limit = self.timings.submission_timeout;
        let task = tokio::spawn(async move {
            let call = api.validate_bid(&pending.auction_id, pending.amount);
            let result = match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => Err(ApiError::TimedOut(limit)),
            };
            let _ = tx
                .send(Internal::PreflightResult {
                    ticket: pending.ticket,
                    result,
                })
                .await;
        });
        self.bid_tasks.push(task);
    }

    async fn place(&mut self, pending: PendingBid) {
        self.bid_tasks.retain(|task| !task.is_finished());
        let ticket = pending.ticket;

        let signal = ClientSignal::PlaceBid {
            auction_id: pending.auction_id.clone(),
            amount: pending.amount,
        };
        let sent_realtime = self.channel.is_connected() && self.channel.send(signal).await.is_ok();

        if !sent_realtime {
            info!(
                "Real-time channel unavailable, placing bid of {} over REST",
                pending.amount
            );
            let api = Arc::clone(&self.api);
            let tx = self.internal_tx.clone();
            let task = tokio::spawn(async move {
                let result = api.place_bid(&pending.auction_id, pending.amount).await;
                let _ = tx.send(Internal::RestPlacement { ticket, result }).await;
            });
            self.bid_tasks.push(task);
        }

        let timer = self.spawn_after(
            self.timings.submission_timeout,
            Internal::SubmissionTimeout { ticket },
        );
        self.bid_tasks.push(timer);
    }

    async fn finish_bid(&mut self, outcome: SubmissionOutcome) {
        abort_all(&mut self.bid_tasks);
        self.send_update(SessionUpdate::Submission(outcome)).await;
    }

    // -----------------------------------------------------------------------
    // Timers and spawned calls
    // -----------------------------------------------------------------------

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::JoinTimeout { auction_id, generation } => {
                let before = self.membership.phase().clone();
                let effects = self.membership.join_timed_out(&auction_id, generation);
                self.execute(effects).await;
                self.publish_phase_change(before).await;
            }
            Internal::FallbackGrace { auction_id, generation } => {
                let synced = self.reconciler.has_synced_view(&auction_id);
                let effects = self.membership.grace_elapsed(&auction_id, generation, synced);
                self.execute(effects).await;
            }
            Internal::FallbackResult {
                auction_id,
                generation,
                result,
            } => {
                if self.fallback_target.as_ref() != Some(&(auction_id.clone(), generation)) {
                    debug!("Discarding fallback result for auction {auction_id} (attempt {generation})");
                    return;
                }
                self.fallback_target = None;
                match result {
                    Ok(view) if view.auction_id == auction_id => self.accept_snapshot(view).await,
                    Ok(view) => {
                        warn!(
                            "Fallback for auction {auction_id} returned auction {}",
                            view.auction_id
                        );
                        self.send_update(SessionUpdate::FallbackFailed {
                            auction_id,
                            reason: format!("server returned auction {}", view.auction_id),
                        })
                        .await;
                    }
                    Err(e) => {
                        warn!("Fallback fetch for auction {auction_id} failed: {e}");
                        self.send_update(SessionUpdate::FallbackFailed {
                            auction_id,
                            reason: e.to_string(),
                        })
                        .await;
                    }
                }
            }
            Internal::PreflightResult { ticket, result } => {
                let outcome = match result {
                    Ok(validation) if validation.valid => {
                        if let Some(pending) = self.bids.preflight_passed(ticket) {
                            self.place(pending).await;
                        }
                        None
                    }
                    Ok(validation) => {
                        let reason = validation
                            .message
                            .unwrap_or_else(|| "bid failed validation".to_string());
                        self.bids.preflight_rejected(ticket, reason)
                    }
                    Err(e) => self.bids.preflight_failed(ticket, e.to_string()),
                };
                if let Some(outcome) = outcome {
                    self.finish_bid(outcome).await;
                }
            }
            Internal::RestPlacement { ticket, result } => {
                if !self.bids.pending().is_some_and(|p| p.ticket == ticket) {
                    return;
                }
                let outcome = match result {
                    Ok(acceptance) => self.bids.confirm(&acceptance),
                    Err(e) => {
                        let rejected = e.is_refusal();
                        self.bids.placement_failed(ticket, e.to_string(), rejected)
                    }
                };
                if let Some(outcome) = outcome {
                    self.finish_bid(outcome).await;
                }
            }
            Internal::SubmissionTimeout { ticket } => {
                if let Some(outcome) = self.bids.timed_out(ticket) {
                    self.finish_bid(outcome).await;
                }
            }
        }
    }

    async fn tick(&mut self) {
        let now = Utc::now();
        if self.reconciler.expire(now) {
            self.publish_view().await;
        } else {
            self.publish_countdown().await;
        }
    }

    fn spawn_after(&self, delay: Duration, event: Internal) -> JoinHandle<()> {
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(event).await;
        })
    }

    // -----------------------------------------------------------------------
    // Publishing
    // -----------------------------------------------------------------------

    async fn send_signal(&self, signal: ClientSignal) {
        if let Err(e) = self.channel.send(signal.clone()).await {
            // Join is re-sent on the next Connected; leave is moot once the
            // server has dropped the connection.
            warn!("Could not send {signal:?}: {e}");
        }
    }

    async fn send_update(&self, update: SessionUpdate) {
        let _ = self.updates.send(update).await;
    }

    async fn publish_view(&mut self) {
        self.send_update(SessionUpdate::View(self.reconciler.view().cloned()))
            .await;
        self.publish_countdown().await;
    }

    async fn publish_countdown(&mut self) {
        let Some(view) = self.reconciler.view() else {
            return;
        };
        let text = self.ticker.project(Utc::now(), view);
        if self.last_countdown.as_deref() != Some(text.as_str()) {
            self.last_countdown = Some(text.clone());
            self.send_update(SessionUpdate::Countdown(text)).await;
        }
    }

    async fn publish_phase_change(&self, before: MembershipPhase) {
        let phase = self.membership.phase();
        if *phase != before {
            self.send_update(SessionUpdate::Membership(phase.clone())).await;
        }
    }
}

fn abort_all(tasks: &mut Vec<JoinHandle<()>>) {
    for task in tasks.drain(..) {
        task.abort();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
