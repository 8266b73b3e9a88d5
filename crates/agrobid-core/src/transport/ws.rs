// WebSocket client for the auction server's real-time channel.
//
// One supervisor task owns the connection: it performs the handshake with
// the bearer token attached, pumps frames in both directions, and applies
// the reconnect policy when the connection drops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use super::reconnect::{ConnectionState, DisconnectReason, ReconnectDecision, ReconnectPolicy};
use super::{usable_token, ConnectionEvent, RealtimeChannel, TransportError, TransportEvent};
use crate::protocol::{decode_frame, ClientSignal};

const OUTGOING_CAPACITY: usize = 64;
const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct WsConfig {
    pub url: String,
    pub token: Option<String>,
    pub policy: ReconnectPolicy,
}

/// Handle to the real-time connection. Cheap to share behind an `Arc`.
pub struct WsTransport {
    outgoing: mpsc::Sender<ClientSignal>,
    connected: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl WsTransport {
    /// Start connecting in the background. Events are delivered on `events`.
    ///
    /// Fails immediately, before any network activity, when no token is
    /// available or the URL cannot form a handshake request.
    pub fn open(config: WsConfig, events: mpsc::Sender<TransportEvent>) -> Result<Self, TransportError> {
        let token = usable_token(config.token.as_deref())
            .ok_or(TransportError::MissingToken)?
            .to_string();
        build_request(&config.url, &token)?;

        let (outgoing, outgoing_rx) = mpsc::channel(OUTGOING_CAPACITY);
        let connected = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(Notify::new());

        let supervisor = Supervisor {
            url: config.url,
            token,
            policy: config.policy,
            outgoing: outgoing_rx,
            events,
            connected: Arc::clone(&connected),
            shutdown: Arc::clone(&shutdown),
        };
        let task = tokio::spawn(supervisor.run());

        Ok(WsTransport {
            outgoing,
            connected,
            shutdown,
            task: Mutex::new(Some(task)),
        })
    }

    /// Close the connection and stop reconnecting.
    pub async fn close(&self) {
        self.shutdown.notify_one();
        let handle = self.task.lock().ok().and_then(|mut task| task.take());
        if let Some(mut handle) = handle {
            if tokio::time::timeout(CLOSE_GRACE, &mut handle).await.is_err() {
                warn!("WebSocket supervisor did not stop in time, aborting");
                handle.abort();
            }
        }
    }
}

#[async_trait]
impl RealtimeChannel for WsTransport {
    async fn send(&self, signal: ClientSignal) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.outgoing
            .send(signal)
            .await
            .map_err(|_| TransportError::Closed)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Build the handshake request with the bearer token attached.
pub(crate) fn build_request(url: &str, token: &str) -> Result<Request, TransportError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| TransportError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
    let value = HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| TransportError::MissingToken)?;
    request.headers_mut().insert(AUTHORIZATION, value);
    Ok(request)
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

struct Supervisor {
    url: String,
    token: String,
    policy: ReconnectPolicy,
    outgoing: mpsc::Receiver<ClientSignal>,
    events: mpsc::Sender<TransportEvent>,
    connected: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
}

enum PumpExit {
    /// Closed locally, or the event receiver went away.
    Shutdown,
    Disconnected(DisconnectReason),
}

impl Supervisor {
    async fn run(mut self) {
        let mut state = ConnectionState::default();

        loop {
            let request = match build_request(&self.url, &self.token) {
                Ok(request) => request,
                Err(e) => {
                    warn!("Cannot build handshake request: {e}");
                    return;
                }
            };

            let connect = tokio::select! {
                result = tokio_tungstenite::connect_async(request) => result,
                _ = self.shutdown.notified() => return,
            };

            let decision = match connect {
                Ok((stream, _response)) => {
                    self.discard_queued();
                    state.on_connected();
                    self.connected.store(true, Ordering::SeqCst);
                    info!("Connected to {}", self.url);
                    if !self.emit(ConnectionEvent::Connected).await {
                        return;
                    }

                    let exit = self.pump(stream).await;
                    self.connected.store(false, Ordering::SeqCst);
                    match exit {
                        PumpExit::Shutdown => return,
                        PumpExit::Disconnected(reason) => {
                            info!("Disconnected from {}: {:?}", self.url, reason);
                            if !self.emit(ConnectionEvent::Disconnected(reason.clone())).await {
                                return;
                            }
                            state.on_disconnected(&reason, &self.policy)
                        }
                    }
                }
                Err(e) => {
                    warn!("Connecting to {} failed: {}", self.url, e);
                    if !self.emit(ConnectionEvent::ConnectError(e.to_string())).await {
                        return;
                    }
                    state.on_connect_error(&self.policy)
                }
            };

            match decision {
                ReconnectDecision::Retry { attempt, delay } => {
                    info!("Reconnect attempt {attempt} in {delay:?}");
                    if !self.emit(ConnectionEvent::ReconnectScheduled { attempt, delay }).await {
                        return;
                    }
                    if !self.backoff(delay).await {
                        return;
                    }
                }
                ReconnectDecision::Stop => {
                    info!("Server ended the session; not reconnecting");
                    return;
                }
                ReconnectDecision::GiveUp { attempts } => {
                    warn!("Giving up after {attempts} reconnect attempts");
                    let _ = self.emit(ConnectionEvent::ReconnectExhausted { attempts }).await;
                    return;
                }
            }
        }
    }

    async fn emit(&self, event: ConnectionEvent) -> bool {
        self.events.send(TransportEvent::Connection(event)).await.is_ok()
    }

    async fn pump<S>(&mut self, stream: WebSocketStream<S>) -> PumpExit
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut write, mut read) = stream.split();

        loop {
            tokio::select! {
                frame = read.next() => {
                    match handle_frame(frame, Utc::now()) {
                        FrameAction::Forward(event) => {
                            if self.events.send(event).await.is_err() {
                                return PumpExit::Shutdown;
                            }
                        }
                        FrameAction::Skip => {}
                        FrameAction::Closed(reason) => return PumpExit::Disconnected(reason),
                    }
                }
                signal = self.outgoing.recv() => {
                    let Some(signal) = signal else {
                        let _ = write.send(Message::Close(None)).await;
                        return PumpExit::Shutdown;
                    };
                    debug!("Sending {:?}", signal);
                    if let Err(e) = write.send(Message::Text(signal.to_frame().into())).await {
                        return PumpExit::Disconnected(DisconnectReason::TransportLost(e.to_string()));
                    }
                }
                _ = self.shutdown.notified() => {
                    let _ = write.send(Message::Close(None)).await;
                    return PumpExit::Shutdown;
                }
            }
        }
    }

    /// Wait out a reconnect delay. Returns `false` if the transport was closed
    /// meanwhile.
    async fn backoff(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                _ = self.shutdown.notified() => return false,
                signal = self.outgoing.recv() => match signal {
                    Some(signal) => debug!("Dropping {:?} sent while disconnected", signal),
                    None => return false,
                },
            }
        }
    }

    /// Signals queued for a previous connection must not leak into a new one.
    fn discard_queued(&mut self) {
        while let Ok(signal) = self.outgoing.try_recv() {
            debug!("Dropping stale {:?}", signal);
        }
    }
}

// ---------------------------------------------------------------------------
// Frame handling
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq)]
enum FrameAction {
    Forward(TransportEvent),
    Skip,
    Closed(DisconnectReason),
}

/// Classify one item read from the socket.
fn handle_frame(frame: Option<Result<Message, WsError>>, received_at: DateTime<Utc>) -> FrameAction {
    match frame {
        Some(Ok(Message::Text(text))) => match decode_frame(text.as_str(), received_at) {
            Ok(event) => FrameAction::Forward(TransportEvent::Server(event)),
            Err(anomaly) => FrameAction::Forward(TransportEvent::Anomaly(anomaly)),
        },
        Some(Ok(Message::Close(frame))) => FrameAction::Closed(classify_close(frame.as_ref())),
        // Ping/pong are answered by tungstenite; binary frames are not part of the protocol.
        Some(Ok(_)) => FrameAction::Skip,
        Some(Err(e)) => FrameAction::Closed(DisconnectReason::TransportLost(e.to_string())),
        None => FrameAction::Closed(DisconnectReason::TransportLost("stream ended".into())),
    }
}

fn classify_close(frame: Option<&CloseFrame>) -> DisconnectReason {
    match frame.map(|f| f.code) {
        Some(CloseCode::Normal) | Some(CloseCode::Policy) => DisconnectReason::ServerInitiated,
        Some(code) => DisconnectReason::TransportLost(format!("closed with code {}", u16::from(code))),
        None => DisconnectReason::TransportLost("closed without status".into()),
    }
}
