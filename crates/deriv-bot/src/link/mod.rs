//! Broker link: the single WebSocket to the trading API.
//!
//! Maintains one socket per session: dial, authorize, heartbeat every
//! 10 s, exponential-backoff reconnect (1 s, 2 s, then 5 s capped).
//! All writes are serialized through one writer; every outbound payload is
//! tagged with a `req_id` by the correlator. Inbound frames resolve
//! pending calls first and fall through to stream dispatch otherwise.
//!
//! An `InvalidToken` response to authorize is fatal; the agent never
//! retries credentials.

pub mod correlator;
pub mod protocol;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, trace, warn};

use crate::link::correlator::{CallError, Correlator};
use crate::link::protocol::{
    frame_error, frame_msg_type, frame_req_id, AuthorizeInfo, ErrorCode, StreamUpdate,
};

/// Default deadline for a correlated call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Heartbeat cadence required by the broker.
const PING_INTERVAL: Duration = Duration::from_secs(10);

/// Connect attempt timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Reconnect backoff: 1 s, 2 s, then 5 s for every further attempt.
const RECONNECT_DELAYS_SECS: [u64; 3] = [1, 2, 5];

/// Configuration for the broker link.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Application id appended to the socket URL.
    pub app_id: String,
    /// API token sent with `authorize`.
    pub token: String,
    /// Per-call response deadline.
    pub call_timeout: Duration,
}

/// Broker error codes escalated as named events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerAlert {
    RateLimit,
    BuyLimitReached,
}

/// Conditions that terminate the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatalReason {
    InvalidToken,
}

/// Lifecycle and stream events emitted by the link.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// Socket is up and authorized; subscriptions must be (re)issued.
    Authorized(AuthorizeInfo),
    /// Socket dropped; pending calls were failed with `LinkLost`.
    Closed,
    /// Unsolicited stream message.
    Stream(StreamUpdate),
    /// Named broker error without a pending call.
    Alert(BrokerAlert),
    /// Unrecoverable condition; the agent must exit.
    Fatal(FatalReason),
}

/// Cloneable handle for issuing requests over the link.
///
/// `call` is a promise-shaped RPC: it registers a resolver, tags the
/// payload with a fresh `req_id`, and awaits the first matching response.
/// `send` is fire-and-forget for subscriptions and the heartbeat.
#[derive(Debug, Clone)]
pub struct LinkHandle {
    correlator: Arc<Correlator>,
    outbound: mpsc::UnboundedSender<String>,
    connected: Arc<AtomicBool>,
    call_timeout: Duration,
}

impl LinkHandle {
    fn new(outbound: mpsc::UnboundedSender<String>, call_timeout: Duration) -> Self {
        Self {
            correlator: Arc::new(Correlator::new()),
            outbound,
            connected: Arc::new(AtomicBool::new(false)),
            call_timeout,
        }
    }

    /// True between authorize success and socket loss.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Issue a correlated request and await its response frame.
    ///
    /// Application-level broker errors resolve `Ok` with the error body on
    /// the frame; only transport failures surface as `CallError`.
    pub async fn call(&self, mut payload: Value) -> Result<Value, CallError> {
        if !self.is_connected() {
            return Err(CallError::NotConnected);
        }
        let (req_id, rx) = self.correlator.register();
        payload["req_id"] = req_id.into();
        if self.outbound.send(payload.to_string()).is_err() {
            self.correlator.abandon(req_id);
            return Err(CallError::NotConnected);
        }
        match timeout(self.call_timeout, rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(CallError::LinkLost),
            Err(_) => {
                self.correlator.abandon(req_id);
                Err(CallError::Timeout)
            }
        }
    }

    /// Send a payload without awaiting a response. Returns the assigned
    /// `req_id`.
    pub fn send(&self, mut payload: Value) -> Result<u64, CallError> {
        if !self.is_connected() {
            return Err(CallError::NotConnected);
        }
        let req_id = self.correlator.next_req_id();
        payload["req_id"] = req_id.into();
        self.outbound
            .send(payload.to_string())
            .map_err(|_| CallError::NotConnected)?;
        Ok(req_id)
    }

    /// In-process handle wired to a frame channel instead of a socket.
    ///
    /// The returned receiver yields every frame the handle writes. Used by
    /// the integration harness and tests.
    pub fn pair() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self::new(tx, DEFAULT_CALL_TIMEOUT);
        handle.connected.store(true, Ordering::SeqCst);
        (handle, rx)
    }

    /// Inject an inbound frame as if it had arrived on the socket,
    /// resolving the pending call it belongs to. Returns false when no
    /// call claimed the frame. (harness)
    pub fn inject_frame(&self, text: &str) -> bool {
        match serde_json::from_str::<Value>(text) {
            Ok(frame) => match frame_req_id(&frame) {
                Some(req_id) => self.correlator.resolve(req_id, frame),
                None => false,
            },
            Err(_) => false,
        }
    }
}

/// Owner of the socket lifecycle. Spawned once at boot; reconnects until
/// shutdown or a fatal authorize failure.
pub struct BrokerLink;

impl BrokerLink {
    /// Spawn the link task and return a handle for issuing requests.
    pub fn spawn(
        config: LinkConfig,
        events: mpsc::Sender<LinkEvent>,
        shutdown: broadcast::Receiver<()>,
    ) -> LinkHandle {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let handle = LinkHandle::new(outbound_tx, config.call_timeout);
        let task_handle = handle.clone();
        tokio::spawn(async move {
            run_link(config, task_handle, outbound_rx, events, shutdown).await;
        });
        handle
    }
}

/// How a session ended.
enum SessionEnd {
    /// Socket dropped; reconnect. `authorized` resets the backoff.
    Lost { authorized: bool },
    /// Shutdown requested; no reconnect.
    Shutdown,
    /// Fatal broker condition already emitted; no reconnect.
    Fatal,
}

/// Connection supervisor: run sessions until shutdown or a fatal error,
/// applying the backoff schedule between attempts.
async fn run_link(
    config: LinkConfig,
    handle: LinkHandle,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    events: mpsc::Sender<LinkEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut attempt = 0usize;
    loop {
        let end = run_session(
            &config,
            &handle,
            &mut outbound_rx,
            &events,
            &mut shutdown,
        )
        .await;

        handle.connected.store(false, Ordering::SeqCst);
        handle.correlator.fail_all();

        match end {
            SessionEnd::Shutdown => {
                info!("Link shutdown requested");
                let _ = events.send(LinkEvent::Closed).await;
                return;
            }
            SessionEnd::Fatal => {
                let _ = events.send(LinkEvent::Closed).await;
                return;
            }
            SessionEnd::Lost { authorized } => {
                let _ = events.send(LinkEvent::Closed).await;
                if authorized {
                    attempt = 0;
                }
                let delay =
                    RECONNECT_DELAYS_SECS[attempt.min(RECONNECT_DELAYS_SECS.len() - 1)];
                attempt += 1;
                warn!(attempt, delay_secs = delay, "Link lost, reconnecting");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(delay)) => {}
                    _ = shutdown.recv() => {
                        info!("Shutdown during reconnect backoff");
                        return;
                    }
                }
            }
        }
    }
}

/// Run one socket session: connect, authorize, then the frame loop.
async fn run_session(
    config: &LinkConfig,
    handle: &LinkHandle,
    outbound_rx: &mut mpsc::UnboundedReceiver<String>,
    events: &mpsc::Sender<LinkEvent>,
    shutdown: &mut broadcast::Receiver<()>,
) -> SessionEnd {
    let url = protocol::ws_url(&config.app_id);
    info!(%url, "Connecting to broker");

    let ws = match timeout(CONNECT_TIMEOUT, connect_async(url.as_str())).await {
        Ok(Ok((stream, _response))) => stream,
        Ok(Err(e)) => {
            warn!("Broker connect failed: {e}");
            return SessionEnd::Lost { authorized: false };
        }
        Err(_) => {
            warn!("Broker connect timed out");
            return SessionEnd::Lost { authorized: false };
        }
    };

    let (mut write, mut read) = ws.split();

    // Authorize before anything else. The response is routed in the frame
    // loop by msg_type, so no pending slot is registered for it.
    let mut auth = protocol::authorize(&config.token);
    auth["req_id"] = handle.correlator.next_req_id().into();
    if let Err(e) = write.send(Message::Text(auth.to_string())).await {
        warn!("Failed to send authorize: {e}");
        return SessionEnd::Lost { authorized: false };
    }

    let mut authorized = false;
    let mut ping_timer = interval(PING_INTERVAL);
    ping_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ping_timer.reset();

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match route_frame(&text, handle, events).await {
                            FrameOutcome::Continue => {}
                            FrameOutcome::Authorized(info) => {
                                authorized = true;
                                handle.connected.store(true, Ordering::SeqCst);
                                info!(loginid = %info.loginid, "Authorized");
                                let _ = events.send(LinkEvent::Authorized(info)).await;
                            }
                            FrameOutcome::AuthFailed => {
                                return SessionEnd::Lost { authorized };
                            }
                            FrameOutcome::Fatal(reason) => {
                                let _ = events.send(LinkEvent::Fatal(reason)).await;
                                return SessionEnd::Fatal;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            warn!("Failed to answer protocol ping: {e}");
                            return SessionEnd::Lost { authorized };
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return SessionEnd::Lost { authorized };
                    }
                    Some(Err(e)) => {
                        warn!("Socket read error: {e}");
                        return SessionEnd::Lost { authorized };
                    }
                    _ => {}
                }
            }
            frame = outbound_rx.recv() => {
                match frame {
                    Some(text) => {
                        if let Err(e) = write.send(Message::Text(text)).await {
                            warn!("Socket write error: {e}");
                            return SessionEnd::Lost { authorized };
                        }
                    }
                    None => return SessionEnd::Shutdown,
                }
            }
            _ = ping_timer.tick() => {
                let mut ping = protocol::ping();
                ping["req_id"] = handle.correlator.next_req_id().into();
                if let Err(e) = write.send(Message::Text(ping.to_string())).await {
                    warn!("Heartbeat write error: {e}");
                    return SessionEnd::Lost { authorized };
                }
            }
            _ = shutdown.recv() => {
                let _ = write.send(Message::Close(None)).await;
                return SessionEnd::Shutdown;
            }
        }
    }
}

enum FrameOutcome {
    Continue,
    Authorized(AuthorizeInfo),
    AuthFailed,
    Fatal(FatalReason),
}

/// Route one inbound text frame: pending call first, then error
/// escalation, then stream dispatch by msg_type.
async fn route_frame(
    text: &str,
    handle: &LinkHandle,
    events: &mpsc::Sender<LinkEvent>,
) -> FrameOutcome {
    let frame: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!("Dropping malformed frame: {e}");
            return FrameOutcome::Continue;
        }
    };

    // Authorize is routed by msg_type; it was sent without a pending slot.
    if frame_msg_type(&frame) == Some("authorize") {
        if let Some(err) = frame_error(&frame) {
            if err.error_code() == ErrorCode::InvalidToken {
                error!("Authorize rejected: {err}");
                return FrameOutcome::Fatal(FatalReason::InvalidToken);
            }
            warn!("Authorize failed: {err}");
            return FrameOutcome::AuthFailed;
        }
        return match frame
            .get("authorize")
            .cloned()
            .and_then(|v| serde_json::from_value::<AuthorizeInfo>(v).ok())
        {
            Some(info) => FrameOutcome::Authorized(info),
            None => {
                warn!("Authorize response missing payload");
                FrameOutcome::AuthFailed
            }
        };
    }

    if let Some(req_id) = frame_req_id(&frame) {
        if handle.correlator.resolve(req_id, frame.clone()) {
            return FrameOutcome::Continue;
        }
    }

    if let Some(err) = frame_error(&frame) {
        match err.error_code() {
            ErrorCode::RateLimit => {
                warn!("Broker rate limit: {err}");
                let _ = events.send(LinkEvent::Alert(BrokerAlert::RateLimit)).await;
            }
            ErrorCode::BuyLimitReached => {
                error!("Buy limit reached: {err}");
                let _ = events
                    .send(LinkEvent::Alert(BrokerAlert::BuyLimitReached))
                    .await;
            }
            ErrorCode::InvalidToken => {
                error!("Token invalidated mid-session: {err}");
                return FrameOutcome::Fatal(FatalReason::InvalidToken);
            }
            _ => warn!("Broker error on stream: {err}"),
        }
        return FrameOutcome::Continue;
    }

    let Some(msg_type) = frame_msg_type(&frame) else {
        debug!("Frame without msg_type dropped");
        return FrameOutcome::Continue;
    };

    if msg_type == "ping" {
        // Pong; correlated pings were consumed above, the rest is noise.
        trace!("Heartbeat pong");
        return FrameOutcome::Continue;
    }

    match protocol::parse_stream(msg_type, &frame) {
        Some(update) => {
            let _ = events.send(LinkEvent::Stream(update)).await;
        }
        None => debug!(msg_type, "Unhandled stream frame"),
    }
    FrameOutcome::Continue
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_call_resolves_with_injected_response() {
        let (handle, mut frames) = LinkHandle::pair();

        let call = handle.call(json!({"ping": 1}));
        let responder = async {
            let sent = frames.recv().await.unwrap();
            let sent: Value = serde_json::from_str(&sent).unwrap();
            let req_id = sent["req_id"].as_u64().unwrap();
            assert!(handle
                .inject_frame(&json!({"msg_type": "ping", "ping": "pong", "req_id": req_id}).to_string()));
        };

        let (result, ()) = tokio::join!(call, responder);
        let frame = result.unwrap();
        assert_eq!(frame["msg_type"], "ping");
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_times_out_and_frees_slot() {
        let (handle, _frames) = LinkHandle::pair();
        let result = handle.call(json!({"balance": 1})).await;
        assert_eq!(result.unwrap_err(), CallError::Timeout);
    }

    #[tokio::test]
    async fn test_call_fails_fast_when_disconnected() {
        let (handle, _frames) = LinkHandle::pair();
        handle.connected.store(false, Ordering::SeqCst);
        assert_eq!(
            handle.call(json!({"ping": 1})).await.unwrap_err(),
            CallError::NotConnected
        );
        assert_eq!(
            handle.send(json!({"ping": 1})).unwrap_err(),
            CallError::NotConnected
        );
    }

    #[tokio::test]
    async fn test_send_tags_monotonic_req_ids() {
        let (handle, mut frames) = LinkHandle::pair();
        let first = handle.send(json!({"ticks": "BOOM500"})).unwrap();
        let second = handle.send(json!({"balance": 1})).unwrap();
        assert!(second > first);

        let frame: Value = serde_json::from_str(&frames.recv().await.unwrap()).unwrap();
        assert_eq!(frame["req_id"].as_u64(), Some(first));
    }

    #[tokio::test]
    async fn test_stream_frame_does_not_resolve_calls() {
        let (handle, _frames) = LinkHandle::pair();
        // No req_id: must never claim a pending slot.
        assert!(!handle.inject_frame(
            &json!({"msg_type": "tick", "tick": {"symbol": "BOOM500", "epoch": 1, "quote": 100}})
                .to_string()
        ));
    }
}
