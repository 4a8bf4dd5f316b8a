//! Per-account Discord gateway client.
//!
//! Each account keeps one compressed WebSocket to the gateway. The client
//! authenticates (IDENTIFY) or resumes (RESUME), answers heartbeats, inflates
//! incoming frames and forwards decoded dispatch events to the account
//! runtime over an unbounded queue. It never sends Midjourney commands; those
//! go through the command transport.
//!
//! Failures funnel into one classifier: internal code 2001 asks for a resume,
//! server codes ≥ 4000 (and decoder trouble, 1011) force a fresh session.
//! More than five failed fresh connects inside a five-minute sliding window
//! disable the account.

pub mod auth;
pub mod events;
pub mod inflate;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::{self, timeout};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

use crate::error::{ProxyError, Result};
use crate::notify::mail::MailNotifier;
use crate::store::Store;
use auth::AuthData;
use events::{
    DispatchEvent, GatewayPayload, HelloData, CLOSE_CODE_EXCEPTION, CLOSE_CODE_RECONNECT,
    CLOSE_CODE_RESUME_HINT, OP_DISPATCH, OP_HEARTBEAT, OP_HEARTBEAT_ACK, OP_HELLO, OP_IDENTIFY,
    OP_INVALID_SESSION, OP_RECONNECT, OP_RESUME,
};
use inflate::StreamInflater;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;
type WsStream = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

const GATEWAY_VERSION: u8 = 9;
/// Outer bound on waiting for the per-account connect mutex.
const CONNECT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);
/// Pause between fresh-connect attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
/// Sliding window for counting fresh-connect failures.
const FAILURE_WINDOW: Duration = Duration::from_secs(300);
/// Failures tolerated inside [`FAILURE_WINDOW`] before disabling.
const MAX_FAILURES_IN_WINDOW: usize = 5;
/// Grace given to a graceful close before the socket is dropped.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);
/// Grace given to receive/heartbeat tasks before they are aborted.
const TASK_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Signals and events delivered to the account runtime.
#[derive(Debug)]
pub enum GatewayEvent {
    Dispatch(DispatchEvent),
    /// Exactly one per successful handshake (READY or RESUMED).
    SocketSuccess,
    Disconnected { code: u16, reason: String },
    Disabled { reason: String },
}

/// Connection endpoints and credentials for one account.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub wss: String,
    /// Reverse-proxy override; when unset resumes use the
    /// `resume_gateway_url` captured from READY.
    pub resume_wss: Option<String>,
    pub user_token: String,
    pub user_agent: String,
}

#[derive(Debug, Default, Clone)]
struct SessionState {
    session_id: Option<String>,
    sequence: Option<u64>,
    resume_gateway_url: Option<String>,
}

/// Session identity shared between the gateway client and the runtime (the
/// command transport echoes the session id).
#[derive(Default)]
pub struct GatewaySession {
    state: std::sync::Mutex<SessionState>,
}

impl GatewaySession {
    fn lock(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn session_id(&self) -> String {
        self.lock().session_id.clone().unwrap_or_default()
    }

    pub fn resume_gateway_url(&self) -> Option<String> {
        self.lock().resume_gateway_url.clone()
    }

    pub fn sequence(&self) -> Option<u64> {
        self.lock().sequence
    }

    fn set_ready(&self, session_id: String, resume_gateway_url: String) {
        let mut state = self.lock();
        state.session_id = Some(session_id);
        state.resume_gateway_url = Some(resume_gateway_url);
    }

    fn update_sequence(&self, seq: u64) {
        self.lock().sequence = Some(seq);
    }

    fn can_resume(&self) -> bool {
        let state = self.lock();
        state.session_id.is_some() && state.sequence.is_some()
    }

    fn clear(&self) {
        *self.lock() = SessionState::default();
    }
}

/// Whether a failure code asks for a resume (`true`) or a fresh session.
fn should_resume(code: u16) -> bool {
    if code >= 4000 {
        return false;
    }
    match code {
        CLOSE_CODE_RECONNECT => true,
        CLOSE_CODE_EXCEPTION => false,
        _ => false,
    }
}

/// Record a fresh-connect failure and report whether the budget is spent.
fn failure_budget_exceeded(failures: &mut VecDeque<Instant>, now: Instant) -> bool {
    failures.push_back(now);
    while let Some(&oldest) = failures.front() {
        if now.duration_since(oldest) > FAILURE_WINDOW {
            failures.pop_front();
        } else {
            break;
        }
    }
    failures.len() > MAX_FAILURES_IN_WINDOW
}

/// Sleep before the next heartbeat: jittered interval minus last latency.
fn heartbeat_sleep(interval_ms: u64, latency_ms: u64, jitter: f64) -> Duration {
    let ms = (interval_ms as f64 * jitter - latency_ms as f64).max(0.0);
    Duration::from_millis(ms as u64)
}

fn gateway_url(base: &str) -> String {
    format!(
        "{}/?encoding=json&v={}&compress=zlib-stream",
        base.trim_end_matches('/'),
        GATEWAY_VERSION
    )
}

pub struct GatewayClient {
    account_id: String,
    channel_id: String,
    config: GatewayConfig,
    session: Arc<GatewaySession>,
    events_tx: mpsc::UnboundedSender<GatewayEvent>,
    store: Arc<dyn Store>,
    mailer: Arc<dyn MailNotifier>,

    connect_lock: AsyncMutex<()>,
    running: AtomicBool,
    /// Bumped on every (re)connect and shutdown; loops from older epochs
    /// notice and exit.
    epoch: AtomicU64,
    sink: AsyncMutex<Option<WsSink>>,
    receive_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    heartbeat_task: std::sync::Mutex<Option<JoinHandle<()>>>,

    heartbeat_interval_ms: AtomicU64,
    last_message: std::sync::Mutex<Instant>,
    latency_ms: AtomicU64,
    ack_pending: AtomicBool,
    heartbeat_sends: std::sync::Mutex<VecDeque<Instant>>,
    handshake_notified: AtomicBool,
    failures: std::sync::Mutex<VecDeque<Instant>>,
    reconnecting: AtomicBool,
}

impl GatewayClient {
    pub fn new(
        account_id: String,
        channel_id: String,
        config: GatewayConfig,
        events_tx: mpsc::UnboundedSender<GatewayEvent>,
        store: Arc<dyn Store>,
        mailer: Arc<dyn MailNotifier>,
    ) -> Arc<Self> {
        Arc::new(Self {
            account_id,
            channel_id,
            config,
            session: Arc::new(GatewaySession::default()),
            events_tx,
            store,
            mailer,
            connect_lock: AsyncMutex::new(()),
            running: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            sink: AsyncMutex::new(None),
            receive_task: std::sync::Mutex::new(None),
            heartbeat_task: std::sync::Mutex::new(None),
            heartbeat_interval_ms: AtomicU64::new(41_250),
            last_message: std::sync::Mutex::new(Instant::now()),
            latency_ms: AtomicU64::new(0),
            ack_pending: AtomicBool::new(false),
            heartbeat_sends: std::sync::Mutex::new(VecDeque::new()),
            handshake_notified: AtomicBool::new(false),
            failures: std::sync::Mutex::new(VecDeque::new()),
            reconnecting: AtomicBool::new(false),
        })
    }

    pub fn session(&self) -> Arc<GatewaySession> {
        Arc::clone(&self.session)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn latency_ms(&self) -> u64 {
        self.latency_ms.load(Ordering::Relaxed)
    }

    /// Open (or re-open) the gateway connection. Idempotent: while a
    /// connection is up, further calls are no-ops. Serialized per account;
    /// waiting on a stuck connect gives up after one minute.
    pub async fn start(self: &Arc<Self>, reconnect: bool) -> Result<()> {
        let _guard = timeout(CONNECT_LOCK_TIMEOUT, self.connect_lock.lock())
            .await
            .map_err(|_| ProxyError::Gateway("timed out waiting for connect lock".into()))?;
        if self.is_running() {
            return Ok(());
        }
        self.connect(reconnect).await
    }

    async fn connect(self: &Arc<Self>, reconnect: bool) -> Result<()> {
        let resume = reconnect && self.session.can_resume();
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.abort_tasks();

        let base = if resume {
            self.config
                .resume_wss
                .clone()
                .or_else(|| self.session.resume_gateway_url())
                .unwrap_or_else(|| self.config.wss.clone())
        } else {
            self.config.wss.clone()
        };
        let url = gateway_url(&base);
        debug!(account_id = %self.account_id, %url, resume, "connecting to gateway");

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ProxyError::Gateway(format!("gateway url: {e}")))?;
        let headers = request.headers_mut();
        headers.insert(
            header::USER_AGENT,
            HeaderValue::from_str(&self.config.user_agent)
                .unwrap_or_else(|_| HeaderValue::from_static("Mozilla/5.0")),
        );
        headers.insert(
            header::ACCEPT_ENCODING,
            HeaderValue::from_static("gzip, deflate, br"),
        );
        headers.insert(
            header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.9"),
        );
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
        headers.insert(
            header::SEC_WEBSOCKET_EXTENSIONS,
            HeaderValue::from_static("permessage-deflate; client_max_window_bits"),
        );

        let (ws, _) = connect_async(request).await?;
        let (sink, stream) = ws.split();
        *self.sink.lock().await = Some(sink);

        self.handshake_notified.store(false, Ordering::SeqCst);
        self.ack_pending.store(false, Ordering::SeqCst);
        *lock_std(&self.heartbeat_sends) = VecDeque::new();
        *lock_std(&self.last_message) = Instant::now();

        if resume {
            let payload = json!({
                "op": OP_RESUME,
                "d": {
                    "token": self.config.user_token,
                    "session_id": self.session.session_id(),
                    "seq": self.session.sequence(),
                }
            });
            self.send_json(&payload).await?;
            info!(account_id = %self.account_id, "sent RESUME");
        } else {
            let payload = json!({
                "op": OP_IDENTIFY,
                "d": AuthData::new(&self.config.user_token, &self.config.user_agent),
            });
            self.send_json(&payload).await?;
            info!(account_id = %self.account_id, "sent IDENTIFY");
        }

        let client = Arc::clone(self);
        let handle = tokio::spawn(async move {
            client.receive_loop(stream, epoch).await;
        });
        *lock_std(&self.receive_task) = Some(handle);
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Close the connection and stop all tasks. `code` 4000 hints the server
    /// to keep the session for a later resume.
    pub async fn close(&self, code: u16) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);

        if let Some(mut sink) = self.sink.lock().await.take() {
            let frame = CloseFrame {
                code: CloseCode::from(code),
                reason: "".into(),
            };
            let graceful = async {
                let _ = sink.send(WsMessage::Close(Some(frame))).await;
                let _ = sink.close().await;
            };
            if timeout(CLOSE_TIMEOUT, graceful).await.is_err() {
                warn!(account_id = %self.account_id, "graceful close timed out, dropping socket");
            }
        }

        let receive = lock_std(&self.receive_task).take();
        let heartbeat = lock_std(&self.heartbeat_task).take();
        for task in [receive, heartbeat].into_iter().flatten() {
            drain_task(task).await;
        }
    }

    fn abort_tasks(&self) {
        if let Some(task) = lock_std(&self.receive_task).take() {
            task.abort();
        }
        if let Some(task) = lock_std(&self.heartbeat_task).take() {
            task.abort();
        }
    }

    async fn send_json(&self, value: &Value) -> Result<()> {
        let text = serde_json::to_string(value)?;
        let mut guard = self.sink.lock().await;
        match guard.as_mut() {
            Some(sink) => {
                sink.send(WsMessage::Text(text)).await?;
                Ok(())
            }
            None => Err(ProxyError::Gateway("socket not connected".into())),
        }
    }

    async fn receive_loop(self: Arc<Self>, mut stream: WsStream, epoch: u64) {
        let mut inflater = StreamInflater::new();
        while let Some(message) = stream.next().await {
            if self.epoch.load(Ordering::SeqCst) != epoch {
                return;
            }
            match message {
                Ok(WsMessage::Binary(payload)) => match inflater.push(&payload) {
                    Ok(Some(text)) => self.handle_text(&text, epoch).await,
                    Ok(None) => {}
                    Err(e) => {
                        self.handle_failure(
                            epoch,
                            CLOSE_CODE_EXCEPTION,
                            &format!("decompression failed: {e}"),
                        );
                        return;
                    }
                },
                Ok(WsMessage::Text(text)) => self.handle_text(&text, epoch).await,
                Ok(WsMessage::Close(frame)) => {
                    let (code, reason) = frame
                        .map(|f| (u16::from(f.code), f.reason.to_string()))
                        .unwrap_or((1006, "closed without frame".to_string()));
                    self.handle_failure(epoch, code, &reason);
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    self.handle_failure(epoch, 1006, &format!("socket error: {e}"));
                    return;
                }
            }
        }
        self.handle_failure(epoch, 1006, "gateway stream ended");
    }

    async fn handle_text(self: &Arc<Self>, text: &str, epoch: u64) {
        let payload: GatewayPayload = match serde_json::from_str(text) {
            Ok(p) => p,
            Err(e) => {
                warn!(account_id = %self.account_id, "malformed gateway frame: {e}");
                return;
            }
        };

        if let Some(seq) = payload.s {
            self.session.update_sequence(seq);
        }
        *lock_std(&self.last_message) = Instant::now();

        match payload.op {
            OP_DISPATCH => {
                let event_type = payload.t.as_deref().unwrap_or_default();
                let data = payload.d.unwrap_or(Value::Null);
                match event_type {
                    "READY" => match DispatchEvent::decode("READY", data) {
                        Ok(Some(DispatchEvent::Ready {
                            session_id,
                            resume_gateway_url,
                            user_id,
                        })) => {
                            info!(account_id = %self.account_id, %user_id, "gateway READY");
                            self.session.set_ready(session_id, resume_gateway_url);
                            self.notify_handshake_success();
                        }
                        other => warn!(account_id = %self.account_id, "bad READY: {other:?}"),
                    },
                    "RESUMED" => {
                        info!(account_id = %self.account_id, "gateway RESUMED");
                        self.notify_handshake_success();
                    }
                    _ => match DispatchEvent::decode(event_type, data) {
                        Ok(Some(event)) => {
                            let _ = self.events_tx.send(GatewayEvent::Dispatch(event));
                        }
                        Ok(None) => {}
                        Err(e) => {
                            debug!(account_id = %self.account_id, event_type, "undecodable dispatch: {e}");
                        }
                    },
                }
            }
            OP_HEARTBEAT => {
                let payload = json!({"op": OP_HEARTBEAT, "d": self.session.sequence()});
                if let Err(e) = self.send_json(&payload).await {
                    warn!(account_id = %self.account_id, "answer server heartbeat: {e}");
                }
            }
            OP_RECONNECT => {
                self.handle_failure(epoch, CLOSE_CODE_RECONNECT, "server requested reconnect");
            }
            OP_INVALID_SESSION => {
                info!(account_id = %self.account_id, "session invalidated");
                self.session.clear();
                self.schedule_reconnect(false, "invalid session");
            }
            OP_HELLO => {
                let interval = payload
                    .d
                    .and_then(|d| serde_json::from_value::<HelloData>(d).ok())
                    .map(|h| h.heartbeat_interval)
                    .unwrap_or(41_250);
                self.heartbeat_interval_ms.store(interval, Ordering::SeqCst);
                debug!(account_id = %self.account_id, interval, "received HELLO");

                if let Some(task) = lock_std(&self.heartbeat_task).take() {
                    task.abort();
                }
                let client = Arc::clone(self);
                let handle = tokio::spawn(async move {
                    client.heartbeat_loop(epoch).await;
                });
                *lock_std(&self.heartbeat_task) = Some(handle);
            }
            OP_HEARTBEAT_ACK => {
                if let Some(sent) = lock_std(&self.heartbeat_sends).pop_front() {
                    let latency = sent.elapsed().as_millis() as u64;
                    self.latency_ms.store(latency, Ordering::Relaxed);
                }
                self.ack_pending.store(false, Ordering::SeqCst);
            }
            other => debug!(account_id = %self.account_id, op = other, "unhandled opcode"),
        }
    }

    fn notify_handshake_success(&self) {
        if !self.handshake_notified.swap(true, Ordering::SeqCst) {
            let _ = self.events_tx.send(GatewayEvent::SocketSuccess);
        }
    }

    async fn heartbeat_loop(self: Arc<Self>, epoch: u64) {
        loop {
            if self.epoch.load(Ordering::SeqCst) != epoch {
                return;
            }
            let interval = self.heartbeat_interval_ms.load(Ordering::SeqCst);

            let silent_for = lock_std(&self.last_message).elapsed();
            if self.ack_pending.load(Ordering::SeqCst)
                && silent_for > Duration::from_millis(interval)
            {
                self.handle_failure(epoch, CLOSE_CODE_RECONNECT, "heartbeat ack missing");
                return;
            }

            lock_std(&self.heartbeat_sends).push_back(Instant::now());
            self.ack_pending.store(true, Ordering::SeqCst);
            let payload = json!({"op": OP_HEARTBEAT, "d": self.session.sequence()});
            if let Err(e) = self.send_json(&payload).await {
                self.handle_failure(epoch, CLOSE_CODE_RECONNECT, &format!("heartbeat send: {e}"));
                return;
            }

            let jitter = rand::thread_rng().gen_range(0.9..=1.0);
            let latency = self.latency_ms.load(Ordering::Relaxed);
            time::sleep(heartbeat_sleep(interval, latency, jitter)).await;
        }
    }

    /// Single funnel for every connection failure.
    fn handle_failure(self: &Arc<Self>, epoch: u64, code: u16, reason: &str) {
        if self.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        self.schedule_reconnect(should_resume(code), reason);
        let _ = self.events_tx.send(GatewayEvent::Disconnected {
            code,
            reason: reason.to_string(),
        });
    }

    fn schedule_reconnect(self: &Arc<Self>, resume: bool, reason: &str) {
        if self.reconnecting.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(account_id = %self.account_id, resume, "gateway connection lost: {reason}");
        self.running.store(false, Ordering::SeqCst);

        let client = Arc::clone(self);
        tokio::spawn(async move {
            client.clone().reconnect_task(resume).await;
            client.reconnecting.store(false, Ordering::SeqCst);
        });
    }

    async fn reconnect_task(self: Arc<Self>, resume: bool) {
        self.close(if resume { CLOSE_CODE_RESUME_HINT } else { 1000 })
            .await;

        if resume {
            match self.start(true).await {
                Ok(()) => return,
                Err(e) => {
                    warn!(account_id = %self.account_id, "resume failed, reconnecting fresh: {e}");
                }
            }
        }

        loop {
            self.session.clear();
            match self.start(false).await {
                Ok(()) => return,
                Err(e) => {
                    warn!(account_id = %self.account_id, "fresh connect failed: {e}");
                    let exceeded =
                        failure_budget_exceeded(&mut lock_std(&self.failures), Instant::now());
                    if exceeded {
                        self.disable(
                            "Gateway reconnect budget exceeded: more than 5 failed connects in 5 minutes",
                        )
                        .await;
                        return;
                    }
                    time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }

    /// Disable the account in the store, signal the runtime and notify once.
    async fn disable(&self, reason: &str) {
        error!(account_id = %self.account_id, channel_id = %self.channel_id, "disabling account: {reason}");

        let already_disabled = match self.store.get_account(&self.account_id) {
            Ok(Some(mut account)) => {
                let was_disabled = !account.enable;
                account.enable = false;
                account.disabled_reason = Some(reason.to_string());
                if let Err(e) = self
                    .store
                    .update_account_fields(&account, &["enable", "disabled_reason"])
                {
                    error!(account_id = %self.account_id, "persist disablement: {e}");
                }
                was_disabled
            }
            Ok(None) => false,
            Err(e) => {
                error!(account_id = %self.account_id, "load account for disablement: {e}");
                false
            }
        };

        let _ = self.events_tx.send(GatewayEvent::Disabled {
            reason: reason.to_string(),
        });

        if !already_disabled {
            self.mailer
                .notify(
                    &format!("Account {} disabled", self.channel_id),
                    &format!("Account {} was disabled: {reason}", self.account_id),
                )
                .await;
        }
    }
}

fn lock_std<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

async fn drain_task(mut task: JoinHandle<()>) {
    if timeout(TASK_DRAIN_TIMEOUT, &mut task).await.is_err() {
        task.abort();
    }
}
