/// Client for the iTerm2 websocket automation API.
///
/// Owns everything tied to one connection's lifetime: the authenticated
/// transport ([`Connection`]), the frame dispatch loop, and the per-session
/// listener/reply state ([`ClientContext`]). The supervisor creates a fresh
/// context for every connection attempt and invalidates it afterwards, so
/// nothing from a dead session can be observed by the next one.
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::config::ConnectionConfig;
use crate::protocol::{
    AppSnapshot, ClientFrame, EventCategory, FocusUpdate, ServerFrame, TabId, TabSnapshot,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Read half of the transport; fed to [`dispatch_forever`].
pub type FrameReader = SplitStream<WsStream>;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(2);
/// Focus updates queued between the dispatch loop and the consumer. Updates
/// beyond this are dropped; the periodic reset catches up.
const FOCUS_QUEUE_DEPTH: usize = 16;

#[derive(Debug, Error)]
pub enum ClientError {
    /// iTerm2 is not running or refused the websocket connection.
    #[error("connect failed: {0}")]
    Connect(String),
    /// iTerm2 rejected the auth cookie.
    #[error("authentication denied: {0}")]
    AuthDenied(String),
    /// The connection, or the session context behind it, is gone.
    #[error("connection closed")]
    Closed,
    /// The focus subscription was torn down while waiting on it.
    #[error("focus subscription closed")]
    SubscriptionClosed,
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Per-connection client state: pending replies, the focus listener, and
/// the last snapshot fetched from the peer.
///
/// All of it becomes garbage the instant the owning connection dies, so the
/// supervisor builds a fresh context before every connect attempt and calls
/// [`invalidate`](Self::invalidate) when a session ends. Invalidation wakes
/// every waiter: pending requests fail with [`ClientError::Closed`] and the
/// focus consumer sees [`ClientError::SubscriptionClosed`].
#[derive(Debug)]
pub struct ClientContext {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, oneshot::Sender<ServerFrame>>>,
    focus_tx: Mutex<Option<mpsc::Sender<FocusUpdate>>>,
    snapshot: Mutex<Option<AppSnapshot>>,
}

impl ClientContext {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            focus_tx: Mutex::new(None),
            snapshot: Mutex::new(None),
        }
    }

    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn register(&self, id: u64) -> oneshot::Receiver<ServerFrame> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);
        rx
    }

    fn discard(&self, id: u64) {
        self.pending.lock().unwrap().remove(&id);
    }

    fn complete(&self, id: u64, frame: ServerFrame) {
        if let Some(tx) = self.pending.lock().unwrap().remove(&id) {
            let _ = tx.send(frame);
        }
    }

    fn set_focus_listener(&self, tx: mpsc::Sender<FocusUpdate>) {
        *self.focus_tx.lock().unwrap() = Some(tx);
    }

    fn publish_focus(&self, update: FocusUpdate) {
        if let Some(tx) = self.focus_tx.lock().unwrap().as_ref() {
            // try_send: the dispatch loop must never block on a slow consumer.
            let _ = tx.try_send(update);
        }
    }

    fn cache_snapshot(&self, snapshot: AppSnapshot) {
        *self.snapshot.lock().unwrap() = Some(snapshot);
    }

    /// Last snapshot fetched over the owning connection, if any.
    pub fn cached_snapshot(&self) -> Option<AppSnapshot> {
        self.snapshot.lock().unwrap().clone()
    }

    /// Drops every registered listener, pending reply, and cached peer
    /// object, waking any task still suspended on them.
    pub fn invalidate(&self) {
        self.pending.lock().unwrap().clear();
        self.focus_tx.lock().unwrap().take();
        self.snapshot.lock().unwrap().take();
    }
}

/// Opens the transport and authenticates. No other frame is sent until the
/// peer has granted access; a failure in either step registers no state.
pub async fn open(
    config: &ConnectionConfig,
    ctx: Arc<ClientContext>,
) -> Result<(Connection, FrameReader), ClientError> {
    let (mut ws, _) = tokio::time::timeout(HANDSHAKE_TIMEOUT, connect_async(config.url.as_str()))
        .await
        .map_err(|_| ClientError::Timeout("websocket connect"))?
        .map_err(|e| ClientError::Connect(e.to_string()))?;

    let auth = ClientFrame::Auth {
        cookie: config.effective_cookie(),
    };
    let json = serde_json::to_string(&auth).map_err(|e| ClientError::Protocol(e.to_string()))?;
    ws.send(Message::Text(json.into()))
        .await
        .map_err(|e| ClientError::Connect(e.to_string()))?;

    let deadline = tokio::time::Instant::now() + HANDSHAKE_TIMEOUT;
    loop {
        let msg = tokio::time::timeout_at(deadline, ws.next())
            .await
            .map_err(|_| ClientError::Timeout("auth reply"))?
            .ok_or_else(|| ClientError::Connect("closed during auth".into()))?
            .map_err(|e| ClientError::Connect(e.to_string()))?;
        let Message::Text(text) = msg else { continue };
        match serde_json::from_str::<ServerFrame>(&text) {
            Ok(ServerFrame::AuthReply { granted: true, .. }) => break,
            Ok(ServerFrame::AuthReply {
                granted: false,
                reason,
            }) => {
                return Err(ClientError::AuthDenied(
                    reason.unwrap_or_else(|| "no reason given".into()),
                ));
            }
            Ok(_) => continue,
            Err(e) => return Err(ClientError::Protocol(e.to_string())),
        }
    }

    let (writer, reader) = ws.split();
    Ok((
        Connection {
            writer: tokio::sync::Mutex::new(writer),
            ctx,
        },
        reader,
    ))
}

/// One authenticated connection to iTerm2. Shared (`Arc`) between the
/// session tasks; the read half lives in the dispatch loop.
#[derive(Debug)]
pub struct Connection {
    writer: tokio::sync::Mutex<SplitSink<WsStream, Message>>,
    ctx: Arc<ClientContext>,
}

impl Connection {
    pub fn context(&self) -> &Arc<ClientContext> {
        &self.ctx
    }

    async fn send(&self, frame: &ClientFrame) -> Result<(), ClientError> {
        let json =
            serde_json::to_string(frame).map_err(|e| ClientError::Protocol(e.to_string()))?;
        self.writer
            .lock()
            .await
            .send(Message::Text(json.into()))
            .await
            .map_err(|_| ClientError::Closed)
    }

    /// Sends one request frame and waits for the dispatch loop to route its
    /// reply back. Fails with [`ClientError::Closed`] when the context is
    /// invalidated or the dispatch loop dies while we wait.
    async fn request(
        &self,
        build: impl FnOnce(u64) -> ClientFrame,
    ) -> Result<ServerFrame, ClientError> {
        let id = self.ctx.next_request_id();
        let rx = self.ctx.register(id);
        if let Err(e) = self.send(&build(id)).await {
            self.ctx.discard(id);
            return Err(e);
        }
        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(frame)) => Ok(frame),
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                self.ctx.discard(id);
                Err(ClientError::Timeout("reply"))
            }
        }
    }

    /// Fetches a fresh view of the terminal and caches it in the context.
    pub async fn snapshot(&self) -> Result<AppSnapshot, ClientError> {
        match self.request(|id| ClientFrame::Snapshot { id }).await? {
            ServerFrame::SnapshotReply { snapshot, .. } => {
                self.ctx.cache_snapshot(snapshot.clone());
                Ok(snapshot)
            }
            other => Err(ClientError::Protocol(format!("unexpected reply: {other:?}"))),
        }
    }

    /// Resolves a tab id against a fresh snapshot. `None` means the tab no
    /// longer exists, which callers treat as "nothing to do."
    pub async fn resolve_target(&self, tab_id: &TabId) -> Result<Option<TabSnapshot>, ClientError> {
        let snapshot = self.snapshot().await?;
        Ok(snapshot.tab(tab_id).cloned())
    }

    /// Refreshes the cached snapshot and resolves the currently focused tab
    /// from it. `None` when no tab has focus (or it vanished in between).
    pub async fn focused_tab(&self) -> Result<Option<TabSnapshot>, ClientError> {
        self.snapshot().await?;
        let Some(snapshot) = self.ctx.cached_snapshot() else {
            return Ok(None);
        };
        let Some(current) = snapshot.current_tab.as_ref() else {
            return Ok(None);
        };
        Ok(snapshot.tab(current).cloned())
    }

    /// Registers interest in focus-change events. Single consumer: the
    /// returned [`FocusEvents`] is the only way to read them.
    pub async fn subscribe_focus(&self) -> Result<FocusEvents, ClientError> {
        match self
            .request(|id| ClientFrame::Subscribe {
                id,
                category: EventCategory::Focus,
            })
            .await?
        {
            ServerFrame::SubscribeReply { ok: true, .. } => {
                let (tx, rx) = mpsc::channel(FOCUS_QUEUE_DEPTH);
                self.ctx.set_focus_listener(tx);
                Ok(FocusEvents { rx })
            }
            ServerFrame::SubscribeReply { ok: false, .. } => {
                Err(ClientError::Protocol("focus subscription rejected".into()))
            }
            other => Err(ClientError::Protocol(format!("unexpected reply: {other:?}"))),
        }
    }

    /// Writes raw bytes into a session's terminal. Fire-and-forget.
    pub async fn inject(&self, session_id: &str, data: &str) -> Result<(), ClientError> {
        self.send(&ClientFrame::Inject {
            session_id: session_id.to_string(),
            data: data.to_string(),
        })
        .await
    }

    /// Toggles the "use tab color" profile property. Fire-and-forget.
    pub async fn set_tab_color(&self, session_id: &str, enabled: bool) -> Result<(), ClientError> {
        self.send(&ClientFrame::SetTabColor {
            session_id: session_id.to_string(),
            enabled,
        })
        .await
    }

    /// Closes the transport. Idempotent and infallible: errors here mean
    /// the connection is already dead, which is the goal.
    pub async fn close(&self) {
        let _ = self.writer.lock().await.send(Message::Close(None)).await;
    }
}

/// Handle for consuming focus-change updates.
pub struct FocusEvents {
    rx: mpsc::Receiver<FocusUpdate>,
}

impl FocusEvents {
    /// Suspends until the next update arrives, or fails with
    /// [`ClientError::SubscriptionClosed`] once the subscription is torn
    /// down (context invalidated or session unwinding).
    pub async fn next_update(&mut self) -> Result<FocusUpdate, ClientError> {
        self.rx.recv().await.ok_or(ClientError::SubscriptionClosed)
    }
}

/// Pulls frames off the transport and routes them: replies to the pending
/// map, focus notifications to the subscriber. Returns (never panics) when
/// the transport closes or errors; the caller treats that return as
/// "connection dead."
pub async fn dispatch_forever(mut reader: FrameReader, ctx: Arc<ClientContext>) {
    while let Some(msg) = reader.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                eprintln!("[client] Read error: {e}");
                break;
            }
        };
        let text = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let frame = match serde_json::from_str::<ServerFrame>(&text) {
            Ok(frame) => frame,
            Err(e) => {
                eprintln!("[client] Unparseable frame: {e}");
                continue;
            }
        };
        match frame.request_id() {
            Some(id) => ctx.complete(id, frame),
            None => {
                if let ServerFrame::FocusChanged { tab_id } = frame {
                    ctx.publish_focus(FocusUpdate { tab_id });
                }
            }
        }
    }
}
