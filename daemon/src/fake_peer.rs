/// In-process stand-in for the iTerm2 automation API, used by the async
/// tests. Speaks the daemon's JSON frames over a real websocket so the
/// whole client stack (handshake, dispatch, subscription) is exercised
/// unmodified. Serves one connection at a time, like the real peer.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::protocol::{AppSnapshot, ClientFrame, ServerFrame, TabId};

/// How the peer answers the auth handshake.
#[derive(Clone, Copy)]
pub enum AuthMode {
    GrantAll,
    /// Deny the first `n` connections, grant from the `n+1`-th on.
    DenyFirst(usize),
}

enum PeerCmd {
    Focus(TabId),
    Drop,
}

pub struct FakePeer {
    pub url: String,
    /// Every Inject / SetTabColor frame received, in arrival order.
    pub actions: Arc<Mutex<Vec<ClientFrame>>>,
    /// Accept instants, one per connection, for backoff-gap assertions.
    pub connects: Arc<Mutex<Vec<Instant>>>,
    snapshot: Arc<Mutex<AppSnapshot>>,
    cmd_tx: Arc<Mutex<Option<mpsc::UnboundedSender<PeerCmd>>>>,
    subscriptions: Arc<AtomicUsize>,
}

impl FakePeer {
    pub async fn start(snapshot: AppSnapshot, auth: AuthMode) -> FakePeer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());

        let peer = FakePeer {
            url,
            actions: Arc::new(Mutex::new(Vec::new())),
            connects: Arc::new(Mutex::new(Vec::new())),
            snapshot: Arc::new(Mutex::new(snapshot)),
            cmd_tx: Arc::new(Mutex::new(None)),
            subscriptions: Arc::new(AtomicUsize::new(0)),
        };

        let actions = Arc::clone(&peer.actions);
        let connects = Arc::clone(&peer.connects);
        let snapshot = Arc::clone(&peer.snapshot);
        let cmd_slot = Arc::clone(&peer.cmd_tx);
        let subscriptions = Arc::clone(&peer.subscriptions);

        tokio::spawn(async move {
            let mut accepted = 0usize;
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                accepted += 1;
                connects.lock().unwrap().push(Instant::now());

                let deny = matches!(auth, AuthMode::DenyFirst(n) if accepted <= n);
                let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
                *cmd_slot.lock().unwrap() = Some(cmd_tx);

                serve(
                    stream,
                    deny,
                    Arc::clone(&actions),
                    Arc::clone(&snapshot),
                    Arc::clone(&subscriptions),
                    cmd_rx,
                )
                .await;
            }
        });

        peer
    }

    /// Pushes a focus-change notification to the current connection.
    pub fn push_focus(&self, tab_id: &str) {
        if let Some(tx) = self.cmd_tx.lock().unwrap().as_ref() {
            let _ = tx.send(PeerCmd::Focus(TabId::from(tab_id)));
        }
    }

    /// Hard-closes the current connection, as a quitting iTerm2 would.
    pub fn drop_connection(&self) {
        if let Some(tx) = self.cmd_tx.lock().unwrap().as_ref() {
            let _ = tx.send(PeerCmd::Drop);
        }
    }

    pub fn connect_count(&self) -> usize {
        self.connects.lock().unwrap().len()
    }

    pub fn subscribe_count(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    /// Number of reset escapes injected into `session_id` so far.
    pub fn injects_for(&self, session_id: &str) -> usize {
        self.actions
            .lock()
            .unwrap()
            .iter()
            .filter(|frame| {
                matches!(frame, ClientFrame::Inject { session_id: sid, .. } if sid == session_id)
            })
            .count()
    }

    /// Whether a SetTabColor { enabled: false } arrived for `session_id`.
    pub fn tab_color_disabled(&self, session_id: &str) -> bool {
        self.actions.lock().unwrap().iter().any(|frame| {
            matches!(
                frame,
                ClientFrame::SetTabColor { session_id: sid, enabled: false } if sid == session_id
            )
        })
    }
}

async fn serve(
    stream: TcpStream,
    deny: bool,
    actions: Arc<Mutex<Vec<ClientFrame>>>,
    snapshot: Arc<Mutex<AppSnapshot>>,
    subscriptions: Arc<AtomicUsize>,
    mut cmd_rx: mpsc::UnboundedReceiver<PeerCmd>,
) {
    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };

    loop {
        tokio::select! {
            msg = ws.next() => {
                let Some(Ok(msg)) = msg else { break };
                let Message::Text(text) = msg else { continue };
                let Ok(frame) = serde_json::from_str::<ClientFrame>(&text) else {
                    continue;
                };
                match frame {
                    ClientFrame::Auth { .. } => {
                        let reply = if deny {
                            ServerFrame::AuthReply {
                                granted: false,
                                reason: Some("denied by test peer".into()),
                            }
                        } else {
                            ServerFrame::AuthReply {
                                granted: true,
                                reason: None,
                            }
                        };
                        if send(&mut ws, &reply).await.is_err() {
                            break;
                        }
                        if deny {
                            break;
                        }
                    }
                    ClientFrame::Subscribe { id, .. } => {
                        subscriptions.fetch_add(1, Ordering::SeqCst);
                        let reply = ServerFrame::SubscribeReply { id, ok: true };
                        if send(&mut ws, &reply).await.is_err() {
                            break;
                        }
                    }
                    ClientFrame::Snapshot { id } => {
                        let reply = ServerFrame::SnapshotReply {
                            id,
                            snapshot: snapshot.lock().unwrap().clone(),
                        };
                        if send(&mut ws, &reply).await.is_err() {
                            break;
                        }
                    }
                    frame @ (ClientFrame::Inject { .. } | ClientFrame::SetTabColor { .. }) => {
                        actions.lock().unwrap().push(frame);
                    }
                }
            }
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(PeerCmd::Focus(tab_id)) => {
                        let event = ServerFrame::FocusChanged { tab_id };
                        if send(&mut ws, &event).await.is_err() {
                            break;
                        }
                    }
                    Some(PeerCmd::Drop) | None => break,
                }
            }
        }
    }
    // Dropping `ws` closes the transport without a close handshake.
}

async fn send(ws: &mut WebSocketStream<TcpStream>, frame: &ServerFrame) -> Result<(), ()> {
    let json = serde_json::to_string(frame).unwrap();
    ws.send(Message::Text(json.into())).await.map_err(|_| ())
}

/// Polls `cond` every 25ms for up to five seconds, panicking with `what`
/// on timeout. Keeps the scenario tests free of bare sleeps.
pub async fn wait_for(mut cond: impl FnMut() -> bool, what: &str) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {what}");
}
