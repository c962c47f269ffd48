use serde::{Deserialize, Serialize};

/// Opaque identifier of one iTerm2 tab.
///
/// Tab ids are minted by iTerm2 and only make sense against the connection
/// that produced them; they are re-resolved against a fresh [`AppSnapshot`]
/// on every use and never cached across reconnects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TabId(pub String);

impl From<&str> for TabId {
    fn from(id: &str) -> Self {
        TabId(id.to_string())
    }
}

impl std::fmt::Display for TabId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One focus-change notification, consumed at most once.
#[derive(Debug, Clone, PartialEq)]
pub struct FocusUpdate {
    /// The tab that just became selected.
    pub tab_id: TabId,
}

/// One tab as reported by the peer, with the sessions (panes) it contains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabSnapshot {
    pub tab_id: TabId,
    pub sessions: Vec<String>,
}

/// Point-in-time view of the terminal: which tab is focused and what tabs
/// exist. Fetched fresh from the peer; stale snapshots die with their
/// connection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppSnapshot {
    pub current_tab: Option<TabId>,
    pub tabs: Vec<TabSnapshot>,
}

impl AppSnapshot {
    /// Resolves a tab id against this snapshot. An absent id is a normal
    /// outcome (the tab closed, or the snapshot predates it), not an error.
    pub fn tab(&self, id: &TabId) -> Option<&TabSnapshot> {
        self.tabs.iter().find(|t| &t.tab_id == id)
    }
}

/// Event categories the daemon can subscribe to. Only focus changes today.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Focus,
}

/// Frames sent to iTerm2.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Must be the first frame on a fresh connection.
    Auth { cookie: Option<String> },
    Subscribe { id: u64, category: EventCategory },
    Snapshot { id: u64 },
    /// Write raw bytes to a session's terminal, as if the program running
    /// in it had emitted them.
    Inject { session_id: String, data: String },
    /// Toggle the "use tab color" profile property for a session.
    SetTabColor { session_id: String, enabled: bool },
}

/// Frames received from iTerm2. Replies carry the id of the request they
/// answer; notifications carry none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    AuthReply { granted: bool, reason: Option<String> },
    SubscribeReply { id: u64, ok: bool },
    SnapshotReply { id: u64, snapshot: AppSnapshot },
    FocusChanged { tab_id: TabId },
}

impl ServerFrame {
    /// The request id this frame replies to, if it is a reply at all.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            ServerFrame::SubscribeReply { id, .. } | ServerFrame::SnapshotReply { id, .. } => {
                Some(*id)
            }
            _ => None,
        }
    }
}
