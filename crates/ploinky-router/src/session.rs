//! Per-app session and tab state
//!
//! Each app (webtty, webchat, webmeet, dashboard) keeps isolated
//! sessions keyed by a scoped cookie. A tab owns exactly one PTY while
//! open; reconnecting rebinds the SSE sink without killing the PTY, and
//! hard caps bound how many terminals can exist at once.

use crate::error::{Result, RouterError};
use crate::tty::{Tty, TtyFactory};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};

/// Apps served by the session multiplexer.
pub const APPS: [&str; 5] = ["webtty", "webchat", "webmeet", "dashboard", "status"];

/// Hard cap on concurrent PTYs across all sessions of one app.
pub const MAX_GLOBAL_TTYS: usize = 20;
/// Hard cap on concurrent PTYs within one session.
pub const MAX_CONCURRENT_TTYS: usize = 3;
/// Reconnects within this window are refused, per tab.
pub const RECONNECT_DEBOUNCE: Duration = Duration::from_secs(1);
/// How long an empty session lingers before it is dropped.
pub const SESSION_GRACE: Duration = Duration::from_secs(60);
/// Echo-suppression ring size for webchat envelopes.
pub const ECHO_RING_CAPACITY: usize = 25;

/// One frame on the SSE channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    /// JSON-encoded output chunk
    Data(String),
    /// Terminal closed
    Close,
}

/// One browser tab; owns its PTY until disconnect or drain.
pub struct Tab {
    pub id: String,
    tty: Box<dyn Tty>,
    /// Serializes input writes so bodies reach the PTY in request order
    write_lock: tokio::sync::Mutex<()>,
    /// At most one bound sink; reconnecting replaces it
    sink: Mutex<Option<mpsc::Sender<SseFrame>>>,
    /// Driven by the runtime clock so tests can pause time
    last_connect: Mutex<tokio::time::Instant>,
    /// Connection generation; the guard of a replaced connection must
    /// not tear the tab down
    active_conn: AtomicU64,
    echo_ring: Mutex<VecDeque<String>>,
    closed: AtomicBool,
}

impl Tab {
    fn new(id: &str, tty: Box<dyn Tty>) -> Self {
        Self {
            id: id.to_string(),
            tty,
            write_lock: tokio::sync::Mutex::new(()),
            sink: Mutex::new(None),
            last_connect: Mutex::new(tokio::time::Instant::now()),
            active_conn: AtomicU64::new(0),
            echo_ring: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Write raw bytes to the PTY, serialized per tab.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RouterError::TabGone);
        }
        let _guard = self.write_lock.lock().await;
        self.tty.write(data).await
    }

    pub fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RouterError::TabGone);
        }
        self.tty.resize(cols, rows)
    }

    pub fn pid(&self) -> Option<u32> {
        self.tty.pid()
    }

    /// Remember an envelope we just wrote so its echo can be dropped.
    pub fn record_echo(&self, payload: &str) {
        if let Ok(mut ring) = self.echo_ring.lock() {
            if ring.len() >= ECHO_RING_CAPACITY {
                ring.pop_front();
            }
            ring.push_back(payload.to_string());
        }
    }

    /// Best-effort: drop an output chunk that exactly echoes a recent
    /// envelope. Consumes the matched entry.
    fn suppress_echo(&self, chunk: &str) -> bool {
        if let Ok(mut ring) = self.echo_ring.lock() {
            let trimmed = chunk.trim_end_matches(['\r', '\n']);
            if let Some(pos) = ring.iter().position(|e| e == trimmed) {
                ring.remove(pos);
                return true;
            }
        }
        false
    }

    fn send_frame(&self, frame: SseFrame) {
        if let Ok(sink) = self.sink.lock() {
            if let Some(tx) = sink.as_ref() {
                let _ = tx.try_send(frame);
            }
        }
    }

    fn dispose(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.tty.dispose();
    }
}

/// Cookie-scoped group of tabs.
pub struct Session {
    pub id: String,
    pub created_at: Instant,
    tabs: RwLock<HashMap<String, Arc<Tab>>>,
}

impl Session {
    fn new(id: String) -> Arc<Self> {
        Arc::new(Self {
            id,
            created_at: Instant::now(),
            tabs: RwLock::new(HashMap::new()),
        })
    }

    pub async fn tab(&self, tab_id: &str) -> Option<Arc<Tab>> {
        self.tabs.read().await.get(tab_id).cloned()
    }

    pub async fn tab_count(&self) -> usize {
        self.tabs.read().await.len()
    }
}

/// A live SSE connection to a tab.
#[derive(Debug)]
pub struct StreamConn {
    pub rx: mpsc::Receiver<SseFrame>,
    pub guard: ConnGuard,
}

/// Dropped when the SSE connection ends; tears the tab down if this
/// connection is still the tab's active one.
pub struct ConnGuard {
    app: Arc<AppSessions>,
    session_id: String,
    tab_id: String,
    conn_id: u64,
}

impl std::fmt::Debug for ConnGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnGuard")
            .field("session_id", &self.session_id)
            .field("tab_id", &self.tab_id)
            .field("conn_id", &self.conn_id)
            .finish()
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        let app = Arc::clone(&self.app);
        let session_id = self.session_id.clone();
        let tab_id = self.tab_id.clone();
        let conn_id = self.conn_id;
        tokio::spawn(async move {
            app.disconnect(&session_id, &tab_id, conn_id).await;
        });
    }
}

/// All sessions of one app.
pub struct AppSessions {
    pub name: &'static str,
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
    tty_count: AtomicUsize,
    draining: AtomicBool,
}

impl AppSessions {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            tty_count: AtomicUsize::new(0),
            draining: AtomicBool::new(false),
        })
    }

    /// Live PTY count across all sessions of this app.
    pub fn tty_count(&self) -> usize {
        self.tty_count.load(Ordering::SeqCst)
    }

    /// Look up the session for a cookie, minting one when absent.
    /// Returns the session and the freshly minted id, if any.
    pub async fn session_for(&self, cookie: Option<String>) -> (Arc<Session>, Option<String>) {
        if let Some(id) = cookie {
            if let Some(session) = self.sessions.read().await.get(&id).cloned() {
                return (session, None);
            }
        }

        let id = mint_session_id();
        let session = Session::new(id.clone());
        self.sessions
            .write()
            .await
            .insert(id.clone(), session.clone());
        (session, Some(id))
    }

    pub async fn session(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Open an SSE connection to a tab, creating its PTY when the tab is
    /// new. Enforces the global cap, the per-session cap and the
    /// reconnect debounce.
    pub async fn open_stream(
        self: &Arc<Self>,
        session: &Arc<Session>,
        tab_id: &str,
        factory: &dyn TtyFactory,
    ) -> Result<StreamConn> {
        if self.draining.load(Ordering::SeqCst) {
            return Err(RouterError::GlobalCapacity);
        }

        if let Some(tab) = session.tab(tab_id).await {
            // reconnect path: keep the PTY, rebind the sink
            {
                let mut last = tab
                    .last_connect
                    .lock()
                    .map_err(|_| RouterError::Internal("tab lock poisoned".into()))?;
                if last.elapsed() < RECONNECT_DEBOUNCE {
                    return Err(RouterError::ReconnectDebounce);
                }
                *last = tokio::time::Instant::now();
            }

            let conn_id = tab.active_conn.fetch_add(1, Ordering::SeqCst) + 1;
            let (tx, rx) = mpsc::channel(256);
            if let Ok(mut sink) = tab.sink.lock() {
                *sink = Some(tx);
            }
            return Ok(StreamConn {
                rx,
                guard: ConnGuard {
                    app: Arc::clone(self),
                    session_id: session.id.clone(),
                    tab_id: tab_id.to_string(),
                    conn_id,
                },
            });
        }

        let mut tabs = session.tabs.write().await;
        if tabs.contains_key(tab_id) {
            // lost the race to another connect; treat as debounce
            return Err(RouterError::ReconnectDebounce);
        }
        if tabs.len() >= MAX_CONCURRENT_TTYS {
            return Err(RouterError::SessionCapacity);
        }
        if self.tty_count.load(Ordering::SeqCst) >= MAX_GLOBAL_TTYS {
            return Err(RouterError::GlobalCapacity);
        }

        let tty = factory.create(self.name, &session.id, tab_id)?;
        let tab = Arc::new(Tab::new(tab_id, tty));
        self.tty_count.fetch_add(1, Ordering::SeqCst);

        let conn_id = tab.active_conn.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::channel(256);
        if let Ok(mut sink) = tab.sink.lock() {
            *sink = Some(tx);
        }

        self.spawn_output_pump(&tab);
        tabs.insert(tab_id.to_string(), tab);

        Ok(StreamConn {
            rx,
            guard: ConnGuard {
                app: Arc::clone(self),
                session_id: session.id.clone(),
                tab_id: tab_id.to_string(),
                conn_id,
            },
        })
    }

    /// Pump PTY output chunks to the tab's current sink, in order.
    fn spawn_output_pump(&self, tab: &Arc<Tab>) {
        let Some(mut output) = tab.tty.take_output() else {
            return;
        };
        let closed = tab.tty.take_closed();
        let suppress = self.name == "webchat";
        let tab = Arc::clone(tab);

        tokio::spawn(async move {
            let mut closed = closed;
            loop {
                tokio::select! {
                    chunk = output.recv() => match chunk {
                        Some(chunk) => {
                            let text = String::from_utf8_lossy(&chunk).to_string();
                            if suppress && tab.suppress_echo(&text) {
                                continue;
                            }
                            let payload = serde_json::to_string(&text).unwrap_or_default();
                            tab.send_frame(SseFrame::Data(payload));
                        }
                        None => break,
                    },
                    _ = async {
                        match closed.as_mut() {
                            Some(rx) => { let _ = rx.await; }
                            None => std::future::pending::<()>().await,
                        }
                    } => break,
                }
            }
            tab.closed.store(true, Ordering::SeqCst);
            tab.send_frame(SseFrame::Close);
        });
    }

    /// Called when a connection's guard drops.
    async fn disconnect(&self, session_id: &str, tab_id: &str, conn_id: u64) {
        let Some(session) = self.session(session_id).await else {
            return;
        };
        let Some(tab) = session.tab(tab_id).await else {
            return;
        };
        // a reconnect already took over this tab
        if tab.active_conn.load(Ordering::SeqCst) != conn_id {
            return;
        }

        self.remove_tab(&session, tab_id).await;
    }

    async fn remove_tab(&self, session: &Arc<Session>, tab_id: &str) {
        let removed = session.tabs.write().await.remove(tab_id);
        let Some(tab) = removed else { return };

        tab.dispose();
        self.tty_count.fetch_sub(1, Ordering::SeqCst);

        if session.tab_count().await == 0 {
            self.schedule_session_reap(&session.id);
        }
    }

    fn schedule_session_reap(&self, session_id: &str) {
        let sessions = Arc::clone(&self.sessions);
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(SESSION_GRACE).await;
            let mut sessions = sessions.write().await;
            let empty = match sessions.get(&session_id) {
                Some(session) => session.tabs.read().await.is_empty(),
                None => false,
            };
            if empty {
                sessions.remove(&session_id);
            }
        });
    }

    /// Graceful drain: notify every sink, dispose every PTY, clear all
    /// session maps.
    pub async fn drain(&self) {
        self.draining.store(true, Ordering::SeqCst);

        let sessions: Vec<Arc<Session>> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        for session in sessions {
            let tabs: Vec<Arc<Tab>> = session.tabs.write().await.drain().map(|(_, t)| t).collect();
            for tab in tabs {
                tab.send_frame(SseFrame::Close);
                tab.dispose();
            }
        }
        self.tty_count.store(0, Ordering::SeqCst);
    }
}

/// 128-bit random hex session id.
pub fn mint_session_id() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::sync::oneshot;

    struct MockTty {
        writes: Arc<Mutex<Vec<u8>>>,
        output_rx: Mutex<Option<mpsc::Receiver<Bytes>>>,
        closed_rx: Mutex<Option<oneshot::Receiver<()>>>,
        disposed: Arc<AtomicBool>,
    }

    struct MockTtyHandles {
        output_tx: mpsc::Sender<Bytes>,
        #[allow(dead_code)]
        closed_tx: oneshot::Sender<()>,
        writes: Arc<Mutex<Vec<u8>>>,
        disposed: Arc<AtomicBool>,
    }

    fn mock_tty() -> (MockTty, MockTtyHandles) {
        let (output_tx, output_rx) = mpsc::channel(64);
        let (closed_tx, closed_rx) = oneshot::channel();
        let writes = Arc::new(Mutex::new(Vec::new()));
        let disposed = Arc::new(AtomicBool::new(false));
        (
            MockTty {
                writes: writes.clone(),
                output_rx: Mutex::new(Some(output_rx)),
                closed_rx: Mutex::new(Some(closed_rx)),
                disposed: disposed.clone(),
            },
            MockTtyHandles {
                output_tx,
                closed_tx,
                writes,
                disposed,
            },
        )
    }

    #[async_trait::async_trait]
    impl Tty for MockTty {
        async fn write(&self, data: &[u8]) -> Result<()> {
            self.writes.lock().unwrap().extend_from_slice(data);
            Ok(())
        }

        fn resize(&self, _cols: u16, _rows: u16) -> Result<()> {
            Ok(())
        }

        fn take_output(&self) -> Option<mpsc::Receiver<Bytes>> {
            self.output_rx.lock().unwrap().take()
        }

        fn take_closed(&self) -> Option<oneshot::Receiver<()>> {
            self.closed_rx.lock().unwrap().take()
        }

        fn pid(&self) -> Option<u32> {
            None
        }

        fn dispose(&self) {
            self.disposed.store(true, Ordering::SeqCst);
        }
    }

    /// Factory that hands out mock terminals and keeps their handles.
    struct MockFactory {
        handles: Mutex<Vec<MockTtyHandles>>,
    }

    impl MockFactory {
        fn new() -> Self {
            Self {
                handles: Mutex::new(Vec::new()),
            }
        }

        fn handle(&self, index: usize) -> MockTtyHandles {
            self.handles.lock().unwrap().remove(index)
        }
    }

    impl TtyFactory for MockFactory {
        fn create(&self, _app: &str, _session_id: &str, _tab_id: &str) -> Result<Box<dyn Tty>> {
            let (tty, handles) = mock_tty();
            self.handles.lock().unwrap().push(handles);
            Ok(Box::new(tty))
        }
    }

    #[tokio::test]
    async fn test_session_cap_refuses_fourth_tab() {
        let app = AppSessions::new("webtty");
        let factory = MockFactory::new();
        let (session, minted) = app.session_for(None).await;
        assert!(minted.is_some());

        let _c1 = app.open_stream(&session, "t1", &factory).await.unwrap();
        let _c2 = app.open_stream(&session, "t2", &factory).await.unwrap();
        let _c3 = app.open_stream(&session, "t3", &factory).await.unwrap();

        let err = app.open_stream(&session, "t4", &factory).await.unwrap_err();
        assert!(matches!(err, RouterError::SessionCapacity));
        assert_eq!(app.tty_count(), 3);
    }

    #[tokio::test]
    async fn test_global_cap_across_sessions() {
        let app = AppSessions::new("webtty");
        let factory = MockFactory::new();

        let mut conns = Vec::new();
        for i in 0..MAX_GLOBAL_TTYS {
            let (session, _) = app.session_for(None).await;
            let conn = app
                .open_stream(&session, &format!("t{i}"), &factory)
                .await
                .unwrap();
            conns.push(conn);
        }

        let (session, _) = app.session_for(None).await;
        let err = app.open_stream(&session, "over", &factory).await.unwrap_err();
        assert!(matches!(err, RouterError::GlobalCapacity));
    }

    #[tokio::test]
    async fn test_reconnect_debounce() {
        let app = AppSessions::new("webtty");
        let factory = MockFactory::new();
        let (session, _) = app.session_for(None).await;

        let _conn = app.open_stream(&session, "t1", &factory).await.unwrap();
        let err = app.open_stream(&session, "t1", &factory).await.unwrap_err();
        assert!(matches!(err, RouterError::ReconnectDebounce));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_rebinds_sink_and_keeps_tty() {
        let app = AppSessions::new("webtty");
        let factory = MockFactory::new();
        let (session, _) = app.session_for(None).await;

        let first = app.open_stream(&session, "t1", &factory).await.unwrap();
        let handles = factory.handle(0);

        tokio::time::sleep(RECONNECT_DEBOUNCE + Duration::from_millis(100)).await;
        let mut second = app.open_stream(&session, "t1", &factory).await.unwrap();

        // only one PTY was ever created
        assert_eq!(app.tty_count(), 1);

        // output goes to the new sink
        handles.output_tx.send(Bytes::from_static(b"hello")).await.unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(5), second.rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, SseFrame::Data("\"hello\"".to_string()));

        // dropping the replaced connection must not dispose the PTY
        drop(first);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!handles.disposed.load(Ordering::SeqCst));
        assert!(session.tab("t1").await.is_some());
        drop(second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_disposes_tty() {
        let app = AppSessions::new("webtty");
        let factory = MockFactory::new();
        let (session, _) = app.session_for(None).await;

        let conn = app.open_stream(&session, "t1", &factory).await.unwrap();
        let handles = factory.handle(0);

        drop(conn);
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(handles.disposed.load(Ordering::SeqCst));
        assert!(session.tab("t1").await.is_none());
        assert_eq!(app.tty_count(), 0);
    }

    #[tokio::test]
    async fn test_input_bytes_reach_tty_in_order() {
        let app = AppSessions::new("webtty");
        let factory = MockFactory::new();
        let (session, _) = app.session_for(None).await;

        let _conn = app.open_stream(&session, "t1", &factory).await.unwrap();
        let handles = factory.handle(0);
        let tab = session.tab("t1").await.unwrap();

        for part in ["ls", " -la", "\n"] {
            tab.write(part.as_bytes()).await.unwrap();
        }
        assert_eq!(handles.writes.lock().unwrap().as_slice(), b"ls -la\n");
    }

    #[tokio::test]
    async fn test_drain_closes_sinks_and_disposes() {
        let app = AppSessions::new("webtty");
        let factory = MockFactory::new();
        let (session, _) = app.session_for(None).await;

        let mut conn = app.open_stream(&session, "t1", &factory).await.unwrap();
        let handles = factory.handle(0);

        app.drain().await;

        // every live sink got one close frame
        let frame = tokio::time::timeout(Duration::from_secs(1), conn.rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, SseFrame::Close);
        assert!(handles.disposed.load(Ordering::SeqCst));
        assert_eq!(app.tty_count(), 0);

        // no new connections while draining
        let (session, _) = app.session_for(None).await;
        assert!(app.open_stream(&session, "t2", &factory).await.is_err());
    }

    #[tokio::test]
    async fn test_webchat_echo_suppression_ring() {
        let (tty, _handles) = mock_tty();
        let tab = Tab::new("t1", Box::new(tty));

        tab.record_echo("{\"text\":\"hi\"}");
        assert!(tab.suppress_echo("{\"text\":\"hi\"}\n"));
        // consumed: the same echo does not match twice
        assert!(!tab.suppress_echo("{\"text\":\"hi\"}\n"));

        // ring is bounded
        for i in 0..(ECHO_RING_CAPACITY + 5) {
            tab.record_echo(&format!("msg-{i}"));
        }
        assert!(!tab.suppress_echo("msg-0"));
        assert!(tab.suppress_echo(&format!("msg-{}", ECHO_RING_CAPACITY + 4)));
    }

    #[test]
    fn test_session_ids_are_128_bit_hex() {
        let id = mint_session_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(mint_session_id(), mint_session_id());
    }
}
