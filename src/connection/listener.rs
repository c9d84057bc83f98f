//! Inbound connection listener.
//!
//! Accepts connections for asynchronous responses and unsolicited messages,
//! and owns the de-duplication table for reliable interactions: a reliable
//! message id stays on the table for its interaction's persistDuration, and
//! a repeat arrival within that window is acknowledged again but not handed
//! to the application a second time.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Duration, Utc};
use rustc_hash::FxHashMap;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::connection::handler;
use crate::connection::security::SpineSecurityContext;
use crate::connection::session::SessionManager;

/// Fallback de-duplication window for interactions with no configured
/// persistDuration.
const DEFAULT_DEDUPLICATION_WINDOW_SECS: i64 = 3600;

/// Outcome of recording a received reliable message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveStatus {
    New,
    Duplicate,
}

pub struct Listener {
    manager: Weak<SessionManager>,
    security: Arc<SpineSecurityContext>,
    /// Receipt expiry times against received message ids.
    received_ids: Mutex<FxHashMap<String, DateTime<Utc>>>,
    persist_durations: Arc<FxHashMap<String, i64>>,
    listening: AtomicBool,
    accept_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
    /// Counts inbound messages when alternate synchronous responses are
    /// being dropped for timeout testing.
    sync_drop_counter: AtomicU64,
}

impl Listener {
    pub fn new(
        manager: Weak<SessionManager>,
        security: Arc<SpineSecurityContext>,
        persist_durations: Arc<FxHashMap<String, i64>>,
    ) -> Listener {
        Listener {
            manager,
            security,
            received_ids: Mutex::new(FxHashMap::default()),
            persist_durations,
            listening: AtomicBool::new(false),
            accept_task: tokio::sync::Mutex::new(None),
            local_addr: Mutex::new(None),
            sync_drop_counter: AtomicU64::new(0),
        }
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    /// The bound address, once listening. Mostly useful when binding to
    /// port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.local_addr)
    }

    /// Bind and start accepting. The socket is bound and the accept task
    /// spawned by the time this returns; concurrent callers serialise on the
    /// task slot, so none of them can dispatch traffic at an unbound socket.
    pub async fn start_listening(self: &Arc<Self>, addr: SocketAddr) -> anyhow::Result<()> {
        let mut task = self.accept_task.lock().await;
        if task.is_some() {
            return Ok(());
        }
        let tcp = TcpListener::bind(addr).await?;
        let local = tcp.local_addr()?;
        *lock(&self.local_addr) = Some(local);
        self.listening.store(true, Ordering::SeqCst);
        info!("listening for inbound connections on {}", local);

        let this = self.clone();
        *task = Some(tokio::spawn(async move {
            this.accept_loop(tcp).await;
        }));
        Ok(())
    }

    /// Stop accepting and drop the server socket. In-progress connection
    /// handlers run to completion.
    pub async fn stop_listening(&self) {
        if !self.listening.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(task) = self.accept_task.lock().await.take() {
            task.abort();
        }
        info!("listener stopped");
    }

    async fn accept_loop(self: Arc<Self>, tcp: TcpListener) {
        loop {
            let (stream, peer) = match tcp.accept().await {
                Ok(a) => a,
                Err(e) => {
                    if !self.is_listening() {
                        return;
                    }
                    warn!("accept failed: {}", e);
                    continue;
                }
            };
            debug!("inbound connection from {}", peer);
            let Some(manager) = self.manager.upgrade() else {
                return;
            };
            let listener = self.clone();
            tokio::spawn(async move {
                let conn = match listener.security.accept(stream).await {
                    Ok(c) => c,
                    Err(e) => {
                        warn!("TLS accept from {} failed: {}", peer, e);
                        return;
                    }
                };
                if let Err(e) = handler::handle_connection(manager, listener, conn, peer).await {
                    error!("error handling connection from {}: {:#}", peer, e);
                }
            });
        }
    }

    /// Record the receipt of a reliable message id. The id stays recorded
    /// for the interaction's persistDuration from now.
    pub fn receive_id(&self, message_id: &str, svc_ia: &str) -> ReceiveStatus {
        let mut ids = lock(&self.received_ids);
        if ids.contains_key(message_id) {
            return ReceiveStatus::Duplicate;
        }
        let window = self
            .persist_durations
            .get(svc_ia)
            .copied()
            .unwrap_or(DEFAULT_DEDUPLICATION_WINDOW_SECS);
        ids.insert(
            message_id.to_string(),
            Utc::now() + Duration::seconds(window),
        );
        ReceiveStatus::New
    }

    /// Called from the retry sweep: forget ids that have outlived their
    /// persistDuration.
    pub fn clean_deduplication_list(&self) {
        let now = Utc::now();
        lock(&self.received_ids).retain(|_, expiry| *expiry > now);
    }

    pub(crate) fn next_sync_drop_count(&self) -> u64 {
        self.sync_drop_counter.fetch_add(1, Ordering::SeqCst)
    }

    #[cfg(test)]
    pub(crate) fn backdate_received_id(&self, message_id: &str, by: Duration) {
        if let Some(expiry) = lock(&self.received_ids).get_mut(message_id) {
            *expiry = *expiry - by;
        }
    }

    #[cfg(test)]
    pub(crate) fn deduplication_list_len(&self) -> usize {
        lock(&self.received_ids).len()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}


#[cfg(test)]
mod test {
    use super::*;

    fn listener() -> Listener {
        let mut durations = FxHashMap::default();
        durations.insert("svc:ia".to_string(), 120_i64);
        Listener::new(
            Weak::new(),
            Arc::new(SpineSecurityContext::new(None).unwrap()),
            Arc::new(durations),
        )
    }

    #[test]
    fn test_receive_id_flags_duplicates() {
        let l = listener();
        assert_eq!(l.receive_id("A", "svc:ia"), ReceiveStatus::New);
        assert_eq!(l.receive_id("A", "svc:ia"), ReceiveStatus::Duplicate);
        assert_eq!(l.receive_id("B", "unknown:ia"), ReceiveStatus::New);
    }

    #[tokio::test]
    async fn test_start_listening_returns_with_socket_bound() {
        let l = Arc::new(listener());
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let (a, b) = tokio::join!(l.start_listening(addr), l.start_listening(addr));
        a.unwrap();
        b.unwrap();
        assert!(l.is_listening());
        // the bound address is connectable as soon as either call returns
        let bound = l.local_addr().unwrap();
        tokio::net::TcpStream::connect(bound).await.unwrap();
        l.stop_listening().await;
        assert!(!l.is_listening());
    }

    #[test]
    fn test_clean_deduplication_list_drops_expired_ids_only() {
        let l = listener();
        l.receive_id("old", "svc:ia");
        l.receive_id("fresh", "svc:ia");
        l.backdate_received_id("old", Duration::seconds(121));

        l.clean_deduplication_list();
        assert_eq!(l.deduplication_list_len(), 1);
        // the expired id can now be received again
        assert_eq!(l.receive_id("old", "svc:ia"), ReceiveStatus::New);
        assert_eq!(l.receive_id("fresh", "svc:ia"), ReceiveStatus::Duplicate);
    }
}
