//! Session coordination: in-flight tracking, retries, expiry, persistence.
//!
//! One [`SessionManager`] per process coordinates everything: it hands
//! outbound messages to transmitter tasks, tracks reliable messages until
//! Spine acknowledges them, sweeps the tracked set for retries and expiry,
//! persists reliable messages across restarts, and owns the listener for
//! inbound traffic. Components hold `Weak` references back to it so that
//! dropping the manager winds the whole session down.
//!
//! Construction never fails. Fatal configuration problems are captured as a
//! [`BootError`] and returned from the first attempt to use the session, so
//! a misconfigured service can still come up far enough to report why.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use chrono::{DateTime, Duration, Utc};
use rustc_hash::FxHashMap;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SpineConfig;
use crate::connection::listener::Listener;
use crate::connection::resolver::{
    parse_persist_durations, EndpointResolver, TransmissionDetails, DEFAULT_PERSIST_DURATIONS,
};
use crate::connection::security::SpineSecurityContext;
use crate::connection::transmitter::Transmitter;
use crate::error::BootError;
use crate::messaging::ebxml::EbXmlMessage;
use crate::messaging::handlers::{
    EbXmlHandler, ExpiredMessageHandler, FileSaveEbXmlHandler, FileSaveSynchronousResponseHandler,
    SessionCaptor, SynchronousResponseHandler,
};
use crate::messaging::sendable::{SendState, Sendable, SendableKind};

/// persistDuration applied to interactions absent from the configured table.
const DEFAULT_PERSIST_SECS: i64 = 3600;

pub struct SessionManager {
    config: SpineConfig,
    boot_error: Option<BootError>,
    security: Option<Arc<SpineSecurityContext>>,
    resolver: Arc<dyn EndpointResolver>,
    /// Reliable messages awaiting acknowledgment, by ebXML message id.
    requests: tokio::sync::Mutex<FxHashMap<String, Arc<dyn Sendable>>>,
    persist_durations: Arc<FxHashMap<String, i64>>,
    listener: tokio::sync::Mutex<Option<Arc<Listener>>>,
    retry_task: Mutex<Option<JoinHandle<()>>>,
    ebxml_handlers: tokio::sync::RwLock<FxHashMap<String, Arc<dyn EbXmlHandler>>>,
    sync_handlers: tokio::sync::RwLock<FxHashMap<String, Arc<dyn SynchronousResponseHandler>>>,
    expiry_handlers: tokio::sync::RwLock<FxHashMap<String, Arc<dyn ExpiredMessageHandler>>>,
    default_ebxml_handler: Arc<dyn EbXmlHandler>,
    default_sync_handler: Arc<dyn SynchronousResponseHandler>,
    session_captor: Mutex<Option<Arc<dyn SessionCaptor>>>,
}

impl SessionManager {
    pub fn new(config: SpineConfig, resolver: Arc<dyn EndpointResolver>) -> Arc<SessionManager> {
        let mut boot_error = None;
        if config.my_asid.is_empty() {
            boot_error = Some(BootError::MissingConfiguration("my_asid"));
        } else if config.my_ip.is_empty() {
            boot_error = Some(BootError::MissingConfiguration("my_ip"));
        }

        for dir in [
            &config.message_directory,
            &config.expired_directory,
            &config.received_directory,
        ] {
            if let Err(e) = std::fs::create_dir_all(dir) {
                warn!("cannot create {}: {}", dir.display(), e);
            }
        }

        let security = match SpineSecurityContext::new(config.tls.as_ref()) {
            Ok(s) => Some(Arc::new(s)),
            Err(e) => {
                boot_error.get_or_insert(BootError::Security(format!("{:#}", e)));
                None
            }
        };

        let persist_durations = match &config.persist_durations_file {
            Some(path) => std::fs::read_to_string(path)
                .map_err(anyhow::Error::from)
                .and_then(|content| parse_persist_durations(&content)),
            None => parse_persist_durations(DEFAULT_PERSIST_DURATIONS),
        };
        let persist_durations = match persist_durations {
            Ok(d) => d,
            Err(e) => {
                boot_error.get_or_insert(BootError::PersistDurations(format!("{:#}", e)));
                parse_persist_durations(DEFAULT_PERSIST_DURATIONS).unwrap_or_default()
            }
        };

        if let Some(ref e) = boot_error {
            warn!("session unusable: {}", e);
        }
        let default_ebxml_handler: Arc<dyn EbXmlHandler> =
            Arc::new(FileSaveEbXmlHandler::new(config.received_directory.clone()));
        let default_sync_handler: Arc<dyn SynchronousResponseHandler> = Arc::new(
            FileSaveSynchronousResponseHandler::new(config.received_directory.clone()),
        );
        Arc::new(SessionManager {
            config,
            boot_error,
            security,
            resolver,
            requests: tokio::sync::Mutex::new(FxHashMap::default()),
            persist_durations: Arc::new(persist_durations),
            listener: tokio::sync::Mutex::new(None),
            retry_task: Mutex::new(None),
            ebxml_handlers: tokio::sync::RwLock::new(FxHashMap::default()),
            sync_handlers: tokio::sync::RwLock::new(FxHashMap::default()),
            expiry_handlers: tokio::sync::RwLock::new(FxHashMap::default()),
            default_ebxml_handler,
            default_sync_handler,
            session_captor: Mutex::new(None),
        })
    }

    pub fn boot_error(&self) -> Option<&BootError> {
        self.boot_error.as_ref()
    }

    fn check_boot(&self) -> anyhow::Result<()> {
        match self.boot_error {
            Some(ref e) => Err(e.clone().into()),
            None => Ok(()),
        }
    }

    pub fn config(&self) -> &SpineConfig {
        &self.config
    }

    pub(crate) fn security(&self) -> anyhow::Result<Arc<SpineSecurityContext>> {
        match self.security {
            Some(ref s) => Ok(s.clone()),
            None => {
                self.check_boot()?;
                Err(anyhow::anyhow!("no security context"))
            }
        }
    }

    /// Matching transmission details for a service-qualified interaction,
    /// straight from the endpoint resolver.
    pub fn get_transmission_details(
        &self,
        svc_ia: &str,
        org_code: &str,
        asid: Option<&str>,
        party_key: Option<&str>,
    ) -> Vec<TransmissionDetails> {
        self.resolver.resolve(svc_ia, org_code, asid, party_key)
    }

    pub fn resolve_url(&self, svc_ia: &str) -> Option<String> {
        self.resolver.resolve_url(svc_ia)
    }

    pub fn persist_duration(&self, svc_ia: &str) -> Option<i64> {
        self.persist_durations.get(svc_ia).copied()
    }

    /// Hand a message to a transmitter task.
    ///
    /// An asynchronous interaction implies a response or acknowledgment on a
    /// connection of Spine's making, so the listener is started before the
    /// request leaves. A reliable message (duplicate elimination "always")
    /// is additionally tracked until [`Self::register_ack`] releases it.
    pub async fn send(
        self: &Arc<Self>,
        sendable: Arc<dyn Sendable>,
        details: &TransmissionDetails,
    ) -> anyhow::Result<()> {
        self.check_boot()?;
        if !details.is_synchronous() {
            self.listen().await?;
            if sendable.kind() != SendableKind::Acknowledgment
                && details.duplicate_elimination == "always"
            {
                if let Some(id) = sendable.message_id() {
                    self.ensure_retry_timer();
                    self.requests
                        .lock()
                        .await
                        .entry(id)
                        .or_insert_with(|| sendable.clone());
                }
            }
        }
        Transmitter::spawn(self.clone(), sendable);
        Ok(())
    }

    /// An acknowledgment arrived (or was found in a synchronous response)
    /// for the given message id. Releases tracking and the on-disk copy.
    pub async fn register_ack(&self, message_id: &str) {
        match self.requests.lock().await.remove(message_id) {
            Some(_) => {
                info!("acknowledgment registered for {}", message_id);
                self.depersist(message_id).await;
            }
            None => warn!("acknowledgment for unknown message {}", message_id),
        }
    }

    /// Drop tracking for a message without treating it as acknowledged.
    pub async fn remove_request(&self, message_id: &str) {
        if self.requests.lock().await.remove(message_id).is_some() {
            debug!("stopped tracking {}", message_id);
            self.depersist(message_id).await;
        }
    }

    async fn depersist(&self, message_id: &str) {
        let path = self.config.message_directory.join(message_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("cannot remove {}: {}", path.display(), e),
        }
    }

    /// Write a reliable message to the message directory ahead of its first
    /// transmission attempt, so it survives a process restart. Does nothing
    /// for unreliable messages or once already persisted.
    pub(crate) async fn persist_message(&self, sendable: &dyn Sendable) -> anyhow::Result<()> {
        if !sendable.state().needs_persist() {
            return Ok(());
        }
        let Some(id) = sendable.message_id() else {
            return Ok(());
        };
        let mut buf = BytesMut::new();
        sendable.serialize(&mut buf)?;
        let path = self.config.message_directory.join(&id);
        tokio::fs::write(&path, &buf).await?;
        sendable.state().mark_persisted();
        debug!("persisted {} to {}", id, path.display());
        Ok(())
    }

    /// A reliable message has run out of retries or persist duration: save
    /// it to the expired directory and notify any registered expiry handler.
    pub(crate) async fn expire_message(&self, sendable: &dyn Sendable) {
        let Some(id) = sendable.message_id() else {
            return;
        };
        let mut buf = BytesMut::new();
        match sendable.serialize(&mut buf) {
            Ok(()) => {
                let path = self.config.expired_directory.join(format!("{}.msg", id));
                if let Err(e) = tokio::fs::write(&path, &buf).await {
                    warn!("cannot write expired message {}: {}", path.display(), e);
                }
            }
            Err(e) => warn!("cannot serialise expired message {}: {:#}", id, e),
        }
        if let Some(handler) = self.expiry_handler(&sendable.soap_action()).await {
            if let Err(e) = handler.handle_expiry(sendable).await {
                warn!("expiry handler failed for {}: {:#}", id, e);
            }
        }
    }

    /// Reload reliable messages persisted by an earlier process lifetime,
    /// expiring any whose persist duration has already passed. Returns how
    /// many went back under tracking.
    pub async fn load_persisted_messages(self: &Arc<Self>) -> anyhow::Result<usize> {
        self.check_boot()?;
        let mut dir = tokio::fs::read_dir(&self.config.message_directory).await?;
        let now = Utc::now();
        let mut loaded = 0;
        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let raw = tokio::fs::read(entry.path()).await?;
            let message = match EbXmlMessage::from_bytes(&raw) {
                Ok(m) => m,
                Err(e) => {
                    warn!("unreadable persisted message {}: {:#}", entry.path().display(), e);
                    continue;
                }
            };
            let id = message.header().message_id().to_string();
            // the original contract properties are not stored with the
            // message, so it is retried on every sweep until the table's
            // persist duration (counted from its own timestamp) runs out
            let persist = self
                .persist_duration(&message.header().svc_ia())
                .unwrap_or(DEFAULT_PERSIST_SECS);
            message
                .state()
                .set_contract_properties(0, Duration::zero(), Duration::seconds(persist));
            message.state().mark_persisted();
            if message.state().started() + message.state().persist_duration() <= now {
                info!("persisted message {} already expired", id);
                self.depersist(&id).await;
                self.expire_message(&message).await;
                continue;
            }
            debug!("reloaded persisted message {}", id);
            self.requests.lock().await.insert(id, Arc::new(message));
            loaded += 1;
        }
        if loaded > 0 {
            self.ensure_retry_timer();
        }
        info!("reloaded {} persisted messages", loaded);
        Ok(loaded)
    }

    /// One sweep over the tracked set: expire what has outlived its persist
    /// duration, resend what is due a retry, and age the listener's
    /// de-duplication table.
    pub async fn process_retries(self: &Arc<Self>) {
        let now = Utc::now();
        let mut expired: Vec<Arc<dyn Sendable>> = Vec::new();
        let mut retry: Vec<Arc<dyn Sendable>> = Vec::new();
        {
            let requests = self.requests.lock().await;
            for sendable in requests.values() {
                match classify(sendable.state(), now) {
                    SweepAction::Expire => expired.push(sendable.clone()),
                    SweepAction::Retry => retry.push(sendable.clone()),
                    SweepAction::Keep => {}
                }
            }
        }
        for sendable in retry {
            debug!("retrying {:?}", sendable.message_id());
            Transmitter::spawn(self.clone(), sendable);
        }
        for sendable in expired {
            if let Some(id) = sendable.message_id() {
                warn!(
                    "message {} expired unacknowledged after {} tries",
                    id,
                    sendable.state().tries()
                );
                self.remove_request(&id).await;
            }
            self.expire_message(sendable.as_ref()).await;
        }
        let listener = self.listener.lock().await.clone();
        if let Some(listener) = listener {
            listener.clean_deduplication_list();
        }
    }

    fn ensure_retry_timer(self: &Arc<Self>) {
        let mut guard = lock(&self.retry_task);
        if guard.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        let interval = self.config.retry_check_interval;
        *guard = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = weak.upgrade() else {
                    return;
                };
                manager.process_retries().await;
            }
        }));
    }

    pub fn stop_retry_processor(&self) {
        if let Some(task) = lock(&self.retry_task).take() {
            task.abort();
        }
    }

    /// Start the inbound listener if it is not already running. The guard on
    /// the listener slot stays held across startup, so a concurrent caller
    /// only returns once the socket is bound.
    pub async fn listen(self: &Arc<Self>) -> anyhow::Result<()> {
        self.check_boot()?;
        let mut guard = self.listener.lock().await;
        if guard.is_none() {
            *guard = Some(Arc::new(Listener::new(
                Arc::downgrade(self),
                self.security()?,
                self.persist_durations.clone(),
            )));
        }
        match guard.as_ref() {
            Some(listener) => listener.start_listening(self.config.listen_address).await,
            None => Ok(()),
        }
    }

    pub async fn stop_listening(&self) {
        if let Some(listener) = self.listener.lock().await.take() {
            listener.stop_listening().await;
        }
    }

    /// The listener's bound address, once listening.
    pub async fn listener_address(&self) -> Option<SocketAddr> {
        self.listener.lock().await.as_ref().and_then(|l| l.local_addr())
    }

    pub async fn add_handler(&self, soap_action: &str, handler: Arc<dyn EbXmlHandler>) {
        self.ebxml_handlers
            .write()
            .await
            .insert(soap_action.to_string(), handler);
    }

    pub(crate) async fn ebxml_handler(&self, soap_action: &str) -> Arc<dyn EbXmlHandler> {
        self.ebxml_handlers
            .read()
            .await
            .get(soap_action)
            .cloned()
            .unwrap_or_else(|| self.default_ebxml_handler.clone())
    }

    pub async fn add_synchronous_response_handler(
        &self,
        soap_action: &str,
        handler: Arc<dyn SynchronousResponseHandler>,
    ) {
        self.sync_handlers
            .write()
            .await
            .insert(soap_action.to_string(), handler);
    }

    pub(crate) async fn synchronous_response_handler(
        &self,
        soap_action: &str,
    ) -> Arc<dyn SynchronousResponseHandler> {
        self.sync_handlers
            .read()
            .await
            .get(soap_action)
            .cloned()
            .unwrap_or_else(|| self.default_sync_handler.clone())
    }

    pub async fn add_expiry_handler(
        &self,
        soap_action: &str,
        handler: Arc<dyn ExpiredMessageHandler>,
    ) {
        self.expiry_handlers
            .write()
            .await
            .insert(soap_action.to_string(), handler);
    }

    async fn expiry_handler(&self, soap_action: &str) -> Option<Arc<dyn ExpiredMessageHandler>> {
        self.expiry_handlers.read().await.get(soap_action).cloned()
    }

    #[cfg(test)]
    pub(crate) async fn is_tracked(&self, message_id: &str) -> bool {
        self.requests.lock().await.contains_key(message_id)
    }

    pub fn set_session_captor(&self, captor: Arc<dyn SessionCaptor>) {
        *lock(&self.session_captor) = Some(captor);
    }

    pub(crate) fn session_captor(&self) -> Option<Arc<dyn SessionCaptor>> {
        lock(&self.session_captor).clone()
    }
}

enum SweepAction {
    Keep,
    Retry,
    Expire,
}

/// The retry sweep's verdict on one tracked message.
fn classify(state: &SendState, now: DateTime<Utc>) -> SweepAction {
    if state.started() + state.persist_duration() <= now {
        return SweepAction::Expire;
    }
    match state.last_try() {
        Some(last) if last + state.retry_interval() <= now => SweepAction::Retry,
        _ => SweepAction::Keep,
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(p) => p.into_inner(),
    }
}
