use std::sync::Mutex;

use bytes::BytesMut;
use chrono::{DateTime, Duration, Utc};

use crate::messaging::soap::SpineSoapRequest;

/// The wire-level flavours of outbound traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendableKind {
    /// Reliable (or at least ebXML-wrapped) asynchronous message.
    EbXml,
    /// Synchronous SOAP request, answered on the same connection.
    SoapRequest,
    /// ebXML acknowledgment or error, sent once and forgotten.
    Acknowledgment,
}

/// Something that can be sent over a Spine connection.
///
/// This leans towards ebXML in that it carries the messaging contract
/// properties (retries, retryInterval, persistDuration), which are ebXML
/// concepts; synchronous requests and acknowledgments just leave them unset.
///
/// Implementations are shared between the session's in-flight table and the
/// transmitter tasks as `Arc<dyn Sendable>`, so all mutable tracking lives
/// behind the interior lock in [`SendState`].
pub trait Sendable: Send + Sync + 'static {
    fn kind(&self) -> SendableKind;

    /// The ebXML message id, `None` for synchronous requests.
    fn message_id(&self) -> Option<String>;

    fn soap_action(&self) -> String;

    fn state(&self) -> &SendState;

    /// Target URL as resolved from the endpoint contract, when known.
    fn resolved_url(&self) -> Option<String>;

    /// Host recorded when the message was reloaded from disk, used when no
    /// URL was resolved in this process lifetime.
    fn recorded_host(&self) -> Option<String> {
        None
    }

    /// Render the full on-the-wire request, HTTP header included.
    fn serialize(&self, buf: &mut BytesMut) -> anyhow::Result<()>;

    fn as_soap_request(&self) -> Option<&SpineSoapRequest> {
        None
    }
}

/// Mutable delivery tracking for a [`Sendable`].
///
/// Timestamps handed out of here are owned values, so arithmetic done by the
/// retry processor can never advance the recorded times themselves.
pub struct SendState {
    inner: Mutex<Tracking>,
}

struct Tracking {
    retry_count: u32,
    retry_interval: Duration,
    persist_duration: Duration,
    started: DateTime<Utc>,
    last_try: Option<DateTime<Utc>>,
    tries: u32,
    synchronous_response: Option<String>,
    on_the_wire_request: Option<Vec<u8>>,
    persisted: bool,
}

impl Default for SendState {
    fn default() -> Self {
        SendState::new(0, Duration::zero(), Duration::zero())
    }
}

impl SendState {
    pub fn new(retry_count: u32, retry_interval: Duration, persist_duration: Duration) -> SendState {
        SendState {
            inner: Mutex::new(Tracking {
                retry_count,
                retry_interval,
                persist_duration,
                started: Utc::now(),
                last_try: None,
                tries: 0,
                synchronous_response: None,
                on_the_wire_request: None,
                persisted: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tracking> {
        // every update here is a plain field write, so tracking data is
        // still coherent after a poisoning panic
        match self.inner.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Gate an actual transmission attempt.
    ///
    /// Unreliable messages are always allowed through since nothing tracks
    /// them afterwards. Reliable messages are allowed `retry_count` attempts
    /// in total; the attempt after that returns false and the caller expires
    /// the message. The last-try time only advances when an attempt is
    /// permitted. Persist-duration expiry is swept separately by the retry
    /// timer and is deliberately not checked here.
    pub fn record_try(&self) -> bool {
        let mut t = self.lock();
        if t.retry_count < 1 {
            return true;
        }
        t.tries += 1;
        if t.tries > t.retry_count {
            return false;
        }
        t.last_try = Some(Utc::now());
        true
    }

    /// Whether this message participates in reliable-messaging retry at all.
    pub fn is_reliable(&self) -> bool {
        self.lock().retry_count >= 1
    }

    pub fn started(&self) -> DateTime<Utc> {
        self.lock().started
    }

    pub fn last_try(&self) -> Option<DateTime<Utc>> {
        self.lock().last_try
    }

    pub fn tries(&self) -> u32 {
        self.lock().tries
    }

    pub fn retry_interval(&self) -> Duration {
        self.lock().retry_interval
    }

    pub fn persist_duration(&self) -> Duration {
        self.lock().persist_duration
    }

    pub fn set_contract_properties(
        &self,
        retry_count: u32,
        retry_interval: Duration,
        persist_duration: Duration,
    ) {
        let mut t = self.lock();
        t.retry_count = retry_count;
        t.retry_interval = retry_interval;
        t.persist_duration = persist_duration;
    }

    /// Reset tracking from a message reloaded off disk. The reloaded message
    /// counts as having been tried once, when it was first sent.
    pub(crate) fn restore(
        &self,
        started: DateTime<Utc>,
        tries: u32,
        last_try: Option<DateTime<Utc>>,
    ) {
        let mut t = self.lock();
        t.started = started;
        t.tries = tries;
        t.last_try = last_try;
    }

    pub fn synchronous_response(&self) -> Option<String> {
        self.lock().synchronous_response.clone()
    }

    pub fn set_synchronous_response(&self, response: String) {
        self.lock().synchronous_response = Some(response);
    }

    pub fn on_the_wire_request(&self) -> Option<Vec<u8>> {
        self.lock().on_the_wire_request.clone()
    }

    pub fn set_on_the_wire_request(&self, request: Vec<u8>) {
        self.lock().on_the_wire_request = Some(request);
    }

    /// True exactly once, the first time a reliable message needs writing to
    /// the message directory.
    pub fn needs_persist(&self) -> bool {
        let t = self.lock();
        t.retry_count >= 1 && !t.persisted
    }

    pub fn mark_persisted(&self) {
        self.lock().persisted = true;
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 10)]
    #[case(3, 3)]
    #[case(1, 1)]
    fn test_record_try_ceiling(#[case] retry_count: u32, #[case] expected_permitted: u32) {
        let state = SendState::new(
            retry_count,
            Duration::seconds(10),
            Duration::seconds(3600),
        );
        let mut permitted = 0;
        for _ in 0..10 {
            if state.record_try() {
                permitted += 1;
            }
        }
        assert_eq!(permitted, expected_permitted);
    }

    #[test]
    fn test_last_try_only_advances_on_permitted_attempt() {
        let state = SendState::new(1, Duration::seconds(10), Duration::seconds(3600));
        assert!(state.last_try().is_none());
        assert!(state.record_try());
        let first = state.last_try().unwrap();
        assert!(!state.record_try());
        assert_eq!(state.last_try().unwrap(), first);
    }

    #[test]
    fn test_unreliable_never_records_last_try() {
        let state = SendState::new(0, Duration::zero(), Duration::zero());
        assert!(state.record_try());
        assert!(state.record_try());
        assert!(state.last_try().is_none());
        assert_eq!(state.tries(), 0);
        assert!(!state.is_reliable());
    }

    #[test]
    fn test_restore_counts_original_send_as_a_try() {
        let state = SendState::new(3, Duration::seconds(10), Duration::seconds(3600));
        let started = Utc::now() - Duration::seconds(120);
        state.restore(started, 1, Some(started));
        assert_eq!(state.tries(), 1);
        assert_eq!(state.started(), started);
        // two more attempts remain of the contract's three
        assert!(state.record_try());
        assert!(state.record_try());
        assert!(!state.record_try());
    }

    #[test]
    fn test_needs_persist_once() {
        let state = SendState::new(2, Duration::seconds(10), Duration::seconds(3600));
        assert!(state.needs_persist());
        state.mark_persisted();
        assert!(!state.needs_persist());

        let unreliable = SendState::default();
        assert!(!unreliable.needs_persist());
    }
}
