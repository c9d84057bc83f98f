//! Messaging substrate for the NHS Spine message handling service.
//!
//! This crate implements the transport-level contract for exchanging
//! ebXML-wrapped HL7v3 messages with Spine over mutually-authenticated TLS:
//!
//! * sending of asynchronous "reliable" ebXML messages, synchronous SOAP
//!   requests and ebXML acknowledgments / errors
//! * inbound de-duplication for reliable interactions, scoped by each
//!   interaction's persistDuration
//! * retry and expiry of unacknowledged reliable messages on a periodic
//!   timer, honouring the contract properties (retries, retryInterval,
//!   persistDuration) resolved for the recipient endpoint
//! * flat-file persistence of in-flight reliable messages so they survive a
//!   process restart
//!
//! The coordinator is [`connection::session::SessionManager`]: an explicitly
//! constructed service object, typically one per process. It owns the
//! in-flight request table and the retry timer; everything else (listener,
//! transmitters, per-connection handlers) is reached from it. There is no
//! global state, and behaviour that is only wanted in test harnesses (fault
//! injection, cleartext sockets) is plain runtime configuration in
//! [`config::SpineConfig`].
//!
//! Directory lookup (SDS) and business-level message construction are
//! outside this crate; they are reached through the traits in
//! [`connection::resolver`] and [`messaging::handlers`].

pub mod config;
pub mod connection;
pub mod error;
pub mod messaging;
pub mod util;

pub use config::SpineConfig;
pub use connection::session::SessionManager;


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
