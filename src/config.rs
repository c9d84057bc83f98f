use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Static configuration for a Spine messaging session.
///
/// All of this is resolved before the [`crate::SessionManager`] is created.
/// There is deliberately no file format or environment parsing here: callers
/// assemble the struct from whatever configuration mechanism they use.
#[derive(Debug, Clone)]
pub struct SpineConfig {
    /// Directory for persisted in-flight reliable messages.
    pub message_directory: PathBuf,
    /// Directory to which messages are written when their retries are
    /// exhausted or their persist duration passes without an acknowledgment.
    pub expired_directory: PathBuf,
    /// Directory used by the file-saving inbound handlers.
    pub received_directory: PathBuf,

    /// Our own IP address as quoted in outbound SOAP headers.
    pub my_ip: String,
    /// Our accredited system id.
    pub my_asid: String,
    /// Our party key. Required for sending ebXML messages, not for
    /// synchronous-only use.
    pub my_party_key: Option<String>,

    pub listen_address: SocketAddr,
    /// How often the retry processor wakes up.
    pub retry_check_interval: Duration,
    /// Socket read timeout applied to inbound requests and to responses on
    /// outbound connections.
    pub read_timeout: Duration,

    /// Optional tab-separated persist durations file. When absent, a built-in
    /// table covering the common Spine interactions is used.
    pub persist_durations_file: Option<PathBuf>,

    /// TLS material. `None` means cleartext sockets, which is only useful
    /// against a local test Spine.
    pub tls: Option<TlsConfig>,

    pub test_controls: TestControls,
}

impl Default for SpineConfig {
    fn default() -> Self {
        SpineConfig {
            message_directory: PathBuf::from("messages"),
            expired_directory: PathBuf::from("expired"),
            received_directory: PathBuf::from("received"),
            my_ip: "127.0.0.1".to_string(),
            my_asid: String::new(),
            my_party_key: None,
            listen_address: SocketAddr::from(([0, 0, 0, 0], 4430)),
            retry_check_interval: Duration::from_secs(30),
            read_timeout: Duration::from_secs(30),
            persist_durations_file: None,
            tls: None,
            test_controls: TestControls::default(),
        }
    }
}

/// PEM files for mutual TLS with Spine.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// Root and intermediate certificates trusted for both peer verification
    /// and client certificate checks on the listener.
    pub ca_certificates: PathBuf,
    /// Our certificate chain, leaf first.
    pub certificate_chain: PathBuf,
    /// PKCS#8 or RSA private key for the leaf certificate.
    pub private_key: PathBuf,
}

/// Runtime switches for exercising failure paths against a test harness.
///
/// These replace build-time flags in earlier MHS implementations. They are
/// all off by default and have no effect on the sending side.
#[derive(Debug, Clone, Default)]
pub struct TestControls {
    /// Respond to every inbound request with a SOAP fault.
    pub force_soap_fault: bool,
    /// Treat every inbound ebXML message as unparseable and negatively
    /// acknowledge it.
    pub force_negative_ack: bool,
    /// Drop every second synchronous response instead of writing it, to let
    /// clients exercise their timeout handling.
    pub drop_alternate_sync_responses: bool,
    /// Delay asynchronous acknowledgments by this long after the inbound
    /// connection has been answered.
    pub async_ack_delay: Option<Duration>,
    /// Log the raw bytes of every received request.
    pub dump_received_messages: bool,
}
