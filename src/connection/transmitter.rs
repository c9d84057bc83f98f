//! One-shot message transmission.
//!
//! A transmitter task opens a connection to Spine, writes the serialised
//! message and waits for the HTTP response. For a synchronous request the
//! registered response handler is called with the response body; the
//! transmitter itself makes no judgement about HL7-level success or failure.
//! For a reliable ebXML message it handles the synchronous acknowledgment or
//! rejection that terminates retries. Transport errors leave a reliable
//! message tracked, to be picked up by the next retry sweep.

use std::sync::Arc;

use anyhow::anyhow;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::connection::session::SessionManager;
use crate::messaging::sendable::Sendable;
use crate::util::http::{parse_url, HttpHeaders};

const DEFAULT_SPINE_PORT: u16 = 443;

pub struct Transmitter {
    manager: Arc<SessionManager>,
    sendable: Arc<dyn Sendable>,
}

impl Transmitter {
    pub fn spawn(manager: Arc<SessionManager>, sendable: Arc<dyn Sendable>) -> JoinHandle<()> {
        let t = Transmitter { manager, sendable };
        tokio::spawn(async move {
            t.run().await;
        })
    }

    async fn run(self) {
        if !self.sendable.state().record_try() {
            // retries exhausted without an acknowledgment
            if let Some(id) = self.sendable.message_id() {
                self.manager.remove_request(&id).await;
                self.manager.expire_message(self.sendable.as_ref()).await;
            }
            return;
        }
        if let Err(e) = self.transmit().await {
            // reliable messages stay tracked and are retried by the sweep
            warn!(
                "transmission attempt for {:?} failed: {:#}",
                self.sendable.message_id(),
                e
            );
        }
    }

    async fn transmit(&self) -> anyhow::Result<()> {
        let (host, port) = match self.sendable.resolved_url() {
            Some(url) => {
                self.manager.persist_message(self.sendable.as_ref()).await?;
                let (host, port, _) = parse_url(&url)?;
                (host, port)
            }
            None => {
                // a persisted reliable message from a previous process
                // lifetime, re-sent to the host it was first addressed to
                let host = self
                    .sendable
                    .recorded_host()
                    .ok_or_else(|| anyhow!("no resolved URL and no recorded host"))?;
                (host, DEFAULT_SPINE_PORT)
            }
        };

        let mut conn = self.manager.security()?.connect(&host, port).await?;
        let mut buf = BytesMut::new();
        self.sendable.serialize(&mut buf)?;
        conn.write_all(&buf).await?;
        conn.flush().await?;
        self.sendable.state().set_on_the_wire_request(buf.to_vec());
        debug!(
            "sent {} bytes to {}:{} for {:?}",
            buf.len(),
            host,
            port,
            self.sendable.message_id()
        );

        let read_timeout = self.manager.config().read_timeout;
        let mut reader = BufReader::new(&mut conn);
        let headers = timeout(read_timeout, HttpHeaders::read(&mut reader))
            .await
            .map_err(|_| anyhow!("timed out waiting for response from {}", host))??;
        let content_length = headers.content_length().unwrap_or(0);
        if content_length > 0 {
            let mut body = vec![0_u8; content_length];
            timeout(read_timeout, reader.read_exact(&mut body))
                .await
                .map_err(|_| anyhow!("timed out reading response body from {}", host))??;
            self.sendable
                .state()
                .set_synchronous_response(String::from_utf8_lossy(&body).into_owned());
        }

        if let Some(captor) = self.manager.session_captor() {
            captor.capture(self.sendable.as_ref());
        }

        if let Some(soap) = self.sendable.as_soap_request() {
            if self.sendable.state().synchronous_response().is_none() {
                warn!("no response body to {:?}", self.sendable.message_id());
                return Ok(());
            }
            let handler = self
                .manager
                .synchronous_response_handler(&self.sendable.soap_action())
                .await;
            handler.handle(soap).await?;
            return Ok(());
        }

        // ebXML ack processing; not for asynchronous acknowledgments, which
        // carry no message id of their own
        if let Some(id) = self.sendable.message_id() {
            if headers.status_code().map(|s| s >= 500).unwrap_or(false) {
                // explicit rejection, stop retrying
                warn!("HTTP {} received sending {}", headers.status_code().unwrap_or(0), id);
                self.manager.remove_request(&id).await;
                return Ok(());
            }
            if let Some(response) = self.sendable.state().synchronous_response() {
                if response.contains(&id) {
                    self.manager.register_ack(&id).await;
                } else if response.contains("Bad request") {
                    warn!("bad request response received sending {}", id);
                    self.manager.register_ack(&id).await;
                }
            }
        }
        Ok(())
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Duration as StdDuration;

    use tokio::net::TcpListener;

    use crate::config::SpineConfig;
    use crate::connection::resolver::{StaticEndpointResolver, TransmissionDetails};
    use crate::connection::session::SessionManager;
    use crate::messaging::ebxml::EbXmlMessage;
    use crate::messaging::hl7::SpineHL7Message;

    fn manager(dir: &tempfile::TempDir, retry_check: StdDuration) -> Arc<SessionManager> {
        let config = SpineConfig {
            message_directory: dir.path().join("messages"),
            expired_directory: dir.path().join("expired"),
            received_directory: dir.path().join("received"),
            my_ip: "127.0.0.1".to_string(),
            my_asid: "866971180017".to_string(),
            my_party_key: Some("X26-0000000".to_string()),
            listen_address: SocketAddr::from(([127, 0, 0, 1], 0)),
            retry_check_interval: retry_check,
            ..SpineConfig::default()
        };
        SessionManager::new(config, Arc::new(StaticEndpointResolver::new()))
    }

    fn details(url: &str) -> TransmissionDetails {
        TransmissionDetails {
            org_code: "X09".to_string(),
            party_key: "X09-9999999".to_string(),
            cpa_id: "S3024519A3100417".to_string(),
            service: "urn:nhs:names:services:pdsquery".to_string(),
            interaction_id: "QUPA_IN000006UK02".to_string(),
            svc_ia: "urn:nhs:names:services:pdsquery:QUPA_IN000006UK02".to_string(),
            soap_actor: "urn:oasis:names:tc:ebxml-msg:actor:nextMSH".to_string(),
            asids: vec!["900000000001".to_string()],
            url: url.to_string(),
            sync_reply: "MSHSignalsOnly".to_string(),
            duplicate_elimination: "always".to_string(),
            ack_requested: "always".to_string(),
            retries: 3,
            retry_interval: 60,
            persist_duration: 3600,
        }
    }

    /// Accepts one connection, reads the full request, answers with the
    /// given status and body.
    async fn one_shot_server(listener: TcpListener, status: &str, body: String) {
        let (stream, _) = listener.accept().await.unwrap();
        let mut reader = BufReader::new(stream);
        let headers = HttpHeaders::read(&mut reader).await.unwrap();
        let mut request = vec![0_u8; headers.content_length().unwrap()];
        reader.read_exact(&mut request).await.unwrap();
        let response = format!(
            "HTTP/1.1 {}\r\nContent-Length: {}\r\n\r\n{}",
            status,
            body.len(),
            body
        );
        reader
            .into_inner()
            .write_all(response.as_bytes())
            .await
            .unwrap();
    }

    /// Accepts one connection per entry in `responses`, reading the full
    /// request each time before answering. Used to exercise retransmission:
    /// an empty 200 leaves the message tracked for the next sweep.
    async fn scripted_server(listener: TcpListener, responses: Vec<String>) {
        for body in responses {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            let headers = HttpHeaders::read(&mut reader).await.unwrap();
            let mut request = vec![0_u8; headers.content_length().unwrap()];
            reader.read_exact(&mut request).await.unwrap();
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
                body.len(),
                body
            );
            reader
                .into_inner()
                .write_all(response.as_bytes())
                .await
                .unwrap();
        }
    }

    async fn wait_until_untracked(
        m: &Arc<SessionManager>,
        id: &str,
        within: StdDuration,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        while tokio::time::Instant::now() < deadline {
            if !m.is_tracked(id).await {
                return true;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        !m.is_tracked(id).await
    }

    #[tokio::test]
    async fn test_synchronous_ack_in_response_body_releases_message() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir, StdDuration::from_secs(30));
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/reliablemessaging/intermediary", server.local_addr().unwrap());

        let d = details(&url);
        let msg = Arc::new(EbXmlMessage::new(
            &d,
            SpineHL7Message::new("<QUPA_IN000006UK02/>".to_string()),
            Some("X26-0000000"),
        ));
        let id = msg.header().message_id().to_string();
        let ack_body = format!("<eb:RefToMessageId>{}</eb:RefToMessageId>", id);
        tokio::spawn(one_shot_server(server, "200 OK", ack_body));

        m.send(msg.clone(), &d).await.unwrap();
        assert!(
            wait_until_untracked(&m, &id, StdDuration::from_secs(2)).await,
            "message never acked"
        );
        // acked means the persisted copy is gone too
        assert!(!m.config().message_directory.join(&id).exists());
        m.stop_listening().await;
        m.stop_retry_processor();
    }

    #[tokio::test]
    async fn test_server_error_stops_retrying() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir, StdDuration::from_secs(30));
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/reliablemessaging/intermediary", server.local_addr().unwrap());

        let d = details(&url);
        let msg = Arc::new(EbXmlMessage::new(
            &d,
            SpineHL7Message::new("<QUPA_IN000006UK02/>".to_string()),
            Some("X26-0000000"),
        ));
        let id = msg.header().message_id().to_string();
        tokio::spawn(one_shot_server(server, "500 Internal Server Error", String::new()));

        m.send(msg.clone(), &d).await.unwrap();
        assert!(
            wait_until_untracked(&m, &id, StdDuration::from_secs(2)).await,
            "message not deregistered"
        );
        m.stop_listening().await;
        m.stop_retry_processor();
    }

    #[tokio::test]
    async fn test_connection_failure_leaves_message_tracked() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir, StdDuration::from_secs(30));
        // reserve a port with no listener behind it
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/x", closed.local_addr().unwrap());
        drop(closed);

        let d = details(&url);
        let msg = Arc::new(EbXmlMessage::new(
            &d,
            SpineHL7Message::new("<QUPA_IN000006UK02/>".to_string()),
            Some("X26-0000000"),
        ));
        let id = msg.header().message_id().to_string();
        m.send(msg.clone(), &d).await.unwrap();

        assert!(!wait_until_untracked(&m, &id, StdDuration::from_millis(500)).await);
        assert_eq!(msg.state().tries(), 1);
        m.stop_listening().await;
        m.stop_retry_processor();
    }

    #[tokio::test]
    async fn test_unacknowledged_message_is_retransmitted_by_the_sweep() {
        let dir = tempfile::tempdir().unwrap();
        let m = manager(&dir, StdDuration::from_millis(50));
        let server = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/reliablemessaging/intermediary", server.local_addr().unwrap());

        let mut d = details(&url);
        d.retry_interval = 1;
        let msg = Arc::new(EbXmlMessage::new(
            &d,
            SpineHL7Message::new("<QUPA_IN000006UK02/>".to_string()),
            Some("X26-0000000"),
        ));
        let id = msg.header().message_id().to_string();
        // first attempt gets no acknowledgment, the second is acked
        let ack_body = format!("<eb:RefToMessageId>{}</eb:RefToMessageId>", id);
        tokio::spawn(scripted_server(server, vec![String::new(), ack_body]));

        m.send(msg.clone(), &d).await.unwrap();
        assert!(
            wait_until_untracked(&m, &id, StdDuration::from_secs(5)).await,
            "retransmission never acked"
        );
        assert_eq!(msg.state().tries(), 2);
        m.stop_listening().await;
        m.stop_retry_processor();
    }
}
