//! Per-connection inbound message processing.
//!
//! One task per accepted connection: read the HTTP request, work out whether
//! it is an acknowledgment for something we sent or a fresh ebXML message,
//! acknowledge it the way the sender's contract asks for, and hand new
//! messages to the registered application handler. Duplicates are
//! re-acknowledged but not re-dispatched.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::connection::listener::{Listener, ReceiveStatus};
use crate::connection::security::BoxedConnection;
use crate::connection::session::SessionManager;
use crate::connection::transmitter::Transmitter;
use crate::messaging::ack::{EbXmlAcknowledgment, ACK_SERVICE, ACK_SOAP_ACTION, ERROR_SOAP_ACTION};
use crate::messaging::ebxml::EbXmlMessage;
use crate::util::http::HttpHeaders;

pub async fn handle_connection(
    manager: Arc<SessionManager>,
    listener: Arc<Listener>,
    conn: BoxedConnection,
    peer: SocketAddr,
) -> anyhow::Result<()> {
    let read_timeout = manager.config().read_timeout;
    let mut reader = BufReader::new(conn);
    let headers = timeout(read_timeout, HttpHeaders::read(&mut reader))
        .await
        .map_err(|_| anyhow!("timed out reading request from {}", peer))?
        .with_context(|| format!("reading request from {}", peer))?;
    let content_length = headers.content_length().unwrap_or(0);
    let mut body = vec![0_u8; content_length];
    timeout(read_timeout, reader.read_exact(&mut body))
        .await
        .map_err(|_| anyhow!("timed out reading request body from {}", peer))?
        .with_context(|| format!("reading request body from {}", peer))?;
    let mut conn = reader.into_inner();

    let controls = &manager.config().test_controls;
    if controls.dump_received_messages {
        debug!(
            "received from {}:\n{}\n{}",
            peer,
            headers.start_line,
            String::from_utf8_lossy(&body)
        );
    }

    let Some(soap_action) = headers.soap_action() else {
        warn!("request from {} has no SOAPAction", peer);
        respond(&mut conn, "400 Bad Request", "", false).await?;
        return Ok(());
    };

    // acknowledgments and rejections for messages we sent
    if soap_action == ACK_SOAP_ACTION || soap_action == ERROR_SOAP_ACTION {
        let body = String::from_utf8_lossy(&body);
        match EbXmlAcknowledgment::ref_to_message_id(&body) {
            Some(id) => {
                if soap_action == ERROR_SOAP_ACTION {
                    warn!("ebXML MessageError received for {}", id);
                }
                manager.register_ack(&id).await;
            }
            None => warn!("acknowledgment from {} has no RefToMessageId", peer),
        }
        respond(&mut conn, "200 OK", "", true).await?;
        return Ok(());
    }

    if controls.force_soap_fault {
        respond(&mut conn, "500 Internal Server Error", "", true).await?;
        return Ok(());
    }
    if controls.drop_alternate_sync_responses && listener.next_sync_drop_count() % 2 != 0 {
        info!("dropping response to {} for timeout testing", peer);
        return Ok(());
    }

    let mut message = match EbXmlMessage::from_parts(&headers, &body) {
        Ok(m) => m,
        Err(e) => {
            // nothing well-formed enough to build a MessageError against
            warn!("unparseable message from {}: {:#}", peer, e);
            respond(&mut conn, "500 Internal Server Error", "", false).await?;
            return Ok(());
        }
    };
    if controls.force_negative_ack {
        message.set_parse_error("negative acknowledgment forced for testing".to_string());
    }

    let duplicate = message.header().duplicate_elimination()
        && listener.receive_id(message.header().message_id(), &message.header().svc_ia())
            == ReceiveStatus::Duplicate;
    if duplicate {
        info!(
            "duplicate delivery of {} from {}",
            message.header().message_id(),
            peer
        );
    }

    let my_party_key = manager.config().my_party_key.as_deref();
    let ack = match message.parse_error() {
        None => message.make_ack(my_party_key),
        Some(e) => message.make_nack(my_party_key, "1000", e, "ebXml Parser"),
    };
    match ack {
        Some(ack) if message.header().sync_reply() => {
            let status = if message.parse_error().is_none() {
                "202 OK"
            } else {
                "500 Internal Server Error"
            };
            respond(&mut conn, status, &ack, true).await?;
        }
        Some(ack) => {
            respond(&mut conn, "200 OK", "", true).await?;
            send_asynchronous_ack(manager.clone(), ack);
        }
        None => {
            respond(&mut conn, "200 OK", "", true).await?;
        }
    }

    if duplicate || message.parse_error().is_some() {
        return Ok(());
    }
    let handler = manager.ebxml_handler(&soap_action).await;
    handler.handle(&message).await
}

/// Return an acknowledgment on a fresh connection of our own, as a sender
/// with no syncreply contract expects.
fn send_asynchronous_ack(manager: Arc<SessionManager>, ack: String) {
    tokio::spawn(async move {
        if let Some(delay) = manager.config().test_controls.async_ack_delay {
            tokio::time::sleep(delay).await;
        }
        let url = manager.resolve_url(ACK_SERVICE);
        if url.is_none() {
            warn!("no URL configured for asynchronous acknowledgments");
        }
        Transmitter::spawn(manager.clone(), Arc::new(EbXmlAcknowledgment::new(ack, url)));
    });
}

async fn respond(
    conn: &mut BoxedConnection,
    status: &str,
    body: &str,
    xml: bool,
) -> anyhow::Result<()> {
    let mut response = format!("HTTP/1.1 {}\r\nContent-Length: {}", status, body.len());
    if xml {
        response.push_str(
            "\r\nConnection: close\r\nContent-Type: text/xml\r\nSOAPAction: urn:oasis:names:tc:ebxml-msg:service/Acknowledgment",
        );
    }
    response.push_str("\r\n\r\n");
    response.push_str(body);
    conn.write_all(response.as_bytes()).await?;
    conn.flush().await?;
    conn.shutdown().await?;
    Ok(())
}
