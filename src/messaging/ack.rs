use bytes::{BufMut, BytesMut};

use crate::messaging::sendable::{SendState, Sendable, SendableKind};
use crate::util::http::parse_url;

pub const ACK_SERVICE: &str = "urn:oasis:names:tc:ebxml-msg:service:Acknowledgment";
pub const ACK_SOAP_ACTION: &str = "urn:oasis:names:tc:ebxml-msg:service/Acknowledgment";
pub const ERROR_SOAP_ACTION: &str = "urn:oasis:names:tc:ebxml-msg:service/MessageError";

const ACK_HTTP_HEADER: &str = "POST /reliablemessaging/intermediary HTTP/1.1\r\n\
Host: __HOST__\r\n\
Content-Length: __CONTENT_LENGTH__\r\n\
Connection: close\r\n\
Content-Type: text/xml\r\n\
SOAPAction: urn:oasis:names:tc:ebxml-msg:service/Acknowledgment\r\n\r\n";

/// An ebXML acknowledgment or error being returned asynchronously.
///
/// The body is the same whether an acknowledgment goes back synchronously or
/// asynchronously, and is built by [`crate::messaging::EbXmlMessage`]. A
/// synchronous one is just written to the already-open connection; this type
/// exists so the asynchronous case can go through the ordinary transmit path.
/// Acknowledgments are fire-and-forget: no retries, nothing tracked.
pub struct EbXmlAcknowledgment {
    body: String,
    resolved_url: Option<String>,
    state: SendState,
}

impl EbXmlAcknowledgment {
    pub fn new(body: String, resolved_url: Option<String>) -> EbXmlAcknowledgment {
        EbXmlAcknowledgment {
            body,
            resolved_url,
            state: SendState::default(),
        }
    }

    /// The message id an acknowledgment or MessageError body refers to.
    pub fn ref_to_message_id(body: &str) -> Option<String> {
        let start = body.find("RefToMessageId>")? + "RefToMessageId>".len();
        let end = body[start..].find('<')?;
        Some(body[start..start + end].to_string())
    }
}

impl Sendable for EbXmlAcknowledgment {
    fn kind(&self) -> SendableKind {
        SendableKind::Acknowledgment
    }

    fn message_id(&self) -> Option<String> {
        None
    }

    fn soap_action(&self) -> String {
        ACK_SOAP_ACTION.to_string()
    }

    fn state(&self) -> &SendState {
        &self.state
    }

    fn resolved_url(&self) -> Option<String> {
        self.resolved_url.clone()
    }

    fn serialize(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        let url = self
            .resolved_url
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("no URL resolved for asynchronous acknowledgment"))?;
        let (host, _, _) = parse_url(url)?;
        let mut header = ACK_HTTP_HEADER.to_string();
        crate::messaging::ebxml::substitute(&mut header, "__HOST__", &host);
        crate::messaging::ebxml::substitute(
            &mut header,
            "__CONTENT_LENGTH__",
            &self.body.len().to_string(),
        );
        buf.put_slice(header.as_bytes());
        buf.put_slice(self.body.as_bytes());
        Ok(())
    }
}
