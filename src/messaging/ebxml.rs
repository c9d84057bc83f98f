//! ebXML message wrapping and unwrapping.
//!
//! A Spine asynchronous message is a multipart/related HTTP POST: the first
//! MIME part is the ebXML SOAP header, the second is the HL7v3 payload, and
//! any further parts are attachments. The same serialised form is used on the
//! wire and for on-disk persistence of reliable messages, so a message can be
//! reconstructed from either.

use anyhow::anyhow;
use bytes::{BufMut, BytesMut};
use chrono::{DateTime, NaiveDateTime, Utc};
use uuid::Uuid;

use crate::connection::resolver::TransmissionDetails;
use crate::messaging::hl7::{strip_mime_headers, SpineHL7Message};
use crate::messaging::sendable::{SendState, Sendable, SendableKind};
use crate::util::http::{parse_mime_boundary, parse_url, HttpHeaders};

/// Spine rejects ebXML messages above 5MB; larger content goes by the large
/// message protocol, which this crate does not implement.
pub const MAX_MESSAGE_SIZE: usize = 5_242_880;

const EBXML_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
const DEFAULT_MIME_BOUNDARY: &str = "--=_MIME-Boundary";

const HTTP_HEADER_TEMPLATE: &str = "POST __CONTEXT_PATH__ HTTP/1.1\r\n\
Host: __HOST__\r\n\
SOAPAction: \"__SOAP_ACTION__\"\r\n\
Content-Length: __CONTENT_LENGTH__\r\n\
Content-Type: multipart/related; boundary=\"__MIME_BOUNDARY__\"; type=\"text/xml\"; start=\"<__START_ID__>\"\r\n\
Connection: close\r\n\r\n";

const EBXML_HEADER_TEMPLATE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<SOAP:Envelope xmlns:SOAP="http://schemas.xmlsoap.org/soap/envelope/" xmlns:eb="http://www.oasis-open.org/committees/ebxml-msg/schema/msg-header-2_0.xsd" xmlns:xlink="http://www.w3.org/1999/xlink" xmlns:hl7ebxml="urn:hl7-org:transport/ebXML/DSTUv1.0">
<SOAP:Header>
<eb:MessageHeader SOAP:mustUnderstand="1" eb:version="2.0">
<eb:From><eb:PartyId eb:type="urn:nhs:names:partyType:ocs+serviceInstance">__FROM_PARTY_KEY__</eb:PartyId></eb:From>
<eb:To><eb:PartyId eb:type="urn:nhs:names:partyType:ocs+serviceInstance">__TO_PARTY_KEY__</eb:PartyId></eb:To>
<eb:CPAId>__CPAID__</eb:CPAId>
<eb:ConversationId>__CONVERSATION_ID__</eb:ConversationId>
<eb:Service>__SERVICE__</eb:Service>
<eb:Action>__INTERACTION_ID__</eb:Action>
<eb:MessageData>
<eb:MessageId>__MESSAGE_ID__</eb:MessageId>
<eb:Timestamp>__TIMESTAMP__</eb:Timestamp>
</eb:MessageData>
__DUPLICATE_ELIMINATION__
</eb:MessageHeader>
__ACK_REQUESTED__
__SYNC_REPLY__
</SOAP:Header>
<SOAP:Body>
<eb:Manifest eb:version="2.0">
__REFERENCES__
</eb:Manifest>
</SOAP:Body>
</SOAP:Envelope>
"#;

const DUPLICATE_ELIMINATION_ELEMENT: &str = "<eb:DuplicateElimination/>";
const ACK_REQUESTED_ELEMENT: &str = "<eb:AckRequested eb:version=\"2.0\" SOAP:mustUnderstand=\"1\" SOAP:actor=\"__SOAP_ACTOR__\" eb:signed=\"false\"/>";
const SYNC_REPLY_ELEMENT: &str = "<eb:SyncReply eb:version=\"2.0\" SOAP:mustUnderstand=\"1\" SOAP:actor=\"http://schemas.xmlsoap.org/soap/actor/next\"/>";

const ACK_TEMPLATE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<SOAP:Envelope xmlns:SOAP="http://schemas.xmlsoap.org/soap/envelope/" xmlns:eb="http://www.oasis-open.org/committees/ebxml-msg/schema/msg-header-2_0.xsd">
<SOAP:Header>
<eb:MessageHeader SOAP:mustUnderstand="1" eb:version="2.0">
<eb:From><eb:PartyId eb:type="urn:nhs:names:partyType:ocs+serviceInstance">__FROMPARTY__</eb:PartyId></eb:From>
<eb:To><eb:PartyId eb:type="urn:nhs:names:partyType:ocs+serviceInstance">__TOPARTY__</eb:PartyId></eb:To>
<eb:CPAId>__CPAID__</eb:CPAId>
<eb:ConversationId>__CONVERSATIONID__</eb:ConversationId>
<eb:Service>urn:oasis:names:tc:ebxml-msg:service</eb:Service>
<eb:Action>Acknowledgment</eb:Action>
<eb:MessageData>
<eb:MessageId>__MESSAGEID__</eb:MessageId>
<eb:Timestamp>__TIMESTAMP__</eb:Timestamp>
<eb:RefToMessageId>__REFTOMESSAGEID__</eb:RefToMessageId>
</eb:MessageData>
</eb:MessageHeader>
<eb:Acknowledgment SOAP:mustUnderstand="1" eb:version="2.0">
<eb:Timestamp>__TIMESTAMP__</eb:Timestamp>
<eb:RefToMessageId>__REFTOMESSAGEID__</eb:RefToMessageId>
</eb:Acknowledgment>
</SOAP:Header>
<SOAP:Body/>
</SOAP:Envelope>
"#;

const NACK_TEMPLATE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<SOAP:Envelope xmlns:SOAP="http://schemas.xmlsoap.org/soap/envelope/" xmlns:eb="http://www.oasis-open.org/committees/ebxml-msg/schema/msg-header-2_0.xsd">
<SOAP:Header>
<eb:MessageHeader SOAP:mustUnderstand="1" eb:version="2.0">
<eb:From><eb:PartyId eb:type="urn:nhs:names:partyType:ocs+serviceInstance">__FROMPARTY__</eb:PartyId></eb:From>
<eb:To><eb:PartyId eb:type="urn:nhs:names:partyType:ocs+serviceInstance">__TOPARTY__</eb:PartyId></eb:To>
<eb:CPAId>__CPAID__</eb:CPAId>
<eb:ConversationId>__CONVERSATIONID__</eb:ConversationId>
<eb:Service>urn:oasis:names:tc:ebxml-msg:service</eb:Service>
<eb:Action>MessageError</eb:Action>
<eb:MessageData>
<eb:MessageId>__MESSAGEID__</eb:MessageId>
<eb:Timestamp>__TIMESTAMP__</eb:Timestamp>
<eb:RefToMessageId>__REFTOMESSAGEID__</eb:RefToMessageId>
</eb:MessageData>
</eb:MessageHeader>
<eb:ErrorList eb:id="__ERROR_LIST_ID__" eb:highestSeverity="Error" eb:version="2.0" SOAP:mustUnderstand="1">
<eb:Error eb:id="__ERROR_ID__" eb:errorCode="__ERROR_CODE__" eb:severity="Error" eb:codeContext="__ERROR_CODECONTEXT__">
<eb:Description xml:lang="en">__ERROR_DESCRIPTION__</eb:Description>
</eb:Error>
</eb:ErrorList>
</SOAP:Header>
<SOAP:Body/>
</SOAP:Envelope>
"#;

/// Replace every occurrence of a __TAG__ with the given content. Scanning
/// resumes after the inserted content, so a value may itself contain the
/// tag text without being re-expanded.
pub(crate) fn substitute(buf: &mut String, tag: &str, content: &str) {
    let mut from = 0;
    while let Some(rel) = buf[from..].find(tag) {
        let at = from + rel;
        buf.replace_range(at..at + tag.len(), content);
        from = at + content.len();
    }
}

/// The ebXML SOAP header part of an asynchronous message.
pub struct EbXmlHeader {
    message_id: String,
    service: String,
    interaction_id: String,
    cpa_id: String,
    conversation_id: Option<String>,
    to_party_key: Option<String>,
    from_party_key: Option<String>,
    my_party_key: Option<String>,
    soap_actor: Option<String>,
    timestamp: Option<DateTime<Utc>>,
    duplicate_elimination: bool,
    ack_requested: bool,
    sync_reply: bool,
    content_id: String,
    /// Raw XML as received, kept so an inbound message re-serialises
    /// byte-identically.
    received: Option<String>,
}

impl EbXmlHeader {
    /// Header for an outbound message, populated from the recipient's
    /// contract properties.
    pub fn for_send(details: &TransmissionDetails, my_party_key: Option<&str>) -> EbXmlHeader {
        EbXmlHeader {
            message_id: Uuid::new_v4().to_string().to_uppercase(),
            service: details.service.clone(),
            interaction_id: details.interaction_id.clone(),
            cpa_id: details.cpa_id.clone(),
            conversation_id: None,
            to_party_key: Some(details.party_key.clone()),
            from_party_key: None,
            my_party_key: my_party_key.map(|s| s.to_string()),
            soap_actor: Some(details.soap_actor.clone()),
            timestamp: None,
            duplicate_elimination: details.duplicate_elimination == "always",
            ack_requested: details.ack_requested == "always",
            sync_reply: details.sync_reply == "MSHSignalsOnly",
            content_id: Uuid::new_v4().to_string(),
            received: None,
        }
    }

    /// Parse the header MIME part of a received message.
    pub fn parse(mime_part: &str) -> anyhow::Result<EbXmlHeader> {
        let xml = strip_mime_headers(mime_part)?;
        let service = extract_element(xml, "Service")
            .ok_or_else(|| anyhow!("ebXML header has no Service"))?;
        let interaction_id = extract_element(xml, "Action")
            .ok_or_else(|| anyhow!("ebXML header has no Action"))?;
        let message_id = extract_element(xml, "MessageId")
            .ok_or_else(|| anyhow!("ebXML header has no MessageId"))?;
        let cpa_id = extract_element(xml, "CPAId").unwrap_or_default();
        let conversation_id = extract_element(xml, "ConversationId");
        let from_party_key = extract_party_id(xml, "From");
        let timestamp = extract_element(xml, "Timestamp").and_then(|t| {
            NaiveDateTime::parse_from_str(&t, EBXML_TIMESTAMP_FORMAT)
                .ok()
                .map(|n| n.and_utc())
        });
        Ok(EbXmlHeader {
            message_id,
            service,
            interaction_id,
            cpa_id,
            conversation_id,
            to_party_key: None,
            from_party_key,
            my_party_key: None,
            soap_actor: None,
            timestamp,
            duplicate_elimination: xml.contains("DuplicateElimination"),
            ack_requested: xml.contains("AckRequested"),
            sync_reply: xml.contains("SyncReply"),
            content_id: Uuid::new_v4().to_string(),
            received: Some(xml.to_string()),
        })
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn set_message_id(&mut self, id: String) {
        self.message_id = id;
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn interaction_id(&self) -> &str {
        &self.interaction_id
    }

    pub fn cpa_id(&self) -> &str {
        &self.cpa_id
    }

    pub fn conversation_id(&self) -> Option<&str> {
        self.conversation_id.as_deref()
    }

    pub fn set_conversation_id(&mut self, id: String) {
        self.conversation_id = Some(id);
    }

    pub fn from_party_key(&self) -> Option<&str> {
        self.from_party_key.as_deref()
    }

    pub fn set_my_party_key(&mut self, key: String) {
        self.my_party_key = Some(key);
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    pub fn set_timestamp(&mut self, timestamp: DateTime<Utc>) {
        self.timestamp = Some(timestamp);
    }

    pub fn duplicate_elimination(&self) -> bool {
        self.duplicate_elimination
    }

    pub fn ack_requested(&self) -> bool {
        self.ack_requested
    }

    pub fn sync_reply(&self) -> bool {
        self.sync_reply
    }

    pub fn content_id(&self) -> &str {
        &self.content_id
    }

    /// "service:interaction", the key for contract property lookups.
    pub fn svc_ia(&self) -> String {
        format!("{}:{}", self.service, self.interaction_id)
    }

    /// "service/interaction", the HTTP SOAPAction.
    pub fn soap_action(&self) -> String {
        format!("{}/{}", self.service, self.interaction_id)
    }

    pub fn make_mime_header(&self) -> String {
        format!(
            "\r\nContent-Id: <{}>\r\nContent-Type: text/xml\r\nContent-Transfer-Encoding: 8bit\r\n\r\n",
            self.content_id
        )
    }

    /// Render the header XML, with the manifest references supplied by the
    /// owning message. Received headers are returned as they arrived.
    pub fn serialise(&self, references: &str) -> String {
        if let Some(ref r) = self.received {
            return r.clone();
        }
        let mut sb = EBXML_HEADER_TEMPLATE.to_string();
        substitute(&mut sb, "__FROM_PARTY_KEY__", self.my_party_key.as_deref().unwrap_or(""));
        substitute(&mut sb, "__TO_PARTY_KEY__", self.to_party_key.as_deref().unwrap_or(""));
        substitute(&mut sb, "__CPAID__", &self.cpa_id);
        substitute(
            &mut sb,
            "__CONVERSATION_ID__",
            self.conversation_id.as_deref().unwrap_or(&self.message_id),
        );
        substitute(&mut sb, "__SERVICE__", &self.service);
        substitute(&mut sb, "__INTERACTION_ID__", &self.interaction_id);
        substitute(&mut sb, "__MESSAGE_ID__", &self.message_id);
        let ts = self.timestamp.unwrap_or_else(Utc::now);
        substitute(&mut sb, "__TIMESTAMP__", &ts.format(EBXML_TIMESTAMP_FORMAT).to_string());
        if self.duplicate_elimination {
            substitute(&mut sb, "__DUPLICATE_ELIMINATION__", DUPLICATE_ELIMINATION_ELEMENT);
        } else {
            substitute(&mut sb, "__DUPLICATE_ELIMINATION__", "");
        }
        if self.ack_requested {
            let mut ar = ACK_REQUESTED_ELEMENT.to_string();
            substitute(&mut ar, "__SOAP_ACTOR__", self.soap_actor.as_deref().unwrap_or(""));
            substitute(&mut sb, "__ACK_REQUESTED__", &ar);
        } else {
            substitute(&mut sb, "__ACK_REQUESTED__", "");
        }
        if self.sync_reply {
            substitute(&mut sb, "__SYNC_REPLY__", SYNC_REPLY_ELEMENT);
        } else {
            substitute(&mut sb, "__SYNC_REPLY__", "");
        }
        substitute(&mut sb, "__REFERENCES__", references);
        sb
    }
}

/// A MIME part beyond the ebXML header and HL7 payload.
pub struct GeneralAttachment {
    content_id: String,
    mime_type: String,
    body: String,
}

impl GeneralAttachment {
    pub fn new(mime_type: String, body: String) -> GeneralAttachment {
        GeneralAttachment {
            content_id: Uuid::new_v4().to_string(),
            mime_type,
            body,
        }
    }

    fn from_mime_part(part: &str) -> anyhow::Result<GeneralAttachment> {
        let body = strip_mime_headers(part)?;
        let mime_type = HttpHeaders::parse(part.trim_start_matches(['\r', '\n']))
            .ok()
            .and_then(|h| h.content_type().map(|c| c.to_string()))
            .unwrap_or_else(|| "application/octet-stream".to_string());
        Ok(GeneralAttachment {
            content_id: Uuid::new_v4().to_string(),
            mime_type,
            body: body.to_string(),
        })
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    fn make_mime_header(&self) -> String {
        format!(
            "\r\nContent-Id: <{}>\r\nContent-Type: {}\r\nContent-Transfer-Encoding: 8bit\r\n\r\n",
            self.content_id, self.mime_type
        )
    }

    fn ebxml_reference(&self) -> String {
        format!(
            "<eb:Reference xlink:href=\"cid:{}\">\r\n<eb:Description xml:lang=\"en\">Attachment</eb:Description>\r\n</eb:Reference>\r\n",
            self.content_id
        )
    }
}

/// A reliable (or at least asynchronous) ebXML message.
///
/// Fallback host and context path defaults are placeholders that identify a
/// persisted reliable message whose endpoint was never resolved in this
/// process lifetime.
pub struct EbXmlMessage {
    header: EbXmlHeader,
    hl7: Option<SpineHL7Message>,
    attachments: Vec<GeneralAttachment>,
    mime_boundary: String,
    host: String,
    context_path: String,
    resolved_url: Option<String>,
    state: SendState,
    parse_error: Option<String>,
}

impl EbXmlMessage {
    /// Construct a message for sending.
    pub fn new(
        details: &TransmissionDetails,
        hl7: SpineHL7Message,
        my_party_key: Option<&str>,
    ) -> EbXmlMessage {
        let header = EbXmlHeader::for_send(details, my_party_key);
        let state = if details.retries > 0 {
            SendState::new(
                details.retries,
                chrono::Duration::seconds(details.retry_interval),
                chrono::Duration::seconds(details.persist_duration),
            )
        } else {
            SendState::default()
        };
        let resolved_url = if details.url.is_empty() {
            None
        } else {
            Some(details.url.clone())
        };
        EbXmlMessage {
            header,
            hl7: Some(hl7),
            attachments: Vec::new(),
            mime_boundary: DEFAULT_MIME_BOUNDARY.to_string(),
            host: "SPINE_RELIABLE_MESSAGE_HOST".to_string(),
            context_path: "/reliablemessaging/intermediary".to_string(),
            resolved_url,
            state,
            parse_error: None,
        }
    }

    /// Reassemble a message from parsed HTTP headers and the request body.
    ///
    /// Used both for inbound messages from the listener and for reliable
    /// messages reloaded from the message directory, which are stored as the
    /// full on-the-wire request.
    pub fn from_parts(headers: &HttpHeaders, body: &[u8]) -> anyhow::Result<EbXmlMessage> {
        let ctype = headers
            .content_type()
            .ok_or_else(|| anyhow!("no Content-Type in received message"))?;
        if !ctype.contains("multipart/related") {
            return Err(anyhow!("unexpected Content-Type: {}", ctype));
        }
        let boundary = parse_mime_boundary(ctype)
            .ok_or_else(|| anyhow!("no MIME boundary in Content-Type"))?;
        let body = std::str::from_utf8(body)?;

        let delimiter = format!("--{}", boundary);
        let mut parts = body
            .split(delimiter.as_str())
            .skip(1)
            .collect::<Vec<&str>>();
        // the final element is the "--\r\n" close tail
        parts.pop();
        if parts.len() < 2 {
            return Err(anyhow!("multipart body has {} parts, expected at least 2", parts.len()));
        }

        let header = EbXmlHeader::parse(parts[0])?;
        let hl7 = SpineHL7Message::from_mime_part(parts[1])?;
        let mut parse_error = None;
        let mut attachments = Vec::new();
        for part in &parts[2..] {
            match GeneralAttachment::from_mime_part(part) {
                Ok(a) => attachments.push(a),
                Err(e) => parse_error = Some(e.to_string()),
            }
        }

        let state = SendState::default();
        if let Some(ts) = header.timestamp() {
            // no record of how many attempts the sender made, so assume one
            // at the declared start time
            state.restore(ts, 1, Some(ts));
        }

        Ok(EbXmlMessage {
            header,
            hl7: Some(hl7),
            attachments,
            mime_boundary: boundary,
            host: headers.host().unwrap_or("SPINE_RELIABLE_MESSAGE_HOST").to_string(),
            context_path: headers
                .request_path()
                .unwrap_or("EXPIRED_PERSISTED_RELIABLE_MESSAGE")
                .to_string(),
            resolved_url: None,
            state,
            parse_error,
        })
    }

    /// Parse a complete on-the-wire request, HTTP header included.
    pub fn from_bytes(raw: &[u8]) -> anyhow::Result<EbXmlMessage> {
        let split = raw
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .ok_or_else(|| anyhow!("no HTTP header/body delimiter"))?;
        let head = std::str::from_utf8(&raw[..split])?;
        let headers = HttpHeaders::parse(head)?;
        Self::from_parts(&headers, &raw[split + 4..])
    }

    pub fn header(&self) -> &EbXmlHeader {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut EbXmlHeader {
        &mut self.header
    }

    pub fn hl7(&self) -> Option<&SpineHL7Message> {
        self.hl7.as_ref()
    }

    pub fn attachments(&self) -> &[GeneralAttachment] {
        &self.attachments
    }

    pub fn add_attachment(&mut self, a: GeneralAttachment) {
        self.attachments.push(a);
    }

    /// Attachment parse failures are captured rather than failing the whole
    /// message, so the sender still gets a negative acknowledgment that
    /// references their message id.
    pub fn parse_error(&self) -> Option<&str> {
        self.parse_error.as_deref()
    }

    pub fn set_parse_error(&mut self, e: String) {
        self.parse_error = Some(e);
    }

    pub fn set_resolved_url(&mut self, url: String) {
        self.resolved_url = Some(url);
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    fn references(&self) -> String {
        let mut refs = match self.hl7 {
            Some(ref h) => h.ebxml_reference(),
            None => String::new(),
        };
        for a in &self.attachments {
            refs.push_str(&a.ebxml_reference());
        }
        refs
    }

    fn make_http_header(&self, content_length: usize) -> anyhow::Result<String> {
        let mut sb = HTTP_HEADER_TEMPLATE.to_string();
        match self.resolved_url {
            Some(ref url) => {
                let (host, _, path) = parse_url(url)?;
                substitute(&mut sb, "__CONTEXT_PATH__", &path);
                substitute(&mut sb, "__HOST__", &host);
            }
            None => {
                // persisted reliable message being re-sent or expired
                substitute(&mut sb, "__CONTEXT_PATH__", &self.context_path);
                substitute(&mut sb, "__HOST__", &self.host);
            }
        }
        substitute(&mut sb, "__SOAP_ACTION__", &self.header.soap_action());
        substitute(&mut sb, "__CONTENT_LENGTH__", &content_length.to_string());
        substitute(&mut sb, "__MIME_BOUNDARY__", &self.mime_boundary);
        substitute(&mut sb, "__START_ID__", self.header.content_id());
        Ok(sb)
    }

    /// Body of an acknowledgment for this message, or `None` when the
    /// contract does not call for one.
    pub fn make_ack(&self, my_party_key: Option<&str>) -> Option<String> {
        if !self.header.ack_requested() || !self.header.duplicate_elimination() {
            return None;
        }
        let mut sb = ACK_TEMPLATE.to_string();
        self.fill_ack_common(&mut sb, my_party_key);
        Some(sb)
    }

    /// Body of a negative acknowledgment (ebXML MessageError) for this
    /// message, or `None` when the contract does not call for one.
    pub fn make_nack(
        &self,
        my_party_key: Option<&str>,
        code: &str,
        description: &str,
        code_context: &str,
    ) -> Option<String> {
        if !self.header.ack_requested() || !self.header.duplicate_elimination() {
            return None;
        }
        let mut sb = NACK_TEMPLATE.to_string();
        self.fill_ack_common(&mut sb, my_party_key);
        substitute(&mut sb, "__ERROR_LIST_ID__", &Uuid::new_v4().to_string());
        substitute(&mut sb, "__ERROR_ID__", &Uuid::new_v4().to_string());
        substitute(&mut sb, "__ERROR_CODE__", code);
        substitute(&mut sb, "__ERROR_CODECONTEXT__", code_context);
        substitute(&mut sb, "__ERROR_DESCRIPTION__", description);
        Some(sb)
    }

    fn fill_ack_common(&self, sb: &mut String, my_party_key: Option<&str>) {
        substitute(sb, "__FROMPARTY__", my_party_key.unwrap_or(""));
        substitute(sb, "__TOPARTY__", self.header.from_party_key().unwrap_or(""));
        substitute(sb, "__CPAID__", self.header.cpa_id());
        substitute(
            sb,
            "__CONVERSATIONID__",
            self.header.conversation_id().unwrap_or(self.header.message_id()),
        );
        substitute(sb, "__MESSAGEID__", &Uuid::new_v4().to_string().to_uppercase());
        substitute(
            sb,
            "__TIMESTAMP__",
            &Utc::now().format(EBXML_TIMESTAMP_FORMAT).to_string(),
        );
        substitute(sb, "__REFTOMESSAGEID__", self.header.message_id());
    }
}

impl Sendable for EbXmlMessage {
    fn kind(&self) -> SendableKind {
        SendableKind::EbXml
    }

    fn message_id(&self) -> Option<String> {
        Some(self.header.message_id().to_string())
    }

    fn soap_action(&self) -> String {
        self.header.soap_action()
    }

    fn state(&self) -> &SendState {
        &self.state
    }

    fn resolved_url(&self) -> Option<String> {
        self.resolved_url.clone()
    }

    fn recorded_host(&self) -> Option<String> {
        Some(self.host.clone())
    }

    fn serialize(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        let mut body = String::new();
        body.push_str("--");
        body.push_str(&self.mime_boundary);
        body.push_str(&self.header.make_mime_header());
        body.push_str(&self.header.serialise(&self.references()));
        if let Some(ref hl7) = self.hl7 {
            body.push_str("\r\n--");
            body.push_str(&self.mime_boundary);
            body.push_str(&hl7.make_mime_header());
            body.push_str(hl7.payload());
        }
        for a in &self.attachments {
            body.push_str("\r\n--");
            body.push_str(&self.mime_boundary);
            body.push_str(&a.make_mime_header());
            body.push_str(a.body());
        }
        body.push_str("\r\n--");
        body.push_str(&self.mime_boundary);
        body.push_str("--");
        if body.len() >= MAX_MESSAGE_SIZE {
            return Err(anyhow!(
                "message of {} bytes exceeds the 5MB ebXML limit, large message protocol is not supported",
                body.len()
            ));
        }
        buf.put_slice(self.make_http_header(body.len())?.as_bytes());
        buf.put_slice(body.as_bytes());
        Ok(())
    }
}

/// Extract the text content of the first ebXML element with the given local
/// name. The match must follow a '<' or a namespace ':' so that, for example,
/// MessageId never matches inside RefToMessageId.
fn extract_element(xml: &str, tag: &str) -> Option<String> {
    let mut search = 0;
    while let Some(rel) = xml[search..].find(tag) {
        let at = search + rel;
        let preceded_ok = at > 0 && matches!(xml.as_bytes()[at - 1], b'<' | b':');
        search = at + tag.len();
        if !preceded_ok {
            continue;
        }
        let rest = &xml[at + tag.len()..];
        let gt = rest.find('>')?;
        if rest[..gt].contains('/') {
            // self-closing, no text content
            return Some(String::new());
        }
        let rest = &rest[gt + 1..];
        let lt = rest.find('<')?;
        return Some(rest[..lt].to_string());
    }
    None
}

/// PartyId content beneath a From or To element.
fn extract_party_id(xml: &str, tag: &str) -> Option<String> {
    let at = xml.find(&format!("{}>", tag))?;
    let rest = &xml[at..];
    let at = rest.find("PartyId")?;
    let rest = &rest[at..];
    let gt = rest.find('>')?;
    let rest = &rest[gt + 1..];
    let lt = rest.find('<')?;
    Some(rest[..lt].to_string())
}
