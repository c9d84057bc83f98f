use anyhow::anyhow;
use bytes::{BufMut, BytesMut};
use uuid::Uuid;

use crate::connection::resolver::TransmissionDetails;
use crate::messaging::ebxml::substitute;
use crate::messaging::hl7::SpineHL7Message;
use crate::messaging::sendable::{SendState, Sendable, SendableKind};
use crate::util::http::parse_url;

const HTTP_HEADER_TEMPLATE: &str = "POST __CONTEXT_PATH__ HTTP/1.1\r\n\
Host: __HOST__\r\n\
SOAPAction: __SOAP_ACTION__\r\n\
Content-Length: __CONTENT_LENGTH__\r\n\
Content-Type: text/xml; charset=utf-8\r\n\
Connection: close\r\n\r\n";

const SOAP_TEMPLATE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<SOAP-ENV:Envelope xmlns:SOAP-ENV="http://schemas.xmlsoap.org/soap/envelope/" xmlns:wsa="http://schemas.xmlsoap.org/ws/2004/08/addressing" xmlns:hl7="urn:hl7-org:v3">
<SOAP-ENV:Header>
<wsa:MessageID>uuid:__MESSAGE_ID__</wsa:MessageID>
<wsa:Action>__SOAPACTION__</wsa:Action>
<wsa:To>__RESOLVED_URL__</wsa:To>
<wsa:From><wsa:Address>http://__MY_IP__/reliablemessaging/intermediary</wsa:Address></wsa:From>
<hl7:communicationFunctionRcv>
<hl7:device classCode="DEV" determinerCode="INSTANCE">
<hl7:id root="1.2.826.0.1285.0.2.0.107" extension="__TO_ASID__"/>
</hl7:device>
</hl7:communicationFunctionRcv>
<hl7:communicationFunctionSnd>
<hl7:device classCode="DEV" determinerCode="INSTANCE">
<hl7:id root="1.2.826.0.1285.0.2.0.107" extension="__MY_ASID__"/>
</hl7:device>
</hl7:communicationFunctionSnd>
</SOAP-ENV:Header>
<SOAP-ENV:Body>
__HL7_BODY__
</SOAP-ENV:Body>
</SOAP-ENV:Envelope>
"#;

/// A Spine synchronous SOAP request, answered on the same connection.
///
/// Synchronous requests carry no reliability contract: one attempt, no
/// tracking, and the response body ends up in the send state for the
/// registered synchronous response handler.
pub struct SpineSoapRequest {
    message_id: String,
    soap_action: String,
    resolved_url: String,
    my_ip: String,
    my_asid: String,
    to_asid: String,
    hl7: SpineHL7Message,
    state: SendState,
}

impl SpineSoapRequest {
    pub fn new(
        details: &TransmissionDetails,
        hl7: SpineHL7Message,
        my_ip: &str,
        my_asid: &str,
    ) -> anyhow::Result<SpineSoapRequest> {
        let to_asid = details
            .asids
            .first()
            .cloned()
            .ok_or_else(|| anyhow!("no recipient ASID in transmission details"))?;
        let my_asid = hl7
            .my_asid()
            .map(|s| s.to_string())
            .unwrap_or_else(|| my_asid.to_string());
        Ok(SpineSoapRequest {
            message_id: Uuid::new_v4().to_string().to_uppercase(),
            soap_action: format!("{}/{}", details.service, details.interaction_id),
            resolved_url: details.url.clone(),
            my_ip: my_ip.to_string(),
            my_asid,
            to_asid,
            hl7,
            state: SendState::default(),
        })
    }

    pub fn set_resolved_url(&mut self, url: String) {
        self.resolved_url = url;
    }

    pub fn hl7(&self) -> &SpineHL7Message {
        &self.hl7
    }
}

impl Sendable for SpineSoapRequest {
    fn kind(&self) -> SendableKind {
        SendableKind::SoapRequest
    }

    fn message_id(&self) -> Option<String> {
        Some(self.message_id.clone())
    }

    fn soap_action(&self) -> String {
        self.soap_action.clone()
    }

    fn state(&self) -> &SendState {
        &self.state
    }

    fn resolved_url(&self) -> Option<String> {
        Some(self.resolved_url.clone())
    }

    fn serialize(&self, buf: &mut BytesMut) -> anyhow::Result<()> {
        let mut body = SOAP_TEMPLATE.to_string();
        substitute(&mut body, "__MESSAGE_ID__", &self.message_id);
        substitute(&mut body, "__SOAPACTION__", &self.soap_action);
        substitute(&mut body, "__RESOLVED_URL__", &self.resolved_url);
        substitute(&mut body, "__MY_IP__", &self.my_ip);
        substitute(&mut body, "__MY_ASID__", &self.my_asid);
        substitute(&mut body, "__TO_ASID__", &self.to_asid);
        substitute(&mut body, "__HL7_BODY__", self.hl7.body());

        let (host, _, path) = parse_url(&self.resolved_url)?;
        let mut header = HTTP_HEADER_TEMPLATE.to_string();
        substitute(&mut header, "__CONTEXT_PATH__", &path);
        substitute(&mut header, "__HOST__", &host);
        substitute(&mut header, "__SOAP_ACTION__", &self.soap_action);
        substitute(&mut header, "__CONTENT_LENGTH__", &body.len().to_string());
        buf.put_slice(header.as_bytes());
        buf.put_slice(body.as_bytes());
        Ok(())
    }

    fn as_soap_request(&self) -> Option<&SpineSoapRequest> {
        Some(self)
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use crate::connection::resolver::TransmissionDetails;

    fn details() -> TransmissionDetails {
        TransmissionDetails {
            org_code: "YES".to_string(),
            party_key: "YES-0000806".to_string(),
            cpa_id: "S2001919A2011852".to_string(),
            service: "urn:nhs:names:services:pdsquery".to_string(),
            interaction_id: "QUPA_IN040000UK32".to_string(),
            svc_ia: "urn:nhs:names:services:pdsquery:QUPA_IN040000UK32".to_string(),
            soap_actor: String::new(),
            asids: vec!["928942012545".to_string()],
            url: "https://spine.example/sync-service".to_string(),
            sync_reply: "none".to_string(),
            duplicate_elimination: "never".to_string(),
            ack_requested: "never".to_string(),
            retries: 0,
            retry_interval: 0,
            persist_duration: 0,
        }
    }

    #[test]
    fn test_serialize_substitutes_everything() {
        let req = SpineSoapRequest::new(
            &details(),
            SpineHL7Message::new("<?xml version=\"1.0\"?><QUPA_IN040000UK32/>".to_string()),
            "192.168.1.2",
            "866971180017",
        )
        .unwrap();
        let mut buf = BytesMut::new();
        req.serialize(&mut buf).unwrap();
        let text = String::from_utf8(buf.to_vec()).unwrap();
        assert!(text.starts_with("POST /sync-service HTTP/1.1\r\n"));
        assert!(text.contains("Host: spine.example\r\n"));
        assert!(text.contains("extension=\"928942012545\""));
        assert!(text.contains("extension=\"866971180017\""));
        // XML directive stripped from the embedded payload
        assert!(text.contains("<QUPA_IN040000UK32/>"));
        assert!(!text[text.find("\r\n\r\n").unwrap() + 4..].contains("__"));
    }

    #[test]
    fn test_requires_recipient_asid() {
        let mut d = details();
        d.asids.clear();
        let r = SpineSoapRequest::new(
            &d,
            SpineHL7Message::new("<x/>".to_string()),
            "127.0.0.1",
            "1",
        );
        assert!(r.is_err());
    }

    #[test]
    fn test_hl7_asid_overrides_configured_asid() {
        let mut hl7 = SpineHL7Message::new("<x/>".to_string());
        hl7.set_my_asid("555555555555".to_string());
        let req = SpineSoapRequest::new(&details(), hl7, "127.0.0.1", "866971180017").unwrap();
        let mut buf = BytesMut::new();
        req.serialize(&mut buf).unwrap();
        let text = String::from_utf8(buf.to_vec()).unwrap();
        assert!(text.contains("extension=\"555555555555\""));
        assert!(!text.contains("866971180017"));
    }
}
