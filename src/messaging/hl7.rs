use anyhow::anyhow;
use uuid::Uuid;

pub const HL7V3_MIME_TYPE: &str = "application/xml; charset=UTF-8";

const SCHEMA_ELEMENT: &str =
    "<eb:Schema eb:location=\"http://www.nhsia.nhs.uk/schemas/HL7-Message.xsd\" eb:version=\"1.0\"/>\r\n";
const DESCRIPTION_ELEMENT: &str =
    "<eb:Description xml:lang=\"en\">HL7 payload</eb:Description>\r\n";
const PAYLOAD_ELEMENT: &str =
    "<hl7ebxml:Payload style=\"HL7\" encoding=\"XML\" version=\"3.0\"/>\r\n";

/// The HL7v3 payload part of a Spine message.
///
/// The payload is carried as the serialised XML the caller built it as. This
/// crate does not construct or validate HL7 wrappers; it only needs the
/// identifiers that the transport references.
pub struct SpineHL7Message {
    payload: String,
    message_id: String,
    interaction_id: Option<String>,
    content_id: String,
    my_asid: Option<String>,
    to_asid: Option<String>,
    /// Sending ASID, populated when parsed from a received message.
    from_asid: Option<String>,
}

impl SpineHL7Message {
    pub fn new(payload: String) -> SpineHL7Message {
        SpineHL7Message {
            payload,
            message_id: Uuid::new_v4().to_string().to_uppercase(),
            interaction_id: None,
            content_id: Uuid::new_v4().to_string(),
            my_asid: None,
            to_asid: None,
            from_asid: None,
        }
    }

    /// Build from a received MIME part, extracting the identifiers the
    /// transport needs. The expected shape is attribute-carried values:
    /// `<id root="..."/>`, `<interactionId extension="..."/>` and the sender
    /// device id under `communicationFunctionSnd`.
    pub fn from_mime_part(part: &str) -> anyhow::Result<SpineHL7Message> {
        let payload = strip_mime_headers(part)?;
        let message_id = extract_attribute(payload, "id", "root")
            .ok_or_else(|| anyhow!("malformed HL7v3, no message id"))?;
        let interaction_id = extract_attribute(payload, "interactionId", "extension");
        let from_asid = extract_attribute(payload, "communicationFunctionSnd", "extension");
        Ok(SpineHL7Message {
            payload: payload.to_string(),
            message_id,
            interaction_id,
            content_id: Uuid::new_v4().to_string(),
            my_asid: None,
            to_asid: None,
            from_asid,
        })
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn interaction_id(&self) -> Option<&str> {
        self.interaction_id.as_deref()
    }

    pub fn content_id(&self) -> &str {
        &self.content_id
    }

    pub fn my_asid(&self) -> Option<&str> {
        self.my_asid.as_deref()
    }

    pub fn set_my_asid(&mut self, asid: String) {
        self.my_asid = Some(asid);
    }

    pub fn to_asid(&self) -> Option<&str> {
        self.to_asid.as_deref()
    }

    pub fn set_to_asid(&mut self, asid: String) {
        self.to_asid = Some(asid);
    }

    pub fn from_asid(&self) -> Option<&str> {
        self.from_asid.as_deref()
    }

    /// Payload without any XML processing directive, for embedding in an
    /// outer envelope.
    pub fn body(&self) -> &str {
        if let Some(rest) = self.payload.strip_prefix("<?xml ") {
            match rest.find('>') {
                Some(i) => &rest[i + 1..],
                None => &self.payload,
            }
        } else {
            &self.payload
        }
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn make_mime_header(&self) -> String {
        format!(
            "\r\nContent-Id: <{}>\r\nContent-Type: {}\r\nContent-Transfer-Encoding: 8bit\r\n\r\n",
            self.content_id, HL7V3_MIME_TYPE
        )
    }

    /// The manifest reference for this part in the ebXML header.
    pub fn ebxml_reference(&self) -> String {
        format!(
            "<eb:Reference xlink:href=\"cid:{}\">\r\n{}{}{}\r\n</eb:Reference>\r\n",
            self.content_id, SCHEMA_ELEMENT, DESCRIPTION_ELEMENT, PAYLOAD_ELEMENT
        )
    }
}

/// Everything after the blank-line delimiter of a MIME part.
pub(crate) fn strip_mime_headers(part: &str) -> anyhow::Result<&str> {
    if let Some(i) = part.find("\r\n\r\n") {
        return Ok(part[i..].trim());
    }
    // technically wrong, but seen from lax peers
    if let Some(i) = part.find("\n\n") {
        return Ok(part[i..].trim());
    }
    Err(anyhow!("invalid MIME part, no header/body delimiter"))
}

/// Finds `element` then the first quoted value of `attribute` after it.
fn extract_attribute(xml: &str, element: &str, attribute: &str) -> Option<String> {
    let at = xml.find(element)?;
    let rest = &xml[at..];
    let at = rest.find(attribute)?;
    let rest = &rest[at..];
    let q1 = rest.find('"')?;
    let rest = &rest[q1 + 1..];
    let q2 = rest.find('"')?;
    Some(rest[..q2].to_string())
}


#[cfg(test)]
mod test {
    use super::*;

    const PART: &str = "\r\nContent-Id: <x>\r\nContent-Type: application/xml\r\n\r\n\
        <QUPA_IN000006UK02 xmlns=\"urn:hl7-org:v3\">\
        <id root=\"ABCD-1234\"/>\
        <interactionId root=\"2.16.840.1.113883.2.1.3.2.4.12\" extension=\"QUPA_IN000006UK02\"/>\
        <communicationFunctionRcv><device><id extension=\"900000000001\"/></device></communicationFunctionRcv>\
        <communicationFunctionSnd><device><id extension=\"866971180017\"/></device></communicationFunctionSnd>\
        </QUPA_IN000006UK02>";

    #[test]
    fn test_parse_received_part() {
        let m = SpineHL7Message::from_mime_part(PART).unwrap();
        assert_eq!(m.message_id(), "ABCD-1234");
        assert_eq!(m.interaction_id(), Some("QUPA_IN000006UK02"));
        assert_eq!(m.from_asid(), Some("866971180017"));
    }

    #[test]
    fn test_parse_rejects_part_without_id() {
        let r = SpineHL7Message::from_mime_part("\r\n\r\n<nothing/>");
        assert!(r.is_err());
    }

    #[test]
    fn test_body_strips_processing_directive() {
        let m = SpineHL7Message::new("<?xml version=\"1.0\"?><doc/>".to_string());
        assert_eq!(m.body(), "<doc/>");
        let plain = SpineHL7Message::new("<doc/>".to_string());
        assert_eq!(plain.body(), "<doc/>");
    }

    #[test]
    fn test_mime_header_carries_content_id() {
        let m = SpineHL7Message::new("<doc/>".to_string());
        let h = m.make_mime_header();
        assert!(h.contains(&format!("Content-Id: <{}>", m.content_id())));
        assert!(h.ends_with("\r\n\r\n"));
    }
}
