//! Integration points for received messages and delivery outcomes.
//!
//! One instance of a handler is registered per SOAP action and reused for
//! every matching message, so implementations must be thread safe and
//! re-entrant.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::info;

use crate::messaging::ebxml::EbXmlMessage;
use crate::messaging::sendable::Sendable;
use crate::messaging::soap::SpineSoapRequest;

/// Called with a received (and acknowledged) asynchronous ebXML message.
#[async_trait]
pub trait EbXmlHandler: Send + Sync + 'static {
    async fn handle(&self, message: &EbXmlMessage) -> anyhow::Result<()>;
}

/// Called with a synchronous request once its response has been received.
/// The response body is in the request's send state.
#[async_trait]
pub trait SynchronousResponseHandler: Send + Sync + 'static {
    async fn handle(&self, request: &SpineSoapRequest) -> anyhow::Result<()>;
}

/// Called when a reliable message runs out of retries or persist duration
/// without an acknowledgment. This is in addition to the standard expiry
/// behaviour of saving the message to the expired directory; the usual
/// reason to register one is to feed a workflow that must know about
/// undeliverable messages.
#[async_trait]
pub trait ExpiredMessageHandler: Send + Sync + 'static {
    async fn handle_expiry(&self, message: &dyn Sendable) -> anyhow::Result<()>;
}

/// Records requests and their synchronous responses as they cross the wire,
/// for audit or test capture.
pub trait SessionCaptor: Send + Sync + 'static {
    fn capture(&self, message: &dyn Sendable);
}

/// Default ebXML handler: writes the HL7 payload to the received directory,
/// named by message id.
pub struct FileSaveEbXmlHandler {
    directory: PathBuf,
}

impl FileSaveEbXmlHandler {
    pub fn new(directory: PathBuf) -> FileSaveEbXmlHandler {
        FileSaveEbXmlHandler { directory }
    }
}

#[async_trait]
impl EbXmlHandler for FileSaveEbXmlHandler {
    async fn handle(&self, message: &EbXmlMessage) -> anyhow::Result<()> {
        let path = self
            .directory
            .join(format!("{}.message", message.header().message_id()));
        let payload = match message.hl7() {
            Some(hl7) => hl7.payload().to_string(),
            None => String::new(),
        };
        tokio::fs::write(&path, payload).await?;
        info!("saved received message {} to {}", message.header().message_id(), path.display());
        Ok(())
    }
}

/// Default handler for synchronous responses: writes the response body to
/// the received directory, named by the request's message id.
pub struct FileSaveSynchronousResponseHandler {
    directory: PathBuf,
}

impl FileSaveSynchronousResponseHandler {
    pub fn new(directory: PathBuf) -> FileSaveSynchronousResponseHandler {
        FileSaveSynchronousResponseHandler { directory }
    }
}

#[async_trait]
impl SynchronousResponseHandler for FileSaveSynchronousResponseHandler {
    async fn handle(&self, request: &SpineSoapRequest) -> anyhow::Result<()> {
        let Some(response) = request.state().synchronous_response() else {
            return Ok(());
        };
        let id = request.message_id().unwrap_or_else(|| "unidentified".to_string());
        let path = self.directory.join(format!("{}.response", id));
        tokio::fs::write(&path, response).await?;
        info!("saved synchronous response for {} to {}", id, path.display());
        Ok(())
    }
}

/// Discards synchronous responses. For callers that hold on to their request
/// and read the response out of its send state themselves.
pub struct NullSynchronousResponseHandler;

#[async_trait]
impl SynchronousResponseHandler for NullSynchronousResponseHandler {
    async fn handle(&self, _request: &SpineSoapRequest) -> anyhow::Result<()> {
        Ok(())
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use crate::connection::resolver::TransmissionDetails;
    use crate::messaging::hl7::SpineHL7Message;

    fn soap_request() -> SpineSoapRequest {
        let details = TransmissionDetails {
            org_code: "X09".to_string(),
            party_key: "X09-9999999".to_string(),
            cpa_id: "cpa".to_string(),
            service: "urn:nhs:names:services:pdsquery".to_string(),
            interaction_id: "QUPA_IN040000UK32".to_string(),
            svc_ia: "urn:nhs:names:services:pdsquery:QUPA_IN040000UK32".to_string(),
            soap_actor: String::new(),
            asids: vec!["900000000001".to_string()],
            url: "https://spine.example/sync".to_string(),
            sync_reply: "none".to_string(),
            duplicate_elimination: "never".to_string(),
            ack_requested: "never".to_string(),
            retries: 0,
            retry_interval: 0,
            persist_duration: 0,
        };
        SpineSoapRequest::new(
            &details,
            SpineHL7Message::new("<x/>".to_string()),
            "127.0.0.1",
            "866971180017",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_file_save_synchronous_response_handler() {
        let dir = tempfile::tempdir().unwrap();
        let req = soap_request();
        req.state().set_synchronous_response("<response/>".to_string());

        let handler = FileSaveSynchronousResponseHandler::new(dir.path().to_path_buf());
        handler.handle(&req).await.unwrap();

        let expected = dir
            .path()
            .join(format!("{}.response", req.message_id().unwrap()));
        let written = tokio::fs::read_to_string(&expected).await.unwrap();
        assert_eq!(written, "<response/>");
    }

    #[tokio::test]
    async fn test_file_save_handler_skips_missing_response() {
        let dir = tempfile::tempdir().unwrap();
        let req = soap_request();
        let handler = FileSaveSynchronousResponseHandler::new(dir.path().to_path_buf());
        handler.handle(&req).await.unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
