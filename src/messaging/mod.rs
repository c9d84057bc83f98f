pub mod ack;
pub mod ebxml;
pub mod handlers;
pub mod hl7;
pub mod sendable;
pub mod soap;

pub use ack::EbXmlAcknowledgment;
pub use ebxml::{EbXmlHeader, EbXmlMessage};
pub use hl7::SpineHL7Message;
pub use sendable::{SendState, Sendable, SendableKind};
pub use soap::SpineSoapRequest;
