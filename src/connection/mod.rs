pub mod handler;
pub mod listener;
pub mod resolver;
pub mod security;
pub mod session;
pub mod transmitter;

pub use resolver::{EndpointResolver, StaticEndpointResolver, TransmissionDetails};
pub use session::SessionManager;
