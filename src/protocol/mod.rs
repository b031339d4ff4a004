//! Protocol core: framing, message assembly, the inbound and outbound
//! halves, and the endpoint lifecycle machine.

pub mod config;
pub mod endpoint;
pub mod frame;
pub mod message;
pub mod receiver;
pub mod sender;

pub use self::{
    config::EndpointConfig,
    endpoint::{Endpoint, EndpointEvent, ReadyState},
    message::Message,
    receiver::{Event, Receiver},
    sender::Sender,
};

/// Which side of the connection an endpoint is.
///
/// Servers receive masked frames and send unmasked ones; clients the
/// reverse. The receiver and sender enforce both directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// The accepting side.
    Server,
    /// The initiating side.
    Client,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::Client => write!(f, "client"),
        }
    }
}
