pub mod client;
pub mod correlation;
pub mod session;
pub mod transport;
pub mod unary;

pub mod mock;

pub use client::Client;
pub use transport::{Connector, Transport, TransportEvent, WsConnector};
pub use unary::UnaryClient;
