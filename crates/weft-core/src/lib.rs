pub mod config;
pub mod envelope;
pub mod errors;
pub mod events;

pub use config::{CallOptions, Credentials, PartialPolicy, SessionConfig};
pub use envelope::{RequestEnvelope, ResponseEnvelope};
pub use errors::{ClientError, Result};
pub use events::SessionEvent;
