//! Terminal chat client for the stock analysis query service.
//!
//! Questions go to the backend over plain HTTP, NDJSON streaming or a
//! reconnecting WebSocket. Answers land in an ordered [`Transcript`] and
//! are revealed progressively unless the user stops them.

pub mod api;
pub mod cli;
pub mod config;
pub mod detect;
pub mod error;
pub mod message;
pub mod mock;
pub mod protocol;
pub mod render;
pub mod session;
pub mod socket;
pub mod sources;
pub mod streaming;
pub mod transcript;

pub use api::QueryClient;
pub use config::ChatConfig;
pub use error::{ChatError, Result};
pub use message::{Message, MessageId, Role};
pub use protocol::{QueryType, Sources};
pub use session::{ChatSession, SendOutcome, SessionEvent, Transport};
pub use transcript::Transcript;
