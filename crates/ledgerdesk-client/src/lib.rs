//! Client for a ledgerdesk server: REST calls, the realtime gateway, and the
//! local state a chat view needs to render a conversation.

pub mod error;
pub mod gateway;
pub mod http;
pub mod session;
pub mod thread;

pub use error::ClientError;
pub use gateway::{Gateway, ListenerId, ReadPosition};
pub use http::HttpBackend;
pub use session::Session;
pub use thread::{Delivery, ThreadEntry, ThreadState};
