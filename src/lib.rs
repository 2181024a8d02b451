// Re-export needed modules for testing
pub mod api;      // REST client
pub mod channel;  // realtime socket channel
pub mod credentials;
pub mod error;
pub mod models;
pub mod store;    // synchronization store

// Re-export main types for convenience
pub use api::{ChatApi, HttpApi, MessageQuery};
pub use channel::{ConnectionState, RealtimeChannel, SocketHandle, SocketTransport, WsTransport};
pub use error::{ChatError, Result};
pub use models::*;
pub use store::{ChatSnapshot, ChatState, ChatStore};
