// Real-time chat core: gateway transport, conversation synchronizer, and the
// shared data model.
pub mod config;
pub mod error;
pub mod models;
pub mod sync;
pub mod transport;

// Re-export main types for convenience
pub use config::{ChatConfig, SyncConfig, TransportConfig};
pub use error::{ChatError, ErrorKind, Result};
pub use models::*;
pub use sync::{ChatSnapshot, ChatSynchronizer};
pub use transport::{ChatApi, ConnectionState, HttpChatApi, TransportClient};
