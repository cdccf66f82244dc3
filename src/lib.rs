//! Realtime plumbing for the Murmur client: a named-event bus over one
//! websocket, and the conversation sync that reconciles optimistic sends
//! with server pushes.

pub mod api;
pub mod app;
pub mod bus;
pub mod error;
pub mod identity;
pub mod storage;
pub mod sync;
pub mod utils;

pub use app::{App, AppConfig};
pub use bus::{ChatTransport, ConnectionState, EventBus, ReconnectPolicy, Subscription};
pub use error::{Error, Result};
pub use sync::{ConversationSync, Reconciliation, SyncPolicy};
