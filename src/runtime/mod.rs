// src/runtime/mod.rs
//! Connection runtime
//!
//! - **Server**: accept loop, one task per connection, graceful drain
//! - **Orchestrator**: per-connection flow from destination lookup to close
//! - **Connection**: connection ids and per-connection context
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ ProxyServer (TcpListener, TaskTracker)       │
//! │   accept ─► ConnectionIds::next()            │
//! │      │                                       │
//! │      ▼  one task per connection              │
//! │   ConnectionHandler::handle                  │
//! │      resolve ─► sniff ─► route               │
//! │                     ├─► PassthroughTunnel    │
//! │                     └─► HttpInterceptor      │
//! │      close (after every spawned task ends)   │
//! └──────────────────────────────────────────────┘
//! ```

pub mod connection;
pub mod orchestrator;
pub mod server;

// Re-export commonly used types
pub use connection::{ConnectionContext, ConnectionIds};
pub use orchestrator::{ConnectionHandler, Route};
pub use server::{bind, ProxyServer};
