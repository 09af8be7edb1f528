//! Real-time chat relay.
//!
//! Browser clients connect over WebSocket, receive the recent message
//! history once, and then exchange chat messages and typing presence through
//! a single broadcast [`hub`]. State lives only in process memory.
//!
//! ```no_run
//! use chat_relay::config::RelayConfig;
//!
//! # async fn run() -> Result<(), chat_relay::error::RelayError> {
//! let server = chat_relay::web::Server::bind(&RelayConfig::default()).await?;
//! server.run().await
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod history;
pub mod hub;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod web;

pub use config::{RelayConfig, MAX_HISTORY};
pub use error::{ProtocolError, RelayError};
pub use hub::{Hub, HubHandle};
pub use protocol::{ClientEvent, Message, ServerEvent};
