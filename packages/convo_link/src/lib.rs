//! Connection and streaming-protocol core for an embeddable conversational
//! client: a WebSocket signaling channel with typed frames, token-stream
//! reassembly, conversation-thread routing, an optional WebRTC media session
//! and a single state machine orchestrating all of it.
//!
//! The entry point is [`Connector`]: configure it, subscribe to its event
//! stream, then drive it with `connect` / `send_text` / `start_media` /
//! `switch_thread` / `disconnect`.
//!
//! ```rust,no_run
//! use convo_link::{ConnectionEvent, Connector, LinkConfig};
//!
//! # async fn run() -> convo_link::Result<()> {
//! let config = LinkConfig::new("wss://example.com/chat", "https://example.com/voice");
//! let connector = Connector::builder(config).spawn();
//! let mut events = connector.subscribe();
//!
//! // Sending transparently connects and waits for the session identifier.
//! let message_id = connector.send_text("hello", None).await?;
//! println!("sent {message_id}");
//!
//! while let Ok(event) = events.recv().await {
//!     if let ConnectionEvent::MessageReceived(message) = event {
//!         println!("{:?}: {}", message.role, message.content);
//!         break;
//!     }
//! }
//! connector.disconnect().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod media;
pub mod protocol;
pub mod reassembly;
pub mod signaling;
pub mod threads;

pub use config::LinkConfig;
pub use connection::{
    ConnectionEvent, ConnectionState, Connector, ConnectorBuilder, MarkupHandlers, MediaState,
    StatusSnapshot,
};
pub use error::{LinkError, Result};
pub use media::{AudioCapture, CaptureFactory, MediaHandle, SideChannelEvent};
pub use protocol::{ContentKind, Message, Role};

#[cfg(test)]
mod e2e_tests;
