//! # relay-transport
//!
//! Socket abstraction for the Relay connection lifecycle.
//!
//! A [`Socket`] splits into a [`FrameSink`] and a [`FrameSource`] so the
//! read and write paths of a connection can run as independent tasks.
//! Frames are modelled by [`WireFrame`], which keeps data frames and the
//! ping/pong/close control frames apart.
//!
//! Adapters:
//!
//! - **axum** `WebSocket` - server-side upgrades from the HTTP router
//! - **memory** - an in-process socket pair for tests
//!
//! ```rust,ignore
//! use relay_transport::{FrameSource, Socket, WireFrame};
//!
//! async fn drain(socket: impl Socket) {
//!     let (_sink, mut source) = socket.split();
//!     while let Ok(Some(frame)) = source.recv().await {
//!         if let WireFrame::Text(text) = frame {
//!             println!("{text}");
//!         }
//!     }
//! }
//! ```

pub mod memory;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use traits::{close_code, FrameSink, FrameSource, Socket, TransportError, WireFrame};
