#![forbid(unsafe_code)]
//! Event-driven TCP server and client framework for Rust.
//!
//! This crate provides tokio-based TCP endpoints that push inbound bytes
//! through a chain of protocol handlers and report connection lifecycle
//! events through callbacks.
//!
//! # Overview
//!
//! An endpoint ([`TcpServer`] or [`TcpClient`]) owns a set of channels. Each
//! [`TcpChannel`] is one live connection. A single dispatch task sweeps the
//! channel set; for every channel that is not busy it spawns one unit of
//! work on the worker runtime:
//!
//! 1. **Open**: the first unit of work of a channel runs
//!    [`ChannelEvents::on_open`]
//! 2. **Receive**: new bytes are appended to the channel's unconsumed bytes
//!    and handed to the handler chain; whatever the chain leaves unconsumed
//!    is kept for the next cycle
//! 3. **Close**: end of stream, a local close or an I/O failure runs
//!    [`ChannelEvents::on_close`] exactly once and the channel is forgotten
//!
//! At most one unit of work runs per channel at any time, so callbacks and
//! handlers never race on the same channel.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use tcpchain::{ChannelHandler, LengthBasedHandler, Message, Result, TcpChannel, TcpServer};
//!
//! /// Sends every frame back to its sender.
//! struct Echo;
//!
//! #[async_trait]
//! impl ChannelHandler for Echo {
//!     async fn on_message<'a>(
//!         &self,
//!         channel: &TcpChannel,
//!         message: Message<'a>,
//!     ) -> Result<Option<Message<'a>>> {
//!         for frame in message.into_frames().unwrap_or_default() {
//!             channel.send(&frame).await?;
//!         }
//!         channel.flush().await?;
//!         Ok(None)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let server = TcpServer::builder()
//!         .port(7000)
//!         .executor(tokio::runtime::Handle::current())
//!         .add_channel_handler(Arc::new(LengthBasedHandler::length_field(0, 2)?))
//!         .add_channel_handler(Arc::new(Echo))
//!         .channel_buffer_size(64 * 1024)
//!         .build()?;
//!     server.start_and_wait().await
//! }
//! ```
//!
//! # Handler Chain
//!
//! The first handler receives [`Message::Buffer`], a mutable view of the
//! channel's pending bytes, and consumes input by advancing it. Each
//! handler returns the message for the next one, or `None` to stop the
//! chain for this cycle. [`LengthBasedHandler`] is the built-in framing
//! stage.
//!
//! **Backpressure:** a channel never holds more than its configured buffer
//! size of unconsumed bytes; reading pauses until handlers consume some. A
//! full buffer that no handler can consume is reported as
//! [`Error::BufferFull`] and the channel is closed.
//!
//! # Error Handling
//!
//! Build and start errors are returned directly. Errors and panics raised
//! inside handlers or callbacks are delivered to
//! [`ChannelEvents::on_exception`]; failures of the listening socket go to
//! [`ServerHandler::on_server_exception`].
//!
//! # Runtime
//!
//! Endpoints need a multi-threaded tokio runtime, passed to the builder as a
//! [`tokio::runtime::Handle`].
//!
//! # Safety
//!
//! This crate forbids unsafe code (`#![forbid(unsafe_code)]`).
pub mod buffer;
pub mod channel;
pub mod client;
pub mod codec;
mod dispatch;
pub mod error;
pub mod handler;
pub mod server;
pub mod state;
#[macro_use]
pub mod utils;

pub use crate::buffer::{BufferAllocator, DEFAULT_CHANNEL_BUFFER_SIZE};
pub use crate::channel::TcpChannel;
pub use crate::client::{ClientBuilder, TcpClient};
pub use crate::codec::LengthBasedHandler;
pub use crate::dispatch::DEFAULT_LOOP_INTERVAL;
pub use crate::error::Error;
pub use crate::handler::{ChannelEvents, ChannelHandler, Message, NoopEvents, ServerHandler};
pub use crate::server::{DEFAULT_BACKLOG, ServerBuilder, SocketConfig, TcpServer};
pub use crate::state::EndpointState;
pub use crate::utils::Result;
