//! Callback traits and the handler-chain message type.

use {
    crate::{channel::TcpChannel, error::Error, utils::Result},
    async_trait::async_trait,
    bytes::Bytes,
    std::{any::Any, fmt},
};

/// Value passed from one [`ChannelHandler`] to the next.
///
/// The first handler of a chain always receives [`Message::Buffer`]: the
/// channel's unconsumed bytes. A handler consumes input by advancing that
/// buffer (for example with [`Bytes::split_to`]); whatever is left over is
/// kept for the next cycle.
pub enum Message<'a> {
    /// Pending inbound bytes of the channel.
    Buffer(&'a mut Bytes),
    /// Complete frames cut from the inbound bytes.
    Frames(Vec<Bytes>),
    /// Application-defined value.
    Value(Box<dyn Any + Send>),
}

impl<'a> Message<'a> {
    pub fn value<T: Any + Send>(value: T) -> Self {
        Message::Value(Box::new(value))
    }

    /// Extracts an application value of type `T`.
    ///
    /// Returns the message unchanged if it holds anything else.
    pub fn downcast<T: Any + Send>(self) -> std::result::Result<T, Self> {
        match self {
            Message::Value(value) => value.downcast::<T>().map(|v| *v).map_err(Message::Value),
            other => Err(other),
        }
    }

    pub fn into_frames(self) -> Option<Vec<Bytes>> {
        match self {
            Message::Frames(frames) => Some(frames),
            _ => None,
        }
    }
}

impl fmt::Debug for Message<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Buffer(buf) => f.debug_tuple("Buffer").field(&buf.len()).finish(),
            Message::Frames(frames) => f.debug_tuple("Frames").field(&frames.len()).finish(),
            Message::Value(_) => f.write_str("Value(..)"),
        }
    }
}

/// One stage of the protocol-decoding pipeline.
///
/// Handlers are shared by every channel of an endpoint and may run
/// concurrently for different channels, never for the same one.
#[async_trait]
pub trait ChannelHandler: Send + Sync {
    /// Transforms `message` for the next handler.
    ///
    /// `Ok(None)` stops the chain for this cycle without error. `Err` stops
    /// it as well and is reported through [`ChannelEvents::on_exception`].
    async fn on_message<'a>(
        &self,
        channel: &TcpChannel,
        message: Message<'a>,
    ) -> Result<Option<Message<'a>>>;
}

/// Lifecycle callbacks of a channel.
///
/// Every method defaults to a no-op. For one channel the callbacks never run
/// concurrently: open first, then receive cycles, then close. Buffers passed
/// in are the unconsumed bytes at that point.
#[async_trait]
pub trait ChannelEvents: Send + Sync {
    /// The channel was established.
    async fn on_open(&self, _channel: &TcpChannel) {}

    /// The channel was closed locally or by the peer.
    async fn on_close(&self, _channel: &TcpChannel, _buffer: &Bytes) {}

    /// A handler or callback failed for this channel.
    async fn on_exception(&self, _channel: &TcpChannel, _error: &Error, _buffer: &Bytes) {}

    /// Runs at the end of every receive cycle, after the handler chain.
    async fn on_loop(&self, _channel: &TcpChannel, _has_new_data: bool, _buffer: &Bytes) {}
}

/// Server-side callbacks: channel events plus endpoint-level failures.
#[async_trait]
pub trait ServerHandler: ChannelEvents {
    /// The server failed outside of any channel, e.g. on accept.
    async fn on_server_exception(&self, _error: &Error) {}
}

/// Callbacks that ignore every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopEvents;

impl ChannelEvents for NoopEvents {}

impl ServerHandler for NoopEvents {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downcast_returns_value_or_message() {
        let msg = Message::value(42_u32);
        assert_eq!(msg.downcast::<u32>().unwrap(), 42);

        let msg = Message::value("text");
        let msg = msg.downcast::<u32>().unwrap_err();
        assert_eq!(msg.downcast::<&str>().unwrap(), "text");

        let msg = Message::Frames(vec![Bytes::from_static(b"abc")]);
        assert!(msg.downcast::<u32>().is_err());
    }

    #[test]
    fn frames_unwrap() {
        let mut buf = Bytes::from_static(b"xyz");
        assert!(Message::Buffer(&mut buf).into_frames().is_none());
        let frames = Message::Frames(vec![Bytes::from_static(b"a")]).into_frames();
        assert_eq!(frames.unwrap().len(), 1);
    }
}
