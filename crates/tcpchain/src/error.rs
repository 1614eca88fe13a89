//! Error type shared by servers, clients, channels and handlers.

use std::{any::Any, io, net::SocketAddr};

/// Errors raised by this crate.
///
/// Build and start failures are returned to the caller directly. Everything
/// that happens inside the dispatch loop is delivered through the callback
/// traits instead and never unwinds into the calling task.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid builder configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Operation not allowed in the current lifecycle state.
    #[error("illegal state: {0}")]
    State(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The listening socket failed to accept a connection.
    #[error("failed to accept on {local_addr}: {source}")]
    Accept {
        local_addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("channel is closed")]
    ChannelClosed,

    /// Malformed framing data.
    #[error("invalid frame: {0}")]
    Frame(String),

    /// The channel buffer is full but no handler could consume any of it.
    #[error("channel buffer is full ({capacity} bytes) and holds no complete message")]
    BufferFull { capacity: usize },

    /// Application error returned by a channel handler.
    #[error("handler error: {0}")]
    Handler(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// A callback or handler panicked.
    #[error("callback panicked: {0}")]
    Panic(String),
}

impl Error {
    /// Wraps an application error raised inside a channel handler.
    pub fn handler<E>(err: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Error::Handler(err.into())
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    pub(crate) fn state(msg: impl Into<String>) -> Self {
        Error::State(msg.into())
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_owned()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_owned()
        };
        Error::Panic(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_render_as_text() {
        let err = Error::from_panic(Box::new("boom"));
        assert_eq!(err.to_string(), "callback panicked: boom");

        let err = Error::from_panic(Box::new(String::from("bang")));
        assert!(matches!(err, Error::Panic(ref m) if m == "bang"));

        let err = Error::from_panic(Box::new(42_u32));
        assert!(matches!(err, Error::Panic(_)));
    }

    #[test]
    fn handler_errors_keep_their_source() {
        let err = Error::handler("bad request");
        assert_eq!(err.to_string(), "handler error: bad request");
        assert!(std::error::Error::source(&err).is_some());
    }
}
