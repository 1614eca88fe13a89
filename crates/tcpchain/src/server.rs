//! TCP server: acceptor loop plus the shared dispatch loop.

use {
    crate::{
        buffer::{BufferAllocator, DEFAULT_CHANNEL_BUFFER_SIZE},
        channel::{ChannelSet, TcpChannel},
        dispatch::{DEFAULT_LOOP_INTERVAL, Dispatcher, Signals},
        error::Error,
        handler::{ChannelEvents, ChannelHandler, NoopEvents, ServerHandler},
        io_err,
        state::{EndpointState, StateCell},
        utils::Result,
    },
    async_trait::async_trait,
    bytes::Bytes,
    log::{debug, info, warn},
    std::{
        fmt, io,
        net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs},
        sync::{Arc, OnceLock},
        time::Duration,
    },
    tokio::{
        net::{TcpListener, TcpSocket, TcpStream},
        runtime::Handle,
    },
    tokio_stream::{StreamExt, wrappers::TcpListenerStream},
};

/// Default listen backlog.
pub const DEFAULT_BACKLOG: u32 = 50;

/// Pause after a failed accept so a persistent failure cannot spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Tunes a socket before it binds or connects.
pub type SocketConfig = Arc<dyn Fn(&TcpSocket) -> io::Result<()> + Send + Sync>;

/// Builder for [`TcpServer`].
///
/// The configuration is validated by [`build`](ServerBuilder::build); a
/// built server never changes it. Use [`TcpServer::to_builder`] to derive
/// a differently configured server.
#[derive(Clone)]
pub struct ServerBuilder {
    address: Option<IpAddr>,
    port: u16,
    backlog: u32,
    server_handler: Option<Arc<dyn ServerHandler>>,
    channel_handlers: Vec<Arc<dyn ChannelHandler>>,
    allocator: Option<BufferAllocator>,
    executor: Option<Handle>,
    channel_buffer_size: usize,
    socket_config: Option<SocketConfig>,
    loop_interval: Duration,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        ServerBuilder {
            address: None,
            port: 0,
            backlog: DEFAULT_BACKLOG,
            server_handler: None,
            channel_handlers: Vec::new(),
            allocator: None,
            executor: None,
            channel_buffer_size: DEFAULT_CHANNEL_BUFFER_SIZE,
            socket_config: None,
            loop_interval: DEFAULT_LOOP_INTERVAL,
        }
    }
}

impl ServerBuilder {
    /// Listening port; 0 lets the system pick one.
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Listening address; all IPv4 interfaces by default.
    pub fn address(mut self, address: IpAddr) -> Self {
        self.address = Some(address);
        self
    }

    /// Resolves `host` and listens on its first address.
    pub fn host_name(mut self, host: &str) -> Result<Self> {
        let addr = (host, 0)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io_err!(NotFound, format!("{} did not resolve", host)))?;
        self.address = Some(addr.ip());
        Ok(self)
    }

    /// Maximum number of pending connections.
    pub fn backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn server_handler(mut self, handler: Arc<dyn ServerHandler>) -> Self {
        self.server_handler = Some(handler);
        self
    }

    /// Appends a handler to the end of the chain.
    pub fn add_channel_handler(mut self, handler: Arc<dyn ChannelHandler>) -> Self {
        self.channel_handlers.push(handler);
        self
    }

    pub fn add_channel_handlers<I>(mut self, handlers: I) -> Self
    where
        I: IntoIterator<Item = Arc<dyn ChannelHandler>>,
    {
        self.channel_handlers.extend(handlers);
        self
    }

    /// Allocator used when channel buffers are compacted.
    pub fn buffer_allocator(mut self, allocator: BufferAllocator) -> Self {
        self.allocator = Some(allocator);
        self
    }

    /// Runtime running the loops and every callback; must be multi-threaded.
    pub fn executor(mut self, executor: Handle) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Upper bound of unconsumed bytes per channel.
    pub fn channel_buffer_size(mut self, size: usize) -> Self {
        self.channel_buffer_size = size;
        self
    }

    pub fn socket_config<F>(mut self, config: F) -> Self
    where
        F: Fn(&TcpSocket) -> io::Result<()> + Send + Sync + 'static,
    {
        self.socket_config = Some(Arc::new(config));
        self
    }

    /// Pause between two sweeps of the dispatch loop.
    pub fn loop_interval(mut self, interval: Duration) -> Self {
        self.loop_interval = interval;
        self
    }

    pub fn build(self) -> Result<TcpServer> {
        if self.backlog == 0 {
            return Err(Error::config("backlog must be > 0"));
        }
        let handler: Arc<dyn ServerHandler> = self
            .server_handler
            .clone()
            .unwrap_or_else(|| Arc::new(NoopEvents));
        let dispatcher = Dispatcher::new(
            self.channel_handlers.clone(),
            Arc::new(ServerEvents(handler.clone())),
            self.allocator.clone(),
            self.channel_buffer_size,
            self.loop_interval,
            self.executor.clone(),
        )?;
        Ok(TcpServer {
            inner: Arc::new(ServerInner {
                builder: self,
                handler,
                dispatcher: Arc::new(dispatcher),
                state: StateCell::new(),
                channels: Arc::default(),
                signals: Signals::default(),
                local_addr: OnceLock::new(),
            }),
        })
    }
}

impl fmt::Debug for ServerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerBuilder")
            .field("address", &self.address)
            .field("port", &self.port)
            .field("backlog", &self.backlog)
            .field("channel_handlers", &self.channel_handlers.len())
            .field("channel_buffer_size", &self.channel_buffer_size)
            .field("loop_interval", &self.loop_interval)
            .finish_non_exhaustive()
    }
}

/// Routes channel events of a server to its [`ServerHandler`].
struct ServerEvents(Arc<dyn ServerHandler>);

#[async_trait]
impl ChannelEvents for ServerEvents {
    async fn on_open(&self, channel: &TcpChannel) {
        self.0.on_open(channel).await
    }

    async fn on_close(&self, channel: &TcpChannel, buffer: &Bytes) {
        self.0.on_close(channel, buffer).await
    }

    async fn on_exception(&self, channel: &TcpChannel, error: &Error, buffer: &Bytes) {
        self.0.on_exception(channel, error, buffer).await
    }

    async fn on_loop(&self, channel: &TcpChannel, has_new_data: bool, buffer: &Bytes) {
        self.0.on_loop(channel, has_new_data, buffer).await
    }
}

struct ServerInner {
    builder: ServerBuilder,
    handler: Arc<dyn ServerHandler>,
    dispatcher: Arc<Dispatcher>,
    state: StateCell,
    channels: Arc<ChannelSet>,
    signals: Signals,
    local_addr: OnceLock<SocketAddr>,
}

impl ServerInner {
    fn bind(&self) -> Result<TcpListener> {
        let b = &self.builder;
        let ip = b.address.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let addr = SocketAddr::new(ip, b.port);
        let _enter = self.dispatcher.executor.enter();
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        #[cfg(unix)]
        socket.set_reuseaddr(true)?;
        if let Some(config) = &b.socket_config {
            config(&socket)?;
        }
        socket.bind(addr)?;
        Ok(socket.listen(b.backlog)?)
    }
}

/// An event-driven TCP server.
///
/// Each accepted connection becomes a [`TcpChannel`]. Inbound bytes flow
/// through the channel handler chain; lifecycle events go to the
/// [`ServerHandler`]. Cloning yields another handle to the same server.
///
/// ```no_run
/// use std::sync::Arc;
/// use tcpchain::{LengthBasedHandler, TcpServer};
///
/// # async fn run() -> tcpchain::Result<()> {
/// let server = TcpServer::builder()
///     .port(7000)
///     .executor(tokio::runtime::Handle::current())
///     .add_channel_handler(Arc::new(LengthBasedHandler::length_field(0, 2)?))
///     .build()?;
/// server.start()?;
/// server.wait().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct TcpServer {
    inner: Arc<ServerInner>,
}

impl TcpServer {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::default()
    }

    /// Binds the listening socket and starts the acceptor and dispatch loops.
    ///
    /// Returns once the socket is listening. Only a `Created` server can be
    /// started; a failed start leaves it `Created`.
    pub fn start(&self) -> Result<()> {
        let inner = &self.inner;
        inner.state.begin_open()?;
        let listener = match inner.bind() {
            Ok(listener) => listener,
            Err(e) => {
                inner.state.abort_open();
                return Err(e);
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                inner.state.abort_open();
                return Err(e.into());
            }
        };
        let _ = inner.local_addr.set(local_addr);
        info!("listening on {}", local_addr);

        let executor = &inner.dispatcher.executor;
        let acceptor = Acceptor {
            local_addr,
            channels: inner.channels.clone(),
            buffer_size: inner.dispatcher.buffer_size,
            handler: inner.handler.clone(),
            signals: inner.signals.clone(),
        };
        executor.spawn(acceptor.run(listener));
        executor.spawn(
            inner
                .dispatcher
                .clone()
                .run(inner.channels.clone(), inner.signals.clone()),
        );
        inner.state.finish_open();
        Ok(())
    }

    /// Waits until the server and all of its channels are closed.
    pub async fn wait(&self) {
        self.inner.signals.terminated.cancelled().await
    }

    /// Starts the server and waits until it is closed.
    pub async fn start_and_wait(&self) -> Result<()> {
        self.start()?;
        self.wait().await;
        Ok(())
    }

    /// Closes gracefully.
    ///
    /// Stops accepting, lets in-flight work finish, flushes and closes every
    /// channel, then waits for the close callbacks, at most `timeout` if
    /// given. Channels still open when the timeout expires are closed as by
    /// [`close_now`](TcpServer::close_now). Closing a closed server does
    /// nothing.
    pub async fn close(&self, timeout: Option<Duration>) -> Result<()> {
        let inner = &self.inner;
        if !inner.state.check_close()? {
            return Ok(());
        }
        inner.signals.closing.cancel();
        let finished = inner.signals.terminated.cancelled();
        match timeout {
            None => finished.await,
            Some(timeout) => {
                if tokio::time::timeout(timeout, finished).await.is_err() {
                    warn!(
                        "server {:?}: {} channels still open after {:?}, dropping them",
                        inner.local_addr.get(),
                        inner.channels.len(),
                        timeout
                    );
                    force_close(&inner.channels, &inner.signals);
                }
            }
        }
        inner.state.set_closed();
        Ok(())
    }

    /// Closes the listening socket and every channel without waiting.
    ///
    /// Buffered output is dropped and close callbacks are not guaranteed to
    /// run. Closing a closed server does nothing.
    pub fn close_now(&self) -> Result<()> {
        let inner = &self.inner;
        if !inner.state.check_close()? {
            return Ok(());
        }
        force_close(&inner.channels, &inner.signals);
        inner.state.set_closed();
        Ok(())
    }

    pub fn state(&self) -> EndpointState {
        self.inner.state.get()
    }

    pub fn is_opened(&self) -> bool {
        self.state() == EndpointState::Opened
    }

    pub fn is_closed(&self) -> bool {
        self.state() == EndpointState::Closed
    }

    /// Address the server listens on; known once started.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.inner
            .local_addr
            .get()
            .copied()
            .ok_or_else(|| Error::state("server has not been started"))
    }

    pub fn port(&self) -> Result<u16> {
        self.local_addr().map(|addr| addr.port())
    }

    /// Number of live channels.
    pub fn channel_count(&self) -> usize {
        self.inner.channels.len()
    }

    /// A builder holding this server's configuration.
    pub fn to_builder(&self) -> ServerBuilder {
        self.inner.builder.clone()
    }
}

impl fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpServer")
            .field("state", &self.state())
            .field("local_addr", &self.inner.local_addr.get())
            .field("channels", &self.channel_count())
            .finish()
    }
}

/// Turns accepted connections into channels of one server.
struct Acceptor {
    local_addr: SocketAddr,
    channels: Arc<ChannelSet>,
    buffer_size: usize,
    handler: Arc<dyn ServerHandler>,
    signals: Signals,
}

impl Acceptor {
    async fn run(self, listener: TcpListener) {
        let mut incoming = TcpListenerStream::new(listener);
        loop {
            let next = tokio::select! {
                _ = self.signals.closing.cancelled() => break,
                next = incoming.next() => next,
            };
            match next {
                Some(accepted) => self.admit(accepted).await,
                None => break,
            }
        }
        drop(incoming);
        info!("stopped accepting on {}", self.local_addr);
        self.signals.accept_done.cancel();
    }

    /// Registers one accept result; a failure is reported, never fatal.
    async fn admit(&self, accepted: io::Result<TcpStream>) {
        let result = accepted.and_then(|stream| {
            TcpChannel::new(self.channels.next_id(), stream, self.buffer_size)
        });
        match result {
            Ok(channel) => {
                debug!("accepted: {:?}", channel.remote_addr());
                let channel = Arc::new(channel);
                self.channels.insert(channel.clone());
                // close_now cancels `terminated` before draining the set
                if self.signals.terminated.is_cancelled() {
                    channel.close_now();
                    self.channels.remove(channel.id());
                }
            }
            Err(source) => {
                let err = Error::Accept {
                    local_addr: self.local_addr,
                    source,
                };
                warn!("{}", err);
                let handler = self.handler.clone();
                tokio::spawn(async move { handler.on_server_exception(&err).await });
                tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
            }
        }
    }
}

/// Drops every channel and stops the loops without waiting.
pub(crate) fn force_close(channels: &ChannelSet, signals: &Signals) {
    signals.closing.cancel();
    signals.terminated.cancel();
    for channel in channels.snapshot() {
        channel.close_now();
    }
    channels.clear();
}
