//! TCP client: one outbound channel driven by the dispatch loop.

use {
    crate::{
        buffer::{BufferAllocator, DEFAULT_CHANNEL_BUFFER_SIZE},
        channel::{ChannelSet, TcpChannel},
        dispatch::{DEFAULT_LOOP_INTERVAL, Dispatcher, Signals},
        error::Error,
        handler::{ChannelEvents, ChannelHandler, NoopEvents},
        io_err,
        server::{SocketConfig, force_close},
        state::{EndpointState, StateCell},
        utils::Result,
    },
    log::{debug, info, warn},
    std::{
        fmt, io,
        net::SocketAddr,
        sync::{Arc, OnceLock},
        time::Duration,
    },
    tokio::{
        net::{TcpSocket, TcpStream, ToSocketAddrs, lookup_host},
        runtime::Handle,
    },
};

/// Builder for [`TcpClient`].
#[derive(Clone)]
pub struct ClientBuilder {
    client_handler: Option<Arc<dyn ChannelEvents>>,
    channel_handlers: Vec<Arc<dyn ChannelHandler>>,
    allocator: Option<BufferAllocator>,
    executor: Option<Handle>,
    channel_buffer_size: usize,
    socket_config: Option<SocketConfig>,
    loop_interval: Duration,
    connect_timeout: Option<Duration>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        ClientBuilder {
            client_handler: None,
            channel_handlers: Vec::new(),
            allocator: None,
            executor: None,
            channel_buffer_size: DEFAULT_CHANNEL_BUFFER_SIZE,
            socket_config: None,
            loop_interval: DEFAULT_LOOP_INTERVAL,
            connect_timeout: None,
        }
    }
}

impl ClientBuilder {
    pub fn client_handler(mut self, handler: Arc<dyn ChannelEvents>) -> Self {
        self.client_handler = Some(handler);
        self
    }

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

    pub fn buffer_allocator(mut self, allocator: BufferAllocator) -> Self {
        self.allocator = Some(allocator);
        self
    }

    pub fn executor(mut self, executor: Handle) -> Self {
        self.executor = Some(executor);
        self
    }

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

    pub fn loop_interval(mut self, interval: Duration) -> Self {
        self.loop_interval = interval;
        self
    }

    /// Upper bound for establishing the connection; unbounded by default.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<TcpClient> {
        if self.connect_timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::config("connect timeout must be > 0"));
        }
        let events = self
            .client_handler
            .clone()
            .unwrap_or_else(|| Arc::new(NoopEvents));
        let dispatcher = Dispatcher::new(
            self.channel_handlers.clone(),
            events,
            self.allocator.clone(),
            self.channel_buffer_size,
            self.loop_interval,
            self.executor.clone(),
        )?;
        Ok(TcpClient {
            inner: Arc::new(ClientInner {
                builder: self,
                dispatcher: Arc::new(dispatcher),
                state: StateCell::new(),
                channels: Arc::default(),
                channel: OnceLock::new(),
                signals: Signals::default(),
            }),
        })
    }
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("channel_handlers", &self.channel_handlers.len())
            .field("channel_buffer_size", &self.channel_buffer_size)
            .field("loop_interval", &self.loop_interval)
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

struct ClientInner {
    builder: ClientBuilder,
    dispatcher: Arc<Dispatcher>,
    state: StateCell,
    channels: Arc<ChannelSet>,
    channel: OnceLock<Arc<TcpChannel>>,
    signals: Signals,
}

/// An event-driven TCP client holding a single channel.
///
/// Inbound bytes go through the same handler chain machinery as on the
/// server. The client is closed once its channel is.
#[derive(Clone)]
pub struct TcpClient {
    inner: Arc<ClientInner>,
}

impl TcpClient {
    pub fn builder() -> ClientBuilder {
        ClientBuilder::default()
    }

    /// Connects to `addr` and starts the dispatch loop.
    ///
    /// Every resolved address is tried in order. Only a `Created` client can
    /// be started; a failed start leaves it `Created`.
    pub async fn start<A: ToSocketAddrs>(&self, addr: A) -> Result<()> {
        let inner = &self.inner;
        inner.state.begin_open()?;
        match self.connect(addr).await {
            Ok(channel) => {
                info!("connected: {} -> {}", channel.local_addr(), channel.remote_addr());
                let _ = inner.channel.set(channel.clone());
                inner.channels.insert(channel);
                inner.signals.accept_done.cancel();
                inner.dispatcher.executor.spawn(
                    inner
                        .dispatcher
                        .clone()
                        .run(inner.channels.clone(), inner.signals.clone()),
                );
                inner.state.finish_open();
                Ok(())
            }
            Err(e) => {
                inner.state.abort_open();
                Err(e)
            }
        }
    }

    async fn connect<A: ToSocketAddrs>(&self, addr: A) -> Result<Arc<TcpChannel>> {
        let inner = &self.inner;
        let addrs: Vec<SocketAddr> = lookup_host(addr).await?.collect();
        let socket_config = inner.builder.socket_config.clone();
        let timeout = inner.builder.connect_timeout;
        // The socket must be registered with the executor's reactor.
        let connecting = inner
            .dispatcher
            .executor
            .spawn(connect_any(addrs, socket_config, timeout));
        let stream = match connecting.await {
            Ok(stream) => stream?,
            Err(e) if e.is_panic() => return Err(Error::from_panic(e.into_panic())),
            Err(_) => return Err(Error::state("connect task was cancelled")),
        };
        let channel = TcpChannel::new(
            inner.channels.next_id(),
            stream,
            inner.dispatcher.buffer_size,
        )?;
        Ok(Arc::new(channel))
    }

    /// Waits until the channel is closed.
    pub async fn wait(&self) {
        self.inner.signals.terminated.cancelled().await
    }

    pub async fn start_and_wait<A: ToSocketAddrs>(&self, addr: A) -> Result<()> {
        self.start(addr).await?;
        self.wait().await;
        Ok(())
    }

    /// Closes the channel gracefully, flushing buffered output.
    ///
    /// Waits for the close callback, at most `timeout` if given; on expiry
    /// the channel is dropped as by [`close_now`](TcpClient::close_now).
    /// Closing a closed client does nothing.
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
                    warn!("client channel still open after {:?}, dropping it", timeout);
                    force_close(&inner.channels, &inner.signals);
                }
            }
        }
        inner.state.set_closed();
        Ok(())
    }

    /// Closes the channel immediately, dropping buffered output.
    pub fn close_now(&self) -> Result<()> {
        let inner = &self.inner;
        if !inner.state.check_close()? {
            return Ok(());
        }
        force_close(&inner.channels, &inner.signals);
        inner.state.set_closed();
        Ok(())
    }

    /// Lifecycle state; `Closed` as soon as the channel is gone.
    pub fn state(&self) -> EndpointState {
        match self.inner.state.get() {
            EndpointState::Opened if self.inner.signals.terminated.is_cancelled() => {
                EndpointState::Closed
            }
            state => state,
        }
    }

    pub fn is_opened(&self) -> bool {
        self.state() == EndpointState::Opened
    }

    pub fn is_closed(&self) -> bool {
        self.state() == EndpointState::Closed
    }

    /// The connection, once started.
    pub fn channel(&self) -> Option<Arc<TcpChannel>> {
        self.inner.channel.get().cloned()
    }

    pub fn to_builder(&self) -> ClientBuilder {
        self.inner.builder.clone()
    }
}

impl fmt::Debug for TcpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpClient")
            .field("state", &self.state())
            .field("channel", &self.inner.channel.get())
            .finish()
    }
}

async fn connect_any(
    addrs: Vec<SocketAddr>,
    socket_config: Option<SocketConfig>,
    timeout: Option<Duration>,
) -> Result<TcpStream> {
    let mut last_err = None;
    for addr in addrs {
        match connect_one(addr, socket_config.as_ref(), timeout).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!("connect to {} failed: {}", addr, e);
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| io_err!(InvalidInput, "address resolved to nothing").into()))
}

async fn connect_one(
    addr: SocketAddr,
    socket_config: Option<&SocketConfig>,
    timeout: Option<Duration>,
) -> Result<TcpStream> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    if let Some(config) = socket_config {
        config(&socket)?;
    }
    let connecting = socket.connect(addr);
    let stream = match timeout {
        None => connecting.await?,
        Some(timeout) => tokio::time::timeout(timeout, connecting)
            .await
            .map_err(|_| io_err!(TimedOut, format!("connect to {} timed out", addr)))??,
    };
    Ok(stream)
}
