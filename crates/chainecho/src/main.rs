use {
    async_trait::async_trait,
    bytes::Bytes,
    clap::Parser,
    log::{info, warn},
    std::{sync::Arc, time::Duration},
    tcpchain::*,
    tokio::{runtime::Handle, sync::mpsc},
};

mod utils;
use crate::utils::*;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Sends every frame back to its sender.
struct Echo;

#[async_trait]
impl ChannelHandler for Echo {
    async fn on_message<'a>(
        &self,
        channel: &TcpChannel,
        message: Message<'a>,
    ) -> Result<Option<Message<'a>>> {
        for frame in message.into_frames().unwrap_or_default() {
            channel.send(&frame).await?;
        }
        channel.flush().await?;
        Ok(None)
    }
}

/// Hands reply frames over to the sending task.
struct Replies(mpsc::UnboundedSender<Bytes>);

#[async_trait]
impl ChannelHandler for Replies {
    async fn on_message<'a>(
        &self,
        _channel: &TcpChannel,
        message: Message<'a>,
    ) -> Result<Option<Message<'a>>> {
        for frame in message.into_frames().unwrap_or_default() {
            // the receiver is gone once the sender stopped waiting
            let _ = self.0.send(frame);
        }
        Ok(None)
    }
}

struct Events;

#[async_trait]
impl ChannelEvents for Events {
    async fn on_open(&self, channel: &TcpChannel) {
        info!("{}: connected", channel.remote_addr());
    }

    async fn on_close(&self, channel: &TcpChannel, buffer: &Bytes) {
        if buffer.is_empty() {
            info!("{}: disconnected", channel.remote_addr());
        } else {
            warn!(
                "{}: disconnected with {} bytes of a partial frame",
                channel.remote_addr(),
                buffer.len()
            );
        }
    }

    async fn on_exception(&self, channel: &TcpChannel, error: &Error, _buffer: &Bytes) {
        warn!("{}: {}", channel.remote_addr(), error);
    }
}

#[async_trait]
impl ServerHandler for Events {
    async fn on_server_exception(&self, error: &Error) {
        warn!("{}", error);
    }
}

#[derive(Debug, clap::Parser)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Size of the big-endian length prefix: 1, 2 or 4 bytes
    #[arg(long, global = true, default_value_t = 2)]
    width: usize,

    /// Maximum unconsumed bytes held per connection
    #[arg(long, global = true, default_value_t = DEFAULT_CHANNEL_BUFFER_SIZE)]
    buffer_size: usize,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Echo every frame back to its sender
    Serve {
        /// tcp!address!port
        address: String,

        /// Maximum number of pending connections
        #[arg(long, default_value_t = DEFAULT_BACKLOG)]
        backlog: u32,
    },
    /// Send each message as one frame and print the replies
    Send {
        /// tcp!address!port
        address: String,

        #[arg(required = true)]
        messages: Vec<String>,

        /// Seconds to wait for the connection
        #[arg(long, default_value_t = 5)]
        connect_timeout: u64,
    },
}

async fn serve(address: &str, backlog: u32, width: usize, buffer_size: usize) -> Result<i32> {
    let (host, port) = parse_tcp_address(address)?;
    let server = TcpServer::builder()
        .host_name(host)?
        .port(port)
        .backlog(backlog)
        .executor(Handle::current())
        .server_handler(Arc::new(Events))
        .add_channel_handler(Arc::new(LengthBasedHandler::length_field(0, width)?))
        .add_channel_handler(Arc::new(Echo))
        .channel_buffer_size(buffer_size)
        .build()?;
    server.start()?;

    println!("[*] Ready to accept clients: {}", server.local_addr()?);
    tokio::select! {
        _ = server.wait() => {}
        interrupted = tokio::signal::ctrl_c() => {
            interrupted?;
            info!("interrupted, closing {} connections", server.channel_count());
            server.close(Some(CLOSE_TIMEOUT)).await?;
        }
    }
    Ok(0)
}

async fn send(
    address: &str,
    messages: &[String],
    connect_timeout: u64,
    width: usize,
    buffer_size: usize,
) -> Result<i32> {
    let (host, port) = parse_tcp_address(address)?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let client = TcpClient::builder()
        .executor(Handle::current())
        .client_handler(Arc::new(Events))
        .add_channel_handler(Arc::new(LengthBasedHandler::length_field(0, width)?))
        .add_channel_handler(Arc::new(Replies(tx)))
        .channel_buffer_size(buffer_size)
        .connect_timeout(Duration::from_secs(connect_timeout))
        .build()?;
    client.start((host, port)).await?;

    let channel = client
        .channel()
        .ok_or_else(|| io_err!(NotConnected, "client has no channel"))?;
    for message in messages {
        channel.send(encode_frame(width, message.as_bytes())?).await?;
    }
    channel.flush().await?;

    let mut received = 0;
    while received < messages.len() {
        tokio::select! {
            reply = rx.recv() => match reply {
                Some(frame) => {
                    println!("{}", String::from_utf8_lossy(&frame[width..]));
                    received += 1;
                }
                None => break,
            },
            _ = client.wait() => break,
        }
    }
    client.close(Some(CLOSE_TIMEOUT)).await?;

    if received < messages.len() {
        eprintln!("{} of {} replies received", received, messages.len());
        return Ok(1);
    }
    Ok(0)
}

async fn chainecho_main(
    Cli {
        command,
        width,
        buffer_size,
    }: Cli,
) -> Result<i32> {
    match command {
        Command::Serve { address, backlog } => serve(&address, backlog, width, buffer_size).await,
        Command::Send {
            address,
            messages,
            connect_timeout,
        } => send(&address, &messages, connect_timeout, width, buffer_size).await,
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let exit_code = chainecho_main(Cli::parse()).await.unwrap_or_else(|e| {
        eprintln!("Error: {:?}", e);
        -1
    });

    std::process::exit(exit_code);
}
