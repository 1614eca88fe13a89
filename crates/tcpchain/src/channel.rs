//! One live TCP connection and its buffering state.

use {
    crate::{
        error::Error,
        utils::{Result, unpoison},
    },
    bytes::{Buf, BufMut, Bytes, BytesMut},
    log::{debug, warn},
    std::{
        collections::HashMap,
        fmt, io,
        net::SocketAddr,
        sync::{
            Arc, Mutex, RwLock,
            atomic::{AtomicBool, AtomicU64, Ordering},
        },
        time::Duration,
    },
    tokio::{
        io::{AsyncRead, AsyncWriteExt, BufWriter},
        net::{
            TcpStream,
            tcp::{OwnedReadHalf, OwnedWriteHalf},
        },
        sync::Mutex as AsyncMutex,
    },
};

/// Upper bound for flushing output while the dispatch loop tears a channel down.
const RELEASE_FLUSH_TIMEOUT: Duration = Duration::from_secs(3);

struct Reader {
    half: OwnedReadHalf,
    scratch: BytesMut,
}

#[derive(Default)]
struct Flags {
    /// Held while a unit of work for this channel is in flight.
    lock: AtomicBool,
    /// The open callback has completed.
    opened: AtomicBool,
    /// The connection was shut down locally or by the peer.
    closed: AtomicBool,
    /// The owning endpoint asked for a graceful close.
    close_requested: AtomicBool,
    /// Buffered output must be dropped instead of flushed.
    discard: AtomicBool,
    /// The close callback has completed; the channel can be forgotten.
    close_fired: AtomicBool,
}

/// Result of a non-blocking read attempt.
#[derive(Debug)]
pub(crate) enum Probe {
    Data(Bytes),
    Empty,
    Closed,
}

/// A TCP connection between the local endpoint and a remote peer.
///
/// Channels are handed to every callback and handler. Output written with
/// the `send*` family is buffered until [`flush`](TcpChannel::flush) or a
/// graceful [`close`](TcpChannel::close).
pub struct TcpChannel {
    id: u64,
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    buffer_capacity: usize,
    reader: Mutex<Option<Reader>>,
    writer: AsyncMutex<Option<BufWriter<OwnedWriteHalf>>>,
    pending: Mutex<Bytes>,
    flags: Flags,
}

impl TcpChannel {
    pub(crate) fn new(id: u64, stream: TcpStream, buffer_capacity: usize) -> io::Result<Self> {
        let local_addr = stream.local_addr()?;
        let remote_addr = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        Ok(TcpChannel {
            id,
            local_addr,
            remote_addr,
            buffer_capacity,
            reader: Mutex::new(Some(Reader {
                half: read_half,
                scratch: BytesMut::new(),
            })),
            writer: AsyncMutex::new(Some(BufWriter::new(write_half))),
            pending: Mutex::new(Bytes::new()),
            flags: Flags::default(),
        })
    }

    /// Identifier unique within the owning endpoint.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Maximum number of unconsumed bytes this channel holds between cycles.
    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    /// Whether the open callback has run for this channel.
    pub fn is_opened(&self) -> bool {
        self.flags.opened.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.flags.closed.load(Ordering::Acquire)
    }

    /// Writes `data` into the output buffer.
    pub async fn send(&self, data: impl AsRef<[u8]>) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = self.open_writer(&mut guard)?;
        writer.write_all(data.as_ref()).await?;
        Ok(())
    }

    /// Writes the remaining bytes of `data` into the output buffer.
    pub async fn send_buf<B: Buf + Send>(&self, mut data: B) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = self.open_writer(&mut guard)?;
        writer.write_all_buf(&mut data).await?;
        Ok(())
    }

    /// Streams everything `reader` yields into the output buffer.
    ///
    /// Returns the number of bytes copied.
    pub async fn send_from<R>(&self, reader: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + Send + ?Sized,
    {
        let mut guard = self.writer.lock().await;
        let writer = self.open_writer(&mut guard)?;
        let copied = tokio::io::copy(reader, writer).await?;
        Ok(copied)
    }

    /// Pushes buffered output to the peer.
    pub async fn flush(&self) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = self.open_writer(&mut guard)?;
        writer.flush().await?;
        Ok(())
    }

    pub async fn send_and_flush(&self, data: impl AsRef<[u8]>) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = self.open_writer(&mut guard)?;
        writer.write_all(data.as_ref()).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Flushes buffered output and shuts the connection down.
    ///
    /// With a timeout, flushing gives up once it expires and the connection
    /// is shut down anyway. Closing a closed channel does nothing.
    pub async fn close(&self, timeout: Option<Duration>) -> Result<()> {
        if self.flags.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let writer = self.writer.lock().await.take();
        let Some(mut writer) = writer else {
            return Ok(());
        };
        match timeout {
            None => writer.shutdown().await?,
            Some(timeout) => match tokio::time::timeout(timeout, writer.shutdown()).await {
                Ok(res) => res?,
                Err(_) => warn!(
                    "channel {} ({}): flush did not finish within {:?}",
                    self.id, self.remote_addr, timeout
                ),
            },
        }
        Ok(())
    }

    /// Shuts the connection down without flushing buffered output.
    pub fn close_now(&self) {
        self.flags.discard.store(true, Ordering::Release);
        if self.flags.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // A writer busy in another task is dropped by the dispatch loop instead.
        if let Ok(mut guard) = self.writer.try_lock() {
            guard.take();
        }
    }

    fn open_writer<'a>(
        &self,
        guard: &'a mut Option<BufWriter<OwnedWriteHalf>>,
    ) -> Result<&'a mut BufWriter<OwnedWriteHalf>> {
        if self.is_closed() {
            return Err(Error::ChannelClosed);
        }
        guard.as_mut().ok_or(Error::ChannelClosed)
    }

    pub(crate) fn try_lock(self: &Arc<Self>) -> Option<ChannelLock> {
        self.flags
            .lock
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ChannelLock(self.clone()))
    }

    pub(crate) fn set_opened(&self) {
        self.flags.opened.store(true, Ordering::Release);
    }

    pub(crate) fn request_close(&self) {
        self.flags.close_requested.store(true, Ordering::Release);
    }

    pub(crate) fn close_fired(&self) -> bool {
        self.flags.close_fired.load(Ordering::Acquire)
    }

    pub(crate) fn set_close_fired(&self) {
        self.flags.close_fired.store(true, Ordering::Release);
    }

    /// Current unconsumed bytes.
    pub(crate) fn pending(&self) -> Bytes {
        unpoison(self.pending.lock()).clone()
    }

    /// Replaces the unconsumed bytes. Only the lock holder calls this.
    pub(crate) fn set_pending(&self, buffer: Bytes) {
        *unpoison(self.pending.lock()) = buffer;
    }

    /// Reads whatever is immediately available, at most `room` bytes.
    pub(crate) fn probe(&self, room: usize) -> Probe {
        if self.is_closed() || self.flags.close_requested.load(Ordering::Acquire) {
            return Probe::Closed;
        }
        if room == 0 {
            return Probe::Empty;
        }
        let mut guard = unpoison(self.reader.lock());
        let Some(reader) = guard.as_mut() else {
            return Probe::Closed;
        };
        reader.scratch.reserve(room);
        let mut limited = (&mut reader.scratch).limit(room);
        match reader.half.try_read_buf(&mut limited) {
            Ok(0) => Probe::Closed,
            Ok(_) => Probe::Data(reader.scratch.split().freeze()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Probe::Empty,
            Err(e) => {
                debug!("channel {} ({}): read failed: {}", self.id, self.remote_addr, e);
                Probe::Closed
            }
        }
    }

    /// Tears the socket down, flushing buffered output unless discarded.
    pub(crate) async fn release(&self) {
        self.flags.closed.store(true, Ordering::Release);
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if !self.flags.discard.load(Ordering::Acquire) {
                match tokio::time::timeout(RELEASE_FLUSH_TIMEOUT, writer.shutdown()).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!(
                        "channel {} ({}): shutdown failed: {}",
                        self.id, self.remote_addr, e
                    ),
                    Err(_) => warn!(
                        "channel {} ({}): dropping unflushed output",
                        self.id, self.remote_addr
                    ),
                }
            }
        }
        unpoison(self.reader.lock()).take();
    }
}

impl fmt::Debug for TcpChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpChannel")
            .field("id", &self.id)
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .field("opened", &self.is_opened())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Exclusive right to process one channel; released on drop.
pub(crate) struct ChannelLock(Arc<TcpChannel>);

impl ChannelLock {
    pub(crate) fn channel(&self) -> &Arc<TcpChannel> {
        &self.0
    }
}

impl Drop for ChannelLock {
    fn drop(&mut self) {
        self.0.flags.lock.store(false, Ordering::Release);
    }
}

/// Live channels of one endpoint.
#[derive(Default)]
pub(crate) struct ChannelSet {
    next_id: AtomicU64,
    channels: RwLock<HashMap<u64, Arc<TcpChannel>>>,
}

impl ChannelSet {
    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn insert(&self, channel: Arc<TcpChannel>) {
        unpoison(self.channels.write()).insert(channel.id(), channel);
    }

    pub(crate) fn remove(&self, id: u64) {
        unpoison(self.channels.write()).remove(&id);
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<TcpChannel>> {
        unpoison(self.channels.read()).values().cloned().collect()
    }

    pub(crate) fn clear(&self) {
        unpoison(self.channels.write()).clear();
    }

    pub(crate) fn len(&self) -> usize {
        unpoison(self.channels.read()).len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use {super::*, tokio::io::AsyncReadExt, tokio::net::TcpListener};

    async fn pair(capacity: usize) -> (Arc<TcpChannel>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (server, _) = accepted.unwrap();
        let channel = TcpChannel::new(7, server, capacity).unwrap();
        (Arc::new(channel), client.unwrap())
    }

    async fn read_until_data(channel: &TcpChannel, room: usize) -> Bytes {
        for _ in 0..500 {
            match channel.probe(room) {
                Probe::Data(bytes) => return bytes,
                Probe::Empty => tokio::time::sleep(Duration::from_millis(2)).await,
                Probe::Closed => panic!("unexpected close"),
            }
        }
        panic!("no data arrived");
    }

    #[tokio::test]
    async fn probe_reads_at_most_room() {
        let (channel, mut peer) = pair(16).await;
        assert!(matches!(channel.probe(16), Probe::Empty));

        peer.write_all(b"0123456789").await.unwrap();
        let first = read_until_data(&channel, 4).await;
        assert_eq!(&first[..], b"0123");
        let rest = read_until_data(&channel, 16).await;
        assert_eq!(&rest[..], b"456789");
    }

    #[tokio::test]
    async fn probe_reports_peer_close() {
        let (channel, peer) = pair(16).await;
        drop(peer);
        let mut closed = false;
        for _ in 0..500 {
            match channel.probe(16) {
                Probe::Closed => {
                    closed = true;
                    break;
                }
                _ => tokio::time::sleep(Duration::from_millis(2)).await,
            }
        }
        assert!(closed);
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_dropped() {
        let (channel, _peer) = pair(16).await;
        let lock = channel.try_lock().unwrap();
        assert!(channel.try_lock().is_none());
        drop(lock);
        assert!(channel.try_lock().is_some());
    }

    #[tokio::test]
    async fn graceful_close_flushes_buffered_output() {
        let (channel, mut peer) = pair(16).await;
        channel.send(b"buffered").await.unwrap();
        channel.close(None).await.unwrap();
        assert!(channel.is_closed());
        assert!(matches!(channel.send(b"late").await, Err(Error::ChannelClosed)));
        channel.close(None).await.unwrap();

        let mut received = Vec::new();
        peer.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"buffered");
    }

    #[tokio::test]
    async fn close_now_is_idempotent() {
        let (channel, mut peer) = pair(16).await;
        channel.close_now();
        channel.close_now();
        assert!(channel.is_closed());
        assert!(matches!(channel.probe(16), Probe::Closed));

        let mut received = Vec::new();
        peer.read_to_end(&mut received).await.unwrap();
        assert!(received.is_empty());
    }

    #[test]
    fn channel_set_tracks_members() {
        let set = ChannelSet::default();
        assert!(set.is_empty());
        assert_eq!(set.next_id(), 0);
        assert_eq!(set.next_id(), 1);
    }
}
