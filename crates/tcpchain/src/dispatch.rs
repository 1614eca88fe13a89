//! The dispatch loop shared by servers and clients.
//!
//! One long-lived task sweeps the live channel set. A channel whose lock is
//! held is skipped for the sweep; otherwise exactly one unit of work (the
//! open callback or one receive cycle) is spawned on the worker runtime and
//! the lock travels with it until the work completes.

use {
    crate::{
        buffer::{BufferAllocator, compact, compact_with},
        channel::{ChannelLock, ChannelSet, Probe, TcpChannel},
        error::Error,
        handler::{ChannelEvents, ChannelHandler, Message},
        utils::Result,
    },
    bytes::Bytes,
    futures::FutureExt,
    log::{debug, error, info, warn},
    std::{panic::AssertUnwindSafe, sync::Arc, time::Duration},
    tokio::runtime::{Handle, RuntimeFlavor},
    tokio_util::sync::CancellationToken,
};

/// Default pause between two sweeps over the channel set.
pub const DEFAULT_LOOP_INTERVAL: Duration = Duration::from_millis(1);

/// Shutdown coordination between an endpoint and its loops.
#[derive(Clone, Debug, Default)]
pub(crate) struct Signals {
    /// Graceful close requested: stop accepting, close every channel.
    pub(crate) closing: CancellationToken,
    /// No channel will be added any more.
    pub(crate) accept_done: CancellationToken,
    /// Every channel is gone and the dispatch loop has stopped.
    pub(crate) terminated: CancellationToken,
}

pub(crate) struct Dispatcher {
    pub(crate) handlers: Arc<[Arc<dyn ChannelHandler>]>,
    pub(crate) events: Arc<dyn ChannelEvents>,
    pub(crate) allocator: BufferAllocator,
    pub(crate) buffer_size: usize,
    pub(crate) loop_interval: Duration,
    pub(crate) executor: Handle,
}

/// Marks the close callback as done, even if it panicked.
struct CloseFired<'a>(&'a TcpChannel);

impl Drop for CloseFired<'_> {
    fn drop(&mut self) {
        self.0.set_close_fired();
    }
}

impl Dispatcher {
    /// Validates the endpoint configuration shared by servers and clients.
    pub(crate) fn new(
        handlers: Vec<Arc<dyn ChannelHandler>>,
        events: Arc<dyn ChannelEvents>,
        allocator: Option<BufferAllocator>,
        buffer_size: usize,
        loop_interval: Duration,
        executor: Option<Handle>,
    ) -> Result<Self> {
        if handlers.is_empty() {
            return Err(Error::config("channel handlers are empty"));
        }
        let executor = executor.ok_or_else(|| Error::config("executor is not set"))?;
        if executor.runtime_flavor() == RuntimeFlavor::CurrentThread {
            return Err(Error::config("executor must be a multi-threaded runtime"));
        }
        if buffer_size == 0 {
            return Err(Error::config("channel buffer size must be > 0"));
        }
        if loop_interval.is_zero() {
            return Err(Error::config("loop interval must be > 0"));
        }
        Ok(Dispatcher {
            handlers: handlers.into(),
            events,
            allocator: allocator.unwrap_or_default(),
            buffer_size,
            loop_interval,
            executor,
        })
    }

    pub(crate) async fn run(self: Arc<Self>, channels: Arc<ChannelSet>, signals: Signals) {
        debug!("dispatch loop started");
        loop {
            if signals.terminated.is_cancelled() {
                break;
            }
            let closing = signals.closing.is_cancelled();
            for channel in channels.snapshot() {
                if channel.close_fired() {
                    channels.remove(channel.id());
                    continue;
                }
                if closing {
                    channel.request_close();
                }
                self.poll(&channel);
            }
            if signals.accept_done.is_cancelled() && channels.is_empty() {
                signals.terminated.cancel();
                break;
            }
            tokio::time::sleep(self.loop_interval).await;
        }
        debug!("dispatch loop stopped");
    }

    /// Submits one unit of work for `channel` unless it is busy.
    fn poll(self: &Arc<Self>, channel: &Arc<TcpChannel>) {
        let Some(lock) = channel.try_lock() else {
            return;
        };
        // The close may have finished between the sweep's check and the lock.
        if channel.close_fired() {
            return;
        }
        let this = self.clone();
        if channel.is_opened() {
            self.executor.spawn(async move { this.receive(lock).await });
        } else {
            self.executor.spawn(async move { this.open(lock).await });
        }
    }

    async fn open(&self, lock: ChannelLock) {
        let channel = lock.channel();
        info!("channel {} opened: {}", channel.id(), channel.remote_addr());
        let result = AssertUnwindSafe(self.events.on_open(channel))
            .catch_unwind()
            .await;
        channel.set_opened();
        if let Err(payload) = result {
            self.report(channel, &Error::from_panic(payload), &Bytes::new())
                .await;
        }
    }

    async fn receive(&self, lock: ChannelLock) {
        let channel = lock.channel();
        let err = match AssertUnwindSafe(self.cycle(channel)).catch_unwind().await {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e,
            Err(payload) => Error::from_panic(payload),
        };
        let buffer = channel.pending();
        self.report(channel, &err, &buffer).await;
    }

    /// One receive cycle: read, decode, compact, notify.
    async fn cycle(&self, channel: &TcpChannel) -> Result<()> {
        let pending = channel.pending();
        let room = self.buffer_size.saturating_sub(pending.len());
        let new_bytes = match channel.probe(room) {
            Probe::Closed => {
                self.close(channel).await;
                return Ok(());
            }
            Probe::Empty => {
                self.events.on_loop(channel, false, &pending).await;
                return Ok(());
            }
            Probe::Data(new_bytes) => new_bytes,
        };

        let mut buffer = compact_with(&pending, new_bytes, &self.allocator);
        channel.set_pending(buffer.clone());
        let before = buffer.len();
        let chained = match AssertUnwindSafe(self.run_chain(channel, &mut buffer))
            .catch_unwind()
            .await
        {
            Ok(chained) => chained,
            Err(payload) => {
                // What the chain consumed before unwinding is unknown.
                channel.request_close();
                Err(Error::from_panic(payload))
            }
        };
        let leftover = compact(buffer, before, &self.allocator);
        channel.set_pending(leftover.clone());

        // Nothing more can be read into a full buffer, so the chain would
        // never run again for this channel.
        let stalled = leftover.len() >= self.buffer_size;
        if stalled {
            channel.request_close();
        }
        chained?;
        self.events.on_loop(channel, true, &leftover).await;
        if stalled {
            return Err(Error::BufferFull {
                capacity: self.buffer_size,
            });
        }
        Ok(())
    }

    async fn run_chain(&self, channel: &TcpChannel, buffer: &mut Bytes) -> Result<()> {
        let mut message = Message::Buffer(buffer);
        for handler in self.handlers.iter() {
            match handler.on_message(channel, message).await? {
                Some(next) => message = next,
                None => break,
            }
        }
        Ok(())
    }

    async fn close(&self, channel: &TcpChannel) {
        let _fired = CloseFired(channel);
        channel.release().await;
        let buffer = channel.pending();
        info!(
            "channel {} closed: {} ({} bytes left)",
            channel.id(),
            channel.remote_addr(),
            buffer.len()
        );
        self.events.on_close(channel, &buffer).await;
    }

    async fn report(&self, channel: &TcpChannel, err: &Error, buffer: &Bytes) {
        warn!("channel {} ({}): {}", channel.id(), channel.remote_addr(), err);
        let reported = AssertUnwindSafe(self.events.on_exception(channel, err, buffer))
            .catch_unwind()
            .await;
        if let Err(payload) = reported {
            error!(
                "channel {}: exception callback failed: {}",
                channel.id(),
                Error::from_panic(payload)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{channel::TcpChannel, codec::LengthBasedHandler},
        async_trait::async_trait,
        std::sync::atomic::{AtomicUsize, Ordering},
        tokio::net::{TcpListener, TcpStream},
    };

    #[derive(Default)]
    struct CountCloses(AtomicUsize);

    #[async_trait]
    impl ChannelEvents for CountCloses {
        async fn on_close(&self, _channel: &TcpChannel, _buffer: &Bytes) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn accepted_channel() -> (Arc<TcpChannel>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (server, _) = accepted.unwrap();
        let channel = TcpChannel::new(1, server, 64).unwrap();
        (Arc::new(channel), client.unwrap())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn poll_after_close_fired_does_nothing() {
        let events = Arc::new(CountCloses::default());
        let dispatcher = Arc::new(
            Dispatcher::new(
                vec![Arc::new(LengthBasedHandler::fixed(3).unwrap())],
                events.clone(),
                None,
                64,
                DEFAULT_LOOP_INTERVAL,
                Some(Handle::current()),
            )
            .unwrap(),
        );
        let (channel, peer) = accepted_channel().await;
        channel.set_opened();
        drop(peer);

        for _ in 0..1000 {
            if channel.close_fired() {
                break;
            }
            dispatcher.poll(&channel);
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(channel.close_fired());

        // a sweep that read `close_fired` before the close finished
        for _ in 0..5 {
            while channel.try_lock().is_none() {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            dispatcher.poll(&channel);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(events.0.load(Ordering::SeqCst), 1);
    }
}
