//! Exclusive access to one serial channel.
//!
//! A background reader task moves incoming bytes into an inbound buffer and
//! bumps a `watch` counter. Writers and readers go through a scoped
//! [`ChannelLock`], so a sequence such as "write a command, read its echo"
//! appears atomic to the peer.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::sync::{Mutex, MutexGuard, watch};
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::log::{self, LogCategories};
use crate::transport::Conduit;
use crate::transport::serial::{ChannelConfig, open_port};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Bytes received but not yet read by anyone, plus an arrival counter.
pub(crate) struct Inbound {
    buffer: std::sync::Mutex<BytesMut>,
    arrivals: watch::Sender<u64>,
    open: AtomicBool,
}

impl Inbound {
    pub(crate) fn new() -> Self {
        let (arrivals, _) = watch::channel(0);
        Self {
            buffer: std::sync::Mutex::new(BytesMut::new()),
            arrivals,
            open: AtomicBool::new(true),
        }
    }

    pub(crate) fn push(&self, data: &[u8]) {
        self.buffer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .extend_from_slice(data);
        self.arrivals.send_modify(|n| *n = n.wrapping_add(1));
    }

    pub(crate) fn take(&self) -> Bytes {
        self.buffer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .split()
            .freeze()
    }

    pub(crate) fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.arrivals.send_modify(|n| *n = n.wrapping_add(1));
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<u64> {
        self.arrivals.subscribe()
    }
}

/// Owns exclusive access to one physical channel.
pub struct TransportGuard {
    name: String,
    log: LogCategories,
    write_timeout: Duration,
    writer: Mutex<Option<BoxedWriter>>,
    inbound: Arc<Inbound>,
    reader_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TransportGuard {
    /// Opens the serial port described by `config`.
    ///
    /// Waits the settle delay and discards startup noise before the reader
    /// task is installed.
    pub async fn open(config: &ChannelConfig) -> Result<Self> {
        tracing::info!("opening serial port: {}", config.port);
        let stream = open_port(config)?;
        let guard = Self::attach(config.port.clone(), stream, config).await;
        tracing::info!("serial port open: {}", config.port);
        Ok(guard)
    }

    /// Takes ownership of an already connected byte stream.
    ///
    /// Applies the same settle and drain sequence as [`TransportGuard::open`].
    pub async fn attach<S>(name: impl Into<String>, mut stream: S, config: &ChannelConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let name = name.into();

        tokio::time::sleep(config.settle_delay).await;
        let drained = drain_noise(&mut stream, config.drain_window).await;
        if drained > 0 {
            tracing::debug!(channel = %name, "drained {} bytes of startup noise", drained);
        }

        let (reader, writer) = tokio::io::split(stream);
        let inbound = Arc::new(Inbound::new());
        let reader_task = tokio::spawn(run_read_loop(
            reader,
            Arc::clone(&inbound),
            name.clone(),
            config.log,
        ));

        Self {
            name,
            log: config.log,
            write_timeout: config.write_timeout,
            writer: Mutex::new(Some(Box::new(writer))),
            inbound,
            reader_task: std::sync::Mutex::new(Some(reader_task)),
        }
    }

    /// Returns the channel name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the log categories this channel was opened with.
    #[must_use]
    pub const fn log_categories(&self) -> LogCategories {
        self.log
    }

    /// Acquires exclusive access to the channel.
    ///
    /// The lock is released when the returned guard drops, including on
    /// early returns and errors.
    pub async fn lock(&self) -> Result<ChannelLock<'_>> {
        let writer = self.writer.lock().await;
        if writer.is_none() || !self.inbound.is_open() {
            return Err(Error::NotOpen);
        }
        Ok(ChannelLock {
            guard: self,
            writer,
        })
    }

    /// Writes `data` under a short-lived lock.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        self.lock().await?.write(data).await
    }

    /// Reads whatever is buffered under a short-lived lock.
    pub async fn read_available(&self) -> Result<Bytes> {
        Ok(self.lock().await?.read_available())
    }

    /// Returns a receiver that changes whenever bytes arrive or the channel closes.
    #[must_use]
    pub fn data_ready(&self) -> watch::Receiver<u64> {
        self.inbound.subscribe()
    }

    /// Returns true until the channel is closed or the peer hangs up.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.inbound.is_open()
    }

    /// Closes the channel. Closing twice is a no-op.
    pub async fn close(&self) {
        let mut writer = self.writer.lock().await;
        if let Some(mut w) = writer.take() {
            tracing::info!(channel = %self.name, "closing channel");
            if let Err(e) = w.shutdown().await {
                tracing::debug!(channel = %self.name, "shutdown after close: {}", e);
            }
        }
        self.abort_reader();
        self.inbound.close();
    }

    fn abort_reader(&self) {
        if let Some(task) = self
            .reader_task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

impl Drop for TransportGuard {
    fn drop(&mut self) {
        self.abort_reader();
    }
}

/// Scoped exclusive access to a [`TransportGuard`].
pub struct ChannelLock<'a> {
    guard: &'a TransportGuard,
    writer: MutexGuard<'a, Option<BoxedWriter>>,
}

impl ChannelLock<'_> {
    /// Writes all of `data` and flushes.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        let writer = self.writer.as_mut().ok_or(Error::NotOpen)?;
        log::raw(self.guard.log.raw_bytes, "tx", &self.guard.name, data);

        let write = async {
            writer.write_all(data).await?;
            writer.flush().await
        };
        match tokio::time::timeout(self.guard.write_timeout, write).await {
            Ok(result) => result.map_err(Error::Io),
            Err(_) => Err(Error::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "write timed out",
            ))),
        }
    }

    /// Takes whatever bytes are buffered without waiting.
    pub fn read_available(&mut self) -> Bytes {
        self.guard.inbound.take()
    }

    /// Returns the name of the locked channel.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.guard.name
    }
}

impl Conduit for TransportGuard {
    fn name(&self) -> &str {
        &self.name
    }

    fn send(&self, data: Bytes) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move { self.write(&data).await })
    }

    fn receive(&self) -> Pin<Box<dyn Future<Output = Result<Bytes>> + Send + '_>> {
        Box::pin(self.read_available())
    }

    fn data_ready(&self) -> watch::Receiver<u64> {
        TransportGuard::data_ready(self)
    }

    fn is_open(&self) -> bool {
        TransportGuard::is_open(self)
    }

    fn log_categories(&self) -> LogCategories {
        self.log
    }
}

/// Reads and discards bytes until `window` has passed.
async fn drain_noise<S>(stream: &mut S, window: Duration) -> usize
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; 256];
    let mut total = 0usize;
    let deadline = tokio::time::Instant::now() + window;

    while tokio::time::Instant::now() < deadline {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let slice = remaining.min(Duration::from_millis(20));
        match tokio::time::timeout(slice, stream.read(&mut buf)).await {
            Ok(Ok(n)) if n > 0 => total += n,
            Ok(Ok(_) | Err(_)) => break,
            Err(_) => {}
        }
    }
    total
}

/// Moves bytes from the stream into the inbound buffer until EOF or error.
async fn run_read_loop<S>(
    mut reader: ReadHalf<S>,
    inbound: Arc<Inbound>,
    name: String,
    log: LogCategories,
) where
    S: AsyncRead + AsyncWrite,
{
    let mut buf = [0u8; 1024];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!(channel = %name, "peer closed channel");
                break;
            }
            Ok(n) => {
                log::raw(log.raw_bytes, "rx", &name, &buf[..n]);
                inbound.push(&buf[..n]);
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
            Err(e) => {
                tracing::error!(channel = %name, "read error: {}", e);
                break;
            }
        }
    }

    inbound.close();
}
