//! Command/response exchanges.
//!
//! [`CommandEngine::send_and_wait`] writes one command, waits for the
//! conduit's data-ready signal, reads, and lets a [`ReplyDecoder`] judge the
//! bytes. A silent peer gets the identical command again up to the retry
//! budget. Every failure comes back as an [`Outcome`], never as an `Err`.

mod reply;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, LinkError, Result};
use crate::log::{self, LogCategories};
use crate::transport::Conduit;

pub use reply::{
    BytesSink, CodeReply, FragmentSink, MarkupReply, ReplyCode, ReplyDecoder, Response, Verdict,
};

/// Default wait for a reply per attempt.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Default number of resends after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Defaults for [`CommandEngine::execute`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Wait per attempt.
    pub timeout: Duration,
    /// Resends after the first attempt.
    pub max_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl EngineConfig {
    /// Sets the per-attempt timeout.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the retry budget.
    #[must_use]
    pub const fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }
}

/// Terminal result of one command exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The device accepted the command.
    Success(Response),
    /// The device answered and refused.
    Rejected(Response),
    /// The device stayed silent through every attempt.
    TimedOut {
        /// Number of times the command was written.
        attempts: u32,
    },
    /// The channel or link failed underneath the exchange.
    LinkFailure(LinkError),
    /// The caller cancelled the exchange.
    Cancelled,
}

impl Outcome {
    /// Returns true for [`Outcome::Success`].
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Returns the device's response, if it gave one.
    #[must_use]
    pub const fn response(&self) -> Option<&Response> {
        match self {
            Self::Success(response) | Self::Rejected(response) => Some(response),
            _ => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::Rejected(_) => "rejected",
            Self::TimedOut { .. } => "timed out",
            Self::LinkFailure(_) => "link failure",
            Self::Cancelled => "cancelled",
        }
    }
}

impl From<Verdict> for Outcome {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Accept(response) => Self::Success(response),
            Verdict::Reject(response) => Self::Rejected(response),
        }
    }
}

/// Maps a conduit error onto the outcome the caller sees.
fn failure(error: Error) -> Outcome {
    match error {
        Error::Link(LinkError::Cancelled) => Outcome::Cancelled,
        Error::Link(e) => Outcome::LinkFailure(e),
        Error::Frame(e) => Outcome::LinkFailure(LinkError::Frame(e)),
        Error::NotOpen => Outcome::LinkFailure(LinkError::Closed),
        other => Outcome::LinkFailure(LinkError::Transport {
            message: other.to_string(),
        }),
    }
}

/// Runs one command exchange at a time over a [`Conduit`].
///
/// The decoder lives inside the exchange lock, so its unread buffer is only
/// touched by the exchange in flight or by [`CommandEngine::drain_unsolicited`].
pub struct CommandEngine {
    conduit: Arc<dyn Conduit>,
    config: EngineConfig,
    log: LogCategories,
    exchange: tokio::sync::Mutex<Box<dyn ReplyDecoder>>,
    cancel: Mutex<Option<CancellationToken>>,
}

impl CommandEngine {
    /// Creates an engine that decodes replies with `decoder`.
    pub fn new(
        conduit: Arc<dyn Conduit>,
        decoder: impl ReplyDecoder + 'static,
        config: EngineConfig,
    ) -> Self {
        let log = conduit.log_categories();
        Self {
            conduit,
            config,
            log,
            exchange: tokio::sync::Mutex::new(Box::new(decoder)),
            cancel: Mutex::new(None),
        }
    }

    /// Returns the conduit commands are written to.
    #[must_use]
    pub fn conduit(&self) -> &Arc<dyn Conduit> {
        &self.conduit
    }

    /// Returns the engine defaults.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Sends `command` with the configured timeout and retry budget.
    pub async fn execute(&self, command: impl Into<Bytes>) -> Outcome {
        self.send_and_wait(command, self.config.timeout, self.config.max_retries)
            .await
    }

    /// Sends `command` and waits up to `timeout` per attempt for its reply.
    ///
    /// A silent attempt is followed by an identical resend while retries
    /// remain. The call returns within `timeout * (max_retries + 1)` plus the
    /// time spent writing.
    pub async fn send_and_wait(
        &self,
        command: impl Into<Bytes>,
        timeout: Duration,
        max_retries: u32,
    ) -> Outcome {
        let command = command.into();
        let mut decoder = self.exchange.lock().await;
        let token = self.arm_cancel();

        let started = Instant::now();
        let outcome = self
            .run(&mut **decoder, &command, timeout, max_retries, &token)
            .await;
        self.disarm_cancel();

        if self.log.application {
            tracing::debug!(
                target: log::APP,
                channel = self.conduit.name(),
                len = command.len(),
                elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                "command {}",
                outcome.label()
            );
        }
        outcome
    }

    /// Cancels the exchange in flight.
    ///
    /// The waiting caller gets [`Outcome::Cancelled`]; no further resend or
    /// link-level retransmission happens. Returns false if nothing was waiting.
    pub fn cancel(&self) -> bool {
        let cancelled = match self.cancel.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        };
        if cancelled {
            self.conduit.cancel();
        }
        cancelled
    }

    /// Hands bytes that arrived outside any exchange to the decoder's sink.
    ///
    /// Waits for an exchange in flight to finish first. Returns the number of
    /// bytes drained.
    pub async fn drain_unsolicited(&self) -> Result<usize> {
        let mut decoder = self.exchange.lock().await;
        let bytes = self.conduit.receive().await?;
        if !bytes.is_empty() {
            decoder.unsolicited(&bytes);
        }
        Ok(bytes.len())
    }

    async fn run(
        &self,
        decoder: &mut dyn ReplyDecoder,
        command: &Bytes,
        timeout: Duration,
        max_retries: u32,
        token: &CancellationToken,
    ) -> Outcome {
        // Whatever is already buffered predates this command.
        match self.conduit.receive().await {
            Ok(stale) if !stale.is_empty() => decoder.unsolicited(&stale),
            Ok(_) => {}
            Err(e) => return failure(e),
        }

        let attempts = max_retries.saturating_add(1);
        for attempt in 1..=attempts {
            // Subscribe before writing so a fast reply cannot be missed.
            let mut ready = self.conduit.data_ready();
            ready.borrow_and_update();

            if token.is_cancelled() {
                return Outcome::Cancelled;
            }
            if attempt > 1 && self.log.application {
                tracing::debug!(
                    target: log::APP,
                    channel = self.conduit.name(),
                    "no reply, resending ({}/{})",
                    attempt,
                    attempts
                );
            }
            if let Err(e) = self.conduit.send(command.clone()).await {
                return failure(e);
            }
            if token.is_cancelled() {
                return Outcome::Cancelled;
            }

            let deadline = Instant::now() + timeout;
            loop {
                let expired = tokio::select! {
                    biased;
                    () = token.cancelled() => return Outcome::Cancelled,
                    changed = tokio::time::timeout_at(deadline, ready.changed()) => match changed {
                        Ok(Ok(())) => false,
                        Ok(Err(_)) => return Outcome::LinkFailure(LinkError::Closed),
                        Err(_) => true,
                    },
                };

                // Bytes landing as the deadline fires are read before resending.
                let bytes = match self.conduit.receive().await {
                    Ok(bytes) => bytes,
                    Err(e) => return failure(e),
                };
                if let Some(verdict) = decoder.feed(&bytes) {
                    return verdict.into();
                }
                if expired {
                    break;
                }
            }
        }

        Outcome::TimedOut { attempts }
    }

    fn arm_cancel(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.cancel.lock().unwrap_or_else(PoisonError::into_inner) = Some(token.clone());
        token
    }

    fn disarm_cancel(&self) {
        self.cancel.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::watch;
    use crate::link::{ArqConfig, ArqLink, Frame, FrameDecoder};
    use crate::message::Fragment;
    use crate::transport::{ChannelConfig, TransportGuard};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};

    const fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    fn quiet_channel() -> ChannelConfig {
        ChannelConfig::new("meter")
            .settle_delay(Duration::ZERO)
            .drain_window(Duration::ZERO)
    }

    async fn raw_engine(decoder: impl ReplyDecoder + 'static) -> (Arc<CommandEngine>, DuplexStream) {
        let (local, remote) = duplex(1024);
        let guard = TransportGuard::attach("meter", local, &quiet_channel()).await;
        let engine = CommandEngine::new(Arc::new(guard), decoder, EngineConfig::default());
        (Arc::new(engine), remote)
    }

    async fn read_command(peer: &mut DuplexStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        peer.read_exact(&mut buf).await.unwrap();
        buf
    }

    fn spawn_exchange(
        engine: &Arc<CommandEngine>,
        command: &'static [u8],
        timeout: Duration,
        retries: u32,
    ) -> tokio::task::JoinHandle<Outcome> {
        let engine = Arc::clone(engine);
        tokio::spawn(async move { engine.send_and_wait(command, timeout, retries).await })
    }

    #[tokio::test]
    async fn test_ok_code_is_success() {
        let (engine, mut peer) = raw_engine(CodeReply::new()).await;

        let exchange = spawn_exchange(&engine, b"\x30", ms(500), 0);
        assert_eq!(read_command(&mut peer, 1).await, b"\x30");
        peer.write_all(&[0x00]).await.unwrap();

        assert_eq!(
            exchange.await.unwrap(),
            Outcome::Success(Response::Code(ReplyCode::Ok))
        );
    }

    #[tokio::test]
    async fn test_error_code_is_rejected() {
        let (engine, mut peer) = raw_engine(CodeReply::new()).await;

        let exchange = spawn_exchange(&engine, b"\x40", ms(500), 0);
        read_command(&mut peer, 1).await;
        peer.write_all(&[0x08]).await.unwrap();

        let outcome = exchange.await.unwrap();
        assert_eq!(outcome, Outcome::Rejected(Response::Code(ReplyCode::Dlk)));
        assert_eq!(outcome.response(), Some(&Response::Code(ReplyCode::Dlk)));
    }

    #[tokio::test]
    async fn test_silent_peer_times_out_within_bound() {
        let (engine, mut peer) = raw_engine(CodeReply::new()).await;
        let started = Instant::now();

        let exchange = spawn_exchange(&engine, b"\x20", ms(40), 2);
        for _ in 0..3 {
            assert_eq!(read_command(&mut peer, 1).await, b"\x20");
        }

        assert_eq!(exchange.await.unwrap(), Outcome::TimedOut { attempts: 3 });
        let elapsed = started.elapsed();
        assert!(elapsed >= ms(120), "returned early after {elapsed:?}");
        assert!(elapsed < ms(120) + ms(400), "overran bound: {elapsed:?}");
    }

    #[tokio::test]
    async fn test_reply_on_second_attempt() {
        let (engine, mut peer) = raw_engine(CodeReply::new()).await;

        let exchange = spawn_exchange(&engine, b"\x21", ms(50), 3);
        read_command(&mut peer, 1).await;
        read_command(&mut peer, 1).await;
        peer.write_all(&[0x00]).await.unwrap();

        assert!(exchange.await.unwrap().is_success());
    }

    #[tokio::test]
    async fn test_unrecognized_byte_keeps_waiting() {
        let (engine, mut peer) = raw_engine(CodeReply::new()).await;

        let exchange = spawn_exchange(&engine, b"\x22", ms(60), 0);
        read_command(&mut peer, 1).await;
        peer.write_all(&[0xEE]).await.unwrap();

        assert_eq!(exchange.await.unwrap(), Outcome::TimedOut { attempts: 1 });
    }

    /// Conduit whose reply shows up without a data-ready signal.
    struct UnsignalledReply {
        ready: watch::Sender<u64>,
        inbox: std::sync::Mutex<Vec<u8>>,
        sends: AtomicU32,
    }

    impl Conduit for UnsignalledReply {
        fn name(&self) -> &str {
            "meter"
        }

        fn send(&self, _data: Bytes) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                if self.sends.fetch_add(1, Ordering::SeqCst) == 0 {
                    self.inbox.lock().unwrap().push(0x00);
                }
                Ok(())
            })
        }

        fn receive(&self) -> Pin<Box<dyn Future<Output = Result<Bytes>> + Send + '_>> {
            Box::pin(async move { Ok(Bytes::from(std::mem::take(&mut *self.inbox.lock().unwrap()))) })
        }

        fn data_ready(&self) -> watch::Receiver<u64> {
            self.ready.subscribe()
        }

        fn is_open(&self) -> bool {
            true
        }

        fn log_categories(&self) -> LogCategories {
            LogCategories::default()
        }
    }

    #[tokio::test]
    async fn test_reply_racing_the_deadline_is_read() {
        let conduit = Arc::new(UnsignalledReply {
            ready: watch::channel(0).0,
            inbox: std::sync::Mutex::new(Vec::new()),
            sends: AtomicU32::new(0),
        });
        let engine = CommandEngine::new(
            Arc::clone(&conduit) as Arc<dyn Conduit>,
            CodeReply::new(),
            EngineConfig::default(),
        );

        let outcome = engine.send_and_wait(&b"\x30"[..], ms(30), 2).await;
        assert_eq!(outcome, Outcome::Success(Response::Code(ReplyCode::Ok)));
        assert_eq!(conduit.sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_closed_channel_is_link_failure() {
        let (engine, peer) = raw_engine(CodeReply::new()).await;
        drop(peer);
        let mut ready = engine.conduit().data_ready();
        while engine.conduit().is_open() {
            let _ = tokio::time::timeout(ms(50), ready.changed()).await;
        }

        assert_eq!(
            engine.send_and_wait(&b"\x30"[..], ms(100), 1).await,
            Outcome::LinkFailure(LinkError::Closed)
        );
    }

    #[tokio::test]
    async fn test_cancel_releases_caller() {
        let (engine, mut peer) = raw_engine(CodeReply::new()).await;

        let exchange = spawn_exchange(&engine, b"\x23", Duration::from_secs(10), 5);
        read_command(&mut peer, 1).await;
        assert!(engine.cancel());

        assert_eq!(exchange.await.unwrap(), Outcome::Cancelled);
        assert!(!engine.cancel());
    }

    #[tokio::test]
    async fn test_markup_reply_with_unsolicited_push() {
        let pushed = Arc::new(std::sync::Mutex::new(Vec::<String>::new()));
        let sink = Arc::clone(&pushed);
        let decoder = MarkupReply::new("reply")
            .reject_on("fault")
            .with_sink(move |f: Fragment| sink.lock().unwrap().push(f.into_string()));
        let (engine, mut peer) = raw_engine(decoder).await;

        let exchange = spawn_exchange(&engine, b"<read id='7'/>", ms(500), 0);
        read_command(&mut peer, 14).await;
        peer.write_all(b"<alarm/><reply><v>").await.unwrap();
        tokio::time::sleep(ms(20)).await;
        peer.write_all(b"42</v></reply>").await.unwrap();

        match exchange.await.unwrap() {
            Outcome::Success(Response::Markup(f)) => assert_eq!(f.as_str(), "<reply><v>42</v></reply>"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(*pushed.lock().unwrap(), ["<alarm/>"]);
    }

    #[tokio::test]
    async fn test_drain_unsolicited_between_exchanges() {
        let pushed = Arc::new(std::sync::Mutex::new(Vec::<String>::new()));
        let sink = Arc::clone(&pushed);
        let decoder = MarkupReply::new("reply")
            .with_sink(move |f: Fragment| sink.lock().unwrap().push(f.into_string()));
        let (engine, mut peer) = raw_engine(decoder).await;

        let mut ready = engine.conduit().data_ready();
        peer.write_all(b"<event n='1'/>").await.unwrap();
        tokio::time::timeout(ms(500), ready.changed()).await.unwrap().unwrap();

        assert_eq!(engine.drain_unsolicited().await.unwrap(), 14);
        assert_eq!(*pushed.lock().unwrap(), ["<event n='1'/>"]);
    }

    #[tokio::test]
    async fn test_exchange_over_arq_link() {
        let (local, mut remote) = duplex(1024);
        let guard = Arc::new(TransportGuard::attach("radio", local, &quiet_channel()).await);
        let link = ArqLink::new(guard, ArqConfig::default()).unwrap();
        let engine = Arc::new(CommandEngine::new(
            Arc::new(link),
            MarkupReply::new("reply"),
            EngineConfig::default(),
        ));

        let exchange = spawn_exchange(&engine, b"<ping/>", ms(500), 0);

        let mut decoder = FrameDecoder::new();
        let data = loop {
            if let Some(frame) = decoder.decode() {
                break frame;
            }
            let mut buf = [0u8; 256];
            let n = remote.read(&mut buf).await.unwrap();
            decoder.feed(&buf[..n]);
        };
        assert_eq!(&data.payload[..], b"<ping/>");
        remote
            .write_all(&Frame::ack(0, data.sequence).encode().unwrap())
            .await
            .unwrap();
        remote
            .write_all(&Frame::data(0, 0, Bytes::from_static(b"<reply/>")).encode().unwrap())
            .await
            .unwrap();

        assert!(exchange.await.unwrap().is_success());
    }
}
