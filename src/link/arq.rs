//! Stop-and-wait ARQ over a [`TransportGuard`].
//!
//! One Data frame is in flight at a time. The sender waits for an Ack whose
//! `ack_sequence` matches, retransmits on timeout or Nak, and gives up after a
//! bounded number of retransmissions. A background pump task owns all reads
//! from the channel: it answers the peer's Data frames, settles the pending
//! exchange, and surfaces delivered payloads through the [`Conduit`] API.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, FrameError, LinkError, Result};
use crate::link::frame::{Frame, FrameDecoder, FrameKind, MAX_PAYLOAD, next_sequence};
use crate::log::{self, LogCategories};
use crate::transport::guard::Inbound;
use crate::transport::{Conduit, TransportGuard};

/// Default time to wait for an Ack before retransmitting.
pub const DEFAULT_RETRANSMIT_TIMEOUT: Duration = Duration::from_millis(800);

/// Default number of retransmissions before an exchange fails.
pub const DEFAULT_MAX_RETRANSMITS: u32 = 3;

/// Default poll interval while the peer reports not-ready.
pub const DEFAULT_NOT_READY_POLL: Duration = Duration::from_millis(50);

/// Default bound on waiting for a not-ready peer.
pub const DEFAULT_NOT_READY_TIMEOUT: Duration = Duration::from_secs(3);

/// Timing of the ARQ link.
#[derive(Debug, Clone)]
pub struct ArqConfig {
    /// Time to wait for an Ack before retransmitting.
    pub retransmit_timeout: Duration,
    /// Retransmissions allowed after the first transmission.
    pub max_retransmits: u32,
    /// Poll interval while the peer is not ready.
    pub not_ready_poll: Duration,
    /// Bound on waiting for the peer to become ready.
    pub not_ready_timeout: Duration,
}

impl Default for ArqConfig {
    fn default() -> Self {
        Self {
            retransmit_timeout: DEFAULT_RETRANSMIT_TIMEOUT,
            max_retransmits: DEFAULT_MAX_RETRANSMITS,
            not_ready_poll: DEFAULT_NOT_READY_POLL,
            not_ready_timeout: DEFAULT_NOT_READY_TIMEOUT,
        }
    }
}

impl ArqConfig {
    /// Sets the retransmission timeout.
    #[must_use]
    pub const fn retransmit_timeout(mut self, timeout: Duration) -> Self {
        self.retransmit_timeout = timeout;
        self
    }

    /// Sets the retransmission budget.
    #[must_use]
    pub const fn max_retransmits(mut self, retransmits: u32) -> Self {
        self.max_retransmits = retransmits;
        self
    }

    /// Sets the not-ready poll interval and bound.
    #[must_use]
    pub const fn not_ready(mut self, poll: Duration, timeout: Duration) -> Self {
        self.not_ready_poll = poll;
        self.not_ready_timeout = timeout;
        self
    }
}

/// Sender-side state of the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No exchange in flight.
    Idle,
    /// A Data frame waits for its Ack.
    AwaitingAck,
    /// The last exchange ran out of retransmissions. The next send proceeds.
    Failed,
    /// The peer sent an Error frame; only [`ArqLink::resync`] may send.
    Degraded,
}

/// How the pump settled a pending exchange.
#[derive(Debug)]
enum Completion {
    Acked,
    Nak,
    PeerError(u8),
}

/// One in-flight Data frame.
struct PendingExchange {
    sequence: u8,
    payload: Bytes,
    sent_at: Instant,
    retry_count: u32,
    signal: mpsc::UnboundedSender<Completion>,
}

struct LinkShared {
    state: LinkState,
    send_seq: u8,
    recv_expected: u8,
    last_delivered: Option<u8>,
    peer_not_ready: bool,
    pending: Option<PendingExchange>,
    decoder: FrameDecoder,
    closed: bool,
}

/// What the pump must do after handling one frame.
#[derive(Default)]
struct FrameEffects {
    reply: Option<Frame>,
    deliver: Option<Bytes>,
}

impl LinkShared {
    fn new() -> Self {
        Self {
            state: LinkState::Idle,
            send_seq: 0,
            recv_expected: 0,
            last_delivered: None,
            peer_not_ready: false,
            pending: None,
            decoder: FrameDecoder::new(),
            closed: false,
        }
    }

    fn ack_field(&self) -> u8 {
        self.last_delivered.unwrap_or(0)
    }

    fn on_frame(&mut self, frame: Frame, channel: &str) -> FrameEffects {
        if !frame.checksum_valid {
            tracing::debug!(target: log::LINK, channel, "checksum mismatch on {:?} frame", frame.kind);
            return self.on_corrupted(channel);
        }
        self.peer_not_ready = frame.not_ready;

        match frame.kind {
            FrameKind::Ack => {
                self.on_ack(frame.ack_sequence, channel);
                FrameEffects::default()
            }
            FrameKind::Nak => {
                if let Some(pending) = &self.pending {
                    let _ = pending.signal.send(Completion::Nak);
                }
                FrameEffects::default()
            }
            FrameKind::Error => {
                let code = frame.error_code().unwrap_or(0);
                tracing::warn!(target: log::LINK, channel, "peer error frame, code {:#04x}", code);
                self.state = LinkState::Degraded;
                if let Some(pending) = self.pending.take() {
                    let _ = pending.signal.send(Completion::PeerError(code));
                }
                FrameEffects::default()
            }
            FrameKind::Data => self.on_data(frame, channel),
        }
    }

    fn on_ack(&mut self, ack_sequence: u8, channel: &str) {
        match self.pending.take_if(|p| p.sequence == ack_sequence) {
            Some(pending) => {
                self.send_seq = next_sequence(pending.sequence);
                self.state = LinkState::Idle;
                tracing::trace!(
                    target: log::LINK,
                    channel,
                    "seq {} acked after {} retries in {}ms",
                    pending.sequence,
                    pending.retry_count,
                    pending.sent_at.elapsed().as_millis()
                );
                let _ = pending.signal.send(Completion::Acked);
            }
            None => {
                tracing::trace!(target: log::LINK, channel, "ignoring ack for seq {}", ack_sequence);
            }
        }
    }

    fn on_corrupted(&mut self, channel: &str) -> FrameEffects {
        if let Some(pending) = &self.pending {
            let _ = pending.signal.send(Completion::Nak);
            FrameEffects::default()
        } else {
            tracing::trace!(target: log::LINK, channel, "asking peer to resend");
            FrameEffects {
                reply: Some(Frame::nak(self.send_seq, self.ack_field())),
                deliver: None,
            }
        }
    }

    fn on_data(&mut self, frame: Frame, channel: &str) -> FrameEffects {
        let seq = frame.sequence;
        let reply = Some(Frame::ack(self.send_seq, seq));

        if frame.payload.is_empty() && seq == 0 {
            tracing::info!(target: log::LINK, channel, "peer reset sequence counters");
            self.recv_expected = next_sequence(0);
            self.last_delivered = Some(0);
            if self.pending.is_none() {
                self.send_seq = 0;
                if self.state == LinkState::Degraded {
                    self.state = LinkState::Idle;
                }
            }
            return FrameEffects {
                reply,
                deliver: None,
            };
        }

        if self.last_delivered == Some(seq) {
            tracing::trace!(target: log::LINK, channel, "duplicate data seq {}", seq);
            return FrameEffects {
                reply,
                deliver: None,
            };
        }

        if seq != self.recv_expected {
            tracing::warn!(
                target: log::LINK,
                channel,
                "sequence gap: expected {}, got {}",
                self.recv_expected,
                seq
            );
        }
        self.last_delivered = Some(seq);
        self.recv_expected = next_sequence(seq);
        FrameEffects {
            reply,
            deliver: Some(frame.payload),
        }
    }
}

/// Stop-and-wait ARQ link over one channel.
pub struct ArqLink {
    guard: Arc<TransportGuard>,
    config: ArqConfig,
    log: LogCategories,
    shared: Arc<Mutex<LinkShared>>,
    inbox: Arc<Inbound>,
    exchange: tokio::sync::Mutex<()>,
    cancel: Mutex<Option<CancellationToken>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ArqLink {
    /// Layers an ARQ link over `guard` and starts its pump task.
    ///
    /// From here on the link owns all reads from the channel.
    pub fn new(guard: Arc<TransportGuard>, config: ArqConfig) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| Error::NoRuntime)?;
        let log = guard.log_categories();
        let shared = Arc::new(Mutex::new(LinkShared::new()));
        let inbox = Arc::new(Inbound::new());

        let pump = runtime.spawn(run_pump(
            Arc::clone(&guard),
            Arc::clone(&shared),
            Arc::clone(&inbox),
            log,
        ));

        Ok(Self {
            guard,
            config,
            log,
            shared,
            inbox,
            exchange: tokio::sync::Mutex::new(()),
            cancel: Mutex::new(None),
            pump: Mutex::new(Some(pump)),
        })
    }

    /// Returns the sender-side state.
    #[must_use]
    pub fn state(&self) -> LinkState {
        self.lock().state
    }

    /// Returns the sequence number the next Data frame will carry.
    #[must_use]
    pub fn next_sequence(&self) -> u8 {
        self.lock().send_seq
    }

    /// Returns false while the peer reports not-ready.
    #[must_use]
    pub fn peer_ready(&self) -> bool {
        !self.lock().peer_not_ready
    }

    /// Reliably sends one payload of at most [`MAX_PAYLOAD`] bytes.
    ///
    /// Returns once the peer acknowledged the frame. An empty payload sends
    /// nothing.
    pub async fn send(&self, payload: impl Into<Bytes>) -> std::result::Result<(), LinkError> {
        let payload = payload.into();
        if payload.is_empty() {
            return Ok(());
        }
        if payload.len() > MAX_PAYLOAD {
            return Err(FrameError::TooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD,
            }
            .into());
        }

        let _exchange = self.exchange.lock().await;
        let (frame, mut completion) = {
            let mut shared = self.lock();
            if shared.closed {
                return Err(LinkError::Closed);
            }
            if shared.state == LinkState::Degraded {
                return Err(LinkError::Degraded);
            }
            let frame = Frame::data(shared.send_seq, shared.ack_field(), payload.clone());
            let completion = Self::arm(&mut shared, frame.sequence, payload);
            (frame, completion)
        };

        let sequence = frame.sequence;
        let token = self.arm_cancel();
        let result = self.drive(frame, &mut completion, &token).await;
        self.disarm_cancel();
        self.finish(sequence, result, &mut completion, false)
    }

    /// Resets both sequence counters with the peer and clears a degraded link.
    ///
    /// Sends the reset marker (an empty Data frame with sequence 0) and waits
    /// for its Ack like any other exchange.
    pub async fn resync(&self) -> std::result::Result<(), LinkError> {
        let _exchange = self.exchange.lock().await;
        let (frame, mut completion) = {
            let mut shared = self.lock();
            if shared.closed {
                return Err(LinkError::Closed);
            }
            shared.send_seq = 0;
            shared.recv_expected = 0;
            shared.last_delivered = None;
            let frame = Frame::data(0, 0, Bytes::new());
            let completion = Self::arm(&mut shared, 0, Bytes::new());
            (frame, completion)
        };

        tracing::info!(target: log::LINK, channel = self.guard.name(), "resynchronizing link");
        let token = self.arm_cancel();
        let result = self.drive(frame, &mut completion, &token).await;
        self.disarm_cancel();
        self.finish(0, result, &mut completion, true)
    }

    /// Cancels the exchange in flight, if any.
    ///
    /// The waiting sender returns [`LinkError::Cancelled`] and no further
    /// retransmission happens.
    pub fn cancel(&self) -> bool {
        match self.cancel.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Closes the link and the channel below it.
    pub async fn close(&self) {
        self.cancel();
        self.guard.close().await;
        if let Some(pump) = self.pump.lock().unwrap_or_else(PoisonError::into_inner).take() {
            pump.abort();
        }
        close_shared(&self.shared, &self.inbox);
    }

    fn lock(&self) -> MutexGuard<'_, LinkShared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn arm(
        shared: &mut LinkShared,
        sequence: u8,
        payload: Bytes,
    ) -> mpsc::UnboundedReceiver<Completion> {
        let (signal, completion) = mpsc::unbounded_channel();
        shared.pending = Some(PendingExchange {
            sequence,
            payload,
            sent_at: Instant::now(),
            retry_count: 0,
            signal,
        });
        shared.state = LinkState::AwaitingAck;
        completion
    }

    fn arm_cancel(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.cancel.lock().unwrap_or_else(PoisonError::into_inner) = Some(token.clone());
        token
    }

    fn disarm_cancel(&self) {
        self.cancel.lock().unwrap_or_else(PoisonError::into_inner).take();
    }

    async fn drive(
        &self,
        frame: Frame,
        completion: &mut mpsc::UnboundedReceiver<Completion>,
        token: &CancellationToken,
    ) -> std::result::Result<(), LinkError> {
        self.wait_until_ready(token).await?;
        self.transmit(&frame).await?;

        let retransmission = frame.retransmission();
        let mut retransmits = 0u32;
        loop {
            let event = tokio::select! {
                biased;
                () = token.cancelled() => return Err(LinkError::Cancelled),
                event = tokio::time::timeout(self.config.retransmit_timeout, completion.recv()) => event,
            };

            match event {
                Ok(Some(Completion::Acked)) => return Ok(()),
                Ok(Some(Completion::PeerError(code))) => return Err(LinkError::Peer { code }),
                Ok(None) => return Err(LinkError::Closed),
                Ok(Some(Completion::Nak)) | Err(_) => {
                    if retransmits >= self.config.max_retransmits {
                        return Err(LinkError::RetriesExhausted {
                            attempts: retransmits + 1,
                        });
                    }
                    retransmits += 1;
                    self.note_retry(retransmission.sequence, retransmits);
                    self.wait_until_ready(token).await?;
                    self.transmit(&retransmission).await?;
                }
            }
        }
    }

    /// Settles the exchange after `drive` returned.
    fn finish(
        &self,
        sequence: u8,
        result: std::result::Result<(), LinkError>,
        completion: &mut mpsc::UnboundedReceiver<Completion>,
        resync: bool,
    ) -> std::result::Result<(), LinkError> {
        let mut shared = self.lock();
        let Some(pending) = shared.pending.take_if(|p| p.sequence == sequence) else {
            // The pump settled it first; its verdict wins.
            return match completion.try_recv() {
                Ok(Completion::Acked) => Ok(()),
                Ok(Completion::PeerError(code)) => Err(LinkError::Peer { code }),
                _ => result,
            };
        };

        let channel = self.guard.name();
        if let Err(e) = &result {
            tracing::debug!(
                target: log::LINK,
                channel,
                "dropping seq {} ({} bytes) after {} retries: {}",
                pending.sequence,
                pending.payload.len(),
                pending.retry_count,
                e
            );
        }
        shared.send_seq = next_sequence(sequence);
        shared.state = if resync {
            LinkState::Degraded
        } else if matches!(result, Err(LinkError::RetriesExhausted { .. })) {
            LinkState::Failed
        } else {
            LinkState::Idle
        };
        result
    }

    fn note_retry(&self, sequence: u8, retry_count: u32) {
        let mut shared = self.lock();
        if let Some(pending) = shared.pending.as_mut().filter(|p| p.sequence == sequence) {
            pending.retry_count = retry_count;
            pending.sent_at = Instant::now();
        }
    }

    /// Polls a not-ready peer with Ack frames until it reports ready.
    ///
    /// Once the bound expires the flag is dropped, so the next exchange
    /// transmits instead of waiting on a peer that went quiet.
    async fn wait_until_ready(&self, token: &CancellationToken) -> std::result::Result<(), LinkError> {
        let deadline = Instant::now() + self.config.not_ready_timeout;
        loop {
            let poll = {
                let shared = self.lock();
                if !shared.peer_not_ready {
                    return Ok(());
                }
                Frame::ack(shared.send_seq, shared.ack_field())
            };
            if Instant::now() >= deadline {
                self.lock().peer_not_ready = false;
                tracing::debug!(target: log::LINK, channel = self.guard.name(), "peer stayed not ready");
                return Err(LinkError::PeerNotReady {
                    timeout_ms: u64::try_from(self.config.not_ready_timeout.as_millis())
                        .unwrap_or(u64::MAX),
                });
            }
            tokio::select! {
                biased;
                () = token.cancelled() => return Err(LinkError::Cancelled),
                () = tokio::time::sleep(self.config.not_ready_poll) => {}
            }
            if self.lock().peer_not_ready {
                self.transmit(&poll).await?;
            }
        }
    }

    async fn transmit(&self, frame: &Frame) -> std::result::Result<(), LinkError> {
        let wire = frame.encode()?;
        if self.log.link_frames {
            tracing::trace!(
                target: log::LINK,
                channel = self.guard.name(),
                "tx {:?} seq={} ack={} rt={} len={}",
                frame.kind,
                frame.sequence,
                frame.ack_sequence,
                frame.retransmitted,
                frame.payload.len()
            );
        }
        self.guard.write(&wire).await.map_err(|e| match e {
            Error::NotOpen => LinkError::Closed,
            other => LinkError::Transport {
                message: other.to_string(),
            },
        })
    }
}

impl Drop for ArqLink {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.lock().unwrap_or_else(PoisonError::into_inner).take() {
            pump.abort();
        }
    }
}

impl Conduit for ArqLink {
    fn name(&self) -> &str {
        self.guard.name()
    }

    /// Splits `data` into frame-sized segments and sends each reliably.
    fn send(&self, data: Bytes) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let mut offset = 0;
            while offset < data.len() {
                let end = (offset + MAX_PAYLOAD).min(data.len());
                ArqLink::send(self, data.slice(offset..end)).await?;
                offset = end;
            }
            Ok(())
        })
    }

    fn receive(&self) -> Pin<Box<dyn Future<Output = Result<Bytes>> + Send + '_>> {
        Box::pin(async move {
            let bytes = self.inbox.take();
            if bytes.is_empty() && !self.inbox.is_open() {
                return Err(Error::NotOpen);
            }
            Ok(bytes)
        })
    }

    fn data_ready(&self) -> watch::Receiver<u64> {
        self.inbox.subscribe()
    }

    fn is_open(&self) -> bool {
        self.inbox.is_open()
    }

    fn log_categories(&self) -> LogCategories {
        self.log
    }

    fn cancel(&self) -> bool {
        ArqLink::cancel(self)
    }
}

fn close_shared(shared: &Mutex<LinkShared>, inbox: &Inbound) {
    {
        let mut shared = shared.lock().unwrap_or_else(PoisonError::into_inner);
        shared.closed = true;
        // Dropping the signal wakes the waiting sender with `Closed`.
        shared.pending.take();
    }
    inbox.close();
}

/// Reads the channel, answers the peer and settles pending exchanges.
async fn run_pump(
    guard: Arc<TransportGuard>,
    shared: Arc<Mutex<LinkShared>>,
    inbox: Arc<Inbound>,
    log: LogCategories,
) {
    let channel = guard.name().to_owned();
    let mut ready = guard.data_ready();

    'pump: loop {
        ready.borrow_and_update();
        let Ok(bytes) = guard.read_available().await else {
            break;
        };

        if !bytes.is_empty() {
            let mut replies = Vec::new();
            {
                let mut state = shared.lock().unwrap_or_else(PoisonError::into_inner);
                state.decoder.feed(&bytes);
                while let Some(frame) = state.decoder.decode() {
                    if log.link_frames {
                        tracing::trace!(
                            target: log::LINK,
                            channel = %channel,
                            "rx {:?} seq={} ack={} rt={} nr={} ok={} len={}",
                            frame.kind,
                            frame.sequence,
                            frame.ack_sequence,
                            frame.retransmitted,
                            frame.not_ready,
                            frame.checksum_valid,
                            frame.payload.len()
                        );
                    }
                    let effects = state.on_frame(frame, &channel);
                    if let Some(payload) = effects.deliver {
                        inbox.push(&payload);
                    }
                    replies.extend(effects.reply);
                }
            }

            for reply in replies {
                match reply.encode() {
                    Ok(wire) => {
                        if guard.write(&wire).await.is_err() {
                            break 'pump;
                        }
                    }
                    Err(e) => tracing::warn!(target: log::LINK, channel = %channel, "cannot encode reply: {}", e),
                }
            }
        }

        if ready.changed().await.is_err() {
            break;
        }
    }

    tracing::debug!(target: log::LINK, channel = %channel, "link pump stopped");
    close_shared(&shared, &inbox);
}
