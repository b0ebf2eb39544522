//! The [`MeterLink`] controller.
//!
//! A controller owns any number of open channels, each addressed by a
//! [`ChannelId`]. Every channel gets its own command engine, an optional ARQ
//! link, and a [`BatchQueue`] for unsolicited traffic. Nothing here is
//! process-wide: create one controller per service and pass it around.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::command::{CodeReply, CommandEngine, EngineConfig, MarkupReply, Outcome};
use crate::error::{Error, Result};
use crate::event::{BatchQueue, QueueConfig, Queued, SubscriptionId};
use crate::link::{ArqConfig, ArqLink, LinkState};
use crate::log;
use crate::message::Fragment;
use crate::transport::{ChannelConfig, Conduit, TransportGuard};

/// Handle to a channel opened by a [`MeterLink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u32);

impl ChannelId {
    /// Returns the raw handle value.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "channel {}", self.0)
    }
}

/// How commands travel over the channel.
#[derive(Debug, Clone, Default)]
pub enum LinkMode {
    /// Bytes go straight to the serial line.
    #[default]
    Raw,
    /// Bytes ride in acknowledged ARQ frames (packet radios).
    Arq(ArqConfig),
}

/// How the device answers commands.
#[derive(Debug, Clone, Default)]
pub enum ReplyFormat {
    /// A single reply-code byte.
    #[default]
    Code,
    /// A markup fragment with a known root name.
    Markup {
        /// Local name of the fragment that completes an exchange.
        terminator: String,
        /// Local name of the fragment that rejects a command.
        reject: Option<String>,
    },
}

impl ReplyFormat {
    /// Markup replies completed by `terminator`.
    #[must_use]
    pub fn markup(terminator: impl Into<String>) -> Self {
        Self::Markup {
            terminator: terminator.into(),
            reject: None,
        }
    }

    /// Markup replies completed by `terminator` and rejected by `reject`.
    #[must_use]
    pub fn markup_with_reject(terminator: impl Into<String>, reject: impl Into<String>) -> Self {
        Self::Markup {
            terminator: terminator.into(),
            reject: Some(reject.into()),
        }
    }
}

/// Per-channel protocol settings.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Link layer between the engine and the line.
    pub link: LinkMode,
    /// Reply decoding.
    pub reply: ReplyFormat,
    /// Command timeout and retry defaults.
    pub engine: EngineConfig,
    /// Notification batching cadence.
    pub queue: QueueConfig,
}

impl SessionOptions {
    /// Sets the link mode.
    #[must_use]
    pub fn link(mut self, link: LinkMode) -> Self {
        self.link = link;
        self
    }

    /// Sets the reply format.
    #[must_use]
    pub fn reply(mut self, reply: ReplyFormat) -> Self {
        self.reply = reply;
        self
    }

    /// Sets the engine defaults.
    #[must_use]
    pub fn engine(mut self, engine: EngineConfig) -> Self {
        self.engine = engine;
        self
    }

    /// Sets the notification cadence.
    #[must_use]
    pub fn queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }
}

/// Traffic the device sent on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    /// A markup fragment that answered no command.
    Fragment(Fragment),
    /// Bytes that arrived outside any exchange in reply-code mode.
    Bytes(Bytes),
}

/// One open channel and everything layered on it.
struct Session {
    name: String,
    guard: Arc<TransportGuard>,
    link: Option<Arc<ArqLink>>,
    engine: Arc<CommandEngine>,
    events: BatchQueue<Notification>,
    wake_up: Vec<u8>,
    settle_delay: Duration,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    fn start(
        guard: TransportGuard,
        config: &ChannelConfig,
        options: SessionOptions,
    ) -> Result<Self> {
        let guard = Arc::new(guard);
        let log = guard.log_categories();
        let name = guard.name().to_owned();

        let (link, conduit): (Option<Arc<ArqLink>>, Arc<dyn Conduit>) = match options.link {
            LinkMode::Raw => (None, Arc::clone(&guard) as Arc<dyn Conduit>),
            LinkMode::Arq(arq) => {
                let link = Arc::new(ArqLink::new(Arc::clone(&guard), arq)?);
                (Some(Arc::clone(&link)), link as Arc<dyn Conduit>)
            }
        };

        let events = BatchQueue::with_tracing(name.clone(), options.queue, log.application);
        let engine = match options.reply {
            ReplyFormat::Code => {
                let sink = events.clone();
                let decoder = CodeReply::new()
                    .with_sink(move |bytes| sink.data_arrived(Notification::Bytes(bytes)));
                CommandEngine::new(Arc::clone(&conduit), decoder, options.engine)
            }
            ReplyFormat::Markup { terminator, reject } => {
                let sink = events.clone();
                let mut decoder = MarkupReply::new(terminator)
                    .with_tracing(log.message_frames)
                    .with_sink(move |fragment| sink.data_arrived(Notification::Fragment(fragment)));
                if let Some(reject) = reject {
                    decoder = decoder.reject_on(reject);
                }
                CommandEngine::new(Arc::clone(&conduit), decoder, options.engine)
            }
        };
        let engine = Arc::new(engine);

        let pump = tokio::spawn(run_notifications(
            Arc::clone(&engine),
            conduit.data_ready(),
            name.clone(),
        ));

        Ok(Self {
            name,
            guard,
            link,
            engine,
            events,
            wake_up: config.wake_up.clone(),
            settle_delay: config.settle_delay,
            pump: Mutex::new(Some(pump)),
        })
    }

    async fn close(&self) {
        self.engine.cancel();
        self.stop_pump();
        self.events.shutdown();
        match &self.link {
            Some(link) => link.close().await,
            None => self.guard.close().await,
        }
    }

    fn stop_pump(&self) {
        if let Some(pump) = self.pump.lock().unwrap_or_else(PoisonError::into_inner).take() {
            pump.abort();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop_pump();
    }
}

/// Moves unsolicited traffic into the session's queue between exchanges.
async fn run_notifications(
    engine: Arc<CommandEngine>,
    mut ready: tokio::sync::watch::Receiver<u64>,
    channel: String,
) {
    loop {
        if ready.changed().await.is_err() {
            break;
        }
        if engine.drain_unsolicited().await.is_err() {
            break;
        }
    }
    tracing::debug!(target: log::APP, channel = %channel, "notification pump stopped");
}

/// Owns open channels and routes commands and subscriptions to them.
pub struct MeterLink {
    sessions: RwLock<HashMap<ChannelId, Arc<Session>>>,
    next_id: AtomicU32,
}

impl Default for MeterLink {
    fn default() -> Self {
        Self::new()
    }
}

impl MeterLink {
    /// Creates a controller with no open channels.
    #[must_use]
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    /// Opens the serial port named in `config`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyOpen`] if this controller already has the port
    /// open, or the serial error if the port cannot be opened.
    pub async fn open_channel(
        &self,
        config: ChannelConfig,
        options: SessionOptions,
    ) -> Result<ChannelId> {
        self.ensure_closed(&config.port).await?;
        let guard = TransportGuard::open(&config).await?;
        self.install(guard, &config, options).await
    }

    /// Adopts an already connected stream as a channel named `name`.
    pub async fn attach_channel<S>(
        &self,
        name: impl Into<String>,
        stream: S,
        config: ChannelConfig,
        options: SessionOptions,
    ) -> Result<ChannelId>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let name = name.into();
        self.ensure_closed(&name).await?;
        let guard = TransportGuard::attach(name, stream, &config).await;
        self.install(guard, &config, options).await
    }

    /// Closes a channel and everything layered on it.
    ///
    /// A command waiting on the channel returns [`Outcome::Cancelled`].
    pub async fn close_channel(&self, id: ChannelId) -> Result<()> {
        let session = self
            .sessions
            .write()
            .await
            .remove(&id)
            .ok_or(Error::UnknownChannel(id.0))?;
        tracing::info!(target: log::APP, channel = %session.name, "closing {}", id);
        session.close().await;
        Ok(())
    }

    /// Closes every channel.
    pub async fn close_all(&self) {
        let sessions: Vec<_> = self.sessions.write().await.drain().collect();
        for (_, session) in sessions {
            session.close().await;
        }
    }

    /// Sends a command and waits for its reply.
    ///
    /// Device and link failures come back as [`Outcome`] values; the only
    /// error is an unknown handle.
    pub async fn send_and_wait(
        &self,
        id: ChannelId,
        command: impl Into<Bytes>,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<Outcome> {
        let session = self.session(id).await?;
        Ok(session
            .engine
            .send_and_wait(command, timeout, max_retries)
            .await)
    }

    /// Sends a command with the channel's configured timeout and retries.
    pub async fn send(&self, id: ChannelId, command: impl Into<Bytes>) -> Result<Outcome> {
        let session = self.session(id).await?;
        Ok(session.engine.execute(command).await)
    }

    /// Cancels the command waiting on a channel.
    ///
    /// Returns false if no command was waiting.
    pub async fn cancel(&self, id: ChannelId) -> Result<bool> {
        Ok(self.session(id).await?.engine.cancel())
    }

    /// Registers a handler for batches of unsolicited traffic.
    pub async fn subscribe<F>(&self, id: ChannelId, handler: F) -> Result<SubscriptionId>
    where
        F: Fn(&[Queued<Notification>]) + Send + Sync + 'static,
    {
        self.session(id).await?.events.subscribe(handler)
    }

    /// Removes a handler. Returns false if it was not registered.
    pub async fn unsubscribe(&self, id: ChannelId, subscription: SubscriptionId) -> Result<bool> {
        Ok(self.session(id).await?.events.unsubscribe(subscription))
    }

    /// Clears whatever the device was in the middle of.
    ///
    /// Writes the channel's wake-up marker, waits the settle delay and
    /// discards everything that arrived meanwhile. On an ARQ channel the
    /// sequence counters are then resynchronized with the peer.
    pub async fn initialize_session(&self, id: ChannelId) -> Result<()> {
        let session = self.session(id).await?;

        {
            let mut lock = session.guard.lock().await?;
            lock.write(&session.wake_up).await?;
            tokio::time::sleep(session.settle_delay).await;
            let discarded = lock.read_available();
            tracing::debug!(
                target: log::APP,
                channel = %session.name,
                "wake-up sent, discarded {} bytes",
                discarded.len()
            );
        }

        if let Some(link) = &session.link {
            link.resync().await?;
            let stale = session.engine.conduit().receive().await?;
            tracing::debug!(
                target: log::APP,
                channel = %session.name,
                "link resynchronized, discarded {} bytes",
                stale.len()
            );
        }
        Ok(())
    }

    /// Returns the handles of all open channels.
    pub async fn channels(&self) -> Vec<ChannelId> {
        let mut ids: Vec<_> = self.sessions.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Returns true while the channel's line is up.
    pub async fn is_open(&self, id: ChannelId) -> bool {
        match self.session(id).await {
            Ok(session) => session.engine.conduit().is_open(),
            Err(_) => false,
        }
    }

    /// Returns the ARQ state of a channel, or `None` in raw mode.
    pub async fn link_state(&self, id: ChannelId) -> Result<Option<LinkState>> {
        Ok(self.session(id).await?.link.as_ref().map(|link| link.state()))
    }

    async fn session(&self, id: ChannelId) -> Result<Arc<Session>> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(Error::UnknownChannel(id.0))
    }

    async fn ensure_closed(&self, name: &str) -> Result<()> {
        if self.sessions.read().await.values().any(|s| s.name == name) {
            return Err(Error::AlreadyOpen {
                name: name.to_owned(),
            });
        }
        Ok(())
    }

    async fn install(
        &self,
        guard: TransportGuard,
        config: &ChannelConfig,
        options: SessionOptions,
    ) -> Result<ChannelId> {
        let session = Arc::new(Session::start(guard, config, options)?);

        let mut sessions = self.sessions.write().await;
        // Another open of the same name may have finished while this one settled.
        if sessions.values().any(|s| s.name == session.name) {
            drop(sessions);
            session.close().await;
            return Err(Error::AlreadyOpen {
                name: session.name.clone(),
            });
        }

        let id = ChannelId(self.next_id.fetch_add(1, Ordering::SeqCst));
        tracing::info!(target: log::APP, channel = %session.name, "opened as {}", id);
        sessions.insert(id, session);
        Ok(id)
    }
}
