use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
};

use codec::{Message, MessageId};
use parking_lot::Mutex;
use tokio::{
    sync::{Notify, OwnedMutexGuard, Mutex as AsyncMutex},
    task::AbortHandle,
};
use url::Url;

use crate::{
    error::CommError,
    port::{InputPort, OutputPort},
    protocol::Protocol,
    transport::TransportStream,
};

/// Identity of a channel, unique per core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    Closing,
    Closed,
}

/// The lockable half of a channel: transport stream plus protocol
/// instance. Owning the guard is the capability to encode or decode on
/// the channel; nothing reads or writes without it.
pub struct ChannelIo {
    pub stream: TransportStream,
    pub protocol: Box<dyn Protocol>,
}

impl ChannelIo {
    pub async fn send(&mut self, message: &Message) -> Result<(), CommError> {
        let Self { stream, protocol } = self;
        protocol.send(stream, message).await?;
        stream.flush().await?;
        Ok(())
    }

    pub async fn recv(&mut self) -> Result<Option<Message>, CommError> {
        let Self { stream, protocol } = self;
        protocol.recv(stream).await
    }

    pub fn has_buffered_input(&self) -> bool {
        self.protocol.has_buffered_input()
    }
}

pub type ChannelGuard = OwnedMutexGuard<ChannelIo>;

/// Server-side bridge state of a forwarder channel: the next message
/// decoded on it is the response to a redirected request, rewritten to
/// `message_id` (the original inbound id) and written to `partner`.
pub struct Redirection {
    pub partner: Arc<CommChannel>,
    pub message_id: MessageId,
}

struct IdleTimeout {
    handle: AbortHandle,
}

/// One communication endpoint.
///
/// The io mutex serialises every encode and decode; state, redirection
/// and timeout bookkeeping sit outside it so that close and eviction
/// never have to wait for an in-flight operation.
pub struct CommChannel {
    id: ChannelId,
    location: Url,
    protocol_name: String,
    concurrent: bool,
    selectable: bool,
    io: Arc<AsyncMutex<ChannelIo>>,
    state: Mutex<ChannelState>,
    to_be_closed: AtomicBool,
    redirection: Mutex<Option<Redirection>>,
    idle_timeout: Mutex<Option<IdleTimeout>>,
    timeout_generation: AtomicU64,
    input_port: Option<Arc<InputPort>>,
    output_port: Option<Arc<OutputPort>>,
    selector_index: AtomicUsize,
    registered: AtomicBool,
    unregister: Notify,
}

impl CommChannel {
    fn new(
        id: ChannelId,
        location: Url,
        protocol_name: String,
        stream: TransportStream,
        protocol: Box<dyn Protocol>,
        input_port: Option<Arc<InputPort>>,
        output_port: Option<Arc<OutputPort>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            location,
            protocol_name,
            concurrent: protocol.is_concurrent(),
            selectable: stream.supports_readiness(),
            io: Arc::new(AsyncMutex::new(ChannelIo { stream, protocol })),
            state: Mutex::new(ChannelState::Open),
            to_be_closed: AtomicBool::new(false),
            redirection: Mutex::new(None),
            idle_timeout: Mutex::new(None),
            timeout_generation: AtomicU64::new(0),
            input_port,
            output_port,
            selector_index: AtomicUsize::new(usize::MAX),
            registered: AtomicBool::new(false),
            unregister: Notify::new(),
        })
    }

    /// Channel accepted by a listener.
    pub fn server_side(
        id: ChannelId,
        location: Url,
        stream: TransportStream,
        protocol: Box<dyn Protocol>,
        input_port: Arc<InputPort>,
    ) -> Arc<Self> {
        let protocol_name = input_port.protocol.clone();
        Self::new(
            id,
            location,
            protocol_name,
            stream,
            protocol,
            Some(input_port),
            None,
        )
    }

    /// Channel dialled on behalf of an output port.
    pub fn client_side(
        id: ChannelId,
        location: Url,
        stream: TransportStream,
        protocol: Box<dyn Protocol>,
        output_port: Arc<OutputPort>,
    ) -> Arc<Self> {
        let protocol_name = output_port.protocol.clone();
        Self::new(
            id,
            location,
            protocol_name,
            stream,
            protocol,
            None,
            Some(output_port),
        )
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn location(&self) -> &Url {
        &self.location
    }

    pub fn protocol_name(&self) -> &str {
        &self.protocol_name
    }

    pub fn is_concurrent(&self) -> bool {
        self.concurrent
    }

    /// Whether the transport can report readiness (reactor) or must be
    /// probed (polling loop).
    pub fn is_selectable(&self) -> bool {
        self.selectable
    }

    pub fn input_port(&self) -> Option<&Arc<InputPort>> {
        self.input_port.as_ref()
    }

    pub fn output_port(&self) -> Option<&Arc<OutputPort>> {
        self.output_port.as_ref()
    }

    pub fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    pub fn mark_to_be_closed(&self) {
        self.to_be_closed.store(true, Ordering::SeqCst);
    }

    pub fn to_be_closed(&self) -> bool {
        self.to_be_closed.load(Ordering::SeqCst)
    }

    pub async fn lock(&self) -> ChannelGuard {
        self.io.clone().lock_owned().await
    }

    pub fn try_lock(&self) -> Option<ChannelGuard> {
        self.io.clone().try_lock_owned().ok()
    }

    /// Send one message, acquiring the channel for the duration.
    pub async fn send(&self, message: &Message) -> Result<(), CommError> {
        if !self.is_open() {
            return Err(CommError::ChannelClosing);
        }

        let mut io = self.lock().await;
        io.send(message).await
    }

    /// Close the channel. If an operation is in flight the stream
    /// teardown is deferred to whoever holds the guard (the
    /// `to_be_closed` flag), but the state flips immediately.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == ChannelState::Closed {
                return;
            }
            *state = ChannelState::Closing;
        }

        self.mark_to_be_closed();
        self.clear_idle_timeout();
        self.unregister.notify_waiters();

        if let Some(mut io) = self.try_lock() {
            let _ = io.stream.shutdown().await;
        }

        *self.state.lock() = ChannelState::Closed;
    }

    /// Close while already holding the guard.
    pub async fn close_with(&self, io: &mut ChannelIo) {
        self.mark_to_be_closed();
        self.clear_idle_timeout();
        self.unregister.notify_waiters();
        let _ = io.stream.shutdown().await;
        *self.state.lock() = ChannelState::Closed;
    }

    pub(crate) fn set_redirection(&self, partner: Arc<CommChannel>, message_id: MessageId) {
        *self.redirection.lock() = Some(Redirection {
            partner,
            message_id,
        });
    }

    pub(crate) fn take_redirection(&self) -> Option<Redirection> {
        self.redirection.lock().take()
    }

    pub fn has_redirection(&self) -> bool {
        self.redirection.lock().is_some()
    }

    /// Install an idle-eviction handle. Returns the generation the
    /// caller must present when the timeout fires; a cleared or
    /// replaced handler can then never evict.
    pub(crate) fn arm_idle_timeout(&self) -> u64 {
        self.timeout_generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn set_idle_timeout(&self, handle: AbortHandle) {
        let mut slot = self.idle_timeout.lock();
        if let Some(previous) = slot.take() {
            previous.handle.abort();
        }
        *slot = Some(IdleTimeout { handle });
    }

    pub fn clear_idle_timeout(&self) {
        self.timeout_generation.fetch_add(1, Ordering::SeqCst);
        if let Some(timeout) = self.idle_timeout.lock().take() {
            timeout.handle.abort();
        }
    }

    pub(crate) fn timeout_generation_is_current(&self, generation: u64) -> bool {
        self.timeout_generation.load(Ordering::SeqCst) == generation
    }

    pub(crate) fn selector_index(&self) -> Option<usize> {
        match self.selector_index.load(Ordering::SeqCst) {
            usize::MAX => None,
            index => Some(index),
        }
    }

    pub(crate) fn set_selector_index(&self, index: usize) {
        self.selector_index.store(index, Ordering::SeqCst);
    }

    pub(crate) fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    pub(crate) fn set_registered(&self, value: bool) {
        self.registered.store(value, Ordering::SeqCst);
    }

    /// Resolves when the channel is asked to leave its reactor (close
    /// or explicit unregistration).
    pub(crate) async fn unregistered(&self) {
        self.unregister.notified().await;
    }

    pub(crate) fn notify_unregister(&self) {
        self.unregister.notify_waiters();
    }
}

impl fmt::Debug for CommChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommChannel")
            .field("id", &self.id)
            .field("location", &self.location.as_str())
            .field("protocol", &self.protocol_name)
            .field("state", &self.state())
            .finish()
    }
}
