use std::{
    net::SocketAddr,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use ahash::AHashMap;
use async_trait::async_trait;
use codec::{Message, MessageId};
use parking_lot::{Mutex, RwLock};

use crate::{
    channel::{ChannelId, CommChannel},
    config,
    correlation::MessagePool,
    error::CommError,
    executor::HandlerExecutor,
    polling::PollingLoop,
    pool::PersistentChannels,
    port::{InputPort, OutputPort},
    protocol::{Protocol, ProtocolFactory, tls::TlsProtocol, wire::WireProtocolFactory},
    selector::SelectorArray,
    session::SessionRegistry,
    statistics::{Statistics, Stats},
    transport::{
        ListenerHandle, TransportFactory, datagram::DatagramTransport, memory::MemoryTransport,
        socket::SocketTransport,
    },
};

/// How long shutdown waits for in-flight handlers before falling back
/// to aborting them.
pub const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Capability set the owning runtime injects at construction.
///
/// `deliver` is the correlation engine's doorstep: the dispatcher hands
/// it every type-checked direct request. Returning a message means
/// "reply with this right now"; returning `None` defers the response to
/// a later `CommChannel::send` by the runtime.
#[async_trait]
pub trait RuntimeContext: Send + Sync {
    async fn deliver(
        &self,
        message: Message,
        channel: Arc<CommChannel>,
    ) -> Result<Option<Message>, CommError>;

    /// Idle lifetime of pooled outbound channels.
    fn persistent_connection_timeout(&self) -> Duration {
        Duration::from_secs(10)
    }
}

#[derive(Debug, Clone)]
pub struct CommCoreOptions {
    pub selector_tasks: usize,
    pub connections_limit: Option<usize>,
    pub polling_interval: Duration,
}

impl Default for CommCoreOptions {
    fn default() -> Self {
        Self {
            selector_tasks: num_cpus::get(),
            connections_limit: None,
            polling_interval: Duration::from_millis(50),
        }
    }
}

impl From<&config::Runtime> for CommCoreOptions {
    fn from(runtime: &config::Runtime) -> Self {
        Self {
            selector_tasks: runtime.selector_tasks,
            connections_limit: runtime.connections_limit,
            polling_interval: runtime.polling_interval(),
        }
    }
}

/// The communication core: transport and protocol registries, reactors,
/// handler executor, channel pool, correlation layer and lifecycle.
pub struct CommCore {
    context: Arc<dyn RuntimeContext>,
    options: CommCoreOptions,
    statistics: Statistics,
    transports: RwLock<AHashMap<String, Arc<dyn TransportFactory>>>,
    protocols: RwLock<AHashMap<String, Arc<dyn ProtocolFactory>>>,
    executor: HandlerExecutor,
    selectors: OnceLock<SelectorArray>,
    polling: OnceLock<PollingLoop>,
    persistent: Arc<PersistentChannels>,
    messages: MessagePool,
    request_sessions: SessionRegistry,
    response_sessions: SessionRegistry,
    listeners: Mutex<Vec<ListenerHandle>>,
    active: AtomicBool,
    lifecycle: tokio::sync::Mutex<()>,
    next_message: AtomicU64,
    next_channel: AtomicU64,
}

impl CommCore {
    /// Build a core with the built-in transports (`socket`, `datagram`,
    /// `memory`) and the built-in `wire` protocol registered. Further
    /// factories are registered by name.
    pub fn new(context: Arc<dyn RuntimeContext>, options: CommCoreOptions) -> Arc<Self> {
        let core = Arc::new(Self {
            context,
            executor: HandlerExecutor::new(options.connections_limit),
            options,
            statistics: Statistics::default(),
            transports: RwLock::new(AHashMap::new()),
            protocols: RwLock::new(AHashMap::new()),
            selectors: OnceLock::new(),
            polling: OnceLock::new(),
            persistent: Arc::new(PersistentChannels::default()),
            messages: MessagePool::default(),
            request_sessions: SessionRegistry::default(),
            response_sessions: SessionRegistry::default(),
            listeners: Mutex::new(Vec::new()),
            active: AtomicBool::new(false),
            lifecycle: tokio::sync::Mutex::new(()),
            next_message: AtomicU64::new(0),
            next_channel: AtomicU64::new(0),
        });

        core.register_transport(Arc::new(SocketTransport));
        core.register_transport(Arc::new(DatagramTransport));
        core.register_transport(Arc::new(MemoryTransport::default()));
        core.register_protocol(Arc::new(WireProtocolFactory));
        core
    }

    pub fn context(&self) -> &Arc<dyn RuntimeContext> {
        &self.context
    }

    pub fn options(&self) -> &CommCoreOptions {
        &self.options
    }

    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    pub fn executor(&self) -> &HandlerExecutor {
        &self.executor
    }

    pub fn messages(&self) -> &MessagePool {
        &self.messages
    }

    pub fn request_sessions(&self) -> &SessionRegistry {
        &self.request_sessions
    }

    pub fn response_sessions(&self) -> &SessionRegistry {
        &self.response_sessions
    }

    pub fn persistent(&self) -> &Arc<PersistentChannels> {
        &self.persistent
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn next_message_id(&self) -> MessageId {
        MessageId(self.next_message.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn next_channel_id(&self) -> ChannelId {
        ChannelId(self.next_channel.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn register_transport(&self, factory: Arc<dyn TransportFactory>) {
        self.transports
            .write()
            .insert(factory.name().to_string(), factory);
    }

    pub fn register_protocol(&self, factory: Arc<dyn ProtocolFactory>) {
        self.protocols
            .write()
            .insert(factory.name().to_string(), factory);
    }

    fn transport_factory(&self, scheme: &str) -> Result<Arc<dyn TransportFactory>, CommError> {
        self.transports
            .read()
            .get(scheme)
            .cloned()
            .ok_or_else(|| CommError::UnsupportedMedium(scheme.to_string()))
    }

    fn protocol_factory(&self, name: &str) -> Result<Arc<dyn ProtocolFactory>, CommError> {
        self.protocols
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| CommError::UnsupportedProtocol(name.to_string()))
    }

    /// Protocol stack for an accepted channel; TLS wraps the inner
    /// protocol when the port is configured for it.
    pub fn build_input_protocol(&self, port: &InputPort) -> Result<Box<dyn Protocol>, CommError> {
        let factory = self.protocol_factory(&port.protocol)?;
        let inner = factory.create_input(port.ssl.as_ref(), &port.location)?;

        match &port.ssl {
            Some(ssl) => Ok(Box::new(TlsProtocol::server(ssl, inner)?)),
            None => Ok(inner),
        }
    }

    /// Protocol stack for a dialled channel.
    pub fn build_output_protocol(&self, port: &OutputPort) -> Result<Box<dyn Protocol>, CommError> {
        let factory = self.protocol_factory(&port.protocol)?;
        let inner = factory.create_output(port.ssl.as_ref(), &port.location)?;

        match &port.ssl {
            Some(ssl) => Ok(Box::new(TlsProtocol::client(ssl, &port.location, inner)?)),
            None => Ok(inner),
        }
    }

    /// Hand a channel to its readiness source: reactor for selectable
    /// transports, polling loop otherwise. A channel whose protocol
    /// already holds decodable input bypasses both and goes straight to
    /// a handler.
    pub fn register_for_input(self: &Arc<Self>, channel: Arc<CommChannel>) -> Result<(), CommError> {
        if !self.is_active() {
            return Err(CommError::ChannelClosing);
        }

        if channel.is_registered() {
            return Ok(());
        }

        if let Some(io) = channel.try_lock() {
            if io.has_buffered_input() {
                self.executor.schedule_receive(self.clone(), channel, Some(io));
                return Ok(());
            }
        }

        // a reactor watch owns the channel guard while it waits, which
        // would block concurrent senders; multiplexed channels are
        // probed by the polling loop instead
        if channel.is_selectable() && !channel.is_concurrent() {
            self.selectors
                .get()
                .ok_or(CommError::ChannelClosing)?
                .register(channel)
        } else {
            self.polling
                .get()
                .ok_or(CommError::ChannelClosing)?
                .register(channel);
            Ok(())
        }
    }

    /// Outbound channel for an output port: cached if the pool holds a
    /// usable one, freshly dialled otherwise.
    pub async fn acquire_output_channel(
        self: &Arc<Self>,
        port: &Arc<OutputPort>,
    ) -> Result<Arc<CommChannel>, CommError> {
        if let Some(channel) = self.persistent.get(port.location.as_str(), &port.protocol) {
            log::debug!(
                "persistent channel reused: location={}, id={}",
                port.location,
                channel.id(),
            );
            self.statistics.report(&[Stats::ConnectionsReused(1)]);
            return Ok(channel);
        }

        let factory = self.transport_factory(port.location.scheme())?;
        let protocol = self.build_output_protocol(port)?;
        let channel = factory
            .create_channel(self, &port.location, port, protocol)
            .await?;

        self.statistics.report(&[Stats::ConnectionsOpened(1)]);
        Ok(channel)
    }

    /// Return an outbound channel: persistent ports re-pool it, the
    /// rest close it.
    pub async fn release_output_channel(&self, channel: Arc<CommChannel>) {
        let persistent = channel
            .output_port()
            .map(|port| port.persistent)
            .unwrap_or(false);

        if persistent && channel.is_open() && !channel.to_be_closed() {
            self.persistent.put(
                channel.location().as_str(),
                channel.protocol_name(),
                channel.clone(),
                self.context.persistent_connection_timeout(),
            );
        } else {
            channel.close().await;
        }
    }

    /// One request-response exchange on a channel.
    ///
    /// Concurrent channels multiplex by id and receive through the
    /// reactors; non-concurrent channels keep the guard across send and
    /// receive, which is what preserves the pairing.
    pub async fn call(
        self: &Arc<Self>,
        channel: &Arc<CommChannel>,
        request: Message,
    ) -> Result<Message, CommError> {
        if channel.is_concurrent() {
            self.messages
                .register_asynchronous(request.id, &request.operation);
            if let Err(e) = channel.send(&request).await {
                self.messages.cancel_asynchronous(request.id);
                return Err(e);
            }
            self.statistics.report(&[Stats::MessagesSent(1)]);

            self.register_for_input(channel.clone())?;
            self.messages.recv_response_for(&request).await
        } else {
            let mut io = channel.lock().await;
            self.messages.register_synchronous(channel, &request);
            if let Err(e) = io.send(&request).await {
                self.messages.cancel_synchronous(channel);
                return Err(e);
            }
            self.statistics.report(&[Stats::MessagesSent(1)]);

            let response = self
                .messages
                .recv_response_sync(channel, &mut io, &request)
                .await?;
            self.statistics.report(&[Stats::MessagesReceived(1)]);
            Ok(response)
        }
    }

    /// Start reactors, the polling loop and one listener per input
    /// port. Returns before listeners are necessarily accepting;
    /// readiness is observable only by connecting.
    pub async fn init(self: &Arc<Self>, inputs: &[Arc<InputPort>]) -> Result<(), CommError> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.active.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let _ = self.selectors.set(SelectorArray::start(
            self.options.selector_tasks,
            Arc::downgrade(self),
        ));
        let _ = self.polling.set(PollingLoop::start(
            self.options.polling_interval,
            Arc::downgrade(self),
        ));

        for port in inputs {
            let scheme = if self.protocol_factory(&port.protocol)?.is_publish_subscribe() {
                "pubsubchannel".to_string()
            } else {
                port.location.scheme().to_string()
            };

            let factory = self.transport_factory(&scheme)?;
            let listener = factory.create_listener(self, port).await?;
            log::info!(
                "listener started: name={}, location={}",
                port.name,
                port.location,
            );
            self.listeners.lock().push(listener);
        }

        Ok(())
    }

    /// Bound address of a named listener (useful with port 0 binds).
    pub fn listener_addr(&self, name: &str) -> Option<SocketAddr> {
        self.listeners
            .lock()
            .iter()
            .find(|listener| listener.name == name)
            .and_then(|listener| listener.local_addr)
    }

    /// Stop listeners, reactors, handlers, the polling loop and the
    /// pool. In-flight handlers get `SHUTDOWN_DRAIN_TIMEOUT` to finish,
    /// then the executor gets the persistent-connection timeout before
    /// stragglers are aborted.
    pub async fn shutdown(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }

        log::info!("communication core shutting down");

        let listeners: Vec<ListenerHandle> = self.listeners.lock().drain(..).collect();
        for listener in listeners {
            listener.shutdown().await;
        }

        if let Some(selectors) = self.selectors.get() {
            selectors.shutdown().await;
        }

        let latch = self.executor.latch().clone();
        match tokio::time::timeout(SHUTDOWN_DRAIN_TIMEOUT, latch.write()).await {
            Ok(guard) => drop(guard),
            Err(_) => log::warn!("handler drain window elapsed with handlers still running"),
        }

        self.executor
            .shutdown(self.context.persistent_connection_timeout())
            .await;

        if let Some(polling) = self.polling.get() {
            polling.shutdown().await;
        }

        self.persistent.close_all().await;
        log::info!("communication core stopped");
    }

    /// Return a channel to its readiness source once the current
    /// exchange is finished, or close it when marked. Runtimes that
    /// defer a response call this after the deferred send.
    pub async fn dispose_for_input(self: &Arc<Self>, channel: &Arc<CommChannel>) {
        let io = channel.lock().await;
        crate::dispatcher::dispose_for_input(self, channel, io).await;
    }

    /// Detach a channel from its readiness source without closing it.
    pub fn unregister_channel(&self, channel: &CommChannel) {
        if channel.is_selectable() && !channel.is_concurrent() {
            if let Some(selectors) = self.selectors.get() {
                selectors.unregister(channel);
            }
        } else if let Some(polling) = self.polling.get() {
            polling.unregister(channel);
        }
    }
}
