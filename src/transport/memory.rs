use std::{io, sync::Arc};

use ahash::AHashMap;
use async_trait::async_trait;
use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};
use url::Url;

use crate::{
    channel::CommChannel,
    core::CommCore,
    error::CommError,
    port::{InputPort, OutputPort},
    protocol::Protocol,
    transport::{ListenerHandle, TransportFactory, TransportStream},
};

/// In-process byte pipe. It exposes no readiness notification, so
/// channels over it are served by the polling loop.
pub struct MemoryStream {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    rx_buf: BytesMut,
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

impl MemoryStream {
    /// A connected pair of pipe ends.
    pub fn pair() -> (MemoryStream, MemoryStream) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();

        (
            MemoryStream {
                rx: a_rx,
                rx_buf: BytesMut::new(),
                tx: Some(b_tx),
            },
            MemoryStream {
                rx: b_rx,
                rx_buf: BytesMut::new(),
                tx: Some(a_tx),
            },
        )
    }

    pub(crate) async fn read_buf(&mut self, buf: &mut BytesMut) -> io::Result<usize> {
        if self.rx_buf.is_empty() {
            match self.rx.recv().await {
                Some(chunk) => self.rx_buf.extend_from_slice(&chunk),
                None => return Ok(0),
            }
        }

        let chunk = self.rx_buf.split();
        buf.extend_from_slice(&chunk);
        Ok(chunk.len())
    }

    pub(crate) fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "memory stream shut down"))?;

        tx.send(data.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer end dropped"))
    }

    pub(crate) fn shutdown(&mut self) {
        self.tx = None;
    }

    /// Readiness probe for the polling loop.
    pub fn is_ready(&self) -> bool {
        !self.rx_buf.is_empty() || !self.rx.is_empty()
    }
}

/// `memory://<name>` transport.
///
/// Listeners register their name in the endpoint table; dialling a name
/// hands the listener one end of a fresh pipe. Shared between cores in
/// one process by registering the same `Arc` on both.
#[derive(Default)]
pub struct MemoryTransport {
    endpoints: Mutex<AHashMap<String, mpsc::UnboundedSender<MemoryStream>>>,
}

impl MemoryTransport {
    fn endpoint_of(location: &Url) -> Result<String, CommError> {
        location
            .host_str()
            .map(str::to_string)
            .ok_or_else(|| CommError::Config(format!("memory location {location} has no name")))
    }
}

#[async_trait]
impl TransportFactory for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn create_channel(
        &self,
        core: &Arc<CommCore>,
        location: &Url,
        port: &Arc<OutputPort>,
        protocol: Box<dyn Protocol>,
    ) -> Result<Arc<CommChannel>, CommError> {
        let name = Self::endpoint_of(location)?;
        let acceptor = self
            .endpoints
            .lock()
            .get(&name)
            .cloned()
            .ok_or_else(|| {
                CommError::Io(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    format!("no memory listener named {name:?}"),
                ))
            })?;

        let (client, server) = MemoryStream::pair();
        acceptor.send(server).map_err(|_| {
            CommError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("memory listener {name:?} stopped"),
            ))
        })?;

        Ok(CommChannel::client_side(
            core.next_channel_id(),
            location.clone(),
            TransportStream::Memory(client),
            protocol,
            port.clone(),
        ))
    }

    async fn create_listener(
        &self,
        core: &Arc<CommCore>,
        port: &Arc<InputPort>,
    ) -> Result<ListenerHandle, CommError> {
        let name = Self::endpoint_of(&port.location)?;
        let (tx, mut rx) = mpsc::unbounded_channel::<MemoryStream>();
        self.endpoints.lock().insert(name.clone(), tx);

        let stop = Arc::new(Notify::new());
        let stop_signal = stop.clone();
        let core = Arc::downgrade(core);
        let port = port.clone();
        let port_name = port.name.clone();

        let handle = tokio::spawn(async move {
            loop {
                let stream = tokio::select! {
                    _ = stop_signal.notified() => break,
                    stream = rx.recv() => match stream {
                        Some(stream) => stream,
                        None => break,
                    },
                };

                let Some(core) = core.upgrade() else { break };
                let protocol =
                    match core.build_input_protocol(&port) {
                        Ok(protocol) => protocol,
                        Err(e) => {
                            log::error!(
                                "memory accept failed: name={}, err={}",
                                port.name,
                                e,
                            );
                            continue;
                        }
                    };

                let channel = CommChannel::server_side(
                    core.next_channel_id(),
                    port.location.clone(),
                    TransportStream::Memory(stream),
                    protocol,
                    port.clone(),
                );

                core.statistics()
                    .report(&[crate::statistics::Stats::ConnectionsAccepted(1)]);

                if let Err(e) = core.register_for_input(channel) {
                    log::debug!("memory channel dropped at accept: err={}", e);
                }
            }

            log::info!("memory listener stopped: name={}", port.name);
        });

        Ok(ListenerHandle::new(port_name, None, stop, handle))
    }
}
